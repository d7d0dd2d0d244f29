//! Supervise one worker per device, and apply enable/disable commands
//! received from the broker.

use crate::{
    announce::{announcement, parse_switch, switch_state, Topics},
    device::DeviceDescriptor,
    gateway::{Broker, PublishRequest},
    modifiers::ModifierTracker,
    source::{EventSource, Interrupt},
    worker::{Worker, WorkerExit},
};
use log::{debug, info, warn};
use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        mpsc::{channel, Receiver, Sender},
        Arc,
    },
    thread::{self, JoinHandle},
};

/// Messages delivered to the registry
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Control {
    /// Message received on a subscribed topic
    Command { topic: String, payload: String },
    /// The broker connection was (re)established
    Connected,
    /// A worker stopped reading its device
    Retired { id: usize, reason: String },
    Shutdown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// Devices listed in the configuration, sharing the base topic
    Manual,
    /// Every discovered device has its own topics and enable switch
    Discovery,
}

#[derive(Debug, Clone)]
pub struct Options {
    pub mode: Mode,
    pub base_topic: String,
    pub gateway_name: String,
    pub ignored_keys: Vec<String>,
}

struct Managed {
    descriptor: DeviceDescriptor,
    topics: Topics,
    enabled: Arc<AtomicBool>,
    interrupter: Arc<dyn Interrupt>,
    handle: Option<JoinHandle<()>>,
}

pub struct Registry<B: Broker + 'static> {
    broker: Arc<B>,
    options: Options,
    devices: Vec<Managed>,
    control_tx: Sender<Control>,
    control_rx: Receiver<Control>,
}

impl<B: Broker + 'static> Registry<B> {
    pub fn new(broker: Arc<B>, options: Options) -> Self {
        let (control_tx, control_rx) = channel();

        Registry::with_channel(broker, options, control_tx, control_rx)
    }

    /// Use an existing channel, so that the broker connection can be set up
    /// before the registry
    pub fn with_channel(
        broker: Arc<B>,
        options: Options,
        control_tx: Sender<Control>,
        control_rx: Receiver<Control>,
    ) -> Self {
        Registry {
            broker,
            options,
            devices: Vec::new(),
            control_tx,
            control_rx,
        }
    }

    /// Channel for delivering control messages
    pub fn sender(&self) -> Sender<Control> {
        self.control_tx.clone()
    }

    /// Announce the device, subscribe to its switch and start its worker
    pub fn add<S>(&mut self, descriptor: DeviceDescriptor, mut source: S) -> Result<usize, String>
    where
        S: EventSource + 'static,
    {
        let id = self.devices.len();

        let topics = match self.options.mode {
            Mode::Manual => Topics::manual(&self.options.base_topic),
            Mode::Discovery => Topics::discovered(&self.options.base_topic, &descriptor.slug),
        };

        let enabled = Arc::new(AtomicBool::new(descriptor.enabled));

        self.announce(&descriptor, &topics, descriptor.enabled);

        // the subscription is renewed on every connect, so a failure here
        // only delays switch commands
        if let Some(switch) = &topics.switch {
            if let Err(e) = self.broker.subscribe(&switch.set) {
                warn!("{e}");
            }
        }

        let mut worker = Worker::new(
            &descriptor.path,
            &descriptor.name,
            &topics.state,
            enabled.clone(),
            ModifierTracker::new(self.options.ignored_keys.iter().cloned()),
        );

        let interrupter = source.interrupter();
        let broker = self.broker.clone();
        let control = self.control_tx.clone();
        let path = descriptor.path.clone();

        let handle = thread::Builder::new()
            .name(descriptor.slug.clone())
            .spawn(move || match worker.run(&mut source, &*broker) {
                WorkerExit::Shutdown => debug!("{path}: stopped"),
                WorkerExit::Disconnected(e) => {
                    warn!("{path}: {e}");

                    let _ = control.send(Control::Retired {
                        id,
                        reason: e.to_string(),
                    });
                }
            })
            .map_err(|e| format!("{}: {e}", descriptor.path))?;

        info!(
            "monitoring '{}' ({}) on {}{}",
            descriptor.name,
            descriptor.path,
            topics.state,
            if descriptor.enabled { "" } else { " (disabled)" }
        );

        self.devices.push(Managed {
            descriptor,
            topics,
            enabled,
            interrupter,
            handle: Some(handle),
        });

        Ok(id)
    }

    fn announce(&self, descriptor: &DeviceDescriptor, topics: &Topics, enabled: bool) {
        let list = match announcement(&self.options.gateway_name, descriptor, topics, enabled) {
            Ok(list) => list,
            Err(e) => {
                warn!("{}: {e}", descriptor.path);
                return;
            }
        };

        for request in list {
            if let Err(e) = self.broker.publish(request) {
                warn!("{}: announcement failed: {e}", descriptor.path);
            }
        }

        debug!("announced {} on {}", descriptor.path, topics.config);
    }

    /// Number of devices whose worker is still running
    pub fn live(&self) -> usize {
        self.devices.iter().filter(|d| d.handle.is_some()).count()
    }

    pub fn is_enabled(&self, id: usize) -> bool {
        self.devices
            .get(id)
            .is_some_and(|d| d.enabled.load(Ordering::Acquire))
    }

    /// Turn publishing for a device on or off. The worker keeps running either
    /// way; the new state is published retained on the switch state topic.
    pub fn set_enabled(&mut self, id: usize, on: bool) {
        let Some(dev) = self.devices.get(id) else {
            return;
        };

        if dev.enabled.swap(on, Ordering::AcqRel) != on {
            info!(
                "'{}' ({}) {}",
                dev.descriptor.name,
                dev.descriptor.path,
                if on { "enabled" } else { "disabled" }
            );
        }

        if let Some(switch) = &dev.topics.switch {
            let request = PublishRequest::new(&switch.state, switch_state(on), true);

            if let Err(e) = self.broker.publish(request) {
                warn!("{}: {e}", dev.descriptor.path);
            }
        }
    }

    /// Handle one control message. Returns false once the registry should
    /// stop, either on shutdown or because no device is left.
    pub fn handle(&mut self, msg: Control) -> bool {
        match msg {
            Control::Command { topic, payload } => {
                let id = self.devices.iter().position(|d| {
                    d.topics
                        .switch
                        .as_ref()
                        .is_some_and(|switch| switch.set == topic)
                });

                match (id, parse_switch(&payload)) {
                    (Some(id), Some(on)) => self.set_enabled(id, on),
                    (Some(_), None) => warn!("{topic}: invalid switch command '{payload}'"),
                    (None, _) => debug!("{topic}: ignoring message"),
                }

                true
            }
            Control::Connected => {
                for dev in self.devices.iter().filter(|d| d.handle.is_some()) {
                    self.announce(
                        &dev.descriptor,
                        &dev.topics,
                        dev.enabled.load(Ordering::Acquire),
                    );
                }

                true
            }
            Control::Retired { id, reason } => {
                if let Some(dev) = self.devices.get_mut(id) {
                    if let Some(handle) = dev.handle.take() {
                        let _ = handle.join();
                    }

                    info!("{}: no longer monitored: {reason}", dev.descriptor.path);
                }

                if self.live() == 0 {
                    warn!("no input devices left");
                    false
                } else {
                    true
                }
            }
            Control::Shutdown => false,
        }
    }

    /// Wait for and handle the next control message
    pub fn step(&mut self) -> bool {
        match self.control_rx.recv() {
            Ok(msg) => self.handle(msg),
            Err(_) => false,
        }
    }

    pub fn run(&mut self) {
        while self.step() {}
    }

    /// Stop all workers and wait for them
    pub fn shutdown(&mut self) {
        for dev in self.devices.iter().filter(|d| d.handle.is_some()) {
            if let Err(e) = dev.interrupter.interrupt() {
                warn!("{}: {e}", dev.descriptor.path);
            }
        }

        for dev in &mut self.devices {
            if let Some(handle) = dev.handle.take() {
                let _ = handle.join();
            }
        }
    }
}
