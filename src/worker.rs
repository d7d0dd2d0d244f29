//! Read loop for a single input device.

use crate::{
    gateway::{Broker, PublishRequest},
    modifiers::ModifierTracker,
    payload,
    source::EventSource,
};
use log::{debug, trace, warn};
use serde::Serialize;
use std::{
    io,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

/// Published on the state topic for every key press
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct KeyEvent {
    pub key: String,
    pub device_path: String,
    pub device_name: String,
}

/// Why a worker stopped
#[derive(Debug)]
pub enum WorkerExit {
    /// The source was interrupted
    Shutdown,
    /// Reading failed, usually because the device was removed
    Disconnected(io::Error),
}

pub struct Worker {
    device_path: String,
    device_name: String,
    state_topic: String,
    enabled: Arc<AtomicBool>,
    tracker: ModifierTracker,
}

impl Worker {
    pub fn new(
        device_path: &str,
        device_name: &str,
        state_topic: &str,
        enabled: Arc<AtomicBool>,
        tracker: ModifierTracker,
    ) -> Self {
        Worker {
            device_path: device_path.to_owned(),
            device_name: device_name.to_owned(),
            state_topic: state_topic.to_owned(),
            enabled,
            tracker,
        }
    }

    /// Read events until the source is interrupted or fails. Events are
    /// always drained, even while publishing is disabled.
    pub fn run<S, B>(&mut self, source: &mut S, broker: &B) -> WorkerExit
    where
        S: EventSource + ?Sized,
        B: Broker + ?Sized,
    {
        self.tracker.reset();

        loop {
            let batch = match source.next_batch() {
                Ok(Some(batch)) => batch,
                Ok(None) => return WorkerExit::Shutdown,
                Err(e) => return WorkerExit::Disconnected(e),
            };

            for ev in &batch {
                trace!("{}: {ev:?}", self.device_path);

                if let Some(key) = self.tracker.on_event(ev) {
                    self.emit(key, broker);
                }
            }
        }
    }

    fn emit<B: Broker + ?Sized>(&self, key: String, broker: &B) {
        if !self.enabled.load(Ordering::Acquire) {
            debug!("{}: disabled, dropping {key}", self.device_path);
            return;
        }

        let event = KeyEvent {
            key,
            device_path: self.device_path.clone(),
            device_name: self.device_name.clone(),
        };

        let payload = match payload::encode(&event) {
            Ok(payload) => payload,
            Err(e) => {
                warn!("{}: {e}", self.device_path);
                return;
            }
        };

        debug!(
            "{}: {}",
            self.state_topic,
            String::from_utf8_lossy(&payload)
        );

        if let Err(e) = broker.publish(PublishRequest::new(&self.state_topic, payload, false)) {
            warn!("{}: dropped {}: {e}", self.device_path, event.key);
        }
    }
}
