//! The single connection to the MQTT broker.

use crate::registry::Control;
use log::{debug, error, info, trace, warn};
use rumqttc::{
    Client, ConnectReturnCode, Connection, Event, MqttOptions, Outgoing, Packet, QoS,
    SubscribeFilter,
};
use std::{
    io,
    sync::{
        atomic::{AtomicBool, Ordering},
        mpsc::{self, Receiver, Sender},
        Arc, Mutex,
    },
    thread::{self, JoinHandle},
    time::{Duration, SystemTime, UNIX_EPOCH},
};

/// A message to be published
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishRequest {
    pub topic: String,
    pub payload: Vec<u8>,
    pub retain: bool,
}

impl PublishRequest {
    pub fn new(topic: impl Into<String>, payload: impl Into<Vec<u8>>, retain: bool) -> Self {
        PublishRequest {
            topic: topic.into(),
            payload: payload.into(),
            retain,
        }
    }
}

/// Everything the workers and the registry need from a broker
pub trait Broker: Send + Sync {
    /// Publish a message. A failed message is not retried. Retained messages
    /// carry state, so they wait for room in the outgoing queue; anything
    /// else is dropped when it cannot be queued at once.
    fn publish(&self, request: PublishRequest) -> Result<(), String>;

    /// Subscribe to a topic; received messages arrive as [`Control::Command`]
    fn subscribe(&self, topic: &str) -> Result<(), String>;
}

/// Broker connection settings
#[derive(Debug, Clone)]
pub struct Settings {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    pub client_id: String,
}

/// Client id which is unique per host and start time
pub fn client_id() -> String {
    let host = nix::unistd::gethostname()
        .map(|h| h.to_string_lossy().into_owned())
        .unwrap_or_else(|_| "localhost".into());

    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default();

    format!("evmqtt_{host}_{now}")
}

const KEEP_ALIVE: Duration = Duration::from_secs(30);
const RECONNECT_DELAY: Duration = Duration::from_secs(1);
const REQUEST_QUEUE: usize = 64;

pub struct Gateway {
    client: Mutex<Client>,
    connected: Arc<AtomicBool>,
    stopping: Arc<AtomicBool>,
    subscriptions: Arc<Mutex<Vec<String>>>,
    connack: Mutex<Receiver<()>>,
}

impl Gateway {
    /// Start connecting to the broker. Messages on subscribed topics are
    /// forwarded to `control`.
    pub fn connect(
        settings: &Settings,
        control: Sender<Control>,
    ) -> io::Result<(Gateway, JoinHandle<()>)> {
        info!(
            "connecting to {}:{} as '{}'",
            settings.host, settings.port, settings.client_id
        );

        let mut options = MqttOptions::new(&settings.client_id, &settings.host, settings.port);
        options.set_keep_alive(KEEP_ALIVE);
        options.set_clean_session(true);

        if !settings.username.is_empty() {
            options.set_credentials(&settings.username, &settings.password);
        }

        let (client, connection) = Client::new(options, REQUEST_QUEUE);

        let connected = Arc::new(AtomicBool::new(false));
        let stopping = Arc::new(AtomicBool::new(false));
        let subscriptions = Arc::new(Mutex::new(Vec::new()));
        let (connack_tx, connack_rx) = mpsc::channel();

        let mut event_loop = EventLoop {
            client: client.clone(),
            connected: connected.clone(),
            stopping: stopping.clone(),
            subscriptions: subscriptions.clone(),
            connack: connack_tx,
            control,
        };

        let handle = thread::Builder::new()
            .name("mqtt".into())
            .spawn(move || event_loop.run(connection))?;

        let gateway = Gateway {
            client: Mutex::new(client),
            connected,
            stopping,
            subscriptions,
            connack: Mutex::new(connack_rx),
        };

        Ok((gateway, handle))
    }

    /// Wait for the first successful connection
    pub fn wait_connected(&self, timeout: Duration) -> bool {
        if self.is_connected() {
            return true;
        }

        self.connack.lock().unwrap().recv_timeout(timeout).is_ok()
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    pub fn disconnect(&self) {
        self.stopping.store(true, Ordering::Release);

        if let Err(e) = self.client.lock().unwrap().disconnect() {
            debug!("mqtt disconnect: {e}");
        }

        info!("disconnected from mqtt broker");
    }
}

impl Broker for Gateway {
    fn publish(&self, request: PublishRequest) -> Result<(), String> {
        if !self.is_connected() {
            return Err(format!("{}: broker not connected", request.topic));
        }

        let client = self.client.lock().unwrap();

        let res = if request.retain {
            client.publish(
                request.topic.as_str(),
                QoS::AtMostOnce,
                true,
                request.payload,
            )
        } else {
            client.try_publish(
                request.topic.as_str(),
                QoS::AtMostOnce,
                false,
                request.payload,
            )
        };

        res.map_err(|e| format!("{}: {e}", request.topic))
    }

    fn subscribe(&self, topic: &str) -> Result<(), String> {
        self.subscriptions.lock().unwrap().push(topic.to_owned());

        // otherwise the subscription is made once the connection is up
        if self.is_connected() {
            self.client
                .lock()
                .unwrap()
                .subscribe(topic, QoS::AtMostOnce)
                .map_err(|e| format!("{topic}: {e}"))?;
        }

        Ok(())
    }
}

struct EventLoop {
    client: Client,
    connected: Arc<AtomicBool>,
    stopping: Arc<AtomicBool>,
    subscriptions: Arc<Mutex<Vec<String>>>,
    connack: Sender<()>,
    control: Sender<Control>,
}

impl EventLoop {
    fn run(&mut self, mut connection: Connection) {
        let mut reconnect = false;

        for notification in connection.iter() {
            match notification {
                Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                    if ack.code == ConnectReturnCode::Success {
                        info!("connected to mqtt broker");
                        self.connected.store(true, Ordering::Release);
                        self.resubscribe();

                        // a clean session loses nothing retained, but the
                        // broker may have been restarted without persistence
                        if reconnect {
                            let _ = self.control.send(Control::Connected);
                        } else {
                            let _ = self.connack.send(());
                        }
                        reconnect = true;
                    } else {
                        error!("mqtt broker refused connection: {:?}", ack.code);
                    }
                }
                Ok(Event::Incoming(Packet::Publish(publish))) => {
                    let payload = String::from_utf8_lossy(&publish.payload).into_owned();

                    debug!("received '{payload}' on {}", publish.topic);

                    let command = Control::Command {
                        topic: publish.topic,
                        payload,
                    };

                    if self.control.send(command).is_err() {
                        break;
                    }
                }
                Ok(Event::Outgoing(Outgoing::Disconnect)) => {
                    self.connected.store(false, Ordering::Release);
                    break;
                }
                Ok(event) => {
                    trace!("mqtt: {event:?}");
                }
                Err(e) => {
                    self.connected.store(false, Ordering::Release);

                    if self.stopping.load(Ordering::Acquire) {
                        break;
                    }

                    warn!("mqtt connection: {e}");

                    thread::sleep(RECONNECT_DELAY);
                }
            }
        }
    }

    /// Renew all subscriptions with a single request. This runs on the thread
    /// which drains the request queue, so it must not block.
    fn resubscribe(&self) {
        let topics = self.subscriptions.lock().unwrap().clone();

        if topics.is_empty() {
            return;
        }

        let filters = topics
            .iter()
            .map(|topic| SubscribeFilter::new(topic.clone(), QoS::AtMostOnce));

        match self.client.try_subscribe_many(filters) {
            Ok(()) => debug!("subscribed to {}", topics.join(", ")),
            Err(e) => warn!("failed to subscribe: {e}"),
        }
    }
}
