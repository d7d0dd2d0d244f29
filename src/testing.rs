//! Doubles for the broker and for input devices.

use crate::{
    decoder::RawEvent,
    gateway::{Broker, PublishRequest},
    source::{EventSource, Interrupt},
};
use std::{
    io::{self, ErrorKind, Read, Write},
    net::{Shutdown, TcpListener, TcpStream},
    sync::{
        mpsc::{channel, sync_channel, Receiver, Sender, SyncSender},
        Arc, Mutex,
    },
    thread,
    time::Duration,
};

#[derive(Default)]
struct Recorded {
    published: Vec<PublishRequest>,
    subscriptions: Vec<String>,
    fail_next: bool,
    fail_subscribe: bool,
}

/// Broker which remembers everything published
#[derive(Clone, Default)]
pub(crate) struct RecordingBroker {
    inner: Arc<Mutex<Recorded>>,
}

impl RecordingBroker {
    /// Everything published since the last call
    pub fn take(&self) -> Vec<PublishRequest> {
        std::mem::take(&mut self.inner.lock().unwrap().published)
    }

    pub fn subscriptions(&self) -> Vec<String> {
        self.inner.lock().unwrap().subscriptions.clone()
    }

    /// Make the next publish fail, as if the broker was unreachable
    pub fn fail_next(&self) {
        self.inner.lock().unwrap().fail_next = true;
    }

    /// Make every subscription fail
    pub fn fail_subscribe(&self) {
        self.inner.lock().unwrap().fail_subscribe = true;
    }
}

impl Broker for RecordingBroker {
    fn publish(&self, request: PublishRequest) -> Result<(), String> {
        let mut inner = self.inner.lock().unwrap();

        if inner.fail_next {
            inner.fail_next = false;
            return Err(format!("{}: broker not connected", request.topic));
        }

        inner.published.push(request);

        Ok(())
    }

    fn subscribe(&self, topic: &str) -> Result<(), String> {
        let mut inner = self.inner.lock().unwrap();

        if inner.fail_subscribe {
            return Err(format!("{topic}: request queue full"));
        }

        inner.subscriptions.push(topic.to_owned());

        Ok(())
    }
}

enum Feed {
    Batch(Vec<RawEvent>),
    Fail(ErrorKind),
    Stop,
}

/// Event source fed from the test. The channel has no buffer, so a send
/// returns only once the reader asked for the next batch.
pub(crate) struct ChannelSource {
    rx: Receiver<Feed>,
    tx: SyncSender<Feed>,
}

pub(crate) struct Feeder {
    tx: SyncSender<Feed>,
}

impl ChannelSource {
    pub fn new() -> (ChannelSource, Feeder) {
        let (tx, rx) = sync_channel(0);

        (
            ChannelSource { rx, tx: tx.clone() },
            Feeder { tx },
        )
    }
}

impl Feeder {
    pub fn batch(&self, events: Vec<RawEvent>) {
        self.tx.send(Feed::Batch(events)).unwrap();
    }

    /// Returns once the previous batch has been processed completely
    pub fn settle(&self) {
        self.batch(Vec::new());
    }

    /// Make the reader fail, as if the device was unplugged
    pub fn fail(&self, kind: ErrorKind) {
        self.tx.send(Feed::Fail(kind)).unwrap();
    }

    pub fn stop(&self) {
        self.tx.send(Feed::Stop).unwrap();
    }
}

struct Stopper(Mutex<SyncSender<Feed>>);

impl Interrupt for Stopper {
    fn interrupt(&self) -> io::Result<()> {
        // the reader may have gone already
        let _ = self.0.lock().unwrap().send(Feed::Stop);

        Ok(())
    }
}

impl EventSource for ChannelSource {
    fn next_batch(&mut self) -> io::Result<Option<Vec<RawEvent>>> {
        match self.rx.recv() {
            Ok(Feed::Batch(events)) => Ok(Some(events)),
            Ok(Feed::Fail(kind)) => Err(io::Error::from(kind)),
            Ok(Feed::Stop) | Err(_) => Ok(None),
        }
    }

    fn interrupter(&self) -> Arc<dyn Interrupt> {
        Arc::new(Stopper(Mutex::new(self.tx.clone())))
    }
}

/// What the loopback broker received from its client
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Received {
    Connect,
    Publish {
        topic: String,
        payload: Vec<u8>,
        retain: bool,
    },
    Subscribe(Vec<String>),
    Disconnect,
}

/// Just enough of an MQTT 3.1.1 broker on a loopback port to talk to one
/// client at a time
pub(crate) struct FakeBroker {
    pub port: u16,
    received: Receiver<Received>,
    writer: Arc<Mutex<Option<TcpStream>>>,
    connack: Sender<()>,
}

impl FakeBroker {
    /// Without `auto_connack`, every CONNECT waits for [`FakeBroker::connack`]
    pub fn start(auto_connack: bool) -> FakeBroker {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();

        let (received_tx, received) = channel();
        let (connack, gate) = channel();
        let writer = Arc::new(Mutex::new(None));

        let current = writer.clone();

        thread::spawn(move || {
            for conn in listener.incoming() {
                let Ok(mut conn) = conn else {
                    break;
                };

                *current.lock().unwrap() = Some(conn.try_clone().unwrap());

                let gate = if auto_connack { None } else { Some(&gate) };

                // the client went away; wait for it to come back
                let _ = serve(&mut conn, &current, &received_tx, gate);
            }
        });

        FakeBroker {
            port,
            received,
            writer,
            connack,
        }
    }

    /// Accept the pending CONNECT
    pub fn connack(&self) {
        self.connack.send(()).unwrap();
    }

    pub fn next(&self) -> Received {
        self.received
            .recv_timeout(Duration::from_secs(5))
            .expect("broker received nothing")
    }

    /// Deliver a message to the client
    pub fn publish(&self, topic: &str, payload: &str) {
        let mut body = Vec::new();
        body.extend_from_slice(&(topic.len() as u16).to_be_bytes());
        body.extend_from_slice(topic.as_bytes());
        body.extend_from_slice(payload.as_bytes());

        write_packet(&self.writer, 0x30, &body).unwrap();
    }

    /// Drop the connection, as a restarting broker would
    pub fn kick(&self) {
        if let Some(stream) = self.writer.lock().unwrap().take() {
            let _ = stream.shutdown(Shutdown::Both);
        }
    }
}

fn serve(
    conn: &mut TcpStream,
    writer: &Mutex<Option<TcpStream>>,
    received: &Sender<Received>,
    gate: Option<&Receiver<()>>,
) -> io::Result<()> {
    loop {
        let (header, body) = read_packet(conn)?;

        match header >> 4 {
            // CONNECT
            1 => {
                let _ = received.send(Received::Connect);

                if let Some(gate) = gate {
                    let _ = gate.recv();
                }

                write_packet(writer, 0x20, &[0, 0])?;
            }
            // PUBLISH
            3 => {
                let (topic, mut pos) = string(&body, 0);

                if (header >> 1) & 3 != 0 {
                    pos += 2;
                }

                let _ = received.send(Received::Publish {
                    topic,
                    payload: body[pos..].to_vec(),
                    retain: header & 1 == 1,
                });
            }
            // SUBSCRIBE
            8 => {
                let mut topics = Vec::new();
                let mut pos = 2;

                while pos < body.len() {
                    let (topic, next) = string(&body, pos);
                    topics.push(topic);
                    pos = next + 1;
                }

                let mut suback = body[..2].to_vec();
                suback.extend(topics.iter().map(|_| 0u8));

                let _ = received.send(Received::Subscribe(topics));

                write_packet(writer, 0x90, &suback)?;
            }
            // PINGREQ
            12 => write_packet(writer, 0xd0, &[])?,
            // DISCONNECT
            14 => {
                let _ = received.send(Received::Disconnect);
                return Ok(());
            }
            _ => (),
        }
    }
}

fn read_packet(conn: &mut TcpStream) -> io::Result<(u8, Vec<u8>)> {
    let mut byte = [0u8; 1];

    conn.read_exact(&mut byte)?;
    let header = byte[0];

    let mut len = 0usize;
    let mut shift = 0;

    loop {
        conn.read_exact(&mut byte)?;
        len |= ((byte[0] & 0x7f) as usize) << shift;

        if byte[0] & 0x80 == 0 {
            break;
        }

        shift += 7;
    }

    let mut body = vec![0; len];
    conn.read_exact(&mut body)?;

    Ok((header, body))
}

fn write_packet(writer: &Mutex<Option<TcpStream>>, header: u8, body: &[u8]) -> io::Result<()> {
    let mut packet = vec![header];
    let mut len = body.len();

    loop {
        let mut byte = (len % 128) as u8;
        len /= 128;

        if len > 0 {
            byte |= 0x80;
        }

        packet.push(byte);

        if len == 0 {
            break;
        }
    }

    packet.extend_from_slice(body);

    match writer.lock().unwrap().as_mut() {
        Some(stream) => stream.write_all(&packet),
        None => Err(ErrorKind::NotConnected.into()),
    }
}

fn string(body: &[u8], pos: usize) -> (String, usize) {
    let len = u16::from_be_bytes([body[pos], body[pos + 1]]) as usize;
    let end = pos + 2 + len;

    (String::from_utf8_lossy(&body[pos + 2..end]).into_owned(), end)
}
