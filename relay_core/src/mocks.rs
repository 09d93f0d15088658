//! Test and helper mocks for relay_core, including a loopback MQTT broker

use crate::control::StatusSink;
use crate::record::SensorRecord;
use crate::uploader::{Delivery, Upload};
use crossbeam_channel as xch;
use relay_traits::{BoxError, Probe, SampleSource};
use std::collections::VecDeque;
use std::io::{self, Read, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::JoinHandle;
use std::time::Duration;

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}

/// Probe with a switchable answer.
#[derive(Debug, Default)]
pub struct FixedProbe(AtomicBool);

impl FixedProbe {
    pub fn new(reachable: bool) -> Self {
        Self(AtomicBool::new(reachable))
    }

    pub fn set(&self, reachable: bool) {
        self.0.store(reachable, Ordering::Relaxed);
    }
}

impl Probe for FixedProbe {
    fn reachable(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

/// Uploader that answers from a script and remembers what it was given.
///
/// Once the script runs out, every publish gets the fallback answer
/// (`Confirmed` unless changed).
#[derive(Debug)]
pub struct ScriptedUploader {
    connected: AtomicBool,
    script: Mutex<VecDeque<Delivery>>,
    fallback: Mutex<Delivery>,
    published: Mutex<Vec<SensorRecord>>,
    connect_attempts: Mutex<u32>,
}

impl Default for ScriptedUploader {
    fn default() -> Self {
        Self::new(true)
    }
}

impl ScriptedUploader {
    pub fn new(connected: bool) -> Self {
        Self {
            connected: AtomicBool::new(connected),
            script: Mutex::new(VecDeque::new()),
            fallback: Mutex::new(Delivery::Confirmed),
            published: Mutex::new(Vec::new()),
            connect_attempts: Mutex::new(0),
        }
    }

    pub fn then(self, d: Delivery) -> Self {
        lock(&self.script).push_back(d);
        self
    }

    pub fn set_fallback(&self, d: Delivery) {
        *lock(&self.fallback) = d;
    }

    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::Relaxed);
    }

    /// Every record offered to `publish`, in call order.
    pub fn published(&self) -> Vec<SensorRecord> {
        lock(&self.published).clone()
    }

    pub fn publish_count(&self) -> usize {
        lock(&self.published).len()
    }

    pub fn connect_attempts(&self) -> u32 {
        *lock(&self.connect_attempts)
    }
}

impl Upload for ScriptedUploader {
    fn ensure_connected(&self) -> bool {
        *lock(&self.connect_attempts) += 1;
        self.connected.load(Ordering::Relaxed)
    }

    fn publish(&self, record: &SensorRecord) -> Delivery {
        lock(&self.published).push(record.clone());
        let next = lock(&self.script).pop_front();
        next.unwrap_or_else(|| lock(&self.fallback).clone())
    }
}

/// Status sink that records every reply.
#[derive(Debug, Default)]
pub struct RecordingSink {
    sent: Mutex<Vec<(String, String)>>,
}

impl RecordingSink {
    pub fn sent(&self) -> Vec<(String, String)> {
        lock(&self.sent).clone()
    }
}

impl StatusSink for RecordingSink {
    fn publish_status(&self, topic: &str, payload: &str) -> bool {
        lock(&self.sent).push((topic.to_owned(), payload.to_owned()));
        true
    }
}

/// Source that replays a fixed list of reads, then fails.
pub struct ScriptedSource {
    channels: Vec<String>,
    reads: VecDeque<Result<Vec<Option<f64>>, String>>,
}

impl ScriptedSource {
    pub fn new(channels: Vec<String>) -> Self {
        Self {
            channels,
            reads: VecDeque::new(),
        }
    }

    pub fn ok(mut self, values: Vec<Option<f64>>) -> Self {
        self.reads.push_back(Ok(values));
        self
    }

    pub fn err(mut self, msg: &str) -> Self {
        self.reads.push_back(Err(msg.to_owned()));
        self
    }

    pub fn remaining(&self) -> usize {
        self.reads.len()
    }
}

impl SampleSource for ScriptedSource {
    fn channels(&self) -> Vec<String> {
        self.channels.clone()
    }

    fn read(&mut self, _timeout: Duration) -> Result<Vec<Option<f64>>, BoxError> {
        match self.reads.pop_front() {
            Some(Ok(v)) => Ok(v),
            Some(Err(msg)) => Err(Box::new(std::io::Error::other(msg))),
            None => Err(Box::new(std::io::Error::other("script exhausted"))),
        }
    }
}

enum BrokerCmd {
    Publish(String, Vec<u8>),
    DropClient,
}

#[derive(Default)]
struct BrokerShared {
    acking: AtomicBool,
    stop: AtomicBool,
    connects: AtomicUsize,
    subscriptions: Mutex<Vec<String>>,
}

/// Loopback MQTT 3.1.1 broker for session tests.
///
/// Serves one client at a time. Answers CONNECT, SUBSCRIBE, PINGREQ and
/// QoS 1 PUBLISH (unless acking is off), records what it receives, and can
/// push a message to the client or cut the connection.
pub struct FakeBroker {
    port: u16,
    shared: Arc<BrokerShared>,
    commands: xch::Sender<BrokerCmd>,
    received: xch::Receiver<(String, Vec<u8>)>,
    join_handle: Option<JoinHandle<()>>,
}

impl FakeBroker {
    pub fn start() -> io::Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0")?;
        listener.set_nonblocking(true)?;
        let port = listener.local_addr()?.port();
        let shared = Arc::new(BrokerShared::default());
        shared.acking.store(true, Ordering::Relaxed);
        let (cmd_tx, cmd_rx) = xch::unbounded();
        let (pub_tx, pub_rx) = xch::unbounded();

        let worker = BrokerWorker {
            shared: shared.clone(),
            commands: cmd_rx,
            received: pub_tx,
        };
        let join_handle = std::thread::Builder::new()
            .name("fake-broker".into())
            .spawn(move || worker.run(&listener))?;
        Ok(Self {
            port,
            shared,
            commands: cmd_tx,
            received: pub_rx,
            join_handle: Some(join_handle),
        })
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Whether QoS 1 publishes get a PUBACK.
    pub fn set_acking(&self, on: bool) {
        self.shared.acking.store(on, Ordering::Relaxed);
    }

    /// Send a QoS 0 message to the connected client.
    pub fn send(&self, topic: &str, payload: &[u8]) {
        let _ = self.commands.send(BrokerCmd::Publish(topic.to_owned(), payload.to_vec()));
    }

    /// Close the current client connection.
    pub fn drop_client(&self) {
        let _ = self.commands.send(BrokerCmd::DropClient);
    }

    /// CONNECT packets seen so far.
    pub fn connects(&self) -> usize {
        self.shared.connects.load(Ordering::Relaxed)
    }

    /// Every topic subscribed so far, in order.
    pub fn subscriptions(&self) -> Vec<String> {
        lock(&self.shared.subscriptions).clone()
    }

    /// Next message published by a client on `topic`, skipping others.
    pub fn wait_for(&self, topic: &str, timeout: Duration) -> Option<Vec<u8>> {
        let deadline = std::time::Instant::now() + timeout;
        loop {
            let left = deadline.saturating_duration_since(std::time::Instant::now());
            match self.received.recv_timeout(left) {
                Ok((t, payload)) if t == topic => return Some(payload),
                Ok(_) => {}
                Err(_) => return None,
            }
        }
    }
}

impl Drop for FakeBroker {
    fn drop(&mut self) {
        self.shared.stop.store(true, Ordering::Relaxed);
        if let Some(h) = self.join_handle.take() {
            let _ = h.join();
        }
    }
}

struct BrokerWorker {
    shared: Arc<BrokerShared>,
    commands: xch::Receiver<BrokerCmd>,
    received: xch::Sender<(String, Vec<u8>)>,
}

impl BrokerWorker {
    const POLL: Duration = Duration::from_millis(10);

    fn run(&self, listener: &TcpListener) {
        while !self.shared.stop.load(Ordering::Relaxed) {
            match listener.accept() {
                Ok((stream, _)) => {
                    if let Err(e) = self.serve(stream) {
                        tracing::debug!(error = %e, "fake broker client gone");
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => std::thread::sleep(Self::POLL),
                Err(e) => {
                    tracing::warn!(error = %e, "fake broker accept failed");
                    return;
                }
            }
        }
    }

    fn serve(&self, mut stream: TcpStream) -> io::Result<()> {
        stream.set_nonblocking(false)?;
        stream.set_nodelay(true)?;
        loop {
            if self.shared.stop.load(Ordering::Relaxed) {
                return Ok(());
            }
            while let Ok(cmd) = self.commands.try_recv() {
                match cmd {
                    BrokerCmd::Publish(topic, payload) => {
                        stream.write_all(&publish_packet(&topic, &payload))?;
                    }
                    BrokerCmd::DropClient => return Ok(()),
                }
            }

            stream.set_read_timeout(Some(Self::POLL))?;
            let mut first = [0u8; 1];
            match stream.read(&mut first) {
                Ok(0) => return Ok(()),
                Ok(_) => {}
                Err(e) if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut) => {
                    continue;
                }
                Err(e) => return Err(e),
            }
            stream.set_read_timeout(Some(Duration::from_secs(1)))?;
            let len = read_remaining_length(&mut stream)?;
            let mut body = vec![0u8; len];
            stream.read_exact(&mut body)?;

            match first[0] >> 4 {
                // CONNECT
                1 => {
                    self.shared.connects.fetch_add(1, Ordering::Relaxed);
                    stream.write_all(&[0x20, 0x02, 0x00, 0x00])?;
                }
                // PUBLISH
                3 => {
                    let qos = (first[0] >> 1) & 0x03;
                    let (topic, rest) = split_str(&body)?;
                    let (pkid, payload) = if qos > 0 {
                        if rest.len() < 2 {
                            return Err(io::Error::other("short publish"));
                        }
                        (Some([rest[0], rest[1]]), &rest[2..])
                    } else {
                        (None, rest)
                    };
                    let _ = self.received.send((topic, payload.to_vec()));
                    if let Some([hi, lo]) = pkid
                        && self.shared.acking.load(Ordering::Relaxed)
                    {
                        stream.write_all(&[0x40, 0x02, hi, lo])?;
                    }
                }
                // SUBSCRIBE
                8 => {
                    if body.len() < 2 {
                        return Err(io::Error::other("short subscribe"));
                    }
                    let mut rest = &body[2..];
                    let mut granted = Vec::new();
                    while !rest.is_empty() {
                        let (topic, tail) = split_str(rest)?;
                        let Some((_qos, tail)) = tail.split_first() else {
                            return Err(io::Error::other("subscribe without qos"));
                        };
                        lock(&self.shared.subscriptions).push(topic);
                        granted.push(0x01);
                        rest = tail;
                    }
                    let mut ack = vec![0x90];
                    ack.extend(remaining_length(2 + granted.len()));
                    ack.extend([body[0], body[1]]);
                    ack.extend(granted);
                    stream.write_all(&ack)?;
                }
                // PINGREQ
                12 => stream.write_all(&[0xD0, 0x00])?,
                // DISCONNECT
                14 => return Ok(()),
                _ => {}
            }
        }
    }
}

fn read_remaining_length(stream: &mut TcpStream) -> io::Result<usize> {
    let mut len = 0usize;
    for shift in [0, 7, 14, 21] {
        let mut b = [0u8; 1];
        stream.read_exact(&mut b)?;
        len |= usize::from(b[0] & 0x7f) << shift;
        if b[0] & 0x80 == 0 {
            return Ok(len);
        }
    }
    Err(io::Error::other("remaining length too long"))
}

fn remaining_length(mut len: usize) -> Vec<u8> {
    let mut out = Vec::with_capacity(4);
    loop {
        let mut b = u8::try_from(len % 128).unwrap_or(0);
        len /= 128;
        if len > 0 {
            b |= 0x80;
        }
        out.push(b);
        if len == 0 {
            return out;
        }
    }
}

/// Length-prefixed UTF-8 string and the bytes after it.
fn split_str(buf: &[u8]) -> io::Result<(String, &[u8])> {
    if buf.len() < 2 {
        return Err(io::Error::other("short string"));
    }
    let n = usize::from(u16::from_be_bytes([buf[0], buf[1]]));
    let end = 2 + n;
    let raw = buf.get(2..end).ok_or_else(|| io::Error::other("short string"))?;
    let s = String::from_utf8(raw.to_vec()).map_err(io::Error::other)?;
    Ok((s, &buf[end..]))
}

fn publish_packet(topic: &str, payload: &[u8]) -> Vec<u8> {
    let topic_len = u16::try_from(topic.len()).unwrap_or(u16::MAX);
    let mut out = vec![0x30];
    out.extend(remaining_length(2 + topic.len() + payload.len()));
    out.extend(topic_len.to_be_bytes());
    out.extend(topic.as_bytes());
    out.extend(payload);
    out
}
