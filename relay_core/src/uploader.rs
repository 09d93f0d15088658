//! Broker session and confirmed publishing.
//!
//! `MqttUploader` owns one rumqttc client. The network event loop runs on a
//! dedicated session thread which:
//! - keeps `ConnectionState` current and reconnects with a fixed backoff,
//! - subscribes the control handler's topics after every CONNACK,
//! - hands control messages to the handler,
//! - forwards packet-level events (`Sent`, `Acked`, …) to the publisher.
//!
//! `publish` sends at QoS 1 and waits a bounded time for the PUBACK of that
//! exact packet. Publishes are serialized by the session mutex.

use crate::config::SessionCfg;
use crate::control::{ControlHandler, StatusSink};
use crate::error::RelayError;
use crate::record::SensorRecord;
use crossbeam_channel as xch;
use rumqttc::{Client, Connection, Event, MqttOptions, Outgoing, Packet, QoS};
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

/// Outcome of one confirmed publish.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Delivery {
    /// Broker acknowledged within the confirmation window.
    Confirmed,
    /// Transport refused or lost the message.
    Failed(String),
    /// No acknowledgment within the window; the message may still arrive.
    Timeout,
}

/// Process-wide broker connection flags.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConnectionState {
    pub connected: bool,
    /// Control subscriptions acknowledged on the current connection.
    pub session_ready: bool,
}

/// Mutex-guarded `ConnectionState` shared with the session thread.
#[derive(Debug, Clone, Default)]
pub struct SharedConnection(Arc<Mutex<ConnectionState>>);

impl SharedConnection {
    fn lock(&self) -> MutexGuard<'_, ConnectionState> {
        self.0.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    pub fn snapshot(&self) -> ConnectionState {
        *self.lock()
    }

    pub fn update(&self, f: impl FnOnce(&mut ConnectionState)) {
        f(&mut self.lock());
    }
}

/// Publishing side of the uploader, as seen by the dispatcher and the
/// backlog replay.
pub trait Upload: Send + Sync {
    /// No-op when a session is up; otherwise one bounded connection attempt.
    fn ensure_connected(&self) -> bool;

    /// Publish and wait a bounded time for confirmation. Safe to repeat;
    /// duplicates are expected under retry.
    fn publish(&self, record: &SensorRecord) -> Delivery;
}

/// Packet-level events forwarded by the session thread.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    Connected,
    /// A QoS 1 publish with this packet id went out on the wire.
    Sent(u16),
    /// The broker acknowledged this packet id.
    Acked(u16),
    Disconnected(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Wait {
    Idle,
    Unsent,
    Sent(u16),
}

/// Attributes packet ids to publishes.
///
/// rumqttc does not return the packet id from `publish`; ids are only seen
/// on the event stream. Requests go out in FIFO order, so the first `Sent`
/// after a publish that is neither a retransmission nor owed to an earlier
/// abandoned publish belongs to it. A late PUBACK of an abandoned publish
/// therefore never confirms a newer one.
#[derive(Debug)]
pub struct AckTracker {
    wait: Wait,
    /// Abandoned publishes whose `Sent` has not been seen yet.
    stale_unsent: usize,
    /// Ids on the wire awaiting PUBACK; a repeated `Sent` is a retransmission.
    in_flight: HashSet<u16>,
}

impl Default for AckTracker {
    fn default() -> Self {
        Self {
            wait: Wait::Idle,
            stale_unsent: 0,
            in_flight: HashSet::new(),
        }
    }
}

impl AckTracker {
    /// A publish request was queued; its `Sent` is next in line.
    pub fn begin(&mut self) {
        self.wait = Wait::Unsent;
    }

    /// Give up on the current publish.
    pub fn abandon(&mut self) {
        if self.wait == Wait::Unsent {
            self.stale_unsent += 1;
        }
        self.wait = Wait::Idle;
    }

    pub fn waiting(&self) -> bool {
        self.wait != Wait::Idle
    }

    /// Feed one event; returns the verdict for the current publish, if any.
    pub fn observe(&mut self, ev: SessionEvent) -> Option<Delivery> {
        match ev {
            SessionEvent::Sent(pkid) => {
                if !self.in_flight.insert(pkid) {
                    return None;
                }
                if self.stale_unsent > 0 {
                    self.stale_unsent -= 1;
                } else if self.wait == Wait::Unsent {
                    self.wait = Wait::Sent(pkid);
                }
                None
            }
            SessionEvent::Acked(pkid) => {
                self.in_flight.remove(&pkid);
                if self.wait == Wait::Sent(pkid) {
                    self.wait = Wait::Idle;
                    return Some(Delivery::Confirmed);
                }
                None
            }
            SessionEvent::Disconnected(reason) => {
                if self.waiting() {
                    self.abandon();
                    return Some(Delivery::Failed(reason));
                }
                None
            }
            SessionEvent::Connected => None,
        }
    }
}

/// Best-effort status publishing from the session thread; never blocks.
struct ClientStatusSink<'a>(&'a Client);

impl StatusSink for ClientStatusSink<'_> {
    fn publish_status(&self, topic: &str, payload: &str) -> bool {
        match self.0.try_publish(topic, QoS::AtMostOnce, false, payload.as_bytes().to_vec()) {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!(topic, error = %e, "status publish dropped");
                false
            }
        }
    }
}

struct Session {
    client: Client,
    events: xch::Receiver<SessionEvent>,
    tracker: AckTracker,
    stop: xch::Sender<()>,
    done: xch::Receiver<()>,
    join_handle: Option<JoinHandle<()>>,
}

impl Session {
    /// Apply queued events without waiting.
    fn pump(&mut self) {
        while let Ok(ev) = self.events.try_recv() {
            let _ = self.tracker.observe(ev);
        }
    }
}

pub struct MqttUploader {
    cfg: SessionCfg,
    data_topic: String,
    state: SharedConnection,
    handler: Arc<dyn ControlHandler>,
    shutdown: Arc<AtomicBool>,
    session: Mutex<Option<Session>>,
}

impl MqttUploader {
    pub fn new(
        cfg: SessionCfg,
        data_topic: String,
        state: SharedConnection,
        handler: Arc<dyn ControlHandler>,
    ) -> Self {
        Self {
            cfg,
            data_topic,
            state,
            handler,
            shutdown: Arc::new(AtomicBool::new(false)),
            session: Mutex::new(None),
        }
    }

    pub fn connection(&self) -> ConnectionState {
        self.state.snapshot()
    }

    fn lock_session(&self) -> MutexGuard<'_, Option<Session>> {
        self.session
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn open_session(&self) -> Session {
        let mut opts = MqttOptions::new(self.cfg.client_id.clone(), self.cfg.host.clone(), self.cfg.port);
        opts.set_keep_alive(self.cfg.keep_alive);
        opts.set_clean_session(true);
        if !self.cfg.username.is_empty() {
            opts.set_credentials(
                self.cfg.username.clone(),
                self.cfg.password.clone().unwrap_or_default(),
            );
        }
        let (client, connection) = Client::new(opts, 16);
        let (ev_tx, ev_rx) = xch::unbounded();
        let (stop_tx, stop_rx) = xch::bounded::<()>(0);
        let (done_tx, done_rx) = xch::bounded::<()>(1);

        let worker = SessionWorker {
            client: client.clone(),
            state: self.state.clone(),
            handler: self.handler.clone(),
            events: ev_tx,
            stop: stop_rx,
            shutdown: self.shutdown.clone(),
            backoff: self.cfg.reconnect_backoff,
        };
        let join_handle = std::thread::Builder::new()
            .name("relay-session".into())
            .spawn(move || {
                worker.run(connection);
                let _ = done_tx.send(());
            });
        let join_handle = match join_handle {
            Ok(h) => Some(h),
            Err(e) => {
                tracing::error!(error = %e, "failed to spawn session thread");
                None
            }
        };

        Session {
            client,
            events: ev_rx,
            tracker: AckTracker::default(),
            stop: stop_tx,
            done: done_rx,
            join_handle,
        }
    }

    /// Disconnect and join the session thread, waiting at most the grace
    /// period before abandoning it.
    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::Relaxed);
        let Some(mut session) = self.lock_session().take() else {
            return;
        };
        let _ = session.client.try_disconnect();
        drop(session.stop);
        match session.done.recv_timeout(self.cfg.shutdown_grace) {
            Ok(()) => {
                if let Some(h) = session.join_handle.take()
                    && h.join().is_err()
                {
                    tracing::warn!("session thread panicked during shutdown");
                }
                tracing::debug!("broker session closed");
            }
            Err(_) => {
                tracing::warn!(
                    grace_ms = self.cfg.shutdown_grace.as_millis() as u64,
                    "session thread did not stop in time; abandoning it"
                );
            }
        }
        self.state.update(|s| *s = ConnectionState::default());
    }

    /// Events the session thread has queued but no publish has consumed yet.
    pub fn queued_events(&self) -> usize {
        self.lock_session().as_ref().map_or(0, |s| s.events.len())
    }

    /// Confirmed QoS 1 publish of an arbitrary payload. `publish` sends
    /// records to the data topic through this.
    pub fn publish_to(&self, topic: &str, payload: Vec<u8>) -> Delivery {
        let mut guard = self.lock_session();
        let Some(session) = guard.as_mut() else {
            return Delivery::Failed("no broker session".into());
        };
        session.pump();
        if !self.state.snapshot().connected {
            return Delivery::Failed("not connected".into());
        }

        if let Err(e) = session.client.try_publish(topic, QoS::AtLeastOnce, false, payload) {
            return Delivery::Failed(format!("publish rejected: {e}"));
        }
        session.tracker.begin();

        let deadline = Instant::now() + self.cfg.confirm_timeout;
        loop {
            let left = deadline.saturating_duration_since(Instant::now());
            if left.is_zero() {
                session.tracker.abandon();
                return Delivery::Timeout;
            }
            match session.events.recv_timeout(left) {
                Ok(ev) => {
                    if let Some(verdict) = session.tracker.observe(ev) {
                        return verdict;
                    }
                }
                Err(xch::RecvTimeoutError::Timeout) => {
                    session.tracker.abandon();
                    return Delivery::Timeout;
                }
                Err(xch::RecvTimeoutError::Disconnected) => {
                    session.tracker.abandon();
                    return Delivery::Failed("session thread gone".into());
                }
            }
        }
    }
}

/// Resolve the broker address once. Used at startup, where an unresolvable
/// broker on a working network is a setup error rather than an outage.
pub fn resolve_broker(cfg: &SessionCfg) -> Result<std::net::SocketAddr, RelayError> {
    use std::net::ToSocketAddrs;
    (cfg.host.as_str(), cfg.port)
        .to_socket_addrs()
        .map_err(|e| RelayError::Setup(format!("cannot resolve broker {}:{}: {e}", cfg.host, cfg.port)))?
        .next()
        .ok_or_else(|| RelayError::Setup(format!("broker {} has no addresses", cfg.host)))
}

impl Drop for MqttUploader {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl Upload for MqttUploader {
    fn ensure_connected(&self) -> bool {
        let mut guard = self.lock_session();
        if let Some(session) = guard.as_mut() {
            // The session thread owns reconnection.
            session.pump();
            return self.state.snapshot().connected;
        }
        if self.shutdown.load(Ordering::Relaxed) {
            return false;
        }
        tracing::info!(host = %self.cfg.host, port = self.cfg.port, "opening broker session");
        let mut session = self.open_session();
        let deadline = Instant::now() + self.cfg.connect_timeout;
        let mut connected = false;
        while !connected {
            let left = deadline.saturating_duration_since(Instant::now());
            if left.is_zero() {
                break;
            }
            match session.events.recv_timeout(left) {
                Ok(SessionEvent::Connected) => connected = true,
                Ok(ev) => {
                    let _ = session.tracker.observe(ev);
                }
                Err(_) => break,
            }
        }
        if !connected {
            tracing::warn!(
                timeout_ms = self.cfg.connect_timeout.as_millis() as u64,
                "broker not connected yet; will retry in background"
            );
        }
        *guard = Some(session);
        connected
    }

    fn publish(&self, record: &SensorRecord) -> Delivery {
        self.publish_to(&self.data_topic, record.to_payload().to_string().into_bytes())
    }
}

struct SessionWorker {
    client: Client,
    state: SharedConnection,
    handler: Arc<dyn ControlHandler>,
    events: xch::Sender<SessionEvent>,
    stop: xch::Receiver<()>,
    shutdown: Arc<AtomicBool>,
    backoff: Duration,
}

impl SessionWorker {
    fn run(self, mut connection: Connection) {
        let mut failures = 0u32;
        for notification in connection.iter() {
            if self.shutdown.load(Ordering::Relaxed) {
                break;
            }
            match notification {
                Ok(Event::Incoming(Packet::ConnAck(_))) => {
                    failures = 0;
                    self.state.update(|s| {
                        s.connected = true;
                        s.session_ready = false;
                    });
                    tracing::info!("broker connection established");
                    for topic in self.handler.subscriptions() {
                        if let Err(e) = self.client.try_subscribe(topic.as_str(), QoS::AtLeastOnce) {
                            tracing::warn!(%topic, error = %e, "control subscribe failed");
                        }
                    }
                    let _ = self.events.send(SessionEvent::Connected);
                }
                Ok(Event::Incoming(Packet::SubAck(_))) => {
                    self.state.update(|s| s.session_ready = true);
                }
                Ok(Event::Incoming(Packet::PubAck(ack))) => {
                    let _ = self.events.send(SessionEvent::Acked(ack.pkid));
                }
                Ok(Event::Incoming(Packet::Publish(msg))) => {
                    let sink = ClientStatusSink(&self.client);
                    self.handler.on_message(&msg.topic, &msg.payload, &sink);
                }
                Ok(Event::Outgoing(Outgoing::Publish(pkid))) if pkid != 0 => {
                    let _ = self.events.send(SessionEvent::Sent(pkid));
                }
                Ok(Event::Outgoing(Outgoing::Disconnect)) => {
                    tracing::debug!("disconnect sent");
                }
                Ok(_) => {}
                Err(e) => {
                    let was_connected = self.state.snapshot().connected;
                    self.state.update(|s| *s = ConnectionState::default());
                    if was_connected {
                        // Only a live connection can have a publish waiting on it.
                        let _ = self.events.send(SessionEvent::Disconnected(e.to_string()));
                        tracing::warn!(error = %e, "broker connection lost");
                    } else if failures == 0 {
                        tracing::warn!(error = %e, "broker connection failed");
                    } else {
                        tracing::debug!(error = %e, failures, "broker reconnect failed");
                    }
                    failures = failures.saturating_add(1);
                    // Interruptible backoff: the stop channel closes at shutdown.
                    if !matches!(
                        self.stop.recv_timeout(self.backoff),
                        Err(xch::RecvTimeoutError::Timeout)
                    ) {
                        break;
                    }
                }
            }
        }
        self.state.update(|s| *s = ConnectionState::default());
        tracing::trace!("session thread exiting cleanly");
    }
}
