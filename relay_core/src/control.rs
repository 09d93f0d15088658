//! Remote start/stop of data collection.
//!
//! Commands arrive on `ctl/{location}/thi` (whole group) or
//! `ctl/{location}/thi/{node}` (this node). After each handled command the
//! node answers on `log/{location}/thi/{node}` with `"true"` when paused and
//! `"false"` when collecting.

use crate::topics::Topics;
use std::sync::{Arc, Mutex, MutexGuard};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Collecting,
    Paused,
}

impl RunState {
    /// Status payload: whether collection is paused.
    pub fn status_payload(self) -> &'static str {
        match self {
            Self::Collecting => "false",
            Self::Paused => "true",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Start,
    Stop,
}

impl Command {
    pub fn parse(payload: &[u8]) -> Option<Self> {
        match std::str::from_utf8(payload).ok()?.trim() {
            "start" => Some(Self::Start),
            "stop" => Some(Self::Stop),
            _ => None,
        }
    }

    pub fn payload(self) -> &'static str {
        match self {
            Self::Start => "start",
            Self::Stop => "stop",
        }
    }
}

#[derive(Debug, Default)]
struct ControlFlags {
    paused: bool,
}

/// Pause flag shared by the tick loop and the control handler.
///
/// Starts in `Collecting`.
#[derive(Debug, Clone, Default)]
pub struct ControlState(Arc<Mutex<ControlFlags>>);

impl ControlState {
    fn lock(&self) -> MutexGuard<'_, ControlFlags> {
        self.0.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    pub fn run_state(&self) -> RunState {
        if self.lock().paused {
            RunState::Paused
        } else {
            RunState::Collecting
        }
    }

    /// Apply a command; returns the previous and the new state.
    pub fn apply(&self, cmd: Command) -> (RunState, RunState) {
        let mut flags = self.lock();
        let before = if flags.paused {
            RunState::Paused
        } else {
            RunState::Collecting
        };
        flags.paused = cmd == Command::Stop;
        let after = if flags.paused {
            RunState::Paused
        } else {
            RunState::Collecting
        };
        (before, after)
    }
}

/// Where status replies go. Must not block on the network.
pub trait StatusSink {
    fn publish_status(&self, topic: &str, payload: &str) -> bool;
}

/// Receives broker messages on the session thread.
pub trait ControlHandler: Send + Sync {
    /// Topics to subscribe on every new connection.
    fn subscriptions(&self) -> Vec<String>;

    fn on_message(&self, topic: &str, payload: &[u8], sink: &dyn StatusSink);
}

pub struct ControlChannel {
    topics: Topics,
    state: ControlState,
}

impl ControlChannel {
    pub fn new(topics: Topics, state: ControlState) -> Self {
        Self { topics, state }
    }

    pub fn state(&self) -> &ControlState {
        &self.state
    }

    /// Handle one control message; returns the resulting state if it was a
    /// command for this node.
    pub fn handle(&self, topic: &str, payload: &[u8], sink: &dyn StatusSink) -> Option<RunState> {
        if topic != self.topics.control_group && topic != self.topics.control_node {
            tracing::debug!(topic, "ignoring message on unrelated topic");
            return None;
        }
        let Some(cmd) = Command::parse(payload) else {
            tracing::warn!(
                topic,
                payload = %String::from_utf8_lossy(payload),
                "ignoring unknown control command"
            );
            return None;
        };
        let (before, after) = self.state.apply(cmd);
        if before == after {
            tracing::info!(?cmd, state = ?after, "control command (no change)");
        } else {
            tracing::info!(?cmd, from = ?before, to = ?after, "collection state changed");
        }
        if !sink.publish_status(&self.topics.status, after.status_payload()) {
            tracing::warn!(topic = %self.topics.status, "status reply not sent");
        }
        Some(after)
    }
}

impl ControlHandler for ControlChannel {
    fn subscriptions(&self) -> Vec<String> {
        vec![
            self.topics.control_group.clone(),
            self.topics.control_node.clone(),
        ]
    }

    fn on_message(&self, topic: &str, payload: &[u8], sink: &dyn StatusSink) {
        self.handle(topic, payload, sink);
    }
}
