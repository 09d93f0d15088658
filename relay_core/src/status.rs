//! What happened to the record of one tick.

/// Why a record went to the backlog instead of the broker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferReason {
    /// Probe said the network is down; no publish attempted.
    Offline,
    /// Network up but no broker session.
    NotConnected,
    /// Broker or transport refused the publish.
    Failed,
    /// No confirmation in time.
    Timeout,
}

/// Public outcome of a single dispatcher tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    /// No record this tick (paused or acquisition failed).
    Skipped,
    /// Daily log write failed; the record was discarded.
    Dropped,
    /// Logged and stored in the backlog for later replay.
    Buffered(BufferReason),
    /// Logged and confirmed by the broker.
    Delivered,
    /// Logged, not delivered, and the backlog write failed.
    Lost,
}

impl TickOutcome {
    pub fn delivered(self) -> bool {
        self == Self::Delivered
    }
}
