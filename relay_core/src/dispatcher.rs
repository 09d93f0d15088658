//! Per-tick orchestration: log always, then upload or buffer.

use crate::daily_log::DailyLog;
use crate::ledger::{Ledger, ReplayOptions};
use crate::record::SensorRecord;
use crate::replay::{ReplayWorker, run_pass};
use crate::status::{BufferReason, TickOutcome};
use crate::uploader::{Delivery, Upload};
use relay_traits::Probe;
use std::sync::Arc;

/// How the backlog is drained after a successful delivery.
pub enum Replay {
    /// On the tick path; bounded by the failure streak limit.
    Inline(ReplayOptions),
    /// Handed to a background worker.
    Background(ReplayWorker),
}

/// Counters for one run, reported at shutdown.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TickStats {
    pub ticks: u64,
    pub skipped: u64,
    pub dropped: u64,
    pub buffered: u64,
    pub delivered: u64,
    pub lost: u64,
    pub replays_triggered: u64,
}

impl TickStats {
    fn count(&mut self, outcome: TickOutcome) {
        self.ticks += 1;
        match outcome {
            TickOutcome::Skipped => self.skipped += 1,
            TickOutcome::Dropped => self.dropped += 1,
            TickOutcome::Buffered(_) => self.buffered += 1,
            TickOutcome::Delivered => self.delivered += 1,
            TickOutcome::Lost => self.lost += 1,
        }
    }
}

pub struct Dispatcher<P: Probe, U: Upload + 'static> {
    daily: DailyLog,
    ledger: Arc<Ledger>,
    probe: P,
    uploader: Arc<U>,
    replay: Replay,
    /// Last probe verdict, for logging transitions once.
    online: Option<bool>,
    stats: TickStats,
}

impl<P: Probe, U: Upload + 'static> Dispatcher<P, U> {
    pub fn new(daily: DailyLog, ledger: Arc<Ledger>, probe: P, uploader: Arc<U>, replay: Replay) -> Self {
        Self {
            daily,
            ledger,
            probe,
            uploader,
            replay,
            online: None,
            stats: TickStats::default(),
        }
    }

    /// Spawn a background replay worker sharing this dispatcher's ledger and
    /// uploader.
    pub fn with_background_replay(
        daily: DailyLog,
        ledger: Arc<Ledger>,
        probe: P,
        uploader: Arc<U>,
        max_consecutive_failures: u32,
    ) -> Self {
        let worker = ReplayWorker::spawn(ledger.clone(), uploader.clone(), max_consecutive_failures);
        Self::new(daily, ledger, probe, uploader, Replay::Background(worker))
    }

    pub fn stats(&self) -> &TickStats {
        &self.stats
    }

    pub fn ledger(&self) -> &Ledger {
        &self.ledger
    }

    pub fn uploader(&self) -> &U {
        &self.uploader
    }

    /// Handle one tick's record. Never fails; every failure is folded into
    /// the returned outcome.
    pub fn process_tick(&mut self, record: Option<SensorRecord>) -> TickOutcome {
        let outcome = self.dispatch(record);
        self.stats.count(outcome);
        outcome
    }

    fn dispatch(&mut self, record: Option<SensorRecord>) -> TickOutcome {
        let Some(record) = record else {
            return TickOutcome::Skipped;
        };

        if let Err(e) = self.daily.append(&record) {
            tracing::error!(error = %e, timestamp = %record.timestamp_str(), "daily log write failed; record dropped");
            return TickOutcome::Dropped;
        }

        let reachable = self.probe.reachable();
        self.note_connectivity(reachable);
        if !reachable {
            return self.buffer(&record, BufferReason::Offline);
        }
        if !self.uploader.ensure_connected() {
            return self.buffer(&record, BufferReason::NotConnected);
        }

        match self.uploader.publish(&record) {
            Delivery::Confirmed => {
                tracing::debug!(timestamp = %record.timestamp_str(), "record delivered");
                if !self.ledger.is_empty() {
                    self.drain_backlog();
                }
                TickOutcome::Delivered
            }
            Delivery::Failed(reason) => {
                tracing::warn!(%reason, "publish failed; buffering");
                self.buffer(&record, BufferReason::Failed)
            }
            Delivery::Timeout => {
                tracing::warn!("publish not confirmed in time; buffering");
                self.buffer(&record, BufferReason::Timeout)
            }
        }
    }

    fn buffer(&self, record: &SensorRecord, reason: BufferReason) -> TickOutcome {
        match self.ledger.append(record) {
            Ok(()) => {
                tracing::debug!(?reason, timestamp = %record.timestamp_str(), "record buffered");
                TickOutcome::Buffered(reason)
            }
            Err(e) => {
                tracing::error!(error = %e, ?reason, timestamp = %record.timestamp_str(), "backlog write failed; record lost to upload");
                TickOutcome::Lost
            }
        }
    }

    fn drain_backlog(&mut self) {
        self.stats.replays_triggered += 1;
        match &self.replay {
            Replay::Inline(opts) => {
                run_pass(&self.ledger, self.uploader.as_ref(), opts);
            }
            Replay::Background(worker) => {
                if !worker.trigger() {
                    tracing::trace!("backlog replay already queued");
                }
            }
        }
    }

    fn note_connectivity(&mut self, reachable: bool) {
        match (self.online, reachable) {
            (Some(true), false) => tracing::warn!("connectivity lost; buffering records"),
            (Some(false), true) => tracing::info!("connectivity regained"),
            (None, false) => tracing::warn!("starting offline; buffering records"),
            _ => {}
        }
        self.online = Some(reachable);
    }
}
