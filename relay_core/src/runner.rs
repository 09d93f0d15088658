//! Fixed-cadence tick loop.
//!
//! Each tick reads the control state once, samples when collecting, and
//! hands the record (or `None`) to the dispatcher. Ticks are paced against
//! absolute deadlines so a slow upload shortens the next wait instead of
//! shifting the schedule; a tick that overruns its whole period starts the
//! next one immediately.

use crate::config::TickCfg;
use crate::control::{ControlState, RunState};
use crate::dispatcher::Dispatcher;
use crate::hw_error::map_hw_error;
use crate::record::{RecordSchema, SensorRecord};
use crate::uploader::Upload;
use chrono::Utc;
use relay_traits::clock::Clock;
use relay_traits::{Probe, SampleSource};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

/// Longest uninterrupted sleep, so shutdown is noticed promptly.
const SLEEP_SLICE: Duration = Duration::from_millis(100);

pub struct TickLoop<S: SampleSource, C: Clock> {
    source: S,
    clock: C,
    cfg: TickCfg,
    schema: RecordSchema,
    control: ControlState,
    was_paused: bool,
}

impl<S: SampleSource, C: Clock> TickLoop<S, C> {
    pub fn new(source: S, clock: C, cfg: TickCfg, schema: RecordSchema, control: ControlState) -> Self {
        Self {
            source,
            clock,
            cfg,
            schema,
            control,
            was_paused: false,
        }
    }

    /// Take one sample and stamp it. Acquisition failures are logged and
    /// yield `None`.
    pub fn sample(&mut self) -> Option<SensorRecord> {
        let values = match self.source.read(self.cfg.sample_timeout) {
            Ok(v) => v,
            Err(e) => {
                let err = map_hw_error(e.as_ref());
                tracing::warn!(error = %err, "sample acquisition failed; skipping tick");
                return None;
            }
        };
        match self.schema.record(values, Utc::now()) {
            Ok(r) => Some(r),
            Err(e) => {
                tracing::warn!(error = %e, "sample does not match channel layout; skipping tick");
                None
            }
        }
    }

    /// One tick, without pacing.
    pub fn tick<P: Probe, U: Upload + 'static>(&mut self, dispatcher: &mut Dispatcher<P, U>) -> crate::status::TickOutcome {
        let paused = self.control.run_state() == RunState::Paused;
        if paused != self.was_paused {
            tracing::info!(paused, "tick loop observed control change");
            self.was_paused = paused;
        }
        let record = if paused { None } else { self.sample() };
        dispatcher.process_tick(record)
    }

    /// Tick until `shutdown` is set or `max_ticks` ticks have run. Returns
    /// the number of ticks run.
    pub fn run<P: Probe, U: Upload + 'static>(
        &mut self,
        dispatcher: &mut Dispatcher<P, U>,
        shutdown: &AtomicBool,
        max_ticks: Option<u64>,
    ) -> u64 {
        let period = self.cfg.period;
        tracing::info!(
            period_ms = period.as_millis() as u64,
            channels = ?self.schema.fields,
            "tick loop start"
        );
        let mut ticks = 0u64;
        let mut deadline = self.clock.now();
        while !shutdown.load(Ordering::Relaxed) && max_ticks.is_none_or(|m| ticks < m) {
            let outcome = self.tick(dispatcher);
            ticks += 1;
            tracing::trace!(tick = ticks, ?outcome, "tick done");

            deadline += period;
            let now = self.clock.now();
            if now > deadline {
                tracing::debug!(
                    overrun_ms = (now - deadline).as_millis() as u64,
                    "tick overran its period"
                );
                deadline = now;
                continue;
            }
            self.pace(deadline, shutdown);
        }
        tracing::info!(ticks, "tick loop stop");
        ticks
    }

    fn pace(&self, deadline: std::time::Instant, shutdown: &AtomicBool) {
        loop {
            if shutdown.load(Ordering::Relaxed) {
                return;
            }
            let left = self.clock.until(deadline);
            if left.is_zero() {
                return;
            }
            self.clock.sleep(left.min(SLEEP_SLICE));
        }
    }
}
