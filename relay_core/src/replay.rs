//! Background backlog drain.
//!
//! One worker thread per process. `trigger` never blocks: triggers that
//! arrive while a pass is queued collapse into that pass. Dropping the worker
//! cancels the current pass (unattempted rows stay in the ledger) and joins
//! the thread.

use crate::ledger::{Ledger, ReplayOptions};
use crate::uploader::Upload;
use crossbeam_channel as xch;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

pub struct ReplayWorker {
    tx: Option<xch::Sender<()>>,
    cancel: Arc<AtomicBool>,
    passes: Arc<AtomicU64>,
    join_handle: Option<JoinHandle<()>>,
}

impl ReplayWorker {
    pub fn spawn<U: Upload + 'static>(
        ledger: Arc<Ledger>,
        uploader: Arc<U>,
        max_consecutive_failures: u32,
    ) -> Self {
        let (tx, rx) = xch::bounded::<()>(1);
        let cancel = Arc::new(AtomicBool::new(false));
        let passes = Arc::new(AtomicU64::new(0));
        let opts = ReplayOptions {
            max_consecutive_failures,
            cancel: Some(cancel.clone()),
        };
        let passes_clone = passes.clone();

        let join_handle = std::thread::Builder::new()
            .name("relay-replay".into())
            .spawn(move || {
                // Ends when the sender is dropped.
                for () in rx.iter() {
                    if opts.cancel.as_ref().is_some_and(|c| c.load(Ordering::Relaxed)) {
                        break;
                    }
                    run_pass(&ledger, uploader.as_ref(), &opts);
                    passes_clone.fetch_add(1, Ordering::Relaxed);
                }
                tracing::trace!("replay worker exiting cleanly");
            });
        let join_handle = match join_handle {
            Ok(h) => Some(h),
            Err(e) => {
                tracing::error!(error = %e, "failed to spawn replay worker; backlog drains on restart only");
                None
            }
        };

        Self {
            tx: Some(tx),
            cancel,
            passes,
            join_handle,
        }
    }

    /// Request a pass. Returns false when a pass is already queued.
    pub fn trigger(&self) -> bool {
        self.tx.as_ref().is_some_and(|tx| tx.try_send(()).is_ok())
    }

    /// Completed passes so far.
    pub fn passes(&self) -> u64 {
        self.passes.load(Ordering::Relaxed)
    }
}

/// One replay pass; the outcome is only logged.
pub(crate) fn run_pass<U: Upload + ?Sized>(ledger: &Ledger, uploader: &U, opts: &ReplayOptions) {
    match ledger.replay(opts, |r| uploader.publish(r)) {
        Ok(summary) => summary.log(),
        Err(e) => tracing::error!(error = %e, "backlog replay failed"),
    }
}

impl Drop for ReplayWorker {
    fn drop(&mut self) {
        self.cancel.store(true, Ordering::Relaxed);
        drop(self.tx.take());
        if let Some(handle) = self.join_handle.take() {
            match handle.join() {
                Ok(()) => tracing::trace!("replay worker joined"),
                Err(e) => tracing::warn!(?e, "replay worker panicked during shutdown"),
            }
        }
    }
}
