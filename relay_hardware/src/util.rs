use std::time::{Duration, Instant};

use crate::error::{HwError, Result};

/// Poll `is_ready` until it returns true or `timeout` expires.
/// Sleeps `poll_interval` between polls; errors from the predicate end the wait.
pub fn wait_until_ready(
    mut is_ready: impl FnMut() -> Result<bool>,
    timeout: Duration,
    poll_interval: Duration,
) -> Result<()> {
    let deadline = Instant::now() + timeout;
    while !is_ready()? {
        if Instant::now() >= deadline {
            return Err(HwError::ConversionTimeout);
        }
        std::thread::sleep(poll_interval);
    }
    Ok(())
}

/// Round to three decimals, the precision the node reports.
#[inline]
pub fn round3(x: f64) -> f64 {
    (x * 1000.0).round() / 1000.0
}
