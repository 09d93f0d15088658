//! Maps `Box<dyn Error>` from the sensor trait boundary to typed `RelayError`.
//!
//! `relay_traits::SampleSource` returns boxed errors; this module converts
//! them to our error enum, with an optional feature-gated path for
//! `relay_hardware::HwError` downcasting.

use crate::error::RelayError;

/// Map a trait-boundary error to a typed `RelayError`.
///
/// Attempts to downcast known hardware error types first, then falls back
/// to string-based heuristics.
pub fn map_hw_error(e: &(dyn std::error::Error + 'static)) -> RelayError {
    #[cfg(feature = "hardware-errors")]
    {
        use relay_hardware::error::HwError;
        if let Some(hw) = e.downcast_ref::<HwError>() {
            return match hw {
                HwError::Timeout | HwError::ConversionTimeout => RelayError::Timeout,
                other => RelayError::Sensor(other.to_string()),
            };
        }
    }

    let s = e.to_string();
    if s.to_lowercase().contains("timeout") {
        RelayError::Timeout
    } else {
        RelayError::Sensor(s)
    }
}
