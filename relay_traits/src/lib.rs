//! Seams between the uploader core and the node's hardware and network.
//!
//! Everything the core touches outside of its own files goes through one of
//! these traits so the dispatch logic can be driven by simulations in tests.
pub mod clock;

pub use clock::{Clock, MonotonicClock};

/// Boxed error used at the hardware trait boundary.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// A sensor front end that yields one reading per channel on every call.
pub trait SampleSource {
    /// Channel names, in the order `read` returns values.
    fn channels(&self) -> Vec<String>;

    /// Read all channels. `None` marks a single channel that failed while the
    /// others still produced a value.
    fn read(&mut self, timeout: std::time::Duration) -> Result<Vec<Option<f64>>, BoxError>;
}

/// Converts a raw analog signal (volts) into a gas concentration (ppm).
///
/// Implementations are pure; one per sensor model.
pub trait GasModel {
    fn concentration(&self, volts: f64) -> f64;
}

/// Reachability check. Never errors; any failure is `false`.
pub trait Probe {
    fn reachable(&self) -> bool;
}

impl<P: Probe + ?Sized> Probe for Box<P> {
    fn reachable(&self) -> bool {
        (**self).reachable()
    }
}

impl<S: SampleSource + ?Sized> SampleSource for Box<S> {
    fn channels(&self) -> Vec<String> {
        (**self).channels()
    }

    fn read(&mut self, timeout: std::time::Duration) -> Result<Vec<Option<f64>>, BoxError> {
        (**self).read(timeout)
    }
}
