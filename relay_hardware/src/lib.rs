//! Sensor front ends for the relay node.
//!
//! The simulated source is always available; the real methane stack
//! (ADS1115 + TGS2611, MH-T7042A) is compiled with the `hardware` feature.
pub mod ads1115;
pub mod error;
pub mod gas;
pub mod mht7042a;
pub mod util;

use relay_traits::{BoxError, SampleSource};
use std::time::Duration;

pub use gas::{Mq4, Tgs2611};

/// Channel names reported by the methane stack, in read order.
pub const METHANE_CHANNELS: [&str; 3] = ["TGS", "TGS_voltage", "MH_T7042A"];

/// Deterministic synthetic source.
///
/// Each channel follows its own slow sawtooth so consecutive samples differ.
/// `RELAY_TEST_SIM_FAIL_EVERY=N` makes every Nth read fail, which drives the
/// "acquisition failed" path in tests.
pub struct SimulatedSource {
    channels: Vec<String>,
    tick: u64,
    fail_every: Option<u64>,
}

impl SimulatedSource {
    pub fn new(channels: Vec<String>) -> Self {
        let fail_every = std::env::var("RELAY_TEST_SIM_FAIL_EVERY")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .filter(|n| *n > 0);
        Self {
            channels,
            tick: 0,
            fail_every,
        }
    }

    pub fn fail_every(mut self, n: u64) -> Self {
        self.fail_every = (n > 0).then_some(n);
        self
    }
}

impl SampleSource for SimulatedSource {
    fn channels(&self) -> Vec<String> {
        self.channels.clone()
    }

    fn read(&mut self, _timeout: Duration) -> Result<Vec<Option<f64>>, BoxError> {
        self.tick += 1;
        if let Some(n) = self.fail_every
            && self.tick % n == 0
        {
            return Err(Box::new(error::HwError::Timeout));
        }
        let values = (0..self.channels.len())
            .map(|i| {
                let base = 2.0 + i as f64;
                let phase = ((self.tick + i as u64 * 7) % 50) as f64 / 50.0;
                Some(util::round3(base + phase))
            })
            .collect();
        Ok(values)
    }
}

/// TGS2611 on an ADS1115 input plus an MH-T7042A on the UART.
///
/// A failed TGS read fails the sample; a failed MH-T7042A read only blanks
/// its channel.
#[cfg(feature = "hardware")]
pub struct MethaneSource {
    adc: ads1115::Ads1115,
    adc_input: u8,
    tgs: Tgs2611,
    mht: mht7042a::Mht7042a,
}

#[cfg(feature = "hardware")]
impl MethaneSource {
    pub fn open(
        adc_input: u8,
        tgs_r0: f64,
        uart_path: &std::path::Path,
        timeout: Duration,
    ) -> error::Result<Self> {
        let adc = ads1115::Ads1115::open(ads1115::DEFAULT_ADDRESS)?;
        let mht = mht7042a::Mht7042a::open(uart_path, timeout)?;
        Ok(Self {
            adc,
            adc_input,
            tgs: Tgs2611::new(tgs_r0),
            mht,
        })
    }
}

#[cfg(feature = "hardware")]
impl SampleSource for MethaneSource {
    fn channels(&self) -> Vec<String> {
        METHANE_CHANNELS.iter().map(|s| s.to_string()).collect()
    }

    fn read(&mut self, timeout: Duration) -> Result<Vec<Option<f64>>, BoxError> {
        use relay_traits::GasModel;
        let volts = self.adc.read_volts(self.adc_input, timeout)?;
        let ppm = self.tgs.concentration(volts);
        let tgs = ppm.is_finite().then(|| util::round3(ppm));
        let mht = match self.mht.read_ppm() {
            Ok(v) => Some(f64::from(v)),
            Err(e) => {
                tracing::warn!(error = %e, "MH-T7042A read failed");
                None
            }
        };
        Ok(vec![tgs, Some(util::round3(volts)), mht])
    }
}
