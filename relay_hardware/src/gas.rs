//! Gas concentration models for metal-oxide sensors on a 5 V divider.
//!
//! Both models derive the sensing resistance ratio `Rs/R0` from the divider
//! output and map it through a per-model calibration curve. Voltages outside
//! `(0, 5)` V have no physical meaning and yield `NaN`.
use relay_traits::GasModel;

/// Supply voltage of the sensor divider.
pub const SUPPLY_V: f64 = 5.0;

#[inline]
fn resistance_ratio(volts: f64, r0: f64) -> f64 {
    if !(volts > 0.0 && volts < SUPPLY_V) {
        return f64::NAN;
    }
    let rs = SUPPLY_V / volts - 1.0;
    rs / r0
}

/// Figaro TGS2611 methane sensor.
#[derive(Debug, Clone, Copy)]
pub struct Tgs2611 {
    pub r0: f64,
}

impl Tgs2611 {
    /// Curve fitted against a reference analyzer in the field.
    const INTERCEPT: f64 = 1.3877;
    const SLOPE: f64 = -0.2445;

    pub fn new(r0: f64) -> Self {
        Self { r0 }
    }
}

impl Default for Tgs2611 {
    fn default() -> Self {
        Self { r0: 2.94 }
    }
}

impl GasModel for Tgs2611 {
    fn concentration(&self, volts: f64) -> f64 {
        let ratio = resistance_ratio(volts, self.r0);
        10f64.powf((ratio.log10() - Self::INTERCEPT) / Self::SLOPE)
    }
}

/// Hanwei MQ-4 methane sensor.
#[derive(Debug, Clone, Copy)]
pub struct Mq4 {
    pub r0: f64,
}

impl Default for Mq4 {
    fn default() -> Self {
        Self { r0: 8.3 }
    }
}

impl GasModel for Mq4 {
    fn concentration(&self, volts: f64) -> f64 {
        let ratio = resistance_ratio(volts, self.r0);
        1000.0 * ratio.powf(-2.95)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tgs_at_reference_ratio() {
        // Rs/R0 = 10^1.3877 maps to exactly 1 ppm.
        let ratio = 10f64.powf(Tgs2611::INTERCEPT);
        let r0 = 1.0;
        let volts = SUPPLY_V / (ratio * r0 + 1.0);
        let ppm = Tgs2611::new(r0).concentration(volts);
        assert!((ppm - 1.0).abs() < 1e-9, "ppm={ppm}");
    }

    #[test]
    fn higher_voltage_means_more_gas() {
        let m = Tgs2611::new(1.46);
        assert!(m.concentration(2.0) > m.concentration(1.0));
        let q = Mq4::default();
        assert!(q.concentration(2.0) > q.concentration(1.0));
    }

    #[test]
    fn mq4_unit_ratio_is_1000_ppm() {
        let q = Mq4 { r0: 1.0 };
        // Rs = 1 when volts = 2.5
        assert!((q.concentration(2.5) - 1000.0).abs() < 1e-9);
    }

    #[test]
    fn out_of_range_voltage_is_nan() {
        let m = Tgs2611::default();
        assert!(m.concentration(0.0).is_nan());
        assert!(m.concentration(-1.0).is_nan());
        assert!(m.concentration(5.0).is_nan());
    }
}
