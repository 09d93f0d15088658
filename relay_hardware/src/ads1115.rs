//! ADS1115 16-bit ADC, single-shot reads against GND at gain 1 (±4.096 V).

pub const DEFAULT_ADDRESS: u16 = 0x48;

pub const REG_CONVERSION: u8 = 0x00;
pub const REG_CONFIG: u8 = 0x01;

/// Full-scale range at PGA gain 1.
pub const FULL_SCALE_V: f64 = 4.096;

const OS_START: u16 = 0x8000;
const PGA_4V096: u16 = 0b001 << 9;
const MODE_SINGLE: u16 = 1 << 8;
const DR_128SPS: u16 = 0b100 << 5;
const COMP_DISABLE: u16 = 0b11;

/// Config word that starts one conversion of `input` (0..=3) against GND.
pub fn single_shot_config(input: u8) -> u16 {
    let mux = (0b100 | u16::from(input & 0b11)) << 12;
    OS_START | mux | PGA_4V096 | MODE_SINGLE | DR_128SPS | COMP_DISABLE
}

/// True once the OS bit reads back high (no conversion in progress).
#[inline]
pub fn conversion_done(config: u16) -> bool {
    config & OS_START != 0
}

/// Convert a raw conversion register value to volts.
#[inline]
pub fn raw_to_volts(raw: i16) -> f64 {
    f64::from(raw) * FULL_SCALE_V / 32768.0
}

#[cfg(feature = "hardware")]
pub struct Ads1115 {
    i2c: rppal::i2c::I2c,
}

#[cfg(feature = "hardware")]
use crate::error::Result;

#[cfg(feature = "hardware")]
impl Ads1115 {
    pub fn open(address: u16) -> Result<Self> {
        use crate::error::HwError;
        let mut i2c = rppal::i2c::I2c::new().map_err(|e| HwError::Bus(format!("open i2c: {e}")))?;
        i2c.set_slave_address(address)
            .map_err(|e| HwError::Bus(format!("ads1115 address {address:#x}: {e}")))?;
        Ok(Self { i2c })
    }

    fn read_reg(&mut self, reg: u8) -> Result<u16> {
        let mut buf = [0u8; 2];
        self.i2c
            .block_read(reg, &mut buf)
            .map_err(|e| crate::error::HwError::Bus(format!("ads1115 read: {e}")))?;
        Ok(u16::from_be_bytes(buf))
    }

    /// Run one conversion on `input` and return the voltage.
    pub fn read_volts(&mut self, input: u8, timeout: std::time::Duration) -> Result<f64> {
        let cfg = single_shot_config(input);
        self.i2c
            .block_write(REG_CONFIG, &cfg.to_be_bytes())
            .map_err(|e| crate::error::HwError::Bus(format!("ads1115 write: {e}")))?;
        crate::util::wait_until_ready(
            || Ok(conversion_done(self.read_reg(REG_CONFIG)?)),
            timeout,
            std::time::Duration::from_millis(2),
        )?;
        let raw = self.read_reg(REG_CONVERSION)? as i16;
        let volts = raw_to_volts(raw);
        tracing::trace!(input, raw, volts, "ads1115 sample");
        Ok(volts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_word_for_input_zero() {
        // OS | MUX=100 | PGA=001 | MODE=1 | DR=100 | COMP_QUE=11
        assert_eq!(single_shot_config(0), 0xC383);
        assert_eq!(single_shot_config(1), 0xD383);
        assert_eq!(single_shot_config(3), 0xF383);
    }

    #[test]
    fn raw_scaling() {
        assert_eq!(raw_to_volts(0), 0.0);
        assert!((raw_to_volts(i16::MAX) - FULL_SCALE_V).abs() < 1e-3);
        assert!((raw_to_volts(16384) - 2.048).abs() < 1e-12);
        assert!(raw_to_volts(-100) < 0.0);
    }

    #[test]
    fn os_bit_signals_completion() {
        assert!(conversion_done(0x8583));
        assert!(!conversion_done(0x0583));
    }
}
