//! MH-T7042A infrared methane sensor on a 9600 8N1 UART.
//!
//! Request and response are 9-byte frames. Byte 8 is the two's complement of
//! the sum of bytes 1..=7.

use crate::error::{HwError, Result};

pub const FRAME_LEN: usize = 9;

/// "Read gas concentration" request.
pub const READ_CMD: [u8; FRAME_LEN] = [0xFF, 0x01, 0x86, 0x00, 0x00, 0x00, 0x00, 0x00, 0x79];

pub fn checksum(frame: &[u8]) -> u8 {
    let sum = frame[1..FRAME_LEN - 1]
        .iter()
        .fold(0u8, |acc, b| acc.wrapping_add(*b));
    (!sum).wrapping_add(1)
}

/// Decode a concentration response into ppm.
pub fn decode_response(frame: &[u8]) -> Result<u16> {
    if frame.len() != FRAME_LEN {
        return Err(HwError::BadFrame(format!(
            "expected {FRAME_LEN} bytes, got {}",
            frame.len()
        )));
    }
    if frame[0] != 0xFF || frame[1] != 0x86 {
        return Err(HwError::BadFrame(format!(
            "unexpected header {:#04x} {:#04x}",
            frame[0], frame[1]
        )));
    }
    let want = checksum(frame);
    if frame[FRAME_LEN - 1] != want {
        return Err(HwError::BadFrame(format!(
            "checksum {:#04x} != {want:#04x}",
            frame[FRAME_LEN - 1]
        )));
    }
    Ok(u16::from_be_bytes([frame[2], frame[3]]))
}

#[cfg(feature = "hardware")]
pub struct Mht7042a {
    uart: rppal::uart::Uart,
}

#[cfg(feature = "hardware")]
impl Mht7042a {
    pub fn open(path: &std::path::Path, timeout: std::time::Duration) -> Result<Self> {
        use rppal::uart::{Parity, Uart};
        let mut uart = Uart::with_path(path, 9600, Parity::None, 8, 1)
            .map_err(|e| HwError::Bus(format!("open uart {}: {e}", path.display())))?;
        uart.set_read_mode(FRAME_LEN as u8, timeout)
            .map_err(|e| HwError::Bus(format!("uart read mode: {e}")))?;
        Ok(Self { uart })
    }

    pub fn read_ppm(&mut self) -> Result<u16> {
        self.uart
            .write(&READ_CMD)
            .map_err(|e| HwError::Bus(format!("uart write: {e}")))?;
        let mut buf = [0u8; FRAME_LEN];
        let n = self
            .uart
            .read(&mut buf)
            .map_err(|e| HwError::Bus(format!("uart read: {e}")))?;
        if n == 0 {
            return Err(HwError::Timeout);
        }
        let ppm = decode_response(&buf[..n])?;
        tracing::trace!(ppm, "mh-t7042a sample");
        Ok(ppm)
    }
}
