use thiserror::Error;

#[derive(Debug, Error)]
pub enum HwError {
    #[error("bus error: {0}")]
    Bus(String),
    #[error("sensor timeout")]
    Timeout,
    #[error("adc conversion timeout")]
    ConversionTimeout,
    #[error("bad frame: {0}")]
    BadFrame(String),
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, HwError>;
