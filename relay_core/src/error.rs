use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum RelayError {
    #[error("sensor error: {0}")]
    Sensor(String),
    #[error("timeout waiting for sensor")]
    Timeout,
    #[error("storage error: {0}")]
    Storage(String),
    #[error("malformed record: {0}")]
    Malformed(String),
    #[error("transport error: {0}")]
    Transport(String),
    #[error("setup error: {0}")]
    Setup(String),
    #[error("configuration error: {0}")]
    Config(String),
}

impl RelayError {
    pub fn storage(context: impl std::fmt::Display, err: impl std::fmt::Display) -> Self {
        Self::Storage(format!("{context}: {err}"))
    }
}

pub type Result<T> = eyre::Result<T>;
pub use eyre::Report;
