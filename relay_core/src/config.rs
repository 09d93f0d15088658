//! Runtime configuration for the relay engine.
//!
//! These are plain structs with `Duration`s, separate from the TOML shape in
//! `relay_config`; see `conversions` for the mapping.

use std::time::Duration;

/// Who this node is.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeIdentity {
    pub node: String,
    pub location: String,
}

/// Broker session settings.
#[derive(Debug, Clone)]
pub struct SessionCfg {
    pub host: String,
    pub port: u16,
    pub client_id: String,
    pub username: String,
    pub password: Option<String>,
    pub keep_alive: Duration,
    /// Wait for CONNACK when a session is first opened.
    pub connect_timeout: Duration,
    /// Wait for PUBACK per publish.
    pub confirm_timeout: Duration,
    /// Pause between reconnect attempts on the session thread.
    pub reconnect_backoff: Duration,
    /// Wait for the session thread at shutdown.
    pub shutdown_grace: Duration,
}

impl Default for SessionCfg {
    fn default() -> Self {
        Self {
            host: "localhost".into(),
            port: 1883,
            client_id: "relay".into(),
            username: String::new(),
            password: None,
            keep_alive: Duration::from_secs(60),
            connect_timeout: Duration::from_secs(3),
            confirm_timeout: Duration::from_secs(5),
            reconnect_backoff: Duration::from_secs(2),
            shutdown_grace: Duration::from_secs(1),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ProbeCfg {
    pub target: String,
    pub timeout: Duration,
}

impl Default for ProbeCfg {
    fn default() -> Self {
        Self {
            target: "8.8.8.8:53".into(),
            timeout: Duration::from_secs(3),
        }
    }
}

/// Tick cadence.
#[derive(Debug, Clone, Copy)]
pub struct TickCfg {
    pub period: Duration,
    /// Max sensor wait per read.
    pub sample_timeout: Duration,
}

impl Default for TickCfg {
    fn default() -> Self {
        Self {
            period: Duration::from_secs(2),
            sample_timeout: Duration::from_secs(1),
        }
    }
}
