//! `From` implementations bridging `relay_config` types to `relay_core` types.

use crate::config::{NodeIdentity, ProbeCfg, SessionCfg, TickCfg};
use crate::ledger::ReplayOptions;
use std::time::Duration;

impl From<&relay_config::NodeCfg> for NodeIdentity {
    fn from(c: &relay_config::NodeCfg) -> Self {
        Self {
            node: c.id.clone(),
            location: c.location.clone(),
        }
    }
}

// ── SessionCfg ───────────────────────────────────────────────────────────────

/// Needs the whole config: the default client id derives from the node.
impl From<&relay_config::Config> for SessionCfg {
    fn from(c: &relay_config::Config) -> Self {
        let b = &c.broker;
        Self {
            host: b.host.clone(),
            port: b.port,
            client_id: c.client_id(),
            username: b.username.clone(),
            password: b.password.clone(),
            keep_alive: Duration::from_secs(b.keep_alive_s),
            connect_timeout: Duration::from_millis(b.connect_timeout_ms),
            confirm_timeout: Duration::from_millis(b.confirm_timeout_ms),
            reconnect_backoff: Duration::from_millis(b.reconnect_backoff_ms),
            shutdown_grace: Duration::from_millis(b.shutdown_grace_ms),
        }
    }
}

// ── ProbeCfg ─────────────────────────────────────────────────────────────────

impl From<&relay_config::ProbeCfg> for ProbeCfg {
    fn from(c: &relay_config::ProbeCfg) -> Self {
        Self {
            target: c.target.clone(),
            timeout: Duration::from_millis(c.timeout_ms),
        }
    }
}

// ── TickCfg ──────────────────────────────────────────────────────────────────

impl From<&relay_config::TimingCfg> for TickCfg {
    fn from(c: &relay_config::TimingCfg) -> Self {
        Self {
            period: Duration::from_millis(c.tick_ms),
            sample_timeout: Duration::from_millis(c.sample_timeout_ms),
        }
    }
}

// ── ReplayOptions ────────────────────────────────────────────────────────────

impl From<&relay_config::ReplayCfg> for ReplayOptions {
    fn from(c: &relay_config::ReplayCfg) -> Self {
        Self {
            max_consecutive_failures: c.max_consecutive_failures,
            cancel: None,
        }
    }
}
