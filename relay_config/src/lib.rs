#![cfg_attr(all(not(debug_assertions), not(test)), deny(warnings))]
#![cfg_attr(
    all(not(debug_assertions), not(test)),
    deny(clippy::all, clippy::pedantic, clippy::nursery)
)]
#![allow(clippy::module_name_repetitions, clippy::missing_errors_doc)]
//! Config schema for the telemetry relay.
//!
//! - `Config` and its sections are deserialized from TOML and validated once
//!   at startup; the running process never reloads them.
//! - Durations are plain integers with a unit suffix in the key name.
use serde::Deserialize;
use std::path::PathBuf;

/// Characters that would change the meaning of an MQTT topic.
const TOPIC_RESERVED: [char; 3] = ['/', '+', '#'];

#[derive(Debug, Deserialize, Clone)]
pub struct NodeCfg {
    /// Node identifier, used in topics and file names
    pub id: String,
    /// Location (group) identifier shared by all nodes of a site
    pub location: String,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct BrokerCfg {
    pub host: String,
    pub port: u16,
    pub username: String,
    /// Falls back to the `RELAY_BROKER_PASSWORD` environment variable when absent.
    pub password: Option<String>,
    /// Defaults to `relay-{location}-{node}`
    pub client_id: Option<String>,
    pub keep_alive_s: u64,
    /// Max wait for CONNACK when a session is first created
    pub connect_timeout_ms: u64,
    /// Max wait for PUBACK after a publish
    pub confirm_timeout_ms: u64,
    /// Pause between reconnect attempts on the session thread
    pub reconnect_backoff_ms: u64,
    /// Grace period for the session thread to exit at shutdown
    pub shutdown_grace_ms: u64,
}

impl Default for BrokerCfg {
    fn default() -> Self {
        Self {
            host: String::new(),
            port: 1883,
            username: String::new(),
            password: None,
            client_id: None,
            keep_alive_s: 60,
            connect_timeout_ms: 3000,
            confirm_timeout_ms: 5000,
            reconnect_backoff_ms: 2000,
            shutdown_grace_ms: 1000,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct StorageCfg {
    /// Directory holding the daily logs and the backlog file
    pub data_dir: PathBuf,
}

impl Default for StorageCfg {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("/home/pi/CH4_data"),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct TimingCfg {
    /// Tick period
    pub tick_ms: u64,
    /// Per-read sensor timeout
    pub sample_timeout_ms: u64,
}

impl Default for TimingCfg {
    fn default() -> Self {
        Self {
            tick_ms: 2000,
            sample_timeout_ms: 1000,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ProbeCfg {
    /// `host:port` reached with a plain TCP handshake
    pub target: String,
    pub timeout_ms: u64,
}

impl Default for ProbeCfg {
    fn default() -> Self {
        Self {
            target: "8.8.8.8:53".to_string(),
            timeout_ms: 3000,
        }
    }
}

#[derive(Debug, Deserialize, Clone, Copy, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ReplayMode {
    /// Drain the backlog on a worker thread, off the tick path
    #[default]
    Background,
    /// Drain the backlog inside the tick that confirmed a delivery
    Inline,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ReplayCfg {
    pub mode: ReplayMode,
    /// Stop a replay pass after this many consecutive failed uploads
    pub max_consecutive_failures: u32,
}

impl Default for ReplayCfg {
    fn default() -> Self {
        Self {
            mode: ReplayMode::Background,
            max_consecutive_failures: 3,
        }
    }
}

#[derive(Debug, Deserialize, Clone, Copy, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SensorKind {
    /// Synthetic readings; no hardware required
    #[default]
    Simulated,
    /// TGS2611 on an ADS1115 plus an MH-T7042A on the UART (`hardware` builds)
    Methane,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct SensorCfg {
    pub kind: SensorKind,
    /// Channel names for the simulated source
    pub channels: Vec<String>,
    /// TGS2611 clean-air sensing resistance ratio
    pub tgs_r0: f64,
    /// ADS1115 input the TGS2611 divider is wired to (0..=3)
    pub adc_input: u8,
    /// UART device for the MH-T7042A
    pub uart_path: PathBuf,
}

impl Default for SensorCfg {
    fn default() -> Self {
        Self {
            kind: SensorKind::Simulated,
            channels: vec![
                "TGS".to_string(),
                "TGS_voltage".to_string(),
                "MH_T7042A".to_string(),
            ],
            tgs_r0: 1.46,
            adc_input: 0,
            uart_path: PathBuf::from("/dev/serial0"),
        }
    }
}

#[derive(Debug, Deserialize, Default, Clone)]
#[serde(default)]
pub struct Logging {
    pub file: Option<String>,  // path to .log (JSON lines)
    pub level: Option<String>, // "info","debug"
    /// Log rotation policy: "never" | "daily" | "hourly" (default: never)
    pub rotation: Option<String>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub node: NodeCfg,
    pub broker: BrokerCfg,
    #[serde(default)]
    pub storage: StorageCfg,
    #[serde(default)]
    pub timing: TimingCfg,
    #[serde(default)]
    pub probe: ProbeCfg,
    #[serde(default)]
    pub replay: ReplayCfg,
    #[serde(default)]
    pub sensor: SensorCfg,
    #[serde(default)]
    pub logging: Logging,
}

pub fn load_toml(s: &str) -> Result<Config, toml::de::Error> {
    toml::from_str::<Config>(s)
}

/// Read and validate a config file.
pub fn load_file(path: &std::path::Path) -> eyre::Result<Config> {
    let text = std::fs::read_to_string(path)
        .map_err(|e| eyre::eyre!("read config {:?}: {}", path, e))?;
    let cfg = load_toml(&text).map_err(|e| eyre::eyre!("parse config {:?}: {}", path, e))?;
    cfg.validate()?;
    Ok(cfg)
}

/// One MQTT topic level: non-empty, no separators, wildcards or whitespace.
pub fn check_topic_segment(key: &str, value: &str) -> eyre::Result<()> {
    if value.trim().is_empty() {
        eyre::bail!("{key} must not be empty");
    }
    if value.contains(TOPIC_RESERVED) || value.chars().any(char::is_whitespace) {
        eyre::bail!("{key} must not contain '/', '+', '#' or whitespace (got {value:?})");
    }
    Ok(())
}

impl Config {
    pub fn validate(&self) -> eyre::Result<()> {
        // Node
        check_topic_segment("node.id", &self.node.id)?;
        check_topic_segment("node.location", &self.node.location)?;

        // Broker
        if self.broker.host.trim().is_empty() {
            eyre::bail!("broker.host must not be empty");
        }
        if self.broker.port == 0 {
            eyre::bail!("broker.port must be > 0");
        }
        if self.broker.keep_alive_s < 5 {
            eyre::bail!("broker.keep_alive_s must be >= 5");
        }
        if self.broker.connect_timeout_ms == 0 {
            eyre::bail!("broker.connect_timeout_ms must be >= 1");
        }
        if self.broker.confirm_timeout_ms == 0 {
            eyre::bail!("broker.confirm_timeout_ms must be >= 1");
        }
        if self.broker.confirm_timeout_ms > 60_000 {
            eyre::bail!("broker.confirm_timeout_ms is unreasonably large (>60s)");
        }

        // Timing
        if self.timing.tick_ms < 100 {
            eyre::bail!("timing.tick_ms must be >= 100");
        }
        if self.timing.sample_timeout_ms == 0 {
            eyre::bail!("timing.sample_timeout_ms must be >= 1");
        }

        // Probe
        if !self.probe.target.contains(':') {
            eyre::bail!("probe.target must be host:port (got {:?})", self.probe.target);
        }
        if self.probe.timeout_ms == 0 {
            eyre::bail!("probe.timeout_ms must be >= 1");
        }

        // Replay
        if self.replay.max_consecutive_failures == 0 {
            eyre::bail!("replay.max_consecutive_failures must be >= 1");
        }

        // Sensor
        if self.sensor.kind == SensorKind::Simulated && self.sensor.channels.is_empty() {
            eyre::bail!("sensor.channels must list at least one channel");
        }
        for (i, name) in self.sensor.channels.iter().enumerate() {
            if name.trim().is_empty() {
                eyre::bail!("sensor.channels[{i}] must not be empty");
            }
            if name == "node" || name == "timestamp" {
                eyre::bail!("sensor.channels[{i}] uses reserved name {name:?}");
            }
            if self.sensor.channels[..i].contains(name) {
                eyre::bail!("sensor.channels has duplicate name {name:?}");
            }
        }
        if !(self.sensor.tgs_r0.is_finite() && self.sensor.tgs_r0 > 0.0) {
            eyre::bail!("sensor.tgs_r0 must be > 0");
        }
        if self.sensor.adc_input > 3 {
            eyre::bail!("sensor.adc_input must be in 0..=3");
        }

        // Logging
        if let Some(rot) = self.logging.rotation.as_deref()
            && !matches!(rot, "never" | "daily" | "hourly")
        {
            eyre::bail!("logging.rotation must be one of never|daily|hourly");
        }

        Ok(())
    }

    /// Client id presented to the broker.
    pub fn client_id(&self) -> String {
        self.broker
            .client_id
            .clone()
            .unwrap_or_else(|| format!("relay-{}-{}", self.node.location, self.node.id))
    }
}
