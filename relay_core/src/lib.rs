#![cfg_attr(all(not(debug_assertions), not(test)), deny(warnings))]
#![cfg_attr(
    all(not(debug_assertions), not(test)),
    deny(clippy::all, clippy::pedantic, clippy::nursery)
)]
#![allow(clippy::module_name_repetitions, clippy::missing_errors_doc)]
#![cfg_attr(not(test), deny(clippy::unwrap_used, clippy::expect_used))]
//! Store-and-forward relay engine (hardware-agnostic).
//!
//! Sensor access goes through `relay_traits::SampleSource`; reachability
//! through `relay_traits::Probe`; the broker through [`uploader::Upload`].
//!
//! ## Architecture
//!
//! - **Records**: `SensorRecord` plus its JSON and CSV encodings (`record`)
//! - **Storage**: per-day permanent log (`daily_log`) and the backlog of
//!   unconfirmed records (`ledger`)
//! - **Transport**: MQTT session with per-packet confirmation (`uploader`),
//!   TCP reachability probe (`probe`)
//! - **Control**: remote start/stop and status replies (`control`)
//! - **Orchestration**: per-tick decisions (`dispatcher`), background
//!   backlog drain (`replay`), fixed-cadence loop (`runner`)
//!
//! ## Delivery guarantees
//!
//! Every record reaches the daily log. A record sits in the backlog until the
//! broker confirms it; the backlog is replayed in file order and rewritten
//! atomically. Delivery is at-least-once: a crash between confirmation and
//! rewrite resends rows on the next replay.

pub mod atomic;
pub mod config;
pub mod control;
pub mod conversions;
pub mod daily_log;
pub mod dispatcher;
pub mod error;
pub mod hw_error;
pub mod ledger;
pub mod mocks;
pub mod probe;
pub mod record;
pub mod replay;
pub mod runner;
pub mod status;
pub mod topics;
pub mod uploader;

pub use config::{NodeIdentity, ProbeCfg, SessionCfg, TickCfg};
pub use control::{Command, ControlChannel, ControlHandler, ControlState, RunState, StatusSink};
pub use daily_log::DailyLog;
pub use dispatcher::{Dispatcher, Replay, TickStats};
pub use error::RelayError;
pub use ledger::{Ledger, LedgerScan, ReplayOptions, ReplaySummary};
pub use probe::TcpProbe;
pub use record::{Measurement, RecordSchema, SensorRecord};
pub use replay::ReplayWorker;
pub use runner::TickLoop;
pub use status::{BufferReason, TickOutcome};
pub use topics::Topics;
pub use uploader::{ConnectionState, Delivery, MqttUploader, SharedConnection, Upload};

/// Schema for a node from its identity and channel list.
pub fn schema_for(id: &NodeIdentity, fields: Vec<String>) -> RecordSchema {
    RecordSchema::new(id.node.clone(), id.location.clone(), fields)
}
