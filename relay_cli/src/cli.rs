//! CLI argument definitions and shared statics.

use clap::{ArgAction, Parser, Subcommand, ValueEnum};
use std::path::PathBuf;
use std::sync::OnceLock;

/// Whether the user asked for JSON output (controls structured error output).
pub static JSON_MODE: OnceLock<bool> = OnceLock::new();

#[derive(Parser, Debug)]
#[command(name = "relay", version, about = "Store-and-forward telemetry relay")]
pub struct Cli {
    /// Path to config TOML (typed)
    #[arg(long, value_name = "FILE", default_value = "etc/relay.toml")]
    pub config: PathBuf,

    /// Log and report as JSON lines instead of pretty text
    #[arg(long, action = ArgAction::SetTrue)]
    pub json: bool,

    /// Console log level (error|warn|info|debug|trace); RUST_LOG wins when set
    #[arg(long = "log-level", value_name = "LEVEL")]
    pub log_level: Option<String>,

    /// Override node.id from the config
    #[arg(long, value_name = "ID")]
    pub node: Option<String>,

    /// Override node.location from the config
    #[arg(long, value_name = "LOCATION")]
    pub location: Option<String>,

    /// Override storage.data_dir from the config
    #[arg(long = "data-dir", value_name = "DIR")]
    pub data_dir: Option<PathBuf>,

    /// Command to execute
    #[command(subcommand)]
    pub cmd: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Sample, log and upload until interrupted
    Run {
        /// Stop after this many ticks
        #[arg(long, value_name = "N")]
        ticks: Option<u64>,
    },
    /// Check config, storage, sensor and network, then exit
    SelfCheck,
    /// Drain the backlog once, then exit
    Replay,
    /// Show what is waiting in the backlog
    Backlog,
    /// Start or stop collection on the location's nodes
    Ctl {
        command: CtlCommand,
        /// Address one node instead of the whole group
        #[arg(long, value_name = "ID")]
        node: Option<String>,
    },
}

#[derive(ValueEnum, Clone, Copy, Debug)]
pub enum CtlCommand {
    Start,
    Stop,
}

impl From<CtlCommand> for relay_core::Command {
    fn from(c: CtlCommand) -> Self {
        match c {
            CtlCommand::Start => Self::Start,
            CtlCommand::Stop => Self::Stop,
        }
    }
}
