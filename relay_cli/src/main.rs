mod cli;
mod error_fmt;
mod relay;

use clap::Parser;
use cli::{Cli, Commands, JSON_MODE};
use eyre::{Result, WrapErr};
use relay_config::{Config, Logging};
use serde_json::json;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{EnvFilter, Layer, layer::SubscriberExt, util::SubscriberInitExt};

/// Used when `broker.password` is absent from the config file.
const PASSWORD_ENV: &str = "RELAY_BROKER_PASSWORD";

type BoxedLayer = Box<dyn Layer<tracing_subscriber::Registry> + Send + Sync>;

fn main() {
    // Colored reports for panics and debug output; plain text otherwise.
    let _ = color_eyre::install();

    // clap prints usage errors itself and exits with code 2.
    let cli = Cli::parse();
    let _ = JSON_MODE.set(cli.json);

    if let Err(e) = real_main(&cli) {
        if *JSON_MODE.get().unwrap_or(&false) {
            eprintln!("{}", error_fmt::format_error_json(&e));
        } else {
            eprintln!("{}", error_fmt::humanize(&e));
        }
        std::process::exit(1);
    }
}

fn real_main(cli: &Cli) -> Result<()> {
    let cfg = load_config(cli)?;
    // Dropping the guard flushes the file sink, so it lives until return.
    let _log_guard = init_tracing(cli, &cfg.logging)?;
    tracing::debug!(config = %cli.config.display(), node = %cfg.node.id, "config loaded");

    let shutdown = Arc::new(AtomicBool::new(false));
    {
        let flag = shutdown.clone();
        ctrlc::set_handler(move || {
            flag.store(true, Ordering::Relaxed);
        })
        .wrap_err("install Ctrl-C handler")?;
    }

    match &cli.cmd {
        Commands::Run { ticks } => {
            let stats = relay::run_relay(&cfg, shutdown, *ticks)?;
            if cli.json {
                println!(
                    "{}",
                    json!({
                        "ticks": stats.ticks,
                        "delivered": stats.delivered,
                        "buffered": stats.buffered,
                        "skipped": stats.skipped,
                        "dropped": stats.dropped,
                        "lost": stats.lost,
                        "replays_triggered": stats.replays_triggered,
                    })
                );
            } else {
                println!(
                    "ticks: {} delivered: {} buffered: {} skipped: {} dropped: {} lost: {}",
                    stats.ticks, stats.delivered, stats.buffered, stats.skipped, stats.dropped, stats.lost
                );
            }
        }
        Commands::SelfCheck => {
            let checks = relay::self_check(&cfg)?;
            if cli.json {
                let items: Vec<_> = checks
                    .iter()
                    .map(|c| json!({ "check": c.name, "ok": c.ok, "detail": c.detail }))
                    .collect();
                println!("{}", json!({ "checks": items }));
            } else {
                for c in &checks {
                    let mark = if c.ok { "ok" } else { "WARN" };
                    println!("{}: {mark} ({})", c.name, c.detail);
                }
                println!("self-check ok");
            }
        }
        Commands::Replay => {
            let outcome = relay::replay_once(&cfg, shutdown)?;
            print_replay(cli.json, &outcome);
        }
        Commands::Backlog => {
            let (path, scan) = relay::scan_backlog(&cfg)?;
            let oldest = scan.records.first().map(relay_core::SensorRecord::timestamp_str);
            let newest = scan.records.last().map(relay_core::SensorRecord::timestamp_str);
            if cli.json {
                println!(
                    "{}",
                    json!({
                        "path": path.display().to_string(),
                        "rows": scan.records.len(),
                        "malformed": scan.malformed,
                        "other_width": scan.other_width,
                        "oldest": oldest,
                        "newest": newest,
                    })
                );
            } else {
                println!("backlog: {}", path.display());
                println!(
                    "rows: {} malformed: {} other-width: {}",
                    scan.records.len(),
                    scan.malformed,
                    scan.other_width
                );
                if let (Some(o), Some(n)) = (oldest, newest) {
                    println!("oldest: {o} newest: {n}");
                }
            }
        }
        Commands::Ctl { command, node } => {
            let cmd = relay_core::Command::from(*command);
            let topic = relay::send_control(&cfg, cmd, node.as_deref())?;
            if cli.json {
                println!("{}", json!({ "topic": topic, "command": cmd.payload() }));
            } else {
                println!("sent {} to {topic}", cmd.payload());
            }
        }
    }
    Ok(())
}

fn load_config(cli: &Cli) -> Result<Config> {
    let mut cfg = relay_config::load_file(&cli.config)?;
    let mut overridden = false;
    if let Some(node) = &cli.node {
        cfg.node.id.clone_from(node);
        overridden = true;
    }
    if let Some(location) = &cli.location {
        cfg.node.location.clone_from(location);
        overridden = true;
    }
    if let Some(dir) = &cli.data_dir {
        cfg.storage.data_dir.clone_from(dir);
        overridden = true;
    }
    if cfg.broker.password.is_none()
        && let Ok(pw) = std::env::var(PASSWORD_ENV)
    {
        cfg.broker.password = Some(pw);
    }
    if overridden {
        cfg.validate()?;
    }
    Ok(cfg)
}

fn init_tracing(cli: &Cli, logging: &Logging) -> Result<Option<WorkerGuard>> {
    let level = cli
        .log_level
        .clone()
        .or_else(|| logging.level.clone())
        .unwrap_or_else(|| "info".to_string());
    let filter = EnvFilter::try_from_default_env().or_else(|_| EnvFilter::try_new(&level))
        .wrap_err_with(|| format!("invalid log level {level:?}"))?;

    let mut guard = None;
    let mut layers: Vec<BoxedLayer> = Vec::with_capacity(2);
    layers.push(if cli.json {
        Box::new(
            tracing_subscriber::fmt::layer()
                .json()
                .with_writer(std::io::stderr)
                .with_target(false),
        )
    } else {
        Box::new(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .with_target(false),
        )
    });

    if let Some(path) = &logging.file {
        let path = std::path::Path::new(path);
        let dir = path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| std::path::Path::new("."));
        let name = path
            .file_name()
            .ok_or_else(|| eyre::eyre!("logging.file must name a file (got {})", path.display()))?;
        std::fs::create_dir_all(dir)
            .wrap_err_with(|| format!("create log dir {}", dir.display()))?;
        let appender = match logging.rotation.as_deref() {
            Some("daily") => tracing_appender::rolling::daily(dir, name),
            Some("hourly") => tracing_appender::rolling::hourly(dir, name),
            _ => tracing_appender::rolling::never(dir, name),
        };
        let (writer, g) = tracing_appender::non_blocking(appender);
        guard = Some(g);
        layers.push(Box::new(
            tracing_subscriber::fmt::layer()
                .json()
                .with_ansi(false)
                .with_writer(writer),
        ));
    }

    // A second init (tests, embedding) keeps the first subscriber.
    let _ = tracing_subscriber::registry()
        .with(layers)
        .with(filter)
        .try_init();
    Ok(guard)
}

fn print_replay(json_out: bool, outcome: &relay::ReplayRun) {
    use relay::ReplayRun;
    if json_out {
        let v = match outcome {
            ReplayRun::Empty => json!({ "outcome": "empty" }),
            ReplayRun::Offline => json!({ "outcome": "offline" }),
            ReplayRun::NotConnected => json!({ "outcome": "not_connected" }),
            ReplayRun::Done(s) => json!({
                "outcome": "done",
                "delivered": s.delivered,
                "failed": s.failed,
                "deferred": s.deferred,
                "malformed": s.malformed,
                "other_width": s.other_width,
                "remaining": s.remaining(),
            }),
        };
        println!("{v}");
        return;
    }
    match outcome {
        ReplayRun::Empty => println!("backlog empty; nothing to replay"),
        ReplayRun::Offline => println!("network unreachable; backlog kept"),
        ReplayRun::NotConnected => println!("broker not connected; backlog kept"),
        ReplayRun::Done(s) => println!(
            "replayed: {} delivered, {} failed, {} deferred, {} malformed, {} other-width, {} remaining",
            s.delivered,
            s.failed,
            s.deferred,
            s.malformed,
            s.other_width,
            s.remaining()
        ),
    }
}
