//! Command bodies: config mapping, sensor assembly, and engine wiring.

use eyre::{Result, WrapErr};
use relay_config::{Config, ReplayMode, SensorKind};
use relay_core::uploader::resolve_broker;
use relay_core::{
    Command, ControlChannel, ControlHandler, ControlState, DailyLog, Delivery, Dispatcher, Ledger,
    LedgerScan, MqttUploader, NodeIdentity, ProbeCfg, RelayError, Replay, ReplayOptions,
    ReplaySummary, SessionCfg, SharedConnection, StatusSink, TcpProbe, TickCfg, TickLoop,
    TickStats, Topics, Upload,
};
use relay_traits::clock::MonotonicClock;
use relay_traits::{Probe, SampleSource};
use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::time::Duration;

type Source = Box<dyn SampleSource + Send>;

/// Open the configured sensor front end.
pub fn open_source(cfg: &Config, timeout: Duration) -> Result<Source> {
    match cfg.sensor.kind {
        SensorKind::Simulated => Ok(Box::new(relay_hardware::SimulatedSource::new(
            cfg.sensor.channels.clone(),
        ))),
        SensorKind::Methane => open_methane(cfg, timeout),
    }
}

#[cfg(feature = "hardware")]
fn open_methane(cfg: &Config, timeout: Duration) -> Result<Source> {
    let src = relay_hardware::MethaneSource::open(
        cfg.sensor.adc_input,
        cfg.sensor.tgs_r0,
        &cfg.sensor.uart_path,
        timeout,
    )
    .wrap_err("open methane sensors")?;
    tracing::info!(
        adc_input = cfg.sensor.adc_input,
        uart = %cfg.sensor.uart_path.display(),
        "methane sensors ready"
    );
    Ok(Box::new(src))
}

#[cfg(not(feature = "hardware"))]
fn open_methane(_cfg: &Config, _timeout: Duration) -> Result<Source> {
    eyre::bail!("sensor.kind = \"methane\" needs a build with the `hardware` feature")
}

fn ledger_for(cfg: &Config, id: &NodeIdentity, fields: Vec<String>) -> Ledger {
    Ledger::new(
        Ledger::path_in(&cfg.storage.data_dir, &id.node),
        relay_core::schema_for(id, fields),
    )
}

/// Channel names without opening hardware; the methane stack is fixed.
fn channel_names(cfg: &Config) -> Vec<String> {
    match cfg.sensor.kind {
        SensorKind::Simulated => cfg.sensor.channels.clone(),
        SensorKind::Methane => relay_hardware::METHANE_CHANNELS
            .iter()
            .map(|s| (*s).to_string())
            .collect(),
    }
}

fn uploader_for(cfg: &Config, topics: &Topics, control: ControlState) -> Arc<MqttUploader> {
    let handler = Arc::new(ControlChannel::new(topics.clone(), control));
    Arc::new(MqttUploader::new(
        SessionCfg::from(cfg),
        topics.data.clone(),
        SharedConnection::default(),
        handler,
    ))
}

/// Probe, then resolve and connect when the network is up. An unresolvable
/// broker on a reachable network is fatal; an unreachable network is not.
fn connect_if_online(cfg: &Config, probe: &TcpProbe, uploader: &MqttUploader) -> Result<bool> {
    if !probe.reachable() {
        tracing::warn!(probe = probe.target(), "network unreachable; starting offline");
        return Ok(false);
    }
    let addr = resolve_broker(&SessionCfg::from(cfg))?;
    tracing::debug!(%addr, "broker resolved");
    Ok(uploader.ensure_connected())
}

/// Sample, log and upload until `shutdown` is set (or `max_ticks` ran).
pub fn run_relay(cfg: &Config, shutdown: Arc<AtomicBool>, max_ticks: Option<u64>) -> Result<TickStats> {
    let id = NodeIdentity::from(&cfg.node);
    let tick = TickCfg::from(&cfg.timing);
    let source = open_source(cfg, tick.sample_timeout)?;
    let schema = relay_core::schema_for(&id, source.channels());

    let data_dir = &cfg.storage.data_dir;
    fs::create_dir_all(data_dir)
        .wrap_err_with(|| format!("create data dir {}", data_dir.display()))?;
    let daily = DailyLog::new(data_dir, schema.clone());
    let ledger = Arc::new(ledger_for(cfg, &id, schema.fields.clone()));
    if !ledger.is_empty() {
        tracing::info!(path = %ledger.path().display(), "backlog present; replays after the next delivery");
        if let Ok(scan) = ledger.scan()
            && scan.other_width > 0
        {
            tracing::warn!(
                rows = scan.other_width,
                channels = ?schema.fields,
                "backlog has rows for another channel list; they are kept but not uploaded"
            );
        }
    }

    let probe_cfg = ProbeCfg::from(&cfg.probe);
    let probe = TcpProbe::new(probe_cfg.target, probe_cfg.timeout);
    let topics = Topics::new(&id.location, &id.node);
    let control = ControlState::default();
    let uploader = uploader_for(cfg, &topics, control.clone());
    connect_if_online(cfg, &probe, &uploader)?;

    tracing::info!(
        node = %id.node,
        location = %id.location,
        data_topic = %topics.data,
        replay = ?cfg.replay.mode,
        "relay starting"
    );

    let mut dispatcher = match cfg.replay.mode {
        ReplayMode::Background => Dispatcher::with_background_replay(
            daily,
            ledger,
            probe,
            uploader.clone(),
            cfg.replay.max_consecutive_failures,
        ),
        ReplayMode::Inline => {
            let mut opts = ReplayOptions::from(&cfg.replay);
            opts.cancel = Some(shutdown.clone());
            Dispatcher::new(daily, ledger, probe, uploader.clone(), Replay::Inline(opts))
        }
    };

    let mut tick_loop = TickLoop::new(source, MonotonicClock::new(), tick, schema, control);
    tick_loop.run(&mut dispatcher, &shutdown, max_ticks);

    let stats = dispatcher.stats().clone();
    // Joins the replay worker before the session goes away.
    drop(dispatcher);
    uploader.shutdown();
    tracing::info!(
        ticks = stats.ticks,
        delivered = stats.delivered,
        buffered = stats.buffered,
        skipped = stats.skipped,
        dropped = stats.dropped,
        lost = stats.lost,
        "relay stopped"
    );
    Ok(stats)
}

/// Outcome of `relay replay`.
#[derive(Debug)]
pub enum ReplayRun {
    Empty,
    Offline,
    NotConnected,
    Done(ReplaySummary),
}

pub fn replay_once(cfg: &Config, shutdown: Arc<AtomicBool>) -> Result<ReplayRun> {
    let id = NodeIdentity::from(&cfg.node);
    let ledger = ledger_for(cfg, &id, channel_names(cfg));
    if ledger.is_empty() {
        return Ok(ReplayRun::Empty);
    }
    let probe_cfg = ProbeCfg::from(&cfg.probe);
    let probe = TcpProbe::new(probe_cfg.target, probe_cfg.timeout);
    let topics = Topics::new(&id.location, &id.node);
    let uploader = uploader_for(cfg, &topics, ControlState::default());

    if !probe.reachable() {
        return Ok(ReplayRun::Offline);
    }
    resolve_broker(&SessionCfg::from(cfg))?;
    if !uploader.ensure_connected() {
        uploader.shutdown();
        return Ok(ReplayRun::NotConnected);
    }
    let mut opts = ReplayOptions::from(&cfg.replay);
    opts.cancel = Some(shutdown);
    let summary = ledger
        .replay(&opts, |r| uploader.publish(r))
        .wrap_err("replay backlog")?;
    summary.log();
    uploader.shutdown();
    Ok(ReplayRun::Done(summary))
}

pub fn scan_backlog(cfg: &Config) -> Result<(std::path::PathBuf, LedgerScan)> {
    let id = NodeIdentity::from(&cfg.node);
    let ledger = ledger_for(cfg, &id, channel_names(cfg));
    let scan = ledger.scan().wrap_err("read backlog")?;
    Ok((ledger.path().to_path_buf(), scan))
}

/// Publishes commands only; never subscribes.
struct Controller;

impl ControlHandler for Controller {
    fn subscriptions(&self) -> Vec<String> {
        Vec::new()
    }

    fn on_message(&self, _topic: &str, _payload: &[u8], _sink: &dyn StatusSink) {}
}

/// Send `start`/`stop` to the location's group topic, or to one node.
/// Returns the topic once the broker confirmed it.
pub fn send_control(cfg: &Config, cmd: Command, node: Option<&str>) -> Result<String> {
    let (topic, data) = match node {
        Some(n) => {
            relay_config::check_topic_segment("--node", n)?;
            let t = Topics::new(&cfg.node.location, n);
            (t.control_node, t.data)
        }
        None => {
            let t = Topics::new(&cfg.node.location, &cfg.node.id);
            (t.control_group, t.data)
        }
    };

    let mut session = SessionCfg::from(cfg);
    // Own client id, so the node's session on this host is not taken over.
    session.client_id = format!("{}-ctl", session.client_id);
    resolve_broker(&session)?;
    let uploader = MqttUploader::new(session, data, SharedConnection::default(), Arc::new(Controller));
    if !uploader.ensure_connected() {
        uploader.shutdown();
        return Err(RelayError::Transport(format!(
            "broker {}:{} did not accept a connection",
            cfg.broker.host, cfg.broker.port
        ))
        .into());
    }
    let delivery = uploader.publish_to(&topic, cmd.payload().as_bytes().to_vec());
    uploader.shutdown();
    match delivery {
        Delivery::Confirmed => {
            tracing::info!(%topic, command = cmd.payload(), "control command sent");
            Ok(topic)
        }
        Delivery::Timeout => Err(RelayError::Transport(format!("{topic}: broker did not confirm the command")).into()),
        Delivery::Failed(reason) => Err(RelayError::Transport(format!("{topic}: {reason}")).into()),
    }
}

/// One line of the self-check report.
#[derive(Debug)]
pub struct Check {
    pub name: &'static str,
    pub ok: bool,
    pub detail: String,
}

/// Sensor and storage failures are errors; network state is only reported.
pub fn self_check(cfg: &Config) -> Result<Vec<Check>> {
    let mut checks = Vec::new();
    let tick = TickCfg::from(&cfg.timing);

    let mut source = open_source(cfg, tick.sample_timeout)?;
    let values = source
        .read(tick.sample_timeout)
        .map_err(|e| eyre::Report::new(relay_core::hw_error::map_hw_error(e.as_ref())))
        .wrap_err("sensor read")?;
    let present = values.iter().filter(|v| v.is_some()).count();
    checks.push(Check {
        name: "sensor",
        ok: true,
        detail: format!("{present}/{} channels read", values.len()),
    });

    check_storage(&cfg.storage.data_dir)?;
    checks.push(Check {
        name: "storage",
        ok: true,
        detail: cfg.storage.data_dir.display().to_string(),
    });

    let probe_cfg = ProbeCfg::from(&cfg.probe);
    let probe = TcpProbe::new(probe_cfg.target.clone(), probe_cfg.timeout);
    let reachable = probe.reachable();
    checks.push(Check {
        name: "network",
        ok: reachable,
        detail: format!(
            "{} {}",
            probe_cfg.target,
            if reachable { "reachable" } else { "unreachable" }
        ),
    });

    let (_, scan) = scan_backlog(cfg)?;
    checks.push(Check {
        name: "backlog",
        ok: scan.malformed == 0 && scan.other_width == 0,
        detail: format!(
            "{} rows, {} malformed, {} other-width",
            scan.records.len(),
            scan.malformed,
            scan.other_width
        ),
    });
    Ok(checks)
}

fn check_storage(dir: &Path) -> Result<()> {
    fs::create_dir_all(dir).wrap_err_with(|| format!("create data dir {}", dir.display()))?;
    let probe = dir.join(".relay-write-check");
    fs::write(&probe, b"ok").wrap_err_with(|| format!("data dir {} is not writable", dir.display()))?;
    let _ = fs::remove_file(&probe);
    Ok(())
}
