use assert_cmd::prelude::*;
use predicates::prelude::*;
use rstest::rstest;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use tempfile::tempdir;

// Simulated sensors, a probe target nothing listens on, fast ticks.
fn write_valid_config(dir: &Path) -> PathBuf {
    let toml = format!(
        r#"
[node]
id = "3"
location = "keelung"

[broker]
host = "127.0.0.1"
port = 1
username = "relay"
connect_timeout_ms = 200
shutdown_grace_ms = 200

[storage]
data_dir = "{data}"

[timing]
tick_ms = 100
sample_timeout_ms = 50

[probe]
target = "127.0.0.1:1"
timeout_ms = 100

[sensor]
kind = "simulated"
channels = ["TGS", "MH_T7042A"]
"#,
        data = dir.join("data").display()
    );
    let path = dir.join("relay.toml");
    fs::write(&path, toml).unwrap();
    path
}

fn relay(cfg: &Path) -> Command {
    let mut cmd = Command::cargo_bin("relay").unwrap();
    cmd.arg("--config").arg(cfg).env_remove("RUST_LOG");
    cmd
}

#[rstest]
#[case(&["--help"], 0, "Usage:", "stdout")]
#[case(&["self-check"], 0, "self-check ok", "stdout")]
#[case(&["self-check"], 0, "network: WARN", "stdout")]
#[case(&["backlog"], 0, "rows: 0 malformed: 0", "stdout")]
#[case(&["replay"], 0, "backlog empty", "stdout")]
#[case(&["run", "--ticks", "1"], 0, "ticks: 1", "stdout")]
#[case(&[], 2, "Usage:", "stderr")]
#[case(&["run", "--ticks", "many"], 2, "invalid value", "stderr")]
fn cli_table_cases(
    #[case] args: &[&str],
    #[case] exit_code: i32,
    #[case] needle: &str,
    #[case] stream: &str,
) {
    let dir = tempdir().unwrap();
    let cfg = write_valid_config(dir.path());

    let mut cmd = relay(&cfg);
    for a in args {
        cmd.arg(a);
    }

    let assert = cmd.assert().code(exit_code);
    match stream {
        "stdout" => {
            assert.stdout(predicate::str::contains(needle));
        }
        "stderr" => {
            assert.stderr(predicate::str::contains(needle));
        }
        other => panic!("unknown stream: {other}"),
    }
}

#[rstest]
fn offline_run_writes_daily_log_and_backlog() {
    let dir = tempdir().unwrap();
    let cfg = write_valid_config(dir.path());

    relay(&cfg)
        .args(["run", "--ticks", "2"])
        .assert()
        .success()
        .stdout(predicate::str::contains("buffered: 2"));

    let data = dir.path().join("data");
    let backlog = fs::read_to_string(data.join("node3_loss_data.csv")).unwrap();
    assert_eq!(backlog.lines().count(), 2, "backlog was: {backlog}");

    let daily: Vec<_> = fs::read_dir(&data)
        .unwrap()
        .filter_map(Result::ok)
        .map(|e| e.file_name().to_string_lossy().into_owned())
        .filter(|n| n.starts_with("node3_2") && n.ends_with(".csv"))
        .collect();
    assert_eq!(daily.len(), 1, "expected one daily log, got {daily:?}");
    let text = fs::read_to_string(data.join(&daily[0])).unwrap();
    let mut lines = text.lines();
    assert_eq!(lines.next(), Some("node,3"));
    assert_eq!(lines.next(), Some("time,TGS,MH_T7042A"));
    assert_eq!(lines.count(), 2);
}

#[rstest]
fn backlog_reports_rows_left_by_a_run_and_replay_keeps_them_offline() {
    let dir = tempdir().unwrap();
    let cfg = write_valid_config(dir.path());
    relay(&cfg).args(["run", "--ticks", "3"]).assert().success();

    relay(&cfg)
        .arg("backlog")
        .assert()
        .success()
        .stdout(predicate::str::contains("rows: 3 malformed: 0"))
        .stdout(predicate::str::contains("oldest: "));

    relay(&cfg)
        .arg("replay")
        .assert()
        .success()
        .stdout(predicate::str::contains("network unreachable"));

    let backlog = fs::read_to_string(dir.path().join("data/node3_loss_data.csv")).unwrap();
    assert_eq!(backlog.lines().count(), 3);
}

#[rstest]
fn flags_override_node_and_data_dir() {
    let dir = tempdir().unwrap();
    let cfg = write_valid_config(dir.path());
    let other = dir.path().join("elsewhere");

    relay(&cfg)
        .args(["--node", "9", "--data-dir"])
        .arg(&other)
        .args(["run", "--ticks", "1"])
        .assert()
        .success();

    assert!(other.join("node9_loss_data.csv").exists());
    assert!(!dir.path().join("data/node3_loss_data.csv").exists());
}

#[rstest]
#[case("tick_ms = 100", "tick_ms = 10", "timing.tick_ms")]
#[case("host = \"127.0.0.1\"", "host = \"\"", "broker.host")]
#[case("id = \"3\"", "id = \"a/b\"", "node.id")]
fn invalid_config_exits_1(#[case] from: &str, #[case] to: &str, #[case] needle: &str) {
    let dir = tempdir().unwrap();
    let cfg = write_valid_config(dir.path());
    let text = fs::read_to_string(&cfg).unwrap().replace(from, to);
    fs::write(&cfg, text).unwrap();

    relay(&cfg)
        .arg("self-check")
        .assert()
        .code(1)
        .stderr(predicate::str::contains("Configuration is invalid"))
        .stderr(predicate::str::contains(needle));
}

#[rstest]
fn missing_config_file_is_explained() {
    let dir = tempdir().unwrap();
    relay(&dir.path().join("nope.toml"))
        .arg("backlog")
        .assert()
        .code(1)
        .stderr(predicate::str::contains("Config file could not be read"));
}

#[rstest]
fn invalid_override_is_rejected() {
    let dir = tempdir().unwrap();
    let cfg = write_valid_config(dir.path());
    relay(&cfg)
        .args(["--location", "a b", "backlog"])
        .assert()
        .code(1)
        .stderr(predicate::str::contains("node.location"));
}

#[rstest]
fn sensor_timeout_fails_self_check() {
    let dir = tempdir().unwrap();
    let cfg = write_valid_config(dir.path());
    relay(&cfg)
        .arg("self-check")
        .env("RELAY_TEST_SIM_FAIL_EVERY", "1")
        .assert()
        .code(1)
        .stderr(predicate::str::contains("Sensor read timed out"));
}

#[rstest]
fn failed_reads_are_skipped_during_run() {
    let dir = tempdir().unwrap();
    let cfg = write_valid_config(dir.path());
    relay(&cfg)
        .args(["run", "--ticks", "2"])
        .env("RELAY_TEST_SIM_FAIL_EVERY", "1")
        .assert()
        .success()
        .stdout(predicate::str::contains("skipped: 2"));
    assert!(!dir.path().join("data/node3_loss_data.csv").exists());
}

#[rstest]
fn methane_without_hardware_feature_is_a_setup_error() {
    if cfg!(feature = "hardware") {
        return;
    }
    let dir = tempdir().unwrap();
    let cfg = write_valid_config(dir.path());
    let text = fs::read_to_string(&cfg)
        .unwrap()
        .replace("kind = \"simulated\"", "kind = \"methane\"");
    fs::write(&cfg, text).unwrap();
    relay(&cfg)
        .args(["run", "--ticks", "1"])
        .assert()
        .code(1)
        .stderr(predicate::str::contains("--features hardware"));
}

#[rstest]
#[case(&["ctl", "stop"], "ctl/keelung/thi", "stop")]
#[case(&["ctl", "start", "--node", "5"], "ctl/keelung/thi/5", "start")]
fn ctl_publishes_the_command(#[case] args: &[&str], #[case] topic: &str, #[case] payload: &str) {
    let broker = relay_core::mocks::FakeBroker::start().unwrap();
    let dir = tempdir().unwrap();
    let cfg = write_valid_config(dir.path());
    let text = fs::read_to_string(&cfg)
        .unwrap()
        .replace("port = 1\n", &format!("port = {}\n", broker.port()));
    fs::write(&cfg, text).unwrap();

    relay(&cfg)
        .args(args)
        .assert()
        .success()
        .stdout(predicate::str::contains(format!("sent {payload} to {topic}")));
    let got = broker.wait_for(topic, std::time::Duration::from_secs(2));
    assert_eq!(got.as_deref(), Some(payload.as_bytes()));
}

#[rstest]
#[case(&["ctl", "stop"], 1, "did not accept a connection")]
#[case(&["ctl", "stop", "--node", "a/b"], 1, "--node must not contain")]
#[case(&["ctl", "pause"], 2, "invalid value")]
fn ctl_failures(#[case] args: &[&str], #[case] exit_code: i32, #[case] needle: &str) {
    let dir = tempdir().unwrap();
    let cfg = write_valid_config(dir.path());
    relay(&cfg)
        .args(args)
        .assert()
        .code(exit_code)
        .stderr(predicate::str::contains(needle));
}
