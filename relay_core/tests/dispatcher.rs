//! Per-tick routing: daily log always, then broker or backlog.

use chrono::{TimeZone, Utc};
use relay_core::ledger::ReplayOptions;
use relay_core::mocks::{FixedProbe, ScriptedUploader};
use relay_core::{
    BufferReason, DailyLog, Delivery, Dispatcher, Ledger, RecordSchema, Replay, SensorRecord,
    TickOutcome,
};
use rstest::rstest;
use std::fs;
use std::path::Path;
use std::sync::Arc;

fn schema() -> RecordSchema {
    RecordSchema::new("3", "keelung", vec!["TGS".into(), "MH_T7042A".into()])
}

fn rec(sec: u32) -> SensorRecord {
    let t = Utc.with_ymd_and_hms(2024, 7, 29, 10, 0, sec).unwrap();
    schema().record(vec![Some(f64::from(sec)), Some(2.0)], t).unwrap()
}

fn dispatcher(
    dir: &Path,
    probe: FixedProbe,
    uploader: ScriptedUploader,
) -> Dispatcher<FixedProbe, ScriptedUploader> {
    let ledger = Arc::new(Ledger::new(Ledger::path_in(dir, "3"), schema()));
    Dispatcher::new(
        DailyLog::new(dir, schema()),
        ledger,
        probe,
        Arc::new(uploader),
        Replay::Inline(ReplayOptions::default()),
    )
}

fn daily_rows(dir: &Path) -> usize {
    let text = fs::read_to_string(dir.join("node3_20240729.csv")).unwrap_or_default();
    text.lines().count().saturating_sub(2)
}

#[rstest]
#[case::offline(false, true, Delivery::Confirmed, TickOutcome::Buffered(BufferReason::Offline))]
#[case::no_session(true, false, Delivery::Confirmed, TickOutcome::Buffered(BufferReason::NotConnected))]
#[case::confirmed(true, true, Delivery::Confirmed, TickOutcome::Delivered)]
#[case::failed(true, true, Delivery::Failed("nack".into()), TickOutcome::Buffered(BufferReason::Failed))]
#[case::timeout(true, true, Delivery::Timeout, TickOutcome::Buffered(BufferReason::Timeout))]
fn every_record_reaches_the_daily_log(
    #[case] reachable: bool,
    #[case] connected: bool,
    #[case] answer: Delivery,
    #[case] expected: TickOutcome,
) {
    let dir = tempfile::tempdir().unwrap();
    let mut d = dispatcher(
        dir.path(),
        FixedProbe::new(reachable),
        ScriptedUploader::new(connected).then(answer),
    );
    let outcome = d.process_tick(Some(rec(1)));
    assert_eq!(outcome, expected);
    assert_eq!(daily_rows(dir.path()), 1);
    // The backlog holds the record iff it was not confirmed.
    assert_eq!(d.ledger().is_empty(), outcome.delivered());
}

#[test]
fn offline_tick_never_publishes() {
    let dir = tempfile::tempdir().unwrap();
    let mut d = dispatcher(dir.path(), FixedProbe::new(false), ScriptedUploader::default());
    for s in 1..=3 {
        d.process_tick(Some(rec(s)));
    }
    assert_eq!(d.uploader().publish_count(), 0);
    assert_eq!(d.uploader().connect_attempts(), 0);
    let scan = d.ledger().scan().unwrap();
    assert_eq!(scan.records, vec![rec(1), rec(2), rec(3)]);
}

#[test]
fn failed_publish_is_not_retried_in_the_same_tick() {
    let dir = tempfile::tempdir().unwrap();
    let mut d = dispatcher(
        dir.path(),
        FixedProbe::new(true),
        ScriptedUploader::default().then(Delivery::Timeout),
    );
    d.process_tick(Some(rec(1)));
    assert_eq!(d.uploader().publish_count(), 1);
}

#[test]
fn delivery_drains_the_backlog_in_order() {
    let dir = tempfile::tempdir().unwrap();
    let mut d = dispatcher(dir.path(), FixedProbe::new(false), ScriptedUploader::default());
    d.process_tick(Some(rec(1)));
    d.process_tick(Some(rec(2)));
    assert!(!d.ledger().is_empty());

    // Back online (same files): the live record goes first, then the backlog.
    let mut d = dispatcher(dir.path(), FixedProbe::new(true), ScriptedUploader::default());
    assert_eq!(d.process_tick(Some(rec(3))), TickOutcome::Delivered);
    assert_eq!(d.uploader().published(), vec![rec(3), rec(1), rec(2)]);
    assert!(d.ledger().is_empty());
    assert_eq!(d.stats().replays_triggered, 1);
    assert_eq!(daily_rows(dir.path()), 3);
}

#[test]
fn delivery_with_empty_backlog_skips_replay() {
    let dir = tempfile::tempdir().unwrap();
    let mut d = dispatcher(dir.path(), FixedProbe::new(true), ScriptedUploader::default());
    d.process_tick(Some(rec(1)));
    assert_eq!(d.stats().replays_triggered, 0);
    assert_eq!(d.uploader().publish_count(), 1);
}

#[test]
fn no_record_is_a_skip() {
    let dir = tempfile::tempdir().unwrap();
    let mut d = dispatcher(dir.path(), FixedProbe::new(true), ScriptedUploader::default());
    assert_eq!(d.process_tick(None), TickOutcome::Skipped);
    assert_eq!(daily_rows(dir.path()), 0);
    assert_eq!(d.uploader().publish_count(), 0);
    assert_eq!(d.stats().skipped, 1);
}

#[test]
fn daily_log_failure_drops_the_record() {
    let dir = tempfile::tempdir().unwrap();
    let blocker = dir.path().join("not-a-dir");
    fs::write(&blocker, b"x").unwrap();
    let ledger = Arc::new(Ledger::new(Ledger::path_in(dir.path(), "3"), schema()));
    let mut d = Dispatcher::new(
        DailyLog::new(&blocker, schema()),
        ledger,
        FixedProbe::new(false),
        Arc::new(ScriptedUploader::default()),
        Replay::Inline(ReplayOptions::default()),
    );
    assert_eq!(d.process_tick(Some(rec(1))), TickOutcome::Dropped);
    assert!(d.ledger().is_empty());
    assert_eq!(d.stats().dropped, 1);
}

#[test]
fn backlog_failure_is_reported_as_lost() {
    let dir = tempfile::tempdir().unwrap();
    let blocker = dir.path().join("not-a-dir");
    fs::write(&blocker, b"x").unwrap();
    let ledger = Arc::new(Ledger::new(blocker.join("node3_loss_data.csv"), schema()));
    let mut d = Dispatcher::new(
        DailyLog::new(dir.path(), schema()),
        ledger,
        FixedProbe::new(false),
        Arc::new(ScriptedUploader::default()),
        Replay::Inline(ReplayOptions::default()),
    );
    assert_eq!(d.process_tick(Some(rec(1))), TickOutcome::Lost);
    assert_eq!(daily_rows(dir.path()), 1);
}

#[test]
fn stats_count_each_outcome() {
    let dir = tempfile::tempdir().unwrap();
    let mut d = dispatcher(
        dir.path(),
        FixedProbe::new(true),
        ScriptedUploader::default()
            .then(Delivery::Confirmed)
            .then(Delivery::Timeout),
    );
    d.process_tick(Some(rec(1)));
    d.process_tick(Some(rec(2)));
    d.process_tick(None);
    let s = d.stats();
    assert_eq!((s.ticks, s.delivered, s.buffered, s.skipped), (3, 1, 1, 1));
}
