//! Background replay worker lifecycle: triggers coalesce, drop cancels and
//! joins, and nothing is lost when a pass is cut short.

use chrono::{TimeZone, Utc};
use relay_core::mocks::ScriptedUploader;
use relay_core::{Delivery, Ledger, RecordSchema, ReplayWorker, SensorRecord, Upload};
use std::sync::Arc;
use std::time::{Duration, Instant};

fn schema() -> RecordSchema {
    RecordSchema::new("3", "keelung", vec!["TGS".into()])
}

fn rec(n: u32) -> SensorRecord {
    let t = Utc.with_ymd_and_hms(2024, 7, 29, 10, 0, n).unwrap();
    schema().record(vec![Some(f64::from(n))], t).unwrap()
}

fn wait_for(mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    false
}

#[test]
fn triggered_pass_drains_the_backlog() {
    let dir = tempfile::tempdir().unwrap();
    let ledger = Arc::new(Ledger::new(Ledger::path_in(dir.path(), "3"), schema()));
    for n in 1..=4 {
        ledger.append(&rec(n)).unwrap();
    }
    let uploader = Arc::new(ScriptedUploader::default());
    let worker = ReplayWorker::spawn(ledger.clone(), uploader.clone(), 3);
    assert!(worker.trigger());
    assert!(wait_for(|| worker.passes() >= 1));
    assert!(ledger.is_empty());
    assert_eq!(uploader.published(), (1..=4).map(rec).collect::<Vec<_>>());
    drop(worker);
}

#[test]
fn worker_exits_on_drop_without_triggers() {
    let dir = tempfile::tempdir().unwrap();
    let ledger = Arc::new(Ledger::new(Ledger::path_in(dir.path(), "3"), schema()));
    for _ in 0..10 {
        let worker = ReplayWorker::spawn(ledger.clone(), Arc::new(ScriptedUploader::default()), 3);
        drop(worker);
    }
    // Passes if every drop returned.
}

/// Uploader that blocks each publish briefly so a drop lands mid-pass.
struct SlowUploader(ScriptedUploader);

impl Upload for SlowUploader {
    fn ensure_connected(&self) -> bool {
        true
    }

    fn publish(&self, record: &SensorRecord) -> Delivery {
        std::thread::sleep(Duration::from_millis(30));
        self.0.publish(record)
    }
}

#[test]
fn drop_mid_pass_keeps_unattempted_rows() {
    let dir = tempfile::tempdir().unwrap();
    let ledger = Arc::new(Ledger::new(Ledger::path_in(dir.path(), "3"), schema()));
    for n in 1..=40 {
        ledger.append(&rec(n)).unwrap();
    }
    let uploader = Arc::new(SlowUploader(ScriptedUploader::default()));
    let worker = ReplayWorker::spawn(ledger.clone(), uploader.clone(), 3);
    worker.trigger();
    assert!(wait_for(|| uploader.0.publish_count() >= 2));
    drop(worker);

    let sent = uploader.0.publish_count();
    assert!(sent < 40, "drop should cut the pass short, sent {sent}");
    let left = ledger.scan().unwrap().records;
    assert_eq!(left, (sent as u32 + 1..=40).map(rec).collect::<Vec<_>>());
}

#[test]
fn triggers_coalesce_while_a_pass_is_queued() {
    let dir = tempfile::tempdir().unwrap();
    let ledger = Arc::new(Ledger::new(Ledger::path_in(dir.path(), "3"), schema()));
    for n in 1..=20 {
        ledger.append(&rec(n)).unwrap();
    }
    let uploader = Arc::new(SlowUploader(ScriptedUploader::default()));
    let worker = ReplayWorker::spawn(ledger.clone(), uploader.clone(), 3);
    worker.trigger();
    // First pass is busy uploading; one more fits in the queue, the rest fold in.
    assert!(wait_for(|| uploader.0.publish_count() >= 1));
    let accepted = (0..5).filter(|_| worker.trigger()).count();
    assert_eq!(accepted, 1);
    drop(worker);
}
