#![no_main]
use chrono::{TimeZone, Utc};
use libfuzzer_sys::fuzz_target;
use relay_core::{Delivery, Ledger, RecordSchema, ReplayOptions};

fuzz_target!(|data: &[u8]| {
    // Arbitrary bytes as a backlog file, followed by one good row: replay
    // must never panic, must offer every parseable row (the good one
    // included), and must keep exactly the rows it did not deliver.
    let dir = std::env::temp_dir().join("relay-fuzz");
    if std::fs::create_dir_all(&dir).is_err() {
        return;
    }
    let schema = RecordSchema::new("1", "fuzz", vec!["a".into(), "b".into()]);
    let ledger = Ledger::new(dir.join(format!("node{}_loss_data.csv", std::process::id())), schema.clone());
    if std::fs::write(ledger.path(), data).is_err() {
        return;
    }
    let Some(t) = Utc.with_ymd_and_hms(2000, 1, 1, 0, 0, 0).single() else {
        return;
    };
    let Ok(sentinel) = schema.record(vec![Some(1.0), None], t) else {
        return;
    };
    if ledger.append(&sentinel).is_err() {
        return;
    }
    let Ok(before) = ledger.scan() else {
        return;
    };
    assert_eq!(before.records.last(), Some(&sentinel));

    let opts = ReplayOptions {
        max_consecutive_failures: u32::MAX,
        cancel: None,
    };
    let mut offered = Vec::new();
    let mut kept = Vec::new();
    let mut flip = false;
    if ledger
        .replay(&opts, |r| {
            offered.push(r.clone());
            flip = !flip;
            if flip {
                Delivery::Confirmed
            } else {
                kept.push(r.clone());
                Delivery::Timeout
            }
        })
        .is_ok()
    {
        assert_eq!(offered, before.records);
        let after = ledger.scan().unwrap_or_default();
        assert_eq!(after.malformed, 0);
        assert_eq!(after.records, kept);
        assert_eq!(after.other_width, before.other_width);
    }
});
