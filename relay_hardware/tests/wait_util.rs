use std::sync::{
    Arc,
    atomic::{AtomicBool, AtomicU32, Ordering},
};
use std::thread;
use std::time::Duration;

use relay_hardware::error::HwError;
use relay_hardware::util::wait_until_ready;

#[test]
fn wait_until_ready_success_path() {
    let ready = Arc::new(AtomicBool::new(false));
    let ready_bg = ready.clone();
    thread::spawn(move || {
        thread::sleep(Duration::from_millis(3));
        ready_bg.store(true, Ordering::Relaxed);
    });

    let res = wait_until_ready(
        || Ok(ready.load(Ordering::Relaxed)),
        Duration::from_millis(200),
        Duration::from_micros(200),
    );
    assert!(res.is_ok(), "expected success, got {res:?}");
}

#[test]
fn wait_until_ready_timeout_path() {
    let err = wait_until_ready(
        || Ok(false),
        Duration::from_millis(5),
        Duration::from_micros(200),
    )
    .expect_err("expected timeout error");

    match err {
        HwError::ConversionTimeout => {}
        other => panic!("unexpected error: {other:?}"),
    }
}

#[test]
fn predicate_error_ends_the_wait() {
    let polls = AtomicU32::new(0);
    let err = wait_until_ready(
        || {
            polls.fetch_add(1, Ordering::Relaxed);
            Err(HwError::Bus("nack".into()))
        },
        Duration::from_secs(1),
        Duration::from_micros(200),
    )
    .expect_err("bus error propagates");
    assert!(matches!(err, HwError::Bus(_)));
    assert_eq!(polls.load(Ordering::Relaxed), 1);
}
