//! Integration tests for permit-bounded needles.

use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Barrier, mpsc};
use std::time::Duration;
use threadle::engine::DEFAULT_NEEDLE_PERMITS;
use threadle::error::BoxError;
use threadle::{Engine, Error, Threads};

fn fixed(threads: usize) -> Engine {
    Engine::new(Threads::Fixed(NonZeroUsize::new(threads).unwrap())).expect("failed to build engine")
}

const PATIENCE: Duration = Duration::from_secs(5);

/// Tracks how many tasks run at once and the highest value seen.
#[derive(Default)]
struct Concurrency {
    current: AtomicUsize,
    peak: AtomicUsize,
}

impl Concurrency {
    fn enter(&self) {
        let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
    }

    fn exit(&self) {
        self.current.fetch_sub(1, Ordering::SeqCst);
    }
}

#[test]
fn single_permit_serializes_a_wide_pool() {
    let engine = fixed(4);
    let needle = engine.needle_with(1).unwrap();
    let tracker = Arc::new(Concurrency::default());

    let handles: Vec<_> = (0..8)
        .map(|i| {
            let tracker = Arc::clone(&tracker);
            needle
                .execute(&format!("serial-{i}"), move || {
                    tracker.enter();
                    std::thread::sleep(Duration::from_millis(20));
                    tracker.exit();
                    Ok::<_, BoxError>(())
                })
                .unwrap()
        })
        .collect();

    needle.finish();
    for handle in handles {
        handle.wait().unwrap();
    }
    assert_eq!(tracker.peak.load(Ordering::SeqCst), 1);
    assert!(engine.close());
}

#[test]
fn needles_on_one_engine_do_not_share_permits() {
    let engine = fixed(4);
    let blocked = engine.needle_with(1).unwrap();
    let free = engine.needle_with(1).unwrap();

    let (started_tx, started_rx) = mpsc::channel();
    let gate = Arc::new(Barrier::new(2));
    let held_gate = Arc::clone(&gate);
    let held = blocked
        .execute("holds-permit", move || {
            started_tx.send(()).unwrap();
            held_gate.wait();
            Ok::<_, BoxError>(())
        })
        .unwrap();
    started_rx.recv_timeout(PATIENCE).unwrap();
    assert_eq!(blocked.available(), 0);

    // The other needle still has its permit.
    let value = free.submit("independent", || Ok::<_, BoxError>(5)).unwrap();
    assert_eq!(value.wait().unwrap(), 5);

    gate.wait();
    held.wait().unwrap();
    blocked.finish();
    assert_eq!(blocked.available(), 1);
    assert!(engine.close());
}

#[test]
fn default_permits_are_captured_at_creation() {
    let engine = Engine::new(Threads::Direct).unwrap();
    assert_eq!(engine.needle().unwrap().permits(), DEFAULT_NEEDLE_PERMITS);

    engine.set_needle_permits(2);
    let early = engine.needle().unwrap();
    engine.set_needle_permits(5);

    assert_eq!(early.permits(), 2);
    assert_eq!(engine.needle().unwrap().permits(), 5);
}

#[test]
fn finish_waits_for_in_flight_submissions() {
    let engine = fixed(3);
    let needle = engine.needle_with(3).unwrap();
    let done = Arc::new(AtomicUsize::new(0));

    let handles: Vec<_> = (0..3)
        .map(|i| {
            let done = Arc::clone(&done);
            needle
                .execute(&format!("slow-{i}"), move || {
                    std::thread::sleep(Duration::from_millis(100));
                    done.fetch_add(1, Ordering::SeqCst);
                    Ok::<_, BoxError>(())
                })
                .unwrap()
        })
        .collect();

    needle.finish();
    assert_eq!(done.load(Ordering::SeqCst), 3);
    assert_eq!(needle.available(), 3);
    for handle in handles {
        handle.wait().unwrap();
    }
}

#[test]
fn failed_attempts_release_their_permit() {
    let engine = fixed(2).with_retries(2);
    let needle = engine.needle_with(1).unwrap();
    let attempts = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&attempts);

    let handle = needle
        .submit("always-fails", move || {
            counter.fetch_add(1, Ordering::SeqCst);
            Err::<(), _>("nope")
        })
        .unwrap();

    assert!(handle.wait_final().is_err());
    assert_eq!(attempts.load(Ordering::SeqCst), 3);

    // The permit came back, so another submission goes straight through.
    let next = needle.submit("after", || Ok::<_, BoxError>("ok")).unwrap();
    assert_eq!(next.wait().unwrap(), "ok");
    assert!(engine.close());
}

#[test]
fn zero_permits_is_an_invalid_argument() {
    let engine = Engine::new(Threads::Direct).unwrap();
    assert!(matches!(
        engine.needle_with(0).unwrap_err(),
        Error::InvalidArgument(_)
    ));

    engine.set_needle_permits(0);
    assert!(matches!(
        engine.needle().unwrap_err(),
        Error::InvalidArgument(_)
    ));
}

#[test]
fn needle_rejects_after_engine_close() {
    let engine = fixed(1);
    let needle = engine.needle_with(2).unwrap();
    assert!(engine.close());

    let err = needle.submit("late", || Ok::<_, BoxError>(())).unwrap_err();
    assert!(matches!(err, Error::Rejected(_)));
    assert_eq!(needle.available(), 2);
    assert_eq!(engine.remaining(), 0);
}
