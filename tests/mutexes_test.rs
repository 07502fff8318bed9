//! Integration tests for the keyed mutex registry.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Barrier, Mutex, mpsc};
use std::time::Duration;
use threadle::KeyedMutexes;

const PATIENCE: Duration = Duration::from_secs(5);

#[test]
fn same_key_serializes_critical_sections() {
    let mutexes = Arc::new(KeyedMutexes::<&'static str>::new());
    let inside = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));

    let workers: Vec<_> = (0..8)
        .map(|_| {
            let mutexes = Arc::clone(&mutexes);
            let inside = Arc::clone(&inside);
            let peak = Arc::clone(&peak);
            std::thread::spawn(move || {
                for _ in 0..10 {
                    let _held = mutexes.acquire("shared");
                    let now = inside.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    std::thread::sleep(Duration::from_millis(1));
                    inside.fetch_sub(1, Ordering::SeqCst);
                }
            })
        })
        .collect();

    for worker in workers {
        worker.join().unwrap();
    }
    assert_eq!(peak.load(Ordering::SeqCst), 1);
    assert_eq!(mutexes.len(), 1);
}

#[test]
fn different_keys_do_not_block_each_other() {
    let mutexes = Arc::new(KeyedMutexes::<String>::new());
    let held = mutexes.acquire("left".to_string());

    let (tx, rx) = mpsc::channel();
    let other = Arc::clone(&mutexes);
    let worker = std::thread::spawn(move || {
        let handle = other.acquire("right".to_string());
        tx.send(()).unwrap();
        handle.release();
    });

    rx.recv_timeout(PATIENCE).unwrap();
    worker.join().unwrap();
    held.release();
    assert_eq!(mutexes.len(), 2);
}

#[test]
fn waiter_proceeds_once_holder_releases() {
    let mutexes = Arc::new(KeyedMutexes::<u64>::fair());
    assert!(mutexes.is_fair());
    let held = mutexes.acquire(7);

    let (tx, rx) = mpsc::channel();
    let ready = Arc::new(Barrier::new(2));
    let other = Arc::clone(&mutexes);
    let other_ready = Arc::clone(&ready);
    let waiter = std::thread::spawn(move || {
        other_ready.wait();
        let _held = other.acquire(7);
        tx.send(()).unwrap();
    });

    ready.wait();
    std::thread::sleep(Duration::from_millis(100));
    assert!(rx.try_recv().is_err(), "waiter entered a held lock");

    held.release();
    rx.recv_timeout(PATIENCE).unwrap();
    waiter.join().unwrap();
}

#[test]
fn fair_registry_hands_the_lock_over_in_arrival_order() {
    let mutexes = Arc::new(KeyedMutexes::<&'static str>::fair());
    let order = Arc::new(Mutex::new(Vec::new()));
    let held = mutexes.acquire("queue");

    // Start each waiter only after the previous one has had time to park.
    let waiters: Vec<_> = (1..=4)
        .map(|id| {
            let mutexes = Arc::clone(&mutexes);
            let order = Arc::clone(&order);
            let waiter = std::thread::spawn(move || {
                let handle = mutexes.acquire("queue");
                order.lock().unwrap().push(id);
                std::thread::sleep(Duration::from_millis(5));
                handle.release();
            });
            std::thread::sleep(Duration::from_millis(100));
            waiter
        })
        .collect();

    assert!(order.lock().unwrap().is_empty());
    held.release();
    for waiter in waiters {
        waiter.join().unwrap();
    }
    assert_eq!(*order.lock().unwrap(), vec![1, 2, 3, 4]);
}

#[test]
fn holder_can_reacquire_its_own_key() {
    let mutexes = KeyedMutexes::new();
    let outer = mutexes.acquire("file");
    let inner = mutexes.acquire("file");
    assert!(mutexes.try_acquire("file").is_some());
    drop(inner);
    outer.release();
}

#[test]
fn dropping_the_handle_releases_the_lock() {
    let mutexes = Arc::new(KeyedMutexes::<&'static str>::new());

    let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
        let _held = mutexes.acquire("poisoned?");
        panic!("critical section failed");
    }));
    assert!(result.is_err());

    let other = Arc::clone(&mutexes);
    let acquired = std::thread::spawn(move || other.try_acquire("poisoned?").is_some())
        .join()
        .unwrap();
    assert!(acquired);
}
