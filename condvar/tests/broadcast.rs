// Copyright 2020-2022 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

//! Wakeup coverage and ordering: broadcast releases every waiter, signal
//! releases the oldest, signal_back the newest.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tmkit_condvar::TmCondvar;
use tmkit_stm::{Algorithm, Runtime, TCell};

#[ctor::ctor]
fn select_algorithm() {
    #[cfg(feature = "verbose")]
    env_logger::builder()
        .is_test(true)
        .filter_level(log::LevelFilter::Debug)
        .init();

    Runtime::select(Algorithm::MlLazy).expect("algorithm pinned for this binary");
}

/// Spins until `waiting` reaches `n`, transactionally.
fn await_waiters(waiting: &TCell<usize>, n: usize) {
    loop {
        let current = Runtime::atomic(|tx| waiting.read(tx));
        if current >= n {
            return;
        }
        std::thread::yield_now();
    }
}

#[test]
fn test_broadcast_releases_every_waiter() {
    const WAITERS: usize = 8;

    let cv = Arc::new(TmCondvar::new());
    let waiting = Arc::new(TCell::new(0usize));
    let woken = Arc::new(AtomicUsize::new(0));

    let mut threads = Vec::new();
    for _ in 0..WAITERS {
        let cv = cv.clone();
        let waiting = waiting.clone();
        let woken = woken.clone();
        threads.push(std::thread::spawn(move || {
            Runtime::atomic(|tx| {
                let w = waiting.read(tx)?;
                waiting.write(tx, w + 1)?;
                cv.wait(tx)
            });
            woken.fetch_add(1, Ordering::SeqCst);
        }));
    }

    await_waiters(&waiting, WAITERS);
    Runtime::atomic(|tx| cv.broadcast(tx));

    for thread in threads {
        thread.join().unwrap();
    }
    assert_eq!(woken.load(Ordering::SeqCst), WAITERS);
}

#[test]
fn test_repeated_broadcast_rounds_lose_nobody() {
    const WAITERS: usize = 4;
    const ROUNDS: usize = 50;

    let cv = Arc::new(TmCondvar::new());
    let waiting = Arc::new(TCell::new(0usize));
    let woken = Arc::new(AtomicUsize::new(0));

    let mut threads = Vec::new();
    for _ in 0..WAITERS {
        let cv = cv.clone();
        let waiting = waiting.clone();
        let woken = woken.clone();
        threads.push(std::thread::spawn(move || {
            for _ in 0..ROUNDS {
                Runtime::atomic(|tx| {
                    let w = waiting.read(tx)?;
                    waiting.write(tx, w + 1)?;
                    cv.wait(tx)
                });
                woken.fetch_add(1, Ordering::SeqCst);
            }
        }));
    }

    for round in 1..=ROUNDS {
        await_waiters(&waiting, round * WAITERS);
        Runtime::atomic(|tx| cv.broadcast(tx));
    }

    for thread in threads {
        thread.join().unwrap();
    }
    assert_eq!(woken.load(Ordering::SeqCst), WAITERS * ROUNDS);
}

/// Starts `n` waiters one at a time so the queue order is known, each
/// recording its id when it wakes.
fn spawn_ordered_waiters(
    n: usize,
    cv: &Arc<TmCondvar>,
    waiting: &Arc<TCell<usize>>,
    order: &Arc<Mutex<Vec<usize>>>,
) -> Vec<std::thread::JoinHandle<()>> {
    let mut threads = Vec::new();
    for id in 0..n {
        let cv = cv.clone();
        let waiting_clone = waiting.clone();
        let order = order.clone();
        threads.push(std::thread::spawn(move || {
            Runtime::atomic(|tx| {
                let w = waiting_clone.read(tx)?;
                waiting_clone.write(tx, w + 1)?;
                cv.wait(tx)
            });
            order.lock().unwrap().push(id);
        }));
        await_waiters(waiting.as_ref(), id + 1);
    }
    threads
}

fn await_order_len(order: &Arc<Mutex<Vec<usize>>>, n: usize) {
    while order.lock().unwrap().len() < n {
        std::thread::sleep(Duration::from_millis(1));
    }
}

#[test]
fn test_signal_wakes_oldest_first() {
    const WAITERS: usize = 3;

    let cv = Arc::new(TmCondvar::new());
    let waiting = Arc::new(TCell::new(0usize));
    let order = Arc::new(Mutex::new(Vec::new()));

    let threads = spawn_ordered_waiters(WAITERS, &cv, &waiting, &order);

    for expected in 0..WAITERS {
        Runtime::atomic(|tx| cv.signal(tx));
        await_order_len(&order, expected + 1);
        assert_eq!(order.lock().unwrap()[expected], expected);
    }

    for thread in threads {
        thread.join().unwrap();
    }
    assert_eq!(*order.lock().unwrap(), vec![0, 1, 2]);
}

#[test]
fn test_signal_back_wakes_newest_first() {
    const WAITERS: usize = 3;

    let cv = Arc::new(TmCondvar::new());
    let waiting = Arc::new(TCell::new(0usize));
    let order = Arc::new(Mutex::new(Vec::new()));

    let threads = spawn_ordered_waiters(WAITERS, &cv, &waiting, &order);

    for round in 0..WAITERS {
        Runtime::atomic(|tx| cv.signal_back(tx));
        await_order_len(&order, round + 1);
        assert_eq!(order.lock().unwrap()[round], WAITERS - 1 - round);
    }

    for thread in threads {
        thread.join().unwrap();
    }
    assert_eq!(*order.lock().unwrap(), vec![2, 1, 0]);
}

#[test]
fn test_signal_on_empty_queue_wakes_nobody_later() {
    let cv = Arc::new(TmCondvar::new());

    // Signals on an empty queue must not bank a wakeup.
    Runtime::atomic(|tx| cv.signal(tx));
    Runtime::atomic(|tx| cv.broadcast(tx));

    let waiting = Arc::new(TCell::new(0usize));
    let woken = Arc::new(AtomicUsize::new(0));

    let t_cv = cv.clone();
    let t_waiting = waiting.clone();
    let t_woken = woken.clone();
    let waiter = std::thread::spawn(move || {
        Runtime::atomic(|tx| {
            let w = t_waiting.read(tx)?;
            t_waiting.write(tx, w + 1)?;
            t_cv.wait(tx)
        });
        t_woken.fetch_add(1, Ordering::SeqCst);
    });

    await_waiters(&waiting, 1);
    std::thread::sleep(Duration::from_millis(20));
    assert_eq!(woken.load(Ordering::SeqCst), 0, "waiter woke without a signal");

    Runtime::atomic(|tx| cv.signal(tx));
    waiter.join().unwrap();
    assert_eq!(woken.load(Ordering::SeqCst), 1);
}
