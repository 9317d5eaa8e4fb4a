// Copyright (c) 2025 R3BL LLC. Licensed under Apache License, Version 2.0.

//! Sleep and idle behavior observed through a real loop.

use evio::{ErrorCode, EventLoop};
use pretty_assertions::assert_eq;
use serial_test::serial;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

// Wall-clock assertions run serially so parallel test load does not skew
// the measured deltas.
#[test]
#[serial(timing)]
fn sleep_waits_at_least_the_period() {
    let recorded = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&recorded);

    EventLoop::run(move |ctx| async move {
        for _ in 0..5 {
            let before = Instant::now();
            ctx.sleep(50).await.unwrap();
            sink.lock().unwrap().push(before.elapsed());
        }
        ctx.stop().unwrap();
    })
    .unwrap();

    let deltas = recorded.lock().unwrap();
    assert_eq!(deltas.len(), 5);
    for delta in deltas.iter() {
        assert!(*delta >= Duration::from_millis(50), "woke early: {delta:?}");
        // Generous ceiling; a loaded CI box may overshoot, a broken timer
        // wheel overshoots by whole periods.
        assert!(*delta < Duration::from_millis(500), "woke far too late: {delta:?}");
    }
}

#[test]
fn sleeps_with_the_same_period_fire_in_issue_order() {
    let order = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&order);

    EventLoop::run(move |ctx| async move {
        for id in 0..3u32 {
            let sink = Arc::clone(&sink);
            let _ = ctx.spawn(move |ctx| async move {
                ctx.sleep(40).await.unwrap();
                sink.lock().unwrap().push(id);
            });
            // Stagger issuance within one bucket.
            ctx.sleep(5).await.unwrap();
        }
        ctx.sleep(120).await.unwrap();
        ctx.stop().unwrap();
    })
    .unwrap();

    assert_eq!(*order.lock().unwrap(), vec![0, 1, 2]);
}

#[test]
fn zero_period_sleep_returns_immediately() {
    EventLoop::run(|ctx| async move {
        let before = Instant::now();
        ctx.sleep(0).await.unwrap();
        assert!(before.elapsed() < Duration::from_millis(20));
        ctx.stop().unwrap();
    })
    .unwrap();
}

#[test]
#[serial(timing)]
fn idle_fires_only_after_inactivity() {
    EventLoop::run(|ctx| async move {
        let before = Instant::now();
        ctx.idle(60).await.unwrap();
        assert!(before.elapsed() >= Duration::from_millis(60));
        ctx.stop().unwrap();
    })
    .unwrap();
}

#[test]
fn stopping_the_loop_terminates_pending_sleeps() {
    let observed = Arc::new(Mutex::new(None));
    let sink = Arc::clone(&observed);

    EventLoop::run(move |ctx| async move {
        let sink2 = Arc::clone(&sink);
        let _ = ctx.spawn(move |ctx| async move {
            *sink2.lock().unwrap() = Some(ctx.sleep(60_000).await);
        });
        ctx.sleep(30).await.unwrap();
        ctx.stop().unwrap();
    })
    .unwrap();

    assert_eq!(*observed.lock().unwrap(), Some(Err(ErrorCode::Terminate)));
}

/// Idle timers measure loop inactivity: steady activity holds them off.
#[test]
#[serial(timing)]
fn activity_defers_idle_firing() {
    EventLoop::run(|ctx| async move {
        // A chatty neighbor: wakes the loop every 20 ms for a while.
        let _ = ctx.spawn(|ctx| async move {
            for _ in 0..8 {
                if ctx.sleep(20).await.is_err() {
                    return;
                }
            }
        });

        let before = Instant::now();
        ctx.idle(60).await.unwrap();
        let elapsed = before.elapsed();

        // Eight sleeps x 20 ms keep refreshing activity; the idle period
        // can only start counting once they stop.
        assert!(
            elapsed >= Duration::from_millis(180),
            "idle fired during activity: {elapsed:?}"
        );

        ctx.stop().unwrap();
    })
    .unwrap();
}
