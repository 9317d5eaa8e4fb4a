// Copyright (c) 2025 R3BL LLC. Licensed under Apache License, Version 2.0.

//! Cross-loop dispatch: post, exec, wait, stop-and-wait.

use evio::{ErrorCode, EventLoop};
use pretty_assertions::assert_eq;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

/// Spec scenario: ten posts from loop A land in loop B; an exec barrier
/// then observes all ten.
#[test]
fn posts_land_before_a_subsequent_exec_barrier() {
    let count = Arc::new(AtomicUsize::new(0));
    let observed = Arc::new(AtomicUsize::new(0));

    let count2 = Arc::clone(&count);
    let observed2 = Arc::clone(&observed);

    EventLoop::run(move |ctx| async move {
        let worker = EventLoop::start().unwrap();

        for _ in 0..10 {
            let count = Arc::clone(&count2);
            worker
                .post(move |_ctx| async move {
                    count.fetch_add(1, Ordering::SeqCst);
                })
                .unwrap();
        }

        // Same producer, same queue: the exec task runs after the posts.
        let count = Arc::clone(&count2);
        let observed = Arc::clone(&observed2);
        ctx.exec_on(&worker, move |_ctx| async move {
            observed.store(count.load(Ordering::SeqCst), Ordering::SeqCst);
        })
        .await
        .unwrap();

        ctx.stop_and_wait(&worker).await.unwrap();
        assert!(worker.is_terminated());
        ctx.stop().unwrap();
    })
    .unwrap();

    assert_eq!(observed.load(Ordering::SeqCst), 10);
    assert_eq!(count.load(Ordering::SeqCst), 10);
}

#[test]
fn exec_on_returns_after_remote_completion() {
    let trace = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&trace);

    EventLoop::run(move |ctx| async move {
        let worker = EventLoop::start().unwrap();

        let remote = Arc::clone(&sink);
        ctx.exec_on(&worker, move |ctx| async move {
            ctx.sleep(30).await.unwrap();
            remote.lock().unwrap().push("remote");
        })
        .await
        .unwrap();
        sink.lock().unwrap().push("after-exec");

        ctx.stop_and_wait(&worker).await.unwrap();
        ctx.stop().unwrap();
    })
    .unwrap();

    assert_eq!(*trace.lock().unwrap(), vec!["remote", "after-exec"]);
}

#[test]
fn wait_returns_when_the_target_stops() {
    EventLoop::run(|ctx| async move {
        let worker = EventLoop::start().unwrap();

        let stopper = worker.clone();
        std::thread::spawn(move || {
            std::thread::sleep(std::time::Duration::from_millis(40));
            stopper.stop().unwrap();
        });

        ctx.wait(&worker).await.unwrap();
        assert!(worker.is_terminated());
        ctx.stop().unwrap();
    })
    .unwrap();
}

#[test]
fn waiting_on_yourself_is_rejected() {
    EventLoop::run(|ctx| async move {
        let me = ctx.handle();
        assert_eq!(ctx.wait(&me).await, Err(ErrorCode::InvalidArgument));
        assert_eq!(ctx.stop_and_wait(&me).await, Err(ErrorCode::InvalidArgument));
        ctx.stop().unwrap();
    })
    .unwrap();
}

#[test]
fn posting_to_a_stopped_loop_fails_with_terminate() {
    EventLoop::run(|ctx| async move {
        let worker = EventLoop::start().unwrap();
        ctx.stop_and_wait(&worker).await.unwrap();

        let result = worker.post(|_ctx| async {});
        assert_eq!(result, Err(ErrorCode::Terminate));

        let exec = ctx.exec_on(&worker, |_ctx| async {}).await;
        assert_eq!(exec, Err(ErrorCode::Terminate));

        // Waiting on an already-dead loop completes immediately.
        ctx.wait(&worker).await.unwrap();
        ctx.stop().unwrap();
    })
    .unwrap();
}

/// Posts are accepted from plain threads, not just from other loops.
#[test]
fn post_from_a_non_loop_thread() {
    let hits = Arc::new(AtomicUsize::new(0));
    let hits2 = Arc::clone(&hits);

    let worker = EventLoop::start().unwrap();
    let handle = worker.clone();
    std::thread::spawn(move || {
        let hits = hits2;
        handle
            .post(move |_ctx| async move {
                hits.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();
    })
    .join()
    .unwrap();

    // Drive a second loop purely to wait for the worker's effect.
    EventLoop::run(move |ctx| async move {
        let worker = worker;
        ctx.exec_on(&worker, |_ctx| async {}).await.unwrap();
        ctx.stop_and_wait(&worker).await.unwrap();
        ctx.stop().unwrap();
    })
    .unwrap();

    assert_eq!(hits.load(Ordering::SeqCst), 1);
}

/// Self-post: a task may post into its own loop through the handle.
#[test]
fn self_post_runs_in_the_same_loop() {
    let ran = Arc::new(AtomicUsize::new(0));
    let ran2 = Arc::clone(&ran);

    EventLoop::run(move |ctx| async move {
        let me = ctx.handle();
        let ran = Arc::clone(&ran2);
        me.post(move |_ctx| async move {
            ran.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();

        // Parking and being woken by the posted task proves it ran here.
        let task = ctx.current_task().unwrap();
        let me2 = ctx.handle();
        let _ = ctx.spawn(move |_ctx| async move {
            let _ = me2.wakeup(task);
        });
        ctx.park().await;

        ctx.sleep(10).await.unwrap();
        ctx.stop().unwrap();
    })
    .unwrap();

    assert_eq!(ran.load(Ordering::SeqCst), 1);
}
