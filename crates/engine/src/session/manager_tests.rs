// SPDX-License-Identifier: MIT

use crate::session::DispatchError;
use crate::test_support::{c1, handle, Fixture, C1};
use dh_adapters::RuntimeError;
use dh_core::{EventKind, SessionMode, SessionStatus};
use std::time::Duration;

#[tokio::test]
async fn ensure_started_brings_session_to_running() {
    let fx = Fixture::new();
    let session = fx
        .sessions
        .ensure_started(&c1(), &handle(C1), SessionMode::Interactive)
        .await
        .unwrap();

    assert_eq!(session.status, SessionStatus::Running);
    assert!(session.token.is_some());
    assert_eq!(session.instruction_count, 0);
    assert!(!session.in_flight);
}

#[tokio::test]
async fn ensure_started_is_idempotent_and_keeps_token() {
    let fx = Fixture::new();
    let first = fx
        .sessions
        .ensure_started(&c1(), &handle(C1), SessionMode::Interactive)
        .await
        .unwrap();
    let second = fx
        .sessions
        .ensure_started(&c1(), &handle(C1), SessionMode::Interactive)
        .await
        .unwrap();

    assert_eq!(first.token, second.token);
    assert_eq!(fx.sessions.list().len(), 1);
}

#[tokio::test]
async fn concurrent_starts_observe_a_single_session() {
    let fx = Fixture::new();
    let a = {
        let sessions = fx.sessions.clone();
        tokio::spawn(async move {
            sessions.ensure_started(&c1(), &handle(C1), SessionMode::Interactive).await
        })
    };
    let b = {
        let sessions = fx.sessions.clone();
        tokio::spawn(async move {
            sessions.ensure_started(&c1(), &handle(C1), SessionMode::Interactive).await
        })
    };

    let a = a.await.unwrap().unwrap();
    let b = b.await.unwrap().unwrap();
    assert_eq!(a.token, b.token);
    assert_eq!(fx.sessions.list().len(), 1);
}

#[tokio::test]
async fn start_fails_fast_when_container_stopped() {
    let fx = Fixture::new();
    fx.runtime.set_running(&handle(C1), false);

    let err = fx
        .sessions
        .ensure_started(&c1(), &handle(C1), SessionMode::Interactive)
        .await
        .unwrap_err();
    assert_eq!(err, DispatchError::ContainerNotRunning);
    assert!(fx.sessions.status(&c1()).is_none());
}

#[tokio::test]
async fn start_surfaces_gone_container() {
    let fx = Fixture::new();
    fx.runtime.remove_container(&handle(C1));

    let err = fx
        .sessions
        .ensure_started(&c1(), &handle(C1), SessionMode::Interactive)
        .await
        .unwrap_err();
    assert!(matches!(err, DispatchError::Runtime(RuntimeError::Gone(_))));
}

#[tokio::test]
async fn stop_is_idempotent_and_safe_without_session() {
    let fx = Fixture::new();
    fx.sessions.stop(&c1()).await;

    fx.start_session().await;
    fx.sessions.stop(&c1()).await;
    fx.sessions.stop(&c1()).await;
    assert_eq!(fx.sessions.status(&c1()).unwrap().status, SessionStatus::Stopped);
}

#[tokio::test]
async fn restart_after_stop_reuses_token() {
    let fx = Fixture::new();
    let first = fx
        .sessions
        .ensure_started(&c1(), &handle(C1), SessionMode::Interactive)
        .await
        .unwrap();
    fx.sessions.stop(&c1()).await;

    let second = fx
        .sessions
        .ensure_started(&c1(), &handle(C1), SessionMode::Interactive)
        .await
        .unwrap();
    assert_eq!(second.status, SessionStatus::Running);
    assert_eq!(first.token, second.token);
}

#[tokio::test]
async fn start_and_stop_publish_session_events() {
    let fx = Fixture::new();
    let mut sub = fx
        .bus
        .subscribe_kinds(Some(&c1()), [EventKind::SessionStarted, EventKind::SessionStopped]);

    fx.start_session().await;
    fx.sessions.stop(&c1()).await;

    assert_eq!(sub.recv().await.unwrap().kind(), EventKind::SessionStarted);
    assert_eq!(sub.recv().await.unwrap().kind(), EventKind::SessionStopped);
}

#[tokio::test(start_paused = true)]
async fn idle_session_is_evicted_within_one_cycle() {
    let fx = Fixture::new();
    fx.start_session().await;

    let evictor = {
        let sessions = fx.sessions.clone();
        let shutdown = tokio_util::sync::CancellationToken::new();
        let guard = shutdown.clone();
        tokio::spawn(async move { sessions.run_evictor(shutdown).await });
        guard
    };

    // Make the session idle past the 30-minute timeout.
    fx.clock.advance(Duration::from_secs(31 * 60));
    // One eviction cycle (60 s, auto-advanced under paused time).
    tokio::time::sleep(Duration::from_secs(61)).await;

    assert_eq!(fx.sessions.status(&c1()).unwrap().status, SessionStatus::Stopped);
    evictor.cancel();
}

#[tokio::test(start_paused = true)]
async fn evictor_leaves_active_sessions_alone() {
    let fx = Fixture::new();
    fx.start_session().await;

    let shutdown = tokio_util::sync::CancellationToken::new();
    {
        let sessions = fx.sessions.clone();
        let shutdown = shutdown.clone();
        tokio::spawn(async move { sessions.run_evictor(shutdown).await });
    }

    // Recent activity: no eviction.
    tokio::time::sleep(Duration::from_secs(61)).await;
    assert_eq!(fx.sessions.status(&c1()).unwrap().status, SessionStatus::Running);
    shutdown.cancel();
}
