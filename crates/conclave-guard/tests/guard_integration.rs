#![allow(clippy::unwrap_used, clippy::expect_used)]
//! Integration tests for the concurrency guard.

use conclave_core::{ConclaveError, GuardConfig};
use conclave_guard::{ConcurrencyGuard, GuardConfigWatcher, LiveLimits};
use std::sync::Arc;
use std::time::{Duration, Instant};

fn config(global: usize, tenant: usize, timeout_sec: f64) -> GuardConfig {
    GuardConfig {
        global_max_concurrency: global,
        tenant_max_concurrency: tenant,
        acquire_timeout_sec: timeout_sec,
        poll_interval_ms: 10,
        ..GuardConfig::default()
    }
}

#[test]
fn test_full_guard_times_out() {
    let guard = ConcurrencyGuard::with_config(config(1, 0, 0.1));
    let _held = guard.acquire("acme").unwrap();

    let started = Instant::now();
    let err = guard.acquire("globex").unwrap_err();
    assert!(started.elapsed() >= Duration::from_millis(100));
    assert!(err.to_agent_message().starts_with("[resource_timeout]"));
    match err {
        ConclaveError::ResourceTimeout { tenant, .. } => assert_eq!(tenant, "globex"),
        other => panic!("unexpected error: {other}"),
    }
}

#[test]
fn test_release_unblocks_waiter() {
    let guard = ConcurrencyGuard::with_config(config(1, 0, 5.0));
    let held = guard.acquire("acme").unwrap();

    let waiter = {
        let guard = guard.clone();
        std::thread::spawn(move || {
            let ticket = guard.acquire("acme").unwrap();
            ticket.tenant().to_string()
        })
    };

    std::thread::sleep(Duration::from_millis(50));
    assert_eq!(guard.snapshot().global_running, 1);
    held.release();

    assert_eq!(waiter.join().unwrap(), "acme");
    assert_eq!(guard.snapshot().global_running, 0);
}

#[test]
fn test_rate_limit_times_out() {
    let guard = ConcurrencyGuard::with_config(GuardConfig {
        tenant_calls_per_minute: 1,
        acquire_timeout_sec: 0.1,
        poll_interval_ms: 10,
        ..GuardConfig::default()
    });

    drop(guard.acquire("acme").unwrap());
    let err = guard.acquire("acme").unwrap_err();
    assert!(matches!(err, ConclaveError::ResourceTimeout { .. }));

    // Another tenant has its own window.
    assert!(guard.acquire("globex").is_ok());

    let snapshot = guard.snapshot();
    assert_eq!(snapshot.global_running, 0);
    assert_eq!(snapshot.global_calls_last_minute, 2);
    assert_eq!(snapshot.tenant_calls_last_minute.get("acme"), Some(&1));
}

#[test]
fn test_tenant_limit_is_per_tenant() {
    let guard = ConcurrencyGuard::with_config(config(0, 1, 0.05));
    let _a = guard.acquire("acme").unwrap();
    let _b = guard.acquire("globex").unwrap();
    assert!(guard.acquire("acme").is_err());

    let snapshot = guard.snapshot();
    assert_eq!(snapshot.global_running, 2);
    assert_eq!(snapshot.tenant_running.get("acme"), Some(&1));
    assert_eq!(snapshot.tenant_running.get("globex"), Some(&1));
}

#[test]
fn test_zero_limits_are_unlimited() {
    let guard = ConcurrencyGuard::with_config(config(0, 0, 0.05));
    let tickets: Vec<_> = (0..50).map(|_| guard.acquire("acme").unwrap()).collect();
    assert_eq!(guard.snapshot().global_running, 50);
    drop(tickets);
    assert_eq!(guard.snapshot().global_running, 0);
}

#[test]
fn test_disabled_guard_hands_out_noop_tickets() {
    let guard = ConcurrencyGuard::with_config(GuardConfig {
        enabled: false,
        global_max_concurrency: 1,
        ..GuardConfig::default()
    });
    let a = guard.acquire("acme").unwrap();
    let b = guard.acquire("acme").unwrap();
    assert!(a.is_noop());
    assert!(b.is_noop());
    assert_eq!(guard.snapshot().global_running, 0);
}

#[test]
fn test_release_is_idempotent() {
    let guard = ConcurrencyGuard::with_config(config(2, 0, 0.05));
    let a = guard.acquire("acme").unwrap();
    let _b = guard.acquire("acme").unwrap();

    a.release();
    a.release();
    drop(a);
    assert_eq!(guard.snapshot().global_running, 1);
    assert_eq!(guard.snapshot().tenant_running.get("acme"), Some(&1));
}

#[test]
fn test_drop_releases_slot() {
    let guard = ConcurrencyGuard::with_config(config(1, 0, 0.05));
    {
        let _ticket = guard.acquire("acme").unwrap();
        assert!(guard.acquire("acme").is_err());
    }
    assert!(guard.acquire("acme").is_ok());
}

#[test]
fn test_raised_limit_admits_waiter() {
    let live = Arc::new(LiveLimits::new(config(1, 0, 5.0)));
    let guard = ConcurrencyGuard::new(live.clone());
    let _held = guard.acquire("acme").unwrap();

    let waiter = {
        let guard = guard.clone();
        std::thread::spawn(move || guard.acquire("acme").map(|t| t.tenant().to_string()))
    };

    std::thread::sleep(Duration::from_millis(50));
    assert!(live.set(config(2, 0, 5.0)));
    assert_eq!(waiter.join().unwrap().unwrap(), "acme");
    assert_eq!(guard.limits().global_max_concurrency, 2);
}

#[tokio::test]
async fn test_acquire_async_waits_for_release() {
    let guard = ConcurrencyGuard::with_config(config(1, 0, 5.0));
    let held = guard.acquire_async("acme").await.unwrap();

    let waiter = {
        let guard = guard.clone();
        tokio::spawn(async move { guard.acquire_async("acme").await.is_ok() })
    };

    tokio::time::sleep(Duration::from_millis(50)).await;
    drop(held);
    assert!(waiter.await.unwrap());
}

#[tokio::test]
async fn test_acquire_async_times_out() {
    let guard = ConcurrencyGuard::with_config(config(1, 0, 0.05));
    let _held = guard.acquire_async("acme").await.unwrap();
    let err = guard.acquire_async("acme").await.unwrap_err();
    assert!(matches!(err, ConclaveError::ResourceTimeout { .. }));
}

#[test]
fn test_watcher_applies_rewritten_config_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("conclave.toml");
    std::fs::write(&path, "[guard]\nglobal_max_concurrency = 2\n").unwrap();

    let live = Arc::new(LiveLimits::new(config(2, 0, 5.0)));
    let guard = ConcurrencyGuard::new(live.clone());
    let _watcher = GuardConfigWatcher::start(path.clone(), 10, live).unwrap();

    std::fs::write(&path, "[guard]\nglobal_max_concurrency = 7\n").unwrap();
    let deadline = Instant::now() + Duration::from_secs(5);
    while guard.limits().global_max_concurrency != 7 && Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(20));
    }
    assert_eq!(guard.limits().global_max_concurrency, 7);
}
