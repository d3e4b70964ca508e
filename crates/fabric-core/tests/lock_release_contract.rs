//! Contract Test: Blueprint Mutex Discipline
//!
//! Constraints verified:
//! - Every lock is matched by an unlock, on success and on failure
//! - A failed lock means no mutation is attempted
//! - Cancellation inside the locked section still releases the mutex
//! - Disabling the mutex skips lock calls entirely
//!
//! If this test fails, a run could leave a blueprint locked for others.

mod common;

use common::*;
use fabric_core::Error;
use fabric_core::config::EngineConfig;
use fabric_core::FabricEngine;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

#[tokio::test]
async fn remote_failure_releases_mutex() {
    let fabric = lab_fabric();
    let counting = Arc::new(CountingFabric::new(fabric.clone()));
    let (engine, _rx) = engine(counting.clone(), SharedStateStore::new());
    let cancel = CancellationToken::new();

    fabric.fail_next("create_generic_system", "internal server error");
    let summary = engine
        .apply(&[system("web", &[("leaf1", "xe-0/0/1")])], &cancel)
        .await
        .unwrap();

    assert_eq!(summary.failed.len(), 1);
    assert_eq!(counting.lock_calls(), counting.unlock_calls());
    assert!(!fabric.is_locked("bp"));
}

#[tokio::test]
async fn lock_failure_prevents_mutations() {
    let fabric = lab_fabric();
    let (engine, _rx) = engine(Arc::new(fabric.clone()), SharedStateStore::new());
    let cancel = CancellationToken::new();

    fabric.fail_next("lock", "held by another session");
    let summary = engine
        .apply(&[system("web", &[("leaf1", "xe-0/0/1")])], &cancel)
        .await
        .unwrap();

    assert_eq!(summary.failed.len(), 1);
    assert!(summary.failed[0].1.contains("held by another session"));
    assert!(mutations(&fabric).is_empty());
    assert_eq!(fabric.system_count("bp"), 0);
}

#[tokio::test]
async fn cancellation_inside_lock_releases_mutex() {
    let fabric = lab_fabric();
    let cancel = CancellationToken::new();
    let counting = Arc::new(CountingFabric::new(fabric.clone()).cancelling_on_lock(cancel.clone()));
    let (engine, _rx) = engine(counting.clone(), SharedStateStore::new());

    let err = engine
        .apply(&[system("web", &[("leaf1", "xe-0/0/1")])], &cancel)
        .await
        .unwrap_err();

    assert!(matches!(err, Error::Cancelled));
    assert_eq!(counting.lock_calls(), 1);
    assert_eq!(counting.unlock_calls(), 1);
    assert!(!fabric.is_locked("bp"));
    assert!(mutations(&fabric).is_empty());
}

#[tokio::test]
async fn disabled_mutex_issues_no_lock_calls() {
    let fabric = lab_fabric();
    let counting = Arc::new(CountingFabric::new(fabric.clone()));
    let config = EngineConfig {
        blueprint_mutex_disabled: true,
        ..EngineConfig::default()
    };
    let (engine, _rx) = FabricEngine::new(counting.clone(), Box::new(SharedStateStore::new()), &config).unwrap();
    let cancel = CancellationToken::new();

    let summary = engine
        .apply(&[system("web", &[("leaf1", "xe-0/0/1")])], &cancel)
        .await
        .unwrap();

    assert_eq!(summary.created, 1);
    assert_eq!(counting.lock_calls(), 0);
    assert_eq!(counting.unlock_calls(), 0);
}
