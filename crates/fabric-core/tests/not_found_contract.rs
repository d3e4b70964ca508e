//! Contract Test: Not-Found Tolerance
//!
//! Constraints verified:
//! - Deleting an object that is already gone succeeds
//! - A vanished blueprint drops its resources from tracked state on refresh
//! - A vanished generic system is recreated on the next apply
//!
//! If this test fails, out-of-band deletions would wedge every later run.

mod common;

use common::*;
use fabric_core::EngineEvent;
use fabric_core::traits::StateStore;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

#[tokio::test]
async fn destroy_of_vanished_system_succeeds() {
    let fabric = lab_fabric();
    let store = SharedStateStore::new();
    let (engine, _rx) = engine(Arc::new(fabric.clone()), store.clone());
    let cancel = CancellationToken::new();

    engine
        .apply(&[system("web", &[("leaf1", "xe-0/0/1")])], &cancel)
        .await
        .unwrap();
    let id = tracked_system_id(&store, "web").await;
    fabric.remove_system("bp", id.as_str());

    let summary = engine.destroy(&cancel).await.unwrap();
    assert!(summary.is_success(), "{:?}", summary.failed);
    assert!(store.list_resources().await.unwrap().is_empty());
}

#[tokio::test]
async fn vanished_blueprint_is_dropped_on_refresh() {
    let fabric = lab_fabric();
    let store = SharedStateStore::new();
    let (engine, mut rx) = engine(Arc::new(fabric.clone()), store.clone());
    let cancel = CancellationToken::new();

    engine
        .apply(&[system("web", &[("leaf1", "xe-0/0/1")])], &cancel)
        .await
        .unwrap();
    fabric.remove_blueprint("bp");
    drain(&mut rx);

    let summary = engine.refresh(&cancel).await.unwrap();
    assert_eq!(summary.removed, 1);
    assert!(store.get_resource("web").await.unwrap().is_none());
    assert!(drain(&mut rx).contains(&EngineEvent::ResourceRemoved { address: "web".into() }));
}

#[tokio::test]
async fn vanished_system_is_recreated() {
    let fabric = lab_fabric();
    let store = SharedStateStore::new();
    let (engine, _rx) = engine(Arc::new(fabric.clone()), store.clone());
    let cancel = CancellationToken::new();
    let config = [system("web", &[("leaf1", "xe-0/0/1")])];

    engine.apply(&config, &cancel).await.unwrap();
    let first = tracked_system_id(&store, "web").await;
    fabric.remove_system("bp", first.as_str());

    let summary = engine.apply(&config, &cancel).await.unwrap();
    assert_eq!((summary.removed, summary.created), (1, 1));

    let second = tracked_system_id(&store, "web").await;
    assert_ne!(first, second);
    assert_eq!(fabric.system_count("bp"), 1);
}
