//! Fleet supervisor tests: launch authorization under concurrency,
//! reconciliation, and retirement.


use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use test_harness::{assert_eventually, fast_fleet_config, fill_queue, idle_supervisor, FakeProvider};
use tokio_util::sync::CancellationToken;

use batchd::error::ProviderError;
use batchd::fleet::{Instance, InstanceRetirer};

#[tokio::test]
async fn test_concurrent_launchers_grant_one_launch_per_queued_task() {
    let provider = Arc::new(FakeProvider::new().with_deploy_delay(Duration::from_millis(50)));
    let (supervisor, queue) = idle_supervisor(provider.clone(), fast_fleet_config(200, 16));
    let _results = fill_queue(&queue, 5);

    let handles: Vec<_> = (0..16)
        .map(|_| {
            let supervisor = supervisor.clone();
            tokio::spawn(async move { supervisor.launch_once().await })
        })
        .collect();

    let mut launched = 0;
    for handle in handles {
        if handle.await.unwrap().unwrap() {
            launched += 1;
        }
    }

    assert_eq!(launched, 5);
    assert_eq!(provider.deploys(), 5);
    let status = supervisor.status().await;
    assert_eq!(status.instances.len(), 5);
    assert_eq!(status.launches_in_flight, 0);
    assert_eq!(status.queue_length, 5);

    // Pressure is fully covered now.
    assert!(!supervisor.launch_once().await.unwrap());
}

#[tokio::test]
async fn test_launches_respect_fleet_ceiling() {
    let provider = Arc::new(FakeProvider::new().with_deploy_delay(Duration::from_millis(20)));
    let (supervisor, queue) = idle_supervisor(provider.clone(), fast_fleet_config(3, 8));
    let _results = fill_queue(&queue, 10);

    let outcomes = join_all((0..8).map(|_| supervisor.launch_once())).await;
    let launched = outcomes.into_iter().filter(|o| *o.as_ref().unwrap()).count();

    assert_eq!(launched, 3);
    assert_eq!(provider.deploys(), 3);
    assert_eq!(supervisor.instance_count().await, 3);
    assert!(!supervisor.launch_once().await.unwrap());
}

#[tokio::test]
async fn test_failed_deploy_releases_its_grant() {
    let provider = Arc::new(FakeProvider::new());
    let (supervisor, queue) = idle_supervisor(provider.clone(), fast_fleet_config(10, 1));
    let _results = fill_queue(&queue, 1);

    provider.set_fail_deploys(true);
    let err = supervisor.launch_once().await.unwrap_err();
    assert!(matches!(err, ProviderError::Api { status: 500, .. }));

    let status = supervisor.status().await;
    assert_eq!(status.launches_in_flight, 0);
    assert!(status.instances.is_empty());

    provider.set_fail_deploys(false);
    assert!(supervisor.launch_once().await.unwrap());
    assert_eq!(supervisor.instance_count().await, 1);
}

#[tokio::test]
async fn test_empty_queue_launches_nothing() {
    let provider = Arc::new(FakeProvider::new());
    let (supervisor, _queue) = idle_supervisor(provider.clone(), fast_fleet_config(10, 1));

    assert!(!supervisor.launch_once().await.unwrap());
    assert_eq!(provider.deploys(), 0);
}

#[tokio::test]
async fn test_instance_without_address_is_adopted_by_reconciliation() {
    let provider = Arc::new(FakeProvider::new().without_addresses());
    let (supervisor, queue) = idle_supervisor(provider.clone(), fast_fleet_config(10, 1));
    let _results = fill_queue(&queue, 1);

    assert!(supervisor.launch_once().await.unwrap());
    assert_eq!(supervisor.instance_count().await, 0);
    assert_eq!(supervisor.status().await.launches_in_flight, 0);

    // The provider listing carries the address.
    assert_eq!(supervisor.reconcile_once().await.unwrap(), 1);
    assert!(supervisor.knows("i-1").await);
}

#[tokio::test]
async fn test_reconcile_registers_unknown_instances_once() {
    let provider = Arc::new(FakeProvider::new());
    provider.seed(Instance::new("i-a", "192.0.2.1"));
    provider.seed(Instance {
        id: "i-b".to_string(),
        address: None,
    });
    let (supervisor, _queue) = idle_supervisor(provider.clone(), fast_fleet_config(10, 1));

    assert!(supervisor.status().await.reconciled_at.is_none());
    assert_eq!(supervisor.reconcile_once().await.unwrap(), 1);
    assert!(supervisor.knows("i-a").await);
    assert!(!supervisor.knows("i-b").await);

    assert_eq!(supervisor.reconcile_once().await.unwrap(), 0);
    let status = supervisor.status().await;
    assert_eq!(status.instances.len(), 1);
    assert!(status.reconciled_at.is_some());
}

#[tokio::test]
async fn test_reconciled_instances_count_against_ceiling() {
    let provider = Arc::new(FakeProvider::new());
    provider.seed(Instance::new("i-a", "192.0.2.1"));
    provider.seed(Instance::new("i-b", "192.0.2.2"));
    let (supervisor, queue) = idle_supervisor(provider.clone(), fast_fleet_config(2, 1));
    let _results = fill_queue(&queue, 5);

    supervisor.reconcile_once().await.unwrap();
    assert!(!supervisor.launch_once().await.unwrap());
    assert_eq!(provider.deploys(), 0);
}

#[tokio::test]
async fn test_retire_is_idempotent() {
    let provider = Arc::new(FakeProvider::new());
    provider.seed(Instance::new("i-a", "192.0.2.1"));
    let (supervisor, _queue) = idle_supervisor(provider.clone(), fast_fleet_config(10, 1));
    supervisor.reconcile_once().await.unwrap();

    supervisor.retire("i-a").await.unwrap();
    assert!(!supervisor.knows("i-a").await);
    assert_eq!(provider.destroyed(), vec!["i-a".to_string()]);

    // Already gone at the provider: still success.
    supervisor.retire("i-a").await.unwrap();
    assert_eq!(provider.destroyed().len(), 1);
}

#[tokio::test]
async fn test_stale_listing_does_not_readopt_retired_instance() {
    let provider = Arc::new(FakeProvider::new());
    provider.seed(Instance::new("i-a", "192.0.2.1"));
    let (supervisor, _queue) = idle_supervisor(provider.clone(), fast_fleet_config(10, 1));
    supervisor.reconcile_once().await.unwrap();

    let gate = provider.hold_listings();
    let reconcile = {
        let supervisor = supervisor.clone();
        tokio::spawn(async move { supervisor.reconcile_once().await })
    };
    assert_eventually(
        || async { provider.listings() == 2 },
        Duration::from_secs(2),
        "listing should have taken its snapshot",
    )
    .await;

    // Retired after the listing saw it, before the listing is applied.
    supervisor.retire("i-a").await.unwrap();
    assert_eq!(provider.live_count(), 0);
    gate.notify_one();

    assert_eq!(reconcile.await.unwrap().unwrap(), 0);
    assert!(!supervisor.knows("i-a").await);
    assert_eq!(supervisor.instance_count().await, 0);

    gate.notify_one();
    assert_eq!(supervisor.reconcile_once().await.unwrap(), 0);
    assert!(!supervisor.knows("i-a").await);
}

#[tokio::test]
async fn test_failed_destroy_keeps_instance_known() {
    let provider = Arc::new(FakeProvider::new());
    provider.seed(Instance::new("i-a", "192.0.2.1"));
    let (supervisor, _queue) = idle_supervisor(provider.clone(), fast_fleet_config(10, 1));
    supervisor.reconcile_once().await.unwrap();

    provider.fail_next_destroys(1);
    assert!(supervisor.retire("i-a").await.is_err());
    assert!(supervisor.knows("i-a").await);
    assert_eq!(provider.live_count(), 1);

    supervisor.retire("i-a").await.unwrap();
    assert!(!supervisor.knows("i-a").await);
}

#[tokio::test]
async fn test_started_supervisor_scales_to_queue_and_stops_on_shutdown() {
    let provider = Arc::new(FakeProvider::new());
    let (supervisor, queue) = idle_supervisor(provider.clone(), fast_fleet_config(10, 4));
    let _results = fill_queue(&queue, 3);

    let shutdown = CancellationToken::new();
    let handles = supervisor.start(shutdown.clone());
    assert_eq!(handles.len(), 5);

    assert_eventually(
        || async { supervisor.instance_count().await == 3 },
        Duration::from_secs(2),
        "fleet should grow to the queue length",
    )
    .await;

    shutdown.cancel();
    let stopped = tokio::time::timeout(Duration::from_secs(2), join_all(handles)).await;
    assert!(stopped.is_ok(), "fleet loops should stop on shutdown");
    assert_eq!(provider.deploys(), 3);
}
