mod common;

use async_trait::async_trait;
use common::{settle, NodeBuilder};
use lease::ipc::{LeaseQueryClient, LeaseQueryService, LoopbackIpc};
use lease::{ConfigStore, LeaseConfig, LeaseHarness, LeaseMonitor, LeaseTtl, MonitorMode, Result};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{sleep, sleep_until, Instant};

/// Replays scripted replies; once the script runs out every query hangs.
struct ScriptedClient {
    replies: Mutex<VecDeque<(Duration, LeaseTtl)>>,
    queries: Mutex<usize>,
}

impl ScriptedClient {
    fn new(replies: Vec<(Duration, LeaseTtl)>) -> Arc<Self> {
        Arc::new(Self {
            replies: Mutex::new(replies.into()),
            queries: Mutex::new(0),
        })
    }
}

#[async_trait]
impl LeaseQueryClient for ScriptedClient {
    async fn query_lease_ttl(&self) -> Result<LeaseTtl> {
        *self.queries.lock() += 1;
        let next = self.replies.lock().pop_front();
        match next {
            Some((delay, ttl)) => {
                sleep(delay).await;
                Ok(ttl)
            }
            None => std::future::pending().await,
        }
    }
}

fn store() -> Arc<ConfigStore> {
    ConfigStore::new(LeaseConfig::default()).unwrap()
}

#[tokio::test(start_paused = true)]
async fn test_indirect_expiry_measured_from_send_time() {
    let client = ScriptedClient::new(vec![(Duration::from_secs(2), LeaseTtl::Remaining(Duration::from_secs(30)))]);
    let t0 = Instant::now();
    let monitor = LeaseMonitor::indirect(client.clone(), store());
    assert_eq!(monitor.mode(), MonitorMode::Indirect);

    // No reply yet.
    sleep(Duration::from_secs(1)).await;
    assert!(monitor.is_lease_expired());

    sleep_until(t0 + Duration::from_secs(3)).await;
    assert_eq!(monitor.expires_at(), Some(t0 + Duration::from_secs(30)));

    sleep_until(t0 + Duration::from_secs(29)).await;
    assert!(!monitor.is_lease_expired());

    sleep_until(t0 + Duration::from_secs(30)).await;
    assert!(monitor.is_lease_expired());
    assert!(*client.queries.lock() >= 2);
}

#[tokio::test(start_paused = true)]
async fn test_indirect_expiry_never_regresses() {
    let client = ScriptedClient::new(vec![
        (Duration::ZERO, LeaseTtl::Remaining(Duration::from_secs(30))),
        (Duration::ZERO, LeaseTtl::Remaining(Duration::from_secs(3))),
    ]);
    let t0 = Instant::now();
    let monitor = LeaseMonitor::indirect(client.clone(), store());

    // The second poll goes out after the regular 8s delay and returns a
    // shorter TTL.
    sleep_until(t0 + Duration::from_secs(9)).await;
    assert_eq!(*client.queries.lock(), 2);
    assert_eq!(monitor.expires_at(), Some(t0 + Duration::from_secs(30)));
    assert!(!monitor.is_lease_expired());
}

#[tokio::test(start_paused = true)]
async fn test_closed_monitor_discards_late_reply() {
    let client = ScriptedClient::new(vec![(Duration::from_secs(2), LeaseTtl::Remaining(Duration::from_secs(30)))]);
    let monitor = LeaseMonitor::indirect(client, store());

    sleep(Duration::from_secs(1)).await;
    monitor.close();
    sleep(Duration::from_secs(2)).await;

    assert!(monitor.is_closed());
    assert!(monitor.is_lease_expired());
    assert_eq!(monitor.expires_at(), None);
}

#[tokio::test(start_paused = true)]
async fn test_direct_monitor_queries_driver_when_cache_runs_out() {
    let harness = LeaseHarness::new();
    let a = NodeBuilder::new(&harness, "a").open();
    harness.set_ttl("a", LeaseTtl::Remaining(Duration::from_secs(10))).unwrap();

    let t0 = Instant::now();
    let monitor = a.agent.direct_monitor().unwrap();
    assert_eq!(monitor.mode(), MonitorMode::Direct);

    assert!(!monitor.is_lease_expired());
    assert_eq!(monitor.expires_at(), Some(t0 + Duration::from_secs(10)));

    harness.set_ttl("a", LeaseTtl::ZERO).unwrap();
    sleep(Duration::from_secs(9)).await;
    assert!(!monitor.is_lease_expired());

    sleep(Duration::from_secs(1)).await;
    assert!(monitor.is_lease_expired());

    monitor.close();
    assert!(monitor.is_lease_expired());
}

#[tokio::test(start_paused = true)]
async fn test_direct_monitor_treats_query_failure_as_expired() {
    let harness = LeaseHarness::new();
    let a = NodeBuilder::new(&harness, "a").open();
    let monitor = a.agent.direct_monitor().unwrap();

    a.agent.close();

    assert!(monitor.is_lease_expired());
}

#[tokio::test(start_paused = true)]
async fn test_loopback_ipc_end_to_end() {
    let harness = LeaseHarness::new();
    let a = NodeBuilder::new(&harness, "a").open();
    harness.set_ttl("a", LeaseTtl::Remaining(Duration::from_secs(20))).unwrap();

    let t0 = Instant::now();
    let client = LoopbackIpc::serve(LeaseQueryService::new(a.agent.clone()));
    assert_eq!(client.query_lease_ttl().await.unwrap(), LeaseTtl::Remaining(Duration::from_secs(20)));

    let monitor = LeaseMonitor::indirect(Arc::new(client), Arc::clone(&a.store));
    settle().await;

    assert!(!monitor.is_lease_expired());
    assert_eq!(monitor.expires_at(), Some(t0 + Duration::from_secs(20)));
}

#[tokio::test(start_paused = true)]
async fn test_loopback_ipc_reports_closed_agent() {
    let harness = LeaseHarness::new();
    let a = NodeBuilder::new(&harness, "a").open();
    let client = LoopbackIpc::serve(LeaseQueryService::new(a.agent.clone()));

    a.agent.close();

    assert!(client.query_lease_ttl().await.is_err());

    let monitor = LeaseMonitor::indirect(Arc::new(client), Arc::clone(&a.store));
    sleep(Duration::from_secs(5)).await;
    assert!(monitor.is_lease_expired());
    assert_eq!(monitor.expires_at(), None);
}
