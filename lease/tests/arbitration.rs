mod common;

use common::{settle, NodeBuilder, RecordingApp, TestNode};
use lease::transport::harness::{EstablishMode, LeaseHarness};
use lease::transport::{AppHandle, LeaseHandle};
use lease::{ArbitrationType, ArbitrationVerdict, EstablishRequest, LeaseTtl, PartnerState};
use std::time::Duration;

/// Opens `a` and `b` and establishes a -> b synchronously.
async fn established_pair(harness: &LeaseHarness, a: NodeBuilder<'_>) -> (TestNode, TestNode) {
    harness.set_establish_mode(EstablishMode::Synchronous);
    let a = a.open();
    let b = NodeBuilder::new(harness, "b").open();
    a.agent
        .establish(
            EstablishRequest::new("b", "b:9000", b.agent.instance_id().unwrap()),
            Duration::from_secs(5),
        )
        .await
        .unwrap();
    (a, b)
}

#[tokio::test(start_paused = true)]
async fn test_conceding_application_reports_one_completion() {
    let harness = LeaseHarness::new();
    let app = RecordingApp::conceding();
    let (a, _b) = established_pair(&harness, NodeBuilder::new(&harness, "a").app(app.clone())).await;

    let request = harness.trigger_arbitration("a", "b").unwrap();
    settle().await;

    let completions = harness.arbitration_completions();
    assert_eq!(completions.len(), 1);
    let (handle, completion) = &completions[0];
    assert_eq!(*handle, a.agent.app_handle().unwrap());
    assert_eq!(completion.local_ttl, LeaseTtl::ZERO);
    assert_eq!(completion.remote_ttl, LeaseTtl::NoLimit);
    assert_eq!(completion.remote_address, request.remote_address);
    assert_eq!(completion.remote_instance, request.remote_instance);

    assert_eq!(app.arbitrations.lock().len(), 1);
    assert_eq!(a.agent.partner_state("b"), Some(PartnerState::Failed));
}

#[tokio::test(start_paused = true)]
async fn test_arbitration_context_widens_remote_ttl() {
    let harness = LeaseHarness::new();
    let app = RecordingApp::conceding();
    let (_a, b) = established_pair(&harness, NodeBuilder::new(&harness, "a").app(app.clone())).await;
    harness.set_ttl("b", LeaseTtl::Remaining(Duration::from_secs(5))).unwrap();

    harness.trigger_arbitration("a", "b").unwrap();
    settle().await;

    let context = app.arbitrations.lock()[0].clone();
    assert_eq!(context.local_id, "a");
    assert_eq!(context.remote_ttl, LeaseTtl::Remaining(Duration::from_secs(6)));
    assert_eq!(context.local_ttl, LeaseTtl::NoLimit);
    assert_eq!(context.remote_instance, b.agent.instance_id().unwrap());
    assert_eq!(context.arbitration_type, ArbitrationType::TwoWayExtended);
}

#[tokio::test(start_paused = true)]
async fn test_disabled_arbitration_concedes_without_asking() {
    let harness = LeaseHarness::new();
    let app = RecordingApp::new(ArbitrationVerdict::keep_both());
    let (a, _b) = established_pair(
        &harness,
        NodeBuilder::new(&harness, "a").app(app.clone()).arbitration_enabled(false),
    )
    .await;

    harness.trigger_arbitration("a", "b").unwrap();
    settle().await;

    let completions = harness.arbitration_completions();
    assert_eq!(completions.len(), 1);
    assert_eq!(completions[0].1.local_ttl, LeaseTtl::ZERO);
    assert_eq!(completions[0].1.remote_ttl, LeaseTtl::NoLimit);
    assert!(app.arbitrations.lock().is_empty());
    assert_eq!(a.agent.partner_state("b"), Some(PartnerState::Established));
}

#[tokio::test(start_paused = true)]
async fn test_stale_registration_concedes_with_request_handle() {
    let harness = LeaseHarness::new();
    let app = RecordingApp::new(ArbitrationVerdict::keep_both());
    let (_a, _b) = established_pair(&harness, NodeBuilder::new(&harness, "a").app(app.clone())).await;

    let mut request = harness.arbitration_request("a", "b").unwrap();
    request.app = AppHandle::from_raw(999);
    harness.deliver_arbitration("a", request).unwrap();
    settle().await;

    let completions = harness.arbitration_completions();
    assert_eq!(completions.len(), 1);
    assert_eq!(completions[0].0, AppHandle::from_raw(999));
    assert_eq!(completions[0].1.local_ttl, LeaseTtl::ZERO);
    assert!(app.arbitrations.lock().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_keep_both_re_establishes_lease() {
    let harness = LeaseHarness::new();
    let app = RecordingApp::new(ArbitrationVerdict::keep_both());
    let (a, _b) = established_pair(&harness, NodeBuilder::new(&harness, "a").app(app.clone())).await;
    let attempts = harness.establish_attempts("a");

    harness.trigger_arbitration("a", "b").unwrap();
    settle().await;

    assert_eq!(harness.arbitration_completions()[0].1.local_ttl, LeaseTtl::NoLimit);
    assert_eq!(harness.establish_attempts("a"), attempts + 1);
    assert_eq!(a.agent.partner_state("b"), Some(PartnerState::Established));
}

#[tokio::test(start_paused = true)]
async fn test_prevailing_does_not_re_establish() {
    let harness = LeaseHarness::new();
    let app = RecordingApp::new(ArbitrationVerdict::prevail(Duration::from_secs(2)));
    let (a, _b) = established_pair(&harness, NodeBuilder::new(&harness, "a").app(app.clone())).await;
    let attempts = harness.establish_attempts("a");

    harness.trigger_arbitration("a", "b").unwrap();
    settle().await;

    let completion = &harness.arbitration_completions()[0].1;
    assert_eq!(completion.local_ttl, LeaseTtl::NoLimit);
    assert_eq!(completion.remote_ttl, LeaseTtl::Remaining(Duration::from_secs(2)));
    assert_eq!(harness.establish_attempts("a"), attempts);
    assert_eq!(a.agent.partner_state("b"), Some(PartnerState::Failed));
}

#[tokio::test(start_paused = true)]
async fn test_terminate_after_prevailing_releases_lease() {
    let harness = LeaseHarness::new();
    let app = RecordingApp::new(ArbitrationVerdict::prevail(Duration::from_secs(2)));
    let (a, _b) = established_pair(&harness, NodeBuilder::new(&harness, "a").app(app.clone())).await;

    harness.trigger_arbitration("a", "b").unwrap();
    settle().await;
    assert_eq!(a.agent.partner_state("b"), Some(PartnerState::Failed));

    a.agent.terminate("b");

    let terminations = harness.terminations();
    assert_eq!(terminations.len(), 1);
    assert_eq!(terminations[0].2, "b");
    assert!(!harness.is_lease_established("a", "b"));
}

#[tokio::test(start_paused = true)]
async fn test_waiters_queued_during_arbitration_complete_after_keep_both() {
    let harness = LeaseHarness::new();
    let app = RecordingApp::new(ArbitrationVerdict::keep_both());
    let (a, b) = established_pair(&harness, NodeBuilder::new(&harness, "a").app(app.clone())).await;

    let request = harness.arbitration_request("a", "b").unwrap();
    a.agent.arbitrate(request);
    assert_eq!(a.agent.partner_state("b"), Some(PartnerState::Failed));

    let pending = a.agent.begin_establish(
        EstablishRequest::new("b", "b:9000", b.agent.instance_id().unwrap()),
        Duration::from_secs(5),
    );

    pending.wait().await.unwrap();
    assert_eq!(a.agent.partner_state("b"), Some(PartnerState::Established));
}

#[tokio::test(start_paused = true)]
async fn test_local_fault_reaches_application() {
    let harness = LeaseHarness::new();
    let a_app = RecordingApp::conceding();
    let b_app = RecordingApp::conceding();
    harness.set_establish_mode(EstablishMode::Synchronous);
    let a = NodeBuilder::new(&harness, "a").app(a_app.clone()).open();
    let b = NodeBuilder::new(&harness, "b").app(b_app.clone()).open();
    b.agent
        .establish(
            EstablishRequest::new("a", "a:9000", a.agent.instance_id().unwrap()),
            Duration::from_secs(5),
        )
        .await
        .unwrap();

    harness.fault_agent("a").unwrap();
    settle().await;

    assert_eq!(*a_app.lease_failed.lock(), 1);
    assert!(a.agent.is_lease_expired());
    assert_eq!(*b_app.remote_failed.lock(), vec!["a".to_string()]);
    assert_eq!(b.agent.partner_state("a"), None);
}

#[tokio::test(start_paused = true)]
async fn test_established_callback_for_other_handle_is_ignored() {
    let harness = LeaseHarness::new();
    harness.set_establish_mode(EstablishMode::Never);
    let a = NodeBuilder::new(&harness, "a").open();
    let b = NodeBuilder::new(&harness, "b").open();

    let pending = a.agent.begin_establish(
        EstablishRequest::new("b", "b:9000", b.agent.instance_id().unwrap()),
        Duration::from_secs(5),
    );
    assert_eq!(a.agent.partner_state("b"), Some(PartnerState::Establishing));

    harness
        .inject_lease_established("a", "b", LeaseHandle::from_raw(4242))
        .unwrap();
    settle().await;
    assert_eq!(a.agent.partner_state("b"), Some(PartnerState::Establishing));

    // Handles 1 and 2 went to the registrations; the lease got the next one.
    harness
        .inject_lease_established("a", "b", LeaseHandle::from_raw(3))
        .unwrap();
    pending.wait().await.unwrap();
    assert_eq!(a.agent.partner_state("b"), Some(PartnerState::Established));
}

#[tokio::test(start_paused = true)]
async fn test_restart_rebinds_callbacks() {
    let harness = LeaseHarness::new();
    let app = RecordingApp::conceding();
    let a = NodeBuilder::new(&harness, "a").app(app.clone()).open();

    a.agent.restart("a2").unwrap();
    harness.fault_agent("a2").unwrap();
    settle().await;

    assert_eq!(*app.lease_failed.lock(), 1);
    assert!(harness.fault_agent("a").is_err());
}
