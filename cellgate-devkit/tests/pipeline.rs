use cellgate_devkit::test_utils::wait_until;
use cellgate_devkit::{MockHubTransport, TestHarness};
use cellgate_edge::queue::OverflowPolicy;
use cellgate_edge::{Gateway, GatewayError};
use std::collections::HashMap;
use std::time::Duration;

#[tokio::test]
async fn three_makes_deliver_everything_with_healthy_hub() {
    let harness = TestHarness::new()
        .unwrap()
        .with_scripted_make("MAKE_A", 10)
        .with_scripted_make("MAKE_B", 10)
        .with_scripted_make("MAKE_C", 10)
        .with_machine("a-1", "MAKE_A")
        .with_machine("b-1", "MAKE_B")
        .with_machine("c-1", "make_c");

    let running = harness.start().await.unwrap();
    let hub = harness.hub.clone();
    assert!(wait_until(Duration::from_secs(5), || {
        let hub = hub.clone();
        async move { hub.events_received() == 30 }
    }).await);

    let last = running.stop().await.unwrap();
    assert_eq!(last.queue_depth, 0);
    assert_eq!(last.spool.files, 0);
    assert_eq!(last.uplink.events_sent, 30);
    assert_eq!(last.normalizer.accepted, 30);
    assert!(harness.spool().list().await.unwrap().is_empty());

    let mut per_machine: HashMap<String, Vec<u64>> = HashMap::new();
    for batch in harness.hub.get_batches() {
        assert_eq!(batch.site_id, "test-site");
        for event in batch.events {
            assert_eq!(event.site_id.as_deref(), Some("test-site"));
            let count = event.state.and_then(|s| s.metrics).and_then(|m| m.part_count).unwrap();
            per_machine.entry(event.machine_id.unwrap()).or_default().push(count);
        }
    }
    assert_eq!(per_machine.len(), 3);
    for (machine, counts) in per_machine {
        assert_eq!(counts, (0..10).collect::<Vec<u64>>(), "order broken for {machine}");
    }
}

#[tokio::test]
async fn failing_hub_spools_every_event() {
    let harness = TestHarness::new()
        .unwrap()
        .with_scripted_make("MAKE_A", 10)
        .with_machine("a-1", "MAKE_A")
        .with_machine("a-2", "MAKE_A")
        .with_hub(MockHubTransport::failing());

    let running = harness.start().await.unwrap();
    let health = running.health.clone();
    assert!(
        wait_until(Duration::from_secs(5), || {
            let health = health.clone();
            async move {
                let snapshot = health.get_health().await;
                snapshot.normalizer.accepted == 20 && snapshot.queue_depth == 0
            }
        })
        .await
    );

    let last = running.stop().await.unwrap();
    assert_eq!(last.uplink.batches_sent, 0);
    assert!(last.spool.files >= 1);

    let spooled: usize = harness.spooled_batches().await.unwrap().iter().map(|b| b.events.len()).sum();
    assert_eq!(spooled, 20);
    assert!(harness.hub.failed_sends() >= 1);
}

#[tokio::test]
async fn health_reports_connectors_and_queue() {
    let mut harness = TestHarness::new()
        .unwrap()
        .with_scripted_make("MAKE_A", 3)
        .with_machine("a-1", "MAKE_A")
        .with_machine("ghost", "NOT_A_MAKE");
    harness.config.queue.overflow_policy = OverflowPolicy::DropOldest;
    harness.config.supervision.health_interval_secs = 1;

    let running = harness.start().await.unwrap();
    let connectors = running.connectors.clone();
    assert!(wait_until(Duration::from_secs(3), || {
        let connectors = connectors.clone();
        async move { connectors.statuses().iter().all(|s| s.checked_at.is_some()) }
    }).await);

    let snapshot = running.health.get_health().await;
    assert_eq!(snapshot.site_id, "test-site");
    assert_eq!(snapshot.connectors.len(), 1);
    assert_eq!(snapshot.connectors[0].machine_id, "a-1");
    assert!(snapshot.connectors[0].healthy);
    assert_eq!(snapshot.queue_capacity, 10_000);

    running.stop().await.unwrap();
}

#[tokio::test]
async fn strict_makes_refuse_to_build() {
    let mut harness = TestHarness::new().unwrap().with_machine("ghost", "NOT_A_MAKE");
    harness.config.supervision.strict_makes = true;

    let result = Gateway::build(harness.config.clone(), harness.registry.clone(), Box::new(harness.hub.clone())).await;
    assert!(matches!(result, Err(GatewayError::Lifecycle(_))));
}

#[tokio::test]
async fn unwritable_spool_is_fatal() {
    let mut harness = TestHarness::new().unwrap();
    let blocker = harness.storage_root().join("blocker");
    std::fs::write(&blocker, b"file, not a directory").unwrap();
    harness.config.storage_root = blocker;

    let result = Gateway::build(harness.config.clone(), harness.registry.clone(), Box::new(harness.hub.clone())).await;
    assert!(matches!(result, Err(GatewayError::Spool(_))));
}

#[tokio::test]
async fn simulator_runs_end_to_end() {
    let mut harness = TestHarness::new().unwrap().with_machine("sim-1", "SIMULATOR");
    harness.config.machines[0].settings.insert("intervalMs".into(), serde_json::json!(10));

    let running = harness.start().await.unwrap();
    let hub = harness.hub.clone();
    assert!(wait_until(Duration::from_secs(5), || {
        let hub = hub.clone();
        async move { hub.events_received() >= 12 }
    }).await);
    running.stop().await.unwrap();

    let inferred: Vec<String> = harness
        .hub
        .get_batches()
        .into_iter()
        .flat_map(|b| b.events)
        .filter_map(|e| e.event.and_then(|i| i.event_type))
        .collect();
    assert!(inferred.iter().any(|t| t == "PART_COMPLETED"));
}
