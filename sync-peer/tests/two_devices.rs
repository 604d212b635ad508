//! Two engines on one in-process network: discovery, trust, transfer,
//! conflict handling and revocation end to end.

use serde_json::json;
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use vitalsync_core::{
    FieldChoice, NetworkQuality, OperationDescriptor, OperationKind, Priority, Record,
    RequestOutcome, RevocationReason,
};
use vitalsync_peer::{
    EngineParts, LoopbackBus, LoopbackChannel, MemoryNetwork, PeerConfig, SyncEngine,
};
use vitalsync_types::DeviceId;

// ============================================================================
// Harness
// ============================================================================

async fn device(name: &str, network: &MemoryNetwork, bus: &LoopbackBus) -> SyncEngine {
    let address = format!("mem://{}", name);
    let mut config = PeerConfig::default();
    config.device.name = name.to_string();
    config.discovery.announce_interval_secs = 1;
    config.sync.retry_base_delay_ms = 10;
    config.sync.retry_max_delay_ms = 50;
    config.sync.retry_jitter_ms = 0;

    let parts = EngineParts::in_memory(Arc::new(network.clone()))
        .with_channel(Arc::new(LoopbackChannel::new(bus.clone(), address.clone())));
    let engine = SyncEngine::new(config, parts).await.unwrap();
    engine.start().await.unwrap();
    engine.serve(Arc::new(network.listen(address))).await;
    engine
}

async fn wait_for<F, Fut>(what: &str, mut check: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = Instant::now() + Duration::from_secs(5);
    while !check().await {
        assert!(Instant::now() < deadline, "timed out waiting for {}", what);
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

struct Pair {
    phone: SyncEngine,
    tablet: SyncEngine,
}

async fn discovered_pair() -> Pair {
    let network = MemoryNetwork::new();
    let bus = LoopbackBus::new();
    let phone = device("phone", &network, &bus).await;
    let tablet = device("tablet", &network, &bus).await;

    phone.start_discovery().await;
    tablet.start_discovery().await;
    phone.announce_now().await;
    tablet.announce_now().await;

    let (p, t) = (&phone, &tablet);
    wait_for("mutual discovery", move || async move {
        sees(p, t.device_id()) && sees(t, p.device_id())
    })
    .await;
    Pair { phone, tablet }
}

async fn trusted_pair() -> Pair {
    let pair = discovered_pair().await;
    for (from, to) in [(&pair.phone, &pair.tablet), (&pair.tablet, &pair.phone)] {
        let outcome = from.request_device_trust(&to.device_id()).await.unwrap();
        assert!(matches!(outcome, RequestOutcome::Pending { .. }));
        from.approve_device_trust(&to.device_id(), None).await.unwrap();
    }
    pair
}

fn sees(engine: &SyncEngine, peer: DeviceId) -> bool {
    engine
        .discovered_devices()
        .iter()
        .any(|p| p.identity.device_id == peer)
}

fn daily_log() -> Record {
    Record::new("log-1", "daily_log", 100)
        .with_field("mood", json!("calm"))
        .with_field("activities", json!(["walk"]))
        .with_field("heart_rate", json!(70))
}

fn upload(peer: DeviceId, record_id: &str) -> OperationDescriptor {
    OperationDescriptor {
        kind: OperationKind::Upload,
        peer,
        data_type: "daily_log".into(),
        priority: Priority::High,
        payload_ref: record_id.into(),
        max_retries: Some(3),
    }
}

/// Upload `record` from one side and wait until the other stores it.
async fn deliver(from: &SyncEngine, to: &SyncEngine, record: &Record) {
    from.save_record(record).await.unwrap();
    from.queue_operation(upload(to.device_id(), &record.id))
        .await
        .unwrap();
    let expected = record.clone();
    wait_for("record delivery", move || {
        let expected = expected.clone();
        async move { to.record(&expected.id).await.unwrap() == Some(expected) }
    })
    .await;
}

// ============================================================================
// Discovery
// ============================================================================

#[tokio::test]
async fn devices_find_each_other_but_never_themselves() {
    let pair = discovered_pair().await;

    assert!(!sees(&pair.phone, pair.phone.device_id()));
    assert!(!sees(&pair.tablet, pair.tablet.device_id()));

    let seen = pair.phone.discovered_devices();
    assert_eq!(seen.len(), 1);
    assert_eq!(seen[0].identity.display_name, "tablet");
    assert_eq!(seen[0].address, "mem://tablet");
}

// ============================================================================
// Trust
// ============================================================================

#[tokio::test]
async fn approval_makes_a_device_trusted() {
    let pair = discovered_pair().await;
    let tablet = pair.tablet.device_id();

    pair.phone.request_device_trust(&tablet).await.unwrap();
    assert_eq!(pair.phone.pending_requests().await.len(), 1);
    assert!(pair.phone.trusted_devices().await.is_empty());

    pair.phone.approve_device_trust(&tablet, None).await.unwrap();
    assert!(pair.phone.pending_requests().await.is_empty());
    assert_eq!(pair.phone.trusted_devices().await[0].device_id(), tablet);
}

#[tokio::test]
async fn rejected_request_leaves_nothing_behind() {
    let pair = discovered_pair().await;
    let tablet = pair.tablet.device_id();

    pair.phone.request_device_trust(&tablet).await.unwrap();
    pair.phone.reject_device_trust(&tablet).await.unwrap();

    assert!(pair.phone.pending_requests().await.is_empty());
    assert!(pair.phone.trusted_devices().await.is_empty());
}

// ============================================================================
// Transfer
// ============================================================================

#[tokio::test]
async fn upload_reaches_the_trusted_peer() {
    let pair = trusted_pair().await;

    deliver(&pair.phone, &pair.tablet, &daily_log()).await;

    let phone = &pair.phone;
    wait_for("upload completion", move || async move {
        phone.sync_status().await.queue.completed == 1
    })
    .await;
    assert!(phone.failed_operations().await.is_empty());
}

#[tokio::test]
async fn work_queued_offline_goes_out_on_reconnect() {
    let pair = trusted_pair().await;
    pair.phone.on_connectivity_lost("airplane mode").await;

    let record = daily_log();
    pair.phone.save_record(&record).await.unwrap();
    pair.phone
        .queue_operation(upload(pair.tablet.device_id(), &record.id))
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(pair.tablet.record(&record.id).await.unwrap(), None);
    assert!(!pair.phone.sync_status().await.online);

    pair.phone
        .on_connectivity_restored(NetworkQuality::broadband(1.0))
        .await;
    let tablet = &pair.tablet;
    wait_for("delivery after reconnect", move || async move {
        tablet.record("log-1").await.unwrap().is_some()
    })
    .await;
}

// ============================================================================
// Conflicts
// ============================================================================

#[tokio::test]
async fn disjoint_edits_converge_on_both_devices() {
    let pair = trusted_pair().await;
    let base = daily_log();
    deliver(&pair.phone, &pair.tablet, &base).await;

    let mut on_tablet = base.clone().with_field("activities", json!(["walk", "swim"]));
    on_tablet.version = 2;
    on_tablet.updated_at = 200;
    pair.tablet.save_record(&on_tablet).await.unwrap();

    let mut on_phone = base.clone().with_field("mood", json!("tense"));
    on_phone.version = 2;
    on_phone.updated_at = 210;
    pair.phone.save_record(&on_phone).await.unwrap();
    pair.phone
        .queue_operation(upload(pair.tablet.device_id(), "log-1"))
        .await
        .unwrap();

    let (p, t) = (&pair.phone, &pair.tablet);
    wait_for("merge on both sides", move || async move {
        let (Some(a), Some(b)) = (
            p.record("log-1").await.unwrap(),
            t.record("log-1").await.unwrap(),
        ) else {
            return false;
        };
        a == b && a.version == 3
    })
    .await;

    let merged = p.record("log-1").await.unwrap().unwrap();
    assert_eq!(merged.fields["mood"], json!("tense"));
    assert_eq!(merged.fields["activities"], json!(["walk", "swim"]));
    assert_eq!(t.conflict_history().await.len(), 1);
}

#[tokio::test]
async fn health_conflict_waits_for_the_user() {
    let pair = trusted_pair().await;
    let base = daily_log();
    deliver(&pair.phone, &pair.tablet, &base).await;

    let mut on_tablet = base.clone().with_field("heart_rate", json!(72));
    on_tablet.version = 2;
    pair.tablet.save_record(&on_tablet).await.unwrap();

    let mut on_phone = base.clone().with_field("heart_rate", json!(95));
    on_phone.version = 2;
    pair.phone.save_record(&on_phone).await.unwrap();
    pair.phone
        .queue_operation(upload(pair.tablet.device_id(), "log-1"))
        .await
        .unwrap();

    let tablet = &pair.tablet;
    wait_for("parked conflict", move || async move {
        tablet.pending_conflicts().await.unwrap().len() == 1
    })
    .await;
    assert_eq!(
        tablet.record("log-1").await.unwrap().unwrap().fields["heart_rate"],
        json!(72)
    );

    let choices = BTreeMap::from([("heart_rate".to_string(), FieldChoice::Remote)]);
    let resolution = tablet.resolve_conflict("log-1", &choices).await.unwrap();
    assert_eq!(resolution.merged.fields["heart_rate"], json!(95));
    assert!(tablet.pending_conflicts().await.unwrap().is_empty());

    let phone = &pair.phone;
    let merged = resolution.merged.clone();
    wait_for("resolution sent back", move || {
        let merged = merged.clone();
        async move { phone.record("log-1").await.unwrap() == Some(merged) }
    })
    .await;

    let on_phone = phone.record("log-1").await.unwrap().unwrap();
    let on_tablet = tablet.record("log-1").await.unwrap().unwrap();
    assert_eq!(on_phone.version, 3);
    assert_eq!(on_phone.version, on_tablet.version);
}

// ============================================================================
// Revocation
// ============================================================================

#[tokio::test]
async fn revocation_reaches_the_other_side() {
    let pair = trusted_pair().await;
    deliver(&pair.phone, &pair.tablet, &daily_log()).await;

    pair.phone
        .revoke_device_trust(&pair.tablet.device_id(), RevocationReason::UserRequested)
        .await
        .unwrap();
    assert!(pair.phone.trusted_devices().await.is_empty());

    let tablet = &pair.tablet;
    wait_for("peer revocation", move || async move {
        tablet.trusted_devices().await.is_empty()
    })
    .await;
}

#[tokio::test]
async fn uploads_to_a_revoked_device_fail_for_good() {
    let pair = trusted_pair().await;
    let tablet = pair.tablet.device_id();
    pair.phone
        .revoke_device_trust(&tablet, RevocationReason::Compromised)
        .await
        .unwrap();

    pair.phone.save_record(&daily_log()).await.unwrap();
    pair.phone
        .queue_operation(upload(tablet, "log-1"))
        .await
        .unwrap();

    let phone = &pair.phone;
    wait_for("terminal failure", move || async move {
        phone.failed_operations().await.len() == 1
    })
    .await;
    assert_eq!(pair.tablet.record("log-1").await.unwrap(), None);
}
