use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use serde_json::{json, Value};
use servel_adapters::{ArchiveSource, FetchTimeouts, MemoryArchiveSource, ResourceDescriptor};
use servel_core::{Election, GeoUnit, ResourceKey};
use servel_storage::{DocumentStore, FailureClass, FetchError, MemoryStore};
use servel_sync::{parse_clock, Phase, PhaseWindows, ResourceStatus, SyncConfig, SyncMode, SyncService};
use tokio::sync::Semaphore;

fn fixture(name: &str) -> Value {
    let path = Path::new(env!("CARGO_MANIFEST_DIR"))
        .join("../../fixtures/servel")
        .join(name);
    let bytes = std::fs::read(&path).unwrap_or_else(|err| panic!("reading {}: {err}", path.display()));
    serde_json::from_slice(&bytes).unwrap()
}

fn descriptor(key: ResourceKey) -> ResourceDescriptor {
    ResourceDescriptor::for_key(key, &FetchTimeouts::default())
}

async fn publish(source: &MemoryArchiveSource, key: ResourceKey, body: &Value) {
    let bytes = serde_json::to_vec(body).unwrap();
    source.put_json(&descriptor(key), &bytes).await.unwrap();
}

async fn deputies_source() -> Arc<MemoryArchiveSource> {
    let source = Arc::new(MemoryArchiveSource::new());
    for key in ResourceKey::catalog(&[Election::Deputies]) {
        publish(&source, key, &fixture(&descriptor(key).entry)).await;
    }
    source
}

fn config() -> SyncConfig {
    SyncConfig {
        elections: vec![Election::Deputies],
        ..SyncConfig::default()
    }
}

fn service(
    config: SyncConfig,
    store: Arc<dyn DocumentStore>,
    source: Arc<dyn ArchiveSource>,
) -> Arc<SyncService> {
    Arc::new(SyncService::new(config, store, source))
}

fn santiago(hour: u32, minute: u32) -> DateTime<Utc> {
    chrono_tz::America::Santiago
        .with_ymd_and_hms(2025, 11, 16, hour, minute, 0)
        .single()
        .unwrap()
        .with_timezone(&Utc)
}

const TOTALS: ResourceKey = ResourceKey::Totals(Election::Deputies);
const TABLES: ResourceKey = ResourceKey::Tables(Election::Deputies);

#[tokio::test]
async fn installation_window_fetches_only_installation_until_latched() {
    let source = deputies_source().await;
    let mut config = config();
    config.windows = PhaseWindows {
        installation_start: parse_clock("08:00").unwrap(),
        voting_start: parse_clock("12:00").unwrap(),
        ..PhaseWindows::default()
    };
    let service = service(config, Arc::new(MemoryStore::new()), source.clone());

    let first = service.tick_at(santiago(10, 0)).await.unwrap();
    assert_eq!(first.phase, Phase::Installation);
    assert_eq!(first.results.len(), 1);
    assert_eq!(first.results[0].resource, ResourceKey::Installation);
    assert_eq!(source.total_fetches(), 1);
    assert!(service.installation_latched());

    for minute in 1..4 {
        let later = service.tick_at(santiago(10, minute)).await.unwrap();
        assert!(later.results.is_empty());
    }
    let voting = service.tick_at(santiago(13, 0)).await.unwrap();
    assert_eq!(voting.phase, Phase::Voting);
    assert!(voting.results.is_empty());
    assert_eq!(source.total_fetches(), 1);
}

#[tokio::test]
async fn installation_below_threshold_keeps_polling() {
    let source = deputies_source().await;
    publish(&source, ResourceKey::Installation, &json!({"iteracion": "1", "porc": "87,2"})).await;
    let service = service(config(), Arc::new(MemoryStore::new()), source.clone());

    service.tick_at(santiago(7, 30)).await.unwrap();
    service.tick_at(santiago(7, 31)).await.unwrap();

    assert!(!service.installation_latched());
    assert_eq!(source.fetches_of("constitucion.zip").await, 2);
}

#[tokio::test]
async fn tally_syncs_everything_cold_then_warm() {
    let source = deputies_source().await;
    let store = Arc::new(MemoryStore::new());
    let service = service(config(), store.clone(), source.clone());

    let first = service.tick_at(santiago(19, 0)).await.unwrap();
    assert_eq!(first.phase, Phase::Tally);
    assert_eq!(first.mode, SyncMode::ColdStart);
    let order: Vec<_> = first.results.iter().map(|r| r.resource).collect();
    assert_eq!(order, ResourceKey::catalog(&[Election::Deputies]));
    assert!(first
        .results
        .iter()
        .all(|r| matches!(r.status, ResourceStatus::Merged { .. })));

    let counts = store.counts().await.unwrap();
    assert_eq!(
        (counts.territories, counts.table_results, counts.aggregate_results, counts.candidates),
        (3, 2, 2, 3)
    );

    let second = service.tick_at(santiago(19, 1)).await.unwrap();
    assert_eq!(second.mode, SyncMode::Warm);
    let order: Vec<_> = second.results.iter().map(|r| r.resource).collect();
    assert_eq!(order, ResourceKey::catalog(&[Election::Deputies]));
    assert!(second
        .results
        .iter()
        .all(|r| matches!(r.status, ResourceStatus::Unchanged)));
    assert_eq!(source.total_fetches(), 8);
}

#[tokio::test]
async fn equal_marker_payload_leaves_records_untouched() {
    let source = deputies_source().await;
    let store = Arc::new(MemoryStore::new());
    let service = service(config(), store.clone(), source.clone());
    service.sync_resource(TABLES).await;

    let mut tampered = fixture("mesas_6.json");
    tampered[0]["total_emitidos"] = json!(999);
    publish(&source, TABLES, &tampered).await;

    let result = service.sync_resource(TABLES).await;
    assert!(matches!(result.status, ResourceStatus::Unchanged));
    let stored = store.table_results(Election::Deputies, GeoUnit::District(8)).await.unwrap();
    assert!(stored.iter().all(|t| t.total_emitidos != 999));
}

#[tokio::test]
async fn new_marker_merges_only_the_difference() {
    let source = deputies_source().await;
    let service = service(config(), Arc::new(MemoryStore::new()), source.clone());
    service.sync_resource(TABLES).await;

    let mut next = fixture("mesas_6.json");
    for row in next.as_array_mut().unwrap() {
        row["iteracion"] = json!("20251116210000");
    }
    next[1]["total_emitidos"] = json!(12);
    publish(&source, TABLES, &next).await;

    let result = service.sync_resource(TABLES).await;
    let ResourceStatus::Merged { report } = result.status else {
        panic!("expected a merge, got {:?}", result.status);
    };
    assert_eq!((report.inserted, report.modified), (0, 2));
    assert_eq!(result.marker.as_deref(), Some("20251116210000"));
}

#[tokio::test]
async fn committed_markers_survive_a_restart() {
    let source = deputies_source().await;
    let store: Arc<dyn DocumentStore> = Arc::new(MemoryStore::new());
    service(config(), store.clone(), source.clone()).sync_resource(TOTALS).await;

    let restarted = service(config(), store.clone(), source.clone());
    restarted.hydrate().await.unwrap();
    let result = restarted.sync_resource(TOTALS).await;

    assert!(matches!(result.status, ResourceStatus::Unchanged));
    let states = store.resource_states().await.unwrap();
    assert_eq!(states[0].last_marker.as_deref(), Some("20251116203000"));
}

#[tokio::test]
async fn failed_chunk_reports_partial_and_keeps_marker_uncommitted() {
    let source = deputies_source().await;
    let store = Arc::new(MemoryStore::new().fail_chunks_containing(["1002"]));
    let service = service(
        SyncConfig {
            tables_batch_size: 1,
            ..config()
        },
        store.clone(),
        source,
    );

    for _ in 0..2 {
        let result = service.sync_resource(TABLES).await;
        let ResourceStatus::Partial { report } = result.status else {
            panic!("expected partial merge, got {:?}", result.status);
        };
        assert_eq!(report.processed_chunks, 1);
        assert_eq!(report.failed_chunks, 1);
        assert_eq!(report.failed_records, 1);
    }
    assert_eq!(store.counts().await.unwrap().table_results, 1);
    assert!(store.resource_states().await.unwrap().is_empty());
}

#[tokio::test]
async fn rejected_records_keep_the_marker_uncommitted() {
    let source = deputies_source().await;
    let store = Arc::new(MemoryStore::new().reject_records(["1002"]));
    let service = service(config(), store.clone(), source);

    for _ in 0..2 {
        let result = service.sync_resource(TABLES).await;
        let ResourceStatus::Partial { report } = result.status else {
            panic!("expected partial merge, got {:?}", result.status);
        };
        assert_eq!(report.failed_chunks, 0);
        assert_eq!(report.failed_records, 1);
    }
    assert!(store.resource_states().await.unwrap().is_empty());
    assert_eq!(service.stats().await.unwrap().error_count, 2);
}

#[tokio::test]
async fn one_failing_resource_does_not_block_the_others() {
    let source = deputies_source().await;
    let service = service(config(), Arc::new(MemoryStore::new()), source.clone());
    service.sync_all().await;

    source.fail_with_status("mesas_6.zip", 503).await;
    let mut totals = fixture("total_votacion_6.json");
    totals[0]["iteracion"] = json!("20251116213000");
    publish(&source, TOTALS, &totals).await;

    let summary = service.sync_all().await;
    assert_eq!(summary.mode, SyncMode::Warm);
    assert_eq!(summary.failed(), 1);
    for result in &summary.results {
        match result.resource {
            TABLES => assert!(matches!(
                result.status,
                ResourceStatus::Failed { class: FailureClass::Transport, .. }
            )),
            TOTALS => assert!(matches!(result.status, ResourceStatus::Merged { .. })),
            _ => assert!(matches!(result.status, ResourceStatus::Unchanged)),
        }
    }

    let stats = service.stats().await.unwrap();
    assert_eq!(stats.success_count, 5);
    assert_eq!(stats.error_count, 1);
    assert!(stats.last_sync.is_some());
    let last_error = stats.last_error.expect("last error recorded");
    assert_eq!(last_error.resource, TABLES);
    assert!(last_error.error.contains("503"), "{}", last_error.error);
}

#[tokio::test]
async fn malformed_payload_fails_only_its_resource() {
    let source = deputies_source().await;
    let broken = servel_adapters::zip_single_entry("total_votacion_6.json", b"{]").unwrap();
    source.put_archive("total_votacion_6.zip", broken).await;
    let service = service(config(), Arc::new(MemoryStore::new()), source);

    let summary = service.sync_all().await;
    let failed: Vec<_> = summary.results.iter().filter(|r| r.is_failed()).collect();
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].resource, TOTALS);
    assert!(matches!(
        failed[0].status,
        ResourceStatus::Failed { class: FailureClass::Payload, .. }
    ));
}

#[tokio::test]
async fn territory_reload_prunes_vanished_tables() {
    let source = deputies_source().await;
    let store = Arc::new(MemoryStore::new());
    let service = service(config(), store.clone(), source.clone());

    let mut territories = fixture("territorios.json");
    for row in territories.as_array_mut().unwrap() {
        row["iteracion"] = json!("1");
    }
    publish(&source, ResourceKey::Territories, &territories).await;
    service.sync_resource(ResourceKey::Territories).await;

    let rows = territories.as_array_mut().unwrap();
    rows.pop();
    for row in rows.iter_mut() {
        row["iteracion"] = json!("2");
    }
    publish(&source, ResourceKey::Territories, &territories).await;
    let result = service.sync_resource(ResourceKey::Territories).await;

    assert_eq!(result.report().map(|r| r.pruned), Some(1));
    assert_eq!(store.counts().await.unwrap().territories, 2);
}

/// Holds every fetch until the test hands out permits.
struct GatedSource {
    inner: Arc<MemoryArchiveSource>,
    gate: Semaphore,
    waiting: AtomicUsize,
}

impl GatedSource {
    async fn new() -> Arc<Self> {
        Arc::new(Self {
            inner: deputies_source().await,
            gate: Semaphore::new(0),
            waiting: AtomicUsize::new(0),
        })
    }
}

#[async_trait]
impl ArchiveSource for GatedSource {
    fn name(&self) -> &'static str {
        "gated"
    }

    async fn fetch_archive(&self, resource: &ResourceDescriptor) -> Result<Vec<u8>, FetchError> {
        self.waiting.fetch_add(1, Ordering::SeqCst);
        self.gate.acquire().await.expect("gate closed").forget();
        self.inner.fetch_archive(resource).await
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn tick_is_skipped_while_a_cycle_is_running() {
    let source = GatedSource::new().await;
    let service = service(config(), Arc::new(MemoryStore::new()), source.clone());

    let running = tokio::spawn({
        let service = service.clone();
        async move { service.tick_at(santiago(19, 0)).await }
    });
    for _ in 0..100 {
        if service.stats().await.unwrap().sync_in_progress {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    assert!(service.tick_at(santiago(19, 1)).await.is_none());
    source.gate.add_permits(16);
    let finished = running.await.unwrap().unwrap();
    assert_eq!(finished.results.len(), 4);

    let stats = service.stats().await.unwrap();
    assert_eq!(stats.skipped_ticks, 1);
    assert_eq!(stats.cycles, 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn syncs_of_the_same_resource_run_one_at_a_time() {
    let source = GatedSource::new().await;
    let service = service(config(), Arc::new(MemoryStore::new()), source.clone());

    let spawn_sync = || {
        let service = service.clone();
        tokio::spawn(async move { service.sync_resource(TABLES).await })
    };
    let first = spawn_sync();
    let second = spawn_sync();
    for _ in 0..100 {
        if source.waiting.load(Ordering::SeqCst) > 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(source.waiting.load(Ordering::SeqCst), 1);

    source.gate.add_permits(2);
    let mut statuses = vec![first.await.unwrap().status, second.await.unwrap().status];
    statuses.sort_by_key(|s| matches!(s, ResourceStatus::Unchanged));
    assert!(matches!(statuses[0], ResourceStatus::Merged { .. }));
    assert!(matches!(statuses[1], ResourceStatus::Unchanged));
    assert_eq!(source.waiting.load(Ordering::SeqCst), 2);
}
