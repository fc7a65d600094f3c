// End-to-end pipeline behaviour through the operator session

use asset_rehab::core::errors::StoreResult;
use asset_rehab::core::types::has_completion_marker;
use asset_rehab::{
    AssetStore, Config, OptimizationSession, Record, RecordStore, RunOutcome, SessionError,
    SessionPhase, SizeProbe,
};

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use wiremock::matchers::{body_partial_json, method};
use wiremock::{Mock, MockServer, ResponseTemplate};

const HEAVY: u64 = 900 * 1024;
const LIGHT: u64 = 12 * 1024;

#[derive(Default)]
struct MemoryRecords {
    records: Mutex<Vec<Record>>,
    writes: Mutex<usize>,
}

impl MemoryRecords {
    fn with(records: Vec<Record>) -> Self {
        Self {
            records: Mutex::new(records),
            writes: Mutex::new(0),
        }
    }

    fn all(&self) -> Vec<Record> {
        self.records.lock().clone()
    }
}

#[async_trait]
impl RecordStore for MemoryRecords {
    async fn list_page(&self, offset: usize, limit: usize) -> StoreResult<Vec<Record>> {
        Ok(self.records.lock().iter().skip(offset).take(limit).cloned().collect())
    }

    async fn count(&self) -> StoreResult<usize> {
        Ok(self.records.lock().len())
    }

    async fn get_by_id(&self, id: &str) -> StoreResult<Option<Record>> {
        Ok(self.records.lock().iter().find(|r| r.id == id).cloned())
    }

    async fn upsert(&self, record: &Record) -> StoreResult<()> {
        let mut records = self.records.lock();
        match records.iter_mut().find(|r| r.id == record.id) {
            Some(existing) => *existing = record.clone(),
            None => records.push(record.clone()),
        }
        *self.writes.lock() += 1;
        Ok(())
    }

    async fn delete(&self, id: &str) -> StoreResult<()> {
        self.records.lock().retain(|r| r.id != id);
        Ok(())
    }
}

/// Assets live elsewhere in these scenarios; nothing is owned
struct NoAssets;

#[async_trait]
impl AssetStore for NoAssets {
    async fn upload(&self, _bytes: &[u8], _content_type: &str, path: &str) -> StoreResult<String> {
        Ok(format!("http://assets.test/public/{path}"))
    }

    async fn delete(&self, _uri: &str) -> StoreResult<()> {
        Ok(())
    }

    fn owns(&self, _uri: &str) -> bool {
        false
    }
}

struct MapProbe(HashMap<String, u64>);

#[async_trait]
impl SizeProbe for MapProbe {
    async fn probe(&self, uri: &str, _timeout: Duration) -> u64 {
        self.0.get(uri).copied().unwrap_or(0)
    }
}

fn image_uri(i: usize) -> String {
    format!("https://img.test/recipes/{i}.png")
}

/// `n` records; every index in `heavy` probes above the threshold
fn collection(n: usize, heavy: &[usize]) -> (Vec<Record>, HashMap<String, u64>) {
    let records: Vec<Record> = (0..n)
        .map(|i| Record::new(format!("r{i}"), format!("Recipe {i}"), image_uri(i)))
        .collect();
    let sizes = (0..n)
        .map(|i| (image_uri(i), if heavy.contains(&i) { HEAVY } else { LIGHT }))
        .collect();
    (records, sizes)
}

async fn endpoint(delay: Duration) -> MockServer {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(serde_json::json!({"data": [{"url": "https://cdn.test/optimized.webp"}]}))
                .set_delay(delay),
        )
        .mount(&server)
        .await;
    server
}

fn session(
    config: &Config,
    records: Arc<MemoryRecords>,
    sizes: HashMap<String, u64>,
) -> OptimizationSession {
    OptimizationSession::assemble(
        config,
        records,
        Arc::new(NoAssets),
        Arc::new(MapProbe(sizes)),
        None,
    )
    .unwrap()
}

async fn wait_for_progress(session: &OptimizationSession, at_least: usize) {
    let mut rx = session.subscribe_progress();
    tokio::time::timeout(Duration::from_secs(10), async {
        while rx.borrow_and_update().current < at_least {
            if rx.changed().await.is_err() {
                break;
            }
        }
    })
    .await
    .unwrap();
}

#[tokio::test]
async fn test_full_collection_scan_then_run() {
    let server = endpoint(Duration::ZERO).await;
    let mut config = Config::for_tests();
    config.gateway.endpoint = Some(server.uri());

    let heavy = [1, 5, 9, 14, 22, 31, 38, 44, 50, 59, 66, 72];
    let (records, sizes) = collection(73, &heavy);
    let store = Arc::new(MemoryRecords::with(records));
    let session = session(&config, store.clone(), sizes);

    let mut windows = Vec::new();
    loop {
        let report = session.scan_window().await.unwrap();
        windows.push(report.processed);
        if report.exhausted {
            break;
        }
    }
    assert_eq!(windows, vec![30, 30, 13]);

    let snapshot = session.snapshot();
    assert_eq!(snapshot.cursor, 73);
    assert_eq!(snapshot.total_records, 73);
    assert_eq!(snapshot.candidates, 12);
    assert_eq!(snapshot.unknown_count, 0);

    assert_eq!(session.start_run().unwrap(), 12);
    assert_eq!(session.wait_for_run().await, Some(RunOutcome::Completed));

    let progress = session.progress();
    assert_eq!(progress.success_count + progress.failure_count, 12);
    assert_eq!(progress.success_count, 12);
    assert_eq!(session.snapshot().candidates, 0);
    assert_eq!(session.phase(), SessionPhase::Idle);

    let optimized: Vec<Record> = store.all().into_iter().filter(|r| r.is_optimized).collect();
    assert_eq!(optimized.len(), 12);
    assert!(optimized.iter().all(|r| has_completion_marker(&r.image_ref)));
    assert_eq!(*store.writes.lock(), 12);
}

#[tokio::test]
async fn test_stop_retains_unprocessed_candidates() {
    let server = endpoint(Duration::from_millis(150)).await;
    let mut config = Config::for_tests();
    config.gateway.endpoint = Some(server.uri());

    let (records, sizes) = collection(10, &[0, 1, 2, 3, 4, 5, 6, 7, 8, 9]);
    let session = session(&config, Arc::new(MemoryRecords::with(records)), sizes);
    session.scan_window().await.unwrap();

    session.start_run().unwrap();
    assert!(matches!(session.start_run(), Err(SessionError::AlreadyRunning)));
    assert!(matches!(session.scan_window().await, Err(SessionError::AlreadyRunning)));

    wait_for_progress(&session, 2).await;
    session.stop_run().unwrap();
    assert_eq!(session.wait_for_run().await, Some(RunOutcome::Cancelled));

    let done = session.progress().current;
    assert!((2..10).contains(&done));
    let remaining = session.candidate_titles();
    assert_eq!(remaining.len(), 10 - done);
    let expected: Vec<String> = (done..10).map(|i| format!("Recipe {i}")).collect();
    assert_eq!(remaining, expected);

    // The retained tail is picked up by the next run
    assert_eq!(session.start_run().unwrap(), 10 - done);
    assert_eq!(session.wait_for_run().await, Some(RunOutcome::Completed));
    assert!(session.candidate_titles().is_empty());
}

#[tokio::test]
async fn test_slow_item_times_out_and_run_continues() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(body_partial_json(serde_json::json!({"imageUrl": image_uri(1)})))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(serde_json::json!({"url": "https://cdn.test/slow.webp"}))
                .set_delay(Duration::from_secs(5)),
        )
        .with_priority(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200).set_body_string("https://cdn.test/fast.webp"))
        .mount(&server)
        .await;

    let mut config = Config::for_tests();
    config.gateway.endpoint = Some(server.uri());
    config.gateway.timeout = Duration::from_secs(10);
    config.run.item_timeout = Duration::from_millis(300);

    let (records, sizes) = collection(4, &[0, 1, 2, 3]);
    let session = session(&config, Arc::new(MemoryRecords::with(records)), sizes);
    session.scan_window().await.unwrap();
    session.start_run().unwrap();
    assert_eq!(session.wait_for_run().await, Some(RunOutcome::Completed));

    let progress = session.progress();
    assert_eq!(progress.success_count, 3);
    assert_eq!(progress.failure_count, 1);
    let errors = session.errors();
    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0].record_title, "Recipe 1");
    assert_eq!(errors[0].message, "Timeout");

    session.clear_errors();
    assert!(session.snapshot().errors.is_empty());
}

#[tokio::test]
async fn test_unknown_sizes_need_force_all() {
    let config = Config::for_tests();
    let (records, _) = collection(5, &[]);
    let session = session(&config, Arc::new(MemoryRecords::with(records)), HashMap::new());

    let report = session.scan_window().await.unwrap();
    assert_eq!(report.candidates_added, 0);
    assert_eq!(report.unknown_added, 5);

    session.reset_cursor().unwrap();
    session.set_force_all(true);
    let report = session.scan_window().await.unwrap();
    assert_eq!(report.candidates_added, 5);
    let snapshot = session.snapshot();
    assert!(snapshot.force_all);
    assert_eq!(snapshot.unknown_count, 0);
}

#[tokio::test]
async fn test_record_test_requires_endpoint() {
    let config = Config::for_tests();
    let (records, sizes) = collection(2, &[0]);
    let session = session(&config, Arc::new(MemoryRecords::with(records)), sizes);

    match session.test_record("r0").await {
        Err(SessionError::Optimize(e)) => assert!(e.is_not_configured()),
        other => panic!("expected NotConfigured, got {other:?}"),
    }
    assert!(matches!(
        session.test_record("missing").await,
        Err(SessionError::RecordNotFound(_))
    ));
    assert!(matches!(session.stop_run(), Err(SessionError::NotRunning)));

    let server = endpoint(Duration::ZERO).await;
    session.set_conversion_endpoint(Some(server.uri()));
    let updated = session.test_record("r0").await.unwrap();
    assert!(updated.is_optimized);
    assert!(updated.image_ref.starts_with("https://cdn.test/optimized.webp?t="));
}
