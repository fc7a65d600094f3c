// Per-record optimization: convert, store, persist, then clean up
//
// Mutation order is fixed: the new asset exists before the record points at
// it, and the old asset is only touched after the record no longer does.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, instrument, warn};

use crate::core::config::Config;
use crate::core::errors::{
    ConversionError, GatewayError, OptimizeError, OptimizeResult, StoreError, UpstreamError,
};
use crate::core::types::{append_completion_marker, same_asset, OptimizeMode, Record};
use crate::services::converter::Converter;
use crate::services::gateway::ConversionGateway;
use crate::services::store::{AssetStore, RecordStore};
use crate::utils::Metrics;

/// Anything that can turn one record into its optimized form
#[async_trait]
pub trait RecordOptimizer: Send + Sync {
    async fn optimize(&self, record: &Record) -> OptimizeResult<Record>;
}

pub struct OptimizationOrchestrator {
    records: Arc<dyn RecordStore>,
    assets: Arc<dyn AssetStore>,
    gateway: Arc<ConversionGateway>,
    converter: Arc<Converter>,
    namespace: String,
    quality: f32,
    local_fallback: bool,
    store_timeout: Duration,
    metrics: Option<Metrics>,
}

impl OptimizationOrchestrator {
    pub fn new(
        config: &Config,
        records: Arc<dyn RecordStore>,
        assets: Arc<dyn AssetStore>,
        gateway: Arc<ConversionGateway>,
        converter: Arc<Converter>,
        metrics: Option<Metrics>,
    ) -> Self {
        Self {
            records,
            assets,
            gateway,
            converter,
            namespace: config.storage.namespace.trim_matches('/').to_string(),
            quality: config.conversion.quality,
            local_fallback: config.conversion.local_fallback,
            store_timeout: config.storage.store_timeout,
            metrics,
        }
    }

    /// Deterministic storage path: `<namespace>/<slug>.<ext>`
    pub fn target_path(&self, record: &Record) -> String {
        format!(
            "{}/{}.{}",
            self.namespace,
            record.stable_slug(),
            self.converter.target_format().extension()
        )
    }

    #[instrument(skip(self, record), fields(id = %record.id))]
    pub async fn optimize_with(&self, record: &Record, mode: OptimizeMode) -> OptimizeResult<Record> {
        if !record.has_remote_image() {
            return Err(ConversionError::LoadFailed("record has no remote image".to_string()).into());
        }

        let target_path = self.target_path(record);
        let new_ref = match mode {
            OptimizeMode::GatewayOnly => self.via_gateway(record, &target_path).await?,
            OptimizeMode::LocalOnly => self.via_converter(record, &target_path).await?,
            OptimizeMode::Auto if self.gateway.is_configured() => {
                self.via_gateway(record, &target_path).await?
            }
            OptimizeMode::Auto if self.local_fallback => {
                self.via_converter(record, &target_path).await?
            }
            OptimizeMode::Auto => return Err(GatewayError::NotConfigured.into()),
        };

        let mut updated = record.clone();
        updated.image_ref = new_ref;
        updated.is_optimized = true;

        match tokio::time::timeout(self.store_timeout, self.records.upsert(&updated)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                warn!("Persist failed for {}, new asset {} orphaned", record.id, updated.image_ref);
                return Err(OptimizeError::PersistFailure(e));
            }
            Err(_) => {
                warn!("Persist timed out for {}, new asset {} orphaned", record.id, updated.image_ref);
                return Err(OptimizeError::PersistFailure(StoreError::Timeout));
            }
        }

        self.discard_old_asset(&record.image_ref, &updated.image_ref).await;

        info!("Optimized '{}' -> {}", record.display_title(), updated.image_ref);
        Ok(updated)
    }

    async fn via_gateway(&self, record: &Record, target_path: &str) -> Result<String, UpstreamError> {
        Ok(self
            .gateway
            .optimize_via_endpoint(&record.image_ref, target_path)
            .await?)
    }

    async fn via_converter(&self, record: &Record, target_path: &str) -> Result<String, UpstreamError> {
        let asset = self.converter.convert(&record.image_ref, self.quality).await?;
        debug!(
            "Converted {} bytes via {}",
            asset.bytes.len(),
            asset.source_strategy.as_str()
        );

        let uploaded = tokio::time::timeout(
            self.store_timeout,
            self.assets.upload(&asset.bytes, asset.content_type, target_path),
        )
        .await
        .map_err(|_| UpstreamError::Upload(StoreError::Timeout))?
        .map_err(UpstreamError::Upload)?;

        if let Some(ref m) = self.metrics {
            m.record_upload();
        }
        Ok(append_completion_marker(&uploaded, chrono::Utc::now().timestamp_millis()))
    }

    /// Best effort; a dangling old asset is only logged
    async fn discard_old_asset(&self, old_ref: &str, new_ref: &str) {
        if same_asset(old_ref, new_ref) || !self.assets.owns(old_ref) {
            return;
        }

        let outcome = tokio::time::timeout(self.store_timeout, self.assets.delete(old_ref)).await;
        let failure = match outcome {
            Ok(Ok(())) => {
                debug!("Deleted old asset {}", old_ref);
                return;
            }
            Ok(Err(e)) => e.to_string(),
            Err(_) => "Timeout".to_string(),
        };

        warn!("Could not delete old asset {}: {}", old_ref, failure);
        if let Some(ref m) = self.metrics {
            m.record_delete_failure();
        }
    }
}

#[async_trait]
impl RecordOptimizer for OptimizationOrchestrator {
    async fn optimize(&self, record: &Record) -> OptimizeResult<Record> {
        self.optimize_with(record, OptimizeMode::Auto).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::errors::StoreResult;
    use crate::core::types::{has_completion_marker, ConvertedAsset, StrategyKind, TargetFormat};
    use crate::services::converter::ConversionStrategy;
    use crate::services::store::{JsonRecordStore, LocalAssetStore, RuntimeSettings};
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicBool, Ordering};
    use tempfile::TempDir;
    use wiremock::matchers::method;
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const PUBLIC: &str = "http://assets.test/public";

    struct FixedBytes;

    #[async_trait]
    impl ConversionStrategy for FixedBytes {
        fn kind(&self) -> StrategyKind {
            StrategyKind::DirectFetch
        }

        async fn attempt(
            &self,
            _uri: &str,
            format: TargetFormat,
            _quality: f32,
        ) -> crate::core::errors::ConversionResult<ConvertedAsset> {
            Ok(ConvertedAsset {
                bytes: vec![0xFF, 0xD8, 0xFF],
                content_type: format.content_type(),
                source_strategy: StrategyKind::DirectFetch,
            })
        }
    }

    /// Record store whose writes can be switched off
    struct FlakyRecords {
        inner: JsonRecordStore,
        fail_writes: AtomicBool,
    }

    #[async_trait]
    impl RecordStore for FlakyRecords {
        async fn list_page(&self, offset: usize, limit: usize) -> StoreResult<Vec<Record>> {
            self.inner.list_page(offset, limit).await
        }
        async fn count(&self) -> StoreResult<usize> {
            self.inner.count().await
        }
        async fn get_by_id(&self, id: &str) -> StoreResult<Option<Record>> {
            self.inner.get_by_id(id).await
        }
        async fn upsert(&self, record: &Record) -> StoreResult<()> {
            if self.fail_writes.load(Ordering::SeqCst) {
                return Err(StoreError::Rejected("write refused".to_string()));
            }
            self.inner.upsert(record).await
        }
        async fn delete(&self, id: &str) -> StoreResult<()> {
            self.inner.delete(id).await
        }
    }

    /// Asset store wrapper that remembers delete calls
    struct TrackingAssets {
        inner: LocalAssetStore,
        deleted: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl AssetStore for TrackingAssets {
        async fn upload(&self, bytes: &[u8], content_type: &str, path: &str) -> StoreResult<String> {
            self.inner.upload(bytes, content_type, path).await
        }
        async fn delete(&self, uri: &str) -> StoreResult<()> {
            self.deleted.lock().push(uri.to_string());
            self.inner.delete(uri).await
        }
        fn owns(&self, uri: &str) -> bool {
            self.inner.owns(uri)
        }
    }

    struct Fixture {
        dir: TempDir,
        records: Arc<FlakyRecords>,
        assets: Arc<TrackingAssets>,
        orchestrator: OptimizationOrchestrator,
    }

    async fn fixture(endpoint: Option<String>, local_fallback: bool) -> Fixture {
        let dir = TempDir::new().unwrap();
        let mut config = Config::for_tests();
        config.conversion.local_fallback = local_fallback;
        config.gateway.endpoint = endpoint.clone();

        let records = Arc::new(FlakyRecords {
            inner: JsonRecordStore::open(dir.path().join("records.json")).await.unwrap(),
            fail_writes: AtomicBool::new(false),
        });
        let assets = Arc::new(TrackingAssets {
            inner: LocalAssetStore::new(dir.path().join("assets"), PUBLIC).unwrap(),
            deleted: Mutex::new(Vec::new()),
        });
        let gateway = Arc::new(
            ConversionGateway::new(&config.gateway, Arc::new(RuntimeSettings::new(endpoint)), None)
                .unwrap(),
        );
        let converter = Arc::new(Converter::with_strategies(
            vec![Box::new(FixedBytes)],
            TargetFormat::Jpeg,
            None,
        ));
        let orchestrator = OptimizationOrchestrator::new(
            &config,
            records.clone(),
            assets.clone(),
            gateway,
            converter,
            None,
        );

        Fixture {
            dir,
            records,
            assets,
            orchestrator,
        }
    }

    #[tokio::test]
    async fn test_target_path_from_slug() {
        let fx = fixture(None, true).await;
        let record = Record::new("9", "Tomato Soup!", "https://src.test/soup.png");
        assert_eq!(fx.orchestrator.target_path(&record), "recipes/tomato-soup-9.jpg");
    }

    #[tokio::test]
    async fn test_local_path_uploads_persists_and_marks() {
        let fx = fixture(None, true).await;
        let record = Record::new("1", "Soup", "https://src.test/soup.png");
        fx.records.upsert(&record).await.unwrap();

        let updated = fx.orchestrator.optimize(&record).await.unwrap();
        assert!(updated.is_optimized);
        assert!(updated.image_ref.starts_with("http://assets.test/public/recipes/soup-1.jpg?t="));
        assert!(has_completion_marker(&updated.image_ref));

        let stored = fx.records.get_by_id("1").await.unwrap().unwrap();
        assert_eq!(stored, updated);
        // Foreign source is never deleted
        assert!(fx.assets.deleted.lock().is_empty());
    }

    #[tokio::test]
    async fn test_no_endpoint_and_no_fallback_is_not_configured() {
        let fx = fixture(None, false).await;
        let record = Record::new("1", "Soup", "https://src.test/soup.png");
        let err = fx.orchestrator.optimize(&record).await.unwrap_err();
        assert!(err.is_not_configured());
    }

    #[tokio::test]
    async fn test_gateway_only_surfaces_not_configured() {
        let fx = fixture(None, true).await;
        let record = Record::new("1", "Soup", "https://src.test/soup.png");
        let err = fx
            .orchestrator
            .optimize_with(&record, OptimizeMode::GatewayOnly)
            .await
            .unwrap_err();
        assert!(err.is_not_configured());
    }

    #[tokio::test]
    async fn test_gateway_result_replaces_owned_old_asset() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(serde_json::json!({"url": "https://cdn.test/recipes/soup.jpg"})),
            )
            .mount(&server)
            .await;

        let fx = fixture(Some(server.uri()), true).await;
        let old_ref = fx
            .assets
            .upload(b"old", "image/png", "legacy/soup.png")
            .await
            .unwrap();
        let record = Record::new("1", "Soup", old_ref.clone());
        fx.records.upsert(&record).await.unwrap();

        let updated = fx.orchestrator.optimize(&record).await.unwrap();
        assert!(updated.image_ref.starts_with("https://cdn.test/recipes/soup.jpg?t="));
        assert_eq!(*fx.assets.deleted.lock(), vec![old_ref]);
    }

    #[tokio::test]
    async fn test_reoptimizing_own_output_keeps_file() {
        let fx = fixture(None, true).await;
        let record = Record::new("1", "Soup", "https://src.test/soup.png");
        fx.records.upsert(&record).await.unwrap();

        let first = fx.orchestrator.optimize(&record).await.unwrap();
        let second = fx.orchestrator.optimize(&first).await.unwrap();

        // Same stored object under a fresh marker; must not be deleted
        assert!(same_asset(&first.image_ref, &second.image_ref));
        assert!(fx.assets.deleted.lock().is_empty());
    }

    #[tokio::test]
    async fn test_persist_failure_keeps_old_asset_and_retry_succeeds() {
        let fx = fixture(None, true).await;
        let old_ref = fx
            .assets
            .upload(b"old", "image/png", "legacy/stew.png")
            .await
            .unwrap();
        let record = Record::new("2", "Stew", old_ref.clone());
        fx.records.upsert(&record).await.unwrap();

        fx.records.fail_writes.store(true, Ordering::SeqCst);
        let err = fx.orchestrator.optimize(&record).await.unwrap_err();
        assert!(matches!(err, OptimizeError::PersistFailure(_)));
        assert!(fx.assets.deleted.lock().is_empty());
        let stored = fx.records.get_by_id("2").await.unwrap().unwrap();
        assert_eq!(stored.image_ref, old_ref);

        // A later attempt overwrites the orphan and completes normally
        fx.records.fail_writes.store(false, Ordering::SeqCst);
        let updated = fx.orchestrator.optimize(&stored).await.unwrap();
        assert!(updated.is_optimized);
        assert_eq!(*fx.assets.deleted.lock(), vec![old_ref]);
    }

    #[tokio::test]
    async fn test_shared_title_keeps_assets_apart() {
        let fx = fixture(None, true).await;
        let a = Record::new("1", "Chocolate Cake", "https://src.test/classic.png");
        let b = Record::new("2", "Chocolate Cake", "https://src.test/vegan.png");
        fx.records.upsert(&a).await.unwrap();
        fx.records.upsert(&b).await.unwrap();

        let a = fx.orchestrator.optimize(&a).await.unwrap();
        let b = fx.orchestrator.optimize(&b).await.unwrap();
        assert!(!same_asset(&a.image_ref, &b.image_ref));

        let root = fx.dir.path().join("assets");
        assert!(root.join("recipes/chocolate-cake-1.jpg").exists());
        assert!(root.join("recipes/chocolate-cake-2.jpg").exists());
    }

    #[tokio::test]
    async fn test_record_without_image_fails_upstream() {
        let fx = fixture(None, true).await;
        let record = Record::new("3", "Empty", "");
        let err = fx.orchestrator.optimize(&record).await.unwrap_err();
        assert!(matches!(
            err,
            OptimizeError::UpstreamFailure(UpstreamError::Converter(ConversionError::LoadFailed(_)))
        ));
    }
}
