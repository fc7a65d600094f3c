// Host collaborators: record persistence, asset storage, settings
//
// The pipeline only ever talks to these traits. The bundled implementations
// make the binary usable on its own; a host can swap in its own database or
// bucket client without touching the orchestration code.

pub mod json_records;
pub mod local_assets;

use async_trait::async_trait;
use parking_lot::RwLock;

use crate::core::errors::StoreResult;
use crate::core::types::Record;

pub use json_records::JsonRecordStore;
pub use local_assets::LocalAssetStore;

#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Records `[offset, offset + limit)` in stable collection order
    async fn list_page(&self, offset: usize, limit: usize) -> StoreResult<Vec<Record>>;

    async fn count(&self) -> StoreResult<usize>;

    async fn get_by_id(&self, id: &str) -> StoreResult<Option<Record>>;

    async fn upsert(&self, record: &Record) -> StoreResult<()>;

    async fn delete(&self, id: &str) -> StoreResult<()>;
}

#[async_trait]
pub trait AssetStore: Send + Sync {
    /// Store bytes at `path` (overwriting) and return the public reference
    async fn upload(&self, bytes: &[u8], content_type: &str, path: &str) -> StoreResult<String>;

    /// Best-effort removal of a previously stored asset
    async fn delete(&self, uri: &str) -> StoreResult<()>;

    /// Whether `uri` points into this store (only those are ever deleted)
    fn owns(&self, uri: &str) -> bool;
}

pub trait SettingsProvider: Send + Sync {
    fn conversion_endpoint(&self) -> Option<String>;
}

/// Endpoint seeded from config and replaceable at runtime by the operator
#[derive(Debug, Default)]
pub struct RuntimeSettings {
    endpoint: RwLock<Option<String>>,
}

impl RuntimeSettings {
    pub fn new(endpoint: Option<String>) -> Self {
        Self {
            endpoint: RwLock::new(endpoint),
        }
    }

    pub fn set_conversion_endpoint(&self, endpoint: Option<String>) {
        *self.endpoint.write() = endpoint
            .map(|e| e.trim().to_string())
            .filter(|e| !e.is_empty());
    }
}

impl SettingsProvider for RuntimeSettings {
    fn conversion_endpoint(&self) -> Option<String> {
        self.endpoint.read().clone()
    }
}
