// File-backed record store
//
// Loads a JSON array of records once and rewrites the whole file on every
// mutation. Writes go to a sibling temp file first and are renamed into place
// so a crash never leaves a half-written collection.

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tokio::sync::RwLock;
use tracing::{debug, info};

use super::RecordStore;
use crate::core::errors::{StoreError, StoreResult};
use crate::core::types::Record;

pub struct JsonRecordStore {
    path: PathBuf,
    records: RwLock<Vec<Record>>,
}

impl JsonRecordStore {
    /// Open the collection at `path`; a missing file is an empty collection
    pub async fn open(path: impl AsRef<Path>) -> StoreResult<Self> {
        let path = path.as_ref().to_path_buf();
        let records = if tokio::fs::try_exists(&path).await? {
            let data = tokio::fs::read_to_string(&path).await?;
            if data.trim().is_empty() {
                Vec::new()
            } else {
                serde_json::from_str::<Vec<Record>>(&data)?
            }
        } else {
            Vec::new()
        };

        info!("Loaded {} records from {}", records.len(), path.display());

        Ok(Self {
            path,
            records: RwLock::new(records),
        })
    }

    async fn persist(&self, records: &[Record]) -> StoreResult<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }
        let data = serde_json::to_vec_pretty(records)?;
        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, data).await?;
        tokio::fs::rename(&tmp, &self.path).await?;
        debug!("Persisted {} records", records.len());
        Ok(())
    }
}

#[async_trait]
impl RecordStore for JsonRecordStore {
    async fn list_page(&self, offset: usize, limit: usize) -> StoreResult<Vec<Record>> {
        let records = self.records.read().await;
        Ok(records.iter().skip(offset).take(limit).cloned().collect())
    }

    async fn count(&self) -> StoreResult<usize> {
        Ok(self.records.read().await.len())
    }

    async fn get_by_id(&self, id: &str) -> StoreResult<Option<Record>> {
        Ok(self.records.read().await.iter().find(|r| r.id == id).cloned())
    }

    async fn upsert(&self, record: &Record) -> StoreResult<()> {
        let mut records = self.records.write().await;
        let mut next = records.clone();
        match next.iter_mut().find(|r| r.id == record.id) {
            Some(existing) => *existing = record.clone(),
            None => next.push(record.clone()),
        }
        // Memory only changes once the file write succeeded
        self.persist(&next).await?;
        *records = next;
        Ok(())
    }

    async fn delete(&self, id: &str) -> StoreResult<()> {
        let mut records = self.records.write().await;
        let Some(index) = records.iter().position(|r| r.id == id) else {
            return Err(StoreError::NotFound(id.to_string()));
        };
        let mut next = records.clone();
        next.remove(index);
        self.persist(&next).await?;
        *records = next;
        Ok(())
    }
}
