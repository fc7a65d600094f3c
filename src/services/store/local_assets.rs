// Directory-backed asset store served under a public base URL

use async_trait::async_trait;
use std::path::{Component, Path, PathBuf};
use tracing::{debug, info};

use super::AssetStore;
use crate::core::errors::{StoreError, StoreResult};

pub struct LocalAssetStore {
    root: PathBuf,
    public_base_url: String,
}

impl LocalAssetStore {
    pub fn new(root: impl AsRef<Path>, public_base_url: &str) -> StoreResult<Self> {
        let root = root.as_ref().to_path_buf();
        std::fs::create_dir_all(&root)?;
        info!("Asset store at {} (public: {})", root.display(), public_base_url);
        Ok(Self {
            root,
            public_base_url: public_base_url.trim_end_matches('/').to_string(),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Resolve a relative storage path under the root, rejecting traversal
    fn resolve(&self, path: &str) -> StoreResult<PathBuf> {
        let relative = Path::new(path.trim_start_matches('/'));
        let clean = relative
            .components()
            .all(|c| matches!(c, Component::Normal(_)));
        if !clean || relative.as_os_str().is_empty() {
            return Err(StoreError::Rejected(format!("invalid asset path: {path}")));
        }
        Ok(self.root.join(relative))
    }

    /// Storage path for an owned URI, with any query string dropped
    fn path_for_uri<'a>(&self, uri: &'a str) -> Option<&'a str> {
        let without_query = uri.split(['?', '#']).next().unwrap_or(uri);
        without_query
            .strip_prefix(self.public_base_url.as_str())
            .and_then(|rest| rest.strip_prefix('/'))
            .filter(|rest| !rest.is_empty())
    }
}

#[async_trait]
impl AssetStore for LocalAssetStore {
    async fn upload(&self, bytes: &[u8], content_type: &str, path: &str) -> StoreResult<String> {
        let target = self.resolve(path)?;
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&target, bytes).await?;
        debug!(
            "Stored {} bytes ({}) at {}",
            bytes.len(),
            content_type,
            target.display()
        );
        Ok(format!(
            "{}/{}",
            self.public_base_url,
            path.trim_start_matches('/')
        ))
    }

    async fn delete(&self, uri: &str) -> StoreResult<()> {
        let path = self
            .path_for_uri(uri)
            .ok_or_else(|| StoreError::Rejected(format!("not an owned asset: {uri}")))?;
        let target = self.resolve(path)?;
        match tokio::fs::remove_file(&target).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(StoreError::NotFound(uri.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    fn owns(&self, uri: &str) -> bool {
        self.path_for_uri(uri).is_some()
    }
}
