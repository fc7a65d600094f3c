// Strategy 2: anonymous cross-origin load
//
// Requests the asset the way an anonymous cross-origin image element would:
// an Origin header, no credentials, and the pixels are only readable when the
// response grants access to that origin. The whole load races a fixed bound;
// whichever finishes first is the outcome.

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::header::{ACCEPT, ACCESS_CONTROL_ALLOW_ORIGIN, CONTENT_TYPE, ORIGIN};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use super::{transcode, ConversionStrategy};
use crate::core::errors::{ConversionError, ConversionResult};
use crate::core::types::{ConvertedAsset, StrategyKind, TargetFormat};
use crate::utils::image_ops::ImageCodec;

pub struct ElementLoadStrategy {
    http_client: reqwest::Client,
    codec: Arc<dyn ImageCodec>,
    origin: String,
    timeout: Duration,
}

impl ElementLoadStrategy {
    pub fn new(codec: Arc<dyn ImageCodec>, origin: &str, timeout: Duration) -> Result<Self> {
        let http_client = reqwest::Client::builder()
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            http_client,
            codec,
            origin: origin.trim_end_matches('/').to_string(),
            timeout,
        })
    }

    fn read_back_allowed(&self, allow_origin: Option<&str>) -> bool {
        match allow_origin.map(str::trim) {
            Some("*") => true,
            Some(value) => value.trim_end_matches('/') == self.origin,
            None => false,
        }
    }

    async fn load(&self, uri: &str, format: TargetFormat, quality: f32) -> ConversionResult<Vec<u8>> {
        let response = self
            .http_client
            .get(uri)
            .header(ORIGIN, &self.origin)
            .header(ACCEPT, "image/*")
            .send()
            .await
            .map_err(|e| ConversionError::LoadFailed(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(ConversionError::LoadFailed(format!("HTTP {}", status)));
        }

        let allow_origin = response
            .headers()
            .get(ACCESS_CONTROL_ALLOW_ORIGIN)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        if !self.read_back_allowed(allow_origin.as_deref()) {
            debug!("No read-back grant for {} (got {:?})", self.origin, allow_origin);
            return Err(ConversionError::CorsBlocked);
        }

        let mime = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let bytes = response
            .bytes()
            .await
            .map_err(|e| ConversionError::LoadFailed(e.to_string()))?;

        // An element that cannot decode its source fires a load error
        match transcode(self.codec.clone(), bytes.to_vec(), mime, format, quality).await {
            Err(ConversionError::Decode(msg)) => Err(ConversionError::LoadFailed(msg)),
            other => other,
        }
    }
}

#[async_trait]
impl ConversionStrategy for ElementLoadStrategy {
    fn kind(&self) -> StrategyKind {
        StrategyKind::ElementLoad
    }

    async fn attempt(
        &self,
        uri: &str,
        format: TargetFormat,
        quality: f32,
    ) -> ConversionResult<ConvertedAsset> {
        let encoded = tokio::time::timeout(self.timeout, self.load(uri, format, quality))
            .await
            .map_err(|_| ConversionError::Timeout)??;

        Ok(ConvertedAsset {
            bytes: encoded,
            content_type: format.content_type(),
            source_strategy: StrategyKind::ElementLoad,
        })
    }
}
