// Strategy 1: fetch the full asset and re-encode it in process

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::header::CONTENT_TYPE;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use super::{transcode, ConversionStrategy};
use crate::core::errors::{ConversionError, ConversionResult};
use crate::core::types::{ConvertedAsset, StrategyKind, TargetFormat};
use crate::utils::image_ops::ImageCodec;

pub struct DirectFetchStrategy {
    http_client: reqwest::Client,
    codec: Arc<dyn ImageCodec>,
    timeout: Duration,
}

impl DirectFetchStrategy {
    pub fn new(codec: Arc<dyn ImageCodec>, timeout: Duration) -> Result<Self> {
        let http_client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            http_client,
            codec,
            timeout,
        })
    }

    async fn fetch(&self, uri: &str) -> ConversionResult<(Vec<u8>, Option<String>)> {
        let response = self
            .http_client
            .get(uri)
            .send()
            .await
            .map_err(|e| ConversionError::LoadFailed(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(ConversionError::LoadFailed(format!("HTTP {}", status)));
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
        Ok((bytes.to_vec(), mime))
    }
}

#[async_trait]
impl ConversionStrategy for DirectFetchStrategy {
    fn kind(&self) -> StrategyKind {
        StrategyKind::DirectFetch
    }

    async fn attempt(
        &self,
        uri: &str,
        format: TargetFormat,
        quality: f32,
    ) -> ConversionResult<ConvertedAsset> {
        let (bytes, mime) = tokio::time::timeout(self.timeout, self.fetch(uri))
            .await
            .map_err(|_| ConversionError::Timeout)??;

        debug!("Fetched {} bytes ({:?})", bytes.len(), mime);

        let encoded = transcode(self.codec.clone(), bytes, mime, format, quality).await?;
        Ok(ConvertedAsset {
            bytes: encoded,
            content_type: format.content_type(),
            source_strategy: StrategyKind::DirectFetch,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::image_ops::{solid_png, RasterCodec};
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn strategy(timeout: Duration) -> DirectFetchStrategy {
        DirectFetchStrategy::new(Arc::new(RasterCodec), timeout).unwrap()
    }

    #[tokio::test]
    async fn test_fetch_and_reencode() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/a.png"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_raw(solid_png(16, 16, [0, 0, 255, 0]).unwrap(), "image/png"),
            )
            .mount(&server)
            .await;

        let asset = strategy(Duration::from_secs(2))
            .attempt(&format!("{}/a.png", server.uri()), TargetFormat::Jpeg, 0.8)
            .await
            .unwrap();
        assert_eq!(asset.content_type, "image/jpeg");
        assert_eq!(asset.source_strategy, StrategyKind::DirectFetch);

        // Fully transparent source must come out white, not black
        let img = image::load_from_memory(&asset.bytes).unwrap().to_rgb8();
        assert!(img.get_pixel(8, 8).0.iter().all(|c| *c > 240));
    }

    #[tokio::test]
    async fn test_http_error_is_load_failed() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let err = strategy(Duration::from_secs(2))
            .attempt(&format!("{}/missing.png", server.uri()), TargetFormat::WebP, 0.8)
            .await
            .unwrap_err();
        assert!(matches!(err, ConversionError::LoadFailed(_)));
    }

    #[tokio::test]
    async fn test_non_image_is_decode_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_string("<html>login</html>"))
            .mount(&server)
            .await;

        let err = strategy(Duration::from_secs(2))
            .attempt(&format!("{}/page", server.uri()), TargetFormat::WebP, 0.8)
            .await
            .unwrap_err();
        assert!(matches!(err, ConversionError::Decode(_)));
    }

    #[tokio::test]
    async fn test_slow_source_times_out() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(3)))
            .mount(&server)
            .await;

        let err = strategy(Duration::from_millis(200))
            .attempt(&format!("{}/slow.png", server.uri()), TargetFormat::WebP, 0.8)
            .await
            .unwrap_err();
        assert_eq!(err, ConversionError::Timeout);
    }
}
