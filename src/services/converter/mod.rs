// Local conversion: an ordered chain of strategies, first success wins
//
// Each strategy returns a tagged result; the chain only moves on when an
// attempt reports failure. The last failure is what the caller sees.

pub mod direct;
pub mod element;

use anyhow::Result;
use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

use crate::core::config::ConversionConfig;
use crate::core::errors::{ConversionError, ConversionResult};
use crate::core::types::{ConvertedAsset, StrategyKind, TargetFormat};
use crate::utils::image_ops::{composite_on_white, ImageCodec, RasterCodec};
use crate::utils::Metrics;

pub use direct::DirectFetchStrategy;
pub use element::ElementLoadStrategy;

#[async_trait]
pub trait ConversionStrategy: Send + Sync {
    fn kind(&self) -> StrategyKind;

    async fn attempt(
        &self,
        uri: &str,
        format: TargetFormat,
        quality: f32,
    ) -> ConversionResult<ConvertedAsset>;
}

pub struct Converter {
    strategies: Vec<Box<dyn ConversionStrategy>>,
    format: TargetFormat,
    metrics: Option<Metrics>,
}

impl Converter {
    /// Standard chain: direct fetch, then element-load fallback
    pub fn new(config: &ConversionConfig, metrics: Option<Metrics>) -> Result<Self> {
        let codec: Arc<dyn ImageCodec> = Arc::new(RasterCodec);
        let strategies: Vec<Box<dyn ConversionStrategy>> = vec![
            Box::new(DirectFetchStrategy::new(codec.clone(), config.direct_fetch_timeout)?),
            Box::new(ElementLoadStrategy::new(
                codec,
                &config.cors_origin,
                config.element_load_timeout,
            )?),
        ];

        info!(
            "Converter ready ({} strategies, target {})",
            strategies.len(),
            config.target_format.content_type()
        );

        Ok(Self::with_strategies(strategies, config.target_format, metrics))
    }

    pub fn with_strategies(
        strategies: Vec<Box<dyn ConversionStrategy>>,
        format: TargetFormat,
        metrics: Option<Metrics>,
    ) -> Self {
        Self {
            strategies,
            format,
            metrics,
        }
    }

    pub fn target_format(&self) -> TargetFormat {
        self.format
    }

    #[instrument(skip(self))]
    pub async fn convert(&self, uri: &str, quality: f32) -> ConversionResult<ConvertedAsset> {
        let mut last_error = None;

        for strategy in &self.strategies {
            match strategy.attempt(uri, self.format, quality).await {
                Ok(asset) => {
                    debug!(
                        "{} produced {} bytes",
                        strategy.kind().as_str(),
                        asset.bytes.len()
                    );
                    if let Some(ref m) = self.metrics {
                        m.record_local_conversion(Some(asset.source_strategy));
                    }
                    return Ok(asset);
                }
                Err(e) => {
                    debug!("{} failed, trying next strategy: {}", strategy.kind().as_str(), e);
                    last_error = Some(e);
                }
            }
        }

        if let Some(ref m) = self.metrics {
            m.record_local_conversion(None);
        }
        let error = last_error
            .unwrap_or_else(|| ConversionError::LoadFailed("no conversion strategies".to_string()));
        warn!("All conversion strategies failed for {}: {}", uri, error);
        Err(error)
    }
}

/// Decode, flatten onto white and encode on the blocking pool
pub(crate) async fn transcode(
    codec: Arc<dyn ImageCodec>,
    bytes: Vec<u8>,
    mime_hint: Option<String>,
    format: TargetFormat,
    quality: f32,
) -> ConversionResult<Vec<u8>> {
    tokio::task::spawn_blocking(move || {
        let decoded = codec
            .decode(&bytes, mime_hint.as_deref())
            .map_err(|e| ConversionError::Decode(format!("{e:#}")))?;
        let flattened = composite_on_white(&decoded);
        codec
            .encode(&flattened, format, quality)
            .map_err(|e| ConversionError::Encode(format!("{e:#}")))
    })
    .await
    .map_err(|e| ConversionError::Encode(format!("blocking task failed: {e}")))?
}
