// Size probe: header-only size check for remote images
//
// A probe is advisory. It never downloads the body, always runs under its own
// hard deadline, and reports every kind of failure as UNKNOWN_SIZE.

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::header::CONTENT_LENGTH;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tracing::{debug, instrument};
use url::Url;

use crate::utils::Metrics;

/// Sentinel for "size could not be determined"; never means "empty"
pub const UNKNOWN_SIZE: u64 = 0;

/// Query key used to bypass intermediate caches
pub const CACHE_BUST_KEY: &str = "_cb";

#[async_trait]
pub trait SizeProbe: Send + Sync {
    /// Byte size of the asset at `uri`, or `UNKNOWN_SIZE`
    async fn probe(&self, uri: &str, timeout: Duration) -> u64;
}

pub struct HttpSizeProbe {
    http_client: reqwest::Client,
    sequence: AtomicU64,
    metrics: Option<Metrics>,
}

impl HttpSizeProbe {
    pub fn new(metrics: Option<Metrics>) -> Result<Self> {
        let http_client = reqwest::Client::builder()
            .pool_max_idle_per_host(10)
            .pool_idle_timeout(Duration::from_secs(90))
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            http_client,
            sequence: AtomicU64::new(0),
            metrics,
        })
    }

    /// Append a query parameter unique to this probe
    fn cache_busted(&self, uri: &str) -> Option<Url> {
        let mut url = Url::parse(uri).ok()?;
        let seq = self.sequence.fetch_add(1, Ordering::Relaxed);
        let nonce = format!("{}-{}", chrono::Utc::now().timestamp_millis(), seq);
        url.query_pairs_mut().append_pair(CACHE_BUST_KEY, &nonce);
        Some(url)
    }

    async fn head_content_length(&self, url: Url) -> Option<u64> {
        let response = match self.http_client.head(url).send().await {
            Ok(r) => r,
            Err(e) => {
                debug!("Probe request failed: {}", e);
                return None;
            }
        };

        if !response.status().is_success() {
            debug!("Probe returned status {}", response.status());
            return None;
        }

        // reqwest's content_length() is the body hint, which is 0 for HEAD
        response
            .headers()
            .get(CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse::<u64>().ok())
    }
}

#[async_trait]
impl SizeProbe for HttpSizeProbe {
    #[instrument(skip(self))]
    async fn probe(&self, uri: &str, timeout: Duration) -> u64 {
        let size = match self.cache_busted(uri) {
            // Dropping the future on timeout aborts the in-flight request
            Some(url) => match tokio::time::timeout(timeout, self.head_content_length(url)).await {
                Ok(Some(len)) => len,
                Ok(None) => UNKNOWN_SIZE,
                Err(_) => {
                    debug!("Probe exceeded {:?}", timeout);
                    UNKNOWN_SIZE
                }
            },
            None => UNKNOWN_SIZE,
        };

        if let Some(ref m) = self.metrics {
            m.record_probe(size);
        }
        size
    }
}
