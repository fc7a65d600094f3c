// Conversion gateway: operator-configured HTTP endpoint that converts and
// stores an image off-host and answers with the new URL.
//
// The endpoint is outside our control and its response shape varies, so the
// body is normalised through a fixed priority list before use.

use anyhow::{Context, Result};
use serde_json::Value;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, instrument, warn};

use crate::core::config::GatewayConfig;
use crate::core::errors::{GatewayError, GatewayResult};
use crate::core::types::{append_completion_marker, is_remote_uri};
use crate::middleware::circuit_breaker::{CircuitBreaker, CircuitBreakerConfig};
use crate::services::store::SettingsProvider;
use crate::utils::Metrics;

/// Object keys checked, in order, for the converted asset URL
const URL_KEYS: [&str; 3] = ["url", "optimizedUrl", "publicUrl"];

/// Longest error body kept in a ServerError
const MAX_ERROR_BODY: usize = 512;

pub struct ConversionGateway {
    http_client: reqwest::Client,
    settings: Arc<dyn SettingsProvider>,
    timeout: Duration,
    circuit_breaker: CircuitBreaker,
    metrics: Option<Metrics>,
}

impl ConversionGateway {
    pub fn new(
        config: &GatewayConfig,
        settings: Arc<dyn SettingsProvider>,
        metrics: Option<Metrics>,
    ) -> Result<Self> {
        let http_client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .pool_max_idle_per_host(4)
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            http_client,
            settings,
            timeout: config.timeout,
            circuit_breaker: CircuitBreaker::with_config(CircuitBreakerConfig::from(config)),
            metrics,
        })
    }

    pub fn is_configured(&self) -> bool {
        self.settings.conversion_endpoint().is_some()
    }

    pub fn circuit_breaker(&self) -> &CircuitBreaker {
        &self.circuit_breaker
    }

    /// Ask the endpoint to convert `source_uri` into `target_path`.
    ///
    /// Returns the new URL with the completion marker appended.
    #[instrument(skip(self))]
    pub async fn optimize_via_endpoint(
        &self,
        source_uri: &str,
        target_path: &str,
    ) -> GatewayResult<String> {
        let endpoint = self
            .settings
            .conversion_endpoint()
            .ok_or(GatewayError::NotConfigured)?;

        if !self.circuit_breaker.allow_request() {
            warn!("Circuit breaker is open, failing fast");
            return Err(GatewayError::CircuitOpen);
        }

        let start = Instant::now();
        let result = match tokio::time::timeout(
            self.timeout,
            self.post(&endpoint, source_uri, target_path),
        )
        .await
        {
            Ok(inner) => inner,
            Err(_) => Err(GatewayError::Timeout),
        };
        let duration = start.elapsed();

        if let Some(ref m) = self.metrics {
            m.record_gateway_call(result.is_ok(), duration);
        }

        match result {
            Ok(url) => {
                self.circuit_breaker.record_success();
                let marked = append_completion_marker(&url, chrono::Utc::now().timestamp_millis());
                info!("Endpoint converted {} in {:?}", target_path, duration);
                Ok(marked)
            }
            Err(e) => {
                if self.circuit_breaker.record_failure() {
                    warn!("Conversion endpoint circuit opened after repeated failures");
                    if let Some(ref m) = self.metrics {
                        m.record_circuit_breaker_trip();
                    }
                }
                Err(e)
            }
        }
    }

    async fn post(&self, endpoint: &str, source_uri: &str, target_path: &str) -> GatewayResult<String> {
        let body = serde_json::json!({
            "imageUrl": source_uri,
            "path": target_path,
            "action": "optimize",
        });

        let response = self
            .http_client
            .post(endpoint)
            .header("Content-Type", "application/json")
            .json(&body)
            .send()
            .await
            .map_err(classify_transport)?;

        let status = response.status();
        let text = response.text().await.map_err(classify_transport)?;

        if !status.is_success() {
            let mut body = text;
            if body.len() > MAX_ERROR_BODY {
                let mut cut = MAX_ERROR_BODY;
                while !body.is_char_boundary(cut) {
                    cut -= 1;
                }
                body.truncate(cut);
            }
            return Err(GatewayError::ServerError {
                status: status.as_u16(),
                body,
            });
        }

        debug!("Endpoint answered {} bytes", text.len());
        normalize_response(&text).ok_or_else(|| {
            let preview: String = text.chars().take(120).collect();
            GatewayError::InvalidResponseShape(preview)
        })
    }
}

fn classify_transport(e: reqwest::Error) -> GatewayError {
    if e.is_timeout() {
        GatewayError::Timeout
    } else {
        GatewayError::Transport(e.to_string())
    }
}

/// Extract the asset URL from any of the accepted response shapes.
///
/// Priority: bare string, array (first element), `data[]` wrapper (first
/// element), then `url`, `optimizedUrl`, `publicUrl`, `json.url`.
pub fn normalize_response(body: &str) -> Option<String> {
    match serde_json::from_str::<Value>(body) {
        Ok(value) => normalize_value(&value),
        // Plain-text body carrying only the URL
        Err(_) => accept_url(body),
    }
}

fn normalize_value(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => accept_url(s),
        Value::Array(items) => items.first().and_then(normalize_value),
        Value::Object(map) => {
            if let Some(Value::Array(items)) = map.get("data") {
                return items.first().and_then(normalize_value);
            }
            URL_KEYS
                .iter()
                .find_map(|key| map.get(*key).and_then(Value::as_str).and_then(accept_url))
                .or_else(|| {
                    map.get("json")
                        .and_then(|j| j.get("url"))
                        .and_then(Value::as_str)
                        .and_then(accept_url)
                })
        }
        _ => None,
    }
}

fn accept_url(candidate: &str) -> Option<String> {
    let trimmed = candidate.trim();
    is_remote_uri(trimmed).then(|| trimmed.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::has_completion_marker;
    use crate::services::store::RuntimeSettings;
    use wiremock::matchers::{body_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn gateway(endpoint: Option<String>, timeout: Duration) -> ConversionGateway {
        let config = GatewayConfig {
            endpoint: endpoint.clone(),
            timeout,
            failure_threshold: 2,
            cooldown: Duration::from_secs(60),
        };
        ConversionGateway::new(&config, Arc::new(RuntimeSettings::new(endpoint)), None).unwrap()
    }

    #[test]
    fn test_all_shapes_normalize_to_same_url() {
        let expected = Some("https://x/a.webp".to_string());
        assert_eq!(normalize_response(r#""https://x/a.webp""#), expected);
        assert_eq!(normalize_response("https://x/a.webp"), expected);
        assert_eq!(normalize_response(r#"{"url":"https://x/a.webp"}"#), expected);
        assert_eq!(normalize_response(r#"[{"optimizedUrl":"https://x/a.webp"}]"#), expected);
        assert_eq!(normalize_response(r#"{"data":[{"url":"https://x/a.webp"}]}"#), expected);
        assert_eq!(normalize_response(r#"{"publicUrl":"https://x/a.webp"}"#), expected);
        assert_eq!(normalize_response(r#"{"json":{"url":"https://x/a.webp"}}"#), expected);
    }

    #[test]
    fn test_key_priority() {
        let body = r#"{"publicUrl":"https://x/public.webp","url":"https://x/a.webp"}"#;
        assert_eq!(normalize_response(body).as_deref(), Some("https://x/a.webp"));

        // data[] wins over sibling keys
        let body = r#"{"url":"https://x/top.webp","data":[{"url":"https://x/inner.webp"}]}"#;
        assert_eq!(normalize_response(body).as_deref(), Some("https://x/inner.webp"));
    }

    #[test]
    fn test_unusable_shapes() {
        assert_eq!(normalize_response(r#"{"ok":true}"#), None);
        assert_eq!(normalize_response("[]"), None);
        assert_eq!(normalize_response(r#"{"url":""}"#), None);
        assert_eq!(normalize_response(r#"{"url":42}"#), None);
        assert_eq!(normalize_response("done"), None);
    }

    #[tokio::test]
    async fn test_not_configured_fails_immediately() {
        let gw = gateway(None, Duration::from_secs(1));
        assert!(!gw.is_configured());
        let err = gw.optimize_via_endpoint("https://x/a.png", "recipes/a").await.unwrap_err();
        assert_eq!(err, GatewayError::NotConfigured);
    }

    #[tokio::test]
    async fn test_posts_contract_and_marks_result() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/convert"))
            .and(body_json(serde_json::json!({
                "imageUrl": "https://src.test/big.png",
                "path": "recipes/soup.webp",
                "action": "optimize",
            })))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(serde_json::json!([{"optimizedUrl": "https://cdn.test/recipes/soup.webp"}])),
            )
            .expect(1)
            .mount(&server)
            .await;

        let gw = gateway(Some(format!("{}/convert", server.uri())), Duration::from_secs(2));
        let url = gw
            .optimize_via_endpoint("https://src.test/big.png", "recipes/soup.webp")
            .await
            .unwrap();
        assert!(url.starts_with("https://cdn.test/recipes/soup.webp?t="));
        assert!(has_completion_marker(&url));
    }

    #[tokio::test]
    async fn test_server_error_carries_status() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(502).set_body_string("bad gateway"))
            .mount(&server)
            .await;

        let gw = gateway(Some(server.uri()), Duration::from_secs(2));
        let err = gw.optimize_via_endpoint("https://x/a.png", "recipes/a.webp").await.unwrap_err();
        assert_eq!(
            err,
            GatewayError::ServerError {
                status: 502,
                body: "bad gateway".to_string()
            }
        );
    }

    #[tokio::test]
    async fn test_timeout_is_distinct() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(serde_json::json!({"url": "https://x/a.webp"}))
                    .set_delay(Duration::from_secs(3)),
            )
            .mount(&server)
            .await;

        let gw = gateway(Some(server.uri()), Duration::from_millis(200));
        let err = gw.optimize_via_endpoint("https://x/a.png", "recipes/a.webp").await.unwrap_err();
        assert_eq!(err, GatewayError::Timeout);
    }

    #[tokio::test]
    async fn test_invalid_shape() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"status": "queued"})))
            .mount(&server)
            .await;

        let gw = gateway(Some(server.uri()), Duration::from_secs(2));
        let err = gw.optimize_via_endpoint("https://x/a.png", "recipes/a.webp").await.unwrap_err();
        assert!(matches!(err, GatewayError::InvalidResponseShape(_)));
    }

    #[tokio::test]
    async fn test_circuit_opens_after_repeated_failures() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(500))
            .expect(2)
            .mount(&server)
            .await;

        let gw = gateway(Some(server.uri()), Duration::from_secs(2));
        for _ in 0..2 {
            let err = gw.optimize_via_endpoint("https://x/a.png", "p").await.unwrap_err();
            assert!(matches!(err, GatewayError::ServerError { status: 500, .. }));
        }
        let err = gw.optimize_via_endpoint("https://x/a.png", "p").await.unwrap_err();
        assert_eq!(err, GatewayError::CircuitOpen);
    }
}
