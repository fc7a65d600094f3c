use crate::core::errors::ConfigError;
use crate::core::types::TargetFormat;
use std::env;
use std::path::PathBuf;
use std::time::Duration;
use tracing::Level;

/// Server configuration
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub port: u16,
    pub host: String,
    pub log_level: Level,
}

/// Scan configuration
#[derive(Debug, Clone)]
pub struct ScanConfig {
    /// Records examined per scan window
    pub window_size: usize,
    /// Byte size above which an image counts as heavy
    pub heavy_threshold_bytes: u64,
    pub probe_timeout: Duration,
    /// Initial force-all toggle (operator can flip it at runtime)
    pub force_all: bool,
    /// Skip records already flagged or carrying the completion marker
    pub skip_processed: bool,
}

/// Local conversion configuration
#[derive(Debug, Clone)]
pub struct ConversionConfig {
    pub quality: f32,
    pub target_format: TargetFormat,
    pub direct_fetch_timeout: Duration,
    pub element_load_timeout: Duration,
    /// Origin presented by the element-load strategy
    pub cors_origin: String,
    /// Use the local converter when no endpoint is configured
    pub local_fallback: bool,
}

/// Conversion endpoint configuration
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub endpoint: Option<String>,
    pub timeout: Duration,
    pub failure_threshold: usize,
    pub cooldown: Duration,
}

/// Batch run configuration
#[derive(Debug, Clone)]
pub struct RunConfig {
    pub item_timeout: Duration,
    pub pacing_delay: Duration,
}

/// Record and asset storage configuration
#[derive(Debug, Clone)]
pub struct StorageConfig {
    pub records_path: PathBuf,
    pub asset_root: PathBuf,
    pub public_base_url: String,
    pub namespace: String,
    pub store_timeout: Duration,
}

/// Main application configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub server: ServerConfig,
    pub scan: ScanConfig,
    pub conversion: ConversionConfig,
    pub gateway: GatewayConfig,
    pub run: RunConfig,
    pub storage: StorageConfig,
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|s| s.trim().parse().ok())
        .unwrap_or(default)
}

fn env_millis(key: &str, default_ms: u64) -> Duration {
    Duration::from_millis(env_parse(key, default_ms))
}

impl Config {
    pub fn new() -> Result<Self, ConfigError> {
        // Load .env file if it exists
        let _ = dotenvy::dotenv();

        let config = Self::load_from_env()?;
        config.validate()?;
        Ok(config)
    }

    fn load_from_env() -> Result<Self, ConfigError> {
        let log_level = env::var("LOG_LEVEL")
            .ok()
            .and_then(|s| match s.to_lowercase().as_str() {
                "trace" => Some(Level::TRACE),
                "debug" => Some(Level::DEBUG),
                "info" => Some(Level::INFO),
                "warn" | "warning" => Some(Level::WARN),
                "error" => Some(Level::ERROR),
                _ => None,
            })
            .unwrap_or(Level::INFO);

        let target_format = match env::var("TARGET_FORMAT") {
            Ok(raw) => TargetFormat::parse(&raw).ok_or(ConfigError::UnknownTargetFormat(raw))?,
            Err(_) => TargetFormat::WebP,
        };

        let port = env_parse("SERVER_PORT", 1430u16);

        Ok(Self {
            server: ServerConfig {
                port,
                host: env::var("SERVER_HOST").unwrap_or_else(|_| "0.0.0.0".to_string()),
                log_level,
            },
            scan: ScanConfig {
                window_size: env_parse("SCAN_WINDOW_SIZE", 30),
                heavy_threshold_bytes: env_parse("HEAVY_THRESHOLD_BYTES", 500 * 1024),
                probe_timeout: env_millis("PROBE_TIMEOUT_MS", 5_000),
                force_all: env_parse("FORCE_ALL", false),
                skip_processed: env_parse("SKIP_PROCESSED", false),
            },
            conversion: ConversionConfig {
                quality: env_parse("CONVERT_QUALITY", 0.8),
                target_format,
                direct_fetch_timeout: env_millis("DIRECT_FETCH_TIMEOUT_MS", 30_000),
                element_load_timeout: env_millis("ELEMENT_LOAD_TIMEOUT_MS", 10_000),
                cors_origin: env::var("CORS_ORIGIN")
                    .unwrap_or_else(|_| format!("http://localhost:{}", port)),
                local_fallback: env_parse("LOCAL_FALLBACK", true),
            },
            gateway: GatewayConfig {
                endpoint: env::var("CONVERSION_ENDPOINT")
                    .ok()
                    .map(|s| s.trim().to_string())
                    .filter(|s| !s.is_empty()),
                timeout: env_millis("GATEWAY_TIMEOUT_MS", 20_000),
                failure_threshold: env_parse("GATEWAY_FAILURE_THRESHOLD", 5),
                cooldown: Duration::from_secs(env_parse("GATEWAY_COOLDOWN_SECONDS", 60)),
            },
            run: RunConfig {
                item_timeout: env_millis("ITEM_TIMEOUT_MS", 60_000),
                pacing_delay: env_millis("PACING_DELAY_MS", 500),
            },
            storage: StorageConfig {
                records_path: env::var("RECORDS_PATH")
                    .unwrap_or_else(|_| "data/records.json".to_string())
                    .into(),
                asset_root: env::var("ASSET_ROOT")
                    .unwrap_or_else(|_| "data/assets".to_string())
                    .into(),
                public_base_url: env::var("PUBLIC_BASE_URL")
                    .unwrap_or_else(|_| format!("http://localhost:{}/assets", port)),
                namespace: env::var("ASSET_NAMESPACE").unwrap_or_else(|_| "recipes".to_string()),
                store_timeout: env_millis("STORE_TIMEOUT_MS", 30_000),
            },
        })
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.scan.window_size == 0 {
            return Err(ConfigError::InvalidWindowSize(self.scan.window_size));
        }

        let quality = self.conversion.quality;
        if !(quality > 0.0 && quality <= 1.0) {
            return Err(ConfigError::InvalidQuality(quality));
        }

        // A probe is advisory and must give up before any conversion would
        if self.scan.probe_timeout.is_zero()
            || self.scan.probe_timeout >= self.gateway.timeout
            || self.scan.probe_timeout >= self.conversion.element_load_timeout
        {
            return Err(ConfigError::InvalidTimeouts(format!(
                "probe timeout {:?} must be non-zero and shorter than gateway ({:?}) and element-load ({:?}) timeouts",
                self.scan.probe_timeout, self.gateway.timeout, self.conversion.element_load_timeout
            )));
        }

        if self.run.item_timeout.is_zero() {
            return Err(ConfigError::InvalidTimeouts(
                "item timeout must be > 0".to_string(),
            ));
        }

        if self.storage.store_timeout.is_zero() {
            return Err(ConfigError::InvalidTimeouts(
                "store timeout must be > 0".to_string(),
            ));
        }

        if self.storage.namespace.trim_matches('/').is_empty() {
            return Err(ConfigError::InvalidStorage(
                "asset namespace must not be empty".to_string(),
            ));
        }

        if url::Url::parse(&self.storage.public_base_url).is_err() {
            return Err(ConfigError::InvalidStorage(format!(
                "public base URL is not absolute: {}",
                self.storage.public_base_url
            )));
        }

        if let Some(endpoint) = &self.gateway.endpoint {
            if url::Url::parse(endpoint).is_err() {
                return Err(ConfigError::InvalidEndpoint(endpoint.clone()));
            }
        }

        Ok(())
    }

    pub fn log_level(&self) -> Level {
        self.server.log_level
    }

    pub fn server_host(&self) -> &str {
        &self.server.host
    }

    pub fn server_port(&self) -> u16 {
        self.server.port
    }

    /// Fixed configuration for tests: tiny timeouts, no pacing, no endpoint
    pub fn for_tests() -> Self {
        Self {
            server: ServerConfig {
                port: 0,
                host: "127.0.0.1".to_string(),
                log_level: Level::DEBUG,
            },
            scan: ScanConfig {
                window_size: 30,
                heavy_threshold_bytes: 500 * 1024,
                probe_timeout: Duration::from_millis(500),
                force_all: false,
                skip_processed: false,
            },
            conversion: ConversionConfig {
                quality: 0.8,
                target_format: TargetFormat::Jpeg,
                direct_fetch_timeout: Duration::from_secs(2),
                element_load_timeout: Duration::from_secs(2),
                cors_origin: "http://localhost".to_string(),
                local_fallback: true,
            },
            gateway: GatewayConfig {
                endpoint: None,
                timeout: Duration::from_secs(2),
                failure_threshold: 100,
                cooldown: Duration::from_secs(1),
            },
            run: RunConfig {
                item_timeout: Duration::from_secs(5),
                pacing_delay: Duration::ZERO,
            },
            storage: StorageConfig {
                records_path: "records.json".into(),
                asset_root: "assets".into(),
                public_base_url: "http://assets.test/public".to_string(),
                namespace: "recipes".to_string(),
                store_timeout: Duration::from_secs(2),
            },
        }
    }
}

// Note: No Default implementation because Config::new() can fail
