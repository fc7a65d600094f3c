// Error taxonomy for the rehabilitation pipeline
//
// Every component boundary has its own thiserror enum so callers can match on
// the failure kind instead of parsing strings. Per-item failures are folded
// into OptimizeError at the orchestrator boundary; nothing below that level
// aborts a batch run.

use thiserror::Error;

/// Local strategy-chain failures
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConversionError {
    #[error("Origin did not grant cross-origin read access")]
    CorsBlocked,

    #[error("Source could not be loaded: {0}")]
    LoadFailed(String),

    #[error("Timeout")]
    Timeout,

    #[error("Image decode failed: {0}")]
    Decode(String),

    #[error("Image encode failed: {0}")]
    Encode(String),
}

/// Conversion endpoint failures
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum GatewayError {
    #[error("No conversion endpoint configured")]
    NotConfigured,

    #[error("Timeout")]
    Timeout,

    #[error("Conversion endpoint returned {status}: {body}")]
    ServerError { status: u16, body: String },

    #[error("Conversion endpoint response has no usable URL: {0}")]
    InvalidResponseShape(String),

    #[error("Conversion endpoint request failed: {0}")]
    Transport(String),

    #[error("Circuit breaker is open, conversion endpoint unavailable")]
    CircuitOpen,
}

/// Failures reported by the host collaborators (records, assets)
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Storage I/O failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Timeout")]
    Timeout,

    #[error("Rejected: {0}")]
    Rejected(String),
}

/// Whatever produced (or failed to produce) the new asset
#[derive(Debug, Error)]
pub enum UpstreamError {
    #[error(transparent)]
    Gateway(#[from] GatewayError),

    #[error(transparent)]
    Converter(#[from] ConversionError),

    #[error("Upload failed: {0}")]
    Upload(#[source] StoreError),
}

/// Orchestrator boundary error for a single record
#[derive(Debug, Error)]
pub enum OptimizeError {
    #[error("{0}")]
    UpstreamFailure(#[from] UpstreamError),

    #[error("Record update failed, new asset left orphaned: {0}")]
    PersistFailure(#[source] StoreError),
}

impl OptimizeError {
    /// True when the failure is a missing endpoint rather than a per-item problem
    pub fn is_not_configured(&self) -> bool {
        matches!(
            self,
            OptimizeError::UpstreamFailure(UpstreamError::Gateway(GatewayError::NotConfigured))
        )
    }

    pub fn is_timeout(&self) -> bool {
        matches!(
            self,
            OptimizeError::UpstreamFailure(UpstreamError::Gateway(GatewayError::Timeout))
                | OptimizeError::UpstreamFailure(UpstreamError::Converter(ConversionError::Timeout))
                | OptimizeError::UpstreamFailure(UpstreamError::Upload(StoreError::Timeout))
                | OptimizeError::PersistFailure(StoreError::Timeout)
        )
    }
}

impl From<GatewayError> for OptimizeError {
    fn from(e: GatewayError) -> Self {
        OptimizeError::UpstreamFailure(UpstreamError::Gateway(e))
    }
}

impl From<ConversionError> for OptimizeError {
    fn from(e: ConversionError) -> Self {
        OptimizeError::UpstreamFailure(UpstreamError::Converter(e))
    }
}

/// Scanner errors
#[derive(Debug, Error)]
pub enum ScanError {
    #[error("A scan window is already in progress")]
    Busy,

    #[error("Record listing failed: {0}")]
    Store(#[from] StoreError),
}

/// Operator-facing session errors
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("Another batch operation is in progress")]
    Busy,

    #[error("A batch run is already active")]
    AlreadyRunning,

    #[error("No batch run is active")]
    NotRunning,

    #[error("Record {0} not found")]
    RecordNotFound(String),

    #[error(transparent)]
    Scan(#[from] ScanError),

    #[error(transparent)]
    Optimize(#[from] OptimizeError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Window size must be > 0, got {0}")]
    InvalidWindowSize(usize),

    #[error("Quality must be in (0.0, 1.0], got {0}")]
    InvalidQuality(f32),

    #[error("Unknown target format: {0}")]
    UnknownTargetFormat(String),

    #[error("Invalid timeout config: {0}")]
    InvalidTimeouts(String),

    #[error("Invalid storage config: {0}")]
    InvalidStorage(String),

    #[error("Invalid conversion endpoint URL: {0}")]
    InvalidEndpoint(String),
}

pub type ConversionResult<T> = Result<T, ConversionError>;
pub type GatewayResult<T> = Result<T, GatewayError>;
pub type StoreResult<T> = Result<T, StoreError>;
pub type OptimizeResult<T> = Result<T, OptimizeError>;
pub type ConfigResult<T> = Result<T, ConfigError>;
