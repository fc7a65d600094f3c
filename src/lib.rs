// Library exports for the asset rehabilitation pipeline
//
// Scan the record collection for heavy remote images, re-encode them through
// the conversion endpoint or the local converter, and repoint each record at
// the compact copy.

// Core modules
pub mod core;
pub mod middleware;
pub mod orchestration;
pub mod services;
pub mod utils;

// Re-export commonly used types and functions
pub use core::{
    config::Config,
    errors::{
        ConfigError, ConversionError, GatewayError, OptimizeError, ScanError, SessionError,
        StoreError, UpstreamError,
    },
    types::{
        CandidateSet, ErrorLogEntry, OptimizeMode, ProgressState, Record, RunOutcome, ScanReport,
        SessionPhase, SessionSnapshot, TargetFormat,
    },
};

pub use middleware::{CircuitBreaker, CircuitBreakerConfig, CircuitState};

pub use orchestration::{
    BatchRunner, BatchScanner, ErrorLog, OptimizationOrchestrator, OptimizationSession,
    RecordOptimizer,
};

pub use services::{
    AssetStore, ConversionGateway, Converter, HttpSizeProbe, JsonRecordStore, LocalAssetStore,
    RecordStore, RuntimeSettings, SettingsProvider, SizeProbe,
};

pub use utils::Metrics;
