pub mod config;
pub mod errors;
pub mod types;

// Re-export commonly used items for convenience
pub use config::Config;
pub use errors::{
    ConfigError, ConversionError, GatewayError, OptimizeError, ScanError, SessionError,
    StoreError, UpstreamError,
};
pub use types::{
    CandidateSet, ConvertedAsset, ErrorLogEntry, OptimizeMode, ProgressState, Record,
    RunOutcome, ScanReport, SessionPhase, SessionSnapshot, StrategyKind, TargetFormat,
};
