pub mod converter;
pub mod gateway;
pub mod probe;
pub mod store;

// Re-export commonly used services
pub use converter::{ConversionStrategy, Converter};
pub use gateway::ConversionGateway;
pub use probe::{HttpSizeProbe, SizeProbe, UNKNOWN_SIZE};
pub use store::{
    AssetStore, JsonRecordStore, LocalAssetStore, RecordStore, RuntimeSettings, SettingsProvider,
};
