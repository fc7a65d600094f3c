pub mod image_ops;
pub mod metrics;

// Re-export commonly used items
pub use image_ops::{composite_on_white, ImageCodec, RasterCodec};
pub use metrics::Metrics;
