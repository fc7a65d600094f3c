pub mod optimizer;
pub mod runner;
pub mod scanner;
pub mod session;

pub use optimizer::{OptimizationOrchestrator, RecordOptimizer};
pub use runner::{BatchRunner, ErrorLog};
pub use scanner::BatchScanner;
pub use session::OptimizationSession;
