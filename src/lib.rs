pub mod cache;
pub mod simulator;
pub mod trace;
pub mod transpose;

pub use cache::{Cache, CacheStats, ConfigError, Geometry};
pub use simulator::Simulator;
pub use trace::{AccessKind, TraceFile, TraceRecord};
