//! The read cache: a circular in-memory log of recently read records whose
//! main-log copies have left memory, sharing the hash chain with the main
//! log so lookups hit it before any device I/O.

mod chain;
mod config;
mod engine;
mod log;
mod stats;

pub use chain::RecordSource;
pub use config::ReadCacheConfig;
pub use engine::ReadCacheEngine;
pub use log::{Allocation, ReadCacheLog};
pub use stats::{ReadCacheStats, ReadCacheStatsSummary};
