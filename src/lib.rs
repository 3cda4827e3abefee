//! oxicache - the read-cache subsystem of a log-structured concurrent
//! key-value engine.
//!
//! The engine stores records in an append-only main log; an in-memory hash
//! index maps key-hash buckets to per-bucket record chains. This crate adds
//! an auxiliary circular log that caches recently read records whose
//! main-log copies have been evicted from memory, linked **in front of** the
//! main-log records on the same hash chain, so subsequent reads avoid device
//! I/O.
//!
//! All chain maintenance is lock-free: inserts, splices, evictions, and
//! lock transfers are published with 64-bit compare-and-swap on bucket slots
//! and record headers, with epoch protection gating the physical reuse of
//! evicted pages.
//!
//! # Quick start
//!
//! ```rust,ignore
//! use oxicache::cache::{ReadCacheConfig, ReadCacheEngine};
//!
//! let engine = ReadCacheEngine::new(config, hlog, index, epoch)?;
//! let status = engine.insert_at_tail(&key, &value);
//! let value = engine.read(&key);
//! ```

#![warn(missing_docs)]

pub mod address;
pub mod cache;
pub mod epoch;
pub mod hlog;
pub mod index;
pub mod record;
pub mod status;
mod utility;

// Re-exports for convenience
pub use address::{Address, AtomicAddress};
pub use cache::{ReadCacheConfig, ReadCacheEngine};
pub use record::{Key, Record, RecordInfo, Value};
pub use status::{OperationStatus, Status};

/// Constants used throughout the library
pub mod constants {
    /// Size of a cache line in bytes
    pub const CACHE_LINE_BYTES: usize = 64;

    /// Maximum number of threads supported
    pub const MAX_THREADS: usize = 96;
}

/// Utility for size literals
pub mod size {
    /// 1 KiB in bytes
    pub const KIB: u64 = 1024;
    /// 1 MiB in bytes
    pub const MIB: u64 = 1024 * KIB;
    /// 1 GiB in bytes
    pub const GIB: u64 = 1024 * MIB;
}

/// Prelude module for common imports
pub mod prelude {
    pub use crate::address::Address;
    pub use crate::cache::{ReadCacheConfig, ReadCacheEngine, RecordSource};
    pub use crate::hlog::MainLog;
    pub use crate::index::HashIndex;
    pub use crate::record::{Key, Value};
    pub use crate::status::{OperationStatus, Status};
}
