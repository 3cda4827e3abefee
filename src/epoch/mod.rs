//! Epoch-based protection for safe reclamation of read-cache pages.

mod light_epoch;

pub use light_epoch::{get_thread_id, try_get_thread_id, LightEpoch, UNPROTECTED};
