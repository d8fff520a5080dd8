//! Error taxonomy for the benchmark engine.
//!
//! Configuration and resource-acquisition errors terminate a run before any
//! worker thread is spawned. Transient conditions inside the kernels (a busy
//! TAS slot, a missed CAS, a NUMA placement fallback) are part of normal
//! operation and never surface here.

use thiserror::Error;

/// Errors that abort a benchmark run.
#[derive(Debug, Error)]
pub enum BenchError {
    /// Mismatched jagged-array shapes, out-of-range fence levels, impossible
    /// stride/repetition combinations, and the like.
    #[error("config: {0}")]
    Config(String),

    /// The shared region or a tracker array could not be allocated.
    #[error("alloc: {0}")]
    Alloc(String),

    /// An OS or thread primitive failed (spawn, join).
    #[error("system: {0}")]
    System(String),
}

pub type Result<T> = std::result::Result<T, BenchError>;

impl BenchError {
    pub(crate) fn config(msg: impl Into<String>) -> Self {
        BenchError::Config(msg.into())
    }
}
