//! # linebench - cache-coherence latency microbenchmark
//!
//! Measures, in CPU cycles, the latency individual hardware threads observe
//! when they load, store, flush, CAS, FAI, TAS or SWAP a shared cache line
//! that sits in a controlled MOESI coherence state.
//!
//! ## Architecture
//!
//! One OS thread per rank, each pinned to its configured hardware thread,
//! runs a synchronized round per repetition. Key components include:
//!
//! - **Barrier bank**: reconfigurable per-group synchronization points
//! - **Region**: the cache-line-aligned shared arena, line 0 contended
//! - **Kernels**: the measured primitives behind stride-hiding walks
//! - **Race tracker**: first-winner claims and common-start latencies
//!
//! The coherence precondition comes either from a seed core that primes the
//! line and releases all contenders at once (seed mode), or from the
//! per-test barrier choreography (classic mode).
//!
//! ## Example
//!
//! ```no_run
//! use linebench::{Engine, RunConfig};
//!
//! let cfg = RunConfig {
//!     reps: 10_000,
//!     cores: Some(vec![vec![0, 1]]),
//!     default_test: 12, // CAS
//!     ..RunConfig::default()
//! };
//! let report = Engine::run(cfg).unwrap();
//! report.render(&mut std::io::stdout()).unwrap();
//! ```

pub mod arch;
pub mod barrier;
pub mod choreo;
pub mod config;
pub mod driver;
pub mod error;
pub mod jagged;
pub mod kernels;
pub mod race;
pub mod rankmap;
pub mod region;
pub mod report;
pub mod samples;
pub mod topology;

pub use config::{FencePolicy, RunConfig, TestId};
pub use driver::Engine;
pub use error::{BenchError, Result};
pub use report::RunReport;
