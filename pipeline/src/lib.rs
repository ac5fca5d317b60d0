//! # ADC Pipeline Core
//!
//! Acquisition, compression and raw block storage for a dual-context
//! microcontroller data logger:
//!
//! - **Buffer Pool**: fixed slots handed between contexts by an atomic status
//! - **Stream Processor**: decimation, FIR/IIR filtering and envelope detection
//! - **Storage Backend**: SD native protocol, bring-up and block transfers
//! - **Pipeline**: the periodic acquisition cycle and the run lifecycle
//!
//! ## Architecture
//!
//! ```text
//!  trigger ──► Pipeline::on_tick                      StorageWriter::run
//!               │                                            │
//!   AcquisitionSource ──► StreamProcessor ──► Filler ──► [BufferPool] ──► StorageBackend ──► CardLink
//!               acquisition context                         storage context
//! ```
//!
//! The two contexts share only [`context::SharedContext`]: slot statuses,
//! statistics counters, the pipeline state and the block cursor. There is
//! no lock; every wait is bounded through [`timing::poll_until`].

#![cfg_attr(not(any(feature = "std", test)), no_std)]

extern crate alloc;

pub mod buffer;
pub mod config;
pub mod context;
pub mod control;
pub mod dsp;
pub mod orchestrator;
pub mod stats;
pub mod storage;
pub mod timing;
pub mod traits;
pub mod writer;

#[cfg(any(test, feature = "sim"))]
pub mod sim;

// Re-export main types for convenience
pub use buffer::{BufferPool, Filler, PoolError, SlotStatus, SlotView, WriteGuard};
pub use config::{ConfigError, PipelineConfig};
pub use context::{PipelineState, SharedContext, WriterHandle};
pub use control::{ControlCommand, ControlReply, ErrorCode};
pub use dsp::{DspConfig, DspError, FilterKind, SampleFormat, StreamProcessor};
pub use orchestrator::{Pipeline, PipelineError, StatusReport, TickOutcome};
pub use stats::{RunStats, Statistics};
pub use storage::{Session, StorageBackend, StorageError, StorageTiming};
pub use timing::{poll_until, wait_until, Clock, WaitError};
pub use traits::{AcquisitionSource, CardLink, Platform};
pub use writer::{StorageWriter, WriterPoll};

/// Library version, reported by the host runner
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
