//! # Shared Context
//!
//! The one object both execution contexts hold. It carries the pipeline
//! state, the buffer pool, run statistics and the storage cursor.
//!
//! ```text
//!  acquisition context                         storage context
//! ┌──────────────────┐                       ┌──────────────────┐
//! │ Pipeline         │   Arc<SharedContext>  │ StorageWriter    │
//! │  Filler ─────────┼──► pool ◄─────────────┼─ claim_ready     │
//! │  state (write)   │    state              │  state (read)    │
//! │                  │    stats              │  next_block      │
//! └──────────────────┘    writer_running     └──────────────────┘
//! ```

use alloc::sync::Arc;

use portable_atomic::{AtomicBool, AtomicU32, AtomicU8, Ordering};
use serde::{Deserialize, Serialize};

use crate::buffer::BufferPool;
use crate::stats::RunStats;

/// Lifecycle of a pipeline
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u8)]
pub enum PipelineState {
    Idle = 0,
    Running = 1,
    /// No new acquisitions; storage drains what is left
    Stopping = 2,
    Error = 3,
}

impl TryFrom<u8> for PipelineState {
    type Error = ();

    fn try_from(value: u8) -> Result<Self, ()> {
        match value {
            0 => Ok(Self::Idle),
            1 => Ok(Self::Running),
            2 => Ok(Self::Stopping),
            3 => Ok(Self::Error),
            _ => Err(()),
        }
    }
}

/// State visible to both contexts
pub struct SharedContext {
    state: AtomicU8,
    pool: Arc<BufferPool>,
    stats: RunStats,
    /// Next card block the writer will use
    next_block: AtomicU32,
    writer_running: AtomicBool,
}

impl SharedContext {
    pub fn new() -> Self {
        Self::from_pool(Arc::new(BufferPool::new()))
    }

    pub fn from_pool(pool: Arc<BufferPool>) -> Self {
        Self {
            state: AtomicU8::new(PipelineState::Idle as u8),
            pool,
            stats: RunStats::new(),
            next_block: AtomicU32::new(0),
            writer_running: AtomicBool::new(false),
        }
    }

    pub fn state(&self) -> PipelineState {
        PipelineState::try_from(self.state.load(Ordering::Acquire)).unwrap_or(PipelineState::Error)
    }

    /// Only the acquisition context changes the state
    pub(crate) fn set_state(&self, state: PipelineState) {
        self.state.store(state as u8, Ordering::Release);
    }

    pub fn pool(&self) -> &Arc<BufferPool> {
        &self.pool
    }

    pub fn stats(&self) -> &RunStats {
        &self.stats
    }

    pub fn next_block(&self) -> u32 {
        self.next_block.load(Ordering::Acquire)
    }

    pub(crate) fn set_next_block(&self, block: u32) {
        self.next_block.store(block, Ordering::Release);
    }

    pub fn writer_running(&self) -> bool {
        self.writer_running.load(Ordering::Acquire)
    }

    /// Mark the storage context as started. Returns false if it already is.
    pub(crate) fn claim_writer(&self) -> bool {
        self.writer_running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub(crate) fn release_writer(&self) {
        self.writer_running.store(false, Ordering::Release);
    }

    /// Whether the storage context still has a reason to run
    pub fn writer_has_work(&self) -> bool {
        self.state() == PipelineState::Running || self.pool.has_ready()
    }
}

impl Default for SharedContext {
    fn default() -> Self {
        Self::new()
    }
}

/// The storage context's handle on a pipeline
#[derive(Clone)]
pub struct WriterHandle(Arc<SharedContext>);

impl WriterHandle {
    pub(crate) fn new(shared: Arc<SharedContext>) -> Self {
        Self(shared)
    }

    pub fn shared(&self) -> &SharedContext {
        &self.0
    }

    pub fn state(&self) -> PipelineState {
        self.0.state()
    }

    pub fn pool(&self) -> &BufferPool {
        &self.0.pool
    }

    pub fn stats(&self) -> &RunStats {
        &self.0.stats
    }

    pub fn next_block(&self) -> u32 {
        self.0.next_block()
    }

    /// Move the cursor past `blocks` written blocks
    pub fn advance(&self, blocks: u32) {
        self.0.next_block.fetch_add(blocks, Ordering::AcqRel);
    }

    /// Decide whether the writer loop should exit.
    ///
    /// The running flag is dropped first and work is checked afterwards, so a
    /// buffer published between the two is never stranded: either the
    /// orchestrator sees the flag clear and relaunches, or this returns false
    /// and the loop keeps going.
    pub fn try_retire(&self) -> bool {
        if self.0.writer_has_work() {
            return false;
        }
        self.0.release_writer();
        if self.0.writer_has_work() && self.0.claim_writer() {
            return false;
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_round_trip() {
        for state in [
            PipelineState::Idle,
            PipelineState::Running,
            PipelineState::Stopping,
            PipelineState::Error,
        ] {
            assert_eq!(PipelineState::try_from(state as u8), Ok(state));
        }
        assert!(PipelineState::try_from(9).is_err());
    }

    #[test]
    fn test_writer_claim_is_exclusive() {
        let shared = SharedContext::new();
        assert!(shared.claim_writer());
        assert!(!shared.claim_writer());
        shared.release_writer();
        assert!(shared.claim_writer());
    }

    #[test]
    fn test_retire_only_without_work() {
        let shared = Arc::new(SharedContext::new());
        let handle = WriterHandle::new(Arc::clone(&shared));
        assert!(shared.claim_writer());

        shared.set_state(PipelineState::Running);
        assert!(!handle.try_retire());
        assert!(shared.writer_running());

        shared.set_state(PipelineState::Stopping);
        assert!(handle.try_retire());
        assert!(!shared.writer_running());
    }

    #[test]
    fn test_advance_moves_cursor() {
        let shared = Arc::new(SharedContext::new());
        shared.set_next_block(10);
        let handle = WriterHandle::new(shared);
        handle.advance(3);
        assert_eq!(handle.next_block(), 13);
    }
}
