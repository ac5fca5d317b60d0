//! # Storage Writer
//!
//! The storage context's loop: claim a Ready buffer, write it to the card as
//! consecutive blocks starting at the shared cursor, release it.
//!
//! ```text
//!   claim_ready ──► [full blocks] ──► CMD24 (one) / CMD25..CMD12 (many)
//!                   [tail]        ──► zero-padded, CMD24
//!   WriteGuard drop ──► slot Free
//! ```
//!
//! A failed write is counted and logged; the buffer is still released and
//! the cursor does not move, so the next buffer reuses those blocks.

use log::{debug, info, warn};

use crate::config::{BLOCK_SIZE, WRITER_IDLE_US};
use crate::context::WriterHandle;
use crate::storage::{StorageBackend, StorageError};
use crate::timing::Clock;
use crate::traits::CardLink;

/// Outcome of one writer iteration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum WriterPoll {
    /// A buffer was committed as `blocks` blocks
    Wrote { index: usize, blocks: u32 },
    /// Writing a buffer failed; it was released anyway
    Failed { index: usize, error: StorageError },
    /// Nothing was Ready
    Idle,
}

/// Owns the card for the lifetime of the storage context
pub struct StorageWriter<L, C> {
    backend: StorageBackend<L, C>,
    tail: [u8; BLOCK_SIZE],
}

impl<L: CardLink, C: Clock> StorageWriter<L, C> {
    /// Wrap `backend`, bringing the card up first if needed
    pub fn new(mut backend: StorageBackend<L, C>) -> Result<Self, StorageError> {
        if !backend.session().initialized {
            backend.bring_up()?;
        }
        Ok(Self {
            backend,
            tail: [0; BLOCK_SIZE],
        })
    }

    pub fn backend(&self) -> &StorageBackend<L, C> {
        &self.backend
    }

    pub fn backend_mut(&mut self) -> &mut StorageBackend<L, C> {
        &mut self.backend
    }

    pub fn into_backend(self) -> StorageBackend<L, C> {
        self.backend
    }

    /// Write at most one Ready buffer
    pub fn poll_once(&mut self, handle: &WriterHandle) -> WriterPoll {
        let Some(guard) = handle.pool().claim_ready() else {
            return WriterPoll::Idle;
        };
        let index = guard.index();
        let data = guard.data();
        let start = handle.next_block();

        match self.write_buffer(start, data) {
            Ok(blocks) => {
                handle.stats().record_write(data.len(), blocks);
                handle.advance(blocks);
                debug!(
                    "buffer {} written: {} bytes at block {} ({} blocks)",
                    index,
                    data.len(),
                    start,
                    blocks
                );
                WriterPoll::Wrote { index, blocks }
            }
            Err(error) => {
                handle.stats().record_write_error();
                let errors = handle.stats().write_errors();
                if errors % 100 == 1 {
                    warn!(
                        "buffer {} write at block {} failed: {} ({} errors)",
                        index, start, error, errors
                    );
                }
                WriterPoll::Failed { index, error }
            }
        }
    }

    /// Write until nothing is `Ready`. Returns how many buffers were
    /// handled, failed writes included.
    pub fn flush(&mut self, handle: &WriterHandle) -> usize {
        let mut handled = 0;
        while self.poll_once(handle) != WriterPoll::Idle {
            handled += 1;
        }
        handled
    }

    fn write_buffer(&mut self, start: u32, data: &[u8]) -> Result<u32, StorageError> {
        let (full, tail) = data.split_at(data.len() - data.len() % BLOCK_SIZE);
        let mut blocks = (full.len() / BLOCK_SIZE) as u32;
        match blocks {
            0 => {}
            1 => {
                let block = <&[u8; BLOCK_SIZE]>::try_from(full)
                    .map_err(|_| StorageError::InvalidLength { len: full.len() })?;
                self.backend.write_block(start, block)?;
            }
            _ => {
                self.backend.write_blocks(start, full)?;
            }
        }
        if !tail.is_empty() {
            self.tail.fill(0);
            self.tail[..tail.len()].copy_from_slice(tail);
            let block = start
                .checked_add(blocks)
                .ok_or(StorageError::AddressOutOfRange { block: start })?;
            self.backend.write_block(block, &self.tail)?;
            blocks += 1;
        }
        Ok(blocks)
    }

    /// Storage context main loop. Returns once the pipeline has left Running
    /// and nothing is left to write.
    pub fn run(&mut self, handle: &WriterHandle) {
        info!("storage writer started at block {}", handle.next_block());
        loop {
            if self.poll_once(handle) != WriterPoll::Idle {
                continue;
            }
            if handle.try_retire() {
                break;
            }
            self.backend.clock().sleep_us(WRITER_IDLE_US);
        }
        info!("storage writer stopped at block {}", handle.next_block());
    }
}

#[cfg(test)]
mod tests {
    use alloc::sync::Arc;

    use super::*;
    use crate::context::{PipelineState, SharedContext};
    use crate::sim::{MemCard, SimClock};
    use crate::storage::StorageTiming;

    fn writer() -> StorageWriter<MemCard, SimClock> {
        let backend = StorageBackend::new(MemCard::new(4096), SimClock::new(), StorageTiming::default());
        StorageWriter::new(backend).unwrap()
    }

    fn shared_with(chunks: &[&[u8]]) -> (Arc<SharedContext>, WriterHandle) {
        let shared = Arc::new(SharedContext::new());
        let mut filler = shared.pool().filler().unwrap();
        filler.allocate(2048).unwrap();
        filler.activate().unwrap();
        let clock = SimClock::new();
        for chunk in chunks {
            filler.append(chunk, &clock, 0, || {}).unwrap();
            filler.swap(&clock, 0, || {}).unwrap();
        }
        filler.seal(&clock);
        let handle = WriterHandle::new(Arc::clone(&shared));
        (shared, handle)
    }

    #[test]
    fn test_new_brings_card_up() {
        let writer = writer();
        assert!(writer.backend().session().initialized);
    }

    #[test]
    fn test_tail_is_zero_padded() {
        let mut writer = writer();
        let (shared, handle) = shared_with(&[&[0xAB; 700]]);
        shared.set_next_block(10);

        assert_eq!(
            writer.poll_once(&handle),
            WriterPoll::Wrote { index: 0, blocks: 2 }
        );
        let card = writer.backend().link();
        assert_eq!(card.block(10), Some([0xAB; BLOCK_SIZE]));
        let tail = card.block(11).unwrap();
        assert!(tail[..188].iter().all(|&b| b == 0xAB));
        assert!(tail[188..].iter().all(|&b| b == 0));

        assert_eq!(handle.next_block(), 12);
        let stats = shared.stats().snapshot(0);
        assert_eq!(stats.bytes_written, 700);
        assert_eq!(stats.blocks_written, 2);
        assert_eq!(stats.buffers_written, 1);
        assert!(shared.pool().all_free());
    }

    #[test]
    fn test_multi_block_buffer_uses_cmd25() {
        let mut writer = writer();
        let (_shared, handle) = shared_with(&[&[0x11; 1536]]);
        assert_eq!(
            writer.poll_once(&handle),
            WriterPoll::Wrote { index: 0, blocks: 3 }
        );
        assert!(writer.backend().link().command_log().contains(&25));
    }

    #[test]
    fn test_failed_write_keeps_cursor() {
        let mut writer = writer();
        let (shared, handle) = shared_with(&[&[1; 512], &[2; 512]]);
        writer.backend_mut().link_mut().faults_mut().reject_writes = true;

        assert!(matches!(
            writer.poll_once(&handle),
            WriterPoll::Failed { index: 0, .. }
        ));
        assert_eq!(handle.next_block(), 0);
        assert_eq!(shared.stats().snapshot(0).write_errors, 1);
        assert_eq!(shared.pool().status(0), Some(crate::buffer::SlotStatus::Free));

        writer.backend_mut().link_mut().faults_mut().reject_writes = false;
        assert_eq!(
            writer.poll_once(&handle),
            WriterPoll::Wrote { index: 1, blocks: 1 }
        );
        assert_eq!(writer.backend().link().block(0), Some([2; BLOCK_SIZE]));
    }

    #[test]
    fn test_flush_writes_everything_in_order() {
        let mut writer = writer();
        let (shared, handle) = shared_with(&[&[4; 512], &[5; 512], &[6; 512]]);
        shared.set_state(PipelineState::Stopping);

        assert_eq!(writer.flush(&handle), 3);
        assert_eq!(writer.flush(&handle), 0);
        assert!(shared.pool().all_free());
        let card = writer.backend().link();
        assert_eq!(card.block(0), Some([4; BLOCK_SIZE]));
        assert_eq!(card.block(1), Some([5; BLOCK_SIZE]));
        assert_eq!(card.block(2), Some([6; BLOCK_SIZE]));
    }

    #[test]
    fn test_run_drains_and_retires() {
        let mut writer = writer();
        let (shared, handle) = shared_with(&[&[7; 512], &[8; 512], &[9; 100]]);
        shared.set_state(PipelineState::Stopping);
        assert!(shared.claim_writer());

        writer.run(&handle);

        assert!(!shared.writer_running());
        assert!(shared.pool().all_free());
        assert_eq!(handle.next_block(), 3);
        assert_eq!(writer.backend().link().block(1), Some([8; BLOCK_SIZE]));
    }
}
