//! # Buffer Pool
//!
//! Fixed set of byte buffers handed between the acquisition context (which
//! fills them) and the storage context (which writes them to the card).
//!
//! ## Ownership Handoff
//!
//! Each slot carries an atomic status; the status alone decides who may touch
//! the slot's memory, so no lock is involved:
//!
//! ```text
//!            Filler::activate / swap           Filler::swap / seal
//!   ┌──────┐ ─────────────────────► ┌─────────┐ ─────────────────► ┌───────┐
//!   │ Free │                        │ Filling │                    │ Ready │
//!   └──────┘ ◄───────────┐          └─────────┘                    └───────┘
//!       ▲    WriteGuard  │            acquisition                      │
//!       │      drop      │            context only                     │ claim_ready
//!       │           ┌─────────┐                                        │ (CAS)
//!       └───────────│ Writing │ ◄──────────────────────────────────────┘
//!                   └─────────┘   storage context only
//! ```
//!
//! `Free` is the reset point between `Writing` and the next `Filling`: the
//! storage context clears the used length and publishes `Free`, the
//! acquisition context later promotes the slot to `Filling`. At most one slot
//! is `Filling` at any instant, and exactly one while a run is active.
//!
//! Every slot handed to storage is stamped with a publication sequence.
//! `claim_ready` always takes the oldest one, so the card receives buffers
//! in fill order even after the round-robin index wraps.
//!
//! ## Memory Ordering
//!
//! - Producer writes data, `used` and the sequence, then stores `Ready` with
//!   `Release`.
//! - Consumer claims with an `Acquire` compare-exchange, reads, then stores
//!   `Free` with `Release`.
//! - Producer observes `Free` with `Acquire` before touching the memory again.

use alloc::sync::Arc;
use alloc::vec::Vec;
use core::cell::UnsafeCell;

use portable_atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicU8, AtomicUsize, Ordering};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::{POOL_SLOTS, SWAP_POLL_US};
use crate::timing::{wait_until, Clock};

/// Lifecycle state of one slot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u8)]
pub enum SlotStatus {
    /// Empty, owned by nobody
    Free = 0,
    /// Being appended to by the acquisition context
    Filling = 1,
    /// Full, waiting for the storage context
    Ready = 2,
    /// Being written out by the storage context
    Writing = 3,
}

impl TryFrom<u8> for SlotStatus {
    type Error = ();

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::Free),
            1 => Ok(Self::Filling),
            2 => Ok(Self::Ready),
            3 => Ok(Self::Writing),
            _ => Err(()),
        }
    }
}

/// Errors specific to pool operations
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum PoolError {
    #[error("allocating {capacity} bytes per slot failed")]
    Allocation { capacity: usize },
    #[error("slot {index} is still owned by the storage context")]
    SlotBusy { index: usize },
    #[error("no slot is filling")]
    NotActive,
    #[error("chunk of {len} bytes exceeds buffer capacity {capacity}")]
    ChunkTooLarge { len: usize, capacity: usize },
    #[error("slot {index} not free after {polls} polls")]
    Backpressure { index: usize, polls: u32 },
}

/// Point-in-time view of one slot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct SlotView {
    pub status: SlotStatus,
    pub used: usize,
    pub capacity: usize,
    /// Completed write cycles of this slot
    pub cycles: u32,
    pub created_us: u64,
}

struct Slot {
    status: AtomicU8,
    used: AtomicUsize,
    capacity: AtomicUsize,
    created_us: AtomicU64,
    cycles: AtomicU32,
    sequence: AtomicU64,
    data: UnsafeCell<Vec<u8>>,
}

// SAFETY: `data` is only accessed by the context that owns the slot according
// to `status` (see module docs); every other field is atomic.
unsafe impl Sync for Slot {}

impl Slot {
    fn new() -> Self {
        Self {
            status: AtomicU8::new(SlotStatus::Free as u8),
            used: AtomicUsize::new(0),
            capacity: AtomicUsize::new(0),
            created_us: AtomicU64::new(0),
            cycles: AtomicU32::new(0),
            sequence: AtomicU64::new(0),
            data: UnsafeCell::new(Vec::new()),
        }
    }

    fn status(&self) -> SlotStatus {
        SlotStatus::try_from(self.status.load(Ordering::Acquire)).unwrap_or(SlotStatus::Free)
    }

    fn set_status(&self, status: SlotStatus) {
        self.status.store(status as u8, Ordering::Release);
    }

    fn view(&self) -> SlotView {
        SlotView {
            status: self.status(),
            used: self.used.load(Ordering::Acquire),
            capacity: self.capacity.load(Ordering::Acquire),
            cycles: self.cycles.load(Ordering::Acquire),
            created_us: self.created_us.load(Ordering::Acquire),
        }
    }
}

/// The shared pool. Cloned `Arc`s of it live in both contexts; only the
/// single [`Filler`] may produce into it.
pub struct BufferPool {
    slots: [Slot; POOL_SLOTS],
    filler_taken: AtomicBool,
}

impl BufferPool {
    pub fn new() -> Self {
        Self {
            slots: core::array::from_fn(|_| Slot::new()),
            filler_taken: AtomicBool::new(false),
        }
    }

    /// A fresh pool together with its producer handle
    pub fn with_filler() -> (Arc<Self>, Filler) {
        let pool = Arc::new(Self::new());
        pool.filler_taken.store(true, Ordering::Release);
        let filler = Filler {
            pool: Arc::clone(&pool),
            current: None,
            published: 0,
        };
        (pool, filler)
    }

    /// Take the producer handle. Returns `None` once it has been taken.
    pub fn filler(self: &Arc<Self>) -> Option<Filler> {
        if self.filler_taken.swap(true, Ordering::AcqRel) {
            return None;
        }
        Some(Filler {
            pool: Arc::clone(self),
            current: None,
            published: 0,
        })
    }

    pub const fn slot_count(&self) -> usize {
        POOL_SLOTS
    }

    /// Status of slot `index`, `None` past the last slot
    pub fn status(&self, index: usize) -> Option<SlotStatus> {
        self.slots.get(index).map(Slot::status)
    }

    pub fn slot_view(&self, index: usize) -> Option<SlotView> {
        self.slots.get(index).map(Slot::view)
    }

    pub fn views(&self) -> [SlotView; POOL_SLOTS] {
        core::array::from_fn(|i| self.slots[i].view())
    }

    pub fn filling_count(&self) -> usize {
        self.count(SlotStatus::Filling)
    }

    pub fn has_ready(&self) -> bool {
        self.count(SlotStatus::Ready) > 0
    }

    pub fn all_free(&self) -> bool {
        self.count(SlotStatus::Free) == POOL_SLOTS
    }

    fn count(&self, status: SlotStatus) -> usize {
        self.slots.iter().filter(|s| s.status() == status).count()
    }

    /// Claim the oldest `Ready` slot for writing.
    ///
    /// Safe to call from any number of consumers; each slot is claimed by at
    /// most one of them.
    pub fn claim_ready(&self) -> Option<WriteGuard<'_>> {
        loop {
            let (index, slot) = self
                .slots
                .iter()
                .enumerate()
                .filter(|(_, slot)| slot.status() == SlotStatus::Ready)
                .min_by_key(|(_, slot)| slot.sequence.load(Ordering::Relaxed))?;
            let claimed = slot.status.compare_exchange(
                SlotStatus::Ready as u8,
                SlotStatus::Writing as u8,
                Ordering::Acquire,
                Ordering::Relaxed,
            );
            if claimed.is_ok() {
                return Some(WriteGuard { slot, index });
            }
        }
    }
}

impl Default for BufferPool {
    fn default() -> Self {
        Self::new()
    }
}

/// Storage-side ownership of one `Writing` slot. Dropping it resets the
/// slot's length and hands it back as `Free`.
pub struct WriteGuard<'a> {
    slot: &'a Slot,
    index: usize,
}

impl WriteGuard<'_> {
    pub fn index(&self) -> usize {
        self.index
    }

    pub fn created_us(&self) -> u64 {
        self.slot.created_us.load(Ordering::Acquire)
    }

    /// The bytes appended while the slot was filling
    pub fn data(&self) -> &[u8] {
        let used = self.slot.used.load(Ordering::Acquire);
        // SAFETY: the slot is `Writing`, which only this guard can hold; the
        // producer does not touch the memory until it observes `Free`.
        let data = unsafe { &*self.slot.data.get() };
        &data[..used.min(data.len())]
    }
}

impl Drop for WriteGuard<'_> {
    fn drop(&mut self) {
        self.slot.cycles.fetch_add(1, Ordering::AcqRel);
        self.slot.used.store(0, Ordering::Release);
        self.slot.set_status(SlotStatus::Free);
    }
}

/// The unique producer handle, held by the acquisition context
pub struct Filler {
    pool: Arc<BufferPool>,
    current: Option<usize>,
    /// Slots handed to storage so far
    published: u64,
}

impl Filler {
    pub fn pool(&self) -> &Arc<BufferPool> {
        &self.pool
    }

    /// Index of the `Filling` slot, if a run is active
    pub fn current(&self) -> Option<usize> {
        self.current
    }

    /// Used bytes of the `Filling` slot
    pub fn current_used(&self) -> usize {
        self.current
            .map(|i| self.pool.slots[i].used.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    /// Give every slot `capacity` bytes of zeroed storage.
    ///
    /// All slots must be `Free`. On failure every slot is released again, so
    /// the pool is left exactly as before the call.
    pub fn allocate(&mut self, capacity: usize) -> Result<(), PoolError> {
        if let Some(index) = self.pool.slots.iter().position(|s| s.status() != SlotStatus::Free) {
            return Err(PoolError::SlotBusy { index });
        }
        for slot in self.pool.slots.iter() {
            // SAFETY: the slot is `Free` and only the filler promotes `Free`
            // slots, so nobody else can reach this memory.
            let data = unsafe { &mut *slot.data.get() };
            data.clear();
            if data.try_reserve_exact(capacity).is_err() {
                self.release_memory();
                return Err(PoolError::Allocation { capacity });
            }
            data.resize(capacity, 0);
            slot.capacity.store(capacity, Ordering::Release);
            slot.used.store(0, Ordering::Release);
        }
        Ok(())
    }

    /// Free the storage of every `Free` slot
    pub fn release_memory(&mut self) {
        for slot in self.pool.slots.iter() {
            if slot.status() != SlotStatus::Free {
                continue;
            }
            // SAFETY: `Free` slots are only touched by the filler.
            let data = unsafe { &mut *slot.data.get() };
            *data = Vec::new();
            slot.capacity.store(0, Ordering::Release);
        }
    }

    /// Start a run: slot 0 becomes the `Filling` slot
    pub fn activate(&mut self) -> Result<(), PoolError> {
        self.promote(0)?;
        self.current = Some(0);
        Ok(())
    }

    fn publish(&mut self, index: usize, now_us: u64) {
        let slot = &self.pool.slots[index];
        slot.created_us.store(now_us, Ordering::Relaxed);
        slot.sequence.store(self.published, Ordering::Relaxed);
        self.published += 1;
        slot.set_status(SlotStatus::Ready);
    }

    fn promote(&self, index: usize) -> Result<(), PoolError> {
        let slot = &self.pool.slots[index];
        if slot.status() != SlotStatus::Free {
            return Err(PoolError::SlotBusy { index });
        }
        slot.used.store(0, Ordering::Release);
        slot.set_status(SlotStatus::Filling);
        Ok(())
    }

    /// Append `chunk` to the `Filling` slot, swapping first when it would
    /// not fit. `on_overrun` runs once per backpressure poll.
    pub fn append<C, F>(
        &mut self,
        chunk: &[u8],
        clock: &C,
        swap_timeout_us: u64,
        on_overrun: F,
    ) -> Result<(), PoolError>
    where
        C: Clock + ?Sized,
        F: FnMut(),
    {
        let mut index = self.current.ok_or(PoolError::NotActive)?;
        let capacity = self.pool.slots[index].capacity.load(Ordering::Relaxed);
        if chunk.len() > capacity {
            return Err(PoolError::ChunkTooLarge {
                len: chunk.len(),
                capacity,
            });
        }
        if self.pool.slots[index].used.load(Ordering::Relaxed) + chunk.len() > capacity {
            index = self.swap(clock, swap_timeout_us, on_overrun)?;
        }

        let slot = &self.pool.slots[index];
        let used = slot.used.load(Ordering::Relaxed);
        // SAFETY: the slot is `Filling`, owned by this filler alone.
        let data = unsafe { &mut *slot.data.get() };
        data[used..used + chunk.len()].copy_from_slice(chunk);
        slot.used.store(used + chunk.len(), Ordering::Release);
        Ok(())
    }

    /// Hand the `Filling` slot to storage and move to the next one in
    /// round-robin order.
    ///
    /// If the next slot is not `Free` the wait polls every `SWAP_POLL_US`
    /// up to `timeout_us`. On exhaustion no slot is left filling and the
    /// caller must end the run.
    pub fn swap<C, F>(
        &mut self,
        clock: &C,
        timeout_us: u64,
        mut on_overrun: F,
    ) -> Result<usize, PoolError>
    where
        C: Clock + ?Sized,
        F: FnMut(),
    {
        let index = self.current.ok_or(PoolError::NotActive)?;
        self.publish(index, clock.now_us());
        self.current = None;

        let next = (index + 1) % POOL_SLOTS;
        let next_slot = &self.pool.slots[next];
        let mut polls = 0u32;
        let free = wait_until(clock, timeout_us, SWAP_POLL_US, || {
            if next_slot.status() == SlotStatus::Free {
                return true;
            }
            polls += 1;
            on_overrun();
            false
        });
        if !free {
            return Err(PoolError::Backpressure { index: next, polls });
        }

        self.promote(next)?;
        self.current = Some(next);
        Ok(next)
    }

    /// End of run: the `Filling` slot becomes `Ready` if it holds data,
    /// otherwise `Free`. Returns the index handed to storage.
    pub fn seal<C: Clock + ?Sized>(&mut self, clock: &C) -> Option<usize> {
        let index = self.current.take()?;
        let slot = &self.pool.slots[index];
        if slot.used.load(Ordering::Relaxed) == 0 {
            slot.set_status(SlotStatus::Free);
            return None;
        }
        self.publish(index, clock.now_us());
        Some(index)
    }
}
