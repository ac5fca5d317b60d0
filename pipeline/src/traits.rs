//! # Collaborator Abstractions
//!
//! The pipeline never touches hardware directly. Everything platform-specific
//! sits behind the three traits in this module:
//!
//! - [`AcquisitionSource`]: the ADC capture engine (FIFO + DMA on the RP2040)
//! - [`CardLink`]: the byte link to the SD card plus its transfer offload
//! - [`Platform`]: the periodic trigger and the second execution context
//!
//! ## Design Rationale
//!
//! 1. **Testability**: the `sim` module implements all three on the host
//! 2. **Flexibility**: PIO, SPI or SDIO card links behind one trait
//! 3. **Bounded waits**: no trait method blocks; waiting is done by the
//!    caller through `timing::poll_until`

use embedded_io::{Read, ReadReady, Write};

use crate::context::WriterHandle;

/// Source of raw ADC batches.
///
/// A cycle is `clear_queue`, `begin_transfer`, then polling `is_busy` until
/// it returns false or the caller's deadline passes.
pub trait AcquisitionSource {
    /// Drop any samples left over from a previous transfer
    fn clear_queue(&mut self);

    /// Start capturing `count` samples; returns immediately
    fn begin_transfer(&mut self, count: usize);

    /// Whether the transfer started by `begin_transfer` is still running
    fn is_busy(&self) -> bool;

    /// Samples of the last completed transfer
    fn samples(&self) -> &[u16];
}

/// Byte link to an SD card.
///
/// Reads return whatever the card drives on the line; an idle line reads
/// `0xFF`. `read_ready` reports whether a read would return without waiting.
pub trait CardLink: Read + Write + ReadReady {
    /// Change the card clock
    fn set_clock(&mut self, hz: u32) -> Result<(), Self::Error>;

    /// Start moving `data` to the card through the hardware offload path
    /// (DMA). The caller polls [`CardLink::offload_busy`] for completion.
    fn start_offload(&mut self, data: &[u8]) -> Result<(), Self::Error>;

    /// Whether the transfer started by `start_offload` is still in flight
    fn offload_busy(&mut self) -> Result<bool, Self::Error>;
}

/// Scheduling services of the target.
///
/// On the RP2040 the trigger is a repeating hardware alarm that calls
/// `Pipeline::on_tick`, and the writer runs on core 1.
pub trait Platform {
    /// Arm the periodic acquisition trigger. Returns false if the platform
    /// has no timer to give.
    fn arm_trigger(&mut self, period_us: u32) -> bool;

    /// Stop the periodic trigger; idempotent
    fn disarm_trigger(&mut self);

    /// Run `StorageWriter::run` with `handle` in the storage context.
    /// Returns false if the context could not be started.
    fn launch_writer(&mut self, handle: WriterHandle) -> bool;

    /// Write every `Ready` buffer before returning, on the caller's context
    /// if need be. `stop` calls this once the grace period is over. Returns
    /// false if the writer cannot be reached.
    fn flush_writer(&mut self, handle: &WriterHandle) -> bool;
}
