//! # Run Statistics
//!
//! Counters shared by both execution contexts. Each counter has exactly one
//! writer:
//!
//! ```text
//! acquisition context          storage context
//! ───────────────────          ───────────────
//! acquisitions                 bytes_written
//! samples_in / samples_out     blocks_written
//! bytes_buffered               buffers_written
//! overruns                     write_errors
//! acquisition_timeouts
//! dropped_buffers
//! ```
//!
//! Readers take a [`Statistics`] snapshot; individual fields are coherent,
//! the snapshot as a whole is not a transaction.

use core::fmt;

use portable_atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use serde::{Deserialize, Serialize};

/// Live counters of the current (or last) run
#[derive(Debug, Default)]
pub struct RunStats {
    acquisitions: AtomicU32,
    samples_in: AtomicU64,
    samples_out: AtomicU64,
    bytes_buffered: AtomicU64,
    overruns: AtomicU32,
    acquisition_timeouts: AtomicU32,
    dropped_buffers: AtomicU32,
    bytes_written: AtomicU64,
    blocks_written: AtomicU32,
    buffers_written: AtomicU32,
    write_errors: AtomicU32,
    started_us: AtomicU64,
    ended_us: AtomicU64,
    ended: AtomicBool,
}

impl RunStats {
    pub const fn new() -> Self {
        Self {
            acquisitions: AtomicU32::new(0),
            samples_in: AtomicU64::new(0),
            samples_out: AtomicU64::new(0),
            bytes_buffered: AtomicU64::new(0),
            overruns: AtomicU32::new(0),
            acquisition_timeouts: AtomicU32::new(0),
            dropped_buffers: AtomicU32::new(0),
            bytes_written: AtomicU64::new(0),
            blocks_written: AtomicU32::new(0),
            buffers_written: AtomicU32::new(0),
            write_errors: AtomicU32::new(0),
            started_us: AtomicU64::new(0),
            ended_us: AtomicU64::new(0),
            ended: AtomicBool::new(false),
        }
    }

    /// Zero every counter; the run starts at `now_us`
    pub fn reset(&self, now_us: u64) {
        for counter in [
            &self.acquisitions,
            &self.overruns,
            &self.acquisition_timeouts,
            &self.dropped_buffers,
            &self.blocks_written,
            &self.buffers_written,
            &self.write_errors,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
        for counter in [
            &self.samples_in,
            &self.samples_out,
            &self.bytes_buffered,
            &self.bytes_written,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
        self.ended.store(false, Ordering::Relaxed);
        self.started_us.store(now_us, Ordering::Release);
    }

    /// Freeze the elapsed time at `now_us`
    pub fn finish(&self, now_us: u64) {
        self.ended_us.store(now_us, Ordering::Relaxed);
        self.ended.store(true, Ordering::Release);
    }

    /// Account one completed acquisition cycle
    pub fn record_acquisition(&self, samples_in: usize, samples_out: usize, bytes: usize) {
        self.acquisitions.fetch_add(1, Ordering::Relaxed);
        self.samples_in.fetch_add(samples_in as u64, Ordering::Relaxed);
        self.samples_out.fetch_add(samples_out as u64, Ordering::Relaxed);
        self.bytes_buffered.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub fn record_overrun(&self) {
        self.overruns.fetch_add(1, Ordering::Relaxed);
    }

    /// A transfer that did not complete in time also counts as an overrun
    pub fn record_acquisition_timeout(&self) {
        self.acquisition_timeouts.fetch_add(1, Ordering::Relaxed);
        self.overruns.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_dropped(&self, buffers: usize) {
        self.dropped_buffers.fetch_add(buffers as u32, Ordering::Relaxed);
    }

    /// Account one buffer successfully written as `blocks` card blocks
    pub fn record_write(&self, bytes: usize, blocks: u32) {
        self.bytes_written.fetch_add(bytes as u64, Ordering::Relaxed);
        self.blocks_written.fetch_add(blocks, Ordering::Relaxed);
        self.buffers_written.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_write_error(&self) {
        self.write_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn acquisitions(&self) -> u32 {
        self.acquisitions.load(Ordering::Relaxed)
    }

    pub fn overruns(&self) -> u32 {
        self.overruns.load(Ordering::Relaxed)
    }

    pub fn write_errors(&self) -> u32 {
        self.write_errors.load(Ordering::Relaxed)
    }

    /// Copy the counters as of `now_us`
    pub fn snapshot(&self, now_us: u64) -> Statistics {
        let end = if self.ended.load(Ordering::Acquire) {
            self.ended_us.load(Ordering::Relaxed)
        } else {
            now_us
        };
        Statistics {
            acquisitions: self.acquisitions.load(Ordering::Relaxed),
            samples_in: self.samples_in.load(Ordering::Relaxed),
            samples_out: self.samples_out.load(Ordering::Relaxed),
            bytes_buffered: self.bytes_buffered.load(Ordering::Relaxed),
            overruns: self.overruns.load(Ordering::Relaxed),
            acquisition_timeouts: self.acquisition_timeouts.load(Ordering::Relaxed),
            dropped_buffers: self.dropped_buffers.load(Ordering::Relaxed),
            bytes_written: self.bytes_written.load(Ordering::Relaxed),
            blocks_written: self.blocks_written.load(Ordering::Relaxed),
            buffers_written: self.buffers_written.load(Ordering::Relaxed),
            write_errors: self.write_errors.load(Ordering::Relaxed),
            elapsed_us: end.saturating_sub(self.started_us.load(Ordering::Acquire)),
        }
    }
}

/// Snapshot of [`RunStats`] plus derived rates
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Statistics {
    pub acquisitions: u32,
    pub samples_in: u64,
    pub samples_out: u64,
    pub bytes_buffered: u64,
    pub overruns: u32,
    pub acquisition_timeouts: u32,
    pub dropped_buffers: u32,
    pub bytes_written: u64,
    pub blocks_written: u32,
    pub buffers_written: u32,
    pub write_errors: u32,
    /// Time since the run started
    pub elapsed_us: u64,
}

impl Statistics {
    /// Raw input samples per second of run time
    pub fn throughput_sps(&self) -> f32 {
        per_second(self.samples_in, self.elapsed_us)
    }

    /// Bytes committed to the card per second of run time
    pub fn write_bytes_per_sec(&self) -> f32 {
        per_second(self.bytes_written, self.elapsed_us)
    }

    /// Raw input bytes (two per sample) per byte written
    pub fn compression_ratio(&self) -> f32 {
        if self.bytes_written == 0 {
            return 0.0;
        }
        (self.samples_in * 2) as f32 / self.bytes_written as f32
    }

    /// Percentage of cycles that completed without overrun
    pub fn success_rate(&self) -> f32 {
        if self.acquisitions == 0 {
            return 0.0;
        }
        let clean = self.acquisitions.saturating_sub(self.overruns);
        clean as f32 * 100.0 / self.acquisitions as f32
    }
}

fn per_second(count: u64, elapsed_us: u64) -> f32 {
    if elapsed_us == 0 {
        return 0.0;
    }
    count as f32 * 1_000_000.0 / elapsed_us as f32
}

impl fmt::Display for Statistics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Acquisitions:   {}", self.acquisitions)?;
        writeln!(f, "Samples in/out: {} / {}", self.samples_in, self.samples_out)?;
        writeln!(f, "Buffered:       {} bytes", self.bytes_buffered)?;
        writeln!(
            f,
            "Written:        {} bytes, {} blocks, {} buffers",
            self.bytes_written, self.blocks_written, self.buffers_written
        )?;
        writeln!(
            f,
            "Overruns:       {} ({} transfer timeouts)",
            self.overruns, self.acquisition_timeouts
        )?;
        writeln!(f, "Write errors:   {}", self.write_errors)?;
        writeln!(f, "Dropped:        {} buffers", self.dropped_buffers)?;
        writeln!(f, "Throughput:     {:.0} samples/s", self.throughput_sps())?;
        writeln!(f, "Write rate:     {:.0} bytes/s", self.write_bytes_per_sec())?;
        writeln!(f, "Compression:    {:.2}:1", self.compression_ratio())?;
        write!(f, "Success rate:   {:.1}%", self.success_rate())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reset_clears_counters() {
        let stats = RunStats::new();
        stats.record_acquisition(3600, 900, 900);
        stats.record_write(1024, 2);
        stats.record_acquisition_timeout();
        stats.reset(500);

        let snap = stats.snapshot(1500);
        assert_eq!(snap.acquisitions, 0);
        assert_eq!(snap.bytes_written, 0);
        assert_eq!(snap.overruns, 0);
        assert_eq!(snap.elapsed_us, 1000);
    }

    #[test]
    fn test_finish_freezes_elapsed() {
        let stats = RunStats::new();
        stats.reset(100);
        stats.finish(400);
        assert_eq!(stats.snapshot(9_000).elapsed_us, 300);
        stats.reset(10_000);
        assert_eq!(stats.snapshot(10_500).elapsed_us, 500);
    }

    #[test]
    fn test_timeout_counts_as_overrun() {
        let stats = RunStats::new();
        stats.record_acquisition_timeout();
        stats.record_overrun();
        let snap = stats.snapshot(0);
        assert_eq!(snap.acquisition_timeouts, 1);
        assert_eq!(snap.overruns, 2);
    }

    #[test]
    fn test_derived_rates() {
        let stats = RunStats::new();
        stats.reset(0);
        for _ in 0..4 {
            stats.record_acquisition(1000, 250, 250);
        }
        stats.record_overrun();
        stats.record_write(1000, 2);

        let snap = stats.snapshot(1_000_000);
        assert_eq!(snap.throughput_sps(), 4000.0);
        assert_eq!(snap.write_bytes_per_sec(), 1000.0);
        assert_eq!(snap.compression_ratio(), 8.0);
        assert_eq!(snap.success_rate(), 75.0);
    }

    #[test]
    fn test_empty_snapshot_has_zero_rates() {
        let snap = Statistics::default();
        assert_eq!(snap.throughput_sps(), 0.0);
        assert_eq!(snap.compression_ratio(), 0.0);
        assert_eq!(snap.success_rate(), 0.0);
    }

    #[test]
    fn test_display_lists_counters() {
        let stats = RunStats::new();
        stats.record_acquisition(10, 5, 5);
        let text = std::format!("{}", stats.snapshot(0));
        assert!(text.contains("Acquisitions:   1"));
        assert!(text.contains("Success rate"));
    }
}
