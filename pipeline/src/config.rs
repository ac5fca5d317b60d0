//! Configuration constants and run-time pipeline configuration

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::dsp::DspConfig;
use crate::storage::StorageTiming;

/// Number of buffers in the pool (one filling, the rest queued or writing)
pub const POOL_SLOTS: usize = 4;

/// Default capacity of each pool buffer
pub const DEFAULT_BUFFER_CAPACITY: usize = 128 * 1024;

/// Period of the acquisition trigger
pub const ACQUISITION_PERIOD_US: u32 = 30;

/// How long one cycle waits for the sample transfer before substituting data
pub const ACQUISITION_TIMEOUT_US: u64 = ACQUISITION_PERIOD_US as u64 + 1_000;

/// Poll interval while waiting for a sample transfer
pub const ACQUISITION_POLL_US: u32 = 1;

/// Samples captured per acquisition cycle
pub const DEFAULT_ACQUISITION_SAMPLES: u16 = 3600;

/// Upper bound on samples per cycle (sizes the DSP scratch)
pub const MAX_ACQUISITION_SAMPLES: u16 = 8192;

/// Nominal output sample rate, informational
pub const DEFAULT_TARGET_RATE: u32 = 12_000_000;

/// Decimation factor bounds
pub const DEFAULT_DECIMATION: u16 = 4;
pub const MAX_DECIMATION: u16 = 16;

/// Moving-average window bounds (taps)
pub const DEFAULT_FILTER_LENGTH: u16 = 32;
pub const MAX_FILTER_LENGTH: u16 = 128;

/// Mid-scale of the 12-bit ADC, the signed zero
pub const ADC_MIDSCALE: u16 = 2048;

/// Envelope decay per window: estimate * DECAY / 2^DECAY_SHIFT
pub const ENVELOPE_DECAY: u32 = 1000;
pub const ENVELOPE_DECAY_SHIFT: u32 = 10;

/// Synthetic pattern used when a transfer times out: BASE + (i % PERIOD)
pub const TEST_PATTERN_BASE: u16 = ADC_MIDSCALE;
pub const TEST_PATTERN_PERIOD: u16 = 100;

/// Buffer swap backpressure polling
pub const SWAP_POLL_US: u32 = 10;
pub const DEFAULT_SWAP_TIMEOUT_US: u64 = 10_000;

/// Time the storage context gets to drain buffers on stop
pub const STOP_GRACE_US: u64 = 100_000;
pub const STOP_POLL_US: u32 = 1_000;

/// Storage context sleep when nothing is ready
pub const WRITER_IDLE_US: u32 = 1_000;

/// Fixed SD block size
pub const BLOCK_SIZE: usize = 512;

/// SD clock during identification and after bring-up
pub const INIT_CLOCK_HZ: u32 = 400_000;
pub const FAST_CLOCK_HZ: u32 = 25_000_000;

/// CMD0 attempts and the delay between them
pub const RESET_ATTEMPTS: u8 = 10;
pub const RESET_RETRY_DELAY_US: u32 = 10_000;

/// ACMD41 polls and the delay between them (about one second total)
pub const OP_COND_ATTEMPTS: u16 = 1_000;
pub const OP_COND_RETRY_DELAY_US: u32 = 1_000;

/// Bounded waits of the storage protocol
pub const RESPONSE_TIMEOUT_US: u64 = 1_000;
pub const DATA_TIMEOUT_US: u64 = 100_000;
pub const BUSY_TIMEOUT_US: u64 = 250_000;
pub const TRANSFER_TIMEOUT_US: u64 = 10_000;
pub const STORAGE_POLL_US: u32 = 1;

/// Configuration values rejected by validation
#[derive(Debug, Clone, Copy, PartialEq, Error)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ConfigError {
    #[error("decimation {0} outside 1..={max}", max = MAX_DECIMATION)]
    Decimation(u16),
    #[error("filter length {0} outside 1..={max}", max = MAX_FILTER_LENGTH)]
    FilterLength(u16),
    #[error("cutoff {0} outside 0.0..=1.0")]
    Cutoff(f32),
    #[error("acquisition samples {0} outside 1..={max}", max = MAX_ACQUISITION_SAMPLES)]
    AcquisitionSamples(u16),
    #[error("buffer capacity {0} is not a non-zero multiple of {size}", size = BLOCK_SIZE)]
    BufferCapacity(usize),
    #[error("a processed chunk of {chunk} bytes does not fit a {capacity} byte buffer")]
    ChunkExceedsBuffer { chunk: usize, capacity: usize },
}

/// Run-time configuration of one pipeline instance
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[serde(default)]
pub struct PipelineConfig {
    /// Raw samples captured per cycle
    pub acquisition_samples: u16,
    /// Nominal output rate, reported in status only
    pub target_rate: u32,
    /// Ignore the iteration budget passed to `start`
    pub continuous: bool,
    /// Capacity of each pool buffer, a multiple of the block size
    pub buffer_capacity: usize,
    /// First card block written by a run
    pub start_block: u32,
    /// Acquisition trigger period
    pub acquisition_period_us: u32,
    /// Per-cycle transfer wait before falling back to the test pattern
    pub acquisition_timeout_us: u64,
    /// Bound on a buffer swap waiting for the storage context
    pub swap_timeout_us: u64,
    /// Bound on the drain wait in `stop`
    pub stop_grace_us: u64,
    /// Stream processor configuration
    pub dsp: DspConfig,
    /// Card protocol timeouts and retry bounds
    pub storage: StorageTiming,
}

impl PipelineConfig {
    /// Check every bound; nothing is clamped
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.dsp.validate()?;
        if self.acquisition_samples == 0 || self.acquisition_samples > MAX_ACQUISITION_SAMPLES {
            return Err(ConfigError::AcquisitionSamples(self.acquisition_samples));
        }
        if self.buffer_capacity == 0 || self.buffer_capacity % BLOCK_SIZE != 0 {
            return Err(ConfigError::BufferCapacity(self.buffer_capacity));
        }
        let chunk = self.dsp.max_output_bytes(self.acquisition_samples as usize);
        if chunk > self.buffer_capacity {
            return Err(ConfigError::ChunkExceedsBuffer {
                chunk,
                capacity: self.buffer_capacity,
            });
        }
        Ok(())
    }

    /// Largest chunk one cycle can produce under this configuration
    pub fn max_chunk_bytes(&self) -> usize {
        self.dsp.max_output_bytes(self.acquisition_samples as usize)
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            acquisition_samples: DEFAULT_ACQUISITION_SAMPLES,
            target_rate: DEFAULT_TARGET_RATE,
            continuous: false,
            buffer_capacity: DEFAULT_BUFFER_CAPACITY,
            start_block: 0,
            acquisition_period_us: ACQUISITION_PERIOD_US,
            acquisition_timeout_us: ACQUISITION_TIMEOUT_US,
            swap_timeout_us: DEFAULT_SWAP_TIMEOUT_US,
            stop_grace_us: STOP_GRACE_US,
            dsp: DspConfig::default(),
            storage: StorageTiming::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dsp::FilterKind;

    #[test]
    fn test_default_config_is_valid() {
        let config = PipelineConfig::default();
        assert_eq!(config.acquisition_samples, 3600);
        assert_eq!(config.dsp.decimation, 4);
        assert_eq!(config.dsp.filter, FilterKind::Envelope);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_rejects_unaligned_capacity() {
        let config = PipelineConfig {
            buffer_capacity: 1000,
            ..PipelineConfig::default()
        };
        assert_eq!(config.validate(), Err(ConfigError::BufferCapacity(1000)));
    }

    #[test]
    fn test_rejects_chunk_larger_than_buffer() {
        let mut config = PipelineConfig {
            buffer_capacity: 512,
            acquisition_samples: 1024,
            ..PipelineConfig::default()
        };
        config.dsp.filter = FilterKind::MovingAverage;
        assert_eq!(
            config.validate(),
            Err(ConfigError::ChunkExceedsBuffer {
                chunk: 2048,
                capacity: 512
            })
        );
    }

    #[test]
    fn test_rejects_zero_samples() {
        let config = PipelineConfig {
            acquisition_samples: 0,
            ..PipelineConfig::default()
        };
        assert_eq!(config.validate(), Err(ConfigError::AcquisitionSamples(0)));
    }
}
