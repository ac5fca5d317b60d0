//! # Stream Processor
//!
//! Stateful transform from raw 12-bit ADC batches to compressed output bytes.
//! A single instance is owned by the acquisition context; nothing here is
//! shared across contexts.
//!
//! ## Modes
//!
//! ```text
//! ┌───────────────┬──────────────────────────────┬─────────────────────────┐
//! │ FilterKind    │ Per output                   │ Encoding                │
//! ├───────────────┼──────────────────────────────┼─────────────────────────┤
//! │ Decimate      │ mean of D samples            │ U16 / U8 (>>4) / I16    │
//! │ MovingAverage │ running mean, every sample   │ u16 LE                  │
//! │ IirLowPass    │ Q15 single pole, every sample│ u16 LE                  │
//! │ Envelope      │ peak of D, decaying estimate │ u8 (>>4)                │
//! │ RmsEnvelope   │ RMS of D samples             │ u8 (>>4)                │
//! └───────────────┴──────────────────────────────┴─────────────────────────┘
//! ```
//!
//! Multi-byte outputs are little-endian, the layout the RP2040 produces when
//! copying its native words straight into a storage block.

use core::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::{
    ConfigError, DEFAULT_DECIMATION, DEFAULT_FILTER_LENGTH, MAX_DECIMATION, MAX_FILTER_LENGTH,
};
use crate::timing::Clock;

pub mod filters;
pub mod stream;

use filters::{EnvelopeFollower, IirLowPass, MovingAverage};

pub use stream::{SampleReader, SampleRing, SampleWriter};

/// Transform applied to each batch
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum FilterKind {
    /// Box-filter decimation in the configured output format
    Decimate,
    /// Moving average over `filter_length` samples
    MovingAverage,
    /// Single-pole IIR low-pass at `cutoff`
    IirLowPass,
    /// Peak envelope per decimation window
    Envelope,
    /// RMS envelope per decimation window
    RmsEnvelope,
}

/// Output width of the decimation mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum SampleFormat {
    /// Raw 16-bit passthrough
    U16,
    /// 12-bit reading shifted down to 8 bits
    U8,
    /// Signed, zero at ADC mid-scale
    I16,
}

impl SampleFormat {
    /// Bytes per output value
    pub const fn width(self) -> usize {
        match self {
            SampleFormat::U8 => 1,
            SampleFormat::U16 | SampleFormat::I16 => 2,
        }
    }

    /// Encode one value into the front of `out`, returns bytes written
    pub fn encode(self, value: u16, out: &mut [u8]) -> usize {
        match self {
            SampleFormat::U16 => out[..2].copy_from_slice(&value.to_le_bytes()),
            SampleFormat::U8 => out[0] = (value >> 4).min(u8::MAX as u16) as u8,
            SampleFormat::I16 => {
                let signed = filters::to_signed(value).clamp(i16::MIN as i32, i16::MAX as i32);
                out[..2].copy_from_slice(&(signed as i16).to_le_bytes())
            }
        }
        self.width()
    }
}

/// Stream processor configuration
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[serde(default)]
pub struct DspConfig {
    /// Samples per output for the window-based modes (1..=16)
    pub decimation: u16,
    pub filter: FilterKind,
    /// Moving-average window (1..=128)
    pub filter_length: u16,
    /// Normalized low-pass cutoff (0.0..=1.0)
    pub cutoff: f32,
    /// Encoding of the decimation mode
    pub output_format: SampleFormat,
}

impl DspConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        check_decimation(self.decimation)?;
        check_filter_length(self.filter_length)?;
        check_cutoff(self.cutoff)
    }

    /// Outputs produced for a batch of `samples`
    pub fn output_count(&self, samples: usize) -> usize {
        match self.filter {
            FilterKind::MovingAverage | FilterKind::IirLowPass => samples,
            _ => samples.div_ceil(self.decimation.max(1) as usize),
        }
    }

    /// Bytes produced for a batch of `samples`
    pub fn max_output_bytes(&self, samples: usize) -> usize {
        let width = match self.filter {
            FilterKind::Decimate => self.output_format.width(),
            FilterKind::MovingAverage | FilterKind::IirLowPass => 2,
            FilterKind::Envelope | FilterKind::RmsEnvelope => 1,
        };
        self.output_count(samples) * width
    }
}

impl Default for DspConfig {
    fn default() -> Self {
        Self {
            decimation: DEFAULT_DECIMATION,
            filter: FilterKind::Envelope,
            filter_length: DEFAULT_FILTER_LENGTH,
            cutoff: 0.1,
            output_format: SampleFormat::U8,
        }
    }
}

impl fmt::Display for DspConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "filter={:?} decimation={} length={} cutoff={:.3} format={:?}",
            self.filter, self.decimation, self.filter_length, self.cutoff, self.output_format
        )
    }
}

fn check_decimation(value: u16) -> Result<(), ConfigError> {
    if value == 0 || value > MAX_DECIMATION {
        return Err(ConfigError::Decimation(value));
    }
    Ok(())
}

fn check_filter_length(value: u16) -> Result<(), ConfigError> {
    if value == 0 || value > MAX_FILTER_LENGTH {
        return Err(ConfigError::FilterLength(value));
    }
    Ok(())
}

fn check_cutoff(value: f32) -> Result<(), ConfigError> {
    if !(0.0..=1.0).contains(&value) {
        return Err(ConfigError::Cutoff(value));
    }
    Ok(())
}

/// Errors from processing calls
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum DspError {
    #[error("output needs {needed} bytes, {available} available")]
    OutputTooSmall { needed: usize, available: usize },
    #[error("stream ring full after {accepted} samples")]
    StreamOverflow { accepted: usize },
}

/// Result of one processing call
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Processed {
    /// Output values produced
    pub outputs: usize,
    /// Bytes written to the output slice
    pub bytes: usize,
}

/// Running counters since the last reset
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct DspStats {
    pub samples_in: u64,
    pub samples_out: u64,
    pub batches: u64,
    pub processing_us: u64,
}

impl DspStats {
    /// Input samples per second of processing time
    pub fn throughput_sps(&self) -> f32 {
        if self.processing_us == 0 {
            return 0.0;
        }
        self.samples_in as f32 * 1_000_000.0 / self.processing_us as f32
    }

    /// Input samples per output value
    pub fn compression_ratio(&self) -> f32 {
        if self.samples_out == 0 {
            return 0.0;
        }
        self.samples_in as f32 / self.samples_out as f32
    }
}

/// The DSP engine: configuration, filter memory and counters
#[derive(Debug, Clone)]
pub struct StreamProcessor {
    config: DspConfig,
    average: MovingAverage,
    lowpass: IirLowPass,
    envelope: EnvelopeFollower,
    stats: DspStats,
}

impl StreamProcessor {
    pub fn new(config: DspConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self {
            config,
            average: MovingAverage::new(config.filter_length),
            lowpass: IirLowPass::new(config.cutoff),
            envelope: EnvelopeFollower::default(),
            stats: DspStats::default(),
        })
    }

    pub fn config(&self) -> &DspConfig {
        &self.config
    }

    pub fn stats(&self) -> &DspStats {
        &self.stats
    }

    /// Replace the whole configuration; filter memory restarts
    pub fn configure(&mut self, config: DspConfig) -> Result<(), ConfigError> {
        config.validate()?;
        self.config = config;
        self.reset_filters();
        Ok(())
    }

    pub fn set_decimation(&mut self, decimation: u16) -> Result<(), ConfigError> {
        check_decimation(decimation)?;
        self.config.decimation = decimation;
        Ok(())
    }

    pub fn set_filter(&mut self, filter: FilterKind) {
        self.config.filter = filter;
    }

    /// Changing the window discards the tap history
    pub fn set_filter_length(&mut self, length: u16) -> Result<(), ConfigError> {
        check_filter_length(length)?;
        self.config.filter_length = length;
        self.average = MovingAverage::new(length);
        Ok(())
    }

    pub fn set_cutoff(&mut self, cutoff: f32) -> Result<(), ConfigError> {
        check_cutoff(cutoff)?;
        self.config.cutoff = cutoff;
        self.lowpass.set_cutoff(cutoff);
        Ok(())
    }

    pub fn set_output_format(&mut self, format: SampleFormat) {
        self.config.output_format = format;
    }

    /// Clear filter memory and counters
    pub fn reset(&mut self) {
        self.reset_filters();
        self.stats = DspStats::default();
    }

    fn reset_filters(&mut self) {
        self.average = MovingAverage::new(self.config.filter_length);
        self.lowpass = IirLowPass::new(self.config.cutoff);
        self.envelope = EnvelopeFollower::default();
    }

    /// Transform one batch into `out`.
    ///
    /// Fails without touching any state when `out` cannot hold the result;
    /// size it with [`DspConfig::max_output_bytes`].
    pub fn process<C: Clock + ?Sized>(
        &mut self,
        input: &[u16],
        out: &mut [u8],
        clock: &C,
    ) -> Result<Processed, DspError> {
        let needed = self.config.max_output_bytes(input.len());
        if out.len() < needed {
            return Err(DspError::OutputTooSmall {
                needed,
                available: out.len(),
            });
        }

        let started = clock.now_us();
        let factor = self.config.decimation as usize;
        let outputs = match self.config.filter {
            FilterKind::Decimate => {
                filters::decimate(input, factor, self.config.output_format, out)
            }
            FilterKind::MovingAverage => {
                for (&x, dst) in input.iter().zip(out.chunks_exact_mut(2)) {
                    dst.copy_from_slice(&self.average.push(x).to_le_bytes());
                }
                input.len()
            }
            FilterKind::IirLowPass => {
                for (&x, dst) in input.iter().zip(out.chunks_exact_mut(2)) {
                    dst.copy_from_slice(&self.lowpass.push(x).to_le_bytes());
                }
                input.len()
            }
            FilterKind::Envelope => {
                for (window, dst) in input.chunks(factor).zip(out.iter_mut()) {
                    *dst = self.envelope.window(window);
                }
                input.len().div_ceil(factor)
            }
            FilterKind::RmsEnvelope => {
                for (window, dst) in input.chunks(factor).zip(out.iter_mut()) {
                    *dst = filters::rms_window(window);
                }
                input.len().div_ceil(factor)
            }
        };

        self.stats.samples_in += input.len() as u64;
        self.stats.samples_out += outputs as u64;
        self.stats.batches += 1;
        self.stats.processing_us += clock.now_us().saturating_sub(started);

        Ok(Processed {
            outputs,
            bytes: needed,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::SimClock;

    fn processor(filter: FilterKind, decimation: u16) -> StreamProcessor {
        StreamProcessor::new(DspConfig {
            filter,
            decimation,
            ..DspConfig::default()
        })
        .unwrap()
    }

    #[test]
    fn test_decimation_output_count() {
        let clock = SimClock::new();
        for (len, factor) in [(16usize, 4u16), (17, 4), (1, 16), (100, 3), (5, 1)] {
            let mut dsp = processor(FilterKind::Decimate, factor);
            dsp.set_output_format(SampleFormat::U16);
            let input = vec![2048u16; len];
            let mut out = vec![0u8; dsp.config().max_output_bytes(len)];
            let done = dsp.process(&input, &mut out, &clock).unwrap();
            assert_eq!(done.outputs, len.div_ceil(factor as usize));
            assert_eq!(done.bytes, done.outputs * 2);
        }
    }

    #[test]
    fn test_moving_average_converges_to_constant() {
        let clock = SimClock::new();
        let mut dsp = processor(FilterKind::MovingAverage, 1);
        dsp.set_filter_length(32).unwrap();
        let input = [3000u16; 64];
        let mut out = [0u8; 128];
        dsp.process(&input, &mut out, &clock).unwrap();
        for pair in out[31 * 2..].chunks_exact(2) {
            assert_eq!(u16::from_le_bytes([pair[0], pair[1]]), 3000);
        }
    }

    #[test]
    fn test_envelope_tail_never_increases() {
        let clock = SimClock::new();
        let mut dsp = processor(FilterKind::Envelope, 4);
        let mut input = vec![2048u16; 400];
        input[..4].copy_from_slice(&[4095, 0, 4095, 0]);
        let mut out = vec![0u8; 100];
        dsp.process(&input, &mut out, &clock).unwrap();
        assert_eq!(out[0], 128);
        for pair in out.windows(2) {
            assert!(pair[1] <= pair[0]);
        }
        assert!(out[99] < out[1]);
    }

    #[test]
    fn test_midscale_envelope_scenario() {
        let clock = SimClock::new();
        let mut dsp = processor(FilterKind::Envelope, 4);
        let input = vec![2048u16; 16_000];
        let mut out = vec![0xAAu8; 4_000];
        let done = dsp.process(&input, &mut out, &clock).unwrap();
        assert_eq!(done.outputs, 4_000);
        assert_eq!(done.bytes, 4_000);
        assert!(out.iter().all(|&b| b == 0));
        assert_eq!(dsp.stats().compression_ratio(), 4.0);
    }

    #[test]
    fn test_iir_state_persists_across_calls() {
        let clock = SimClock::new();
        let mut dsp = processor(FilterKind::IirLowPass, 1);
        dsp.set_cutoff(0.5).unwrap();
        let mut out = [0u8; 2];
        dsp.process(&[1000], &mut out, &clock).unwrap();
        assert_eq!(u16::from_le_bytes(out), 500);
        dsp.process(&[1000], &mut out, &clock).unwrap();
        assert_eq!(u16::from_le_bytes(out), 750);
    }

    #[test]
    fn test_rms_mode_emits_one_byte_per_window() {
        let clock = SimClock::new();
        let mut dsp = processor(FilterKind::RmsEnvelope, 2);
        let mut out = [0u8; 2];
        let done = dsp.process(&[3072, 1024, 2048], &mut out, &clock).unwrap();
        assert_eq!(done.outputs, 2);
        assert_eq!(out, [64, 0]);
    }

    #[test]
    fn test_out_of_range_config_is_rejected() {
        let mut dsp = processor(FilterKind::Envelope, 4);
        assert_eq!(dsp.set_decimation(0), Err(ConfigError::Decimation(0)));
        assert_eq!(dsp.set_decimation(17), Err(ConfigError::Decimation(17)));
        assert_eq!(dsp.set_filter_length(129), Err(ConfigError::FilterLength(129)));
        assert!(dsp.set_cutoff(1.5).is_err());
        assert_eq!(dsp.config().decimation, 4);
        assert_eq!(dsp.config().filter_length, DEFAULT_FILTER_LENGTH);
        assert_eq!(dsp.config().cutoff, 0.1);
    }

    #[test]
    fn test_undersized_output_leaves_state_untouched() {
        let clock = SimClock::new();
        let mut dsp = processor(FilterKind::Envelope, 4);
        let mut out = [0u8; 3];
        let err = dsp.process(&[4095; 16], &mut out, &clock).unwrap_err();
        assert_eq!(
            err,
            DspError::OutputTooSmall {
                needed: 4,
                available: 3
            }
        );
        assert_eq!(dsp.stats().samples_in, 0);
    }

    #[test]
    fn test_reset_clears_counters() {
        let clock = SimClock::new();
        let mut dsp = processor(FilterKind::Envelope, 4);
        let mut out = [0u8; 4];
        dsp.process(&[4095; 16], &mut out, &clock).unwrap();
        assert_eq!(dsp.stats().samples_out, 4);
        dsp.reset();
        assert_eq!(*dsp.stats(), DspStats::default());
    }
}
