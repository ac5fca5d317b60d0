//! Fixed-point kernels used by the stream processor.
//!
//! All arithmetic is integer; the only float is the cutoff, converted once to
//! a Q15 coefficient when the low-pass is configured.

use crate::config::{ADC_MIDSCALE, ENVELOPE_DECAY, ENVELOPE_DECAY_SHIFT, MAX_FILTER_LENGTH};

use super::SampleFormat;

/// Q15 unity for the low-pass coefficient
const Q15_ONE: i64 = 1 << 15;

/// Centre a raw 12-bit reading around zero
#[inline]
pub fn to_signed(sample: u16) -> i32 {
    sample as i32 - ADC_MIDSCALE as i32
}

/// Reduce a 12-bit magnitude to one byte
#[inline]
fn to_byte(value: u32) -> u8 {
    (value >> 4).min(u8::MAX as u32) as u8
}

/// Box-filter decimation: one mean per window of `factor` samples, the last
/// window may be shorter. Returns the number of outputs written.
pub fn decimate(input: &[u16], factor: usize, format: SampleFormat, out: &mut [u8]) -> usize {
    let width = format.width();
    let mut outputs = 0;
    for (window, dst) in input.chunks(factor).zip(out.chunks_mut(width)) {
        let sum: u32 = window.iter().map(|&s| s as u32).sum();
        let mean = (sum / window.len() as u32) as u16;
        format.encode(mean, dst);
        outputs += 1;
    }
    outputs
}

/// Bit-by-bit restoring integer square root
pub fn isqrt(value: u32) -> u16 {
    let mut remainder = value;
    let mut root = 0u32;
    let mut bit = 1u32 << 30;

    while bit > remainder {
        bit >>= 2;
    }
    while bit != 0 {
        if remainder >= root + bit {
            remainder -= root + bit;
            root = (root >> 1) + bit;
        } else {
            root >>= 1;
        }
        bit >>= 2;
    }
    root as u16
}

/// RMS of one window around mid-scale, scaled to a byte
pub fn rms_window(window: &[u16]) -> u8 {
    if window.is_empty() {
        return 0;
    }
    let sum_squares: u64 = window
        .iter()
        .map(|&s| {
            let v = to_signed(s) as i64;
            (v * v) as u64
        })
        .sum();
    let mean = sum_squares / window.len() as u64;
    to_byte(isqrt(mean.min(u32::MAX as u64) as u32) as u32)
}

/// Moving average over the last `len` samples.
///
/// Until `len` samples have been seen the divisor is the number seen so far.
#[derive(Debug, Clone)]
pub struct MovingAverage {
    taps: [u16; MAX_FILTER_LENGTH as usize],
    len: usize,
    index: usize,
    seen: usize,
    sum: u32,
}

impl MovingAverage {
    /// `len` must already be validated against `1..=MAX_FILTER_LENGTH`
    pub fn new(len: u16) -> Self {
        Self {
            taps: [0; MAX_FILTER_LENGTH as usize],
            len: (len as usize).clamp(1, MAX_FILTER_LENGTH as usize),
            index: 0,
            seen: 0,
            sum: 0,
        }
    }

    pub fn push(&mut self, sample: u16) -> u16 {
        if self.seen >= self.len {
            self.sum -= self.taps[self.index] as u32;
        } else {
            self.seen += 1;
        }
        self.taps[self.index] = sample;
        self.sum += sample as u32;
        self.index = (self.index + 1) % self.len;
        (self.sum / self.seen as u32) as u16
    }

    pub fn window_len(&self) -> usize {
        self.len
    }
}

/// Single-pole low-pass `y = a*x + (1-a)*y1` in Q15
#[derive(Debug, Clone, Copy)]
pub struct IirLowPass {
    alpha: i64,
    previous: i64,
}

impl IirLowPass {
    pub fn new(cutoff: f32) -> Self {
        Self {
            alpha: Self::coefficient(cutoff),
            previous: 0,
        }
    }

    fn coefficient(cutoff: f32) -> i64 {
        ((cutoff * Q15_ONE as f32) as i64).clamp(0, Q15_ONE)
    }

    /// Change the cutoff, keeping the filter history
    pub fn set_cutoff(&mut self, cutoff: f32) {
        self.alpha = Self::coefficient(cutoff);
    }

    pub fn alpha(&self) -> i64 {
        self.alpha
    }

    pub fn push(&mut self, sample: u16) -> u16 {
        let y = (self.alpha * sample as i64 + (Q15_ONE - self.alpha) * self.previous) >> 15;
        self.previous = y;
        y.clamp(0, u16::MAX as i64) as u16
    }
}

/// Peak follower with instant attack and multiplicative decay
#[derive(Debug, Clone, Copy, Default)]
pub struct EnvelopeFollower {
    estimate: u32,
}

impl EnvelopeFollower {
    pub fn window(&mut self, window: &[u16]) -> u8 {
        let peak = window
            .iter()
            .map(|&s| to_signed(s).unsigned_abs())
            .max()
            .unwrap_or(0);
        if peak > self.estimate {
            self.estimate = peak;
        } else {
            self.estimate = (self.estimate * ENVELOPE_DECAY) >> ENVELOPE_DECAY_SHIFT;
        }
        to_byte(self.estimate)
    }

    pub fn estimate(&self) -> u32 {
        self.estimate
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_isqrt_exact_and_floor() {
        assert_eq!(isqrt(0), 0);
        assert_eq!(isqrt(1), 1);
        assert_eq!(isqrt(15), 3);
        assert_eq!(isqrt(16), 4);
        assert_eq!(isqrt(2048 * 2048), 2048);
        assert_eq!(isqrt(u32::MAX), 65535);
    }

    #[test]
    fn test_decimate_partial_window() {
        let input = [10u16, 20, 30, 40, 50];
        let mut out = [0u8; 6];
        let n = decimate(&input, 2, SampleFormat::U16, &mut out);
        assert_eq!(n, 3);
        assert_eq!(u16::from_le_bytes([out[0], out[1]]), 15);
        assert_eq!(u16::from_le_bytes([out[2], out[3]]), 35);
        assert_eq!(u16::from_le_bytes([out[4], out[5]]), 50);
    }

    #[test]
    fn test_decimate_signed_and_byte_formats() {
        let input = [2048u16, 2048, 1048, 1048];
        let mut signed = [0u8; 4];
        decimate(&input, 2, SampleFormat::I16, &mut signed);
        assert_eq!(i16::from_le_bytes([signed[0], signed[1]]), 0);
        assert_eq!(i16::from_le_bytes([signed[2], signed[3]]), -1000);

        let mut bytes = [0u8; 2];
        decimate(&input, 2, SampleFormat::U8, &mut bytes);
        assert_eq!(bytes, [128, 65]);
    }

    #[test]
    fn test_moving_average_warm_up_divisor() {
        let mut avg = MovingAverage::new(4);
        assert_eq!(avg.push(100), 100);
        assert_eq!(avg.push(200), 150);
        assert_eq!(avg.push(300), 200);
        assert_eq!(avg.push(400), 250);
        // Oldest sample (100) leaves the window
        assert_eq!(avg.push(500), 350);
    }

    #[test]
    fn test_iir_full_cutoff_passes_through() {
        let mut lp = IirLowPass::new(1.0);
        assert_eq!(lp.alpha(), 32768);
        assert_eq!(lp.push(1234), 1234);
        assert_eq!(lp.push(10), 10);
    }

    #[test]
    fn test_iir_steps_toward_input() {
        let mut lp = IirLowPass::new(0.5);
        assert_eq!(lp.push(1000), 500);
        assert_eq!(lp.push(1000), 750);
        assert_eq!(lp.push(1000), 875);
    }

    #[test]
    fn test_envelope_attack_then_decay() {
        let mut env = EnvelopeFollower::default();
        assert_eq!(env.window(&[4095, 2048]), 127);
        assert_eq!(env.estimate(), 2047);
        env.window(&[2048, 2048]);
        assert_eq!(env.estimate(), 2047 * 1000 / 1024);
    }

    #[test]
    fn test_rms_of_square_wave() {
        // +-1024 around mid-scale has an RMS of 1024
        let window = [3072u16, 1024, 3072, 1024];
        assert_eq!(rms_window(&window), 64);
        assert_eq!(rms_window(&[2048; 8]), 0);
    }
}
