//! Streaming input for the stream processor.
//!
//! Samples arrive asynchronously (DMA completion, a second core) through a
//! single-producer/single-consumer ring. The consumer side drains whole
//! decimation windows into the configured mode.

use heapless::spsc::{Consumer, Producer, Queue};

use super::{DspError, Processed, StreamProcessor};
use crate::timing::Clock;

/// Samples handed to `process` per inner step
pub const STREAM_CHUNK: usize = 256;

/// Ring of raw samples; holds `N - 1` samples
pub struct SampleRing<const N: usize> {
    queue: Queue<u16, N>,
}

impl<const N: usize> SampleRing<N> {
    pub const fn new() -> Self {
        Self {
            queue: Queue::new(),
        }
    }

    /// Split into the producer and consumer halves
    pub fn split(&mut self) -> (SampleWriter<'_, N>, SampleReader<'_, N>) {
        let (producer, consumer) = self.queue.split();
        (SampleWriter { producer }, SampleReader { consumer })
    }
}

impl<const N: usize> Default for SampleRing<N> {
    fn default() -> Self {
        Self::new()
    }
}

/// Producer half of a [`SampleRing`]
pub struct SampleWriter<'a, const N: usize> {
    producer: Producer<'a, u16, N>,
}

impl<const N: usize> SampleWriter<'_, N> {
    /// Queue samples in order. A full ring stops the push and reports how
    /// many samples went in; the rest are the caller's to keep or drop.
    pub fn push(&mut self, samples: &[u16]) -> Result<(), DspError> {
        for (accepted, &sample) in samples.iter().enumerate() {
            if self.producer.enqueue(sample).is_err() {
                return Err(DspError::StreamOverflow { accepted });
            }
        }
        Ok(())
    }
}

/// Consumer half of a [`SampleRing`]
pub struct SampleReader<'a, const N: usize> {
    consumer: Consumer<'a, u16, N>,
}

impl<const N: usize> SampleReader<'_, N> {
    /// Samples waiting in the ring
    pub fn available(&self) -> usize {
        self.consumer.len()
    }

    fn fill(&mut self, dst: &mut [u16]) -> usize {
        let mut filled = 0;
        for slot in dst.iter_mut() {
            match self.consumer.dequeue() {
                Some(sample) => *slot = sample,
                None => break,
            }
            filled += 1;
        }
        filled
    }
}

impl StreamProcessor {
    /// Drain up to `max_count` queued samples through the configured mode.
    ///
    /// Nothing is consumed until at least one full decimation window is
    /// queued. Work is split into window-aligned chunks so the result is the
    /// same as one `process` call over the drained samples.
    pub fn process_stream<C: Clock + ?Sized, const N: usize>(
        &mut self,
        reader: &mut SampleReader<'_, N>,
        max_count: usize,
        out: &mut [u8],
        clock: &C,
    ) -> Result<Processed, DspError> {
        let factor = self.config().decimation as usize;
        let take = reader.available().min(max_count);
        if take < factor {
            return Ok(Processed::default());
        }

        let needed = self.config().max_output_bytes(take);
        if out.len() < needed {
            return Err(DspError::OutputTooSmall {
                needed,
                available: out.len(),
            });
        }

        let step = (STREAM_CHUNK / factor) * factor;
        let mut scratch = [0u16; STREAM_CHUNK];
        let mut total = Processed::default();
        let mut remaining = take;
        while remaining > 0 {
            let filled = reader.fill(&mut scratch[..remaining.min(step)]);
            if filled == 0 {
                break;
            }
            let done = self.process(&scratch[..filled], &mut out[total.bytes..], clock)?;
            total.outputs += done.outputs;
            total.bytes += done.bytes;
            remaining -= filled;
        }
        Ok(total)
    }
}
