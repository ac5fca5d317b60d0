//! # Pipeline Orchestrator
//!
//! Owns the acquisition side of a run: the source, the stream processor, the
//! producer handle of the buffer pool and the platform services. The storage
//! side runs elsewhere and only sees the [`SharedContext`].
//!
//! ## Lifecycle
//!
//! ```text
//!            start()                budget reached / stop()
//!   ┌──────┐ ───────► ┌─────────┐ ─────────────────────────► ┌──────────┐
//!   │ Idle │          │ Running │                            │ Stopping │
//!   └──────┘ ◄─────┐  └─────────┘                            └──────────┘
//!      ▲           │       │ backpressure exhausted,              │
//!      │ init()    │       │ writer/trigger unavailable           │ stop()
//!   ┌───────┐      │       ▼                                      │
//!   │ Error │ ◄────┼───────┘                                      │
//!   └───────┘      └──────────────────────────────────────────────┘
//! ```
//!
//! ## Acquisition Cycle (`on_tick`)
//!
//! 1. Clear the source queue, begin a transfer, wait (bounded) for it
//! 2. On timeout substitute the test pattern and count an overrun
//! 3. Run the batch through the stream processor
//! 4. Append the chunk to the filling buffer, swapping when full
//!
//! Nothing in the cycle waits longer than the acquisition timeout plus the
//! swap timeout.

use alloc::sync::Arc;
use alloc::vec::Vec;
use core::fmt;

use log::{debug, error, info, trace, warn};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::buffer::{BufferPool, Filler, PoolError, SlotView};
use crate::config::{
    ConfigError, PipelineConfig, ACQUISITION_POLL_US, POOL_SLOTS, STOP_POLL_US,
    TEST_PATTERN_BASE, TEST_PATTERN_PERIOD,
};
use crate::context::{PipelineState, SharedContext, WriterHandle};
use crate::dsp::{DspError, StreamProcessor};
use crate::stats::Statistics;
use crate::timing::{wait_until, Clock};
use crate::traits::{AcquisitionSource, Platform};

/// Errors surfaced by control operations
#[derive(Debug, Clone, Copy, PartialEq, Error)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum PipelineError {
    #[error("operation not allowed while {0:?}")]
    InvalidState(PipelineState),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("out of memory: {0}")]
    OutOfMemory(PoolError),
    #[error(transparent)]
    Pool(PoolError),
    #[error(transparent)]
    Dsp(#[from] DspError),
    #[error("storage context could not be started")]
    WriterUnavailable,
    #[error("acquisition trigger unavailable")]
    TriggerUnavailable,
}

impl From<PoolError> for PipelineError {
    fn from(e: PoolError) -> Self {
        match e {
            PoolError::Allocation { .. } => PipelineError::OutOfMemory(e),
            _ => PipelineError::Pool(e),
        }
    }
}

/// What one acquisition cycle did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum TickOutcome {
    /// The pipeline is not running
    Inactive,
    /// A chunk was buffered; `substituted` if the test pattern stood in
    Acquired { bytes: usize, substituted: bool },
    /// Processing rejected the batch; the cycle was counted as an overrun
    Skipped,
    /// The iteration budget was used up; the run is now Stopping
    BudgetExhausted,
    /// A swap could not get a free buffer in time; the run is now Error
    Faulted,
}

/// Snapshot returned by [`Pipeline::status`]
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct StatusReport {
    pub state: PipelineState,
    pub iterations: u32,
    /// Iteration budget of a bounded run
    pub budget: Option<u32>,
    pub config: PipelineConfig,
    pub buffers: [SlotView; POOL_SLOTS],
    pub writer_running: bool,
    pub next_block: u32,
    pub statistics: Statistics,
}

impl fmt::Display for StatusReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "State:       {:?}", self.state)?;
        match self.budget {
            Some(budget) => writeln!(f, "Iterations:  {} of {}", self.iterations, budget)?,
            None => writeln!(f, "Iterations:  {} (continuous)", self.iterations)?,
        }
        writeln!(
            f,
            "Acquisition: {} samples, target {} Hz",
            self.config.acquisition_samples, self.config.target_rate
        )?;
        writeln!(f, "DSP:         {}", self.config.dsp)?;
        writeln!(
            f,
            "Storage:     writer {}, next block {}",
            if self.writer_running { "running" } else { "idle" },
            self.next_block
        )?;
        for (i, buffer) in self.buffers.iter().enumerate() {
            writeln!(
                f,
                "Buffer {}:    {:?} {}/{} bytes, {} cycles",
                i, buffer.status, buffer.used, buffer.capacity, buffer.cycles
            )?;
        }
        write!(f, "{}", self.statistics)
    }
}

/// One acquisition pipeline instance
pub struct Pipeline<S, C, P> {
    source: S,
    clock: C,
    platform: P,
    shared: Arc<SharedContext>,
    filler: Filler,
    dsp: Option<StreamProcessor>,
    config: PipelineConfig,
    /// Output of the stream processor for one cycle
    scratch: Vec<u8>,
    /// Test pattern used when a transfer times out
    pattern: Vec<u16>,
    budget: Option<u32>,
    iterations: u32,
}

impl<S, C, P> Pipeline<S, C, P>
where
    S: AcquisitionSource,
    C: Clock,
    P: Platform,
{
    pub fn new(source: S, clock: C, platform: P, config: PipelineConfig) -> Result<Self, PipelineError> {
        config.validate()?;
        let (pool, filler) = BufferPool::with_filler();
        Ok(Self {
            source,
            clock,
            platform,
            shared: Arc::new(SharedContext::from_pool(pool)),
            filler,
            dsp: None,
            config,
            scratch: Vec::new(),
            pattern: Vec::new(),
            budget: None,
            iterations: 0,
        })
    }

    /// Initialize the stream processor and clear an Error state
    pub fn init(&mut self) -> Result<(), PipelineError> {
        match self.state() {
            PipelineState::Idle => {}
            PipelineState::Error => {
                self.stop();
                self.shared.set_state(PipelineState::Idle);
                info!("pipeline reinitialized after error");
            }
            state => return Err(PipelineError::InvalidState(state)),
        }
        match self.dsp.as_mut() {
            Some(dsp) => {
                dsp.configure(self.config.dsp)?;
                dsp.reset();
            }
            None => self.dsp = Some(StreamProcessor::new(self.config.dsp)?),
        }
        info!("pipeline initialized: {}", self.config.dsp);
        Ok(())
    }

    /// Change the acquisition parameters; only while Idle
    pub fn configure(
        &mut self,
        acquisition_samples: u16,
        decimation: u16,
        target_rate: u32,
        continuous: bool,
    ) -> Result<(), PipelineError> {
        let mut config = self.config;
        config.acquisition_samples = acquisition_samples;
        config.dsp.decimation = decimation;
        config.target_rate = target_rate;
        config.continuous = continuous;
        self.set_config(config)
    }

    /// Replace the whole configuration; only while Idle. A rejected
    /// configuration leaves the current one in place.
    pub fn set_config(&mut self, config: PipelineConfig) -> Result<(), PipelineError> {
        let state = self.state();
        if state != PipelineState::Idle {
            return Err(PipelineError::InvalidState(state));
        }
        config.validate()?;
        if let Some(dsp) = self.dsp.as_mut() {
            dsp.configure(config.dsp)?;
        }
        self.config = config;
        debug!(
            "configured: {} samples, decimation {}, continuous {}",
            config.acquisition_samples, config.dsp.decimation, config.continuous
        );
        Ok(())
    }

    /// Start a run. `max_iterations == 0` (or a continuous configuration)
    /// runs until `stop`.
    pub fn start(&mut self, max_iterations: u32) -> Result<(), PipelineError> {
        let state = self.state();
        if state != PipelineState::Idle {
            return Err(PipelineError::InvalidState(state));
        }
        self.config.validate()?;
        if self.dsp.is_none() {
            info!("stream processor not initialized, using configured defaults");
            self.dsp = Some(StreamProcessor::new(self.config.dsp)?);
        }

        self.filler.allocate(self.config.buffer_capacity)?;
        if let Err(e) = self.allocate_scratch() {
            self.filler.release_memory();
            return Err(e);
        }
        if let Err(e) = self.filler.activate() {
            self.release_scratch();
            self.filler.release_memory();
            return Err(e.into());
        }

        self.shared.stats().reset(self.clock.now_us());
        if let Some(dsp) = self.dsp.as_mut() {
            dsp.reset();
        }
        self.iterations = 0;
        self.budget = (!self.config.continuous && max_iterations > 0).then_some(max_iterations);
        self.shared.set_next_block(self.config.start_block);
        self.shared.set_state(PipelineState::Running);

        if self.shared.claim_writer() && !self.platform.launch_writer(self.handle()) {
            self.shared.release_writer();
            self.abort("storage context could not be started");
            return Err(PipelineError::WriterUnavailable);
        }
        if !self.platform.arm_trigger(self.config.acquisition_period_us) {
            self.abort("acquisition trigger unavailable");
            return Err(PipelineError::TriggerUnavailable);
        }

        match self.budget {
            Some(budget) => info!(
                "pipeline started: {} iterations, {} bytes x {} buffers, block {}",
                budget, self.config.buffer_capacity, POOL_SLOTS, self.config.start_block
            ),
            None => info!(
                "pipeline started: continuous, {} bytes x {} buffers, block {}",
                self.config.buffer_capacity, POOL_SLOTS, self.config.start_block
            ),
        }
        Ok(())
    }

    fn allocate_scratch(&mut self) -> Result<(), PipelineError> {
        let chunk = self.config.max_chunk_bytes();
        let samples = self.config.acquisition_samples as usize;
        self.scratch.clear();
        self.pattern.clear();
        if self.scratch.try_reserve_exact(chunk).is_err()
            || self.pattern.try_reserve_exact(samples).is_err()
        {
            self.release_scratch();
            return Err(PipelineError::OutOfMemory(PoolError::Allocation { capacity: chunk }));
        }
        self.scratch.resize(chunk, 0);
        self.pattern.extend(
            (0..samples).map(|i| TEST_PATTERN_BASE + (i % TEST_PATTERN_PERIOD as usize) as u16),
        );
        Ok(())
    }

    fn release_scratch(&mut self) {
        self.scratch = Vec::new();
        self.pattern = Vec::new();
    }

    /// Failure while starting: disarm, release and park in Error
    fn abort(&mut self, reason: &str) {
        error!("pipeline error: {}", reason);
        self.platform.disarm_trigger();
        self.filler.seal(&self.clock);
        self.filler.release_memory();
        self.release_scratch();
        self.shared.set_state(PipelineState::Error);
    }

    /// One acquisition cycle, called from the periodic trigger
    pub fn on_tick(&mut self) -> TickOutcome {
        if self.state() != PipelineState::Running {
            return TickOutcome::Inactive;
        }
        if self.budget.is_some_and(|budget| self.iterations >= budget) {
            self.filler.seal(&self.clock);
            self.shared.set_state(PipelineState::Stopping);
            self.platform.disarm_trigger();
            info!("iteration budget of {} reached", self.iterations);
            return TickOutcome::BudgetExhausted;
        }
        self.iterations += 1;

        let count = self.config.acquisition_samples as usize;
        self.source.clear_queue();
        self.source.begin_transfer(count);
        let source = &self.source;
        let completed = wait_until(
            &self.clock,
            self.config.acquisition_timeout_us,
            ACQUISITION_POLL_US,
            || !source.is_busy(),
        );

        let stats = self.shared.stats();
        let input: &[u16] = if completed {
            self.source.samples()
        } else {
            stats.record_acquisition_timeout();
            let overruns = stats.overruns();
            if overruns % 100 == 1 {
                warn!(
                    "acquisition {} timed out, using test pattern ({} overruns)",
                    self.iterations, overruns
                );
            }
            &self.pattern
        };

        let Some(dsp) = self.dsp.as_mut() else {
            return TickOutcome::Inactive;
        };
        let processed = match dsp.process(input, &mut self.scratch, &self.clock) {
            Ok(processed) => processed,
            Err(e) => {
                stats.record_overrun();
                warn!("acquisition {} dropped: {}", self.iterations, e);
                return TickOutcome::Skipped;
            }
        };

        let chunk = &self.scratch[..processed.bytes];
        let appended = self.filler.append(
            chunk,
            &self.clock,
            self.config.swap_timeout_us,
            || stats.record_overrun(),
        );
        if let Err(e) = appended {
            error!("acquisition {}: {}", self.iterations, e);
            self.platform.disarm_trigger();
            self.shared.set_state(PipelineState::Error);
            return TickOutcome::Faulted;
        }

        stats.record_acquisition(input.len(), processed.outputs, processed.bytes);
        trace!(
            "acquisition {}: {} samples -> {} bytes, buffer {:?} at {}",
            self.iterations,
            input.len(),
            processed.bytes,
            self.filler.current(),
            self.filler.current_used()
        );
        TickOutcome::Acquired {
            bytes: processed.bytes,
            substituted: !completed,
        }
    }

    /// End the run: seal the filling buffer, give storage the grace period to
    /// drain, then force-flush whatever is still waiting and release the
    /// buffers.
    pub fn stop(&mut self) {
        let state = self.state();
        if state == PipelineState::Idle {
            return;
        }
        self.platform.disarm_trigger();
        self.filler.seal(&self.clock);
        if state != PipelineState::Error {
            self.shared.set_state(PipelineState::Stopping);
        }

        let pool = Arc::clone(self.shared.pool());
        if pool.has_ready() && self.shared.claim_writer() && !self.platform.launch_writer(self.handle()) {
            self.shared.release_writer();
            warn!("storage context unavailable, flushing on stop");
        }
        let drained = wait_until(&self.clock, self.config.stop_grace_us, STOP_POLL_US, || {
            pool.all_free()
        });
        if !drained {
            let handle = self.handle();
            if self.platform.flush_writer(&handle) {
                debug!("pending buffers flushed, cursor at block {}", handle.next_block());
            }
            // Only an unreachable writer leaves anything behind
            let mut dropped = 0;
            while let Some(guard) = pool.claim_ready() {
                drop(guard);
                dropped += 1;
            }
            if dropped > 0 {
                self.shared.stats().record_dropped(dropped);
                warn!("storage unreachable, {} buffers dropped", dropped);
            }
        }

        self.filler.release_memory();
        self.release_scratch();
        self.shared.stats().finish(self.clock.now_us());
        if state != PipelineState::Error {
            self.shared.set_state(PipelineState::Idle);
        }
        let stats = self.statistics();
        info!(
            "pipeline stopped after {} acquisitions: {} bytes in {} blocks, {} overruns, {} write errors",
            stats.acquisitions, stats.bytes_written, stats.blocks_written, stats.overruns, stats.write_errors
        );
    }

    pub fn is_running(&self) -> bool {
        self.state() == PipelineState::Running
    }

    pub fn state(&self) -> PipelineState {
        self.shared.state()
    }

    pub fn statistics(&self) -> Statistics {
        self.shared.stats().snapshot(self.clock.now_us())
    }

    pub fn status(&self) -> StatusReport {
        StatusReport {
            state: self.state(),
            iterations: self.iterations,
            budget: self.budget,
            config: self.config,
            buffers: self.shared.pool().views(),
            writer_running: self.shared.writer_running(),
            next_block: self.shared.next_block(),
            statistics: self.statistics(),
        }
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn dsp(&self) -> Option<&StreamProcessor> {
        self.dsp.as_ref()
    }

    pub fn source(&self) -> &S {
        &self.source
    }

    pub fn platform(&self) -> &P {
        &self.platform
    }

    pub fn platform_mut(&mut self) -> &mut P {
        &mut self.platform
    }

    pub fn shared(&self) -> &Arc<SharedContext> {
        &self.shared
    }

    /// Handle for a storage context serving this pipeline
    pub fn handle(&self) -> WriterHandle {
        WriterHandle::new(Arc::clone(&self.shared))
    }

    pub fn into_parts(self) -> (S, C, P) {
        (self.source, self.clock, self.platform)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::SlotStatus;
    use crate::config::BLOCK_SIZE;
    use crate::dsp::{DspConfig, FilterKind, SampleFormat};
    use crate::sim::{MemCard, SimClock, SimSource, StdClock, ThreadPlatform, Waveform};
    use crate::storage::{StorageBackend, StorageTiming};
    use crate::writer::{StorageWriter, WriterPoll};

    /// Runs the storage context only when the test pumps it
    struct StepPlatform {
        writer: StorageWriter<MemCard, SimClock>,
        handle: Option<WriterHandle>,
        trigger: Option<u32>,
        accept_launch: bool,
        accept_flush: bool,
    }

    impl StepPlatform {
        fn new(clock: &SimClock) -> Self {
            let backend = StorageBackend::new(MemCard::new(8192), clock.clone(), StorageTiming::default());
            Self {
                writer: StorageWriter::new(backend).unwrap(),
                handle: None,
                trigger: None,
                accept_launch: true,
                accept_flush: true,
            }
        }

        fn pump(&mut self) -> usize {
            let handle = self.handle.clone().unwrap();
            self.writer.flush(&handle)
        }

        /// One storage context iteration
        fn step(&mut self) -> WriterPoll {
            let handle = self.handle.clone().unwrap();
            self.writer.poll_once(&handle)
        }

        fn card(&self) -> &MemCard {
            self.writer.backend().link()
        }
    }

    impl Platform for StepPlatform {
        fn arm_trigger(&mut self, period_us: u32) -> bool {
            self.trigger = Some(period_us);
            true
        }

        fn disarm_trigger(&mut self) {
            self.trigger = None;
        }

        fn launch_writer(&mut self, handle: WriterHandle) -> bool {
            self.handle = Some(handle);
            self.accept_launch
        }

        fn flush_writer(&mut self, handle: &WriterHandle) -> bool {
            if !self.accept_flush {
                return false;
            }
            self.writer.flush(handle);
            true
        }
    }

    fn first_sample(card: &MemCard, block: u32) -> u16 {
        let data = card.block(block).unwrap();
        u16::from_le_bytes([data[0], data[1]])
    }

    type TestPipeline = Pipeline<SimSource, SimClock, StepPlatform>;

    fn small_config() -> PipelineConfig {
        PipelineConfig {
            acquisition_samples: 256,
            buffer_capacity: 1024,
            dsp: DspConfig {
                decimation: 1,
                filter: FilterKind::Decimate,
                output_format: SampleFormat::U16,
                ..DspConfig::default()
            },
            ..PipelineConfig::default()
        }
    }

    fn pipeline(source: SimSource, config: PipelineConfig) -> TestPipeline {
        let clock = SimClock::new();
        let platform = StepPlatform::new(&clock);
        Pipeline::new(source, clock, platform, config).unwrap()
    }

    #[test]
    fn test_start_requires_idle() {
        let mut p = pipeline(SimSource::default(), small_config());
        p.start(0).unwrap();
        assert!(p.is_running());
        assert_eq!(p.platform().trigger, Some(30));
        assert_eq!(
            p.start(0),
            Err(PipelineError::InvalidState(PipelineState::Running))
        );
        assert_eq!(p.shared().pool().filling_count(), 1);
    }

    #[test]
    fn test_start_auto_initializes_dsp() {
        let mut p = pipeline(SimSource::default(), small_config());
        assert!(p.dsp().is_none());
        p.start(1).unwrap();
        assert_eq!(p.dsp().unwrap().config().filter, FilterKind::Decimate);
    }

    #[test]
    fn test_configure_only_while_idle() {
        let mut p = pipeline(SimSource::default(), small_config());
        p.configure(512, 2, 6_000_000, true).unwrap();
        assert_eq!(p.config().acquisition_samples, 512);
        assert_eq!(p.config().dsp.decimation, 2);
        assert!(p.config().continuous);

        p.start(0).unwrap();
        assert_eq!(
            p.configure(256, 1, 1, false),
            Err(PipelineError::InvalidState(PipelineState::Running))
        );
    }

    #[test]
    fn test_rejected_configuration_keeps_previous() {
        let mut p = pipeline(SimSource::default(), small_config());
        p.init().unwrap();
        assert_eq!(
            p.configure(256, 17, 1, false),
            Err(PipelineError::Config(ConfigError::Decimation(17)))
        );
        assert_eq!(p.config().dsp.decimation, 1);
        assert_eq!(p.dsp().unwrap().config().decimation, 1);
    }

    #[test]
    fn test_budget_run_writes_every_sample() {
        let mut p = pipeline(SimSource::new(Waveform::Ramp), small_config());
        p.start(10).unwrap();
        for _ in 0..10 {
            assert!(matches!(
                p.on_tick(),
                TickOutcome::Acquired {
                    bytes: 512,
                    substituted: false
                }
            ));
            p.platform_mut().pump();
        }
        assert_eq!(p.on_tick(), TickOutcome::BudgetExhausted);
        assert_eq!(p.state(), PipelineState::Stopping);
        assert_eq!(p.platform().trigger, None);
        assert_eq!(p.on_tick(), TickOutcome::Inactive);

        p.platform_mut().pump();
        p.stop();
        assert_eq!(p.state(), PipelineState::Idle);

        let stats = p.statistics();
        assert_eq!(stats.acquisitions, 10);
        assert_eq!(stats.samples_in, 2560);
        assert_eq!(stats.bytes_written, 5120);
        assert_eq!(stats.blocks_written, 10);
        assert_eq!(stats.dropped_buffers, 0);
        assert_eq!(stats.overruns, 0);

        let card = p.platform().card();
        for block in 0..10u32 {
            let data = card.block(block).unwrap();
            for (i, pair) in data.chunks_exact(2).enumerate() {
                let sample = block as usize * 256 + i;
                assert_eq!(u16::from_le_bytes([pair[0], pair[1]]), (sample & 0x0FFF) as u16);
            }
        }
    }

    #[test]
    fn test_timeout_substitutes_test_pattern() {
        let mut config = small_config();
        config.buffer_capacity = 4096;
        let mut p = pipeline(SimSource::stalled(), config);
        p.start(1).unwrap();

        assert_eq!(
            p.on_tick(),
            TickOutcome::Acquired {
                bytes: 512,
                substituted: true
            }
        );
        let stats = p.statistics();
        assert_eq!(stats.acquisition_timeouts, 1);
        assert_eq!(stats.overruns, 1);
        assert_eq!(stats.acquisitions, 1);

        assert_eq!(p.on_tick(), TickOutcome::BudgetExhausted);
        p.platform_mut().pump();
        p.stop();
        let data = p.platform().card().block(0).unwrap();
        let first = u16::from_le_bytes([data[0], data[1]]);
        let wrapped = u16::from_le_bytes([data[200], data[201]]);
        assert_eq!(first, 2048);
        assert_eq!(wrapped, 2048);
        assert_eq!(u16::from_le_bytes([data[198], data[199]]), 2147);
    }

    #[test]
    fn test_backpressure_faults_the_run() {
        let mut config = small_config();
        config.buffer_capacity = 512;
        config.swap_timeout_us = 50;
        let mut p = pipeline(SimSource::default(), config);
        p.start(0).unwrap();

        // Four slots fill with nobody writing; the fifth chunk cannot swap
        for _ in 0..POOL_SLOTS {
            assert!(matches!(p.on_tick(), TickOutcome::Acquired { .. }));
        }
        assert_eq!(p.on_tick(), TickOutcome::Faulted);
        assert_eq!(p.state(), PipelineState::Error);
        assert_eq!(p.platform().trigger, None);
        assert!(p.statistics().overruns > 0);
        assert_eq!(p.shared().pool().filling_count(), 0);
        assert_eq!(p.on_tick(), TickOutcome::Inactive);

        // stop keeps Error but still flushes; init clears it
        p.stop();
        assert_eq!(p.state(), PipelineState::Error);
        let stats = p.statistics();
        assert_eq!(stats.dropped_buffers, 0);
        assert_eq!(stats.bytes_written, 4 * 512);
        assert_eq!(stats.bytes_written, stats.bytes_buffered);
        assert!(p.shared().pool().all_free());
        assert_eq!(p.start(0), Err(PipelineError::InvalidState(PipelineState::Error)));
        p.init().unwrap();
        assert_eq!(p.state(), PipelineState::Idle);
        p.start(0).unwrap();
    }

    #[test]
    fn test_stop_flushes_undrained_buffers() {
        let mut p = pipeline(SimSource::new(Waveform::Ramp), small_config());
        p.start(0).unwrap();
        for _ in 0..3 {
            p.on_tick();
        }
        // Nobody pumps the writer, so the grace period runs out
        p.stop();
        assert_eq!(p.state(), PipelineState::Idle);
        let stats = p.statistics();
        assert_eq!(stats.bytes_buffered, 1536);
        assert_eq!(stats.bytes_written, stats.bytes_buffered);
        assert_eq!(stats.dropped_buffers, 0);
        assert_eq!(p.shared().next_block(), 3);
        let card = p.platform().card();
        for block in 0..3u32 {
            assert_eq!(first_sample(card, block), (block * 256) as u16);
        }
        assert!(p.shared().pool().views().iter().all(|v| v.status == SlotStatus::Free && v.capacity == 0));
    }

    #[test]
    fn test_stop_drops_only_without_storage() {
        let mut p = pipeline(SimSource::default(), small_config());
        p.start(0).unwrap();
        for _ in 0..3 {
            p.on_tick();
        }
        p.platform_mut().accept_flush = false;
        p.stop();
        assert_eq!(p.state(), PipelineState::Idle);
        let stats = p.statistics();
        assert_eq!(stats.dropped_buffers, 2);
        assert_eq!(stats.bytes_written, 0);
        assert!(p.shared().pool().all_free());
    }

    #[test]
    fn test_card_receives_buffers_in_fill_order() {
        let mut config = small_config();
        config.buffer_capacity = 512;
        let mut p = pipeline(SimSource::new(Waveform::Ramp), config);
        p.start(0).unwrap();

        // Slots 0..3 are Ready, slot 3 filling; storage then interleaves
        // with acquisition so the Ready slots wrap past index 0
        for _ in 0..4 {
            p.on_tick();
        }
        for _ in 0..2 {
            assert!(matches!(p.platform_mut().step(), WriterPoll::Wrote { .. }));
            assert!(matches!(p.on_tick(), TickOutcome::Acquired { .. }));
        }
        assert_eq!(p.platform_mut().step(), WriterPoll::Wrote { index: 2, blocks: 1 });
        assert_eq!(first_sample(p.platform().card(), 2), 512);

        p.stop();
        let stats = p.statistics();
        assert_eq!(stats.bytes_written, 6 * 512);
        assert_eq!(stats.dropped_buffers, 0);
        let card = p.platform().card();
        for block in 0..6u32 {
            assert_eq!(first_sample(card, block), (block * 256) as u16);
        }
    }

    #[test]
    fn test_stop_when_idle_is_noop() {
        let mut p = pipeline(SimSource::default(), small_config());
        p.stop();
        assert_eq!(p.state(), PipelineState::Idle);
    }

    #[test]
    fn test_writer_unavailable_fails_start() {
        let mut p = pipeline(SimSource::default(), small_config());
        p.platform_mut().accept_launch = false;
        assert_eq!(p.start(0), Err(PipelineError::WriterUnavailable));
        assert_eq!(p.state(), PipelineState::Error);
        assert!(!p.shared().writer_running());
        assert_eq!(p.platform().trigger, None);
    }

    #[test]
    fn test_allocation_failure_leaves_idle() {
        let mut config = small_config();
        config.buffer_capacity = (isize::MAX as usize / BLOCK_SIZE) * BLOCK_SIZE;
        let mut p = pipeline(SimSource::default(), config);
        assert!(matches!(p.start(0), Err(PipelineError::OutOfMemory(_))));
        assert_eq!(p.state(), PipelineState::Idle);
        assert!(p.shared().pool().views().iter().all(|v| v.capacity == 0));
        assert!(!p.shared().writer_running());
    }

    #[test]
    fn test_status_reports_buffers() {
        let mut p = pipeline(SimSource::default(), small_config());
        p.start(5).unwrap();
        p.on_tick();
        let status = p.status();
        assert_eq!(status.state, PipelineState::Running);
        assert_eq!(status.iterations, 1);
        assert_eq!(status.budget, Some(5));
        assert_eq!(status.buffers[0].status, SlotStatus::Filling);
        assert_eq!(status.buffers[0].used, 512);
        let text = std::format!("{}", status);
        assert!(text.contains("Iterations:  1 of 5"));
        assert!(text.contains("Buffer 0:"));
    }

    #[test]
    fn test_threaded_run_commits_all_data() {
        let clock = StdClock::new();
        let backend = StorageBackend::new(MemCard::new(8192), clock, StorageTiming::default());
        let platform = ThreadPlatform::new(StorageWriter::new(backend).unwrap());
        let mut config = small_config();
        config.buffer_capacity = 2048;
        config.swap_timeout_us = 1_000_000;
        config.stop_grace_us = 5_000_000;
        config.start_block = 64;
        let mut p = Pipeline::new(SimSource::new(Waveform::Ramp), clock, platform, config).unwrap();

        p.start(40).unwrap();
        while p.on_tick() != TickOutcome::BudgetExhausted {}
        p.stop();

        let stats = p.statistics();
        assert_eq!(stats.bytes_written, 40 * 512);
        assert_eq!(stats.dropped_buffers, 0);
        assert_eq!(stats.write_errors, 0);
        assert_eq!(p.shared().next_block(), 64 + 40);

        // The ramp is 12 bits wide and wraps every 4096 samples
        let (_, _, platform) = p.into_parts();
        let writer = platform.into_writer().unwrap();
        let card = writer.backend().link();
        for block in 0..40u32 {
            let data = card.block(64 + block).unwrap();
            for (i, pair) in data.chunks_exact(2).enumerate() {
                let index = block as usize * 256 + i;
                assert_eq!(u16::from_le_bytes([pair[0], pair[1]]), (index % 4096) as u16);
            }
        }
    }

    #[test]
    fn test_slow_storage_overruns_are_monotonic() {
        let clock = StdClock::new();
        let card = MemCard::with_faults(
            8192,
            crate::sim::CardFaults {
                write_delay_us: 3_000,
                ..Default::default()
            },
        );
        let backend = StorageBackend::new(card, clock, StorageTiming::default());
        let platform = ThreadPlatform::new(StorageWriter::new(backend).unwrap());
        let mut config = small_config();
        config.buffer_capacity = 512;
        config.swap_timeout_us = 2_000_000;
        config.stop_grace_us = 2_000_000;
        let mut p = Pipeline::new(SimSource::default(), clock, platform, config).unwrap();

        p.start(0).unwrap();
        let mut last = 0;
        for _ in 0..16 {
            assert!(matches!(p.on_tick(), TickOutcome::Acquired { .. }));
            let overruns = p.statistics().overruns;
            assert!(overruns >= last);
            last = overruns;
            assert!(p.shared().pool().filling_count() <= 1);
        }
        assert!(last > 0);
        p.stop();
        assert_eq!(p.state(), PipelineState::Idle);
        assert_eq!(p.statistics().write_errors, 0);
    }

    #[test]
    fn test_fill_levels_only_reset_between_cycles() {
        let clock = StdClock::new();
        let card = MemCard::with_faults(
            8192,
            crate::sim::CardFaults {
                write_delay_us: 2_000,
                ..Default::default()
            },
        );
        let backend = StorageBackend::new(card, clock, StorageTiming::default());
        let platform = ThreadPlatform::new(StorageWriter::new(backend).unwrap());
        let mut config = small_config();
        config.swap_timeout_us = 2_000_000;
        config.stop_grace_us = 2_000_000;
        let mut p = Pipeline::new(SimSource::default(), clock, platform, config).unwrap();

        p.start(0).unwrap();
        let mut previous = p.shared().pool().views();
        for _ in 0..24 {
            assert!(matches!(p.on_tick(), TickOutcome::Acquired { .. }));
            let views = p.shared().pool().views();
            for (slot, (before, now)) in previous.iter().zip(views.iter()).enumerate() {
                assert!(now.used <= now.capacity);
                // Within one write cycle a slot only grows; the reset to 0
                // happens when storage hands it back
                if now.cycles == before.cycles {
                    assert!(
                        now.used >= before.used,
                        "slot {} shrank from {} to {} in cycle {}",
                        slot,
                        before.used,
                        now.used,
                        now.cycles
                    );
                }
            }
            previous = views;
        }
        p.stop();
        let stats = p.statistics();
        assert!(stats.overruns > 0);
        assert_eq!(stats.bytes_written, stats.bytes_buffered);
    }
}
