//! # Pipeline Runner
//!
//! Drives a complete acquisition session on the host:
//!
//! ```text
//! ┌──────────────────────────────┐        ┌──────────────────────────┐
//! │ tokio current-thread runtime │        │ "storage-writer" thread  │
//! │                              │        │                          │
//! │ interval ──► on_tick()       │  pool  │ StorageWriter::run       │
//! │ ctrl_c / deadline            │ ◄────► │  StorageBackend<MemCard> │
//! └──────────────┬───────────────┘        └──────────────────────────┘
//!                ▼
//!   spawn_blocking ──► stop() (grace period, then flush)
//! ```
//!
//! Host timers cannot reach the firmware trigger period, so the tick loop
//! runs at [`RunnerConfig::tick_us`] instead.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

use adc_pipeline::config::BLOCK_SIZE;
use adc_pipeline::sim::{CardFaults, MemCard, SimSource, StdClock, ThreadPlatform, Waveform};
use adc_pipeline::{
    Pipeline, PipelineConfig, PipelineError, PipelineState, Session, Statistics, StatusReport,
    StorageBackend, StorageError, StorageWriter, TickOutcome,
};
use log::{info, warn};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::time::{self, Instant, MissedTickBehavior};

/// Everything a session needs, loadable from JSON
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RunnerConfig {
    pub pipeline: PipelineConfig,
    /// Iteration budget passed to `start`; 0 runs until the deadline
    pub max_iterations: u32,
    /// Wall-clock limit of the session; 0 means none
    pub duration_ms: u64,
    /// Period of the host tick loop
    pub tick_us: u64,
    /// Simulated card size
    pub card_blocks: u32,
    pub faults: CardFaults,
    pub waveform: Waveform,
    /// Raw dump of the blocks written by the session
    pub image_path: Option<PathBuf>,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            pipeline: PipelineConfig::default(),
            max_iterations: 1_000,
            duration_ms: 10_000,
            tick_us: 1_000,
            card_blocks: 1 << 16,
            faults: CardFaults::default(),
            waveform: Waveform::default(),
            image_path: None,
        }
    }
}

impl RunnerConfig {
    pub fn load(path: &Path) -> Result<Self, RunnerError> {
        let file = File::open(path)?;
        Ok(serde_json::from_reader(file)?)
    }
}

/// Errors that end a session early
#[derive(Error, Debug)]
pub enum RunnerError {
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("pipeline error: {0}")]
    Pipeline(#[from] PipelineError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("storage writer lost")]
    WriterLost,

    #[error("stop task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

/// Why the tick loop stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionEnd {
    BudgetExhausted,
    Deadline,
    Interrupted,
    Faulted,
}

/// Result of one session, printed as JSON by the binary
#[derive(Debug, Clone, Serialize)]
pub struct SessionReport {
    pub version: &'static str,
    pub end: SessionEnd,
    pub session: Session,
    pub status: StatusReport,
    pub statistics: Statistics,
    pub blocks_on_card: usize,
    pub image_path: Option<PathBuf>,
}

type HostPipeline = Pipeline<SimSource, StdClock, ThreadPlatform<MemCard, StdClock>>;

/// Bring up the card, run one session and tear everything down
pub async fn run_session(config: &RunnerConfig) -> Result<SessionReport, RunnerError> {
    let clock = StdClock::new();
    let card = MemCard::with_faults(config.card_blocks, config.faults);
    let backend = StorageBackend::new(card, clock, config.pipeline.storage);
    let writer = StorageWriter::new(backend)?;
    let session = *writer.backend().session();
    info!(
        "card ready: rca {:#06x}, {} capacity",
        session.rca,
        if session.high_capacity { "high" } else { "standard" }
    );

    let mut pipeline: HostPipeline = Pipeline::new(
        SimSource::new(config.waveform),
        clock,
        ThreadPlatform::new(writer),
        config.pipeline,
    )?;
    pipeline.init()?;
    pipeline.start(config.max_iterations)?;

    let end = tick_loop(&mut pipeline, config).await;
    info!("session ended: {:?}", end);

    // Stop waits out the grace period and may flush on this thread
    let pipeline = tokio::task::spawn_blocking(move || {
        pipeline.stop();
        pipeline
    })
    .await?;
    let status = pipeline.status();
    let statistics = pipeline.statistics();
    if status.state == PipelineState::Error {
        warn!("pipeline finished in error state");
    }

    let (_, _, platform) = pipeline.into_parts();
    let card = platform
        .into_writer()
        .ok_or(RunnerError::WriterLost)?
        .into_backend()
        .into_link();

    if let Some(path) = &config.image_path {
        write_image(&card, path, config.pipeline.start_block, status.next_block)?;
        info!("card image written to {}", path.display());
    }

    Ok(SessionReport {
        version: adc_pipeline::VERSION,
        end,
        session,
        status,
        statistics,
        blocks_on_card: card.written_blocks(),
        image_path: config.image_path.clone(),
    })
}

async fn tick_loop(pipeline: &mut HostPipeline, config: &RunnerConfig) -> SessionEnd {
    let mut ticker = time::interval(Duration::from_micros(config.tick_us.max(1)));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    let limited = config.duration_ms > 0;
    let deadline = time::sleep_until(Instant::now() + Duration::from_millis(config.duration_ms));
    tokio::pin!(deadline);
    let interrupt = tokio::signal::ctrl_c();
    tokio::pin!(interrupt);

    loop {
        tokio::select! {
            _ = ticker.tick() => match pipeline.on_tick() {
                TickOutcome::BudgetExhausted => return SessionEnd::BudgetExhausted,
                TickOutcome::Faulted => return SessionEnd::Faulted,
                TickOutcome::Inactive => {
                    if pipeline.state() == PipelineState::Error {
                        return SessionEnd::Faulted;
                    }
                    return SessionEnd::BudgetExhausted;
                }
                TickOutcome::Acquired { .. } | TickOutcome::Skipped => {}
            },
            _ = &mut deadline, if limited => return SessionEnd::Deadline,
            _ = &mut interrupt => return SessionEnd::Interrupted,
        }
    }
}

/// Dump blocks `first..end` as a flat file; unwritten blocks read as zeros
fn write_image(card: &MemCard, path: &Path, first: u32, end: u32) -> Result<(), RunnerError> {
    let mut out = BufWriter::new(File::create(path)?);
    for block in first..end {
        let data = card.block(block).unwrap_or([0u8; BLOCK_SIZE]);
        out.write_all(&data)?;
    }
    out.flush()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn quick_config() -> RunnerConfig {
        let mut config = RunnerConfig {
            max_iterations: 20,
            duration_ms: 5_000,
            tick_us: 500,
            card_blocks: 4096,
            ..RunnerConfig::default()
        };
        config.pipeline.buffer_capacity = 8 * 1024;
        config.pipeline.stop_grace_us = 1_000_000;
        config
    }

    #[tokio::test]
    async fn test_bounded_session_stores_everything() {
        let report = run_session(&quick_config()).await.unwrap();
        assert_eq!(report.end, SessionEnd::BudgetExhausted);
        assert_eq!(report.status.state, PipelineState::Idle);
        assert_eq!(report.statistics.acquisitions, 20);
        assert_eq!(report.statistics.dropped_buffers, 0);
        assert_eq!(report.statistics.bytes_written, report.statistics.bytes_buffered);
        assert!(report.blocks_on_card > 0);
        assert!(report.session.initialized);
    }

    #[tokio::test]
    async fn test_deadline_ends_unbounded_session() {
        let mut config = quick_config();
        config.max_iterations = 0;
        config.duration_ms = 30;
        let report = run_session(&config).await.unwrap();
        assert_eq!(report.end, SessionEnd::Deadline);
        assert!(report.statistics.acquisitions > 0);
    }

    #[tokio::test]
    async fn test_dead_card_fails_bring_up() {
        let mut config = quick_config();
        config.faults.never_ready = true;
        config.pipeline.storage.op_cond_attempts = 5;
        let result = run_session(&config).await;
        assert!(matches!(result, Err(RunnerError::Storage(_))));
    }

    #[tokio::test]
    async fn test_invalid_pipeline_config() {
        let mut config = quick_config();
        config.pipeline.buffer_capacity = 1000;
        let result = run_session(&config).await;
        assert!(matches!(result, Err(RunnerError::Pipeline(PipelineError::Config(_)))));
    }

    #[tokio::test]
    async fn test_image_covers_written_range() {
        let mut config = quick_config();
        config.pipeline.start_block = 8;
        let path = std::env::temp_dir().join(format!("pipeline-runner-{}.img", std::process::id()));
        config.image_path = Some(path.clone());

        let report = run_session(&config).await.unwrap();
        let image = std::fs::read(&path).unwrap();
        std::fs::remove_file(&path).ok();
        let blocks = (report.status.next_block - 8) as usize;
        assert_eq!(image.len(), blocks * 512);
        assert_eq!(blocks as u32, report.statistics.blocks_written);
    }

    #[tokio::test]
    async fn test_slow_card_is_flushed_off_the_runtime() {
        let mut config = quick_config();
        config.max_iterations = 0;
        config.duration_ms = 20;
        config.pipeline.buffer_capacity = 4 * 1024;
        config.pipeline.swap_timeout_us = 5_000_000;
        config.pipeline.stop_grace_us = 1_000;
        config.faults.write_delay_us = 2_000;

        let report = run_session(&config).await.unwrap();
        assert_eq!(report.end, SessionEnd::Deadline);
        assert_eq!(report.status.state, PipelineState::Idle);
        assert_eq!(report.statistics.dropped_buffers, 0);
        assert_eq!(report.statistics.bytes_written, report.statistics.bytes_buffered);
    }

    #[test]
    fn test_config_from_partial_json() {
        let config: RunnerConfig =
            serde_json::from_str(r#"{ "max_iterations": 5, "pipeline": { "start_block": 100 } }"#)
                .unwrap();
        assert_eq!(config.max_iterations, 5);
        assert_eq!(config.pipeline.start_block, 100);
        assert_eq!(config.pipeline.acquisition_samples, 3600);
        assert_eq!(config.tick_us, 1_000);
    }
}
