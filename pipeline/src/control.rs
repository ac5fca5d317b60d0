//! # Control Surface
//!
//! Tagged command/reply messages for whatever front end drives a pipeline
//! (serial shell, USB, host harness), plus a single dispatch function.
//!
//! ## Wire Format
//!
//! Messages are encoded with `postcard`; a frame is at most
//! [`MAX_FRAME_SIZE`] bytes:
//!
//! ```text
//! ControlCommand ──► Pipeline::dispatch ──► ControlReply
//!   Init                                      Ok
//!   Configure { .. }                          Rejected(ErrorCode)
//!   Start { max_iterations }                  Status(StatusReport)
//!   Stop / Status / Statistics                Statistics(Statistics)
//! ```

use heapless::Vec;
use log::debug;
use serde::{Deserialize, Serialize};

use crate::config::PipelineConfig;
use crate::orchestrator::{Pipeline, PipelineError, StatusReport};
use crate::stats::Statistics;
use crate::timing::Clock;
use crate::traits::{AcquisitionSource, Platform};

/// Largest encoded message
pub const MAX_FRAME_SIZE: usize = 512;

/// An encoded message
pub type Frame = Vec<u8, MAX_FRAME_SIZE>;

/// Requests accepted by [`Pipeline::dispatch`]
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ControlCommand {
    Init,
    Configure {
        acquisition_samples: u16,
        decimation: u16,
        target_rate: u32,
        continuous: bool,
    },
    /// Replace the whole configuration
    Load(PipelineConfig),
    /// 0 runs until `Stop`
    Start { max_iterations: u32 },
    Stop,
    Status,
    Statistics,
}

/// Reason a command was refused
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u8)]
pub enum ErrorCode {
    InvalidState = 1,
    InvalidConfig = 2,
    OutOfMemory = 3,
    WriterUnavailable = 4,
    TriggerUnavailable = 5,
    Internal = 6,
}

impl TryFrom<u8> for ErrorCode {
    type Error = ();

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(Self::InvalidState),
            2 => Ok(Self::InvalidConfig),
            3 => Ok(Self::OutOfMemory),
            4 => Ok(Self::WriterUnavailable),
            5 => Ok(Self::TriggerUnavailable),
            6 => Ok(Self::Internal),
            _ => Err(()),
        }
    }
}

impl From<&PipelineError> for ErrorCode {
    fn from(e: &PipelineError) -> Self {
        match e {
            PipelineError::InvalidState(_) => ErrorCode::InvalidState,
            PipelineError::Config(_) => ErrorCode::InvalidConfig,
            PipelineError::OutOfMemory(_) => ErrorCode::OutOfMemory,
            PipelineError::WriterUnavailable => ErrorCode::WriterUnavailable,
            PipelineError::TriggerUnavailable => ErrorCode::TriggerUnavailable,
            PipelineError::Pool(_) | PipelineError::Dsp(_) => ErrorCode::Internal,
        }
    }
}

/// Answers produced by [`Pipeline::dispatch`]
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ControlReply {
    Ok,
    Rejected(ErrorCode),
    Status(StatusReport),
    Statistics(Statistics),
}

impl ControlCommand {
    pub fn serialize<'a>(&self, buffer: &'a mut [u8]) -> Result<&'a [u8], postcard::Error> {
        postcard::to_slice(self, buffer).map(|bytes| &*bytes)
    }

    pub fn deserialize(data: &[u8]) -> Result<Self, postcard::Error> {
        postcard::from_bytes(data)
    }

    pub fn to_frame(&self) -> Result<Frame, postcard::Error> {
        encode_frame(self)
    }
}

impl ControlReply {
    pub fn serialize<'a>(&self, buffer: &'a mut [u8]) -> Result<&'a [u8], postcard::Error> {
        postcard::to_slice(self, buffer).map(|bytes| &*bytes)
    }

    pub fn deserialize(data: &[u8]) -> Result<Self, postcard::Error> {
        postcard::from_bytes(data)
    }

    pub fn to_frame(&self) -> Result<Frame, postcard::Error> {
        encode_frame(self)
    }
}

fn encode_frame<T: Serialize>(message: &T) -> Result<Frame, postcard::Error> {
    let mut buffer = [0u8; MAX_FRAME_SIZE];
    let bytes = postcard::to_slice(message, &mut buffer)?;
    Frame::from_slice(bytes).map_err(|_| postcard::Error::SerializeBufferFull)
}

impl<S, C, P> Pipeline<S, C, P>
where
    S: AcquisitionSource,
    C: Clock,
    P: Platform,
{
    /// Execute one control command
    pub fn dispatch(&mut self, command: ControlCommand) -> ControlReply {
        debug!("control: {:?}", command);
        let result = match command {
            ControlCommand::Init => self.init(),
            ControlCommand::Configure {
                acquisition_samples,
                decimation,
                target_rate,
                continuous,
            } => self.configure(acquisition_samples, decimation, target_rate, continuous),
            ControlCommand::Load(config) => self.set_config(config),
            ControlCommand::Start { max_iterations } => self.start(max_iterations),
            ControlCommand::Stop => {
                self.stop();
                Ok(())
            }
            ControlCommand::Status => return ControlReply::Status(self.status()),
            ControlCommand::Statistics => return ControlReply::Statistics(self.statistics()),
        };
        match result {
            Ok(()) => ControlReply::Ok,
            Err(e) => ControlReply::Rejected(ErrorCode::from(&e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::PipelineState;
    use crate::sim::{MemCard, SimClock, SimSource, ThreadPlatform};
    use crate::storage::{StorageBackend, StorageTiming};
    use crate::writer::StorageWriter;

    fn pipeline() -> Pipeline<SimSource, SimClock, ThreadPlatform<MemCard, SimClock>> {
        let clock = SimClock::new();
        let backend = StorageBackend::new(MemCard::new(64), clock.clone(), StorageTiming::default());
        let platform = ThreadPlatform::new(StorageWriter::new(backend).unwrap());
        Pipeline::new(SimSource::default(), clock, platform, PipelineConfig::default()).unwrap()
    }

    #[test]
    fn test_command_frame_round_trip() {
        let command = ControlCommand::Configure {
            acquisition_samples: 1800,
            decimation: 8,
            target_rate: 6_000_000,
            continuous: true,
        };
        let frame = command.to_frame().unwrap();
        assert_eq!(ControlCommand::deserialize(&frame).unwrap(), command);
    }

    #[test]
    fn test_status_reply_fits_a_frame() {
        let p = pipeline();
        let reply = ControlReply::Status(p.status());
        let mut buffer = [0u8; MAX_FRAME_SIZE];
        let bytes = reply.serialize(&mut buffer).unwrap();
        assert_eq!(ControlReply::deserialize(bytes).unwrap(), reply);
    }

    #[test]
    fn test_dispatch_rejects_bad_configuration() {
        let mut p = pipeline();
        let reply = p.dispatch(ControlCommand::Configure {
            acquisition_samples: 3600,
            decimation: 0,
            target_rate: 1,
            continuous: false,
        });
        assert_eq!(reply, ControlReply::Rejected(ErrorCode::InvalidConfig));
        assert_eq!(p.config().dsp.decimation, 4);
    }

    #[test]
    fn test_dispatch_lifecycle() {
        let mut p = pipeline();
        assert_eq!(p.dispatch(ControlCommand::Init), ControlReply::Ok);
        assert_eq!(
            p.dispatch(ControlCommand::Start { max_iterations: 0 }),
            ControlReply::Ok
        );
        assert_eq!(
            p.dispatch(ControlCommand::Start { max_iterations: 0 }),
            ControlReply::Rejected(ErrorCode::InvalidState)
        );
        match p.dispatch(ControlCommand::Status) {
            ControlReply::Status(status) => assert_eq!(status.state, PipelineState::Running),
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(p.dispatch(ControlCommand::Stop), ControlReply::Ok);
        assert!(matches!(
            p.dispatch(ControlCommand::Statistics),
            ControlReply::Statistics(_)
        ));
        assert_eq!(p.state(), PipelineState::Idle);
    }

    #[test]
    fn test_error_code_conversion() {
        assert_eq!(ErrorCode::try_from(3), Ok(ErrorCode::OutOfMemory));
        assert!(ErrorCode::try_from(0).is_err());
    }
}
