//! # Storage Backend
//!
//! SD native-protocol driver over a [`CardLink`]: bring-up, command/response
//! exchange and single/multi-block transfers. Raw sequential blocks only, no
//! file system.
//!
//! ## Bring-Up
//!
//! ```text
//! set_clock(400 kHz)
//!   CMD0   reset            retried, first silence tolerated
//!   CMD8   interface cond.  silence => version 1 card
//!   CMD55+ACMD41            polled until OCR ready bit
//!   CMD2   CID
//!   CMD3   relative address -> Session::rca
//!   CMD7   select(rca)
//!   CMD16  block length 512
//! set_clock(25 MHz), Session::initialized = true
//! ```
//!
//! Every wait is bounded by [`StorageTiming`]; an exceeded bound fails that
//! operation and is reported, never retried here.

use embedded_io::Error as _;
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::{
    BLOCK_SIZE, BUSY_TIMEOUT_US, DATA_TIMEOUT_US, FAST_CLOCK_HZ, INIT_CLOCK_HZ, OP_COND_ATTEMPTS,
    OP_COND_RETRY_DELAY_US, RESET_ATTEMPTS, RESET_RETRY_DELAY_US, RESPONSE_TIMEOUT_US,
    STORAGE_POLL_US, TRANSFER_TIMEOUT_US,
};
use crate::timing::{poll_until, Clock, WaitError};
use crate::traits::CardLink;

pub mod command;
pub mod crc;

use command::{
    CardStatus, Command, CommandFrame, FrameError, Response, ResponseKind, BUSY_BYTE,
    DATA_ACCEPTED, DATA_RESPONSE_MASK, DATA_START_TOKEN, IDLE_BYTE, IF_COND_ARG,
    IF_COND_ECHO_MASK, OCR_CCS, OCR_HCS, OCR_READY, OCR_VOLTAGE_WINDOW,
};

/// Card clock regime
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ClockMode {
    Identification,
    HighSpeed,
}

/// Physical layer generation, decided by the CMD8 probe
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum CardVersion {
    V1,
    V2,
}

/// Ordered bring-up steps, used to report where bring-up stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum BringUpStep {
    Reset,
    InterfaceCondition,
    OperatingCondition,
    Identification,
    RelativeAddress,
    Select,
    BlockLength,
    HighSpeed,
}

/// State of the card session, mutated only by the backend
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Session {
    /// Relative card address from CMD3
    pub rca: u16,
    pub clock_mode: ClockMode,
    pub block_size: u16,
    pub initialized: bool,
    /// Block addressed (SDHC/SDXC) rather than byte addressed
    pub high_capacity: bool,
    pub version: CardVersion,
    pub cid: [u8; 16],
}

impl Default for Session {
    fn default() -> Self {
        Self {
            rca: 0,
            clock_mode: ClockMode::Identification,
            block_size: BLOCK_SIZE as u16,
            initialized: false,
            high_capacity: false,
            version: CardVersion::V1,
            cid: [0; 16],
        }
    }
}

/// Timeouts and retry bounds of the protocol
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[serde(default)]
pub struct StorageTiming {
    pub response_timeout_us: u64,
    pub data_timeout_us: u64,
    pub busy_timeout_us: u64,
    pub transfer_timeout_us: u64,
    pub poll_us: u32,
    pub reset_attempts: u8,
    pub reset_retry_delay_us: u32,
    pub op_cond_attempts: u16,
    pub op_cond_retry_delay_us: u32,
    pub init_clock_hz: u32,
    pub fast_clock_hz: u32,
}

impl Default for StorageTiming {
    fn default() -> Self {
        Self {
            response_timeout_us: RESPONSE_TIMEOUT_US,
            data_timeout_us: DATA_TIMEOUT_US,
            busy_timeout_us: BUSY_TIMEOUT_US,
            transfer_timeout_us: TRANSFER_TIMEOUT_US,
            poll_us: STORAGE_POLL_US,
            reset_attempts: RESET_ATTEMPTS,
            reset_retry_delay_us: RESET_RETRY_DELAY_US,
            op_cond_attempts: OP_COND_ATTEMPTS,
            op_cond_retry_delay_us: OP_COND_RETRY_DELAY_US,
            init_clock_hz: INIT_CLOCK_HZ,
            fast_clock_hz: FAST_CLOCK_HZ,
        }
    }
}

/// Storage protocol failures
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum StorageError {
    #[error("link error: {0:?}")]
    Link(embedded_io::ErrorKind),
    #[error("no response to CMD{command}")]
    ResponseTimeout { command: u8 },
    #[error("response CRC mismatch for CMD{command}")]
    ResponseCrc { command: u8 },
    #[error("malformed response to CMD{command}")]
    ResponseFraming { command: u8 },
    #[error("CMD{command} answered by CMD{got}")]
    UnexpectedResponse { command: u8, got: u8 },
    #[error("CMD{command} failed, card status {status:#010x}")]
    CardStatus { command: u8, status: u32 },
    #[error("card did not accept the application command prefix")]
    NotAppCommand,
    #[error("interface condition echo {echo:#x} does not match")]
    CheckPattern { echo: u32 },
    #[error("no data token from card")]
    DataTimeout,
    #[error("card busy past deadline")]
    BusyTimeout,
    #[error("transfer offload did not complete")]
    TransferTimeout,
    #[error("data rejected, token {token:#04x}")]
    DataRejected { token: u8 },
    #[error("data CRC {actual:#06x}, expected {expected:#06x}")]
    DataCrc { expected: u16, actual: u16 },
    #[error("bring-up failed at {step:?}")]
    BringUp { step: BringUpStep },
    #[error("card not initialized")]
    NotInitialized,
    #[error("block {block} not addressable")]
    AddressOutOfRange { block: u32 },
    #[error("length {len} is not a non-zero multiple of the block size")]
    InvalidLength { len: usize },
}

fn link_error<E: embedded_io::Error>(e: E) -> StorageError {
    StorageError::Link(e.kind())
}

/// Next byte on the line, if one is available without waiting
fn next_byte<L: CardLink>(link: &mut L) -> Result<Option<u8>, StorageError> {
    if !link.read_ready().map_err(link_error)? {
        return Ok(None);
    }
    let mut byte = [0u8; 1];
    match link.read(&mut byte).map_err(link_error)? {
        0 => Ok(None),
        _ => Ok(Some(byte[0])),
    }
}

/// Wait for a byte accepted by `accept`, skipping the others
fn wait_byte<L, C, F>(
    link: &mut L,
    clock: &C,
    timeout_us: u64,
    poll_us: u32,
    timed_out: StorageError,
    mut accept: F,
) -> Result<u8, StorageError>
where
    L: CardLink,
    C: Clock,
    F: FnMut(u8) -> bool,
{
    poll_until(clock, timeout_us, poll_us, || {
        Ok(next_byte(link)?.filter(|&b| accept(b)))
    })
    .map_err(|e| match e {
        WaitError::TimedOut => timed_out,
        WaitError::Failed(e) => e,
    })
}

/// Fill `out` from the line within `timeout_us`
fn read_exact<L: CardLink, C: Clock>(
    link: &mut L,
    clock: &C,
    timeout_us: u64,
    poll_us: u32,
    timed_out: StorageError,
    out: &mut [u8],
) -> Result<(), StorageError> {
    let mut filled = 0;
    poll_until(clock, timeout_us, poll_us, || {
        while filled < out.len() {
            if !link.read_ready().map_err(link_error)? {
                return Ok(None);
            }
            match link.read(&mut out[filled..]).map_err(link_error)? {
                0 => return Ok(None),
                n => filled += n,
            }
        }
        Ok(Some(()))
    })
    .map_err(|e| match e {
        WaitError::TimedOut => timed_out,
        WaitError::Failed(e) => e,
    })
}

/// SD card driver owning its link and session
pub struct StorageBackend<L, C> {
    link: L,
    clock: C,
    timing: StorageTiming,
    session: Session,
}

impl<L: CardLink, C: Clock> StorageBackend<L, C> {
    pub fn new(link: L, clock: C, timing: StorageTiming) -> Self {
        Self {
            link,
            clock,
            timing,
            session: Session::default(),
        }
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn clock(&self) -> &C {
        &self.clock
    }

    pub fn timing(&self) -> &StorageTiming {
        &self.timing
    }

    pub fn link(&self) -> &L {
        &self.link
    }

    pub fn link_mut(&mut self) -> &mut L {
        &mut self.link
    }

    pub fn into_link(self) -> L {
        self.link
    }

    /// Take the card from power-on to ready-for-block-I/O.
    ///
    /// Any failed step fails the whole sequence and leaves the session
    /// uninitialized.
    pub fn bring_up(&mut self) -> Result<&Session, StorageError> {
        self.session = Session::default();
        let timing = self.timing;
        self.link
            .set_clock(timing.init_clock_hz)
            .map_err(|e| step_failed(BringUpStep::Reset, link_error(e)))?;

        // 1. Reset; a card still powering up may ignore the first attempts
        let mut attempt = 1;
        loop {
            match self.send_command(Command::GoIdleState, 0) {
                Ok(_) => break,
                Err(e) if attempt < timing.reset_attempts => {
                    debug!("CMD0 attempt {} failed: {}", attempt, e);
                    attempt += 1;
                    self.clock.sleep_us(timing.reset_retry_delay_us);
                }
                Err(e) => return Err(step_failed(BringUpStep::Reset, e)),
            }
        }

        // 2. Interface condition; only version 2 cards answer
        let version = match self.send_command(Command::SendIfCond, IF_COND_ARG) {
            Ok(Response::IfCond(echo)) if echo & IF_COND_ECHO_MASK == IF_COND_ARG => {
                CardVersion::V2
            }
            Ok(Response::IfCond(echo)) => {
                return Err(step_failed(
                    BringUpStep::InterfaceCondition,
                    StorageError::CheckPattern { echo },
                ))
            }
            Ok(_) => {
                return Err(step_failed(
                    BringUpStep::InterfaceCondition,
                    StorageError::ResponseFraming { command: 8 },
                ))
            }
            Err(e) => {
                info!("CMD8 not answered ({}), treating card as version 1", e);
                CardVersion::V1
            }
        };
        self.session.version = version;

        // 3. Operating condition
        let mut argument = OCR_VOLTAGE_WINDOW;
        if version == CardVersion::V2 {
            argument |= OCR_HCS;
        }
        let mut ocr = None;
        for _ in 0..timing.op_cond_attempts {
            match self.send_app_command(Command::SdSendOpCond, argument) {
                Ok(Response::Ocr(value)) if value & OCR_READY != 0 => {
                    ocr = Some(value);
                    break;
                }
                Ok(_) => self.clock.sleep_us(timing.op_cond_retry_delay_us),
                Err(e) => return Err(step_failed(BringUpStep::OperatingCondition, e)),
            }
        }
        let ocr = ocr.ok_or_else(|| {
            step_failed(
                BringUpStep::OperatingCondition,
                StorageError::ResponseTimeout { command: 41 },
            )
        })?;
        self.session.high_capacity = version == CardVersion::V2 && ocr & OCR_CCS != 0;

        // 4. Identification
        match self.send_command(Command::AllSendCid, 0) {
            Ok(Response::Cid(cid)) => self.session.cid = cid,
            Ok(_) => {
                return Err(step_failed(
                    BringUpStep::Identification,
                    StorageError::ResponseFraming { command: 2 },
                ))
            }
            Err(e) => return Err(step_failed(BringUpStep::Identification, e)),
        }

        // 5. Relative address
        match self.send_command(Command::SendRelativeAddr, 0) {
            Ok(Response::RelativeAddr { rca, .. }) => self.session.rca = rca,
            Ok(_) => {
                return Err(step_failed(
                    BringUpStep::RelativeAddress,
                    StorageError::ResponseFraming { command: 3 },
                ))
            }
            Err(e) => return Err(step_failed(BringUpStep::RelativeAddress, e)),
        }

        // 6. Select
        let rca_arg = (self.session.rca as u32) << 16;
        self.send_command(Command::SelectCard, rca_arg)
            .map_err(|e| step_failed(BringUpStep::Select, e))?;

        // 7. Block length
        self.send_command(Command::SetBlockLen, BLOCK_SIZE as u32)
            .map_err(|e| step_failed(BringUpStep::BlockLength, e))?;

        // 8. High speed
        self.link
            .set_clock(timing.fast_clock_hz)
            .map_err(|e| step_failed(BringUpStep::HighSpeed, link_error(e)))?;
        self.session.clock_mode = ClockMode::HighSpeed;
        self.session.initialized = true;

        info!(
            "SD card ready: rca={:#06x} {:?} {}",
            self.session.rca,
            self.session.version,
            if self.session.high_capacity { "SDHC" } else { "SDSC" }
        );
        Ok(&self.session)
    }

    /// Send one command and return its checked response
    pub fn send_command(&mut self, command: Command, argument: u32) -> Result<Response, StorageError> {
        let index = command.index();
        let frame = CommandFrame::new(command, argument);
        self.link.write_all(frame.as_bytes()).map_err(link_error)?;
        self.link.flush().map_err(link_error)?;

        let kind = command.response();
        let len = kind.wire_len();
        let mut raw = [0u8; 17];
        let timeout = self.timing.response_timeout_us;
        let poll = self.timing.poll_us;
        raw[0] = wait_byte(
            &mut self.link,
            &self.clock,
            timeout,
            poll,
            StorageError::ResponseTimeout { command: index },
            |b| b & 0x80 == 0,
        )?;
        read_exact(
            &mut self.link,
            &self.clock,
            timeout,
            poll,
            StorageError::ResponseTimeout { command: index },
            &mut raw[1..len],
        )?;

        let response = Response::parse(kind, index, &raw[..len]).map_err(|e| match e {
            FrameError::Crc => StorageError::ResponseCrc { command: index },
            FrameError::Index { got, .. } => StorageError::UnexpectedResponse { command: index, got },
            FrameError::Framing => StorageError::ResponseFraming { command: index },
        })?;

        let status = match response {
            Response::Status(status) | Response::RelativeAddr { status, .. } => Some(status),
            _ => None,
        };
        if let Some(status) = status.filter(|s| s.errors() != 0) {
            return Err(StorageError::CardStatus {
                command: index,
                status: status.0,
            });
        }
        if kind == ResponseKind::R1b {
            self.wait_not_busy()?;
        }
        Ok(response)
    }

    /// Send an application command behind its CMD55 prefix
    pub fn send_app_command(&mut self, command: Command, argument: u32) -> Result<Response, StorageError> {
        let prefix = (self.session.rca as u32) << 16;
        match self.send_command(Command::AppCmd, prefix)? {
            Response::Status(status) if status.is_app_cmd() => {}
            _ => return Err(StorageError::NotAppCommand),
        }
        self.send_command(command, argument)
    }

    /// Write one block at `block`
    pub fn write_block(&mut self, block: u32, data: &[u8; BLOCK_SIZE]) -> Result<(), StorageError> {
        let argument = self.block_argument(block)?;
        self.send_command(Command::WriteBlock, argument)?;
        self.send_data_block(data)
    }

    /// Write consecutive blocks starting at `start` with one CMD25 ... CMD12
    /// transaction. Returns the number of blocks written.
    pub fn write_blocks(&mut self, start: u32, data: &[u8]) -> Result<u32, StorageError> {
        if data.is_empty() || data.len() % BLOCK_SIZE != 0 {
            return Err(StorageError::InvalidLength { len: data.len() });
        }
        let count = (data.len() / BLOCK_SIZE) as u32;
        let argument = self.range_argument(start, count)?;
        self.send_command(Command::WriteMultipleBlock, argument)?;

        for (i, block) in data.chunks_exact(BLOCK_SIZE).enumerate() {
            if let Err(e) = self.send_data_block(block) {
                warn!("multi-block write stopped at block {}: {}", start + i as u32, e);
                // Leave the card in transfer state; the original error wins
                let _ = self.send_command(Command::StopTransmission, 0);
                return Err(e);
            }
        }
        self.send_command(Command::StopTransmission, 0)?;
        Ok(count)
    }

    /// Read one block at `block`, verifying its CRC16
    pub fn read_block(&mut self, block: u32, out: &mut [u8; BLOCK_SIZE]) -> Result<(), StorageError> {
        let argument = self.block_argument(block)?;
        self.send_command(Command::ReadSingleBlock, argument)?;
        self.receive_data_block(out)
    }

    /// Read consecutive blocks into `out` with one CMD18 ... CMD12 transaction
    pub fn read_blocks(&mut self, start: u32, out: &mut [u8]) -> Result<u32, StorageError> {
        if out.is_empty() || out.len() % BLOCK_SIZE != 0 {
            return Err(StorageError::InvalidLength { len: out.len() });
        }
        let argument = self.range_argument(start, (out.len() / BLOCK_SIZE) as u32)?;
        self.send_command(Command::ReadMultipleBlock, argument)?;

        let mut result = Ok(());
        for block in out.chunks_exact_mut(BLOCK_SIZE) {
            result = self.receive_data_block(block);
            if result.is_err() {
                break;
            }
        }
        let stopped = self.send_command(Command::StopTransmission, 0);
        result?;
        stopped?;
        Ok((out.len() / BLOCK_SIZE) as u32)
    }

    fn block_argument(&self, block: u32) -> Result<u32, StorageError> {
        if !self.session.initialized {
            return Err(StorageError::NotInitialized);
        }
        if self.session.high_capacity {
            return Ok(block);
        }
        block
            .checked_mul(BLOCK_SIZE as u32)
            .ok_or(StorageError::AddressOutOfRange { block })
    }

    /// Argument of the first of `count` blocks; every block of the range
    /// must be addressable
    fn range_argument(&self, start: u32, count: u32) -> Result<u32, StorageError> {
        let last = start
            .checked_add(count - 1)
            .ok_or(StorageError::AddressOutOfRange { block: start })?;
        self.block_argument(last)?;
        self.block_argument(start)
    }

    /// Start token, payload through the offload path, CRC16 trailer, then
    /// the card's data response and busy period
    fn send_data_block(&mut self, data: &[u8]) -> Result<(), StorageError> {
        let timing = self.timing;
        self.link.write_all(&[DATA_START_TOKEN]).map_err(link_error)?;
        self.link.start_offload(data).map_err(link_error)?;

        let link = &mut self.link;
        poll_until(&self.clock, timing.transfer_timeout_us, timing.poll_us, || {
            link.offload_busy()
                .map(|busy| (!busy).then_some(()))
                .map_err(link_error)
        })
        .map_err(|e| match e {
            WaitError::TimedOut => StorageError::TransferTimeout,
            WaitError::Failed(e) => e,
        })?;

        self.link
            .write_all(&crc::crc16(data).to_be_bytes())
            .map_err(link_error)?;
        self.link.flush().map_err(link_error)?;

        let token = wait_byte(
            &mut self.link,
            &self.clock,
            timing.data_timeout_us,
            timing.poll_us,
            StorageError::DataTimeout,
            |b| b != IDLE_BYTE,
        )?;
        if token & DATA_RESPONSE_MASK != DATA_ACCEPTED {
            return Err(StorageError::DataRejected { token });
        }
        self.wait_not_busy()
    }

    fn receive_data_block(&mut self, out: &mut [u8]) -> Result<(), StorageError> {
        let timing = self.timing;
        let token = wait_byte(
            &mut self.link,
            &self.clock,
            timing.data_timeout_us,
            timing.poll_us,
            StorageError::DataTimeout,
            |b| b != IDLE_BYTE,
        )?;
        if token != DATA_START_TOKEN {
            return Err(StorageError::DataRejected { token });
        }

        let mut trailer = [0u8; 2];
        read_exact(
            &mut self.link,
            &self.clock,
            timing.data_timeout_us,
            timing.poll_us,
            StorageError::DataTimeout,
            out,
        )?;
        read_exact(
            &mut self.link,
            &self.clock,
            timing.data_timeout_us,
            timing.poll_us,
            StorageError::DataTimeout,
            &mut trailer,
        )?;
        let expected = u16::from_be_bytes(trailer);
        let actual = crc::crc16(out);
        if expected != actual {
            return Err(StorageError::DataCrc { expected, actual });
        }
        Ok(())
    }

    /// The card drives zeros while programming
    fn wait_not_busy(&mut self) -> Result<(), StorageError> {
        let timing = self.timing;
        wait_byte(
            &mut self.link,
            &self.clock,
            timing.busy_timeout_us,
            timing.poll_us,
            StorageError::BusyTimeout,
            |b| b != BUSY_BYTE,
        )
        .map(|_| ())
    }
}

fn step_failed(step: BringUpStep, cause: StorageError) -> StorageError {
    warn!("SD bring-up failed at {:?}: {}", step, cause);
    StorageError::BringUp { step }
}
