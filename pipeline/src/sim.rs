//! # Host Simulation
//!
//! In-memory stand-ins for the hardware collaborators, used by the unit tests
//! and by the host runner:
//!
//! - [`SimClock`]: virtual time, `sleep_us` advances it instantly
//! - [`StdClock`]: wall-clock time for threaded tests
//! - [`MemCard`]: bit-exact SD card model over a byte link, with fault
//!   injection
//! - [`SimSource`]: acquisition source producing a synthetic waveform
//! - [`ThreadPlatform`]: runs the storage context on a `std::thread`

use alloc::collections::{BTreeMap, VecDeque};
use alloc::sync::Arc;
use alloc::vec::Vec;
use std::sync::Mutex;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use embedded_io::{ErrorKind, ErrorType, Read, ReadReady, Write};
use log::warn;
use portable_atomic::{AtomicU64, Ordering};
use serde::{Deserialize, Serialize};

use crate::config::BLOCK_SIZE;
use crate::context::WriterHandle;
use crate::storage::command::{
    cid_response, ocr_response, short_response, CardStatus, CommandFrame, BUSY_BYTE,
    DATA_ACCEPTED, DATA_CRC_ERROR, DATA_START_TOKEN, DATA_WRITE_ERROR, IDLE_BYTE,
    IF_COND_ECHO_MASK, OCR_CCS, OCR_HCS, OCR_READY,
};
use crate::storage::crc::crc16;
use crate::timing::Clock;
use crate::traits::{AcquisitionSource, CardLink, Platform};
use crate::writer::StorageWriter;

/// Virtual microsecond clock shared by clones
#[derive(Debug, Clone, Default)]
pub struct SimClock(Arc<AtomicU64>);

impl SimClock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn advance(&self, us: u64) {
        self.0.fetch_add(us, Ordering::AcqRel);
    }
}

impl Clock for SimClock {
    fn now_us(&self) -> u64 {
        self.0.load(Ordering::Acquire)
    }

    fn sleep_us(&self, us: u32) {
        self.advance(us as u64);
    }
}

/// Wall-clock time since construction
#[derive(Debug, Clone, Copy)]
pub struct StdClock {
    origin: Instant,
}

impl StdClock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl Default for StdClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for StdClock {
    fn now_us(&self) -> u64 {
        self.origin.elapsed().as_micros() as u64
    }

    fn sleep_us(&self, us: u32) {
        if us == 0 {
            thread::yield_now();
        } else {
            thread::sleep(Duration::from_micros(us as u64));
        }
    }
}

/// Faults a [`MemCard`] can inject
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CardFaults {
    /// Number of CMD0 frames to ignore before answering
    pub ignore_resets: u32,
    /// Stay silent on CMD8, like a version 1 card
    pub version_one: bool,
    /// Never set the OCR ready bit
    pub never_ready: bool,
    /// ACMD41 polls answered with the ready bit clear before power-up ends
    pub ready_after: u16,
    /// Answer every data block with a write-error token
    pub reject_writes: bool,
    /// Flip a payload bit in responses to this command index
    pub corrupt_response: Option<u8>,
    /// Hold the line busy forever after a data block
    pub stuck_busy: bool,
    /// Busy bytes after each accepted block and after CMD12
    pub busy_bytes: usize,
    /// `offload_busy` polls reported busy per offload
    pub offload_polls: u32,
    /// Real time spent programming each accepted block
    pub write_delay_us: u64,
}

impl Default for CardFaults {
    fn default() -> Self {
        Self {
            ignore_resets: 0,
            version_one: false,
            never_ready: false,
            ready_after: 2,
            reject_writes: false,
            corrupt_response: None,
            stuck_busy: false,
            busy_bytes: 4,
            offload_polls: 1,
            write_delay_us: 0,
        }
    }
}

enum Mode {
    Command,
    AwaitToken { block: u32, multi: bool },
    Data { block: u32, multi: bool, buf: Vec<u8> },
    MultiRead { next: u32 },
}

/// Card states as reported in R1 bits 12:9
const STATE_IDLE: u32 = 0;
const STATE_IDENT: u32 = 2;
const STATE_STBY: u32 = 3;
const STATE_TRAN: u32 = 4;
const ADDRESS_OUT_OF_RANGE: u32 = 1 << 31;

fn status(state: u32) -> u32 {
    (state << 9) | CardStatus::READY_FOR_DATA
}

fn is_command_start(byte: u8) -> bool {
    byte & 0xC0 == 0x40
}

/// An SD card living in memory, speaking the byte-level wire model of
/// [`crate::storage`]. Frames with a bad CRC7 are ignored like on a real
/// card.
pub struct MemCard {
    blocks: BTreeMap<u32, [u8; BLOCK_SIZE]>,
    capacity_blocks: u32,
    faults: CardFaults,
    clock_hz: u32,
    high_capacity: bool,
    op_cond_polls: u16,
    app_pending: bool,
    rx: Vec<u8>,
    tx: VecDeque<u8>,
    mode: Mode,
    log: Vec<u8>,
    offload_polls: u32,
}

impl MemCard {
    pub const DEFAULT_RCA: u16 = 0x1234;
    /// Identification register; byte 15 carries its CRC7
    pub const CID: [u8; 16] = [
        0x03, b'S', b'D', b'M', b'E', b'M', b'0', b'1', 0x10, 0xDE, 0xAD, 0xBE, 0xEF, 0x01, 0x6A,
        0x27,
    ];

    pub fn new(capacity_blocks: u32) -> Self {
        Self::with_faults(capacity_blocks, CardFaults::default())
    }

    pub fn with_faults(capacity_blocks: u32, faults: CardFaults) -> Self {
        Self {
            blocks: BTreeMap::new(),
            capacity_blocks,
            faults,
            clock_hz: 0,
            high_capacity: false,
            op_cond_polls: 0,
            app_pending: false,
            rx: Vec::with_capacity(6),
            tx: VecDeque::new(),
            mode: Mode::Command,
            log: Vec::new(),
            offload_polls: 0,
        }
    }

    pub fn faults_mut(&mut self) -> &mut CardFaults {
        &mut self.faults
    }

    pub fn clock_hz(&self) -> u32 {
        self.clock_hz
    }

    /// Indices of every well-formed command received, in order
    pub fn command_log(&self) -> &[u8] {
        &self.log
    }

    /// Contents of a block that has been written
    pub fn block(&self, block: u32) -> Option<[u8; BLOCK_SIZE]> {
        self.blocks.get(&block).copied()
    }

    pub fn written_blocks(&self) -> usize {
        self.blocks.len()
    }

    /// Written blocks in address order, gaps left out
    pub fn image(&self) -> impl Iterator<Item = (u32, &[u8; BLOCK_SIZE])> {
        self.blocks.iter().map(|(addr, data)| (*addr, data))
    }

    fn feed(&mut self, byte: u8) {
        match core::mem::replace(&mut self.mode, Mode::Command) {
            Mode::Command => self.feed_command(byte),
            Mode::AwaitToken { block, multi } => {
                if byte == DATA_START_TOKEN {
                    self.mode = Mode::Data {
                        block,
                        multi,
                        buf: Vec::with_capacity(BLOCK_SIZE + 2),
                    };
                } else if is_command_start(byte) {
                    self.feed_command(byte);
                } else {
                    self.mode = Mode::AwaitToken { block, multi };
                }
            }
            Mode::Data {
                block,
                multi,
                mut buf,
            } => {
                buf.push(byte);
                if buf.len() < BLOCK_SIZE + 2 {
                    self.mode = Mode::Data { block, multi, buf };
                } else {
                    self.finish_block(block, multi, &buf);
                }
            }
            Mode::MultiRead { next } => {
                if is_command_start(byte) {
                    self.tx.clear();
                    self.feed_command(byte);
                } else {
                    self.mode = Mode::MultiRead { next };
                }
            }
        }
    }

    fn feed_command(&mut self, byte: u8) {
        if self.rx.is_empty() && !is_command_start(byte) {
            return;
        }
        self.rx.push(byte);
        if self.rx.len() < 6 {
            return;
        }
        let mut frame = [0u8; 6];
        frame.copy_from_slice(&self.rx);
        self.rx.clear();
        if let Ok((index, argument)) = CommandFrame::parse(&frame) {
            self.handle_command(index, argument);
        }
    }

    fn handle_command(&mut self, index: u8, argument: u32) {
        self.log.push(index);
        let app = core::mem::take(&mut self.app_pending);
        match index {
            0 => {
                if self.faults.ignore_resets > 0 {
                    self.faults.ignore_resets -= 1;
                    return;
                }
                self.high_capacity = false;
                self.op_cond_polls = 0;
                self.respond(0, status(STATE_IDLE));
            }
            8 => {
                if !self.faults.version_one {
                    self.respond(8, argument & IF_COND_ECHO_MASK);
                }
            }
            55 => {
                self.app_pending = true;
                self.respond(55, status(STATE_IDLE) | CardStatus::APP_CMD);
            }
            41 if app => {
                self.op_cond_polls = self.op_cond_polls.saturating_add(1);
                let mut ocr = 0x00FF_8000;
                if !self.faults.never_ready && self.op_cond_polls > self.faults.ready_after {
                    ocr |= OCR_READY;
                    if !self.faults.version_one && argument & OCR_HCS != 0 {
                        ocr |= OCR_CCS;
                        self.high_capacity = true;
                    }
                }
                self.push(&ocr_response(ocr));
            }
            2 => self.push(&cid_response(&Self::CID)),
            3 => self.respond(3, ((Self::DEFAULT_RCA as u32) << 16) | status(STATE_IDENT)),
            7 => {
                if argument >> 16 == Self::DEFAULT_RCA as u32 {
                    self.respond(7, status(STATE_STBY));
                }
            }
            16 => {
                let status = if argument == BLOCK_SIZE as u32 {
                    status(STATE_TRAN)
                } else {
                    status(STATE_TRAN) | CardStatus::BLOCK_LEN_ERROR
                };
                self.respond(16, status);
            }
            12 => {
                self.tx.clear();
                self.respond(12, status(STATE_TRAN));
                self.push_busy();
            }
            17 | 18 | 24 | 25 => match self.block_of(argument) {
                Some(block) => {
                    self.respond(index, status(STATE_TRAN));
                    self.mode = match index {
                        17 => {
                            self.queue_block(block);
                            Mode::Command
                        }
                        18 => Mode::MultiRead { next: block },
                        24 => Mode::AwaitToken { block, multi: false },
                        _ => Mode::AwaitToken { block, multi: true },
                    };
                }
                None => self.respond(index, status(STATE_TRAN) | ADDRESS_OUT_OF_RANGE),
            },
            _ => self.respond(index, status(STATE_TRAN) | CardStatus::ILLEGAL_COMMAND),
        }
    }

    fn block_of(&self, argument: u32) -> Option<u32> {
        let block = if self.high_capacity {
            argument
        } else if argument % BLOCK_SIZE as u32 == 0 {
            argument / BLOCK_SIZE as u32
        } else {
            return None;
        };
        (block < self.capacity_blocks).then_some(block)
    }

    fn respond(&mut self, index: u8, value: u32) {
        let mut bytes = short_response(index, value);
        if self.faults.corrupt_response == Some(index) {
            bytes[2] ^= 0x01;
        }
        self.push(&bytes);
    }

    fn push(&mut self, bytes: &[u8]) {
        self.tx.extend(bytes.iter().copied());
    }

    fn push_busy(&mut self) {
        self.tx
            .extend(core::iter::repeat(BUSY_BYTE).take(self.faults.busy_bytes));
    }

    fn queue_block(&mut self, block: u32) {
        let data = self.blocks.get(&block).copied().unwrap_or([0; BLOCK_SIZE]);
        self.tx.push_back(DATA_START_TOKEN);
        self.push(&data);
        self.push(&crc16(&data).to_be_bytes());
    }

    fn finish_block(&mut self, block: u32, multi: bool, buf: &[u8]) {
        let (payload, trailer) = buf.split_at(BLOCK_SIZE);
        let token = if u16::from_be_bytes([trailer[0], trailer[1]]) != crc16(payload) {
            DATA_CRC_ERROR
        } else if self.faults.reject_writes {
            DATA_WRITE_ERROR
        } else {
            let mut data = [0u8; BLOCK_SIZE];
            data.copy_from_slice(payload);
            self.blocks.insert(block, data);
            if self.faults.write_delay_us > 0 {
                thread::sleep(Duration::from_micros(self.faults.write_delay_us));
            }
            DATA_ACCEPTED
        };
        self.tx.push_back(token);
        if token == DATA_ACCEPTED {
            self.push_busy();
        }
        if multi {
            self.mode = Mode::AwaitToken {
                block: block.saturating_add(1),
                multi,
            };
        }
    }
}

impl ErrorType for MemCard {
    type Error = ErrorKind;
}

impl Read for MemCard {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize, Self::Error> {
        if buf.is_empty() {
            return Ok(0);
        }
        if self.tx.is_empty() {
            if let Mode::MultiRead { next } = self.mode {
                self.queue_block(next);
                self.mode = Mode::MultiRead {
                    next: next.saturating_add(1),
                };
            }
        }
        let mut n = 0;
        while n < buf.len() {
            match self.tx.pop_front() {
                Some(byte) => {
                    buf[n] = byte;
                    n += 1;
                }
                None => break,
            }
        }
        if n == 0 {
            buf[0] = if self.faults.stuck_busy {
                BUSY_BYTE
            } else {
                IDLE_BYTE
            };
            n = 1;
        }
        Ok(n)
    }
}

impl ReadReady for MemCard {
    fn read_ready(&mut self) -> Result<bool, Self::Error> {
        Ok(true)
    }
}

impl Write for MemCard {
    fn write(&mut self, buf: &[u8]) -> Result<usize, Self::Error> {
        for &byte in buf {
            self.feed(byte);
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> Result<(), Self::Error> {
        Ok(())
    }
}

impl CardLink for MemCard {
    fn set_clock(&mut self, hz: u32) -> Result<(), Self::Error> {
        self.clock_hz = hz;
        Ok(())
    }

    fn start_offload(&mut self, data: &[u8]) -> Result<(), Self::Error> {
        for &byte in data {
            self.feed(byte);
        }
        self.offload_polls = self.faults.offload_polls;
        Ok(())
    }

    fn offload_busy(&mut self) -> Result<bool, Self::Error> {
        if self.offload_polls > 0 {
            self.offload_polls -= 1;
            return Ok(true);
        }
        Ok(false)
    }
}

/// Signal produced by a [`SimSource`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Waveform {
    Constant(u16),
    /// Rectangular pulses: `width` samples at `high` every `period`
    Pulse {
        period: u32,
        width: u32,
        high: u16,
        low: u16,
    },
    /// 12-bit sawtooth
    Ramp,
}

impl Waveform {
    fn sample(self, phase: u32) -> u16 {
        match self {
            Waveform::Constant(value) => value,
            Waveform::Pulse {
                period,
                width,
                high,
                low,
            } => {
                if phase % period.max(1) < width {
                    high
                } else {
                    low
                }
            }
            Waveform::Ramp => (phase & 0x0FFF) as u16,
        }
    }
}

impl Default for Waveform {
    fn default() -> Self {
        Waveform::Pulse {
            period: 400,
            width: 8,
            high: 4000,
            low: 2048,
        }
    }
}

/// Acquisition source that completes instantly, or stalls on every
/// `stall_every`-th transfer
#[derive(Debug, Clone, Default)]
pub struct SimSource {
    waveform: Waveform,
    stall_every: u32,
    samples: Vec<u16>,
    busy: bool,
    phase: u32,
    transfers: u32,
}

impl SimSource {
    pub fn new(waveform: Waveform) -> Self {
        Self {
            waveform,
            ..Self::default()
        }
    }

    /// A source whose transfers never complete
    pub fn stalled() -> Self {
        Self::default().stall_every(1)
    }

    pub fn stall_every(mut self, every: u32) -> Self {
        self.stall_every = every;
        self
    }

    pub fn transfers(&self) -> u32 {
        self.transfers
    }
}

impl AcquisitionSource for SimSource {
    fn clear_queue(&mut self) {
        self.samples.clear();
        self.busy = false;
    }

    fn begin_transfer(&mut self, count: usize) {
        self.transfers = self.transfers.wrapping_add(1);
        if self.stall_every != 0 && self.transfers % self.stall_every == 0 {
            self.busy = true;
            return;
        }
        self.samples.clear();
        for _ in 0..count {
            self.samples.push(self.waveform.sample(self.phase));
            self.phase = self.phase.wrapping_add(1);
        }
    }

    fn is_busy(&self) -> bool {
        self.busy
    }

    fn samples(&self) -> &[u16] {
        &self.samples
    }
}

/// Platform running the storage context on a thread. The trigger is only
/// recorded; the owner calls `Pipeline::on_tick` itself.
pub struct ThreadPlatform<L, C> {
    writer: Arc<Mutex<Option<StorageWriter<L, C>>>>,
    worker: Option<JoinHandle<()>>,
    trigger: Option<u32>,
    refuse_trigger: bool,
    launches: u32,
}

impl<L, C> ThreadPlatform<L, C>
where
    L: CardLink + Send + 'static,
    C: Clock + Send + 'static,
{
    pub fn new(writer: StorageWriter<L, C>) -> Self {
        Self {
            writer: Arc::new(Mutex::new(Some(writer))),
            worker: None,
            trigger: None,
            refuse_trigger: false,
            launches: 0,
        }
    }

    /// A platform with no timer to give
    pub fn without_trigger(mut self) -> Self {
        self.refuse_trigger = true;
        self
    }

    /// Period of the armed trigger
    pub fn trigger_period(&self) -> Option<u32> {
        self.trigger
    }

    pub fn launches(&self) -> u32 {
        self.launches
    }

    /// Wait for the storage thread to exit
    pub fn join(&mut self) {
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                warn!("storage thread panicked");
            }
        }
    }

    /// Run `f` on the writer while no storage thread holds it
    pub fn with_writer<R>(&mut self, f: impl FnOnce(&mut StorageWriter<L, C>) -> R) -> Option<R> {
        self.join();
        let mut slot = self.writer.lock().ok()?;
        slot.as_mut().map(f)
    }

    pub fn into_writer(mut self) -> Option<StorageWriter<L, C>> {
        self.join();
        let mut slot = self.writer.lock().ok()?;
        slot.take()
    }
}

impl<L, C> Platform for ThreadPlatform<L, C>
where
    L: CardLink + Send + 'static,
    C: Clock + Send + 'static,
{
    fn arm_trigger(&mut self, period_us: u32) -> bool {
        if self.refuse_trigger {
            return false;
        }
        self.trigger = Some(period_us);
        true
    }

    fn disarm_trigger(&mut self) {
        self.trigger = None;
    }

    fn launch_writer(&mut self, handle: WriterHandle) -> bool {
        self.join();
        match self.writer.lock() {
            Ok(slot) if slot.is_some() => {}
            _ => return false,
        }
        let writer = Arc::clone(&self.writer);
        let spawned = thread::Builder::new()
            .name("storage-writer".into())
            .spawn(move || {
                if let Ok(mut slot) = writer.lock() {
                    if let Some(writer) = slot.as_mut() {
                        writer.run(&handle);
                    }
                }
            });
        match spawned {
            Ok(worker) => {
                self.worker = Some(worker);
                self.launches += 1;
                true
            }
            Err(e) => {
                warn!("failed to spawn storage thread: {}", e);
                false
            }
        }
    }

    fn flush_writer(&mut self, handle: &WriterHandle) -> bool {
        // A live storage thread keeps draining until it retires; join it and
        // write whatever is left here.
        self.with_writer(|writer| writer.flush(handle)).is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::command::Command;

    fn read_response(card: &mut MemCard, len: usize) -> Vec<u8> {
        let mut out = vec![0u8; len];
        let mut byte = [0u8; 1];
        loop {
            card.read(&mut byte).unwrap();
            if byte[0] & 0x80 == 0 {
                break;
            }
        }
        out[0] = byte[0];
        card.read(&mut out[1..]).unwrap();
        out
    }

    #[test]
    fn test_sim_clock_advances_on_sleep() {
        let clock = SimClock::new();
        let shared = clock.clone();
        clock.sleep_us(25);
        assert_eq!(shared.now_us(), 25);
    }

    #[test]
    fn test_card_answers_reset() {
        let mut card = MemCard::new(8);
        card.write(CommandFrame::new(Command::GoIdleState, 0).as_bytes())
            .unwrap();
        assert_eq!(read_response(&mut card, 6), short_response(0, status(STATE_IDLE)));
    }

    #[test]
    fn test_card_ignores_bad_crc() {
        let mut card = MemCard::new(8);
        let mut frame = *CommandFrame::new(Command::GoIdleState, 0).as_bytes();
        frame[5] ^= 0x02;
        card.write(&frame).unwrap();
        assert!(card.command_log().is_empty());
        let mut byte = [0u8; 1];
        card.read(&mut byte).unwrap();
        assert_eq!(byte[0], IDLE_BYTE);
    }

    #[test]
    fn test_source_stalls_on_schedule() {
        let mut source = SimSource::new(Waveform::Constant(100)).stall_every(2);
        source.begin_transfer(4);
        assert!(!source.is_busy());
        assert_eq!(source.samples(), &[100; 4]);
        source.clear_queue();
        source.begin_transfer(4);
        assert!(source.is_busy());
        assert!(source.samples().is_empty());
    }

    #[test]
    fn test_pulse_waveform() {
        let mut source = SimSource::new(Waveform::Pulse {
            period: 4,
            width: 1,
            high: 9,
            low: 1,
        });
        source.begin_transfer(8);
        assert_eq!(source.samples(), &[9, 1, 1, 1, 9, 1, 1, 1]);
    }
}
