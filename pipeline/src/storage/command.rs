//! # SD Command & Response Framing
//!
//! ## Command Frame (48 bits)
//!
//! ```text
//! ┌──────────────┬──────────────────────┬──────────────────┐
//! │ 0x40 | index │ argument (BE, 32 bit)│ CRC7 << 1 | 1    │
//! │    1 byte    │       4 bytes        │     1 byte       │
//! └──────────────┴──────────────────────┴──────────────────┘
//! ```
//!
//! ## Responses
//!
//! ```text
//! R1/R1b/R6/R7  [index][payload BE32][CRC7 << 1 | 1]      6 bytes
//! R3            [0x3F ][OCR BE32    ][0xFF]               6 bytes
//! R2            [0x3F ][CID, 16 bytes, own CRC7 in last]  17 bytes
//! ```
//!
//! The line idles high (`0xFF`); a response starts with the first byte whose
//! top bit is clear.

use serde::{Deserialize, Serialize};

use super::crc::crc7;

/// Command argument of CMD8: 2.7-3.6 V and check pattern 0xAA
pub const IF_COND_ARG: u32 = 0x0000_01AA;
/// Bits of the CMD8 echo compared against the argument
pub const IF_COND_ECHO_MASK: u32 = 0x0000_0FFF;

/// ACMD41 host capacity support
pub const OCR_HCS: u32 = 1 << 30;
/// ACMD41 voltage window 3.2-3.4 V
pub const OCR_VOLTAGE_WINDOW: u32 = 0x0030_0000;
/// OCR power-up complete
pub const OCR_READY: u32 = 1 << 31;
/// OCR card capacity status (block addressed)
pub const OCR_CCS: u32 = 1 << 30;

/// Data block start token
pub const DATA_START_TOKEN: u8 = 0xFE;
/// Data response token mask and the accepted pattern
pub const DATA_RESPONSE_MASK: u8 = 0x1F;
pub const DATA_ACCEPTED: u8 = 0x05;
pub const DATA_CRC_ERROR: u8 = 0x0B;
pub const DATA_WRITE_ERROR: u8 = 0x0D;
/// Byte read while the card holds the line busy
pub const BUSY_BYTE: u8 = 0x00;
/// Idle line
pub const IDLE_BYTE: u8 = 0xFF;

/// Marker byte of R2/R3 responses
const LONG_MARKER: u8 = 0x3F;

/// Commands used by bring-up and block I/O
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u8)]
pub enum Command {
    /// CMD0 reset to idle
    GoIdleState = 0,
    /// CMD2 read CID
    AllSendCid = 2,
    /// CMD3 publish relative address
    SendRelativeAddr = 3,
    /// CMD7 select by relative address
    SelectCard = 7,
    /// CMD8 interface condition
    SendIfCond = 8,
    /// CMD12 end a multi-block transfer
    StopTransmission = 12,
    /// CMD16 block length
    SetBlockLen = 16,
    /// CMD17
    ReadSingleBlock = 17,
    /// CMD18
    ReadMultipleBlock = 18,
    /// CMD24
    WriteBlock = 24,
    /// CMD25
    WriteMultipleBlock = 25,
    /// ACMD41 operating condition (application command)
    SdSendOpCond = 41,
    /// CMD55 application command prefix
    AppCmd = 55,
}

impl Command {
    pub const fn index(self) -> u8 {
        self as u8
    }

    /// Whether the command needs the CMD55 prefix
    pub const fn is_app(self) -> bool {
        matches!(self, Command::SdSendOpCond)
    }

    pub const fn response(self) -> ResponseKind {
        match self {
            Command::AllSendCid => ResponseKind::R2,
            Command::SdSendOpCond => ResponseKind::R3,
            Command::SendRelativeAddr => ResponseKind::R6,
            Command::SendIfCond => ResponseKind::R7,
            Command::StopTransmission => ResponseKind::R1b,
            _ => ResponseKind::R1,
        }
    }
}

impl TryFrom<u8> for Command {
    type Error = ();

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::GoIdleState),
            2 => Ok(Self::AllSendCid),
            3 => Ok(Self::SendRelativeAddr),
            7 => Ok(Self::SelectCard),
            8 => Ok(Self::SendIfCond),
            12 => Ok(Self::StopTransmission),
            16 => Ok(Self::SetBlockLen),
            17 => Ok(Self::ReadSingleBlock),
            18 => Ok(Self::ReadMultipleBlock),
            24 => Ok(Self::WriteBlock),
            25 => Ok(Self::WriteMultipleBlock),
            41 => Ok(Self::SdSendOpCond),
            55 => Ok(Self::AppCmd),
            _ => Err(()),
        }
    }
}

/// A serialized 48-bit command
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommandFrame([u8; 6]);

impl CommandFrame {
    pub fn new(command: Command, argument: u32) -> Self {
        let mut bytes = [0u8; 6];
        bytes[0] = 0x40 | command.index();
        bytes[1..5].copy_from_slice(&argument.to_be_bytes());
        bytes[5] = (crc7(&bytes[..5]) << 1) | 1;
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 6] {
        &self.0
    }

    /// Decode a frame as the card sees it: returns (index, argument)
    pub fn parse(bytes: &[u8; 6]) -> Result<(u8, u32), FrameError> {
        if bytes[0] & 0xC0 != 0x40 || bytes[5] & 1 != 1 {
            return Err(FrameError::Framing);
        }
        if bytes[5] >> 1 != crc7(&bytes[..5]) {
            return Err(FrameError::Crc);
        }
        let argument = u32::from_be_bytes([bytes[1], bytes[2], bytes[3], bytes[4]]);
        Ok((bytes[0] & 0x3F, argument))
    }
}

/// Errors while decoding a frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum FrameError {
    /// Start, transmission or end bits wrong
    Framing,
    /// CRC7 does not match
    Crc,
    /// Response carries another command's index
    Index { expected: u8, got: u8 },
}

/// Response format expected after a command
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ResponseKind {
    R1,
    /// R1 followed by busy signalling
    R1b,
    R2,
    R3,
    R6,
    R7,
}

impl ResponseKind {
    /// Bytes on the wire, including the start byte
    pub const fn wire_len(self) -> usize {
        match self {
            ResponseKind::R2 => 17,
            _ => 6,
        }
    }
}

/// Card status register as returned in R1
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct CardStatus(pub u32);

impl CardStatus {
    /// Error bits that fail a command
    pub const ERROR_MASK: u32 = 0xFDF9_8008;
    pub const COM_CRC_ERROR: u32 = 1 << 23;
    pub const ILLEGAL_COMMAND: u32 = 1 << 22;
    pub const GENERAL_ERROR: u32 = 1 << 19;
    pub const BLOCK_LEN_ERROR: u32 = 1 << 29;
    pub const READY_FOR_DATA: u32 = 1 << 8;
    pub const APP_CMD: u32 = 1 << 5;

    pub fn errors(self) -> u32 {
        self.0 & Self::ERROR_MASK
    }

    pub fn is_app_cmd(self) -> bool {
        self.0 & Self::APP_CMD != 0
    }

    /// CURRENT_STATE field (0 idle .. 7 programming)
    pub fn current_state(self) -> u8 {
        ((self.0 >> 9) & 0x0F) as u8
    }

    /// Expand the 16 status bits carried by R6
    pub fn from_r6(bits: u16) -> Self {
        let bits = bits as u32;
        let mut status = bits & 0x1FFF;
        if bits & (1 << 15) != 0 {
            status |= Self::COM_CRC_ERROR;
        }
        if bits & (1 << 14) != 0 {
            status |= Self::ILLEGAL_COMMAND;
        }
        if bits & (1 << 13) != 0 {
            status |= Self::GENERAL_ERROR;
        }
        Self(status)
    }
}

/// A decoded response
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Response {
    Status(CardStatus),
    Cid([u8; 16]),
    Ocr(u32),
    RelativeAddr { rca: u16, status: CardStatus },
    IfCond(u32),
}

impl Response {
    /// Validate and decode `bytes` (exactly `kind.wire_len()` long) sent in
    /// answer to command `index`
    pub fn parse(kind: ResponseKind, index: u8, bytes: &[u8]) -> Result<Self, FrameError> {
        if bytes.len() != kind.wire_len() {
            return Err(FrameError::Framing);
        }
        match kind {
            ResponseKind::R2 => {
                if bytes[0] != LONG_MARKER {
                    return Err(FrameError::Framing);
                }
                let mut cid = [0u8; 16];
                cid.copy_from_slice(&bytes[1..17]);
                if cid[15] & 1 != 1 {
                    return Err(FrameError::Framing);
                }
                if cid[15] >> 1 != crc7(&cid[..15]) {
                    return Err(FrameError::Crc);
                }
                Ok(Response::Cid(cid))
            }
            ResponseKind::R3 => {
                if bytes[0] != LONG_MARKER || bytes[5] != IDLE_BYTE {
                    return Err(FrameError::Framing);
                }
                Ok(Response::Ocr(payload(bytes)))
            }
            ResponseKind::R1 | ResponseKind::R1b | ResponseKind::R6 | ResponseKind::R7 => {
                if bytes[0] & 0xC0 != 0 || bytes[5] & 1 != 1 {
                    return Err(FrameError::Framing);
                }
                if bytes[5] >> 1 != crc7(&bytes[..5]) {
                    return Err(FrameError::Crc);
                }
                if bytes[0] != index {
                    return Err(FrameError::Index {
                        expected: index,
                        got: bytes[0],
                    });
                }
                let value = payload(bytes);
                Ok(match kind {
                    ResponseKind::R6 => Response::RelativeAddr {
                        rca: (value >> 16) as u16,
                        status: CardStatus::from_r6(value as u16),
                    },
                    ResponseKind::R7 => Response::IfCond(value),
                    _ => Response::Status(CardStatus(value)),
                })
            }
        }
    }
}

fn payload(bytes: &[u8]) -> u32 {
    u32::from_be_bytes([bytes[1], bytes[2], bytes[3], bytes[4]])
}

/// Encode a 6-byte CRC-protected response (R1, R1b, R6, R7)
pub fn short_response(index: u8, value: u32) -> [u8; 6] {
    let mut bytes = [0u8; 6];
    bytes[0] = index & 0x3F;
    bytes[1..5].copy_from_slice(&value.to_be_bytes());
    bytes[5] = (crc7(&bytes[..5]) << 1) | 1;
    bytes
}

/// Encode an R3 response
pub fn ocr_response(ocr: u32) -> [u8; 6] {
    let mut bytes = [LONG_MARKER, 0, 0, 0, 0, IDLE_BYTE];
    bytes[1..5].copy_from_slice(&ocr.to_be_bytes());
    bytes
}

/// Encode an R2 response; the CID's last byte is recomputed
pub fn cid_response(cid: &[u8; 16]) -> [u8; 17] {
    let mut bytes = [0u8; 17];
    bytes[0] = LONG_MARKER;
    bytes[1..17].copy_from_slice(cid);
    bytes[16] = (crc7(&cid[..15]) << 1) | 1;
    bytes
}
