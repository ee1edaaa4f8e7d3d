//! Wire vocabulary shared by the bridge firmware and the host client.
//!
//! The link carries no framing of its own. Every exchange is a sequence of
//! single control bytes, little-endian 32-bit sizes, and raw payload:
//!
//! ```text
//! signature : host 'S'            device 'A' major minor patch 0x0A
//! dump      : host 'B' size(4)    device 'A' size(4)
//!             host 'A' 'R'        device <size bytes>
//!             host 'A'            device 'A'
//! write     : host 'W' size(4)    device 'A' size(4)
//!             host 'A'
//!             repeat per 256-byte page-unit:
//!                                 device 'R'
//!             host <256 bytes>    device 'A' ('E' offset expected actual)*
//! read      : host 'R'            device <hex listing> 0x00
//! protect   : host 'E' | 'D'      (no reply)
//! ```

pub mod deadline;

use std::fmt;
use std::time::Duration;

use byteorder::{ByteOrder, LittleEndian};

use crate::error::{Error, Result};

/// Bytes exchanged per write round.
pub const PAGE_UNIT_SIZE: usize = 256;

/// Bytes the memory programs in one physical page cycle.
pub const PHYSICAL_PAGE_SIZE: usize = 64;

/// Physical pages per page-unit.
pub const PAGES_PER_UNIT: usize = PAGE_UNIT_SIZE / PHYSICAL_PAGE_SIZE;

/// Addressable bytes behind the bridge (28C256, 0x0000..0x8000).
pub const EEPROM_CAPACITY: usize = 0x8000;

/// Settle time after each physical page program or protection sequence.
pub const SETTLE_DELAY: Duration = Duration::from_millis(7);

/// Last byte of the signature reply.
pub const SIGNATURE_TERMINATOR: u8 = 0x0A;

/// Last byte of the hex listing produced by the read command.
pub const LISTING_TERMINATOR: u8 = 0x00;

/// Bytes per line of the hex listing.
pub const LISTING_ROW: usize = 16;

/// Baud rate the bridge firmware runs at.
pub const DEFAULT_BAUD: u32 = 115_200;

/// Default deadline for a single status wait.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

/// Firmware version reported by this crate's bridge implementation.
pub const FIRMWARE_VERSION: FirmwareVersion = FirmwareVersion {
    major: 0,
    minor: 1,
    patch: 0,
};

/// Command byte sent by the host to start a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    /// Device signature / firmware version (`'S'`).
    Signature,
    /// Human-readable hex listing (`'R'`).
    Read,
    /// Binary dump (`'B'`).
    Dump,
    /// Page-unit write (`'W'`).
    Write,
    /// Enable software data protection (`'E'`).
    ProtectEnable,
    /// Disable software data protection (`'D'`).
    ProtectDisable,
    /// Anything else; answered with NAK.
    Unknown(u8),
}

impl Command {
    /// Wire byte for this command.
    pub fn byte(self) -> u8 {
        match self {
            Self::Signature => b'S',
            Self::Read => b'R',
            Self::Dump => b'B',
            Self::Write => b'W',
            Self::ProtectEnable => b'E',
            Self::ProtectDisable => b'D',
            Self::Unknown(b) => b,
        }
    }
}

impl From<u8> for Command {
    fn from(value: u8) -> Self {
        match value {
            b'S' => Self::Signature,
            b'R' => Self::Read,
            b'B' => Self::Dump,
            b'W' => Self::Write,
            b'E' => Self::ProtectEnable,
            b'D' => Self::ProtectDisable,
            other => Self::Unknown(other),
        }
    }
}

/// Status byte exchanged at protocol checkpoints.
///
/// A timeout is never a status value; waits report it as [`Error::Timeout`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum Status {
    /// Acknowledge (`'A'`).
    Ack,
    /// Not acknowledged (`'N'`).
    Nak,
    /// Ready for the next page-unit or stream (`'R'`).
    Ready,
    /// Post-write mismatch; followed by a [`ByteError`] record (`'E'`).
    Error,
    /// Any byte outside the vocabulary.
    Other(u8),
}

impl Status {
    /// Wire byte for this status.
    pub fn byte(self) -> u8 {
        match self {
            Self::Ack => b'A',
            Self::Nak => b'N',
            Self::Ready => b'R',
            Self::Error => b'E',
            Self::Other(b) => b,
        }
    }
}

impl From<u8> for Status {
    fn from(value: u8) -> Self {
        match value {
            b'A' => Self::Ack,
            b'N' => Self::Nak,
            b'R' => Self::Ready,
            b'E' => Self::Error,
            other => Self::Other(other),
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ack => f.write_str("ACK"),
            Self::Nak => f.write_str("NAK"),
            Self::Ready => f.write_str("READY"),
            Self::Error => f.write_str("ERROR"),
            Self::Other(b) => write!(f, "0x{b:02X}"),
        }
    }
}

/// Mismatch found by the bridge while re-reading a freshly written page-unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ByteError {
    /// Offset inside the page-unit.
    pub offset: u8,
    /// Byte the host sent.
    pub expected: u8,
    /// Byte read back from the memory.
    pub actual: u8,
}

impl ByteError {
    /// Encoded length after the ERROR status byte.
    pub const LEN: usize = 3;

    /// Decode the three payload bytes following an ERROR status.
    pub fn from_bytes(bytes: [u8; Self::LEN]) -> Self {
        Self {
            offset: bytes[0],
            expected: bytes[1],
            actual: bytes[2],
        }
    }

    /// Encode as the three payload bytes following an ERROR status.
    pub fn to_bytes(self) -> [u8; Self::LEN] {
        [self.offset, self.expected, self.actual]
    }
}

/// Firmware version triple from the signature reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct FirmwareVersion {
    /// Major version.
    pub major: u8,
    /// Minor version.
    pub minor: u8,
    /// Patch version.
    pub patch: u8,
}

impl fmt::Display for FirmwareVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

/// Encode a negotiated size, least significant byte first.
pub fn encode_size(size: u32) -> [u8; 4] {
    let mut buf = [0u8; 4];
    LittleEndian::write_u32(&mut buf, size);
    buf
}

/// Decode a negotiated size, least significant byte first.
pub fn decode_size(bytes: &[u8; 4]) -> u32 {
    LittleEndian::read_u32(bytes)
}

/// Check a write image size against the page-unit policy.
///
/// Writes must be non-empty, a whole number of page-units, and fit the
/// device. Both the host and the bridge apply the same rule so that a
/// partial final page-unit can never be half-programmed.
pub fn check_write_size(size: usize, capacity: usize) -> Result<u32> {
    if size == 0 {
        return Err(Error::InvalidImage("image is empty".into()));
    }
    if size % PAGE_UNIT_SIZE != 0 {
        return Err(Error::InvalidImage(format!(
            "size {size} is not a multiple of {PAGE_UNIT_SIZE} bytes"
        )));
    }
    if size > capacity {
        return Err(Error::InvalidImage(format!(
            "size {size} exceeds device capacity of {capacity} bytes"
        )));
    }
    u32::try_from(size).map_err(|_| Error::InvalidImage(format!("size {size} is too large")))
}

/// Check a dump/verify size against the device capacity.
pub fn check_read_size(size: usize, capacity: usize) -> Result<u32> {
    if size == 0 {
        return Err(Error::InvalidImage("requested size is zero".into()));
    }
    if size > capacity {
        return Err(Error::InvalidImage(format!(
            "size {size} exceeds device capacity of {capacity} bytes"
        )));
    }
    u32::try_from(size).map_err(|_| Error::InvalidImage(format!("size {size} is too large")))
}

/// Number of page-units needed to carry `size` bytes.
pub fn page_units(size: usize) -> usize {
    size.div_ceil(PAGE_UNIT_SIZE)
}
