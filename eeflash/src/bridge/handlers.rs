//! Per-command bridge sessions.
//!
//! Dump and write are explicit state machines: each step consumes the state,
//! does one exchange with the host or the bus, and yields the next state
//! until a terminal [`Outcome`] is reached.

use std::fmt::Write as _;
use std::time::Duration;

use log::{debug, trace, warn};

use super::eeprom::{DataDirection, EepromBus, SDP_DISABLE, SDP_ENABLE};
use super::{DeviceLink, Outcome, Stage};
use crate::error::Result;
use crate::protocol::{
    ByteError, FirmwareVersion, LISTING_ROW, LISTING_TERMINATOR, PAGE_UNIT_SIZE,
    PHYSICAL_PAGE_SIZE, SIGNATURE_TERMINATOR, Status, check_write_size, decode_size, encode_size,
};

/// Bytes read from the bus per link write while streaming a dump.
const STREAM_CHUNK: usize = 64;

enum DumpState {
    ReadSize,
    AwaitSizeAck { size: u32 },
    AwaitReady { size: u32 },
    Stream { size: u32 },
    AwaitStreamAck { size: u32 },
    Done(Outcome),
}

enum WriteState {
    ReadSize,
    AwaitSizeAck { size: u32 },
    NextUnit { size: u32, unit: usize },
    Receive { size: u32, unit: usize },
    Program { size: u32, unit: usize },
    Verify { size: u32, unit: usize },
    Done(Outcome),
}

/// One command's worth of access to the link and the bus.
pub(super) struct Session<'a, L, B> {
    link: &'a mut L,
    bus: &'a mut B,
    settle: Duration,
    page: [u8; PAGE_UNIT_SIZE],
    byte_errors: usize,
}

/// Bus address of `offset`. Offsets are bounded by the bus capacity.
#[allow(clippy::cast_possible_truncation)]
fn address(offset: usize) -> u16 {
    offset as u16
}

impl<'a, L: DeviceLink, B: EepromBus> Session<'a, L, B> {
    pub(super) fn new(link: &'a mut L, bus: &'a mut B, settle: Duration) -> Self {
        Self {
            link,
            bus,
            settle,
            page: [0u8; PAGE_UNIT_SIZE],
            byte_errors: 0,
        }
    }

    fn send_status(&mut self, status: Status) -> Result<()> {
        trace!("Bridge: -> {status}");
        self.link
            .write_bytes(&[status.byte()])
    }

    fn read_size(&mut self) -> Result<u32> {
        let mut raw = [0u8; 4];
        self.link
            .read_exact(&mut raw)?;
        Ok(decode_size(&raw))
    }

    fn acknowledge_size(&mut self, size: u32) -> Result<()> {
        self.send_status(Status::Ack)?;
        self.link
            .write_bytes(&encode_size(size))?;
        self.link
            .flush()
    }

    /// Read one byte and require it to be `expected`.
    fn expect(&mut self, expected: Status, stage: Stage) -> Result<Option<Outcome>> {
        let received = self
            .link
            .read_byte()?;
        if Status::from(received) == expected {
            Ok(None)
        } else {
            Ok(Some(Outcome::Abandoned { stage, received }))
        }
    }

    pub(super) fn refuse(&mut self) -> Result<Outcome> {
        self.send_status(Status::Nak)?;
        Ok(Outcome::Refused)
    }

    pub(super) fn signature(&mut self, version: FirmwareVersion) -> Result<Outcome> {
        self.link
            .write_bytes(&[
                Status::Ack.byte(),
                version.major,
                version.minor,
                version.patch,
                SIGNATURE_TERMINATOR,
            ])?;
        Ok(Outcome::Signed)
    }

    /// Hex listing of the whole address space.
    pub(super) fn listing(&mut self) -> Result<Outcome> {
        let capacity = self
            .bus
            .capacity();
        self.link
            .write_bytes(b"\r\n")?;

        let mut rows = 0;
        let mut line = String::with_capacity(64);
        for base in (0..capacity).step_by(LISTING_ROW) {
            line.clear();
            let _ = write!(line, "{base:04X}:");
            for i in 0..LISTING_ROW.min(capacity - base) {
                if i == LISTING_ROW / 2 {
                    line.push_str("  ");
                }
                let byte = self
                    .bus
                    .read_byte(address(base + i));
                let _ = write!(line, " {byte:02X}");
            }
            line.push_str("\r\n");
            self.link
                .write_bytes(line.as_bytes())?;
            rows += 1;
        }

        self.link
            .write_bytes(&[LISTING_TERMINATOR])?;
        Ok(Outcome::Listed { rows })
    }

    pub(super) fn protect(&mut self, enable: bool) -> Result<Outcome> {
        let sequence: &[(u16, u8)] = if enable { &SDP_ENABLE } else { &SDP_DISABLE };
        self.bus
            .set_data_direction(DataDirection::Output);
        for &(addr, data) in sequence {
            self.bus
                .write_byte(addr, data);
        }
        self.bus
            .settle(self.settle);
        debug!(
            "Bridge: write protection {}",
            if enable { "enabled" } else { "disabled" }
        );
        Ok(Outcome::Protection { enabled: enable })
    }

    pub(super) fn dump(&mut self) -> Result<Outcome> {
        let mut state = DumpState::ReadSize;
        loop {
            state = match state {
                DumpState::ReadSize => {
                    let size = self.read_size()?;
                    if size as usize > self.bus.capacity() {
                        warn!("Bridge: dump of {size} bytes exceeds capacity");
                        self.send_status(Status::Nak)?;
                        DumpState::Done(Outcome::Rejected { size })
                    } else {
                        self.acknowledge_size(size)?;
                        DumpState::AwaitSizeAck { size }
                    }
                },
                DumpState::AwaitSizeAck { size } => match self.expect(Status::Ack, Stage::SizeAck)? {
                    Some(outcome) => DumpState::Done(outcome),
                    None => DumpState::AwaitReady { size },
                },
                DumpState::AwaitReady { size } => {
                    match self.expect(Status::Ready, Stage::StreamReady)? {
                        Some(outcome) => DumpState::Done(outcome),
                        None => DumpState::Stream { size },
                    }
                },
                DumpState::Stream { size } => {
                    let total = size as usize;
                    let mut chunk = [0u8; STREAM_CHUNK];
                    let mut sent = 0;
                    while sent < total {
                        let n = STREAM_CHUNK.min(total - sent);
                        for (i, slot) in chunk[..n]
                            .iter_mut()
                            .enumerate()
                        {
                            *slot = self
                                .bus
                                .read_byte(address(sent + i));
                        }
                        self.link
                            .write_bytes(&chunk[..n])?;
                        sent += n;
                    }
                    self.link
                        .flush()?;
                    DumpState::AwaitStreamAck { size }
                },
                DumpState::AwaitStreamAck { size } => {
                    match self.expect(Status::Ack, Stage::StreamAck)? {
                        Some(outcome) => DumpState::Done(outcome),
                        None => {
                            self.send_status(Status::Ack)?;
                            DumpState::Done(Outcome::Streamed {
                                bytes: size as usize,
                            })
                        },
                    }
                },
                DumpState::Done(outcome) => return Ok(outcome),
            };
        }
    }

    pub(super) fn write(&mut self) -> Result<Outcome> {
        let mut state = WriteState::ReadSize;
        loop {
            state = match state {
                WriteState::ReadSize => {
                    let size = self.read_size()?;
                    match check_write_size(size as usize, self.bus.capacity()) {
                        Ok(_) => {
                            self.acknowledge_size(size)?;
                            WriteState::AwaitSizeAck { size }
                        },
                        Err(e) => {
                            warn!("Bridge: write refused: {e}");
                            self.send_status(Status::Nak)?;
                            WriteState::Done(Outcome::Rejected { size })
                        },
                    }
                },
                WriteState::AwaitSizeAck { size } => {
                    match self.expect(Status::Ack, Stage::SizeAck)? {
                        Some(outcome) => WriteState::Done(outcome),
                        None => WriteState::NextUnit { size, unit: 0 },
                    }
                },
                WriteState::NextUnit { size, unit } => {
                    if unit * PAGE_UNIT_SIZE >= size as usize {
                        WriteState::Done(Outcome::Programmed {
                            page_units: unit,
                            byte_errors: self.byte_errors,
                        })
                    } else {
                        self.send_status(Status::Ready)?;
                        self.link
                            .flush()?;
                        WriteState::Receive { size, unit }
                    }
                },
                WriteState::Receive { size, unit } => {
                    let mut page = [0u8; PAGE_UNIT_SIZE];
                    self.link
                        .read_exact(&mut page)?;
                    self.page = page;
                    self.send_status(Status::Ack)?;
                    self.link
                        .flush()?;
                    WriteState::Program { size, unit }
                },
                WriteState::Program { size, unit } => {
                    let base = unit * PAGE_UNIT_SIZE;
                    trace!("Bridge: programming page-unit {unit} at 0x{base:04X}");
                    let page = self.page;
                    for (i, block) in page
                        .chunks_exact(PHYSICAL_PAGE_SIZE)
                        .enumerate()
                    {
                        let mut physical = [0u8; PHYSICAL_PAGE_SIZE];
                        physical.copy_from_slice(block);
                        self.bus
                            .write_page(address(base + i * PHYSICAL_PAGE_SIZE), &physical);
                        self.bus
                            .settle(self.settle);
                    }
                    WriteState::Verify { size, unit }
                },
                WriteState::Verify { size, unit } => {
                    let base = unit * PAGE_UNIT_SIZE;
                    let page = self.page;
                    for (offset, &expected) in (0u8..=u8::MAX).zip(page.iter()) {
                        let actual = self
                            .bus
                            .read_byte(address(base + usize::from(offset)));
                        if actual != expected {
                            let record = ByteError {
                                offset,
                                expected,
                                actual,
                            };
                            debug!("Bridge: page-unit {unit} mismatch {record:?}");
                            self.send_status(Status::Error)?;
                            self.link
                                .write_bytes(&record.to_bytes())?;
                            self.byte_errors += 1;
                        }
                    }
                    WriteState::NextUnit {
                        size,
                        unit: unit + 1,
                    }
                },
                WriteState::Done(outcome) => return Ok(outcome),
            };
        }
    }
}
