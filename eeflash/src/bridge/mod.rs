//! Bridge side of the link: the command dispatcher that runs next to the
//! memory.
//!
//! The dispatcher reads one command byte at a time from a [`DeviceLink`],
//! runs the matching handler to completion against an [`EepromBus`], and
//! reports what happened as a [`Dispatch`]. It never serves two commands at
//! once.
//!
//! ```rust
//! use eeflash::bridge::{Dispatcher, SimulatedEeprom};
//! use eeflash::port::PipePort;
//!
//! let (_host, bridge) = PipePort::pair();
//! let dispatcher = Dispatcher::new(bridge, SimulatedEeprom::default());
//! assert_eq!(dispatcher.bus().contents().len(), 0x8000);
//! ```

pub mod eeprom;
mod handlers;

use std::fmt;
use std::io::ErrorKind;
use std::time::Duration;

use log::{debug, info, warn};

use crate::error::{Error, Result};
use crate::protocol::{Command, FIRMWARE_VERSION, FirmwareVersion, SETTLE_DELAY};

pub use eeprom::{DataDirection, EepromBus, SimulatedEeprom};

/// Bridge-side byte channel to the host.
///
/// Reads block without a deadline: the bridge has nothing else to do while
/// it waits for the host.
pub trait DeviceLink {
    /// Block until one byte arrives.
    fn read_byte(&mut self) -> Result<u8>;

    /// Queue bytes for the host.
    fn write_bytes(&mut self, data: &[u8]) -> Result<()>;

    /// Push queued bytes out.
    fn flush(&mut self) -> Result<()>;

    /// Block until `buf` is full.
    fn read_exact(&mut self, buf: &mut [u8]) -> Result<()> {
        for slot in buf.iter_mut() {
            *slot = self.read_byte()?;
        }
        Ok(())
    }
}

impl<L: DeviceLink + ?Sized> DeviceLink for &mut L {
    fn read_byte(&mut self) -> Result<u8> {
        (**self).read_byte()
    }

    fn write_bytes(&mut self, data: &[u8]) -> Result<()> {
        (**self).write_bytes(data)
    }

    fn flush(&mut self) -> Result<()> {
        (**self).flush()
    }
}

/// Checkpoint at which a bridge session gave up on the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    /// ACK after the size echo.
    SizeAck,
    /// READY before a dump stream.
    StreamReady,
    /// ACK after a dump stream.
    StreamAck,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::SizeAck => f.write_str("size acknowledgement"),
            Self::StreamReady => f.write_str("stream ready"),
            Self::StreamAck => f.write_str("stream acknowledgement"),
        }
    }
}

/// How a handler finished.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// Signature sent.
    Signed,
    /// Hex listing sent.
    Listed {
        /// Listing rows printed.
        rows: usize,
    },
    /// Dump stream sent and closed.
    Streamed {
        /// Payload bytes sent.
        bytes: usize,
    },
    /// Every page-unit of a write was received and programmed.
    Programmed {
        /// Page-units programmed.
        page_units: usize,
        /// Mismatches reported back to the host.
        byte_errors: usize,
    },
    /// Protection sequence issued.
    Protection {
        /// `true` for enable.
        enabled: bool,
    },
    /// Size refused with NAK.
    Rejected {
        /// Size the host asked for.
        size: u32,
    },
    /// Host sent something else at a mandatory checkpoint.
    Abandoned {
        /// Checkpoint that failed.
        stage: Stage,
        /// Byte received instead.
        received: u8,
    },
    /// Unknown command, answered with NAK.
    Refused,
}

/// One served command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Dispatch {
    /// Decoded command byte.
    pub command: Command,
    /// Handler result.
    pub outcome: Outcome,
}

/// Command loop of the bridge.
pub struct Dispatcher<L: DeviceLink, B: EepromBus> {
    link: L,
    bus: B,
    version: FirmwareVersion,
    settle: Duration,
}

impl<L: DeviceLink, B: EepromBus> Dispatcher<L, B> {
    /// Dispatcher reporting the crate's firmware version.
    pub fn new(link: L, bus: B) -> Self {
        Self {
            link,
            bus,
            version: FIRMWARE_VERSION,
            settle: SETTLE_DELAY,
        }
    }

    /// Override the version sent in the signature reply.
    #[must_use]
    pub fn with_version(mut self, version: FirmwareVersion) -> Self {
        self.version = version;
        self
    }

    /// Override the settle delay after page programs and protection commands.
    #[must_use]
    pub fn with_settle_delay(mut self, settle: Duration) -> Self {
        self.settle = settle;
        self
    }

    /// The memory behind the bridge.
    pub fn bus(&self) -> &B {
        &self.bus
    }

    /// Split into link and memory.
    pub fn into_parts(self) -> (L, B) {
        (self.link, self.bus)
    }

    /// Wait for one command and serve it.
    pub fn serve_one(&mut self) -> Result<Dispatch> {
        let command = Command::from(self.link.read_byte()?);
        debug!("Bridge: command {command:?}");

        let mut session = handlers::Session::new(&mut self.link, &mut self.bus, self.settle);
        let outcome = match command {
            Command::Signature => session.signature(self.version)?,
            Command::Read => session.listing()?,
            Command::Dump => session.dump()?,
            Command::Write => session.write()?,
            Command::ProtectEnable => session.protect(true)?,
            Command::ProtectDisable => session.protect(false)?,
            Command::Unknown(byte) => {
                warn!("Bridge: unknown command 0x{byte:02X}");
                session.refuse()?
            },
        };
        self.link
            .flush()?;

        if let Outcome::Abandoned { stage, received } = &outcome {
            warn!("Bridge: {command:?} session abandoned at {stage}, received 0x{received:02X}");
        }

        Ok(Dispatch { command, outcome })
    }

    /// Serve commands until the host goes away.
    ///
    /// Returns `Ok` when the link reports end of stream; any other link error
    /// (including [`Error::Interrupted`]) is returned as is.
    pub fn run(&mut self) -> Result<()> {
        self.run_with(|_| {})
    }

    /// Like [`run`](Self::run), calling `observe` after every command.
    pub fn run_with<F>(&mut self, mut observe: F) -> Result<()>
    where
        F: FnMut(&Dispatch),
    {
        info!("Bridge: serving commands");
        loop {
            match self.serve_one() {
                Ok(dispatch) => observe(&dispatch),
                Err(Error::Io(e))
                    if matches!(
                        e.kind(),
                        ErrorKind::UnexpectedEof | ErrorKind::BrokenPipe | ErrorKind::NotConnected
                    ) =>
                {
                    info!("Bridge: host disconnected");
                    return Ok(());
                },
                Err(e) => return Err(e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;

    use super::*;
    use crate::protocol::{EEPROM_CAPACITY, encode_size};

    /// Scripted host: feeds queued bytes, records replies, reports EOF when
    /// the script runs out.
    #[derive(Default)]
    struct ScriptedLink {
        input: VecDeque<u8>,
        output: Vec<u8>,
    }

    impl ScriptedLink {
        fn with_input(bytes: &[u8]) -> Self {
            Self {
                input: bytes
                    .iter()
                    .copied()
                    .collect(),
                output: Vec::new(),
            }
        }
    }

    impl DeviceLink for ScriptedLink {
        fn read_byte(&mut self) -> Result<u8> {
            self.input
                .pop_front()
                .ok_or_else(|| Error::Io(std::io::Error::new(ErrorKind::UnexpectedEof, "script done")))
        }

        fn write_bytes(&mut self, data: &[u8]) -> Result<()> {
            self.output
                .extend_from_slice(data);
            Ok(())
        }

        fn flush(&mut self) -> Result<()> {
            Ok(())
        }
    }

    fn dispatcher(input: &[u8]) -> Dispatcher<ScriptedLink, SimulatedEeprom> {
        Dispatcher::new(ScriptedLink::with_input(input), SimulatedEeprom::default())
            .with_settle_delay(Duration::ZERO)
    }

    fn output(d: &Dispatcher<ScriptedLink, SimulatedEeprom>) -> &[u8] {
        &d.link.output
    }

    #[test]
    fn test_signature_reply() {
        let mut d = dispatcher(b"S");
        let dispatch = d
            .serve_one()
            .unwrap();
        assert_eq!(dispatch.command, Command::Signature);
        assert_eq!(dispatch.outcome, Outcome::Signed);
        assert_eq!(output(&d), &[b'A', 0, 1, 0, 0x0A]);
    }

    #[test]
    fn test_custom_version() {
        let mut d = dispatcher(b"S").with_version(FirmwareVersion {
            major: 2,
            minor: 3,
            patch: 4,
        });
        d.serve_one()
            .unwrap();
        assert_eq!(output(&d), &[b'A', 2, 3, 4, 0x0A]);
    }

    #[test]
    fn test_unknown_command_naks() {
        let mut d = dispatcher(b"X");
        let dispatch = d
            .serve_one()
            .unwrap();
        assert_eq!(dispatch.command, Command::Unknown(b'X'));
        assert_eq!(dispatch.outcome, Outcome::Refused);
        assert_eq!(output(&d), b"N");
    }

    #[test]
    fn test_write_two_page_units() {
        let mut input = vec![b'W'];
        input.extend_from_slice(&encode_size(512));
        input.push(b'A');
        let image: Vec<u8> = (0..512u32)
            .map(|i| (i * 7 % 251) as u8)
            .collect();
        input.extend_from_slice(&image);

        let mut d = dispatcher(&input);
        let dispatch = d
            .serve_one()
            .unwrap();
        assert_eq!(
            dispatch.outcome,
            Outcome::Programmed {
                page_units: 2,
                byte_errors: 0
            }
        );

        let mut expected = vec![b'A'];
        expected.extend_from_slice(&encode_size(512));
        expected.extend_from_slice(b"RARA");
        assert_eq!(output(&d), expected.as_slice());

        assert_eq!(&d.bus().contents()[..512], image.as_slice());
        assert_eq!(
            d.bus()
                .page_programs(),
            &[0x000, 0x040, 0x080, 0x0C0, 0x100, 0x140, 0x180, 0x1C0]
        );
        assert_eq!(
            d.bus()
                .settles(),
            8
        );
    }

    #[test]
    fn test_write_reports_every_mismatch() {
        let mut input = vec![b'W'];
        input.extend_from_slice(&encode_size(256));
        input.push(b'A');
        input.extend_from_slice(&[0x11; 256]);

        let bus = SimulatedEeprom::default()
            .with_stuck_byte(0x0003, 0x10)
            .with_stuck_byte(0x00FF, 0x00);
        let mut d = Dispatcher::new(ScriptedLink::with_input(&input), bus)
            .with_settle_delay(Duration::ZERO);
        let dispatch = d
            .serve_one()
            .unwrap();
        assert_eq!(
            dispatch.outcome,
            Outcome::Programmed {
                page_units: 1,
                byte_errors: 2
            }
        );

        let tail = &output(&d)[5..];
        assert_eq!(tail, &[b'R', b'A', b'E', 0x03, 0x11, 0x10, b'E', 0xFF, 0x11, 0x00]);
    }

    #[test]
    fn test_write_rejects_unaligned_size() {
        let mut input = vec![b'W'];
        input.extend_from_slice(&encode_size(300));
        let mut d = dispatcher(&input);
        let dispatch = d
            .serve_one()
            .unwrap();
        assert_eq!(dispatch.outcome, Outcome::Rejected { size: 300 });
        assert_eq!(output(&d), b"N");
    }

    #[test]
    fn test_write_rejects_oversize() {
        let size = u32::try_from(EEPROM_CAPACITY + 256).unwrap();
        let mut input = vec![b'W'];
        input.extend_from_slice(&encode_size(size));
        let mut d = dispatcher(&input);
        assert_eq!(
            d.serve_one()
                .unwrap()
                .outcome,
            Outcome::Rejected { size }
        );
    }

    #[test]
    fn test_write_abandoned_without_host_ack() {
        let mut input = vec![b'W'];
        input.extend_from_slice(&encode_size(256));
        input.push(b'N');
        let mut d = dispatcher(&input);
        let dispatch = d
            .serve_one()
            .unwrap();
        assert_eq!(
            dispatch.outcome,
            Outcome::Abandoned {
                stage: Stage::SizeAck,
                received: b'N'
            }
        );
        assert!(
            d.bus()
                .page_programs()
                .is_empty()
        );
    }

    #[test]
    fn test_dump_streams_requested_bytes() {
        let image: Vec<u8> = (0..=255u8).collect();
        let mut input = vec![b'B'];
        input.extend_from_slice(&encode_size(20));
        input.extend_from_slice(b"ARA");
        let mut d = Dispatcher::new(
            ScriptedLink::with_input(&input),
            SimulatedEeprom::with_contents(EEPROM_CAPACITY, &image),
        );
        let dispatch = d
            .serve_one()
            .unwrap();
        assert_eq!(dispatch.outcome, Outcome::Streamed { bytes: 20 });

        let mut expected = vec![b'A'];
        expected.extend_from_slice(&encode_size(20));
        expected.extend_from_slice(&image[..20]);
        expected.push(b'A');
        assert_eq!(output(&d), expected.as_slice());
    }

    #[test]
    fn test_dump_abandoned_checkpoints() {
        for (tail, stage, received) in [
            (&b"N"[..], Stage::SizeAck, b'N'),
            (&b"AX"[..], Stage::StreamReady, b'X'),
        ] {
            let mut input = vec![b'B'];
            input.extend_from_slice(&encode_size(4));
            input.extend_from_slice(tail);
            let mut d = dispatcher(&input);
            assert_eq!(
                d.serve_one()
                    .unwrap()
                    .outcome,
                Outcome::Abandoned { stage, received }
            );
        }
    }

    #[test]
    fn test_dump_missing_final_ack() {
        let mut input = vec![b'B'];
        input.extend_from_slice(&encode_size(2));
        input.extend_from_slice(b"ARN");
        let mut d = dispatcher(&input);
        assert_eq!(
            d.serve_one()
                .unwrap()
                .outcome,
            Outcome::Abandoned {
                stage: Stage::StreamAck,
                received: b'N'
            }
        );
        // No closing ACK after the stream
        assert_eq!(output(&d).len(), 5 + 2);
    }

    #[test]
    fn test_dump_rejects_oversize() {
        let mut input = vec![b'B'];
        input.extend_from_slice(&encode_size(0x8001));
        let mut d = dispatcher(&input);
        assert_eq!(
            d.serve_one()
                .unwrap()
                .outcome,
            Outcome::Rejected { size: 0x8001 }
        );
        assert_eq!(output(&d), b"N");
    }

    #[test]
    fn test_read_listing_format() {
        let image: Vec<u8> = (0..32u8).collect();
        let mut d = Dispatcher::new(
            ScriptedLink::with_input(b"R"),
            SimulatedEeprom::with_contents(32, &image),
        );
        assert_eq!(
            d.serve_one()
                .unwrap()
                .outcome,
            Outcome::Listed { rows: 2 }
        );
        let expected = "\r\n\
            0000: 00 01 02 03 04 05 06 07   08 09 0A 0B 0C 0D 0E 0F\r\n\
            0010: 10 11 12 13 14 15 16 17   18 19 1A 1B 1C 1D 1E 1F\r\n\0";
        assert_eq!(output(&d), expected.as_bytes());
    }

    #[test]
    fn test_protect_commands_drive_bus() {
        let mut d = dispatcher(b"ED");
        assert_eq!(
            d.serve_one()
                .unwrap()
                .outcome,
            Outcome::Protection { enabled: true }
        );
        assert!(
            d.bus()
                .is_protected()
        );
        assert_eq!(
            d.serve_one()
                .unwrap()
                .outcome,
            Outcome::Protection { enabled: false }
        );
        assert!(
            !d.bus()
                .is_protected()
        );
        assert!(output(&d).is_empty());
    }

    #[test]
    fn test_run_stops_on_disconnect() {
        let mut d = dispatcher(b"SSX");
        let mut seen = Vec::new();
        d.run_with(|dispatch| seen.push(dispatch.command))
            .unwrap();
        assert_eq!(
            seen,
            vec![Command::Signature, Command::Signature, Command::Unknown(b'X')]
        );
    }
}
