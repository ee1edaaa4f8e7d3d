//! Host side of the link: the protocol client.
//!
//! [`Programmer`] drives the bridge through a [`Port`]. Every public
//! operation is one session: signature handshake, optional size
//! negotiation, transfer. Waits are bounded by the configured timeout and
//! can be cancelled through a [`CancelToken`] or the global interrupt
//! checker.
//!
//! ## Example
//!
//! ```rust,no_run
//! use eeflash::port::{NativePort, SerialConfig};
//! use eeflash::programmer::Programmer;
//!
//! let port = NativePort::open(&SerialConfig::new("/dev/ttyACM0", 115200))?;
//! let mut programmer = Programmer::new(port);
//! let image = std::fs::read("rom.bin")?;
//! let report = programmer.write_image(&image, |done, total| {
//!     println!("{done}/{total}");
//! })?;
//! assert!(report.is_clean());
//! # Ok::<(), eeflash::Error>(())
//! ```

mod report;
mod session;

use std::time::Duration;

use log::{debug, info, trace, warn};

pub use report::{DeviceWriteError, Mismatch, Unacknowledged, VerifyReport, WriteReport};
pub use session::{Session, SessionState};

use crate::error::{Error, Result};
use crate::port::Port;
use crate::protocol::deadline::{CancelToken, Deadline, poll_until};
use crate::protocol::{
    ByteError, Command, DEFAULT_TIMEOUT, EEPROM_CAPACITY, FirmwareVersion, LISTING_TERMINATOR,
    PAGE_UNIT_SIZE, SIGNATURE_TERMINATOR, Status, check_read_size, check_write_size, decode_size,
    encode_size, page_units,
};

/// Page-units per KiB progress marker.
const UNITS_PER_KIB: usize = 1024 / PAGE_UNIT_SIZE;

/// Host client settings.
#[derive(Debug, Clone)]
pub struct ProgrammerConfig {
    /// Deadline for each status or payload wait.
    pub timeout: Duration,
    /// Bytes addressable behind the bridge.
    pub capacity: usize,
    /// Quiet period that ends the wait for error records after the last
    /// page-unit.
    pub drain_grace: Duration,
}

impl Default for ProgrammerConfig {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_TIMEOUT,
            capacity: EEPROM_CAPACITY,
            drain_grace: Duration::from_millis(250),
        }
    }
}

impl ProgrammerConfig {
    /// Set the wait deadline.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Set the device capacity.
    #[must_use]
    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity;
        self
    }

    /// Set the trailing error-record grace period.
    #[must_use]
    pub fn with_drain_grace(mut self, drain_grace: Duration) -> Self {
        self.drain_grace = drain_grace;
        self
    }
}

/// Move whatever is available into `buf`, up to `want` bytes in total.
fn fill<P: Port>(port: &mut P, buf: &mut Vec<u8>, want: usize) -> Result<usize> {
    let missing = want.saturating_sub(buf.len());
    if missing == 0 {
        return Ok(0);
    }
    let n = port
        .bytes_available()?
        .min(missing);
    if n == 0 {
        return Ok(0);
    }
    let start = buf.len();
    buf.resize(start + n, 0);
    port.read_exact(&mut buf[start..])?;
    Ok(n)
}

/// Protocol client for the EEPROM bridge.
pub struct Programmer<P: Port> {
    port: P,
    config: ProgrammerConfig,
    cancel: Option<CancelToken>,
    session: Session,
    version: Option<FirmwareVersion>,
}

impl<P: Port> Programmer<P> {
    /// Client with default settings.
    pub fn new(port: P) -> Self {
        Self::with_config(port, ProgrammerConfig::default())
    }

    /// Client with explicit settings.
    pub fn with_config(port: P, config: ProgrammerConfig) -> Self {
        Self {
            port,
            config,
            cancel: None,
            session: Session::default(),
            version: None,
        }
    }

    /// Observe `token` in every wait.
    #[must_use]
    pub fn with_cancel_token(mut self, token: CancelToken) -> Self {
        self.cancel = Some(token);
        self
    }

    /// Active settings.
    pub fn config(&self) -> &ProgrammerConfig {
        &self.config
    }

    /// Current session state.
    pub fn state(&self) -> SessionState {
        self.session
            .state()
    }

    /// State the last session was in when it aborted.
    pub fn aborted_in(&self) -> Option<SessionState> {
        self.session
            .aborted_in()
    }

    /// Firmware version from the most recent handshake.
    pub fn firmware_version(&self) -> Option<FirmwareVersion> {
        self.version
    }

    /// Underlying port.
    pub fn port(&self) -> &P {
        &self.port
    }

    /// Mutable access to the underlying port.
    pub fn port_mut(&mut self) -> &mut P {
        &mut self.port
    }

    /// Give the port back.
    pub fn into_port(self) -> P {
        self.port
    }

    /// Run the signature handshake alone.
    pub fn signature(&mut self) -> Result<FirmwareVersion> {
        self.run_session(|p| {
            p.version
                .ok_or_else(|| Error::HandshakeFailed("no version received".into()))
        })
    }

    /// Program `image` starting at address 0.
    ///
    /// The image is checked against the page-unit policy before anything is
    /// sent. Device-reported mismatches and unacknowledged page-units are
    /// collected in the report; they do not stop the transfer.
    pub fn write_image<F>(&mut self, image: &[u8], mut progress: F) -> Result<WriteReport>
    where
        F: FnMut(usize, usize),
    {
        let size = check_write_size(image.len(), self.config.capacity)?;
        info!(
            "Writing {} bytes ({} page-units)",
            image.len(),
            page_units(image.len())
        );
        self.run_session(|p| p.write_session(image, size, &mut progress))
    }

    /// Read `size` bytes starting at address 0.
    ///
    /// A silent bridge ends the dump with [`Error::Timeout`] carrying the
    /// bytes received so far.
    pub fn dump<F>(&mut self, size: usize, mut progress: F) -> Result<Vec<u8>>
    where
        F: FnMut(usize, usize),
    {
        let size = check_read_size(size, self.config.capacity)?;
        info!("Dumping {size} bytes");
        self.run_session(|p| p.dump_session(size, &mut progress))
    }

    /// Dump as many bytes as `reference` holds and compare.
    pub fn verify<F>(&mut self, reference: &[u8], progress: F) -> Result<VerifyReport>
    where
        F: FnMut(usize, usize),
    {
        let data = self.dump(reference.len(), progress)?;
        let report = VerifyReport::compare(reference, &data);
        if report.is_ok() {
            info!("Verify OK: {} bytes match", report.size);
        } else {
            for m in &report.mismatches {
                debug!(
                    "Invalid byte at address 0x{:04X}, expected 0x{:02X}, read 0x{:02X}",
                    m.address, m.expected, m.actual
                );
            }
            warn!("Verify BAD: {} mismatching bytes", report.mismatches.len());
        }
        Ok(report)
    }

    /// Fetch the bridge's hex listing of the whole memory.
    pub fn read_listing(&mut self) -> Result<String> {
        self.run_session(Self::listing_session)
    }

    /// Send the software data protection enable or disable command.
    ///
    /// The bridge does not answer; success only means the command was sent.
    pub fn set_protection(&mut self, enable: bool) -> Result<()> {
        let command = if enable {
            Command::ProtectEnable
        } else {
            Command::ProtectDisable
        };
        self.run_session(|p| {
            p.session
                .advance(SessionState::Transfer)?;
            p.send(&[command.byte()])?;
            info!(
                "Write protection {} command sent",
                if enable { "enable" } else { "disable" }
            );
            Ok(())
        })
    }

    /// Shorthand for `set_protection(true)`.
    pub fn enable_protection(&mut self) -> Result<()> {
        self.set_protection(true)
    }

    /// Shorthand for `set_protection(false)`.
    pub fn disable_protection(&mut self) -> Result<()> {
        self.set_protection(false)
    }

    fn run_session<T, F>(&mut self, body: F) -> Result<T>
    where
        F: FnOnce(&mut Self) -> Result<T>,
    {
        self.session
            .begin()?;
        let result = match self.handshake() {
            Ok(_) => body(self),
            Err(e) => Err(e),
        };
        match result {
            Ok(value) => {
                self.session
                    .advance(SessionState::Complete)?;
                Ok(value)
            },
            Err(e) => {
                self.session
                    .abort();
                debug!(
                    "Session aborted while {}: {e}",
                    self.session
                        .aborted_in()
                        .unwrap_or(SessionState::Idle)
                );
                Err(e)
            },
        }
    }

    fn deadline(&self) -> Deadline {
        Deadline::after(self.config.timeout).with_cancel(self.cancel.clone())
    }

    fn send(&mut self, bytes: &[u8]) -> Result<()> {
        trace!("host -> bridge: {} bytes", bytes.len());
        self.port
            .write_all_bytes(bytes)
    }

    fn send_status(&mut self, status: Status) -> Result<()> {
        trace!("host -> bridge: {status}");
        self.send(&[status.byte()])
    }

    /// Collect up to `n` bytes before `deadline`; may return fewer.
    fn collect(&mut self, n: usize, deadline: &Deadline) -> Result<Vec<u8>> {
        let mut buf = Vec::with_capacity(n);
        let port = &mut self.port;
        poll_until(deadline, || {
            fill(port, &mut buf, n)?;
            Ok((buf.len() >= n).then_some(()))
        })?;
        Ok(buf)
    }

    fn await_bytes(&mut self, n: usize, context: &str) -> Result<Vec<u8>> {
        let deadline = self.deadline();
        let buf = self.collect(n, &deadline)?;
        if buf.len() < n {
            return Err(Error::Timeout {
                context: context.to_string(),
                partial: buf,
            });
        }
        Ok(buf)
    }

    fn await_status(&mut self, context: &str) -> Result<Status> {
        let byte = self.await_bytes(1, context)?;
        let status = Status::from(byte[0]);
        trace!("bridge -> host: {status}");
        Ok(status)
    }

    fn await_byte_error(&mut self) -> Result<ByteError> {
        let raw = self.await_bytes(ByteError::LEN, "error record")?;
        Ok(ByteError::from_bytes([raw[0], raw[1], raw[2]]))
    }

    fn discard_stale_input(&mut self) -> Result<()> {
        let stale = self
            .port
            .bytes_available()?;
        if stale > 0 {
            debug!("Discarding {stale} stale bytes");
            self.port
                .clear_buffers()?;
        }
        Ok(())
    }

    fn handshake(&mut self) -> Result<FirmwareVersion> {
        self.discard_stale_input()?;
        debug!("Requesting device signature");
        self.send(&[Command::Signature.byte()])?;

        let status = self.await_status("signature acknowledgement")?;
        if status != Status::Ack {
            return Err(Error::HandshakeFailed(format!(
                "device answered {status} to the signature request"
            )));
        }

        let reply = self.await_bytes(4, "signature payload")?;
        let version = FirmwareVersion {
            major: reply[0],
            minor: reply[1],
            patch: reply[2],
        };
        if reply[3] != SIGNATURE_TERMINATOR {
            warn!(
                "Signature did not end with a newline (got 0x{:02X})",
                reply[3]
            );
        }

        info!("Device firmware version: {version}");
        self.version = Some(version);
        Ok(version)
    }

    fn negotiate_size(&mut self, size: u32) -> Result<()> {
        self.session
            .advance(SessionState::NegotiateSize)?;
        debug!("Negotiating size {size} (0x{size:08X})");
        self.send(&encode_size(size))?;

        let status = self.await_status("size acknowledgement")?;
        if status != Status::Ack {
            return Err(Error::Rejected {
                context: format!("size {size}"),
                status,
            });
        }

        let echo = self.await_bytes(4, "size echo")?;
        let echoed = decode_size(&[echo[0], echo[1], echo[2], echo[3]]);
        if echoed != size {
            self.send_status(Status::Nak)?;
            return Err(Error::SizeMismatch { sent: size, echoed });
        }

        self.send_status(Status::Ack)?;
        self.session
            .advance(SessionState::Transfer)
    }

    fn record_device_error(report: &mut WriteReport, page_unit: usize, record: ByteError) {
        let located = DeviceWriteError { page_unit, record };
        warn!("Device reported write error at {located}");
        report
            .device_errors
            .push(located);
    }

    /// Wait for READY, collecting error records for the previous page-unit.
    fn await_ready(&mut self, unit: usize, report: &mut WriteReport) -> Result<()> {
        loop {
            match self.await_status(&format!("READY for page-unit {unit}"))? {
                Status::Ready => return Ok(()),
                Status::Error => {
                    let record = self.await_byte_error()?;
                    Self::record_device_error(report, unit.saturating_sub(1), record);
                },
                other => {
                    return Err(Error::ProtocolDesync {
                        expected: Status::Ready,
                        actual: other,
                    });
                },
            }
        }
    }

    /// Collect error records for the last page-unit until the line goes
    /// quiet.
    fn drain_trailing_errors(&mut self, unit: usize, report: &mut WriteReport) -> Result<()> {
        let mut deadline =
            Deadline::after(self.config.drain_grace).with_cancel(self.cancel.clone());
        loop {
            let byte = self.collect(1, &deadline)?;
            let Some(&first) = byte.first() else {
                return Ok(());
            };
            match Status::from(first) {
                Status::Error => {
                    let record = self.await_byte_error()?;
                    Self::record_device_error(report, unit, record);
                    deadline.extend();
                },
                other => {
                    warn!("Ignoring unexpected {other} after the last page-unit");
                    return Ok(());
                },
            }
        }
    }

    fn write_session(
        &mut self,
        image: &[u8],
        size: u32,
        progress: &mut dyn FnMut(usize, usize),
    ) -> Result<WriteReport> {
        self.send(&[Command::Write.byte()])?;
        self.negotiate_size(size)?;

        let total = image.len();
        let mut report = WriteReport {
            bytes: total,
            page_units: page_units(total),
            ..WriteReport::default()
        };

        for (unit, chunk) in image
            .chunks(PAGE_UNIT_SIZE)
            .enumerate()
        {
            self.await_ready(unit, &mut report)?;
            self.send(chunk)?;

            let status = self.await_status(&format!("page-unit {unit} acknowledgement"))?;
            if status != Status::Ack {
                warn!("Page-unit {unit} was answered with {status}, continuing");
                report
                    .unacknowledged
                    .push(Unacknowledged {
                        page_unit: unit,
                        status,
                    });
            }

            let done = ((unit + 1) * PAGE_UNIT_SIZE).min(total);
            progress(done, total);
            if (unit + 1) % UNITS_PER_KIB == 0 {
                debug!("{} KiB written", done / 1024);
            }
        }

        if let Some(last) = report
            .page_units
            .checked_sub(1)
        {
            self.drain_trailing_errors(last, &mut report)?;
        }

        info!(
            "Write finished: {} page-units, {} device errors, {} unacknowledged",
            report.page_units,
            report
                .device_errors
                .len(),
            report
                .unacknowledged
                .len()
        );
        Ok(report)
    }

    fn dump_session(&mut self, size: u32, progress: &mut dyn FnMut(usize, usize)) -> Result<Vec<u8>> {
        self.send(&[Command::Dump.byte()])?;
        self.negotiate_size(size)?;
        self.send_status(Status::Ready)?;

        let total = size as usize;
        let mut deadline = self.deadline();
        let mut data = Vec::with_capacity(total);
        while data.len() < total {
            let port = &mut self.port;
            let arrived = poll_until(&deadline, || {
                let n = fill(port, &mut data, total)?;
                Ok((n > 0).then_some(n))
            })?;
            if arrived.is_none() {
                return Err(Error::Timeout {
                    context: format!("dump stream, {} of {total} bytes", data.len()),
                    partial: data,
                });
            }
            deadline.extend();
            progress(data.len(), total);
        }

        self.send_status(Status::Ack)?;
        match self.await_status("dump closing acknowledgement") {
            Ok(Status::Ack) => Ok(data),
            Ok(other) => Err(Error::ProtocolDesync {
                expected: Status::Ack,
                actual: other,
            }),
            Err(e) if e.is_timeout() => Err(Error::Timeout {
                context: "dump closing acknowledgement".into(),
                partial: data,
            }),
            Err(e) => Err(e),
        }
    }

    fn listing_session(&mut self) -> Result<String> {
        self.session
            .advance(SessionState::Transfer)?;
        self.send(&[Command::Read.byte()])?;

        let mut deadline = self.deadline();
        let mut text = Vec::new();
        loop {
            let port = &mut self.port;
            let chunk = poll_until(&deadline, || {
                let n = port.bytes_available()?;
                if n == 0 {
                    return Ok(None);
                }
                let mut buf = vec![0u8; n];
                port.read_exact(&mut buf)?;
                Ok(Some(buf))
            })?;
            let Some(chunk) = chunk else {
                return Err(Error::Timeout {
                    context: "listing terminator".into(),
                    partial: text,
                });
            };
            deadline.extend();

            if let Some(end) = chunk
                .iter()
                .position(|&b| b == LISTING_TERMINATOR)
            {
                text.extend_from_slice(&chunk[..end]);
                if end + 1 < chunk.len() {
                    warn!("Ignoring {} bytes after the listing", chunk.len() - end - 1);
                }
                break;
            }
            text.extend_from_slice(&chunk);
        }

        Ok(String::from_utf8_lossy(&text).into_owned())
    }
}
