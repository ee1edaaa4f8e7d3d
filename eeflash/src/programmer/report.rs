//! Results of host-side transfers.
//!
//! Device-reported write errors and verification mismatches are data, not
//! errors: they are collected here and never abort a transfer.

use std::fmt;

use crate::protocol::{ByteError, PAGE_UNIT_SIZE, Status};

/// A [`ByteError`] located to an absolute address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct DeviceWriteError {
    /// Page-unit the record was reported for.
    pub page_unit: usize,
    /// Raw record from the bridge.
    pub record: ByteError,
}

impl DeviceWriteError {
    /// Absolute address of the failed byte.
    pub fn address(&self) -> usize {
        self.page_unit * PAGE_UNIT_SIZE + usize::from(self.record.offset)
    }
}

impl fmt::Display for DeviceWriteError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "0x{:04X}: expected 0x{:02X}, read 0x{:02X}",
            self.address(),
            self.record.expected,
            self.record.actual
        )
    }
}

/// Page-unit the bridge answered with something other than ACK.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Unacknowledged {
    /// Page-unit index.
    pub page_unit: usize,
    /// Status received instead of ACK.
    pub status: Status,
}

/// Outcome of a completed write session.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct WriteReport {
    /// Image bytes sent.
    pub bytes: usize,
    /// Page-units sent.
    pub page_units: usize,
    /// Mismatches the bridge found after programming, in arrival order.
    pub device_errors: Vec<DeviceWriteError>,
    /// Page-units that were not acknowledged. They are not resent.
    pub unacknowledged: Vec<Unacknowledged>,
}

impl WriteReport {
    /// No device errors and every page-unit acknowledged.
    pub fn is_clean(&self) -> bool {
        self.device_errors
            .is_empty()
            && self
                .unacknowledged
                .is_empty()
    }
}

/// One byte that differs between reference and memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Mismatch {
    /// Absolute address.
    pub address: usize,
    /// Reference byte.
    pub expected: u8,
    /// Byte read from the memory.
    pub actual: u8,
}

impl fmt::Display for Mismatch {
    /// Report-file line, `AAAA: EE, RR`.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:04X}: {:02X}, {:02X}",
            self.address, self.expected, self.actual
        )
    }
}

/// Outcome of a verify session.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct VerifyReport {
    /// Bytes compared.
    pub size: usize,
    /// Every differing byte, in address order.
    pub mismatches: Vec<Mismatch>,
}

impl VerifyReport {
    /// Compare a dump against its reference image.
    ///
    /// Bytes missing from `actual` are not compared; callers only pass full
    /// dumps.
    pub fn compare(reference: &[u8], actual: &[u8]) -> Self {
        let mismatches = reference
            .iter()
            .zip(actual)
            .enumerate()
            .filter(|(_, (expected, actual))| expected != actual)
            .map(|(address, (&expected, &actual))| Mismatch {
                address,
                expected,
                actual,
            })
            .collect();
        Self {
            size: reference
                .len()
                .min(actual.len()),
            mismatches,
        }
    }

    /// `true` when nothing differs.
    pub fn is_ok(&self) -> bool {
        self.mismatches
            .is_empty()
    }

    /// Report-file body, one line per mismatch.
    pub fn to_report_lines(&self) -> String {
        let mut out = String::new();
        for m in &self.mismatches {
            out.push_str(&m.to_string());
            out.push('\n');
        }
        out
    }
}
