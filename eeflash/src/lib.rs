//! # eeflash
//!
//! Programmer for parallel EEPROMs (28C256 and compatibles) behind a
//! microcontroller serial bridge.
//!
//! The crate holds both ends of the link:
//!
//! - [`programmer`]: the host client. Signature handshake, size negotiation,
//!   page-unit writes, dumps, verification and the bridge's hex listing.
//! - [`bridge`]: the command dispatcher that runs next to the memory, with
//!   the [`EepromBus`](bridge::EepromBus) driver trait and an in-memory
//!   [`SimulatedEeprom`](bridge::SimulatedEeprom).
//! - [`protocol`]: the wire vocabulary both sides share, plus deadline
//!   polling.
//! - [`port`]: host transports (serial port, in-memory pipe).
//!
//! ## Features
//!
//! - `native` (default): serial port support via the `serialport` crate
//! - `serde`: serialization support for reports and discovered ports
//!
//! ## Example
//!
//! ```rust,no_run
//! use eeflash::{NativePort, Programmer, SerialConfig};
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let port = NativePort::open(&SerialConfig::new("/dev/ttyACM0", 115200))?;
//!     let mut programmer = Programmer::new(port);
//!
//!     let image = std::fs::read("rom.bin")?;
//!     programmer.write_image(&image, |done, total| println!("{done}/{total}"))?;
//!
//!     let report = programmer.verify(&image, |_, _| {})?;
//!     println!("verify: {}", if report.is_ok() { "OK" } else { "BAD" });
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

use std::sync::{Arc, OnceLock};

pub mod bridge;
pub mod discovery;
pub mod error;
pub mod image;
pub mod port;
pub mod programmer;
pub mod protocol;

static INTERRUPT_CHECKER: OnceLock<Arc<dyn Fn() -> bool + Send + Sync>> = OnceLock::new();

/// Register a global interruption checker used by every blocking wait.
///
/// The checker should return `true` when the current operation should stop
/// (for example after receiving Ctrl-C in CLI applications). Only the first
/// registration takes effect.
pub fn set_interrupt_checker<F>(checker: F)
where
    F: Fn() -> bool + Send + Sync + 'static,
{
    let _ = INTERRUPT_CHECKER.set(Arc::new(checker));
}

/// Returns whether interruption was requested by the embedding application.
#[must_use]
pub fn is_interrupted_requested() -> bool {
    INTERRUPT_CHECKER
        .get()
        .is_some_and(|checker| checker())
}

#[cfg(feature = "native")]
pub use port::NativePort;
pub use {
    bridge::{DeviceLink, Dispatch, Dispatcher, EepromBus, Outcome, SimulatedEeprom},
    discovery::{BridgeKind, DetectedPort},
    error::{Error, Result},
    port::{PipePort, Port, SerialConfig},
    programmer::{Programmer, ProgrammerConfig, SessionState, VerifyReport, WriteReport},
    protocol::{
        ByteError, Command, FirmwareVersion, Status,
        deadline::{CancelToken, Deadline},
    },
};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_interrupt_checker_default_false() {
        assert!(!is_interrupted_requested());
    }
}
