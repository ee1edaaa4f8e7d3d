//! Bridge emulation on a real serial port.
//!
//! Runs the device dispatcher against a [`SimulatedEeprom`] so host tooling
//! can be exercised without hardware, e.g. through a null-modem cable or a
//! `socat` pty pair.

use std::fs;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use console::style;
use eeflash::bridge::Outcome;
use eeflash::image::load_image;
use eeflash::protocol::EEPROM_CAPACITY;
use eeflash::{Dispatch, Dispatcher, NativePort, SerialConfig, SimulatedEeprom};
use log::{info, warn};

use crate::config::Config;
use crate::{Cli, CliError};

/// One-line summary of a served command.
fn describe(dispatch: &Dispatch) -> String {
    let detail = match &dispatch.outcome {
        Outcome::Signed => "signature sent".to_string(),
        Outcome::Listed { rows } => format!("listing of {rows} rows sent"),
        Outcome::Streamed { bytes } => format!("{bytes} bytes streamed"),
        Outcome::Programmed {
            page_units,
            byte_errors,
        } => format!("{page_units} page-units programmed, {byte_errors} byte errors"),
        Outcome::Protection { enabled: true } => "write protection enabled".to_string(),
        Outcome::Protection { enabled: false } => "write protection disabled".to_string(),
        Outcome::Rejected { size } => format!("size {size} rejected"),
        Outcome::Abandoned { stage, received } => {
            format!("abandoned at {stage} (received 0x{received:02X})")
        },
        Outcome::Refused => "unknown command refused".to_string(),
    };
    format!("{:?}: {detail}", dispatch.command)
}

fn load_backing(path: &Path) -> Result<Vec<u8>> {
    if !path.exists() {
        info!("{} does not exist yet; starting blank", path.display());
        return Ok(Vec::new());
    }
    let contents =
        load_image(path).with_context(|| format!("Failed to read {}", path.display()))?;
    if contents.len() > EEPROM_CAPACITY {
        warn!(
            "{} holds {} bytes; only the first {EEPROM_CAPACITY} are used",
            path.display(),
            contents.len()
        );
    }
    Ok(contents)
}

/// Emulate command implementation.
pub(crate) fn cmd_emulate(cli: &Cli, config: &Config, backing: Option<&Path>) -> Result<()> {
    let port_name = cli
        .port
        .clone()
        .or_else(|| config.connection.port.clone())
        .ok_or_else(|| {
            CliError::Usage("emulate needs --port: the serial port the host talks to".into())
        })?;
    let settings = config.link_settings(cli.baud, cli.timeout);

    let contents = match backing {
        Some(path) => load_backing(path)?,
        None => Vec::new(),
    };
    let eeprom = SimulatedEeprom::with_contents(EEPROM_CAPACITY, &contents).with_real_time(true);

    let serial = SerialConfig::new(&port_name, settings.baud).with_boot_delay(Duration::ZERO);
    let port = NativePort::open(&serial).with_context(|| format!("Cannot open {port_name}"))?;

    if !cli.quiet {
        eprintln!(
            "{} Emulating bridge on {} @ {} baud (Ctrl-C to stop)",
            style("⚡").cyan(),
            port_name,
            settings.baud
        );
    }

    let mut dispatcher = Dispatcher::new(port, eeprom);
    let result = dispatcher.run_with(|dispatch| info!("{}", describe(dispatch)));
    let (_, eeprom) = dispatcher.into_parts();

    if let Some(path) = backing {
        fs::write(path, eeprom.contents())
            .with_context(|| format!("Failed to save {}", path.display()))?;
        info!("Saved simulated memory to {}", path.display());
    }

    match result {
        Ok(()) | Err(eeflash::Error::Interrupted) => Ok(()),
        Err(err) => Err(err.into()),
    }
}

#[cfg(test)]
mod tests {
    use eeflash::Command;
    use eeflash::bridge::Stage;

    use super::*;

    #[test]
    fn test_describe_outcomes() {
        let programmed = Dispatch {
            command: Command::Write,
            outcome: Outcome::Programmed {
                page_units: 2,
                byte_errors: 1,
            },
        };
        assert_eq!(
            describe(&programmed),
            "Write: 2 page-units programmed, 1 byte errors"
        );

        let abandoned = Dispatch {
            command: Command::Dump,
            outcome: Outcome::Abandoned {
                stage: Stage::StreamReady,
                received: 0x4E,
            },
        };
        assert_eq!(
            describe(&abandoned),
            "Dump: abandoned at stream ready (received 0x4E)"
        );

        let refused = Dispatch {
            command: Command::Unknown(b'Z'),
            outcome: Outcome::Refused,
        };
        assert!(describe(&refused).ends_with("unknown command refused"));
    }

    #[test]
    fn test_load_backing_missing_file_is_blank() {
        let dir = tempfile::tempdir().unwrap();
        let contents = load_backing(&dir.path().join("chip.bin")).unwrap();
        assert!(contents.is_empty());
    }

    #[test]
    fn test_load_backing_reads_existing_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("chip.bin");
        fs::write(&path, [0xEA; 300]).unwrap();
        assert_eq!(load_backing(&path).unwrap().len(), 300);
    }
}
