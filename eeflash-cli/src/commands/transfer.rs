//! Signature, listing, dump, write and verify command implementations.

use std::fs;
use std::io::Write as _;
use std::path::Path;

use anyhow::{Context, Result};
use console::style;
use eeflash::image::{load_image, pad_to_page_unit};
use eeflash::protocol::{EEPROM_CAPACITY, check_read_size, check_write_size, page_units};
use eeflash::{
    NativePort, Port, Programmer, ProgrammerConfig, SerialConfig, SessionState, VerifyReport,
    WriteReport,
};
use indicatif::{ProgressBar, ProgressDrawTarget, ProgressStyle};
use log::{info, warn};

use crate::config::Config;
use crate::{Cli, CliError, get_port, use_fancy_output, was_interrupted};

/// Mismatches echoed to the terminal before the rest is summarised.
const SHOWN_MISMATCHES: usize = 16;

fn ensure_not_interrupted() -> Result<()> {
    if was_interrupted() {
        Err(CliError::Cancelled("Interrupted".into()).into())
    } else {
        Ok(())
    }
}

fn to_u64(n: usize) -> u64 {
    u64::try_from(n).unwrap_or(u64::MAX)
}

/// Open the bridge port and wrap it in a programmer.
pub(crate) fn connect(cli: &Cli, config: &mut Config) -> Result<Programmer<NativePort>> {
    let port_name = get_port(cli, config)?;
    let settings = config.link_settings(cli.baud, cli.timeout);
    if !cli.quiet {
        eprintln!(
            "{} Using {} @ {} baud",
            style("🔌").cyan(),
            port_name,
            settings.baud
        );
    }

    let serial = SerialConfig::new(&port_name, settings.baud);
    let port = NativePort::open(&serial).with_context(|| format!("Cannot open {port_name}"))?;
    ensure_not_interrupted()?;

    Ok(Programmer::with_config(
        port,
        ProgrammerConfig::default().with_timeout(settings.timeout),
    ))
}

/// Classify a failed session; a bridge that never answered the signature
/// request is reported as not responding.
pub(crate) fn session_error<P: Port>(programmer: &Programmer<P>, err: eeflash::Error) -> anyhow::Error {
    if err.is_timeout() && programmer.aborted_in() == Some(SessionState::AwaitHandshake) {
        return CliError::DeviceNotResponding(format!(
            "No signature from the bridge on {}: {err}",
            programmer
                .port()
                .name()
        ))
        .into();
    }
    err.into()
}

fn progress_bar(cli: &Cli, total: usize, message: &'static str) -> ProgressBar {
    if cli.quiet || !use_fancy_output() {
        return ProgressBar::hidden();
    }

    let pb = ProgressBar::new(to_u64(total));
    if let Ok(bar_style) = ProgressStyle::default_bar()
        .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {bytes}/{total_bytes} {msg}")
    {
        pb.set_style(bar_style.progress_chars("#>-"));
    }
    pb.set_draw_target(ProgressDrawTarget::stderr());
    pb.set_message(message);
    pb
}

/// Signature command implementation.
pub(crate) fn cmd_signature(cli: &Cli, config: &mut Config) -> Result<()> {
    let mut programmer = connect(cli, config)?;
    let version = programmer
        .signature()
        .map_err(|e| session_error(&programmer, e))?;

    println!("{version}");
    if !cli.quiet {
        eprintln!("{} Bridge firmware v{version}", style("✓").green());
    }
    Ok(())
}

/// Read command implementation: the bridge's own hex listing.
pub(crate) fn cmd_read(cli: &Cli, config: &mut Config) -> Result<()> {
    let mut programmer = connect(cli, config)?;
    let listing = programmer
        .read_listing()
        .map_err(|e| session_error(&programmer, e))?;

    let mut stdout = std::io::stdout().lock();
    stdout.write_all(listing.as_bytes())?;
    stdout.flush()?;
    Ok(())
}

/// Dump command implementation.
///
/// A bridge that stops mid-stream still leaves the received prefix in
/// `output`.
pub(crate) fn cmd_dump(cli: &Cli, config: &mut Config, output: &Path, size: usize) -> Result<()> {
    check_read_size(size, EEPROM_CAPACITY)?;

    let mut programmer = connect(cli, config)?;
    let pb = progress_bar(cli, size, "Dumping");

    match programmer.dump(size, |done, _| pb.set_position(to_u64(done))) {
        Ok(data) => {
            pb.finish_with_message("Complete");
            fs::write(output, &data)
                .with_context(|| format!("Failed to write {}", output.display()))?;
            if !cli.quiet {
                eprintln!(
                    "{} Saved {} bytes to {}",
                    style("✓").green(),
                    data.len(),
                    output.display()
                );
            }
            Ok(())
        },
        Err(err) => {
            pb.abandon();
            if let Some(partial) = err
                .partial_data()
                .filter(|p| !p.is_empty())
            {
                fs::write(output, partial)
                    .with_context(|| format!("Failed to write {}", output.display()))?;
                warn!(
                    "Bridge went silent after {} of {size} bytes; partial dump saved to {}",
                    partial.len(),
                    output.display()
                );
            }
            Err(session_error(&programmer, err))
        },
    }
}

/// Write command implementation.
pub(crate) fn cmd_write(
    cli: &Cli,
    config: &mut Config,
    image_path: &Path,
    pad: bool,
    verify: bool,
) -> Result<()> {
    let mut image = load_image(image_path)
        .with_context(|| format!("Failed to read image {}", image_path.display()))?;
    if pad {
        let added = pad_to_page_unit(&mut image, 0xFF);
        if added > 0 {
            info!("Padded image with {added} bytes of 0xFF");
        }
    }
    check_write_size(image.len(), EEPROM_CAPACITY)
        .with_context(|| format!("Cannot write {}", image_path.display()))?;

    if !cli.quiet {
        eprintln!(
            "{} {} ({} bytes, {} page-units)",
            style("📦").cyan(),
            image_path.display(),
            image.len(),
            page_units(image.len())
        );
    }

    let mut programmer = connect(cli, config)?;
    let pb = progress_bar(cli, image.len(), "Writing");
    let report = match programmer.write_image(&image, |done, _| pb.set_position(to_u64(done))) {
        Ok(report) => report,
        Err(err) => {
            pb.abandon();
            return Err(session_error(&programmer, err));
        },
    };
    pb.finish_with_message("Complete");
    print_write_report(cli, &report);

    let verified = if verify {
        ensure_not_interrupted()?;
        let verify_report = run_verify(cli, &mut programmer, &image)?;
        print_verify_report(cli, &verify_report);
        Some(verify_report.is_ok())
    } else {
        None
    };

    if !report.is_clean() {
        anyhow::bail!(
            "Write finished with {} device errors and {} unacknowledged page-units",
            report.device_errors.len(),
            report.unacknowledged.len()
        );
    }
    if verified == Some(false) {
        anyhow::bail!("Verify BAD");
    }
    Ok(())
}

/// Verify command implementation.
pub(crate) fn cmd_verify(
    cli: &Cli,
    config: &mut Config,
    image_path: &Path,
    report_path: Option<&Path>,
    json: bool,
) -> Result<()> {
    let reference = load_image(image_path)
        .with_context(|| format!("Failed to read image {}", image_path.display()))?;
    check_read_size(reference.len(), EEPROM_CAPACITY)
        .with_context(|| format!("Cannot verify against {}", image_path.display()))?;

    let mut programmer = connect(cli, config)?;
    let report = run_verify(cli, &mut programmer, &reference)?;

    if let Some(path) = report_path {
        fs::write(path, report.to_report_lines())
            .with_context(|| format!("Failed to write report {}", path.display()))?;
        info!("Wrote verify report to {}", path.display());
    }

    if json {
        let value = serde_json::json!({
            "ok": report.is_ok(),
            "size": report.size,
            "mismatches": report.mismatches,
        });
        println!("{}", serde_json::to_string_pretty(&value)?);
    } else {
        print_verify_report(cli, &report);
    }

    if report.is_ok() {
        Ok(())
    } else {
        anyhow::bail!(
            "Verify BAD: {} of {} bytes differ",
            report.mismatches.len(),
            report.size
        )
    }
}

fn run_verify(
    cli: &Cli,
    programmer: &mut Programmer<NativePort>,
    reference: &[u8],
) -> Result<VerifyReport> {
    let pb = progress_bar(cli, reference.len(), "Verifying");
    match programmer.verify(reference, |done, _| pb.set_position(to_u64(done))) {
        Ok(report) => {
            pb.finish_with_message("Complete");
            Ok(report)
        },
        Err(err) => {
            pb.abandon();
            Err(session_error(programmer, err))
        },
    }
}

fn print_write_report(cli: &Cli, report: &WriteReport) {
    for err in &report.device_errors {
        eprintln!(
            "  {} page-unit {}: {err}",
            style("✗").red(),
            err.page_unit
        );
    }
    for missing in &report.unacknowledged {
        eprintln!(
            "  {} page-unit {} answered {} instead of ACK",
            style("✗").red(),
            missing.page_unit,
            missing.status
        );
    }
    if report.is_clean() && !cli.quiet {
        eprintln!(
            "{} Wrote {} bytes ({} page-units)",
            style("✓").green(),
            report.bytes,
            report.page_units
        );
    }
}

fn print_verify_report(cli: &Cli, report: &VerifyReport) {
    if report.is_ok() {
        if !cli.quiet {
            eprintln!("{} Verify OK ({} bytes)", style("✓").green(), report.size);
        }
        return;
    }

    eprintln!(
        "{} Verify BAD: {} mismatching bytes",
        style("✗").red().bold(),
        report.mismatches.len()
    );
    for m in report.mismatches.iter().take(SHOWN_MISMATCHES) {
        eprintln!("  {m}");
    }
    if report.mismatches.len() > SHOWN_MISMATCHES {
        eprintln!(
            "  {}",
            style(format!(
                "... and {} more",
                report.mismatches.len() - SHOWN_MISMATCHES
            ))
            .dim()
        );
    }
}

#[cfg(test)]
mod tests {
    use std::thread;
    use std::time::Duration;

    use eeflash::{DeviceLink, PipePort};

    use super::*;
    use crate::exit_code_for;

    fn quick(port: PipePort) -> Programmer<PipePort> {
        Programmer::with_config(
            port,
            ProgrammerConfig::default().with_timeout(Duration::from_millis(50)),
        )
    }

    #[test]
    fn test_silent_bridge_is_not_responding() {
        let (host, _bridge) = PipePort::pair();
        let mut programmer = quick(host);
        let err = programmer
            .signature()
            .unwrap_err();
        let err = session_error(&programmer, err);
        assert_eq!(exit_code_for(&err), 4);
    }

    #[test]
    fn test_refused_handshake_is_a_runtime_failure() {
        let (host, mut bridge) = PipePort::pair();
        let refuser = thread::spawn(move || {
            let command = bridge.read_byte().unwrap();
            bridge.write_bytes(b"N").unwrap();
            command
        });
        let mut programmer = quick(host);
        let err = programmer
            .signature()
            .unwrap_err();
        assert_eq!(refuser.join().unwrap(), b'S');
        assert_eq!(programmer.aborted_in(), Some(SessionState::AwaitHandshake));

        let err = session_error(&programmer, err);
        assert_eq!(exit_code_for(&err), 1);
    }
}
