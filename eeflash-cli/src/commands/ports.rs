//! Serial port listing.

use console::style;
use eeflash::discovery::{DetectedPort, detect_ports, select_port};

use crate::config::Config;

fn is_configured(port: &DetectedPort, config: &Config) -> bool {
    match (port.vid, port.pid) {
        (Some(vid), Some(pid)) => config
            .connection
            .usb_device
            .iter()
            .any(|device| device.matches(vid, pid)),
        _ => false,
    }
}

fn ports_json(detected: &[DetectedPort], config: &Config) -> serde_json::Value {
    detected
        .iter()
        .map(|p| {
            serde_json::json!({
                "name": p.name,
                "bridge": p.bridge.name(),
                "known": p.is_likely_bridge() || is_configured(p, config),
                "vid": p.vid,
                "pid": p.pid,
                "manufacturer": p.manufacturer,
                "product": p.product,
                "serial": p.serial,
            })
        })
        .collect()
}

/// List ports command implementation.
pub(crate) fn cmd_list_ports(config: &Config, json: bool) {
    let detected = detect_ports();

    if json {
        println!(
            "{}",
            serde_json::to_string_pretty(&ports_json(&detected, config)).unwrap_or_default()
        );
        return;
    }

    eprintln!(
        "{}",
        style("Available serial ports")
            .bold()
            .underlined()
    );

    if detected.is_empty() {
        eprintln!("  {}", style("No serial ports found").dim());
        return;
    }

    for port in &detected {
        let bridge = if port.bridge.is_known() {
            format!(" [{}]", style(port.bridge.name()).yellow())
        } else if is_configured(port, config) {
            format!(" [{}]", style("configured").yellow())
        } else {
            String::new()
        };

        let vid_pid = if let (Some(vid), Some(pid)) = (port.vid, port.pid) {
            format!(" ({vid:04X}:{pid:04X})")
        } else {
            String::new()
        };

        let product = port
            .product
            .as_deref()
            .map(|p| format!(" - {}", style(p).dim()))
            .unwrap_or_default();

        eprintln!(
            "  {} {}{bridge}{vid_pid}{product}",
            style("•").green(),
            style(&port.name).cyan()
        );
    }

    if let Ok(auto_port) = select_port(detected) {
        eprintln!(
            "\n{} Auto-detect would use {}",
            style("→")
                .green()
                .bold(),
            style(&auto_port.name)
                .cyan()
                .bold()
        );
    }
}
