//! eeflash CLI - program, dump and verify parallel EEPROMs through a serial
//! bridge.
//!
//! ## Features
//!
//! - Write, dump and verify images (28C256 and compatibles)
//! - Hex listing and software data protection control
//! - Interactive serial port selection
//! - Bridge emulation on a serial port for testing host tooling
//! - Shell completion generation
//! - Environment variable and config file support

use std::env;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::Result;
use clap::{Parser, Subcommand, ValueEnum};
use clap_complete::Shell;
use console::style;
use env_logger::Env;
use log::debug;

mod commands;
mod config;
mod serial;

use config::Config;
use serial::{SerialOptions, ask_remember_port, select_serial_port};

/// Whether stderr is a terminal (set once at startup).
static STDERR_IS_TTY: AtomicBool = AtomicBool::new(true);

/// Set by the Ctrl-C handler.
static INTERRUPTED: AtomicBool = AtomicBool::new(false);

/// Check if emoji/animations should be used (TTY and colors enabled).
fn use_fancy_output() -> bool {
    STDERR_IS_TTY.load(Ordering::Relaxed) && console::colors_enabled_stderr()
}

/// Whether Ctrl-C was pressed.
pub(crate) fn was_interrupted() -> bool {
    INTERRUPTED.load(Ordering::Relaxed)
}

/// Failures with a dedicated exit code.
#[derive(Debug, thiserror::Error)]
pub(crate) enum CliError {
    /// Bad invocation or ambiguous setup (exit 2).
    #[error("{0}")]
    Usage(String),
    /// Unusable configuration (exit 3).
    #[error("{0}")]
    Config(String),
    /// Bridge missing or silent (exit 4).
    #[error("{0}")]
    DeviceNotResponding(String),
    /// Interrupted by the user (exit 130).
    #[error("{0}")]
    Cancelled(String),
}

impl CliError {
    fn exit_code(&self) -> u8 {
        match self {
            Self::Usage(_) => 2,
            Self::Config(_) => 3,
            Self::DeviceNotResponding(_) => 4,
            Self::Cancelled(_) => 130,
        }
    }
}

/// Map an error, including any context layered on top, to the process exit code.
fn exit_code_for(err: &anyhow::Error) -> u8 {
    if let Some(cli_err) = err.downcast_ref::<CliError>() {
        return cli_err.exit_code();
    }
    match err.downcast_ref::<eeflash::Error>() {
        Some(eeflash::Error::Interrupted) => 130,
        Some(eeflash::Error::Config(_)) => 3,
        Some(eeflash::Error::DeviceNotFound | eeflash::Error::Serial(_)) => 4,
        _ => 1,
    }
}

/// eeflash - program parallel EEPROMs through a serial bus bridge.
///
/// Environment variables:
///   EEFLASH_PORT              - Default serial port
///   EEFLASH_BAUD              - Default baud rate (default: 115200)
///   EEFLASH_TIMEOUT           - Reply timeout in seconds (default: 5)
///   EEFLASH_NON_INTERACTIVE   - Non-interactive mode (disable prompts)
#[derive(Parser)]
#[command(name = "eeflash")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
#[command(after_help = "Examples:\n  \
    eeflash -p /dev/ttyACM0 write rom.bin\n  \
    eeflash dump -o backup.bin -s 32K\n  \
    eeflash verify rom.bin -o mismatches.txt")]
pub(crate) struct Cli {
    /// Serial port of the bridge (auto-detected if not specified).
    #[arg(short, long, global = true, env = "EEFLASH_PORT")]
    port: Option<String>,

    /// Baud rate [default: 115200].
    #[arg(
        short,
        long,
        global = true,
        env = "EEFLASH_BAUD",
        value_parser = clap::value_parser!(u32).range(1..)
    )]
    baud: Option<u32>,

    /// Reply timeout in seconds [default: 5].
    #[arg(
        long,
        global = true,
        env = "EEFLASH_TIMEOUT",
        value_name = "SECS",
        value_parser = clap::value_parser!(u64).range(1..)
    )]
    timeout: Option<u64>,

    /// Verbose output level (-v, -vv for increasing detail).
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Quiet mode (suppress non-essential output).
    #[arg(short, long, global = true)]
    quiet: bool,

    /// Non-interactive mode (fail instead of prompting).
    #[arg(long, global = true, env = "EEFLASH_NON_INTERACTIVE")]
    non_interactive: bool,

    /// Path to a configuration file.
    #[arg(long = "config", global = true, value_name = "PATH")]
    config_path: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

/// Protection switch.
#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub(crate) enum ProtectAction {
    /// Lock the part against stray writes.
    Enable,
    /// Unlock the part for writing.
    Disable,
}

/// Available commands.
#[derive(Subcommand)]
enum Commands {
    /// Handshake with the bridge and print its firmware version.
    Signature,

    /// Print the bridge's hex listing of the whole EEPROM.
    Read,

    /// Dump EEPROM contents into a file.
    Dump {
        /// Output file.
        #[arg(short, long, value_name = "FILE")]
        output: PathBuf,

        /// Bytes to read: decimal, 0x hex, or with a K suffix (32K).
        #[arg(short, long, value_parser = parse_size_arg)]
        size: usize,
    },

    /// Program an image into the EEPROM.
    Write {
        /// Image file; its length must be a multiple of 256 bytes.
        image: PathBuf,

        /// Pad the image with 0xFF up to the next 256-byte boundary.
        #[arg(long)]
        pad: bool,

        /// Dump and compare after writing.
        #[arg(long)]
        verify: bool,
    },

    /// Dump the EEPROM and compare it against an image.
    Verify {
        /// Reference image.
        image: PathBuf,

        /// Write one "AAAA: EE, RR" line per mismatch to this file.
        #[arg(short, long, value_name = "REPORT")]
        output: Option<PathBuf>,

        /// Print the verification result as JSON to stdout.
        #[arg(long)]
        json: bool,
    },

    /// Enable or disable software data protection.
    Protect {
        /// Whether to lock or unlock the part.
        #[arg(value_enum)]
        action: ProtectAction,
    },

    /// List available serial ports.
    ListPorts {
        /// Output port list as JSON to stdout.
        #[arg(long)]
        json: bool,
    },

    /// Act as the bridge on a serial port, backed by a simulated EEPROM.
    Emulate {
        /// Load the simulated memory from this file and save it back on exit.
        #[arg(long, value_name = "FILE")]
        backing: Option<PathBuf>,
    },

    /// Generate shell completion scripts.
    Completions {
        /// Shell type for completions (auto-detected if not specified with --install).
        #[arg(value_enum)]
        shell: Option<Shell>,

        /// Automatically install completions to your shell configuration.
        #[arg(long)]
        install: bool,
    },
}

fn parse_size_arg(s: &str) -> Result<usize, String> {
    eeflash::image::parse_size(s).map_err(|e| e.to_string())
}

fn init_logging(cli: &Cli) {
    let log_level = if cli.quiet {
        "warn"
    } else {
        match cli.verbose {
            0 => "info",
            1 => "debug",
            _ => "trace",
        }
    };
    env_logger::Builder::from_env(Env::default().default_filter_or(log_level))
        .format_target(cli.verbose >= 2)
        .format_timestamp(if cli.verbose >= 2 {
            Some(env_logger::TimestampPrecision::Millis)
        } else {
            None
        })
        .init();
}

fn install_interrupt_handler() {
    if let Err(e) = ctrlc::set_handler(|| INTERRUPTED.store(true, Ordering::Relaxed)) {
        debug!("Could not install Ctrl-C handler: {e}");
    }
    eeflash::set_interrupt_checker(was_interrupted);
}

fn main() -> ExitCode {
    // NO_COLOR and TTY detection
    let stderr_is_tty = console::Term::stderr().is_term();
    STDERR_IS_TTY.store(stderr_is_tty, Ordering::Relaxed);
    if env::var_os("NO_COLOR").is_some() || !stderr_is_tty {
        console::set_colors_enabled(false);
        console::set_colors_enabled_stderr(false);
    }

    let cli = Cli::parse();
    init_logging(&cli);
    install_interrupt_handler();

    debug!(
        "eeflash v{} (verbose level: {})",
        env!("CARGO_PKG_VERSION"),
        cli.verbose
    );

    match run(&cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!(
                "{} {err:#}",
                style("Error:")
                    .red()
                    .bold()
            );
            ExitCode::from(exit_code_for(&err))
        },
    }
}

fn run(cli: &Cli) -> Result<()> {
    let mut config = match &cli.config_path {
        Some(path) => Config::load_from_path(path)?,
        None => Config::load(),
    };

    match &cli.command {
        Commands::Signature => commands::transfer::cmd_signature(cli, &mut config),
        Commands::Read => commands::transfer::cmd_read(cli, &mut config),
        Commands::Dump { output, size } => {
            commands::transfer::cmd_dump(cli, &mut config, output, *size)
        },
        Commands::Write { image, pad, verify } => {
            let verify = *verify || config.transfer.verify_after_write;
            commands::transfer::cmd_write(cli, &mut config, image, *pad, verify)
        },
        Commands::Verify {
            image,
            output,
            json,
        } => commands::transfer::cmd_verify(cli, &mut config, image, output.as_deref(), *json),
        Commands::Protect { action } => commands::protect::cmd_protect(cli, &mut config, *action),
        Commands::ListPorts { json } => {
            commands::ports::cmd_list_ports(&config, *json);
            Ok(())
        },
        Commands::Emulate { backing } => {
            commands::emulate::cmd_emulate(cli, &config, backing.as_deref())
        },
        Commands::Completions { shell, install } => {
            if *install {
                commands::completions::cmd_completions_install(*shell)
            } else {
                let shell = shell.ok_or_else(|| {
                    CliError::Usage(
                        "specify a shell type, e.g.: eeflash completions bash \
                         (or use --install to auto-detect)"
                            .into(),
                    )
                })?;
                commands::completions::cmd_completions(shell);
                Ok(())
            }
        },
    }
}

/// Get serial port from CLI args, config, or interactive selection.
fn get_port(cli: &Cli, config: &mut Config) -> Result<String> {
    let options = SerialOptions {
        port: cli.port.clone(),
        non_interactive: cli.non_interactive,
    };

    let selected = select_serial_port(&options, config)?;

    if !selected.is_known && !cli.non_interactive && cli.port.is_none() {
        ask_remember_port(&selected.port, config)?;
    }

    Ok(selected.port.name)
}
