//! Software data protection command.

use anyhow::Result;
use console::style;

use super::transfer::{connect, session_error};
use crate::config::Config;
use crate::{Cli, ProtectAction};

/// Protect command implementation.
///
/// The bridge sends no reply to either sequence, so success means the
/// command went out after a good handshake.
pub(crate) fn cmd_protect(cli: &Cli, config: &mut Config, action: ProtectAction) -> Result<()> {
    let enable = action == ProtectAction::Enable;
    let mut programmer = connect(cli, config)?;
    programmer
        .set_protection(enable)
        .map_err(|e| session_error(&programmer, e))?;

    if !cli.quiet {
        eprintln!(
            "{} Write protection {}",
            style("✓").green(),
            if enable { "enabled" } else { "disabled" }
        );
    }
    Ok(())
}
