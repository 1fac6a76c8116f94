//! System clipboard access for copying a slot's output.

use anyhow::{Context, Result};
use tracing::debug;

pub fn copy_text(text: &str) -> Result<()> {
    let mut clipboard = arboard::Clipboard::new().context("clipboard is not available")?;
    clipboard
        .set_text(text.to_owned())
        .context("failed to put output on the clipboard")?;
    debug!(bytes = text.len(), "copied output to clipboard");
    Ok(())
}
