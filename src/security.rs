#![forbid(unsafe_code)]

//! Process-level safety checks for the backend binary.

use anyhow::{Result, bail};
use nix::unistd::Uid;

/// Fails fast when the server is started as root. Uploads are written to disk
/// with the server's privileges, so it must run under an unprivileged
/// account.
pub fn ensure_not_root(process: &str) -> Result<()> {
    if Uid::current().is_root() {
        bail!("{process} must not be run as root; start it under a dedicated service account");
    }
    Ok(())
}
