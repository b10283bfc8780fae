//! AuthorizedKeys Script Emitter (C4).
//!
//! Writes the ephemeral executable `sshd` invokes as `AuthorizedKeysCommand`
//! for one connection's port. The script just echoes the two forced-command
//! authorized_keys lines for the connection's two participants; it never
//! grants an interactive shell.

use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tokio::fs;

const KEYS_DIR: &str = "/tmp/authorized_keys";

fn forced_command_line(public_key: &str) -> String {
    format!(
        "command=\"echo 'This account is restricted to port forwarding'\",no-pty,no-agent-forwarding,no-X11-forwarding {}",
        public_key.trim()
    )
}

/// Write the script for `sshd_port`, authorizing `sender_key` and
/// `receiver_key`. Returns the absolute path, ready to hand to `sshd` as
/// `AuthorizedKeysCommand`.
pub async fn emit(sshd_port: u16, sender_key: &str, receiver_key: &str) -> Result<PathBuf> {
    let dir = Path::new(KEYS_DIR);
    if !dir.exists() {
        fs::create_dir_all(dir)
            .await
            .with_context(|| format!("creating {}", dir.display()))?;
        fs::set_permissions(dir, std::fs::Permissions::from_mode(0o700))
            .await
            .with_context(|| format!("setting owner-only permissions on {}", dir.display()))?;
    }

    let path = dir.join(format!("authorized_keys_{sshd_port}"));
    if path.exists() {
        fs::remove_file(&path)
            .await
            .with_context(|| format!("removing stale {}", path.display()))?;
    }

    let script = format!(
        "#!/bin/sh\necho \"{}\"\necho \"{}\"\n",
        forced_command_line(sender_key),
        forced_command_line(receiver_key),
    );
    fs::write(&path, script)
        .await
        .with_context(|| format!("writing {}", path.display()))?;

    // sshd's handling of a non-executable AuthorizedKeysCommand target is
    // undocumented; set the bit explicitly instead of relying on it.
    fs::set_permissions(&path, std::fs::Permissions::from_mode(0o700))
        .await
        .with_context(|| format!("marking {} executable", path.display()))?;

    Ok(path)
}

/// Remove a connection's script on teardown. Missing files are not an error.
pub async fn remove(path: &Path) -> Result<()> {
    match fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e).with_context(|| format!("removing {}", path.display())),
    }
}
