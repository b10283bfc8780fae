//! Host-Key Bootstrap (A2).
//!
//! A one-shot startup step: ensure the three host-key files `sshd` needs
//! exist under `KEYS_FOLDER`, generating any that are missing.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tokio::fs;
use tokio::process::Command;
use tracing::info;

struct HostKeySpec {
    filename: &'static str,
    key_type: &'static str,
    bits: Option<&'static str>,
}

const HOST_KEY_SPECS: &[HostKeySpec] = &[
    HostKeySpec {
        filename: "ssh_host_rsa_key",
        key_type: "rsa",
        bits: Some("4096"),
    },
    HostKeySpec {
        filename: "ssh_host_ecdsa_key",
        key_type: "ecdsa",
        bits: None,
    },
    HostKeySpec {
        filename: "ssh_host_ed25519_key",
        key_type: "ed25519",
        bits: None,
    },
];

/// Generate any missing host keys under `keys_folder`, returning their paths
/// in the fixed order rsa, ecdsa, ed25519.
pub async fn ensure_host_keys(keys_folder: &Path) -> Result<Vec<PathBuf>> {
    fs::create_dir_all(keys_folder)
        .await
        .with_context(|| format!("creating {}", keys_folder.display()))?;

    let mut paths = Vec::with_capacity(HOST_KEY_SPECS.len());
    for spec in HOST_KEY_SPECS {
        let path = keys_folder.join(spec.filename);
        if !path.exists() {
            info!(key_type = spec.key_type, path = %path.display(), "generating host key");
            generate(&path, spec).await?;
        }
        paths.push(path);
    }
    Ok(paths)
}

async fn generate(path: &Path, spec: &HostKeySpec) -> Result<()> {
    let mut cmd = Command::new("ssh-keygen");
    cmd.arg("-q").arg("-N").arg("").arg("-t").arg(spec.key_type);
    if let Some(bits) = spec.bits {
        cmd.arg("-b").arg(bits);
    }
    cmd.arg("-f").arg(path);

    let status = cmd
        .status()
        .await
        .with_context(|| format!("spawning ssh-keygen for {}", path.display()))?;

    if !status.success() {
        anyhow::bail!("ssh-keygen exited with status {status} for {}", path.display());
    }
    Ok(())
}
