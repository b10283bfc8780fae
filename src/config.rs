//! CLI / config loading and preflight checks (A1).

use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::Parser;

#[derive(Parser, Debug)]
#[command(name = "tunnel-broker")]
#[command(about = "Rendezvous and tunnel-broker server for SSH port forwarding")]
#[command(version)]
pub struct Cli {
    /// TCP port for the websocket listener.
    #[arg(short = 'p', long, env = "SERVER_PORT", default_value = "7856")]
    pub server_port: u16,

    /// System user under which the child sshd admits logins.
    #[arg(long, env = "FORWARDING_USER")]
    pub forwarding_user: String,

    /// Comma-separated list of candidate sshd ports.
    #[arg(long, env = "OPENED_PORTS", value_delimiter = ',')]
    pub opened_ports: Vec<u16>,

    /// Directory holding the three host-key files.
    #[arg(long, env = "KEYS_FOLDER", default_value = "keys")]
    pub keys_folder: PathBuf,

    /// Enable verbose logging.
    #[arg(short, long, env = "TUNNEL_BROKER_VERBOSE")]
    pub verbose: bool,
}

/// Validated configuration; construction runs every preflight check,
/// failing fast with a descriptive error if any fails.
pub struct Config {
    pub server_port: u16,
    pub forwarding_user: String,
    pub opened_ports: Vec<u16>,
    pub keys_folder: PathBuf,
    pub verbose: bool,
    pub sshd_path: PathBuf,
}

const SSHD_CANDIDATES: &[&str] = &["/usr/sbin/sshd", "/usr/bin/sshd"];

impl Config {
    pub fn from_cli(cli: Cli) -> Result<Self> {
        if cli.opened_ports.is_empty() {
            bail!("OPENED_PORTS must be a non-empty comma-separated list of ports");
        }

        let sshd_path = SSHD_CANDIDATES
            .iter()
            .map(PathBuf::from)
            .find(|p| p.exists())
            .context("sshd binary not found (looked in /usr/sbin/sshd, /usr/bin/sshd)")?;

        if !system_user_exists(&cli.forwarding_user) {
            bail!(
                "FORWARDING_USER '{}' does not exist on this host",
                cli.forwarding_user
            );
        }

        Ok(Self {
            server_port: cli.server_port,
            forwarding_user: cli.forwarding_user,
            opened_ports: cli.opened_ports,
            keys_folder: cli.keys_folder,
            verbose: cli.verbose,
            sshd_path,
        })
    }
}

/// Checks `/etc/passwd` for a matching username. This is a preflight check,
/// not a security boundary; it only needs to be right on Linux hosts where
/// this broker runs.
fn system_user_exists(username: &str) -> bool {
    match std::fs::read_to_string("/etc/passwd") {
        Ok(contents) => contents
            .lines()
            .any(|line| line.split(':').next() == Some(username)),
        Err(_) => false,
    }
}
