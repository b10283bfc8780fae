//! SSHD Supervisor (C5).
//!
//! Spawns a hardened `sshd` bound to a dedicated port pair, waits for it to
//! become ready via a TCP probe rather than a fixed warm-up sleep, and owns
//! the child for its entire lifetime through a dedicated supervising task:
//! normal teardown sends a kill signal over [`SshdHandle::kill_tx`]; an
//! unexpected exit is reported on `exit_tx` instead, so the engine can reap
//! the Connection exactly as it would for a socket close.

use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::net::TcpStream;
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, oneshot};
use tokio::time::{sleep, timeout};
use tracing::{debug, warn};

const READINESS_RETRIES: u32 = 20;
const READINESS_RETRY_DELAY: Duration = Duration::from_millis(100);
const KILL_TIMEOUT: Duration = Duration::from_secs(5);

pub struct SshdOptions {
    pub sshd_path: PathBuf,
    pub forwarding_user: String,
    pub sshd_port: u16,
    pub local_port: u16,
    pub authorized_keys_command: PathBuf,
    pub host_keys: Vec<PathBuf>,
}

/// A handle to a supervised `sshd` child. Dropping this without calling
/// [`SshdHandle::kill`] leaves the supervising task (and thus the child)
/// running; callers must always route teardown through `kill`.
pub struct SshdHandle {
    pub(crate) kill_tx: Option<oneshot::Sender<()>>,
}

impl SshdHandle {
    /// Request graceful termination of the supervised child.
    pub fn kill(mut self) {
        if let Some(tx) = self.kill_tx.take() {
            let _ = tx.send(());
        }
    }
}

pub(crate) type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Abstracts "spawn an `sshd` and hand back a live handle" so the engine can
/// be driven against a fake in tests without a real `sshd` binary present.
pub trait SshdSpawner: Send + Sync {
    fn spawn_and_wait_ready(
        &self,
        opts: SshdOptions,
        exit_tx: mpsc::UnboundedSender<u16>,
    ) -> BoxFuture<'static, Result<SshdHandle>>;
}

/// The production spawner: shells out to the real `sshd` binary.
pub struct RealSpawner;

impl SshdSpawner for RealSpawner {
    fn spawn_and_wait_ready(
        &self,
        opts: SshdOptions,
        exit_tx: mpsc::UnboundedSender<u16>,
    ) -> BoxFuture<'static, Result<SshdHandle>> {
        Box::pin(async move { spawn_and_wait_ready(&opts, exit_tx).await })
    }
}

/// Spawn `sshd` in foreground mode with every relevant option supplied on
/// the command line, wait for it to become ready, and hand supervision off
/// to a background task.
///
/// `exit_tx` receives `sshd_port` if the child exits before `kill` is
/// called on the returned handle.
async fn spawn_and_wait_ready(
    opts: &SshdOptions,
    exit_tx: mpsc::UnboundedSender<u16>,
) -> Result<SshdHandle> {
    let mut child = spawn(opts)?;

    if let Err(e) = wait_until_ready(opts.sshd_port).await {
        let _ = child.start_kill();
        let _ = child.wait().await;
        return Err(e);
    }

    let (kill_tx, kill_rx) = oneshot::channel();
    let sshd_port = opts.sshd_port;
    tokio::spawn(supervise(child, sshd_port, kill_rx, exit_tx));

    Ok(SshdHandle {
        kill_tx: Some(kill_tx),
    })
}

fn spawn(opts: &SshdOptions) -> Result<Child> {
    let mut cmd = Command::new(&opts.sshd_path);
    cmd.arg("-D")
        .arg("-f")
        .arg("/dev/null")
        .arg("-o")
        .arg(format!("AllowUsers={}", opts.forwarding_user))
        .arg("-o")
        .arg("PasswordAuthentication=no")
        .arg("-o")
        .arg("PubkeyAuthentication=yes")
        .arg("-o")
        .arg("AllowTcpForwarding=yes")
        .arg("-o")
        .arg("PermitTunnel=no")
        .arg("-o")
        .arg("PermitRootLogin=no")
        .arg("-o")
        .arg("X11Forwarding=no")
        .arg("-o")
        .arg("PermitUserEnvironment=no")
        .arg("-o")
        .arg("AllowAgentForwarding=no")
        .arg("-o")
        .arg(format!("Port={}", opts.sshd_port))
        .arg("-o")
        .arg(format!("PermitOpen=localhost:{}", opts.local_port))
        .arg("-o")
        .arg("AuthorizedKeysCommandUser=nobody")
        .arg("-o")
        .arg(format!(
            "AuthorizedKeysCommand={}",
            opts.authorized_keys_command.display()
        ));

    for host_key in &opts.host_keys {
        cmd.arg("-o").arg(format!("HostKey={}", host_key.display()));
    }

    cmd.stdout(std::process::Stdio::null())
        .stderr(std::process::Stdio::null())
        .kill_on_drop(true);

    cmd.spawn().context("spawning sshd")
}

/// Poll `localhost:<sshd_port>` until it accepts a connection or the retry
/// budget is exhausted.
async fn wait_until_ready(sshd_port: u16) -> Result<()> {
    for attempt in 0..READINESS_RETRIES {
        if TcpStream::connect(("127.0.0.1", sshd_port)).await.is_ok() {
            return Ok(());
        }
        if attempt + 1 < READINESS_RETRIES {
            sleep(READINESS_RETRY_DELAY).await;
        }
    }
    anyhow::bail!("sshd on port {sshd_port} did not become ready in time")
}

async fn supervise(
    mut child: Child,
    sshd_port: u16,
    kill_rx: oneshot::Receiver<()>,
    exit_tx: mpsc::UnboundedSender<u16>,
) {
    tokio::select! {
        status = child.wait() => {
            match status {
                Ok(status) => warn!(sshd_port, %status, "sshd child exited unexpectedly"),
                Err(e) => warn!(sshd_port, error = %e, "error watching sshd child"),
            }
            let _ = exit_tx.send(sshd_port);
        }
        _ = kill_rx => {
            if let Err(e) = child.start_kill() {
                warn!(sshd_port, error = %e, "failed to signal sshd child");
                return;
            }
            match timeout(KILL_TIMEOUT, child.wait()).await {
                Ok(Ok(status)) => debug!(sshd_port, %status, "sshd child reaped"),
                Ok(Err(e)) => warn!(sshd_port, error = %e, "error waiting for sshd child to exit"),
                Err(_) => warn!(sshd_port, "sshd child did not exit within kill timeout"),
            }
        }
    }
}
