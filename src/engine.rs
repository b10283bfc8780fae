//! Signaling Protocol Engine (C6) and Lifecycle Reaper (C7).
//!
//! Owns the per-socket state machine. Parses nothing itself (that's
//! [`crate::protocol`] via `serde`), but dispatches every inbound variant,
//! drives the provisioning sequence, and reaps Clients/Connections on
//! disconnect or unexpected `sshd` exit.

use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::client::{Client, ClientType, SocketId};
use crate::config::Config;
use crate::error::BrokerError;
use crate::keys;
use crate::protocol::{InboundMessage, OutboundMessage, PortNumber};
use crate::registry::{PendingApproval, Registries};
use crate::sshd::{self, SshdOptions, SshdSpawner};

struct EngineState {
    registries: Registries,
    sshd_path: PathBuf,
    forwarding_user: String,
    host_keys: Vec<PathBuf>,
    sshd_exit_tx: mpsc::UnboundedSender<u16>,
    spawner: Arc<dyn SshdSpawner>,
}

#[derive(Clone)]
pub struct Engine {
    state: Arc<EngineState>,
}

impl Engine {
    /// Build the engine and spawn the background task that reconciles
    /// unexpected `sshd` exits with the Connection Registry.
    pub fn new(config: &Config, host_keys: Vec<PathBuf>) -> Self {
        Self::with_spawner(config, host_keys, Arc::new(sshd::RealSpawner))
    }

    fn with_spawner(
        config: &Config,
        host_keys: Vec<PathBuf>,
        spawner: Arc<dyn SshdSpawner>,
    ) -> Self {
        let (sshd_exit_tx, mut sshd_exit_rx) = mpsc::unbounded_channel::<u16>();
        let registries = Registries::new(config.opened_ports.clone());

        let state = Arc::new(EngineState {
            registries,
            sshd_path: config.sshd_path.clone(),
            forwarding_user: config.forwarding_user.clone(),
            host_keys,
            sshd_exit_tx,
            spawner,
        });

        let watcher_state = state.clone();
        tokio::spawn(async move {
            while let Some(sshd_port) = sshd_exit_rx.recv().await {
                reap_by_sshd_port(&watcher_state, sshd_port).await;
            }
        });

        Engine { state }
    }

    pub async fn dispatch(
        &self,
        socket_id: SocketId,
        reply: &mpsc::UnboundedSender<OutboundMessage>,
        msg: InboundMessage,
    ) {
        let result = match msg {
            InboundMessage::Register {
                ssh_key,
                uuid,
                auto_accept,
                port_whitelist,
                port_blacklist,
                client_type,
            } => {
                self.handle_register(
                    socket_id,
                    reply.clone(),
                    ssh_key,
                    uuid,
                    auto_accept,
                    port_whitelist,
                    port_blacklist,
                    client_type,
                )
                .await
            }
            InboundMessage::ConnectToHost { target, port } => {
                self.handle_connect_to_host(socket_id, target, port.get()).await
            }
            InboundMessage::ConnectAccept => self.handle_connect_accept(socket_id).await,
            InboundMessage::ConnectDeny => self.handle_connect_deny(socket_id).await,
        };

        match result {
            Ok(None) => {}
            Ok(Some(ok_message)) => {
                let _ = reply.send(ok_message);
            }
            Err(e) => {
                let _ = reply.send(OutboundMessage::err(e.message()));
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn handle_register(
        &self,
        socket_id: SocketId,
        sender: mpsc::UnboundedSender<OutboundMessage>,
        ssh_key: String,
        uuid: String,
        auto_accept: bool,
        port_whitelist: Vec<u16>,
        port_blacklist: Vec<u16>,
        client_type: ClientType,
    ) -> Result<Option<OutboundMessage>, BrokerError> {
        Client::validate_policy(&port_whitelist, &port_blacklist)?;

        let client = Client {
            uuid: uuid.clone(),
            ssh_key,
            auto_accept,
            port_whitelist,
            port_blacklist,
            client_type,
            socket_id,
            sender,
        };

        let is_new = self.state.registries.upsert(client).await;
        debug!(socket_id, %uuid, is_new, "client registered");
        Ok(Some(OutboundMessage::ok()))
    }

    async fn handle_connect_to_host(
        &self,
        socket_id: SocketId,
        target_prefix: String,
        port: u16,
    ) -> Result<Option<OutboundMessage>, BrokerError> {
        let requester = self
            .state
            .registries
            .by_socket(socket_id)
            .await
            .ok_or(BrokerError::NotRegistered)?;

        if requester.client_type != ClientType::Receiver {
            return Err(BrokerError::NotReceiver);
        }

        let mut matches = self.state.registries.find_senders_by_prefix(&target_prefix).await;
        let target = match matches.len() {
            0 => return Err(BrokerError::TargetNotFound),
            1 => matches.pop().unwrap(),
            _ => return Err(BrokerError::TargetAmbiguous),
        };

        if !target.permits_port(port) {
            return Err(BrokerError::PortDenied { port });
        }

        if target.auto_accept {
            self.provision(target, requester, port).await;
            return Ok(None);
        }

        let _ = target.sender.send(OutboundMessage::ConnectConfirm {
            source_client: requester.uuid.clone(),
            port,
        });
        self.state
            .registries
            .add_pending_approval(
                target.socket_id,
                PendingApproval {
                    requester_socket: requester.socket_id,
                    requester_uuid: requester.uuid.clone(),
                    port,
                },
            )
            .await;

        Ok(None)
    }

    async fn handle_connect_accept(
        &self,
        socket_id: SocketId,
    ) -> Result<Option<OutboundMessage>, BrokerError> {
        let target = self
            .state
            .registries
            .by_socket(socket_id)
            .await
            .ok_or(BrokerError::NotRegistered)?;

        let Some(approval) = self.state.registries.pop_pending_approval(socket_id).await else {
            return Ok(None);
        };

        match self.state.registries.by_socket(approval.requester_socket).await {
            Some(requester) => {
                self.provision(target, requester, approval.port).await;
            }
            None => {
                debug!(socket_id, "requester disconnected before approval was accepted");
            }
        }

        Ok(None)
    }

    async fn handle_connect_deny(
        &self,
        socket_id: SocketId,
    ) -> Result<Option<OutboundMessage>, BrokerError> {
        self.state
            .registries
            .by_socket(socket_id)
            .await
            .ok_or(BrokerError::NotRegistered)?;

        if let Some(approval) = self.state.registries.pop_pending_approval(socket_id).await {
            if let Some(requester) = self.state.registries.by_socket(approval.requester_socket).await {
                let _ = requester
                    .sender
                    .send(OutboundMessage::err(BrokerError::PeerDenied.message()));
            }
        }
        Ok(None)
    }

    /// Allocate ports, emit the keys script, spawn `sshd`, wait for readiness, commit the
    /// Connection, and notify both peers. Any failure along the way tears
    /// down whatever partial state it created and reports the error to the
    /// requester only (the target never asked for anything; it just
    /// accepted).
    async fn provision(&self, sender: Client, receiver: Client, port: u16) {
        let (reservation_id, sshd_port, local_port) =
            match self
                .state
                .registries
                .reserve(sender.uuid.clone(), receiver.uuid.clone(), sender.socket_id, receiver.socket_id)
                .await
            {
                Ok(r) => r,
                Err(e) => {
                    let _ = receiver.sender.send(OutboundMessage::err(e.message()));
                    return;
                }
            };

        let script_path = match keys::emit(sshd_port, &sender.ssh_key, &receiver.ssh_key).await {
            Ok(p) => p,
            Err(e) => {
                warn!(sshd_port, error = %e, "failed to emit authorized_keys script");
                self.state.registries.cancel(reservation_id).await;
                let _ = receiver
                    .sender
                    .send(OutboundMessage::err(BrokerError::Internal(e.to_string()).message()));
                return;
            }
        };

        let opts = SshdOptions {
            sshd_path: self.state.sshd_path.clone(),
            forwarding_user: self.state.forwarding_user.clone(),
            sshd_port,
            local_port,
            authorized_keys_command: script_path.clone(),
            host_keys: self.state.host_keys.clone(),
        };

        let handle = match self
            .state
            .spawner
            .spawn_and_wait_ready(opts, self.state.sshd_exit_tx.clone())
            .await
        {
            Ok(h) => h,
            Err(e) => {
                warn!(sshd_port, error = %e, "sshd failed to spawn or become ready");
                self.state.registries.cancel(reservation_id).await;
                let _ = keys::remove(&script_path).await;
                let _ = receiver
                    .sender
                    .send(OutboundMessage::err(BrokerError::Internal(e.to_string()).message()));
                return;
            }
        };

        self.state
            .registries
            .commit(reservation_id, handle, script_path)
            .await;

        info!(sshd_port, local_port, sender = %sender.uuid, receiver = %receiver.uuid, "tunnel provisioned");

        let _ = receiver.sender.send(OutboundMessage::TunnelConnect {
            client_type: ClientType::Receiver,
            user: self.state.forwarding_user.clone(),
            sshd_port,
            local_port,
            forwarded_port: 0,
        });
        let _ = sender.sender.send(OutboundMessage::TunnelConnect {
            client_type: ClientType::Sender,
            user: self.state.forwarding_user.clone(),
            sshd_port,
            local_port,
            forwarded_port: port,
        });
    }

    /// Lifecycle Reaper (C7), triggered by websocket close.
    pub async fn handle_disconnect(&self, socket_id: SocketId) {
        self.state.registries.remove_pending_requester(socket_id).await;

        let outcome = self.state.registries.reap(socket_id).await;

        if outcome.client.is_none() && outcome.connection.is_none() {
            return;
        }

        for orphan in outcome.orphaned_requesters {
            if let Some(requester) = self.state.registries.by_socket(orphan.requester_socket).await {
                let _ = requester
                    .sender
                    .send(OutboundMessage::err(BrokerError::TargetDisconnected.message()));
            }
        }

        if let Some(connection) = outcome.connection {
            let peer_socket = connection.peer_of(socket_id);
            if let Some(peer_socket) = peer_socket {
                if let Some(peer) = self.state.registries.by_socket(peer_socket).await {
                    let _ = peer.sender.send(OutboundMessage::TunnelClose);
                }
            }
            connection.sshd.kill();
            let _ = keys::remove(&connection.authorized_keys_script_path).await;
        }
    }
}

/// Shared by the watcher background task and (conceptually) the normal
/// teardown path; a no-op if the connection was already reaped.
async fn reap_by_sshd_port(state: &Arc<EngineState>, sshd_port: u16) {
    let Some(connection) = state.registries.reap_by_sshd_port(sshd_port).await else {
        return;
    };

    for socket in [connection.sender_socket, connection.receiver_socket] {
        if let Some(client) = state.registries.by_socket(socket).await {
            let _ = client.sender.send(OutboundMessage::TunnelClose);
        }
    }

    let _ = keys::remove(&connection.authorized_keys_script_path).await;
    warn!(sshd_port, "reaped connection after unexpected sshd exit");
}
