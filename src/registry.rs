//! Client registry + connection registry + port allocator, combined into a
//! single guarded module: these three share invariants, so a compound
//! `reserve`/`commit` pair is exposed instead of three independently-locked
//! collections.
//!
//! Also owns the `PendingApprovals` map used by the approval round-trip,
//! since cancellation on disconnect touches the same lock as client/
//! connection removal.

use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;

use tokio::sync::Mutex;

use crate::allocator;
use crate::client::{Client, SocketId};
use crate::connection::Connection;
use crate::error::BrokerError;
use crate::sshd::SshdHandle;

/// A requester waiting on a target's `connect_accept`/`connect_deny`.
#[derive(Debug, Clone)]
pub struct PendingApproval {
    pub requester_socket: SocketId,
    pub requester_uuid: String,
    pub port: u16,
}

/// Ports and participants reserved for a tunnel that is mid-provisioning
/// (sshd not yet spawned, or spawned but not yet confirmed ready). Held
/// separately from [`Connection`] so port allocation can observe it without
/// requiring a fully-constructed child process handle.
struct Reservation {
    sender_uuid: String,
    receiver_uuid: String,
    sender_socket: SocketId,
    receiver_socket: SocketId,
    sshd_port: u16,
    local_port: u16,
}

/// Opaque handle to a [`Reservation`], returned by `reserve` and consumed by
/// `commit`/`cancel`.
pub type ReservationId = u64;

#[derive(Default)]
struct Inner {
    clients_by_uuid: HashMap<String, SocketId>,
    clients_by_socket: HashMap<SocketId, Client>,
    connections: Vec<Connection>,
    reservations: HashMap<ReservationId, Reservation>,
    next_reservation_id: ReservationId,
    pending_approvals: HashMap<SocketId, VecDeque<PendingApproval>>,
}

pub struct Registries {
    opened_ports: Vec<u16>,
    inner: Mutex<Inner>,
}

/// What a socket close (or unexpected `sshd` exit) requires the caller to do.
pub struct ReapOutcome {
    pub client: Option<Client>,
    pub connection: Option<Connection>,
    /// Pending requesters that must be told the target disappeared, because
    /// the reaped socket was a target awaiting approval.
    pub orphaned_requesters: Vec<PendingApproval>,
}

impl Registries {
    pub fn new(opened_ports: Vec<u16>) -> Self {
        Self {
            opened_ports,
            inner: Mutex::new(Inner::default()),
        }
    }

    /// Insert or update a Client keyed by `uuid`. Returns whether a new
    /// entry was created (vs. an existing uuid's socket being replaced).
    pub async fn upsert(&self, client: Client) -> bool {
        let mut inner = self.inner.lock().await;
        let uuid = client.uuid.clone();
        let new_socket = client.socket_id;
        let is_new = match inner.clients_by_uuid.insert(uuid.clone(), new_socket) {
            Some(old_socket) if old_socket != new_socket => {
                inner.clients_by_socket.remove(&old_socket);
                false
            }
            Some(_) => false,
            None => true,
        };
        inner.clients_by_socket.insert(new_socket, client);
        is_new
    }

    pub async fn by_socket(&self, socket: SocketId) -> Option<Client> {
        self.inner.lock().await.clients_by_socket.get(&socket).cloned()
    }

    /// Senders whose uuid begins with `prefix`.
    pub async fn find_senders_by_prefix(&self, prefix: &str) -> Vec<Client> {
        use crate::client::ClientType;
        self.inner
            .lock()
            .await
            .clients_by_socket
            .values()
            .filter(|c| c.client_type == ClientType::Sender && c.uuid.starts_with(prefix))
            .cloned()
            .collect()
    }

    pub async fn remove_client(&self, socket: SocketId) -> Option<Client> {
        let mut inner = self.inner.lock().await;
        let client = inner.clients_by_socket.remove(&socket)?;
        if inner.clients_by_uuid.get(&client.uuid) == Some(&socket) {
            inner.clients_by_uuid.remove(&client.uuid);
        }
        Some(client)
    }

    pub async fn find_connection_by_participant(&self, socket: SocketId) -> bool {
        self.inner
            .lock()
            .await
            .connections
            .iter()
            .any(|c| c.involves(socket))
    }

    /// Allocate a port pair and reserve it (and the two participant sockets)
    /// atomically with respect to both other reservations and committed
    /// connections. The reservation holds the ports until `commit` or
    /// `cancel` is called.
    pub async fn reserve(
        &self,
        sender_uuid: String,
        receiver_uuid: String,
        sender_socket: SocketId,
        receiver_socket: SocketId,
    ) -> Result<(ReservationId, u16, u16), BrokerError> {
        let mut inner = self.inner.lock().await;

        let mut live_sshd_ports: Vec<u16> = inner.connections.iter().map(|c| c.sshd_port).collect();
        live_sshd_ports.extend(inner.reservations.values().map(|r| r.sshd_port));
        let mut live_local_ports: Vec<u16> =
            inner.connections.iter().map(|c| c.local_port).collect();
        live_local_ports.extend(inner.reservations.values().map(|r| r.local_port));

        let (sshd_port, local_port) =
            allocator::allocate(&self.opened_ports, &live_sshd_ports, &live_local_ports)?;

        let id = inner.next_reservation_id;
        inner.next_reservation_id += 1;
        inner.reservations.insert(
            id,
            Reservation {
                sender_uuid,
                receiver_uuid,
                sender_socket,
                receiver_socket,
                sshd_port,
                local_port,
            },
        );

        Ok((id, sshd_port, local_port))
    }

    /// Turn a reservation into a live Connection once the child `sshd` has
    /// been spawned and the keys script written.
    pub async fn commit(
        &self,
        id: ReservationId,
        sshd: SshdHandle,
        authorized_keys_script_path: PathBuf,
    ) -> Option<()> {
        let mut inner = self.inner.lock().await;
        let reservation = inner.reservations.remove(&id)?;
        inner.connections.push(Connection {
            sender_uuid: reservation.sender_uuid,
            receiver_uuid: reservation.receiver_uuid,
            sender_socket: reservation.sender_socket,
            receiver_socket: reservation.receiver_socket,
            sshd_port: reservation.sshd_port,
            local_port: reservation.local_port,
            sshd,
            authorized_keys_script_path,
        });
        Some(())
    }

    /// Remove a live Connection by the `sshd_port` its child was bound to
    /// (used when the supervisor reports an unexpected exit). No-op if the
    /// connection was already reaped through the normal teardown path.
    pub async fn reap_by_sshd_port(&self, sshd_port: u16) -> Option<Connection> {
        let mut inner = self.inner.lock().await;
        let pos = inner.connections.iter().position(|c| c.sshd_port == sshd_port)?;
        Some(inner.connections.remove(pos))
    }

    /// Abandon a reservation (e.g. spawn failed), freeing its ports.
    pub async fn cancel(&self, id: ReservationId) {
        self.inner.lock().await.reservations.remove(&id);
    }

    pub async fn add_pending_approval(&self, target_socket: SocketId, approval: PendingApproval) {
        self.inner
            .lock()
            .await
            .pending_approvals
            .entry(target_socket)
            .or_default()
            .push_back(approval);
    }

    /// Dequeue the next pending approval for a target socket (consumed when
    /// that target sends `connect_accept`/`connect_deny`).
    pub async fn pop_pending_approval(&self, target_socket: SocketId) -> Option<PendingApproval> {
        let mut inner = self.inner.lock().await;
        let queue = inner.pending_approvals.get_mut(&target_socket)?;
        let approval = queue.pop_front();
        if queue.is_empty() {
            inner.pending_approvals.remove(&target_socket);
        }
        approval
    }

    /// Remove a requester's pending entry from whichever target queue it's
    /// in, for when the requester disconnects mid-approval.
    pub async fn remove_pending_requester(&self, requester_socket: SocketId) {
        let mut inner = self.inner.lock().await;
        let mut empty_targets = Vec::new();
        for (target, queue) in inner.pending_approvals.iter_mut() {
            queue.retain(|a| a.requester_socket != requester_socket);
            if queue.is_empty() {
                empty_targets.push(*target);
            }
        }
        for target in empty_targets {
            inner.pending_approvals.remove(&target);
        }
    }

    /// Remove the Client bound to `socket`, reap any Connection it
    /// participates in, and drain any pending approvals it was the target
    /// of. Does not notify peers or kill processes; the caller does that
    /// with the returned data once the lock is released.
    pub async fn reap(&self, socket: SocketId) -> ReapOutcome {
        let mut inner = self.inner.lock().await;

        let client = inner.clients_by_socket.remove(&socket);
        if let Some(c) = &client {
            if inner.clients_by_uuid.get(&c.uuid) == Some(&socket) {
                inner.clients_by_uuid.remove(&c.uuid);
            }
        }

        let connection = if let Some(pos) = inner.connections.iter().position(|c| c.involves(socket)) {
            Some(inner.connections.remove(pos))
        } else {
            None
        };

        let orphaned_requesters = inner
            .pending_approvals
            .remove(&socket)
            .map(|q| q.into_iter().collect())
            .unwrap_or_default();

        ReapOutcome {
            client,
            connection,
            orphaned_requesters,
        }
    }
}
