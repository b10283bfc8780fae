//! Connection data model (C3's payload type).

use crate::client::SocketId;
use crate::sshd::SshdHandle;

/// One per active tunnel. Owns the supervised `sshd` child (via its handle)
/// and the ephemeral authorized-keys script path; both are cleaned up when
/// the Connection is removed.
pub struct Connection {
    pub sender_uuid: String,
    pub receiver_uuid: String,
    pub sender_socket: SocketId,
    pub receiver_socket: SocketId,
    pub sshd_port: u16,
    pub local_port: u16,
    pub sshd: SshdHandle,
    pub authorized_keys_script_path: std::path::PathBuf,
}

impl Connection {
    pub fn involves(&self, socket: SocketId) -> bool {
        self.sender_socket == socket || self.receiver_socket == socket
    }

    /// The socket on the other side of this tunnel from `socket`, if any.
    pub fn peer_of(&self, socket: SocketId) -> Option<SocketId> {
        if self.sender_socket == socket {
            Some(self.receiver_socket)
        } else if self.receiver_socket == socket {
            Some(self.sender_socket)
        } else {
            None
        }
    }
}
