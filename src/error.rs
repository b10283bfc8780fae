//! Protocol-facing error type for the signaling engine.
//!
//! Every error the engine can raise while handling an inbound message maps to
//! one of these kinds and is reported to the offending socket as
//! `response(success=false, error=<message>)`. None of these are fatal to the
//! process or to the socket; only startup preflight failures (see
//! [`crate::config`]) abort the process.

use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum BrokerError {
    #[error("{0}")]
    SchemaInvalid(String),

    #[error("you are not registered")]
    NotRegistered,

    #[error("only receivers may request a connection")]
    NotReceiver,

    #[error("no match")]
    TargetNotFound,

    #[error("ambiguous prefix")]
    TargetAmbiguous,

    #[error("port {port} is not permitted by the target's policy")]
    PortDenied { port: u16 },

    #[error("Server is full")]
    ServerFull,

    #[error("The client denied the connection")]
    PeerDenied,

    #[error("target disconnected")]
    TargetDisconnected,

    #[error("internal error: {0}")]
    Internal(String),
}

impl BrokerError {
    /// The human-readable string embedded in the outbound `response` message.
    pub fn message(&self) -> String {
        self.to_string()
    }
}

impl From<anyhow::Error> for BrokerError {
    fn from(err: anyhow::Error) -> Self {
        BrokerError::Internal(err.to_string())
    }
}
