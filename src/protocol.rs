//! Wire protocol for the broker's single websocket per agent.
//!
//! Messages are JSON objects with a discriminator field `type`. Inbound
//! variants are validated against this tagged-union schema by `serde`;
//! anything that doesn't parse becomes `BrokerError::SchemaInvalid` with the
//! serde error text as detail.

use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize};

use crate::client::ClientType;

/// A port number validated to be in `1..=65535` at deserialization time; `0`
/// is not a forwardable port and is rejected before it ever reaches the
/// engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PortNumber(u16);

impl PortNumber {
    pub fn new(value: u16) -> Result<Self, String> {
        if value == 0 {
            Err("port must be in 1..=65535".to_string())
        } else {
            Ok(Self(value))
        }
    }

    pub fn get(self) -> u16 {
        self.0
    }
}

impl<'de> Deserialize<'de> for PortNumber {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let value = u16::deserialize(deserializer)?;
        PortNumber::new(value).map_err(D::Error::custom)
    }
}

/// Messages sent from an agent to the broker.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum InboundMessage {
    Register {
        ssh_key: String,
        uuid: String,
        auto_accept: bool,
        #[serde(default)]
        port_whitelist: Vec<u16>,
        #[serde(default)]
        port_blacklist: Vec<u16>,
        client_type: ClientType,
    },
    ConnectToHost {
        target: String,
        port: PortNumber,
    },
    ConnectAccept,
    ConnectDeny,
}

/// Messages sent from the broker to an agent.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OutboundMessage {
    Response {
        success: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    ConnectConfirm {
        source_client: String,
        port: u16,
    },
    TunnelConnect {
        client_type: ClientType,
        user: String,
        sshd_port: u16,
        local_port: u16,
        forwarded_port: u16,
    },
    TunnelClose,
}

impl OutboundMessage {
    pub fn ok() -> Self {
        OutboundMessage::Response {
            success: true,
            error: None,
        }
    }

    pub fn err(message: impl Into<String>) -> Self {
        OutboundMessage::Response {
            success: false,
            error: Some(message.into()),
        }
    }
}
