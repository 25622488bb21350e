//! Listener command envelope.
//!
//! Commands travel over the control channel as a JSON object carrying
//! exactly one populated member:
//!
//! ```json
//! {"accept": {"address": "wss://...", "id": "...", "connectHeaders": {}}}
//! {"renewToken": {"token": "SharedAccessSignature sr=..."}}
//! ```
//!
//! Envelopes with no recognized member decode to [`Command::Unknown`] so the
//! receiver can log and skip them.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::error::ProtocolError;

/// Raw wire envelope. At most one member is populated.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListenerCommand {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub accept: Option<AcceptCommand>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub renew_token: Option<RenewTokenCommand>,
}

/// Notification that a client wants to connect through a rendezvous address.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AcceptCommand {
    /// One-time rendezvous address the listener connects to (or rejects).
    pub address: String,
    /// Tracking id of the rendezvous.
    pub id: String,
    /// Headers sent by the client with its connect request.
    #[serde(default)]
    pub connect_headers: HashMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remote_endpoint: Option<RemoteEndpoint>,
}

/// Network endpoint of the connecting client, as seen by the relay.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteEndpoint {
    pub address: String,
    pub port: u16,
}

/// Hands the relay a fresh credential for the open control channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RenewTokenCommand {
    pub token: String,
}

/// A decoded control-channel command.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Accept(AcceptCommand),
    RenewToken(RenewTokenCommand),
    /// Well-formed envelope with no recognized member. Holds the raw text.
    Unknown(String),
}

impl Command {
    /// Creates a token renewal command.
    pub fn renew_token(token: impl Into<String>) -> Self {
        Command::RenewToken(RenewTokenCommand {
            token: token.into(),
        })
    }

    /// Decodes a command from a control-channel payload.
    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let envelope: ListenerCommand = serde_json::from_slice(bytes)?;
        match envelope {
            ListenerCommand {
                accept: Some(accept),
                renew_token: None,
            } => Ok(Command::Accept(accept)),
            ListenerCommand {
                accept: None,
                renew_token: Some(renew),
            } => Ok(Command::RenewToken(renew)),
            ListenerCommand {
                accept: None,
                renew_token: None,
            } => Ok(Command::Unknown(
                String::from_utf8_lossy(bytes).into_owned(),
            )),
            ListenerCommand { .. } => Err(ProtocolError::Ambiguous(
                String::from_utf8_lossy(bytes).into_owned(),
            )),
        }
    }

    /// Encodes the command into its wire envelope.
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        let envelope = match self {
            Command::Accept(accept) => ListenerCommand {
                accept: Some(accept.clone()),
                ..Default::default()
            },
            Command::RenewToken(renew) => ListenerCommand {
                renew_token: Some(renew.clone()),
                ..Default::default()
            },
            Command::Unknown(raw) => return Ok(raw.as_bytes().to_vec()),
        };
        Ok(serde_json::to_vec(&envelope)?)
    }

    /// Short name of the command, for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            Command::Accept(_) => "accept",
            Command::RenewToken(_) => "renewToken",
            Command::Unknown(_) => "unknown",
        }
    }
}
