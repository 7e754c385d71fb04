//! Event Service Protocol Types
//!
//! JSON message types exchanged with the session event service over the
//! persistent WebSocket. Heartbeats are transport-level Ping frames, not JSON.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::LinkError;

/// Messages sent FROM the agent TO the event service
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Present the stored bearer token; the service replies with
    /// `authentication_ok` or `error`.
    Authenticate {
        #[serde(rename = "authToken")]
        auth_token: String,
    },
    /// Ask for coding-session lifecycle events on this connection.
    SubscribeCreatedOrStoppedSessions,
}

/// Messages sent FROM the event service TO the agent
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    AuthenticationOk,
    Error {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },
    /// A coding session started somewhere for this account.
    CodingSessionCreated {
        #[serde(rename = "codingSessionId")]
        coding_session_id: String,
        #[serde(rename = "createdDateTime", default, skip_serializing_if = "Option::is_none")]
        created_date_time: Option<DateTime<Utc>>,
    },
    /// A coding session ended.
    CodingSessionEnded {
        #[serde(rename = "codingSessionId")]
        coding_session_id: String,
    },
    /// Any message type this agent version does not know.
    #[serde(other)]
    Unknown,
}

/// Decode one inbound frame. Unknown `type` values decode to
/// [`ServerMessage::Unknown`]; only malformed JSON is an error.
pub fn parse_server_message(text: &str) -> Result<ServerMessage, LinkError> {
    serde_json::from_str(text).map_err(|e| LinkError::Protocol(e.to_string()))
}
