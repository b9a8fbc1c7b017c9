//! Inbound event envelope
//!
//! Every frame the server pushes over the duplex connection is one of these,
//! tagged on its `type` field.

use serde::{Deserialize, Serialize};

use crate::types::Message;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum InboundEvent {
    /// Bulk snapshot of persisted messages, sent after (re)subscribing.
    History { messages: Vec<Message> },
    Message { data: Message },
    /// In-progress assistant update carrying cumulative content.
    Chunk { data: Message },
    /// Final assistant update; completion is implied by the envelope.
    Complete { data: Message },
    /// The reply was stopped; no further chunks follow for this id.
    Cancelled { message_id: String },
    Welcome {
        #[serde(default, rename = "sessionId", skip_serializing_if = "Option::is_none")]
        session_id: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timestamp: Option<String>,
    },
    Error {
        error: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timestamp: Option<String>,
    },
    Pong,
    HeartbeatAck,
    RecoveryStatus {
        #[serde(default)]
        status: String,
        #[serde(default, rename = "chunksRecovered")]
        chunks_recovered: u64,
    },
    /// Any `type` this client does not know about.
    #[serde(other)]
    Unknown,
}

impl InboundEvent {
    pub fn from_json(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }

    /// Name of the `type` tag, for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            InboundEvent::History { .. } => "history",
            InboundEvent::Message { .. } => "message",
            InboundEvent::Chunk { .. } => "chunk",
            InboundEvent::Complete { .. } => "complete",
            InboundEvent::Cancelled { .. } => "cancelled",
            InboundEvent::Welcome { .. } => "welcome",
            InboundEvent::Error { .. } => "error",
            InboundEvent::Pong => "pong",
            InboundEvent::HeartbeatAck => "heartbeat_ack",
            InboundEvent::RecoveryStatus { .. } => "recovery_status",
            InboundEvent::Unknown => "unknown",
        }
    }

    /// Whether routing this event can change the message list.
    pub fn affects_messages(&self) -> bool {
        matches!(
            self,
            InboundEvent::History { .. }
                | InboundEvent::Message { .. }
                | InboundEvent::Chunk { .. }
                | InboundEvent::Complete { .. }
                | InboundEvent::Cancelled { .. }
        )
    }
}
