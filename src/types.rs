//! Shared types: session state, webhook envelopes and control API bodies

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::client::MessageEvent;

/// Caller-chosen session identifier (usually the account's phone number)
pub type SessionId = String;

// =============================================================================
// Session State
// =============================================================================

/// Lifecycle status of a session
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SessionStatus {
    Disconnected,
    Connecting,
    Connected,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionStatus::Disconnected => "DISCONNECTED",
            SessionStatus::Connecting => "CONNECTING",
            SessionStatus::Connected => "CONNECTED",
        }
    }
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Point-in-time view of a session, as returned by `GET /instances`
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct InstanceView {
    pub id: SessionId,
    pub status: SessionStatus,
    pub qr: String,
}

// =============================================================================
// Webhook Envelopes
// =============================================================================

/// Kind of event carried by an envelope
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    Qr,
    Status,
    Message,
}

/// Document POSTed to the webhook for every forwarded event
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct EventEnvelope {
    pub instance_id: SessionId,
    pub event: EventKind,
    pub data: Value,
}

impl EventEnvelope {
    /// Envelope for a freshly received pairing code
    pub fn qr(instance_id: &str, code: &str) -> Self {
        Self {
            instance_id: instance_id.to_string(),
            event: EventKind::Qr,
            data: serde_json::json!({ "code": code }),
        }
    }

    /// Envelope for a status transition
    pub fn status(instance_id: &str, status: SessionStatus) -> Self {
        Self {
            instance_id: instance_id.to_string(),
            event: EventKind::Status,
            data: serde_json::json!({ "status": status }),
        }
    }

    /// Envelope for an inbound message that passed the sender filter
    pub fn message(instance_id: &str, event: &MessageEvent) -> serde_json::Result<Self> {
        let payload = MessagePayload::from_event(event);
        Ok(Self {
            instance_id: instance_id.to_string(),
            event: EventKind::Message,
            data: serde_json::to_value(payload)?,
        })
    }
}

/// Addressing part of a forwarded message
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MessageKey {
    pub remote_jid: String,
    pub from_me: bool,
    pub id: String,
    /// Set for group chats, where `remote_jid` is the group
    #[serde(skip_serializing_if = "Option::is_none")]
    pub participant: Option<String>,
}

/// `data` of a `message` envelope
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MessagePayload {
    pub key: MessageKey,
    pub message: Value,
    pub push_name: String,
    /// Epoch seconds
    pub message_timestamp: i64,
}

impl MessagePayload {
    pub fn from_event(event: &MessageEvent) -> Self {
        let info = &event.info;
        let sender = info.sender.to_non_ad().to_string();
        let chat = info.chat.to_non_ad().to_string();
        let participant = (chat != sender).then_some(sender);

        Self {
            key: MessageKey {
                remote_jid: chat,
                from_me: info.is_from_me,
                id: info.id.clone(),
                participant,
            },
            message: event.message.clone(),
            push_name: info.push_name.clone(),
            message_timestamp: info.timestamp.timestamp(),
        }
    }
}

// =============================================================================
// Control API Bodies
// =============================================================================

/// Body of `POST /instances/:id/send`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SendRequest {
    pub to: String,
    pub text: String,
}

/// Reply to an accepted connect
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectResponse {
    pub message: String,
    pub status: SessionStatus,
}

/// Generic success reply
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SuccessResponse {
    pub success: bool,
}

/// Error reply for every failed request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
}

/// Reply to `GET /instances/:id/qr`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QrResponse {
    pub code: String,
}
