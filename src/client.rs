//! Messaging library seam
//!
//! The engine never talks to the WhatsApp protocol directly. Everything it
//! needs from the library goes through [`MessagingClient`] (one per device)
//! and [`ClientFactory`] (builds clients for devices from the credential store).

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::jid::Jid;
use crate::storage::Device;

/// Errors surfaced by the messaging library
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ClientError {
    #[error("not connected to the messaging service")]
    NotConnected,

    /// A QR channel was requested for a device that already has credentials
    #[error("device is already logged in")]
    AlreadyLoggedIn,

    #[error("send rejected: {0}")]
    Rejected(String),

    #[error("operation cancelled")]
    Cancelled,

    #[error("operation timed out")]
    Timeout,

    #[error("transport error: {0}")]
    Transport(String),
}

// =============================================================================
// Events
// =============================================================================

/// Metadata of a received message
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MessageInfo {
    pub id: String,
    pub chat: Jid,
    pub sender: Jid,
    pub is_from_me: bool,
    #[serde(default)]
    pub push_name: String,
    #[serde(with = "chrono::serde::ts_seconds")]
    pub timestamp: DateTime<Utc>,
}

/// A received message: metadata plus the library's message object
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MessageEvent {
    pub info: MessageInfo,
    pub message: Value,
}

/// Events delivered to registered handlers, in the order the library observed them
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    Message(MessageEvent),
    Connected,
    LoggedOut {
        #[serde(default)]
        on_connect: bool,
        #[serde(default)]
        reason: Option<String>,
    },
    /// Pairing finished; the device now has an identity
    PairSuccess {
        id: Jid,
        #[serde(default)]
        business_name: String,
        #[serde(default)]
        platform: String,
    },
    /// WhatsApp transport dropped; the bridge reconnects on its own
    Disconnected,
    /// The client lost its link to the library for good; a new connect is needed
    ConnectionLost {
        #[serde(default)]
        reason: Option<String>,
    },
    #[serde(other)]
    Other,
}

/// Single element of a QR channel
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "event", rename_all = "kebab-case")]
pub enum QrEvent {
    Code { code: String },
    Success,
    Timeout,
    #[serde(other)]
    Other,
}

/// Callback invoked for every library event
pub type EventHandler = Arc<dyn Fn(Event) + Send + Sync>;

// =============================================================================
// Outbound
// =============================================================================

/// Outbound message body; only plain text is supported
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct OutgoingMessage {
    pub conversation: String,
}

impl OutgoingMessage {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            conversation: text.into(),
        }
    }
}

/// Server acknowledgement of a sent message
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SendReceipt {
    pub id: String,
    #[serde(with = "chrono::serde::ts_seconds")]
    pub timestamp: DateTime<Utc>,
}

// =============================================================================
// Capability Traits
// =============================================================================

#[async_trait]
pub trait MessagingClient: Send + Sync {
    /// Register an event handler; must be called before [`connect`](Self::connect)
    fn add_event_handler(&self, handler: EventHandler) -> u32;

    /// Stream of pairing codes. Closes when pairing succeeds, times out or the
    /// client disconnects.
    async fn qr_channel(&self) -> Result<mpsc::Receiver<QrEvent>, ClientError>;

    async fn connect(&self) -> Result<(), ClientError>;

    async fn disconnect(&self);

    async fn send_message(
        &self,
        cancel: CancellationToken,
        to: &Jid,
        message: OutgoingMessage,
    ) -> Result<SendReceipt, ClientError>;

    /// Whether the underlying device holds credentials
    fn is_logged_in(&self) -> bool;
}

pub trait ClientFactory: Send + Sync {
    fn new_client(&self, device: Device) -> Arc<dyn MessagingClient>;
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_tagging() {
        let event: Event = serde_json::from_str(r#"{"type":"connected"}"#).unwrap();
        assert_eq!(event, Event::Connected);

        let event: Event =
            serde_json::from_str(r#"{"type":"logged_out","reason":"401"}"#).unwrap();
        assert_eq!(
            event,
            Event::LoggedOut {
                on_connect: false,
                reason: Some("401".to_string())
            }
        );

        let event: Event = serde_json::from_str(r#"{"type":"connection_lost"}"#).unwrap();
        assert_eq!(event, Event::ConnectionLost { reason: None });

        let event: Event = serde_json::from_str(r#"{"type":"presence"}"#).unwrap();
        assert_eq!(event, Event::Other);
    }

    #[test]
    fn test_message_event_parsing() {
        let raw = r#"{
            "type": "message",
            "info": {
                "id": "ABC",
                "chat": "100@s.whatsapp.net",
                "sender": "100:3@s.whatsapp.net",
                "is_from_me": false,
                "push_name": "Beto",
                "timestamp": 1709251200
            },
            "message": {"conversation": "oi"}
        }"#;
        let Event::Message(msg) = serde_json::from_str::<Event>(raw).unwrap() else {
            panic!("expected message event");
        };
        assert_eq!(msg.info.sender.user, "100");
        assert_eq!(msg.info.sender.device, 3);
        assert_eq!(msg.info.timestamp.timestamp(), 1_709_251_200);
    }

    #[test]
    fn test_qr_event_parsing() {
        let code: QrEvent = serde_json::from_str(r#"{"event":"code","code":"2@abc"}"#).unwrap();
        assert_eq!(
            code,
            QrEvent::Code {
                code: "2@abc".to_string()
            }
        );
        let other: QrEvent = serde_json::from_str(r#"{"event":"err-unexpected-state"}"#).unwrap();
        assert_eq!(other, QrEvent::Other);
    }

    #[test]
    fn test_outgoing_text() {
        let json = serde_json::to_value(OutgoingMessage::text("hi")).unwrap();
        assert_eq!(json, serde_json::json!({ "conversation": "hi" }));
    }
}
