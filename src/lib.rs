//! WhatsApp Engine Library
//!
//! A multi-session bridge between a WhatsApp client library and an HTTP
//! application backend.
//!
//! # Architecture
//!
//! ```text
//! Backend ──HTTP──▶ Control API ──▶ Session Registry ──▶ Session ──▶ Bridge (WhatsApp)
//!    ▲                                                      │
//!    └────────────── Webhook Dispatcher ◀── Outbox ◀────────┘
//!                                                           │
//!                                              Credential Store (SQLite)
//! ```
//!
//! # Usage
//!
//! ```bash
//! export WEBHOOK_URL=http://localhost:3000/api/webhook/whatsapp
//! export PORT=8080
//! export ALLOWED_SENDER=5561999999999
//! whatsapp-engine
//! ```
//!
//! Then pair a session:
//!
//! ```bash
//! curl -X POST localhost:8080/instances/main/connect
//! curl localhost:8080/instances/main/qr
//! ```
//!
//! Events arrive at the webhook as:
//!
//! ```json
//! {"instanceId": "main", "event": "status", "data": {"status": "CONNECTED"}}
//! ```

pub mod api;
pub mod client;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod filter;
pub mod jid;
pub mod qr;
pub mod registry;
pub mod session;
pub mod sidecar;
pub mod storage;
pub mod types;

pub use api::ApiState;
pub use config::EngineConfig;
pub use dispatcher::WebhookDispatcher;
pub use error::{EngineError, EngineResult};
pub use registry::SessionRegistry;
pub use sidecar::SidecarFactory;
pub use storage::CredentialStore;
pub use types::*;

/// Prelude for common imports
pub mod prelude {
    pub use crate::client::{ClientFactory, MessagingClient};
    pub use crate::config::EngineConfig;
    pub use crate::error::{EngineError, EngineResult};
    pub use crate::jid::Jid;
    pub use crate::registry::SessionRegistry;
    pub use crate::storage::{CredentialStore, Device};
    pub use crate::types::*;
}
