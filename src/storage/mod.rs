//! Credential store for paired devices
//!
//! Provides SQLite-based persistence for:
//! - Device identities produced by QR pairing
//! - Lookup of a session's device by its phone number

mod models;
mod sqlite;

pub use models::Device;
pub use sqlite::{CredentialStore, StorageError, StorageResult};
