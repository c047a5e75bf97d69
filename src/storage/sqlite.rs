//! SQLite-based credential store implementation

use std::path::Path;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::{Connection, OptionalExtension, Row, params};
use tracing::{debug, info};
use uuid::Uuid;

use super::models::Device;
use crate::jid::Jid;

/// Credential store error type
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Corrupt device row: {0}")]
    Corrupt(String),

    #[error("Device has no JID yet and cannot be saved")]
    Unpaired,

    #[error("Store is closed")]
    Closed,
}

/// Result type for storage operations
pub type StorageResult<T> = Result<T, StorageError>;

/// SQLite-based device store
///
/// One connection behind a mutex; every call is a short statement, so
/// no transaction is ever held across tasks.
pub struct CredentialStore {
    conn: Mutex<Option<Connection>>,
}

impl CredentialStore {
    /// Create or open a credential store at the given path
    pub fn open<P: AsRef<Path>>(path: P) -> StorageResult<Self> {
        let path = path.as_ref();

        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)?;
        }

        info!("Opening credential store at {:?}", path);

        let conn = Connection::open(path)?;
        Self::with_connection(conn)
    }

    /// Volatile store, for tests and dry runs
    pub fn open_in_memory() -> StorageResult<Self> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> StorageResult<Self> {
        let store = Self {
            conn: Mutex::new(Some(conn)),
        };
        store.initialize_schema()?;
        Ok(store)
    }

    fn with_conn<T>(&self, f: impl FnOnce(&Connection) -> StorageResult<T>) -> StorageResult<T> {
        let guard = self.conn.lock();
        let conn = guard.as_ref().ok_or(StorageError::Closed)?;
        f(conn)
    }

    /// Initialize database schema
    fn initialize_schema(&self) -> StorageResult<()> {
        self.with_conn(|conn| {
            conn.execute_batch(
                "PRAGMA journal_mode = WAL;
                 PRAGMA synchronous = NORMAL;
                 PRAGMA foreign_keys = ON;",
            )?;

            conn.execute(
                "CREATE TABLE IF NOT EXISTS devices (
                    jid TEXT PRIMARY KEY,
                    user TEXT NOT NULL,
                    registration_id INTEGER NOT NULL,
                    push_name TEXT NOT NULL DEFAULT '',
                    platform TEXT NOT NULL DEFAULT '',
                    identity TEXT,
                    created_at TEXT NOT NULL,
                    updated_at TEXT NOT NULL
                )",
                [],
            )?;

            conn.execute(
                "CREATE INDEX IF NOT EXISTS idx_devices_user ON devices(user)",
                [],
            )?;

            debug!("Credential store schema initialized");
            Ok(())
        })
    }

    /// All persisted devices, oldest first
    pub fn list_devices(&self) -> StorageResult<Vec<Device>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT jid, registration_id, push_name, platform, identity, created_at
                 FROM devices ORDER BY created_at ASC",
            )?;
            let rows = stmt.query_map([], RawDevice::from_row)?;

            let mut devices = Vec::new();
            for raw in rows {
                devices.push(raw?.into_device()?);
            }
            Ok(devices)
        })
    }

    /// Device paired for the given phone number, if any
    pub fn get_device(&self, user: &str) -> StorageResult<Option<Device>> {
        self.with_conn(|conn| {
            let raw = conn
                .query_row(
                    "SELECT jid, registration_id, push_name, platform, identity, created_at
                     FROM devices WHERE user = ?1
                     ORDER BY updated_at DESC LIMIT 1",
                    params![user],
                    RawDevice::from_row,
                )
                .optional()?;
            raw.map(RawDevice::into_device).transpose()
        })
    }

    /// Allocate an unpersisted device; it is saved once pairing assigns a JID
    pub fn new_device(&self) -> Device {
        let bytes = Uuid::new_v4();
        let mut id = [0u8; 4];
        id.copy_from_slice(&bytes.as_bytes()[..4]);
        Device::new(u32::from_le_bytes(id) & 0x3fff)
    }

    /// Insert or update a paired device
    pub fn save_device(&self, device: &Device) -> StorageResult<()> {
        let jid = device.id.as_ref().ok_or(StorageError::Unpaired)?;
        let now = Utc::now().to_rfc3339();
        let created_at = device
            .created_at
            .map(|t| t.to_rfc3339())
            .unwrap_or_else(|| now.clone());

        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO devices
                 (jid, user, registration_id, push_name, platform, identity, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
                 ON CONFLICT(jid) DO UPDATE SET
                    registration_id = excluded.registration_id,
                    push_name = excluded.push_name,
                    platform = excluded.platform,
                    identity = excluded.identity,
                    updated_at = excluded.updated_at",
                params![
                    jid.to_string(),
                    jid.user,
                    device.registration_id,
                    device.push_name,
                    device.platform,
                    device.identity,
                    created_at,
                    now,
                ],
            )?;
            debug!("Saved device {}", jid);
            Ok(())
        })
    }

    /// Forget a device (after logout). Returns `true` if a row was removed.
    pub fn delete_device(&self, jid: &Jid) -> StorageResult<bool> {
        self.with_conn(|conn| {
            let removed = conn.execute("DELETE FROM devices WHERE jid = ?1", params![jid.to_string()])?;
            if removed > 0 {
                debug!("Deleted device {}", jid);
            }
            Ok(removed > 0)
        })
    }

    /// Close the underlying connection; later calls fail with [`StorageError::Closed`]
    pub fn close(&self) -> StorageResult<()> {
        if let Some(conn) = self.conn.lock().take() {
            conn.close().map_err(|(_, e)| StorageError::Database(e))?;
            info!("Credential store closed");
        }
        Ok(())
    }
}

/// Row as read from SQLite, before JID and timestamp parsing
struct RawDevice {
    jid: String,
    registration_id: u32,
    push_name: String,
    platform: String,
    identity: Option<String>,
    created_at: String,
}

impl RawDevice {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            jid: row.get(0)?,
            registration_id: row.get(1)?,
            push_name: row.get(2)?,
            platform: row.get(3)?,
            identity: row.get(4)?,
            created_at: row.get(5)?,
        })
    }

    fn into_device(self) -> StorageResult<Device> {
        let id = self
            .jid
            .parse::<Jid>()
            .map_err(|e| StorageError::Corrupt(e.to_string()))?;
        let created_at = DateTime::parse_from_rfc3339(&self.created_at)
            .map_err(|e| StorageError::Corrupt(e.to_string()))?
            .with_timezone(&Utc);

        Ok(Device {
            id: Some(id),
            registration_id: self.registration_id,
            push_name: self.push_name,
            platform: self.platform,
            identity: self.identity,
            created_at: Some(created_at),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn paired(jid: &str, store: &CredentialStore) -> Device {
        Device {
            id: Some(jid.parse().unwrap()),
            push_name: "Beto".to_string(),
            platform: "android".to_string(),
            identity: Some("key-material".to_string()),
            ..store.new_device()
        }
    }

    #[test]
    fn test_store_creation() {
        let store = CredentialStore::open_in_memory().unwrap();
        assert!(store.list_devices().unwrap().is_empty());
    }

    #[test]
    fn test_open_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("session.db");
        let store = CredentialStore::open(&path).unwrap();
        store.save_device(&paired("111:1@s.whatsapp.net", &store)).unwrap();
        store.close().unwrap();

        let reopened = CredentialStore::open(&path).unwrap();
        assert_eq!(reopened.list_devices().unwrap().len(), 1);
    }

    #[test]
    fn test_new_device_is_not_persisted() {
        let store = CredentialStore::open_in_memory().unwrap();
        let device = store.new_device();
        assert!(!device.is_paired());
        assert!(device.registration_id <= 0x3fff);
        assert!(store.list_devices().unwrap().is_empty());
        assert!(matches!(
            store.save_device(&device),
            Err(StorageError::Unpaired)
        ));
    }

    #[test]
    fn test_save_and_get_by_user() {
        let store = CredentialStore::open_in_memory().unwrap();
        let device = paired("5561999:12@s.whatsapp.net", &store);
        store.save_device(&device).unwrap();

        let found = store.get_device("5561999").unwrap().unwrap();
        assert_eq!(found.id, device.id);
        assert_eq!(found.registration_id, device.registration_id);
        assert_eq!(found.identity.as_deref(), Some("key-material"));
        assert!(found.created_at.is_some());

        assert!(store.get_device("000").unwrap().is_none());
    }

    #[test]
    fn test_save_is_upsert() {
        let store = CredentialStore::open_in_memory().unwrap();
        let mut device = paired("111:1@s.whatsapp.net", &store);
        store.save_device(&device).unwrap();

        device.push_name = "Renamed".to_string();
        store.save_device(&device).unwrap();

        let devices = store.list_devices().unwrap();
        assert_eq!(devices.len(), 1);
        assert_eq!(devices[0].push_name, "Renamed");
    }

    #[test]
    fn test_delete_device() {
        let store = CredentialStore::open_in_memory().unwrap();
        let device = paired("111:1@s.whatsapp.net", &store);
        store.save_device(&device).unwrap();

        let jid = device.id.clone().unwrap();
        assert!(store.delete_device(&jid).unwrap());
        assert!(!store.delete_device(&jid).unwrap());
        assert!(store.get_device("111").unwrap().is_none());
    }

    #[test]
    fn test_closed_store_rejects_calls() {
        let store = CredentialStore::open_in_memory().unwrap();
        store.close().unwrap();
        assert!(matches!(store.list_devices(), Err(StorageError::Closed)));
        // Closing twice is a no-op
        store.close().unwrap();
    }
}
