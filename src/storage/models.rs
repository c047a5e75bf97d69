//! Database models for the credential store

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::jid::Jid;

/// A device identity as persisted in the credential store
///
/// A freshly allocated device has no `id`; the messaging library assigns one
/// during pairing and the device is persisted from then on.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Device {
    /// Device JID (`user:device@s.whatsapp.net`), `None` until paired
    pub id: Option<Jid>,
    /// Signal registration id, allocated with the device
    pub registration_id: u32,
    /// Display name reported by the phone at pairing time
    pub push_name: String,
    /// Platform reported by the phone (android, iphone, ...)
    pub platform: String,
    /// Opaque key material owned by the messaging library
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub identity: Option<String>,
    /// When this record was first saved
    pub created_at: Option<DateTime<Utc>>,
}

impl Device {
    /// Allocate an unpaired device
    pub fn new(registration_id: u32) -> Self {
        Self {
            registration_id,
            ..Default::default()
        }
    }

    /// Phone number this device belongs to, once paired
    pub fn user(&self) -> Option<&str> {
        self.id.as_ref().map(|jid| jid.user.as_str())
    }

    pub fn is_paired(&self) -> bool {
        self.id.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_device_is_unpaired() {
        let device = Device::new(4242);
        assert_eq!(device.registration_id, 4242);
        assert!(!device.is_paired());
        assert_eq!(device.user(), None);
    }

    #[test]
    fn test_paired_device_user() {
        let device = Device {
            id: Some("5561999:12@s.whatsapp.net".parse().unwrap()),
            ..Device::new(1)
        };
        assert!(device.is_paired());
        assert_eq!(device.user(), Some("5561999"));
    }
}
