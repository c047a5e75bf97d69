//! WhatsApp addressing: `user[.agent][:device]@server`

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Server for regular user accounts
pub const DEFAULT_USER_SERVER: &str = "s.whatsapp.net";
/// Server for group chats
pub const GROUP_SERVER: &str = "g.us";

/// Recipient parse failure
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum JidParseError {
    #[error("missing '@' separator in {0:?}")]
    MissingServer(String),

    #[error("empty user part in {0:?}")]
    EmptyUser(String),

    #[error("empty server part in {0:?}")]
    EmptyServer(String),

    #[error("invalid device suffix in {0:?}")]
    InvalidDevice(String),

    #[error("unexpected whitespace in {0:?}")]
    Whitespace(String),
}

/// A WhatsApp identifier
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct Jid {
    pub user: String,
    pub agent: u8,
    pub device: u16,
    pub server: String,
}

impl Jid {
    /// Regular user JID on the default server
    pub fn user(user: impl Into<String>) -> Self {
        Self {
            user: user.into(),
            agent: 0,
            device: 0,
            server: DEFAULT_USER_SERVER.to_string(),
        }
    }

    /// Drop the agent/device part, leaving `user@server`
    pub fn to_non_ad(&self) -> Self {
        Self {
            user: self.user.clone(),
            agent: 0,
            device: 0,
            server: self.server.clone(),
        }
    }

    pub fn is_group(&self) -> bool {
        self.server == GROUP_SERVER
    }
}

impl fmt::Display for Jid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.agent > 0 {
            write!(f, "{}.{}:{}@{}", self.user, self.agent, self.device, self.server)
        } else if self.device > 0 {
            write!(f, "{}:{}@{}", self.user, self.device, self.server)
        } else {
            write!(f, "{}@{}", self.user, self.server)
        }
    }
}

impl FromStr for Jid {
    type Err = JidParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.chars().any(char::is_whitespace) {
            return Err(JidParseError::Whitespace(s.to_string()));
        }

        let (local, server) = s
            .split_once('@')
            .ok_or_else(|| JidParseError::MissingServer(s.to_string()))?;

        if server.is_empty() || server.contains('@') {
            return Err(JidParseError::EmptyServer(s.to_string()));
        }

        let (user_agent, device) = match local.split_once(':') {
            Some((head, device)) => {
                let device = device
                    .parse::<u16>()
                    .map_err(|_| JidParseError::InvalidDevice(s.to_string()))?;
                (head, device)
            }
            None => (local, 0),
        };

        // Only AD JIDs carry an agent; dots elsewhere belong to the user part
        let (user, agent) = match user_agent.split_once('.') {
            Some((user, agent)) if device > 0 || local.contains(':') => {
                let agent = agent
                    .parse::<u8>()
                    .map_err(|_| JidParseError::InvalidDevice(s.to_string()))?;
                (user, agent)
            }
            _ => (user_agent, 0),
        };

        if user.is_empty() {
            return Err(JidParseError::EmptyUser(s.to_string()));
        }

        Ok(Self {
            user: user.to_string(),
            agent,
            device,
            server: server.to_string(),
        })
    }
}

impl Serialize for Jid {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Jid {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}
