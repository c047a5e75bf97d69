//! Configuration management

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// Engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Destination for event envelopes
    #[serde(default = "default_webhook_url")]
    pub webhook_url: String,

    /// Control API bind host
    #[serde(default = "default_bind_host")]
    pub bind_host: String,

    /// Control API listen port
    #[serde(default = "default_port")]
    pub port: u16,

    /// Raw comma-separated list of phone numbers whose messages are forwarded
    #[serde(default = "default_allowed_sender")]
    pub allowed_sender: String,

    /// Credential store file
    #[serde(default = "default_database_path")]
    pub database_path: PathBuf,

    /// Websocket endpoint of the messaging library bridge
    #[serde(default = "default_sidecar_url")]
    pub sidecar_url: String,

    /// Per-POST timeout for webhook delivery
    #[serde(default = "default_webhook_timeout")]
    pub webhook_timeout_secs: u64,

    /// Upper bound on a single outbound send
    #[serde(default = "default_send_timeout")]
    pub send_timeout_secs: u64,

    /// How long shutdown waits for sessions to disconnect
    #[serde(default = "default_shutdown_grace")]
    pub shutdown_grace_secs: u64,
}

fn default_webhook_url() -> String {
    "http://localhost:3000/api/webhook/whatsapp".to_string()
}

fn default_bind_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    3002
}

fn default_allowed_sender() -> String {
    // Testing numbers; production deployments always set ALLOWED_SENDER
    "556199836903,5561992178060".to_string()
}

fn default_database_path() -> PathBuf {
    PathBuf::from("session.db")
}

fn default_sidecar_url() -> String {
    "ws://127.0.0.1:3003/ws".to_string()
}

fn default_webhook_timeout() -> u64 {
    10
}

fn default_send_timeout() -> u64 {
    30
}

fn default_shutdown_grace() -> u64 {
    5
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            webhook_url: default_webhook_url(),
            bind_host: default_bind_host(),
            port: default_port(),
            allowed_sender: default_allowed_sender(),
            database_path: default_database_path(),
            sidecar_url: default_sidecar_url(),
            webhook_timeout_secs: default_webhook_timeout(),
            send_timeout_secs: default_send_timeout(),
            shutdown_grace_secs: default_shutdown_grace(),
        }
    }
}

impl EngineConfig {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok(); // Load .env file if present
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from any key lookup; unset or unparsable numbers fall back to defaults
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let port = match lookup("PORT") {
            Some(raw) => raw
                .trim()
                .parse()
                .with_context(|| format!("PORT must be a port number, got {raw:?}"))?,
            None => default_port(),
        };

        Ok(Self {
            webhook_url: lookup("WEBHOOK_URL").unwrap_or_else(default_webhook_url),
            bind_host: lookup("BIND_HOST").unwrap_or_else(default_bind_host),
            port,
            allowed_sender: lookup("ALLOWED_SENDER").unwrap_or_else(default_allowed_sender),
            database_path: lookup("DATABASE_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(default_database_path),
            sidecar_url: lookup("SIDECAR_URL").unwrap_or_else(default_sidecar_url),
            webhook_timeout_secs: lookup("WEBHOOK_TIMEOUT_SECS")
                .and_then(|s| s.parse().ok())
                .unwrap_or_else(default_webhook_timeout),
            send_timeout_secs: lookup("SEND_TIMEOUT_SECS")
                .and_then(|s| s.parse().ok())
                .unwrap_or_else(default_send_timeout),
            shutdown_grace_secs: lookup("SHUTDOWN_GRACE_SECS")
                .and_then(|s| s.parse().ok())
                .unwrap_or_else(default_shutdown_grace),
        })
    }

    /// Socket address the control API binds to
    pub fn listen_addr(&self) -> Result<SocketAddr> {
        format!("{}:{}", self.bind_host, self.port)
            .parse()
            .with_context(|| format!("invalid listen address {}:{}", self.bind_host, self.port))
    }

    pub fn webhook_timeout(&self) -> Duration {
        Duration::from_secs(self.webhook_timeout_secs)
    }

    pub fn send_timeout(&self) -> Duration {
        Duration::from_secs(self.send_timeout_secs)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = EngineConfig::from_lookup(|_| None).unwrap();
        assert_eq!(config.webhook_url, "http://localhost:3000/api/webhook/whatsapp");
        assert_eq!(config.port, 3002);
        assert_eq!(config.database_path, PathBuf::from("session.db"));
        assert_eq!(config.listen_addr().unwrap().port(), 3002);
    }

    #[test]
    fn test_overrides() {
        let config = EngineConfig::from_lookup(lookup_from(&[
            ("WEBHOOK_URL", "http://hooks.internal/wa"),
            ("PORT", "8088"),
            ("ALLOWED_SENDER", "100, 200"),
            ("SEND_TIMEOUT_SECS", "3"),
        ]))
        .unwrap();

        assert_eq!(config.webhook_url, "http://hooks.internal/wa");
        assert_eq!(config.port, 8088);
        assert_eq!(config.allowed_sender, "100, 200");
        assert_eq!(config.send_timeout(), Duration::from_secs(3));
    }

    #[test]
    fn test_bad_numbers() {
        assert!(EngineConfig::from_lookup(lookup_from(&[("PORT", "http")])).is_err());

        let config =
            EngineConfig::from_lookup(lookup_from(&[("WEBHOOK_TIMEOUT_SECS", "soon")])).unwrap();
        assert_eq!(config.webhook_timeout_secs, 10);
    }
}
