//! Configuration for switches and secure sockets.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::cipher::CipherMode;

/// Configuration for a [`Switch`](crate::switch::Switch).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SwitchConfig {
    /// Idle window after which a forwarding-table entry is considered stale.
    ///
    /// Expiry is soft: entries are only checked on lookup, never swept.
    #[serde(with = "duration_serde")]
    pub entry_ttl: Duration,
}

impl Default for SwitchConfig {
    fn default() -> Self {
        Self {
            entry_ttl: Duration::from_secs(300),
        }
    }
}

/// Configuration for a [`SecureSocket`](crate::socket::SecureSocket).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SocketConfig {
    /// Cipher mode used for post-handshake framing.
    pub mode: CipherMode,

    /// Long-lived pre-shared secret. Both peers must agree on it.
    pub secret: String,

    /// Interval between keepalive pings once handshaked.
    #[serde(with = "duration_serde")]
    pub ping_interval: Duration,

    /// How long to wait for a pong after each ping.
    #[serde(with = "duration_serde")]
    pub pong_timeout: Duration,

    /// Consecutive missed pongs before disconnecting with reason `ping`.
    pub ping_max: u32,

    /// Per-step handshake timeout window.
    #[serde(with = "duration_serde")]
    pub step_timeout: Duration,
}

impl Default for SocketConfig {
    fn default() -> Self {
        Self {
            mode: CipherMode::Gcm,
            secret: "weft-preshared-secret".to_string(),
            ping_interval: Duration::from_secs(10),
            pong_timeout: Duration::from_secs(3),
            ping_max: 3,
            step_timeout: Duration::from_secs(5),
        }
    }
}

impl SocketConfig {
    /// Save the config to a JSON file.
    pub fn save_to_file(&self, path: &Path) -> Result<(), String> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| format!("Failed to create directory: {e}"))?;
        }
        let json = serde_json::to_string_pretty(self)
            .map_err(|e| format!("Failed to serialize config: {e}"))?;
        std::fs::write(path, json).map_err(|e| format!("Failed to write config file: {e}"))
    }

    /// Load config from a JSON file, or return defaults if the file is missing.
    pub fn load_or_default(path: &Path) -> Self {
        if path.exists() {
            match std::fs::read_to_string(path) {
                Ok(data) => match serde_json::from_str::<SocketConfig>(&data) {
                    Ok(config) => return config,
                    Err(e) => {
                        tracing::warn!("Corrupt socket config file, using defaults: {e}");
                    }
                },
                Err(e) => {
                    tracing::warn!("Cannot read socket config file, using defaults: {e}");
                }
            }
        }
        Self::default()
    }
}

// ---------------------------------------------------------------------------
// Serde helpers
// ---------------------------------------------------------------------------

mod duration_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(dur: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(dur.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let millis = u64::deserialize(d)?;
        Ok(Duration::from_millis(millis))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_switch_config() {
        let config = SwitchConfig::default();
        assert_eq!(config.entry_ttl, Duration::from_secs(300));
    }

    #[test]
    fn test_default_socket_config() {
        let config = SocketConfig::default();
        assert_eq!(config.mode, CipherMode::Gcm);
        assert_eq!(config.ping_max, 3);
        assert_eq!(config.ping_interval, Duration::from_secs(10));
        assert!(!config.secret.is_empty());
    }

    #[test]
    fn test_socket_config_serialize_roundtrip() {
        let mut config = SocketConfig::default();
        config.mode = CipherMode::CtrHmac;
        config.ping_interval = Duration::from_millis(1500);

        let json = serde_json::to_string(&config).unwrap();
        let deserialized: SocketConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(deserialized.mode, CipherMode::CtrHmac);
        assert_eq!(deserialized.ping_interval, Duration::from_millis(1500));
        assert_eq!(deserialized.secret, config.secret);
    }

    #[test]
    fn test_socket_config_save_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("socket.json");

        let mut original = SocketConfig::default();
        original.secret = "a-test-secret".to_string();
        original.ping_max = 7;
        original.save_to_file(&path).unwrap();

        let loaded = SocketConfig::load_or_default(&path);
        assert_eq!(loaded.secret, "a-test-secret");
        assert_eq!(loaded.ping_max, 7);
    }

    #[test]
    fn test_socket_config_load_missing_returns_default() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("does-not-exist.json");

        let config = SocketConfig::load_or_default(&path);
        assert_eq!(config.ping_max, 3);
    }
}
