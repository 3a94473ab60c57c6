//! Bridge configuration and its persistence seam
//!
//! Config lives in a JSON file under the platform config directory; the
//! last successfully connected peripheral is remembered next to it so the
//! bridge can re-dial on startup without a fresh scan.

use crate::backoff::ReconnectConfig;
use crate::peripheral::PeripheralIdentity;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;
use std::sync::Mutex;
use tracing::{debug, warn};
use uuid::Uuid;

const CONFIG_FILE: &str = "config.json";
const DEVICE_FILE: &str = "device.json";

/// Persisted bridge settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BridgeConfig {
    /// Relay server endpoint, ws:// or wss://
    pub server_url: String,
    /// Stable identity sent with registration
    pub device_id: String,
    /// Reconnect the server link (and the last peripheral, if remembered)
    /// on startup
    pub auto_connect: bool,
    #[serde(default)]
    pub reconnect: ReconnectConfig,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            server_url: "ws://localhost:8080/ws".to_string(),
            device_id: format!("bridge-{}", Uuid::new_v4()),
            auto_connect: true,
            reconnect: ReconnectConfig::default(),
        }
    }
}

/// Persistence seam for config and the last-known peripheral
pub trait ConfigStore: Send + Sync {
    /// Load the config, creating defaults on first run
    fn load(&self) -> Result<BridgeConfig>;

    fn save(&self, config: &BridgeConfig) -> Result<()>;

    /// The peripheral most recently connected successfully, if any
    fn last_peripheral(&self) -> Option<PeripheralIdentity>;

    fn remember_peripheral(&self, identity: &PeripheralIdentity) -> Result<()>;
}

/// JSON files under the platform config directory
pub struct JsonFileStore {
    dir: PathBuf,
}

impl JsonFileStore {
    /// Store under `<config_dir>/serialbridge/`
    pub fn new() -> Result<Self> {
        let dir = dirs::config_dir()
            .context("no platform config directory")?
            .join("serialbridge");
        Ok(Self::at(dir))
    }

    /// Store under an explicit directory
    pub fn at(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn read_json<T: for<'de> Deserialize<'de>>(&self, file: &str) -> Result<Option<T>> {
        let path = self.dir.join(file);
        if !path.exists() {
            return Ok(None);
        }
        let text = fs::read_to_string(&path)
            .with_context(|| format!("reading {}", path.display()))?;
        let value = serde_json::from_str(&text)
            .with_context(|| format!("parsing {}", path.display()))?;
        Ok(Some(value))
    }

    fn write_json<T: Serialize>(&self, file: &str, value: &T) -> Result<()> {
        fs::create_dir_all(&self.dir)
            .with_context(|| format!("creating {}", self.dir.display()))?;
        let path = self.dir.join(file);
        let text = serde_json::to_string_pretty(value)?;
        fs::write(&path, text).with_context(|| format!("writing {}", path.display()))?;
        Ok(())
    }
}

impl ConfigStore for JsonFileStore {
    fn load(&self) -> Result<BridgeConfig> {
        match self.read_json::<BridgeConfig>(CONFIG_FILE) {
            Ok(Some(config)) => Ok(config),
            Ok(None) => {
                let config = BridgeConfig::default();
                self.save(&config)?;
                debug!(dir = %self.dir.display(), "created default config");
                Ok(config)
            }
            Err(e) => {
                // A corrupt file falls back to defaults rather than
                // blocking startup. The regenerated config is written back
                // so the device id stays stable across restarts.
                warn!(error = %e, "config unreadable, regenerating defaults");
                let config = BridgeConfig::default();
                self.save(&config)?;
                Ok(config)
            }
        }
    }

    fn save(&self, config: &BridgeConfig) -> Result<()> {
        self.write_json(CONFIG_FILE, config)
    }

    fn last_peripheral(&self) -> Option<PeripheralIdentity> {
        self.read_json(DEVICE_FILE).ok().flatten()
    }

    fn remember_peripheral(&self, identity: &PeripheralIdentity) -> Result<()> {
        self.write_json(DEVICE_FILE, identity)
    }
}

/// In-memory store, for tests and embedders that manage their own persistence
#[derive(Default)]
pub struct MemoryStore {
    config: Mutex<Option<BridgeConfig>>,
    peripheral: Mutex<Option<PeripheralIdentity>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_config(config: BridgeConfig) -> Self {
        Self {
            config: Mutex::new(Some(config)),
            peripheral: Mutex::new(None),
        }
    }
}

impl ConfigStore for MemoryStore {
    fn load(&self) -> Result<BridgeConfig> {
        let mut guard = self.config.lock().unwrap_or_else(|e| e.into_inner());
        Ok(guard.get_or_insert_with(BridgeConfig::default).clone())
    }

    fn save(&self, config: &BridgeConfig) -> Result<()> {
        *self.config.lock().unwrap_or_else(|e| e.into_inner()) = Some(config.clone());
        Ok(())
    }

    fn last_peripheral(&self) -> Option<PeripheralIdentity> {
        self.peripheral
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    fn remember_peripheral(&self, identity: &PeripheralIdentity) -> Result<()> {
        *self.peripheral.lock().unwrap_or_else(|e| e.into_inner()) = Some(identity.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = BridgeConfig::default();
        assert!(config.device_id.starts_with("bridge-"));
        assert!(config.auto_connect);
        assert_eq!(config.reconnect, ReconnectConfig::default());
    }

    #[test]
    fn test_config_deserializes_without_reconnect_section() {
        let json = r#"{
            "server_url": "wss://relay.example/ws",
            "device_id": "bridge-1",
            "auto_connect": false
        }"#;
        let config: BridgeConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.server_url, "wss://relay.example/ws");
        assert!(!config.auto_connect);
        assert_eq!(config.reconnect, ReconnectConfig::default());
    }

    #[test]
    fn test_file_store_creates_defaults_then_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonFileStore::at(dir.path());

        let first = store.load().unwrap();
        assert!(first.auto_connect);

        let mut edited = first.clone();
        edited.server_url = "wss://relay.example/ws".to_string();
        store.save(&edited).unwrap();

        let reloaded = store.load().unwrap();
        assert_eq!(reloaded, edited);
        // The generated device id is stable across loads.
        assert_eq!(reloaded.device_id, first.device_id);
    }

    #[test]
    fn test_file_store_corrupt_config_regenerates_stable_identity() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(CONFIG_FILE), "not json {").unwrap();
        let store = JsonFileStore::at(dir.path());

        let first = store.load().unwrap();
        // The regenerated defaults were persisted; a second load sees the
        // same identity, not another random one.
        let second = store.load().unwrap();
        assert_eq!(first.device_id, second.device_id);
        assert_eq!(first, second);
    }

    #[test]
    fn test_file_store_remembers_peripheral() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonFileStore::at(dir.path());
        assert!(store.last_peripheral().is_none());

        let identity = PeripheralIdentity::new("aa:bb:cc:dd:ee:ff", "HC-05");
        store.remember_peripheral(&identity).unwrap();
        assert_eq!(store.last_peripheral(), Some(identity));
    }

    #[test]
    fn test_memory_store_round_trip() {
        let store = MemoryStore::new();
        let mut config = store.load().unwrap();
        config.server_url = "ws://10.0.0.2:8080/ws".to_string();
        store.save(&config).unwrap();
        assert_eq!(store.load().unwrap(), config);
    }
}
