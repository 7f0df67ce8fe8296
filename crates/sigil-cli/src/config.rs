//! Configuration for the `sigil` binary.
//!
//! Read from `config/sigil.toml` (or `--config`), then overridden by
//! environment variables.  A missing file yields the defaults; a file that
//! exists but does not parse is an error.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use serde::Deserialize;
use sigil_store::StoreConfig;
use sigil_vault::{KeyEncoding, KeyRef};

/// Identifier the master key is known by.
pub const MASTER_KEY_ID: &str = "master";

// ---------------------------------------------------------------------------
// Sections
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct SigilConfig {
    pub database: DatabaseConfig,
    pub events: EventsConfig,
    pub rotation: RotationConfig,
    pub logging: LoggingConfig,
    pub defaults: DefaultsConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    /// SQLite file; parent directories are created on open.
    pub path: PathBuf,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("data/sigil.db"),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EventsConfig {
    /// Capacity of the domain event channel.
    pub capacity: usize,
}

impl Default for EventsConfig {
    fn default() -> Self {
        Self { capacity: 1024 }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RotationConfig {
    /// Upper bound on one strategy call.
    pub strategy_timeout_secs: u64,
}

impl Default for RotationConfig {
    fn default() -> Self {
        Self {
            strategy_timeout_secs: 30,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default filter when `RUST_LOG` is unset.
    pub level: String,
    /// Emit JSON lines instead of compact text.
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".into(),
            json: false,
        }
    }
}

/// Fallbacks for the global `--as`, `--project` and `--env` flags.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct DefaultsConfig {
    pub actor: Option<String>,
    pub project: Option<String>,
    pub environment: Option<String>,
}

// ---------------------------------------------------------------------------
// Loading
// ---------------------------------------------------------------------------

impl SigilConfig {
    /// Load `path` and apply overrides from the process environment.
    pub fn load(path: &Path) -> Result<Self> {
        let mut config = Self::from_file(path)?;
        config.apply_env(|key| std::env::var(key).ok());
        Ok(config)
    }

    /// Parse `path`, or return the defaults when it does not exist.
    pub fn from_file(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        toml::from_str(&content).with_context(|| format!("invalid config in {}", path.display()))
    }

    /// Apply `SIGIL_*` overrides looked up through `var`.
    pub fn apply_env(&mut self, var: impl Fn(&str) -> Option<String>) {
        if let Some(path) = var("SIGIL_DB_PATH") {
            self.database.path = PathBuf::from(path);
        }
        if let Some(level) = var("SIGIL_LOG_LEVEL") {
            self.logging.level = level;
        }
        if let Some(actor) = var("SIGIL_ACTOR") {
            self.defaults.actor = Some(actor);
        }
        if let Some(project) = var("SIGIL_PROJECT") {
            self.defaults.project = Some(project);
        }
        if let Some(environment) = var("SIGIL_ENV") {
            self.defaults.environment = Some(environment);
        }
    }

    pub fn store_config(&self) -> StoreConfig {
        StoreConfig {
            strategy_timeout: Duration::from_secs(self.rotation.strategy_timeout_secs.max(1)),
            event_capacity: self.events.capacity.max(1),
        }
    }
}

/// Decode the master key from `SIGIL_MASTER_KEY` (64 hex characters).
pub fn master_key(var: impl Fn(&str) -> Option<String>) -> Result<KeyRef> {
    let Some(encoded) = var("SIGIL_MASTER_KEY") else {
        bail!("SIGIL_MASTER_KEY is not set (generate one with `sigil keygen`)");
    };
    KeyRef::from_encoded(MASTER_KEY_ID, &encoded, KeyEncoding::Hex)
        .context("SIGIL_MASTER_KEY must be 64 hex characters")
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn missing_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = SigilConfig::from_file(&dir.path().join("absent.toml")).unwrap();
        assert_eq!(config.database.path, PathBuf::from("data/sigil.db"));
        assert_eq!(config.events.capacity, 1024);
        assert_eq!(config.rotation.strategy_timeout_secs, 30);
        assert_eq!(config.logging.level, "info");
        assert!(!config.logging.json);
    }

    #[test]
    fn partial_file_keeps_other_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sigil.toml");
        std::fs::write(
            &path,
            "[database]\npath = \"/var/lib/sigil.db\"\n\n[logging]\njson = true\n",
        )
        .unwrap();

        let config = SigilConfig::from_file(&path).unwrap();
        assert_eq!(config.database.path, PathBuf::from("/var/lib/sigil.db"));
        assert!(config.logging.json);
        assert_eq!(config.logging.level, "info");
        assert_eq!(config.events.capacity, 1024);
    }

    #[test]
    fn malformed_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sigil.toml");
        std::fs::write(&path, "[database\npath = 3").unwrap();
        assert!(SigilConfig::from_file(&path).is_err());
    }

    #[test]
    fn env_overrides_file_values() {
        let mut config = SigilConfig::default();
        config.apply_env(env(&[
            ("SIGIL_DB_PATH", "/tmp/other.db"),
            ("SIGIL_LOG_LEVEL", "debug"),
            ("SIGIL_PROJECT", "billing"),
        ]));
        assert_eq!(config.database.path, PathBuf::from("/tmp/other.db"));
        assert_eq!(config.logging.level, "debug");
        assert_eq!(config.defaults.project.as_deref(), Some("billing"));
        assert!(config.defaults.actor.is_none());
    }

    #[test]
    fn store_config_uses_rotation_timeout() {
        let mut config = SigilConfig::default();
        config.rotation.strategy_timeout_secs = 5;
        config.events.capacity = 16;
        let store = config.store_config();
        assert_eq!(store.strategy_timeout, Duration::from_secs(5));
        assert_eq!(store.event_capacity, 16);
    }

    #[test]
    fn master_key_decodes_hex() {
        let hex_key = "ab".repeat(32);
        let key = master_key(env(&[("SIGIL_MASTER_KEY", hex_key.as_str())])).unwrap();
        assert_eq!(key.id(), MASTER_KEY_ID);
        assert_eq!(key.material(), &[0xab; 32][..]);
    }

    #[test]
    fn master_key_rejects_bad_input() {
        assert!(master_key(env(&[])).is_err());
        assert!(master_key(env(&[("SIGIL_MASTER_KEY", "abcd")])).is_err());
        assert!(master_key(env(&[("SIGIL_MASTER_KEY", "zz")])).is_err());
    }
}
