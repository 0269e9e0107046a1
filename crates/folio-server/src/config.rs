//! Configuration file support

use folio_session::SessionConfig;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// Configuration for folio
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    /// Session engine tunables
    pub session: SessionConfig,
}

/// Where the store lives
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreKind {
    #[default]
    File,
    Memory,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Listen address
    pub bind: String,
    /// Root directory of the file store
    pub data_dir: Option<PathBuf>,
    pub store: StoreKind,
    /// Seconds between orphaned stream sweeps
    pub cleanup_interval_secs: u64,
    /// System prompt supplied to every run
    pub system_prompt: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1:8787".to_string(),
            data_dir: None,
            store: StoreKind::File,
            cleanup_interval_secs: 300,
            system_prompt: None,
        }
    }
}

impl ServerConfig {
    /// The configured data directory, or the platform default
    pub fn data_dir(&self) -> PathBuf {
        self.data_dir.clone().unwrap_or_else(|| {
            dirs::data_local_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join("folio")
        })
    }
}

impl Config {
    /// Get the config directory
    pub fn config_dir() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("folio")
    }

    /// Get the config file path
    pub fn config_path() -> PathBuf {
        if let Ok(path) = std::env::var("FOLIO_CONFIG_PATH") {
            return PathBuf::from(path);
        }
        Self::config_dir().join("config.toml")
    }

    /// Load config from `path`, falling back to defaults when it is missing
    /// or unreadable
    pub fn load_from(path: &Path) -> Self {
        if !path.exists() {
            return Self::default();
        }

        match fs::read_to_string(path) {
            Ok(content) => match toml::from_str(&content) {
                Ok(config) => config,
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "Failed to parse config file");
                    Self::default()
                }
            },
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "Failed to read config file");
                Self::default()
            }
        }
    }

    /// Create a default config file at `path` if it doesn't exist
    pub fn init(path: &Path) -> std::io::Result<()> {
        if path.exists() {
            return Ok(());
        }
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir)?;
        }
        fs::write(path, example_config())
    }
}

/// Generate example config content
pub fn example_config() -> &'static str {
    r#"# folio configuration file
# Place at ~/.config/folio/config.toml (Linux/Mac) or %APPDATA%\folio\config.toml (Windows)

[server]
# Listen address for the websocket endpoint
bind = "127.0.0.1:8787"

# Store backend (file, memory)
store = "file"

# Root directory of the file store (defaults to the platform data dir)
# data_dir = "~/.local/share/folio"

# Seconds between sweeps for abandoned in-flight turns
cleanup_interval_secs = 300

# system_prompt = "You are a helpful research assistant."

[session.stream]
flush_interval_ms = 1000
staleness_window_ms = 600000
completion_grace_ms = 5000
idle_timeout_ms = 300000
# turn_timeout_ms = 300000

[session.history]
compaction_threshold = 128000
summary_max_tokens = 2048
"#
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_example_config_parses() {
        let config: Config = toml::from_str(example_config()).unwrap();
        assert_eq!(config.server.bind, "127.0.0.1:8787");
        assert_eq!(config.server.store, StoreKind::File);
        assert_eq!(config.server.cleanup_interval_secs, 300);
        assert_eq!(config.session.stream.flush_interval_ms, 1_000);
        assert_eq!(config.session.stream.turn_timeout_ms, None);
        assert_eq!(config.session.history.compaction_threshold, 128_000);
    }

    #[test]
    fn test_partial_config_keeps_defaults() {
        let config: Config = toml::from_str(
            r#"
            [server]
            store = "memory"

            [session.stream]
            turn_timeout_ms = 1000
            "#,
        )
        .unwrap();
        assert_eq!(config.server.store, StoreKind::Memory);
        assert_eq!(config.server.bind, "127.0.0.1:8787");
        assert_eq!(config.session.stream.turn_timeout_ms, Some(1_000));
        assert_eq!(config.session.stream.staleness_window_ms, 600_000);
    }

    #[test]
    fn test_missing_file_is_default() {
        let config = Config::load_from(Path::new("/nonexistent/folio/config.toml"));
        assert_eq!(config.server.cleanup_interval_secs, 300);
        assert!(config.server.system_prompt.is_none());
    }

    #[test]
    fn test_explicit_data_dir_wins() {
        let server = ServerConfig {
            data_dir: Some(PathBuf::from("/tmp/folio-data")),
            ..Default::default()
        };
        assert_eq!(server.data_dir(), PathBuf::from("/tmp/folio-data"));
    }
}
