//! Ambient application settings: the defaults `dlt-receive` pre-fills
//! a [`crate::broker::Config`] with when the user doesn't override
//! them on the command line. Distinct from `broker::Config`, which is
//! a single run's options and is never persisted. Grounded in the
//! teacher's `config::Settings` (serde + toml, `dirs::config_dir`).

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Persisted application settings (spec's ambient "configuration"
/// concern, not named by `spec.md` itself).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    /// Default log level filter passed to `env_logger`, e.g. `"info"`.
    pub default_log_level: String,
    /// Default connect/ack timeout, in milliseconds, used to pre-fill
    /// `broker::Config::ack_timeout`.
    pub default_ack_timeout_ms: u64,
    /// When true, pre-fill `broker::Config::ignore_ack_timeout`.
    pub ignore_ack_timeout: bool,
    /// Default socket connect timeout, in milliseconds, used to
    /// pre-fill `broker::Config::connect_timeout`.
    pub default_connect_timeout_ms: u64,
    /// Recently used files or hosts, most recent first.
    pub recent_sources: Vec<String>,
    pub max_recent_sources: usize,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            default_log_level: "info".to_string(),
            default_ack_timeout_ms: 2000,
            ignore_ack_timeout: false,
            default_connect_timeout_ms: 5000,
            recent_sources: Vec::new(),
            max_recent_sources: 10,
        }
    }
}

impl Settings {
    pub fn load(path: impl AsRef<Path>) -> io::Result<Self> {
        let content = fs::read_to_string(path)?;
        toml::from_str(&content).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
    }

    pub fn save(&self, path: impl AsRef<Path>) -> io::Result<()> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        fs::write(path, content)
    }

    /// Records `source` as the most recently used, trimming the list
    /// to `max_recent_sources`.
    pub fn add_recent_source(&mut self, source: String) {
        self.recent_sources.retain(|s| s != &source);
        self.recent_sources.insert(0, source);
        if self.recent_sources.len() > self.max_recent_sources {
            self.recent_sources.truncate(self.max_recent_sources);
        }
    }

    pub fn ack_timeout(&self) -> Duration {
        Duration::from_millis(self.default_ack_timeout_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.default_connect_timeout_ms)
    }

    pub fn default_path() -> PathBuf {
        let mut path = dirs::config_dir().unwrap_or_else(|| PathBuf::from("."));
        path.push("dlt-broker");
        fs::create_dir_all(&path).ok();
        path.push("config.toml");
        path
    }

    pub fn load_default() -> Self {
        Self::load(Self::default_path()).unwrap_or_default()
    }

    pub fn save_default(&self) -> io::Result<()> {
        self.save(Self::default_path())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_through_toml() {
        let mut settings = Settings::default();
        settings.add_recent_source("/var/log/dlt.log".to_string());

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        settings.save(&path).unwrap();

        let loaded = Settings::load(&path).unwrap();
        assert_eq!(loaded.recent_sources, vec!["/var/log/dlt.log".to_string()]);
    }

    #[test]
    fn recent_sources_are_capped() {
        let mut settings = Settings::default();
        settings.max_recent_sources = 2;
        settings.add_recent_source("a".to_string());
        settings.add_recent_source("b".to_string());
        settings.add_recent_source("c".to_string());
        assert_eq!(settings.recent_sources, vec!["c".to_string(), "b".to_string()]);
    }
}
