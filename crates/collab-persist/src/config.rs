//! Engine configuration, environment-driven with sane defaults

use std::env;
use std::path::PathBuf;
use std::time::Duration;
use tracing::info;

/// Tunables for the persistence engine. The debounce and compaction figures
/// mirror the reference deployment; production overrides them via env.
#[derive(Debug, Clone)]
pub struct Config {
    pub db_path: PathBuf,
    /// Debounce window coalescing edit bursts into one log write.
    pub flush_debounce_ms: u64,
    /// Period of the per-document compaction timer.
    pub compact_interval_secs: u64,
    /// Minimum wall-clock gap between automatic version snapshots.
    pub autoversion_min_secs: u64,
    /// Retained version snapshots per document; oldest pruned first.
    pub version_retention: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from("data/documents.db"),
            flush_debounce_ms: 50,
            compact_interval_secs: 10,
            autoversion_min_secs: 60,
            version_retention: 25,
        }
    }
}

fn env_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

impl Config {
    pub fn from_env() -> Self {
        let defaults = Config::default();
        let config = Self {
            db_path: env::var("PERSIST_DB_PATH")
                .map(PathBuf::from)
                .unwrap_or(defaults.db_path),
            flush_debounce_ms: env_or("PERSIST_FLUSH_DEBOUNCE_MS", defaults.flush_debounce_ms),
            compact_interval_secs: env_or(
                "PERSIST_COMPACT_INTERVAL_SECS",
                defaults.compact_interval_secs,
            ),
            autoversion_min_secs: env_or(
                "PERSIST_AUTOVERSION_MIN_SECS",
                defaults.autoversion_min_secs,
            ),
            version_retention: env_or("PERSIST_VERSION_RETENTION", defaults.version_retention),
        };
        info!(
            "Persistence configuration: debounce {}ms, compaction every {}s, auto-version every {}s, {} versions retained",
            config.flush_debounce_ms,
            config.compact_interval_secs,
            config.autoversion_min_secs,
            config.version_retention
        );
        config
    }

    pub fn flush_debounce(&self) -> Duration {
        Duration::from_millis(self.flush_debounce_ms)
    }

    pub fn compact_interval(&self) -> Duration {
        Duration::from_secs(self.compact_interval_secs)
    }

    pub fn autoversion_min(&self) -> Duration {
        Duration::from_secs(self.autoversion_min_secs)
    }
}
