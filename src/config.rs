//! Configuration for the InsideOut telemetry monitor.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Shortest poll interval we accept; anything faster is not dashboard scale.
pub const MIN_POLL_INTERVAL: Duration = Duration::from_millis(250);

/// Main configuration for the monitor.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Base URL of the inference backend
    pub inference_url: String,

    /// Client-side bound on a single inference request
    #[serde(with = "duration_millis")]
    pub request_timeout: Duration,

    /// How often the reconciliation loop polls for the latest reading
    #[serde(with = "duration_millis")]
    pub poll_interval: Duration,

    /// How often the liveness probe runs (zero disables it)
    #[serde(with = "duration_secs")]
    pub probe_interval: Duration,

    /// Subject whose running aggregate is maintained
    pub subject_id: String,

    /// IANA timezone the backend writes its naive timestamps in
    pub backend_timezone: String,

    /// First delay before resubscribing to the status feed
    #[serde(with = "duration_millis")]
    pub resubscribe_initial: Duration,

    /// Upper bound on the resubscribe delay
    #[serde(with = "duration_millis")]
    pub resubscribe_max: Duration,

    /// Optimistic write attempts before an aggregate update gives up
    pub max_write_attempts: u32,

    /// Path for the aggregate store and activity stats
    pub data_path: PathBuf,
}

impl Default for Config {
    fn default() -> Self {
        let data_dir = dirs::data_local_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("insideout-telemetry");

        Self {
            inference_url: "http://localhost:5000".to_string(),
            request_timeout: Duration::from_secs(5),
            poll_interval: Duration::from_secs(2),
            probe_interval: Duration::from_secs(30),
            subject_id: "elderly".to_string(),
            backend_timezone: "UTC".to_string(),
            resubscribe_initial: Duration::from_millis(500),
            resubscribe_max: Duration::from_secs(30),
            max_write_attempts: 5,
            data_path: data_dir,
        }
    }
}

impl Config {
    /// Load configuration from the default location.
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from(&Self::config_path())
    }

    /// Load configuration from an explicit path, falling back to defaults
    /// when the file does not exist.
    pub fn load_from(path: &std::path::Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let content =
            std::fs::read_to_string(path).map_err(|e| ConfigError::Io(e.to_string()))?;
        let config: Config =
            serde_json::from_str(&content).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Save configuration to the default location.
    pub fn save(&self) -> Result<(), ConfigError> {
        self.save_to(&Self::config_path())
    }

    /// Save configuration to an explicit path.
    pub fn save_to(&self, path: &std::path::Path) -> Result<(), ConfigError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| ConfigError::Io(e.to_string()))?;
        }

        let content = serde_json::to_string_pretty(self)
            .map_err(|e| ConfigError::Serialize(e.to_string()))?;

        std::fs::write(path, content).map_err(|e| ConfigError::Io(e.to_string()))?;

        Ok(())
    }

    /// Get the path to the configuration file.
    pub fn config_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("insideout-telemetry")
            .join("config.json")
    }

    /// Ensure the data directory exists.
    pub fn ensure_directories(&self) -> Result<(), ConfigError> {
        std::fs::create_dir_all(&self.data_path).map_err(|e| ConfigError::Io(e.to_string()))?;
        Ok(())
    }

    /// Path of the JSON file backing the aggregate store.
    pub fn aggregate_store_path(&self) -> PathBuf {
        self.data_path.join("aggregates.json")
    }

    /// Path of the persisted activity counters.
    pub fn stats_path(&self) -> PathBuf {
        self.data_path.join("stats.json")
    }

    /// Resolve the backend timezone name.
    pub fn timezone(&self) -> Result<chrono_tz::Tz, ConfigError> {
        self.backend_timezone
            .parse::<chrono_tz::Tz>()
            .map_err(|_| {
                ConfigError::Invalid(format!(
                    "unknown backend timezone '{}'",
                    self.backend_timezone
                ))
            })
    }

    /// Reject values the reconciliation loop cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.inference_url.trim().is_empty() {
            return Err(ConfigError::Invalid("inference_url is empty".to_string()));
        }
        if self.poll_interval < MIN_POLL_INTERVAL {
            return Err(ConfigError::Invalid(format!(
                "poll_interval must be at least {}ms",
                MIN_POLL_INTERVAL.as_millis()
            )));
        }
        if self.request_timeout.is_zero() {
            return Err(ConfigError::Invalid(
                "request_timeout must be non-zero".to_string(),
            ));
        }
        if self.subject_id.trim().is_empty() {
            return Err(ConfigError::Invalid("subject_id is empty".to_string()));
        }
        if self.max_write_attempts == 0 {
            return Err(ConfigError::Invalid(
                "max_write_attempts must be at least 1".to_string(),
            ));
        }
        if self.resubscribe_max < self.resubscribe_initial {
            return Err(ConfigError::Invalid(
                "resubscribe_max is shorter than resubscribe_initial".to_string(),
            ));
        }
        self.timezone()?;
        Ok(())
    }
}

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(String),
    #[error("Parse error: {0}")]
    Parse(String),
    #[error("Serialize error: {0}")]
    Serialize(String),
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Serde support for Duration as whole seconds.
mod duration_secs {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        duration.as_secs().serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secs = u64::deserialize(deserializer)?;
        Ok(Duration::from_secs(secs))
    }
}

/// Serde support for Duration as milliseconds.
mod duration_millis {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        (duration.as_millis() as u64).serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}
