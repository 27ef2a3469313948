use serde::{Deserialize, Serialize};
use std::{fs::File, io::BufReader, path::Path, time::Duration};

use crate::{coordinator::Environment, Error, InternalResult};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SystemConfig {
    /// Budget for a `request()` that does not set its own timeout.
    #[serde(default = "default_request_timeout", with = "duration_ms")]
    pub request_timeout: Duration,

    /// Per-peer budget while a joining component gathers initial state.
    #[serde(default = "default_late_join_timeout", with = "duration_ms")]
    pub late_join_timeout: Duration,

    /// Fail requests on topics without responders immediately instead of
    /// letting them time out.
    #[serde(default)]
    pub fail_fast_unroutable: bool,

    #[serde(default = "default_max_emit_depth")]
    pub max_emit_depth: usize,

    #[serde(default)]
    pub coordinator: CoordinatorConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CoordinatorConfig {
    /// Key the canonical data is stored under.
    #[serde(default = "default_storage_key")]
    pub storage_key: String,

    /// Profile created when storage holds nothing yet.
    #[serde(default = "default_profile")]
    pub default_profile: String,

    #[serde(default)]
    pub default_environment: Environment,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            storage_key: default_storage_key(),
            default_profile: default_profile(),
            default_environment: Environment::default(),
        }
    }
}

impl Default for SystemConfig {
    fn default() -> Self {
        Self {
            request_timeout: default_request_timeout(),
            late_join_timeout: default_late_join_timeout(),
            fail_fast_unroutable: false,
            max_emit_depth: default_max_emit_depth(),
            coordinator: CoordinatorConfig::default(),
        }
    }
}

impl SystemConfig {
    // JSONファイルから設定を読み込む
    pub fn from_file<P: AsRef<Path>>(path: P) -> InternalResult<Self> {
        let file = File::open(path)
            .map_err(|e| Error::Config(format!("Failed to open config file: {}", e)))?;
        let reader = BufReader::new(file);
        serde_json::from_reader(reader)
            .map_err(|e| Error::Config(format!("Failed to parse config file: {}", e)))
    }

    pub fn from_str(s: &str) -> InternalResult<Self> {
        serde_json::from_str(s)
            .map_err(|e| Error::Config(format!("Failed to parse config: {}", e)))
    }
}

fn default_request_timeout() -> Duration {
    Duration::from_secs(5)
}

fn default_late_join_timeout() -> Duration {
    Duration::from_secs(1)
}

fn default_max_emit_depth() -> usize {
    crate::event::event_bus::DEFAULT_MAX_EMIT_DEPTH
}

fn default_storage_key() -> String {
    "switchboard.data".to_string()
}

fn default_profile() -> String {
    "default".to_string()
}

// Duration型のシリアライズ/デシリアライズヘルパー
mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_millis() as u64)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn test_defaults_from_empty_object() {
        let config = SystemConfig::from_str("{}").unwrap();
        assert_eq!(config, SystemConfig::default());
        assert_eq!(config.request_timeout, Duration::from_secs(5));
        assert_eq!(config.coordinator.storage_key, "switchboard.data");
    }

    #[test]
    fn test_partial_override() {
        let config = SystemConfig::from_str(
            r#"{
                "request_timeout": 250,
                "fail_fast_unroutable": true,
                "coordinator": { "default_environment": "ground" }
            }"#,
        )
        .unwrap();

        assert_eq!(config.request_timeout, Duration::from_millis(250));
        assert!(config.fail_fast_unroutable);
        assert_eq!(config.coordinator.default_environment, Environment::Ground);
        assert_eq!(config.coordinator.default_profile, "default");
        assert_eq!(config.late_join_timeout, Duration::from_secs(1));
    }

    #[test]
    fn test_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{ "late_join_timeout": 50 }}"#).unwrap();

        let config = SystemConfig::from_file(file.path()).unwrap();
        assert_eq!(config.late_join_timeout, Duration::from_millis(50));
    }

    #[test]
    fn test_invalid_config() {
        assert!(matches!(
            SystemConfig::from_str(r#"{ "request_timeout": "soon" }"#),
            Err(Error::Config(_))
        ));
        assert!(SystemConfig::from_file("/nonexistent/switchboard.json").is_err());
    }

    #[test]
    fn test_round_trip_keeps_millis() {
        let config = SystemConfig {
            request_timeout: Duration::from_millis(1234),
            ..Default::default()
        };
        let json = serde_json::to_value(&config).unwrap();
        assert_eq!(json["request_timeout"], serde_json::json!(1234));
    }
}
