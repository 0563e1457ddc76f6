use crate::classifier::DEFAULT_PROMPT;
use crate::error::{TrackerError, TrackerResult};
use crate::frame_store::DEFAULT_MIN_FREE_DISK_BYTES;
use crate::paths;
use anyhow::{Context, Result};
use chrono::TimeDelta;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(5);
pub const DEFAULT_MODEL: &str = "gpt-5";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrackerConfig {
    /// Sessions are scoped to an owner; at most one is active per owner.
    pub owner: String,
    /// Time between samples, e.g. `"5s"` or `"1m 30s"`.
    #[serde(with = "humantime_duration")]
    pub interval: Duration,
    pub timeline_granularity_minutes: u32,
    pub min_free_disk_bytes: u64,
    pub data_dir: PathBuf,
    /// Append a summary to `reports.md` when a session ends.
    pub report: bool,
    pub classifier: ClassifierConfig,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ClassifierProvider {
    Openai,
    Metadata,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClassifierConfig {
    pub provider: ClassifierProvider,
    pub model: String,
    pub prompt: String,
}

impl Default for ClassifierConfig {
    fn default() -> Self {
        Self {
            provider: ClassifierProvider::Openai,
            model: DEFAULT_MODEL.to_string(),
            prompt: DEFAULT_PROMPT.to_string(),
        }
    }
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            owner: default_owner(),
            interval: DEFAULT_INTERVAL,
            timeline_granularity_minutes: 60,
            min_free_disk_bytes: DEFAULT_MIN_FREE_DISK_BYTES,
            data_dir: paths::default_data_dir(),
            report: true,
            classifier: ClassifierConfig::default(),
        }
    }
}

fn default_owner() -> String {
    std::env::var("USER")
        .ok()
        .map(|user| user.trim().to_string())
        .filter(|user| !user.is_empty())
        .unwrap_or_else(|| "local".to_string())
}

impl TrackerConfig {
    /// Read a TOML config; a missing file yields the defaults.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let text = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config {}", path.display()))?;
        Self::parse(&text)
            .with_context(|| format!("failed to parse config {} (expected TOML)", path.display()))
    }

    pub fn parse(text: &str) -> Result<Self> {
        Ok(toml::from_str(text)?)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).with_context(|| {
                format!("failed to create config directory {}", parent.display())
            })?;
        }
        let text = toml::to_string_pretty(self).context("failed to encode config")?;
        std::fs::write(path, text)
            .with_context(|| format!("failed to write config {}", path.display()))?;
        Ok(())
    }

    pub fn validate(&self) -> TrackerResult<()> {
        if self.interval.is_zero() {
            return Err(TrackerError::InvalidConfig(
                "interval must be greater than 0".to_string(),
            ));
        }
        if self.timeline_granularity_minutes == 0 {
            return Err(TrackerError::InvalidConfig(
                "timeline_granularity_minutes must be greater than 0".to_string(),
            ));
        }
        if self.owner.trim().is_empty() {
            return Err(TrackerError::InvalidConfig("owner must not be empty".to_string()));
        }
        Ok(())
    }

    pub fn granularity(&self) -> TimeDelta {
        TimeDelta::minutes(i64::from(self.timeline_granularity_minutes))
    }

    pub fn store_path(&self) -> PathBuf {
        paths::store_path(&self.data_dir)
    }

    pub fn samples_dir(&self) -> PathBuf {
        paths::samples_dir(&self.data_dir)
    }

    pub fn captures_dir(&self) -> PathBuf {
        paths::captures_dir(&self.data_dir)
    }

    pub fn lock_path(&self) -> PathBuf {
        paths::lock_path(&self.data_dir)
    }

    pub fn report_path(&self) -> PathBuf {
        paths::report_path(&self.data_dir)
    }
}

mod humantime_duration {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&humantime::format_duration(*duration).to_string())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let text = String::deserialize(deserializer)?;
        humantime::parse_duration(&text).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::{ClassifierProvider, TrackerConfig};
    use crate::error::TrackerError;
    use chrono::TimeDelta;
    use std::path::PathBuf;
    use std::time::Duration;
    use tempfile::tempdir;

    #[test]
    fn parses_partial_toml_over_defaults() {
        let config = TrackerConfig::parse(
            r#"
owner = "alex"
interval = "1m 30s"
data_dir = "/tmp/timeline"

[classifier]
provider = "metadata"
"#,
        )
        .expect("parse");

        assert_eq!(config.owner, "alex");
        assert_eq!(config.interval, Duration::from_secs(90));
        assert_eq!(config.data_dir, PathBuf::from("/tmp/timeline"));
        assert_eq!(config.classifier.provider, ClassifierProvider::Metadata);
        assert_eq!(config.classifier.model, "gpt-5");
        assert_eq!(config.granularity(), TimeDelta::hours(1));
        assert!(config.report);
        assert_eq!(config.store_path(), PathBuf::from("/tmp/timeline/sessions.json"));
    }

    #[test]
    fn rejects_bad_durations() {
        assert!(TrackerConfig::parse("interval = \"soon\"").is_err());
    }

    #[test]
    fn validation_rejects_zero_interval_and_granularity() {
        let config = TrackerConfig {
            interval: Duration::ZERO,
            ..TrackerConfig::default()
        };
        assert!(matches!(config.validate(), Err(TrackerError::InvalidConfig(_))));

        let config = TrackerConfig {
            timeline_granularity_minutes: 0,
            ..TrackerConfig::default()
        };
        assert!(matches!(config.validate(), Err(TrackerError::InvalidConfig(_))));

        assert!(TrackerConfig::default().validate().is_ok());
    }

    #[test]
    fn missing_file_means_defaults_and_save_round_trips() {
        let temp = tempdir().expect("tempdir");
        let path = temp.path().join("config.toml");
        let defaults = TrackerConfig::load(&path).expect("defaults");
        assert_eq!(defaults.interval, Duration::from_secs(5));

        let config = TrackerConfig {
            owner: "sam".to_string(),
            interval: Duration::from_secs(20),
            data_dir: temp.path().to_path_buf(),
            ..defaults
        };
        config.save(&path).expect("save");
        assert_eq!(TrackerConfig::load(&path).expect("load"), config);
    }
}
