#![forbid(unsafe_code)]

//! Runtime timing configuration: defaults, an optional YAML file, then `TT_*` environment overrides.

use crate::error::{RuntimeError, RuntimeResult};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RuntimeConfig {
    /// Registry poll interval for one job.
    pub poll_ms: u64,
    /// Wall-clock budget before a non-terminal operation is failed with a timeout.
    pub max_poll_ms: u64,
    /// Grace period before a terminal operation is dropped from the registry.
    pub cleanup_delay_ms: u64,
    pub validity_check_ms: u64,
    pub progress_flush_ms: u64,
    pub stream_poll_ms: u64,
    pub stream_flush_ms: u64,
    pub stream_retention_ms: u64,
    pub job_retention_ms: u64,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            poll_ms: 1_500,
            max_poll_ms: 10 * 60 * 1_000,
            cleanup_delay_ms: 5_000,
            validity_check_ms: 2_000,
            progress_flush_ms: 500,
            stream_poll_ms: 1_000,
            stream_flush_ms: 250,
            stream_retention_ms: 60_000,
            job_retention_ms: 7 * 24 * 60 * 60 * 1_000,
        }
    }
}

type FieldMut = fn(&mut RuntimeConfig) -> &mut u64;

/// Every environment override and the field it sets.
const ENV_OVERRIDES: [(&str, FieldMut); 9] = [
    ("TT_POLL_MS", |c| &mut c.poll_ms),
    ("TT_MAX_POLL_MS", |c| &mut c.max_poll_ms),
    ("TT_CLEANUP_DELAY_MS", |c| &mut c.cleanup_delay_ms),
    ("TT_VALIDITY_CHECK_MS", |c| &mut c.validity_check_ms),
    ("TT_PROGRESS_FLUSH_MS", |c| &mut c.progress_flush_ms),
    ("TT_STREAM_POLL_MS", |c| &mut c.stream_poll_ms),
    ("TT_STREAM_FLUSH_MS", |c| &mut c.stream_flush_ms),
    ("TT_STREAM_RETENTION_MS", |c| &mut c.stream_retention_ms),
    ("TT_JOB_RETENTION_MS", |c| &mut c.job_retention_ms),
];

impl RuntimeConfig {
    pub fn from_yaml_str(raw: &str) -> RuntimeResult<Self> {
        if raw.trim().is_empty() {
            return Ok(Self::default());
        }
        let config: Self = serde_yaml::from_str(raw)
            .map_err(|err| RuntimeError::Config(format!("invalid yaml: {err}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Defaults, then the YAML file (if any), then process environment overrides.
    pub fn load(path: Option<&Path>) -> RuntimeResult<Self> {
        let mut config = match path {
            Some(path) => {
                let raw = std::fs::read_to_string(path).map_err(|err| {
                    RuntimeError::Config(format!("read {}: {err}", path.display()))
                })?;
                Self::from_yaml_str(&raw)?
            }
            None => Self::default(),
        };
        config.apply_env_with(|name| std::env::var(name).ok())?;
        Ok(config)
    }

    pub fn apply_env_with(
        &mut self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> RuntimeResult<()> {
        for (name, field) in ENV_OVERRIDES {
            let Some(raw) = lookup(name)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
            else {
                continue;
            };
            let value = raw.parse::<u64>().map_err(|_| {
                RuntimeError::Config(format!("{name} must be an integer (milliseconds)"))
            })?;
            *field(self) = value;
        }
        self.validate()
    }

    pub fn validate(&self) -> RuntimeResult<()> {
        let positive = [
            ("poll_ms", self.poll_ms),
            ("max_poll_ms", self.max_poll_ms),
            ("validity_check_ms", self.validity_check_ms),
            ("progress_flush_ms", self.progress_flush_ms),
            ("stream_poll_ms", self.stream_poll_ms),
            ("stream_flush_ms", self.stream_flush_ms),
        ];
        for (name, value) in positive {
            if value == 0 {
                return Err(RuntimeError::Config(format!("{name} must be greater than 0")));
            }
        }
        if self.max_poll_ms < self.poll_ms {
            return Err(RuntimeError::Config(
                "max_poll_ms must not be smaller than poll_ms".to_string(),
            ));
        }
        Ok(())
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_ms)
    }

    pub fn max_poll_duration(&self) -> Duration {
        Duration::from_millis(self.max_poll_ms)
    }

    pub fn cleanup_delay(&self) -> Duration {
        Duration::from_millis(self.cleanup_delay_ms)
    }

    pub fn validity_check_interval(&self) -> Duration {
        Duration::from_millis(self.validity_check_ms)
    }

    pub fn progress_flush_interval(&self) -> Duration {
        Duration::from_millis(self.progress_flush_ms)
    }

    pub fn stream_poll_interval(&self) -> Duration {
        Duration::from_millis(self.stream_poll_ms)
    }

    pub fn stream_flush_interval(&self) -> Duration {
        Duration::from_millis(self.stream_flush_ms)
    }

    pub fn stream_retention(&self) -> Duration {
        Duration::from_millis(self.stream_retention_ms)
    }

    pub fn job_retention(&self) -> Duration {
        Duration::from_millis(self.job_retention_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn defaults_are_valid() {
        let config = RuntimeConfig::default();
        config.validate().expect("defaults validate");
        assert_eq!(config.poll_interval(), Duration::from_millis(1_500));
        assert_eq!(config.max_poll_duration(), Duration::from_secs(600));
        assert_eq!(config.stream_retention(), Duration::from_secs(60));
    }

    #[test]
    fn yaml_overrides_only_named_fields() {
        let config = RuntimeConfig::from_yaml_str("poll_ms: 200\nstream_flush_ms: 50\n")
            .expect("parse yaml");
        assert_eq!(config.poll_ms, 200);
        assert_eq!(config.stream_flush_ms, 50);
        assert_eq!(config.cleanup_delay_ms, 5_000);

        assert!(RuntimeConfig::from_yaml_str("").is_ok());
        assert!(RuntimeConfig::from_yaml_str("pol_ms: 1\n").is_err());
        assert!(RuntimeConfig::from_yaml_str("poll_ms: 0\n").is_err());
    }

    #[test]
    fn env_overrides_win_and_are_validated() {
        let env: HashMap<&str, &str> =
            HashMap::from([("TT_POLL_MS", " 250 "), ("TT_STREAM_RETENTION_MS", "10")]);
        let mut config = RuntimeConfig::default();
        config
            .apply_env_with(|name| env.get(name).map(|v| v.to_string()))
            .expect("env overrides");
        assert_eq!(config.poll_ms, 250);
        assert_eq!(config.stream_retention_ms, 10);

        let mut config = RuntimeConfig::default();
        let err = config
            .apply_env_with(|name| (name == "TT_MAX_POLL_MS").then(|| "abc".to_string()))
            .unwrap_err();
        assert!(err.to_string().contains("TT_MAX_POLL_MS"), "{err}");

        let mut config = RuntimeConfig::default();
        assert!(
            config
                .apply_env_with(|name| (name == "TT_MAX_POLL_MS").then(|| "10".to_string()))
                .is_err()
        );
    }

    #[test]
    fn every_env_name_sets_its_own_field() {
        let mut config = RuntimeConfig::default();
        config
            .apply_env_with(|name| {
                ENV_OVERRIDES
                    .iter()
                    .position(|(known, _)| *known == name)
                    .map(|index| (100_000 + index as u64).to_string())
            })
            .expect("env overrides");

        assert_eq!(
            config,
            RuntimeConfig {
                poll_ms: 100_000,
                max_poll_ms: 100_001,
                cleanup_delay_ms: 100_002,
                validity_check_ms: 100_003,
                progress_flush_ms: 100_004,
                stream_poll_ms: 100_005,
                stream_flush_ms: 100_006,
                stream_retention_ms: 100_007,
                job_retention_ms: 100_008,
            }
        );
    }

    #[test]
    fn load_reads_file() {
        let dir = tempfile::tempdir().expect("temp dir");
        let path = dir.path().join("tether.yaml");
        std::fs::write(&path, "validity_check_ms: 700\n").expect("write config");
        let config = RuntimeConfig::from_yaml_str(&std::fs::read_to_string(&path).expect("read"))
            .expect("parse");
        assert_eq!(config.validity_check_ms, 700);
        assert!(RuntimeConfig::load(Some(&dir.path().join("missing.yaml"))).is_err());
    }
}
