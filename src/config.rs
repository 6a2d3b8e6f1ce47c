//! Configuration for stagehand.

use std::path::PathBuf;
use std::time::Duration;

use crate::error::ConfigError;

/// Runtime settings for the job store, runners and caches.
#[derive(Debug, Clone)]
pub struct JobsConfig {
    /// Root of the status-partitioned job store.
    pub jobs_path: PathBuf,
    /// Delay between `is_processing` checks when waiting on a run.
    pub poll_interval: Duration,
    /// Give up waiting on a run after this long.
    pub poll_timeout: Duration,
    /// Maximum number of artifacts kept loaded at once.
    pub artifact_cache_capacity: usize,
    /// Prefix for suggested job ids.
    pub job_prefix: String,
}

impl Default for JobsConfig {
    fn default() -> Self {
        Self {
            jobs_path: default_jobs_path(),
            poll_interval: Duration::from_millis(500),
            poll_timeout: Duration::from_secs(30),
            artifact_cache_capacity: 16,
            job_prefix: "cli".to_string(),
        }
    }
}

impl JobsConfig {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        // Load .env file if present (ignore errors if not found)
        let _ = dotenvy::dotenv();

        let defaults = Self::default();
        let artifact_cache_capacity = parse_optional_env(
            "STAGEHAND_ARTIFACT_CACHE_CAPACITY",
            defaults.artifact_cache_capacity,
        )?;
        if artifact_cache_capacity == 0 {
            return Err(ConfigError::InvalidValue {
                key: "STAGEHAND_ARTIFACT_CACHE_CAPACITY".to_string(),
                message: "must be greater than 0".to_string(),
            });
        }

        let job_prefix = optional_env("STAGEHAND_JOB_PREFIX")?.unwrap_or(defaults.job_prefix);
        crate::jobs::validate_job_id(&job_prefix).map_err(|e| ConfigError::InvalidValue {
            key: "STAGEHAND_JOB_PREFIX".to_string(),
            message: e.to_string(),
        })?;

        Ok(Self {
            jobs_path: optional_env("STAGEHAND_JOBS_PATH")?
                .map(PathBuf::from)
                .unwrap_or(defaults.jobs_path),
            poll_interval: Duration::from_millis(parse_optional_env(
                "STAGEHAND_POLL_INTERVAL_MS",
                500u64,
            )?),
            poll_timeout: Duration::from_secs(parse_optional_env(
                "STAGEHAND_POLL_TIMEOUT_SECS",
                30u64,
            )?),
            artifact_cache_capacity,
            job_prefix,
        })
    }
}

fn default_jobs_path() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".stagehand")
        .join("jobs")
}

pub(crate) fn optional_env(key: &str) -> Result<Option<String>, ConfigError> {
    match std::env::var(key) {
        Ok(val) if val.is_empty() => Ok(None),
        Ok(val) => Ok(Some(val)),
        Err(std::env::VarError::NotPresent) => Ok(None),
        Err(e) => Err(ConfigError::ParseError(format!(
            "failed to read {key}: {e}"
        ))),
    }
}

pub(crate) fn parse_optional_env<T>(key: &str, default: T) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    optional_env(key)?
        .map(|s| {
            s.parse().map_err(|e| ConfigError::InvalidValue {
                key: key.to_string(),
                message: format!("{e}"),
            })
        })
        .transpose()
        .map(|opt| opt.unwrap_or(default))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    // Env vars are process-global, so serialize tests that mutate them.
    static ENV_LOCK: Mutex<()> = Mutex::new(());

    const KEYS: [&str; 5] = [
        "STAGEHAND_JOBS_PATH",
        "STAGEHAND_POLL_INTERVAL_MS",
        "STAGEHAND_POLL_TIMEOUT_SECS",
        "STAGEHAND_ARTIFACT_CACHE_CAPACITY",
        "STAGEHAND_JOB_PREFIX",
    ];

    fn clear_env() {
        for key in KEYS {
            unsafe { std::env::remove_var(key) };
        }
    }

    #[test]
    fn optional_env_returns_none_for_missing_var() {
        let _lock = ENV_LOCK.lock();
        unsafe { std::env::remove_var("_TEST_STAGEHAND_MISSING_42") };
        assert!(optional_env("_TEST_STAGEHAND_MISSING_42").unwrap().is_none());
    }

    #[test]
    fn optional_env_returns_none_for_empty_string() {
        let _lock = ENV_LOCK.lock();
        unsafe { std::env::set_var("_TEST_STAGEHAND_EMPTY_42", "") };
        assert!(optional_env("_TEST_STAGEHAND_EMPTY_42").unwrap().is_none());
        unsafe { std::env::remove_var("_TEST_STAGEHAND_EMPTY_42") };
    }

    #[test]
    fn parse_optional_env_returns_error_for_invalid_value() {
        let _lock = ENV_LOCK.lock();
        unsafe { std::env::set_var("_TEST_STAGEHAND_PARSE_BAD_42", "soon") };
        let result: Result<u64, _> = parse_optional_env("_TEST_STAGEHAND_PARSE_BAD_42", 0);
        assert!(matches!(result, Err(ConfigError::InvalidValue { .. })));
        unsafe { std::env::remove_var("_TEST_STAGEHAND_PARSE_BAD_42") };
    }

    #[test]
    fn defaults_when_unset() {
        let _lock = ENV_LOCK.lock();
        clear_env();
        let config = JobsConfig::from_env().unwrap();
        assert_eq!(config.poll_interval, Duration::from_millis(500));
        assert_eq!(config.poll_timeout, Duration::from_secs(30));
        assert_eq!(config.artifact_cache_capacity, 16);
        assert_eq!(config.job_prefix, "cli");
        assert!(config.jobs_path.ends_with(".stagehand/jobs"));
    }

    #[test]
    fn reads_overrides() {
        let _lock = ENV_LOCK.lock();
        clear_env();
        unsafe {
            std::env::set_var("STAGEHAND_JOBS_PATH", "/var/lib/stagehand");
            std::env::set_var("STAGEHAND_POLL_INTERVAL_MS", "50");
            std::env::set_var("STAGEHAND_POLL_TIMEOUT_SECS", "2");
            std::env::set_var("STAGEHAND_ARTIFACT_CACHE_CAPACITY", "4");
            std::env::set_var("STAGEHAND_JOB_PREFIX", "ui");
        }
        let config = JobsConfig::from_env().unwrap();
        clear_env();

        assert_eq!(config.jobs_path, PathBuf::from("/var/lib/stagehand"));
        assert_eq!(config.poll_interval, Duration::from_millis(50));
        assert_eq!(config.poll_timeout, Duration::from_secs(2));
        assert_eq!(config.artifact_cache_capacity, 4);
        assert_eq!(config.job_prefix, "ui");
    }

    #[test]
    fn zero_cache_capacity_is_rejected() {
        let _lock = ENV_LOCK.lock();
        clear_env();
        unsafe { std::env::set_var("STAGEHAND_ARTIFACT_CACHE_CAPACITY", "0") };
        let result = JobsConfig::from_env();
        clear_env();
        assert!(matches!(result, Err(ConfigError::InvalidValue { key, .. }) if key == "STAGEHAND_ARTIFACT_CACHE_CAPACITY"));
    }

    #[test]
    fn unsafe_prefix_is_rejected() {
        let _lock = ENV_LOCK.lock();
        clear_env();
        unsafe { std::env::set_var("STAGEHAND_JOB_PREFIX", "../up") };
        let result = JobsConfig::from_env();
        clear_env();
        assert!(matches!(result, Err(ConfigError::InvalidValue { .. })));
    }
}
