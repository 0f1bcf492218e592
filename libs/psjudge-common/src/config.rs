// Service configuration shared by the api and the worker.
// Built once at startup and passed down explicitly.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::error::{JudgeError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Text,
    Json,
}

#[derive(Debug, Clone)]
pub struct JudgeConfig {
    pub redis_url: String,
    pub key_prefix: String,
    pub worker_slots: usize,
    pub queue_poll_interval_ms: u64,
    pub visibility_timeout_secs: u64,
    pub stale_running_secs: u64,
    pub reaper_interval_secs: u64,
    pub api_addr: String,
    pub metrics_addr: String,
    pub work_dir: PathBuf,
    pub languages_config: PathBuf,
    pub log_format: LogFormat,
}

impl Default for JudgeConfig {
    fn default() -> Self {
        Self {
            redis_url: "redis://127.0.0.1:6379".to_string(),
            key_prefix: "psjudge".to_string(),
            worker_slots: 3,
            queue_poll_interval_ms: 1000,
            visibility_timeout_secs: 300,
            stale_running_secs: 600,
            reaper_interval_secs: 30,
            api_addr: "0.0.0.0:9092".to_string(),
            metrics_addr: "0.0.0.0:9100".to_string(),
            work_dir: PathBuf::from("./builds"),
            languages_config: PathBuf::from("config/languages.json"),
            log_format: LogFormat::Text,
        }
    }
}

impl JudgeConfig {
    /// Load from the process environment, falling back to defaults.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();

        let log_format = match lookup("LOG_FORMAT").as_deref() {
            None | Some("") | Some("text") => LogFormat::Text,
            Some("json") => LogFormat::Json,
            Some(other) => {
                return Err(JudgeError::Config(format!(
                    "LOG_FORMAT must be 'text' or 'json', got '{}'",
                    other
                )))
            }
        };

        let config = Self {
            redis_url: lookup("REDIS_URL").unwrap_or(defaults.redis_url),
            key_prefix: lookup("KEY_PREFIX").unwrap_or(defaults.key_prefix),
            worker_slots: parse_or(&lookup, "WORKER_SLOTS", defaults.worker_slots)?,
            queue_poll_interval_ms: parse_or(
                &lookup,
                "QUEUE_POLL_INTERVAL_MS",
                defaults.queue_poll_interval_ms,
            )?,
            visibility_timeout_secs: parse_or(
                &lookup,
                "VISIBILITY_TIMEOUT_SECS",
                defaults.visibility_timeout_secs,
            )?,
            stale_running_secs: parse_or(&lookup, "STALE_RUNNING_SECS", defaults.stale_running_secs)?,
            reaper_interval_secs: parse_or(
                &lookup,
                "REAPER_INTERVAL_SECS",
                defaults.reaper_interval_secs,
            )?,
            api_addr: lookup("API_ADDR").unwrap_or(defaults.api_addr),
            metrics_addr: lookup("METRICS_ADDR").unwrap_or(defaults.metrics_addr),
            work_dir: lookup("WORK_DIR").map(PathBuf::from).unwrap_or(defaults.work_dir),
            languages_config: lookup("LANGUAGES_CONFIG")
                .map(PathBuf::from)
                .unwrap_or(defaults.languages_config),
            log_format,
        };
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.worker_slots == 0 {
            return Err(JudgeError::Config("WORKER_SLOTS must be at least 1".into()));
        }
        if self.key_prefix.is_empty() {
            return Err(JudgeError::Config("KEY_PREFIX must not be empty".into()));
        }
        if self.queue_poll_interval_ms == 0 || self.reaper_interval_secs == 0 {
            return Err(JudgeError::Config("polling intervals must be positive".into()));
        }
        Ok(())
    }

    pub fn queue_poll_interval(&self) -> Duration {
        Duration::from_millis(self.queue_poll_interval_ms)
    }

    pub fn visibility_timeout(&self) -> Duration {
        Duration::from_secs(self.visibility_timeout_secs)
    }

    pub fn stale_running(&self) -> Duration {
        Duration::from_secs(self.stale_running_secs)
    }

    pub fn reaper_interval(&self) -> Duration {
        Duration::from_secs(self.reaper_interval_secs)
    }

    /// Running jobs refresh their claim three times per stale bound.
    pub fn heartbeat_interval(&self) -> Duration {
        (self.stale_running() / 3).max(Duration::from_secs(1))
    }
}

fn parse_or<F, T>(lookup: &F, name: &str, default: T) -> Result<T>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
{
    match lookup(name) {
        None => Ok(default),
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|_| JudgeError::Config(format!("{} has invalid value '{}'", name, raw))),
    }
}
