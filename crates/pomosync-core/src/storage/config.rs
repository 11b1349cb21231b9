//! TOML-based application configuration.
//!
//! Stores:
//! - Timer durations and pomodoro cycling
//! - Sync endpoint and retry tuning
//! - Recovery plausibility bounds
//!
//! Configuration is stored at `~/.config/pomosync/config.toml`.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use super::data_dir;
use crate::error::ConfigError;
use crate::timer::TimerPolicy;

/// Timer configuration. Durations are minutes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimerConfig {
    #[serde(default = "default_work_minutes")]
    pub work_minutes: u64,
    #[serde(default = "default_short_break_minutes")]
    pub short_break_minutes: u64,
    #[serde(default = "default_long_break_minutes")]
    pub long_break_minutes: u64,
    #[serde(default = "default_pomodoros_until_long_break")]
    pub pomodoros_until_long_break: u32,
    #[serde(default)]
    pub auto_start_breaks: bool,
    #[serde(default)]
    pub auto_start_work: bool,
}

/// Sync configuration. Without `base_url` the client stays local-only.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncConfig {
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default = "default_backoff_base_secs")]
    pub backoff_base_secs: u64,
    #[serde(default = "default_backoff_cap_secs")]
    pub backoff_cap_secs: u64,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    /// Oldest pending entry age above which status reports `error`.
    #[serde(default = "default_max_queue_age_secs")]
    pub max_queue_age_secs: u64,
    /// Retry ceiling; unset retries forever.
    #[serde(default)]
    pub max_attempts: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecoveryConfig {
    /// Recovered elapsed above this is treated as clock skew.
    #[serde(default = "default_max_plausible_secs")]
    pub max_plausible_secs: u64,
    /// Persist a snapshot every N ticks while running.
    #[serde(default = "default_checkpoint_every_ticks")]
    pub checkpoint_every_ticks: u32,
}

/// Application configuration.
///
/// Serialized to/from TOML at `~/.config/pomosync/config.toml`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub timer: TimerConfig,
    #[serde(default)]
    pub sync: SyncConfig,
    #[serde(default)]
    pub recovery: RecoveryConfig,
}

// Default functions
fn default_work_minutes() -> u64 {
    25
}
fn default_short_break_minutes() -> u64 {
    5
}
fn default_long_break_minutes() -> u64 {
    15
}
fn default_pomodoros_until_long_break() -> u32 {
    4
}
fn default_backoff_base_secs() -> u64 {
    1
}
fn default_backoff_cap_secs() -> u64 {
    60
}
fn default_request_timeout_secs() -> u64 {
    10
}
fn default_max_queue_age_secs() -> u64 {
    24 * 60 * 60
}
fn default_max_plausible_secs() -> u64 {
    24 * 60 * 60
}
fn default_checkpoint_every_ticks() -> u32 {
    30
}

impl Default for TimerConfig {
    fn default() -> Self {
        Self {
            work_minutes: default_work_minutes(),
            short_break_minutes: default_short_break_minutes(),
            long_break_minutes: default_long_break_minutes(),
            pomodoros_until_long_break: default_pomodoros_until_long_break(),
            auto_start_breaks: false,
            auto_start_work: false,
        }
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            base_url: None,
            backoff_base_secs: default_backoff_base_secs(),
            backoff_cap_secs: default_backoff_cap_secs(),
            request_timeout_secs: default_request_timeout_secs(),
            max_queue_age_secs: default_max_queue_age_secs(),
            max_attempts: None,
        }
    }
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            max_plausible_secs: default_max_plausible_secs(),
            checkpoint_every_ticks: default_checkpoint_every_ticks(),
        }
    }
}

impl Config {
    fn get_json_value_by_path<'a>(
        root: &'a serde_json::Value,
        key: &str,
    ) -> Option<&'a serde_json::Value> {
        if key.is_empty() {
            return None;
        }

        let mut current = root;
        for part in key.split('.') {
            current = current.get(part)?;
        }
        Some(current)
    }

    fn set_json_value_by_path(
        root: &mut serde_json::Value,
        key: &str,
        value: &str,
    ) -> Result<(), ConfigError> {
        let unknown = || ConfigError::UnknownKey(key.to_string());
        let invalid = |message: String| ConfigError::InvalidValue {
            key: key.to_string(),
            message,
        };

        let mut parts = key.split('.').peekable();
        if parts.peek().is_none() || key.is_empty() {
            return Err(unknown());
        }

        let mut current = root;
        while let Some(part) = parts.next() {
            let is_leaf = parts.peek().is_none();
            if is_leaf {
                let obj = current.as_object_mut().ok_or_else(unknown)?;
                let existing = obj.get(part).ok_or_else(unknown)?;

                let new_value = match existing {
                    serde_json::Value::Bool(_) => serde_json::Value::Bool(
                        value
                            .parse::<bool>()
                            .map_err(|e| invalid(e.to_string()))?,
                    ),
                    serde_json::Value::Number(_) => serde_json::Value::Number(
                        value
                            .parse::<u64>()
                            .map_err(|_| invalid(format!("cannot parse '{value}' as number")))?
                            .into(),
                    ),
                    // Optional fields: "none" clears, digits become a number.
                    serde_json::Value::Null | serde_json::Value::String(_)
                        if value.eq_ignore_ascii_case("none") =>
                    {
                        serde_json::Value::Null
                    }
                    serde_json::Value::Null => match value.parse::<u64>() {
                        Ok(n) => serde_json::Value::Number(n.into()),
                        Err(_) => serde_json::Value::String(value.into()),
                    },
                    serde_json::Value::Object(_) | serde_json::Value::Array(_) => {
                        return Err(unknown());
                    }
                    serde_json::Value::String(_) => serde_json::Value::String(value.into()),
                };

                obj.insert(part.to_string(), new_value);
                return Ok(());
            }

            current = current.get_mut(part).ok_or_else(unknown)?;
        }

        Err(unknown())
    }

    pub fn path() -> Result<PathBuf, ConfigError> {
        Ok(data_dir()?.join("config.toml"))
    }

    /// Load from the default location, writing defaults if the file is missing.
    pub fn load() -> Result<Self, ConfigError> {
        let path = Self::path()?;
        if path.exists() {
            Self::load_from(&path)
        } else {
            let cfg = Self::default();
            cfg.save_to(&path)?;
            Ok(cfg)
        }
    }

    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let load_failed = |message: String| ConfigError::LoadFailed {
            path: path.to_path_buf(),
            message,
        };
        let content = std::fs::read_to_string(path).map_err(|e| load_failed(e.to_string()))?;
        let cfg: Config = toml::from_str(&content).map_err(|e| load_failed(e.to_string()))?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Persist to the default location.
    pub fn save(&self) -> Result<(), ConfigError> {
        self.save_to(&Self::path()?)
    }

    pub fn save_to(&self, path: &Path) -> Result<(), ConfigError> {
        let save_failed = |message: String| ConfigError::SaveFailed {
            path: path.to_path_buf(),
            message,
        };
        let content = toml::to_string_pretty(self).map_err(|e| save_failed(e.to_string()))?;
        std::fs::write(path, content).map_err(|e| save_failed(e.to_string()))?;
        Ok(())
    }

    /// Get a config value as string by dot-separated key.
    pub fn get(&self, key: &str) -> Option<String> {
        let json = serde_json::to_value(self).ok()?;
        let val = Self::get_json_value_by_path(&json, key)?;
        match val {
            serde_json::Value::String(s) => Some(s.clone()),
            serde_json::Value::Object(_) => None,
            other => Some(other.to_string()),
        }
    }

    /// Set a config value by key. The change is validated but not saved.
    pub fn set(&mut self, key: &str, value: &str) -> Result<(), ConfigError> {
        let invalid = |message: String| ConfigError::InvalidValue {
            key: key.to_string(),
            message,
        };
        let mut json = serde_json::to_value(&*self).map_err(|e| invalid(e.to_string()))?;
        Self::set_json_value_by_path(&mut json, key, value)?;
        let next: Config = serde_json::from_value(json).map_err(|e| invalid(e.to_string()))?;
        next.validate()?;
        *self = next;
        Ok(())
    }

    /// Flattened `key = value` pairs for every leaf setting.
    pub fn entries(&self) -> Vec<(String, String)> {
        let mut out = Vec::new();
        if let Ok(json) = serde_json::to_value(self) {
            flatten("", &json, &mut out);
        }
        out
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let check = |ok: bool, key: &str, message: &str| {
            if ok {
                Ok(())
            } else {
                Err(ConfigError::InvalidValue {
                    key: key.to_string(),
                    message: message.to_string(),
                })
            }
        };
        check(self.timer.work_minutes > 0, "timer.work_minutes", "must be positive")?;
        check(
            self.timer.short_break_minutes > 0,
            "timer.short_break_minutes",
            "must be positive",
        )?;
        check(
            self.timer.long_break_minutes > 0,
            "timer.long_break_minutes",
            "must be positive",
        )?;
        check(
            self.timer.pomodoros_until_long_break > 0,
            "timer.pomodoros_until_long_break",
            "must be at least 1",
        )?;
        check(
            self.sync.backoff_base_secs > 0,
            "sync.backoff_base_secs",
            "must be positive",
        )?;
        check(
            self.sync.backoff_cap_secs >= self.sync.backoff_base_secs,
            "sync.backoff_cap_secs",
            "must not be below sync.backoff_base_secs",
        )?;
        check(
            self.sync.request_timeout_secs > 0,
            "sync.request_timeout_secs",
            "must be positive",
        )?;
        check(
            self.sync.max_attempts != Some(0),
            "sync.max_attempts",
            "must be at least 1 when set",
        )?;
        check(
            self.recovery.checkpoint_every_ticks > 0,
            "recovery.checkpoint_every_ticks",
            "must be positive",
        )?;
        if let Some(base_url) = &self.sync.base_url {
            url::Url::parse(base_url).map_err(|e| ConfigError::InvalidValue {
                key: "sync.base_url".into(),
                message: e.to_string(),
            })?;
        }
        Ok(())
    }

    pub fn policy(&self) -> TimerPolicy {
        TimerPolicy {
            work_secs: self.timer.work_minutes * 60,
            short_break_secs: self.timer.short_break_minutes * 60,
            long_break_secs: self.timer.long_break_minutes * 60,
            pomodoros_until_long_break: self.timer.pomodoros_until_long_break,
            auto_start_breaks: self.timer.auto_start_breaks,
            auto_start_work: self.timer.auto_start_work,
        }
    }
}

fn flatten(prefix: &str, value: &serde_json::Value, out: &mut Vec<(String, String)>) {
    match value {
        serde_json::Value::Object(map) => {
            for (key, child) in map {
                let path = if prefix.is_empty() {
                    key.clone()
                } else {
                    format!("{prefix}.{key}")
                };
                flatten(&path, child, out);
            }
        }
        serde_json::Value::String(s) => out.push((prefix.to_string(), s.clone())),
        other => out.push((prefix.to_string(), other.to_string())),
    }
}
