//! Run configuration consumed read-only by the experiment engine.
//!
//! Values come from an optional JSON document (camelCase keys, every field
//! optional) overlaid with `STROOP_*` environment variables:
//!
//! | variable | field |
//! |---|---|
//! | `STROOP_TOTAL_BLOCKS` | `total_blocks` |
//! | `STROOP_TRIALS_PER_BLOCK` | `trials_per_block` |
//! | `STROOP_TIME_LIMIT_MS` | `time_limit_ms` (`none` or `0` = unlimited) |
//! | `STROOP_FEEDBACK_COUNTDOWN_SECS` | `feedback_countdown_secs` |
//! | `STROOP_FEEDBACK_BUTTON_DELAY_MS` | `feedback_button_delay_ms` |
//! | `STROOP_PRACTICE_TRIALS` | `practice_trials` |

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::tasks::stroop::stimulus::Answer;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid configuration JSON: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("environment variable {var} has unusable value {value:?}")]
    Env { var: &'static str, value: String },
    #[error("invalid configuration: {0}")]
    Invalid(&'static str),
}

/// Keys accepted as answers. Comparison is case-insensitive.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KeyMap {
    pub red: String,
    pub green: String,
    pub blue: String,
    pub other: String,
}

impl Default for KeyMap {
    fn default() -> Self {
        Self {
            red: "d".into(),
            green: "f".into(),
            blue: "j".into(),
            other: "k".into(),
        }
    }
}

impl KeyMap {
    pub fn answer_for(&self, key: &str) -> Option<Answer> {
        let key = key.to_lowercase();
        [
            (&self.red, Answer::Red),
            (&self.green, Answer::Green),
            (&self.blue, Answer::Blue),
            (&self.other, Answer::Other),
        ]
        .into_iter()
        .find(|(bound, _)| bound.to_lowercase() == key)
        .map(|(_, answer)| answer)
    }

    fn keys(&self) -> [&str; 4] {
        [&self.red, &self.green, &self.blue, &self.other]
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ExperimentConfig {
    pub total_blocks: u32,
    pub trials_per_block: usize,
    /// `None` means a trial waits for a response indefinitely.
    pub time_limit_ms: Option<u64>,
    pub feedback_countdown_secs: u32,
    pub feedback_button_delay_ms: u64,
    pub practice_trials: usize,
    pub inter_trial_delay_ms: u64,
    pub countdown_ticks: u32,
    pub pattern_cache_ttl_hours: u32,
    pub key_map: KeyMap,
    pub continue_key: String,
}

impl Default for ExperimentConfig {
    fn default() -> Self {
        Self {
            total_blocks: 4,
            trials_per_block: 60,
            time_limit_ms: Some(3000),
            feedback_countdown_secs: 15,
            feedback_button_delay_ms: 3000,
            practice_trials: 0,
            inter_trial_delay_ms: 500,
            countdown_ticks: 3,
            pattern_cache_ttl_hours: 24,
            key_map: KeyMap::default(),
            continue_key: " ".into(),
        }
    }
}

impl ExperimentConfig {
    pub fn from_json_str(raw: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Overlay `STROOP_*` variables from the process environment.
    pub fn with_env_overrides(self) -> Result<Self, ConfigError> {
        self.with_overrides_from(|var| std::env::var(var).ok())
    }

    pub fn with_overrides_from<F>(mut self, lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(value) = read_var(&lookup, "STROOP_TOTAL_BLOCKS")? {
            self.total_blocks = value;
        }
        if let Some(value) = read_var(&lookup, "STROOP_TRIALS_PER_BLOCK")? {
            self.trials_per_block = value;
        }
        if let Some(raw) = lookup("STROOP_TIME_LIMIT_MS") {
            let trimmed = raw.trim();
            self.time_limit_ms = if trimmed.eq_ignore_ascii_case("none") || trimmed == "0" {
                None
            } else {
                Some(trimmed.parse().map_err(|_| ConfigError::Env {
                    var: "STROOP_TIME_LIMIT_MS",
                    value: raw.clone(),
                })?)
            };
        }
        if let Some(value) = read_var(&lookup, "STROOP_FEEDBACK_COUNTDOWN_SECS")? {
            self.feedback_countdown_secs = value;
        }
        if let Some(value) = read_var(&lookup, "STROOP_FEEDBACK_BUTTON_DELAY_MS")? {
            self.feedback_button_delay_ms = value;
        }
        if let Some(value) = read_var(&lookup, "STROOP_PRACTICE_TRIALS")? {
            self.practice_trials = value;
        }
        self.validate()?;
        Ok(self)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.total_blocks == 0 {
            return Err(ConfigError::Invalid("totalBlocks must be at least 1"));
        }
        if self.trials_per_block == 0 {
            return Err(ConfigError::Invalid("trialsPerBlock must be at least 1"));
        }
        if self.time_limit_ms == Some(0) {
            return Err(ConfigError::Invalid("timeLimitMs must be positive or null"));
        }
        if self.countdown_ticks == 0 {
            return Err(ConfigError::Invalid("countdownTicks must be at least 1"));
        }
        let keys = self.key_map.keys();
        if keys.iter().any(|key| key.trim().is_empty()) || self.continue_key.is_empty() {
            return Err(ConfigError::Invalid("response and continue keys must be set"));
        }
        for (index, key) in keys.iter().enumerate() {
            if keys[index + 1..]
                .iter()
                .any(|other| other.eq_ignore_ascii_case(key))
            {
                return Err(ConfigError::Invalid("response keys must be distinct"));
            }
        }
        Ok(())
    }

    pub fn planned_total_trials(&self) -> usize {
        self.total_blocks as usize * self.trials_per_block
    }
}

fn read_var<F, T>(lookup: &F, var: &'static str) -> Result<Option<T>, ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: std::str::FromStr,
{
    match lookup(var) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::Env { var, value: raw }),
    }
}
