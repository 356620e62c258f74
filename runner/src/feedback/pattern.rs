//! Feedback message patterns: validation, nickname substitution and selection.

use std::collections::BTreeMap;

use rand::seq::SliceRandom;
use rand::Rng;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::i18n::{self, fl, Language};

use super::scenario::{classify, BlockPerformance, ScenarioKey};

/// Literal placeholder replaced with the participant's nickname.
pub const NICKNAME_TOKEN: &str = "[NICKNAME]";

pub const MESSAGES_PER_SCENARIO: usize = 3;

#[derive(Debug, Error, PartialEq)]
pub enum PatternError {
    #[error("generated feedback is not valid JSON: {0}")]
    Json(String),
    #[error("generator reported failure: {0}")]
    Unsuccessful(String),
    #[error("generated feedback has no feedbackPatterns object")]
    MissingPatterns,
    #[error("generated feedback has unknown scenario key {0:?}")]
    UnknownKey(String),
    #[error("generated feedback is missing scenario {0}")]
    MissingKey(ScenarioKey),
    #[error("scenario {key} has {count} messages, expected {MESSAGES_PER_SCENARIO}")]
    WrongCount { key: ScenarioKey, count: usize },
    #[error("scenario {0} contains an empty message")]
    EmptyMessage(ScenarioKey),
}

/// Candidate messages per scenario key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FeedbackPattern {
    messages: BTreeMap<ScenarioKey, Vec<String>>,
}

/// Shape of the generation endpoint's reply, before validation.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GenerationResponse {
    success: bool,
    #[serde(default)]
    feedback_patterns: Option<BTreeMap<String, Vec<String>>>,
    #[serde(default)]
    error: Option<String>,
}

impl FeedbackPattern {
    /// Build without validation; missing keys read as empty lists.
    pub fn from_messages(messages: BTreeMap<ScenarioKey, Vec<String>>) -> Self {
        Self { messages }
    }

    /// Parse and validate a raw generator reply: `success` must be true and
    /// every one of the 11 keys must carry exactly 3 non-empty messages.
    pub fn from_generation_response(raw: &str) -> Result<Self, PatternError> {
        let response: GenerationResponse =
            serde_json::from_str(raw).map_err(|err| PatternError::Json(err.to_string()))?;
        if !response.success {
            return Err(PatternError::Unsuccessful(
                response.error.unwrap_or_else(|| "no reason given".into()),
            ));
        }
        let raw_patterns = response.feedback_patterns.ok_or(PatternError::MissingPatterns)?;

        let mut messages = BTreeMap::new();
        for (raw_key, list) in raw_patterns {
            let key = ScenarioKey::parse(&raw_key).ok_or(PatternError::UnknownKey(raw_key))?;
            messages.insert(key, list);
        }

        let pattern = Self { messages };
        pattern.validate()?;
        Ok(pattern)
    }

    /// Every scenario key present with exactly 3 non-empty messages.
    pub fn validate(&self) -> Result<(), PatternError> {
        for key in ScenarioKey::ALL {
            let list = self
                .messages
                .get(&key)
                .ok_or(PatternError::MissingKey(key))?;
            if list.len() != MESSAGES_PER_SCENARIO {
                return Err(PatternError::WrongCount {
                    key,
                    count: list.len(),
                });
            }
            if list.iter().any(|message| message.trim().is_empty()) {
                return Err(PatternError::EmptyMessage(key));
            }
        }
        Ok(())
    }

    /// Built-in patterns for `language`, still carrying the nickname token.
    pub fn static_fallback(language: Language) -> Self {
        let messages = ScenarioKey::ALL
            .into_iter()
            .map(|key| {
                let list = (1..=MESSAGES_PER_SCENARIO)
                    .map(|n| i18n::message(language, &fallback_message_id(key, n)))
                    .collect();
                (key, list)
            })
            .collect();
        Self { messages }
    }

    pub fn messages(&self, key: ScenarioKey) -> &[String] {
        self.messages.get(&key).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Replace every nickname token in every message.
    pub fn with_nickname(mut self, nickname: &str) -> Self {
        for list in self.messages.values_mut() {
            for message in list.iter_mut() {
                *message = substitute_nickname(message, nickname);
            }
        }
        self
    }

    pub fn contains_token(&self) -> bool {
        self.messages
            .values()
            .flatten()
            .any(|message| message.contains(NICKNAME_TOKEN))
    }
}

pub fn fallback_message_id(key: ScenarioKey, n: usize) -> String {
    format!("pattern-{}-{n}", key.as_str().replace('_', "-"))
}

/// Insert `nickname` verbatim wherever the token appears.
///
/// Token text inside the nickname itself is dropped so the result never
/// contains the token, which keeps repeated application a no-op.
pub fn substitute_nickname(text: &str, nickname: &str) -> String {
    let mut safe = nickname.to_string();
    while safe.contains(NICKNAME_TOKEN) {
        safe = safe.replace(NICKNAME_TOKEN, "");
    }
    text.replace(NICKNAME_TOKEN, &safe)
}

/// Pick a message for the current block, comparing against the previous one.
pub fn select_message<R: Rng + ?Sized>(
    current: &BlockPerformance,
    previous: Option<&BlockPerformance>,
    pattern: &FeedbackPattern,
    language: Language,
    rng: &mut R,
) -> String {
    let key = classify(current, previous);
    let mut candidates = pattern.messages(key);
    if candidates.is_empty() {
        candidates = pattern.messages(ScenarioKey::NEUTRAL);
    }
    match candidates.choose(rng) {
        Some(message) => message.clone(),
        None => fl!(i18n::loader(language), "generic-encouragement"),
    }
}
