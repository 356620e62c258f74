//! Participant profiles as supplied by the enrollment side of the study.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::i18n::Language;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FeedbackPreferences {
    /// Preferred voice of the messages, e.g. "gentle" or "energetic".
    pub tone: String,
    pub motivation: String,
    pub evaluation: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParticipantInfo {
    pub id: String,
    pub nickname: String,
    #[serde(default)]
    pub preferences: FeedbackPreferences,
    #[serde(default)]
    pub language: Language,
}

/// Read-only lookup of participant profiles.
pub trait ParticipantDirectory {
    fn load(&self, participant_id: &str) -> Option<ParticipantInfo>;
}

/// In-memory directory, loaded up front.
#[derive(Debug, Clone, Default)]
pub struct StaticDirectory {
    participants: HashMap<String, ParticipantInfo>,
}

impl StaticDirectory {
    pub fn new(participants: impl IntoIterator<Item = ParticipantInfo>) -> Self {
        Self {
            participants: participants
                .into_iter()
                .map(|info| (info.id.clone(), info))
                .collect(),
        }
    }

    /// Parse a JSON array of profiles.
    pub fn from_json_str(raw: &str) -> Result<Self, serde_json::Error> {
        let participants: Vec<ParticipantInfo> = serde_json::from_str(raw)?;
        Ok(Self::new(participants))
    }
}

impl ParticipantDirectory for StaticDirectory {
    fn load(&self, participant_id: &str) -> Option<ParticipantInfo> {
        self.participants.get(participant_id).cloned()
    }
}
