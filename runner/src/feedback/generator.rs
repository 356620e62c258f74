//! Remote generation of personalized feedback patterns.

use futures::future::LocalBoxFuture;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::core::participant::ParticipantInfo;
use crate::i18n::Language;

use super::pattern::{MESSAGES_PER_SCENARIO, NICKNAME_TOKEN};
use super::scenario::ScenarioKey;

#[derive(Debug, Error)]
pub enum GenerationError {
    #[error("generation request failed: {0}")]
    Transport(String),
    #[error("generation endpoint answered {status}: {body}")]
    Status { status: u16, body: String },
}

/// Session shape the messages are written for.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BlockData {
    pub total_blocks: u32,
    pub trials_per_block: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerationRequest {
    pub participant_info: ParticipantInfo,
    pub block_data: BlockData,
    pub prompt: String,
}

impl GenerationRequest {
    pub fn new(participant: &ParticipantInfo, block_data: BlockData) -> Self {
        Self {
            prompt: build_prompt(participant),
            participant_info: participant.clone(),
            block_data,
        }
    }
}

/// Produces the raw JSON reply; validation happens in the caller.
pub trait FeedbackGenerator {
    fn generate<'a>(
        &'a self,
        request: &'a GenerationRequest,
    ) -> LocalBoxFuture<'a, Result<String, GenerationError>>;
}

pub fn build_prompt(participant: &ParticipantInfo) -> String {
    let language = match participant.language {
        Language::Ja => "Japanese",
        Language::En => "English",
    };
    let prefs = &participant.preferences;
    let keys = ScenarioKey::ALL
        .iter()
        .map(|key| key.as_str())
        .collect::<Vec<_>>()
        .join(", ");

    format!(
        "Write short encouragement messages in {language} for a participant doing a Stroop \
         color-naming task between blocks.\n\
         Preferred tone: {tone}. Motivation: {motivation}. Evaluation style: {evaluation}.\n\
         Reply with JSON {{\"success\": true, \"feedbackPatterns\": {{...}}}} containing exactly \
         these keys: {keys}. Each key maps to exactly {MESSAGES_PER_SCENARIO} messages.\n\
         In about half of the messages use the literal placeholder {NICKNAME_TOKEN} where the \
         participant's nickname belongs; never write the nickname itself.",
        tone = or_unspecified(&prefs.tone),
        motivation = or_unspecified(&prefs.motivation),
        evaluation = or_unspecified(&prefs.evaluation),
    )
}

fn or_unspecified(value: &str) -> &str {
    if value.trim().is_empty() {
        "unspecified"
    } else {
        value
    }
}

/// Posts the request as JSON to a serverless generation endpoint.
#[derive(Debug, Clone)]
pub struct HttpFeedbackGenerator {
    client: reqwest::Client,
    endpoint: String,
    api_key: Option<String>,
}

impl HttpFeedbackGenerator {
    pub fn new(endpoint: impl Into<String>, api_key: Option<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            endpoint: endpoint.into(),
            api_key,
        }
    }

    /// `STROOP_FEEDBACK_URL` (required) and `STROOP_FEEDBACK_API_KEY`.
    pub fn from_env() -> Option<Self> {
        let endpoint = std::env::var("STROOP_FEEDBACK_URL").ok()?;
        Some(Self::new(endpoint, std::env::var("STROOP_FEEDBACK_API_KEY").ok()))
    }

    async fn post(&self, request: &GenerationRequest) -> Result<String, GenerationError> {
        let mut builder = self.client.post(&self.endpoint).json(request);
        if let Some(key) = &self.api_key {
            builder = builder.bearer_auth(key);
        }
        let response = builder
            .send()
            .await
            .map_err(|err| GenerationError::Transport(err.to_string()))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|err| GenerationError::Transport(err.to_string()))?;
        if !status.is_success() {
            return Err(GenerationError::Status {
                status: status.as_u16(),
                body,
            });
        }
        Ok(body)
    }
}

impl FeedbackGenerator for HttpFeedbackGenerator {
    fn generate<'a>(
        &'a self,
        request: &'a GenerationRequest,
    ) -> LocalBoxFuture<'a, Result<String, GenerationError>> {
        Box::pin(self.post(request))
    }
}
