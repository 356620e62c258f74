//! Fire-and-forget completion notices to the study coordinator.

use futures::future::LocalBoxFuture;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::tasks::stroop::record::{Condition, Experiment};

#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("notification request failed: {0}")]
    Transport(String),
    #[error("notification endpoint answered {0}")]
    Status(u16),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompletionNotice {
    pub experiment_id: String,
    pub condition: Condition,
    pub completed_at: String,
}

impl CompletionNotice {
    /// `None` for a record that never reached its planned block count.
    pub fn for_experiment(experiment: &Experiment) -> Option<Self> {
        Some(Self {
            experiment_id: experiment.id.clone(),
            condition: experiment.condition_type,
            completed_at: experiment.completed_at.clone()?,
        })
    }
}

pub trait CompletionNotifier {
    fn notify<'a>(&'a self, notice: &'a CompletionNotice) -> LocalBoxFuture<'a, Result<(), NotifyError>>;
}

#[derive(Debug, Clone)]
pub struct HttpCompletionNotifier {
    client: reqwest::Client,
    endpoint: String,
}

impl HttpCompletionNotifier {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            endpoint: endpoint.into(),
        }
    }

    /// `STROOP_NOTIFY_URL`.
    pub fn from_env() -> Option<Self> {
        std::env::var("STROOP_NOTIFY_URL").ok().map(Self::new)
    }

    async fn post(&self, notice: &CompletionNotice) -> Result<(), NotifyError> {
        let response = self
            .client
            .post(&self.endpoint)
            .json(notice)
            .send()
            .await
            .map_err(|err| NotifyError::Transport(err.to_string()))?;
        if !response.status().is_success() {
            return Err(NotifyError::Status(response.status().as_u16()));
        }
        Ok(())
    }
}

impl CompletionNotifier for HttpCompletionNotifier {
    fn notify<'a>(&'a self, notice: &'a CompletionNotice) -> LocalBoxFuture<'a, Result<(), NotifyError>> {
        Box::pin(self.post(notice))
    }
}
