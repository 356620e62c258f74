//! Best-effort upload of locally stored experiments to the study backend.

use std::rc::Rc;

use futures::future::LocalBoxFuture;
use thiserror::Error;

use crate::core::storage::{ExperimentRepository, StorageError, SyncStatus};
use crate::tasks::stroop::record::Experiment;

#[derive(Debug, Error)]
pub enum SyncError {
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error("remote request failed: {0}")]
    Transport(String),
    #[error("remote store rejected upload ({status}): {body}")]
    Rejected { status: u16, body: String },
}

/// Destination for finished experiments.
pub trait RemoteStore {
    fn upload<'a>(&'a self, experiment: &'a Experiment) -> LocalBoxFuture<'a, Result<(), SyncError>>;
}

/// REST table endpoint in the Supabase style: the anon key goes in both the
/// `apikey` header and the bearer token, and re-uploads merge on the id.
#[derive(Debug, Clone)]
pub struct HttpRemoteStore {
    client: reqwest::Client,
    endpoint: String,
    api_key: String,
}

impl HttpRemoteStore {
    pub fn new(endpoint: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            endpoint: endpoint.into(),
            api_key: api_key.into(),
        }
    }

    /// `STROOP_SYNC_URL` and `STROOP_SYNC_API_KEY`; `None` unless both are set.
    pub fn from_env() -> Option<Self> {
        let endpoint = std::env::var("STROOP_SYNC_URL").ok()?;
        let api_key = std::env::var("STROOP_SYNC_API_KEY").ok()?;
        Some(Self::new(endpoint, api_key))
    }

    async fn post(&self, experiment: &Experiment) -> Result<(), SyncError> {
        let response = self
            .client
            .post(&self.endpoint)
            .header("apikey", &self.api_key)
            .bearer_auth(&self.api_key)
            .header("Prefer", "resolution=merge-duplicates")
            .json(experiment)
            .send()
            .await
            .map_err(|err| SyncError::Transport(err.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(SyncError::Rejected {
                status: status.as_u16(),
                body,
            });
        }
        Ok(())
    }
}

impl RemoteStore for HttpRemoteStore {
    fn upload<'a>(&'a self, experiment: &'a Experiment) -> LocalBoxFuture<'a, Result<(), SyncError>> {
        Box::pin(self.post(experiment))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncOutcome {
    Synced,
    AlreadySynced,
    /// Upload failed; the record stays queued with the reason attached.
    Failed(String),
    NotFound,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncReport {
    pub synced: usize,
    pub failed: usize,
}

#[derive(Clone)]
pub struct SyncService {
    repository: ExperimentRepository,
    remote: Rc<dyn RemoteStore>,
}

impl SyncService {
    pub fn new(repository: ExperimentRepository, remote: Rc<dyn RemoteStore>) -> Self {
        Self { repository, remote }
    }

    pub async fn sync(&self, id: &str) -> Result<SyncOutcome, SyncError> {
        let Some(stored) = self.repository.get(id)? else {
            return Ok(SyncOutcome::NotFound);
        };
        if stored.sync_status == SyncStatus::Synced {
            return Ok(SyncOutcome::AlreadySynced);
        }

        match self.remote.upload(&stored.record).await {
            Ok(()) => {
                self.repository.mark_synced(id)?;
                tracing::info!(experiment = %id, "experiment synced");
                Ok(SyncOutcome::Synced)
            }
            Err(err) => {
                let reason = err.to_string();
                tracing::warn!(experiment = %id, "sync failed: {reason}");
                self.repository.mark_failed(id, reason.clone())?;
                Ok(SyncOutcome::Failed(reason))
            }
        }
    }

    /// Retry every record that is pending or previously failed.
    pub async fn sync_pending(&self) -> Result<SyncReport, SyncError> {
        let mut report = SyncReport::default();
        for stored in self.repository.pending()? {
            let id = &stored.record.id;
            match self.sync(id).await {
                Ok(SyncOutcome::Synced) => report.synced += 1,
                Ok(SyncOutcome::Failed(_)) => report.failed += 1,
                Ok(SyncOutcome::AlreadySynced | SyncOutcome::NotFound) => {}
                Err(err) => {
                    tracing::warn!(experiment = %id, "sync bookkeeping failed: {err}");
                    report.failed += 1;
                }
            }
        }
        Ok(report)
    }
}
