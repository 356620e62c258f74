//! Async driver around [`StroopEngine`].
//!
//! One event loop per session receives participant input and timer firings on
//! an unbounded channel, feeds them to the engine and carries out the returned
//! effects. Timers are abortable sleeps spawned on the local executor.

use std::collections::HashMap;
use std::rc::Rc;

use futures::future::{abortable, AbortHandle};
use futures_channel::mpsc::{self, UnboundedReceiver, UnboundedSender};
use futures_util::StreamExt;
use thiserror::Error;

use crate::core::config::ExperimentConfig;
use crate::core::notify::{CompletionNotice, CompletionNotifier};
use crate::core::participant::ParticipantDirectory;
use crate::core::storage::{PersistOutcome, Persistence};
use crate::core::sync::SyncService;
use crate::core::{platform, timing};
use crate::feedback::resolver::FeedbackResolver;
use crate::i18n::{self, fl};

use super::engine::{Effect, EngineEvent, Screen, StroopEngine, TimerToken};
use super::record::{Experiment, SessionSetup};

#[derive(Debug, Error)]
pub enum SetupError {
    #[error("no participant profile for {0}")]
    ParticipantNotFound(String),
}

/// Collaborators a session needs beyond the engine itself.
#[derive(Clone)]
pub struct SessionServices {
    pub directory: Rc<dyn ParticipantDirectory>,
    pub resolver: Rc<FeedbackResolver>,
    pub persistence: Persistence,
    pub sync: Option<SyncService>,
    pub notifier: Option<Rc<dyn CompletionNotifier>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SaveStatus {
    Saved,
    CachedForRetry,
    /// Neither the durable nor the fallback store accepted the record.
    Unsaved(String),
}

#[derive(Debug, Clone, PartialEq)]
pub enum SessionUpdate {
    Screen(Screen),
    Finished {
        experiment: Box<Experiment>,
        status: SaveStatus,
        /// Localized status line for the completion screen.
        message: String,
    },
}

/// Input side of a running session.
#[derive(Debug, Clone)]
pub struct SessionHandle {
    tx: UnboundedSender<EngineEvent>,
}

impl SessionHandle {
    fn send(&self, event: EngineEvent) {
        if self.tx.unbounded_send(event).is_err() {
            tracing::debug!("session already finished; input dropped");
        }
    }

    pub fn start(&self) {
        self.send(EngineEvent::Start);
    }

    /// Key press, timestamped on receipt.
    pub fn key(&self, key: &str) {
        self.send(EngineEvent::Key {
            key: key.to_string(),
            at: timing::now(),
        });
    }

    pub fn continue_feedback(&self) {
        self.send(EngineEvent::Continue);
    }

    pub fn leave(&self) {
        self.send(EngineEvent::Leave);
    }
}

/// Spawn the session loop on the local executor and return its input handle.
pub fn spawn_session(
    config: ExperimentConfig,
    setup: SessionSetup,
    services: SessionServices,
    updates: UnboundedSender<SessionUpdate>,
) -> SessionHandle {
    let (tx, rx) = mpsc::unbounded();
    tracing::info!(
        platform = platform::Platform::current().as_str(),
        participant = %setup.participant_id,
        condition = setup.condition.as_str(),
        "starting session"
    );
    let engine = StroopEngine::new(config, setup);
    platform::spawn_future(run_session(engine, services, rx, tx.clone(), updates));
    SessionHandle { tx }
}

/// Drive `engine` until it reaches a terminal state or every input is gone.
pub async fn run_session(
    mut engine: StroopEngine,
    services: SessionServices,
    mut rx: UnboundedReceiver<EngineEvent>,
    tx: UnboundedSender<EngineEvent>,
    updates: UnboundedSender<SessionUpdate>,
) {
    let mut timers: HashMap<TimerToken, AbortHandle> = HashMap::new();
    let _ = updates.unbounded_send(SessionUpdate::Screen(engine.screen()));

    while let Some(event) = rx.next().await {
        if let EngineEvent::TimerFired(token) = &event {
            timers.remove(token);
        }

        for effect in engine.handle(event, timing::now()) {
            match effect {
                Effect::Present(screen) => {
                    let _ = updates.unbounded_send(SessionUpdate::Screen(screen));
                }
                Effect::Schedule { token, delay_ms } => {
                    let (delay, handle) = abortable(timing::sleep_ms(delay_ms));
                    let tx = tx.clone();
                    platform::spawn_future(async move {
                        if delay.await.is_ok() {
                            let _ = tx.unbounded_send(EngineEvent::TimerFired(token));
                        }
                    });
                    timers.insert(token, handle);
                }
                Effect::Cancel(token) => {
                    if let Some(handle) = timers.remove(&token) {
                        handle.abort();
                    }
                }
                Effect::ResolveFeedback { participant_id } => {
                    let services = services.clone();
                    let tx = tx.clone();
                    let language = engine.setup().language;
                    platform::spawn_future(async move {
                        let result = match services.directory.load(&participant_id) {
                            Some(participant) => {
                                Ok(services.resolver.resolve(&participant).await.pattern)
                            }
                            None => {
                                let err = SetupError::ParticipantNotFound(participant_id);
                                tracing::warn!("{err}");
                                Err(fl!(i18n::loader(language), "error-participant-missing"))
                            }
                        };
                        let _ = tx.unbounded_send(EngineEvent::FeedbackResolved(result));
                    });
                }
                Effect::Completed(experiment) => {
                    let update = finish(&services, *experiment);
                    let _ = updates.unbounded_send(update);
                }
            }
        }

        if engine.state().is_terminal() {
            break;
        }
    }

    for (_, handle) in timers.drain() {
        handle.abort();
    }
    tracing::debug!(state = engine.state().name(), "session loop finished");
}

/// Persist the record, then kick off sync and notification in the background.
fn finish(services: &SessionServices, experiment: Experiment) -> SessionUpdate {
    let language = experiment.language;
    let status = match services.persistence.persist(&experiment) {
        Ok(PersistOutcome::Saved) => SaveStatus::Saved,
        Ok(PersistOutcome::CachedForRetry) => SaveStatus::CachedForRetry,
        Err(err) => {
            tracing::warn!(experiment = %experiment.id, "experiment could not be stored: {err}");
            SaveStatus::Unsaved(err.to_string())
        }
    };

    if status == SaveStatus::Saved {
        if let Some(sync) = services.sync.clone() {
            let id = experiment.id.clone();
            platform::spawn_future(async move {
                if let Err(err) = sync.sync(&id).await {
                    tracing::warn!(experiment = %id, "sync bookkeeping failed: {err}");
                }
            });
        }
    }

    if let (Some(notifier), Some(notice)) = (
        services.notifier.clone(),
        CompletionNotice::for_experiment(&experiment),
    ) {
        platform::spawn_future(async move {
            if let Err(err) = notifier.notify(&notice).await {
                tracing::warn!(experiment = %notice.experiment_id, "completion notice failed: {err}");
            }
        });
    }

    let loader = i18n::loader(language);
    let message = match status {
        SaveStatus::Saved => fl!(loader, "status-saved"),
        SaveStatus::CachedForRetry => fl!(loader, "status-cached"),
        SaveStatus::Unsaved(_) => fl!(loader, "status-unsaved"),
    };
    SessionUpdate::Finished {
        experiment: Box::new(experiment),
        status,
        message,
    }
}
