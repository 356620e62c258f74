//! The async driver on a paused tokio clock.

use std::cell::{Cell, RefCell};
use std::rc::Rc;
use std::time::Duration;

use futures::future::LocalBoxFuture;
use futures_channel::mpsc;
use futures_util::StreamExt;
use tokio::task::LocalSet;

use runner::core::config::ExperimentConfig;
use runner::core::participant::{FeedbackPreferences, ParticipantInfo, StaticDirectory};
use runner::core::storage::{
    ExperimentRepository, KeyValueStore, MemoryStore, Persistence, StorageResult, SyncStatus,
};
use runner::core::sync::{RemoteStore, SyncError, SyncService};
use runner::feedback::generator::BlockData;
use runner::feedback::resolver::{FeedbackResolver, PatternCache};
use runner::i18n::Language;
use runner::tasks::stroop::engine::Screen;
use runner::tasks::stroop::record::{Condition, Experiment, SessionNumber, SessionSetup};
use runner::tasks::stroop::session::{spawn_session, SaveStatus, SessionServices, SessionUpdate};
use runner::tasks::stroop::stimulus::Answer;

/// Memory store that counts how many times an experiment is written as pending.
#[derive(Default)]
struct CountingStore {
    inner: MemoryStore,
    pending_writes: Cell<usize>,
}

impl KeyValueStore for CountingStore {
    fn get(&self, key: &str) -> StorageResult<Option<String>> {
        self.inner.get(key)
    }
    fn set(&self, key: &str, value: &str) -> StorageResult<()> {
        if key.starts_with("experiments.") && value.contains("\"syncStatus\":\"pending\"") {
            self.pending_writes.set(self.pending_writes.get() + 1);
        }
        self.inner.set(key, value)
    }
    fn remove(&self, key: &str) -> StorageResult<()> {
        self.inner.remove(key)
    }
    fn keys(&self, prefix: &str) -> StorageResult<Vec<String>> {
        self.inner.keys(prefix)
    }
}

#[derive(Default)]
struct RecordingRemote {
    uploads: RefCell<Vec<String>>,
}

impl RemoteStore for RecordingRemote {
    fn upload<'a>(&'a self, experiment: &'a Experiment) -> LocalBoxFuture<'a, Result<(), SyncError>> {
        self.uploads.borrow_mut().push(experiment.id.clone());
        Box::pin(async { Ok(()) })
    }
}

fn key_for(answer: Answer) -> &'static str {
    match answer {
        Answer::Red => "d",
        Answer::Green => "f",
        Answer::Blue => "j",
        Answer::Other => "k",
    }
}

fn services(store: Rc<CountingStore>, remote: Rc<RecordingRemote>) -> SessionServices {
    let repository = ExperimentRepository::new(store.clone());
    let directory = StaticDirectory::new([ParticipantInfo {
        id: "p-01".into(),
        nickname: "Hana".into(),
        preferences: FeedbackPreferences::default(),
        language: Language::Ja,
    }]);
    SessionServices {
        directory: Rc::new(directory),
        resolver: Rc::new(FeedbackResolver::new(
            PatternCache::new(store, time::Duration::hours(24)),
            None,
            BlockData::default(),
        )),
        persistence: Persistence::new(repository.clone(), Rc::new(MemoryStore::new())),
        sync: Some(SyncService::new(repository, remote)),
        notifier: None,
    }
}

fn setup(participant_id: &str) -> SessionSetup {
    SessionSetup {
        participant_id: participant_id.into(),
        condition: Condition::Personalized,
        session_number: SessionNumber::Second,
        language: Language::Ja,
    }
}

#[tokio::test(start_paused = true)]
async fn personalized_session_runs_to_a_single_synced_record() {
    let local = LocalSet::new();
    local
        .run_until(async {
            let store = Rc::new(CountingStore::default());
            let remote = Rc::new(RecordingRemote::default());
            let config = ExperimentConfig {
                total_blocks: 2,
                trials_per_block: 5,
                feedback_countdown_secs: 2,
                ..ExperimentConfig::default()
            };

            let (updates_tx, mut updates) = mpsc::unbounded();
            let handle = spawn_session(
                config,
                setup("p-01"),
                services(store.clone(), remote.clone()),
                updates_tx,
            );
            handle.start();

            let mut feedback_messages = Vec::new();
            let finished = loop {
                match updates.next().await.expect("session ended without finishing") {
                    SessionUpdate::Screen(Screen::Stimulus { stimulus, .. }) => {
                        tokio::time::sleep(Duration::from_millis(350)).await;
                        handle.key(key_for(stimulus.correct_answer));
                    }
                    SessionUpdate::Screen(Screen::Feedback { message, .. }) => {
                        feedback_messages.push(message);
                    }
                    SessionUpdate::Finished {
                        experiment,
                        status,
                        message,
                    } => break (experiment, status, message),
                    SessionUpdate::Screen(_) => {}
                }
            };

            let (experiment, status, message) = finished;
            assert_eq!(status, SaveStatus::Saved);
            assert!(!message.is_empty());
            assert!(experiment.is_complete());
            assert_eq!(experiment.blocks.len(), 2);
            for block in &experiment.blocks {
                assert_eq!(block.accuracy, 100.0);
                assert!((300.0..=400.0).contains(&block.average_rt_ms));
                assert!(!block.feedback_shown.contains("[NICKNAME]"));
            }
            assert!(feedback_messages.iter().all(|m| !m.is_empty()));

            // Let the background sync run.
            tokio::time::sleep(Duration::from_millis(10)).await;
            assert_eq!(store.pending_writes.get(), 1);
            assert_eq!(remote.uploads.borrow().as_slice(), [experiment.id.clone()]);
            let repository = ExperimentRepository::new(store.clone());
            assert_eq!(
                repository.get(&experiment.id).unwrap().unwrap().sync_status,
                SyncStatus::Synced
            );

            handle.key("d");
        })
        .await;
}

#[tokio::test(start_paused = true)]
async fn unknown_participant_gets_a_recoverable_error() {
    let local = LocalSet::new();
    local
        .run_until(async {
            let store = Rc::new(CountingStore::default());
            let (updates_tx, mut updates) = mpsc::unbounded();
            let handle = spawn_session(
                ExperimentConfig::default(),
                setup("p-unknown"),
                services(store.clone(), Rc::new(RecordingRemote::default())),
                updates_tx,
            );
            handle.start();

            let error = loop {
                if let SessionUpdate::Screen(Screen::Preparation { error: Some(error) }) =
                    updates.next().await.expect("session ended early")
                {
                    break error;
                }
            };
            assert!(!error.is_empty());

            handle.leave();
            loop {
                match updates.next().await {
                    Some(SessionUpdate::Screen(Screen::Abandoned)) => break,
                    Some(_) => continue,
                    None => panic!("abandon screen never shown"),
                }
            }
            assert_eq!(store.pending_writes.get(), 0);
        })
        .await;
}
