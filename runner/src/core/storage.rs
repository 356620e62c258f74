//! Local persistence: key/value backends, the experiment repository and the
//! fallback cache used when the durable store rejects a write.

use std::collections::BTreeMap;
use std::rc::Rc;
use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::core::timing;
use crate::tasks::stroop::record::Experiment;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("storage backend unavailable: {0}")]
    Unavailable(String),
    #[error("storage I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("stored value is not valid JSON: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("no stored experiment with id {0}")]
    NotFound(String),
}

pub type StorageResult<T> = Result<T, StorageError>;

/// String key/value backend. Keys are namespaced by dotted prefixes.
pub trait KeyValueStore {
    fn get(&self, key: &str) -> StorageResult<Option<String>>;
    fn set(&self, key: &str, value: &str) -> StorageResult<()>;
    fn remove(&self, key: &str) -> StorageResult<()>;
    /// Every stored key starting with `prefix`, sorted.
    fn keys(&self, prefix: &str) -> StorageResult<Vec<String>>;
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: Mutex<BTreeMap<String, String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_entries<T>(
        &self,
        f: impl FnOnce(&mut BTreeMap<String, String>) -> T,
    ) -> StorageResult<T> {
        let mut guard = self
            .entries
            .lock()
            .map_err(|_| StorageError::Unavailable("memory store lock poisoned".into()))?;
        Ok(f(&mut guard))
    }
}

impl KeyValueStore for MemoryStore {
    fn get(&self, key: &str) -> StorageResult<Option<String>> {
        self.with_entries(|entries| entries.get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> StorageResult<()> {
        self.with_entries(|entries| {
            entries.insert(key.to_string(), value.to_string());
        })
    }

    fn remove(&self, key: &str) -> StorageResult<()> {
        self.with_entries(|entries| {
            entries.remove(key);
        })
    }

    fn keys(&self, prefix: &str) -> StorageResult<Vec<String>> {
        self.with_entries(|entries| {
            entries
                .keys()
                .filter(|key| key.starts_with(prefix))
                .cloned()
                .collect()
        })
    }
}

#[cfg(not(target_arch = "wasm32"))]
pub use file::FileStore;

#[cfg(not(target_arch = "wasm32"))]
mod file {
    use std::fs;
    use std::io::ErrorKind;
    use std::path::{Path, PathBuf};

    use base64::engine::general_purpose::URL_SAFE_NO_PAD;
    use base64::Engine as _;

    use super::{KeyValueStore, StorageError, StorageResult};

    const EXTENSION: &str = "json";

    /// One file per key under a directory; filenames are the URL-safe base64
    /// of the key so any key string is a valid path component.
    #[derive(Debug, Clone)]
    pub struct FileStore {
        root: PathBuf,
    }

    impl FileStore {
        /// Store under the platform data directory for the runner.
        pub fn open_default() -> StorageResult<Self> {
            let dirs = directories::ProjectDirs::from("org", "StroopFeedbackLab", "StroopRunner")
                .ok_or_else(|| {
                    StorageError::Unavailable("unable to determine data directory".into())
                })?;
            Ok(Self::at(dirs.data_dir().join("store")))
        }

        pub fn at(root: impl Into<PathBuf>) -> Self {
            Self { root: root.into() }
        }

        pub fn root(&self) -> &Path {
            &self.root
        }

        fn path_for(&self, key: &str) -> PathBuf {
            self.root
                .join(format!("{}.{EXTENSION}", URL_SAFE_NO_PAD.encode(key)))
        }
    }

    impl KeyValueStore for FileStore {
        fn get(&self, key: &str) -> StorageResult<Option<String>> {
            match fs::read_to_string(self.path_for(key)) {
                Ok(raw) => Ok(Some(raw)),
                Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
                Err(err) => Err(err.into()),
            }
        }

        fn set(&self, key: &str, value: &str) -> StorageResult<()> {
            fs::create_dir_all(&self.root)?;
            let path = self.path_for(key);
            let tmp = path.with_extension("tmp");
            fs::write(&tmp, value)?;
            fs::rename(&tmp, &path)?;
            Ok(())
        }

        fn remove(&self, key: &str) -> StorageResult<()> {
            match fs::remove_file(self.path_for(key)) {
                Err(err) if err.kind() != ErrorKind::NotFound => Err(err.into()),
                _ => Ok(()),
            }
        }

        fn keys(&self, prefix: &str) -> StorageResult<Vec<String>> {
            let entries = match fs::read_dir(&self.root) {
                Ok(entries) => entries,
                Err(err) if err.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
                Err(err) => return Err(err.into()),
            };

            let mut keys = Vec::new();
            for entry in entries {
                let path = entry?.path();
                if path.extension().and_then(|ext| ext.to_str()) != Some(EXTENSION) {
                    continue;
                }
                let Some(stem) = path.file_stem().and_then(|stem| stem.to_str()) else {
                    continue;
                };
                let Ok(bytes) = URL_SAFE_NO_PAD.decode(stem) else {
                    continue;
                };
                if let Ok(key) = String::from_utf8(bytes) {
                    if key.starts_with(prefix) {
                        keys.push(key);
                    }
                }
            }
            keys.sort();
            Ok(keys)
        }
    }
}

#[cfg(target_arch = "wasm32")]
pub use web::{WebStorage, WebStorageKind};

#[cfg(target_arch = "wasm32")]
mod web {
    use super::{KeyValueStore, StorageError, StorageResult};

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub enum WebStorageKind {
        Local,
        Session,
    }

    /// `localStorage` / `sessionStorage` of the current window.
    #[derive(Debug, Clone, Copy)]
    pub struct WebStorage {
        kind: WebStorageKind,
    }

    impl WebStorage {
        pub fn local() -> Self {
            Self {
                kind: WebStorageKind::Local,
            }
        }

        pub fn session() -> Self {
            Self {
                kind: WebStorageKind::Session,
            }
        }

        fn storage(&self) -> StorageResult<web_sys::Storage> {
            let window = web_sys::window()
                .ok_or_else(|| StorageError::Unavailable("window unavailable".into()))?;
            let storage = match self.kind {
                WebStorageKind::Local => window.local_storage(),
                WebStorageKind::Session => window.session_storage(),
            };
            storage
                .ok()
                .flatten()
                .ok_or_else(|| StorageError::Unavailable("web storage disabled".into()))
        }
    }

    fn js_error(action: &str) -> StorageError {
        StorageError::Unavailable(format!("web storage {action} failed"))
    }

    impl KeyValueStore for WebStorage {
        fn get(&self, key: &str) -> StorageResult<Option<String>> {
            self.storage()?.get_item(key).map_err(|_| js_error("read"))
        }

        fn set(&self, key: &str, value: &str) -> StorageResult<()> {
            // Quota exhaustion surfaces here.
            self.storage()?
                .set_item(key, value)
                .map_err(|_| js_error("write"))
        }

        fn remove(&self, key: &str) -> StorageResult<()> {
            self.storage()?
                .remove_item(key)
                .map_err(|_| js_error("remove"))
        }

        fn keys(&self, prefix: &str) -> StorageResult<Vec<String>> {
            let storage = self.storage()?;
            let len = storage.length().map_err(|_| js_error("length"))?;
            let mut keys = Vec::new();
            for index in 0..len {
                if let Some(key) = storage.key(index).map_err(|_| js_error("key"))? {
                    if key.starts_with(prefix) {
                        keys.push(key);
                    }
                }
            }
            keys.sort();
            Ok(keys)
        }
    }
}

const EXPERIMENT_PREFIX: &str = "experiments.";
const FALLBACK_PREFIX: &str = "experiments-fallback.";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncStatus {
    Pending,
    Synced,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredExperiment {
    pub record: Experiment,
    pub sync_status: SyncStatus,
    pub updated_at: String,
    #[serde(default)]
    pub last_error: Option<String>,
}

/// Experiments in a durable store, each tagged with its sync status.
#[derive(Clone)]
pub struct ExperimentRepository {
    store: Rc<dyn KeyValueStore>,
}

impl ExperimentRepository {
    pub fn new(store: Rc<dyn KeyValueStore>) -> Self {
        Self { store }
    }

    fn key(id: &str) -> String {
        format!("{EXPERIMENT_PREFIX}{id}")
    }

    /// Write (or overwrite) the record as pending sync.
    pub fn save(&self, experiment: &Experiment) -> StorageResult<()> {
        self.put(&StoredExperiment {
            record: experiment.clone(),
            sync_status: SyncStatus::Pending,
            updated_at: timing::timestamp_now(),
            last_error: None,
        })
    }

    fn put(&self, stored: &StoredExperiment) -> StorageResult<()> {
        let raw = serde_json::to_string(stored)?;
        self.store.set(&Self::key(&stored.record.id), &raw)
    }

    pub fn get(&self, id: &str) -> StorageResult<Option<StoredExperiment>> {
        match self.store.get(&Self::key(id))? {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    pub fn all(&self) -> StorageResult<Vec<StoredExperiment>> {
        let mut stored = Vec::new();
        for key in self.store.keys(EXPERIMENT_PREFIX)? {
            let Some(raw) = self.store.get(&key)? else {
                continue;
            };
            match serde_json::from_str::<StoredExperiment>(&raw) {
                Ok(entry) => stored.push(entry),
                Err(err) => tracing::warn!(key = %key, "skipping unreadable experiment: {err}"),
            }
        }
        stored.sort_by(|a, b| a.record.started_at.cmp(&b.record.started_at));
        Ok(stored)
    }

    /// Records not yet confirmed by the remote store.
    pub fn pending(&self) -> StorageResult<Vec<StoredExperiment>> {
        Ok(self
            .all()?
            .into_iter()
            .filter(|entry| entry.sync_status != SyncStatus::Synced)
            .collect())
    }

    pub fn mark_synced(&self, id: &str) -> StorageResult<()> {
        self.update_status(id, SyncStatus::Synced, None)
    }

    pub fn mark_failed(&self, id: &str, reason: impl Into<String>) -> StorageResult<()> {
        self.update_status(id, SyncStatus::Failed, Some(reason.into()))
    }

    fn update_status(
        &self,
        id: &str,
        status: SyncStatus,
        last_error: Option<String>,
    ) -> StorageResult<()> {
        let mut stored = self
            .get(id)?
            .ok_or_else(|| StorageError::NotFound(id.to_string()))?;
        stored.sync_status = status;
        stored.updated_at = timing::timestamp_now();
        stored.last_error = last_error;
        self.put(&stored)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PersistOutcome {
    Saved,
    /// The durable store failed; the record waits in the fallback store.
    CachedForRetry,
}

/// Durable save with a session-scoped fallback.
#[derive(Clone)]
pub struct Persistence {
    repository: ExperimentRepository,
    fallback: Rc<dyn KeyValueStore>,
}

impl Persistence {
    pub fn new(repository: ExperimentRepository, fallback: Rc<dyn KeyValueStore>) -> Self {
        Self {
            repository,
            fallback,
        }
    }

    pub fn repository(&self) -> &ExperimentRepository {
        &self.repository
    }

    pub fn persist(&self, experiment: &Experiment) -> StorageResult<PersistOutcome> {
        match self.repository.save(experiment) {
            Ok(()) => {
                tracing::info!(experiment = %experiment.id, "experiment saved");
                Ok(PersistOutcome::Saved)
            }
            Err(err) => {
                tracing::warn!(
                    experiment = %experiment.id,
                    "local save failed ({err}); caching for retry"
                );
                let raw = serde_json::to_string(experiment)?;
                self.fallback
                    .set(&format!("{FALLBACK_PREFIX}{}", experiment.id), &raw)?;
                Ok(PersistOutcome::CachedForRetry)
            }
        }
    }

    /// Move cached records into the repository. Returns how many moved.
    pub fn flush_fallback(&self) -> StorageResult<usize> {
        let mut moved = 0;
        for key in self.fallback.keys(FALLBACK_PREFIX)? {
            match self.flush_one(&key) {
                Ok(true) => moved += 1,
                Ok(false) => {}
                Err(err) => tracing::warn!(key = %key, "cached experiment left in place: {err}"),
            }
        }
        if moved > 0 {
            tracing::info!(moved, "flushed cached experiments");
        }
        Ok(moved)
    }

    fn flush_one(&self, key: &str) -> StorageResult<bool> {
        let Some(raw) = self.fallback.get(key)? else {
            return Ok(false);
        };
        let experiment: Experiment = serde_json::from_str(&raw)?;
        self.repository.save(&experiment)?;
        self.fallback.remove(key)?;
        Ok(true)
    }

    pub fn cached_count(&self) -> StorageResult<usize> {
        Ok(self.fallback.keys(FALLBACK_PREFIX)?.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::i18n::Language;
    use crate::tasks::stroop::record::{Condition, SessionNumber};

    struct RejectingStore;

    impl KeyValueStore for RejectingStore {
        fn get(&self, _key: &str) -> StorageResult<Option<String>> {
            Ok(None)
        }
        fn set(&self, _key: &str, _value: &str) -> StorageResult<()> {
            Err(StorageError::Unavailable("quota exceeded".into()))
        }
        fn remove(&self, _key: &str) -> StorageResult<()> {
            Ok(())
        }
        fn keys(&self, _prefix: &str) -> StorageResult<Vec<String>> {
            Ok(Vec::new())
        }
    }

    fn experiment(id: &str, started_at: &str) -> Experiment {
        Experiment {
            id: id.into(),
            participant_id: "p-01".into(),
            condition_type: Condition::Static,
            session_number: SessionNumber::First,
            language: Language::Ja,
            started_at: started_at.into(),
            completed_at: Some("2026-01-01T00:10:00Z".into()),
            blocks: Vec::new(),
            overall_accuracy: 0.0,
            overall_average_rt_ms: 0.0,
            overall_average_rt_correct_only_ms: 0.0,
            planned_total_blocks: 0,
            planned_total_trials: 0,
            planned_trials_per_block: 0,
            total_trials_attempted: 0,
            practice_trials: Vec::new(),
        }
    }

    #[test]
    fn memory_store_lists_by_prefix() {
        let store = MemoryStore::new();
        store.set("a.1", "x").unwrap();
        store.set("a.2", "y").unwrap();
        store.set("b.1", "z").unwrap();
        assert_eq!(store.keys("a.").unwrap(), vec!["a.1", "a.2"]);
        store.remove("a.1").unwrap();
        assert_eq!(store.get("a.1").unwrap(), None);
        assert_eq!(store.get("b.1").unwrap().as_deref(), Some("z"));
    }

    #[test]
    fn file_store_round_trips_arbitrary_keys() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::at(dir.path().join("store"));
        assert!(store.keys("").unwrap().is_empty());

        store.set("experiments.a/b?c", "{}").unwrap();
        store.set("feedback-patterns.参加者", "[]").unwrap();
        assert_eq!(store.get("experiments.a/b?c").unwrap().as_deref(), Some("{}"));
        assert_eq!(store.keys("experiments.").unwrap(), vec!["experiments.a/b?c"]);

        store.remove("experiments.a/b?c").unwrap();
        store.remove("never-written").unwrap();
        assert_eq!(store.get("experiments.a/b?c").unwrap(), None);
        assert_eq!(store.keys("").unwrap().len(), 1);
    }

    #[test]
    fn repository_tracks_sync_status() {
        let repository = ExperimentRepository::new(Rc::new(MemoryStore::new()));
        repository.save(&experiment("late", "2026-01-02T00:00:00Z")).unwrap();
        repository.save(&experiment("early", "2026-01-01T00:00:00Z")).unwrap();

        let pending: Vec<_> = repository
            .pending()
            .unwrap()
            .into_iter()
            .map(|entry| entry.record.id)
            .collect();
        assert_eq!(pending, vec!["early", "late"]);

        repository.mark_synced("early").unwrap();
        repository.mark_failed("late", "offline").unwrap();
        assert_eq!(
            repository.get("early").unwrap().unwrap().sync_status,
            SyncStatus::Synced
        );
        let late = repository.get("late").unwrap().unwrap();
        assert_eq!(late.sync_status, SyncStatus::Failed);
        assert_eq!(late.last_error.as_deref(), Some("offline"));
        assert_eq!(repository.pending().unwrap().len(), 1);

        assert!(matches!(
            repository.mark_synced("missing"),
            Err(StorageError::NotFound(_))
        ));
    }

    #[test]
    fn saving_twice_overwrites() {
        let repository = ExperimentRepository::new(Rc::new(MemoryStore::new()));
        let record = experiment("e1", "2026-01-01T00:00:00Z");
        repository.save(&record).unwrap();
        repository.mark_synced("e1").unwrap();
        repository.save(&record).unwrap();
        assert_eq!(repository.all().unwrap().len(), 1);
        assert_eq!(
            repository.get("e1").unwrap().unwrap().sync_status,
            SyncStatus::Pending
        );
    }

    #[test]
    fn failed_local_save_lands_in_fallback_and_flushes_later() {
        let fallback: Rc<dyn KeyValueStore> = Rc::new(MemoryStore::new());
        let broken = Persistence::new(
            ExperimentRepository::new(Rc::new(RejectingStore)),
            fallback.clone(),
        );
        let record = experiment("e1", "2026-01-01T00:00:00Z");
        assert_eq!(broken.persist(&record).unwrap(), PersistOutcome::CachedForRetry);
        assert_eq!(broken.cached_count().unwrap(), 1);

        let healthy = Persistence::new(
            ExperimentRepository::new(Rc::new(MemoryStore::new())),
            fallback,
        );
        assert_eq!(healthy.flush_fallback().unwrap(), 1);
        assert_eq!(healthy.cached_count().unwrap(), 0);
        assert_eq!(
            healthy.repository().get("e1").unwrap().unwrap().record,
            record
        );
    }

    #[test]
    fn unreadable_cached_record_does_not_block_the_rest() {
        let fallback: Rc<dyn KeyValueStore> = Rc::new(MemoryStore::new());
        fallback.set("experiments-fallback.a-bad", "{not json").unwrap();
        let good = experiment("z-good", "2026-01-01T00:00:00Z");
        fallback
            .set(
                "experiments-fallback.z-good",
                &serde_json::to_string(&good).unwrap(),
            )
            .unwrap();

        let persistence = Persistence::new(
            ExperimentRepository::new(Rc::new(MemoryStore::new())),
            fallback.clone(),
        );
        assert_eq!(persistence.flush_fallback().unwrap(), 1);
        assert_eq!(
            persistence.repository().get("z-good").unwrap().unwrap().record,
            good
        );
        assert_eq!(
            fallback.keys("experiments-fallback.").unwrap(),
            vec!["experiments-fallback.a-bad"]
        );
    }

    #[test]
    fn both_stores_failing_is_an_error() {
        let persistence = Persistence::new(
            ExperimentRepository::new(Rc::new(RejectingStore)),
            Rc::new(RejectingStore),
        );
        assert!(persistence
            .persist(&experiment("e1", "2026-01-01T00:00:00Z"))
            .is_err());
    }
}
