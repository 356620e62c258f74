//! Pattern resolution: cache, then remote generation, then built-in fallback.

use std::rc::Rc;

use serde::{Deserialize, Serialize};
use time::{Duration, OffsetDateTime};

use crate::core::participant::ParticipantInfo;
use crate::core::storage::{KeyValueStore, StorageResult};
use crate::core::timing;

use super::generator::{BlockData, FeedbackGenerator, GenerationRequest};
use super::pattern::FeedbackPattern;

const CACHE_PREFIX: &str = "feedback-patterns.";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PatternSource {
    Cache,
    Generated,
    Fallback,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedFeedback {
    pub pattern: FeedbackPattern,
    pub source: PatternSource,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CachedPatterns {
    pattern: FeedbackPattern,
    cached_at: String,
}

/// Resolved patterns keyed by participant id, expiring after `ttl`.
#[derive(Clone)]
pub struct PatternCache {
    store: Rc<dyn KeyValueStore>,
    ttl: Duration,
}

impl PatternCache {
    pub fn new(store: Rc<dyn KeyValueStore>, ttl: Duration) -> Self {
        Self { store, ttl }
    }

    fn key(participant_id: &str) -> String {
        format!("{CACHE_PREFIX}{participant_id}")
    }

    /// Fresh, complete entry for `participant_id`. Stale, unreadable or
    /// incomplete entries are evicted.
    pub fn get(&self, participant_id: &str, now: OffsetDateTime) -> StorageResult<Option<FeedbackPattern>> {
        let key = Self::key(participant_id);
        let Some(raw) = self.store.get(&key)? else {
            return Ok(None);
        };

        match self.check(&raw, now) {
            Ok(pattern) => Ok(Some(pattern)),
            Err(reason) => {
                tracing::debug!(participant = participant_id, "evicting pattern cache entry: {reason}");
                self.store.remove(&key)?;
                Ok(None)
            }
        }
    }

    fn check(&self, raw: &str, now: OffsetDateTime) -> Result<FeedbackPattern, String> {
        let entry: CachedPatterns = serde_json::from_str(raw).map_err(|err| err.to_string())?;
        let cached_at = timing::parse_timestamp(&entry.cached_at)
            .ok_or_else(|| format!("bad timestamp {:?}", entry.cached_at))?;
        if now - cached_at > self.ttl {
            return Err("expired".into());
        }
        entry.pattern.validate().map_err(|err| err.to_string())?;
        Ok(entry.pattern)
    }

    pub fn put(
        &self,
        participant_id: &str,
        pattern: &FeedbackPattern,
        now: OffsetDateTime,
    ) -> StorageResult<()> {
        let entry = CachedPatterns {
            pattern: pattern.clone(),
            cached_at: timing::format_timestamp(now),
        };
        self.store
            .set(&Self::key(participant_id), &serde_json::to_string(&entry)?)
    }
}

pub struct FeedbackResolver {
    cache: PatternCache,
    generator: Option<Rc<dyn FeedbackGenerator>>,
    block_data: BlockData,
}

impl FeedbackResolver {
    pub fn new(
        cache: PatternCache,
        generator: Option<Rc<dyn FeedbackGenerator>>,
        block_data: BlockData,
    ) -> Self {
        Self {
            cache,
            generator,
            block_data,
        }
    }

    pub async fn resolve(&self, participant: &ParticipantInfo) -> ResolvedFeedback {
        self.resolve_at(participant, OffsetDateTime::now_utc()).await
    }

    /// Never fails: every error path ends in the localized fallback. Only
    /// generated patterns are cached, so a later session retries generation.
    pub async fn resolve_at(
        &self,
        participant: &ParticipantInfo,
        now: OffsetDateTime,
    ) -> ResolvedFeedback {
        match self.cache.get(&participant.id, now) {
            Ok(Some(pattern)) => {
                tracing::debug!(participant = %participant.id, "feedback patterns from cache");
                return ResolvedFeedback {
                    pattern,
                    source: PatternSource::Cache,
                };
            }
            Ok(None) => {}
            Err(err) => tracing::warn!(participant = %participant.id, "pattern cache read failed: {err}"),
        }

        if let Some(pattern) = self.generate(participant).await {
            let pattern = pattern.with_nickname(&participant.nickname);
            if let Err(err) = self.cache.put(&participant.id, &pattern, now) {
                tracing::warn!(participant = %participant.id, "pattern cache write failed: {err}");
            }
            return ResolvedFeedback {
                pattern,
                source: PatternSource::Generated,
            };
        }

        tracing::info!(participant = %participant.id, "using built-in feedback patterns");
        ResolvedFeedback {
            pattern: FeedbackPattern::static_fallback(participant.language)
                .with_nickname(&participant.nickname),
            source: PatternSource::Fallback,
        }
    }

    async fn generate(&self, participant: &ParticipantInfo) -> Option<FeedbackPattern> {
        let generator = self.generator.as_ref()?;
        let request = GenerationRequest::new(participant, self.block_data.clone());
        let raw = match generator.generate(&request).await {
            Ok(raw) => raw,
            Err(err) => {
                tracing::warn!(participant = %participant.id, "feedback generation failed: {err}");
                return None;
            }
        };
        match FeedbackPattern::from_generation_response(&raw) {
            Ok(pattern) => Some(pattern),
            Err(err) => {
                tracing::warn!(participant = %participant.id, "generated feedback rejected: {err}");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::cell::{Cell, RefCell};

    use futures::future::LocalBoxFuture;
    use serde_json::json;

    use super::*;
    use crate::core::participant::FeedbackPreferences;
    use crate::core::storage::MemoryStore;
    use crate::feedback::generator::GenerationError;
    use crate::feedback::pattern::NICKNAME_TOKEN;
    use crate::feedback::scenario::ScenarioKey;
    use crate::i18n::Language;

    struct ScriptedGenerator {
        replies: RefCell<Vec<Result<String, GenerationError>>>,
        calls: Cell<usize>,
    }

    impl ScriptedGenerator {
        fn new(replies: Vec<Result<String, GenerationError>>) -> Rc<Self> {
            Rc::new(Self {
                replies: RefCell::new(replies),
                calls: Cell::new(0),
            })
        }
    }

    impl FeedbackGenerator for ScriptedGenerator {
        fn generate<'a>(
            &'a self,
            _request: &'a GenerationRequest,
        ) -> LocalBoxFuture<'a, Result<String, GenerationError>> {
            self.calls.set(self.calls.get() + 1);
            let reply = self.replies.borrow_mut().remove(0);
            Box::pin(async move { reply })
        }
    }

    fn valid_reply() -> String {
        let patterns: serde_json::Map<String, serde_json::Value> = ScenarioKey::ALL
            .into_iter()
            .map(|key| {
                (
                    key.as_str().to_string(),
                    json!([
                        format!("Nice, {NICKNAME_TOKEN}"),
                        "Keep it up",
                        "Well done"
                    ]),
                )
            })
            .collect();
        json!({ "success": true, "feedbackPatterns": patterns }).to_string()
    }

    fn participant(id: &str, nickname: &str) -> ParticipantInfo {
        ParticipantInfo {
            id: id.into(),
            nickname: nickname.into(),
            preferences: FeedbackPreferences::default(),
            language: Language::En,
        }
    }

    fn resolver(generator: Rc<ScriptedGenerator>) -> FeedbackResolver {
        FeedbackResolver::new(
            PatternCache::new(Rc::new(MemoryStore::new()), Duration::hours(24)),
            Some(generator as Rc<dyn FeedbackGenerator>),
            BlockData::default(),
        )
    }

    fn start() -> OffsetDateTime {
        time::macros::datetime!(2026-03-01 09:00 UTC)
    }

    #[tokio::test]
    async fn generated_patterns_are_substituted_and_cached() {
        let generator = ScriptedGenerator::new(vec![Ok(valid_reply())]);
        let resolver = resolver(generator.clone());
        let mika = participant("p-01", "Mika");

        let first = resolver.resolve_at(&mika, start()).await;
        assert_eq!(first.source, PatternSource::Generated);
        assert_eq!(first.pattern.messages(ScenarioKey::Synergy)[0], "Nice, Mika");
        assert!(!first.pattern.contains_token());

        let second = resolver.resolve_at(&mika, start() + Duration::hours(23)).await;
        assert_eq!(second.source, PatternSource::Cache);
        assert_eq!(second.pattern, first.pattern);
        assert_eq!(generator.calls.get(), 1);
    }

    #[tokio::test]
    async fn stale_cache_entries_trigger_regeneration() {
        let generator = ScriptedGenerator::new(vec![Ok(valid_reply()), Ok(valid_reply())]);
        let resolver = resolver(generator.clone());
        let mika = participant("p-01", "Mika");

        resolver.resolve_at(&mika, start()).await;
        let later = resolver
            .resolve_at(&mika, start() + Duration::hours(25))
            .await;
        assert_eq!(later.source, PatternSource::Generated);
        assert_eq!(generator.calls.get(), 2);
    }

    #[tokio::test]
    async fn cache_is_keyed_by_id_not_nickname() {
        let generator = ScriptedGenerator::new(vec![Ok(valid_reply()), Ok(valid_reply())]);
        let resolver = resolver(generator.clone());

        resolver.resolve_at(&participant("p-01", "Sora"), start()).await;
        let other = resolver.resolve_at(&participant("p-02", "Sora"), start()).await;
        assert_eq!(other.source, PatternSource::Generated);
        assert_eq!(generator.calls.get(), 2);
    }

    #[tokio::test]
    async fn malformed_or_failed_generation_falls_back_without_caching() {
        let generator = ScriptedGenerator::new(vec![
            Ok("{\"success\": true, \"feedbackPatterns\": {}}".into()),
            Err(GenerationError::Transport("offline".into())),
        ]);
        let resolver = resolver(generator.clone());
        let mika = participant("p-01", "Mika");

        let first = resolver.resolve_at(&mika, start()).await;
        assert_eq!(first.source, PatternSource::Fallback);
        assert!(!first.pattern.contains_token());
        assert_eq!(first.pattern.messages(ScenarioKey::SameSame).len(), 3);

        let second = resolver.resolve_at(&mika, start()).await;
        assert_eq!(second.source, PatternSource::Fallback);
        assert_eq!(generator.calls.get(), 2);
    }

    #[tokio::test]
    async fn missing_generator_uses_fallback() {
        let resolver = FeedbackResolver::new(
            PatternCache::new(Rc::new(MemoryStore::new()), Duration::hours(24)),
            None,
            BlockData::default(),
        );
        let resolved = resolver.resolve(&participant("p-01", "Mika")).await;
        assert_eq!(resolved.source, PatternSource::Fallback);
    }

    #[test]
    fn unreadable_cache_entries_are_evicted() {
        let store = Rc::new(MemoryStore::new());
        store.set("feedback-patterns.p-01", "garbage").unwrap();
        let cache = PatternCache::new(store.clone(), Duration::hours(24));
        assert_eq!(cache.get("p-01", start()).unwrap(), None);
        assert_eq!(store.get("feedback-patterns.p-01").unwrap(), None);
    }

    #[tokio::test]
    async fn incomplete_cache_entries_are_evicted_and_regenerated() {
        let store = Rc::new(MemoryStore::new());
        let truncated = json!({
            "pattern": { "same_same": ["one", "two"] },
            "cachedAt": timing::format_timestamp(start()),
        });
        store
            .set("feedback-patterns.p-01", &truncated.to_string())
            .unwrap();

        let cache = PatternCache::new(store.clone(), Duration::hours(24));
        assert_eq!(cache.get("p-01", start()).unwrap(), None);
        assert_eq!(store.get("feedback-patterns.p-01").unwrap(), None);

        store
            .set("feedback-patterns.p-01", &truncated.to_string())
            .unwrap();
        let generator = ScriptedGenerator::new(vec![Ok(valid_reply())]);
        let resolver = FeedbackResolver::new(
            cache,
            Some(generator.clone() as Rc<dyn FeedbackGenerator>),
            BlockData::default(),
        );
        let resolved = resolver.resolve_at(&participant("p-01", "Mika"), start()).await;
        assert_eq!(resolved.source, PatternSource::Generated);
        assert_eq!(generator.calls.get(), 1);
        assert_eq!(resolved.pattern.messages(ScenarioKey::SameSame).len(), 3);
    }
}
