use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::db::{GenerationLog, GenerationRecord};
use crate::error::AppError;
use crate::generation::client::ContentGenerator;
use crate::generation::content::{build_prompt, parse_generated, GeneratedContent, GenerationSettings};
use crate::usage::{Caller, Remaining, Reservation, UsageLimitEngine};

const MAX_DESCRIPTION_CHARS: usize = 5_000;

#[derive(Debug, Clone, Serialize)]
pub struct GenerationOutcome {
    #[serde(flatten)]
    pub content: GeneratedContent,
    pub remaining: Remaining,
}

/// Sequences one generation: quota reservation, upstream call, validation,
/// audit record. Never retries.
///
/// Quota is reserved before the upstream call and given back when the call
/// fails or its output is unusable, so only delivered content is charged.
#[derive(Clone)]
pub struct GenerationOrchestrator {
    usage: UsageLimitEngine,
    generator: Arc<dyn ContentGenerator>,
    log: Arc<dyn GenerationLog>,
    timeout: Duration,
}

impl GenerationOrchestrator {
    pub fn new(
        usage: UsageLimitEngine,
        generator: Arc<dyn ContentGenerator>,
        log: Arc<dyn GenerationLog>,
        timeout: Duration,
    ) -> Self {
        Self { usage, generator, log, timeout }
    }

    pub fn usage(&self) -> &UsageLimitEngine {
        &self.usage
    }

    pub async fn generate(
        &self,
        caller: &Caller,
        description: &str,
        settings: Option<GenerationSettings>,
    ) -> Result<GenerationOutcome, AppError> {
        self.generate_at(caller, description, settings, Utc::now()).await
    }

    pub async fn generate_at(
        &self,
        caller: &Caller,
        description: &str,
        settings: Option<GenerationSettings>,
        now: DateTime<Utc>,
    ) -> Result<GenerationOutcome, AppError> {
        let description = description.trim();
        if description.is_empty() {
            return Err(AppError::ValidationError("Description is required".into()));
        }
        if description.chars().count() > MAX_DESCRIPTION_CHARS {
            return Err(AppError::ValidationError(format!(
                "Description must be at most {} characters",
                MAX_DESCRIPTION_CHARS
            )));
        }

        let reservation = self.usage.reserve(caller, now).await?;

        let settings = settings.unwrap_or_default();
        let prompt = build_prompt(description, &settings);

        let generated = match tokio::time::timeout(self.timeout, self.generator.complete(&prompt)).await {
            Ok(result) => result.and_then(|raw| {
                parse_generated(&raw).map_err(|e| {
                    error!(error = %e, raw = %raw, "Failed to parse AI response");
                    e
                })
            }),
            Err(_) => {
                warn!(timeout_secs = self.timeout.as_secs(), "Generation call timed out");
                Err(AppError::UpstreamFailure("generation call timed out".into()))
            }
        };
        let content = match generated {
            Ok(content) => content,
            Err(e) => {
                self.release(&reservation, now).await;
                return Err(e);
            }
        };

        let record = GenerationRecord {
            id: Uuid::new_v4(),
            user_id: reservation.caller.user_id(),
            description: description.to_string(),
            settings: serde_json::to_value(&settings)
                .map_err(|e| AppError::InternalError(e.to_string()))?,
            created_at: now,
        };
        if let Err(e) = self.log.append(&record).await {
            // The caller has been charged; hand back the content regardless.
            error!(error = %e, record_id = %record.id, "Failed to append generation record");
        }

        let current = self.usage.current_caller(&reservation.caller).await?;
        let remaining = self.usage.remaining(&current, now).await?;
        info!(tier = %current.tier(), "Content generated");
        Ok(GenerationOutcome { content, remaining })
    }

    async fn release(&self, reservation: &Reservation, now: DateTime<Utc>) {
        if let Err(e) = self.usage.release(reservation, now).await {
            error!(error = %e, tier = %reservation.caller.tier(), "Failed to release usage reservation");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::Contact;
    use crate::db::{IdentityStore, MemoryStore, NewIdentity, Tier, UsageStore};
    use crate::generation::client::MockContentGenerator;
    use crate::usage::UsagePolicy;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    const VALID: &str = r##"{"titles": ["a","b","c","d","e"], "description": "d", "hashtags": ["#x"]}"##;

    fn orchestrator(store: &MemoryStore, generator: MockContentGenerator) -> GenerationOrchestrator {
        orchestrator_with(store, Arc::new(generator))
    }

    fn orchestrator_with(store: &MemoryStore, generator: Arc<dyn ContentGenerator>) -> GenerationOrchestrator {
        let usage = UsageLimitEngine::new(
            Arc::new(store.clone()),
            Arc::new(store.clone()),
            UsagePolicy::default(),
        );
        GenerationOrchestrator::new(usage, generator, Arc::new(store.clone()), Duration::from_secs(5))
    }

    async fn free_account(store: &MemoryStore) -> Caller {
        let identity = store
            .create_identity(NewIdentity {
                contact: Contact::email(&format!("{}@x.com", Uuid::new_v4())).unwrap(),
                display_name: "Ann".into(),
                password_hash: "hash".into(),
                verified: true,
            })
            .await
            .unwrap();
        Caller::account(&identity)
    }

    /// Holds every call open long enough for concurrent requests to overlap.
    #[derive(Default)]
    struct SlowGenerator {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl ContentGenerator for SlowGenerator {
        async fn complete(&self, _prompt: &str) -> Result<String, AppError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(20)).await;
            Ok(VALID.to_string())
        }
    }

    /// Upgrades the account to pro while the call is in flight.
    struct UpgradingGenerator {
        store: MemoryStore,
        id: Uuid,
    }

    #[async_trait]
    impl ContentGenerator for UpgradingGenerator {
        async fn complete(&self, _prompt: &str) -> Result<String, AppError> {
            self.store.set_tier(self.id, Tier::Pro).await?;
            Ok(VALID.to_string())
        }
    }

    #[tokio::test]
    async fn test_success_records_usage_and_audit() {
        let store = MemoryStore::new();
        let mut generator = MockContentGenerator::new();
        generator.expect_complete().times(1).returning(|_| Ok(VALID.to_string()));
        let orchestrator = orchestrator(&store, generator);
        let caller = Caller::anonymous("device-1").unwrap();

        let outcome = orchestrator.generate(&caller, "my cat dancing", None).await.unwrap();
        assert_eq!(outcome.content.titles.len(), 5);
        assert_eq!(outcome.remaining, Remaining::Limited(0));

        let records = store.generation_records().await;
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].user_id, None);
        assert_eq!(records[0].description, "my cat dancing");
        assert_eq!(records[0].settings["language"], "english");
    }

    #[tokio::test]
    async fn test_quota_exceeded_never_calls_upstream() {
        let store = MemoryStore::new();
        let mut generator = MockContentGenerator::new();
        generator.expect_complete().times(1).returning(|_| Ok(VALID.to_string()));
        let orchestrator = orchestrator(&store, generator);
        let caller = Caller::anonymous("device-1").unwrap();

        orchestrator.generate(&caller, "first", None).await.unwrap();
        let second = orchestrator.generate(&caller, "second", None).await;

        assert!(matches!(second, Err(AppError::QuotaExceeded)));
        assert_eq!(store.generation_records().await.len(), 1);
    }

    #[tokio::test]
    async fn test_exhausted_caller_makes_zero_upstream_calls() {
        let store = MemoryStore::new();
        let mut generator = MockContentGenerator::new();
        generator.expect_complete().times(0);
        let orchestrator = orchestrator(&store, generator);
        let caller = Caller::anonymous("device-1").unwrap();
        orchestrator.usage().record_usage(&caller, Utc::now()).await.unwrap();

        let result = orchestrator.generate(&caller, "anything", None).await;
        assert!(matches!(result, Err(AppError::QuotaExceeded)));
        assert!(store.generation_records().await.is_empty());
    }

    #[tokio::test]
    async fn test_missing_hashtags_does_not_consume_quota() {
        let store = MemoryStore::new();
        let mut generator = MockContentGenerator::new();
        generator
            .expect_complete()
            .times(1)
            .returning(|_| Ok(r#"{"titles": ["a","b","c","d","e"], "description": "d"}"#.to_string()));
        let orchestrator = orchestrator(&store, generator);
        let caller = Caller::anonymous("device-1").unwrap();

        let result = orchestrator.generate(&caller, "my cat", None).await;
        assert!(matches!(result, Err(AppError::InvalidUpstreamResponse(_))));
        assert!(orchestrator.usage().is_allowed(&caller, Utc::now()).await.unwrap());
        assert!(store.generation_records().await.is_empty());
    }

    #[tokio::test]
    async fn test_upstream_failure_does_not_consume_quota() {
        let store = MemoryStore::new();
        let mut generator = MockContentGenerator::new();
        generator
            .expect_complete()
            .times(1)
            .returning(|_| Err(AppError::UpstreamFailure("503".into())));
        let orchestrator = orchestrator(&store, generator);
        let caller = Caller::anonymous("device-1").unwrap();

        let result = orchestrator.generate(&caller, "my cat", None).await;
        assert!(matches!(result, Err(AppError::UpstreamFailure(_))));
        assert_eq!(
            orchestrator.usage().remaining(&caller, Utc::now()).await.unwrap(),
            Remaining::Limited(1)
        );
    }

    #[tokio::test]
    async fn test_concurrent_free_tier_requests_stop_at_daily_quota() {
        let store = MemoryStore::new();
        let generator = Arc::new(SlowGenerator::default());
        let orchestrator = orchestrator_with(&store, generator.clone());
        let caller = free_account(&store).await;

        let attempts = (0..10).map(|i| {
            let orchestrator = orchestrator.clone();
            let caller = caller.clone();
            tokio::spawn(async move { orchestrator.generate(&caller, &format!("reel {}", i), None).await })
        });
        let results: Vec<_> = futures::future::join_all(attempts)
            .await
            .into_iter()
            .map(|joined| joined.unwrap())
            .collect();

        assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 5);
        assert_eq!(
            results.iter().filter(|r| matches!(r, Err(AppError::QuotaExceeded))).count(),
            5
        );
        assert_eq!(generator.calls.load(Ordering::SeqCst), 5);
        assert_eq!(store.generation_records().await.len(), 5);
        assert_eq!(
            orchestrator.usage().remaining(&caller, Utc::now()).await.unwrap(),
            Remaining::Limited(0)
        );
    }

    #[tokio::test]
    async fn test_timed_out_call_releases_reservation() {
        let store = MemoryStore::new();
        let usage = UsageLimitEngine::new(
            Arc::new(store.clone()),
            Arc::new(store.clone()),
            UsagePolicy::default(),
        );
        let orchestrator = GenerationOrchestrator::new(
            usage,
            Arc::new(SlowGenerator::default()),
            Arc::new(store.clone()),
            Duration::from_millis(1),
        );
        let caller = Caller::anonymous("device-1").unwrap();

        let result = orchestrator.generate(&caller, "my cat", None).await;
        assert!(matches!(result, Err(AppError::UpstreamFailure(_))));
        assert_eq!(store.count("device:device-1").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_remaining_reflects_upgrade_during_generation() {
        let store = MemoryStore::new();
        let caller = free_account(&store).await;
        let id = caller.user_id().unwrap();
        let generator = UpgradingGenerator { store: store.clone(), id };
        let orchestrator = orchestrator_with(&store, Arc::new(generator));

        let outcome = orchestrator.generate(&caller, "cooking reel", None).await.unwrap();
        assert_eq!(outcome.remaining, Remaining::Unlimited);
        assert_eq!(store.generation_records().await[0].user_id, Some(id));
    }

    #[tokio::test]
    async fn test_empty_description_is_rejected_before_anything_else() {
        let store = MemoryStore::new();
        let mut generator = MockContentGenerator::new();
        generator.expect_complete().times(0);
        let orchestrator = orchestrator(&store, generator);
        let caller = Caller::anonymous("device-1").unwrap();

        let result = orchestrator.generate(&caller, "   ", None).await;
        assert!(matches!(result, Err(AppError::ValidationError(_))));
    }

    #[tokio::test]
    async fn test_prompt_includes_settings() {
        let store = MemoryStore::new();
        let mut generator = MockContentGenerator::new();
        generator
            .expect_complete()
            .withf(|prompt| prompt.contains("in hindi") && prompt.contains("cooking reel"))
            .times(1)
            .returning(|_| Ok(VALID.to_string()));
        let orchestrator = orchestrator(&store, generator);
        let caller = Caller::anonymous("device-1").unwrap();
        let settings = GenerationSettings { language: "hindi".into(), ..Default::default() };

        orchestrator.generate(&caller, "cooking reel", Some(settings)).await.unwrap();
    }
}
