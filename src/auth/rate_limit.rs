use chrono::{DateTime, Duration, Utc};
use std::sync::Arc;
use tracing::warn;

use crate::auth::Contact;
use crate::db::{RateLimitDecision, RateLimitStore};
use crate::error::AppError;

#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    pub max_attempts: u32,
    pub window_size: Duration,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,                    // 3 signup attempts
            window_size: Duration::minutes(60), // per hour per identifier
        }
    }
}

/// Throttles signup attempts per contact identifier.
#[derive(Clone)]
pub struct RateLimiter {
    store: Arc<dyn RateLimitStore>,
    config: RateLimitConfig,
}

impl RateLimiter {
    pub fn new(store: Arc<dyn RateLimitStore>, config: RateLimitConfig) -> Self {
        Self { store, config }
    }

    pub fn config(&self) -> &RateLimitConfig {
        &self.config
    }

    pub async fn check_and_record_attempt(
        &self,
        contact: &Contact,
        now: DateTime<Utc>,
    ) -> Result<RateLimitDecision, AppError> {
        self.store
            .check_and_record(
                contact.value(),
                contact.contact_type(),
                self.config.max_attempts,
                self.config.window_size,
                now,
            )
            .await
    }

    /// Records the attempt and turns a refusal into `AppError::RateLimited`.
    pub async fn enforce(&self, contact: &Contact, now: DateTime<Utc>) -> Result<(), AppError> {
        let decision = self.check_and_record_attempt(contact, now).await?;
        if decision.allowed {
            Ok(())
        } else {
            warn!(
                contact_type = contact.contact_type().as_str(),
                reset_at = %decision.reset_at,
                "Signup rate limit exceeded"
            );
            Err(AppError::RateLimited { reset_at: decision.reset_at })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::MemoryStore;

    fn limiter() -> RateLimiter {
        RateLimiter::new(Arc::new(MemoryStore::new()), RateLimitConfig::default())
    }

    #[tokio::test]
    async fn test_rate_limiter() {
        let limiter = limiter();
        let contact = Contact::phone("+15551234567").unwrap();
        let start = Utc::now();

        for i in 0..3 {
            assert!(limiter.enforce(&contact, start + Duration::minutes(i)).await.is_ok());
        }

        match limiter.enforce(&contact, start + Duration::minutes(3)).await {
            Err(AppError::RateLimited { reset_at }) => {
                let after_first = reset_at - start;
                assert!(after_first >= Duration::minutes(60));
                assert!(after_first <= Duration::minutes(64));
            }
            other => panic!("Expected rate limit, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_block_lifts_after_reset_at() {
        let limiter = limiter();
        let contact = Contact::email("a@x.com").unwrap();
        let start = Utc::now();

        for _ in 0..4 {
            let _ = limiter.check_and_record_attempt(&contact, start).await.unwrap();
        }
        let blocked = limiter.check_and_record_attempt(&contact, start).await.unwrap();
        assert!(!blocked.allowed);

        let after = blocked.reset_at + Duration::seconds(1);
        let decision = limiter.check_and_record_attempt(&contact, after).await.unwrap();
        assert!(decision.allowed);

        // Counter was reset to one attempt, so two more are allowed.
        assert!(limiter.check_and_record_attempt(&contact, after).await.unwrap().allowed);
        assert!(limiter.check_and_record_attempt(&contact, after).await.unwrap().allowed);
        assert!(!limiter.check_and_record_attempt(&contact, after).await.unwrap().allowed);
    }

    #[tokio::test]
    async fn test_identifiers_are_independent() {
        let limiter = limiter();
        let now = Utc::now();
        let first = Contact::email("a@x.com").unwrap();
        let second = Contact::email("b@x.com").unwrap();

        for _ in 0..3 {
            limiter.enforce(&first, now).await.unwrap();
        }
        assert!(limiter.enforce(&first, now).await.is_err());
        assert!(limiter.enforce(&second, now).await.is_ok());
    }
}
