use chrono::{DateTime, Duration, Utc};
use std::sync::Arc;
use uuid::Uuid;

use crate::auth::otp::generate_code;
use crate::auth::Contact;
use crate::db::{PendingRegistration, PendingStore};
use crate::error::AppError;

/// Holds unconfirmed signups until they are verified or expire.
#[derive(Clone)]
pub struct PendingRegistrations {
    store: Arc<dyn PendingStore>,
    ttl: Duration,
}

impl PendingRegistrations {
    pub fn new(store: Arc<dyn PendingStore>, ttl: Duration) -> Self {
        Self { store, ttl }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Supersedes any earlier registration for the contact and returns the
    /// new one, carrying a fresh code.
    pub async fn create_pending(
        &self,
        full_name: &str,
        contact: &Contact,
        password_hash: &str,
        now: DateTime<Utc>,
    ) -> Result<PendingRegistration, AppError> {
        let pending = PendingRegistration::new(
            contact.clone(),
            full_name.to_string(),
            password_hash.to_string(),
            generate_code(),
            now,
            self.ttl,
        );
        self.store.replace(&pending).await?;
        Ok(pending)
    }

    /// Consumes the registration matching the code. Single use.
    pub async fn take_by_contact_and_otp(
        &self,
        contact: &Contact,
        otp: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<PendingRegistration>, AppError> {
        self.store.take_active(contact, otp, now).await
    }

    /// Re-issues the active registration for the contact under a new code.
    pub async fn reissue(
        &self,
        contact: &Contact,
        now: DateTime<Utc>,
    ) -> Result<Option<PendingRegistration>, AppError> {
        match self.store.find_active_by_contact(contact, now).await? {
            Some(existing) => Ok(Some(
                self.create_pending(&existing.full_name, contact, &existing.password_hash, now)
                    .await?,
            )),
            None => Ok(None),
        }
    }

    pub async fn delete_pending(&self, id: Uuid) -> Result<(), AppError> {
        self.store.delete(id).await
    }

    pub async fn sweep_expired(&self, now: DateTime<Utc>) -> Result<u64, AppError> {
        self.store.sweep_expired(now).await
    }
}
