use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use uuid::Uuid;

use crate::auth::Contact;
use crate::db::models::*;
use crate::db::{GenerationLog, IdentityStore, PendingStore, RateLimitStore, SigninCodeStore, UsageStore};
use crate::error::AppError;

/// In-process backend. Cloning shares the underlying maps.
#[derive(Clone, Default)]
pub struct MemoryStore {
    rate_limits: Arc<Mutex<HashMap<(String, ContactType), RateLimitCounter>>>,
    pending: Arc<RwLock<HashMap<Uuid, PendingRegistration>>>,
    signin_codes: Arc<RwLock<HashMap<Contact, SigninCode>>>,
    identities: Arc<RwLock<HashMap<Uuid, Identity>>>,
    usage: Arc<Mutex<HashMap<String, u32>>>,
    generations: Arc<RwLock<Vec<GenerationRecord>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn generation_records(&self) -> Vec<GenerationRecord> {
        self.generations.read().await.clone()
    }

    pub async fn pending_count(&self) -> usize {
        self.pending.read().await.len()
    }
}

#[async_trait]
impl RateLimitStore for MemoryStore {
    async fn check_and_record(
        &self,
        identifier: &str,
        identifier_type: ContactType,
        max_attempts: u32,
        window: Duration,
        now: DateTime<Utc>,
    ) -> Result<RateLimitDecision, AppError> {
        // The mutex is held for the whole read-check-increment.
        let mut counters = self.rate_limits.lock().await;
        let key = (identifier.to_string(), identifier_type);
        match counters.get_mut(&key) {
            Some(counter) => Ok(counter.record_attempt(max_attempts, window, now)),
            None => {
                counters.insert(key, RateLimitCounter::first(identifier, identifier_type, now));
                Ok(RateLimitDecision { allowed: true, reset_at: now + window })
            }
        }
    }
}

#[async_trait]
impl PendingStore for MemoryStore {
    async fn replace(&self, pending: &PendingRegistration) -> Result<(), AppError> {
        let mut rows = self.pending.write().await;
        rows.retain(|_, row| row.contact != pending.contact);
        rows.insert(pending.id, pending.clone());
        Ok(())
    }

    async fn take_active(
        &self,
        contact: &Contact,
        otp: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<PendingRegistration>, AppError> {
        let mut rows = self.pending.write().await;
        let id = rows
            .values()
            .find(|row| &row.contact == contact && row.otp == otp && !row.is_expired(now))
            .map(|row| row.id);
        Ok(id.and_then(|id| rows.remove(&id)))
    }

    async fn find_active_by_contact(
        &self,
        contact: &Contact,
        now: DateTime<Utc>,
    ) -> Result<Option<PendingRegistration>, AppError> {
        let rows = self.pending.read().await;
        Ok(rows
            .values()
            .find(|row| &row.contact == contact && !row.is_expired(now))
            .cloned())
    }

    async fn delete(&self, id: Uuid) -> Result<(), AppError> {
        self.pending.write().await.remove(&id);
        Ok(())
    }

    async fn sweep_expired(&self, now: DateTime<Utc>) -> Result<u64, AppError> {
        let mut rows = self.pending.write().await;
        let before = rows.len();
        rows.retain(|_, row| !row.is_expired(now));
        Ok((before - rows.len()) as u64)
    }
}

#[async_trait]
impl SigninCodeStore for MemoryStore {
    async fn replace_code(&self, code: &SigninCode) -> Result<(), AppError> {
        self.signin_codes.write().await.insert(code.contact.clone(), code.clone());
        Ok(())
    }

    async fn take_code(
        &self,
        contact: &Contact,
        code: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<SigninCode>, AppError> {
        let mut codes = self.signin_codes.write().await;
        let matches = codes
            .get(contact)
            .map_or(false, |stored| stored.code == code && stored.expires_at > now);
        if matches {
            Ok(codes.remove(contact))
        } else {
            Ok(None)
        }
    }

    async fn sweep_expired(&self, now: DateTime<Utc>) -> Result<u64, AppError> {
        let mut codes = self.signin_codes.write().await;
        let before = codes.len();
        codes.retain(|_, code| code.expires_at > now);
        Ok((before - codes.len()) as u64)
    }
}

#[async_trait]
impl IdentityStore for MemoryStore {
    async fn create_identity(&self, identity: NewIdentity) -> Result<Identity, AppError> {
        let mut identities = self.identities.write().await;
        let principal = identity.contact.principal();
        if identities.values().any(|existing| existing.principal == principal) {
            return Err(AppError::AlreadyExists);
        }
        let identity = Identity::from_new(identity, Utc::now());
        identities.insert(identity.id, identity.clone());
        Ok(identity)
    }

    async fn find_by_id(&self, id: Uuid) -> Result<Option<Identity>, AppError> {
        Ok(self.identities.read().await.get(&id).cloned())
    }

    async fn find_by_principal(&self, principal: &str) -> Result<Option<Identity>, AppError> {
        Ok(self
            .identities
            .read()
            .await
            .values()
            .find(|identity| identity.principal == principal)
            .cloned())
    }

    async fn set_tier(&self, id: Uuid, tier: Tier) -> Result<(), AppError> {
        let mut identities = self.identities.write().await;
        let identity = identities
            .get_mut(&id)
            .ok_or_else(|| AppError::NotFound("Account not found".into()))?;
        identity.tier = tier;
        identity.updated_at = Utc::now();
        Ok(())
    }
}

#[async_trait]
impl UsageStore for MemoryStore {
    async fn count(&self, scope_key: &str) -> Result<u32, AppError> {
        Ok(self.usage.lock().await.get(scope_key).copied().unwrap_or(0))
    }

    async fn increment(&self, scope_key: &str, _now: DateTime<Utc>) -> Result<u32, AppError> {
        let mut usage = self.usage.lock().await;
        let count = usage.entry(scope_key.to_string()).or_insert(0);
        *count += 1;
        Ok(*count)
    }

    async fn try_increment(
        &self,
        scope_key: &str,
        ceiling: u32,
        _now: DateTime<Utc>,
    ) -> Result<Option<u32>, AppError> {
        let mut usage = self.usage.lock().await;
        let count = usage.entry(scope_key.to_string()).or_insert(0);
        if *count >= ceiling {
            return Ok(None);
        }
        *count += 1;
        Ok(Some(*count))
    }

    async fn decrement(&self, scope_key: &str, _now: DateTime<Utc>) -> Result<(), AppError> {
        if let Some(count) = self.usage.lock().await.get_mut(scope_key) {
            *count = count.saturating_sub(1);
        }
        Ok(())
    }
}

#[async_trait]
impl GenerationLog for MemoryStore {
    async fn append(&self, record: &GenerationRecord) -> Result<(), AppError> {
        self.generations.write().await.push(record.clone());
        Ok(())
    }
}
