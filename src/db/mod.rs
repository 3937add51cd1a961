//! Persistence layer for PopMitra server
//!
//! Each store is a narrow trait so the services stay independent of the
//! backend. `DbOperations` implements them on Postgres, `MemoryStore`
//! keeps everything in-process.

pub mod memory;
pub mod models;
pub mod operations;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use uuid::Uuid;

use crate::auth::Contact;
use crate::error::AppError;

pub use memory::MemoryStore;
pub use models::{
    ContactType, GenerationRecord, Identity, NewIdentity, PendingRegistration, RateLimitCounter,
    RateLimitDecision, SigninCode, Tier,
};
pub use operations::DbOperations;

#[async_trait]
pub trait RateLimitStore: Send + Sync {
    /// Records one attempt for the pair and returns the resulting decision.
    /// Must behave as a single atomic step per (identifier, identifier type).
    async fn check_and_record(
        &self,
        identifier: &str,
        identifier_type: ContactType,
        max_attempts: u32,
        window: Duration,
        now: DateTime<Utc>,
    ) -> Result<RateLimitDecision, AppError>;
}

#[async_trait]
pub trait PendingStore: Send + Sync {
    /// Deletes any pending registration for the same contact, then inserts this one.
    async fn replace(&self, pending: &PendingRegistration) -> Result<(), AppError>;

    /// Deletes and returns the registration if the code matches and has not
    /// expired. Of two concurrent calls with the same code, at most one wins.
    async fn take_active(
        &self,
        contact: &Contact,
        otp: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<PendingRegistration>, AppError>;

    async fn find_active_by_contact(
        &self,
        contact: &Contact,
        now: DateTime<Utc>,
    ) -> Result<Option<PendingRegistration>, AppError>;

    async fn delete(&self, id: Uuid) -> Result<(), AppError>;

    async fn sweep_expired(&self, now: DateTime<Utc>) -> Result<u64, AppError>;
}

#[async_trait]
pub trait SigninCodeStore: Send + Sync {
    /// Stores the code for the contact, superseding any earlier one.
    async fn replace_code(&self, code: &SigninCode) -> Result<(), AppError>;

    /// Deletes and returns the code if it matches and has not expired.
    async fn take_code(
        &self,
        contact: &Contact,
        code: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<SigninCode>, AppError>;

    async fn sweep_expired(&self, now: DateTime<Utc>) -> Result<u64, AppError>;
}

#[async_trait]
pub trait IdentityStore: Send + Sync {
    /// Fails with `AppError::AlreadyExists` when the principal is taken.
    async fn create_identity(&self, identity: NewIdentity) -> Result<Identity, AppError>;

    async fn find_by_id(&self, id: Uuid) -> Result<Option<Identity>, AppError>;

    async fn find_by_principal(&self, principal: &str) -> Result<Option<Identity>, AppError>;

    async fn set_tier(&self, id: Uuid, tier: Tier) -> Result<(), AppError>;
}

#[async_trait]
pub trait UsageStore: Send + Sync {
    async fn count(&self, scope_key: &str) -> Result<u32, AppError>;

    /// Atomically adds one to the counter and returns the new value.
    async fn increment(&self, scope_key: &str, now: DateTime<Utc>) -> Result<u32, AppError>;

    /// Adds one only while the counter is below `ceiling`, as a single atomic
    /// step. `None` when the counter is already at the ceiling.
    async fn try_increment(
        &self,
        scope_key: &str,
        ceiling: u32,
        now: DateTime<Utc>,
    ) -> Result<Option<u32>, AppError>;

    /// Gives back one unit taken by `try_increment`. Never goes below zero.
    async fn decrement(&self, scope_key: &str, now: DateTime<Utc>) -> Result<(), AppError>;
}

#[async_trait]
pub trait GenerationLog: Send + Sync {
    async fn append(&self, record: &GenerationRecord) -> Result<(), AppError>;
}

/// Every store the server needs, backed by one value.
pub trait Storage:
    RateLimitStore + PendingStore + SigninCodeStore + IdentityStore + UsageStore + GenerationLog + 'static
{
}

impl<T> Storage for T where
    T: RateLimitStore + PendingStore + SigninCodeStore + IdentityStore + UsageStore + GenerationLog + 'static
{
}
