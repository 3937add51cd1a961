use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use sqlx::postgres::PgPoolOptions;
use sqlx::{FromRow, PgPool, Postgres, Transaction};
use std::sync::Arc;
use uuid::Uuid;

use crate::auth::Contact;
use crate::db::models::*;
use crate::db::{GenerationLog, IdentityStore, PendingStore, RateLimitStore, SigninCodeStore, UsageStore};
use crate::error::AppError;

/// Postgres backend for every store.
#[derive(Clone)]
pub struct DbOperations {
    pool: Arc<PgPool>,
}

#[derive(FromRow)]
struct IdentityRow {
    id: Uuid,
    principal: String,
    email: Option<String>,
    phone: Option<String>,
    display_name: String,
    password_hash: String,
    verified: bool,
    tier: String,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<IdentityRow> for Identity {
    type Error = AppError;

    fn try_from(row: IdentityRow) -> Result<Self, Self::Error> {
        Ok(Identity {
            id: row.id,
            principal: row.principal,
            email: row.email,
            phone: row.phone,
            display_name: row.display_name,
            password_hash: row.password_hash,
            verified: row.verified,
            tier: row.tier.parse()?,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

#[derive(FromRow)]
struct PendingRow {
    id: Uuid,
    contact: String,
    contact_type: String,
    full_name: String,
    password_hash: String,
    otp: String,
    created_at: DateTime<Utc>,
    expires_at: DateTime<Utc>,
}

impl TryFrom<PendingRow> for PendingRegistration {
    type Error = AppError;

    fn try_from(row: PendingRow) -> Result<Self, Self::Error> {
        Ok(PendingRegistration {
            id: row.id,
            contact: Contact::from_stored(row.contact_type.parse()?, row.contact),
            full_name: row.full_name,
            password_hash: row.password_hash,
            otp: row.otp,
            created_at: row.created_at,
            expires_at: row.expires_at,
        })
    }
}

#[derive(FromRow)]
struct SigninCodeRow {
    contact: String,
    contact_type: String,
    code: String,
    created_at: DateTime<Utc>,
    expires_at: DateTime<Utc>,
}

#[derive(FromRow)]
struct RateLimitRow {
    identifier: String,
    attempts: i32,
    first_attempt_at: DateTime<Utc>,
    last_attempt_at: DateTime<Utc>,
    blocked_until: Option<DateTime<Utc>>,
}

const IDENTITY_COLUMNS: &str = "id, principal, email, phone, display_name, password_hash, verified, tier, created_at, updated_at";
const PENDING_COLUMNS: &str = "id, contact, contact_type, full_name, password_hash, otp, created_at, expires_at";

impl DbOperations {
    pub fn new(pool: Arc<PgPool>) -> Self {
        Self { pool }
    }

    pub async fn new_with_options(
        url: &str,
        max_connections: u32,
        acquire_timeout: std::time::Duration,
    ) -> Result<Self, AppError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(acquire_timeout)
            .connect(url)
            .await
            .map_err(|e| AppError::DatabaseError(crate::error::DatabaseError::ConnectionError(e.to_string())))?;

        Ok(Self { pool: Arc::new(pool) })
    }

    pub async fn migrate(&self) -> Result<(), AppError> {
        sqlx::migrate!("./migrations").run(self.pool.as_ref()).await?;
        Ok(())
    }

    pub async fn begin_transaction(&self) -> Result<Transaction<'_, Postgres>, AppError> {
        Ok(self.pool.as_ref().begin().await?)
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

#[async_trait]
impl RateLimitStore for DbOperations {
    async fn check_and_record(
        &self,
        identifier: &str,
        identifier_type: ContactType,
        max_attempts: u32,
        window: Duration,
        now: DateTime<Utc>,
    ) -> Result<RateLimitDecision, AppError> {
        let mut transaction = self.begin_transaction().await?;

        let inserted = sqlx::query(
            r#"
            INSERT INTO signup_rate_limits (identifier, identifier_type, attempts, first_attempt_at, last_attempt_at)
            VALUES ($1, $2, 1, $3, $3)
            ON CONFLICT (identifier, identifier_type) DO NOTHING
            "#,
        )
        .bind(identifier)
        .bind(identifier_type.as_str())
        .bind(now)
        .execute(&mut *transaction)
        .await?;

        if inserted.rows_affected() == 1 {
            transaction.commit().await?;
            return Ok(RateLimitDecision { allowed: true, reset_at: now + window });
        }

        // Row lock serialises concurrent attempts for the same identifier.
        let row = sqlx::query_as::<_, RateLimitRow>(
            r#"
            SELECT identifier, attempts, first_attempt_at, last_attempt_at, blocked_until
            FROM signup_rate_limits
            WHERE identifier = $1 AND identifier_type = $2
            FOR UPDATE
            "#,
        )
        .bind(identifier)
        .bind(identifier_type.as_str())
        .fetch_one(&mut *transaction)
        .await?;

        let mut counter = RateLimitCounter {
            identifier: row.identifier,
            identifier_type,
            attempts: row.attempts.max(0) as u32,
            first_attempt_at: row.first_attempt_at,
            last_attempt_at: row.last_attempt_at,
            blocked_until: row.blocked_until,
        };
        let decision = counter.record_attempt(max_attempts, window, now);

        sqlx::query(
            r#"
            UPDATE signup_rate_limits
            SET attempts = $3, first_attempt_at = $4, last_attempt_at = $5, blocked_until = $6
            WHERE identifier = $1 AND identifier_type = $2
            "#,
        )
        .bind(identifier)
        .bind(identifier_type.as_str())
        .bind(counter.attempts as i32)
        .bind(counter.first_attempt_at)
        .bind(counter.last_attempt_at)
        .bind(counter.blocked_until)
        .execute(&mut *transaction)
        .await?;

        transaction.commit().await?;
        Ok(decision)
    }
}

#[async_trait]
impl PendingStore for DbOperations {
    async fn replace(&self, pending: &PendingRegistration) -> Result<(), AppError> {
        let mut transaction = self.begin_transaction().await?;

        sqlx::query("DELETE FROM pending_registrations WHERE contact = $1 AND contact_type = $2")
            .bind(pending.contact.value())
            .bind(pending.contact.contact_type().as_str())
            .execute(&mut *transaction)
            .await?;

        sqlx::query(
            r#"
            INSERT INTO pending_registrations (id, contact, contact_type, full_name, password_hash, otp, created_at, expires_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            "#,
        )
        .bind(pending.id)
        .bind(pending.contact.value())
        .bind(pending.contact.contact_type().as_str())
        .bind(&pending.full_name)
        .bind(&pending.password_hash)
        .bind(&pending.otp)
        .bind(pending.created_at)
        .bind(pending.expires_at)
        .execute(&mut *transaction)
        .await?;

        transaction.commit().await?;
        Ok(())
    }

    async fn take_active(
        &self,
        contact: &Contact,
        otp: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<PendingRegistration>, AppError> {
        let row = sqlx::query_as::<_, PendingRow>(&format!(
            "DELETE FROM pending_registrations WHERE contact = $1 AND contact_type = $2 AND otp = $3 AND expires_at > $4 RETURNING {}",
            PENDING_COLUMNS
        ))
        .bind(contact.value())
        .bind(contact.contact_type().as_str())
        .bind(otp)
        .bind(now)
        .fetch_optional(self.pool.as_ref())
        .await?;

        row.map(PendingRegistration::try_from).transpose()
    }

    async fn find_active_by_contact(
        &self,
        contact: &Contact,
        now: DateTime<Utc>,
    ) -> Result<Option<PendingRegistration>, AppError> {
        let row = sqlx::query_as::<_, PendingRow>(&format!(
            "SELECT {} FROM pending_registrations WHERE contact = $1 AND contact_type = $2 AND expires_at > $3",
            PENDING_COLUMNS
        ))
        .bind(contact.value())
        .bind(contact.contact_type().as_str())
        .bind(now)
        .fetch_optional(self.pool.as_ref())
        .await?;

        row.map(PendingRegistration::try_from).transpose()
    }

    async fn delete(&self, id: Uuid) -> Result<(), AppError> {
        sqlx::query("DELETE FROM pending_registrations WHERE id = $1")
            .bind(id)
            .execute(self.pool.as_ref())
            .await?;
        Ok(())
    }

    async fn sweep_expired(&self, now: DateTime<Utc>) -> Result<u64, AppError> {
        let result = sqlx::query("DELETE FROM pending_registrations WHERE expires_at <= $1")
            .bind(now)
            .execute(self.pool.as_ref())
            .await?;
        Ok(result.rows_affected())
    }
}

#[async_trait]
impl SigninCodeStore for DbOperations {
    async fn replace_code(&self, code: &SigninCode) -> Result<(), AppError> {
        sqlx::query(
            r#"
            INSERT INTO signin_codes (contact, contact_type, code, created_at, expires_at)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (contact_type, contact)
            DO UPDATE SET code = EXCLUDED.code, created_at = EXCLUDED.created_at, expires_at = EXCLUDED.expires_at
            "#,
        )
        .bind(code.contact.value())
        .bind(code.contact.contact_type().as_str())
        .bind(&code.code)
        .bind(code.created_at)
        .bind(code.expires_at)
        .execute(self.pool.as_ref())
        .await?;
        Ok(())
    }

    async fn take_code(
        &self,
        contact: &Contact,
        code: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<SigninCode>, AppError> {
        let row = sqlx::query_as::<_, SigninCodeRow>(
            r#"
            DELETE FROM signin_codes
            WHERE contact = $1 AND contact_type = $2 AND code = $3 AND expires_at > $4
            RETURNING contact, contact_type, code, created_at, expires_at
            "#,
        )
        .bind(contact.value())
        .bind(contact.contact_type().as_str())
        .bind(code)
        .bind(now)
        .fetch_optional(self.pool.as_ref())
        .await?;

        row.map(|row| -> Result<SigninCode, AppError> {
            Ok(SigninCode {
                contact: Contact::from_stored(row.contact_type.parse()?, row.contact),
                code: row.code,
                created_at: row.created_at,
                expires_at: row.expires_at,
            })
        })
        .transpose()
    }

    async fn sweep_expired(&self, now: DateTime<Utc>) -> Result<u64, AppError> {
        let result = sqlx::query("DELETE FROM signin_codes WHERE expires_at <= $1")
            .bind(now)
            .execute(self.pool.as_ref())
            .await?;
        Ok(result.rows_affected())
    }
}

#[async_trait]
impl IdentityStore for DbOperations {
    async fn create_identity(&self, identity: NewIdentity) -> Result<Identity, AppError> {
        let identity = Identity::from_new(identity, Utc::now());
        let row = sqlx::query_as::<_, IdentityRow>(&format!(
            r#"
            INSERT INTO identities (id, principal, email, phone, display_name, password_hash, verified, tier, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            RETURNING {}
            "#,
            IDENTITY_COLUMNS
        ))
        .bind(identity.id)
        .bind(&identity.principal)
        .bind(&identity.email)
        .bind(&identity.phone)
        .bind(&identity.display_name)
        .bind(&identity.password_hash)
        .bind(identity.verified)
        .bind(identity.tier.as_str())
        .bind(identity.created_at)
        .bind(identity.updated_at)
        .fetch_one(self.pool.as_ref())
        .await?;

        Identity::try_from(row)
    }

    async fn find_by_id(&self, id: Uuid) -> Result<Option<Identity>, AppError> {
        let row = sqlx::query_as::<_, IdentityRow>(&format!(
            "SELECT {} FROM identities WHERE id = $1",
            IDENTITY_COLUMNS
        ))
        .bind(id)
        .fetch_optional(self.pool.as_ref())
        .await?;

        row.map(Identity::try_from).transpose()
    }

    async fn find_by_principal(&self, principal: &str) -> Result<Option<Identity>, AppError> {
        let row = sqlx::query_as::<_, IdentityRow>(&format!(
            "SELECT {} FROM identities WHERE principal = $1",
            IDENTITY_COLUMNS
        ))
        .bind(principal)
        .fetch_optional(self.pool.as_ref())
        .await?;

        row.map(Identity::try_from).transpose()
    }

    async fn set_tier(&self, id: Uuid, tier: Tier) -> Result<(), AppError> {
        let result = sqlx::query("UPDATE identities SET tier = $2, updated_at = $3 WHERE id = $1")
            .bind(id)
            .bind(tier.as_str())
            .bind(Utc::now())
            .execute(self.pool.as_ref())
            .await?;
        if result.rows_affected() == 0 {
            return Err(AppError::NotFound("Account not found".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl UsageStore for DbOperations {
    async fn count(&self, scope_key: &str) -> Result<u32, AppError> {
        let count: Option<i32> = sqlx::query_scalar("SELECT count FROM usage_counters WHERE scope_key = $1")
            .bind(scope_key)
            .fetch_optional(self.pool.as_ref())
            .await?;
        Ok(count.unwrap_or(0).max(0) as u32)
    }

    async fn increment(&self, scope_key: &str, now: DateTime<Utc>) -> Result<u32, AppError> {
        let count: i32 = sqlx::query_scalar(
            r#"
            INSERT INTO usage_counters (scope_key, count, updated_at)
            VALUES ($1, 1, $2)
            ON CONFLICT (scope_key) DO UPDATE SET count = usage_counters.count + 1, updated_at = $2
            RETURNING count
            "#,
        )
        .bind(scope_key)
        .bind(now)
        .fetch_one(self.pool.as_ref())
        .await?;
        Ok(count.max(0) as u32)
    }

    async fn try_increment(
        &self,
        scope_key: &str,
        ceiling: u32,
        now: DateTime<Utc>,
    ) -> Result<Option<u32>, AppError> {
        if ceiling == 0 {
            return Ok(None);
        }
        // The conflict branch only fires while under the ceiling; the row
        // lock taken by ON CONFLICT serializes concurrent reservations.
        let count: Option<i32> = sqlx::query_scalar(
            r#"
            INSERT INTO usage_counters (scope_key, count, updated_at)
            VALUES ($1, 1, $3)
            ON CONFLICT (scope_key) DO UPDATE SET count = usage_counters.count + 1, updated_at = $3
            WHERE usage_counters.count < $2
            RETURNING count
            "#,
        )
        .bind(scope_key)
        .bind(i32::try_from(ceiling).unwrap_or(i32::MAX))
        .bind(now)
        .fetch_optional(self.pool.as_ref())
        .await?;
        Ok(count.map(|c| c.max(0) as u32))
    }

    async fn decrement(&self, scope_key: &str, now: DateTime<Utc>) -> Result<(), AppError> {
        sqlx::query(
            "UPDATE usage_counters SET count = GREATEST(count - 1, 0), updated_at = $2 WHERE scope_key = $1",
        )
        .bind(scope_key)
        .bind(now)
        .execute(self.pool.as_ref())
        .await?;
        Ok(())
    }
}

#[async_trait]
impl GenerationLog for DbOperations {
    async fn append(&self, record: &GenerationRecord) -> Result<(), AppError> {
        sqlx::query(
            r#"
            INSERT INTO generation_records (id, user_id, description, settings, created_at)
            VALUES ($1, $2, $3, $4, $5)
            "#,
        )
        .bind(record.id)
        .bind(record.user_id)
        .bind(&record.description)
        .bind(&record.settings)
        .bind(record.created_at)
        .execute(self.pool.as_ref())
        .await?;
        Ok(())
    }
}
