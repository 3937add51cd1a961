//! Generation quotas.
//!
//! Who may generate, how much, and over what period:
//!
//! | caller                    | quota                 |
//! |---------------------------|-----------------------|
//! | anonymous device          | 1, lifetime           |
//! | signed in, unverified     | 3, lifetime           |
//! | verified, `free` tier     | 5 per UTC day         |
//! | verified, `pro`/`business`| unlimited             |
//!
//! Anonymous callers are keyed by a client-held device token. The caller can
//! reset it at will, so that quota is a soft nudge towards signing up and
//! not an abuse control.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Serialize, Serializer};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info};
use uuid::Uuid;

use crate::config::UsageConfig;
use crate::db::{Identity, IdentityStore, Tier, UsageStore};
use crate::error::AppError;

const MAX_DEVICE_TOKEN_LEN: usize = 128;

/// The party asking to generate content, as known at request time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Caller {
    Anonymous { device_token: String },
    Account { id: Uuid, verified: bool, tier: Tier },
}

impl Caller {
    pub fn anonymous(device_token: &str) -> Result<Self, AppError> {
        let token = device_token.trim();
        let valid = !token.is_empty()
            && token.len() <= MAX_DEVICE_TOKEN_LEN
            && token.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
        if !valid {
            return Err(AppError::ValidationError("Invalid client token".into()));
        }
        Ok(Caller::Anonymous { device_token: token.to_string() })
    }

    pub fn account(identity: &Identity) -> Self {
        Caller::Account { id: identity.id, verified: identity.verified, tier: identity.tier }
    }

    pub fn user_id(&self) -> Option<Uuid> {
        match self {
            Caller::Anonymous { .. } => None,
            Caller::Account { id, .. } => Some(*id),
        }
    }

    pub fn tier(&self) -> Tier {
        match self {
            Caller::Anonymous { .. } => Tier::Anonymous,
            Caller::Account { tier, .. } => *tier,
        }
    }
}

/// How much a caller class may generate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Quota {
    Lifetime(u32),
    Daily(u32),
    Unlimited,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UsagePolicy {
    pub anonymous_limit: u32,
    pub unverified_limit: u32,
    pub free_daily_limit: u32,
}

impl Default for UsagePolicy {
    fn default() -> Self {
        Self {
            anonymous_limit: 1,
            unverified_limit: 3,
            free_daily_limit: 5,
        }
    }
}

impl From<&UsageConfig> for UsagePolicy {
    fn from(config: &UsageConfig) -> Self {
        Self {
            anonymous_limit: config.anonymous_limit,
            unverified_limit: config.unverified_limit,
            free_daily_limit: config.free_daily_limit,
        }
    }
}

impl UsagePolicy {
    pub fn quota_for(&self, caller: &Caller) -> Quota {
        match caller {
            Caller::Anonymous { .. } => Quota::Lifetime(self.anonymous_limit),
            Caller::Account { verified: false, .. } => Quota::Lifetime(self.unverified_limit),
            Caller::Account { tier: Tier::Pro | Tier::Business, .. } => Quota::Unlimited,
            Caller::Account { tier: Tier::Free | Tier::Anonymous, .. } => {
                Quota::Daily(self.free_daily_limit)
            }
        }
    }
}

/// Identity and period a usage counter is keyed by.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScopeKey {
    Device(String),
    AccountLifetime(Uuid),
    AccountDay(Uuid, NaiveDate),
}

impl ScopeKey {
    /// `None` for unlimited callers, which are never counted.
    pub fn for_caller(caller: &Caller, quota: Quota, now: DateTime<Utc>) -> Option<Self> {
        match (caller, quota) {
            (_, Quota::Unlimited) => None,
            (Caller::Anonymous { device_token }, _) => Some(ScopeKey::Device(device_token.clone())),
            (Caller::Account { id, .. }, Quota::Lifetime(_)) => Some(ScopeKey::AccountLifetime(*id)),
            (Caller::Account { id, .. }, Quota::Daily(_)) => {
                Some(ScopeKey::AccountDay(*id, now.date_naive()))
            }
        }
    }
}

impl fmt::Display for ScopeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScopeKey::Device(token) => write!(f, "device:{}", token),
            ScopeKey::AccountLifetime(id) => write!(f, "user:{}:lifetime", id),
            ScopeKey::AccountDay(id, day) => write!(f, "user:{}:{}", id, day.format("%Y-%m-%d")),
        }
    }
}

/// Generations left for a caller in the current period.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Remaining {
    Limited(u32),
    Unlimited,
}

impl Serialize for Remaining {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Remaining::Limited(n) => serializer.serialize_u32(*n),
            Remaining::Unlimited => serializer.serialize_str("unlimited"),
        }
    }
}

/// One unit of quota held for an in-flight generation.
///
/// `caller` is the identity as re-read at reservation time; `scope` is the
/// counter that was charged, `None` for unlimited callers.
#[derive(Debug, Clone)]
pub struct Reservation {
    pub caller: Caller,
    scope: Option<ScopeKey>,
}

#[derive(Clone)]
pub struct UsageLimitEngine {
    counters: Arc<dyn UsageStore>,
    identities: Arc<dyn IdentityStore>,
    policy: UsagePolicy,
}

impl UsageLimitEngine {
    pub fn new(
        counters: Arc<dyn UsageStore>,
        identities: Arc<dyn IdentityStore>,
        policy: UsagePolicy,
    ) -> Self {
        Self { counters, identities, policy }
    }

    pub fn policy(&self) -> &UsagePolicy {
        &self.policy
    }

    /// Read-only: does not touch the counter.
    pub async fn is_allowed(&self, caller: &Caller, now: DateTime<Utc>) -> Result<bool, AppError> {
        Ok(match self.remaining(caller, now).await? {
            Remaining::Unlimited => true,
            Remaining::Limited(left) => left > 0,
        })
    }

    pub async fn remaining(&self, caller: &Caller, now: DateTime<Utc>) -> Result<Remaining, AppError> {
        let quota = self.policy.quota_for(caller);
        let ceiling = match quota {
            Quota::Unlimited => return Ok(Remaining::Unlimited),
            Quota::Lifetime(n) | Quota::Daily(n) => n,
        };
        let used = match ScopeKey::for_caller(caller, quota, now) {
            Some(key) => self.counters.count(&key.to_string()).await?,
            None => 0,
        };
        Ok(Remaining::Limited(ceiling.saturating_sub(used)))
    }

    /// The caller as the identity store sees it now. Anonymous callers and
    /// accounts that no longer exist come back unchanged.
    pub async fn current_caller(&self, caller: &Caller) -> Result<Caller, AppError> {
        Ok(match caller {
            Caller::Anonymous { .. } => caller.clone(),
            Caller::Account { id, .. } => match self.identities.find_by_id(*id).await? {
                Some(identity) => Caller::account(&identity),
                None => caller.clone(),
            },
        })
    }

    /// Checks and charges one generation in a single atomic step.
    ///
    /// Fails with `QuotaExceeded` without touching the counter when the
    /// caller is at the ceiling. Concurrent reservations for one scope never
    /// hand out more units than the quota allows.
    pub async fn reserve(&self, caller: &Caller, now: DateTime<Utc>) -> Result<Reservation, AppError> {
        let current = self.current_caller(caller).await?;
        let quota = self.policy.quota_for(&current);
        let scope = ScopeKey::for_caller(&current, quota, now);

        if let (Some(key), Quota::Lifetime(ceiling) | Quota::Daily(ceiling)) = (&scope, quota) {
            match self.counters.try_increment(&key.to_string(), ceiling, now).await? {
                Some(count) => debug!(scope = %key, count, ceiling, "Usage reserved"),
                None => {
                    info!(tier = %current.tier(), scope = %key, "Generation quota exceeded");
                    return Err(AppError::QuotaExceeded);
                }
            }
        }
        Ok(Reservation { caller: current, scope })
    }

    /// Hands back a reservation whose generation did not complete.
    pub async fn release(&self, reservation: &Reservation, now: DateTime<Utc>) -> Result<(), AppError> {
        if let Some(key) = &reservation.scope {
            self.counters.decrement(&key.to_string(), now).await?;
            debug!(scope = %key, "Usage released");
        }
        Ok(())
    }

    /// Counts one generation against the caller's current scope.
    ///
    /// Account callers are re-read first: a tier change since `is_allowed`
    /// decides which counter applies, and unlimited callers are never counted.
    pub async fn record_usage(&self, caller: &Caller, now: DateTime<Utc>) -> Result<(), AppError> {
        let current = self.current_caller(caller).await?;

        let quota = self.policy.quota_for(&current);
        match ScopeKey::for_caller(&current, quota, now) {
            Some(key) => {
                let count = self.counters.increment(&key.to_string(), now).await?;
                debug!(scope = %key, count, "Usage recorded");
            }
            None => info!(tier = %current.tier(), "Unlimited caller, usage not counted"),
        }
        Ok(())
    }
}
