use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::auth::Contact;
use crate::error::AppError;

/// Subscription level governing generation quota.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    Anonymous,
    Free,
    Pro,
    Business,
}

impl Tier {
    pub fn as_str(&self) -> &'static str {
        match self {
            Tier::Anonymous => "anonymous",
            Tier::Free => "free",
            Tier::Pro => "pro",
            Tier::Business => "business",
        }
    }
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Tier {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "anonymous" => Ok(Tier::Anonymous),
            "free" => Ok(Tier::Free),
            "pro" => Ok(Tier::Pro),
            "business" => Ok(Tier::Business),
            other => Err(AppError::InternalError(format!("unknown tier '{}'", other))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContactType {
    Email,
    Phone,
}

impl ContactType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ContactType::Email => "email",
            ContactType::Phone => "phone",
        }
    }
}

impl FromStr for ContactType {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "email" => Ok(ContactType::Email),
            "phone" => Ok(ContactType::Phone),
            other => Err(AppError::InternalError(format!("unknown contact type '{}'", other))),
        }
    }
}

/// A provisioned account together with its profile data.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Identity {
    pub id: Uuid,
    /// Normalised contact the account was created with; unique across identities.
    pub principal: String,
    pub email: Option<String>,
    pub phone: Option<String>,
    pub display_name: String,
    #[serde(skip_serializing)]
    pub password_hash: String,
    pub verified: bool,
    pub tier: Tier,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Input to [`crate::db::IdentityStore::create_identity`].
#[derive(Debug, Clone)]
pub struct NewIdentity {
    pub contact: Contact,
    pub display_name: String,
    pub password_hash: String,
    pub verified: bool,
}

impl Identity {
    pub fn from_new(new: NewIdentity, now: DateTime<Utc>) -> Self {
        let (email, phone) = match &new.contact {
            Contact::Email(email) => (Some(email.clone()), None),
            Contact::Phone(phone) => (None, Some(phone.clone())),
        };
        Self {
            id: Uuid::new_v4(),
            principal: new.contact.principal(),
            email,
            phone,
            display_name: new.display_name,
            password_hash: new.password_hash,
            verified: new.verified,
            tier: Tier::Free,
            created_at: now,
            updated_at: now,
        }
    }
}

/// An unconfirmed signup awaiting OTP verification.
#[derive(Debug, Clone)]
pub struct PendingRegistration {
    pub id: Uuid,
    pub contact: Contact,
    pub full_name: String,
    pub password_hash: String,
    pub otp: String,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl PendingRegistration {
    pub fn new(
        contact: Contact,
        full_name: String,
        password_hash: String,
        otp: String,
        now: DateTime<Utc>,
        ttl: Duration,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            contact,
            full_name,
            password_hash,
            otp,
            created_at: now,
            expires_at: now + ttl,
        }
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}

/// A sign-in code issued to an existing account's contact.
#[derive(Debug, Clone)]
pub struct SigninCode {
    pub contact: Contact,
    pub code: String,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

/// Attempt history for one (identifier, identifier type) pair.
#[derive(Debug, Clone)]
pub struct RateLimitCounter {
    pub identifier: String,
    pub identifier_type: ContactType,
    pub attempts: u32,
    pub first_attempt_at: DateTime<Utc>,
    pub last_attempt_at: DateTime<Utc>,
    pub blocked_until: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitDecision {
    pub allowed: bool,
    pub reset_at: DateTime<Utc>,
}

impl RateLimitCounter {
    pub fn first(identifier: &str, identifier_type: ContactType, now: DateTime<Utc>) -> Self {
        Self {
            identifier: identifier.to_string(),
            identifier_type,
            attempts: 1,
            first_attempt_at: now,
            last_attempt_at: now,
            blocked_until: None,
        }
    }

    /// Applies one attempt to the counter. Callers must hold whatever lock
    /// makes the read-modify-write atomic for this row.
    pub fn record_attempt(
        &mut self,
        max_attempts: u32,
        window: Duration,
        now: DateTime<Utc>,
    ) -> RateLimitDecision {
        if let Some(blocked_until) = self.blocked_until {
            if blocked_until > now {
                return RateLimitDecision { allowed: false, reset_at: blocked_until };
            }
        }

        let block_expired = self.blocked_until.map_or(false, |until| until <= now);
        if block_expired || now - self.first_attempt_at >= window {
            *self = Self::first(&self.identifier, self.identifier_type, now);
            return RateLimitDecision { allowed: true, reset_at: now + window };
        }

        self.attempts += 1;
        self.last_attempt_at = now;
        if self.attempts > max_attempts {
            let blocked_until = now + window;
            self.blocked_until = Some(blocked_until);
            return RateLimitDecision { allowed: false, reset_at: blocked_until };
        }

        RateLimitDecision { allowed: true, reset_at: self.first_attempt_at + window }
    }
}

/// One completed generation call. Append-only.
#[derive(Debug, Clone, Serialize)]
pub struct GenerationRecord {
    pub id: Uuid,
    pub user_id: Option<Uuid>,
    pub description: String,
    pub settings: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counter_blocks_after_max_attempts() {
        let start = Utc::now();
        let window = Duration::minutes(60);
        let mut counter = RateLimitCounter::first("+15551234567", ContactType::Phone, start);

        for i in 1..3 {
            let decision = counter.record_attempt(3, window, start + Duration::seconds(i));
            assert!(decision.allowed);
        }
        let decision = counter.record_attempt(3, window, start + Duration::seconds(3));
        assert!(!decision.allowed);
        assert_eq!(counter.attempts, 4);
        assert_eq!(decision.reset_at, start + Duration::seconds(3) + window);

        // Still blocked, reset time does not move.
        let again = counter.record_attempt(3, window, start + Duration::minutes(10));
        assert!(!again.allowed);
        assert_eq!(again.reset_at, decision.reset_at);
    }

    #[test]
    fn test_counter_resets_after_block_expires() {
        let start = Utc::now();
        let window = Duration::minutes(60);
        let mut counter = RateLimitCounter::first("a@x.com", ContactType::Email, start);
        for _ in 0..3 {
            counter.record_attempt(3, window, start);
        }
        assert!(counter.blocked_until.is_some());

        let later = start + Duration::minutes(61);
        let decision = counter.record_attempt(3, window, later);
        assert!(decision.allowed);
        assert_eq!(counter.attempts, 1);
        assert_eq!(counter.blocked_until, None);
        assert_eq!(counter.first_attempt_at, later);
    }

    #[test]
    fn test_counter_window_rolls_over() {
        let start = Utc::now();
        let window = Duration::minutes(60);
        let mut counter = RateLimitCounter::first("a@x.com", ContactType::Email, start);
        counter.record_attempt(3, window, start + Duration::minutes(1));

        let decision = counter.record_attempt(3, window, start + Duration::minutes(60));
        assert!(decision.allowed);
        assert_eq!(counter.attempts, 1);
    }

    #[test]
    fn test_tier_round_trips_through_text() {
        for tier in [Tier::Anonymous, Tier::Free, Tier::Pro, Tier::Business] {
            assert_eq!(tier.as_str().parse::<Tier>().unwrap(), tier);
        }
        assert!("gold".parse::<Tier>().is_err());
    }
}
