use chrono::{Duration, Utc};
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

use crate::auth::otp::OtpService;
use crate::auth::password::{hash_password, verify_password};
use crate::auth::provisioner::AccountProvisioner;
use crate::auth::rate_limit::RateLimiter;
use crate::auth::Contact;
use crate::db::{Identity, IdentityStore};
use crate::error::AppError;

#[derive(Debug, Serialize, Deserialize)]
pub struct Claims {
    pub sub: String,  // Identity ID
    pub exp: i64,     // Expiration time
    pub iat: i64,     // Issued at
}

/// A verified or signed-in account together with its session token.
#[derive(Debug, Clone)]
pub struct Session {
    pub identity: Identity,
    pub token: String,
}

#[derive(Debug, Clone)]
pub struct CodeSent {
    pub contact: Contact,
    pub expires_in: Duration,
}

pub struct AuthService {
    limiter: RateLimiter,
    otp: OtpService,
    provisioner: AccountProvisioner,
    identities: Arc<dyn IdentityStore>,
    jwt_secret: String,
    token_expiry: Duration,
    min_password_length: usize,
}

impl AuthService {
    pub fn new(
        limiter: RateLimiter,
        otp: OtpService,
        provisioner: AccountProvisioner,
        identities: Arc<dyn IdentityStore>,
        jwt_secret: String,
        token_expiry: Duration,
        min_password_length: usize,
    ) -> Self {
        Self {
            limiter,
            otp,
            provisioner,
            identities,
            jwt_secret,
            token_expiry,
            min_password_length,
        }
    }

    pub fn otp(&self) -> &OtpService {
        &self.otp
    }

    /// Validates the registration, applies the signup rate limit, records the
    /// pending registration and dispatches its code.
    pub async fn signup(
        &self,
        full_name: &str,
        email: Option<&str>,
        phone: Option<&str>,
        password: &str,
    ) -> Result<CodeSent, AppError> {
        let full_name = full_name.trim();
        if full_name.is_empty() || password.is_empty() {
            return Err(AppError::ValidationError("Missing required fields".into()));
        }
        let contact = Contact::from_parts(email, phone)?;
        if password.chars().count() < self.min_password_length {
            return Err(AppError::ValidationError(format!(
                "Password must be at least {} characters",
                self.min_password_length
            )));
        }

        let now = Utc::now();
        self.limiter.enforce(&contact, now).await?;

        let password_hash = hash_password(password)?;
        self.otp
            .request_signup_code(full_name, &contact, &password_hash, now)
            .await?;

        Ok(CodeSent { contact, expires_in: self.otp.ttl() })
    }

    pub async fn resend_signup_code(
        &self,
        email: Option<&str>,
        phone: Option<&str>,
    ) -> Result<CodeSent, AppError> {
        let contact = Contact::from_parts(email, phone)?;
        let now = Utc::now();
        self.limiter.enforce(&contact, now).await?;
        self.otp.resend_signup_code(&contact, now).await?;
        Ok(CodeSent { contact, expires_in: self.otp.ttl() })
    }

    pub async fn verify_signup(
        &self,
        email: Option<&str>,
        phone: Option<&str>,
        code: &str,
    ) -> Result<Session, AppError> {
        if code.trim().is_empty() {
            return Err(AppError::ValidationError("Missing required fields".into()));
        }
        let contact = Contact::from_parts(email, phone)?;
        let pending = self.otp.verify_signup_code(&contact, code, Utc::now()).await?;
        let identity = self.provisioner.finalize(pending).await?;
        let token = self.generate_token(identity.id)?;
        Ok(Session { identity, token })
    }

    pub async fn request_signin_code(
        &self,
        email: Option<&str>,
        phone: Option<&str>,
    ) -> Result<CodeSent, AppError> {
        let contact = Contact::from_parts(email, phone)?;
        let identity = self.find_account(&contact).await?;
        self.otp
            .request_signin_code(&contact, Some(&identity.display_name), Utc::now())
            .await?;
        info!(user_id = %identity.id, "Sign-in code sent");
        Ok(CodeSent { contact, expires_in: self.otp.ttl() })
    }

    pub async fn verify_signin_code(
        &self,
        email: Option<&str>,
        phone: Option<&str>,
        code: &str,
    ) -> Result<Session, AppError> {
        if code.trim().is_empty() {
            return Err(AppError::ValidationError("Missing required fields".into()));
        }
        let contact = Contact::from_parts(email, phone)?;
        self.otp.verify_signin_code(&contact, code, Utc::now()).await?;
        let identity = self.find_account(&contact).await?;
        let token = self.generate_token(identity.id)?;
        info!(user_id = %identity.id, "Signed in with code");
        Ok(Session { identity, token })
    }

    pub async fn sign_in_with_password(
        &self,
        email_or_phone: &str,
        password: &str,
    ) -> Result<Session, AppError> {
        if email_or_phone.trim().is_empty() || password.is_empty() {
            return Err(AppError::ValidationError("Please enter your credentials".into()));
        }
        let contact = Contact::parse(email_or_phone).map_err(|_| AppError::InvalidCredentials)?;
        let identity = self
            .identities
            .find_by_principal(&contact.principal())
            .await?
            .ok_or(AppError::InvalidCredentials)?;

        if !verify_password(password, &identity.password_hash)? {
            warn!(user_id = %identity.id, "Password sign-in rejected");
            return Err(AppError::InvalidCredentials);
        }

        let token = self.generate_token(identity.id)?;
        Ok(Session { identity, token })
    }

    /// Resolves a bearer token to the current state of its identity.
    pub async fn validate_token(&self, token: &str) -> Result<Identity, AppError> {
        let claims = self.decode_token(token)?;
        let id = Uuid::parse_str(&claims.sub)
            .map_err(|_| AppError::Unauthorized("Invalid token subject".into()))?;
        self.identities
            .find_by_id(id)
            .await?
            .ok_or_else(|| AppError::Unauthorized("User not found".into()))
    }

    pub async fn sweep_expired(&self) -> Result<u64, AppError> {
        self.otp.sweep_expired(Utc::now()).await
    }

    async fn find_account(&self, contact: &Contact) -> Result<Identity, AppError> {
        self.identities
            .find_by_principal(&contact.principal())
            .await?
            .ok_or_else(|| AppError::NotFound("No account found for this contact. Please sign up first.".into()))
    }

    fn generate_token(&self, user_id: Uuid) -> Result<String, AppError> {
        let now = Utc::now();
        let claims = Claims {
            sub: user_id.to_string(),
            exp: (now + self.token_expiry).timestamp(),
            iat: now.timestamp(),
        };

        let token = encode(
            &Header::default(),
            &claims,
            &EncodingKey::from_secret(self.jwt_secret.as_bytes()),
        )?;

        Ok(token)
    }

    fn decode_token(&self, token: &str) -> Result<Claims, AppError> {
        let claims = decode::<Claims>(
            token,
            &DecodingKey::from_secret(self.jwt_secret.as_bytes()),
            &Validation::new(Algorithm::HS256),
        )?;

        Ok(claims.claims)
    }
}
