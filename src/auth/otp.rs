use chrono::{DateTime, Duration, Utc};
use rand::Rng;
use std::sync::Arc;
use tracing::{info, warn};

use crate::auth::pending::PendingRegistrations;
use crate::auth::Contact;
use crate::db::{PendingRegistration, SigninCode, SigninCodeStore};
use crate::error::AppError;
use crate::notify::{EmailMessage, EmailSender, SmsMessage, SmsSender};

/// Six-digit numeric code drawn uniformly from 100000..=999999.
pub fn generate_code() -> String {
    rand::thread_rng().gen_range(100_000..=999_999).to_string()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CodePurpose {
    Signup,
    Signin,
}

/// Routes a code to the channel matching the contact.
#[derive(Clone)]
pub struct OtpDispatcher {
    email: Arc<dyn EmailSender>,
    sms: Arc<dyn SmsSender>,
}

impl OtpDispatcher {
    pub fn new(email: Arc<dyn EmailSender>, sms: Arc<dyn SmsSender>) -> Self {
        Self { email, sms }
    }

    pub async fn dispatch(
        &self,
        contact: &Contact,
        code: &str,
        recipient_name: Option<&str>,
        purpose: CodePurpose,
        ttl: Duration,
    ) -> Result<(), AppError> {
        let minutes = ttl.num_minutes();
        match contact {
            Contact::Email(address) => {
                self.email
                    .send_email(&email_message(address, code, recipient_name, purpose, minutes))
                    .await
            }
            Contact::Phone(number) => {
                self.sms
                    .send_sms(&SmsMessage {
                        to: number.clone(),
                        body: format!(
                            "Your PopMitra verification code is: {}. This code will expire in {} minutes.",
                            code, minutes
                        ),
                    })
                    .await
            }
        }
    }
}

fn email_message(
    to: &str,
    code: &str,
    recipient_name: Option<&str>,
    purpose: CodePurpose,
    minutes: i64,
) -> EmailMessage {
    let (subject, heading, intro) = match purpose {
        CodePurpose::Signup => (
            "Verify Your PopMitra Account",
            "Welcome to PopMitra!",
            "Thank you for signing up! Use the verification code below to complete your registration:",
        ),
        CodePurpose::Signin => (
            "Your PopMitra sign-in code",
            "Sign in to PopMitra",
            "Use the code below to sign in to your account:",
        ),
    };
    let greeting = recipient_name
        .map(|name| format!("<p style=\"font-size: 16px; color: #666;\">Hi {},</p>", escape_html(name)))
        .unwrap_or_default();

    EmailMessage {
        to: to.to_string(),
        subject: subject.to_string(),
        body_html: format!(
            r#"<div style="font-family: Arial, sans-serif; max-width: 600px; margin: 0 auto;">
  <h1 style="color: #333;">{heading}</h1>
  {greeting}
  <p style="font-size: 16px; color: #666;">{intro}</p>
  <div style="background-color: #f4f4f4; padding: 20px; text-align: center; margin: 30px 0; border-radius: 8px;">
    <h2 style="color: #333; font-size: 32px; letter-spacing: 8px; margin: 0;">{code}</h2>
  </div>
  <p style="font-size: 14px; color: #999;">This code will expire in {minutes} minutes.</p>
  <p style="font-size: 14px; color: #999;">If you didn't request this code, please ignore this email.</p>
</div>"#
        ),
    }
}

fn escape_html(value: &str) -> String {
    value
        .replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}

/// Issues and checks one-time codes for both signup and sign-in.
///
/// Signup codes live on the pending registration; sign-in codes live in
/// their own store. Both are single use and expire after the same TTL.
#[derive(Clone)]
pub struct OtpService {
    pending: PendingRegistrations,
    signin_codes: Arc<dyn SigninCodeStore>,
    dispatcher: OtpDispatcher,
}

impl OtpService {
    pub fn new(
        pending: PendingRegistrations,
        signin_codes: Arc<dyn SigninCodeStore>,
        dispatcher: OtpDispatcher,
    ) -> Self {
        Self { pending, signin_codes, dispatcher }
    }

    pub fn ttl(&self) -> Duration {
        self.pending.ttl()
    }

    pub fn pending(&self) -> &PendingRegistrations {
        &self.pending
    }

    /// Creates the pending registration and sends its code.
    pub async fn request_signup_code(
        &self,
        full_name: &str,
        contact: &Contact,
        password_hash: &str,
        now: DateTime<Utc>,
    ) -> Result<PendingRegistration, AppError> {
        let pending = self
            .pending
            .create_pending(full_name, contact, password_hash, now)
            .await?;
        self.send_pending(&pending).await?;
        Ok(pending)
    }

    /// Supersedes the active registration with a new code.
    pub async fn resend_signup_code(
        &self,
        contact: &Contact,
        now: DateTime<Utc>,
    ) -> Result<PendingRegistration, AppError> {
        let pending = self
            .pending
            .reissue(contact, now)
            .await?
            .ok_or(AppError::InvalidOrExpired)?;
        self.send_pending(&pending).await?;
        Ok(pending)
    }

    pub async fn verify_signup_code(
        &self,
        contact: &Contact,
        code: &str,
        now: DateTime<Utc>,
    ) -> Result<PendingRegistration, AppError> {
        let swept = self.pending.sweep_expired(now).await?;
        if swept > 0 {
            info!(swept, "Removed expired pending registrations");
        }

        let code = code.trim();
        if !is_well_formed(code) {
            return Err(AppError::InvalidOrExpired);
        }

        match self.pending.take_by_contact_and_otp(contact, code, now).await? {
            Some(pending) => Ok(pending),
            None => {
                warn!(contact_type = contact.contact_type().as_str(), "Signup code rejected");
                Err(AppError::InvalidOrExpired)
            }
        }
    }

    pub async fn request_signin_code(
        &self,
        contact: &Contact,
        recipient_name: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<(), AppError> {
        let code = SigninCode {
            contact: contact.clone(),
            code: generate_code(),
            created_at: now,
            expires_at: now + self.ttl(),
        };
        self.signin_codes.replace_code(&code).await?;
        self.dispatcher
            .dispatch(contact, &code.code, recipient_name, CodePurpose::Signin, self.ttl())
            .await
    }

    pub async fn verify_signin_code(
        &self,
        contact: &Contact,
        code: &str,
        now: DateTime<Utc>,
    ) -> Result<(), AppError> {
        let code = code.trim();
        if !is_well_formed(code) {
            return Err(AppError::InvalidOrExpired);
        }
        match self.signin_codes.take_code(contact, code, now).await? {
            Some(_) => Ok(()),
            None => {
                warn!(contact_type = contact.contact_type().as_str(), "Sign-in code rejected");
                Err(AppError::InvalidOrExpired)
            }
        }
    }

    pub async fn sweep_expired(&self, now: DateTime<Utc>) -> Result<u64, AppError> {
        let (pending, codes) = futures::try_join!(
            self.pending.sweep_expired(now),
            self.signin_codes.sweep_expired(now)
        )?;
        Ok(pending + codes)
    }

    async fn send_pending(&self, pending: &PendingRegistration) -> Result<(), AppError> {
        let sent = self
            .dispatcher
            .dispatch(
                &pending.contact,
                &pending.otp,
                Some(&pending.full_name),
                CodePurpose::Signup,
                self.ttl(),
            )
            .await;

        if let Err(e) = sent {
            // An undelivered code must not stay redeemable.
            self.pending.delete_pending(pending.id).await?;
            return Err(e);
        }
        info!(contact_type = pending.contact.contact_type().as_str(), "Verification code sent");
        Ok(())
    }
}

fn is_well_formed(code: &str) -> bool {
    code.len() == 6 && code.chars().all(|c| c.is_ascii_digit())
}
