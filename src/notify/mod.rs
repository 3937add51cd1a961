//! Outbound notification channels used to deliver one-time codes.
//!
//! Delivery is fire-and-forget: a sender reports whether the provider
//! accepted the message and nothing more.

mod email;
mod sms;

use async_trait::async_trait;

use crate::error::AppError;

pub use email::ResendClient;
pub use sms::TwilioClient;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EmailMessage {
    pub to: String,
    pub subject: String,
    pub body_html: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SmsMessage {
    pub to: String,
    pub body: String,
}

#[async_trait]
pub trait EmailSender: Send + Sync {
    async fn send_email(&self, message: &EmailMessage) -> Result<(), AppError>;
}

#[async_trait]
pub trait SmsSender: Send + Sync {
    async fn send_sms(&self, message: &SmsMessage) -> Result<(), AppError>;
}
