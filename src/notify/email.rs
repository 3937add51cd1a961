use async_trait::async_trait;
use reqwest::Client;
use serde::Serialize;
use std::time::Duration;
use tracing::{error, info};

use crate::config::EmailConfig;
use crate::error::AppError;
use crate::notify::{EmailMessage, EmailSender};

/// Sends mail through a Resend-compatible `POST /emails` API.
#[derive(Clone)]
pub struct ResendClient {
    client: Client,
    api_base: String,
    api_key: String,
    from: String,
}

#[derive(Serialize)]
struct SendEmailBody<'a> {
    from: &'a str,
    to: [&'a str; 1],
    subject: &'a str,
    html: &'a str,
}

impl ResendClient {
    pub fn new(config: &EmailConfig) -> Result<Self, AppError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| AppError::ConfigError(format!("email client: {}", e)))?;

        Ok(Self {
            client,
            api_base: config.api_base.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone(),
            from: config.from.clone(),
        })
    }
}

#[async_trait]
impl EmailSender for ResendClient {
    async fn send_email(&self, message: &EmailMessage) -> Result<(), AppError> {
        let response = self
            .client
            .post(format!("{}/emails", self.api_base))
            .bearer_auth(&self.api_key)
            .json(&SendEmailBody {
                from: &self.from,
                to: [&message.to],
                subject: &message.subject,
                html: &message.body_html,
            })
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            error!(status = status.as_u16(), body = %body, "Email provider rejected message");
            return Err(AppError::UpstreamFailure(format!("email provider returned {}", status)));
        }

        info!("Email dispatched");
        Ok(())
    }
}
