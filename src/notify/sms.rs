use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use std::time::Duration;
use tracing::{error, info};

use crate::config::SmsConfig;
use crate::error::AppError;
use crate::notify::{SmsMessage, SmsSender};

/// Sends text messages through the Twilio Messages API.
#[derive(Clone)]
pub struct TwilioClient {
    client: Client,
    api_base: String,
    account_sid: String,
    auth_token: String,
    from_number: String,
}

#[derive(Deserialize)]
struct MessageResponse {
    sid: Option<String>,
}

impl TwilioClient {
    pub fn new(config: &SmsConfig) -> Result<Self, AppError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| AppError::ConfigError(format!("sms client: {}", e)))?;

        Ok(Self {
            client,
            api_base: config.api_base.trim_end_matches('/').to_string(),
            account_sid: config.account_sid.clone(),
            auth_token: config.auth_token.clone(),
            from_number: config.from_number.clone(),
        })
    }
}

#[async_trait]
impl SmsSender for TwilioClient {
    async fn send_sms(&self, message: &SmsMessage) -> Result<(), AppError> {
        let url = format!("{}/Accounts/{}/Messages.json", self.api_base, self.account_sid);
        let form = [
            ("To", message.to.as_str()),
            ("From", self.from_number.as_str()),
            ("Body", message.body.as_str()),
        ];

        let response = self
            .client
            .post(url)
            .basic_auth(&self.account_sid, Some(&self.auth_token))
            .form(&form)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            error!(status = status.as_u16(), body = %body, "SMS provider rejected message");
            return Err(AppError::UpstreamFailure(format!("sms provider returned {}", status)));
        }

        let sid = response
            .json::<MessageResponse>()
            .await
            .ok()
            .and_then(|r| r.sid)
            .unwrap_or_default();
        info!(message_sid = %sid, "SMS dispatched");
        Ok(())
    }
}
