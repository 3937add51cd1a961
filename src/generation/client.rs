use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use serde_json::json;
use std::time::Duration;
use tracing::{error, info};
use url::Url;

use crate::config::GenerationConfig;
use crate::error::AppError;

/// The upstream text model. Returns the raw model text for a prompt.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ContentGenerator: Send + Sync {
    async fn complete(&self, prompt: &str) -> Result<String, AppError>;
}

/// Client for a Gemini-style `models/{model}:generateContent` endpoint.
#[derive(Clone)]
pub struct GeminiClient {
    client: Client,
    endpoint: Url,
    temperature: f32,
    max_output_tokens: u32,
}

#[derive(Deserialize)]
struct GenerateResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
}

#[derive(Deserialize)]
struct Candidate {
    content: Option<CandidateContent>,
}

#[derive(Deserialize)]
struct CandidateContent {
    #[serde(default)]
    parts: Vec<Part>,
}

#[derive(Deserialize)]
struct Part {
    text: Option<String>,
}

impl GeminiClient {
    pub fn new(config: &GenerationConfig) -> Result<Self, AppError> {
        let base = format!(
            "{}/models/{}:generateContent",
            config.api_base.trim_end_matches('/'),
            config.model
        );
        let endpoint = Url::parse_with_params(&base, &[("key", config.api_key.as_str())])
            .map_err(|e| AppError::ConfigError(format!("generation endpoint: {}", e)))?;

        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| AppError::ConfigError(format!("generation client: {}", e)))?;

        Ok(Self {
            client,
            endpoint,
            temperature: config.temperature,
            max_output_tokens: config.max_output_tokens,
        })
    }
}

#[async_trait]
impl ContentGenerator for GeminiClient {
    async fn complete(&self, prompt: &str) -> Result<String, AppError> {
        let body = json!({
            "contents": [{ "parts": [{ "text": prompt }] }],
            "generationConfig": {
                "temperature": self.temperature,
                "topK": 1,
                "topP": 1,
                "maxOutputTokens": self.max_output_tokens,
            }
        });

        let response = self.client.post(self.endpoint.clone()).json(&body).send().await?;
        let status = response.status();
        let text = response.text().await?;

        if !status.is_success() {
            error!(status = status.as_u16(), body = %text, "Generation API error");
            return Err(AppError::UpstreamFailure(format!("generation API returned {}", status)));
        }

        let parsed: GenerateResponse = serde_json::from_str(&text).map_err(|e| {
            error!(body = %text, "Generation API returned malformed JSON");
            AppError::InvalidUpstreamResponse(e.to_string())
        })?;

        let generated = parsed
            .candidates
            .into_iter()
            .next()
            .and_then(|c| c.content)
            .and_then(|c| c.parts.into_iter().next())
            .and_then(|p| p.text);

        match generated {
            Some(text) => {
                info!(chars = text.len(), "Generation API responded");
                Ok(text)
            }
            None => {
                error!(body = %text, "Invalid response structure from generation API");
                Err(AppError::InvalidUpstreamResponse("missing candidate text".into()))
            }
        }
    }
}
