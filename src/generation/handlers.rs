use actix_web::{http::header, web, HttpRequest, HttpResponse};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

use crate::db::Tier;
use crate::error::AppError;
use crate::generation::content::GenerationSettings;
use crate::usage::{Caller, Remaining};
use crate::AppState;

pub const CLIENT_TOKEN_HEADER: &str = "X-Client-Token";

#[derive(Debug, Deserialize)]
pub struct GenerateRequest {
    #[serde(default)]
    pub description: String,
    pub settings: Option<GenerationSettings>,
}

#[derive(Debug, Serialize)]
pub struct UsageResponse {
    pub remaining: Remaining,
    pub tier: Tier,
    pub verified: bool,
}

/// Bearer token first, then the anonymous device token.
pub async fn resolve_caller(req: &HttpRequest, state: &AppState) -> Result<Caller, AppError> {
    if let Some(value) = req.headers().get(header::AUTHORIZATION) {
        let value = value
            .to_str()
            .map_err(|_| AppError::Unauthorized("Malformed authorization header".into()))?;
        let token = value
            .strip_prefix("Bearer ")
            .ok_or_else(|| AppError::Unauthorized("Expected a bearer token".into()))?;
        let identity = state.auth_service.validate_token(token.trim()).await?;
        return Ok(Caller::account(&identity));
    }

    match req.headers().get(CLIENT_TOKEN_HEADER).and_then(|v| v.to_str().ok()) {
        Some(device_token) => Caller::anonymous(device_token),
        None => Err(AppError::ValidationError(
            "Sign in or provide a client token".into(),
        )),
    }
}

pub async fn generate(
    req: HttpRequest,
    body: web::Json<GenerateRequest>,
    state: web::Data<AppState>,
) -> Result<HttpResponse, AppError> {
    let caller = resolve_caller(&req, &state).await?;
    let GenerateRequest { description, settings } = body.into_inner();

    match state.orchestrator.generate(&caller, &description, settings).await {
        Ok(outcome) => {
            info!(user_id = ?caller.user_id(), "Generation served");
            Ok(HttpResponse::Ok().json(outcome))
        }
        Err(AppError::QuotaExceeded) => {
            info!(user_id = ?caller.user_id(), "Generation refused, quota exhausted");
            Err(AppError::QuotaExceeded)
        }
        Err(e @ AppError::ValidationError(_)) => {
            warn!("Generation request rejected: {}", e);
            Err(e)
        }
        Err(e) => {
            error!("Generation failed: {}", e);
            Err(e)
        }
    }
}

pub async fn usage(req: HttpRequest, state: web::Data<AppState>) -> Result<HttpResponse, AppError> {
    let caller = resolve_caller(&req, &state).await?;
    let remaining = state.orchestrator.usage().remaining(&caller, Utc::now()).await?;
    let verified = matches!(caller, Caller::Account { verified: true, .. });

    Ok(HttpResponse::Ok().json(UsageResponse {
        remaining,
        tier: caller.tier(),
        verified,
    }))
}
