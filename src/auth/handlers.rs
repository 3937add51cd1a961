use actix_web::{web, HttpResponse};
use serde::{Deserialize, Serialize};
use tracing::{error, info};
use uuid::Uuid;

use crate::auth::service::{CodeSent, Session};
use crate::db::Tier;
use crate::error::AppError;
use crate::AppState;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignupRequest {
    #[serde(default)]
    pub full_name: String,
    pub email: Option<String>,
    pub phone: Option<String>,
    #[serde(default)]
    pub password: String,
}

#[derive(Debug, Deserialize)]
pub struct ContactRequest {
    pub email: Option<String>,
    pub phone: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct VerifyRequest {
    pub email: Option<String>,
    pub phone: Option<String>,
    #[serde(default)]
    pub otp: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PasswordSigninRequest {
    #[serde(default)]
    pub email_or_phone: String,
    #[serde(default)]
    pub password: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CodeSentResponse {
    pub success: bool,
    pub message: String,
    pub expires_in: i64,
}

impl From<CodeSent> for CodeSentResponse {
    fn from(sent: CodeSent) -> Self {
        let channel = match sent.contact.contact_type() {
            crate::db::ContactType::Email => "email",
            crate::db::ContactType::Phone => "phone",
        };
        Self {
            success: true,
            message: format!("Verification code sent to {}", channel),
            expires_in: sent.expires_in.num_seconds(),
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionResponse {
    pub success: bool,
    pub message: String,
    pub user_id: Uuid,
    pub token: String,
    pub verified: bool,
    pub tier: Tier,
}

impl SessionResponse {
    fn new(session: Session, message: &str) -> Self {
        Self {
            success: true,
            message: message.to_string(),
            user_id: session.identity.id,
            token: session.token,
            verified: session.identity.verified,
            tier: session.identity.tier,
        }
    }
}

pub async fn signup(
    req: web::Json<SignupRequest>,
    state: web::Data<AppState>,
) -> Result<HttpResponse, AppError> {
    info!("Received signup request");
    match state
        .auth_service
        .signup(&req.full_name, req.email.as_deref(), req.phone.as_deref(), &req.password)
        .await
    {
        Ok(sent) => Ok(HttpResponse::Ok().json(CodeSentResponse::from(sent))),
        Err(e) => {
            error!("Signup failed: {}", e);
            Err(e)
        }
    }
}

pub async fn resend_signup_code(
    req: web::Json<ContactRequest>,
    state: web::Data<AppState>,
) -> Result<HttpResponse, AppError> {
    let sent = state
        .auth_service
        .resend_signup_code(req.email.as_deref(), req.phone.as_deref())
        .await?;
    Ok(HttpResponse::Ok().json(CodeSentResponse::from(sent)))
}

pub async fn verify_signup(
    req: web::Json<VerifyRequest>,
    state: web::Data<AppState>,
) -> Result<HttpResponse, AppError> {
    match state
        .auth_service
        .verify_signup(req.email.as_deref(), req.phone.as_deref(), &req.otp)
        .await
    {
        Ok(session) => {
            info!(user_id = %session.identity.id, "Signup verified");
            Ok(HttpResponse::Ok().json(SessionResponse::new(session, "Account verified successfully")))
        }
        Err(e) => {
            error!("Signup verification failed: {}", e);
            Err(e)
        }
    }
}

pub async fn request_signin_code(
    req: web::Json<ContactRequest>,
    state: web::Data<AppState>,
) -> Result<HttpResponse, AppError> {
    let sent = state
        .auth_service
        .request_signin_code(req.email.as_deref(), req.phone.as_deref())
        .await?;
    Ok(HttpResponse::Ok().json(CodeSentResponse::from(sent)))
}

pub async fn verify_signin_code(
    req: web::Json<VerifyRequest>,
    state: web::Data<AppState>,
) -> Result<HttpResponse, AppError> {
    let session = state
        .auth_service
        .verify_signin_code(req.email.as_deref(), req.phone.as_deref(), &req.otp)
        .await?;
    Ok(HttpResponse::Ok().json(SessionResponse::new(session, "Successfully signed in")))
}

pub async fn signin(
    req: web::Json<PasswordSigninRequest>,
    state: web::Data<AppState>,
) -> Result<HttpResponse, AppError> {
    let session = state
        .auth_service
        .sign_in_with_password(&req.email_or_phone, &req.password)
        .await?;
    let message = if session.identity.verified {
        "Successfully signed in"
    } else {
        "Account not verified. Please check your email or phone for the verification code."
    };
    Ok(HttpResponse::Ok().json(SessionResponse::new(session, message)))
}
