/// Authentication Routes
///
/// Registration, login, token refresh and the purpose-token driven account
/// flows (email verification, forgotten and reset passwords).

use actix_web::{http::header, web, HttpRequest, HttpResponse};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::AppError;
use crate::session_manager::{AuthSessionManager, Registration};

#[derive(Deserialize)]
pub struct LoginRequest {
    pub email: String,
    pub password: String,
    /// Falls back to the User-Agent header
    pub device: Option<String>,
}

#[derive(Deserialize)]
pub struct RefreshRequest {
    pub token_type: String,
    pub access_token: String,
}

#[derive(Deserialize)]
pub struct VerifyEmailRequest {
    pub token: String,
}

#[derive(Deserialize)]
pub struct ForgotPasswordRequest {
    pub email: String,
}

#[derive(Deserialize)]
pub struct ResetPasswordRequest {
    pub token: String,
    pub new_password: String,
    #[serde(default)]
    pub logout_all: bool,
}

#[derive(Serialize)]
pub struct RegisteredUser {
    pub id: Uuid,
    pub email: String,
    pub username: String,
    pub created_at: String,
}

/// POST /auth/register
///
/// # Errors
/// - 400: Validation errors (email, username, password policy)
/// - 409: Email or username already taken
/// - 502/503: Default role could not be assigned (the account still exists)
pub async fn register(
    form: web::Json<Registration>,
    manager: web::Data<AuthSessionManager>,
) -> Result<HttpResponse, AppError> {
    let user = manager.register(&form).await?;

    Ok(HttpResponse::Created().json(RegisteredUser {
        id: user.id,
        email: user.email,
        username: user.username,
        created_at: user.created_at.to_rfc3339(),
    }))
}

/// POST /auth/login
///
/// Unknown email and wrong password share one error so accounts cannot be
/// enumerated.
pub async fn login(
    req: HttpRequest,
    form: web::Json<LoginRequest>,
    manager: web::Data<AuthSessionManager>,
) -> Result<HttpResponse, AppError> {
    let device = form
        .device
        .clone()
        .or_else(|| {
            req.headers()
                .get(header::USER_AGENT)
                .and_then(|ua| ua.to_str().ok())
                .map(str::to_string)
        })
        .unwrap_or_default();

    let grant = manager.login(&form.email, &form.password, &device).await?;
    Ok(HttpResponse::Ok().json(grant))
}

/// POST /auth/refresh
pub async fn refresh(
    form: web::Json<RefreshRequest>,
    manager: web::Data<AuthSessionManager>,
) -> Result<HttpResponse, AppError> {
    let grant = manager
        .refresh_token(&form.token_type, &form.access_token)
        .await?;
    Ok(HttpResponse::Ok().json(grant))
}

/// POST /auth/verify-email
pub async fn verify_email(
    form: web::Json<VerifyEmailRequest>,
    manager: web::Data<AuthSessionManager>,
) -> Result<HttpResponse, AppError> {
    let user_id = manager.verify_email(&form.token).await?;
    Ok(HttpResponse::Ok().json(serde_json::json!({ "user_id": user_id, "email_verified": true })))
}

/// POST /auth/forgot-password
///
/// Always 202 for well-formed emails, known or not.
pub async fn forgot_password(
    form: web::Json<ForgotPasswordRequest>,
    manager: web::Data<AuthSessionManager>,
) -> Result<HttpResponse, AppError> {
    manager.forgot_password(&form.email).await?;
    Ok(HttpResponse::Accepted().finish())
}

/// POST /auth/reset-password
pub async fn reset_password(
    form: web::Json<ResetPasswordRequest>,
    manager: web::Data<AuthSessionManager>,
) -> Result<HttpResponse, AppError> {
    manager
        .reset_password(&form.token, &form.new_password, form.logout_all)
        .await?;
    Ok(HttpResponse::NoContent().finish())
}
