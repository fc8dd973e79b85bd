/// Credential (session) management for a user
///
/// All routes act on `{id}`; acting on someone else needs the matching
/// "-other" permission in the caller's access token.

use actix_web::{web, HttpResponse};
use serde::Deserialize;
use uuid::Uuid;

use crate::auth::Caller;
use crate::error::AppError;
use crate::session_manager::AuthSessionManager;

#[derive(Deserialize, Default)]
pub struct LogoutRequest {
    #[serde(default)]
    pub credential_ids: Vec<Uuid>,
}

/// GET /api/users/{id}/credentials
pub async fn get_credentials(
    caller: Caller,
    path: web::Path<Uuid>,
    manager: web::Data<AuthSessionManager>,
) -> Result<HttpResponse, AppError> {
    let credentials = manager.get_credentials(&caller, path.into_inner()).await?;
    Ok(HttpResponse::Ok().json(credentials))
}

/// POST /api/users/{id}/logout
///
/// An empty body or empty id list ends the caller's current session.
pub async fn logout(
    caller: Caller,
    path: web::Path<Uuid>,
    body: Option<web::Json<LogoutRequest>>,
    manager: web::Data<AuthSessionManager>,
) -> Result<HttpResponse, AppError> {
    let ids = body.map(|b| b.into_inner().credential_ids).unwrap_or_default();
    let removed = manager.logout(&caller, path.into_inner(), &ids).await?;
    Ok(HttpResponse::Ok().json(serde_json::json!({ "removed": removed })))
}

/// POST /api/users/{id}/logout-all
pub async fn logout_all(
    caller: Caller,
    path: web::Path<Uuid>,
    manager: web::Data<AuthSessionManager>,
) -> Result<HttpResponse, AppError> {
    let removed = manager.logout_all(&caller, path.into_inner()).await?;
    Ok(HttpResponse::Ok().json(serde_json::json!({ "removed": removed })))
}

/// DELETE /api/users/{id}
pub async fn delete_account(
    caller: Caller,
    path: web::Path<Uuid>,
    manager: web::Data<AuthSessionManager>,
) -> Result<HttpResponse, AppError> {
    manager.delete_account(&caller, path.into_inner()).await?;
    Ok(HttpResponse::NoContent().finish())
}
