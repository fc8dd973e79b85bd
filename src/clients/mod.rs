/// Collaborator clients
///
/// Role and mail services over HTTP, each call wrapped in a
/// `ResilientClient`, and the PostgreSQL user repository.

mod mail;
mod role;
mod user;

pub use mail::{HttpMailClient, MailClient, EMAIL_VERIFICATION_TAG, FORGOT_PASSWORD_TAG};
pub use role::{HttpRoleClient, PermissionDto, RoleClient, RoleDto};
pub use user::{NewUser, PgUserRepository, User, UserRepository};

use crate::error::ExternalError;

/// Turn a non-2xx answer into `Rejected`, keeping the body for the log.
pub(crate) async fn ensure_success(
    service: &str,
    response: reqwest::Response,
) -> Result<reqwest::Response, ExternalError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(ExternalError::Rejected(service.to_string(), status.as_u16(), body))
}
