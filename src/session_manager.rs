/// Authentication session lifecycle
///
/// Login, registration, refresh and logout on top of the session store,
/// the purpose token service and the role/mail/user collaborators.
///
/// Anti-replay: a session stores the `jti` of the one access token allowed
/// to refresh it. Each refresh mints a new access token and moves the
/// binding, so an older access token can no longer be used to refresh even
/// while it is still valid for ordinary API calls.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;
use uuid::Uuid;

use crate::auth::{
    check_password_policy, hash_password, verify_password, Caller, Capability, ClaimRole,
    TokenIssuer,
};
use crate::clients::{MailClient, NewUser, RoleClient, User, UserRepository};
use crate::error::{AppError, AuthError, RepositoryError};
use crate::purpose_token::{PurposeTokenService, TokenUsage};
use crate::store::{hash_token, Session, SessionPatch, SessionStore};
use crate::validators::{is_valid_display_name, is_valid_email, is_valid_username, normalize_device};

pub const TOKEN_TYPE: &str = "bearer";

/// Access token handed to a client after login or refresh
#[derive(Debug, Clone, Serialize)]
pub struct AccessGrant {
    pub access_token: String,
    pub token_type: String,
    /// Seconds until the access token expires
    pub expires_in: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Registration {
    pub email: String,
    pub username: String,
    pub password: String,
    pub display_name: Option<String>,
}

/// One session as shown in a credential listing
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct CredentialSummary {
    pub id: Uuid,
    pub device: String,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    /// The session the caller is using right now
    pub current: bool,
}

pub struct AuthSessionManager {
    sessions: Arc<dyn SessionStore>,
    tokens: PurposeTokenService,
    users: Arc<dyn UserRepository>,
    roles: Arc<dyn RoleClient>,
    mail: Arc<dyn MailClient>,
    issuer: TokenIssuer,
}

impl AuthSessionManager {
    pub fn new(
        sessions: Arc<dyn SessionStore>,
        tokens: PurposeTokenService,
        users: Arc<dyn UserRepository>,
        roles: Arc<dyn RoleClient>,
        mail: Arc<dyn MailClient>,
        issuer: TokenIssuer,
    ) -> Self {
        Self {
            sessions,
            tokens,
            users,
            roles,
            mail,
            issuer,
        }
    }

    pub fn tokens(&self) -> &PurposeTokenService {
        &self.tokens
    }

    pub fn issuer(&self) -> &TokenIssuer {
        &self.issuer
    }

    /// Authenticate by email and password and open a new session for `device`
    ///
    /// # Errors
    /// - `InvalidCredentials` for an unknown email or a wrong password
    /// - `AccountBanned` for a banned account
    /// - `ExternalError` if roles cannot be fetched
    #[tracing::instrument(name = "auth.login", skip(self, password))]
    pub async fn login(&self, email: &str, password: &str, device: &str) -> Result<AccessGrant, AppError> {
        let device = normalize_device(device)?;
        let user = match self.find_user_by_email(email).await? {
            Some(user) => user,
            None => return Err(AuthError::InvalidCredentials.into()),
        };

        if !verify_password(password, &user.password_hash)? {
            tracing::info!(user_id = %user.id, "Login rejected: wrong password");
            return Err(AuthError::InvalidCredentials.into());
        }
        if user.is_banned {
            tracing::info!(user_id = %user.id, "Login rejected: account banned");
            return Err(AuthError::AccountBanned.into());
        }

        let roles = self.claim_roles(user.id).await?;

        let now = Utc::now();
        let session_id = Uuid::new_v4();
        let pair = self.issuer.mint_pair(session_id, user.id, &user.username, roles)?;
        let session = Session {
            id: session_id,
            user_id: user.id,
            access_token_id: pair.access.claims.jti,
            device,
            refresh_token_hash: hash_token(&pair.refresh.token),
            created_at: now,
            expires_at: now + Duration::seconds(self.issuer.refresh_token_expiry()),
        };
        self.sessions.create(&session).await?;

        tracing::info!(
            user_id = %user.id,
            session_id = %session_id,
            device = %session.device,
            "Session opened"
        );
        Ok(self.grant(pair.access.token))
    }

    /// Create the user and profile, assign the default role and send a
    /// verification email. Only the first two steps can fail the call.
    #[tracing::instrument(
        name = "auth.register",
        skip(self, registration),
        fields(email = %registration.email, username = %registration.username)
    )]
    pub async fn register(&self, registration: &Registration) -> Result<User, AppError> {
        let email = is_valid_email(&registration.email)?;
        let username = is_valid_username(&registration.username)?;
        let display_name = match &registration.display_name {
            Some(name) => is_valid_display_name(name)?,
            None => username.clone(),
        };
        let password_hash = hash_password(&registration.password)?;

        let user = self
            .users
            .create(&NewUser {
                email,
                username,
                password_hash,
                display_name,
            })
            .await?;
        tracing::info!(user_id = %user.id, "User created");

        // no rollback: the user row stays when role assignment fails
        self.roles.set_user_as_default(user.id).await?;

        self.send_verification(&user).await;
        Ok(user)
    }

    /// Exchange the session's current access token for a new one
    ///
    /// The presented token may be expired, but its `jti` must still be the
    /// one bound to its session.
    #[tracing::instrument(name = "auth.refresh_token", skip(self, access_token))]
    pub async fn refresh_token(&self, token_type: &str, access_token: &str) -> Result<AccessGrant, AppError> {
        if !token_type.eq_ignore_ascii_case(TOKEN_TYPE) {
            return Err(AuthError::DifferentScheme.into());
        }
        let claims = self.issuer.parse_access_allow_expired(access_token)?;

        let session = self
            .sessions
            .find(claims.cid)
            .await?
            .ok_or(AuthError::RefreshTokenNotFound)?;

        if session.user_id != claims.uid || session.access_token_id != claims.jti {
            tracing::warn!(
                session_id = %session.id,
                presented_jti = %claims.jti,
                "Refresh with an access token not bound to its session"
            );
            return Err(AuthError::BadRelation.into());
        }

        let user = match self.users.find_by_ids(&[claims.uid]).await?.into_iter().next() {
            Some(user) => user,
            None => {
                tracing::warn!(
                    session_id = %session.id,
                    user_id = %claims.uid,
                    "Pruning session of a deleted user"
                );
                if let Err(e) = self.sessions.delete(&[session.id]).await {
                    tracing::warn!(session_id = %session.id, error = %e, "Failed to prune orphaned session");
                }
                return Err(AuthError::TokenBelongToNothing.into());
            }
        };

        let roles = self.claim_roles(user.id).await?;
        let minted = self.issuer.mint_access(session.id, user.id, &user.username, roles)?;
        let patch = SessionPatch::new(session.id)
            .if_access_token_id(claims.jti)
            .access_token_id(minted.claims.jti);
        match self.sessions.patch(&patch).await {
            Ok(()) => {}
            Err(RepositoryError::Conflict(_)) => {
                tracing::warn!(
                    session_id = %session.id,
                    presented_jti = %claims.jti,
                    "Refresh lost to a concurrent refresh of the same token"
                );
                return Err(AuthError::BadRelation.into());
            }
            Err(RepositoryError::NotFound(_)) => return Err(AuthError::RefreshTokenNotFound.into()),
            Err(e) => return Err(e.into()),
        }

        tracing::info!(user_id = %user.id, session_id = %session.id, "Access token refreshed");
        Ok(self.grant(minted.token))
    }

    #[tracing::instrument(name = "auth.get_credentials", skip(self, caller), fields(caller = %caller.user_id))]
    pub async fn get_credentials(&self, caller: &Caller, user_id: Uuid) -> Result<Vec<CredentialSummary>, AppError> {
        caller.authorize_self_or(user_id, Capability::GetOtherCredentials)?;

        let sessions = self.sessions.find_by_user_id(user_id).await?;
        Ok(sessions
            .into_iter()
            .map(|session| CredentialSummary {
                current: session.id == caller.session_id,
                id: session.id,
                device: session.device,
                created_at: session.created_at,
                expires_at: session.expires_at,
            })
            .collect())
    }

    /// End sessions of `user_id`
    ///
    /// On self with no ids, ends the caller's current session. On self with
    /// ids, ends only those belonging to the caller. On another user, ends
    /// exactly the given ids. Returns how many sessions were removed.
    #[tracing::instrument(name = "auth.logout", skip(self, caller), fields(caller = %caller.user_id))]
    pub async fn logout(&self, caller: &Caller, user_id: Uuid, credential_ids: &[Uuid]) -> Result<usize, AppError> {
        caller.authorize_self_or(user_id, Capability::LogoutOther)?;

        let targets: Vec<Uuid> = if !caller.is_self(user_id) {
            credential_ids.to_vec()
        } else if credential_ids.is_empty() {
            vec![caller.session_id]
        } else {
            let owned: HashSet<Uuid> = self
                .sessions
                .find_by_user_id(user_id)
                .await?
                .into_iter()
                .map(|session| session.id)
                .collect();
            credential_ids
                .iter()
                .copied()
                .filter(|id| owned.contains(id))
                .collect()
        };

        if targets.is_empty() {
            return Ok(0);
        }
        let removed = self.sessions.delete(&targets).await?;
        tracing::info!(user_id = %user_id, removed = removed, "Sessions logged out");
        Ok(removed)
    }

    #[tracing::instrument(name = "auth.logout_all", skip(self, caller), fields(caller = %caller.user_id))]
    pub async fn logout_all(&self, caller: &Caller, user_id: Uuid) -> Result<usize, AppError> {
        caller.authorize_self_or(user_id, Capability::LogoutAllOther)?;

        let removed = self.sessions.delete_by_user_id(user_id).await?;
        tracing::info!(user_id = %user_id, removed = removed, "All sessions logged out");
        Ok(removed)
    }

    /// Consume an email-verification token and mark its owner verified
    #[tracing::instrument(name = "auth.verify_email", skip(self, token))]
    pub async fn verify_email(&self, token: &str) -> Result<Uuid, AppError> {
        let user_id = self.tokens.verify(token, TokenUsage::EmailVerification).await?;
        self.users
            .mark_email_verified(user_id)
            .await
            .map_err(orphaned_token)?;

        tracing::info!(user_id = %user_id, "Email verified");
        Ok(user_id)
    }

    /// Send a reset-password token. Unknown emails succeed silently.
    #[tracing::instrument(name = "auth.forgot_password", skip(self))]
    pub async fn forgot_password(&self, email: &str) -> Result<(), AppError> {
        let user = match self.find_user_by_email(email).await? {
            Some(user) => user,
            None => {
                tracing::info!("Password reset requested for an unknown email");
                return Ok(());
            }
        };

        let token = self.tokens.request(user.id, TokenUsage::ResetPassword).await?;
        self.mail.send_forgot_password(&user.email, token.token()).await?;
        Ok(())
    }

    /// Consume a reset-password token and set a new password. With
    /// `logout_all`, every session of the user is ended as well.
    ///
    /// The password policy is checked before the token is consumed.
    #[tracing::instrument(name = "auth.reset_password", skip(self, token, new_password))]
    pub async fn reset_password(&self, token: &str, new_password: &str, logout_all: bool) -> Result<(), AppError> {
        check_password_policy(new_password)?;

        let user_id = self.tokens.verify(token, TokenUsage::ResetPassword).await?;
        let password_hash = hash_password(new_password)?;
        self.users
            .update_password(user_id, &password_hash)
            .await
            .map_err(orphaned_token)?;
        tracing::info!(user_id = %user_id, "Password reset");

        if logout_all {
            let removed = self.sessions.delete_by_user_id(user_id).await?;
            tracing::info!(user_id = %user_id, removed = removed, "Sessions ended after password reset");
        }
        Ok(())
    }

    /// Delete the user, their sessions and their role assignments.
    /// Role removal failures are traced only, since the user is already gone.
    #[tracing::instrument(name = "auth.delete_account", skip(self, caller), fields(caller = %caller.user_id))]
    pub async fn delete_account(&self, caller: &Caller, user_id: Uuid) -> Result<(), AppError> {
        caller.authorize_self_or(user_id, Capability::DeleteOtherUser)?;

        if !self.users.delete(user_id).await? {
            return Err(RepositoryError::NotFound(format!("user {}", user_id)).into());
        }
        let removed = self.sessions.delete_by_user_id(user_id).await?;

        if let Err(e) = self.roles.remove_user_roles(user_id).await {
            tracing::warn!(user_id = %user_id, error = %e, "Failed to remove roles of deleted user");
        }

        tracing::info!(user_id = %user_id, sessions = removed, "Account deleted");
        Ok(())
    }

    async fn find_user_by_email(&self, email: &str) -> Result<Option<User>, AppError> {
        let email = is_valid_email(email)?;
        Ok(self.users.find_by_emails(&[email]).await?.into_iter().next())
    }

    async fn claim_roles(&self, user_id: Uuid) -> Result<Vec<ClaimRole>, AppError> {
        let roles = self.roles.get_user_roles(user_id).await?;
        Ok(roles.iter().map(ClaimRole::from).collect())
    }

    async fn send_verification(&self, user: &User) {
        let token = match self.tokens.request(user.id, TokenUsage::EmailVerification).await {
            Ok(token) => token,
            Err(e) => {
                tracing::warn!(user_id = %user.id, error = %e, "Verification token not issued");
                return;
            }
        };
        if let Err(e) = self.mail.send_email_verification(&user.email, token.token()).await {
            tracing::warn!(user_id = %user.id, error = %e, "Verification email not sent");
        }
    }

    fn grant(&self, access_token: String) -> AccessGrant {
        AccessGrant {
            access_token,
            token_type: TOKEN_TYPE.to_string(),
            expires_in: self.issuer.access_token_expiry(),
        }
    }
}

/// A consumed token whose owner no longer exists
fn orphaned_token(err: RepositoryError) -> AppError {
    match err {
        RepositoryError::NotFound(_) => AuthError::TokenBelongToNothing.into(),
        other => other.into(),
    }
}
