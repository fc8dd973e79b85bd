/// Purpose tokens
///
/// Short-lived, single-use opaque tokens bound to a user and scoped to one
/// usage (email verification, password reset, login challenge, general).
/// Consuming a token always burns it, whether or not it then passes the
/// usage and expiry checks.

use chrono::{DateTime, Duration, Utc};
use rand::distributions::Alphanumeric;
use rand::{thread_rng, Rng};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use uuid::Uuid;

use crate::configuration::PurposeTokenSettings;
use crate::error::{AppError, AuthError, ConfigError, ValidationError};
use crate::store::PurposeTokenStore;

const TOKEN_LENGTH: usize = 48;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TokenUsage {
    EmailVerification,
    ResetPassword,
    Login,
    General,
}

impl TokenUsage {
    pub fn as_str(&self) -> &'static str {
        match self {
            TokenUsage::EmailVerification => "email-verification",
            TokenUsage::ResetPassword => "reset-password",
            TokenUsage::Login => "login",
            TokenUsage::General => "general",
        }
    }
}

impl fmt::Display for TokenUsage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TokenUsage {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "email-verification" => Ok(TokenUsage::EmailVerification),
            "reset-password" => Ok(TokenUsage::ResetPassword),
            "login" => Ok(TokenUsage::Login),
            "general" => Ok(TokenUsage::General),
            _ => Err(ValidationError::InvalidFormat("usage".to_string())),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PurposeToken {
    token: String,
    user_id: Uuid,
    usage: TokenUsage,
    expired_at: DateTime<Utc>,
}

impl PurposeToken {
    pub fn new(user_id: Uuid, usage: TokenUsage, lifetime: Duration) -> Self {
        Self {
            token: generate_token(),
            user_id,
            usage,
            expired_at: Utc::now() + lifetime,
        }
    }

    /// Rebuild a stored token.
    pub fn from_parts(
        token: String,
        user_id: Uuid,
        usage: TokenUsage,
        expired_at: DateTime<Utc>,
    ) -> Self {
        Self {
            token,
            user_id,
            usage,
            expired_at,
        }
    }

    pub fn token(&self) -> &str {
        &self.token
    }

    pub fn user_id(&self) -> Uuid {
        self.user_id
    }

    pub fn usage(&self) -> TokenUsage {
        self.usage
    }

    pub fn expired_at(&self) -> DateTime<Utc> {
        self.expired_at
    }

    pub fn is_expired(&self) -> bool {
        Utc::now() >= self.expired_at
    }
}

/// Cryptographically random alphanumeric string
fn generate_token() -> String {
    thread_rng()
        .sample_iter(&Alphanumeric)
        .take(TOKEN_LENGTH)
        .map(char::from)
        .collect()
}

/// Issues and consumes purpose tokens.
#[derive(Clone)]
pub struct PurposeTokenService {
    store: Arc<dyn PurposeTokenStore>,
    settings: PurposeTokenSettings,
}

impl PurposeTokenService {
    pub fn new(store: Arc<dyn PurposeTokenStore>, settings: PurposeTokenSettings) -> Self {
        Self { store, settings }
    }

    /// Configured lifetime of `usage`.
    pub fn duration_for(&self, usage: TokenUsage) -> Result<Duration, AppError> {
        let seconds = match usage {
            TokenUsage::EmailVerification => self.settings.email_verification_expiry,
            TokenUsage::ResetPassword => self.settings.reset_password_expiry,
            TokenUsage::Login => self.settings.login_expiry,
            TokenUsage::General => self.settings.general_expiry,
        };
        if seconds <= 0 {
            return Err(AppError::Config(ConfigError::MissingRequired(format!(
                "purpose_token expiry for {}",
                usage
            ))));
        }
        Ok(Duration::seconds(seconds))
    }

    /// Issue a new token for `user_id`. A collision on the random string
    /// surfaces as a repository conflict.
    #[tracing::instrument(name = "purpose_token.request", skip(self))]
    pub async fn request(&self, user_id: Uuid, usage: TokenUsage) -> Result<PurposeToken, AppError> {
        let lifetime = self.duration_for(usage)?;
        let token = PurposeToken::new(user_id, usage, lifetime);
        self.store.insert(&token).await?;

        tracing::info!(
            user_id = %user_id,
            usage = %usage,
            expired_at = %token.expired_at(),
            "Purpose token issued"
        );
        Ok(token)
    }

    /// Consume `token` and return its owner.
    #[tracing::instrument(name = "purpose_token.verify", skip(self, token))]
    pub async fn verify(&self, token: &str, expected: TokenUsage) -> Result<Uuid, AppError> {
        let record = self.consume(token).await?;
        Self::check(&record, expected)?;
        Ok(record.user_id())
    }

    /// Consume `token`, additionally requiring it to belong to `user_id`.
    #[tracing::instrument(name = "purpose_token.auth_verify", skip(self, token))]
    pub async fn auth_verify(
        &self,
        token: &str,
        expected: TokenUsage,
        user_id: Uuid,
    ) -> Result<(), AppError> {
        let record = self.consume(token).await?;
        if record.user_id() != user_id {
            tracing::warn!(
                owner = %record.user_id(),
                caller = %user_id,
                "Purpose token presented by another user"
            );
            return Err(AuthError::Unauthorized.into());
        }
        Self::check(&record, expected)
    }

    /// Fetch and delete in one step, so a token is never usable twice.
    async fn consume(&self, token: &str) -> Result<PurposeToken, AppError> {
        self.store
            .take(token)
            .await?
            .ok_or_else(|| AuthError::TokenNotFound.into())
    }

    fn check(record: &PurposeToken, expected: TokenUsage) -> Result<(), AppError> {
        if record.usage() != expected {
            tracing::warn!(
                usage = %record.usage(),
                expected = %expected,
                "Purpose token used for a different usage"
            );
            return Err(AuthError::TokenDifferentUsage.into());
        }
        if record.is_expired() {
            return Err(AuthError::TokenExpired.into());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::RepositoryError;
    use crate::store::{KeyspacePurposeTokenStore, Keyspace};
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::sync::Mutex;

    fn settings() -> PurposeTokenSettings {
        PurposeTokenSettings {
            email_verification_expiry: 86400,
            reset_password_expiry: 1800,
            login_expiry: 300,
            general_expiry: 0,
        }
    }

    fn service() -> PurposeTokenService {
        let store = KeyspacePurposeTokenStore::new(Arc::new(Keyspace::new()));
        PurposeTokenService::new(Arc::new(store), settings())
    }

    /// Store without TTL handling, so already-expired records can be planted.
    #[derive(Default)]
    struct PlantedStore {
        records: Mutex<HashMap<String, PurposeToken>>,
    }

    #[async_trait]
    impl PurposeTokenStore for PlantedStore {
        async fn insert(&self, token: &PurposeToken) -> Result<(), RepositoryError> {
            self.records
                .lock()
                .unwrap()
                .insert(token.token().to_string(), token.clone());
            Ok(())
        }

        async fn take(&self, token: &str) -> Result<Option<PurposeToken>, RepositoryError> {
            Ok(self.records.lock().unwrap().remove(token))
        }

        async fn purge_expired(&self) -> Result<usize, RepositoryError> {
            let mut records = self.records.lock().unwrap();
            let before = records.len();
            records.retain(|_, record| !record.is_expired());
            Ok(before - records.len())
        }
    }

    fn assert_auth(result: Result<impl std::fmt::Debug, AppError>, expected: AuthError) {
        match result {
            Err(AppError::Auth(err)) => assert_eq!(err, expected),
            other => panic!("expected {:?}, got {:?}", expected, other),
        }
    }

    #[test]
    fn test_generated_tokens_are_random_alphanumeric() {
        let a = generate_token();
        let b = generate_token();
        assert_eq!(a.len(), TOKEN_LENGTH);
        assert!(a.chars().all(|c| c.is_ascii_alphanumeric()));
        assert_ne!(a, b);
    }

    #[test]
    fn test_usage_parsing() {
        assert_eq!("reset-password".parse::<TokenUsage>().unwrap(), TokenUsage::ResetPassword);
        assert_eq!(TokenUsage::EmailVerification.to_string(), "email-verification");
        assert!("sudo".parse::<TokenUsage>().is_err());
    }

    #[test]
    fn test_duration_per_usage() {
        let service = service();
        assert_eq!(service.duration_for(TokenUsage::Login).unwrap(), Duration::seconds(300));
        assert_eq!(
            service.duration_for(TokenUsage::ResetPassword).unwrap(),
            Duration::seconds(1800)
        );
        assert!(matches!(
            service.duration_for(TokenUsage::General),
            Err(AppError::Config(_))
        ));
    }

    #[tokio::test]
    async fn test_request_then_verify_returns_owner() {
        let service = service();
        let user_id = Uuid::new_v4();

        let token = service.request(user_id, TokenUsage::EmailVerification).await.unwrap();
        let owner = service
            .verify(token.token(), TokenUsage::EmailVerification)
            .await
            .unwrap();

        assert_eq!(owner, user_id);
    }

    #[tokio::test]
    async fn test_unconfigured_usage_is_rejected_on_request() {
        let service = service();
        let result = service.request(Uuid::new_v4(), TokenUsage::General).await;
        assert!(matches!(result, Err(AppError::Config(_))));
    }

    #[tokio::test]
    async fn test_wrong_usage_still_burns_the_token() {
        let service = service();
        let token = service
            .request(Uuid::new_v4(), TokenUsage::EmailVerification)
            .await
            .unwrap();

        assert_auth(
            service.verify(token.token(), TokenUsage::ResetPassword).await,
            AuthError::TokenDifferentUsage,
        );
        assert_auth(
            service.verify(token.token(), TokenUsage::EmailVerification).await,
            AuthError::TokenNotFound,
        );
    }

    #[tokio::test]
    async fn test_verify_twice_fails_with_not_found() {
        let service = service();
        let token = service.request(Uuid::new_v4(), TokenUsage::Login).await.unwrap();

        assert!(service.verify(token.token(), TokenUsage::Login).await.is_ok());
        assert_auth(
            service.verify(token.token(), TokenUsage::Login).await,
            AuthError::TokenNotFound,
        );
    }

    #[tokio::test]
    async fn test_expired_token_is_rejected_and_burned() {
        let store = Arc::new(PlantedStore::default());
        let service = PurposeTokenService::new(store.clone(), settings());
        let expired = PurposeToken::from_parts(
            "planted".to_string(),
            Uuid::new_v4(),
            TokenUsage::ResetPassword,
            Utc::now() - Duration::minutes(5),
        );
        store.insert(&expired).await.unwrap();

        assert_auth(
            service.verify("planted", TokenUsage::ResetPassword).await,
            AuthError::TokenExpired,
        );
        assert_auth(
            service.verify("planted", TokenUsage::ResetPassword).await,
            AuthError::TokenNotFound,
        );
    }

    #[tokio::test]
    async fn test_auth_verify_checks_owner_before_usage() {
        let service = service();
        let owner = Uuid::new_v4();
        let token = service.request(owner, TokenUsage::Login).await.unwrap();

        // wrong user and wrong usage: ownership is reported
        assert_auth(
            service
                .auth_verify(token.token(), TokenUsage::ResetPassword, Uuid::new_v4())
                .await,
            AuthError::Unauthorized,
        );
        assert_auth(
            service.auth_verify(token.token(), TokenUsage::Login, owner).await,
            AuthError::TokenNotFound,
        );
    }

    #[tokio::test]
    async fn test_auth_verify_accepts_owner() {
        let service = service();
        let owner = Uuid::new_v4();
        let token = service.request(owner, TokenUsage::Login).await.unwrap();

        assert!(service.auth_verify(token.token(), TokenUsage::Login, owner).await.is_ok());
    }
}
