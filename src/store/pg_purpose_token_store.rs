use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use uuid::Uuid;

use crate::error::RepositoryError;
use crate::purpose_token::{PurposeToken, TokenUsage};
use crate::store::hash_token;
use crate::store::purpose_token_store::PurposeTokenStore;

/// Purpose tokens in `purpose_tokens`, keyed by the token's SHA-256.
///
/// Expired rows stay readable until purged, so `take` can still report
/// them as expired rather than unknown.
#[derive(Clone)]
pub struct PgPurposeTokenStore {
    pool: PgPool,
}

impl PgPurposeTokenStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl PurposeTokenStore for PgPurposeTokenStore {
    async fn insert(&self, token: &PurposeToken) -> Result<(), RepositoryError> {
        let result = sqlx::query(
            r#"
            INSERT INTO purpose_tokens (token_hash, user_id, usage, expired_at, created_at)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (token_hash) DO NOTHING
            "#,
        )
        .bind(hash_token(token.token()))
        .bind(token.user_id())
        .bind(token.usage().as_str())
        .bind(token.expired_at())
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(RepositoryError::Conflict("purpose token collision".to_string()));
        }
        Ok(())
    }

    async fn take(&self, token: &str) -> Result<Option<PurposeToken>, RepositoryError> {
        let row = sqlx::query_as::<_, (Uuid, String, DateTime<Utc>)>(
            r#"
            DELETE FROM purpose_tokens
            WHERE token_hash = $1
            RETURNING user_id, usage, expired_at
            "#,
        )
        .bind(hash_token(token))
        .fetch_optional(&self.pool)
        .await?;

        let (user_id, usage, expired_at) = match row {
            Some(row) => row,
            None => return Ok(None),
        };
        let usage = usage.parse::<TokenUsage>().map_err(|_| {
            RepositoryError::UnexpectedError(format!("purpose token with unknown usage {}", usage))
        })?;

        Ok(Some(PurposeToken::from_parts(
            token.to_string(),
            user_id,
            usage,
            expired_at,
        )))
    }

    async fn purge_expired(&self) -> Result<usize, RepositoryError> {
        let result = sqlx::query("DELETE FROM purpose_tokens WHERE expired_at <= $1")
            .bind(Utc::now())
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() as usize)
    }
}
