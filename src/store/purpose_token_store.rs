use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use uuid::Uuid;

use crate::error::RepositoryError;
use crate::purpose_token::{PurposeToken, TokenUsage};
use crate::store::hash_token;
use crate::store::keyspace::{Keyspace, Transaction};

#[async_trait]
pub trait PurposeTokenStore: Send + Sync {
    /// Store a new token. An existing record under the same string is a `Conflict`.
    async fn insert(&self, token: &PurposeToken) -> Result<(), RepositoryError>;

    /// Fetch and delete the record in one step.
    async fn take(&self, token: &str) -> Result<Option<PurposeToken>, RepositoryError>;

    /// Reclaim storage held by expired records. Returns how many were dropped.
    async fn purge_expired(&self) -> Result<usize, RepositoryError>;
}

/// Keys carry the token's digest, never the token itself
pub fn purpose_token_key(token: &str) -> String {
    format!("purpose_token:{}", hash_token(token))
}

/// Tokens stored as hashes whose key expiry equals `expired_at`.
#[derive(Clone)]
pub struct KeyspacePurposeTokenStore {
    keyspace: Arc<Keyspace>,
}

impl KeyspacePurposeTokenStore {
    pub fn new(keyspace: Arc<Keyspace>) -> Self {
        Self { keyspace }
    }
}

#[async_trait]
impl PurposeTokenStore for KeyspacePurposeTokenStore {
    async fn insert(&self, token: &PurposeToken) -> Result<(), RepositoryError> {
        let key = purpose_token_key(token.token());
        let watch = self.keyspace.watch(&[key.as_str()])?;
        if self.keyspace.exists(&key)? {
            return Err(RepositoryError::Conflict("purpose token collision".to_string()));
        }

        let tx = Transaction::new()
            .hset(
                key.clone(),
                [
                    ("user_id", token.user_id().to_string()),
                    ("usage", token.usage().as_str().to_string()),
                    ("expired_at", token.expired_at().to_rfc3339()),
                ],
            )
            .expire_at(key, token.expired_at());
        self.keyspace.exec(tx, Some(&watch))?;
        Ok(())
    }

    async fn take(&self, token: &str) -> Result<Option<PurposeToken>, RepositoryError> {
        let key = purpose_token_key(token);
        let fields = match self.keyspace.hgetdel(&key)? {
            Some(fields) => fields,
            None => return Ok(None),
        };

        let corrupt = |what: &str| RepositoryError::UnexpectedError(format!("{}: bad {}", key, what));
        let user_id = fields
            .get("user_id")
            .and_then(|raw| Uuid::parse_str(raw).ok())
            .ok_or_else(|| corrupt("user_id"))?;
        let usage = fields
            .get("usage")
            .and_then(|raw| raw.parse::<TokenUsage>().ok())
            .ok_or_else(|| corrupt("usage"))?;
        let expired_at = fields
            .get("expired_at")
            .and_then(|raw| DateTime::parse_from_rfc3339(raw).ok())
            .map(|at| at.with_timezone(&Utc))
            .ok_or_else(|| corrupt("expired_at"))?;

        Ok(Some(PurposeToken::from_parts(
            token.to_string(),
            user_id,
            usage,
            expired_at,
        )))
    }

    async fn purge_expired(&self) -> Result<usize, RepositoryError> {
        Ok(self.keyspace.purge_expired()?)
    }
}
