/// PostgreSQL session storage
///
/// One row per session in `sessions`. The per-user index is the `user_id`
/// column, so every query that touches it is a single statement and needs
/// no explicit transaction. Rows past `expires_at` are invisible to reads
/// and removed by `purge_expired`.

use async_trait::async_trait;
use chrono::Utc;
use sqlx::PgPool;
use uuid::Uuid;

use crate::error::RepositoryError;
use crate::store::session_store::{Session, SessionPatch, SessionStore};

const SESSION_COLUMNS: &str =
    "id, user_id, access_token_id, device, refresh_token_hash, created_at, expires_at";

#[derive(Clone)]
pub struct PgSessionStore {
    pool: PgPool,
}

impl PgSessionStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl SessionStore for PgSessionStore {
    #[tracing::instrument(name = "sessions.create", skip(self, session), fields(session_id = %session.id))]
    async fn create(&self, session: &Session) -> Result<(), RepositoryError> {
        let result = sqlx::query(
            r#"
            INSERT INTO sessions (id, user_id, access_token_id, device, refresh_token_hash, created_at, expires_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT (id) DO NOTHING
            "#,
        )
        .bind(session.id)
        .bind(session.user_id)
        .bind(session.access_token_id)
        .bind(&session.device)
        .bind(&session.refresh_token_hash)
        .bind(session.created_at)
        .bind(session.expires_at)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(RepositoryError::Conflict(format!(
                "session {} already exists",
                session.id
            )));
        }
        Ok(())
    }

    /// The binding check and the write are one `UPDATE`, so two writers
    /// that checked the same binding cannot both succeed.
    #[tracing::instrument(name = "sessions.patch", skip(self, patch), fields(session_id = %patch.id))]
    async fn patch(&self, patch: &SessionPatch) -> Result<(), RepositoryError> {
        let now = Utc::now();
        let result = sqlx::query(
            r#"
            UPDATE sessions
            SET access_token_id = COALESCE($2, access_token_id),
                device = COALESCE($3, device),
                refresh_token_hash = COALESCE($4, refresh_token_hash)
            WHERE id = $1
              AND expires_at > $5
              AND ($6::uuid IS NULL OR access_token_id = $6)
            "#,
        )
        .bind(patch.id)
        .bind(patch.access_token_id)
        .bind(&patch.device)
        .bind(&patch.refresh_token_hash)
        .bind(now)
        .bind(patch.expected_access_token_id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() > 0 {
            return Ok(());
        }

        let live = sqlx::query_scalar::<_, bool>(
            "SELECT EXISTS (SELECT 1 FROM sessions WHERE id = $1 AND expires_at > $2)",
        )
        .bind(patch.id)
        .bind(now)
        .fetch_one(&self.pool)
        .await?;

        if live {
            Err(RepositoryError::Conflict(format!(
                "session {} is bound to another access token",
                patch.id
            )))
        } else {
            Err(RepositoryError::NotFound(format!("session {}", patch.id)))
        }
    }

    async fn delete(&self, ids: &[Uuid]) -> Result<usize, RepositoryError> {
        if ids.is_empty() {
            return Ok(0);
        }
        let removed = sqlx::query_scalar::<_, i64>(
            r#"
            WITH removed AS (
                DELETE FROM sessions WHERE id = ANY($1) RETURNING expires_at
            )
            SELECT COUNT(*) FROM removed WHERE expires_at > $2
            "#,
        )
        .bind(ids)
        .bind(Utc::now())
        .fetch_one(&self.pool)
        .await?;
        Ok(removed as usize)
    }

    async fn delete_by_user_id(&self, user_id: Uuid) -> Result<usize, RepositoryError> {
        let removed = sqlx::query_scalar::<_, i64>(
            r#"
            WITH removed AS (
                DELETE FROM sessions WHERE user_id = $1 RETURNING expires_at
            )
            SELECT COUNT(*) FROM removed WHERE expires_at > $2
            "#,
        )
        .bind(user_id)
        .bind(Utc::now())
        .fetch_one(&self.pool)
        .await?;

        tracing::debug!(user_id = %user_id, sessions = removed, "Sessions deleted for user");
        Ok(removed as usize)
    }

    async fn find(&self, id: Uuid) -> Result<Option<Session>, RepositoryError> {
        let session = sqlx::query_as::<_, Session>(&format!(
            "SELECT {} FROM sessions WHERE id = $1 AND expires_at > $2",
            SESSION_COLUMNS
        ))
        .bind(id)
        .bind(Utc::now())
        .fetch_optional(&self.pool)
        .await?;
        Ok(session)
    }

    async fn find_by_user_id(&self, user_id: Uuid) -> Result<Vec<Session>, RepositoryError> {
        let sessions = sqlx::query_as::<_, Session>(&format!(
            "SELECT {} FROM sessions WHERE user_id = $1 AND expires_at > $2 ORDER BY created_at",
            SESSION_COLUMNS
        ))
        .bind(user_id)
        .bind(Utc::now())
        .fetch_all(&self.pool)
        .await?;
        Ok(sessions)
    }

    async fn purge_expired(&self) -> Result<usize, RepositoryError> {
        let result = sqlx::query("DELETE FROM sessions WHERE expires_at <= $1")
            .bind(Utc::now())
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() as usize)
    }
}
