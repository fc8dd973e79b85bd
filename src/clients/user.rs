use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use uuid::Uuid;

use crate::error::RepositoryError;

#[derive(Debug, Clone, PartialEq, Eq, sqlx::FromRow)]
pub struct User {
    pub id: Uuid,
    pub email: String,
    pub username: String,
    pub password_hash: String,
    pub is_banned: bool,
    pub email_verified: bool,
    pub created_at: DateTime<Utc>,
}

/// Fields of a user and their profile, created together
#[derive(Debug, Clone)]
pub struct NewUser {
    pub email: String,
    pub username: String,
    pub password_hash: String,
    pub display_name: String,
}

#[async_trait]
pub trait UserRepository: Send + Sync {
    async fn find_by_emails(&self, emails: &[String]) -> Result<Vec<User>, RepositoryError>;

    async fn find_by_ids(&self, ids: &[Uuid]) -> Result<Vec<User>, RepositoryError>;

    /// Insert the user and their profile as one unit of work.
    /// A taken email or username is a `Conflict`.
    async fn create(&self, user: &NewUser) -> Result<User, RepositoryError>;

    /// Returns `false` when no such user existed
    async fn delete(&self, id: Uuid) -> Result<bool, RepositoryError>;

    async fn update_password(&self, id: Uuid, password_hash: &str) -> Result<(), RepositoryError>;

    async fn mark_email_verified(&self, id: Uuid) -> Result<(), RepositoryError>;
}

const USER_COLUMNS: &str = "id, email, username, password_hash, is_banned, email_verified, created_at";

#[derive(Clone)]
pub struct PgUserRepository {
    pool: PgPool,
}

impl PgUserRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl UserRepository for PgUserRepository {
    async fn find_by_emails(&self, emails: &[String]) -> Result<Vec<User>, RepositoryError> {
        let users = sqlx::query_as::<_, User>(&format!(
            "SELECT {} FROM users WHERE email = ANY($1)",
            USER_COLUMNS
        ))
        .bind(emails)
        .fetch_all(&self.pool)
        .await?;
        Ok(users)
    }

    async fn find_by_ids(&self, ids: &[Uuid]) -> Result<Vec<User>, RepositoryError> {
        let users = sqlx::query_as::<_, User>(&format!(
            "SELECT {} FROM users WHERE id = ANY($1)",
            USER_COLUMNS
        ))
        .bind(ids)
        .fetch_all(&self.pool)
        .await?;
        Ok(users)
    }

    #[tracing::instrument(name = "users.create", skip(self, user), fields(email = %user.email))]
    async fn create(&self, user: &NewUser) -> Result<User, RepositoryError> {
        let now = Utc::now();
        let mut tx = self.pool.begin().await?;

        let created = sqlx::query_as::<_, User>(&format!(
            r#"
            INSERT INTO users (id, email, username, password_hash, is_banned, email_verified, created_at, updated_at)
            VALUES ($1, $2, $3, $4, false, false, $5, $5)
            RETURNING {}
            "#,
            USER_COLUMNS
        ))
        .bind(Uuid::new_v4())
        .bind(&user.email)
        .bind(&user.username)
        .bind(&user.password_hash)
        .bind(now)
        .fetch_one(&mut tx)
        .await?;

        sqlx::query(
            r#"
            INSERT INTO profiles (user_id, display_name, created_at)
            VALUES ($1, $2, $3)
            "#,
        )
        .bind(created.id)
        .bind(&user.display_name)
        .bind(now)
        .execute(&mut tx)
        .await?;

        tx.commit().await?;
        Ok(created)
    }

    async fn delete(&self, id: Uuid) -> Result<bool, RepositoryError> {
        // profiles cascade
        let result = sqlx::query("DELETE FROM users WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn update_password(&self, id: Uuid, password_hash: &str) -> Result<(), RepositoryError> {
        let result = sqlx::query(
            "UPDATE users SET password_hash = $2, updated_at = $3 WHERE id = $1",
        )
        .bind(id)
        .bind(password_hash)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(RepositoryError::NotFound(format!("user {}", id)));
        }
        Ok(())
    }

    async fn mark_email_verified(&self, id: Uuid) -> Result<(), RepositoryError> {
        let result = sqlx::query(
            "UPDATE users SET email_verified = true, updated_at = $2 WHERE id = $1",
        )
        .bind(id)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(RepositoryError::NotFound(format!("user {}", id)));
        }
        Ok(())
    }
}
