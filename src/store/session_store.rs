/// Session (credential) storage
///
/// The `SessionStore` contract, plus its keyspace rendition. Each session
/// lives under `session:{id}` as a hash whose expiry equals the session's
/// `expires_at`. Every user has an index set `user:{uid}:sessions` holding
/// the ids of that user's live sessions, expiring with its longest-lived
/// member. All multi-key writes go through a single keyspace transaction, so
/// the index and the records never drift apart.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use uuid::Uuid;

use crate::error::RepositoryError;
use crate::store::keyspace::{Keyspace, Transaction};

/// One logged-in device. `id` is also the refresh token's `jti`.
#[derive(Debug, Clone, PartialEq, Eq, sqlx::FromRow)]
pub struct Session {
    pub id: Uuid,
    pub user_id: Uuid,
    /// `jti` of the only access token currently allowed to refresh this session
    pub access_token_id: Uuid,
    pub device: String,
    /// SHA-256 of the refresh token, see [`crate::store::hash_token`]
    pub refresh_token_hash: String,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

/// Partial update: only `Some` fields are written.
///
/// With `expected_access_token_id` set, the write only happens while the
/// session is still bound to that access token; otherwise it is a `Conflict`.
#[derive(Debug, Clone, Default)]
pub struct SessionPatch {
    pub id: Uuid,
    pub expected_access_token_id: Option<Uuid>,
    pub access_token_id: Option<Uuid>,
    pub device: Option<String>,
    pub refresh_token_hash: Option<String>,
}

impl SessionPatch {
    pub fn new(id: Uuid) -> Self {
        Self {
            id,
            ..Self::default()
        }
    }

    /// Only apply while the session is bound to `jti`
    pub fn if_access_token_id(mut self, jti: Uuid) -> Self {
        self.expected_access_token_id = Some(jti);
        self
    }

    pub fn access_token_id(mut self, access_token_id: Uuid) -> Self {
        self.access_token_id = Some(access_token_id);
        self
    }

    fn fields(&self) -> Vec<(&'static str, String)> {
        let mut fields = Vec::new();
        if let Some(jti) = self.access_token_id {
            fields.push(("access_token_id", jti.to_string()));
        }
        if let Some(device) = &self.device {
            fields.push(("device", device.clone()));
        }
        if let Some(hash) = &self.refresh_token_hash {
            fields.push(("refresh_token_hash", hash.clone()));
        }
        fields
    }
}

#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Write the record, index it under its user and set its expiry, atomically.
    async fn create(&self, session: &Session) -> Result<(), RepositoryError>;

    /// Optimistic partial update. `NotFound` if the session is gone,
    /// `Conflict` if a concurrent writer got there first or the expected
    /// access token binding no longer holds.
    async fn patch(&self, patch: &SessionPatch) -> Result<(), RepositoryError>;

    /// Remove the named sessions. Unknown ids are ignored. Returns how many existed.
    async fn delete(&self, ids: &[Uuid]) -> Result<usize, RepositoryError>;

    /// Remove every session of `user_id` together with the index.
    async fn delete_by_user_id(&self, user_id: Uuid) -> Result<usize, RepositoryError>;

    async fn find(&self, id: Uuid) -> Result<Option<Session>, RepositoryError>;

    /// Snapshot of the user's sessions, `Conflict` if the index moved mid-read.
    async fn find_by_user_id(&self, user_id: Uuid) -> Result<Vec<Session>, RepositoryError>;

    /// Reclaim storage held by expired sessions. Returns how many were dropped.
    async fn purge_expired(&self) -> Result<usize, RepositoryError>;
}

pub fn session_key(id: Uuid) -> String {
    format!("session:{}", id)
}

pub fn user_index_key(user_id: Uuid) -> String {
    format!("user:{}:sessions", user_id)
}

fn encode(session: &Session) -> Vec<(&'static str, String)> {
    vec![
        ("id", session.id.to_string()),
        ("user_id", session.user_id.to_string()),
        ("access_token_id", session.access_token_id.to_string()),
        ("device", session.device.clone()),
        ("refresh_token_hash", session.refresh_token_hash.clone()),
        ("created_at", session.created_at.to_rfc3339()),
        ("expires_at", session.expires_at.to_rfc3339()),
    ]
}

fn decode(key: &str, fields: &HashMap<String, String>) -> Result<Session, RepositoryError> {
    let field = |name: &str| {
        fields.get(name).ok_or_else(|| {
            RepositoryError::UnexpectedError(format!("{} is missing field {}", key, name))
        })
    };
    let uuid = |name: &str| {
        field(name).and_then(|raw| {
            Uuid::parse_str(raw).map_err(|e| {
                RepositoryError::UnexpectedError(format!("{}.{}: {}", key, name, e))
            })
        })
    };
    let timestamp = |name: &str| {
        field(name).and_then(|raw| {
            DateTime::parse_from_rfc3339(raw)
                .map(|at| at.with_timezone(&Utc))
                .map_err(|e| RepositoryError::UnexpectedError(format!("{}.{}: {}", key, name, e)))
        })
    };

    Ok(Session {
        id: uuid("id")?,
        user_id: uuid("user_id")?,
        access_token_id: uuid("access_token_id")?,
        device: field("device")?.clone(),
        refresh_token_hash: field("refresh_token_hash")?.clone(),
        created_at: timestamp("created_at")?,
        expires_at: timestamp("expires_at")?,
    })
}

/// [`SessionStore`] backed by a shared [`Keyspace`].
#[derive(Clone)]
pub struct KeyspaceSessionStore {
    keyspace: Arc<Keyspace>,
}

impl KeyspaceSessionStore {
    pub fn new(keyspace: Arc<Keyspace>) -> Self {
        Self { keyspace }
    }

    fn load(&self, id: Uuid) -> Result<Option<Session>, RepositoryError> {
        let key = session_key(id);
        match self.keyspace.hgetall(&key)? {
            None => Ok(None),
            Some(fields) => decode(&key, &fields).map(Some),
        }
    }
}

#[async_trait]
impl SessionStore for KeyspaceSessionStore {
    async fn create(&self, session: &Session) -> Result<(), RepositoryError> {
        let key = session_key(session.id);
        let index = user_index_key(session.user_id);
        let watch = self.keyspace.watch(&[key.as_str(), index.as_str()])?;

        if self.keyspace.exists(&key)? {
            return Err(RepositoryError::Conflict(format!("{} already exists", key)));
        }

        let mut tx = Transaction::new()
            .hset(key.clone(), encode(session))
            .expire_at(key.clone(), session.expires_at)
            .sadd(index.clone(), session.id.to_string());

        // The index lives as long as its longest-lived member; members whose
        // record already expired are dropped.
        let mut index_expiry = session.expires_at;
        for member in self.keyspace.smembers(&index)? {
            let live = match Uuid::parse_str(&member) {
                Ok(id) => self.load(id)?,
                Err(_) => None,
            };
            match live {
                Some(other) => index_expiry = index_expiry.max(other.expires_at),
                None => tx = tx.srem(index.clone(), member),
            }
        }
        tx = tx.expire_at(index.clone(), index_expiry);

        self.keyspace.exec(tx, Some(&watch))?;
        tracing::debug!(session_id = %session.id, user_id = %session.user_id, "Session created");
        Ok(())
    }

    async fn patch(&self, patch: &SessionPatch) -> Result<(), RepositoryError> {
        let key = session_key(patch.id);
        let watch = self.keyspace.watch(&[key.as_str()])?;

        let current = match self.load(patch.id)? {
            Some(session) => session,
            None => return Err(RepositoryError::NotFound(key)),
        };
        if let Some(expected) = patch.expected_access_token_id {
            if current.access_token_id != expected {
                return Err(RepositoryError::Conflict(format!(
                    "{} is bound to another access token",
                    key
                )));
            }
        }

        let fields = patch.fields();
        if fields.is_empty() {
            return Ok(());
        }
        let tx = Transaction::new().hset(key.clone(), fields);
        self.keyspace.exec(tx, Some(&watch))?;
        Ok(())
    }

    async fn delete(&self, ids: &[Uuid]) -> Result<usize, RepositoryError> {
        let mut tx = Transaction::new();
        let mut existing = 0;
        for id in ids {
            if let Some(session) = self.load(*id)? {
                tx = tx.srem(user_index_key(session.user_id), id.to_string());
                existing += 1;
            }
            tx = tx.del(session_key(*id));
        }
        if tx.is_empty() {
            return Ok(0);
        }

        self.keyspace.exec(tx, None)?;
        Ok(existing)
    }

    async fn delete_by_user_id(&self, user_id: Uuid) -> Result<usize, RepositoryError> {
        let index = user_index_key(user_id);
        let watch = self.keyspace.watch(&[index.as_str()])?;
        let members = self.keyspace.smembers(&index)?;

        let mut tx = Transaction::new();
        for member in &members {
            if let Ok(id) = Uuid::parse_str(member) {
                tx = tx.del(session_key(id));
            }
        }
        tx = tx.del(index);

        self.keyspace.exec(tx, Some(&watch))?;
        tracing::debug!(user_id = %user_id, sessions = members.len(), "Sessions deleted for user");
        Ok(members.len())
    }

    async fn find(&self, id: Uuid) -> Result<Option<Session>, RepositoryError> {
        self.load(id)
    }

    async fn find_by_user_id(&self, user_id: Uuid) -> Result<Vec<Session>, RepositoryError> {
        let index = user_index_key(user_id);
        let watch = self.keyspace.watch(&[index.as_str()])?;

        let mut sessions = Vec::new();
        for member in self.keyspace.smembers(&index)? {
            let id = Uuid::parse_str(&member).map_err(|e| {
                RepositoryError::UnexpectedError(format!("{} holds {}: {}", index, member, e))
            })?;
            if let Some(session) = self.load(id)? {
                sessions.push(session);
            }
        }

        self.keyspace.check(&watch)?;
        sessions.sort_by_key(|s| s.created_at);
        Ok(sessions)
    }

    async fn purge_expired(&self) -> Result<usize, RepositoryError> {
        Ok(self.keyspace.purge_expired()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use std::collections::BTreeSet;

    fn session_for(user_id: Uuid, device: &str) -> Session {
        let now = Utc::now();
        Session {
            id: Uuid::new_v4(),
            user_id,
            access_token_id: Uuid::new_v4(),
            device: device.to_string(),
            refresh_token_hash: crate::store::hash_token("refresh"),
            created_at: now,
            expires_at: now + Duration::hours(1),
        }
    }

    fn index_of(keyspace: &Keyspace, user_id: Uuid) -> BTreeSet<String> {
        keyspace.smembers(&user_index_key(user_id)).unwrap()
    }

    #[tokio::test]
    async fn test_create_and_find() {
        let keyspace = Arc::new(Keyspace::new());
        let store = KeyspaceSessionStore::new(keyspace.clone());
        let session = session_for(Uuid::new_v4(), "pixel-7");

        store.create(&session).await.unwrap();

        assert_eq!(store.find(session.id).await.unwrap(), Some(session.clone()));
        assert!(index_of(&keyspace, session.user_id).contains(&session.id.to_string()));
    }

    #[tokio::test]
    async fn test_create_rejects_colliding_id() {
        let store = KeyspaceSessionStore::new(Arc::new(Keyspace::new()));
        let session = session_for(Uuid::new_v4(), "laptop");
        store.create(&session).await.unwrap();

        let result = store.create(&session).await;
        assert!(matches!(result, Err(RepositoryError::Conflict(_))));
    }

    #[tokio::test]
    async fn test_patch_updates_only_given_fields() {
        let store = KeyspaceSessionStore::new(Arc::new(Keyspace::new()));
        let session = session_for(Uuid::new_v4(), "laptop");
        store.create(&session).await.unwrap();

        let next = Uuid::new_v4();
        store
            .patch(&SessionPatch::new(session.id).access_token_id(next))
            .await
            .unwrap();

        let stored = store.find(session.id).await.unwrap().unwrap();
        assert_eq!(stored.access_token_id, next);
        assert_eq!(stored.device, "laptop");
        assert_eq!(stored.refresh_token_hash, session.refresh_token_hash);
    }

    #[tokio::test]
    async fn test_patch_requires_the_expected_binding() {
        let store = KeyspaceSessionStore::new(Arc::new(Keyspace::new()));
        let session = session_for(Uuid::new_v4(), "laptop");
        store.create(&session).await.unwrap();

        let first = Uuid::new_v4();
        store
            .patch(
                &SessionPatch::new(session.id)
                    .if_access_token_id(session.access_token_id)
                    .access_token_id(first),
            )
            .await
            .unwrap();

        // a second writer that checked the old binding loses
        let result = store
            .patch(
                &SessionPatch::new(session.id)
                    .if_access_token_id(session.access_token_id)
                    .access_token_id(Uuid::new_v4()),
            )
            .await;
        assert!(matches!(result, Err(RepositoryError::Conflict(_))));
        assert_eq!(
            store.find(session.id).await.unwrap().unwrap().access_token_id,
            first
        );
    }

    #[tokio::test]
    async fn test_patch_missing_session_is_not_found() {
        let store = KeyspaceSessionStore::new(Arc::new(Keyspace::new()));
        let result = store
            .patch(&SessionPatch::new(Uuid::new_v4()).access_token_id(Uuid::new_v4()))
            .await;
        assert!(matches!(result, Err(RepositoryError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_delete_keeps_index_in_sync() {
        let keyspace = Arc::new(Keyspace::new());
        let store = KeyspaceSessionStore::new(keyspace.clone());
        let user_id = Uuid::new_v4();
        let a = session_for(user_id, "a");
        let b = session_for(user_id, "b");
        store.create(&a).await.unwrap();
        store.create(&b).await.unwrap();

        let removed = store.delete(&[a.id, Uuid::new_v4()]).await.unwrap();

        assert_eq!(removed, 1);
        assert!(store.find(a.id).await.unwrap().is_none());
        assert_eq!(index_of(&keyspace, user_id), BTreeSet::from([b.id.to_string()]));
    }

    #[tokio::test]
    async fn test_delete_by_user_id_removes_sessions_and_index() {
        let keyspace = Arc::new(Keyspace::new());
        let store = KeyspaceSessionStore::new(keyspace.clone());
        let user_id = Uuid::new_v4();
        let other = session_for(Uuid::new_v4(), "other");
        store.create(&other).await.unwrap();
        for device in ["a", "b", "c"] {
            store.create(&session_for(user_id, device)).await.unwrap();
        }

        assert_eq!(store.delete_by_user_id(user_id).await.unwrap(), 3);

        assert!(store.find_by_user_id(user_id).await.unwrap().is_empty());
        assert!(!keyspace.exists(&user_index_key(user_id)).unwrap());
        assert!(store.find(other.id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_index_matches_live_sessions_after_mixed_operations() {
        let keyspace = Arc::new(Keyspace::new());
        let store = KeyspaceSessionStore::new(keyspace.clone());
        let user_id = Uuid::new_v4();

        let mut live = BTreeSet::new();
        for round in 0..4 {
            for i in 0..3 {
                let s = session_for(user_id, &format!("device-{}-{}", round, i));
                store.create(&s).await.unwrap();
                live.insert(s.id.to_string());
            }
            if round % 2 == 1 {
                store.delete_by_user_id(user_id).await.unwrap();
                live.clear();
            }
            let stored: BTreeSet<String> = store
                .find_by_user_id(user_id)
                .await
                .unwrap()
                .into_iter()
                .map(|s| s.id.to_string())
                .collect();
            assert_eq!(index_of(&keyspace, user_id), live);
            assert_eq!(stored, live);
        }
    }

    #[tokio::test]
    async fn test_create_prunes_expired_members() {
        let keyspace = Arc::new(Keyspace::new());
        let store = KeyspaceSessionStore::new(keyspace.clone());
        let user_id = Uuid::new_v4();

        let mut stale = session_for(user_id, "old");
        stale.expires_at = Utc::now() - Duration::seconds(1);
        store.create(&stale).await.unwrap();
        assert!(store.find(stale.id).await.unwrap().is_none());

        let fresh = session_for(user_id, "new");
        store.create(&fresh).await.unwrap();

        assert_eq!(
            index_of(&keyspace, user_id),
            BTreeSet::from([fresh.id.to_string()])
        );
    }

    #[tokio::test]
    async fn test_index_expires_with_its_last_session() {
        let keyspace = Arc::new(Keyspace::new());
        let store = KeyspaceSessionStore::new(keyspace.clone());
        let user_id = Uuid::new_v4();
        let index = user_index_key(user_id);

        let mut short = session_for(user_id, "short");
        short.expires_at = Utc::now() + Duration::milliseconds(50);
        let mut shorter = session_for(user_id, "shorter");
        shorter.expires_at = Utc::now() + Duration::milliseconds(20);
        store.create(&short).await.unwrap();
        store.create(&shorter).await.unwrap();
        assert_eq!(index_of(&keyspace, user_id).len(), 2);

        tokio::time::sleep(std::time::Duration::from_millis(80)).await;
        assert_eq!(store.purge_expired().await.unwrap(), 3);

        assert!(!keyspace.exists(&index).unwrap());
        assert!(index_of(&keyspace, user_id).is_empty());
        assert!(store.find_by_user_id(user_id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_index_outlives_short_sessions_while_one_is_live() {
        let keyspace = Arc::new(Keyspace::new());
        let store = KeyspaceSessionStore::new(keyspace.clone());
        let user_id = Uuid::new_v4();

        let long = session_for(user_id, "long");
        let mut short = session_for(user_id, "short");
        short.expires_at = Utc::now() + Duration::milliseconds(20);
        store.create(&long).await.unwrap();
        store.create(&short).await.unwrap();

        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        store.purge_expired().await.unwrap();

        assert!(keyspace.exists(&user_index_key(user_id)).unwrap());
        let live: Vec<Uuid> = store
            .find_by_user_id(user_id)
            .await
            .unwrap()
            .into_iter()
            .map(|s| s.id)
            .collect();
        assert_eq!(live, vec![long.id]);
    }
}
