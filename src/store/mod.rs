/// Storage module
///
/// Sessions and purpose tokens live in PostgreSQL in production. The
/// in-process keyspace offers the same semantics for tests and
/// single-process runs.

pub mod keyspace;
mod pg_purpose_token_store;
mod pg_session_store;
mod purpose_token_store;
mod session_store;

pub use keyspace::{KvError, Keyspace, Transaction, Watch};
pub use pg_purpose_token_store::PgPurposeTokenStore;
pub use pg_session_store::PgSessionStore;
pub use purpose_token_store::{purpose_token_key, KeyspacePurposeTokenStore, PurposeTokenStore};
pub use session_store::{
    session_key, user_index_key, KeyspaceSessionStore, Session, SessionPatch, SessionStore,
};

use sha2::{Digest, Sha256};

use crate::error::RepositoryError;

/// SHA-256 hex digest of a bearer secret. Stores keep only this form.
pub fn hash_token(token: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(token.as_bytes());
    format!("{:x}", hasher.finalize())
}

impl From<KvError> for RepositoryError {
    fn from(err: KvError) -> Self {
        match err {
            KvError::WatchViolated(key) => {
                RepositoryError::Conflict(format!("{} was modified concurrently", key))
            }
            KvError::WrongType(key) => {
                RepositoryError::UnexpectedError(format!("{} holds a value of another type", key))
            }
            KvError::Poisoned => {
                RepositoryError::UnexpectedError("keyspace lock poisoned".to_string())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hash_token_is_stable_hex() {
        let digest = hash_token("refresh-secret");

        assert_eq!(digest.len(), 64);
        assert!(digest.chars().all(|c| c.is_ascii_hexdigit()));
        assert_eq!(digest, hash_token("refresh-secret"));
        assert_ne!(digest, hash_token("refresh-secret2"));
    }
}
