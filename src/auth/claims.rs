/// JWT Claims structures
///
/// Access tokens carry the session binding (`cid` + `jti`) and a snapshot of
/// the caller's roles. Refresh tokens carry only the session id as `jti`.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::clients::RoleDto;
use crate::error::AuthError;

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct ClaimRole {
    pub id: Uuid,
    pub name: String,
    /// Flat `resource:action` codes
    pub permissions: Vec<String>,
}

impl From<&RoleDto> for ClaimRole {
    fn from(role: &RoleDto) -> Self {
        Self {
            id: role.id,
            name: role.name.clone(),
            permissions: role.permissions.iter().map(|p| p.code.clone()).collect(),
        }
    }
}

/// JWT Claims for access tokens
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct AccessClaims {
    pub iss: String,
    /// Subject (user ID as UUID string)
    pub sub: String,
    /// Access token id, bound to the session
    pub jti: Uuid,
    pub iat: i64,
    pub nbf: i64,
    pub exp: i64,
    /// Session (credential) id
    pub cid: Uuid,
    pub uid: Uuid,
    pub username: String,
    #[serde(default)]
    pub roles: Vec<ClaimRole>,
}

impl AccessClaims {
    pub fn new(
        session_id: Uuid,
        user_id: Uuid,
        username: String,
        roles: Vec<ClaimRole>,
        expiry_seconds: i64,
        issuer: String,
    ) -> Self {
        let now = chrono::Utc::now().timestamp();
        Self {
            iss: issuer,
            sub: user_id.to_string(),
            jti: Uuid::new_v4(),
            iat: now,
            nbf: now,
            exp: now + expiry_seconds,
            cid: session_id,
            uid: user_id,
            username,
            roles,
        }
    }

    /// `sub` and `uid` must agree
    pub fn user_id(&self) -> Result<Uuid, AuthError> {
        match Uuid::parse_str(&self.sub) {
            Ok(sub) if sub == self.uid => Ok(sub),
            _ => Err(AuthError::MalformedToken),
        }
    }
}

/// JWT Claims for refresh tokens
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct RefreshClaims {
    pub iss: String,
    pub sub: String,
    /// Session id
    pub jti: Uuid,
    pub iat: i64,
    pub nbf: i64,
    pub exp: i64,
}

impl RefreshClaims {
    pub fn new(session_id: Uuid, user_id: Uuid, expiry_seconds: i64, issuer: String) -> Self {
        let now = chrono::Utc::now().timestamp();
        Self {
            iss: issuer,
            sub: user_id.to_string(),
            jti: session_id,
            iat: now,
            nbf: now,
            exp: now + expiry_seconds,
        }
    }
}
