/// Self-or-permitted gating
///
/// A caller may always act on their own account. Acting on another user
/// requires the operation's "-other" permission code in one of the roles
/// embedded in the verified access token.

use std::collections::HashSet;
use std::fmt;
use uuid::Uuid;

use crate::auth::claims::AccessClaims;
use crate::error::AuthError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Capability {
    GetOtherCredentials,
    LogoutOther,
    LogoutAllOther,
    DeleteOtherUser,
}

impl Capability {
    pub fn code(&self) -> &'static str {
        match self {
            Capability::GetOtherCredentials => "credential:get-other",
            Capability::LogoutOther => "credential:logout-other",
            Capability::LogoutAllOther => "credential:logout-all-other",
            Capability::DeleteOtherUser => "user:delete-other",
        }
    }
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

/// Union of permission codes across the caller's roles
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PermissionSet(HashSet<String>);

impl PermissionSet {
    pub fn from_codes<I, S>(codes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self(codes.into_iter().map(Into::into).collect())
    }

    pub fn can(&self, capability: Capability) -> bool {
        self.0.contains(capability.code())
    }
}

/// Identity of an authenticated request, built once from verified claims
#[derive(Debug, Clone)]
pub struct Caller {
    pub user_id: Uuid,
    pub session_id: Uuid,
    pub access_token_id: Uuid,
    pub username: String,
    pub permissions: PermissionSet,
}

impl Caller {
    pub fn from_claims(claims: &AccessClaims) -> Self {
        let permissions = PermissionSet::from_codes(
            claims
                .roles
                .iter()
                .flat_map(|role| role.permissions.iter().cloned()),
        );
        Self {
            user_id: claims.uid,
            session_id: claims.cid,
            access_token_id: claims.jti,
            username: claims.username.clone(),
            permissions,
        }
    }

    pub fn is_self(&self, target: Uuid) -> bool {
        self.user_id == target
    }

    /// Allow when `target` is the caller, otherwise require `capability`
    pub fn authorize_self_or(&self, target: Uuid, capability: Capability) -> Result<(), AuthError> {
        if self.is_self(target) || self.permissions.can(capability) {
            return Ok(());
        }
        tracing::warn!(
            caller = %self.user_id,
            target = %target,
            required = %capability,
            "Permission denied"
        );
        Err(AuthError::Unauthorized)
    }
}
