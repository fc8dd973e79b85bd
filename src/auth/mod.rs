/// Authentication module
///
/// Handles JWT minting/validation, password hashing and
/// self-or-permitted authorization of callers.

mod claims;
mod jwt;
mod password;
mod permission;

pub use claims::{AccessClaims, ClaimRole, RefreshClaims};
pub use jwt::{Minted, TokenIssuer, TokenPair};
pub use password::{check_password_policy, hash_password, verify_password};
pub use permission::{Caller, Capability, PermissionSet};
