/// JWT Token Minting and Validation
///
/// Signing material and algorithm come from configuration: an HMAC secret
/// for HS*, PEM keys for RS*/PS*/ES*/EdDSA.

use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{de::DeserializeOwned, Serialize};
use std::str::FromStr;
use uuid::Uuid;

use crate::auth::claims::{AccessClaims, ClaimRole, RefreshClaims};
use crate::configuration::JwtSettings;
use crate::error::{AppError, AuthError, ConfigError};

/// An encoded token together with the claims it carries
#[derive(Debug, Clone)]
pub struct Minted<C> {
    pub token: String,
    pub claims: C,
}

#[derive(Debug, Clone)]
pub struct TokenPair {
    pub access: Minted<AccessClaims>,
    pub refresh: Minted<RefreshClaims>,
}

#[derive(Clone)]
pub struct TokenIssuer {
    algorithm: Algorithm,
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
    issuer: String,
    access_token_expiry: i64,
    refresh_token_expiry: i64,
}

impl TokenIssuer {
    /// Build the issuer from settings
    ///
    /// # Errors
    /// Returns a configuration error for an unknown algorithm, missing or
    /// unparsable key material, or non-positive lifetimes
    pub fn from_settings(config: &JwtSettings) -> Result<Self, ConfigError> {
        let algorithm = Algorithm::from_str(&config.algorithm)
            .map_err(|_| ConfigError::InvalidValue(format!("jwt.algorithm {}", config.algorithm)))?;

        let (encoding_key, decoding_key) = match algorithm {
            Algorithm::HS256 | Algorithm::HS384 | Algorithm::HS512 => {
                let secret = config
                    .secret
                    .as_deref()
                    .filter(|s| !s.is_empty())
                    .ok_or_else(|| ConfigError::MissingRequired("jwt.secret".to_string()))?;
                (
                    EncodingKey::from_secret(secret.as_bytes()),
                    DecodingKey::from_secret(secret.as_bytes()),
                )
            }
            _ => {
                let private = pem(&config.private_key_pem, "jwt.private_key_pem")?;
                let public = pem(&config.public_key_pem, "jwt.public_key_pem")?;
                let invalid = |e: jsonwebtoken::errors::Error| ConfigError::ParseError(format!("jwt key: {}", e));
                match algorithm {
                    Algorithm::ES256 | Algorithm::ES384 => (
                        EncodingKey::from_ec_pem(private).map_err(invalid)?,
                        DecodingKey::from_ec_pem(public).map_err(invalid)?,
                    ),
                    Algorithm::EdDSA => (
                        EncodingKey::from_ed_pem(private).map_err(invalid)?,
                        DecodingKey::from_ed_pem(public).map_err(invalid)?,
                    ),
                    _ => (
                        EncodingKey::from_rsa_pem(private).map_err(invalid)?,
                        DecodingKey::from_rsa_pem(public).map_err(invalid)?,
                    ),
                }
            }
        };

        if config.access_token_expiry <= 0 || config.refresh_token_expiry <= 0 {
            return Err(ConfigError::InvalidValue("jwt token expiry must be positive".to_string()));
        }

        Ok(Self {
            algorithm,
            encoding_key,
            decoding_key,
            issuer: config.issuer.clone(),
            access_token_expiry: config.access_token_expiry,
            refresh_token_expiry: config.refresh_token_expiry,
        })
    }

    pub fn access_token_expiry(&self) -> i64 {
        self.access_token_expiry
    }

    pub fn refresh_token_expiry(&self) -> i64 {
        self.refresh_token_expiry
    }

    /// Mint a fresh access token bound to `session_id`
    pub fn mint_access(
        &self,
        session_id: Uuid,
        user_id: Uuid,
        username: &str,
        roles: Vec<ClaimRole>,
    ) -> Result<Minted<AccessClaims>, AppError> {
        let claims = AccessClaims::new(
            session_id,
            user_id,
            username.to_string(),
            roles,
            self.access_token_expiry,
            self.issuer.clone(),
        );
        let token = self.encode(&claims)?;
        Ok(Minted { token, claims })
    }

    /// Mint an access/refresh pair for a new session
    pub fn mint_pair(
        &self,
        session_id: Uuid,
        user_id: Uuid,
        username: &str,
        roles: Vec<ClaimRole>,
    ) -> Result<TokenPair, AppError> {
        let access = self.mint_access(session_id, user_id, username, roles)?;
        let refresh_claims =
            RefreshClaims::new(session_id, user_id, self.refresh_token_expiry, self.issuer.clone());
        let refresh = Minted {
            token: self.encode(&refresh_claims)?,
            claims: refresh_claims,
        };
        Ok(TokenPair { access, refresh })
    }

    /// Fully validate an access token (signature, issuer, expiry)
    pub fn validate_access(&self, token: &str) -> Result<AccessClaims, AuthError> {
        let claims: AccessClaims = self.decode(token, true).map_err(|e| {
            tracing::debug!(error = %e, "Access token rejected");
            AuthError::Unauthenticated
        })?;
        claims.user_id().map_err(|_| AuthError::Unauthenticated)?;
        Ok(claims)
    }

    /// Parse an access token for refresh: signature and issuer are checked,
    /// expiry is not
    pub fn parse_access_allow_expired(&self, token: &str) -> Result<AccessClaims, AuthError> {
        let claims: AccessClaims = self.decode(token, false).map_err(|e| {
            tracing::warn!(error = %e, "Malformed access token presented for refresh");
            AuthError::MalformedToken
        })?;
        claims.user_id()?;
        Ok(claims)
    }

    fn encode<C: Serialize>(&self, claims: &C) -> Result<String, AppError> {
        encode(&Header::new(self.algorithm), claims, &self.encoding_key)
            .map_err(|e| AppError::Internal(format!("Token generation failed: {}", e)))
    }

    fn decode<C: DeserializeOwned>(
        &self,
        token: &str,
        check_expiry: bool,
    ) -> Result<C, jsonwebtoken::errors::Error> {
        let mut validation = Validation::new(self.algorithm);
        validation.set_issuer(&[&self.issuer]);
        validation.validate_exp = check_expiry;
        validation.validate_nbf = check_expiry;
        decode::<C>(token, &self.decoding_key, &validation).map(|data| data.claims)
    }
}

fn pem<'a>(value: &'a Option<String>, name: &str) -> Result<&'a [u8], ConfigError> {
    value
        .as_deref()
        .filter(|s| !s.is_empty())
        .map(str::as_bytes)
        .ok_or_else(|| ConfigError::MissingRequired(name.to_string()))
}
