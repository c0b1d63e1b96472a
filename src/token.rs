#![forbid(unsafe_code)]

// Bearer tokens - mint test credentials and sanity-check configured ones

use jsonwebtoken::errors::ErrorKind;
use jsonwebtoken::{decode, encode, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use thiserror::Error;

pub const DEFAULT_TOKEN_LIFETIME: Duration = Duration::from_secs(7 * 24 * 60 * 60);

/// Claims the chat service expects in its tokens
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Claims {
    pub sub: String,
    pub username: String,
    pub iat: u64,
    pub exp: u64,
}

#[derive(Error, Debug)]
pub enum TokenError {
    #[error("System clock error")]
    Clock,

    #[error("JWT encode error: {0}")]
    Encode(String),

    #[error("Invalid token: {0}")]
    Invalid(String),

    #[error("Token expired")]
    Expired,

    #[error("Invalid user '{0}' (expected <id>:<username>)")]
    InvalidUser(String),
}

/// Result of inspecting a token without its signing secret
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TokenStatus {
    Valid { claims: Claims, expires_in: Duration },
    Expired { claims: Claims, expired_for: Duration },
}

fn now_secs() -> Result<u64, TokenError> {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .map_err(|_| TokenError::Clock)
}

pub fn create_token(
    user_id: &str,
    username: &str,
    secret: &str,
    lifetime: Duration,
) -> Result<String, TokenError> {
    create_token_at(user_id, username, secret, now_secs()?, lifetime)
}

fn create_token_at(
    user_id: &str,
    username: &str,
    secret: &str,
    issued_at: u64,
    lifetime: Duration,
) -> Result<String, TokenError> {
    let claims = Claims {
        sub: user_id.to_string(),
        username: username.to_string(),
        iat: issued_at,
        exp: issued_at + lifetime.as_secs(),
    };

    encode(
        &Header::default(),
        &claims,
        &EncodingKey::from_secret(secret.as_bytes()),
    )
    .map_err(|e| TokenError::Encode(e.to_string()))
}

pub fn validate_token(token: &str, secret: &str) -> Result<Claims, TokenError> {
    let data = decode::<Claims>(
        token,
        &DecodingKey::from_secret(secret.as_bytes()),
        &Validation::default(),
    )
    .map_err(|e| match e.kind() {
        ErrorKind::ExpiredSignature => TokenError::Expired,
        _ => TokenError::Invalid(e.to_string()),
    })?;

    Ok(data.claims)
}

/// Mint a token for a `<id>:<username>` pair and check it against the same secret
/// before handing it out.
pub fn mint_user_token(
    user: &str,
    secret: &str,
    lifetime: Duration,
) -> Result<(Claims, String), TokenError> {
    let (user_id, username) = user
        .split_once(':')
        .filter(|(id, name)| !id.is_empty() && !name.is_empty())
        .ok_or_else(|| TokenError::InvalidUser(user.to_string()))?;

    let token = create_token(user_id, username, secret, lifetime)?;
    let claims = validate_token(&token, secret)?;
    Ok((claims, token))
}

/// Decode a token's claims without the secret and report whether it has expired.
/// The signature is not checked; this only catches malformed or stale tokens
/// before the service rejects them.
pub fn inspect_token(token: &str) -> Result<TokenStatus, TokenError> {
    let mut validation = Validation::default();
    validation.insecure_disable_signature_validation();
    validation.validate_exp = false;
    validation.required_spec_claims.clear();

    let claims = decode::<Claims>(token, &DecodingKey::from_secret(&[]), &validation)
        .map_err(|e| TokenError::Invalid(e.to_string()))?
        .claims;

    let now = now_secs()?;
    if claims.exp <= now {
        let expired_for = Duration::from_secs(now - claims.exp);
        Ok(TokenStatus::Expired { claims, expired_for })
    } else {
        let expires_in = Duration::from_secs(claims.exp - now);
        Ok(TokenStatus::Valid { claims, expires_in })
    }
}
