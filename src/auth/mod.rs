//! Credential store: password hashing, session tokens and one-off
//! verification/reset tokens.

use chrono::{DateTime, Duration, Utc};
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use rand::distributions::Alphanumeric;
use rand::Rng;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Length of verification and reset tokens
pub const RANDOM_TOKEN_LEN: usize = 32;

#[cfg(not(test))]
const BCRYPT_COST: u32 = bcrypt::DEFAULT_COST;
#[cfg(test)]
const BCRYPT_COST: u32 = 4;

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("invalid token: {0}")]
    InvalidToken(#[from] jsonwebtoken::errors::Error),
    #[error("token has no subject")]
    MissingSubject,
    #[error("password hashing failed: {0}")]
    Hash(#[from] bcrypt::BcryptError),
}

/// How long an email verification link stays valid
pub fn email_verification_ttl() -> Duration {
    Duration::hours(24)
}

/// How long a password reset link stays valid
pub fn password_reset_ttl() -> Duration {
    Duration::hours(1)
}

pub fn hash_password(plain: &str) -> Result<String, AuthError> {
    Ok(bcrypt::hash(plain, BCRYPT_COST)?)
}

/// A malformed stored hash never verifies
pub fn verify_password(plain: &str, hashed: &str) -> bool {
    bcrypt::verify(plain, hashed).unwrap_or(false)
}

pub fn generate_random_token(len: usize) -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(len)
        .map(char::from)
        .collect()
}

/// A token without an expiry, or whose expiry has passed, is dead
pub fn token_is_live(expires: Option<DateTime<Utc>>, now: DateTime<Utc>) -> bool {
    matches!(expires, Some(at) if at > now)
}

/// Session token claims
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Claims {
    pub sub: String,
    pub exp: i64,
    pub iat: i64,
}

/// Issues and verifies signed bearer tokens
#[derive(Clone)]
pub struct TokenIssuer {
    encoding: EncodingKey,
    decoding: DecodingKey,
    algorithm: Algorithm,
    lifetime: Duration,
}

impl TokenIssuer {
    pub fn new(secret: &str, algorithm: Algorithm, lifetime_minutes: i64) -> Self {
        Self {
            encoding: EncodingKey::from_secret(secret.as_bytes()),
            decoding: DecodingKey::from_secret(secret.as_bytes()),
            algorithm,
            lifetime: Duration::minutes(lifetime_minutes),
        }
    }

    /// Sign a token whose subject is the username
    pub fn issue(&self, username: &str) -> Result<String, AuthError> {
        let now = Utc::now();
        let claims = Claims {
            sub: username.to_string(),
            exp: (now + self.lifetime).timestamp(),
            iat: now.timestamp(),
        };
        Ok(encode(&Header::new(self.algorithm), &claims, &self.encoding)?)
    }

    /// Check signature and expiry, returning the claims
    pub fn verify(&self, token: &str) -> Result<Claims, AuthError> {
        let mut validation = Validation::new(self.algorithm);
        validation.leeway = 0;
        let data = decode::<Claims>(token, &self.decoding, &validation)?;
        if data.claims.sub.is_empty() {
            return Err(AuthError::MissingSubject);
        }
        Ok(data.claims)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_password_round_trip() {
        let hashed = hash_password("s3cret").unwrap();
        assert_ne!(hashed, "s3cret");
        assert!(verify_password("s3cret", &hashed));
        assert!(!verify_password("wrong", &hashed));
    }

    #[test]
    fn test_malformed_hash_does_not_verify() {
        assert!(!verify_password("anything", "not-a-bcrypt-hash"));
    }

    #[test]
    fn test_token_subject_is_username() {
        let issuer = TokenIssuer::new("secret", Algorithm::HS256, 30);
        let token = issuer.issue("alice").unwrap();
        let claims = issuer.verify(&token).unwrap();
        assert_eq!(claims.sub, "alice");
        assert!(claims.exp > claims.iat);
    }

    #[test]
    fn test_token_signed_with_other_secret_is_rejected() {
        let issuer = TokenIssuer::new("secret", Algorithm::HS256, 30);
        let other = TokenIssuer::new("other", Algorithm::HS256, 30);
        let token = other.issue("alice").unwrap();
        assert!(matches!(issuer.verify(&token), Err(AuthError::InvalidToken(_))));
    }

    #[test]
    fn test_expired_token_is_rejected() {
        let issuer = TokenIssuer::new("secret", Algorithm::HS256, -5);
        let token = issuer.issue("alice").unwrap();
        assert!(issuer.verify(&token).is_err());
    }

    #[test]
    fn test_empty_subject_is_rejected() {
        let issuer = TokenIssuer::new("secret", Algorithm::HS256, 30);
        let token = issuer.issue("").unwrap();
        assert!(matches!(issuer.verify(&token), Err(AuthError::MissingSubject)));
    }

    #[test]
    fn test_random_tokens() {
        let a = generate_random_token(RANDOM_TOKEN_LEN);
        let b = generate_random_token(RANDOM_TOKEN_LEN);
        assert_eq!(a.len(), 32);
        assert!(a.chars().all(|c| c.is_ascii_alphanumeric()));
        assert_ne!(a, b);
    }

    #[test]
    fn test_token_expiry_window() {
        let now = Utc::now();
        assert!(token_is_live(Some(now + email_verification_ttl()), now));
        assert!(!token_is_live(Some(now - Duration::seconds(1)), now));
        assert!(!token_is_live(None, now));
        assert!(password_reset_ttl() < email_verification_ttl());
    }
}
