//! Credentials: password hashing, bearer token issuance and verification, and
//! the request extractor that guards mutating routes.

use std::sync::LazyLock;

use anyhow::anyhow;
use argon2::{
    Argon2, PasswordHash, PasswordHasher, PasswordVerifier, password_hash::SaltString,
};
use axum::{
    extract::FromRequestParts,
    http::{header, request::Parts},
};
use base64::{Engine, engine::general_purpose::URL_SAFE_NO_PAD};
use chrono::{DateTime, Duration, Utc};
use rand_core::OsRng;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::{api::AppState, error::ApiError};

const KEY_CONTEXT: &str = "reeltube 2026-10 bearer token signing key";

/// Checked when no account matches a login so that unknown emails cost the
/// same Argon2 work as a wrong password.
static DUMMY_HASH: LazyLock<String> =
    LazyLock::new(|| hash_password("reeltube-no-such-account").unwrap_or_default());

/// Hashes a password with Argon2id and a fresh random salt.
pub fn hash_password(password: &str) -> anyhow::Result<String> {
    let salt = SaltString::generate(&mut OsRng);
    let hash = Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        .map_err(|err| anyhow!("hashing password: {err}"))?;
    Ok(hash.to_string())
}

/// Checks a password against a stored PHC string. Unparseable hashes count as
/// a mismatch.
pub fn verify_password(password: &str, stored: &str) -> bool {
    match PasswordHash::new(stored) {
        Ok(parsed) => Argon2::default()
            .verify_password(password.as_bytes(), &parsed)
            .is_ok(),
        Err(err) => {
            debug!(%err, "stored password hash is unreadable");
            false
        }
    }
}

/// Login check over an optional stored hash. A missing account still runs a
/// full verification and always fails.
pub fn verify_login(password: &str, stored: Option<&str>) -> bool {
    match stored {
        Some(stored) => verify_password(password, stored),
        None => {
            verify_password(password, &DUMMY_HASH);
            false
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TokenError {
    #[error("malformed token")]
    Malformed,
    #[error("token signature mismatch")]
    BadSignature,
    #[error("token expired")]
    Expired,
}

#[derive(Debug, Serialize, Deserialize)]
struct Claims {
    sub: i64,
    iat: i64,
    exp: i64,
}

/// Signs and verifies bearer tokens with a key derived from the configured
/// secret.
///
/// Tokens read `<claims>.<mac>`, both parts base64url without padding. The
/// claims are JSON carrying the user id and issue/expiry times in seconds, the
/// MAC is a keyed BLAKE3 hash of the encoded claims.
pub struct TokenSigner {
    key: [u8; 32],
    ttl: Duration,
}

impl TokenSigner {
    pub fn new(secret: &str, ttl: Duration) -> Self {
        Self {
            key: blake3::derive_key(KEY_CONTEXT, secret.as_bytes()),
            ttl,
        }
    }

    pub fn issue(&self, user_id: i64) -> String {
        self.issue_at(user_id, Utc::now())
    }

    pub fn issue_at(&self, user_id: i64, now: DateTime<Utc>) -> String {
        let claims = Claims {
            sub: user_id,
            iat: now.timestamp(),
            exp: (now + self.ttl).timestamp(),
        };
        // Serializing three integers cannot fail.
        let json = serde_json::to_vec(&claims).unwrap_or_default();
        let payload = URL_SAFE_NO_PAD.encode(json);
        let mac = blake3::keyed_hash(&self.key, payload.as_bytes());
        format!("{payload}.{}", URL_SAFE_NO_PAD.encode(mac.as_bytes()))
    }

    /// Returns the user id bound to a valid, unexpired token.
    pub fn verify(&self, token: &str) -> Result<i64, TokenError> {
        self.verify_at(token, Utc::now())
    }

    pub fn verify_at(&self, token: &str, now: DateTime<Utc>) -> Result<i64, TokenError> {
        let (payload, signature) = token.split_once('.').ok_or(TokenError::Malformed)?;
        let signature: [u8; 32] = URL_SAFE_NO_PAD
            .decode(signature)
            .map_err(|_| TokenError::Malformed)?
            .try_into()
            .map_err(|_| TokenError::Malformed)?;

        // blake3::Hash equality is constant time.
        let expected = blake3::keyed_hash(&self.key, payload.as_bytes());
        if expected != blake3::Hash::from(signature) {
            return Err(TokenError::BadSignature);
        }

        let json = URL_SAFE_NO_PAD
            .decode(payload)
            .map_err(|_| TokenError::Malformed)?;
        let claims: Claims = serde_json::from_slice(&json).map_err(|_| TokenError::Malformed)?;
        if claims.exp <= now.timestamp() {
            return Err(TokenError::Expired);
        }
        Ok(claims.sub)
    }
}

/// Identity of the caller, resolved from `Authorization: Bearer <token>`.
#[derive(Debug, Clone, Copy)]
pub struct AuthUser(pub i64);

impl FromRequestParts<AppState> for AuthUser {
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, ApiError> {
        let value = parts
            .headers
            .get(header::AUTHORIZATION)
            .ok_or(ApiError::Unauthenticated("missing bearer token"))?;
        let token = value
            .to_str()
            .ok()
            .and_then(|raw| raw.strip_prefix("Bearer "))
            .map(str::trim)
            .filter(|token| !token.is_empty())
            .ok_or(ApiError::Unauthenticated("missing bearer token"))?;

        match state.tokens.verify(token) {
            Ok(user_id) => Ok(AuthUser(user_id)),
            Err(err) => {
                debug!(%err, "rejecting bearer token");
                Err(ApiError::Unauthenticated("invalid or expired token"))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn signer() -> TokenSigner {
        TokenSigner::new("test-secret", Duration::days(1))
    }

    #[test]
    fn password_hash_is_salted_and_verifies() {
        let first = hash_password("p").unwrap();
        let second = hash_password("p").unwrap();
        assert_ne!(first, second);
        assert!(first.starts_with("$argon2id$"));
        assert!(verify_password("p", &first));
        assert!(!verify_password("q", &first));
        assert!(!verify_password("p", "not-a-hash"));
    }

    #[test]
    fn missing_accounts_never_log_in() {
        assert!(DUMMY_HASH.starts_with("$argon2id$"));
        assert!(!verify_login("reeltube-no-such-account", None));
        assert!(!verify_login("p", None));

        let stored = hash_password("p").unwrap();
        assert!(verify_login("p", Some(&stored)));
        assert!(!verify_login("q", Some(&stored)));
    }

    #[test]
    fn token_roundtrip_resolves_user() {
        let signer = signer();
        let token = signer.issue(42);
        assert_eq!(signer.verify(&token), Ok(42));
    }

    #[test]
    fn token_expires_after_ttl() {
        let signer = signer();
        let issued = Utc::now();
        let token = signer.issue_at(7, issued);
        assert_eq!(
            signer.verify_at(&token, issued + Duration::hours(23)),
            Ok(7)
        );
        assert_eq!(
            signer.verify_at(&token, issued + Duration::days(1)),
            Err(TokenError::Expired)
        );
    }

    #[test]
    fn tampered_signature_is_rejected() {
        let signer = signer();
        let token = signer.issue(1);
        let (payload, signature) = token.split_once('.').unwrap();
        let mut bytes = URL_SAFE_NO_PAD.decode(signature).unwrap();
        bytes[0] ^= 0xff;
        let forged = format!("{payload}.{}", URL_SAFE_NO_PAD.encode(bytes));
        assert_eq!(signer.verify(&forged), Err(TokenError::BadSignature));
    }

    #[test]
    fn tampered_claims_are_rejected() {
        let signer = signer();
        let token = signer.issue(1);
        let (_, signature) = token.split_once('.').unwrap();
        let claims = URL_SAFE_NO_PAD.encode(br#"{"sub":2,"iat":0,"exp":9999999999}"#);
        let forged = format!("{claims}.{signature}");
        assert_eq!(signer.verify(&forged), Err(TokenError::BadSignature));
    }

    #[test]
    fn tokens_from_other_secrets_are_rejected() {
        let token = TokenSigner::new("other", Duration::days(1)).issue(1);
        assert_eq!(signer().verify(&token), Err(TokenError::BadSignature));
    }

    #[test]
    fn garbage_is_malformed() {
        let signer = signer();
        assert_eq!(signer.verify("nope"), Err(TokenError::Malformed));
        assert_eq!(signer.verify("a.b"), Err(TokenError::Malformed));
    }
}
