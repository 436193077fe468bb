//! Connection authentication for the collaboration layer.
//!
//! Every WebSocket connection presents a bearer token at upgrade time. The
//! [`Authenticator`] verifies the HMAC signature and expiry and resolves the
//! token into an [`Identity`] that is bound to the connection for its whole
//! lifetime — all subsequent mutations are attributed to that identity.
//!
//! # Security
//!
//! - Tokens are size-checked BEFORE parsing (denial-of-service prevention)
//! - Only HS256 is accepted
//! - Error messages are intentionally generic to prevent information leakage
//! - The `sub` field in claims is redacted in Debug output

use crate::secret::{ExposeSecret, SecretString};
use crate::types::UserId;
use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

/// Maximum allowed token size in bytes (8KB).
///
/// Tokens larger than this are rejected before any base64 decoding or
/// signature verification happens, keeping oversized-token abuse cheap to
/// shed. Typical collaboration tokens are a few hundred bytes.
pub const MAX_TOKEN_SIZE_BYTES: usize = 8192;

/// Default clock skew tolerance applied to `exp`/`iat` validation.
pub const DEFAULT_CLOCK_SKEW: Duration = Duration::from_secs(300);

/// Errors that can occur while verifying a connection token.
///
/// All variants render the same client-facing message; the specific cause
/// is logged server-side at debug level.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AuthError {
    /// Token size exceeds [`MAX_TOKEN_SIZE_BYTES`].
    #[error("The access token is invalid or expired")]
    TokenTooLarge,

    /// Signature, structure, or claim validation failed.
    #[error("The access token is invalid or expired")]
    InvalidToken,

    /// Token `exp` is in the past (beyond the skew allowance).
    #[error("The access token is invalid or expired")]
    Expired,
}

/// Claims carried by a collaboration token.
///
/// `sub` holds the user identifier and is redacted in Debug output.
#[derive(Clone, Serialize, Deserialize)]
pub struct CollabClaims {
    /// Subject (user identifier) - redacted in Debug output.
    pub sub: String,

    /// Display name shown to other participants.
    pub name: String,

    /// Expiration timestamp (Unix epoch seconds).
    pub exp: i64,

    /// Issued-at timestamp (Unix epoch seconds).
    pub iat: i64,
}

impl fmt::Debug for CollabClaims {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CollabClaims")
            .field("sub", &"[REDACTED]")
            .field("name", &self.name)
            .field("exp", &self.exp)
            .field("iat", &self.iat)
            .finish()
    }
}

/// The authenticated identity resolved from a verified token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    /// User identifier (token subject).
    pub user_id: UserId,
    /// Display name shown to other participants.
    pub display_name: String,
}

/// Verifies connection tokens against a shared HMAC secret.
#[derive(Clone)]
pub struct Authenticator {
    decoding_key: DecodingKey,
    validation: Validation,
}

impl Authenticator {
    /// Create an authenticator from the shared signing secret.
    #[must_use]
    pub fn new(secret: &SecretString) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.leeway = DEFAULT_CLOCK_SKEW.as_secs();

        Self {
            decoding_key: DecodingKey::from_secret(secret.expose_secret().as_bytes()),
            validation,
        }
    }

    /// Verify a bearer token and resolve it to an [`Identity`].
    ///
    /// # Errors
    ///
    /// Returns [`AuthError::TokenTooLarge`] for oversized tokens,
    /// [`AuthError::Expired`] for tokens past their `exp`, and
    /// [`AuthError::InvalidToken`] for every other failure (bad signature,
    /// malformed structure, non-UUID subject).
    pub fn verify(&self, token: &str) -> Result<Identity, AuthError> {
        if token.len() > MAX_TOKEN_SIZE_BYTES {
            tracing::debug!(
                target: "tt.auth",
                token_len = token.len(),
                "Rejected oversized token"
            );
            return Err(AuthError::TokenTooLarge);
        }

        let data = decode::<CollabClaims>(token, &self.decoding_key, &self.validation).map_err(
            |e| match e.kind() {
                jsonwebtoken::errors::ErrorKind::ExpiredSignature => AuthError::Expired,
                _ => {
                    tracing::debug!(target: "tt.auth", error = %e, "Token verification failed");
                    AuthError::InvalidToken
                }
            },
        )?;

        let user_id = Uuid::parse_str(&data.claims.sub)
            .map(UserId)
            .map_err(|_| AuthError::InvalidToken)?;

        Ok(Identity {
            user_id,
            display_name: data.claims.name,
        })
    }
}

impl fmt::Debug for Authenticator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Authenticator")
            .field("decoding_key", &"[REDACTED]")
            .finish_non_exhaustive()
    }
}
