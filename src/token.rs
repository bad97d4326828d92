//! Manage json web tokens.

use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation, decode, encode};
use serde::{Deserialize, Serialize};

use crate::ldap::ExternalIdentity;

/// Default token lifetime, in seconds.
pub const DEFAULT_LIFETIME: u64 = 60 * 60 * 8; // 8 hours.

/// Errors related to tokens.
#[derive(Debug, thiserror::Error)]
pub enum TokenError {
    /// Bad signature, malformed or expired token.
    #[error("invalid token")]
    Invalid,

    #[error("token lifetime of {0} seconds is out of range")]
    Lifetime(u64),

    #[error("cannot sign token: {0}")]
    Signing(#[from] jsonwebtoken::errors::Error),
}

/// Source of the current time.
pub trait Clock: Send + Sync {
    /// Current Unix timestamp in seconds.
    fn now(&self) -> u64;
}

/// System clock using the OS time.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|time| time.as_secs())
            .unwrap_or_default()
    }
}

/// Pieces of information asserted on a JWT.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Claims {
    /// Login name, the value the directory filter was formatted with.
    pub sub: String,
    #[serde(flatten)]
    pub identity: ExternalIdentity,
    /// Identifies the time at which the JWT was issued.
    pub iat: u64,
    /// Identifies the expiration time on or after which the JWT must not be
    /// accepted for processing.
    pub exp: u64,
}

/// Sign and verify HS256 tokens.
#[derive(Clone)]
pub struct TokenManager {
    algorithm: Algorithm,
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
    lifetime: u64,
    clock: Arc<dyn Clock>,
}

impl TokenManager {
    /// Create a new [`TokenManager`] instance.
    pub fn new(key: &str, lifetime: u64) -> Self {
        Self {
            algorithm: Algorithm::HS256,
            encoding_key: EncodingKey::from_secret(key.as_bytes()),
            decoding_key: DecodingKey::from_secret(key.as_bytes()),
            lifetime,
            clock: Arc::new(SystemClock),
        }
    }

    /// Replace the clock used to date and check tokens.
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Token lifetime in seconds.
    pub fn lifetime(&self) -> u64 {
        self.lifetime
    }

    /// Create a new token for the user who logged in as `subject`,
    /// carrying `identity`.
    pub fn sign(&self, subject: &str, identity: &ExternalIdentity) -> Result<String, TokenError> {
        let iat = self.clock.now();
        let exp = iat
            .checked_add(self.lifetime)
            .ok_or(TokenError::Lifetime(self.lifetime))?;
        let claims = Claims {
            sub: subject.to_owned(),
            identity: identity.clone(),
            iat,
            exp,
        };

        Ok(encode(&Header::new(self.algorithm), &claims, &self.encoding_key)?)
    }

    /// Decode and check a token.
    pub fn verify(&self, token: &str) -> Result<Claims, TokenError> {
        let mut validation = Validation::new(self.algorithm);
        // expiry is checked against our own clock below.
        validation.validate_exp = false;
        validation.validate_aud = false;

        let claims = decode::<Claims>(token, &self.decoding_key, &validation)
            .map_err(|err| {
                tracing::debug!(%err, "token rejected");
                TokenError::Invalid
            })?
            .claims;

        if claims.exp <= self.clock.now() {
            tracing::debug!(exp = claims.exp, "token expired");
            return Err(TokenError::Invalid);
        }

        Ok(claims)
    }
}

#[cfg(test)]
pub(crate) struct FixedClock(pub std::sync::atomic::AtomicU64);

#[cfg(test)]
impl FixedClock {
    pub fn new(timestamp: u64) -> Arc<Self> {
        Arc::new(Self(timestamp.into()))
    }

    pub fn set(&self, timestamp: u64) {
        self.0.store(timestamp, std::sync::atomic::Ordering::SeqCst);
    }
}

#[cfg(test)]
impl Clock for FixedClock {
    fn now(&self) -> u64 {
        self.0.load(std::sync::atomic::Ordering::SeqCst)
    }
}
