//! HTTP Basic credentials.

use axum::extract::FromRequestParts;
use axum::http::header;
use axum::http::request::Parts;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;

use crate::error::{Result, ServerError};

const BASIC: &str = "Basic";

/// Username and password sent with a request.
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"***")
            .finish()
    }
}

impl Credentials {
    /// Parse an `Authorization: Basic <base64(user:pass)>` header value.
    pub fn from_header(value: &str) -> Result<Self> {
        let invalid = || ServerError::BadRequest("not a valid http basic authorization header".into());

        let (scheme, encoded) = value.split_once(' ').ok_or_else(invalid)?;
        if scheme != BASIC {
            return Err(invalid());
        }

        let decoded = STANDARD.decode(encoded.trim()).map_err(|_| invalid())?;
        let decoded = String::from_utf8(decoded).map_err(|_| invalid())?;

        match decoded.split(':').collect::<Vec<_>>()[..] {
            [username, password] => Ok(Self {
                username: username.to_owned(),
                password: password.to_owned(),
            }),
            _ => Err(invalid()),
        }
    }
}

impl<S> FromRequestParts<S> for Credentials
where
    S: Send + Sync,
{
    type Rejection = ServerError;

    /// A missing header is unauthorized, a malformed one a bad request.
    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self> {
        let value = parts
            .headers
            .get(header::AUTHORIZATION)
            .ok_or(ServerError::Unauthorized)?
            .to_str()
            .map_err(|_| ServerError::BadRequest("non-ASCII authorization header".into()))?;

        Self::from_header(value)
    }
}
