//! Exchange LDAP credentials for a token.

use axum::extract::State;

use crate::AppState;
use crate::credentials::Credentials;
use crate::error::{Result, ServerError};

/// `GET /auth` with an `Authorization: Basic` header.
///
/// Answers the signed token as plain text.
pub async fn handler(State(state): State<AppState>, credentials: Credentials) -> Result<String> {
    let Credentials { username, password } = credentials;

    if !state.authenticator.authenticate(&username, &password).await {
        return Err(ServerError::Unauthorized);
    }

    let mapping = &state.config.mapping;
    let entry = state
        .authenticator
        .get_attributes(&username, &mapping.ldap_attributes())
        .await?;
    let identity = mapping.to_external(&entry)?;

    tracing::info!(%username, groups = ?identity.groups, "token issued");
    Ok(state.token.sign(&username, &identity)?)
}
