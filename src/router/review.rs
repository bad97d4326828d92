//! Kubernetes webhook token authentication.

use axum::Json;
use axum::extract::State;
use serde::{Deserialize, Serialize};
use validator::{Validate, ValidationError};

use crate::AppState;
use crate::error::Result;
use crate::ldap::ExternalIdentity;
use crate::router::Valid;

pub const API_VERSION: &str = "authentication.k8s.io/v1beta1";
pub const KIND: &str = "TokenReview";

fn validate_api_version(api_version: &str) -> std::result::Result<(), ValidationError> {
    if api_version != API_VERSION {
        return Err(ValidationError::new("invalid_api_version"));
    }

    Ok(())
}

fn validate_kind(kind: &str) -> std::result::Result<(), ValidationError> {
    if kind != KIND {
        return Err(ValidationError::new("invalid_kind"));
    }

    Ok(())
}

#[derive(Debug, Validate, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Body {
    #[validate(custom(
        function = "validate_api_version",
        message = "\"apiVersion\" must be \"authentication.k8s.io/v1beta1\"."
    ))]
    api_version: String,
    #[validate(custom(function = "validate_kind", message = "\"kind\" must be \"TokenReview\"."))]
    kind: String,
    #[validate(nested)]
    spec: Spec,
}

#[derive(Debug, Validate, Deserialize)]
pub struct Spec {
    #[validate(length(min = 1, message = "\"spec.token\" must not be empty."))]
    token: String,
}

#[derive(Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Response {
    api_version: String,
    kind: String,
    status: Status,
}

#[derive(Debug, PartialEq, Serialize, Deserialize)]
pub struct Status {
    authenticated: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    user: Option<ExternalIdentity>,
}

/// `POST /token`, answer whether a token is a live identity.
///
/// The identity is resolved again from the directory, claims embedded in the
/// token are only trusted for the login name (`sub`).
pub async fn handler(State(state): State<AppState>, Valid(body): Valid<Body>) -> Json<Response> {
    let status = match review(&state, &body.spec.token).await {
        Ok(user) => Status {
            authenticated: true,
            user: Some(user),
        },
        Err(err) => {
            tracing::info!(%err, "token review failed");
            Status {
                authenticated: false,
                user: None,
            }
        },
    };

    let result = if status.authenticated { "authenticated" } else { "rejected" };
    metrics::counter!("token_reviews_total", "result" => result).increment(1);

    Json(Response {
        api_version: API_VERSION.to_owned(),
        kind: KIND.to_owned(),
        status,
    })
}

async fn review(state: &AppState, token: &str) -> Result<ExternalIdentity> {
    let claims = state.token.verify(token)?;

    let mapping = &state.config.mapping;
    let entry = state
        .authenticator
        .get_attributes(&claims.sub, &mapping.ldap_attributes())
        .await?;

    Ok(mapping.to_external(&entry)?)
}
