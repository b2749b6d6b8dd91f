//! Push webhook endpoint: turns a provider's push event into a repository
//! update request.

use axum::Router;
use axum::body::Bytes;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::routing::post;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use tracing::{info, warn};

use crate::AppState;
use crate::error::ApiError;

pub fn router() -> Router<AppState> {
    Router::new().route("/push", post(push_webhook))
}

async fn push_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<StatusCode, ApiError> {
    if let Some(secret) = &state.webhook_secret {
        let signature = headers
            .get("X-Hub-Signature-256")
            .and_then(|v| v.to_str().ok());
        if !verify_signature(secret, &body, signature) {
            warn!("push webhook with invalid signature");
            return Err(ApiError::Unauthorized("invalid signature".to_string()));
        }
    }

    let payload: serde_json::Value = serde_json::from_slice(&body)
        .map_err(|err| ApiError::BadRequest(format!("Invalid JSON: {}", err)))?;

    let Some(repository) = repository_url(&payload) else {
        return Err(ApiError::BadRequest(
            "payload carries no repository URL".to_string(),
        ));
    };

    info!(repository = %repository, "push webhook received");
    state.scheduler.enqueue(repository, false, None);

    Ok(StatusCode::ACCEPTED)
}

/// The repository URL of a push payload: an explicit `repo` field, or the
/// GitHub-style `repository.clone_url`.
fn repository_url(payload: &serde_json::Value) -> Option<&str> {
    payload
        .get("repo")
        .and_then(|v| v.as_str())
        .or_else(|| {
            payload
                .get("repository")
                .and_then(|r| r.get("clone_url"))
                .and_then(|v| v.as_str())
        })
        .filter(|url| !url.is_empty())
}

/// Verify an `sha256=<hex>` HMAC signature over the raw body.
fn verify_signature(secret: &str, body: &[u8], signature: Option<&str>) -> bool {
    let Some(signature) = signature else {
        return false;
    };
    let Some(sig_hex) = signature.strip_prefix("sha256=") else {
        return false;
    };
    let Ok(sig_bytes) = hex::decode(sig_hex) else {
        return false;
    };

    let Ok(mut mac) = Hmac::<Sha256>::new_from_slice(secret.as_bytes()) else {
        return false;
    };
    mac.update(body);
    mac.verify_slice(&sig_bytes).is_ok()
}
