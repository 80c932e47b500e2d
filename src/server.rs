//! HTTP admission for webhook events.
//!
//! The sender gets an immediate 200 once the signature checks out; the
//! pipeline runs on a spawned task and reports through telemetry only.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::State,
    http::{HeaderMap, StatusCode},
    response::Json,
    routing::{get, post},
    Router,
};
use serde_json::{json, Value};
use tracing::{error, info, warn};

use crate::events::{parse_event, verify_signature};
use crate::pipeline::Coordinator;

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    /// Webhook signing secret.
    pub webhook_secret: String,
    /// Pipeline coordinator.
    pub coordinator: Arc<Coordinator>,
    /// Flipped once startup wiring is complete.
    pub ready: Arc<AtomicBool>,
}

/// Build the HTTP router.
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/webhook", post(webhook_handler))
        .route("/health", get(health_check))
        .route("/ready", get(readiness_check))
        .with_state(state)
}

/// Liveness probe.
async fn health_check() -> Json<Value> {
    Json(json!({ "status": "healthy" }))
}

/// Readiness probe.
async fn readiness_check(State(state): State<AppState>) -> Result<Json<Value>, StatusCode> {
    if state.ready.load(Ordering::SeqCst) {
        Ok(Json(json!({ "status": "ready" })))
    } else {
        Err(StatusCode::SERVICE_UNAVAILABLE)
    }
}

/// Handle an incoming GitHub webhook.
///
/// Verifies the `X-Hub-Signature-256` HMAC, parses the payload by the
/// `X-GitHub-Event` header, acknowledges immediately and processes the
/// event on a background task.
async fn webhook_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<Value>, StatusCode> {
    let signature = headers
        .get("x-hub-signature-256")
        .and_then(|value| value.to_str().ok())
        .unwrap_or_default();
    if !verify_signature(&body, signature, &state.webhook_secret) {
        warn!("webhook signature verification failed");
        return Err(StatusCode::UNAUTHORIZED);
    }

    let event_name = headers
        .get("x-github-event")
        .and_then(|value| value.to_str().ok())
        .unwrap_or_default()
        .to_string();
    let delivery = headers
        .get("x-github-delivery")
        .and_then(|value| value.to_str().ok())
        .unwrap_or("unknown")
        .to_string();

    info!(event = %event_name, delivery = %delivery, "received webhook event");

    let event = match parse_event(&event_name, &body) {
        Ok(Some(event)) => event,
        Ok(None) => {
            info!(event = %event_name, "ignoring unhandled webhook event type");
            return Ok(Json(json!({
                "status": "ignored",
                "reason": "unhandled_event_type"
            })));
        }
        Err(err) => {
            error!(error = %err, "failed to parse webhook payload");
            return Err(StatusCode::BAD_REQUEST);
        }
    };

    // Acknowledge before the pipeline runs; outcomes surface via
    // telemetry, not this response.
    let coordinator = Arc::clone(&state.coordinator);
    tokio::spawn(async move {
        match coordinator.handle_event(event).await {
            Ok(()) => info!(delivery = %delivery, "webhook processed successfully"),
            Err(err) => error!(delivery = %delivery, error = %err, "webhook processing failed"),
        }
    });

    Ok(Json(json!({
        "status": "accepted",
        "message": "webhook event received and being processed"
    })))
}
