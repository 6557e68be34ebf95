//! Webhook ingest server.
//!
//! A small axum app: the messaging gateway POSTs event envelopes to
//! `/webhook`, optionally HMAC-signed; envelopes are normalized and handed
//! to the engine, and the request is acknowledged immediately so the
//! gateway never waits on reply generation. Body limits and a request
//! timeout bound what a misbehaving peer can cost us.

use std::sync::Arc;
use std::time::Duration;

use axum::body::Bytes;
use axum::extract::{Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Json};
use axum::routing::get;
use axum::Router;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::timeout::TimeoutLayer;
use tracing::{info, warn};

use crate::channels::whatsapp::normalize_event;
use crate::config::Config;
use crate::engine::Engine;

/// Maximum request body size (256KB) — webhook envelopes are small.
pub const MAX_BODY_SIZE: usize = 262_144;
/// Request timeout — ingest never blocks on downstream work.
pub const REQUEST_TIMEOUT_SECS: u64 = 30;

#[derive(Clone)]
pub struct GatewayState {
    engine: Arc<Engine>,
    webhook_secret: Option<String>,
    verify_token: Option<String>,
}

impl GatewayState {
    pub fn new(
        engine: Arc<Engine>,
        webhook_secret: Option<String>,
        verify_token: Option<String>,
    ) -> Self {
        Self {
            engine,
            webhook_secret: webhook_secret.filter(|s| !s.is_empty()),
            verify_token: verify_token.filter(|s| !s.is_empty()),
        }
    }
}

pub fn router(state: GatewayState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/webhook", get(verify_subscription).post(receive_webhook))
        .layer(RequestBodyLimitLayer::new(MAX_BODY_SIZE))
        .layer(TimeoutLayer::new(Duration::from_secs(REQUEST_TIMEOUT_SECS)))
        .with_state(state)
}

/// Bind and serve until the process is told to stop.
pub async fn serve(config: &Config, engine: Arc<Engine>) -> anyhow::Result<()> {
    let whatsapp = config.channels_config.whatsapp.as_ref();
    let state = GatewayState::new(
        engine,
        whatsapp.map(|w| w.webhook_secret.clone()),
        whatsapp.map(|w| w.verify_token.clone()),
    );
    let addr = format!("{}:{}", config.gateway.host, config.gateway.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!("webhook ingest listening on {addr}");
    axum::serve(listener, router(state)).await?;
    Ok(())
}

async fn health() -> impl IntoResponse {
    Json(serde_json::json!({ "status": "ok" }))
}

#[derive(serde::Deserialize)]
struct VerifyParams {
    #[serde(rename = "hub.mode")]
    mode: Option<String>,
    #[serde(rename = "hub.verify_token")]
    verify_token: Option<String>,
    #[serde(rename = "hub.challenge")]
    challenge: Option<String>,
}

/// Subscription handshake: echo the challenge back when the token matches.
async fn verify_subscription(
    State(state): State<GatewayState>,
    Query(params): Query<VerifyParams>,
) -> impl IntoResponse {
    let token_matches = match (&state.verify_token, &params.verify_token) {
        (Some(expected), Some(given)) => expected == given,
        (None, _) => true,
        _ => false,
    };
    if params.mode.as_deref() == Some("subscribe") && token_matches {
        (StatusCode::OK, params.challenge.unwrap_or_default())
    } else {
        (StatusCode::FORBIDDEN, String::new())
    }
}

async fn receive_webhook(
    State(state): State<GatewayState>,
    headers: HeaderMap,
    body: Bytes,
) -> impl IntoResponse {
    if let Some(secret) = &state.webhook_secret {
        let header = headers
            .get("x-hub-signature-256")
            .and_then(|v| v.to_str().ok());
        if !signature_valid(secret, &body, header) {
            warn!("webhook rejected: bad or missing signature");
            return (
                StatusCode::UNAUTHORIZED,
                Json(serde_json::json!({ "error": "invalid signature" })),
            );
        }
    }

    let parsed: serde_json::Value = match serde_json::from_slice(&body) {
        Ok(value) => value,
        Err(e) => {
            warn!("webhook rejected: malformed JSON: {e}");
            return (
                StatusCode::BAD_REQUEST,
                Json(serde_json::json!({ "error": "malformed body" })),
            );
        }
    };

    let envelopes: Vec<serde_json::Value> = match parsed {
        serde_json::Value::Array(items) => items,
        single => vec![single],
    };

    let mut accepted = 0usize;
    for raw in &envelopes {
        if let Some(event) = normalize_event(raw) {
            accepted += 1;
            let engine = Arc::clone(&state.engine);
            // Ack fast; classification and reply generation continue in
            // their own task.
            tokio::spawn(async move {
                engine.handle_event(event).await;
            });
        }
    }

    (
        StatusCode::OK,
        Json(serde_json::json!({ "status": "ok", "accepted": accepted })),
    )
}

/// Constant-length HMAC-SHA256 check of `sha256=<hex>` signatures.
fn signature_valid(secret: &str, body: &[u8], header: Option<&str>) -> bool {
    let Some(header) = header else {
        return false;
    };
    let Some(hex_digest) = header.strip_prefix("sha256=") else {
        return false;
    };
    let Ok(expected) = hex::decode(hex_digest) else {
        return false;
    };
    let Ok(mut mac) = Hmac::<Sha256>::new_from_slice(secret.as_bytes()) else {
        return false;
    };
    mac.update(body);
    mac.verify_slice(&expected).is_ok()
}
