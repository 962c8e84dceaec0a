//! Axum-based webhook gateway for Baileys provider deliveries.
//!
//! - `GET /health` liveness probe
//! - `POST /webhooks/baileys/{inbox_id}` event intake
//!
//! Ingestion is blocking (SQLite, media downloads) and runs on the blocking
//! pool with its own store connection per request.

use crate::clock::SystemClock;
use crate::config::Config;
use crate::ingest::{IngestError, Ingestor, MessageOutcome};
use crate::media::HttpMediaFetcher;
use crate::payload::EventEnvelope;
use crate::store::{Inbox, InboxStore, SqliteStore};
use anyhow::{Context, Result};
use axum::{
    body::Bytes,
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Json},
    routing::{get, post},
    Router,
};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::timeout::TimeoutLayer;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
}

/// What a webhook delivery resolved to, before HTTP mapping.
enum WebhookDisposition {
    UnknownInbox,
    BadVerifyToken,
    Processed(Result<Vec<MessageOutcome>, IngestError>),
}

pub async fn run_gateway(config: Config) -> Result<()> {
    let host = config.gateway.host.clone();
    let port = config.gateway.port;

    // Create the schema once up front so request handlers only open it.
    let init_config = config.clone();
    tokio::task::spawn_blocking(move || SqliteStore::from_config(&init_config).map(drop))
        .await
        .context("Database initialization task failed")??;

    let addr: SocketAddr = format!("{host}:{port}")
        .parse()
        .with_context(|| format!("Invalid gateway address {host}:{port}"))?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    let actual_port = listener.local_addr()?.port();

    tracing::info!(
        db = %config.resolved_db_path().display(),
        "Gateway listening on http://{host}:{actual_port}"
    );
    println!("🌐 Webhook gateway listening on http://{host}:{actual_port}");
    println!("   POST /webhooks/baileys/<inbox_id>");
    println!("   GET  /health");
    println!("   Press Ctrl+C to stop.");

    let app = router(AppState {
        config: Arc::new(config),
    });

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("Gateway stopped");
    Ok(())
}

pub fn router(state: AppState) -> Router {
    let max_body_bytes = state.config.gateway.max_body_bytes;
    let request_timeout = Duration::from_secs(state.config.gateway.request_timeout_secs);

    Router::new()
        .route("/health", get(handle_health))
        .route("/webhooks/baileys/{inbox_id}", post(handle_baileys_webhook))
        .with_state(state)
        .layer(RequestBodyLimitLayer::new(max_body_bytes))
        .layer(TimeoutLayer::with_status_code(
            StatusCode::REQUEST_TIMEOUT,
            request_timeout,
        ))
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for shutdown signal: {e}");
    }
}

// ══════════════════════════════════════════════════════════════════════════════
// AXUM HANDLERS
// ══════════════════════════════════════════════════════════════════════════════

/// GET /health
async fn handle_health() -> impl IntoResponse {
    Json(serde_json::json!({ "status": "ok" }))
}

/// POST /webhooks/baileys/{inbox_id}
async fn handle_baileys_webhook(
    State(state): State<AppState>,
    Path(inbox_id): Path<i64>,
    body: Bytes,
) -> impl IntoResponse {
    let Ok(envelope) = serde_json::from_slice::<EventEnvelope>(&body) else {
        return (
            StatusCode::BAD_REQUEST,
            Json(serde_json::json!({"error": "Invalid JSON payload"})),
        );
    };

    let config = Arc::clone(&state.config);
    let joined =
        tokio::task::spawn_blocking(move || process_webhook(&config, inbox_id, &envelope)).await;

    let disposition = match joined {
        Ok(Ok(disposition)) => disposition,
        Ok(Err(e)) => {
            tracing::error!(inbox_id, "Webhook processing failed: {e:#}");
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(serde_json::json!({"error": "Internal error"})),
            );
        }
        Err(e) => {
            tracing::error!(inbox_id, "Webhook worker panicked: {e}");
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(serde_json::json!({"error": "Internal error"})),
            );
        }
    };

    match disposition {
        WebhookDisposition::UnknownInbox => (
            StatusCode::NOT_FOUND,
            Json(serde_json::json!({"error": "Unknown inbox"})),
        ),
        WebhookDisposition::BadVerifyToken => {
            tracing::warn!(inbox_id, "Webhook verify token mismatch");
            (
                StatusCode::UNAUTHORIZED,
                Json(serde_json::json!({"error": "Invalid webhook verify token"})),
            )
        }
        WebhookDisposition::Processed(Ok(outcomes)) => (
            StatusCode::OK,
            Json(serde_json::json!({"status": "ok", "outcomes": outcomes})),
        ),
        WebhookDisposition::Processed(Err(IngestError::InvalidEnvelope(e))) => (
            StatusCode::BAD_REQUEST,
            Json(serde_json::json!({"error": format!("Invalid event data: {e}")})),
        ),
        WebhookDisposition::Processed(Err(e @ IngestError::Store(_))) => {
            tracing::error!(inbox_id, "Store unavailable during ingest: {e}");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(serde_json::json!({"error": "Storage unavailable, retry later"})),
            )
        }
    }
}

/// Blocking half of the webhook handler.
fn process_webhook(
    config: &Config,
    inbox_id: i64,
    envelope: &EventEnvelope,
) -> Result<WebhookDisposition> {
    let store = SqliteStore::from_config(config)?;
    let Some(inbox) = store.find_inbox(inbox_id)? else {
        return Ok(WebhookDisposition::UnknownInbox);
    };
    if !verify_token_matches(&inbox, envelope.webhook_verify_token.as_deref()) {
        return Ok(WebhookDisposition::BadVerifyToken);
    }

    let fetcher = HttpMediaFetcher::new(&config.media)?;
    let result = Ingestor::new(&store, &fetcher, &SystemClock).ingest(&inbox, envelope);
    Ok(WebhookDisposition::Processed(result))
}

/// Inboxes without a token accept any delivery.
fn verify_token_matches(inbox: &Inbox, provided: Option<&str>) -> bool {
    match inbox.verify_token.as_deref().filter(|t| !t.is_empty()) {
        None => true,
        Some(expected) => provided.is_some_and(|given| constant_time_eq(expected, given)),
    }
}

/// Length-independent comparison of two secrets.
fn constant_time_eq(a: &str, b: &str) -> bool {
    let a = a.as_bytes();
    let b = b.as_bytes();

    let len_diff = a.len() ^ b.len();
    let max_len = a.len().max(b.len());
    let mut byte_diff = 0u8;
    for i in 0..max_len {
        let x = *a.get(i).unwrap_or(&0);
        let y = *b.get(i).unwrap_or(&0);
        byte_diff |= x ^ y;
    }
    (len_diff == 0) & (byte_diff == 0)
}
