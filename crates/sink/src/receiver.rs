//! CloudEvents HTTP intake (binary and structured content modes).

use std::net::SocketAddr;

use anyhow::Context;
use axum::{
    extract::State,
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Router,
};
use bytes::Bytes;
use karchive_core::IngestionEnvelope;
use serde::Deserialize;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tracing::{info, warn};

const STRUCTURED_CONTENT_TYPE: &str = "application/cloudevents+json";

#[derive(Debug, thiserror::Error)]
pub enum EnvelopeError {
    #[error("missing ce-id header")]
    MissingId,
    #[error("invalid structured cloudevent: {0}")]
    Structured(#[from] serde_json::Error),
    #[error("cloudevent carries no data")]
    MissingData,
}

#[derive(Debug, Deserialize)]
struct StructuredEvent {
    id: String,
    #[serde(default)]
    datacontenttype: Option<String>,
    #[serde(default)]
    data: Option<serde_json::Value>,
}

/// Build an envelope from an inbound request.
pub fn envelope_from_request(headers: &HeaderMap, body: Bytes) -> Result<IngestionEnvelope, EnvelopeError> {
    let content_type = headers.get(header::CONTENT_TYPE).and_then(|v| v.to_str().ok()).map(str::to_string);
    if content_type.as_deref().is_some_and(|ct| ct.starts_with(STRUCTURED_CONTENT_TYPE)) {
        let ev: StructuredEvent = serde_json::from_slice(&body)?;
        let payload = match ev.data {
            Some(serde_json::Value::String(s)) => Bytes::from(s),
            Some(v) => Bytes::from(serde_json::to_vec(&v)?),
            None => return Err(EnvelopeError::MissingData),
        };
        return Ok(IngestionEnvelope::new(ev.id, ev.datacontenttype, payload));
    }
    let id = headers
        .get("ce-id")
        .and_then(|v| v.to_str().ok())
        .filter(|s| !s.is_empty())
        .ok_or(EnvelopeError::MissingId)?;
    Ok(IngestionEnvelope::new(id, content_type, body))
}

#[derive(Clone)]
struct ReceiverState {
    tx: mpsc::Sender<IngestionEnvelope>,
}

pub fn router(tx: mpsc::Sender<IngestionEnvelope>) -> Router {
    Router::new()
        .route("/", post(receive))
        .route("/healthz", get(healthz))
        .with_state(ReceiverState { tx })
}

async fn healthz() -> &'static str {
    "ok"
}

async fn receive(State(state): State<ReceiverState>, headers: HeaderMap, body: Bytes) -> Response {
    let env = match envelope_from_request(&headers, body) {
        Ok(env) => env,
        Err(e) => {
            warn!(error = %e, "rejected inbound event");
            return (StatusCode::BAD_REQUEST, e.to_string()).into_response();
        }
    };
    match state.tx.send(env).await {
        Ok(()) => StatusCode::ACCEPTED.into_response(),
        Err(_) => (StatusCode::SERVICE_UNAVAILABLE, "event queue closed").into_response(),
    }
}

/// Serve the receiver on `addr` until the server fails.
pub async fn serve(addr: SocketAddr, tx: mpsc::Sender<IngestionEnvelope>) -> anyhow::Result<()> {
    let listener = TcpListener::bind(addr).await.with_context(|| format!("binding sink receiver on {addr}"))?;
    info!(addr = %addr, "sink receiver listening");
    axum::serve(listener, router(tx)).await.context("sink receiver failed")?;
    Ok(())
}
