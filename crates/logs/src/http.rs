//! HTTP surface of the log proxy.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use anyhow::Context;
use axum::{
    extract::{Query, State},
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use metrics::{counter, histogram};
use serde::Deserialize;
use tokio::net::TcpListener;
use tracing::{info, warn};

use crate::{LogProxy, LogQuery};

#[derive(Debug, Default, Deserialize)]
pub struct LogParams {
    #[serde(rename = "logURL")]
    pub log_url: Option<String>,
    #[serde(rename = "jsonPath")]
    pub json_path: Option<String>,
}

pub fn router(proxy: Arc<LogProxy>) -> Router {
    Router::new().route("/logs", get(logs)).route("/healthz", get(healthz)).with_state(proxy)
}

async fn healthz() -> &'static str {
    "ok"
}

async fn logs(State(proxy): State<Arc<LogProxy>>, Query(params): Query<LogParams>) -> Response {
    counter!("logs_requests_total", 1u64);
    let started = Instant::now();
    let query = LogQuery { log_url: params.log_url, json_path: params.json_path, ..Default::default() };
    let resp = match proxy.retrieve(query).await {
        Ok(resp) => resp,
        Err(e) => {
            warn!(error = %e, status = e.status().as_u16(), "log retrieval failed");
            counter!("logs_errors_total", 1u64);
            e.into_response()
        }
    };
    histogram!("logs_first_byte_ms", started.elapsed().as_secs_f64() * 1000.0);
    resp
}

/// Serve the log proxy on `addr` until the server fails.
pub async fn serve(addr: SocketAddr, proxy: Arc<LogProxy>) -> anyhow::Result<()> {
    let listener = TcpListener::bind(addr).await.with_context(|| format!("binding log proxy on {addr}"))?;
    info!(addr = %addr, "log proxy listening");
    axum::serve(listener, router(proxy)).await.context("log proxy failed")?;
    Ok(())
}
