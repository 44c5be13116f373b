#![forbid(unsafe_code)]

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    body::Body,
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
    routing::get,
    Router,
};
use bytes::Bytes;
use karchive_logs::{router, LogProxy, LogProxyConfig};

async fn spawn(app: Router) -> SocketAddr {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move { axum::serve(listener, app).await });
    addr
}

async fn backend() -> SocketAddr {
    let app = Router::new()
        .route("/plain", get(|| async { "first\n\nsecond\n" }))
        .route("/json", get(|| async { "{\"msg\":\"a\",\"lvl\":1}\n{\"lvl\":2}\n{\"msg\":\"b\"}\n" }))
        .route("/boom", get(|| async { (StatusCode::INTERNAL_SERVER_ERROR, "boom") }))
        .route("/missing", get(|| async { (StatusCode::NOT_FOUND, "gone") }))
        .route("/empty", get(|| async { "\n\n" }))
        .route(
            "/echo",
            get(|headers: HeaderMap| async move {
                let tenant = headers.get("x-tenant").and_then(|v| v.to_str().ok()).unwrap_or("none").to_string();
                format!("tenant={tenant}\n")
            }),
        )
        .route(
            "/drop",
            get(|| async {
                let body = async_stream::stream! {
                    yield Ok::<Bytes, std::io::Error>(Bytes::from_static(b"line1\n"));
                    tokio::time::sleep(Duration::from_millis(50)).await;
                    yield Err(std::io::Error::new(std::io::ErrorKind::BrokenPipe, "backend went away"));
                };
                Body::from_stream(body).into_response()
            }),
        );
    spawn(app).await
}

async fn proxy_with(headers: HashMap<String, String>) -> SocketAddr {
    let cfg = LogProxyConfig { timeout: Duration::from_secs(5), headers, ..Default::default() };
    let proxy = Arc::new(LogProxy::new(cfg).unwrap());
    spawn(router(proxy)).await
}

async fn get_logs(proxy: SocketAddr, query: &[(&str, String)]) -> (u16, String) {
    let resp = reqwest::Client::new().get(format!("http://{proxy}/logs")).query(query).send().await.unwrap();
    let status = resp.status().as_u16();
    (status, resp.text().await.unwrap())
}

#[tokio::test]
async fn streams_plain_lines_without_blanks() {
    let be = backend().await;
    let proxy = proxy_with(HashMap::new()).await;
    let (status, body) = get_logs(proxy, &[("logURL", format!("http://{be}/plain"))]).await;
    assert_eq!(status, 200);
    assert_eq!(body, "first\nsecond\n");
}

#[tokio::test]
async fn projects_json_lines_through_path() {
    let be = backend().await;
    let proxy = proxy_with(HashMap::new()).await;
    let (status, body) =
        get_logs(proxy, &[("logURL", format!("http://{be}/json")), ("jsonPath", "$.msg".to_string())]).await;
    assert_eq!(status, 200);
    assert_eq!(body, "a\nb\n");
}

#[tokio::test]
async fn backend_error_status_is_relayed() {
    let be = backend().await;
    let proxy = proxy_with(HashMap::new()).await;
    let (status, body) = get_logs(proxy, &[("logURL", format!("http://{be}/boom"))]).await;
    assert_eq!(status, 500);
    assert!(body.contains("boom"), "{body}");

    let (status, body) = get_logs(proxy, &[("logURL", format!("http://{be}/missing"))]).await;
    assert_eq!(status, 404);
    assert!(body.contains("gone"), "{body}");
}

#[tokio::test]
async fn missing_url_and_empty_logs_are_not_found() {
    let be = backend().await;
    let proxy = proxy_with(HashMap::new()).await;
    let (status, _) = get_logs(proxy, &[]).await;
    assert_eq!(status, 404);
    let (status, _) = get_logs(proxy, &[("logURL", String::new())]).await;
    assert_eq!(status, 404);
    let (status, body) = get_logs(proxy, &[("logURL", format!("http://{be}/empty"))]).await;
    assert_eq!(status, 404);
    assert!(body.contains("no logs"), "{body}");
}

#[tokio::test]
async fn configured_headers_reach_the_backend() {
    let be = backend().await;
    let headers = HashMap::from([("X-Tenant".to_string(), "team-a".to_string())]);
    let proxy = proxy_with(headers).await;
    let (status, body) = get_logs(proxy, &[("logURL", format!("http://{be}/echo"))]).await;
    assert_eq!(status, 200);
    assert_eq!(body, "tenant=team-a\n");
}

#[tokio::test]
async fn unreachable_backend_is_internal_error() {
    let proxy = proxy_with(HashMap::new()).await;
    let (status, _) = get_logs(proxy, &[("logURL", "http://127.0.0.1:1/logs".to_string())]).await;
    assert_eq!(status, 500);
}

#[tokio::test]
async fn backend_drop_after_first_line_truncates_response() {
    let be = backend().await;
    let proxy = proxy_with(HashMap::new()).await;
    let (status, body) = get_logs(proxy, &[("logURL", format!("http://{be}/drop"))]).await;
    assert_eq!(status, 200);
    assert_eq!(body, "line1\n");
}
