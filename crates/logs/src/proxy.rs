use std::collections::HashMap;
use std::convert::Infallible;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::{
    body::Body,
    http::header,
    response::{IntoResponse, Response},
};
use bytes::Bytes;
use futures::{Stream, StreamExt};
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use tracing::{error, info, warn};

use crate::{LineReader, LogError, Projection};

/// Diagnostic bytes of a failed backend response kept in the error.
pub const BACKEND_BODY_LIMIT: usize = 1024;

/// One log retrieval request.
#[derive(Debug, Clone, Default)]
pub struct LogQuery {
    pub log_url: Option<String>,
    pub json_path: Option<String>,
    /// Sent on top of the configured headers.
    pub headers: HashMap<String, String>,
}

#[derive(Debug, Clone)]
pub struct LogProxyConfig {
    /// Covers connect, response headers and the full body read.
    pub timeout: Duration,
    /// Skip TLS certificate verification for backend calls. Opt-in only.
    pub insecure_skip_verify: bool,
    /// Injected into every backend request.
    pub headers: HashMap<String, String>,
}

impl Default for LogProxyConfig {
    fn default() -> Self {
        Self { timeout: Duration::from_secs(60), insecure_skip_verify: false, headers: HashMap::new() }
    }
}

pub struct LogProxy {
    client: reqwest::Client,
    headers: HeaderMap,
}

impl LogProxy {
    pub fn new(cfg: LogProxyConfig) -> Result<Self> {
        if cfg.insecure_skip_verify {
            warn!("TLS certificate verification is disabled for log backend requests");
        }
        let client = reqwest::Client::builder()
            .timeout(cfg.timeout)
            .danger_accept_invalid_certs(cfg.insecure_skip_verify)
            .build()
            .context("building log backend client")?;
        let mut headers = HeaderMap::new();
        for (k, v) in &cfg.headers {
            let name = HeaderName::from_bytes(k.as_bytes()).with_context(|| format!("invalid header name {k}"))?;
            let value = HeaderValue::from_str(v).with_context(|| format!("invalid value for header {k}"))?;
            headers.insert(name, value);
        }
        Ok(Self { client, headers })
    }

    /// Fetch `log_url` and stream projected lines. Errors returned here happen
    /// before any byte reached the client.
    pub async fn retrieve(&self, query: LogQuery) -> Result<Response, LogError> {
        let url = query.log_url.filter(|u| !u.is_empty()).ok_or(LogError::MissingUrl)?;
        let projection = Projection::compile(query.json_path.as_deref())?;
        info!(url = %url, json_path = ?query.json_path, "retrieving logs");

        let mut req = self.client.get(&url).headers(self.headers.clone());
        for (k, v) in &query.headers {
            req = req.header(k.as_str(), v.as_str());
        }
        let resp = req.send().await.map_err(LogError::from_request)?;
        let status = resp.status();
        if !status.is_success() {
            let body = read_prefix(resp, BACKEND_BODY_LIMIT).await;
            return Err(LogError::Backend { status: status.as_u16(), body });
        }
        stream_logs(resp.bytes_stream().boxed(), projection).await
    }
}

async fn read_prefix(mut resp: reqwest::Response, limit: usize) -> String {
    let mut buf = Vec::new();
    while buf.len() < limit {
        match resp.chunk().await {
            Ok(Some(c)) => buf.extend_from_slice(&c),
            _ => break,
        }
    }
    buf.truncate(limit);
    String::from_utf8_lossy(&buf).to_string()
}

fn with_newline(line: String) -> Bytes {
    let mut b = line.into_bytes();
    b.push(b'\n');
    Bytes::from(b)
}

/// Drive the line loop over a backend body.
///
/// Lines are read until the first non-empty projection; any failure up to
/// that point is returned as the request's error. Once that line exists the
/// response commits to `200 text/plain` and every later line is streamed as
/// its own chunk; later failures are logged and simply end the stream.
pub async fn stream_logs<S, E>(body: S, projection: Projection) -> Result<Response, LogError>
where
    S: Stream<Item = Result<Bytes, E>> + Unpin + Send + 'static,
    E: std::fmt::Display + Send + 'static,
{
    let mut lines = LineReader::new(body);
    let first = loop {
        match lines.next_line().await {
            None => {
                warn!("no log lines matched");
                return Err(LogError::NoLogs);
            }
            Some(Err(e)) => return Err(e),
            Some(Ok(raw)) => {
                if let Some(out) = projection.project(&raw)? {
                    break out;
                }
            }
        }
    };

    let rest = async_stream::stream! {
        yield Ok::<Bytes, Infallible>(with_newline(first));
        while let Some(next) = lines.next_line().await {
            match next {
                Ok(raw) => match projection.project(&raw) {
                    Ok(Some(out)) => yield Ok(with_newline(out)),
                    Ok(None) => {}
                    Err(e) => {
                        error!(error = %e, "error parsing log line after streaming started");
                        break;
                    }
                },
                Err(e) => {
                    error!(error = %e, "error reading log line after streaming started");
                    break;
                }
            }
        }
    };
    Ok(([(header::CONTENT_TYPE, "text/plain; charset=utf-8")], Body::from_stream(rest)).into_response())
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::stream;

    fn chunks(parts: &[&'static str]) -> impl Stream<Item = Result<Bytes, std::io::Error>> + Unpin + Send + 'static {
        let items: Vec<_> = parts.iter().map(|p| Ok::<Bytes, std::io::Error>(Bytes::from_static(p.as_bytes()))).collect();
        stream::iter(items)
    }

    async fn body_text(resp: Response) -> String {
        let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    #[tokio::test]
    async fn passthrough_skips_empty_lines() {
        let resp = stream_logs(chunks(&["a\n", "\n", "b\n"]), Projection::Passthrough).await.unwrap();
        assert_eq!(resp.status().as_u16(), 200);
        assert_eq!(resp.headers()[header::CONTENT_TYPE], "text/plain; charset=utf-8");
        assert_eq!(body_text(resp).await, "a\nb\n");
    }

    #[tokio::test]
    async fn only_blank_lines_is_not_found() {
        let err = stream_logs(chunks(&["\n", "  \n", "\t\n"]), Projection::Passthrough).await.unwrap_err();
        assert!(matches!(err, LogError::NoLogs));
        assert_eq!(err.status().as_u16(), 404);
        let err = stream_logs(chunks(&[]), Projection::Passthrough).await.unwrap_err();
        assert!(matches!(err, LogError::NoLogs));
    }

    #[tokio::test]
    async fn projects_json_lines() {
        let p = Projection::compile(Some("$.msg")).unwrap();
        let body = chunks(&["{\"msg\":\"one\"}\n{\"other\":1}\n", "{\"msg\":\"two\"}"]);
        let resp = stream_logs(body, p).await.unwrap();
        assert_eq!(body_text(resp).await, "one\ntwo\n");
    }

    #[tokio::test]
    async fn errors_before_commit_fail_the_request() {
        let items = vec![Err::<Bytes, _>(std::io::Error::new(std::io::ErrorKind::ConnectionReset, "reset"))];
        let err = stream_logs(stream::iter(items), Projection::Passthrough).await.unwrap_err();
        assert!(matches!(err, LogError::Read(_)));
        assert_eq!(err.status().as_u16(), 500);

        let p = Projection::compile(Some("$.n")).unwrap();
        let err = stream_logs(chunks(&["{\"n\":1}\n", "{\"n\":\"x\"}\n"]), p).await.unwrap_err();
        assert!(matches!(err, LogError::NonStringMatch(_)));

        let p = Projection::compile(Some("$.n")).unwrap();
        let err = stream_logs(chunks(&["not json\n"]), p).await.unwrap_err();
        assert!(matches!(err, LogError::Parse(_)));
    }

    #[tokio::test]
    async fn errors_after_commit_end_the_stream() {
        let items = vec![
            Ok(Bytes::from_static(b"first\nsec")),
            Err(std::io::Error::new(std::io::ErrorKind::UnexpectedEof, "connection dropped")),
        ];
        let resp = stream_logs(stream::iter(items), Projection::Passthrough).await.unwrap();
        assert_eq!(resp.status().as_u16(), 200);
        assert_eq!(body_text(resp).await, "first\n");

        let p = Projection::compile(Some("$.m")).unwrap();
        let resp = stream_logs(chunks(&["{\"m\":\"ok\"}\n", "garbage\n", "{\"m\":\"late\"}\n"]), p).await.unwrap();
        assert_eq!(body_text(resp).await, "ok\n");
    }
}
