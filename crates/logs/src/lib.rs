//! karchive logs: fetches a log document from a backend URL and streams it
//! back line by line, optionally projecting each JSON line through a
//! JSONPath expression.

#![forbid(unsafe_code)]

mod error;
pub mod headers;
pub mod http;
mod lines;
mod projection;
mod proxy;

pub use error::LogError;
pub use headers::{load_headers, load_headers_or_empty};
pub use http::{router, serve};
pub use lines::LineReader;
pub use projection::Projection;
pub use proxy::{stream_logs, LogProxy, LogProxyConfig, LogQuery, BACKEND_BODY_LIMIT};
