use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
};

#[derive(Debug, thiserror::Error)]
pub enum LogError {
    #[error("no log URL found")]
    MissingUrl,
    #[error("no logs found for the requested resource")]
    NoLogs,
    #[error("invalid jsonPath {path}: {message}")]
    InvalidProjection { path: String, message: String },
    #[error("error response: {status} - {body}")]
    Backend { status: u16, body: String },
    #[error("log backend request timed out")]
    Timeout,
    #[error("log backend request failed: {0}")]
    Transport(String),
    #[error("error reading log stream: {0}")]
    Read(String),
    #[error("invalid json log line: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("jsonPath matched a non-string value: {0}")]
    NonStringMatch(String),
}

impl LogError {
    pub fn status(&self) -> StatusCode {
        match self {
            LogError::MissingUrl | LogError::NoLogs => StatusCode::NOT_FOUND,
            LogError::Backend { status, .. } => StatusCode::from_u16(*status).unwrap_or(StatusCode::BAD_GATEWAY),
            LogError::Timeout => StatusCode::GATEWAY_TIMEOUT,
            LogError::InvalidProjection { .. }
            | LogError::Transport(_)
            | LogError::Read(_)
            | LogError::Parse(_)
            | LogError::NonStringMatch(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub(crate) fn from_request(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            LogError::Timeout
        } else {
            LogError::Transport(e.to_string())
        }
    }
}

impl IntoResponse for LogError {
    fn into_response(self) -> Response {
        (self.status(), self.to_string()).into_response()
    }
}
