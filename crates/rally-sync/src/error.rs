use rally_proto::MatchId;
use thiserror::Error;
use tokio_tungstenite::tungstenite;

pub type SyncResult<T> = Result<T, SyncError>;

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("websocket error: {0}")]
    Transport(#[from] tungstenite::Error),
    #[error("http request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("malformed frame: {0}")]
    Protocol(#[from] serde_json::Error),
    #[error("invalid url: {0}")]
    Url(#[from] url::ParseError),
    #[error(transparent)]
    Remote(#[from] RemoteError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("{0} is not configured")]
    NotConfigured(&'static str),
    #[error("match {0} not found")]
    NotFound(MatchId),
    #[error("timed out after {0} ms")]
    Timeout(u64),
    #[error("connection closed")]
    Closed,
}

/// Outcome of a failed remote call, split by whether retrying can help.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RemoteError {
    #[error("remote unreachable: {0}")]
    Unreachable(String),
    #[error("remote rejected write ({}): {message}", .code.as_deref().unwrap_or("no code"))]
    Rejected {
        code: Option<String>,
        message: String,
        details: Option<String>,
        hint: Option<String>,
    },
}

impl RemoteError {
    pub fn rejected(code: impl Into<String>, message: impl Into<String>) -> Self {
        RemoteError::Rejected {
            code: Some(code.into()),
            message: message.into(),
            details: None,
            hint: None,
        }
    }

    pub fn is_unreachable(&self) -> bool {
        matches!(self, RemoteError::Unreachable(_))
    }

    pub fn code(&self) -> Option<&str> {
        match self {
            RemoteError::Unreachable(_) => None,
            RemoteError::Rejected { code, .. } => code.as_deref(),
        }
    }
}

impl From<reqwest::Error> for RemoteError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            RemoteError::Rejected {
                code: None,
                message: err.to_string(),
                details: None,
                hint: None,
            }
        } else {
            RemoteError::Unreachable(err.to_string())
        }
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] sqlx::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("corrupt job record {id}: {reason}")]
    Corrupt { id: String, reason: String },
}
