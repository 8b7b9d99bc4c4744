use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("storage unavailable: {0}")]
    StorageUnavailable(String),

    #[error("upstream authentication failed: {0}")]
    UpstreamAuth(String),

    #[error("upstream quota exceeded, retry after {retry_after_secs:?} seconds")]
    UpstreamQuota { retry_after_secs: Option<u64> },

    #[error("upstream transient error: {0}")]
    UpstreamTransient(String),

    #[error("upstream query failed: {message} (line={line:?}, column={column:?})")]
    UpstreamQueryFailed {
        message: String,
        line: Option<u32>,
        column: Option<u32>,
    },

    #[error("upstream query timed out after {elapsed_secs}s")]
    QueryTimeout { elapsed_secs: u64 },

    #[error("validation error: {0}")]
    Validation(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Errors safe to retry with backoff; corresponds to the `UpstreamTransient`
    /// class plus ordinary infra hiccups.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::Database(_)
                | Error::Http(_)
                | Error::UpstreamTransient(_)
                | Error::Io(_)
                | Error::StorageUnavailable(_)
        )
    }

    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Error::Config(_) | Error::Validation(_) | Error::UpstreamAuth(_)
        )
    }

    /// Error classes a backfill driver should stop the whole pass on, rather
    /// than skip-and-continue (quota exhaustion mid-backfill).
    pub fn should_halt_backfill(&self) -> bool {
        matches!(self, Error::UpstreamQuota { .. } | Error::UpstreamAuth(_))
    }

    pub fn http_status(&self) -> u16 {
        match self {
            Error::Validation(_) => 400,
            Error::NotFound(_) => 404,
            Error::StorageUnavailable(_) => 503,
            Error::UpstreamAuth(_) => 502,
            Error::UpstreamQuota { .. } => 429,
            Error::UpstreamTransient(_) | Error::QueryTimeout { .. } => 504,
            Error::UpstreamQueryFailed { .. } => 502,
            _ => 500,
        }
    }
}
