use thiserror::Error;

/// Startup-only failures. The process refuses to serve on any of these.
#[derive(Debug, Error)]
pub enum FatalConfig {
    #[error("missing required environment variable {0}")]
    MissingEnv(&'static str),
    #[error("invalid value for {0}: {1}")]
    Invalid(&'static str, String),
    #[error("embedding dimension mismatch: expected {expected}, {source_name} has {actual}")]
    DimensionMismatch {
        source_name: &'static str,
        expected: usize,
        actual: usize,
    },
    #[error("database unreachable at startup: {0}")]
    DatabaseUnreachable(String),
}

/// Persistence-layer failures. `Unavailable` covers pool exhaustion,
/// timeouts and connection errors; the chat path downgrades it to a
/// non-durable broadcast instead of swallowing the message.
#[derive(Debug, Error)]
pub enum DbError {
    #[error("database unavailable: {0}")]
    Unavailable(String),
    #[error("referenced reply message not found in this room")]
    ReplyNotFound,
    #[error("row not found")]
    NotFound,
}

impl From<deadpool_postgres::PoolError> for DbError {
    fn from(e: deadpool_postgres::PoolError) -> Self {
        DbError::Unavailable(e.to_string())
    }
}

impl From<tokio_postgres::Error> for DbError {
    fn from(e: tokio_postgres::Error) -> Self {
        DbError::Unavailable(e.to_string())
    }
}

/// Embedding provider failures. The matcher degrades to the popularity
/// fallback on any of these; they never reach the user directly.
#[derive(Debug, Error)]
pub enum EmbedError {
    #[error("embedder unavailable: {0}")]
    Unavailable(String),
    #[error("embedding timed out")]
    Timeout,
}

/// Errors surfaced to the originating connection only (never broadcast).
#[derive(Debug, Error)]
pub enum ChatError {
    #[error("{0}")]
    Validation(String),
    #[error("rate limited: max {max} messages per {window_secs}s")]
    RateLimited { max: u32, window_secs: u64 },
}
