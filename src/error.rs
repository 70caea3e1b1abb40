use thiserror::Error;

/// Failure to fetch a single feed source.
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("feed returned HTTP {0}")]
    Status(u16),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("request timed out")]
    Timeout,

    #[error("failed to parse feed: {0}")]
    Parse(String),

    #[error(transparent)]
    Repository(#[from] RepositoryError),
}

#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: i64 },

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

impl RepositoryError {
    pub fn not_found(entity: &'static str, id: i64) -> Self {
        RepositoryError::NotFound { entity, id }
    }
}

/// Rejected input, caught before anything is persisted.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("invalid schedule time '{0}', expected HH:MM")]
    InvalidTime(String),

    #[error("unknown timezone '{0}'")]
    UnknownTimezone(String),
}

/// Failure to hand a digest to one destination.
#[derive(Debug, Error)]
pub enum DeliveryError {
    #[error("smtp send failed: {0}")]
    Smtp(String),

    #[error("webhook post failed: {0}")]
    Webhook(String),

    #[error("invalid address: {0}")]
    InvalidAddress(String),

    #[error("delivery timed out")]
    Timeout,
}

#[derive(Debug, Error)]
pub enum EvaluationError {
    #[error("evaluator failed for {url}: {source}")]
    Evaluator {
        url: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("summarizer failed for {url}: {source}")]
    Summarizer {
        url: String,
        #[source]
        source: anyhow::Error,
    },

    #[error(transparent)]
    Repository(#[from] RepositoryError),
}

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("group {0} not found or disabled")]
    GroupNotFound(i64),

    #[error("pipeline cancelled before {step}")]
    Cancelled { step: &'static str },

    #[error(transparent)]
    Repository(#[from] RepositoryError),

    #[error(transparent)]
    Evaluation(#[from] EvaluationError),

    #[error("failed to store digest: {0}")]
    Storage(#[from] std::io::Error),
}
