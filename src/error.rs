//! Error taxonomy for the phrase cache.
//! Provider and repository failures carry their own enums; the orchestrator
//! and rebuilder surface `PhraseCacheError` to callers.

use thiserror::Error;

/// Failure talking to an embedding or generation backend.
#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("API error: {0}")]
    Api(String),

    #[error("rate limited, retry after {retry_after_ms}ms")]
    RateLimited { retry_after_ms: u64 },

    #[error("provider request timeout")]
    Timeout,

    #[error("credentials missing: {0}")]
    MissingCredentials(String),

    #[error("malformed provider response: {0}")]
    MalformedResponse(String),
}

/// Failure inside the phrase store.
#[derive(Debug, Error)]
pub enum RepoError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("stored document is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("phrase {0} not found")]
    NotFound(String),

    #[error("store unavailable: {0}")]
    Unavailable(String),
}

/// Errors surfaced by `Translator` and `CacheRebuilder`.
#[derive(Debug, Error)]
pub enum PhraseCacheError {
    /// Missing or empty required input. Raised before any side effect.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Embedding or generation call failed. Not retried at this layer.
    #[error("dependency unavailable: {0}")]
    DependencyUnavailable(#[from] ProviderError),

    #[error("repository failure: {0}")]
    Repository(#[from] RepoError),

    #[error("configuration error: {0}")]
    Config(String),
}

impl PhraseCacheError {
    /// Whether a job scheduler may re-run the failed operation as-is.
    pub fn is_retryable(&self) -> bool {
        match self {
            PhraseCacheError::InvalidArgument(_) | PhraseCacheError::Config(_) => false,
            PhraseCacheError::DependencyUnavailable(e) => {
                !matches!(e, ProviderError::MissingCredentials(_))
            }
            PhraseCacheError::Repository(RepoError::NotFound(_)) => false,
            PhraseCacheError::Repository(_) => true,
        }
    }
}

pub type Result<T, E = PhraseCacheError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn provider_errors_map_to_dependency_unavailable() {
        let err: PhraseCacheError = ProviderError::Timeout.into();
        assert!(matches!(err, PhraseCacheError::DependencyUnavailable(_)));
        assert!(err.is_retryable());

        let err: PhraseCacheError = ProviderError::MissingCredentials("KEY".into()).into();
        assert!(!err.is_retryable());
    }

    #[test]
    fn invalid_argument_is_not_retryable() {
        let err = PhraseCacheError::InvalidArgument("text is required".into());
        assert!(!err.is_retryable());
        assert_eq!(err.to_string(), "invalid argument: text is required");
    }
}
