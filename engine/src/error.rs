use std::time::Duration;

/// Engine-side errors.
///
/// The retry layer consults [`Error::is_retryable`]: rows or resources that
/// were expected to exist and don't are non-retryable because the cause
/// cannot self-heal, while orchestrator/proxy/database hiccups back off and
/// try again.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("orchestrator error: {0}")]
    Docker(#[from] bollard::errors::Error),

    #[error("proxy error: {0}")]
    Proxy(#[from] reqwest::Error),

    /// A row or orchestrator resource that should exist does not.
    #[error("{0}")]
    NotFound(String),

    #[error("activity did not complete within {0:?}")]
    ActivityTimeout(Duration),

    #[error("the workflow queue is no longer accepting work")]
    ServiceUnavailable,

    #[error("{0}")]
    Internal(String),
}

impl Error {
    pub fn not_found<S: Into<String>>(message: S) -> Self {
        Self::NotFound(message.into())
    }

    pub fn internal<S: Into<String>>(message: S) -> Self {
        Self::Internal(message.into())
    }

    pub fn is_retryable(&self) -> bool {
        !matches!(self, Self::NotFound(_))
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_rows_do_not_retry() {
        assert!(!Error::not_found("deployment does not exist").is_retryable());
        assert!(Error::ServiceUnavailable.is_retryable());
        assert!(Error::ActivityTimeout(Duration::from_secs(5)).is_retryable());
    }
}
