//! Core primitives shared by the mailroom persistence backends.

/// The common backend error.
#[derive(Debug, thiserror::Error)]
pub enum BackendError<Inner = InnerError> {
    #[error("{0}")]
    Message(String),

    /// A row the caller depends on is missing or inactive.
    #[error("{0} not found")]
    NotFound(String),

    /// Injected by test backends to exercise rollback paths.
    #[error("injected failure in {0}")]
    Injected(&'static str),

    #[error(transparent)]
    Inner(Inner),

    #[error(transparent)]
    Serialization(serde_json::Error),
}

impl<Inner> BackendError<Inner> {
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }
}

#[cfg(feature = "sqlx-error")]
pub type InnerError = sqlx::Error;

#[cfg(not(feature = "sqlx-error"))]
pub type InnerError = std::convert::Infallible;

/// Utility type alias for backend results.
pub type BackendResult<T, E = InnerError> = Result<T, BackendError<E>>;

#[cfg(feature = "sqlx-error")]
impl From<sqlx::Error> for BackendError<sqlx::Error> {
    fn from(value: sqlx::Error) -> Self {
        match value {
            sqlx::Error::RowNotFound => Self::NotFound("row".to_string()),
            other => Self::Inner(other),
        }
    }
}

impl<Inner> From<serde_json::Error> for BackendError<Inner> {
    fn from(value: serde_json::Error) -> Self {
        Self::Serialization(value)
    }
}
