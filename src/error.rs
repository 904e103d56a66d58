//! Unified error type.

/// The error type used throughout strata.
///
/// Application-level outcomes (404, 422, etc.) are expressed through the
/// response on [`Context`](crate::Context), not as `Error`s. This type covers
/// what handlers report via [`Context::error`](crate::Context::error), faults
/// recorded by the recovery layers, and service container failures.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    #[error("io: {0}")]
    Io(#[from] std::io::Error),

    #[error("panic: {0}")]
    Panic(String),

    #[error("json: {0}")]
    Json(#[from] serde_json::Error),

    #[error("http: {0}")]
    Http(#[from] http::Error),

    #[error("request body: {0}")]
    Body(String),

    #[error("{0}")]
    Message(String),

    #[error(transparent)]
    Other(Box<dyn std::error::Error + Send + Sync>),

    #[error("service `{0}` is not registered")]
    ServiceNotFound(String),

    #[error("service `{name}` failed to boot: {source}")]
    ServiceBoot {
        name: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    #[error("service `{name}` failed to instantiate: {source}")]
    ServiceInit {
        name: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    #[error("service `{0}` is not of the requested type")]
    ServiceType(String),

    #[error("no service container attached to this pipeline")]
    NoContainer,
}

impl Error {
    /// Shorthand for a handler-declared error carrying only a message.
    pub fn msg(message: impl Into<String>) -> Self {
        Self::Message(message.into())
    }

    /// Wraps an arbitrary error.
    pub fn other(err: impl std::error::Error + Send + Sync + 'static) -> Self {
        Self::Other(Box::new(err))
    }

    /// Returns `true` for I/O errors that mean the peer went away.
    pub fn is_disconnect(&self) -> bool {
        matches!(
            self,
            Self::Io(e) if matches!(
                e.kind(),
                std::io::ErrorKind::BrokenPipe | std::io::ErrorKind::ConnectionReset
            )
        )
    }
}

impl From<http::header::InvalidHeaderName> for Error {
    fn from(e: http::header::InvalidHeaderName) -> Self {
        Self::Http(e.into())
    }
}

impl From<http::header::InvalidHeaderValue> for Error {
    fn from(e: http::header::InvalidHeaderValue) -> Self {
        Self::Http(e.into())
    }
}
