use thiserror::Error;

/// Boxed error type used at collaborator boundaries.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Error surfaced to a call's owner, either thrown from `execute` or
/// delivered to the callback of an enqueued call.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// The call was cancelled before a response was delivered.
    #[error("canceled")]
    Canceled,

    /// The transport engine failed while exchanging bytes with the
    /// server. The request may or may not have been sent.
    #[error("network: {0}")]
    Network(#[source] BoxError),

    /// A route to the origin failed before the request was sent.
    #[error("route: {0}")]
    Route(#[source] BoxError),

    /// The exchange violated HTTP semantics.
    #[error("protocol: {0}")]
    Protocol(String),

    /// The engine kept producing follow-up requests (redirects, auth
    /// challenges) past the configured limit.
    #[error("too many follow-up requests: {0}")]
    TooManyFollowUps(usize),

    /// The request carried `only-if-cached` and the cache could not
    /// satisfy it.
    #[error("request is unsatisfiable from cache (only-if-cached)")]
    Unsatisfiable,
}

impl Error {
    /// Wrap a transport failure.
    pub fn network<E: Into<BoxError>>(error: E) -> Self {
        Error::Network(error.into())
    }

    /// Wrap a route failure.
    pub fn route<E: Into<BoxError>>(error: E) -> Self {
        Error::Route(error.into())
    }

    /// Returns `true` for failures the engine is allowed to recover
    /// from by retrying on a different route or connection.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Error::Network(_) | Error::Route(_))
    }
}
