//! Error type for a batching run

/// Failure that terminated a batching run.
///
/// Wraps the error of whichever side failed first. The operator yields it
/// exactly once and then ends its output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BatchError<E> {
    /// The upstream sequence failed
    Source(E),
    /// A worker's output sequence failed; items buffered behind it are dropped
    Worker(E),
}

impl<E: std::fmt::Display> std::fmt::Display for BatchError<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Source(e) => write!(f, "source failed: {e}"),
            Self::Worker(e) => write!(f, "worker failed: {e}"),
        }
    }
}

impl<E: std::error::Error + 'static> std::error::Error for BatchError<E> {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(self.inner())
    }
}

impl<E> BatchError<E> {
    pub fn is_source(&self) -> bool {
        matches!(self, Self::Source(_))
    }

    pub fn is_worker(&self) -> bool {
        matches!(self, Self::Worker(_))
    }

    /// Borrow the wrapped error
    pub fn inner(&self) -> &E {
        match self {
            Self::Source(e) | Self::Worker(e) => e,
        }
    }

    /// Unwrap the error, discarding which side failed
    pub fn into_inner(self) -> E {
        match self {
            Self::Source(e) | Self::Worker(e) => e,
        }
    }
}
