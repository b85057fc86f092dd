use artcache_scheduler::Cancelled;

/// Errors produced while resolving, decoding or caching a resource.
///
/// None of these are fatal. The `Option`-returning entry points log them and
/// hand back `None`; the `try_*` variants surface them unchanged.
#[derive(Debug, thiserror::Error)]
pub enum ResourceError {
    #[error("resource not found: {0}")]
    ResolutionNotFound(String),
    #[error("failed to fetch {url}: {reason}")]
    FetchFailed { url: String, reason: String },
    #[error("no blob store bound; cannot load {0}")]
    NoBlobStore(String),
    #[error("decode failed: {0}")]
    DecodeFailure(String),
    #[error("entry of {cost} bytes exceeds cache capacity of {capacity} bytes")]
    CapacityRejected { cost: usize, capacity: usize },
    #[error("operation cancelled")]
    Cancelled,
    #[error("background task failed: {0}")]
    TaskFailed(String),
    #[error("I/O error: {0}")]
    IoTransient(#[from] std::io::Error),
}

impl From<Cancelled> for ResourceError {
    fn from(_: Cancelled) -> Self {
        Self::Cancelled
    }
}

impl From<image::ImageError> for ResourceError {
    fn from(err: image::ImageError) -> Self {
        Self::DecodeFailure(err.to_string())
    }
}

impl ResourceError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }

    /// Log at the level matching the error kind.
    pub(crate) fn log(&self, source: &str) {
        match self {
            Self::Cancelled => tracing::debug!(source, "resource request cancelled"),
            Self::ResolutionNotFound(_) | Self::CapacityRejected { .. } => {
                tracing::warn!(source, error = %self, "resource unavailable")
            }
            _ => tracing::error!(source, error = %self, "failed to load resource"),
        }
    }
}

pub type ResourceResult<T> = Result<T, ResourceError>;
