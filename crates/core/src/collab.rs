//! Collaborators the resource pipeline depends on
//!
//! Remote fetching, blob storage and embedded assets live outside the
//! caching core. These traits are the seams; the crate ships one
//! implementation of each.

use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::broadcast;

use crate::decode::DecodedImage;
use crate::error::ResourceResult;
use crate::params::DecodeParams;

/// Downloads remote files into a local cache.
pub trait WebFileCache: Send + Sync {
    /// Local path of `url`, fetching it first if absent.
    ///
    /// `Ok(None)` means the server had nothing for us.
    fn get_or_fetch(&self, url: &str) -> ResourceResult<Option<PathBuf>>;
}

/// Kind of change to a stored blob.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlobEventKind {
    Added,
    Removed,
    Modified,
}

/// A change notification from a [`BlobStore`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlobEvent {
    pub kind: BlobEventKind,
    pub id: String,
}

impl BlobEvent {
    pub fn new(kind: BlobEventKind, id: impl Into<String>) -> Self {
        Self {
            kind,
            id: id.into(),
        }
    }
}

/// Identifier-addressed file storage with change notifications.
pub trait BlobStore: Send + Sync {
    fn blob_path(&self, id: &str) -> Option<PathBuf>;

    /// Decode the blob stored under `id`. `Ok(None)` if there is no such blob.
    fn blob_as_decoded(
        &self,
        id: &str,
        params: &DecodeParams,
    ) -> ResourceResult<Option<DecodedImage>>;

    fn subscribe(&self) -> broadcast::Receiver<BlobEvent>;
}

/// Assets compiled into or registered with the application.
pub trait EmbeddedResources: Send + Sync {
    /// Bytes registered under a bare key (scheme prefixes already stripped).
    fn get(&self, key: &str) -> Option<Arc<[u8]>>;
}
