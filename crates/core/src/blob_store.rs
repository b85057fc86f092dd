//! Blob store backed by a directory on disk

use std::fs;
use std::io;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use tokio::sync::broadcast;

use crate::collab::{BlobEvent, BlobEventKind, BlobStore};
use crate::decode::{DecodedImage, Decoder};
use crate::error::{ResourceError, ResourceResult};
use crate::params::DecodeParams;

const EVENT_CAPACITY: usize = 256;

/// Each blob is a file under `root` named by its identifier.
///
/// Identifiers may contain `/` to group blobs (e.g. `game-id/cover.png`) but
/// may not escape the root.
pub struct DirectoryBlobStore {
    root: PathBuf,
    decoder: Arc<dyn Decoder>,
    events: broadcast::Sender<BlobEvent>,
}

impl DirectoryBlobStore {
    pub fn open(root: impl Into<PathBuf>, decoder: Arc<dyn Decoder>) -> io::Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Ok(Self {
            root,
            decoder,
            events,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, id: &str) -> Option<PathBuf> {
        let relative = Path::new(id);
        let contained = !id.is_empty()
            && relative
                .components()
                .all(|c| matches!(c, Component::Normal(_)));
        contained.then(|| self.root.join(relative))
    }

    fn writable_path(&self, id: &str) -> ResourceResult<PathBuf> {
        let path = self.path_for(id).ok_or_else(|| {
            let reason = format!("invalid blob id '{id}'");
            ResourceError::IoTransient(io::Error::new(io::ErrorKind::InvalidInput, reason))
        })?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        Ok(path)
    }

    fn notify(&self, kind: BlobEventKind, id: &str) {
        // No subscribers is fine.
        let _ = self.events.send(BlobEvent::new(kind, id));
    }

    /// Store a new blob and announce it.
    pub fn add(&self, id: &str, bytes: &[u8]) -> ResourceResult<PathBuf> {
        let path = self.writable_path(id)?;
        fs::write(&path, bytes)?;
        self.notify(BlobEventKind::Added, id);
        Ok(path)
    }

    /// Overwrite an existing blob and announce the change.
    pub fn touch(&self, id: &str, bytes: &[u8]) -> ResourceResult<PathBuf> {
        let path = self.writable_path(id)?;
        fs::write(&path, bytes)?;
        self.notify(BlobEventKind::Modified, id);
        Ok(path)
    }

    /// Delete a blob. Returns `false` if it did not exist.
    pub fn remove(&self, id: &str) -> ResourceResult<bool> {
        let Some(path) = self.path_for(id) else {
            return Ok(false);
        };
        match fs::remove_file(&path) {
            Ok(()) => {
                self.notify(BlobEventKind::Removed, id);
                Ok(true)
            }
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(err) => Err(err.into()),
        }
    }
}

impl BlobStore for DirectoryBlobStore {
    fn blob_path(&self, id: &str) -> Option<PathBuf> {
        self.path_for(id).filter(|path| path.is_file())
    }

    fn blob_as_decoded(
        &self,
        id: &str,
        params: &DecodeParams,
    ) -> ResourceResult<Option<DecodedImage>> {
        match self.blob_path(id) {
            Some(path) => self.decoder.decode_file(&path, params).map(Some),
            None => Ok(None),
        }
    }

    fn subscribe(&self) -> broadcast::Receiver<BlobEvent> {
        self.events.subscribe()
    }
}

impl std::fmt::Debug for DirectoryBlobStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DirectoryBlobStore")
            .field("root", &self.root)
            .finish()
    }
}
