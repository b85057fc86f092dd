//! Source resolution
//!
//! Maps a logical source string to where its bytes live. Schemes are tried
//! in a fixed order and the first match wins:
//!
//! 1. embedded resources (`resources:` / `pack://`)
//! 2. http(s) URLs, through the web file cache
//! 3. existing files on disk
//! 4. blob identifiers, through the bound blob store

use std::path::{Path, PathBuf};
use std::sync::{Arc, PoisonError, RwLock};

use crate::collab::{BlobStore, EmbeddedResources, WebFileCache};
use crate::embedded::embedded_key;
use crate::error::{ResourceError, ResourceResult};
use crate::web_cache::is_http_url;

/// Where a source's bytes were found.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResourceLocation {
    Embedded { key: String },
    Web { url: String, path: PathBuf },
    File(PathBuf),
    Blob { id: String, path: PathBuf },
}

impl ResourceLocation {
    /// Local file path, if the resource lives on disk.
    pub fn path(&self) -> Option<&Path> {
        match self {
            Self::Embedded { .. } => None,
            Self::Web { path, .. } | Self::Blob { path, .. } => Some(path),
            Self::File(path) => Some(path),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Embedded { .. } => "embedded",
            Self::Web { .. } => "web",
            Self::File(_) => "file",
            Self::Blob { .. } => "blob",
        }
    }
}

pub struct ResourceResolver {
    embedded: Arc<dyn EmbeddedResources>,
    web: Option<Arc<dyn WebFileCache>>,
    blob_store: RwLock<Option<Arc<dyn BlobStore>>>,
}

impl ResourceResolver {
    pub fn new(embedded: Arc<dyn EmbeddedResources>, web: Option<Arc<dyn WebFileCache>>) -> Self {
        Self {
            embedded,
            web,
            blob_store: RwLock::new(None),
        }
    }

    /// Replace the blob store used for identifier lookups.
    pub fn set_blob_store(&self, store: Option<Arc<dyn BlobStore>>) {
        *self
            .blob_store
            .write()
            .unwrap_or_else(PoisonError::into_inner) = store;
    }

    pub fn blob_store(&self) -> Option<Arc<dyn BlobStore>> {
        self.blob_store
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Bytes of an embedded resource by bare key.
    pub fn embedded_bytes(&self, key: &str) -> Option<Arc<[u8]>> {
        self.embedded.get(key)
    }

    /// Resolve `source`, reporting why it could not be found.
    pub fn resolve(&self, source: &str) -> ResourceResult<ResourceLocation> {
        if source.is_empty() {
            return Err(ResourceError::ResolutionNotFound(String::new()));
        }

        if let Some(key) = embedded_key(source) {
            return match self.embedded.get(key) {
                Some(_) => Ok(ResourceLocation::Embedded {
                    key: key.to_string(),
                }),
                None => Err(ResourceError::ResolutionNotFound(source.to_string())),
            };
        }

        if is_http_url(source) {
            let Some(web) = &self.web else {
                return Err(ResourceError::FetchFailed {
                    url: source.to_string(),
                    reason: "no web file cache configured".to_string(),
                });
            };
            return match web.get_or_fetch(source)? {
                Some(path) => Ok(ResourceLocation::Web {
                    url: source.to_string(),
                    path,
                }),
                None => Err(ResourceError::ResolutionNotFound(source.to_string())),
            };
        }

        let path = Path::new(source);
        if path.is_file() {
            return Ok(ResourceLocation::File(path.to_path_buf()));
        }

        let store = self
            .blob_store()
            .ok_or_else(|| ResourceError::NoBlobStore(source.to_string()))?;
        match store.blob_path(source) {
            Some(path) => Ok(ResourceLocation::Blob {
                id: source.to_string(),
                path,
            }),
            None => Err(ResourceError::ResolutionNotFound(source.to_string())),
        }
    }

    /// Resolve `source`, logging failures.
    ///
    /// Empty sources resolve silently to `None`.
    pub fn locate(&self, source: &str) -> Option<ResourceLocation> {
        if source.is_empty() {
            return None;
        }
        match self.resolve(source) {
            Ok(location) => Some(location),
            Err(err) => {
                err.log(source);
                None
            }
        }
    }
}

impl std::fmt::Debug for ResourceResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResourceResolver")
            .field("web", &self.web.is_some())
            .field("blob_store", &self.blob_store().is_some())
            .finish()
    }
}
