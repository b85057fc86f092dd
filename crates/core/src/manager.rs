//! Resource manager facade
//!
//! Wires the resolver, decode pipeline, directory size cache and
//! invalidation bridge together behind one handle. Construct one per
//! application (or per test); nothing here is global.

use std::path::Path;
use std::sync::Arc;

use artcache_cache::{CacheConfig, Clock, DirectorySizeCache};
use artcache_scheduler::{Cancelled, CancellationToken, PermitPool, PermitPoolConfig};
use tokio::task::JoinError;

use crate::bridge::InvalidationBridge;
use crate::collab::{BlobStore, EmbeddedResources, WebFileCache};
use crate::decode::{DecodedImage, Decoder, ImageDecoder};
use crate::embedded::StaticResources;
use crate::error::{ResourceError, ResourceResult};
use crate::params::DecodeParams;
use crate::pipeline::{DecodePipeline, ResourceCache};
use crate::resolver::{ResourceLocation, ResourceResolver};
use crate::web_cache::HttpFileCache;

pub struct ResourceManagerBuilder {
    config: CacheConfig,
    embedded: Option<Arc<dyn EmbeddedResources>>,
    web: Option<Option<Arc<dyn WebFileCache>>>,
    decoder: Option<Arc<dyn Decoder>>,
    clock: Option<Arc<dyn Clock>>,
    max_permits: Option<usize>,
}

impl ResourceManagerBuilder {
    pub fn embedded(mut self, embedded: Arc<dyn EmbeddedResources>) -> Self {
        self.embedded = Some(embedded);
        self
    }

    /// Use `web` for http(s) sources instead of the default [`HttpFileCache`].
    pub fn web_file_cache(mut self, web: Arc<dyn WebFileCache>) -> Self {
        self.web = Some(Some(web));
        self
    }

    /// Treat http(s) sources as unresolvable.
    pub fn without_web_file_cache(mut self) -> Self {
        self.web = Some(None);
        self
    }

    pub fn decoder(mut self, decoder: Arc<dyn Decoder>) -> Self {
        self.decoder = Some(decoder);
        self
    }

    /// Time source for directory size expiry.
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Fixed decode permit count, overriding the per-CPU setting.
    pub fn max_permits(mut self, permits: usize) -> Self {
        self.max_permits = Some(permits);
        self
    }

    pub fn build(self) -> ResourceManager {
        let config = self.config;

        let embedded: Arc<dyn EmbeddedResources> = match self.embedded {
            Some(embedded) => embedded,
            None => Arc::new(StaticResources::new()),
        };
        let web: Option<Arc<dyn WebFileCache>> = match self.web {
            Some(web) => web,
            None => Some(Arc::new(HttpFileCache::from_config(&config))),
        };
        let decoder: Arc<dyn Decoder> = match self.decoder {
            Some(decoder) => decoder,
            None => Arc::new(ImageDecoder),
        };

        let permit_config = match self.max_permits {
            Some(permits) => PermitPoolConfig::new(permits),
            None => PermitPoolConfig::per_cpu(config.decode_permits_per_cpu),
        };

        let cache = Arc::new(ResourceCache::new(config.resource_cache_size));
        let resolver = Arc::new(ResourceResolver::new(embedded, web));
        let permits = Arc::new(PermitPool::new(permit_config));
        let pipeline = DecodePipeline::new(Arc::clone(&cache), resolver, decoder, permits);

        let mut dir_sizes = DirectorySizeCache::from_config(&config);
        if let Some(clock) = self.clock {
            dir_sizes = dir_sizes.with_clock(clock);
        }

        ResourceManager {
            bridge: InvalidationBridge::new(cache),
            pipeline,
            dir_sizes: Arc::new(dir_sizes),
            config,
        }
    }
}

/// Entry point for resolving, decoding and sizing resources.
pub struct ResourceManager {
    config: CacheConfig,
    pipeline: DecodePipeline,
    dir_sizes: Arc<DirectorySizeCache>,
    bridge: InvalidationBridge,
}

impl ResourceManager {
    pub fn builder(config: CacheConfig) -> ResourceManagerBuilder {
        ResourceManagerBuilder {
            config,
            embedded: None,
            web: None,
            decoder: None,
            clock: None,
            max_permits: None,
        }
    }

    pub fn new(config: CacheConfig) -> Self {
        Self::builder(config).build()
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    pub fn cache(&self) -> &Arc<ResourceCache> {
        self.pipeline.cache()
    }

    pub fn pipeline(&self) -> &DecodePipeline {
        &self.pipeline
    }

    pub fn dir_sizes(&self) -> &Arc<DirectorySizeCache> {
        &self.dir_sizes
    }

    /// Where `source` lives, without decoding it.
    pub fn resource_path(&self, source: &str) -> Option<ResourceLocation> {
        self.pipeline.resolver().locate(source)
    }

    pub fn get_resource(
        &self,
        source: &str,
        use_cache: bool,
        params: &DecodeParams,
    ) -> Option<DecodedImage> {
        self.pipeline.get(source, use_cache, params)
    }

    pub fn try_get_resource(
        &self,
        source: &str,
        use_cache: bool,
        params: &DecodeParams,
    ) -> ResourceResult<DecodedImage> {
        self.pipeline.try_get(source, use_cache, params)
    }

    pub async fn get_resource_async(
        &self,
        source: &str,
        use_cache: bool,
        params: &DecodeParams,
        cancel: &CancellationToken,
    ) -> Option<DecodedImage> {
        self.pipeline
            .get_async(source, use_cache, params, cancel)
            .await
    }

    /// Load `source` for a display slot, superseding its previous request.
    ///
    /// `cancel` may be shared across slots; superseding never cancels it.
    pub async fn get_resource_for_target(
        &self,
        target: &str,
        source: &str,
        params: &DecodeParams,
        cancel: &CancellationToken,
    ) -> Option<DecodedImage> {
        self.pipeline
            .get_for_target(target, source, params, cancel)
            .await
    }

    pub fn get_embedded_resource(
        &self,
        key: &str,
        use_cache: bool,
        params: &DecodeParams,
    ) -> Option<DecodedImage> {
        self.pipeline.get_embedded(key, use_cache, params)
    }

    /// Recursive size of `path`, cached per mode.
    pub fn get_directory_size(
        &self,
        path: &Path,
        on_disk: bool,
        cancel: Option<&CancellationToken>,
    ) -> Result<u64, Cancelled> {
        let uncancellable = CancellationToken::new();
        let token = cancel.unwrap_or(&uncancellable);
        self.dir_sizes.get_or_compute(path, on_disk, token)
    }

    /// [`get_directory_size`](Self::get_directory_size) on the blocking pool.
    ///
    /// A walk that panics surfaces as [`ResourceError::TaskFailed`], never as
    /// a cancellation.
    pub async fn get_directory_size_async(
        &self,
        path: &Path,
        on_disk: bool,
        cancel: &CancellationToken,
    ) -> ResourceResult<u64> {
        let dir_sizes = Arc::clone(&self.dir_sizes);
        let path = path.to_path_buf();
        let cancel = cancel.clone();

        let joined = tokio::task::spawn_blocking(move || {
            dir_sizes.get_or_compute(&path, on_disk, &cancel)
        })
        .await;
        flatten_join(joined)
    }

    /// Use `store` for blob lookups and evict decodes of blobs it removes.
    pub async fn bind_blob_store(&self, store: Arc<dyn BlobStore>) {
        self.pipeline
            .resolver()
            .set_blob_store(Some(Arc::clone(&store)));
        self.bridge.bind(store).await;
    }

    /// Detach the blob store. Safe to call when nothing is bound.
    pub async fn unbind_blob_store(&self) -> bool {
        self.pipeline.resolver().set_blob_store(None);
        self.bridge.unbind().await
    }
}

fn flatten_join<T>(joined: Result<Result<T, Cancelled>, JoinError>) -> ResourceResult<T> {
    match joined {
        Ok(result) => Ok(result?),
        Err(err) => {
            tracing::error!(error = %err, "directory size task failed");
            Err(ResourceError::TaskFailed(err.to_string()))
        }
    }
}

impl std::fmt::Debug for ResourceManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResourceManager")
            .field("pipeline", &self.pipeline)
            .field("dir_sizes", &self.dir_sizes)
            .finish()
    }
}
