//! Decode pipeline
//!
//! Cache lookup, resolution, decode and cache population for one request.
//! The blocking path runs inline. The async path holds a decode permit and
//! runs resolution plus decode on the blocking thread pool, checking the
//! caller's cancellation token before the permit wait, after it, and again
//! before touching the cache.

use std::sync::Arc;

use artcache_cache::ByteBudgetCache;
use artcache_scheduler::{CancellationToken, PermitPool, SupersedeRegistry, Ticket};

use crate::decode::{DecodedImage, Decoder};
use crate::embedded::{embedded_key, embedded_source};
use crate::error::{ResourceError, ResourceResult};
use crate::params::{DecodeParams, ResourceKey};
use crate::resolver::{ResourceLocation, ResourceResolver};

/// Decoded images keyed by source and decode parameters.
///
/// Entry metadata holds the exact parameters each image was decoded with.
pub type ResourceCache = ByteBudgetCache<ResourceKey, DecodedImage, DecodeParams>;

/// Drop every cached decode of `source`, whatever its parameters.
pub fn invalidate_source(cache: &ResourceCache, source: &str) -> usize {
    cache.remove_where(|entry| entry.key.source() == source)
}

/// Cache key for `source`. Embedded sources share one spelling whichever
/// scheme named them.
fn cache_key(source: &str, params: &DecodeParams) -> ResourceKey {
    match embedded_key(source) {
        Some(key) => ResourceKey::new(&embedded_source(key), params),
        None => ResourceKey::new(source, params),
    }
}

/// Resolution and decode, cloneable into blocking tasks.
#[derive(Clone)]
struct Loader {
    resolver: Arc<ResourceResolver>,
    decoder: Arc<dyn Decoder>,
}

impl Loader {
    fn load(&self, source: &str, params: &DecodeParams) -> ResourceResult<DecodedImage> {
        match self.resolver.resolve(source)? {
            ResourceLocation::Embedded { key } => self.load_embedded(&key, params),
            ResourceLocation::Web { path, .. } | ResourceLocation::File(path) => {
                self.decoder.decode_file(&path, params)
            }
            ResourceLocation::Blob { id, .. } => {
                let store = self
                    .resolver
                    .blob_store()
                    .ok_or_else(|| ResourceError::NoBlobStore(id.clone()))?;
                store
                    .blob_as_decoded(&id, params)?
                    .ok_or(ResourceError::ResolutionNotFound(id))
            }
        }
    }

    fn load_embedded(&self, key: &str, params: &DecodeParams) -> ResourceResult<DecodedImage> {
        let bytes = self
            .resolver
            .embedded_bytes(key)
            .ok_or_else(|| ResourceError::ResolutionNotFound(key.to_string()))?;
        self.decoder.decode(&bytes, params)
    }
}

/// A target's slot in the supersede registry, released on drop.
///
/// Dropping the lease also cancels its ticket, so a request abandoned by
/// its caller stops at the next checkpoint.
struct TargetLease<'a> {
    targets: &'a SupersedeRegistry<String>,
    ticket: Ticket<String>,
}

impl Drop for TargetLease<'_> {
    fn drop(&mut self) {
        self.ticket.token().cancel();
        self.targets.complete(&self.ticket);
    }
}

pub struct DecodePipeline {
    cache: Arc<ResourceCache>,
    loader: Loader,
    permits: Arc<PermitPool>,
    targets: SupersedeRegistry<String>,
}

impl DecodePipeline {
    pub fn new(
        cache: Arc<ResourceCache>,
        resolver: Arc<ResourceResolver>,
        decoder: Arc<dyn Decoder>,
        permits: Arc<PermitPool>,
    ) -> Self {
        Self {
            cache,
            loader: Loader { resolver, decoder },
            permits,
            targets: SupersedeRegistry::new(),
        }
    }

    pub fn cache(&self) -> &Arc<ResourceCache> {
        &self.cache
    }

    pub fn permits(&self) -> &Arc<PermitPool> {
        &self.permits
    }

    pub fn resolver(&self) -> &Arc<ResourceResolver> {
        &self.loader.resolver
    }

    /// Cached image for `key`, if it was decoded with exactly `params`.
    ///
    /// A hit decoded with other parameters is evicted so its cost is released
    /// before the replacement is decoded.
    fn lookup(&self, key: &ResourceKey, params: &DecodeParams) -> Option<DecodedImage> {
        let entry = self.cache.try_get(key)?;
        if entry.metadata == *params {
            return Some(entry.value.clone());
        }

        tracing::debug!(key = %key, "cached decode parameters differ; evicting");
        self.cache.try_remove(key);
        None
    }

    fn store(
        &self,
        key: ResourceKey,
        image: DecodedImage,
        params: &DecodeParams,
    ) -> ResourceResult<()> {
        let cost = image.cost();
        if self.cache.try_add(key, image, cost, *params) {
            Ok(())
        } else {
            Err(ResourceError::CapacityRejected {
                cost,
                capacity: self.cache.capacity(),
            })
        }
    }

    fn cached<F>(
        &self,
        source: &str,
        use_cache: bool,
        params: &DecodeParams,
        load: F,
    ) -> ResourceResult<DecodedImage>
    where
        F: FnOnce() -> ResourceResult<DecodedImage>,
    {
        if source.is_empty() {
            return Err(ResourceError::ResolutionNotFound(String::new()));
        }

        let key = cache_key(source, params);
        if use_cache {
            if let Some(hit) = self.lookup(&key, params) {
                return Ok(hit);
            }
        }

        let image = load()?;
        if use_cache {
            self.store(key, image.clone(), params)?;
        }
        Ok(image)
    }

    /// Blocking fetch of `source` decoded with `params`.
    pub fn try_get(
        &self,
        source: &str,
        use_cache: bool,
        params: &DecodeParams,
    ) -> ResourceResult<DecodedImage> {
        self.cached(source, use_cache, params, || self.loader.load(source, params))
    }

    /// Like [`try_get`](Self::try_get), logging failures and returning `None`.
    pub fn get(
        &self,
        source: &str,
        use_cache: bool,
        params: &DecodeParams,
    ) -> Option<DecodedImage> {
        report(source, self.try_get(source, use_cache, params))
    }

    /// Fetch an embedded resource by key, bypassing scheme resolution.
    ///
    /// Shares cache entries with the `resources:` and `pack:` spellings of
    /// the same key.
    pub fn try_get_embedded(
        &self,
        key: &str,
        use_cache: bool,
        params: &DecodeParams,
    ) -> ResourceResult<DecodedImage> {
        if key.is_empty() {
            return Err(ResourceError::ResolutionNotFound(String::new()));
        }
        let source = embedded_source(key);
        self.cached(&source, use_cache, params, || {
            self.loader.load_embedded(key, params)
        })
    }

    pub fn get_embedded(
        &self,
        key: &str,
        use_cache: bool,
        params: &DecodeParams,
    ) -> Option<DecodedImage> {
        report(key, self.try_get_embedded(key, use_cache, params))
    }

    /// Resolve and decode under a permit, off the async executor.
    async fn resolve_and_decode(
        &self,
        source: &str,
        params: &DecodeParams,
        cancel: &CancellationToken,
    ) -> ResourceResult<DecodedImage> {
        let permit = self.permits.acquire(cancel).await?;
        cancel.check()?;

        let loader = self.loader.clone();
        let source = source.to_string();
        let params = *params;
        let cancel = cancel.clone();

        tokio::task::spawn_blocking(move || {
            // Released when the decode finishes, even if the caller went away.
            let _permit = permit;
            cancel.check()?;
            loader.load(&source, &params)
        })
        .await
        .map_err(|err| ResourceError::TaskFailed(err.to_string()))?
    }

    /// Suspending fetch of `source` decoded with `params`.
    ///
    /// A cancelled request never mutates the cache.
    pub async fn try_get_async(
        &self,
        source: &str,
        use_cache: bool,
        params: &DecodeParams,
        cancel: &CancellationToken,
    ) -> ResourceResult<DecodedImage> {
        cancel.check()?;
        if source.is_empty() {
            return Err(ResourceError::ResolutionNotFound(String::new()));
        }

        let key = cache_key(source, params);
        if use_cache {
            if let Some(hit) = self.lookup(&key, params) {
                return Ok(hit);
            }
        }

        let image = self.resolve_and_decode(source, params, cancel).await?;

        cancel.check()?;
        if use_cache {
            self.store(key, image.clone(), params)?;
        }
        Ok(image)
    }

    pub async fn get_async(
        &self,
        source: &str,
        use_cache: bool,
        params: &DecodeParams,
        cancel: &CancellationToken,
    ) -> Option<DecodedImage> {
        report(
            source,
            self.try_get_async(source, use_cache, params, cancel).await,
        )
    }

    /// Fetch `source` on behalf of a display target, superseding whatever
    /// that target requested before.
    ///
    /// The request runs under a child of `cancel`: it stops when `cancel`
    /// fires or when a newer request for the same target begins, and the
    /// caller's token is never cancelled on its behalf. A result whose
    /// request is no longer the target's latest is discarded instead of
    /// cached and reported as [`ResourceError::Cancelled`]. The target's slot
    /// is released when the request finishes or its future is dropped.
    pub async fn try_get_for_target(
        &self,
        target: impl Into<String>,
        source: &str,
        params: &DecodeParams,
        cancel: &CancellationToken,
    ) -> ResourceResult<DecodedImage> {
        let lease = TargetLease {
            targets: &self.targets,
            ticket: self.targets.begin(target.into(), cancel),
        };
        self.decode_for_ticket(&lease.ticket, source, params).await
    }

    pub async fn get_for_target(
        &self,
        target: impl Into<String>,
        source: &str,
        params: &DecodeParams,
        cancel: &CancellationToken,
    ) -> Option<DecodedImage> {
        report(
            source,
            self.try_get_for_target(target, source, params, cancel).await,
        )
    }

    async fn decode_for_ticket(
        &self,
        ticket: &Ticket<String>,
        source: &str,
        params: &DecodeParams,
    ) -> ResourceResult<DecodedImage> {
        let cancel = ticket.token();
        cancel.check()?;
        if source.is_empty() {
            return Err(ResourceError::ResolutionNotFound(String::new()));
        }

        let key = cache_key(source, params);
        if let Some(hit) = self.lookup(&key, params) {
            return Ok(hit);
        }

        let image = self.resolve_and_decode(source, params, cancel).await?;

        cancel.check()?;
        let committed = self
            .targets
            .commit_if_current(ticket, || self.store(key, image.clone(), params));
        match committed {
            Some(stored) => stored.map(|()| image),
            None => {
                tracing::debug!(
                    slot = ticket.target().as_str(),
                    generation = ticket.generation(),
                    "discarding superseded decode"
                );
                Err(ResourceError::Cancelled)
            }
        }
    }

    /// Number of targets with a request in flight.
    pub fn active_targets(&self) -> usize {
        self.targets.len()
    }

    /// Cancel the in-flight request for `target`.
    pub fn cancel_target(&self, target: &str) -> bool {
        self.targets.cancel(&target.to_string())
    }
}

impl std::fmt::Debug for DecodePipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DecodePipeline")
            .field("cache", &self.cache.stats())
            .field("permits", &self.permits.max_permits())
            .finish()
    }
}

fn report(source: &str, result: ResourceResult<DecodedImage>) -> Option<DecodedImage> {
    match result {
        Ok(image) => Some(image),
        Err(err) => {
            if !source.is_empty() {
                err.log(source);
            }
            None
        }
    }
}
