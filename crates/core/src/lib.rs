//! artcache core library
//!
//! Resolution, decoding and caching of image resources. Sources are
//! resolved through embedded assets, a web file cache, the filesystem or a
//! blob store; decodes are cached under a byte budget and evicted when the
//! blob store reports a removal.
//!
//! [`ResourceManager`] is the entry point.

pub mod blob_store;
pub mod bridge;
pub mod collab;
pub mod decode;
pub mod embedded;
pub mod error;
pub mod manager;
pub mod params;
pub mod pipeline;
pub mod resolver;
pub mod web_cache;

pub use blob_store::DirectoryBlobStore;
pub use bridge::InvalidationBridge;
pub use collab::{BlobEvent, BlobEventKind, BlobStore, EmbeddedResources, WebFileCache};
pub use decode::{decode_limits, DecodedImage, Decoder, ImageDecoder};
pub use embedded::{embedded_key, embedded_source, is_embedded_source, StaticResources};
pub use error::{ResourceError, ResourceResult};
pub use manager::{ResourceManager, ResourceManagerBuilder};
pub use params::{DecodeParams, DpiScale, ResourceKey, ScalingMode};
pub use pipeline::{invalidate_source, DecodePipeline, ResourceCache};
pub use resolver::{ResourceLocation, ResourceResolver};
pub use web_cache::{is_http_url, HttpFileCache};

pub use artcache_cache::CacheConfig;
pub use artcache_scheduler::{Cancelled, CancellationToken};
