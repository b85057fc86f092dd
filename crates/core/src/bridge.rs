//! Blob store change notifications to cache evictions

use std::sync::Arc;

use tokio::sync::broadcast::{self, error::RecvError};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use crate::collab::{BlobEvent, BlobEventKind, BlobStore};
use crate::pipeline::{invalidate_source, ResourceCache};

/// Evicts cached decodes of blobs removed from the bound store.
///
/// At most one store is bound at a time. Binding a new store stops the
/// previous listener before subscribing to the new one.
pub struct InvalidationBridge {
    cache: Arc<ResourceCache>,
    listener: Mutex<Option<JoinHandle<()>>>,
}

impl InvalidationBridge {
    pub fn new(cache: Arc<ResourceCache>) -> Self {
        Self {
            cache,
            listener: Mutex::new(None),
        }
    }

    /// Start listening to `store`, replacing any previous binding.
    pub async fn bind(&self, store: Arc<dyn BlobStore>) {
        let mut listener = self.listener.lock().await;
        if let Some(previous) = listener.take() {
            stop(previous).await;
        }

        let events = store.subscribe();
        *listener = Some(tokio::spawn(listen(events, Arc::clone(&self.cache))));
    }

    /// Stop listening. Returns `false` if nothing was bound.
    pub async fn unbind(&self) -> bool {
        match self.listener.lock().await.take() {
            Some(previous) => {
                stop(previous).await;
                true
            }
            None => false,
        }
    }

    pub async fn is_bound(&self) -> bool {
        self.listener
            .lock()
            .await
            .as_ref()
            .is_some_and(|task| !task.is_finished())
    }
}

impl Drop for InvalidationBridge {
    fn drop(&mut self) {
        if let Some(task) = self.listener.get_mut().take() {
            task.abort();
        }
    }
}

impl std::fmt::Debug for InvalidationBridge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InvalidationBridge").finish_non_exhaustive()
    }
}

async fn stop(task: JoinHandle<()>) {
    task.abort();
    // Cancellation is the expected outcome.
    let _ = task.await;
}

async fn listen(mut events: broadcast::Receiver<BlobEvent>, cache: Arc<ResourceCache>) {
    loop {
        match events.recv().await {
            Ok(BlobEvent {
                kind: BlobEventKind::Removed,
                id,
            }) => {
                let evicted = invalidate_source(&cache, &id);
                tracing::debug!(id = %id, evicted, "blob removed; evicted cached decodes");
            }
            Ok(_) => {}
            Err(RecvError::Lagged(skipped)) => {
                tracing::warn!(skipped, "blob change notifications dropped");
            }
            Err(RecvError::Closed) => break,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blob_store::DirectoryBlobStore;
    use crate::decode::tests::png_bytes;
    use crate::decode::{DecodedImage, ImageDecoder};
    use crate::params::{DecodeParams, ResourceKey};
    use std::time::Duration;

    fn seeded_cache(ids: &[&str]) -> Arc<ResourceCache> {
        let cache = Arc::new(ResourceCache::new(1024 * 1024));
        let image = DecodedImage::new(image::RgbaImage::new(2, 2));
        for id in ids {
            for width in [16, 32] {
                let params = DecodeParams::default().with_max_width(width);
                let key = ResourceKey::new(id, &params);
                cache.try_add(key, image.clone(), image.cost(), params);
            }
        }
        cache
    }

    fn open_store(dir: &tempfile::TempDir) -> Arc<DirectoryBlobStore> {
        Arc::new(DirectoryBlobStore::open(dir.path(), Arc::new(ImageDecoder)).unwrap())
    }

    async fn wait_until(mut condition: impl FnMut() -> bool) -> bool {
        for _ in 0..200 {
            if condition() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        condition()
    }

    #[tokio::test]
    async fn test_removed_event_evicts_every_variant() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(&dir);
        store.add("a.png", &png_bytes(2, 2)).unwrap();

        let cache = seeded_cache(&["a.png", "b.png"]);
        let bridge = InvalidationBridge::new(Arc::clone(&cache));
        bridge.bind(store.clone()).await;
        assert!(bridge.is_bound().await);

        store.remove("a.png").unwrap();

        assert!(wait_until(|| cache.len() == 2).await);
        assert!(cache
            .keys_by_recency()
            .iter()
            .all(|key| key.source() == "b.png"));
    }

    #[tokio::test]
    async fn test_added_and_modified_are_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(&dir);
        let cache = seeded_cache(&["a.png"]);
        let bridge = InvalidationBridge::new(Arc::clone(&cache));
        bridge.bind(store.clone()).await;

        store.add("a.png", &png_bytes(2, 2)).unwrap();
        store.touch("a.png", &png_bytes(3, 3)).unwrap();
        // A removal of something else acts as a barrier for the two above.
        store.add("z.png", &png_bytes(2, 2)).unwrap();
        store.remove("z.png").unwrap();

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(cache.len(), 2);
    }

    #[tokio::test]
    async fn test_rebind_detaches_previous_store() {
        let first_dir = tempfile::tempdir().unwrap();
        let second_dir = tempfile::tempdir().unwrap();
        let first = open_store(&first_dir);
        let second = open_store(&second_dir);
        first.add("a.png", &png_bytes(2, 2)).unwrap();
        second.add("b.png", &png_bytes(2, 2)).unwrap();

        let cache = seeded_cache(&["a.png", "b.png"]);
        let bridge = InvalidationBridge::new(Arc::clone(&cache));
        bridge.bind(first.clone()).await;
        bridge.bind(second.clone()).await;

        first.remove("a.png").unwrap();
        second.remove("b.png").unwrap();

        assert!(wait_until(|| cache.len() == 2).await);
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(cache
            .keys_by_recency()
            .iter()
            .all(|key| key.source() == "a.png"));
    }

    #[tokio::test]
    async fn test_unbind_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(&dir);
        store.add("a.png", &png_bytes(2, 2)).unwrap();

        let cache = seeded_cache(&["a.png"]);
        let bridge = InvalidationBridge::new(Arc::clone(&cache));

        assert!(!bridge.unbind().await);
        bridge.bind(store.clone()).await;
        assert!(bridge.unbind().await);
        assert!(!bridge.unbind().await);
        assert!(!bridge.is_bound().await);

        store.remove("a.png").unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(cache.len(), 2);
    }
}
