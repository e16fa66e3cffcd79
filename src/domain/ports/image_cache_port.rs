//! Port definitions for image caching, loading and delivery.

use std::sync::Arc;

use crate::domain::entities::{ImageId, LoadedImage, SlotId};
use crate::domain::errors::LoadError;

/// Port for in-memory image caching operations.
/// Implementations must be thread-safe.
pub trait ImageCachePort: Send + Sync {
    /// Attempts to get an image from the cache.
    /// Returns None if not cached.
    fn get(&self, id: &ImageId) -> Option<Arc<image::DynamicImage>>;

    /// Stores an image in the cache.
    fn put(&self, id: ImageId, image: Arc<image::DynamicImage>);

    /// Removes an image from the cache.
    fn evict(&self, id: &ImageId);

    /// Returns the current number of cached images.
    fn len(&self) -> usize;

    /// Returns true if the cache is empty.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Clears all images from the cache.
    fn clear(&self);
}

/// Receives load results. Called only from the delivery thread.
#[cfg_attr(test, mockall::automock)]
pub trait ImageConsumer {
    /// A slot's expected image is ready to be shown.
    fn on_delivered(&mut self, slot: SlotId, image: LoadedImage);

    /// A slot's expected image could not be loaded.
    fn on_failed(&mut self, slot: SlotId, error: &LoadError);
}

/// How a load request was handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadState {
    /// Served from memory; the consumer has already been called.
    Delivered,
    /// A new fetch task was queued on the worker pool.
    Enqueued,
    /// Joined a fetch already in flight for the same key.
    Coalesced,
}

/// Capability interface of an image loading engine.
#[async_trait::async_trait]
pub trait ImageLoaderPort: Send + Sync {
    /// Requests `url` for `slot`, replacing whatever the slot expected before.
    fn load(&self, url: &str, slot: SlotId, consumer: &mut dyn ImageConsumer) -> LoadState;

    /// Retires a slot and releases the fetch it was waiting on, if nobody else is.
    fn cancel(&self, slot: SlotId);

    /// Clears both cache tiers. Returns false if some disk entries survived.
    async fn clear_cache(&self) -> bool;

    /// Enables or disables the memory tier for subsequent requests.
    fn set_memory_cache_enabled(&self, enabled: bool);

    /// Enables or disables the disk tier for subsequent requests.
    fn set_disk_cache_enabled(&self, enabled: bool);
}
