//! In-memory LRU image cache with a byte budget.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use lru::LruCache;
use parking_lot::Mutex;
use tracing::{debug, trace};

use crate::domain::entities::ImageId;
use crate::domain::ports::ImageCachePort;

/// Default memory budget for decoded images (64 MiB).
pub const DEFAULT_MEMORY_BUDGET: usize = 64 * 1024 * 1024;

struct Inner {
    entries: LruCache<ImageId, Arc<image::DynamicImage>>,
    used: usize,
}

/// In-memory LRU cache for decoded images.
///
/// Entries are charged by the size of their pixel buffer; inserting past the
/// budget evicts least-recently-used entries first.
pub struct MemoryImageCache {
    inner: Mutex<Inner>,
    budget: usize,
    enabled: AtomicBool,
    hits: AtomicU64,
    misses: AtomicU64,
}

/// Bytes held by a decoded image.
#[must_use]
pub fn image_footprint(image: &image::DynamicImage) -> usize {
    image.as_bytes().len()
}

impl MemoryImageCache {
    /// Creates a new cache holding at most `budget` bytes of pixels.
    #[must_use]
    pub fn new(budget: usize) -> Self {
        Self {
            inner: Mutex::new(Inner {
                entries: LruCache::unbounded(),
                used: 0,
            }),
            budget,
            enabled: AtomicBool::new(true),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    /// Enables or disables insertion. Lookups keep working either way.
    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Relaxed);
    }

    /// Returns whether `put` currently stores images.
    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }

    /// Returns the bytes currently charged against the budget.
    #[must_use]
    pub fn used_bytes(&self) -> usize {
        self.inner.lock().used
    }

    /// Returns cache statistics.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn stats(&self) -> CacheStats {
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let total = hits + misses;
        let hit_rate = if total > 0 {
            (hits as f64 / total as f64) * 100.0
        } else {
            0.0
        };
        let inner = self.inner.lock();
        CacheStats {
            hits,
            misses,
            hit_rate,
            size: inner.entries.len(),
            used_bytes: inner.used,
        }
    }

    /// Peeks at an image without promoting it in the LRU.
    pub fn peek(&self, id: &ImageId) -> Option<Arc<image::DynamicImage>> {
        self.inner.lock().entries.peek(id).cloned()
    }
}

impl Default for MemoryImageCache {
    fn default() -> Self {
        Self::new(DEFAULT_MEMORY_BUDGET)
    }
}

/// Statistics about cache performance.
#[derive(Debug, Clone)]
pub struct CacheStats {
    /// Number of cache hits.
    pub hits: u64,
    /// Number of cache misses.
    pub misses: u64,
    /// Hit rate as a percentage.
    pub hit_rate: f64,
    /// Current number of cached images.
    pub size: usize,
    /// Bytes of pixel data held.
    pub used_bytes: usize,
}

impl std::fmt::Display for CacheStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Cache: {} images ({} bytes), {:.1}% hit rate ({} hits, {} misses)",
            self.size, self.used_bytes, self.hit_rate, self.hits, self.misses
        )
    }
}

impl ImageCachePort for MemoryImageCache {
    fn get(&self, id: &ImageId) -> Option<Arc<image::DynamicImage>> {
        let mut inner = self.inner.lock();
        if let Some(img) = inner.entries.get(id) {
            self.hits.fetch_add(1, Ordering::Relaxed);
            trace!(id = %id, "Memory cache hit");
            Some(img.clone())
        } else {
            self.misses.fetch_add(1, Ordering::Relaxed);
            trace!(id = %id, "Memory cache miss");
            None
        }
    }

    fn put(&self, id: ImageId, image: Arc<image::DynamicImage>) {
        if !self.is_enabled() {
            trace!(id = %id, "Memory cache disabled, skipping put");
            return;
        }

        let size = image_footprint(&image);
        if size > self.budget {
            debug!(id = %id, size, budget = self.budget, "Image larger than memory budget");
            return;
        }

        let mut inner = self.inner.lock();
        if let Some(old) = inner.entries.put(id.clone(), image) {
            inner.used -= image_footprint(&old);
        }
        inner.used += size;
        debug!(id = %id, size, used = inner.used, "Stored image in memory cache");

        while inner.used > self.budget {
            let Some((evicted_id, evicted)) = inner.entries.pop_lru() else {
                break;
            };
            inner.used -= image_footprint(&evicted);
            debug!(id = %evicted_id, "Evicted image from memory cache");
        }
    }

    fn evict(&self, id: &ImageId) {
        let mut inner = self.inner.lock();
        if let Some(old) = inner.entries.pop(id) {
            inner.used -= image_footprint(&old);
            debug!(id = %id, "Evicted image from memory cache");
        }
    }

    fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    fn clear(&self) {
        let mut inner = self.inner.lock();
        inner.entries.clear();
        inner.used = 0;
        debug!("Cleared memory image cache");
    }
}
