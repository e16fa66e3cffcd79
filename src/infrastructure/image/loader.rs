//! Image loading engine.
//!
//! Memory hits are delivered synchronously from [`ImageLoader::load`]. Misses
//! become fetch tasks on a bounded worker pool; concurrent requests for the
//! same key share one task. Results travel back over a channel to the
//! [`DeliveryQueue`], which re-checks each slot before calling the consumer.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tokio::sync::{Semaphore, mpsc, oneshot};
use tracing::{debug, info, trace, warn};

use crate::domain::entities::{ImageId, ImageSource, LoadedImage, SlotId};
use crate::domain::errors::LoadResult;
use crate::domain::ports::{
    ImageCachePort, ImageConsumer, ImageFetchPort, ImageLoaderPort, LoadState,
};

use super::decode::{DEFAULT_MAX_DECODE_BYTES, DecodeOptions, MIN_DECODE_DIMENSION};
use super::delivery::{Completion, DeliveryQueue};
use super::disk_cache::{DiskImageCache, default_cache_dirs};
use super::fetch_task::{FetchOptions, FetchTask};
use super::http_fetcher::HttpImageFetcher;
use super::memory_cache::{CacheStats, DEFAULT_MEMORY_BUDGET, MemoryImageCache};
use super::registry::ConsumerRegistry;

/// Configuration for the image loader.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ImageLoaderConfig {
    /// Use the in-memory tier.
    pub memory_cache_enabled: bool,
    /// Use the on-disk tier.
    pub disk_cache_enabled: bool,
    /// Bytes of decoded pixels kept in memory.
    pub memory_cache_budget_bytes: usize,
    /// Optional bound on the disk tier. Unbounded when absent.
    pub disk_cache_max_bytes: Option<u64>,
    /// Preferred disk cache directory.
    pub cache_dir: Option<PathBuf>,
    /// Maximum concurrent fetch tasks.
    pub worker_count: usize,
    /// Per-request network timeout in seconds.
    pub timeout_secs: u64,
    /// Connection establishment timeout in seconds.
    pub connect_timeout_secs: u64,
    /// Smallest side a downsampled image may have.
    pub min_decode_dimension: u32,
    /// Allocation cap for a single decode.
    pub max_decode_bytes: u64,
}

impl Default for ImageLoaderConfig {
    fn default() -> Self {
        Self {
            memory_cache_enabled: true,
            disk_cache_enabled: true,
            memory_cache_budget_bytes: DEFAULT_MEMORY_BUDGET,
            disk_cache_max_bytes: None,
            cache_dir: None,
            worker_count: 5,
            timeout_secs: 30,
            connect_timeout_secs: 30,
            min_decode_dimension: MIN_DECODE_DIMENSION,
            max_decode_bytes: DEFAULT_MAX_DECODE_BYTES,
        }
    }
}

/// Knobs that may change between loads. In-flight requests keep the values
/// they were enqueued with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoaderSettings {
    /// Use the in-memory tier.
    pub memory_cache_enabled: bool,
    /// Use the on-disk tier.
    pub disk_cache_enabled: bool,
    /// Maximum concurrent fetch tasks.
    pub worker_count: usize,
    /// Per-request network timeout.
    pub timeout: Duration,
    /// Decode limits.
    pub decode: DecodeOptions,
}

impl From<&ImageLoaderConfig> for LoaderSettings {
    fn from(config: &ImageLoaderConfig) -> Self {
        Self {
            memory_cache_enabled: config.memory_cache_enabled,
            disk_cache_enabled: config.disk_cache_enabled,
            worker_count: config.worker_count.max(1),
            timeout: Duration::from_secs(config.timeout_secs),
            decode: DecodeOptions {
                min_dimension: config.min_decode_dimension,
                max_alloc: config.max_decode_bytes,
            },
        }
    }
}

/// Pending fetch for one key.
struct InFlight {
    task_id: u64,
    waiters: Vec<SlotId>,
    cancel: Option<oneshot::Sender<()>>,
}

impl InFlight {
    fn cancel(&mut self) {
        if let Some(tx) = self.cancel.take() {
            let _ = tx.send(());
        }
    }
}

/// State shared between the engine and its workers.
pub(crate) struct LoaderShared {
    pub(crate) memory_cache: Arc<MemoryImageCache>,
    pub(crate) disk_cache: Option<Arc<DiskImageCache>>,
    pub(crate) registry: Arc<ConsumerRegistry>,
    pub(crate) fetcher: Arc<dyn ImageFetchPort>,
    pub(crate) completion_tx: mpsc::UnboundedSender<Completion>,
    in_flight: Mutex<HashMap<ImageId, InFlight>>,
    outstanding: Arc<AtomicUsize>,
}

impl LoaderShared {
    /// Drops the in-flight record for `id` if no waiter still wants it.
    pub(crate) fn abandon_if_unwanted(&self, id: &ImageId, task_id: u64) -> bool {
        let mut in_flight = self.in_flight.lock();
        let Some(record) = in_flight.get(id).filter(|r| r.task_id == task_id) else {
            return true;
        };
        let wanted = record
            .waiters
            .iter()
            .any(|slot| !self.registry.is_stale(*slot, id));
        if !wanted {
            in_flight.remove(id);
        }
        !wanted
    }

    /// Removes the task's in-flight record and returns its waiters.
    pub(crate) fn finish(&self, id: &ImageId, task_id: u64) -> Vec<SlotId> {
        let mut in_flight = self.in_flight.lock();
        match in_flight.get(id) {
            Some(record) if record.task_id == task_id => in_flight
                .remove(id)
                .map(|record| record.waiters)
                .unwrap_or_default(),
            _ => Vec::new(),
        }
    }
}

/// Orchestrates image loading from memory, disk, and network.
pub struct ImageLoader {
    shared: Arc<LoaderShared>,
    settings: RwLock<LoaderSettings>,
    semaphore: RwLock<Arc<Semaphore>>,
    next_task_id: AtomicU64,
    runtime: tokio::runtime::Handle,
}

impl std::fmt::Debug for ImageLoader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ImageLoader")
            .field("settings", &*self.settings.read())
            .field("active", &self.active_count())
            .finish_non_exhaustive()
    }
}

impl ImageLoader {
    /// Creates a loader and the queue its results are delivered through.
    ///
    /// Without a disk cache every request behaves as a disk miss.
    ///
    /// # Panics
    /// Panics if called outside a Tokio runtime.
    #[must_use]
    pub fn new(
        config: &ImageLoaderConfig,
        disk_cache: Option<DiskImageCache>,
        fetcher: Arc<dyn ImageFetchPort>,
    ) -> (Self, DeliveryQueue) {
        let settings = LoaderSettings::from(config);
        let memory_cache = Arc::new(MemoryImageCache::new(config.memory_cache_budget_bytes));
        memory_cache.set_enabled(settings.memory_cache_enabled);

        let registry = Arc::new(ConsumerRegistry::new());
        let (completion_tx, completion_rx) = mpsc::unbounded_channel();
        let outstanding = Arc::new(AtomicUsize::new(0));

        let shared = Arc::new(LoaderShared {
            memory_cache,
            disk_cache: disk_cache.map(Arc::new),
            registry: registry.clone(),
            fetcher,
            completion_tx,
            in_flight: Mutex::new(HashMap::new()),
            outstanding: outstanding.clone(),
        });

        let loader = Self {
            shared,
            semaphore: RwLock::new(Arc::new(Semaphore::new(settings.worker_count))),
            settings: RwLock::new(settings),
            next_task_id: AtomicU64::new(0),
            runtime: tokio::runtime::Handle::current(),
        };

        (loader, DeliveryQueue::new(completion_rx, registry, outstanding))
    }

    /// Creates a loader backed by HTTP and the first usable cache directory.
    ///
    /// If no cache directory is usable the loader runs memory-only.
    ///
    /// # Errors
    /// Returns error if the HTTP client cannot be created.
    pub async fn with_defaults(config: &ImageLoaderConfig) -> LoadResult<(Self, DeliveryQueue)> {
        let fetcher = Arc::new(HttpImageFetcher::new(Duration::from_secs(
            config.connect_timeout_secs,
        ))?);

        let candidates = default_cache_dirs(config.cache_dir.as_deref());
        let disk_cache = match DiskImageCache::resolve(&candidates, config.disk_cache_max_bytes).await
        {
            Ok(cache) => {
                info!(dir = %cache.cache_dir().display(), "Disk cache ready");
                Some(cache)
            }
            Err(e) => {
                warn!(error = %e, "Running without disk cache");
                None
            }
        };

        Ok(Self::new(config, disk_cache, fetcher))
    }

    /// Current settings.
    #[must_use]
    pub fn settings(&self) -> LoaderSettings {
        *self.settings.read()
    }

    /// Sets the worker pool size for requests enqueued from now on.
    pub fn set_worker_count(&self, count: usize) {
        let count = count.max(1);
        self.settings.write().worker_count = count;
        *self.semaphore.write() = Arc::new(Semaphore::new(count));
        debug!(count, "Worker pool resized");
    }

    /// Sets the network timeout for requests enqueued from now on.
    pub fn set_timeout(&self, timeout: Duration) {
        self.settings.write().timeout = timeout;
    }

    /// Number of fetch tasks whose completion has not been dispatched yet.
    #[must_use]
    pub fn active_count(&self) -> usize {
        self.shared.outstanding.load(Ordering::Acquire)
    }

    /// Number of keys currently being fetched.
    #[must_use]
    pub fn in_flight_count(&self) -> usize {
        self.shared.in_flight.lock().len()
    }

    /// Returns memory cache statistics.
    #[must_use]
    pub fn memory_cache_stats(&self) -> CacheStats {
        self.shared.memory_cache.stats()
    }

    /// Returns the disk cache, if one is attached.
    #[must_use]
    pub fn disk_cache(&self) -> Option<&DiskImageCache> {
        self.shared.disk_cache.as_deref()
    }

    /// Cancels every in-flight fetch. Used on shutdown.
    pub fn cancel_all(&self) {
        let mut in_flight = self.shared.in_flight.lock();
        let count = in_flight.len();
        for (_, mut record) in in_flight.drain() {
            record.cancel();
        }
        if count > 0 {
            debug!(count, "Cancelled all pending image loads");
        }
    }

    fn fetch_options(&self, settings: &LoaderSettings) -> FetchOptions {
        FetchOptions {
            use_disk_cache: settings.disk_cache_enabled && self.shared.disk_cache.is_some(),
            use_memory_cache: settings.memory_cache_enabled,
            timeout: settings.timeout,
            decode: settings.decode,
        }
    }
}

#[async_trait::async_trait]
impl ImageLoaderPort for ImageLoader {
    fn load(&self, url: &str, slot: SlotId, consumer: &mut dyn ImageConsumer) -> LoadState {
        let id = ImageId::from_url(url);
        self.shared.registry.expect(slot, id.clone());

        let settings = self.settings();
        if settings.memory_cache_enabled
            && let Some(image) = self.shared.memory_cache.get(&id)
        {
            trace!(%slot, id = %id, "Delivering from memory cache");
            consumer.on_delivered(
                slot,
                LoadedImage {
                    id,
                    image,
                    source: ImageSource::MemoryCache,
                },
            );
            return LoadState::Delivered;
        }

        let mut in_flight = self.shared.in_flight.lock();
        if let Some(record) = in_flight.get_mut(&id) {
            if !record.waiters.contains(&slot) {
                record.waiters.push(slot);
            }
            debug!(%slot, id = %id, "Joined in-flight fetch");
            return LoadState::Coalesced;
        }

        let task_id = self.next_task_id.fetch_add(1, Ordering::Relaxed);
        let (cancel_tx, cancel_rx) = oneshot::channel();
        in_flight.insert(
            id.clone(),
            InFlight {
                task_id,
                waiters: vec![slot],
                cancel: Some(cancel_tx),
            },
        );
        drop(in_flight);

        self.shared.outstanding.fetch_add(1, Ordering::AcqRel);
        let task = FetchTask {
            task_id,
            id: id.clone(),
            url: url.to_string(),
            options: self.fetch_options(&settings),
            shared: self.shared.clone(),
            semaphore: self.semaphore.read().clone(),
            cancel_rx,
        };
        self.runtime.spawn(task.run());

        debug!(%slot, id = %id, url, "Enqueued fetch");
        LoadState::Enqueued
    }

    fn cancel(&self, slot: SlotId) {
        let Some(id) = self.shared.registry.forget(slot) else {
            return;
        };

        let mut in_flight = self.shared.in_flight.lock();
        let Some(record) = in_flight.get_mut(&id) else {
            return;
        };
        record.waiters.retain(|waiter| *waiter != slot);
        let wanted = record
            .waiters
            .iter()
            .any(|waiter| !self.shared.registry.is_stale(*waiter, &id));
        if !wanted && let Some(mut record) = in_flight.remove(&id) {
            record.cancel();
            debug!(%slot, id = %id, "Cancelled fetch with no remaining waiters");
        }
    }

    async fn clear_cache(&self) -> bool {
        self.shared.memory_cache.clear();
        let all_removed = match &self.shared.disk_cache {
            Some(disk) => disk.clear().await,
            None => true,
        };
        info!(all_removed, "Cleared image caches");
        all_removed
    }

    fn set_memory_cache_enabled(&self, enabled: bool) {
        self.settings.write().memory_cache_enabled = enabled;
        self.shared.memory_cache.set_enabled(enabled);
        debug!(enabled, "Memory cache toggled");
    }

    fn set_disk_cache_enabled(&self, enabled: bool) {
        self.settings.write().disk_cache_enabled = enabled;
        debug!(enabled, "Disk cache toggled");
    }
}
