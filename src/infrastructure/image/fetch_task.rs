//! Worker-side unit of work: disk lookup, network fetch, decode, cache fill.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Semaphore, oneshot};
use tracing::{debug, error, trace, warn};

use crate::domain::entities::{ImageId, ImageSource, LoadedImage, SlotId};
use crate::domain::errors::{LoadError, LoadResult};
use crate::domain::ports::{ImageCachePort, read_to_end};

use super::decode::{DecodeOptions, decode_bytes, decode_file};
use super::delivery::Completion;
use super::loader::LoaderShared;

/// Per-request settings, captured when the request is enqueued.
#[derive(Debug, Clone, Copy)]
pub struct FetchOptions {
    /// Read from and write to the disk tier.
    pub use_disk_cache: bool,
    /// Insert the decoded image into the memory tier.
    pub use_memory_cache: bool,
    /// Limit on waiting for response headers and on each body read.
    pub timeout: Duration,
    /// Decode limits.
    pub decode: DecodeOptions,
}

pub(crate) struct FetchTask {
    pub(crate) task_id: u64,
    pub(crate) id: ImageId,
    pub(crate) url: String,
    pub(crate) options: FetchOptions,
    pub(crate) shared: Arc<LoaderShared>,
    pub(crate) semaphore: Arc<Semaphore>,
    pub(crate) cancel_rx: oneshot::Receiver<()>,
}

impl FetchTask {
    /// Runs the task to completion and reports exactly one completion.
    pub(crate) async fn run(self) {
        let Self {
            task_id,
            id,
            url,
            options,
            shared,
            semaphore,
            mut cancel_rx,
        } = self;
        let guard = CompletionGuard {
            shared: shared.clone(),
            id: id.clone(),
            task_id,
            reported: false,
        };

        let outcome = tokio::select! {
            biased;
            _ = &mut cancel_rx => Err(LoadError::Cancelled),
            result = execute(&shared, &semaphore, task_id, &id, &url, options) => result,
        };

        if matches!(outcome, Err(LoadError::OutOfMemory)) {
            warn!(id = %id, "Out of memory while decoding, clearing memory cache");
            shared.memory_cache.clear();
        }

        guard.report(&url, outcome);
    }
}

/// Sends the task's completion, or a failure if the task unwinds before it could.
struct CompletionGuard {
    shared: Arc<LoaderShared>,
    id: ImageId,
    task_id: u64,
    reported: bool,
}

impl CompletionGuard {
    /// Releases the in-flight record and returns the waiters still expecting this key.
    fn take_live_waiters(&self) -> Vec<SlotId> {
        let waiters = self.shared.finish(&self.id, self.task_id);
        let (slots, stale): (Vec<_>, Vec<_>) = waiters
            .into_iter()
            .partition(|slot| !self.shared.registry.is_stale(*slot, &self.id));
        if !stale.is_empty() {
            trace!(id = %self.id, discarded = stale.len(), "Discarding result for reassigned slots");
        }
        slots
    }

    fn report(mut self, url: &str, outcome: LoadResult<Option<LoadedImage>>) {
        self.reported = true;
        let slots = self.take_live_waiters();
        let id = &self.id;

        let result = match outcome {
            Ok(Some(image)) => Ok(image),
            Ok(None) => Err(LoadError::Cancelled),
            Err(e) => {
                match &e {
                    LoadError::Cancelled => debug!(id = %id, "Fetch cancelled"),
                    _ if slots.is_empty() => debug!(id = %id, error = %e, "Fetch failed for stale slots"),
                    _ => warn!(id = %id, url = %url, error = %e, "Fetch failed"),
                }
                Err(e)
            }
        };

        self.send(slots, result);
    }

    fn send(&self, slots: Vec<SlotId>, result: LoadResult<LoadedImage>) {
        let _ = self.shared.completion_tx.send(Completion {
            id: self.id.clone(),
            slots,
            result,
        });
    }
}

impl Drop for CompletionGuard {
    fn drop(&mut self) {
        if self.reported {
            return;
        }
        error!(id = %self.id, "Fetch task aborted before reporting");
        let slots = self.take_live_waiters();
        self.send(slots, Err(LoadError::network("fetch task aborted")));
    }
}

/// Produces the image, or `None` if every waiting slot was reassigned before work began.
async fn execute(
    shared: &LoaderShared,
    semaphore: &Semaphore,
    task_id: u64,
    id: &ImageId,
    url: &str,
    options: FetchOptions,
) -> LoadResult<Option<LoadedImage>> {
    let _permit = semaphore
        .acquire()
        .await
        .map_err(|_| LoadError::Cancelled)?;

    if shared.abandon_if_unwanted(id, task_id) {
        trace!(id = %id, "All waiting slots reassigned, skipping fetch");
        return Ok(None);
    }

    let (image, source) = fetch_image(shared, id, url, options).await?;
    let image = Arc::new(image);

    if options.use_memory_cache {
        shared.memory_cache.put(id.clone(), image.clone());
    }

    debug!(id = %id, source = %source, "Image loaded successfully");

    Ok(Some(LoadedImage {
        id: id.clone(),
        image,
        source,
    }))
}

async fn fetch_image(
    shared: &LoaderShared,
    id: &ImageId,
    url: &str,
    options: FetchOptions,
) -> LoadResult<(image::DynamicImage, ImageSource)> {
    let disk_cache = shared
        .disk_cache
        .as_deref()
        .filter(|disk| options.use_disk_cache && disk.is_available());

    if let Some(disk) = disk_cache
        && let Some(path) = disk.get(id).await
    {
        match decode_file(&path, options.decode).await {
            Ok(image) => return Ok((image, ImageSource::DiskCache)),
            Err(LoadError::OutOfMemory) => return Err(LoadError::OutOfMemory),
            Err(e) => {
                warn!(id = %id, error = %e, "Cached file unreadable, refetching");
                disk.evict(id).await;
            }
        }
    }

    let mut body = shared.fetcher.fetch(url, options.timeout).await?;

    if let Some(disk) = disk_cache {
        match disk.writer(id).await {
            Ok(mut writer) => {
                while let Some(chunk) = body.next_chunk().await? {
                    writer.write(disk, &chunk).await?;
                }
                let path = disk.commit(writer).await?;
                let image = decode_file(&path, options.decode).await?;
                return Ok((image, ImageSource::Network));
            }
            Err(e) => debug!(id = %id, error = %e, "Disk cache unavailable, buffering in memory"),
        }
    }

    let bytes = read_to_end(body.as_mut()).await?;
    let image = decode_bytes(bytes, options.decode).await?;
    Ok((image, ImageSource::Network))
}
