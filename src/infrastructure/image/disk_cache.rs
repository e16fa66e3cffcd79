//! Disk-based image cache for persistence across sessions.
//!
//! Stores raw encoded bytes, one file per key, with no sidecar metadata.
//! Without a configured `max_size` disk usage only shrinks on an explicit
//! [`DiskImageCache::clear`].

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};

use parking_lot::Mutex;
use tempfile::TempPath;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, trace, warn};

use crate::domain::entities::ImageId;
use crate::domain::errors::{LoadError, LoadResult};

const ENTRY_EXTENSION: &str = "img";
const PARTIAL_SUFFIX: &str = ".part";
const WRITE_CHECK_FILE_NAME: &str = ".write-check";

/// Disk-based image cache that persists raw image bytes.
pub struct DiskImageCache {
    cache_dir: PathBuf,
    max_size: Option<u64>,
    current_size: AtomicU64,
    item_count: AtomicUsize,
    available: AtomicBool,
    commit_lock: Mutex<()>,
}

impl DiskImageCache {
    /// Creates a new disk cache rooted at `cache_dir`, creating the directory if needed.
    ///
    /// # Errors
    /// Returns `StorageUnavailable` if the directory cannot be created or written.
    pub async fn new(cache_dir: PathBuf, max_size: Option<u64>) -> LoadResult<Self> {
        fs::create_dir_all(&cache_dir)
            .await
            .map_err(|e| LoadError::storage(format!("failed to create {}: {e}", cache_dir.display())))?;

        let check = cache_dir.join(WRITE_CHECK_FILE_NAME);
        fs::write(&check, b"")
            .await
            .map_err(|e| LoadError::storage(format!("{} is not writable: {e}", cache_dir.display())))?;
        let _ = fs::remove_file(&check).await;

        let mut total_size = 0u64;
        let mut count = 0usize;

        let mut entries = fs::read_dir(&cache_dir)
            .await
            .map_err(|e| LoadError::storage(format!("failed to read cache dir: {e}")))?;

        while let Ok(Some(entry)) = entries.next_entry().await {
            let path = entry.path();
            if is_partial(&path) {
                // Left behind by an interrupted session.
                let _ = fs::remove_file(&path).await;
            } else if is_entry(&path)
                && let Ok(meta) = entry.metadata().await
            {
                total_size += meta.len();
                count += 1;
            }
        }

        debug!(dir = %cache_dir.display(), count, total_size, "Opened disk cache");

        let cache = Self {
            cache_dir,
            max_size,
            current_size: AtomicU64::new(total_size),
            item_count: AtomicUsize::new(count),
            available: AtomicBool::new(true),
            commit_lock: Mutex::new(()),
        };

        cache.cleanup_if_needed().await;

        Ok(cache)
    }

    /// Opens the cache in the first candidate directory that can be created and written.
    ///
    /// # Errors
    /// Returns `StorageUnavailable` if no candidate is usable.
    pub async fn resolve(candidates: &[PathBuf], max_size: Option<u64>) -> LoadResult<Self> {
        let mut last_error = LoadError::storage("no cache directory candidates");
        for dir in candidates {
            match Self::new(dir.clone(), max_size).await {
                Ok(cache) => return Ok(cache),
                Err(e) => {
                    warn!(dir = %dir.display(), error = %e, "Cache directory unusable");
                    last_error = e;
                }
            }
        }
        Err(last_error)
    }

    /// Returns the root directory of the cache.
    #[must_use]
    pub fn cache_dir(&self) -> &Path {
        &self.cache_dir
    }

    /// Returns the path for a cached image.
    #[must_use]
    pub fn cache_path(&self, id: &ImageId) -> PathBuf {
        self.cache_dir.join(format!("{}.{ENTRY_EXTENSION}", id.as_str()))
    }

    /// Returns false once a write into the cache root has failed this session.
    #[must_use]
    pub fn is_available(&self) -> bool {
        self.available.load(Ordering::Relaxed)
    }

    fn mark_unavailable(&self, reason: &str) {
        if self.available.swap(false, Ordering::Relaxed) {
            warn!(dir = %self.cache_dir.display(), reason, "Disk cache disabled for this session");
        }
    }

    /// Returns the path of the cached file for `id` if it exists.
    pub async fn get(&self, id: &ImageId) -> Option<PathBuf> {
        if !self.is_available() {
            return None;
        }
        let path = self.cache_path(id);
        if fs::try_exists(&path).await.unwrap_or(false) {
            trace!(id = %id, path = %path.display(), "Disk cache hit");
            Some(path)
        } else {
            trace!(id = %id, "Disk cache miss");
            None
        }
    }

    /// Gets raw image bytes from disk cache.
    pub async fn get_bytes(&self, id: &ImageId) -> Option<Vec<u8>> {
        let path = self.get(id).await?;
        fs::read(&path).await.ok()
    }

    /// Stores raw bytes in the disk cache, replacing any existing entry.
    ///
    /// # Errors
    /// Returns `StorageUnavailable` if the file cannot be written.
    pub async fn put(&self, id: &ImageId, bytes: &[u8]) -> LoadResult<PathBuf> {
        let mut writer = self.writer(id).await?;
        writer.write(self, bytes).await?;
        self.commit(writer).await
    }

    /// Starts a streaming write for `id`. Nothing becomes visible until [`Self::commit`].
    ///
    /// # Errors
    /// Returns `StorageUnavailable` if the cache is disabled or the file cannot be created.
    pub async fn writer(&self, id: &ImageId) -> LoadResult<DiskCacheWriter> {
        if !self.is_available() {
            return Err(LoadError::storage("disk cache disabled"));
        }
        let created = tempfile::Builder::new()
            .prefix(&format!("{}.", id.as_str()))
            .suffix(PARTIAL_SUFFIX)
            .tempfile_in(&self.cache_dir);
        let (file, temp_path) = match created {
            Ok(named) => named.into_parts(),
            Err(e) => {
                self.mark_unavailable(&e.to_string());
                return Err(LoadError::storage(format!("failed to create cache file: {e}")));
            }
        };
        Ok(DiskCacheWriter {
            file: fs::File::from_std(file),
            temp_path,
            final_path: self.cache_path(id),
            written: 0,
        })
    }

    /// Moves a finished write into place and returns the entry path.
    ///
    /// # Errors
    /// Returns `StorageUnavailable` if the data cannot be flushed or renamed.
    pub async fn commit(&self, writer: DiskCacheWriter) -> LoadResult<PathBuf> {
        let DiskCacheWriter {
            mut file,
            temp_path,
            final_path,
            written: new_size,
        } = writer;
        if let Err(e) = file.flush().await {
            self.mark_unavailable(&e.to_string());
            return Err(LoadError::storage(format!("failed to flush cache file: {e}")));
        }
        drop(file);

        // Replacement check and rename must not interleave with another commit for the key.
        let old_size = {
            let _guard = self.commit_lock.lock();
            let old_size = std::fs::metadata(&final_path).map(|m| m.len()).ok();
            temp_path.persist(&final_path).map_err(|e| {
                LoadError::storage(format!("failed to move cache file into place: {}", e.error))
            })?;
            old_size
        };

        if let Some(old) = old_size {
            if new_size > old {
                self.current_size.fetch_add(new_size - old, Ordering::Relaxed);
            } else {
                self.current_size.fetch_sub(old - new_size, Ordering::Relaxed);
            }
        } else {
            self.current_size.fetch_add(new_size, Ordering::Relaxed);
            self.item_count.fetch_add(1, Ordering::Relaxed);
        }

        debug!(path = %final_path.display(), size = new_size, "Stored image in disk cache");

        self.cleanup_if_needed().await;

        Ok(final_path)
    }

    /// Removes an image from disk cache.
    pub async fn evict(&self, id: &ImageId) {
        let path = self.cache_path(id);
        let size = fs::metadata(&path).await.map(|m| m.len()).ok();
        if let Err(e) = fs::remove_file(&path).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(id = %id, error = %e, "Failed to evict from disk cache");
            }
        } else if let Some(s) = size {
            self.current_size.fetch_sub(s, Ordering::Relaxed);
            self.item_count.fetch_sub(1, Ordering::Relaxed);
            debug!(id = %id, "Evicted from disk cache");
        }
    }

    /// Deletes every file under the cache root.
    ///
    /// Keeps going past files that cannot be removed; returns true only if all were.
    pub async fn clear(&self) -> bool {
        let mut entries = match fs::read_dir(&self.cache_dir).await {
            Ok(entries) => entries,
            Err(e) => {
                warn!(error = %e, "Failed to read cache dir");
                return false;
            }
        };

        let mut all_removed = true;
        let mut removed = 0usize;
        loop {
            let entry = match entries.next_entry().await {
                Ok(Some(entry)) => entry,
                Ok(None) => break,
                Err(e) => {
                    warn!(error = %e, "Failed to read cache entry");
                    all_removed = false;
                    break;
                }
            };
            let path = entry.path();
            // In-progress writes belong to their writers and are removed if never committed.
            if is_partial(&path) || entry.file_type().await.is_ok_and(|t| t.is_dir()) {
                continue;
            }
            match fs::remove_file(&path).await {
                Ok(()) => removed += 1,
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "Failed to remove cache file");
                    all_removed = false;
                }
            }
        }

        let (size, count) = self.scan_entries().await;
        self.current_size.store(size, Ordering::Relaxed);
        self.item_count.store(count, Ordering::Relaxed);
        debug!(removed, all_removed, "Cleared disk cache");
        all_removed
    }

    /// Returns the current cache size in bytes.
    #[must_use]
    pub fn current_size(&self) -> u64 {
        self.current_size.load(Ordering::Relaxed)
    }

    /// Returns the number of cached files.
    #[must_use]
    pub fn len(&self) -> usize {
        self.item_count.load(Ordering::Relaxed)
    }

    /// Returns true if the cache is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Checks if an image is cached.
    pub async fn contains(&self, id: &ImageId) -> bool {
        let path = self.cache_path(id);
        fs::try_exists(&path).await.unwrap_or(false)
    }

    async fn scan_entries(&self) -> (u64, usize) {
        let mut size = 0u64;
        let mut count = 0usize;
        let Ok(mut entries) = fs::read_dir(&self.cache_dir).await else {
            return (0, 0);
        };
        while let Ok(Some(entry)) = entries.next_entry().await {
            if is_entry(&entry.path())
                && let Ok(meta) = entry.metadata().await
            {
                size += meta.len();
                count += 1;
            }
        }
        (size, count)
    }

    /// Cleans up old cache entries if over the optional size limit.
    async fn cleanup_if_needed(&self) {
        let Some(max_size) = self.max_size else {
            return;
        };
        let current_size = self.current_size();
        if current_size <= max_size {
            return;
        }

        debug!(current_size, max_size, "Disk cache over limit, cleaning up");

        let Ok(mut entries) = fs::read_dir(&self.cache_dir).await else {
            return;
        };

        let mut files: Vec<(PathBuf, std::time::SystemTime, u64)> = Vec::new();

        while let Ok(Some(entry)) = entries.next_entry().await {
            let path = entry.path();
            if !is_entry(&path) {
                continue;
            }

            if let Ok(meta) = entry.metadata().await {
                let accessed = meta
                    .accessed()
                    .or_else(|_| meta.modified())
                    .unwrap_or(std::time::SystemTime::UNIX_EPOCH);
                files.push((path, accessed, meta.len()));
            }
        }

        files.sort_by_key(|(_, time, _)| *time);

        let mut freed_size = 0u64;
        let mut freed_count = 0usize;
        let target = current_size - max_size + (max_size / 10);

        for (path, _, size) in files {
            if freed_size >= target {
                break;
            }

            if let Err(e) = fs::remove_file(&path).await {
                warn!(path = %path.display(), error = %e, "Failed to remove old cache file");
            } else {
                trace!(path = %path.display(), "Removed old cache file");
                freed_size += size;
                freed_count += 1;
            }
        }
        self.current_size.fetch_sub(freed_size, Ordering::Relaxed);
        self.item_count.fetch_sub(freed_count, Ordering::Relaxed);

        debug!(freed_size, freed_count, "Disk cache cleanup complete");
    }
}

/// In-progress write of one cache entry.
///
/// Bytes go to a uniquely named `.part` file in the cache root; dropping the
/// writer without committing removes it.
pub struct DiskCacheWriter {
    file: fs::File,
    temp_path: TempPath,
    final_path: PathBuf,
    written: u64,
}

impl DiskCacheWriter {
    /// Appends a chunk to the pending entry.
    ///
    /// # Errors
    /// Returns `StorageUnavailable` and disables the cache if the write fails.
    pub async fn write(&mut self, cache: &DiskImageCache, chunk: &[u8]) -> LoadResult<()> {
        if let Err(e) = self.file.write_all(chunk).await {
            cache.mark_unavailable(&e.to_string());
            return Err(LoadError::storage(format!("failed to write cache file: {e}")));
        }
        self.written += chunk.len() as u64;
        Ok(())
    }
}

fn is_entry(path: &Path) -> bool {
    path.extension().is_some_and(|ext| ext == ENTRY_EXTENSION)
}

fn is_partial(path: &Path) -> bool {
    path.to_str().is_some_and(|p| p.ends_with(PARTIAL_SUFFIX))
}

/// Candidate cache roots in order of preference.
///
/// An explicitly configured directory comes first, then the per-user cache
/// directory, then a private directory under the system temp dir.
#[must_use]
pub fn default_cache_dirs(configured: Option<&Path>) -> Vec<PathBuf> {
    let mut dirs = Vec::with_capacity(3);
    if let Some(dir) = configured {
        dirs.push(dir.to_path_buf());
    }
    if let Some(project) = directories::ProjectDirs::from("org", "lazytile", "lazytile") {
        dirs.push(project.cache_dir().join("images"));
    }
    dirs.push(std::env::temp_dir().join("lazytile").join("images"));
    dirs
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    async fn create_test_cache() -> (DiskImageCache, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let cache = DiskImageCache::new(temp_dir.path().to_path_buf(), None)
            .await
            .unwrap();
        (cache, temp_dir)
    }

    #[tokio::test]
    async fn test_put_then_get_yields_same_bytes() {
        let (cache, _temp) = create_test_cache().await;
        let id = ImageId::from_url("http://x/a.jpg");
        let data = b"test image data";

        let stored = cache.put(&id, data).await.unwrap();
        let path = cache.get(&id).await.unwrap();

        assert_eq!(stored, path);
        assert_eq!(std::fs::read(&path).unwrap(), data);
        assert_eq!(path.file_name().unwrap().to_str().unwrap(), format!("{id}.img"));
    }

    #[tokio::test]
    async fn test_cache_miss() {
        let (cache, _temp) = create_test_cache().await;
        assert!(cache.get(&ImageId::new("nonexistent")).await.is_none());
        assert!(cache.get_bytes(&ImageId::new("nonexistent")).await.is_none());
    }

    #[tokio::test]
    async fn test_put_overwrites() {
        let (cache, _temp) = create_test_cache().await;
        let id = ImageId::new("test1");
        cache.put(&id, b"first version").await.unwrap();
        cache.put(&id, b"second").await.unwrap();

        assert_eq!(cache.get_bytes(&id).await.unwrap(), b"second");
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.current_size(), 6);
    }

    #[tokio::test]
    async fn test_streaming_write_invisible_until_commit() {
        let (cache, _temp) = create_test_cache().await;
        let id = ImageId::new("streamed");

        let mut writer = cache.writer(&id).await.unwrap();
        writer.write(&cache, b"abc").await.unwrap();
        writer.write(&cache, b"def").await.unwrap();
        assert!(cache.get(&id).await.is_none());

        let path = cache.commit(writer).await.unwrap();
        assert_eq!(std::fs::read(path).unwrap(), b"abcdef");
    }

    #[tokio::test]
    async fn test_dropped_writer_leaves_nothing() {
        let (cache, temp) = create_test_cache().await;
        let id = ImageId::new("abandoned");

        let mut writer = cache.writer(&id).await.unwrap();
        writer.write(&cache, b"partial").await.unwrap();
        drop(writer);

        assert!(cache.get(&id).await.is_none());
        assert_eq!(std::fs::read_dir(temp.path()).unwrap().count(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_overlapping_puts_for_one_key() {
        let temp_dir = TempDir::new().unwrap();
        let cache = std::sync::Arc::new(
            DiskImageCache::new(temp_dir.path().to_path_buf(), None)
                .await
                .unwrap(),
        );
        let id = ImageId::new("shared");

        for _ in 0..25 {
            let first = tokio::spawn({
                let cache = cache.clone();
                let id = id.clone();
                async move { cache.put(&id, b"aaaa").await }
            });
            let second = tokio::spawn({
                let cache = cache.clone();
                let id = id.clone();
                async move { cache.put(&id, b"bbbbbbbb").await }
            });
            let (first, second) = tokio::join!(first, second);
            first.unwrap().unwrap();
            second.unwrap().unwrap();

            let stored = cache.get_bytes(&id).await.unwrap();
            assert!(stored == b"aaaa" || stored == b"bbbbbbbb");
        }

        assert_eq!(cache.len(), 1);
        assert_eq!(std::fs::read_dir(temp_dir.path()).unwrap().count(), 1);
    }

    #[tokio::test]
    async fn test_clear_spares_in_progress_write() {
        let (cache, _temp) = create_test_cache().await;
        let id = ImageId::new("streaming");
        cache.put(&ImageId::new("old"), b"old").await.unwrap();

        let mut writer = cache.writer(&id).await.unwrap();
        writer.write(&cache, b"first half ").await.unwrap();
        assert!(cache.clear().await);
        writer.write(&cache, b"second half").await.unwrap();
        let path = cache.commit(writer).await.unwrap();

        assert_eq!(std::fs::read(path).unwrap(), b"first half second half");
        assert!(cache.get(&ImageId::new("old")).await.is_none());
        assert_eq!(cache.len(), 1);
    }

    #[tokio::test]
    async fn test_evict() {
        let (cache, _temp) = create_test_cache().await;
        let id = ImageId::new("test1");

        cache.put(&id, b"test").await.unwrap();
        assert!(cache.contains(&id).await);

        cache.evict(&id).await;
        assert!(!cache.contains(&id).await);
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn test_clear_removes_every_file() {
        let (cache, temp) = create_test_cache().await;

        cache.put(&ImageId::new("test1"), b"data1").await.unwrap();
        cache.put(&ImageId::new("test2"), b"data2").await.unwrap();
        std::fs::write(temp.path().join("stray.bin"), b"x").unwrap();

        assert_eq!(cache.len(), 2);

        assert!(cache.clear().await);
        assert_eq!(cache.len(), 0);
        assert_eq!(cache.current_size(), 0);
        assert_eq!(std::fs::read_dir(temp.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_counters_track_existing_files() {
        let temp_dir = TempDir::new().unwrap();
        std::fs::write(temp_dir.path().join("aa.img"), b"hello").unwrap();
        std::fs::write(temp_dir.path().join("bb.img.part"), b"junk").unwrap();

        let cache = DiskImageCache::new(temp_dir.path().to_path_buf(), None)
            .await
            .unwrap();

        assert_eq!(cache.len(), 1);
        assert_eq!(cache.current_size(), 5);
        assert!(!temp_dir.path().join("bb.img.part").exists());
    }

    #[tokio::test]
    async fn test_unbounded_by_default() {
        let (cache, _temp) = create_test_cache().await;
        for i in 0..20 {
            cache.put(&ImageId::new(format!("img{i}")), &[0u8; 1024]).await.unwrap();
        }
        assert_eq!(cache.len(), 20);
        assert_eq!(cache.current_size(), 20 * 1024);
    }

    #[tokio::test]
    async fn test_optional_bound_evicts_oldest() {
        let temp_dir = TempDir::new().unwrap();
        let cache = DiskImageCache::new(temp_dir.path().to_path_buf(), Some(10))
            .await
            .unwrap();

        cache.put(&ImageId::new("test1"), b"123456").await.unwrap();

        tokio::time::sleep(std::time::Duration::from_millis(10)).await;

        cache.put(&ImageId::new("test2"), b"123456").await.unwrap();

        assert_eq!(cache.len(), 1);
        assert_eq!(cache.current_size(), 6);
    }

    #[tokio::test]
    async fn test_resolve_skips_unusable_candidates() {
        let temp_dir = TempDir::new().unwrap();
        let blocker = temp_dir.path().join("not-a-dir");
        std::fs::write(&blocker, b"file").unwrap();
        let usable = temp_dir.path().join("cache");

        let cache = DiskImageCache::resolve(&[blocker.join("images"), usable.clone()], None)
            .await
            .unwrap();
        assert_eq!(cache.cache_dir(), usable.as_path());
    }

    #[tokio::test]
    async fn test_resolve_fails_without_candidates() {
        let err = DiskImageCache::resolve(&[], None).await.err().unwrap();
        assert!(matches!(err, LoadError::StorageUnavailable { .. }));
    }

    #[tokio::test]
    async fn test_unavailable_after_root_removed() {
        let temp_dir = TempDir::new().unwrap();
        let root = temp_dir.path().join("cache");
        let cache = DiskImageCache::new(root.clone(), None).await.unwrap();
        std::fs::remove_dir_all(&root).unwrap();

        let err = cache.put(&ImageId::new("a"), b"x").await.unwrap_err();
        assert!(matches!(err, LoadError::StorageUnavailable { .. }));
        assert!(!cache.is_available());

        std::fs::create_dir_all(&root).unwrap();
        std::fs::write(root.join("a.img"), b"x").unwrap();
        // Stays a permanent miss for the rest of the session.
        assert!(cache.get(&ImageId::new("a")).await.is_none());
    }

    #[test]
    fn test_default_dirs_prefer_configured() {
        let dirs = default_cache_dirs(Some(Path::new("/srv/tiles")));
        assert_eq!(dirs[0], PathBuf::from("/srv/tiles"));
        assert!(dirs.last().unwrap().starts_with(std::env::temp_dir()));
    }
}
