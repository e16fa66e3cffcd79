//! Image acquisition infrastructure.
//!
//! This module provides:
//! - Memory caching with LRU eviction under a byte budget
//! - Disk caching of raw encoded bytes
//! - Bounded decoding with power-of-two downsampling
//! - A worker-pool loader with request coalescing and a staleness guard

pub mod decode;
pub mod delivery;
pub mod disk_cache;
mod fetch_task;
pub mod http_fetcher;
pub mod loader;
pub mod memory_cache;
pub mod registry;

pub use decode::{DecodeOptions, decode_downsampled, downsampled_size};
pub use delivery::{Completion, DeliveryQueue, DispatchOutcome};
pub use disk_cache::{DiskCacheWriter, DiskImageCache, default_cache_dirs};
pub use fetch_task::FetchOptions;
pub use http_fetcher::HttpImageFetcher;
pub use loader::{ImageLoader, ImageLoaderConfig, LoaderSettings};
pub use memory_cache::{CacheStats, MemoryImageCache};
pub use registry::ConsumerRegistry;
