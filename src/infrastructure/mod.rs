//! Infrastructure layer with external service adapters.

/// Application configuration.
pub mod config;
/// Image handling (caching, fetching, decoding, loading).
pub mod image;

pub use config::{AppConfig, CliArgs, ConfigStore, LogLevel};
pub use image::{
    CacheStats, DeliveryQueue, DiskImageCache, HttpImageFetcher, ImageLoader, ImageLoaderConfig,
    MemoryImageCache,
};
