mod image_cache_port;
mod image_fetch_port;

pub use image_cache_port::{ImageCachePort, ImageConsumer, ImageLoaderPort, LoadState};
pub use image_fetch_port::{ImageBody, ImageFetchPort, read_to_end};
