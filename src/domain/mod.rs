//! Domain layer with core entities, errors, and port definitions.

/// Entity definitions.
pub mod entities;
/// Error types.
pub mod errors;
/// Port definitions.
pub mod ports;

pub use entities::{ImageId, ImageSource, ImageStatus, LoadedImage, SlotId};
pub use errors::{LoadError, LoadResult};
pub use ports::{ImageCachePort, ImageConsumer, ImageFetchPort, ImageLoaderPort, LoadState};
