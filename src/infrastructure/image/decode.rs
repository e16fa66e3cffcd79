//! Bounded image decoding.
//!
//! Images are first inspected for their dimensions, then decoded under an
//! allocation limit and reduced by the largest power-of-two factor that keeps
//! both sides at or above a minimum.

use std::io::Cursor;
use std::path::Path;

use image::imageops::FilterType;
use image::{DynamicImage, ImageReader, Limits};
use tracing::trace;

use crate::domain::errors::{LoadError, LoadResult};

/// Smallest side length a downsampled image may have.
pub const MIN_DECODE_DIMENSION: u32 = 85;

/// Default cap on the pixel buffer a single decode may allocate (256 MiB).
pub const DEFAULT_MAX_DECODE_BYTES: u64 = 256 * 1024 * 1024;

/// Limits applied to every decode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DecodeOptions {
    /// Neither downsampled side may drop below this.
    pub min_dimension: u32,
    /// Allocation cap; exceeding it is reported as out of memory.
    pub max_alloc: u64,
}

impl Default for DecodeOptions {
    fn default() -> Self {
        Self {
            min_dimension: MIN_DECODE_DIMENSION,
            max_alloc: DEFAULT_MAX_DECODE_BYTES,
        }
    }
}

/// Target size for a `width` x `height` source.
///
/// Returns `(width / 2^n, height / 2^n, 2^n)` for the largest `n` such that
/// both halved sides stay at or above `min_dimension`.
#[must_use]
pub const fn downsampled_size(width: u32, height: u32, min_dimension: u32) -> (u32, u32, u32) {
    let mut w = width;
    let mut h = height;
    let mut scale = 1;
    while w / 2 >= min_dimension && h / 2 >= min_dimension {
        w /= 2;
        h /= 2;
        scale *= 2;
    }
    (w, h, scale)
}

fn reader(bytes: &[u8]) -> LoadResult<ImageReader<Cursor<&[u8]>>> {
    ImageReader::new(Cursor::new(bytes))
        .with_guessed_format()
        .map_err(|e| LoadError::decode(format!("failed to sniff image format: {e}")))
}

/// Decodes `bytes` and reduces the result to its downsampled size.
///
/// # Errors
/// Returns `Decode` for malformed or unsupported data and `OutOfMemory` when
/// the decoder would exceed `options.max_alloc`.
pub fn decode_downsampled(bytes: &[u8], options: DecodeOptions) -> LoadResult<DynamicImage> {
    let (width, height) = reader(bytes)?.into_dimensions()?;
    let (target_w, target_h, scale) = downsampled_size(width, height, options.min_dimension);

    let mut limits = Limits::default();
    limits.max_alloc = Some(options.max_alloc);
    let mut full = reader(bytes)?;
    full.limits(limits);
    let image = full.decode()?;

    trace!(width, height, scale, "Decoded image");

    if scale == 1 {
        return Ok(image);
    }
    Ok(image.resize_exact(target_w, target_h, FilterType::Triangle))
}

/// Decodes in-memory bytes on the blocking pool.
///
/// # Errors
/// See [`decode_downsampled`].
pub async fn decode_bytes(bytes: Vec<u8>, options: DecodeOptions) -> LoadResult<DynamicImage> {
    tokio::task::spawn_blocking(move || decode_downsampled(&bytes, options))
        .await
        .map_err(|e| LoadError::decode(format!("decode task panicked: {e}")))?
}

/// Reads a cached file and decodes it on the blocking pool.
///
/// # Errors
/// Returns `StorageUnavailable` if the file cannot be read, otherwise see [`decode_downsampled`].
pub async fn decode_file(path: &Path, options: DecodeOptions) -> LoadResult<DynamicImage> {
    let bytes = tokio::fs::read(path)
        .await
        .map_err(|e| LoadError::storage(format!("failed to read {}: {e}", path.display())))?;
    decode_bytes(bytes, options).await
}

#[cfg(test)]
pub(crate) fn encode_png(width: u32, height: u32) -> Vec<u8> {
    let mut buf = Cursor::new(Vec::new());
    DynamicImage::new_rgb8(width, height)
        .write_to(&mut buf, image::ImageFormat::Png)
        .unwrap();
    buf.into_inner()
}
