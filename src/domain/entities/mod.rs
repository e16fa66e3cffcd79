//! Domain entity definitions.

mod image;

pub use image::{ImageId, ImageSource, ImageStatus, LoadedImage, SlotId};
