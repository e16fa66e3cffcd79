//! Presentation layer: consumers that display loaded images.

/// Headless tile grid.
pub mod tile_grid;

pub use tile_grid::{Tile, TileGrid, TileSummary};
