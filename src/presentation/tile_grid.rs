//! Headless grid of image tiles fed by the loader.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::Serialize;
use tracing::trace;

use crate::domain::entities::{ImageId, ImageSource, ImageStatus, LoadedImage, SlotId};
use crate::domain::errors::LoadError;
use crate::domain::ports::{ImageConsumer, LoadState};

/// One visual placeholder and whatever it currently shows.
pub struct Tile {
    /// Position of the tile in the grid.
    pub slot: SlotId,
    /// URL currently assigned.
    pub url: Option<String>,
    /// Cache key of `url`.
    pub id: Option<ImageId>,
    /// Image shown, once delivered.
    pub image: Option<Arc<image::DynamicImage>>,
    /// Tier the shown image came from.
    pub source: Option<ImageSource>,
    /// Load progress for the current assignment.
    pub status: ImageStatus,
}

impl Tile {
    /// Creates an empty tile.
    #[must_use]
    pub const fn new(slot: SlotId) -> Self {
        Self {
            slot,
            url: None,
            id: None,
            image: None,
            source: None,
            status: ImageStatus::NotStarted,
        }
    }

    /// Points the tile at a new URL, dropping what it showed before.
    pub fn assign(&mut self, url: &str) {
        self.url = Some(url.to_string());
        self.id = Some(ImageId::from_url(url));
        self.image = None;
        self.source = None;
        self.status = ImageStatus::NotStarted;
    }

    /// Shows a delivered image.
    pub fn set_loaded(&mut self, loaded: LoadedImage) {
        self.image = Some(loaded.image);
        self.source = Some(loaded.source);
        self.status = ImageStatus::Ready;
    }

    /// Marks the current assignment as waiting on the loader.
    pub fn set_downloading(&mut self) {
        self.status = ImageStatus::Downloading;
    }

    /// Records why the current assignment could not be shown.
    pub fn set_failed(&mut self, error: String) {
        self.status = ImageStatus::Failed(error);
    }

    /// Returns true if an image is shown.
    #[must_use]
    pub const fn is_ready(&self) -> bool {
        self.image.is_some() && self.status.is_ready()
    }

    /// Width and height of the shown image.
    #[must_use]
    pub fn dimensions(&self) -> Option<(u32, u32)> {
        self.image.as_ref().map(|image| (image.width(), image.height()))
    }

    /// Serializable snapshot of the tile.
    #[must_use]
    pub fn summary(&self) -> TileSummary {
        let (status, error) = match &self.status {
            ImageStatus::NotStarted => ("idle", None),
            ImageStatus::Downloading => ("loading", None),
            ImageStatus::Ready => ("ready", None),
            ImageStatus::Failed(e) => ("failed", Some(e.clone())),
        };
        TileSummary {
            slot: self.slot.get(),
            url: self.url.clone(),
            status: status.to_string(),
            width: self.dimensions().map(|(w, _)| w),
            height: self.dimensions().map(|(_, h)| h),
            source: self.source.map(|s| s.to_string()),
            error,
        }
    }
}

impl std::fmt::Debug for Tile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Tile")
            .field("slot", &self.slot)
            .field("url", &self.url)
            .field("has_image", &self.image.is_some())
            .field("source", &self.source)
            .field("status", &self.status)
            .finish_non_exhaustive()
    }
}

/// Serializable view of a tile.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TileSummary {
    /// Slot number.
    pub slot: u64,
    /// Assigned URL.
    pub url: Option<String>,
    /// One of `idle`, `loading`, `ready` or `failed`.
    pub status: String,
    /// Width of the shown image.
    pub width: Option<u32>,
    /// Height of the shown image.
    pub height: Option<u32>,
    /// Tier the image came from.
    pub source: Option<String>,
    /// Failure message, if the load failed.
    pub error: Option<String>,
}

/// Fixed set of tiles keyed by slot.
#[derive(Debug, Default)]
pub struct TileGrid {
    tiles: BTreeMap<SlotId, Tile>,
}

impl TileGrid {
    /// Creates a grid with slots `0..count`.
    #[must_use]
    pub fn new(count: u64) -> Self {
        let tiles = (0..count)
            .map(|n| (SlotId::new(n), Tile::new(SlotId::new(n))))
            .collect();
        Self { tiles }
    }

    /// Number of tiles.
    #[must_use]
    pub fn len(&self) -> usize {
        self.tiles.len()
    }

    /// Returns true if the grid has no tiles.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tiles.is_empty()
    }

    /// Tile at `slot`.
    #[must_use]
    pub fn tile(&self, slot: SlotId) -> Option<&Tile> {
        self.tiles.get(&slot)
    }

    /// Slot that the `index`-th URL lands on when URLs are dealt round-robin.
    #[must_use]
    pub fn slot_for(&self, index: usize) -> Option<SlotId> {
        if self.tiles.is_empty() {
            return None;
        }
        self.tiles.keys().nth(index % self.tiles.len()).copied()
    }

    /// Records a new assignment before the loader is asked for it.
    pub fn assign(&mut self, slot: SlotId, url: &str) {
        self.tiles
            .entry(slot)
            .or_insert_with(|| Tile::new(slot))
            .assign(url);
    }

    /// Applies the synchronous part of a load request.
    pub fn note_load_state(&mut self, slot: SlotId, state: LoadState) {
        if let Some(tile) = self.tiles.get_mut(&slot)
            && state != LoadState::Delivered
        {
            tile.set_downloading();
        }
    }

    /// Snapshot of every tile in slot order.
    #[must_use]
    pub fn summary(&self) -> Vec<TileSummary> {
        self.tiles.values().map(Tile::summary).collect()
    }

    /// Number of tiles showing an image.
    #[must_use]
    pub fn ready_count(&self) -> usize {
        self.tiles.values().filter(|t| t.is_ready()).count()
    }
}

impl ImageConsumer for TileGrid {
    fn on_delivered(&mut self, slot: SlotId, image: LoadedImage) {
        let Some(tile) = self.tiles.get_mut(&slot) else {
            return;
        };
        if tile.id.as_ref() != Some(&image.id) {
            trace!(%slot, "Ignoring image for previous assignment");
            return;
        }
        tile.set_loaded(image);
    }

    fn on_failed(&mut self, slot: SlotId, error: &LoadError) {
        if let Some(tile) = self.tiles.get_mut(&slot) {
            tile.set_failed(error.to_string());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn loaded(url: &str, w: u32, h: u32) -> LoadedImage {
        LoadedImage {
            id: ImageId::from_url(url),
            image: Arc::new(image::DynamicImage::new_rgb8(w, h)),
            source: ImageSource::Network,
        }
    }

    #[test]
    fn test_round_robin_slots() {
        let grid = TileGrid::new(3);

        assert_eq!(grid.slot_for(0), Some(SlotId::new(0)));
        assert_eq!(grid.slot_for(2), Some(SlotId::new(2)));
        assert_eq!(grid.slot_for(4), Some(SlotId::new(1)));
        assert_eq!(TileGrid::new(0).slot_for(0), None);
    }

    #[test]
    fn test_delivery_updates_tile() {
        let mut grid = TileGrid::new(1);
        let slot = SlotId::new(0);
        grid.assign(slot, "http://a/1.png");
        grid.note_load_state(slot, LoadState::Enqueued);
        assert!(grid.tile(slot).unwrap().status.is_loading());

        grid.on_delivered(slot, loaded("http://a/1.png", 120, 90));

        let summary = grid.summary();
        assert_eq!(summary[0].status, "ready");
        assert_eq!(summary[0].width, Some(120));
        assert_eq!(summary[0].source.as_deref(), Some("network"));
        assert_eq!(grid.ready_count(), 1);
    }

    #[test]
    fn test_ignores_image_for_old_assignment() {
        let mut grid = TileGrid::new(1);
        let slot = SlotId::new(0);
        grid.assign(slot, "http://a/1.png");
        grid.assign(slot, "http://a/2.png");

        grid.on_delivered(slot, loaded("http://a/1.png", 10, 10));

        assert!(!grid.tile(slot).unwrap().is_ready());
    }

    #[test]
    fn test_failure_recorded() {
        let mut grid = TileGrid::new(2);
        let slot = SlotId::new(1);
        grid.assign(slot, "http://a/missing.png");

        grid.on_failed(slot, &LoadError::NetworkTimeout);

        let summary = grid.tile(slot).unwrap().summary();
        assert_eq!(summary.status, "failed");
        assert_eq!(summary.error.as_deref(), Some("network timeout"));
    }

    #[test]
    fn test_summary_serializes() {
        let grid = TileGrid::new(1);
        let json = serde_json::to_value(grid.summary()).unwrap();
        assert_eq!(json[0]["slot"], 0);
        assert_eq!(json[0]["status"], "idle");
    }
}
