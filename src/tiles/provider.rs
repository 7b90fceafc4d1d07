//! Tile providers decide which tiles are visible and announce changes to the
//! map controller as [`TileProviderEvent`]s.

use crossbeam_channel::{unbounded, Receiver, Sender};
use fxhash::FxHashSet;

use crate::core::geo::{geo_to_tile_id, LatLng, TileId};
use crate::core::map::MapOrigin;
use crate::{MapError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TileProviderEvent {
    Added(TileId),
    Removed(TileId),
}

/// Source of tile visibility changes.
pub trait TileProvider: Send {
    /// Starts publishing for `origin` and returns the event stream.
    fn initialize(&mut self, origin: &MapOrigin) -> Result<Receiver<TileProviderEvent>>;

    /// Moves the visible area so it is centered on `center`.
    fn recenter(&mut self, center: LatLng) -> Result<()>;
}

/// Publishes a fixed rectangle of tiles around a center tile.
///
/// The ranges are tile counts in each direction; `(0, 0, 0, 0)` publishes the
/// center tile only. The center tile is always announced first.
#[derive(Debug)]
pub struct RangeTileProvider {
    west: i32,
    north: i32,
    east: i32,
    south: i32,
    zoom: u8,
    visible: FxHashSet<TileId>,
    sender: Option<Sender<TileProviderEvent>>,
}

impl RangeTileProvider {
    pub fn new(west: u32, north: u32, east: u32, south: u32) -> Self {
        Self {
            west: west as i32,
            north: north as i32,
            east: east as i32,
            south: south as i32,
            zoom: 0,
            visible: FxHashSet::default(),
            sender: None,
        }
    }

    /// Same range on every side
    pub fn square(radius: u32) -> Self {
        Self::new(radius, radius, radius, radius)
    }

    pub fn visible_tiles(&self) -> impl Iterator<Item = &TileId> {
        self.visible.iter()
    }

    /// Tiles in range of `center`, center first
    fn tiles_around(&self, center: TileId) -> Vec<TileId> {
        let mut tiles = vec![center];
        for dy in -self.north..=self.south {
            for dx in -self.west..=self.east {
                if dx != 0 || dy != 0 {
                    tiles.push(center.neighbor(dx, dy));
                }
            }
        }
        tiles
    }

    fn publish(&mut self, center: TileId) -> Result<()> {
        let sender = self
            .sender
            .as_ref()
            .ok_or_else(|| MapError::InvalidState("tile provider is not initialized".to_string()))?;

        let wanted = self.tiles_around(center);
        let wanted_set: FxHashSet<TileId> = wanted.iter().copied().collect();

        let mut removed: Vec<TileId> = self.visible.difference(&wanted_set).copied().collect();
        removed.sort_by_key(|id| (id.y, id.x));
        for id in removed {
            let _ = sender.send(TileProviderEvent::Removed(id));
            self.visible.remove(&id);
        }

        for id in wanted {
            if self.visible.insert(id) {
                let _ = sender.send(TileProviderEvent::Added(id));
            }
        }

        log::debug!("range provider centered on {} ({} tiles)", center, self.visible.len());
        Ok(())
    }
}

impl TileProvider for RangeTileProvider {
    fn initialize(&mut self, origin: &MapOrigin) -> Result<Receiver<TileProviderEvent>> {
        let (tx, rx) = unbounded();
        self.sender = Some(tx);
        self.visible.clear();
        self.zoom = origin.zoom;
        self.publish(origin.center_tile)?;
        Ok(rx)
    }

    fn recenter(&mut self, center: LatLng) -> Result<()> {
        let tile = geo_to_tile_id(center, self.zoom as i32)?;
        self.publish(tile)
    }
}
