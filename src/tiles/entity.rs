//! The tile entity: per-tile data buffers, their channel states and change
//! notifications.
//!
//! # Channel lifecycle
//!
//! Each of the three channels (raster, height, vector) moves independently:
//!
//! ```text
//! None ──mark_loading──▶ Loading ──set_*_data──▶ Loaded
//!   │                       │                      │
//!   └──────set_*_data───────┴──decode failure──▶ Error
//!                  recycle() forces every channel back to None
//! ```
//!
//! # Notifications
//!
//! Subscribers are invoked once per successful `set_*_data` call and stay
//! subscribed until [`TileEntity::recycle`]. A subscriber added after a channel
//! is already `Loaded` is **not** invoked for that past event. Callers that
//! need "loaded or will load" must check [`TileEntity::state`] first and only
//! subscribe when the data is not there yet.

use nalgebra::Vector3;
use serde::{Deserialize, Serialize};

use crate::constants::HEIGHT_GRID_SIZE;
use crate::core::geo::{tile_bounds, CanonicalTileId, ProjectedRect, TileId};
use crate::core::map::MapOrigin;
use crate::runtime::AsyncHandle;
use crate::tiles::{height, raster::RasterImage};
use crate::Result;

/// One of the independent data channels of a tile
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DataChannel {
    Raster,
    Height,
    Vector,
}

impl DataChannel {
    pub const ALL: [DataChannel; 3] = [DataChannel::Raster, DataChannel::Height, DataChannel::Vector];
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum DataChannelState {
    /// Nothing requested, or cleared by recycle
    #[default]
    None,
    /// Request issued, no data yet
    Loading,
    /// Buffer valid
    Loaded,
    /// Fetch or decode failed; buffer contents undefined
    Error,
}

/// Callback invoked with the entity after a channel commit
pub type TileListener = Box<dyn FnMut(&TileEntity) + Send>;

/// A resource attached to a tile for the duration of one activation, e.g. a
/// mesh or feature object built from its vector data.
pub trait ChildResource: Send {
    /// Release the resource. Called exactly once, on recycle.
    fn destroy(&mut self);
}

#[derive(Default)]
struct Channel {
    state: DataChannelState,
    listeners: Vec<TileListener>,
}

pub struct TileEntity {
    tile_id: TileId,
    canonical_id: CanonicalTileId,
    generation: u64,
    active: bool,

    rect: ProjectedRect,
    world_offset: Vector3<f64>,
    relative_scale: f64,

    raster_data: RasterImage,
    height_data: Vec<f32>,
    vector_data: Vec<u8>,

    raster: Channel,
    height: Channel,
    vector: Channel,

    owned_work: Vec<Box<dyn AsyncHandle>>,
    children: Vec<Box<dyn ChildResource>>,
}

impl TileEntity {
    /// Creates an inactive entity with empty buffers.
    pub fn new() -> Self {
        let origin = TileId::new(0, 0, 0);
        Self {
            tile_id: origin,
            canonical_id: origin.canonical(),
            generation: 0,
            active: false,
            rect: tile_bounds(origin),
            world_offset: Vector3::zeros(),
            relative_scale: 1.0,
            raster_data: RasterImage::default(),
            height_data: Vec::new(),
            vector_data: Vec::new(),
            raster: Channel::default(),
            height: Channel::default(),
            vector: Channel::default(),
            owned_work: Vec::new(),
            children: Vec::new(),
        }
    }

    /// Binds this entity to `tile_id` for activation `generation`.
    ///
    /// Geometry is computed relative to `origin`; all channels start at `None`.
    pub fn activate(&mut self, tile_id: TileId, generation: u64, origin: &MapOrigin) {
        if self.active {
            self.recycle();
        }

        self.tile_id = tile_id;
        self.canonical_id = tile_id.canonical();
        self.generation = generation;
        self.rect = tile_bounds(tile_id);
        self.relative_scale = origin.relative_scale();

        let offset = self.rect.center.subtract(&origin.center_mercator);
        self.world_offset = Vector3::new(offset.x, 0.0, offset.y);

        self.raster.state = DataChannelState::None;
        self.height.state = DataChannelState::None;
        self.vector.state = DataChannelState::None;
        self.active = true;

        log::debug!("activated tile {} (generation {})", self.canonical_id, generation);
    }

    pub fn tile_id(&self) -> TileId {
        self.tile_id
    }

    pub fn canonical_id(&self) -> CanonicalTileId {
        self.canonical_id
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    pub fn rect(&self) -> ProjectedRect {
        self.rect
    }

    /// Offset of the tile center from the map center, in mercator meters.
    /// `y` is the vertical axis and always zero; `z` points north.
    pub fn world_offset(&self) -> Vector3<f64> {
        self.world_offset
    }

    /// `1 / cos(latitude)` of the map origin this tile was activated for
    pub fn relative_scale(&self) -> f64 {
        self.relative_scale
    }

    pub fn state(&self, channel: DataChannel) -> DataChannelState {
        self.channel(channel).state
    }

    pub fn raster_state(&self) -> DataChannelState {
        self.raster.state
    }

    pub fn height_state(&self) -> DataChannelState {
        self.height.state
    }

    pub fn vector_state(&self) -> DataChannelState {
        self.vector.state
    }

    fn channel(&self, channel: DataChannel) -> &Channel {
        match channel {
            DataChannel::Raster => &self.raster,
            DataChannel::Height => &self.height,
            DataChannel::Vector => &self.vector,
        }
    }

    fn channel_mut(&mut self, channel: DataChannel) -> &mut Channel {
        match channel {
            DataChannel::Raster => &mut self.raster,
            DataChannel::Height => &mut self.height,
            DataChannel::Vector => &mut self.vector,
        }
    }

    /// Records that a request for `channel` is in flight. Loaded data stays
    /// readable until the new payload is committed.
    pub fn mark_loading(&mut self, channel: DataChannel) {
        let state = &mut self.channel_mut(channel).state;
        if *state != DataChannelState::Loaded {
            *state = DataChannelState::Loading;
        }
    }

    /// Records a failed fetch or decode for `channel`.
    pub fn mark_error(&mut self, channel: DataChannel) {
        self.channel_mut(channel).state = DataChannelState::Error;
    }

    /// Decodes an image payload into the raster buffer and notifies raster subscribers.
    pub fn set_raster_data(&mut self, bytes: &[u8], use_mipmap: bool, use_compression: bool) -> Result<()> {
        if let Err(e) = self.raster_data.decode_from(bytes, use_mipmap, use_compression) {
            log::warn!("raster decode failed for tile {}: {}", self.canonical_id, e);
            self.raster.state = DataChannelState::Error;
            return Err(e);
        }

        self.raster.state = DataChannelState::Loaded;
        self.notify(DataChannel::Raster);
        Ok(())
    }

    /// Decodes a terrain-RGB payload into the height grid and notifies height
    /// subscribers. Samples are multiplied by the relative scale when
    /// `use_relative_scale` is set, then by `height_multiplier`.
    pub fn set_height_data(
        &mut self,
        bytes: &[u8],
        height_multiplier: f32,
        use_relative_scale: bool,
    ) -> Result<()> {
        let relative = if use_relative_scale { self.relative_scale } else { 1.0 };
        let scale = relative * height_multiplier as f64;

        if let Err(e) = height::decode_into(&mut self.height_data, bytes, scale) {
            log::warn!("height decode failed for tile {}: {}", self.canonical_id, e);
            self.height.state = DataChannelState::Error;
            return Err(e);
        }

        self.height.state = DataChannelState::Loaded;
        self.notify(DataChannel::Height);
        Ok(())
    }

    /// Stores an opaque vector payload and notifies vector subscribers.
    pub fn set_vector_data(&mut self, payload: &[u8]) {
        self.vector_data.clear();
        self.vector_data.extend_from_slice(payload);
        self.vector.state = DataChannelState::Loaded;
        self.notify(DataChannel::Vector);
    }

    pub fn raster_data(&self) -> Option<&RasterImage> {
        (self.raster.state == DataChannelState::Loaded).then_some(&self.raster_data)
    }

    pub fn height_data(&self) -> Option<&[f32]> {
        (self.height.state == DataChannelState::Loaded).then_some(self.height_data.as_slice())
    }

    pub fn vector_data(&self) -> Option<&[u8]> {
        (self.vector.state == DataChannelState::Loaded).then_some(self.vector_data.as_slice())
    }

    /// Nearest height sample at normalized `(u, v)`, 0 when no height is loaded.
    ///
    /// `u` runs west to east and `v` runs north to south, so `v = 0` is the
    /// tile edge on the `+z` side of [`world_offset`](Self::world_offset).
    pub fn query_height(&self, u: f32, v: f32) -> f32 {
        if self.height.state != DataChannelState::Loaded {
            return 0.0;
        }
        debug_assert_eq!(self.height_data.len(), HEIGHT_GRID_SIZE * HEIGHT_GRID_SIZE);
        self.height_data
            .get(height::sample_index(u, v))
            .copied()
            .unwrap_or(0.0)
    }

    /// Adds a listener for future commits on `channel`.
    pub fn subscribe(&mut self, channel: DataChannel, listener: TileListener) {
        self.channel_mut(channel).listeners.push(listener);
    }

    pub fn subscriber_count(&self, channel: DataChannel) -> usize {
        self.channel(channel).listeners.len()
    }

    fn notify(&mut self, channel: DataChannel) {
        // Listeners only see `&TileEntity`, so none can be added mid-dispatch
        let mut listeners = std::mem::take(&mut self.channel_mut(channel).listeners);
        for listener in listeners.iter_mut() {
            listener(&*self);
        }
        self.channel_mut(channel).listeners = listeners;
    }

    /// Tracks async work (e.g. downloads) that must be cancelled on recycle.
    pub fn add_owned_work(&mut self, handle: Box<dyn AsyncHandle>) {
        self.owned_work.retain(|work| !work.is_finished());
        self.owned_work.push(handle);
    }

    pub fn owned_work_count(&self) -> usize {
        self.owned_work.len()
    }

    pub fn cancel_all_owned_work(&mut self) {
        for work in self.owned_work.drain(..) {
            work.cancel();
        }
    }

    pub fn attach_child(&mut self, child: Box<dyn ChildResource>) {
        self.children.push(child);
    }

    pub fn child_count(&self) -> usize {
        self.children.len()
    }

    /// Returns the entity to the pool-ready state. Safe to call repeatedly.
    pub fn recycle(&mut self) {
        self.cancel_all_owned_work();

        for channel in DataChannel::ALL {
            let channel = self.channel_mut(channel);
            channel.state = DataChannelState::None;
            channel.listeners.clear();
        }

        // Buffers keep their allocations for the next activation
        self.raster_data.clear();
        self.vector_data.clear();

        for mut child in self.children.drain(..) {
            child.destroy();
        }

        if self.active {
            log::debug!("recycled tile {} (generation {})", self.canonical_id, self.generation);
        }
        self.active = false;
    }
}

impl Default for TileEntity {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for TileEntity {
    fn drop(&mut self) {
        self.recycle();
    }
}

impl std::fmt::Debug for TileEntity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TileEntity")
            .field("tile_id", &self.tile_id)
            .field("generation", &self.generation)
            .field("active", &self.active)
            .field("raster", &self.raster.state)
            .field("height", &self.height.state)
            .field("vector", &self.vector.state)
            .field("owned_work", &self.owned_work.len())
            .field("children", &self.children.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::geo::LatLng;
    use crate::runtime::spawners::CancelFlagHandle;
    use crate::tiles::height::encode_elevation_tile;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn origin() -> MapOrigin {
        MapOrigin::resolve(LatLng::new(40.7128, -74.0060), 15, 100.0).unwrap()
    }

    fn active_entity() -> TileEntity {
        let origin = origin();
        let mut entity = TileEntity::new();
        entity.activate(origin.center_tile, 1, &origin);
        entity
    }

    fn counter(entity: &mut TileEntity, channel: DataChannel) -> Arc<AtomicUsize> {
        let count = Arc::new(AtomicUsize::new(0));
        let count_clone = count.clone();
        entity.subscribe(
            channel,
            Box::new(move |_| {
                count_clone.fetch_add(1, Ordering::SeqCst);
            }),
        );
        count
    }

    struct CountingChild(Arc<AtomicUsize>);

    impl ChildResource for CountingChild {
        fn destroy(&mut self) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_activation_geometry() {
        let origin = origin();
        let mut entity = TileEntity::new();
        entity.activate(origin.center_tile.neighbor(1, 0), 7, &origin);

        assert!(entity.is_active());
        assert_eq!(entity.generation(), 7);
        assert_eq!(entity.canonical_id(), origin.center_tile.neighbor(1, 0).canonical());
        assert!((entity.world_offset().x - entity.rect().size.x).abs() < 1e-6);
        assert_eq!(entity.world_offset().y, 0.0);
        assert!(entity.world_offset().z.abs() < 1e-6);
        assert!((entity.relative_scale() - 1.0 / 40.7128_f64.to_radians().cos()).abs() < 1e-9);
        for channel in DataChannel::ALL {
            assert_eq!(entity.state(channel), DataChannelState::None);
        }
    }

    #[test]
    fn test_height_data_fires_and_overwrites() {
        let mut entity = active_entity();
        let fired = counter(&mut entity, DataChannel::Height);

        entity
            .set_height_data(&encode_elevation_tile(256, |_, _| 10.0).unwrap(), 1.0, false)
            .unwrap();
        let first_ptr = entity.height_data().unwrap().as_ptr();
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert!((entity.query_height(0.5, 0.5) - 10.0).abs() < 1e-3);

        entity
            .set_height_data(&encode_elevation_tile(256, |_, _| 20.0).unwrap(), 1.0, false)
            .unwrap();
        assert_eq!(fired.load(Ordering::SeqCst), 2);
        assert_eq!(entity.height_data().unwrap().as_ptr(), first_ptr);
        assert!(entity.height_data().unwrap().iter().all(|h| (h - 20.0).abs() < 1e-3));
    }

    #[test]
    fn test_relative_scale_and_multiplier() {
        let mut entity = active_entity();
        let bytes = encode_elevation_tile(256, |_, _| 100.0).unwrap();

        entity.set_height_data(&bytes, 2.0, true).unwrap();
        let expected = 100.0 * 2.0 * entity.relative_scale() as f32;
        assert!((entity.query_height(0.25, 0.75) - expected).abs() < 1e-2);
    }

    #[test]
    fn test_query_height_is_north_up() {
        let mut entity = active_entity();
        // Height grows by one meter per image row, top row first
        let bytes = encode_elevation_tile(256, |row, _| row as f64).unwrap();
        entity.set_height_data(&bytes, 1.0, false).unwrap();

        let north = entity.query_height(0.5, 0.0);
        let south = entity.query_height(0.5, 0.999);
        assert!(north.abs() < 0.06);
        assert!((south - 255.0).abs() < 0.06);

        // The northern neighbor sits further along +z
        let origin = origin();
        let mut northern = TileEntity::new();
        northern.activate(origin.center_tile.neighbor(0, -1), 2, &origin);
        assert!(northern.world_offset().z > entity.world_offset().z);
    }

    #[test]
    fn test_late_subscriber_not_invoked() {
        let mut entity = active_entity();
        entity
            .set_height_data(&encode_elevation_tile(256, |_, _| 5.0).unwrap(), 1.0, false)
            .unwrap();

        let late = counter(&mut entity, DataChannel::Height);
        assert_eq!(late.load(Ordering::SeqCst), 0);
        assert_eq!(entity.height_state(), DataChannelState::Loaded);
    }

    #[test]
    fn test_channels_are_independent() {
        let mut entity = active_entity();
        let raster = counter(&mut entity, DataChannel::Raster);
        let vector = counter(&mut entity, DataChannel::Vector);

        entity.set_vector_data(b"{\"type\":\"FeatureCollection\"}");
        assert_eq!(vector.load(Ordering::SeqCst), 1);
        assert_eq!(raster.load(Ordering::SeqCst), 0);
        assert_eq!(entity.vector_state(), DataChannelState::Loaded);
        assert_eq!(entity.raster_state(), DataChannelState::None);
        assert_eq!(entity.vector_data(), Some(&b"{\"type\":\"FeatureCollection\"}"[..]));
    }

    #[test]
    fn test_decode_error_sets_error_state() {
        let mut entity = active_entity();
        let fired = counter(&mut entity, DataChannel::Height);
        entity.set_vector_data(b"payload");

        let undersized = encode_elevation_tile(64, |_, _| 1.0).unwrap();
        assert!(entity.set_height_data(&undersized, 1.0, false).is_err());
        assert!(entity.set_raster_data(b"nope", false, false).is_err());

        assert_eq!(entity.height_state(), DataChannelState::Error);
        assert_eq!(entity.raster_state(), DataChannelState::Error);
        assert_eq!(entity.vector_state(), DataChannelState::Loaded);
        assert_eq!(fired.load(Ordering::SeqCst), 0);
        assert_eq!(entity.query_height(0.5, 0.5), 0.0);
        assert!(entity.height_data().is_none());
    }

    #[test]
    fn test_mark_loading_keeps_loaded_data() {
        let mut entity = active_entity();
        entity.mark_loading(DataChannel::Vector);
        assert_eq!(entity.vector_state(), DataChannelState::Loading);

        entity.set_vector_data(b"v1");
        entity.mark_loading(DataChannel::Vector);
        assert_eq!(entity.vector_state(), DataChannelState::Loaded);
    }

    #[test]
    fn test_recycle_resets_everything() {
        let mut entity = active_entity();
        let fired = counter(&mut entity, DataChannel::Height);
        let destroyed = Arc::new(AtomicUsize::new(0));
        entity.attach_child(Box::new(CountingChild(destroyed.clone())));
        entity.attach_child(Box::new(CountingChild(destroyed.clone())));
        let work = CancelFlagHandle::default();
        entity.add_owned_work(Box::new(work.clone()));

        entity
            .set_height_data(&encode_elevation_tile(256, |_, _| 42.0).unwrap(), 1.0, false)
            .unwrap();
        entity.set_vector_data(b"features");
        assert_eq!(fired.load(Ordering::SeqCst), 1);

        entity.recycle();

        assert!(!entity.is_active());
        for channel in DataChannel::ALL {
            assert_eq!(entity.state(channel), DataChannelState::None);
            assert_eq!(entity.subscriber_count(channel), 0);
        }
        assert_eq!(entity.query_height(0.5, 0.5), 0.0);
        assert!(work.is_cancelled());
        assert_eq!(entity.owned_work_count(), 0);
        assert_eq!(destroyed.load(Ordering::SeqCst), 2);
        assert_eq!(entity.child_count(), 0);

        // Idempotent
        entity.recycle();
        assert_eq!(destroyed.load(Ordering::SeqCst), 2);
        assert_eq!(entity.query_height(0.5, 0.5), 0.0);
    }

    #[test]
    fn test_reactivation_reuses_height_buffer() {
        let origin = origin();
        let mut entity = active_entity();
        entity
            .set_height_data(&encode_elevation_tile(256, |_, _| 1.0).unwrap(), 1.0, false)
            .unwrap();
        let ptr = entity.height_data().unwrap().as_ptr();

        entity.recycle();
        entity.activate(origin.center_tile.neighbor(0, 1), 2, &origin);
        assert!(entity.height_data().is_none());

        entity
            .set_height_data(&encode_elevation_tile(256, |_, _| 2.0).unwrap(), 1.0, false)
            .unwrap();
        assert_eq!(entity.height_data().unwrap().as_ptr(), ptr);
    }

    #[test]
    fn test_finished_work_pruned() {
        let mut entity = active_entity();
        let done = CancelFlagHandle::default();
        done.mark_finished();
        entity.add_owned_work(Box::new(done));
        entity.add_owned_work(Box::new(CancelFlagHandle::default()));
        assert_eq!(entity.owned_work_count(), 1);
    }
}
