//! The map controller.
//!
//! [`MapController`] owns the map origin, turns provider events into entity
//! activations, routes loaded payloads into entities, and performs the
//! one-shot height snap: once elevation under the map center is known, the
//! map root is lowered so that terrain sits at height zero.

use crossbeam_channel::Receiver;
use nalgebra::Vector3;
use std::sync::{Arc, Mutex};

use crate::core::config::MapConfig;
use crate::core::geo::{geo_to_tile_id, tile_bounds, LatLng, Point, TileId};
use crate::tiles::entity::{DataChannel, DataChannelState, TileEntity};
use crate::tiles::loader::{FetchResult, TileDataLoader, TileRequest};
use crate::tiles::pool::{TileHandle, TileVisualizer};
use crate::tiles::provider::{TileProvider, TileProviderEvent};
use crate::{MapError, Result};

/// Controller lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControllerState {
    Uninitialized,
    Initializing,
    Ready,
    TornDown,
}

/// Geographic anchor of the world coordinate system
#[derive(Debug, Clone, PartialEq)]
pub struct MapOrigin {
    pub lat_lng: LatLng,
    pub zoom: u8,
    /// Tile containing `lat_lng` at `zoom`
    pub center_tile: TileId,
    /// Mercator center of `center_tile`; world offsets are relative to it
    pub center_mercator: Point,
    /// World units per mercator meter
    pub world_relative_scale: f64,
}

impl MapOrigin {
    pub fn resolve(lat_lng: LatLng, zoom: u8, world_tile_size: f64) -> Result<Self> {
        let center_tile = geo_to_tile_id(lat_lng, zoom as i32)?;
        let rect = tile_bounds(center_tile);
        Ok(Self {
            lat_lng,
            zoom,
            center_tile,
            center_mercator: rect.center,
            world_relative_scale: world_tile_size / rect.size.x,
        })
    }

    /// Mercator stretch at the origin latitude, `1 / cos(lat)`
    pub fn relative_scale(&self) -> f64 {
        1.0 / self.lat_lng.lat.to_radians().cos()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SnapPhase {
    Disabled,
    /// No tile has been claimed for snapping yet
    Waiting,
    /// Subscribed to this tile's height channel
    Armed(TileId),
    Snapped,
}

#[derive(Debug)]
struct SnapShared {
    phase: SnapPhase,
    root_position: Vector3<f64>,
}

impl SnapShared {
    fn snap(&mut self, entity: &TileEntity, world_scale: f64) {
        let height = entity.query_height(0.5, 0.5) as f64;
        self.root_position.y = -height * world_scale;
        self.phase = SnapPhase::Snapped;
        log::info!(
            "snapped map root to {:.2} m under tile {} (offset {:.4})",
            height,
            entity.canonical_id(),
            self.root_position.y
        );
    }
}

type InitializedCallback = Box<dyn FnOnce(&MapOrigin) + Send>;

pub struct MapController {
    config: MapConfig,
    state: ControllerState,
    origin: Option<MapOrigin>,
    visualizer: Box<dyn TileVisualizer>,
    provider: Box<dyn TileProvider>,
    provider_events: Option<Receiver<TileProviderEvent>>,
    loader: Option<TileDataLoader>,
    snap: Arc<Mutex<SnapShared>>,
    on_initialized: Option<InitializedCallback>,
}

impl MapController {
    pub fn new(
        config: MapConfig,
        visualizer: Box<dyn TileVisualizer>,
        provider: Box<dyn TileProvider>,
    ) -> Self {
        Self {
            config,
            state: ControllerState::Uninitialized,
            origin: None,
            visualizer,
            provider,
            provider_events: None,
            loader: None,
            snap: Arc::new(Mutex::new(SnapShared {
                phase: SnapPhase::Disabled,
                root_position: Vector3::zeros(),
            })),
            on_initialized: None,
        }
    }

    /// Requests data for every activated tile through `loader`.
    pub fn with_loader(mut self, loader: TileDataLoader) -> Self {
        self.loader = Some(loader);
        self
    }

    /// Registers the callback fired once when initialization completes.
    pub fn on_initialized(&mut self, callback: impl FnOnce(&MapOrigin) + Send + 'static) {
        self.on_initialized = Some(Box::new(callback));
    }

    pub fn state(&self) -> ControllerState {
        self.state
    }

    pub fn config(&self) -> &MapConfig {
        &self.config
    }

    pub fn origin(&self) -> Option<&MapOrigin> {
        self.origin.as_ref()
    }

    pub fn visualizer(&self) -> &dyn TileVisualizer {
        self.visualizer.as_ref()
    }

    pub fn loader(&self) -> Option<&TileDataLoader> {
        self.loader.as_ref()
    }

    /// Position of the map root in world units; only `y` is ever changed.
    pub fn root_position(&self) -> Vector3<f64> {
        self.snap
            .lock()
            .map(|snap| snap.root_position)
            .unwrap_or_else(|_| Vector3::zeros())
    }

    pub fn height_snapped(&self) -> bool {
        self.snap_phase() == SnapPhase::Snapped
    }

    fn snap_phase(&self) -> SnapPhase {
        self.snap
            .lock()
            .map(|snap| snap.phase)
            .unwrap_or(SnapPhase::Disabled)
    }

    fn ensure_ready(&self) -> Result<&MapOrigin> {
        match (&self.state, &self.origin) {
            (ControllerState::Ready, Some(origin)) => Ok(origin),
            (state, _) => Err(MapError::InvalidState(format!(
                "map controller is {:?}, expected Ready",
                state
            ))),
        }
    }

    /// Resolves the origin, initializes the visualizer and provider, and
    /// fires the initialization callback.
    pub fn initialize(&mut self) -> Result<()> {
        if self.state != ControllerState::Uninitialized {
            return Err(MapError::InvalidState(format!(
                "initialize called while {:?}",
                self.state
            )));
        }
        self.state = ControllerState::Initializing;

        let origin = match self
            .config
            .resolve_origin()
            .and_then(|(lat_lng, zoom)| MapOrigin::resolve(lat_lng, zoom, self.config.world_tile_size))
        {
            Ok(origin) => origin,
            Err(e) => {
                self.state = ControllerState::Uninitialized;
                return Err(e);
            }
        };

        self.visualizer.initialize(&origin);
        let events = match self.provider.initialize(&origin) {
            Ok(events) => events,
            Err(e) => {
                self.state = ControllerState::Uninitialized;
                return Err(e);
            }
        };
        self.provider_events = Some(events);

        if let Ok(mut snap) = self.snap.lock() {
            snap.root_position = Vector3::zeros();
            snap.phase = if self.config.snap_height_to_zero {
                SnapPhase::Waiting
            } else {
                SnapPhase::Disabled
            };
        }

        log::info!(
            "map initialized at {} zoom {} (center tile {}, world scale {:.6})",
            origin.lat_lng,
            origin.zoom,
            origin.center_tile,
            origin.world_relative_scale
        );

        self.state = ControllerState::Ready;
        if let Some(callback) = self.on_initialized.take() {
            callback(&origin);
        }
        self.origin = Some(origin);
        Ok(())
    }

    /// Activates an entity for `tile_id`, issues its data requests, and claims
    /// it for the height snap when none is pending.
    pub fn on_tile_added(&mut self, tile_id: TileId) -> Result<TileHandle> {
        let world_scale = self.ensure_ready()?.world_relative_scale;
        let handle = self.visualizer.activate_tile(tile_id)?;
        let entity = self.visualizer.tile_mut(handle)?;

        if let Some(loader) = &self.loader {
            for &channel in loader.channels() {
                if entity.state(channel) == DataChannelState::None {
                    entity.mark_loading(channel);
                    entity.add_owned_work(loader.request(TileRequest::new(handle, tile_id, channel)));
                }
            }
        }

        let Ok(mut snap) = self.snap.lock() else {
            return Ok(handle);
        };
        if snap.phase != SnapPhase::Waiting {
            return Ok(handle);
        }

        if entity.height_state() == DataChannelState::Loaded {
            snap.snap(entity, world_scale);
        } else {
            snap.phase = SnapPhase::Armed(tile_id);
            let shared = Arc::clone(&self.snap);
            entity.subscribe(
                DataChannel::Height,
                Box::new(move |entity: &TileEntity| {
                    if let Ok(mut snap) = shared.lock() {
                        if snap.phase == SnapPhase::Armed(entity.tile_id()) {
                            snap.snap(entity, world_scale);
                        }
                    }
                }),
            );
            log::debug!("height snap waiting on tile {}", tile_id);
        }

        Ok(handle)
    }

    /// Recycles the entity bound to `tile_id`. Returns `false` if it was not active.
    pub fn on_tile_removed(&mut self, tile_id: TileId) -> bool {
        if let Ok(mut snap) = self.snap.lock() {
            if snap.phase == SnapPhase::Armed(tile_id) {
                log::debug!("height snap tile {} removed before data arrived", tile_id);
                snap.phase = SnapPhase::Waiting;
            }
        }
        self.visualizer.recycle_tile(tile_id)
    }

    /// Moves the provider's visible area; the changes arrive as events.
    pub fn recenter(&mut self, center: LatLng) -> Result<()> {
        self.ensure_ready()?;
        self.provider.recenter(center)
    }

    /// Applies all queued provider events. Returns how many were handled.
    pub fn process_provider_events(&mut self) -> usize {
        if self.state != ControllerState::Ready {
            return 0;
        }
        let events: Vec<TileProviderEvent> = match &self.provider_events {
            Some(rx) => rx.try_iter().collect(),
            None => return 0,
        };

        for event in &events {
            match *event {
                TileProviderEvent::Added(id) => {
                    if let Err(e) = self.on_tile_added(id) {
                        log::warn!("failed to add tile {}: {}", id, e);
                    }
                }
                TileProviderEvent::Removed(id) => {
                    self.on_tile_removed(id);
                }
            }
        }
        events.len()
    }

    /// Writes `bytes` into the `channel` of the activation behind `handle`.
    ///
    /// Writes for a recycled activation fail with `StaleActivationWrite` and
    /// leave the pool untouched.
    pub fn commit(&mut self, handle: TileHandle, channel: DataChannel, bytes: &[u8]) -> Result<()> {
        let raster = self.config.raster;
        let elevation = self.config.elevation;

        let entity = match self.visualizer.tile_mut(handle) {
            Ok(entity) => entity,
            Err(e) => {
                log::debug!("discarding {:?} payload: {}", channel, e);
                return Err(e);
            }
        };

        match channel {
            DataChannel::Raster => {
                entity.set_raster_data(bytes, raster.use_mipmap, raster.use_compression)
            }
            DataChannel::Height => entity.set_height_data(
                bytes,
                elevation.height_multiplier,
                elevation.use_relative_scale,
            ),
            DataChannel::Vector => {
                entity.set_vector_data(bytes);
                Ok(())
            }
        }
    }

    fn apply_fetch_result(&mut self, result: FetchResult) {
        match result.data {
            Ok(bytes) => {
                // Decode failures already flip the channel to Error
                if self.commit(result.handle, result.channel, &bytes).is_ok() {
                    if let Some(loader) = &self.loader {
                        loader
                            .cache()
                            .insert(result.channel, result.tile_id.canonical(), bytes);
                    }
                }
            }
            Err(e) => {
                log::warn!("{:?} fetch for tile {} failed: {}", result.channel, result.tile_id, e);
                if let Ok(entity) = self.visualizer.tile_mut(result.handle) {
                    entity.mark_error(result.channel);
                }
            }
        }
    }

    /// Handles provider events, then commits every completed fetch. Returns
    /// the number of fetch results applied.
    pub fn pump(&mut self) -> usize {
        self.process_provider_events();

        let results = match &self.loader {
            Some(loader) if self.state == ControllerState::Ready => loader.try_recv_results(),
            _ => return 0,
        };

        let count = results.len();
        for result in results {
            self.apply_fetch_result(result);
        }
        count
    }

    /// Stops consuming provider events and recycles every entity.
    pub fn teardown(&mut self) {
        if self.state == ControllerState::TornDown {
            return;
        }
        self.provider_events = None;
        self.visualizer.destroy_all();
        if let Ok(mut snap) = self.snap.lock() {
            if let SnapPhase::Armed(_) = snap.phase {
                snap.phase = SnapPhase::Waiting;
            }
        }
        self.state = ControllerState::TornDown;
        log::debug!("map controller torn down");
    }
}

impl Drop for MapController {
    fn drop(&mut self) {
        self.teardown();
    }
}

impl std::fmt::Debug for MapController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MapController")
            .field("state", &self.state)
            .field("origin", &self.origin)
            .field("active_tiles", &self.visualizer.active_count())
            .field("root_position", &self.root_position())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tiles::height::encode_elevation_tile;
    use crate::tiles::pool::TilePool;
    use crate::tiles::provider::RangeTileProvider;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn controller(config: MapConfig) -> MapController {
        MapController::new(
            config,
            Box::new(TilePool::new()),
            Box::new(RangeTileProvider::square(1)),
        )
    }

    fn flat(height: f64) -> Vec<u8> {
        encode_elevation_tile(256, |_, _| height).unwrap()
    }

    #[test]
    fn test_origin_scale() {
        let origin = MapOrigin::resolve(LatLng::new(40.7128, -74.0060), 15, 100.0).unwrap();
        let rect = tile_bounds(origin.center_tile);
        assert_eq!(origin.center_tile, TileId::new(15, 9647, 12320));
        assert!((origin.world_relative_scale - 100.0 / rect.size.x).abs() < 1e-12);
        assert_eq!(origin.center_mercator, rect.center);
    }

    #[test]
    fn test_initialize_lifecycle() {
        let mut map = controller(MapConfig::new("40.7128, -74.0060", 15));
        let fired = Arc::new(AtomicUsize::new(0));
        let fired_clone = fired.clone();
        map.on_initialized(move |origin| {
            assert_eq!(origin.zoom, 15);
            fired_clone.fetch_add(1, Ordering::SeqCst);
        });

        assert_eq!(map.state(), ControllerState::Uninitialized);
        assert!(map.on_tile_added(TileId::new(15, 0, 0)).is_err());

        map.initialize().unwrap();
        assert_eq!(map.state(), ControllerState::Ready);
        assert!(map.initialize().is_err());
        assert_eq!(fired.load(Ordering::SeqCst), 1);

        assert_eq!(map.process_provider_events(), 9);
        assert_eq!(map.visualizer().active_count(), 9);

        map.teardown();
        assert_eq!(map.state(), ControllerState::TornDown);
        assert_eq!(map.visualizer().active_count(), 0);
        assert_eq!(map.process_provider_events(), 0);
    }

    #[test]
    fn test_bad_origin_leaves_uninitialized() {
        let mut map = controller(MapConfig::new("not a place", 15));
        assert!(matches!(map.initialize(), Err(MapError::ParseError(_))));
        assert_eq!(map.state(), ControllerState::Uninitialized);

        let mut map = controller(MapConfig::new("40.7128, -74.0060", 30));
        assert!(matches!(map.initialize(), Err(MapError::InvalidZoom(30))));
    }

    #[test]
    fn test_snap_on_height_arrival() {
        let mut map = controller(MapConfig::new("40.7128, -74.0060", 15));
        map.initialize().unwrap();
        let origin = map.origin().unwrap().clone();

        let handle = map.on_tile_added(origin.center_tile).unwrap();
        assert!(!map.height_snapped());
        assert_eq!(map.root_position(), Vector3::zeros());

        map.commit(handle, DataChannel::Height, &flat(50.0)).unwrap();
        assert!(map.height_snapped());
        let expected = -50.0 * origin.world_relative_scale;
        assert!((map.root_position().y - expected).abs() < 1e-6);
        assert_eq!(map.root_position().x, 0.0);
        assert_eq!(map.root_position().z, 0.0);

        // Later height data never moves the root again
        map.commit(handle, DataChannel::Height, &flat(900.0)).unwrap();
        assert!((map.root_position().y - expected).abs() < 1e-6);
    }

    #[test]
    fn test_snap_disabled() {
        let mut config = MapConfig::new("40.7128, -74.0060", 15);
        config.snap_height_to_zero = false;
        let mut map = controller(config);
        map.initialize().unwrap();
        let center = map.origin().unwrap().center_tile;

        let handle = map.on_tile_added(center).unwrap();
        map.commit(handle, DataChannel::Height, &flat(50.0)).unwrap();
        assert!(!map.height_snapped());
        assert_eq!(map.root_position(), Vector3::zeros());
    }

    #[test]
    fn test_armed_tile_removed_then_loaded_tile_snaps() {
        let mut map = controller(MapConfig::new("40.7128, -74.0060", 15));
        map.initialize().unwrap();
        let origin = map.origin().unwrap().clone();
        let center = origin.center_tile;
        let east = center.neighbor(1, 0);

        map.on_tile_added(center).unwrap();
        let east_handle = map.on_tile_added(east).unwrap();
        map.commit(east_handle, DataChannel::Height, &flat(30.0)).unwrap();
        assert!(!map.height_snapped());

        assert!(map.on_tile_removed(center));
        // Re-announcing an active tile whose height is already loaded snaps at once
        map.on_tile_added(east).unwrap();
        assert!(map.height_snapped());
        assert!((map.root_position().y + 30.0 * origin.world_relative_scale).abs() < 1e-6);
    }

    #[test]
    fn test_stale_commit_is_discarded() {
        let mut map = controller(MapConfig::new("40.7128, -74.0060", 15));
        map.initialize().unwrap();
        let center = map.origin().unwrap().center_tile;

        let stale = map.on_tile_added(center).unwrap();
        map.on_tile_removed(center);
        let fresh = map.on_tile_added(center).unwrap();
        assert_ne!(stale.generation, fresh.generation);

        let err = map.commit(stale, DataChannel::Vector, b"old").unwrap_err();
        assert!(matches!(err, MapError::StaleActivationWrite { .. }));
        let entity = map.visualizer().tile(fresh).unwrap();
        assert_eq!(entity.vector_state(), DataChannelState::None);
    }
}
