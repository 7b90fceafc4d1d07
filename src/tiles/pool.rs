//! Slot pool of reusable tile entities.
//!
//! Entities are owned by the pool and addressed through [`TileHandle`]s that
//! carry the activation generation. Once a tile is recycled its slot may be
//! reused for another tile, and writes through an old handle are rejected.

use fxhash::FxHashMap;

use crate::core::geo::TileId;
use crate::core::map::MapOrigin;
use crate::tiles::entity::TileEntity;
use crate::{MapError, Result};

/// Stable reference to one activation of a pooled entity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TileHandle {
    pub slot: usize,
    pub generation: u64,
}

/// Owns the active tile entities for a map.
pub trait TileVisualizer: Send {
    /// Prepares the pool for `origin`. Must be called before activation.
    fn initialize(&mut self, origin: &MapOrigin);

    /// Binds a pooled entity to `tile_id`. Activating an id that is already
    /// active returns its current handle.
    fn activate_tile(&mut self, tile_id: TileId) -> Result<TileHandle>;

    /// Recycles the entity bound to `tile_id`. Returns `false` when the id
    /// is not active.
    fn recycle_tile(&mut self, tile_id: TileId) -> bool;

    /// Recycles every active entity.
    fn destroy_all(&mut self);

    fn handle_for(&self, tile_id: TileId) -> Option<TileHandle>;

    /// The entity behind `handle`, if that activation is still current.
    fn tile(&self, handle: TileHandle) -> Option<&TileEntity>;

    /// Mutable access for committing data; stale handles are an error.
    fn tile_mut(&mut self, handle: TileHandle) -> Result<&mut TileEntity>;

    fn active_count(&self) -> usize;

    /// Runs `f` against the entity behind `handle`.
    fn commit_with(
        &mut self,
        handle: TileHandle,
        f: &mut dyn FnMut(&mut TileEntity) -> Result<()>,
    ) -> Result<()> {
        f(self.tile_mut(handle)?)
    }
}

/// Default [`TileVisualizer`]: a growable vector of entities plus a free list.
pub struct TilePool {
    slots: Vec<TileEntity>,
    free: Vec<usize>,
    active: FxHashMap<TileId, usize>,
    next_generation: u64,
    origin: Option<MapOrigin>,
}

impl TilePool {
    pub fn new() -> Self {
        Self::with_capacity(0)
    }

    /// Pre-allocates `capacity` inactive entities.
    pub fn with_capacity(capacity: usize) -> Self {
        let mut slots = Vec::with_capacity(capacity);
        slots.resize_with(capacity, TileEntity::new);
        Self {
            slots,
            free: (0..capacity).rev().collect(),
            active: FxHashMap::default(),
            next_generation: 1,
            origin: None,
        }
    }

    /// Total number of entities, active or pooled
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub fn active_tiles(&self) -> impl Iterator<Item = (TileId, TileHandle)> + '_ {
        self.active.iter().map(|(id, &slot)| {
            (
                *id,
                TileHandle {
                    slot,
                    generation: self.slots[slot].generation(),
                },
            )
        })
    }

    fn current(&self, handle: TileHandle) -> Option<&TileEntity> {
        self.slots
            .get(handle.slot)
            .filter(|entity| entity.is_active() && entity.generation() == handle.generation)
    }
}

impl Default for TilePool {
    fn default() -> Self {
        Self::new()
    }
}

impl TileVisualizer for TilePool {
    fn initialize(&mut self, origin: &MapOrigin) {
        if self.origin.is_some() {
            self.destroy_all();
        }
        self.origin = Some(origin.clone());
    }

    fn activate_tile(&mut self, tile_id: TileId) -> Result<TileHandle> {
        let origin = self
            .origin
            .as_ref()
            .ok_or_else(|| MapError::InvalidState("tile pool is not initialized".to_string()))?;

        if let Some(&slot) = self.active.get(&tile_id) {
            return Ok(TileHandle {
                slot,
                generation: self.slots[slot].generation(),
            });
        }

        let slot = match self.free.pop() {
            Some(slot) => slot,
            None => {
                self.slots.push(TileEntity::new());
                self.slots.len() - 1
            }
        };

        let generation = self.next_generation;
        self.next_generation += 1;

        self.slots[slot].activate(tile_id, generation, origin);
        self.active.insert(tile_id, slot);

        Ok(TileHandle { slot, generation })
    }

    fn recycle_tile(&mut self, tile_id: TileId) -> bool {
        match self.active.remove(&tile_id) {
            Some(slot) => {
                self.slots[slot].recycle();
                self.free.push(slot);
                true
            }
            None => false,
        }
    }

    fn destroy_all(&mut self) {
        for (_, slot) in self.active.drain() {
            self.slots[slot].recycle();
            self.free.push(slot);
        }
    }

    fn handle_for(&self, tile_id: TileId) -> Option<TileHandle> {
        self.active.get(&tile_id).map(|&slot| TileHandle {
            slot,
            generation: self.slots[slot].generation(),
        })
    }

    fn tile(&self, handle: TileHandle) -> Option<&TileEntity> {
        self.current(handle)
    }

    fn tile_mut(&mut self, handle: TileHandle) -> Result<&mut TileEntity> {
        match self.slots.get_mut(handle.slot) {
            Some(entity) if entity.is_active() && entity.generation() == handle.generation => Ok(entity),
            Some(entity) => Err(MapError::StaleActivationWrite {
                tile: entity.tile_id().to_string(),
                generation: handle.generation,
                current: entity.generation(),
            }),
            None => Err(MapError::InvalidState(format!("no tile slot {}", handle.slot))),
        }
    }

    fn active_count(&self) -> usize {
        self.active.len()
    }
}
