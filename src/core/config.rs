//! Configuration for the map controller and the tile data loader
//!
//! Settings are plain `serde` structs so applications can keep them in JSON
//! next to the rest of their scene description. Loader presets follow the
//! same profiles used elsewhere in the engine.

use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::core::geo::{validate_zoom, LatLng};
use crate::Result;

/// Raster upload flags forwarded to [`TileEntity::set_raster_data`](crate::TileEntity::set_raster_data).
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RasterOptions {
    pub use_mipmap: bool,
    pub use_compression: bool,
}

/// How elevation tiles are scaled when decoded.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ElevationOptions {
    pub height_multiplier: f32,
    pub use_relative_scale: bool,
}

impl Default for ElevationOptions {
    fn default() -> Self {
        Self {
            height_multiplier: 1.0,
            use_relative_scale: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TileLoadingConfig {
    /// Maximum concurrent tile downloads
    pub max_concurrent: usize,
    /// Maximum number of retry attempts per request
    pub max_retries: u32,
    pub retry_delay_ms: u64,
    pub request_timeout_ms: u64,
    /// Fetched payloads kept in memory
    pub cache_size: usize,
}

impl Default for TileLoadingConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 16,
            max_retries: 2,
            retry_delay_ms: 100,
            request_timeout_ms: 10_000,
            cache_size: 512,
        }
    }
}

impl TileLoadingConfig {
    pub fn low_resource() -> Self {
        Self {
            max_concurrent: 4,
            max_retries: 1,
            retry_delay_ms: 250,
            request_timeout_ms: 20_000,
            cache_size: 64,
        }
    }

    pub fn for_testing() -> Self {
        Self {
            max_concurrent: 4,
            max_retries: 0,
            retry_delay_ms: 0,
            request_timeout_ms: 1_000,
            cache_size: 16,
        }
    }
}

/// Top-level map settings consumed by [`MapController`](crate::MapController).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MapConfig {
    /// Origin in `"lat, lon"` form
    pub origin: String,
    pub zoom: i32,
    /// Offset the map root so terrain under the origin sits at height zero
    pub snap_height_to_zero: bool,
    /// World units covered by one tile at `zoom`
    pub world_tile_size: f64,
    pub raster: RasterOptions,
    pub elevation: ElevationOptions,
    pub loading: TileLoadingConfig,
}

impl Default for MapConfig {
    fn default() -> Self {
        Self {
            origin: "37.7749, -122.4194".to_string(),
            zoom: 16,
            snap_height_to_zero: true,
            world_tile_size: 100.0,
            raster: RasterOptions::default(),
            elevation: ElevationOptions::default(),
            loading: TileLoadingConfig::default(),
        }
    }
}

impl MapConfig {
    pub fn new(origin: impl Into<String>, zoom: i32) -> Self {
        Self {
            origin: origin.into(),
            zoom,
            ..Self::default()
        }
    }

    pub fn from_json_str(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let json = std::fs::read_to_string(path)?;
        Self::from_json_str(&json)
    }

    pub fn to_json_string(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Parses the origin string and validates the zoom level.
    pub fn resolve_origin(&self) -> Result<(LatLng, u8)> {
        let origin = self.origin.parse::<LatLng>()?;
        let zoom = validate_zoom(self.zoom)?;
        Ok((origin, zoom))
    }
}
