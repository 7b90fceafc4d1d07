//! # terraplet
//!
//! Tile entity lifecycle and terrain data pipeline for streaming map engines.
//!
//! The crate converts geographic coordinates into a slippy-map tiling scheme,
//! tracks per-tile data arrival (imagery, elevation, vector features) through an
//! explicit state machine, decodes terrain-RGB elevation images into height
//! grids, and recycles tile entities as the visible set changes. The
//! [`MapController`] ties these together and performs the one-shot
//! "snap map to terrain height" protocol.

pub mod core;
pub mod prelude;
pub mod runtime;
pub mod tiles;
pub use crate::core::constants;

// Re-export public API
pub use crate::core::{
    config::{ElevationOptions, MapConfig, RasterOptions, TileLoadingConfig},
    geo::{
        decode_height_sample, encode_height_sample, geo_to_tile_id, tile_bounds,
        CanonicalTileId, LatLng, Point, ProjectedRect, TileId,
    },
    map::{ControllerState, MapController, MapOrigin},
};

pub use tiles::{
    entity::{DataChannel, DataChannelState, TileEntity},
    loader::{FetchResult, TileDataLoader, TileFetcher},
    pool::{TileHandle, TilePool, TileVisualizer},
    provider::{RangeTileProvider, TileProvider, TileProviderEvent},
};

/// Result type used throughout the library
pub type Result<T> = std::result::Result<T, MapError>;

/// Common error types
#[derive(Debug, thiserror::Error)]
pub enum MapError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Invalid zoom level {0} (expected 0..=22)")]
    InvalidZoom(i32),

    #[error("Data decode error: {0}")]
    DataDecode(String),

    #[error("Stale activation write for tile {tile} (generation {generation}, current {current})")]
    StaleActivationWrite {
        tile: String,
        generation: u64,
        current: u64,
    },

    #[error("Invalid coordinates: {0}")]
    InvalidCoordinates(String),

    #[error("Invalid controller state: {0}")]
    InvalidState(String),

    #[error("Fetch error: {0}")]
    Fetch(String),

    #[error("Parse error: {0}")]
    ParseError(String),
}

impl From<image::ImageError> for MapError {
    fn from(err: image::ImageError) -> Self {
        MapError::DataDecode(err.to_string())
    }
}

/// Error type alias for convenience
pub type Error = MapError;

/// Initialize `env_logger` for binaries that enable the `debug` feature.
#[cfg(feature = "debug")]
pub fn init_logger() {
    let _ = env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .try_init();
}
