//! Tile entities, their decoders, the slot pool and the data loading pipeline
//!
//! This module provides:
//! - Per-tile data channels with an explicit state machine and change notifications
//! - Terrain-RGB height decoding and raster decoding
//! - A generation-stamped entity pool that recycles tiles without reallocating
//! - Tile providers and an async fetcher that commits through the pool

pub mod cache;
pub mod entity;
pub mod height;
pub mod loader;
pub mod pool;
pub mod provider;
pub mod raster;
pub mod source;

// Re-exports for convenience
pub use cache::TileCache;
pub use entity::{ChildResource, DataChannel, DataChannelState, TileEntity};
pub use loader::{FetchResult, HttpFetcher, TileDataLoader, TileFetcher, TileRequest};
pub use pool::{TileHandle, TilePool, TileVisualizer};
pub use provider::{RangeTileProvider, TileProvider, TileProviderEvent};
pub use raster::RasterImage;
pub use source::UrlTemplateSource;
