//! Prelude module for common terraplet types and traits
//!
//! This module re-exports the most commonly used types, traits, and functions
//! for easy importing with `use terraplet::prelude::*;`

pub use crate::core::{
    config::{ElevationOptions, MapConfig, RasterOptions, TileLoadingConfig},
    geo::{
        decode_height_sample, encode_height_sample, geo_to_tile_id, tile_bounds,
        CanonicalTileId, LatLng, Point, ProjectedRect, TileId,
    },
    map::{ControllerState, MapController, MapOrigin},
};

pub use crate::tiles::{
    cache::TileCache,
    entity::{ChildResource, DataChannel, DataChannelState, TileEntity},
    loader::{FetchResult, HttpFetcher, TileDataLoader, TileFetcher, TileRequest},
    pool::{TileHandle, TilePool, TileVisualizer},
    provider::{RangeTileProvider, TileProvider, TileProviderEvent},
    source::UrlTemplateSource,
};

pub use crate::runtime::{runtime, spawn, AsyncHandle, AsyncSpawner};

pub use crate::{Error as MapError, Result};

pub use std::{
    pin::Pin,
    sync::{Arc, Mutex},
    time::{Duration, Instant},
};

pub use fxhash::{FxHashMap as HashMap, FxHashSet as HashSet};

pub use futures::Future;
