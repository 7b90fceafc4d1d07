//! Core constants for the tiling scheme and the terrain-RGB elevation encoding.
//! Keeping them in a single place makes it easier to audit engine-wide magic numbers.

/// Side length of the dense height grid decoded from an elevation tile.
pub const HEIGHT_GRID_SIZE: usize = 256;

/// Highest zoom level accepted by the coordinate engine.
pub const MAX_ZOOM: u8 = 22;

/// WGS84 equatorial radius used by the spherical mercator projection.
pub const EARTH_RADIUS: f64 = 6_378_137.0;

/// Half the projected world width in meters (EPSG:3857).
pub const ORIGIN_SHIFT: f64 = std::f64::consts::PI * EARTH_RADIUS;

/// Latitude limit of the square mercator world.
pub const MAX_LATITUDE: f64 = 85.051_128_779_806_59;

/// Terrain-RGB base height in meters. Part of the tile-source contract.
pub const ELEVATION_BASE: f64 = -10_000.0;

/// Terrain-RGB height step in meters per encoded unit. Part of the tile-source contract.
pub const ELEVATION_SCALE: f64 = 0.1;

/// Largest encoded terrain-RGB value (24 bits).
pub const ELEVATION_MAX_CODE: u32 = 0x00FF_FFFF;
