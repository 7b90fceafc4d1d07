//! Coordinate engine: geographic points, slippy-map tile ids and their
//! spherical-mercator rectangles.
//!
//! Everything here is a pure function of its inputs.

use serde::{Deserialize, Serialize};
use std::f64::consts::PI;
use std::fmt;
use std::str::FromStr;

use crate::constants::{
    ELEVATION_BASE, ELEVATION_MAX_CODE, ELEVATION_SCALE, MAX_LATITUDE, MAX_ZOOM, ORIGIN_SHIFT,
};
use crate::{MapError, Result};

/// Represents a geographical coordinate with latitude and longitude
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LatLng {
    pub lat: f64,
    pub lng: f64,
}

impl LatLng {
    /// Creates a new LatLng coordinate
    pub fn new(lat: f64, lng: f64) -> Self {
        Self { lat, lng }
    }

    /// Validates that the coordinates are within valid ranges
    pub fn is_valid(&self) -> bool {
        self.lat >= -90.0 && self.lat <= 90.0 && self.lng >= -180.0 && self.lng <= 180.0
    }

    /// Clamps latitude to the square mercator world
    pub fn clamp_lat(lat: f64) -> f64 {
        lat.clamp(-MAX_LATITUDE, MAX_LATITUDE)
    }

    /// Converts to Web Mercator meters (EPSG:3857)
    pub fn to_meters(&self) -> Point {
        let lat_rad = Self::clamp_lat(self.lat).to_radians();
        let x = self.lng / 180.0 * ORIGIN_SHIFT;
        let y = (PI / 4.0 + lat_rad / 2.0).tan().ln() / PI * ORIGIN_SHIFT;
        Point::new(x, y)
    }

    /// Creates LatLng from Web Mercator meters
    pub fn from_meters(point: Point) -> Self {
        let lng = point.x / ORIGIN_SHIFT * 180.0;
        let lat = (2.0 * (point.y / ORIGIN_SHIFT * PI).exp().atan() - PI / 2.0).to_degrees();
        Self::new(lat, lng)
    }
}

impl Default for LatLng {
    fn default() -> Self {
        Self::new(0.0, 0.0)
    }
}

impl fmt::Display for LatLng {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}, {}", self.lat, self.lng)
    }
}

/// Parses the `"lat, lon"` form used by map configuration.
impl FromStr for LatLng {
    type Err = MapError;

    fn from_str(s: &str) -> Result<Self> {
        let mut parts = s.split(',');
        let (Some(lat), Some(lng), None) = (parts.next(), parts.next(), parts.next()) else {
            return Err(MapError::ParseError(format!(
                "expected \"lat, lon\", got {s:?}"
            )));
        };

        let parse = |part: &str| {
            part.trim()
                .parse::<f64>()
                .map_err(|e| MapError::ParseError(format!("{part:?}: {e}")))
        };
        let lat_lng = LatLng::new(parse(lat)?, parse(lng)?);

        if !lat_lng.is_valid() {
            return Err(MapError::InvalidCoordinates(lat_lng.to_string()));
        }
        Ok(lat_lng)
    }
}

/// Represents a point in projected coordinates
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Point {
    pub x: f64,
    pub y: f64,
}

impl Point {
    pub fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }

    pub fn add(&self, other: &Point) -> Point {
        Point::new(self.x + other.x, self.y + other.y)
    }

    pub fn subtract(&self, other: &Point) -> Point {
        Point::new(self.x - other.x, self.y - other.y)
    }

    pub fn multiply(&self, scalar: f64) -> Point {
        Point::new(self.x * scalar, self.y * scalar)
    }
}

impl Default for Point {
    fn default() -> Self {
        Self::new(0.0, 0.0)
    }
}

/// Axis-aligned square in mercator meters, described by its center and size.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ProjectedRect {
    pub center: Point,
    pub size: Point,
}

impl ProjectedRect {
    /// Minimum (south-west) corner
    pub fn min(&self) -> Point {
        self.center.subtract(&self.size.multiply(0.5))
    }

    /// Maximum (north-east) corner
    pub fn max(&self) -> Point {
        self.center.add(&self.size.multiply(0.5))
    }

    /// Half-open containment: the west/south edges belong to the rect.
    pub fn contains(&self, point: &Point) -> bool {
        let min = self.min();
        let max = self.max();
        point.x >= min.x && point.x < max.x && point.y > min.y && point.y <= max.y
    }
}

/// Unwrapped tile address. `x` may leave `[0, 2^z)` when the map crosses the
/// antimeridian; [`TileId::canonical`] folds it back.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TileId {
    pub z: u8,
    pub x: i32,
    pub y: i32,
}

impl TileId {
    pub fn new(z: u8, x: i32, y: i32) -> Self {
        Self { z, x, y }
    }

    /// Number of tiles along one axis at this zoom
    pub fn tiles_per_axis(&self) -> i64 {
        1_i64 << self.z
    }

    /// Wrapped form used for naming, caching and fetching.
    pub fn canonical(&self) -> CanonicalTileId {
        let n = self.tiles_per_axis();
        let x = (self.x as i64).rem_euclid(n) as u32;
        let y = (self.y as i64).clamp(0, n - 1) as u32;
        CanonicalTileId::new(self.z, x, y)
    }

    /// Tile offset by `dx`/`dy` at the same zoom. `x` is left unwrapped.
    pub fn neighbor(&self, dx: i32, dy: i32) -> TileId {
        TileId::new(self.z, self.x + dx, self.y + dy)
    }

    /// Gets the parent tile at a lower zoom level
    pub fn parent(&self) -> Option<TileId> {
        if self.z == 0 {
            None
        } else {
            Some(TileId::new(
                self.z - 1,
                self.x.div_euclid(2),
                self.y.div_euclid(2),
            ))
        }
    }

    /// Gets the child tiles at a higher zoom level
    pub fn children(&self) -> Vec<TileId> {
        if self.z >= MAX_ZOOM {
            Vec::new()
        } else {
            let (z, x, y) = (self.z + 1, self.x * 2, self.y * 2);
            vec![
                TileId::new(z, x, y),
                TileId::new(z, x + 1, y),
                TileId::new(z, x, y + 1),
                TileId::new(z, x + 1, y + 1),
            ]
        }
    }
}

impl fmt::Display for TileId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.z, self.x, self.y)
    }
}

/// Wrapped tile address, always inside `[0, 2^z)` on both axes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CanonicalTileId {
    pub z: u8,
    pub x: u32,
    pub y: u32,
}

impl CanonicalTileId {
    pub fn new(z: u8, x: u32, y: u32) -> Self {
        Self { z, x, y }
    }
}

impl fmt::Display for CanonicalTileId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.z, self.x, self.y)
    }
}

/// Validates a zoom level against `[0, MAX_ZOOM]`.
pub fn validate_zoom(zoom: i32) -> Result<u8> {
    if (0..=MAX_ZOOM as i32).contains(&zoom) {
        Ok(zoom as u8)
    } else {
        Err(MapError::InvalidZoom(zoom))
    }
}

/// Slippy-map tile containing `point` at `zoom`.
pub fn geo_to_tile_id(point: LatLng, zoom: i32) -> Result<TileId> {
    let z = validate_zoom(zoom)?;
    let n = (1_i64 << z) as f64;
    let lat_rad = LatLng::clamp_lat(point.lat).to_radians();

    let x = ((point.lng + 180.0) / 360.0 * n).floor();
    let y = ((1.0 - lat_rad.tan().asinh() / PI) / 2.0 * n).floor();

    Ok(TileId::new(z, x as i32, y.clamp(0.0, n - 1.0) as i32))
}

/// Mercator rectangle covered by `id`.
pub fn tile_bounds(id: TileId) -> ProjectedRect {
    let size = 2.0 * ORIGIN_SHIFT / id.tiles_per_axis() as f64;
    let west = id.x as f64 * size - ORIGIN_SHIFT;
    let north = ORIGIN_SHIFT - id.y as f64 * size;

    ProjectedRect {
        center: Point::new(west + size / 2.0, north - size / 2.0),
        size: Point::new(size, size),
    }
}

/// Terrain-RGB decoding: `-10000 + (r*65536 + g*256 + b) * 0.1` meters.
pub fn decode_height_sample(r: u8, g: u8, b: u8) -> f64 {
    let code = (r as u32) << 16 | (g as u32) << 8 | b as u32;
    ELEVATION_BASE + code as f64 * ELEVATION_SCALE
}

/// Inverse of [`decode_height_sample`], clamped to the encodable range.
pub fn encode_height_sample(height: f64) -> (u8, u8, u8) {
    let code = ((height - ELEVATION_BASE) / ELEVATION_SCALE)
        .round()
        .clamp(0.0, ELEVATION_MAX_CODE as f64) as u32;
    ((code >> 16) as u8, (code >> 8) as u8, code as u8)
}
