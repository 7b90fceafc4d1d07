//! Terrain-RGB height decoding.
//!
//! An elevation tile is an image whose red, green and blue channels pack a
//! 24-bit height code (see [`decode_height_sample`]). Decoding produces a
//! dense `HEIGHT_GRID_SIZE × HEIGHT_GRID_SIZE` grid stored row-major:
//! the sample for image row `row` and column `col` lives at `row * N + col`.
//! [`sample_index`] is the matching lookup for normalized `(u, v)`.
//!
//! The grid is north-up like the slippy-map image it came from: row 0 is the
//! northern edge of the tile, so `v = 0` is north and `v = 1` is south.
//! `u = 0` is the western edge.

use image::{DynamicImage, ImageOutputFormat, Rgba, RgbaImage};
use std::io::Cursor;

use crate::constants::HEIGHT_GRID_SIZE;
use crate::core::geo::{decode_height_sample, encode_height_sample};
use crate::{MapError, Result};

const N: usize = HEIGHT_GRID_SIZE;

/// Decodes `bytes` into `grid`, multiplying every sample by `scale`.
///
/// `grid` is resized to `N * N` on first use and overwritten in place after
/// that. On error `grid` is left untouched.
pub fn decode_into(grid: &mut Vec<f32>, bytes: &[u8], scale: f64) -> Result<()> {
    let image = image::load_from_memory(bytes)?.to_rgba8();
    let (width, height) = image.dimensions();

    if (width as usize) < N || (height as usize) < N {
        return Err(MapError::DataDecode(format!(
            "elevation tile is {width}x{height}, expected at least {N}x{N}"
        )));
    }

    grid.resize(N * N, 0.0);

    for row in 0..N {
        let py = (row * height as usize / N) as u32;
        for col in 0..N {
            let px = (col * width as usize / N) as u32;
            let Rgba([r, g, b, _]) = *image.get_pixel(px, py);
            grid[row * N + col] = (decode_height_sample(r, g, b) * scale) as f32;
        }
    }

    Ok(())
}

/// Grid index of the nearest sample to normalized `(u, v)`; `u` runs along
/// columns, `v` along rows.
pub fn sample_index(u: f32, v: f32) -> usize {
    let col = cell(u);
    let row = cell(v);
    row * N + col
}

fn cell(t: f32) -> usize {
    let scaled = (t * N as f32).floor();
    if scaled.is_nan() {
        0
    } else {
        scaled.clamp(0.0, (N - 1) as f32) as usize
    }
}

/// Builds a PNG terrain-RGB tile of `size × size` pixels, where
/// `height_at(row, col)` gives the height in meters of each pixel.
pub fn encode_elevation_tile(size: u32, height_at: impl Fn(u32, u32) -> f64) -> Result<Vec<u8>> {
    let image = RgbaImage::from_fn(size, size, |col, row| {
        let (r, g, b) = encode_height_sample(height_at(row, col));
        Rgba([r, g, b, 255])
    });

    let mut bytes = Cursor::new(Vec::new());
    DynamicImage::ImageRgba8(image).write_to(&mut bytes, ImageOutputFormat::Png)?;
    Ok(bytes.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flat_tile() {
        let bytes = encode_elevation_tile(256, |_, _| 50.0).unwrap();
        let mut grid = Vec::new();
        decode_into(&mut grid, &bytes, 1.0).unwrap();

        assert_eq!(grid.len(), N * N);
        assert!(grid.iter().all(|h| (h - 50.0).abs() < 1e-3));
    }

    #[test]
    fn test_row_column_convention() {
        // Height encodes position: 1000 m per row, 1 m per column
        let bytes = encode_elevation_tile(256, |row, col| row as f64 * 1000.0 + col as f64).unwrap();
        let mut grid = Vec::new();
        decode_into(&mut grid, &bytes, 1.0).unwrap();

        assert!((grid[3 * N + 7] - 3007.0).abs() < 0.06);
        // u picks the column, v the row
        assert!((grid[sample_index(7.5 / 256.0, 3.5 / 256.0)] - 3007.0).abs() < 0.06);
        assert!((grid[sample_index(1.0, 0.0)] - 255.0).abs() < 0.06);
        assert!((grid[sample_index(0.0, 1.0)] - 255_000.0).abs() < 0.06);
    }

    #[test]
    fn test_scale_applied() {
        let bytes = encode_elevation_tile(256, |_, _| 100.0).unwrap();
        let mut grid = Vec::new();
        decode_into(&mut grid, &bytes, 2.5).unwrap();
        assert!((grid[0] - 250.0).abs() < 1e-3);
    }

    #[test]
    fn test_larger_image_is_resampled() {
        let bytes = encode_elevation_tile(512, |row, col| (row / 2) as f64 * 1000.0 + (col / 2) as f64)
            .unwrap();
        let mut grid = Vec::new();
        decode_into(&mut grid, &bytes, 1.0).unwrap();
        assert!((grid[10 * N + 20] - 10_020.0).abs() < 0.06);
    }

    #[test]
    fn test_undersized_tile_rejected() {
        let bytes = encode_elevation_tile(128, |_, _| 10.0).unwrap();
        let mut grid = vec![7.0; N * N];
        let err = decode_into(&mut grid, &bytes, 1.0).unwrap_err();
        assert!(matches!(err, MapError::DataDecode(_)));
        assert_eq!(grid[0], 7.0);
    }

    #[test]
    fn test_garbage_rejected() {
        let mut grid = Vec::new();
        let err = decode_into(&mut grid, b"not an image", 1.0).unwrap_err();
        assert!(matches!(err, MapError::DataDecode(_)));
        assert!(grid.is_empty());
    }

    #[test]
    fn test_sample_index_clamps() {
        assert_eq!(sample_index(-1.0, -1.0), 0);
        assert_eq!(sample_index(2.0, 2.0), N * N - 1);
        assert_eq!(sample_index(f32::NAN, 0.0), 0);
        assert_eq!(sample_index(0.5, 0.5), 128 * N + 128);
    }
}
