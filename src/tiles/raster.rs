//! Raster tile decoding into a reusable RGBA buffer.

use image::imageops::FilterType;
use image::RgbaImage;

use crate::Result;

/// One level of a mip chain
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MipLevel {
    pub width: u32,
    pub height: u32,
    pub pixels: Vec<u8>,
}

/// Decoded raster imagery for a tile, RGBA8, row-major from the top-left.
///
/// The pixel vectors keep their capacity across tile reuse.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RasterImage {
    pub width: u32,
    pub height: u32,
    pub pixels: Vec<u8>,
    /// Levels below the base image, halving each time down to 1×1.
    /// Empty unless mipmaps were requested.
    pub mip_levels: Vec<MipLevel>,
    /// Whether the renderer should block-compress the texture on upload
    pub compression_requested: bool,
}

impl RasterImage {
    /// Decodes `bytes` into this buffer, replacing previous contents.
    pub fn decode_from(&mut self, bytes: &[u8], use_mipmap: bool, use_compression: bool) -> Result<()> {
        let image = image::load_from_memory(bytes)?.to_rgba8();

        self.width = image.width();
        self.height = image.height();
        self.pixels.clear();
        self.pixels.extend_from_slice(image.as_raw());
        self.compression_requested = use_compression;

        if use_mipmap {
            self.build_mip_chain(&image);
        } else {
            self.mip_levels.clear();
        }

        Ok(())
    }

    fn build_mip_chain(&mut self, base: &RgbaImage) {
        let mut level_count = 0;
        let mut previous = base.clone();

        while previous.width() > 1 || previous.height() > 1 {
            let width = (previous.width() / 2).max(1);
            let height = (previous.height() / 2).max(1);
            let next = image::imageops::resize(&previous, width, height, FilterType::Triangle);

            if level_count < self.mip_levels.len() {
                let level = &mut self.mip_levels[level_count];
                level.width = width;
                level.height = height;
                level.pixels.clear();
                level.pixels.extend_from_slice(next.as_raw());
            } else {
                self.mip_levels.push(MipLevel {
                    width,
                    height,
                    pixels: next.as_raw().clone(),
                });
            }

            level_count += 1;
            previous = next;
        }

        self.mip_levels.truncate(level_count);
    }

    /// Marks the buffer empty without releasing its allocations
    pub fn clear(&mut self) {
        self.width = 0;
        self.height = 0;
        self.pixels.clear();
        for level in &mut self.mip_levels {
            level.pixels.clear();
        }
    }

    pub fn is_empty(&self) -> bool {
        self.pixels.is_empty()
    }
}
