// src/pixel_format.rs
//! Pixel storage formats and the reduced-precision bit packers.
//!
//! Packing truncates each channel with a plain right shift. There is no rounding
//! and no dithering, so expanding a packed value back never overshoots the source.

use serde::{Deserialize, Serialize};

/// Storage format requested for (or used by) a GPU texture.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum TextureFormat {
    /// Pick from the image: 5551 when it has alpha, 565 otherwise. Block-compressed
    /// sources stay compressed.
    #[default]
    Auto,
    Rgba8888,
    Rgb888,
    Rgba5551,
    Rgb565,
    /// One 8-bit channel.
    Luminance,
    /// Whatever the source file holds: 8888 or 888 for decoded images, the file's
    /// own block format for compressed containers.
    Native,
}

impl TextureFormat {
    /// Resolves `Auto` and `Native` against the image's alpha flag. Explicit formats
    /// pass through.
    pub fn resolve(self, has_alpha: bool) -> TextureFormat {
        match self {
            TextureFormat::Auto if has_alpha => TextureFormat::Rgba5551,
            TextureFormat::Auto => TextureFormat::Rgb565,
            TextureFormat::Native if has_alpha => TextureFormat::Rgba8888,
            TextureFormat::Native => TextureFormat::Rgb888,
            other => other,
        }
    }

    /// Bytes per pixel of the stored representation (0 for `Auto` and `Native`).
    #[inline]
    pub fn bytes_per_pixel(self) -> u32 {
        match self {
            TextureFormat::Auto | TextureFormat::Native => 0,
            TextureFormat::Rgba8888 => 4,
            TextureFormat::Rgb888 => 3,
            TextureFormat::Rgba5551 | TextureFormat::Rgb565 => 2,
            TextureFormat::Luminance => 1,
        }
    }

    #[inline]
    pub fn is_packed(self) -> bool {
        matches!(self, TextureFormat::Rgba5551 | TextureFormat::Rgb565)
    }

    /// Whether a compressed source may be uploaded as-is under this request.
    #[inline]
    pub fn accepts_compressed(self) -> bool {
        matches!(self, TextureFormat::Auto | TextureFormat::Native)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Block-compressed formats
// ─────────────────────────────────────────────────────────────────────────────

/// GPU block formats read from KTX, KTX2, ASTC and PKM containers. They are
/// uploaded without decoding, so the backend has to support them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CompressedFormat {
    /// ETC2 RGB. ETC1 data is a valid subset.
    Etc2Rgb8,
    Etc2Rgb8A1,
    Etc2Rgba8,
    /// ASTC LDR with the given block footprint.
    Astc { block_width: u8, block_height: u8 },
    Bc1Rgba,
    Bc3Rgba,
    Bc7Rgba,
}

/// Block footprints ASTC allows for 2D images.
pub const ASTC_FOOTPRINTS: [(u8, u8); 14] = [
    (4, 4),
    (5, 4),
    (5, 5),
    (6, 5),
    (6, 6),
    (8, 5),
    (8, 6),
    (8, 8),
    (10, 5),
    (10, 6),
    (10, 8),
    (10, 10),
    (12, 10),
    (12, 12),
];

impl CompressedFormat {
    /// ASTC with a legal 2D footprint.
    pub fn astc(block_width: u8, block_height: u8) -> Option<Self> {
        ASTC_FOOTPRINTS
            .contains(&(block_width, block_height))
            .then_some(CompressedFormat::Astc { block_width, block_height })
    }

    /// Block width and height in pixels.
    pub fn block_size(self) -> (u32, u32) {
        match self {
            CompressedFormat::Astc { block_width, block_height } => (block_width as u32, block_height as u32),
            _ => (4, 4),
        }
    }

    pub fn bytes_per_block(self) -> u32 {
        match self {
            CompressedFormat::Etc2Rgb8 | CompressedFormat::Etc2Rgb8A1 | CompressedFormat::Bc1Rgba => 8,
            _ => 16,
        }
    }

    pub fn has_alpha(self) -> bool {
        !matches!(self, CompressedFormat::Etc2Rgb8)
    }

    /// Bytes of one image of `width` x `height` pixels, partial blocks rounded up.
    pub fn level_size(self, width: u32, height: u32) -> u64 {
        let (bw, bh) = self.block_size();
        u64::from(width.max(1).div_ceil(bw)) * u64::from(height.max(1).div_ceil(bh)) * u64::from(self.bytes_per_block())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Packers
// ─────────────────────────────────────────────────────────────────────────────

#[inline]
pub fn pack_5551(r: u8, g: u8, b: u8, a: u8) -> u16 {
    ((r as u16 >> 3) << 11) | ((g as u16 >> 3) << 6) | ((b as u16 >> 3) << 1) | (a as u16 >> 7)
}

#[inline]
pub fn pack_565(r: u8, g: u8, b: u8) -> u16 {
    ((r as u16 >> 3) << 11) | ((g as u16 >> 2) << 5) | (b as u16 >> 3)
}

/// Packs an RGBA8 buffer into RGBA5551. `rgba.len()` must be `width * height * 4`;
/// trailing bytes that do not form a whole pixel are ignored.
pub fn convert_8888_to_5551(rgba: &[u8]) -> Vec<u16> {
    rgba.chunks_exact(4)
        .map(|p| pack_5551(p[0], p[1], p[2], p[3]))
        .collect()
}

/// Packs a tightly packed RGB8 buffer (three bytes per pixel) into RGB565.
pub fn convert_888_to_565(rgb: &[u8]) -> Vec<u16> {
    rgb.chunks_exact(3)
        .map(|p| pack_565(p[0], p[1], p[2]))
        .collect()
}

/// Drops the alpha byte of every RGBA8 pixel.
pub fn rgba_to_rgb(rgba: &[u8]) -> Vec<u8> {
    rgba.chunks_exact(4).flat_map(|p| [p[0], p[1], p[2]]).collect()
}

/// Rec. 601 luma of every RGBA8 pixel, alpha dropped. Grey input keeps its value.
pub fn rgba_to_luminance(rgba: &[u8]) -> Vec<u8> {
    rgba.chunks_exact(4)
        .map(|p| ((77 * p[0] as u32 + 150 * p[1] as u32 + 29 * p[2] as u32) >> 8) as u8)
        .collect()
}

/// Packed pixels as the little-endian byte stream GPUs expect.
pub fn packed_to_bytes(packed: &[u16]) -> Vec<u8> {
    packed.iter().flat_map(|p| p.to_le_bytes()).collect()
}

/// Expands a 5551 pixel back to 8 bits per channel (low bits zeroed).
pub fn expand_5551(p: u16) -> [u8; 4] {
    [
        (((p >> 11) & 0x1F) as u8) << 3,
        (((p >> 6) & 0x1F) as u8) << 3,
        (((p >> 1) & 0x1F) as u8) << 3,
        if p & 1 == 1 { 255 } else { 0 },
    ]
}

/// Expands a 565 pixel back to 8-bit RGB (low bits zeroed).
pub fn expand_565(p: u16) -> [u8; 3] {
    [
        (((p >> 11) & 0x1F) as u8) << 3,
        (((p >> 5) & 0x3F) as u8) << 2,
        ((p & 0x1F) as u8) << 3,
    ]
}
