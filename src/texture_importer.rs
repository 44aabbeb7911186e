// src/texture_importer.rs
//! Image decoders: encoded bytes in, owned RGBA8 pixels out.
//!
//! An uncompressed TGA parser handles 24/32-bit truecolor images in either scan-line
//! orientation, and a compressed path backed by the `image` crate handles WebP (plus
//! PNG and JPEG) with an optional power-of-two downscale. GPU block containers (KTX,
//! KTX2, ASTC, PKM) are only unwrapped: their blocks go to the GPU as stored.
//! Everything here is pure and safe to call from loader workers.

use std::path::Path;

use image::{imageops::FilterType, DynamicImage, ImageFormat};

use crate::context::Context;
use crate::ensure;
use crate::error::{Error, Result};
use crate::pixel_format::{CompressedFormat, ASTC_FOOTPRINTS};
use crate::texture::max_mip_levels;

/// Decoder output.
///
/// Decoded images hold tightly packed RGBA8, rows top to bottom. For block
/// containers `compressed` names the block format, `pixels` holds the base level's
/// blocks and `mips` any smaller levels stored in the file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedImage {
    pub width: u32,
    pub height: u32,
    /// True when the source carried an alpha channel.
    pub has_alpha: bool,
    pub pixels: Vec<u8>,
    pub compressed: Option<CompressedFormat>,
    pub mips: Vec<Vec<u8>>,
}

impl DecodedImage {
    pub fn rgba(width: u32, height: u32, has_alpha: bool, pixels: Vec<u8>) -> Self {
        Self {
            width,
            height,
            has_alpha,
            pixels,
            compressed: None,
            mips: Vec::new(),
        }
    }

    /// `levels` runs base level first.
    pub fn compressed(width: u32, height: u32, format: CompressedFormat, levels: Vec<Vec<u8>>) -> Self {
        let mut levels = levels.into_iter();
        Self {
            width,
            height,
            has_alpha: format.has_alpha(),
            pixels: levels.next().unwrap_or_default(),
            compressed: Some(format),
            mips: levels.collect(),
        }
    }

    #[inline]
    pub fn is_compressed(&self) -> bool {
        self.compressed.is_some()
    }

    #[inline]
    pub fn byte_len(&self) -> usize {
        self.pixels.len() + self.mips.iter().map(Vec::len).sum::<usize>()
    }
}

/// Options for the importer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImportOptions {
    /// Integer downscale divisor for compressed images. Must be a power of two.
    pub downscale: u32,
}

impl Default for ImportOptions {
    fn default() -> Self {
        Self { downscale: 1 }
    }
}

impl ImportOptions {
    pub fn with_downscale(mut self, downscale: u32) -> Self {
        self.downscale = downscale;
        self
    }

    pub fn validate(&self) -> Result<()> {
        ensure!(
            self.downscale.is_power_of_two(),
            Error::InvalidScale(self.downscale)
        );
        Ok(())
    }
}

const KTX_MAGIC: [u8; 12] = [0xAB, b'K', b'T', b'X', b' ', b'1', b'1', 0xBB, b'\r', b'\n', 0x1A, b'\n'];
const KTX2_MAGIC: [u8; 12] = [0xAB, b'K', b'T', b'X', b' ', b'2', b'0', 0xBB, b'\r', b'\n', 0x1A, b'\n'];
const ASTC_MAGIC: [u8; 4] = [0x13, 0xAB, 0xA1, 0x5C];
const PKM_MAGIC: &[u8; 4] = b"PKM ";

/// Container formats the importer recognises.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageKind {
    Tga,
    WebP,
    Png,
    Jpeg,
    Ktx,
    Ktx2,
    Astc,
    Pkm,
}

impl ImageKind {
    pub fn from_extension(ext: &str) -> Option<Self> {
        match ext.to_ascii_lowercase().as_str() {
            "tga" => Some(ImageKind::Tga),
            "webp" => Some(ImageKind::WebP),
            "png" => Some(ImageKind::Png),
            "jpg" | "jpeg" => Some(ImageKind::Jpeg),
            "ktx" => Some(ImageKind::Ktx),
            "ktx2" => Some(ImageKind::Ktx2),
            "astc" => Some(ImageKind::Astc),
            "pkm" => Some(ImageKind::Pkm),
            _ => None,
        }
    }

    /// Sniffs the leading bytes. TGA has no magic number and is never returned here.
    pub fn from_magic(bytes: &[u8]) -> Option<Self> {
        if bytes.len() >= 12 && &bytes[0..4] == b"RIFF" && &bytes[8..12] == b"WEBP" {
            Some(ImageKind::WebP)
        } else if bytes.starts_with(&[0x89, b'P', b'N', b'G']) {
            Some(ImageKind::Png)
        } else if bytes.starts_with(&[0xFF, 0xD8, 0xFF]) {
            Some(ImageKind::Jpeg)
        } else if bytes.starts_with(&KTX_MAGIC) {
            Some(ImageKind::Ktx)
        } else if bytes.starts_with(&KTX2_MAGIC) {
            Some(ImageKind::Ktx2)
        } else if bytes.starts_with(&ASTC_MAGIC) {
            Some(ImageKind::Astc)
        } else if bytes.starts_with(PKM_MAGIC) {
            Some(ImageKind::Pkm)
        } else {
            None
        }
    }

    fn image_format(self) -> Option<ImageFormat> {
        match self {
            ImageKind::WebP => Some(ImageFormat::WebP),
            ImageKind::Png => Some(ImageFormat::Png),
            ImageKind::Jpeg => Some(ImageFormat::Jpeg),
            _ => None,
        }
    }

    /// Containers whose payload is GPU blocks rather than pixels.
    pub fn is_block_compressed(self) -> bool {
        matches!(self, ImageKind::Ktx | ImageKind::Ktx2 | ImageKind::Astc | ImageKind::Pkm)
    }
}

pub struct TextureImporter;

impl TextureImporter {
    /// Reads the whole file and decodes it, choosing the decoder by extension and
    /// falling back to magic-byte sniffing.
    pub fn load_from_file(path: impl AsRef<Path>, options: ImportOptions) -> Result<DecodedImage> {
        let path = path.as_ref();
        let bytes = Error::read_file(path)?;
        let extension = path.extension().and_then(|e| e.to_str()).unwrap_or_default();
        Self::decode(&bytes, extension, options).with_context(|| format!("decoding {}", path.display()))
    }

    /// Decodes an in-memory buffer. `extension` may be empty.
    pub fn decode(bytes: &[u8], extension: &str, options: ImportOptions) -> Result<DecodedImage> {
        options.validate()?;
        let kind = ImageKind::from_extension(extension)
            .or_else(|| ImageKind::from_magic(bytes))
            .ok_or_else(|| {
                Error::UnsupportedImageFormat(format!("unrecognised image type (extension {:?})", extension))
            })?;

        if options.downscale != 1 && kind.image_format().is_none() {
            let what = if kind.is_block_compressed() { "block-compressed" } else { "uncompressed" };
            log::debug!("downscale {} ignored for {} {:?} input", options.downscale, what, kind);
        }
        match kind {
            ImageKind::Tga => unpack_tga(bytes),
            ImageKind::Ktx => unpack_ktx(bytes),
            ImageKind::Ktx2 => unpack_ktx2(bytes),
            ImageKind::Astc => unpack_astc(bytes),
            ImageKind::Pkm => unpack_pkm(bytes),
            ImageKind::WebP | ImageKind::Png | ImageKind::Jpeg => unpack_compressed(bytes, kind, options.downscale),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Uncompressed TGA
// ─────────────────────────────────────────────────────────────────────────────

const TGA_HEADER_LEN: usize = 18;
const TGA_TYPE_TRUECOLOR: u8 = 2;
const TGA_TYPE_RLE_TRUECOLOR: u8 = 10;
/// Image descriptor bit set when the first stored row is the top row.
const TGA_ORIGIN_TOP: u8 = 0x20;

/// Unpacks an uncompressed 24 or 32-bit TGA into top-down RGBA8.
///
/// Bottom-left origin images are flipped so both orientations produce the same
/// canonical scan order. RLE and colour-mapped variants are rejected.
pub fn unpack_tga(bytes: &[u8]) -> Result<DecodedImage> {
    ensure!(
        bytes.len() >= TGA_HEADER_LEN,
        Error::UnsupportedImageFormat("TGA header truncated".into())
    );

    let id_len = bytes[0] as usize;
    let color_map_type = bytes[1];
    let image_type = bytes[2];
    let width = u16::from_le_bytes([bytes[12], bytes[13]]) as u32;
    let height = u16::from_le_bytes([bytes[14], bytes[15]]) as u32;
    let bpp = bytes[16];
    let descriptor = bytes[17];

    match image_type {
        TGA_TYPE_TRUECOLOR => {}
        TGA_TYPE_RLE_TRUECOLOR => {
            return Err(Error::UnsupportedImageFormat("RLE-compressed TGA".into()))
        }
        other => {
            return Err(Error::UnsupportedImageFormat(format!("TGA image type {}", other)))
        }
    }
    ensure!(
        color_map_type == 0,
        Error::UnsupportedImageFormat("colour-mapped TGA".into())
    );
    ensure!(
        bpp == 24 || bpp == 32,
        Error::UnsupportedImageFormat(format!("TGA with {} bits per pixel", bpp))
    );
    ensure!(
        width > 0 && height > 0,
        Error::UnsupportedImageFormat("TGA with zero size".into())
    );

    let src_bpp = bpp as usize / 8;
    let row_len = width as usize * src_bpp;
    let start = TGA_HEADER_LEN + id_len;
    let end = start + row_len * height as usize;
    ensure!(
        bytes.len() >= end,
        Error::UnsupportedImageFormat("TGA pixel data truncated".into())
    );

    let top_down = descriptor & TGA_ORIGIN_TOP != 0;
    let data = &bytes[start..end];
    let mut pixels = Vec::with_capacity(width as usize * height as usize * 4);

    for y in 0..height as usize {
        let src_row = if top_down { y } else { height as usize - 1 - y };
        let row = &data[src_row * row_len..(src_row + 1) * row_len];
        for px in row.chunks_exact(src_bpp) {
            // stored as BGR(A)
            let a = if src_bpp == 4 { px[3] } else { 255 };
            pixels.extend_from_slice(&[px[2], px[1], px[0], a]);
        }
    }

    Ok(DecodedImage::rgba(width, height, bpp == 32, pixels))
}

// ─────────────────────────────────────────────────────────────────────────────
// Compressed formats
// ─────────────────────────────────────────────────────────────────────────────

/// Unpacks a WebP buffer, downscaling by `downscale` (1 keeps the source size).
pub fn unpack_webp(bytes: &[u8], downscale: u32) -> Result<DecodedImage> {
    unpack_compressed(bytes, ImageKind::WebP, downscale)
}

fn unpack_compressed(bytes: &[u8], kind: ImageKind, downscale: u32) -> Result<DecodedImage> {
    ensure!(downscale.is_power_of_two(), Error::InvalidScale(downscale));
    let format = kind
        .image_format()
        .ok_or_else(|| Error::UnsupportedImageFormat(format!("{:?} is not a compressed format", kind)))?;

    let image = image::load_from_memory_with_format(bytes, format)
        .map_err(|e| Error::UnsupportedImageFormat(format!("{:?}: {}", kind, e)))?;
    let has_alpha = image.color().has_alpha();
    let image = downscale_image(image, downscale);

    let rgba = image.to_rgba8();
    let (width, height) = rgba.dimensions();
    Ok(DecodedImage::rgba(width, height, has_alpha, rgba.into_raw()))
}

fn downscale_image(image: DynamicImage, downscale: u32) -> DynamicImage {
    if downscale <= 1 {
        return image;
    }
    let w = (image.width() / downscale).max(1);
    let h = (image.height() / downscale).max(1);
    image.resize_exact(w, h, FilterType::Triangle)
}

// ─────────────────────────────────────────────────────────────────────────────
// GPU block containers
// ─────────────────────────────────────────────────────────────────────────────

const PKM_HEADER_LEN: usize = 16;
const ASTC_HEADER_LEN: usize = 16;
const KTX_HEADER_LEN: usize = 64;
const KTX_ENDIAN_REF: u32 = 0x0403_0201;
/// `GL_COMPRESSED_RGBA_ASTC_4x4_KHR`. The other footprints follow in `ASTC_FOOTPRINTS` order.
const GL_ASTC_FIRST: u32 = 0x93B0;

/// glInternalFormat values for the non-ASTC block formats.
const KTX_GL_FORMATS: [(u32, CompressedFormat); 7] = [
    (0x8D64, CompressedFormat::Etc2Rgb8), // ETC1
    (0x9274, CompressedFormat::Etc2Rgb8),
    (0x9276, CompressedFormat::Etc2Rgb8A1),
    (0x9278, CompressedFormat::Etc2Rgba8),
    (0x83F1, CompressedFormat::Bc1Rgba),
    (0x83F3, CompressedFormat::Bc3Rgba),
    (0x8E8C, CompressedFormat::Bc7Rgba),
];

const KTX2_FORMATS: [(ktx2::Format, CompressedFormat); 9] = [
    (ktx2::Format::ETC2_R8G8B8_UNORM_BLOCK, CompressedFormat::Etc2Rgb8),
    (ktx2::Format::ETC2_R8G8B8A1_UNORM_BLOCK, CompressedFormat::Etc2Rgb8A1),
    (ktx2::Format::ETC2_R8G8B8A8_UNORM_BLOCK, CompressedFormat::Etc2Rgba8),
    (ktx2::Format::ASTC_4x4_UNORM_BLOCK, CompressedFormat::Astc { block_width: 4, block_height: 4 }),
    (ktx2::Format::ASTC_6x6_UNORM_BLOCK, CompressedFormat::Astc { block_width: 6, block_height: 6 }),
    (ktx2::Format::ASTC_8x8_UNORM_BLOCK, CompressedFormat::Astc { block_width: 8, block_height: 8 }),
    (ktx2::Format::BC1_RGBA_UNORM_BLOCK, CompressedFormat::Bc1Rgba),
    (ktx2::Format::BC3_UNORM_BLOCK, CompressedFormat::Bc3Rgba),
    (ktx2::Format::BC7_UNORM_BLOCK, CompressedFormat::Bc7Rgba),
];

fn unsupported(msg: impl Into<String>) -> Error {
    Error::UnsupportedImageFormat(msg.into())
}

/// Checks that each level holds exactly the blocks its size needs.
fn check_levels(kind: &str, format: CompressedFormat, width: u32, height: u32, levels: &[Vec<u8>]) -> Result<()> {
    let (mut w, mut h) = (width, height);
    for (i, level) in levels.iter().enumerate() {
        let expected = format.level_size(w, h);
        ensure!(
            level.len() as u64 == expected,
            unsupported(format!("{} level {} holds {} bytes, {}x{} needs {}", kind, i, level.len(), w, h, expected))
        );
        w = (w / 2).max(1);
        h = (h / 2).max(1);
    }
    Ok(())
}

/// Unwraps an ETC1/ETC2 PKM file. PKM carries a single level.
pub fn unpack_pkm(bytes: &[u8]) -> Result<DecodedImage> {
    ensure!(
        bytes.len() >= PKM_HEADER_LEN && bytes.starts_with(PKM_MAGIC),
        unsupported("not a PKM file")
    );
    let be16 = |at: usize| u16::from_be_bytes([bytes[at], bytes[at + 1]]) as u32;
    let format = match (&bytes[4..6], be16(6)) {
        (b"10", 0) | (b"20", 0) | (b"20", 1) => CompressedFormat::Etc2Rgb8,
        (b"20", 3) => CompressedFormat::Etc2Rgba8,
        (b"20", 4) => CompressedFormat::Etc2Rgb8A1,
        (version, data_type) => {
            return Err(unsupported(format!(
                "PKM version {} data type {}",
                String::from_utf8_lossy(version),
                data_type
            )))
        }
    };
    // The padded size covers whole 4x4 blocks; the plain size is the image's.
    let (padded_width, padded_height) = (be16(8), be16(10));
    let (width, height) = (be16(12), be16(14));
    ensure!(
        width > 0 && height > 0 && padded_width >= width && padded_height >= height,
        unsupported(format!("PKM with bad dimensions {}x{}", width, height))
    );
    let size = format.level_size(padded_width, padded_height) as usize;
    let data = bytes
        .get(PKM_HEADER_LEN..PKM_HEADER_LEN + size)
        .ok_or_else(|| unsupported("PKM block data truncated"))?;
    Ok(DecodedImage::compressed(width, height, format, vec![data.to_vec()]))
}

/// Unwraps a 2D ASTC file.
pub fn unpack_astc(bytes: &[u8]) -> Result<DecodedImage> {
    ensure!(
        bytes.len() >= ASTC_HEADER_LEN && bytes.starts_with(&ASTC_MAGIC),
        unsupported("not an ASTC file")
    );
    let le24 = |at: usize| u32::from_le_bytes([bytes[at], bytes[at + 1], bytes[at + 2], 0]);
    let (block_width, block_height, block_depth) = (bytes[4], bytes[5], bytes[6]);
    let (width, height, depth) = (le24(7), le24(10), le24(13));
    ensure!(block_depth == 1 && depth == 1, unsupported("3D ASTC"));
    ensure!(width > 0 && height > 0, unsupported("ASTC with zero size"));
    let format = CompressedFormat::astc(block_width, block_height)
        .ok_or_else(|| unsupported(format!("ASTC block {}x{}", block_width, block_height)))?;
    let size = format.level_size(width, height) as usize;
    let data = bytes
        .get(ASTC_HEADER_LEN..ASTC_HEADER_LEN + size)
        .ok_or_else(|| unsupported("ASTC block data truncated"))?;
    Ok(DecodedImage::compressed(width, height, format, vec![data.to_vec()]))
}

fn ktx_gl_format(internal_format: u32) -> Option<CompressedFormat> {
    if let Some(index) = internal_format.checked_sub(GL_ASTC_FIRST) {
        if let Some(&(w, h)) = ASTC_FOOTPRINTS.get(index as usize) {
            return CompressedFormat::astc(w, h);
        }
    }
    KTX_GL_FORMATS
        .iter()
        .find(|(gl, _)| *gl == internal_format)
        .map(|(_, format)| *format)
}

/// Unwraps a little-endian KTX 1.1 file holding one compressed 2D image and its mips.
pub fn unpack_ktx(bytes: &[u8]) -> Result<DecodedImage> {
    ensure!(
        bytes.len() >= KTX_HEADER_LEN && bytes.starts_with(&KTX_MAGIC),
        unsupported("not a KTX file")
    );
    // Header fields after the 12-byte identifier, in file order.
    let field = |i: usize| {
        let at = 12 + i * 4;
        u32::from_le_bytes([bytes[at], bytes[at + 1], bytes[at + 2], bytes[at + 3]])
    };
    let (endianness, gl_type, internal_format) = (field(0), field(1), field(4));
    let (width, height, depth) = (field(6), field(7), field(8));
    let (array_elements, faces, stored_levels, key_value_bytes) = (field(9), field(10), field(11), field(12));

    ensure!(endianness == KTX_ENDIAN_REF, unsupported("big-endian KTX"));
    ensure!(gl_type == 0, unsupported("uncompressed KTX"));
    ensure!(
        depth == 0 && array_elements == 0 && faces == 1,
        unsupported("KTX arrays, volumes and cube maps")
    );
    ensure!(width > 0 && height > 0, unsupported("KTX with zero size"));
    let format = ktx_gl_format(internal_format)
        .ok_or_else(|| unsupported(format!("KTX internal format {:#06x}", internal_format)))?;

    let stored_levels = stored_levels.max(1);
    let usable = stored_levels.min(max_mip_levels(width, height));
    if usable < stored_levels {
        log::warn!("KTX file has too many mips: {}x{}, {} levels", width, height, stored_levels);
    }

    let truncated = || unsupported("KTX level data truncated");
    let mut offset = KTX_HEADER_LEN + key_value_bytes as usize;
    let mut levels = Vec::with_capacity(usable as usize);
    for _ in 0..usable {
        let size = bytes
            .get(offset..offset + 4)
            .map(|b| u32::from_le_bytes([b[0], b[1], b[2], b[3]]) as usize)
            .ok_or_else(truncated)?;
        offset += 4;
        let data = bytes.get(offset..offset + size).ok_or_else(truncated)?;
        levels.push(data.to_vec());
        offset += size.next_multiple_of(4);
    }
    check_levels("KTX", format, width, height, &levels)?;
    Ok(DecodedImage::compressed(width, height, format, levels))
}

/// Unwraps a KTX2 file. RGBA8 payloads come back as plain pixels, block formats as
/// blocks. Supercompressed (Basis, zstd) files are rejected.
pub fn unpack_ktx2(bytes: &[u8]) -> Result<DecodedImage> {
    let reader = ktx2::Reader::new(bytes).map_err(|e| unsupported(format!("KTX2: {}", e)))?;
    let header = reader.header();
    if let Some(scheme) = header.supercompression_scheme {
        return Err(unsupported(format!("supercompressed KTX2 ({:?})", scheme)));
    }
    ensure!(
        header.pixel_depth <= 1 && header.layer_count <= 1 && header.face_count == 1,
        unsupported("KTX2 arrays, volumes and cube maps")
    );
    let vk_format = header
        .format
        .ok_or_else(|| unsupported("KTX2 without a Vulkan format"))?;
    let (width, height) = (header.pixel_width, header.pixel_height.max(1));
    let levels: Vec<Vec<u8>> = reader.levels().map(<[u8]>::to_vec).collect();

    if vk_format == ktx2::Format::R8G8B8A8_UNORM || vk_format == ktx2::Format::R8G8B8A8_SRGB {
        let base = levels.into_iter().next().unwrap_or_default();
        ensure!(
            base.len() == width as usize * height as usize * 4,
            unsupported(format!("KTX2 RGBA level holds {} bytes", base.len()))
        );
        return Ok(DecodedImage::rgba(width, height, true, base));
    }

    let format = KTX2_FORMATS
        .iter()
        .find(|(vk, _)| *vk == vk_format)
        .map(|(_, format)| *format)
        .ok_or_else(|| unsupported(format!("KTX2 format {:?}", vk_format)))?;
    check_levels("KTX2", format, width, height, &levels)?;
    Ok(DecodedImage::compressed(width, height, format, levels))
}
