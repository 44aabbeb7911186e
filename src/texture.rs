// src/texture.rs
//! Texture resources and their decode/upload state machine.
//!
//! ```text
//! Unloaded ──queue──▶ Queued ──decode──▶ Decoded ──upload──▶ Resident
//!                        │                  │
//!                        └──────────────────┴──────▶ Failed
//! ```
//!
//! Decoding happens off-thread but never mutates a `Texture`: workers hand back an
//! owned [`DecodedImage`] and the owning thread applies it. Uploads only happen on the
//! thread that owns the [`Renderer`].

use std::path::{Path, PathBuf};

use glam::UVec2;
use image::{imageops::FilterType, ImageBuffer, Rgba};
use parking_lot::RwLock;

use crate::context::OptionContext;
use crate::error::{Error, Result};
use crate::gpu::{TextureFlags, TextureHandle, TextureWrap};
use crate::pixel_format::{self, CompressedFormat, TextureFormat};
use crate::renderer::Renderer;
use crate::texture_importer::{DecodedImage, ImportOptions, TextureImporter};

// ─────────────────────────────────────────────────────────────────────────────
// Texture configuration
// ─────────────────────────────────────────────────────────────────────────────

/// Controls how a texture is decoded and stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TextureConfig {
    pub desired_format: TextureFormat,
    pub generate_mipmaps: bool,
    pub import: ImportOptions,
    pub flags: TextureFlags,
}

impl Default for TextureConfig {
    fn default() -> Self {
        Self {
            desired_format: TextureFormat::Auto,
            generate_mipmaps: true,
            import: ImportOptions::default(),
            flags: TextureFlags::default(),
        }
    }
}

impl TextureConfig {
    pub fn with_format(mut self, format: TextureFormat) -> Self {
        self.desired_format = format;
        self
    }

    pub fn with_mipmaps(mut self, mipmaps: bool) -> Self {
        self.generate_mipmaps = mipmaps;
        self
    }

    pub fn with_downscale(mut self, downscale: u32) -> Self {
        self.import = self.import.with_downscale(downscale);
        self
    }

    pub fn with_wrap(mut self, wrap: TextureWrap) -> Self {
        self.flags.wrap = wrap;
        self
    }

    /// The image is a vertical strip of six square faces.
    pub fn with_cube_map(mut self, cube_map: bool) -> Self {
        self.flags.cube_map = cube_map;
        self
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// State
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TextureState {
    Unloaded,
    Queued,
    /// Pixels are in memory, not yet on the GPU.
    Decoded,
    Resident,
    Failed,
}

impl TextureState {
    /// Resident or Failed: nothing more will happen without a new request.
    pub fn is_settled(self) -> bool {
        matches!(self, TextureState::Resident | TextureState::Failed)
    }
}

struct TextureInner {
    state: TextureState,
    config: TextureConfig,
    handle: TextureHandle,
    size: UVec2,
    has_alpha: bool,
    actual_format: Option<TextureFormat>,
    compressed: Option<CompressedFormat>,
    mip_levels: u32,
    pixels: Option<DecodedImage>,
    error: Option<String>,
    released: bool,
}

// ─────────────────────────────────────────────────────────────────────────────
// Core texture struct
// ─────────────────────────────────────────────────────────────────────────────

/// A single image resource, identified by its source filename.
pub struct Texture {
    filename: String,
    path: PathBuf,
    inner: RwLock<TextureInner>,
}

impl Texture {
    /// `filename` is the cache key, `path` where the bytes are read from.
    pub fn new(filename: impl Into<String>, path: impl Into<PathBuf>, config: TextureConfig) -> Self {
        Self {
            filename: filename.into(),
            path: path.into(),
            inner: RwLock::new(TextureInner {
                state: TextureState::Unloaded,
                config,
                handle: TextureHandle::invalid(),
                size: UVec2::ZERO,
                has_alpha: false,
                actual_format: None,
                compressed: None,
                mip_levels: 0,
                pixels: None,
                error: None,
                released: false,
            }),
        }
    }

    // ── Queries ──────────────────────────────────────────────────────────

    pub fn filename(&self) -> &str {
        &self.filename
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    #[inline]
    pub fn state(&self) -> TextureState {
        self.inner.read().state
    }

    #[inline]
    pub fn is_resident(&self) -> bool {
        self.state() == TextureState::Resident
    }

    /// GPU handle; invalid until the texture is Resident.
    pub fn handle(&self) -> TextureHandle {
        self.inner.read().handle
    }

    /// Pixel size once decoded, zero before.
    pub fn size(&self) -> UVec2 {
        self.inner.read().size
    }

    pub fn has_alpha(&self) -> bool {
        self.inner.read().has_alpha
    }

    pub fn config(&self) -> TextureConfig {
        self.inner.read().config
    }

    pub fn desired_format(&self) -> TextureFormat {
        self.inner.read().config.desired_format
    }

    /// Takes effect at the next upload.
    pub fn set_desired_format(&self, format: TextureFormat) {
        self.inner.write().config.desired_format = format;
    }

    /// Format the GPU copy was stored in, after `Auto` resolution and backend fallback.
    pub fn actual_format(&self) -> Option<TextureFormat> {
        self.inner.read().actual_format
    }

    /// Block format of a texture uploaded without decoding. Its `actual_format` is `Native`.
    pub fn compressed_format(&self) -> Option<CompressedFormat> {
        self.inner.read().compressed
    }

    pub fn mip_levels(&self) -> u32 {
        self.inner.read().mip_levels
    }

    /// Why the texture is Failed, if it is.
    pub fn error(&self) -> Option<String> {
        self.inner.read().error.clone()
    }

    // ── Transitions ──────────────────────────────────────────────────────

    fn expect_state(inner: &TextureInner, filename: &str, allowed: &[TextureState]) -> Result<()> {
        if allowed.contains(&inner.state) {
            Ok(())
        } else {
            Err(Error::InvalidState(format!(
                "texture {} is {:?}, expected one of {:?}",
                filename, inner.state, allowed
            )))
        }
    }

    pub(crate) fn mark_queued(&self) -> Result<()> {
        let mut inner = self.inner.write();
        Self::expect_state(&inner, &self.filename, &[TextureState::Unloaded])?;
        inner.state = TextureState::Queued;
        Ok(())
    }

    pub(crate) fn set_decoded(&self, image: DecodedImage) -> Result<()> {
        let mut inner = self.inner.write();
        Self::expect_state(&inner, &self.filename, &[TextureState::Queued])?;
        inner.size = UVec2::new(image.width, image.height);
        inner.has_alpha = image.has_alpha;
        inner.pixels = Some(image);
        inner.state = TextureState::Decoded;
        Ok(())
    }

    pub(crate) fn mark_failed(&self, reason: impl Into<String>) {
        let mut inner = self.inner.write();
        inner.pixels = None;
        inner.error = Some(reason.into());
        inner.state = TextureState::Failed;
    }

    /// Decoded → Resident. Must run on the renderer's thread.
    ///
    /// Allocates the GPU texture, uploads the pixels (plus a mip chain when
    /// configured), then drops the CPU copy. Block-compressed images go up as
    /// stored, which needs an `Auto` or `Native` desired format and backend support.
    /// Any failure leaves the texture Failed.
    pub fn finalize(&self, renderer: &mut Renderer) -> Result<()> {
        let (image, config) = {
            let mut inner = self.inner.write();
            Self::expect_state(&inner, &self.filename, &[TextureState::Decoded])?;
            if inner.released {
                drop(inner);
                let err = Error::InvalidState(format!("texture {} was unloaded before upload", self.filename));
                self.mark_failed(err.to_string());
                return Err(err);
            }
            let image = inner
                .pixels
                .take()
                .with_context(|| format!("texture {} has no pixels", self.filename))?;
            (image, inner.config)
        };

        let size = UVec2::new(image.width, image.height);
        let created = match image.compressed {
            Some(format) => self.upload_compressed(renderer, image, format, config),
            None => renderer.create_texture_with_flags(
                &image.pixels,
                size,
                image.has_alpha,
                config.generate_mipmaps,
                config.desired_format,
                config.flags,
            ),
        };
        match created {
            Ok(handle) => {
                let info = renderer.texture_info(handle);
                let mut inner = self.inner.write();
                inner.handle = handle;
                inner.actual_format = info.map(|i| i.format);
                inner.compressed = info.and_then(|i| i.compressed);
                inner.mip_levels = info.map(|i| i.mip_levels).unwrap_or(1);
                inner.state = TextureState::Resident;
                log::debug!(
                    "texture {} resident ({}x{}, {:?} -> {:?})",
                    self.filename,
                    size.x,
                    size.y,
                    config.desired_format,
                    inner.compressed.map_or(format!("{:?}", inner.actual_format), |c| format!("{:?}", c))
                );
                Ok(())
            }
            Err(err) => {
                self.mark_failed(err.to_string());
                Err(err)
            }
        }
    }

    fn upload_compressed(
        &self,
        renderer: &mut Renderer,
        image: DecodedImage,
        format: CompressedFormat,
        config: TextureConfig,
    ) -> Result<TextureHandle> {
        if !config.desired_format.accepts_compressed() {
            let err = Error::UnsupportedImageFormat(format!(
                "{} holds {:?} blocks, which can't be stored as {:?}",
                self.filename, format, config.desired_format
            ));
            renderer.set_last_error(err.to_string());
            return Err(err);
        }
        if config.generate_mipmaps && image.mips.is_empty() && (image.width > 1 || image.height > 1) {
            log::warn!("{} stores no mip levels and compressed data can't be downsampled", self.filename);
        }
        let size = UVec2::new(image.width, image.height);
        let mut levels = Vec::with_capacity(1 + image.mips.len());
        levels.push(image.pixels);
        if config.generate_mipmaps {
            levels.extend(image.mips);
        }
        renderer.create_compressed_texture(format, size, &levels, config.flags)
    }

    /// Synchronous decode + upload on the calling thread.
    pub fn load_now(&self, renderer: &mut Renderer) -> Result<()> {
        self.mark_queued()?;
        let import = self.config().import;
        match TextureImporter::load_from_file(&self.path, import) {
            Ok(image) => {
                self.set_decoded(image)?;
                self.finalize(renderer)
            }
            Err(err) => {
                renderer.set_last_error(err.to_string());
                self.mark_failed(err.to_string());
                Err(err)
            }
        }
    }

    /// Replaces whole rows of a Resident texture. `data` is in `format`.
    pub fn update_rows(
        &self,
        renderer: &mut Renderer,
        format: TextureFormat,
        y_offset: u32,
        rows: u32,
        data: &[u8],
    ) -> Result<()> {
        let (handle, width) = {
            let inner = self.inner.read();
            Self::expect_state(&inner, &self.filename, &[TextureState::Resident])?;
            (inner.handle, inner.size.x)
        };
        renderer.update_texture(handle, format, 0, y_offset, width, rows, data)
    }

    /// Frees the GPU copy and stops any pending upload from completing.
    pub(crate) fn release(&self, renderer: &mut Renderer) {
        let mut inner = self.inner.write();
        inner.released = true;
        inner.pixels = None;
        if inner.handle.is_valid() {
            renderer.delete_texture(inner.handle);
            inner.handle = TextureHandle::invalid();
            inner.state = TextureState::Unloaded;
        }
    }

    pub fn is_released(&self) -> bool {
        self.inner.read().released
    }
}

impl std::fmt::Debug for Texture {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.read();
        f.debug_struct("Texture")
            .field("filename", &self.filename)
            .field("state", &inner.state)
            .field("handle", &inner.handle)
            .field("size", &inner.size)
            .finish()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Pixel helpers
// ─────────────────────────────────────────────────────────────────────────────

/// Maximum number of mip levels for a given dimension pair.
#[inline]
pub fn max_mip_levels(width: u32, height: u32) -> u32 {
    32 - width.max(height).max(1).leading_zeros()
}

/// Builds the full RGBA8 mip chain, base level first.
pub fn generate_mip_chain(base: &[u8], width: u32, height: u32) -> Vec<Vec<u8>> {
    let levels = max_mip_levels(width, height);
    let mut chain = Vec::with_capacity(levels as usize);
    chain.push(base.to_vec());

    let Some(mut src) = ImageBuffer::<Rgba<u8>, Vec<u8>>::from_raw(width, height, base.to_vec()) else {
        return chain;
    };
    let (mut w, mut h) = (width, height);
    for _ in 1..levels {
        w = (w / 2).max(1);
        h = (h / 2).max(1);
        let dst = image::imageops::resize(&src, w, h, FilterType::Lanczos3);
        chain.push(dst.as_raw().clone());
        src = dst;
    }
    chain
}

/// Encodes RGBA8 pixels into `format`'s byte layout.
pub fn encode_pixels(rgba: &[u8], format: TextureFormat) -> Vec<u8> {
    match format {
        TextureFormat::Auto | TextureFormat::Native | TextureFormat::Rgba8888 => rgba.to_vec(),
        TextureFormat::Luminance => pixel_format::rgba_to_luminance(rgba),
        TextureFormat::Rgb888 => pixel_format::rgba_to_rgb(rgba),
        TextureFormat::Rgba5551 => pixel_format::packed_to_bytes(&pixel_format::convert_8888_to_5551(rgba)),
        TextureFormat::Rgb565 => {
            pixel_format::packed_to_bytes(&pixel_format::convert_888_to_565(&pixel_format::rgba_to_rgb(rgba)))
        }
    }
}
