// src/gpu/mod.rs
//! Graphics backend seam.
//!
//! The [`Renderer`](crate::renderer::Renderer) never talks to a graphics API directly;
//! it drives a [`GraphicsBackend`]. Two implementations ship with the crate:
//! [`HeadlessBackend`] keeps everything in memory (tests, tools, CI) and
//! [`WgpuBackend`] runs against a real device through `wgpu`.

pub mod headless;
#[cfg(not(target_arch = "wasm32"))]
pub mod wgpu_backend;

pub use headless::{HeadlessBackend, HeadlessOptions, HeadlessProbe, HeadlessState, HeadlessTexture};
#[cfg(not(target_arch = "wasm32"))]
pub use wgpu_backend::WgpuBackend;

use glam::{UVec2, Vec4};
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::pixel_format::{CompressedFormat, TextureFormat};
use crate::shader::UniformWrite;

// ---------- Handle types ----------

/// GPU texture object. `TextureHandle::invalid()` marks "never allocated".
#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug)]
pub struct TextureHandle(u32);

impl TextureHandle {
    pub(crate) fn new(raw: u32) -> Self {
        TextureHandle(raw)
    }
    pub fn invalid() -> Self {
        TextureHandle(0)
    }
    pub fn is_valid(self) -> bool {
        self.0 != 0
    }
    pub fn raw(self) -> u32 {
        self.0
    }
}

impl Default for TextureHandle {
    fn default() -> Self {
        Self::invalid()
    }
}

/// Linked GPU program.
#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug)]
pub struct ProgramHandle(u32);

impl ProgramHandle {
    pub(crate) fn new(raw: u32) -> Self {
        ProgramHandle(raw)
    }
    pub fn invalid() -> Self {
        ProgramHandle(0)
    }
    pub fn is_valid(self) -> bool {
        self.0 != 0
    }
    pub fn raw(self) -> u32 {
        self.0
    }
}

// ---------- Context negotiation ----------

/// Capability tier of the graphics context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum FeatureLevel {
    /// Fallback tier (WebGL2 / GLES 2 class limits).
    Level20,
    /// Preferred tier.
    Level30,
}

/// What the backend reports after a context has been created.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContextInfo {
    pub feature_level: FeatureLevel,
    pub max_vertex_uniform_components: u32,
    pub viewport_size: UVec2,
    pub adapter_name: String,
}

// ---------- Resource descriptions ----------

/// Sampler addressing outside `[0, 1]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum TextureWrap {
    #[default]
    Repeat,
    ClampToEdge,
}

/// Addressing and layout flags that travel with a texture down to the backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct TextureFlags {
    pub wrap: TextureWrap,
    /// Six square faces stored as a vertical strip, in +X, -X, +Y, -Y, +Z, -Z order.
    pub cube_map: bool,
}

impl TextureFlags {
    #[inline]
    pub fn layers(self) -> u32 {
        if self.cube_map {
            6
        } else {
            1
        }
    }
}

/// Texture upload request. `levels[0]` is the base image, already encoded in `format`
/// (or in `compressed` blocks, with `format` set to `Native`). `width` and `height`
/// are per face; a cube map level holds its six faces back to back.
#[derive(Debug, Clone, Copy)]
pub struct GpuTextureDesc<'a> {
    pub label: &'a str,
    pub width: u32,
    pub height: u32,
    pub format: TextureFormat,
    pub compressed: Option<CompressedFormat>,
    pub flags: TextureFlags,
    pub levels: &'a [Vec<u8>],
}

impl GpuTextureDesc<'_> {
    /// Expected byte length of the base level.
    pub fn base_level_size(&self) -> u64 {
        let per_face = match self.compressed {
            Some(format) => format.level_size(self.width, self.height),
            None => u64::from(self.width) * u64::from(self.height) * u64::from(self.format.bytes_per_pixel()),
        };
        per_face * u64::from(self.flags.layers())
    }
}

/// What the backend knows about a live texture.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GpuTextureInfo {
    pub width: u32,
    pub height: u32,
    pub format: TextureFormat,
    pub compressed: Option<CompressedFormat>,
    pub flags: TextureFlags,
    pub mip_levels: u32,
}

/// Row-aligned texture write. Always starts at column 0 and spans the full width.
#[derive(Debug, Clone, Copy)]
pub struct TextureRows<'a> {
    pub y_offset: u32,
    pub rows: u32,
    pub data: &'a [u8],
}

/// The operations the renderer needs from a graphics API.
///
/// Every call happens on the thread that owns the renderer. Implementations must
/// not assume a context exists: calls other than `create_context` made before it
/// succeeds (or after `destroy_context`) return an error.
pub trait GraphicsBackend: Send {
    fn name(&self) -> &'static str;

    /// Creates the window/surface stand-in and a context at exactly `level`.
    fn create_context(&mut self, size: UVec2, title: &str, level: FeatureLevel) -> Result<ContextInfo>;
    fn destroy_context(&mut self);
    fn has_context(&self) -> bool;

    /// Whether textures can be stored in `format` without conversion.
    fn supports_format(&self, format: TextureFormat) -> bool;
    /// Whether `format` blocks can be uploaded as they are.
    fn supports_compressed(&self, format: CompressedFormat) -> bool;

    fn create_texture(&mut self, desc: &GpuTextureDesc<'_>) -> Result<TextureHandle>;
    fn update_texture(&mut self, handle: TextureHandle, rows: &TextureRows<'_>) -> Result<()>;
    fn texture_info(&self, handle: TextureHandle) -> Option<GpuTextureInfo>;
    fn delete_texture(&mut self, handle: TextureHandle);

    /// Builds a program from already validated WGSL stage sources.
    fn create_program(&mut self, label: &str, vertex_wgsl: &str, fragment_wgsl: &str) -> Result<ProgramHandle>;
    fn delete_program(&mut self, program: ProgramHandle);
    fn write_uniforms(&mut self, program: ProgramHandle, writes: &[UniformWrite]) -> Result<()>;

    fn clear(&mut self, color: Option<Vec4>, depth: bool);
    /// Finishes the frame. A minimized window skips presentation.
    fn present(&mut self, minimized: bool);
    fn viewport_size(&self) -> UVec2;
}
