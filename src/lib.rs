// src/lib.rs
//! Resource and render-state core: graphics context ownership, shader programs,
//! texture decode/upload and material caching.
//!
//! Everything GPU-facing goes through a [`Renderer`], which is passed by reference to
//! whatever needs it. Textures decode on an [`AsyncLoader`] worker pool and upload on
//! the renderer's thread when [`MaterialManager::try_finalize`] is polled.

pub mod async_loader;
pub mod context;
pub mod error;
pub mod gpu;
pub mod materials;
pub mod pixel_format;
pub mod renderer;
pub mod shader;
pub mod texture;
pub mod texture_importer;

pub use async_loader::{AsyncLoader, LoaderConfig};
pub use context::{Context, OptionContext};
pub use error::{Error, Result, ShaderStage};
pub use gpu::{
    FeatureLevel, GraphicsBackend, HeadlessBackend, HeadlessOptions, ProgramHandle, TextureFlags, TextureHandle,
    TextureWrap,
};
pub use materials::{Material, MaterialDescriptor, MaterialManager, MaterialManagerConfig, UnloadPolicy};
pub use pixel_format::{CompressedFormat, TextureFormat};
pub use renderer::{BlendMode, CullingMode, DepthFunction, RenderTarget, Renderer, RendererConfig};
pub use shader::{Shader, Uniform, VertexAttribute};
pub use texture::{Texture, TextureConfig, TextureState};
pub use texture_importer::{DecodedImage, ImportOptions, TextureImporter};
