// src/gpu/headless.rs
//! In-memory backend. No GPU required.
//!
//! Every resource lives in a [`HeadlessState`] behind a shared [`HeadlessProbe`], so a
//! test can keep a probe, hand the backend to a renderer and later inspect exactly
//! what was allocated and uploaded.

use std::collections::HashMap;
use std::sync::Arc;

use glam::{UVec2, Vec4};
use parking_lot::Mutex;

use super::{
    ContextInfo, FeatureLevel, GpuTextureDesc, GpuTextureInfo, GraphicsBackend, ProgramHandle,
    TextureFlags, TextureHandle, TextureRows,
};
use crate::error::{Error, Result};
use crate::pixel_format::{CompressedFormat, TextureFormat};
use crate::shader::UniformWrite;
use crate::{bail, ensure};

#[derive(Debug, Clone)]
pub struct HeadlessOptions {
    /// Highest feature level a context can be created at.
    pub max_feature_level: FeatureLevel,
    /// Simulate a machine where no context can be obtained at all.
    pub fail_context_creation: bool,
    pub max_vertex_uniform_components: u32,
    /// Whether 5551/565/888/luminance storage is available. RGBA8888 always is.
    pub supports_packed_formats: bool,
    /// Block formats accepted for direct upload. None by default.
    pub compressed_formats: Vec<CompressedFormat>,
}

impl Default for HeadlessOptions {
    fn default() -> Self {
        Self {
            max_feature_level: FeatureLevel::Level30,
            fail_context_creation: false,
            max_vertex_uniform_components: 1024,
            supports_packed_formats: true,
            compressed_formats: Vec::new(),
        }
    }
}

impl HeadlessOptions {
    pub fn with_max_feature_level(mut self, level: FeatureLevel) -> Self {
        self.max_feature_level = level;
        self
    }

    pub fn with_context_failure(mut self) -> Self {
        self.fail_context_creation = true;
        self
    }

    pub fn with_max_vertex_uniform_components(mut self, components: u32) -> Self {
        self.max_vertex_uniform_components = components;
        self
    }

    pub fn without_packed_formats(mut self) -> Self {
        self.supports_packed_formats = false;
        self
    }

    pub fn with_compressed_formats(mut self, formats: &[CompressedFormat]) -> Self {
        self.compressed_formats = formats.to_vec();
        self
    }
}

#[derive(Debug, Clone)]
pub struct HeadlessTexture {
    pub label: String,
    pub width: u32,
    pub height: u32,
    pub format: TextureFormat,
    pub compressed: Option<CompressedFormat>,
    pub flags: TextureFlags,
    pub levels: Vec<Vec<u8>>,
}

#[derive(Debug, Clone)]
pub struct HeadlessProgram {
    pub label: String,
    pub vertex_wgsl: String,
    pub fragment_wgsl: String,
    /// Last bytes written per (group, binding, offset).
    pub uniforms: HashMap<(u32, u32, u32), Vec<u8>>,
}

#[derive(Debug, Default)]
pub struct HeadlessState {
    pub context: Option<ContextInfo>,
    pub title: String,
    pub contexts_created: u32,
    pub textures: HashMap<u32, HeadlessTexture>,
    pub programs: HashMap<u32, HeadlessProgram>,
    pub frames_presented: u64,
    pub frames_skipped: u64,
    pub last_clear_color: Option<Vec4>,
    pub depth_clears: u64,
    next_id: u32,
}

impl HeadlessState {
    fn alloc_id(&mut self) -> u32 {
        self.next_id += 1;
        self.next_id
    }

    pub fn texture(&self, handle: TextureHandle) -> Option<&HeadlessTexture> {
        self.textures.get(&handle.raw())
    }

    pub fn texture_count(&self) -> usize {
        self.textures.len()
    }

    pub fn program(&self, program: ProgramHandle) -> Option<&HeadlessProgram> {
        self.programs.get(&program.raw())
    }
}

pub type HeadlessProbe = Arc<Mutex<HeadlessState>>;

pub struct HeadlessBackend {
    options: HeadlessOptions,
    state: HeadlessProbe,
}

impl HeadlessBackend {
    pub fn new(options: HeadlessOptions) -> Self {
        Self {
            options,
            state: Arc::new(Mutex::new(HeadlessState::default())),
        }
    }

    /// Shared view of the backend's state.
    pub fn probe(&self) -> HeadlessProbe {
        Arc::clone(&self.state)
    }

    fn require_context(&self) -> Result<()> {
        ensure!(
            self.state.lock().context.is_some(),
            Error::InvalidState("headless backend has no context".into())
        );
        Ok(())
    }
}

impl Default for HeadlessBackend {
    fn default() -> Self {
        Self::new(HeadlessOptions::default())
    }
}

impl GraphicsBackend for HeadlessBackend {
    fn name(&self) -> &'static str {
        "Headless"
    }

    fn create_context(&mut self, size: UVec2, title: &str, level: FeatureLevel) -> Result<ContextInfo> {
        if self.options.fail_context_creation {
            bail!(Error::ContextCreation("no display available".into()));
        }
        if level > self.options.max_feature_level {
            bail!(Error::ContextCreation(format!("{:?} not supported", level)));
        }
        let info = ContextInfo {
            feature_level: level,
            max_vertex_uniform_components: self.options.max_vertex_uniform_components,
            viewport_size: size,
            adapter_name: "headless".to_string(),
        };
        let mut state = self.state.lock();
        state.context = Some(info.clone());
        state.title = title.to_string();
        state.contexts_created += 1;
        log::trace!("HeadlessBackend: context {:?} {}x{}", level, size.x, size.y);
        Ok(info)
    }

    fn destroy_context(&mut self) {
        let mut state = self.state.lock();
        state.context = None;
        state.textures.clear();
        state.programs.clear();
    }

    fn has_context(&self) -> bool {
        self.state.lock().context.is_some()
    }

    fn supports_format(&self, format: TextureFormat) -> bool {
        match format {
            TextureFormat::Auto | TextureFormat::Native => false,
            TextureFormat::Rgba8888 => true,
            _ => self.options.supports_packed_formats,
        }
    }

    fn supports_compressed(&self, format: CompressedFormat) -> bool {
        self.options.compressed_formats.contains(&format)
    }

    fn create_texture(&mut self, desc: &GpuTextureDesc<'_>) -> Result<TextureHandle> {
        self.require_context()?;
        match desc.compressed {
            Some(format) => ensure!(
                self.supports_compressed(format),
                Error::UnsupportedImageFormat(format!("{:?} blocks not supported", format))
            ),
            None => ensure!(
                self.supports_format(desc.format),
                Error::InvalidState(format!("format {:?} not supported", desc.format))
            ),
        }
        let expected = desc.base_level_size();
        ensure!(
            desc.levels.first().map(|level| level.len() as u64) == Some(expected),
            Error::InvalidState(format!("base level of {} must be {} bytes", desc.label, expected))
        );

        let mut state = self.state.lock();
        let id = state.alloc_id();
        state.textures.insert(
            id,
            HeadlessTexture {
                label: desc.label.to_string(),
                width: desc.width,
                height: desc.height,
                format: desc.format,
                compressed: desc.compressed,
                flags: desc.flags,
                levels: desc.levels.to_vec(),
            },
        );
        log::trace!(
            "HeadlessBackend: texture {} {:?} ({}x{}, {:?}/{:?}, {} levels, {:?})",
            id,
            desc.label,
            desc.width,
            desc.height,
            desc.format,
            desc.compressed,
            desc.levels.len(),
            desc.flags
        );
        Ok(TextureHandle::new(id))
    }

    fn update_texture(&mut self, handle: TextureHandle, rows: &TextureRows<'_>) -> Result<()> {
        self.require_context()?;
        let mut state = self.state.lock();
        let Some(texture) = state.textures.get_mut(&handle.raw()) else {
            bail!(Error::InvalidState(format!("unknown texture {}", handle.raw())));
        };
        ensure!(
            texture.compressed.is_none() && !texture.flags.cube_map,
            Error::InvalidState(format!("rows of {} cannot be rewritten", texture.label))
        );
        let row_bytes = (texture.width * texture.format.bytes_per_pixel()) as usize;
        let start = rows.y_offset as usize * row_bytes;
        let end = start + rows.rows as usize * row_bytes;
        let base = &mut texture.levels[0];
        ensure!(
            end <= base.len() && rows.data.len() >= end - start,
            Error::InvalidState("row update out of bounds".into())
        );
        base[start..end].copy_from_slice(&rows.data[..end - start]);
        Ok(())
    }

    fn texture_info(&self, handle: TextureHandle) -> Option<GpuTextureInfo> {
        self.state.lock().textures.get(&handle.raw()).map(|t| GpuTextureInfo {
            width: t.width,
            height: t.height,
            format: t.format,
            compressed: t.compressed,
            flags: t.flags,
            mip_levels: t.levels.len() as u32,
        })
    }

    fn delete_texture(&mut self, handle: TextureHandle) {
        self.state.lock().textures.remove(&handle.raw());
    }

    fn create_program(&mut self, label: &str, vertex_wgsl: &str, fragment_wgsl: &str) -> Result<ProgramHandle> {
        self.require_context()?;
        let mut state = self.state.lock();
        let id = state.alloc_id();
        state.programs.insert(
            id,
            HeadlessProgram {
                label: label.to_string(),
                vertex_wgsl: vertex_wgsl.to_string(),
                fragment_wgsl: fragment_wgsl.to_string(),
                uniforms: HashMap::new(),
            },
        );
        Ok(ProgramHandle::new(id))
    }

    fn delete_program(&mut self, program: ProgramHandle) {
        self.state.lock().programs.remove(&program.raw());
    }

    fn write_uniforms(&mut self, program: ProgramHandle, writes: &[UniformWrite]) -> Result<()> {
        let mut state = self.state.lock();
        let Some(entry) = state.programs.get_mut(&program.raw()) else {
            bail!(Error::InvalidState(format!("unknown program {}", program.raw())));
        };
        for write in writes {
            let loc = write.location;
            entry
                .uniforms
                .insert((loc.group, loc.binding, loc.offset), write.data.clone());
        }
        Ok(())
    }

    fn clear(&mut self, color: Option<Vec4>, depth: bool) {
        let mut state = self.state.lock();
        if color.is_some() {
            state.last_clear_color = color;
        }
        if depth {
            state.depth_clears += 1;
        }
    }

    fn present(&mut self, minimized: bool) {
        let mut state = self.state.lock();
        if minimized {
            state.frames_skipped += 1;
        } else {
            state.frames_presented += 1;
        }
    }

    fn viewport_size(&self) -> UVec2 {
        self.state
            .lock()
            .context
            .as_ref()
            .map(|c| c.viewport_size)
            .unwrap_or(UVec2::ZERO)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_context_respects_max_level() {
        let mut backend = HeadlessBackend::new(HeadlessOptions::default().with_max_feature_level(FeatureLevel::Level20));
        assert!(backend.create_context(UVec2::new(64, 64), "t", FeatureLevel::Level30).is_err());
        let info = backend.create_context(UVec2::new(64, 64), "t", FeatureLevel::Level20).unwrap();
        assert_eq!(info.feature_level, FeatureLevel::Level20);
        assert!(backend.has_context());
    }

    #[test]
    fn test_texture_requires_context() {
        let mut backend = HeadlessBackend::default();
        let level = vec![0u8; 4];
        let desc = GpuTextureDesc {
            label: "px",
            width: 1,
            height: 1,
            format: TextureFormat::Rgba8888,
            compressed: None,
            flags: TextureFlags::default(),
            levels: std::slice::from_ref(&level),
        };
        assert!(backend.create_texture(&desc).is_err());
        backend.create_context(UVec2::new(8, 8), "t", FeatureLevel::Level30).unwrap();
        let handle = backend.create_texture(&desc).unwrap();
        assert!(handle.is_valid());
        assert_eq!(backend.probe().lock().texture_count(), 1);
        backend.delete_texture(handle);
        assert_eq!(backend.probe().lock().texture_count(), 0);
    }

    #[test]
    fn test_row_update_writes_bytes() {
        let mut backend = HeadlessBackend::default();
        backend.create_context(UVec2::new(8, 8), "t", FeatureLevel::Level30).unwrap();
        let level = vec![0u8; 2 * 2 * 4];
        let handle = backend
            .create_texture(&GpuTextureDesc {
                label: "rows",
                width: 2,
                height: 2,
                format: TextureFormat::Rgba8888,
                compressed: None,
                flags: TextureFlags::default(),
                levels: std::slice::from_ref(&level),
            })
            .unwrap();
        let row = [7u8; 8];
        backend
            .update_texture(handle, &TextureRows { y_offset: 1, rows: 1, data: &row })
            .unwrap();
        let probe = backend.probe();
        let state = probe.lock();
        let base = &state.texture(handle).unwrap().levels[0];
        assert_eq!(&base[0..8], &[0u8; 8]);
        assert_eq!(&base[8..16], &[7u8; 8]);
    }

    #[test]
    fn test_compressed_upload_needs_opt_in() {
        let etc = vec![0u8; 8 * 4];
        let desc = GpuTextureDesc {
            label: "etc",
            width: 8,
            height: 8,
            format: TextureFormat::Native,
            compressed: Some(CompressedFormat::Etc2Rgb8),
            flags: TextureFlags::default(),
            levels: std::slice::from_ref(&etc),
        };

        let mut plain = HeadlessBackend::default();
        plain.create_context(UVec2::new(8, 8), "t", FeatureLevel::Level30).unwrap();
        assert!(plain.create_texture(&desc).unwrap_err().is_unsupported_format());

        let mut etc_capable =
            HeadlessBackend::new(HeadlessOptions::default().with_compressed_formats(&[CompressedFormat::Etc2Rgb8]));
        etc_capable.create_context(UVec2::new(8, 8), "t", FeatureLevel::Level30).unwrap();
        let handle = etc_capable.create_texture(&desc).unwrap();
        let info = etc_capable.texture_info(handle).unwrap();
        assert_eq!(info.compressed, Some(CompressedFormat::Etc2Rgb8));
        let rows = TextureRows { y_offset: 0, rows: 1, data: &[0; 8] };
        assert!(etc_capable.update_texture(handle, &rows).is_err());
    }

    #[test]
    fn test_cube_map_needs_six_faces() {
        let mut backend = HeadlessBackend::default();
        backend.create_context(UVec2::new(8, 8), "t", FeatureLevel::Level30).unwrap();
        let flags = TextureFlags { cube_map: true, ..Default::default() };
        let one_face = vec![0u8; 2 * 2 * 4];
        let mut desc = GpuTextureDesc {
            label: "sky",
            width: 2,
            height: 2,
            format: TextureFormat::Rgba8888,
            compressed: None,
            flags,
            levels: std::slice::from_ref(&one_face),
        };
        assert!(backend.create_texture(&desc).is_err());

        let six_faces = vec![vec![0u8; 6 * 2 * 2 * 4]];
        desc.levels = &six_faces;
        let handle = backend.create_texture(&desc).unwrap();
        assert!(backend.texture_info(handle).unwrap().flags.cube_map);
    }
}
