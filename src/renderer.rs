// src/renderer.rs
//! The renderer: owns the graphics context and the per-draw state bundle.
//!
//! It is the only component allowed to create or destroy the context, and every
//! GPU resource (textures, programs) is created through it. Uniform fields are plain
//! state: nothing resets them between draws, callers set what they need.
//!
//! Failures are returned as [`Error`] and also recorded in [`Renderer::last_error`],
//! which is overwritten by each new failure.

use glam::{IVec2, Mat4, UVec2, Vec2, Vec3, Vec4};

use crate::error::{Error, Result};
use crate::gpu::{
    FeatureLevel, GpuTextureDesc, GpuTextureInfo, GraphicsBackend, HeadlessBackend, HeadlessOptions,
    HeadlessProbe, ProgramHandle, TextureFlags, TextureHandle, TextureRows,
};
use crate::pixel_format::{CompressedFormat, TextureFormat};
use crate::shader::{self, Shader, UniformWrite};
use crate::texture::{encode_pixels, generate_mip_chain};

// ─────────────────────────────────────────────────────────────────────────────
// Configuration
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct RendererConfig {
    pub window_size: UVec2,
    pub window_title: String,
    pub preferred_feature_level: FeatureLevel,
    /// Retry at level 2.0 when the preferred level is unavailable.
    pub allow_fallback: bool,
}

impl Default for RendererConfig {
    fn default() -> Self {
        Self {
            window_size: UVec2::new(800, 600),
            window_title: String::new(),
            preferred_feature_level: FeatureLevel::Level30,
            allow_fallback: true,
        }
    }
}

impl RendererConfig {
    pub fn with_window(mut self, size: UVec2, title: &str) -> Self {
        self.window_size = size;
        self.window_title = title.to_string();
        self
    }

    pub fn with_feature_level(mut self, level: FeatureLevel) -> Self {
        self.preferred_feature_level = level;
        self
    }

    pub fn without_fallback(mut self) -> Self {
        self.allow_fallback = false;
        self
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Render state enums
// ─────────────────────────────────────────────────────────────────────────────

/// How fragments combine with the framebuffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum BlendMode {
    #[default]
    Off,
    /// Discard fragments with alpha at or below the blend amount.
    Test,
    Alpha,
    Add,
    AddAlpha,
    Multiply,
    PreMultipliedAlpha,
}

impl BlendMode {
    pub const ALL: [BlendMode; 7] = [
        BlendMode::Off,
        BlendMode::Test,
        BlendMode::Alpha,
        BlendMode::Add,
        BlendMode::AddAlpha,
        BlendMode::Multiply,
        BlendMode::PreMultipliedAlpha,
    ];

    /// Pipeline blend state for draw code. `None` means blending disabled.
    pub fn blend_state(self) -> Option<wgpu::BlendState> {
        let color = |src_factor, dst_factor| wgpu::BlendState {
            color: wgpu::BlendComponent {
                src_factor,
                dst_factor,
                operation: wgpu::BlendOperation::Add,
            },
            alpha: wgpu::BlendComponent {
                src_factor,
                dst_factor,
                operation: wgpu::BlendOperation::Add,
            },
        };
        match self {
            BlendMode::Off | BlendMode::Test => None,
            BlendMode::Alpha => Some(wgpu::BlendState::ALPHA_BLENDING),
            BlendMode::Add => Some(color(wgpu::BlendFactor::One, wgpu::BlendFactor::One)),
            BlendMode::AddAlpha => Some(color(wgpu::BlendFactor::SrcAlpha, wgpu::BlendFactor::One)),
            BlendMode::Multiply => Some(color(wgpu::BlendFactor::Dst, wgpu::BlendFactor::Zero)),
            BlendMode::PreMultipliedAlpha => Some(wgpu::BlendState::PREMULTIPLIED_ALPHA_BLENDING),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum CullingMode {
    #[default]
    None,
    Front,
    Back,
    FrontAndBack,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum DepthFunction {
    #[default]
    Disabled,
    Never,
    Always,
    Less,
    LessEqual,
    Greater,
    GreaterEqual,
    Equal,
    NotEqual,
}

impl DepthFunction {
    /// Depth compare for draw code. `None` when the depth test is off.
    pub fn compare_function(self) -> Option<wgpu::CompareFunction> {
        match self {
            DepthFunction::Disabled => None,
            DepthFunction::Never => Some(wgpu::CompareFunction::Never),
            DepthFunction::Always => Some(wgpu::CompareFunction::Always),
            DepthFunction::Less => Some(wgpu::CompareFunction::Less),
            DepthFunction::LessEqual => Some(wgpu::CompareFunction::LessEqual),
            DepthFunction::Greater => Some(wgpu::CompareFunction::Greater),
            DepthFunction::GreaterEqual => Some(wgpu::CompareFunction::GreaterEqual),
            DepthFunction::Equal => Some(wgpu::CompareFunction::Equal),
            DepthFunction::NotEqual => Some(wgpu::CompareFunction::NotEqual),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RenderTarget {
    #[default]
    Screen,
    Texture(TextureHandle),
}

/// Scissor rectangle in viewport pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScissorRect {
    pub position: IVec2,
    pub size: IVec2,
}

// ─────────────────────────────────────────────────────────────────────────────
// Renderer
// ─────────────────────────────────────────────────────────────────────────────

pub struct Renderer {
    backend: Box<dyn GraphicsBackend>,
    config: RendererConfig,
    initialized: bool,

    window_size: UVec2,
    window_title: String,
    time: f64,
    frame_count: u64,
    feature_level: FeatureLevel,
    max_vertex_uniform_components: u32,

    blend_mode: BlendMode,
    blend_amount: f32,
    cull_mode: CullingMode,
    depth_function: DepthFunction,
    scissor: Option<ScissorRect>,
    render_target: RenderTarget,
    texture_units: Vec<TextureHandle>,

    model_view_projection: Mat4,
    model: Mat4,
    color: Vec4,
    light_pos: Vec3,
    camera_pos: Vec3,
    bone_transforms: Vec<Mat4>,

    force_blend_mode: Option<BlendMode>,
    override_pixel_shader: Option<String>,
    last_error: String,
}

impl Renderer {
    pub fn new(backend: Box<dyn GraphicsBackend>, config: RendererConfig) -> Self {
        Self {
            backend,
            window_size: config.window_size,
            window_title: config.window_title.clone(),
            feature_level: config.preferred_feature_level,
            config,
            initialized: false,
            time: 0.0,
            frame_count: 0,
            max_vertex_uniform_components: 0,
            blend_mode: BlendMode::Off,
            blend_amount: 0.5,
            cull_mode: CullingMode::None,
            depth_function: DepthFunction::Disabled,
            scissor: None,
            render_target: RenderTarget::Screen,
            texture_units: Vec::new(),
            model_view_projection: Mat4::IDENTITY,
            model: Mat4::IDENTITY,
            color: Vec4::ONE,
            light_pos: Vec3::ZERO,
            camera_pos: Vec3::ZERO,
            bone_transforms: Vec::new(),
            force_blend_mode: None,
            override_pixel_shader: None,
            last_error: String::new(),
        }
    }

    /// Renderer over an in-memory backend, plus the probe to inspect it.
    pub fn headless(options: HeadlessOptions, config: RendererConfig) -> (Self, HeadlessProbe) {
        let backend = HeadlessBackend::new(options);
        let probe = backend.probe();
        (Self::new(Box::new(backend), config), probe)
    }

    // ── Failure bookkeeping ──────────────────────────────────────────────

    /// Most recent failure description; empty if nothing has failed yet.
    pub fn last_error(&self) -> &str {
        &self.last_error
    }

    pub fn set_last_error(&mut self, message: impl Into<String>) {
        self.last_error = message.into();
    }

    /// Records `err` as the last error, logs it and hands it back.
    pub(crate) fn fail(&mut self, err: Error) -> Error {
        log::error!("{}", err);
        self.last_error = err.to_string();
        err
    }

    fn require_context(&mut self) -> Result<()> {
        if self.initialized {
            Ok(())
        } else {
            Err(self.fail(Error::InvalidState("renderer is not initialized".into())))
        }
    }

    // ── Lifecycle ────────────────────────────────────────────────────────

    /// Creates the window + context, preferring level 3.0 and falling back to 2.0.
    pub fn initialize(&mut self, window_size: UVec2, window_title: &str) -> Result<()> {
        if self.initialized {
            return Err(self.fail(Error::InvalidState("initialize called twice without shut_down".into())));
        }

        let mut levels = vec![self.config.preferred_feature_level];
        if self.config.allow_fallback && self.config.preferred_feature_level == FeatureLevel::Level30 {
            levels.push(FeatureLevel::Level20);
        }

        let mut failures = Vec::new();
        for level in levels {
            match self.backend.create_context(window_size, window_title, level) {
                Ok(info) => {
                    if !failures.is_empty() {
                        log::warn!("falling back to {:?}: {}", level, failures.join("; "));
                    }
                    log::info!(
                        "{} context at {:?} ({}), {} vertex uniform components",
                        self.backend.name(),
                        info.feature_level,
                        info.adapter_name,
                        info.max_vertex_uniform_components
                    );
                    self.initialized = true;
                    self.window_size = window_size;
                    self.window_title = window_title.to_string();
                    self.feature_level = info.feature_level;
                    self.max_vertex_uniform_components = info.max_vertex_uniform_components;
                    self.depth_function = DepthFunction::Less;
                    return Ok(());
                }
                Err(err) => failures.push(err.to_string()),
            }
        }
        Err(self.fail(Error::ContextCreation(failures.join("; "))))
    }

    /// Initializes with the size and title from the config.
    pub fn initialize_default(&mut self) -> Result<()> {
        let size = self.config.window_size;
        let title = self.config.window_title.clone();
        self.initialize(size, &title)
    }

    /// Presents the frame and records the new timestamp. Call once per frame.
    pub fn advance_frame(&mut self, minimized: bool, time: f64) {
        self.time = time;
        self.frame_count += 1;
        self.backend.present(minimized);
        self.depth_function = DepthFunction::Less;
    }

    /// Releases the window and context. Safe to call when not initialized.
    pub fn shut_down(&mut self) {
        if self.initialized {
            self.backend.destroy_context();
            self.initialized = false;
            log::info!("renderer shut down after {} frames", self.frame_count);
        }
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    pub fn clear_frame_buffer(&mut self, color: Vec4) {
        self.backend.clear(Some(color), true);
    }

    pub fn clear_depth_buffer(&mut self) {
        self.backend.clear(None, true);
    }

    // ── Shaders ──────────────────────────────────────────────────────────

    /// Compiles and links a program from WGSL vertex and pixel sources.
    ///
    /// When an override pixel shader is set it replaces `pixel_source`.
    pub fn compile_and_link_shader(&mut self, vertex_source: &str, pixel_source: &str) -> Result<Shader> {
        self.compile_and_link_shader_named("shader", vertex_source, pixel_source)
    }

    pub fn compile_and_link_shader_named(&mut self, name: &str, vertex_source: &str, pixel_source: &str) -> Result<Shader> {
        let (program, reflection) = self.build_program(name, vertex_source, pixel_source)?;
        Ok(Shader::new(name, program, reflection))
    }

    /// Rebuilds `shader` in place from new sources. On failure the old program stays.
    pub fn recompile_shader(&mut self, vertex_source: &str, pixel_source: &str, shader: &Shader) -> Result<()> {
        let (program, reflection) = self.build_program(shader.name(), vertex_source, pixel_source)?;
        let old = shader.reset(program, reflection);
        self.backend.delete_program(old);
        Ok(())
    }

    fn build_program(
        &mut self,
        name: &str,
        vertex_source: &str,
        pixel_source: &str,
    ) -> Result<(ProgramHandle, shader::ShaderReflection)> {
        self.require_context()?;
        let limit = self.max_vertex_uniform_components;
        let vs = shader::preprocess(vertex_source, limit);
        let ps = shader::preprocess(self.override_pixel_shader.as_deref().unwrap_or(pixel_source), limit);

        let linked = shader::compile_and_link(&vs, &ps).map_err(|e| self.fail(e))?;
        let program = self
            .backend
            .create_program(name, &linked.vertex_wgsl, &linked.fragment_wgsl)
            .map_err(|e| self.fail(e))?;
        log::debug!("linked shader {} ({} attributes)", name, linked.reflection.attributes.len());
        Ok((program, linked.reflection))
    }

    pub(crate) fn write_uniforms(&mut self, program: ProgramHandle, writes: &[UniformWrite]) -> Result<()> {
        self.backend
            .write_uniforms(program, writes)
            .map_err(|e| self.fail(e))
    }

    pub fn delete_program(&mut self, program: ProgramHandle) {
        self.backend.delete_program(program);
    }

    // ── Textures ─────────────────────────────────────────────────────────

    /// Allocates a texture from RGBA8 pixels and uploads it synchronously.
    ///
    /// Both dimensions must be powers of two. `desired` is resolved against
    /// `has_alpha`; formats the backend cannot store fall back to RGBA8888.
    pub fn create_texture(
        &mut self,
        rgba: &[u8],
        size: UVec2,
        has_alpha: bool,
        mipmaps: bool,
        desired: TextureFormat,
    ) -> Result<TextureHandle> {
        self.create_texture_with_flags(rgba, size, has_alpha, mipmaps, desired, TextureFlags::default())
    }

    /// [`create_texture`](Self::create_texture) with wrap and layout flags. A cube
    /// map's `rgba` is a vertical strip of six square faces, so `size.y == 6 * size.x`.
    pub fn create_texture_with_flags(
        &mut self,
        rgba: &[u8],
        size: UVec2,
        has_alpha: bool,
        mipmaps: bool,
        desired: TextureFormat,
        flags: TextureFlags,
    ) -> Result<TextureHandle> {
        self.require_context()?;
        let face = self.face_size(size, flags)?;
        let expected = size.x as usize * size.y as usize * 4;
        if rgba.len() != expected {
            return Err(self.fail(Error::InvalidState(format!(
                "texture buffer holds {} bytes, {}x{} RGBA needs {}",
                rgba.len(),
                size.x,
                size.y,
                expected
            ))));
        }

        let format = self.storage_format(desired.resolve(has_alpha));
        let face_bytes = face.x as usize * face.y as usize * 4;
        let mut levels: Vec<Vec<u8>> = Vec::new();
        for face_rgba in rgba.chunks_exact(face_bytes) {
            let chain = if mipmaps {
                generate_mip_chain(face_rgba, face.x, face.y)
            } else {
                vec![face_rgba.to_vec()]
            };
            if levels.is_empty() {
                levels.resize(chain.len(), Vec::new());
            }
            for (level, pixels) in levels.iter_mut().zip(&chain) {
                level.extend(encode_pixels(pixels, format));
            }
        }

        let desc = GpuTextureDesc {
            label: "texture",
            width: face.x,
            height: face.y,
            format,
            compressed: None,
            flags,
            levels: &levels,
        };
        self.backend.create_texture(&desc).map_err(|e| self.fail(e))
    }

    /// Uploads block-compressed levels, base first, without decoding them.
    ///
    /// Fails with `UnsupportedImageFormat` when the backend cannot sample `format`.
    pub fn create_compressed_texture(
        &mut self,
        format: CompressedFormat,
        size: UVec2,
        levels: &[Vec<u8>],
        flags: TextureFlags,
    ) -> Result<TextureHandle> {
        self.require_context()?;
        if flags.cube_map {
            return Err(self.fail(Error::UnsupportedImageFormat(format!("{:?} cube maps", format))));
        }
        self.face_size(size, flags)?;
        if !self.backend.supports_compressed(format) {
            let backend = self.backend.name();
            return Err(self.fail(Error::UnsupportedImageFormat(format!(
                "{:?} textures are not supported by the {} backend",
                format, backend
            ))));
        }
        let desc = GpuTextureDesc {
            label: "compressed texture",
            width: size.x,
            height: size.y,
            format: TextureFormat::Native,
            compressed: Some(format),
            flags,
            levels,
        };
        self.backend.create_texture(&desc).map_err(|e| self.fail(e))
    }

    /// Size of one face. Faces must be powers of two; a cube map stacks six square ones.
    fn face_size(&mut self, size: UVec2, flags: TextureFlags) -> Result<UVec2> {
        let face = if flags.cube_map {
            UVec2::new(size.x, size.y / 6)
        } else {
            size
        };
        let valid = face.x.is_power_of_two()
            && face.y.is_power_of_two()
            && (!flags.cube_map || (face.x == face.y && face.y * 6 == size.y));
        if !valid {
            return Err(self.fail(Error::InvalidTextureDimensions {
                width: size.x,
                height: size.y,
            }));
        }
        Ok(face)
    }

    fn storage_format(&self, requested: TextureFormat) -> TextureFormat {
        if self.backend.supports_format(requested) {
            return requested;
        }
        let fallback = match requested {
            TextureFormat::Rgb565 if self.backend.supports_format(TextureFormat::Rgb888) => TextureFormat::Rgb888,
            _ => TextureFormat::Rgba8888,
        };
        log::debug!("{:?} unsupported by {}, storing as {:?}", requested, self.backend.name(), fallback);
        fallback
    }

    /// Overwrites whole rows of an existing texture.
    ///
    /// `x_offset` must be 0 and `width` the texture's width. `data` is either in the
    /// texture's storage format or RGBA8888, which is converted.
    #[allow(clippy::too_many_arguments)]
    pub fn update_texture(
        &mut self,
        handle: TextureHandle,
        format: TextureFormat,
        x_offset: u32,
        y_offset: u32,
        width: u32,
        height: u32,
        data: &[u8],
    ) -> Result<()> {
        self.require_context()?;
        let Some(info) = self.backend.texture_info(handle) else {
            return Err(self.fail(Error::InvalidState(format!("unknown texture {}", handle.raw()))));
        };
        if info.compressed.is_some() || info.flags.cube_map {
            return Err(self.fail(Error::InvalidState(format!(
                "texture {} is compressed or a cube map and takes no row updates",
                handle.raw()
            ))));
        }
        if x_offset != 0 || width != info.width {
            return Err(self.fail(Error::SubRowUpdate {
                x_offset,
                width,
                texture_width: info.width,
            }));
        }
        let end_row = y_offset.checked_add(height).filter(|end| *end <= info.height);
        if end_row.is_none() {
            return Err(self.fail(Error::InvalidState(format!(
                "rows {}..+{} exceed texture height {}",
                y_offset, height, info.height
            ))));
        }

        let converted;
        let bytes: &[u8] = if format == info.format {
            data
        } else if format == TextureFormat::Rgba8888 {
            converted = encode_pixels(data, info.format);
            &converted
        } else {
            return Err(self.fail(Error::InvalidState(format!(
                "cannot update {:?} texture with {:?} data",
                info.format, format
            ))));
        };
        let needed = u64::from(width) * u64::from(height) * u64::from(info.format.bytes_per_pixel());
        if (bytes.len() as u64) < needed {
            return Err(self.fail(Error::InvalidState(format!(
                "update needs {} bytes, got {}",
                needed,
                bytes.len()
            ))));
        }

        let rows = TextureRows {
            y_offset,
            rows: height,
            data: bytes,
        };
        self.backend.update_texture(handle, &rows).map_err(|e| self.fail(e))
    }

    pub fn texture_info(&self, handle: TextureHandle) -> Option<GpuTextureInfo> {
        self.backend.texture_info(handle)
    }

    pub fn delete_texture(&mut self, handle: TextureHandle) {
        self.backend.delete_texture(handle);
    }

    // ── Render state ─────────────────────────────────────────────────────

    pub fn set_blend_mode(&mut self, mode: BlendMode) {
        self.set_blend_mode_with_amount(mode, 0.5);
    }

    /// `amount` is the alpha-test threshold used by [`BlendMode::Test`].
    /// A forced blend mode, when set, replaces `mode`.
    pub fn set_blend_mode_with_amount(&mut self, mode: BlendMode, amount: f32) {
        self.blend_mode = self.force_blend_mode.unwrap_or(mode);
        self.blend_amount = amount;
    }

    pub fn blend_mode(&self) -> BlendMode {
        self.blend_mode
    }

    pub fn blend_amount(&self) -> f32 {
        self.blend_amount
    }

    pub fn set_culling(&mut self, mode: CullingMode) {
        self.cull_mode = mode;
    }

    pub fn culling(&self) -> CullingMode {
        self.cull_mode
    }

    pub fn set_depth_function(&mut self, function: DepthFunction) {
        self.depth_function = function;
    }

    pub fn depth_function(&self) -> DepthFunction {
        self.depth_function
    }

    /// On: compare with `Less`. Off: no depth test.
    pub fn depth_test(&mut self, on: bool) {
        self.depth_function = if on { DepthFunction::Less } else { DepthFunction::Disabled };
    }

    pub fn set_render_target(&mut self, target: RenderTarget) {
        self.render_target = target;
    }

    pub fn render_target(&self) -> RenderTarget {
        self.render_target
    }

    /// Enables scissoring. `position`/`size` are in window pixels and get scaled to
    /// the viewport, which differs from the window on high-DPI displays.
    pub fn scissor_on(&mut self, position: IVec2, size: IVec2) {
        let viewport = self.backend.viewport_size();
        let ratio = if self.window_size.x == 0 || self.window_size.y == 0 || viewport == UVec2::ZERO {
            Vec2::ONE
        } else {
            viewport.as_vec2() / self.window_size.as_vec2()
        };
        self.scissor = Some(ScissorRect {
            position: (position.as_vec2() * ratio).as_ivec2(),
            size: (size.as_vec2() * ratio).as_ivec2(),
        });
    }

    pub fn scissor_off(&mut self) {
        self.scissor = None;
    }

    pub fn scissor(&self) -> Option<ScissorRect> {
        self.scissor
    }

    /// Records which textures are bound to units 0..n for the next draw.
    pub fn set_texture_units(&mut self, handles: Vec<TextureHandle>) {
        self.texture_units = handles;
    }

    pub fn texture_units(&self) -> &[TextureHandle] {
        &self.texture_units
    }

    // ── Uniforms ─────────────────────────────────────────────────────────

    pub fn model_view_projection(&self) -> Mat4 {
        self.model_view_projection
    }

    pub fn set_model_view_projection(&mut self, mvp: Mat4) {
        self.model_view_projection = mvp;
    }

    /// Object to world transform only.
    pub fn model(&self) -> Mat4 {
        self.model
    }

    pub fn set_model(&mut self, model: Mat4) {
        self.model = model;
    }

    pub fn color(&self) -> Vec4 {
        self.color
    }

    pub fn set_color(&mut self, color: Vec4) {
        self.color = color;
    }

    pub fn light_pos(&self) -> Vec3 {
        self.light_pos
    }

    pub fn set_light_pos(&mut self, light_pos: Vec3) {
        self.light_pos = light_pos;
    }

    pub fn camera_pos(&self) -> Vec3 {
        self.camera_pos
    }

    pub fn set_camera_pos(&mut self, camera_pos: Vec3) {
        self.camera_pos = camera_pos;
    }

    /// Copies the bone palette used for skinning by the next draws.
    pub fn set_animation(&mut self, bone_transforms: &[Mat4]) {
        self.bone_transforms.clear();
        self.bone_transforms.extend_from_slice(bone_transforms);
    }

    pub fn set_bone_transforms(&mut self, bone_transforms: Vec<Mat4>) {
        self.bone_transforms = bone_transforms;
    }

    pub fn bone_transforms(&self) -> &[Mat4] {
        &self.bone_transforms
    }

    pub fn num_bones(&self) -> usize {
        self.bone_transforms.len()
    }

    // ── Process-wide overrides ───────────────────────────────────────────

    pub fn force_blend_mode(&self) -> Option<BlendMode> {
        self.force_blend_mode
    }

    /// Process-wide diagnostic override: every later `set_blend_mode` call, including
    /// the ones materials make, uses this mode instead. `None` clears it.
    pub fn set_force_blend_mode(&mut self, mode: Option<BlendMode>) {
        self.force_blend_mode = mode;
    }

    pub fn override_pixel_shader(&self) -> Option<&str> {
        self.override_pixel_shader.as_deref()
    }

    /// Process-wide diagnostic override: every shader compiled afterwards uses this
    /// pixel stage instead of its own. Already linked shaders are unaffected.
    pub fn set_override_pixel_shader(&mut self, source: Option<String>) {
        self.override_pixel_shader = source;
    }

    // ── Queries ──────────────────────────────────────────────────────────

    pub fn window_size(&self) -> UVec2 {
        self.window_size
    }

    pub fn set_window_size(&mut self, size: UVec2) {
        self.window_size = size;
    }

    pub fn window_title(&self) -> &str {
        &self.window_title
    }

    /// Seconds since program start as of the last `advance_frame`.
    pub fn time(&self) -> f64 {
        self.time
    }

    pub fn frame_count(&self) -> u64 {
        self.frame_count
    }

    pub fn feature_level(&self) -> FeatureLevel {
        self.feature_level
    }

    /// Individual float uniform slots available to the vertex stage (a mat4 uses 16).
    pub fn max_vertex_uniform_components(&self) -> u32 {
        self.max_vertex_uniform_components
    }

    pub fn backend_name(&self) -> &'static str {
        self.backend.name()
    }
}

impl Drop for Renderer {
    fn drop(&mut self) {
        self.shut_down();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shader::tests::{FRAGMENT_WGSL, VERTEX_WGSL};
    use crate::shader::Uniform;

    fn ready() -> (Renderer, HeadlessProbe) {
        let (mut r, probe) = Renderer::headless(HeadlessOptions::default(), RendererConfig::default());
        r.initialize(UVec2::new(320, 240), "tests").unwrap();
        (r, probe)
    }

    #[test]
    fn test_initialize_prefers_level_30() {
        let (r, probe) = ready();
        assert_eq!(r.feature_level(), FeatureLevel::Level30);
        assert_eq!(r.window_size(), UVec2::new(320, 240));
        assert_eq!(r.max_vertex_uniform_components(), 1024);
        assert_eq!(probe.lock().title, "tests");
    }

    #[test]
    fn test_initialize_falls_back_to_level_20() {
        let options = HeadlessOptions::default().with_max_feature_level(FeatureLevel::Level20);
        let (mut r, _probe) = Renderer::headless(options, RendererConfig::default());
        r.initialize(UVec2::new(64, 64), "fallback").unwrap();
        assert_eq!(r.feature_level(), FeatureLevel::Level20);
    }

    #[test]
    fn test_initialize_without_fallback_fails() {
        let options = HeadlessOptions::default().with_max_feature_level(FeatureLevel::Level20);
        let (mut r, _probe) = Renderer::headless(options, RendererConfig::default().without_fallback());
        let err = r.initialize(UVec2::new(64, 64), "strict").unwrap_err();
        assert!(matches!(err, Error::ContextCreation(_)));
        assert!(!r.is_initialized());
    }

    #[test]
    fn test_context_failure_sets_last_error() {
        let (mut r, _probe) = Renderer::headless(HeadlessOptions::default().with_context_failure(), RendererConfig::default());
        assert!(r.initialize(UVec2::new(64, 64), "none").is_err());
        assert!(r.last_error().contains("context creation failed"));
        assert!(r.create_texture(&[0; 4], UVec2::ONE, false, false, TextureFormat::Auto).is_err());
    }

    #[test]
    fn test_initialize_twice_is_rejected() {
        let (mut r, probe) = ready();
        assert!(r.initialize(UVec2::new(10, 10), "again").is_err());
        assert_eq!(probe.lock().contexts_created, 1);
        r.shut_down();
        r.initialize(UVec2::new(10, 10), "again").unwrap();
        assert_eq!(probe.lock().contexts_created, 2);
    }

    #[test]
    fn test_power_of_two_textures_succeed() {
        let (mut r, _probe) = ready();
        for w in [1u32, 2, 4, 8, 16, 64, 256] {
            for h in [1u32, 2, 32, 128] {
                let pixels = vec![7u8; (w * h * 4) as usize];
                let handle = r.create_texture(&pixels, UVec2::new(w, h), true, true, TextureFormat::Auto);
                assert!(handle.unwrap().is_valid(), "{}x{}", w, h);
            }
        }
    }

    #[test]
    fn test_non_power_of_two_textures_fail() {
        let (mut r, probe) = ready();
        for (w, h) in [(3u32, 4u32), (4, 3), (6, 6), (100, 64), (255, 256)] {
            r.set_last_error("");
            let pixels = vec![0u8; (w * h * 4) as usize];
            let err = r
                .create_texture(&pixels, UVec2::new(w, h), false, false, TextureFormat::Auto)
                .unwrap_err();
            assert!(err.is_invalid_dimensions());
            assert!(!r.last_error().is_empty());
        }
        assert_eq!(probe.lock().texture_count(), 0);
    }

    #[test]
    fn test_auto_format_and_fallback() {
        let (mut r, probe) = ready();
        let px = vec![255u8; 16];
        let alpha = r.create_texture(&px, UVec2::new(2, 2), true, false, TextureFormat::Auto).unwrap();
        let opaque = r.create_texture(&px, UVec2::new(2, 2), false, false, TextureFormat::Auto).unwrap();
        let state = probe.lock();
        assert_eq!(state.texture(alpha).unwrap().format, TextureFormat::Rgba5551);
        assert_eq!(state.texture(opaque).unwrap().format, TextureFormat::Rgb565);
        assert_eq!(state.texture(opaque).unwrap().levels[0].len(), 8);
        drop(state);

        let (mut plain, plain_probe) = Renderer::headless(HeadlessOptions::default().without_packed_formats(), RendererConfig::default());
        plain.initialize(UVec2::new(8, 8), "plain").unwrap();
        let h = plain.create_texture(&px, UVec2::new(2, 2), true, false, TextureFormat::Auto).unwrap();
        assert_eq!(plain_probe.lock().texture(h).unwrap().format, TextureFormat::Rgba8888);
    }

    #[test]
    fn test_update_texture_rows_only() {
        let (mut r, probe) = ready();
        let h = r
            .create_texture(&vec![0u8; 4 * 4 * 4], UVec2::new(4, 4), true, false, TextureFormat::Rgba8888)
            .unwrap();
        let err = r.update_texture(h, TextureFormat::Rgba8888, 1, 0, 3, 1, &[0; 12]).unwrap_err();
        assert!(matches!(err, Error::SubRowUpdate { .. }));
        assert!(r.last_error().contains("sub-row"));
        let err = r.update_texture(h, TextureFormat::Rgba8888, 0, 0, 2, 1, &[0; 8]).unwrap_err();
        assert!(matches!(err, Error::SubRowUpdate { .. }));

        r.update_texture(h, TextureFormat::Rgba8888, 0, 2, 4, 2, &[9; 32]).unwrap();
        let state = probe.lock();
        let base = &state.texture(h).unwrap().levels[0];
        assert!(base[..32].iter().all(|b| *b == 0));
        assert!(base[32..].iter().all(|b| *b == 9));
    }

    #[test]
    fn test_update_rows_past_u32_range_rejected() {
        let (mut r, probe) = ready();
        let h = r
            .create_texture(&vec![7u8; 4 * 4 * 4], UVec2::new(4, 4), true, false, TextureFormat::Rgba8888)
            .unwrap();
        let err = r.update_texture(h, TextureFormat::Rgba8888, 0, u32::MAX, 4, 2, &[0; 32]).unwrap_err();
        assert!(matches!(err, Error::InvalidState(_)));
        assert!(r.last_error().contains("exceed texture height"));
        let err = r.update_texture(h, TextureFormat::Rgba8888, 0, 1, 4, u32::MAX, &[0; 32]).unwrap_err();
        assert!(matches!(err, Error::InvalidState(_)));

        let state = probe.lock();
        assert!(state.texture(h).unwrap().levels[0].iter().all(|b| *b == 7));
    }

    #[test]
    fn test_compressed_textures_need_backend_support() {
        let (mut r, probe) = ready();
        let blocks = vec![vec![1u8; 4 * 8], vec![2u8; 8]];
        let err = r
            .create_compressed_texture(CompressedFormat::Bc1Rgba, UVec2::new(8, 8), &blocks, TextureFlags::default())
            .unwrap_err();
        assert!(err.is_unsupported_format());
        assert!(r.last_error().contains("Bc1Rgba"));
        assert_eq!(probe.lock().texture_count(), 0);

        let options = HeadlessOptions::default().with_compressed_formats(&[CompressedFormat::Bc1Rgba]);
        let (mut r, probe) = Renderer::headless(options, RendererConfig::default());
        r.initialize(UVec2::new(64, 64), "bc").unwrap();
        let h = r
            .create_compressed_texture(CompressedFormat::Bc1Rgba, UVec2::new(8, 8), &blocks, TextureFlags::default())
            .unwrap();
        let info = r.texture_info(h).unwrap();
        assert_eq!(info.format, TextureFormat::Native);
        assert_eq!(info.compressed, Some(CompressedFormat::Bc1Rgba));
        assert_eq!(info.mip_levels, 2);
        let err = r.update_texture(h, TextureFormat::Rgba8888, 0, 0, 8, 1, &[0; 32]).unwrap_err();
        assert!(matches!(err, Error::InvalidState(_)));
        assert_eq!(probe.lock().texture(h).unwrap().levels[0], vec![1u8; 32]);

        let cube = TextureFlags { cube_map: true, ..TextureFlags::default() };
        let err = r
            .create_compressed_texture(CompressedFormat::Bc1Rgba, UVec2::new(8, 48), &blocks, cube)
            .unwrap_err();
        assert!(err.is_unsupported_format());
    }

    #[test]
    fn test_cube_map_strip_is_split_into_faces() {
        let (mut r, probe) = ready();
        let cube = TextureFlags { cube_map: true, ..TextureFlags::default() };
        let strip = vec![3u8; 2 * 12 * 4];
        let h = r
            .create_texture_with_flags(&strip, UVec2::new(2, 12), true, false, TextureFormat::Rgba8888, cube)
            .unwrap();
        let state = probe.lock();
        let stored = state.texture(h).unwrap();
        assert_eq!((stored.width, stored.height), (2, 2));
        assert_eq!(stored.levels.len(), 1);
        drop(state);

        let err = r
            .create_texture_with_flags(&vec![0u8; 2 * 10 * 4], UVec2::new(2, 10), true, false, TextureFormat::Auto, cube)
            .unwrap_err();
        assert!(err.is_invalid_dimensions());
        assert!(r.update_texture(h, TextureFormat::Rgba8888, 0, 0, 2, 1, &[0; 8]).is_err());
    }

    #[test]
    fn test_update_converts_rgba_into_packed_storage() {
        let (mut r, probe) = ready();
        let h = r
            .create_texture(&vec![0u8; 2 * 2 * 4], UVec2::new(2, 2), true, false, TextureFormat::Rgba5551)
            .unwrap();
        r.update_texture(h, TextureFormat::Rgba8888, 0, 0, 2, 1, &[255; 8]).unwrap();
        let state = probe.lock();
        assert_eq!(&state.texture(h).unwrap().levels[0][..4], &[0xFF; 4]);
    }

    #[test]
    fn test_advance_frame_updates_time_and_presents() {
        let (mut r, probe) = ready();
        r.set_depth_function(DepthFunction::Always);
        r.advance_frame(false, 1.5);
        r.advance_frame(true, 1.6);
        assert_eq!(r.time(), 1.6);
        assert_eq!(r.depth_function(), DepthFunction::Less);
        let state = probe.lock();
        assert_eq!(state.frames_presented, 1);
        assert_eq!(state.frames_skipped, 1);
    }

    #[test]
    fn test_force_blend_mode_overrides_requests() {
        let (mut r, _probe) = ready();
        r.set_blend_mode(BlendMode::Alpha);
        assert_eq!(r.blend_mode(), BlendMode::Alpha);
        r.set_force_blend_mode(Some(BlendMode::Off));
        r.set_blend_mode(BlendMode::Add);
        assert_eq!(r.blend_mode(), BlendMode::Off);
        r.set_force_blend_mode(None);
        r.set_blend_mode_with_amount(BlendMode::Test, 0.25);
        assert_eq!(r.blend_mode(), BlendMode::Test);
        assert_eq!(r.blend_amount(), 0.25);
    }

    #[test]
    fn test_blend_states() {
        assert!(BlendMode::Off.blend_state().is_none());
        assert!(BlendMode::Test.blend_state().is_none());
        assert_eq!(BlendMode::Alpha.blend_state(), Some(wgpu::BlendState::ALPHA_BLENDING));
        let add = BlendMode::Add.blend_state().unwrap();
        assert_eq!(add.color.dst_factor, wgpu::BlendFactor::One);
    }

    #[test]
    fn test_state_setters_do_not_validate() {
        let (mut r, _probe) = ready();
        r.set_culling(CullingMode::FrontAndBack);
        r.depth_test(false);
        r.set_render_target(RenderTarget::Texture(TextureHandle::invalid()));
        assert_eq!(r.culling(), CullingMode::FrontAndBack);
        assert_eq!(r.depth_function(), DepthFunction::Disabled);
        assert_eq!(r.depth_function().compare_function(), None);
        r.depth_test(true);
        assert_eq!(r.depth_function().compare_function(), Some(wgpu::CompareFunction::Less));
    }

    #[test]
    fn test_scissor_scales_to_viewport() {
        let (mut r, _probe) = ready();
        r.set_window_size(UVec2::new(160, 120));
        r.scissor_on(IVec2::new(10, 20), IVec2::new(30, 40));
        assert_eq!(
            r.scissor(),
            Some(ScissorRect { position: IVec2::new(20, 40), size: IVec2::new(60, 80) })
        );
        r.scissor_off();
        assert!(r.scissor().is_none());
    }

    #[test]
    fn test_shader_compile_failure_sets_last_error() {
        let (mut r, _probe) = ready();
        assert!(r.compile_and_link_shader("not wgsl at all", FRAGMENT_WGSL).is_err());
        assert!(r.last_error().contains("vertex shader compile error"));
    }

    #[test]
    fn test_shader_uniform_upload() {
        let (mut r, probe) = ready();
        let shader = r.compile_and_link_shader(VERTEX_WGSL, FRAGMENT_WGSL).unwrap();
        r.set_color(Vec4::new(0.25, 0.5, 0.75, 1.0));
        r.advance_frame(false, 2.0);
        shader.set(&mut r).unwrap();

        let color_loc = shader.uniform_location(Uniform::Color).unwrap();
        let state = probe.lock();
        let program = state.program(shader.program()).unwrap();
        let color = &program.uniforms[&(color_loc.group, color_loc.binding, color_loc.offset)];
        assert_eq!(color.as_slice(), bytemuck::bytes_of(&Vec4::new(0.25, 0.5, 0.75, 1.0)));
        let time = &program.uniforms[&(0, 0, 80)];
        assert_eq!(time.as_slice(), bytemuck::bytes_of(&2.0f32));
    }

    #[test]
    fn test_override_pixel_shader_applies_to_new_shaders() {
        let (mut r, probe) = ready();
        let solid = "@fragment\nfn fs_main(@location(0) uv: vec2<f32>) -> @location(0) vec4<f32> {\n    return vec4<f32>(uv, 0.0, 1.0);\n}\n";
        r.set_override_pixel_shader(Some(solid.to_string()));
        let shader = r.compile_and_link_shader(VERTEX_WGSL, FRAGMENT_WGSL).unwrap();
        assert!(shader.texture_units().is_empty());
        assert_eq!(probe.lock().program(shader.program()).unwrap().fragment_wgsl, solid);
    }

    #[test]
    fn test_recompile_swaps_program() {
        let (mut r, probe) = ready();
        let shader = r.compile_and_link_shader(VERTEX_WGSL, FRAGMENT_WGSL).unwrap();
        let before = shader.program();
        assert!(r.recompile_shader("broken", FRAGMENT_WGSL, &shader).is_err());
        assert_eq!(shader.program(), before);
        r.recompile_shader(VERTEX_WGSL, FRAGMENT_WGSL, &shader).unwrap();
        assert_ne!(shader.program(), before);
        assert!(probe.lock().program(before).is_none());
    }

    #[test]
    fn test_max_components_token_reaches_shader() {
        let (mut r, _probe) = ready();
        let vs = "const LIMIT: u32 = MAX_VERTEX_UNIFORM_COMPONENTS;\n@vertex\nfn vs_main(@location(0) position: vec3<f32>) -> @builtin(position) vec4<f32> {\n    return vec4<f32>(position, f32(LIMIT));\n}\n";
        let fs = "@fragment\nfn fs_main() -> @location(0) vec4<f32> {\n    return vec4<f32>(1.0);\n}\n";
        let shader = r.compile_and_link_shader(vs, fs).unwrap();
        assert_eq!(shader.attributes(), vec![crate::shader::VertexAttribute::Position]);
    }
}
