// src/gpu/wgpu_backend.rs
//! `wgpu` implementation of [`GraphicsBackend`].
//!
//! Window handling lives outside this crate, so the "window" here is an offscreen
//! colour + depth target of the requested size. Feature level 3.0 asks the device
//! for `wgpu::Limits::default()`, level 2.0 for the WebGL2 downlevel limits.

use std::borrow::Cow;
use std::collections::HashMap;

use glam::{UVec2, Vec4};

use super::{
    ContextInfo, FeatureLevel, GpuTextureDesc, GpuTextureInfo, GraphicsBackend, ProgramHandle,
    TextureHandle, TextureRows, TextureWrap,
};
use crate::context::OptionContext;
use crate::error::{Error, Result};
use crate::pixel_format::{CompressedFormat, TextureFormat};
use crate::shader::UniformWrite;
use crate::{bail, ensure};

const FRAMEBUFFER_FORMAT: wgpu::TextureFormat = wgpu::TextureFormat::Rgba8Unorm;
const DEPTH_FORMAT: wgpu::TextureFormat = wgpu::TextureFormat::Depth32Float;
/// Requested from the adapter whenever it offers them.
const COMPRESSION_FEATURES: wgpu::Features = wgpu::Features::TEXTURE_COMPRESSION_ETC2
    .union(wgpu::Features::TEXTURE_COMPRESSION_ASTC)
    .union(wgpu::Features::TEXTURE_COMPRESSION_BC);

struct GpuContext {
    device: wgpu::Device,
    queue: wgpu::Queue,
    adapter_name: String,
    color_view: wgpu::TextureView,
    depth_view: wgpu::TextureView,
    size: UVec2,
}

struct WgpuTexture {
    texture: wgpu::Texture,
    _sampler: wgpu::Sampler,
    info: GpuTextureInfo,
}

struct WgpuProgram {
    _vertex: wgpu::ShaderModule,
    _fragment: wgpu::ShaderModule,
    /// Uniform buffers keyed by (group, binding).
    uniform_buffers: HashMap<(u32, u32), wgpu::Buffer>,
}

pub struct WgpuBackend {
    instance: wgpu::Instance,
    power_preference: wgpu::PowerPreference,
    ctx: Option<GpuContext>,
    textures: HashMap<u32, WgpuTexture>,
    programs: HashMap<u32, WgpuProgram>,
    encoder: Option<wgpu::CommandEncoder>,
    next_id: u32,
}

impl WgpuBackend {
    pub fn new() -> Self {
        let instance = wgpu::Instance::new(wgpu::InstanceDescriptor {
            backends: wgpu::Backends::all(),
            ..Default::default()
        });
        Self {
            instance,
            power_preference: wgpu::PowerPreference::HighPerformance,
            ctx: None,
            textures: HashMap::new(),
            programs: HashMap::new(),
            encoder: None,
            next_id: 0,
        }
    }

    pub fn with_power_preference(mut self, preference: wgpu::PowerPreference) -> Self {
        self.power_preference = preference;
        self
    }

    fn alloc_id(&mut self) -> u32 {
        self.next_id += 1;
        self.next_id
    }

    fn ctx(&self) -> Result<&GpuContext> {
        self.ctx.as_ref().context("wgpu backend has no context")
    }

    fn limits_for(level: FeatureLevel, adapter: &wgpu::Adapter) -> wgpu::Limits {
        let base = match level {
            FeatureLevel::Level30 => wgpu::Limits::default(),
            FeatureLevel::Level20 => wgpu::Limits::downlevel_webgl2_defaults(),
        };
        base.using_resolution(adapter.limits())
    }

    fn create_target(device: &wgpu::Device, size: UVec2, format: wgpu::TextureFormat, label: &str) -> wgpu::TextureView {
        let texture = device.create_texture(&wgpu::TextureDescriptor {
            label: Some(label),
            size: wgpu::Extent3d {
                width: size.x.max(1),
                height: size.y.max(1),
                depth_or_array_layers: 1,
            },
            mip_level_count: 1,
            sample_count: 1,
            dimension: wgpu::TextureDimension::D2,
            format,
            usage: wgpu::TextureUsages::RENDER_ATTACHMENT | wgpu::TextureUsages::COPY_SRC,
            view_formats: &[],
        });
        texture.create_view(&wgpu::TextureViewDescriptor::default())
    }

    fn supports_features(&self, features: wgpu::Features) -> bool {
        self.ctx.as_ref().is_some_and(|ctx| ctx.device.features().contains(features))
    }
}

fn astc_block(block_width: u8, block_height: u8) -> Option<wgpu::AstcBlock> {
    use wgpu::AstcBlock::*;
    Some(match (block_width, block_height) {
        (4, 4) => B4x4,
        (5, 4) => B5x4,
        (5, 5) => B5x5,
        (6, 5) => B6x5,
        (6, 6) => B6x6,
        (8, 5) => B8x5,
        (8, 6) => B8x6,
        (8, 8) => B8x8,
        (10, 5) => B10x5,
        (10, 6) => B10x6,
        (10, 8) => B10x8,
        (10, 10) => B10x10,
        (12, 10) => B12x10,
        (12, 12) => B12x12,
        _ => return None,
    })
}

/// The wgpu format for a block format and the device feature it needs.
fn compressed_to_wgpu(format: CompressedFormat) -> Option<(wgpu::TextureFormat, wgpu::Features)> {
    let etc2 = wgpu::Features::TEXTURE_COMPRESSION_ETC2;
    let bc = wgpu::Features::TEXTURE_COMPRESSION_BC;
    Some(match format {
        CompressedFormat::Etc2Rgb8 => (wgpu::TextureFormat::Etc2Rgb8Unorm, etc2),
        CompressedFormat::Etc2Rgb8A1 => (wgpu::TextureFormat::Etc2Rgb8A1Unorm, etc2),
        CompressedFormat::Etc2Rgba8 => (wgpu::TextureFormat::Etc2Rgba8Unorm, etc2),
        CompressedFormat::Astc { block_width, block_height } => (
            wgpu::TextureFormat::Astc {
                block: astc_block(block_width, block_height)?,
                channel: wgpu::AstcChannel::Unorm,
            },
            wgpu::Features::TEXTURE_COMPRESSION_ASTC,
        ),
        CompressedFormat::Bc1Rgba => (wgpu::TextureFormat::Bc1RgbaUnorm, bc),
        CompressedFormat::Bc3Rgba => (wgpu::TextureFormat::Bc3RgbaUnorm, bc),
        CompressedFormat::Bc7Rgba => (wgpu::TextureFormat::Bc7RgbaUnorm, bc),
    })
}

fn address_mode(wrap: TextureWrap) -> wgpu::AddressMode {
    match wrap {
        TextureWrap::Repeat => wgpu::AddressMode::Repeat,
        TextureWrap::ClampToEdge => wgpu::AddressMode::ClampToEdge,
    }
}

impl Default for WgpuBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl GraphicsBackend for WgpuBackend {
    fn name(&self) -> &'static str {
        "wgpu"
    }

    fn create_context(&mut self, size: UVec2, title: &str, level: FeatureLevel) -> Result<ContextInfo> {
        let adapter = pollster::block_on(self.instance.request_adapter(&wgpu::RequestAdapterOptions {
            power_preference: self.power_preference,
            force_fallback_adapter: false,
            compatible_surface: None,
        }))
        .ok_or_else(|| Error::ContextCreation("no suitable graphics adapter".into()))?;

        let limits = Self::limits_for(level, &adapter);
        let (device, queue) = pollster::block_on(adapter.request_device(
            &wgpu::DeviceDescriptor {
                label: Some(title),
                required_features: adapter.features() & COMPRESSION_FEATURES,
                required_limits: limits.clone(),
                memory_hints: wgpu::MemoryHints::Performance,
            },
            None,
        ))
        .map_err(|e| Error::ContextCreation(format!("{:?}: {}", level, e)))?;

        let adapter_name = adapter.get_info().name;
        let color_view = Self::create_target(&device, size, FRAMEBUFFER_FORMAT, "framebuffer");
        let depth_view = Self::create_target(&device, size, DEPTH_FORMAT, "depth buffer");
        log::info!("wgpu context on {} at {:?}", adapter_name, level);

        self.ctx = Some(GpuContext {
            device,
            queue,
            adapter_name: adapter_name.clone(),
            color_view,
            depth_view,
            size,
        });
        Ok(ContextInfo {
            feature_level: level,
            max_vertex_uniform_components: limits.max_uniform_buffer_binding_size / 4,
            viewport_size: size,
            adapter_name,
        })
    }

    fn destroy_context(&mut self) {
        self.encoder = None;
        self.textures.clear();
        self.programs.clear();
        if let Some(ctx) = self.ctx.take() {
            log::debug!("releasing wgpu context on {}", ctx.adapter_name);
        }
    }

    fn has_context(&self) -> bool {
        self.ctx.is_some()
    }

    fn supports_format(&self, format: TextureFormat) -> bool {
        // wgpu exposes no 16-bit packed or 24-bit colour formats.
        matches!(format, TextureFormat::Rgba8888 | TextureFormat::Luminance)
    }

    fn supports_compressed(&self, format: CompressedFormat) -> bool {
        compressed_to_wgpu(format).is_some_and(|(_, feature)| self.supports_features(feature))
    }

    fn create_texture(&mut self, desc: &GpuTextureDesc<'_>) -> Result<TextureHandle> {
        // (wgpu format, block width, block height, bytes per block)
        let (format, bw, bh, block_bytes) = match desc.compressed {
            Some(compressed) => {
                ensure!(
                    self.supports_compressed(compressed),
                    Error::UnsupportedImageFormat(format!("{:?} not supported by this device", compressed))
                );
                let (format, _) = compressed_to_wgpu(compressed)
                    .ok_or_else(|| Error::UnsupportedImageFormat(format!("{:?}", compressed)))?;
                let (bw, bh) = compressed.block_size();
                ensure!(
                    desc.width % bw == 0 && desc.height % bh == 0,
                    Error::InvalidTextureDimensions {
                        width: desc.width,
                        height: desc.height
                    }
                );
                (format, bw, bh, compressed.bytes_per_block())
            }
            None => {
                ensure!(
                    self.supports_format(desc.format),
                    Error::InvalidState(format!("format {:?} not supported by wgpu", desc.format))
                );
                let format = match desc.format {
                    TextureFormat::Luminance => wgpu::TextureFormat::R8Unorm,
                    _ => wgpu::TextureFormat::Rgba8Unorm,
                };
                (format, 1, 1, desc.format.bytes_per_pixel())
            }
        };
        let layers = desc.flags.layers();
        let ctx = self.ctx()?;
        let texture = ctx.device.create_texture(&wgpu::TextureDescriptor {
            label: Some(desc.label),
            size: wgpu::Extent3d {
                width: desc.width,
                height: desc.height,
                depth_or_array_layers: layers,
            },
            mip_level_count: desc.levels.len().max(1) as u32,
            sample_count: 1,
            dimension: wgpu::TextureDimension::D2,
            format,
            usage: wgpu::TextureUsages::TEXTURE_BINDING | wgpu::TextureUsages::COPY_DST,
            view_formats: &[],
        });

        let (mut w, mut h) = (desc.width, desc.height);
        for (level, bytes) in desc.levels.iter().enumerate() {
            // Copies cover whole blocks, so small levels use their physical size.
            let blocks_x = w.div_ceil(bw);
            let blocks_y = h.div_ceil(bh);
            ctx.queue.write_texture(
                wgpu::ImageCopyTexture {
                    aspect: wgpu::TextureAspect::All,
                    texture: &texture,
                    mip_level: level as u32,
                    origin: wgpu::Origin3d::ZERO,
                },
                bytes,
                wgpu::ImageDataLayout {
                    offset: 0,
                    bytes_per_row: Some(blocks_x * block_bytes),
                    rows_per_image: Some(blocks_y),
                },
                wgpu::Extent3d {
                    width: blocks_x * bw,
                    height: blocks_y * bh,
                    depth_or_array_layers: layers,
                },
            );
            w = (w / 2).max(1);
            h = (h / 2).max(1);
        }

        let mode = address_mode(desc.flags.wrap);
        let sampler = ctx.device.create_sampler(&wgpu::SamplerDescriptor {
            label: Some(desc.label),
            address_mode_u: mode,
            address_mode_v: mode,
            address_mode_w: mode,
            mag_filter: wgpu::FilterMode::Linear,
            min_filter: wgpu::FilterMode::Linear,
            mipmap_filter: if desc.levels.len() > 1 {
                wgpu::FilterMode::Linear
            } else {
                wgpu::FilterMode::Nearest
            },
            ..Default::default()
        });

        let info = GpuTextureInfo {
            width: desc.width,
            height: desc.height,
            format: desc.format,
            compressed: desc.compressed,
            flags: desc.flags,
            mip_levels: desc.levels.len() as u32,
        };
        let id = self.alloc_id();
        self.textures.insert(
            id,
            WgpuTexture {
                texture,
                _sampler: sampler,
                info,
            },
        );
        Ok(TextureHandle::new(id))
    }

    fn update_texture(&mut self, handle: TextureHandle, rows: &TextureRows<'_>) -> Result<()> {
        let ctx = self.ctx()?;
        let Some(entry) = self.textures.get(&handle.raw()) else {
            bail!(Error::InvalidState(format!("unknown texture {}", handle.raw())));
        };
        ensure!(
            entry.info.compressed.is_none() && !entry.info.flags.cube_map,
            Error::InvalidState("only plain 2D textures take row updates".into())
        );
        let width = entry.info.width;
        let bytes_per_pixel = entry.info.format.bytes_per_pixel();
        ctx.queue.write_texture(
            wgpu::ImageCopyTexture {
                aspect: wgpu::TextureAspect::All,
                texture: &entry.texture,
                mip_level: 0,
                origin: wgpu::Origin3d {
                    x: 0,
                    y: rows.y_offset,
                    z: 0,
                },
            },
            rows.data,
            wgpu::ImageDataLayout {
                offset: 0,
                bytes_per_row: Some(bytes_per_pixel * width),
                rows_per_image: Some(rows.rows),
            },
            wgpu::Extent3d {
                width,
                height: rows.rows,
                depth_or_array_layers: 1,
            },
        );
        Ok(())
    }

    fn texture_info(&self, handle: TextureHandle) -> Option<GpuTextureInfo> {
        self.textures.get(&handle.raw()).map(|t| t.info)
    }

    fn delete_texture(&mut self, handle: TextureHandle) {
        if let Some(entry) = self.textures.remove(&handle.raw()) {
            entry.texture.destroy();
        }
    }

    fn create_program(&mut self, label: &str, vertex_wgsl: &str, fragment_wgsl: &str) -> Result<ProgramHandle> {
        let ctx = self.ctx()?;
        ctx.device.push_error_scope(wgpu::ErrorFilter::Validation);
        let vertex = ctx.device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some(label),
            source: wgpu::ShaderSource::Wgsl(Cow::Borrowed(vertex_wgsl)),
        });
        let fragment = ctx.device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some(label),
            source: wgpu::ShaderSource::Wgsl(Cow::Borrowed(fragment_wgsl)),
        });
        if let Some(err) = pollster::block_on(ctx.device.pop_error_scope()) {
            bail!(Error::ShaderLink(err.to_string()));
        }

        let id = self.alloc_id();
        self.programs.insert(
            id,
            WgpuProgram {
                _vertex: vertex,
                _fragment: fragment,
                uniform_buffers: HashMap::new(),
            },
        );
        Ok(ProgramHandle::new(id))
    }

    fn delete_program(&mut self, program: ProgramHandle) {
        if let Some(entry) = self.programs.remove(&program.raw()) {
            for buffer in entry.uniform_buffers.values() {
                buffer.destroy();
            }
        }
    }

    fn write_uniforms(&mut self, program: ProgramHandle, writes: &[UniformWrite]) -> Result<()> {
        let ctx = self
            .ctx
            .as_ref()
            .ok_or_else(|| Error::InvalidState("wgpu backend has no context".into()))?;
        let Some(entry) = self.programs.get_mut(&program.raw()) else {
            bail!(Error::InvalidState(format!("unknown program {}", program.raw())));
        };
        for write in writes {
            let loc = write.location;
            let buffer = entry
                .uniform_buffers
                .entry((loc.group, loc.binding))
                .or_insert_with(|| {
                    ctx.device.create_buffer(&wgpu::BufferDescriptor {
                        label: Some("uniform block"),
                        size: (loc.block_size as u64).max(16).next_multiple_of(16),
                        usage: wgpu::BufferUsages::UNIFORM | wgpu::BufferUsages::COPY_DST,
                        mapped_at_creation: false,
                    })
                });
            ctx.queue.write_buffer(buffer, loc.offset as u64, &write.data);
        }
        Ok(())
    }

    fn clear(&mut self, color: Option<Vec4>, depth: bool) {
        let Some(ctx) = self.ctx.as_ref() else {
            return;
        };
        let mut encoder = self.encoder.take().unwrap_or_else(|| {
            ctx.device.create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("frame encoder"),
            })
        });
        let load = match color {
            Some(c) => wgpu::LoadOp::Clear(wgpu::Color {
                r: c.x as f64,
                g: c.y as f64,
                b: c.z as f64,
                a: c.w as f64,
            }),
            None => wgpu::LoadOp::Load,
        };
        let depth_load = if depth {
            wgpu::LoadOp::Clear(1.0)
        } else {
            wgpu::LoadOp::Load
        };
        let pass = encoder.begin_render_pass(&wgpu::RenderPassDescriptor {
            label: Some("clear"),
            color_attachments: &[Some(wgpu::RenderPassColorAttachment {
                view: &ctx.color_view,
                resolve_target: None,
                ops: wgpu::Operations {
                    load,
                    store: wgpu::StoreOp::Store,
                },
            })],
            depth_stencil_attachment: Some(wgpu::RenderPassDepthStencilAttachment {
                view: &ctx.depth_view,
                depth_ops: Some(wgpu::Operations {
                    load: depth_load,
                    store: wgpu::StoreOp::Store,
                }),
                stencil_ops: None,
            }),
            timestamp_writes: None,
            occlusion_query_set: None,
        });
        drop(pass);
        self.encoder = Some(encoder);
    }

    fn present(&mut self, minimized: bool) {
        let encoder = self.encoder.take();
        let Some(ctx) = self.ctx.as_ref() else {
            return;
        };
        if let Some(encoder) = encoder {
            ctx.queue.submit(Some(encoder.finish()));
        }
        if !minimized {
            let _ = ctx.device.poll(wgpu::Maintain::Poll);
        }
    }

    fn viewport_size(&self) -> UVec2 {
        self.ctx.as_ref().map(|c| c.size).unwrap_or(UVec2::ZERO)
    }
}
