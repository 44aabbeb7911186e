// src/materials/material_manager.rs
//! Filename-keyed caches for shaders, textures and materials.
//!
//! A filename resolves to the same live instance until it is unloaded. A texture is
//! cached as soon as it is requested, before it is Resident.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use crate::async_loader::{AsyncLoader, LoaderConfig};
use crate::context::Context;
use crate::error::{Error, Result};
use crate::materials::descriptor::MaterialDescriptor;
use crate::materials::material::Material;
use crate::pixel_format::TextureFormat;
use crate::renderer::Renderer;
use crate::shader::Shader;
use crate::texture::{Texture, TextureConfig};

/// What `unload_material` does with the material's textures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum UnloadPolicy {
    /// Evict every texture the material references, even ones other loaded
    /// materials still use. Those materials then bind invalid handles.
    #[default]
    EvictAll,
    /// Evict a texture only when no loaded material references it any more.
    RetainShared,
}

#[derive(Debug, Clone)]
pub struct MaterialManagerConfig {
    /// Directory every filename is resolved against.
    pub asset_root: PathBuf,
    pub vertex_suffix: String,
    pub fragment_suffix: String,
    pub unload_policy: UnloadPolicy,
    pub generate_mipmaps: bool,
    pub loader: LoaderConfig,
}

impl Default for MaterialManagerConfig {
    fn default() -> Self {
        Self {
            asset_root: PathBuf::from("."),
            vertex_suffix: ".vert.wgsl".to_string(),
            fragment_suffix: ".frag.wgsl".to_string(),
            unload_policy: UnloadPolicy::default(),
            generate_mipmaps: true,
            loader: LoaderConfig::default(),
        }
    }
}

impl MaterialManagerConfig {
    pub fn with_asset_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.asset_root = root.into();
        self
    }

    pub fn with_unload_policy(mut self, policy: UnloadPolicy) -> Self {
        self.unload_policy = policy;
        self
    }

    pub fn with_mipmaps(mut self, mipmaps: bool) -> Self {
        self.generate_mipmaps = mipmaps;
        self
    }

    pub fn with_loader(mut self, loader: LoaderConfig) -> Self {
        self.loader = loader;
        self
    }
}

pub struct MaterialManager {
    config: MaterialManagerConfig,
    loader: AsyncLoader,
    shaders: HashMap<String, Arc<Shader>>,
    textures: HashMap<String, Arc<Texture>>,
    materials: HashMap<String, Arc<Material>>,
    /// Loaded materials referencing each cached texture.
    texture_refs: HashMap<String, usize>,
}

impl MaterialManager {
    pub fn new(config: MaterialManagerConfig) -> Self {
        let loader = AsyncLoader::new(config.loader.clone());
        Self {
            config,
            loader,
            shaders: HashMap::new(),
            textures: HashMap::new(),
            materials: HashMap::new(),
            texture_refs: HashMap::new(),
        }
    }

    pub fn config(&self) -> &MaterialManagerConfig {
        &self.config
    }

    fn resolve(&self, filename: &str) -> PathBuf {
        self.config.asset_root.join(filename)
    }

    /// Reads an asset file, recording `couldn't load: <file>` on failure.
    fn read_asset(&self, renderer: &mut Renderer, filename: &str) -> Result<Vec<u8>> {
        Error::read_file(self.resolve(filename)).map_err(|err| {
            log::error!("can't load {}: {}", filename, err);
            renderer.set_last_error(format!("couldn't load: {}", filename));
            err
        })
    }

    // ── Shaders ──────────────────────────────────────────────────────────

    pub fn find_shader(&self, basename: &str) -> Option<Arc<Shader>> {
        self.shaders.get(basename).cloned()
    }

    /// Loads `<basename><vertex_suffix>` + `<basename><fragment_suffix>` and links them.
    ///
    /// On failure the cache is left untouched and the reason is in the renderer's
    /// `last_error`.
    pub fn load_shader(&mut self, renderer: &mut Renderer, basename: &str) -> Result<Arc<Shader>> {
        if let Some(shader) = self.find_shader(basename) {
            return Ok(shader);
        }
        let vs_file = format!("{}{}", basename, self.config.vertex_suffix);
        let ps_file = format!("{}{}", basename, self.config.fragment_suffix);
        let vs = self.read_source(renderer, &vs_file)?;
        let ps = self.read_source(renderer, &ps_file)?;

        let shader = match renderer.compile_and_link_shader_named(basename, &vs, &ps) {
            Ok(shader) => Arc::new(shader),
            Err(err) => {
                log::error!("shader error in {}:\n{}", basename, renderer.last_error());
                return Err(err);
            }
        };
        self.shaders.insert(basename.to_string(), Arc::clone(&shader));
        Ok(shader)
    }

    fn read_source(&self, renderer: &mut Renderer, filename: &str) -> Result<String> {
        let bytes = self.read_asset(renderer, filename)?;
        String::from_utf8(bytes).map_err(|_| {
            renderer.set_last_error(format!("couldn't load: {} is not UTF-8", filename));
            Error::InvalidState(format!("{} is not UTF-8", filename))
        })
    }

    // ── Textures ─────────────────────────────────────────────────────────

    pub fn find_texture(&self, filename: &str) -> Option<Arc<Texture>> {
        self.textures.get(filename).cloned()
    }

    /// Returns the cached texture or creates one and queues it for decoding.
    ///
    /// `format` only applies when the texture is not cached yet.
    pub fn load_texture(&mut self, filename: &str, format: TextureFormat) -> Arc<Texture> {
        let config = TextureConfig::default()
            .with_format(format)
            .with_mipmaps(self.config.generate_mipmaps);
        self.load_texture_with(filename, config)
    }

    /// [`load_texture`](Self::load_texture) with a full config, wrap and cube flags included.
    pub fn load_texture_with(&mut self, filename: &str, config: TextureConfig) -> Arc<Texture> {
        if let Some(texture) = self.find_texture(filename) {
            return texture;
        }
        let texture = Arc::new(Texture::new(filename, self.resolve(filename), config));
        self.loader.queue_job(Arc::clone(&texture));
        self.textures.insert(filename.to_string(), Arc::clone(&texture));
        texture
    }

    // ── Materials ────────────────────────────────────────────────────────

    pub fn find_material(&self, filename: &str) -> Option<Arc<Material>> {
        self.materials.get(filename).cloned()
    }

    /// Reads a material descriptor and loads every texture it names, in file order.
    pub fn load_material(&mut self, renderer: &mut Renderer, filename: &str) -> Result<Arc<Material>> {
        if let Some(material) = self.find_material(filename) {
            return Ok(material);
        }
        let bytes = self.read_asset(renderer, filename)?;
        let descriptor = MaterialDescriptor::from_slice(&bytes)
            .and_then(|d| d.blend_mode.to_renderer().map(|mode| (d, mode)))
            .loading(filename)
            .map_err(|err| {
                renderer.set_last_error(err.to_string());
                err
            });
        let (descriptor, blend_mode) = descriptor?;

        let mut material = Material::new(filename, blend_mode);
        for (i, name) in descriptor.texture_filenames.iter().enumerate() {
            let mut config = TextureConfig::default()
                .with_format(descriptor.format_for(i))
                .with_mipmaps(self.config.generate_mipmaps);
            config.flags = descriptor.flags_for(i);
            let texture = self.load_texture_with(name, config);
            material.push_texture(&texture);
            *self.texture_refs.entry(name.clone()).or_insert(0) += 1;
        }
        log::debug!("material {} ({} textures)", filename, material.texture_names().len());

        let material = Arc::new(material);
        self.materials.insert(filename.to_string(), Arc::clone(&material));
        Ok(material)
    }

    /// Drops a material and evicts its textures according to the unload policy.
    /// Returns false if the material was not loaded.
    pub fn unload_material(&mut self, renderer: &mut Renderer, filename: &str) -> bool {
        let Some(material) = self.materials.remove(filename) else {
            return false;
        };
        for name in material.texture_names() {
            let remaining = match self.texture_refs.get_mut(name) {
                Some(count) => {
                    *count = count.saturating_sub(1);
                    *count
                }
                None => 0,
            };
            let evict = match self.config.unload_policy {
                UnloadPolicy::EvictAll => true,
                UnloadPolicy::RetainShared => remaining == 0,
            };
            if !evict {
                continue;
            }
            // An evicted name starts from zero if it is ever loaded again.
            self.texture_refs.remove(name);
            if let Some(texture) = self.textures.remove(name) {
                texture.release(renderer);
                if remaining > 0 {
                    log::warn!("evicted {} while {} other material(s) still use it", name, remaining);
                }
            }
        }
        true
    }

    // ── Loading ──────────────────────────────────────────────────────────

    pub fn start_loading_textures(&mut self) -> Result<()> {
        self.loader.start_loading()
    }

    /// See [`AsyncLoader::try_finalize`].
    pub fn try_finalize(&mut self, renderer: &mut Renderer) -> bool {
        self.loader.try_finalize(renderer)
    }

    pub fn loader(&self) -> &AsyncLoader {
        &self.loader
    }

    pub fn shader_count(&self) -> usize {
        self.shaders.len()
    }

    pub fn texture_count(&self) -> usize {
        self.textures.len()
    }

    pub fn material_count(&self) -> usize {
        self.materials.len()
    }

    /// Loaded materials referencing `filename`.
    pub fn texture_ref_count(&self, filename: &str) -> usize {
        self.texture_refs.get(filename).copied().unwrap_or(0)
    }
}

impl Default for MaterialManager {
    fn default() -> Self {
        Self::new(MaterialManagerConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gpu::{HeadlessOptions, HeadlessProbe, TextureWrap};
    use crate::renderer::{BlendMode, RendererConfig};
    use crate::shader::tests::{FRAGMENT_WGSL, VERTEX_WGSL};
    use crate::texture::TextureState;
    use crate::texture_importer::tests::{make_png, make_tga, make_webp};
    use glam::UVec2;
    use std::time::{Duration, Instant};

    fn renderer() -> (Renderer, HeadlessProbe) {
        let (mut r, probe) = Renderer::headless(HeadlessOptions::default(), RendererConfig::default());
        r.initialize(UVec2::new(64, 64), "materials").unwrap();
        (r, probe)
    }

    fn scratch_dir(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("slop_render_materials_{}_{}", name, std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    fn manager(dir: &PathBuf, policy: UnloadPolicy) -> MaterialManager {
        MaterialManager::new(
            MaterialManagerConfig::default()
                .with_asset_root(dir)
                .with_unload_policy(policy)
                .with_loader(LoaderConfig::default().with_workers(2)),
        )
    }

    fn finish(manager: &mut MaterialManager, r: &mut Renderer) {
        manager.start_loading_textures().unwrap();
        let deadline = Instant::now() + Duration::from_secs(20);
        while !manager.try_finalize(r) {
            assert!(Instant::now() < deadline, "textures never settled");
            std::thread::sleep(Duration::from_millis(5));
        }
    }

    fn write_textures(dir: &PathBuf) {
        std::fs::write(dir.join("t1.png"), make_png(4, 4, [10, 20, 30, 255])).unwrap();
        std::fs::write(dir.join("t2.tga"), make_tga(2, 2, &[90u8; 16], 32, false)).unwrap();
        std::fs::write(dir.join("t3.webp"), make_webp(4, 4, [0, 0, 255, 255])).unwrap();
    }

    #[test]
    fn test_load_texture_returns_cached_instance() {
        let mut m = MaterialManager::default();
        let a = m.load_texture("wall.webp", TextureFormat::Rgb565);
        let b = m.load_texture("wall.webp", TextureFormat::Rgba8888);
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(b.desired_format(), TextureFormat::Rgb565);
        assert_eq!(m.loader().pending_count(), 1);
        assert_eq!(m.texture_count(), 1);
    }

    #[test]
    fn test_load_shader_caches_and_reports_errors() {
        let dir = scratch_dir("shaders");
        std::fs::write(dir.join("basic.vert.wgsl"), VERTEX_WGSL).unwrap();
        std::fs::write(dir.join("basic.frag.wgsl"), FRAGMENT_WGSL).unwrap();
        std::fs::write(dir.join("broken.vert.wgsl"), "fn vs_main( {").unwrap();
        std::fs::write(dir.join("broken.frag.wgsl"), FRAGMENT_WGSL).unwrap();

        let (mut r, probe) = renderer();
        let mut m = manager(&dir, UnloadPolicy::EvictAll);
        let a = m.load_shader(&mut r, "basic").unwrap();
        let b = m.load_shader(&mut r, "basic").unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(probe.lock().programs.len(), 1);

        assert!(m.load_shader(&mut r, "broken").is_err());
        assert!(r.last_error().contains("compile error"));
        assert!(m.find_shader("broken").is_none());

        assert!(m.load_shader(&mut r, "absent").is_err());
        assert_eq!(r.last_error(), "couldn't load: absent.vert.wgsl");
        assert_eq!(m.shader_count(), 1);
        std::fs::remove_dir_all(dir).ok();
    }

    #[test]
    fn test_load_material_in_file_order() {
        let dir = scratch_dir("material");
        write_textures(&dir);
        std::fs::write(
            dir.join("a.json"),
            r#"{ "blend_mode": "Alpha", "texture_filenames": ["t1.png", "t2.tga"], "desired_format": ["Rgba8888"] }"#,
        )
        .unwrap();

        let (mut r, probe) = renderer();
        let mut m = manager(&dir, UnloadPolicy::EvictAll);
        let mat = m.load_material(&mut r, "a.json").unwrap();
        assert!(Arc::ptr_eq(&mat, &m.load_material(&mut r, "a.json").unwrap()));
        assert_eq!(mat.blend_mode(), BlendMode::Alpha);
        assert_eq!(mat.texture_names(), &["t1.png".to_string(), "t2.tga".to_string()]);
        assert!(!mat.is_ready());

        let t1 = m.find_texture("t1.png").unwrap();
        let t2 = m.find_texture("t2.tga").unwrap();
        assert_eq!(t1.desired_format(), TextureFormat::Rgba8888);
        assert_eq!(t2.desired_format(), TextureFormat::Auto);

        finish(&mut m, &mut r);
        assert!(mat.is_ready());
        assert_eq!(t1.actual_format(), Some(TextureFormat::Rgba8888));
        assert_eq!(t2.actual_format(), Some(TextureFormat::Rgba5551));
        assert_eq!(probe.lock().texture_count(), 2);

        mat.set(&mut r);
        assert_eq!(r.blend_mode(), BlendMode::Alpha);
        assert_eq!(r.texture_units(), &[t1.handle(), t2.handle()]);
        std::fs::remove_dir_all(dir).ok();
    }

    #[test]
    fn test_forced_blend_mode_beats_material() {
        let (mut r, _probe) = renderer();
        let mut mat = Material::new("m", BlendMode::Off);
        mat.set_blend_mode(BlendMode::Multiply);
        r.set_force_blend_mode(Some(BlendMode::Add));
        mat.set(&mut r);
        assert_eq!(r.blend_mode(), BlendMode::Add);
    }

    #[test]
    fn test_material_load_failures_set_last_error() {
        let dir = scratch_dir("bad_material");
        std::fs::write(dir.join("bad.json"), b"{ not json").unwrap();

        let (mut r, _probe) = renderer();
        let mut m = manager(&dir, UnloadPolicy::EvictAll);
        let err = m.load_material(&mut r, "missing.json").unwrap_err();
        assert!(err.is_not_found());
        assert_eq!(r.last_error(), "couldn't load: missing.json");

        let err = m.load_material(&mut r, "bad.json").unwrap_err();
        assert!(matches!(err.root(), Error::Descriptor(_)));
        assert!(r.last_error().starts_with("couldn't load: bad.json"));
        assert_eq!(m.material_count(), 0);
        std::fs::remove_dir_all(dir).ok();
    }

    fn shared_scenario(policy: UnloadPolicy) -> (MaterialManager, Renderer, Arc<Material>, PathBuf) {
        let dir = scratch_dir(&format!("shared_{:?}", policy));
        write_textures(&dir);
        std::fs::write(dir.join("a.json"), r#"{ "texture_filenames": ["t1.png", "t2.tga"] }"#).unwrap();
        std::fs::write(dir.join("b.json"), r#"{ "texture_filenames": ["t1.png", "t3.webp"] }"#).unwrap();

        let (mut r, _probe) = renderer();
        let mut m = manager(&dir, policy);
        m.load_material(&mut r, "a.json").unwrap();
        let b = m.load_material(&mut r, "b.json").unwrap();
        assert_eq!(m.texture_count(), 3);
        assert_eq!(m.texture_ref_count("t1.png"), 2);
        finish(&mut m, &mut r);
        assert!(b.is_ready());
        assert!(m.unload_material(&mut r, "a.json"));
        assert!(!m.unload_material(&mut r, "a.json"));
        (m, r, b, dir)
    }

    #[test]
    fn test_unload_evicts_shared_textures_by_default() {
        let (mut m, mut r, b, dir) = shared_scenario(UnloadPolicy::EvictAll);
        // t1 goes too, even though b still lists it.
        assert!(m.find_texture("t1.png").is_none());
        assert!(m.find_texture("t2.tga").is_none());
        assert!(m.find_texture("t3.webp").is_some());
        assert!(b.textures()[0].upgrade().is_none());
        assert!(!b.is_ready());
        assert_eq!(m.texture_ref_count("t1.png"), 0);
        assert_eq!(m.texture_ref_count("t3.webp"), 1);

        m.load_material(&mut r, "a.json").unwrap();
        assert_eq!(m.texture_ref_count("t1.png"), 1);
        assert!(m.unload_material(&mut r, "a.json"));
        assert!(m.find_texture("t1.png").is_none());
        assert_eq!(m.texture_ref_count("t1.png"), 0);
        std::fs::remove_dir_all(dir).ok();
    }

    #[test]
    fn test_unload_retains_shared_textures() {
        let (mut m, mut r, b, dir) = shared_scenario(UnloadPolicy::RetainShared);
        assert!(m.find_texture("t1.png").is_some());
        assert!(m.find_texture("t2.tga").is_none());
        assert!(b.is_ready());
        assert_eq!(m.texture_ref_count("t1.png"), 1);

        m.unload_material(&mut r, "b.json");
        assert_eq!(m.texture_count(), 0);
        std::fs::remove_dir_all(dir).ok();
    }

    #[test]
    fn test_unloaded_texture_is_freed_on_gpu() {
        let dir = scratch_dir("gpu_free");
        write_textures(&dir);
        std::fs::write(dir.join("a.json"), r#"{ "texture_filenames": ["t1.png"] }"#).unwrap();

        let (mut r, probe) = renderer();
        let mut m = manager(&dir, UnloadPolicy::EvictAll);
        m.load_material(&mut r, "a.json").unwrap();
        finish(&mut m, &mut r);
        let t1 = m.find_texture("t1.png").unwrap();
        assert_eq!(probe.lock().texture_count(), 1);

        m.unload_material(&mut r, "a.json");
        assert_eq!(probe.lock().texture_count(), 0);
        assert_eq!(t1.state(), TextureState::Unloaded);
        assert!(t1.is_released());
        std::fs::remove_dir_all(dir).ok();
    }

    #[test]
    fn test_material_passes_wrap_and_cube_flags() {
        let dir = scratch_dir("flags");
        std::fs::write(dir.join("sky.png"), make_png(4, 24, [40, 80, 160, 255])).unwrap();
        std::fs::write(dir.join("ui.png"), make_png(4, 4, [1, 1, 1, 255])).unwrap();
        std::fs::write(
            dir.join("sky.json"),
            r#"{ "texture_filenames": ["sky.png", "ui.png"], "wrap_mode": "ClampToEdge", "is_cubemap": [true] }"#,
        )
        .unwrap();

        let (mut r, probe) = renderer();
        let mut m = manager(&dir, UnloadPolicy::EvictAll);
        let material = m.load_material(&mut r, "sky.json").unwrap();
        finish(&mut m, &mut r);
        assert!(material.is_ready());

        let sky = m.find_texture("sky.png").unwrap();
        let ui = m.find_texture("ui.png").unwrap();
        assert!(sky.config().flags.cube_map);
        assert!(!ui.config().flags.cube_map);
        let state = probe.lock();
        let stored = state.texture(sky.handle()).unwrap();
        assert!(stored.flags.cube_map);
        assert_eq!(stored.flags.wrap, TextureWrap::ClampToEdge);
        assert_eq!((stored.width, stored.height), (4, 4));
        assert_eq!(state.texture(ui.handle()).unwrap().flags.wrap, TextureWrap::ClampToEdge);
        drop(state);
        std::fs::remove_dir_all(dir).ok();
    }

    #[test]
    fn test_material_loaded_after_start_finishes_by_polling() {
        let dir = scratch_dir("late_material");
        write_textures(&dir);
        std::fs::write(dir.join("a.json"), r#"{ "texture_filenames": ["t1.png"] }"#).unwrap();
        std::fs::write(dir.join("b.json"), r#"{ "texture_filenames": ["t2.tga", "t3.webp"] }"#).unwrap();

        let (mut r, _probe) = renderer();
        let mut m = manager(&dir, UnloadPolicy::EvictAll);
        let a = m.load_material(&mut r, "a.json").unwrap();
        m.start_loading_textures().unwrap();
        let b = m.load_material(&mut r, "b.json").unwrap();

        let deadline = Instant::now() + Duration::from_secs(20);
        while !m.try_finalize(&mut r) {
            assert!(Instant::now() < deadline, "textures never settled");
            std::thread::sleep(Duration::from_millis(5));
        }
        assert!(a.is_ready());
        assert!(b.is_ready());
        assert_eq!(m.find_texture("t2.tga").unwrap().state(), TextureState::Resident);
        std::fs::remove_dir_all(dir).ok();
    }
}
