// src/materials/material.rs

use std::sync::{Arc, Weak};

use crate::gpu::TextureHandle;
use crate::renderer::{BlendMode, Renderer};
use crate::texture::Texture;

/// A blend mode plus an ordered list of textures, bound together per draw.
///
/// Textures are referenced weakly: the texture cache owns them, and a texture evicted
/// from the cache binds as an invalid handle.
#[derive(Debug)]
pub struct Material {
    name: String,
    blend_mode: BlendMode,
    textures: Vec<Weak<Texture>>,
    texture_names: Vec<String>,
}

impl Material {
    pub fn new(name: impl Into<String>, blend_mode: BlendMode) -> Self {
        Self {
            name: name.into(),
            blend_mode,
            textures: Vec::new(),
            texture_names: Vec::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn blend_mode(&self) -> BlendMode {
        self.blend_mode
    }

    pub fn set_blend_mode(&mut self, blend_mode: BlendMode) {
        self.blend_mode = blend_mode;
    }

    /// Appends a texture; its position is its texture unit.
    pub fn push_texture(&mut self, texture: &Arc<Texture>) {
        self.textures.push(Arc::downgrade(texture));
        self.texture_names.push(texture.filename().to_string());
    }

    pub fn textures(&self) -> &[Weak<Texture>] {
        &self.textures
    }

    pub fn texture_names(&self) -> &[String] {
        &self.texture_names
    }

    /// True when every texture is still cached and Resident.
    pub fn is_ready(&self) -> bool {
        self.textures
            .iter()
            .all(|t| t.upgrade().is_some_and(|t| t.is_resident()))
    }

    /// Applies the blend mode and binds the textures to units 0..n in order.
    pub fn set(&self, renderer: &mut Renderer) {
        renderer.set_blend_mode(self.blend_mode);
        let handles: Vec<TextureHandle> = self
            .textures
            .iter()
            .map(|t| t.upgrade().map(|t| t.handle()).unwrap_or_default())
            .collect();
        renderer.set_texture_units(handles);
    }
}
