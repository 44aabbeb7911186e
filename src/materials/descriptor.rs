// src/materials/descriptor.rs
//! On-disk material description.
//!
//! ```json
//! { "blend_mode": "Alpha", "texture_filenames": ["a.webp", "b.tga"], "desired_format": ["Rgb565"] }
//! ```
//!
//! `desired_format` and `is_cubemap` may be shorter than `texture_filenames`; missing
//! entries mean `Auto` and a plain 2D texture. `wrap_mode` applies to every texture.

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::gpu::{TextureFlags, TextureWrap};
use crate::pixel_format::TextureFormat;
use crate::renderer::BlendMode;

/// Blend modes as they are written in material files.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum DescriptorBlendMode {
    #[default]
    Off,
    Test,
    Alpha,
    Add,
    AddAlpha,
    Multiply,
    PreMultipliedAlpha,
}

impl DescriptorBlendMode {
    pub const ALL: [DescriptorBlendMode; 7] = [
        DescriptorBlendMode::Off,
        DescriptorBlendMode::Test,
        DescriptorBlendMode::Alpha,
        DescriptorBlendMode::Add,
        DescriptorBlendMode::AddAlpha,
        DescriptorBlendMode::Multiply,
        DescriptorBlendMode::PreMultipliedAlpha,
    ];

    /// Looks the mode up in [`BLEND_MODE_TABLE`].
    pub fn to_renderer(self) -> Result<BlendMode> {
        BLEND_MODE_TABLE
            .iter()
            .find(|(file, _)| *file == self)
            .map(|(_, mode)| *mode)
            .ok_or_else(|| Error::InvalidState(format!("blend mode {:?} has no renderer equivalent", self)))
    }
}

/// File blend mode to renderer blend mode. Every value of each enum appears once.
pub const BLEND_MODE_TABLE: [(DescriptorBlendMode, BlendMode); 7] = [
    (DescriptorBlendMode::Off, BlendMode::Off),
    (DescriptorBlendMode::Test, BlendMode::Test),
    (DescriptorBlendMode::Alpha, BlendMode::Alpha),
    (DescriptorBlendMode::Add, BlendMode::Add),
    (DescriptorBlendMode::AddAlpha, BlendMode::AddAlpha),
    (DescriptorBlendMode::Multiply, BlendMode::Multiply),
    (DescriptorBlendMode::PreMultipliedAlpha, BlendMode::PreMultipliedAlpha),
];

/// Verifies the table is a bijection between the two enums.
pub fn validate_blend_table() -> Result<()> {
    for file in DescriptorBlendMode::ALL {
        let hits = BLEND_MODE_TABLE.iter().filter(|(f, _)| *f == file).count();
        if hits != 1 {
            return Err(Error::InvalidState(format!("{:?} appears {} times in the blend table", file, hits)));
        }
    }
    for mode in BlendMode::ALL {
        let hits = BLEND_MODE_TABLE.iter().filter(|(_, m)| *m == mode).count();
        if hits != 1 {
            return Err(Error::InvalidState(format!("{:?} appears {} times in the blend table", mode, hits)));
        }
    }
    Ok(())
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Default)]
pub struct MaterialDescriptor {
    #[serde(default)]
    pub blend_mode: DescriptorBlendMode,
    /// Texture unit order.
    pub texture_filenames: Vec<String>,
    #[serde(default)]
    pub desired_format: Vec<TextureFormat>,
    #[serde(default)]
    pub wrap_mode: TextureWrap,
    #[serde(default)]
    pub is_cubemap: Vec<bool>,
}

impl MaterialDescriptor {
    pub fn from_slice(bytes: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }

    /// Desired format of the `index`th texture.
    pub fn format_for(&self, index: usize) -> TextureFormat {
        self.desired_format.get(index).copied().unwrap_or_default()
    }

    pub fn flags_for(&self, index: usize) -> TextureFlags {
        TextureFlags {
            wrap: self.wrap_mode,
            cube_map: self.is_cubemap.get(index).copied().unwrap_or(false),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_blend_table_is_aligned() {
        validate_blend_table().unwrap();
        for (file, mode) in DescriptorBlendMode::ALL.into_iter().zip(BlendMode::ALL) {
            assert_eq!(file.to_renderer().unwrap(), mode);
            assert_eq!(format!("{:?}", file), format!("{:?}", mode));
        }
    }

    #[test]
    fn test_parse_descriptor() {
        let json = br#"{ "blend_mode": "Test", "texture_filenames": ["a.png", "b.tga", "c.webp"], "desired_format": ["Rgb565"] }"#;
        let desc = MaterialDescriptor::from_slice(json).unwrap();
        assert_eq!(desc.blend_mode, DescriptorBlendMode::Test);
        assert_eq!(desc.texture_filenames, vec!["a.png", "b.tga", "c.webp"]);
        assert_eq!(desc.format_for(0), TextureFormat::Rgb565);
        assert_eq!(desc.format_for(2), TextureFormat::Auto);
    }

    #[test]
    fn test_wrap_and_cubemap_entries() {
        let json = br#"{ "texture_filenames": ["sky.png", "ui.png"], "wrap_mode": "ClampToEdge", "is_cubemap": [true] }"#;
        let desc = MaterialDescriptor::from_slice(json).unwrap();
        assert_eq!(desc.flags_for(0), TextureFlags { wrap: TextureWrap::ClampToEdge, cube_map: true });
        assert_eq!(desc.flags_for(1), TextureFlags { wrap: TextureWrap::ClampToEdge, cube_map: false });
    }

    #[test]
    fn test_defaults_and_errors() {
        let desc = MaterialDescriptor::from_slice(br#"{ "texture_filenames": [] }"#).unwrap();
        assert_eq!(desc.blend_mode, DescriptorBlendMode::Off);
        assert!(desc.desired_format.is_empty());
        assert_eq!(desc.flags_for(0), TextureFlags::default());

        let err = MaterialDescriptor::from_slice(br#"{ "blend_mode": "Sparkle", "texture_filenames": [] }"#).unwrap_err();
        assert!(matches!(err, Error::Descriptor(_)));
    }
}
