// src/materials/mod.rs

pub mod descriptor;
pub mod material;
pub mod material_manager;

pub use descriptor::{DescriptorBlendMode, MaterialDescriptor, BLEND_MODE_TABLE};
pub use material::Material;
pub use material_manager::{MaterialManager, MaterialManagerConfig, UnloadPolicy};
