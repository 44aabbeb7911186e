// src/shader.rs
//! Shader programs: WGSL compile, link check and uniform reflection.
//!
//! Both stages are parsed and validated with `naga`. Linking is a cross-stage check:
//! the vertex source must have a `@vertex` entry point, the pixel source a `@fragment`
//! one, every fragment `@location` input must be written by the vertex stage, and
//! uniforms shared by both stages must sit at the same binding and offset.
//!
//! Vertex inputs are matched by name against a fixed stream contract (see
//! [`VertexAttribute`]). Inputs with other names compile fine but receive no data.

use std::collections::BTreeSet;

use glam::{Mat4, Vec4};
use parking_lot::RwLock;

use crate::error::{Error, Result, ShaderStage};
use crate::gpu::ProgramHandle;
use crate::renderer::Renderer;

/// Highest `texture_unit_N` binding that is reflected.
pub const MAX_TEXTURE_UNITS: u32 = 8;

/// Token replaced by the context's uniform component limit before compiling.
pub const MAX_COMPONENTS_TOKEN: &str = "MAX_VERTEX_UNIFORM_COMPONENTS";

// ═══════════════════════════════════════════════════════════════════════════════
// Contracts
// ═══════════════════════════════════════════════════════════════════════════════

/// Vertex streams the mesh layer feeds, with their fixed `@location`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum VertexAttribute {
    Position,
    Normal,
    Tangent,
    TexCoord,
    TexCoordAlt,
    Color,
    BoneIndices,
    BoneWeights,
}

impl VertexAttribute {
    pub const ALL: [VertexAttribute; 8] = [
        VertexAttribute::Position,
        VertexAttribute::Normal,
        VertexAttribute::Tangent,
        VertexAttribute::TexCoord,
        VertexAttribute::TexCoordAlt,
        VertexAttribute::Color,
        VertexAttribute::BoneIndices,
        VertexAttribute::BoneWeights,
    ];

    pub fn name(self) -> &'static str {
        match self {
            VertexAttribute::Position => "position",
            VertexAttribute::Normal => "normal",
            VertexAttribute::Tangent => "tangent",
            VertexAttribute::TexCoord => "texcoord",
            VertexAttribute::TexCoordAlt => "texcoord_alt",
            VertexAttribute::Color => "color",
            VertexAttribute::BoneIndices => "bone_indices",
            VertexAttribute::BoneWeights => "bone_weights",
        }
    }

    pub fn location(self) -> u32 {
        self as u32
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|a| a.name() == name)
    }
}

/// Per-draw uniforms the renderer knows how to fill.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Uniform {
    ModelViewProjection,
    Model,
    Color,
    LightPos,
    CameraPos,
    Time,
    BoneTransforms,
}

impl Uniform {
    pub const ALL: [Uniform; 7] = [
        Uniform::ModelViewProjection,
        Uniform::Model,
        Uniform::Color,
        Uniform::LightPos,
        Uniform::CameraPos,
        Uniform::Time,
        Uniform::BoneTransforms,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Uniform::ModelViewProjection => "model_view_projection",
            Uniform::Model => "model",
            Uniform::Color => "color",
            Uniform::LightPos => "light_pos",
            Uniform::CameraPos => "camera_pos",
            Uniform::Time => "time",
            Uniform::BoneTransforms => "bone_transforms",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|u| u.name() == name)
    }

    fn index(self) -> usize {
        self as usize
    }
}

/// Where a uniform lives: a uniform buffer binding plus a byte offset inside it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UniformLocation {
    pub group: u32,
    pub binding: u32,
    pub offset: u32,
    /// Size of the whole buffer binding, for backends that allocate per binding.
    pub block_size: u32,
}

/// One uniform upload produced by [`Shader::set`].
#[derive(Debug, Clone, PartialEq)]
pub struct UniformWrite {
    pub location: UniformLocation,
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TextureUnitBinding {
    pub unit: u32,
    pub group: u32,
    pub binding: u32,
}

/// Everything resolved from the two stages at link time.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ShaderReflection {
    uniforms: [Option<UniformLocation>; 7],
    pub texture_units: Vec<TextureUnitBinding>,
    /// Contract attributes the vertex stage consumes.
    pub attributes: Vec<VertexAttribute>,
    pub vertex_entry: String,
    pub fragment_entry: String,
}

impl ShaderReflection {
    pub fn uniform(&self, uniform: Uniform) -> Option<UniformLocation> {
        self.uniforms[uniform.index()]
    }
}

/// Output of a successful compile + link.
#[derive(Debug, Clone)]
pub struct LinkedStages {
    pub vertex_wgsl: String,
    pub fragment_wgsl: String,
    pub reflection: ShaderReflection,
}

// ═══════════════════════════════════════════════════════════════════════════════
// Compile + link
// ═══════════════════════════════════════════════════════════════════════════════

/// Replaces [`MAX_COMPONENTS_TOKEN`] with the context's limit.
pub fn preprocess(source: &str, max_vertex_uniform_components: u32) -> String {
    source.replace(MAX_COMPONENTS_TOKEN, &max_vertex_uniform_components.to_string())
}

fn compile_stage(source: &str, stage: ShaderStage) -> Result<naga::Module> {
    let module = naga::front::wgsl::parse_str(source).map_err(|e| Error::ShaderCompile {
        stage,
        log: e.emit_to_string(source),
    })?;
    let mut validator = naga::valid::Validator::new(
        naga::valid::ValidationFlags::all(),
        naga::valid::Capabilities::all(),
    );
    validator.validate(&module).map_err(|e| Error::ShaderCompile {
        stage,
        log: e.emit_to_string(source),
    })?;
    Ok(module)
}

/// Compiles both stages and links them. Pure: touches no GPU state.
pub fn compile_and_link(vertex_source: &str, fragment_source: &str) -> Result<LinkedStages> {
    let vs = compile_stage(vertex_source, ShaderStage::Vertex)?;
    let fs = compile_stage(fragment_source, ShaderStage::Fragment)?;

    let vertex_entry = find_entry(&vs, naga::ShaderStage::Vertex)
        .ok_or_else(|| Error::ShaderLink("vertex source has no @vertex entry point".into()))?;
    let fragment_entry = find_entry(&fs, naga::ShaderStage::Fragment)
        .ok_or_else(|| Error::ShaderLink("pixel source has no @fragment entry point".into()))?;

    // Varyings.
    let vs_outputs: BTreeSet<u32> = match &vertex_entry.function.result {
        Some(result) => locations(&vs, None, result.ty, result.binding.as_ref())
            .into_iter()
            .map(|(_, loc)| loc)
            .collect(),
        None => BTreeSet::new(),
    };
    for arg in &fragment_entry.function.arguments {
        for (name, loc) in locations(&fs, arg.name.as_deref(), arg.ty, arg.binding.as_ref()) {
            if !vs_outputs.contains(&loc) {
                return Err(Error::ShaderLink(format!(
                    "fragment input '{}' at location {} is not written by the vertex stage",
                    name, loc
                )));
            }
        }
    }

    // Vertex stream contract.
    let mut attributes = Vec::new();
    for arg in &vertex_entry.function.arguments {
        for (name, loc) in locations(&vs, arg.name.as_deref(), arg.ty, arg.binding.as_ref()) {
            match VertexAttribute::from_name(&name) {
                Some(attr) if attr.location() == loc => attributes.push(attr),
                Some(attr) => {
                    return Err(Error::ShaderLink(format!(
                        "vertex input '{}' must use @location({}), found {}",
                        name,
                        attr.location(),
                        loc
                    )))
                }
                None => log::debug!("vertex input '{}' is not a known stream and receives no data", name),
            }
        }
    }

    let mut reflection = ShaderReflection {
        attributes,
        vertex_entry: vertex_entry.name.clone(),
        fragment_entry: fragment_entry.name.clone(),
        ..Default::default()
    };
    reflect_resources(&vs, &mut reflection)?;
    reflect_resources(&fs, &mut reflection)?;

    Ok(LinkedStages {
        vertex_wgsl: vertex_source.to_string(),
        fragment_wgsl: fragment_source.to_string(),
        reflection,
    })
}

fn find_entry(module: &naga::Module, stage: naga::ShaderStage) -> Option<&naga::EntryPoint> {
    module.entry_points.iter().find(|ep| ep.stage == stage)
}

/// `(name, location)` for a value that is either bound directly or a struct of bound members.
fn locations(
    module: &naga::Module,
    name: Option<&str>,
    ty: naga::Handle<naga::Type>,
    binding: Option<&naga::Binding>,
) -> Vec<(String, u32)> {
    if let Some(naga::Binding::Location { location, .. }) = binding {
        return vec![(name.unwrap_or_default().to_string(), *location)];
    }
    match &module.types[ty].inner {
        naga::TypeInner::Struct { members, .. } => members
            .iter()
            .filter_map(|m| match &m.binding {
                Some(naga::Binding::Location { location, .. }) => {
                    Some((m.name.clone().unwrap_or_default(), *location))
                }
                _ => None,
            })
            .collect(),
        _ => Vec::new(),
    }
}

fn reflect_resources(module: &naga::Module, out: &mut ShaderReflection) -> Result<()> {
    for (_, var) in module.global_variables.iter() {
        let (Some(name), Some(binding)) = (var.name.as_deref(), var.binding.as_ref()) else {
            continue;
        };
        let ty = &module.types[var.ty];
        match var.space {
            naga::AddressSpace::Uniform => {
                let block_size = ty.inner.size(module.to_ctx());
                let mut place = |uniform: Uniform, offset: u32| -> Result<()> {
                    let loc = UniformLocation {
                        group: binding.group,
                        binding: binding.binding,
                        offset,
                        block_size,
                    };
                    match out.uniforms[uniform.index()] {
                        Some(existing) if existing != loc => Err(Error::ShaderLink(format!(
                            "uniform '{}' is declared differently in the two stages",
                            uniform.name()
                        ))),
                        _ => {
                            out.uniforms[uniform.index()] = Some(loc);
                            Ok(())
                        }
                    }
                };
                if let Some(uniform) = Uniform::from_name(name) {
                    place(uniform, 0)?;
                } else if let naga::TypeInner::Struct { members, .. } = &ty.inner {
                    for member in members {
                        let member_name = member.name.as_deref().unwrap_or_default();
                        match Uniform::from_name(member_name) {
                            Some(uniform) => place(uniform, member.offset)?,
                            None => log::debug!("uniform member '{}.{}' is not managed by the renderer", name, member_name),
                        }
                    }
                } else {
                    log::debug!("uniform '{}' is not managed by the renderer", name);
                }
            }
            naga::AddressSpace::Handle => {
                let unit = name
                    .strip_prefix("texture_unit_")
                    .and_then(|n| n.parse::<u32>().ok())
                    .filter(|n| *n < MAX_TEXTURE_UNITS);
                if let (Some(unit), naga::TypeInner::Image { .. }) = (unit, &ty.inner) {
                    let entry = TextureUnitBinding {
                        unit,
                        group: binding.group,
                        binding: binding.binding,
                    };
                    if !out.texture_units.contains(&entry) {
                        out.texture_units.push(entry);
                    }
                }
            }
            _ => {}
        }
    }
    out.texture_units.sort_by_key(|t| t.unit);
    Ok(())
}

// ═══════════════════════════════════════════════════════════════════════════════
// Shader object
// ═══════════════════════════════════════════════════════════════════════════════

struct ShaderInner {
    program: ProgramHandle,
    reflection: ShaderReflection,
}

/// A linked program with its reflected uniform locations.
///
/// Shared through `Arc` by the shader cache; a recompile swaps the program in place
/// so every holder sees the new one.
pub struct Shader {
    name: String,
    inner: RwLock<ShaderInner>,
}

impl Shader {
    pub(crate) fn new(name: impl Into<String>, program: ProgramHandle, reflection: ShaderReflection) -> Self {
        Self {
            name: name.into(),
            inner: RwLock::new(ShaderInner { program, reflection }),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn program(&self) -> ProgramHandle {
        self.inner.read().program
    }

    pub fn uniform_location(&self, uniform: Uniform) -> Option<UniformLocation> {
        self.inner.read().reflection.uniform(uniform)
    }

    pub fn texture_units(&self) -> Vec<TextureUnitBinding> {
        self.inner.read().reflection.texture_units.clone()
    }

    pub fn attributes(&self) -> Vec<VertexAttribute> {
        self.inner.read().reflection.attributes.clone()
    }

    /// Swaps in a freshly linked program. Returns the one it replaced.
    pub(crate) fn reset(&self, program: ProgramHandle, reflection: ShaderReflection) -> ProgramHandle {
        let mut inner = self.inner.write();
        inner.reflection = reflection;
        std::mem::replace(&mut inner.program, program)
    }

    /// Uploads the renderer's current per-draw uniforms to this program.
    pub fn set(&self, renderer: &mut Renderer) -> Result<()> {
        let (program, writes) = {
            let inner = self.inner.read();
            (inner.program, uniform_writes(&inner.reflection, renderer))
        };
        renderer.write_uniforms(program, &writes)
    }
}

impl std::fmt::Debug for Shader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Shader")
            .field("name", &self.name)
            .field("program", &self.program())
            .finish()
    }
}

/// Three `vec4` rows per bone: the transpose of the upper 3x4 of each matrix.
pub fn pack_bone_rows(bones: &[Mat4]) -> Vec<Vec4> {
    bones
        .iter()
        .flat_map(|m| {
            let t = m.transpose();
            [t.x_axis, t.y_axis, t.z_axis]
        })
        .collect()
}

fn uniform_writes(reflection: &ShaderReflection, renderer: &Renderer) -> Vec<UniformWrite> {
    let mut writes = Vec::new();
    for uniform in Uniform::ALL {
        let Some(location) = reflection.uniform(uniform) else {
            continue;
        };
        let data: Vec<u8> = match uniform {
            Uniform::ModelViewProjection => {
                bytemuck::cast_slice(&renderer.model_view_projection().to_cols_array()).to_vec()
            }
            Uniform::Model => bytemuck::cast_slice(&renderer.model().to_cols_array()).to_vec(),
            Uniform::Color => bytemuck::bytes_of(&renderer.color()).to_vec(),
            Uniform::LightPos => bytemuck::bytes_of(&renderer.light_pos()).to_vec(),
            Uniform::CameraPos => bytemuck::bytes_of(&renderer.camera_pos()).to_vec(),
            Uniform::Time => bytemuck::bytes_of(&(renderer.time() as f32)).to_vec(),
            Uniform::BoneTransforms => {
                if renderer.bone_transforms().is_empty() {
                    continue;
                }
                let rows = pack_bone_rows(renderer.bone_transforms());
                let mut bytes = bytemuck::cast_slice::<Vec4, u8>(&rows).to_vec();
                let room = location.block_size.saturating_sub(location.offset) as usize;
                bytes.truncate(room);
                bytes
            }
        };
        writes.push(UniformWrite { location, data });
    }
    writes
}
