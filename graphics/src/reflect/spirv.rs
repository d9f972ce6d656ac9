//! SPIR-V reflection.
//!
//! Reports, per entry point, the descriptor bindings, location-bound interface
//! variables and push constant block that the entry point actually references.
//! Parsing and the call-graph walk are done by `spirq`; this module maps its
//! output onto [`StageReflection`].

use spirq::spirv::ExecutionModel;
use spirq::ty::{DescriptorType, ScalarType, Type};
use spirq::var::Variable;
use spirq::ReflectConfig;

use crate::error::{GraphicsError, GraphicsResult};

use super::{
    InterfaceFormat, InterfaceVariable, NumericKind, ReflectedBinding, ResourceKind, ShaderStage,
    StageReflection,
};

const MAGIC: u32 = 0x0723_0203;
const HEADER_WORDS: usize = 5;

/// Reflect every vertex, fragment and compute entry point in `bytecode`.
pub fn reflect_spirv(bytecode: &[u8]) -> GraphicsResult<Vec<StageReflection>> {
    let words = to_words(bytecode)?;
    let entry_points = ReflectConfig::new()
        .spv(words.as_slice())
        .ref_all_rscs(false)
        .reflect()
        .map_err(|e| GraphicsError::InvalidBytecode(format!("reflection failed: {e:?}")))?;

    let mut stages = Vec::with_capacity(entry_points.len());
    for entry_point in &entry_points {
        let Some(stage) = stage_for_model(entry_point.exec_model) else {
            log::debug!(
                "Skipping entry point '{}' with model {:?}",
                entry_point.name,
                entry_point.exec_model
            );
            continue;
        };
        stages.push(reflect_entry_point(&entry_point.name, &entry_point.vars, stage)?);
    }

    if stages.is_empty() {
        return Err(GraphicsError::InvalidBytecode(
            "module has no vertex, fragment or compute entry point".to_string(),
        ));
    }
    Ok(stages)
}

/// Reflect the entry point for `stage`.
pub fn reflect_stage(bytecode: &[u8], stage: ShaderStage) -> GraphicsResult<StageReflection> {
    reflect_spirv(bytecode)?
        .into_iter()
        .find(|s| s.stage == stage)
        .ok_or_else(|| {
            GraphicsError::InvalidBytecode(format!("module has no {stage:?} entry point"))
        })
}

/// Check framing and the magic number, returning the module as words.
pub(crate) fn to_words(bytecode: &[u8]) -> GraphicsResult<Vec<u32>> {
    if bytecode.len() % 4 != 0 {
        return Err(GraphicsError::InvalidBytecode(format!(
            "length {} is not a multiple of 4",
            bytecode.len()
        )));
    }
    if bytecode.len() < HEADER_WORDS * 4 {
        return Err(GraphicsError::InvalidBytecode(format!(
            "{} bytes is shorter than the module header",
            bytecode.len()
        )));
    }
    let words: Vec<u32> = bytecode
        .chunks_exact(4)
        .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect();
    if words[0] != MAGIC {
        return Err(GraphicsError::InvalidBytecode(format!(
            "bad magic number {:#010x}",
            words[0]
        )));
    }
    Ok(words)
}

fn stage_for_model(model: ExecutionModel) -> Option<ShaderStage> {
    match model {
        ExecutionModel::Vertex => Some(ShaderStage::Vertex),
        ExecutionModel::Fragment => Some(ShaderStage::Fragment),
        ExecutionModel::GLCompute => Some(ShaderStage::Compute),
        _ => None,
    }
}

fn reflect_entry_point(
    name: &str,
    vars: &[Variable],
    stage: ShaderStage,
) -> GraphicsResult<StageReflection> {
    let mut reflection = StageReflection::new(stage, name);

    for var in vars {
        match var {
            Variable::Descriptor {
                name,
                desc_bind,
                desc_ty,
                ty,
                nbind,
                ..
            } => {
                let Some(kind) = resource_kind(desc_ty) else {
                    log::warn!(
                        "Skipping binding {}.{}: unsupported descriptor type {:?}",
                        desc_bind.set(),
                        desc_bind.bind(),
                        desc_ty
                    );
                    continue;
                };
                let size = match kind {
                    ResourceKind::UniformBuffer | ResourceKind::StorageBuffer => byte_size(ty),
                    _ => 0,
                };
                reflection.bindings.push(ReflectedBinding {
                    set: desc_bind.set(),
                    binding: desc_bind.bind(),
                    kind,
                    stages: stage.flag(),
                    // Runtime-sized arrays report zero.
                    count: (*nbind).max(1),
                    name: name.clone().filter(|n| !n.is_empty()),
                    size,
                });
            }
            Variable::PushConstant { ty, .. } => {
                if reflection.push_constant_size.is_some() {
                    return Err(GraphicsError::PushConstantMismatch(format!(
                        "{stage:?} declares more than one push constant block"
                    )));
                }
                reflection.push_constant_size = Some(byte_size(ty));
            }
            Variable::Input {
                name, location, ty, ..
            } => {
                push_interface(&mut reflection.inputs, location.loc(), name, ty)?;
            }
            Variable::Output {
                name, location, ty, ..
            } => {
                push_interface(&mut reflection.outputs, location.loc(), name, ty)?;
            }
            _ => {}
        }
    }

    reflection.bindings.sort_by_key(|b| (b.set, b.binding));
    reflection.inputs.sort_by_key(|v| v.location);
    reflection.outputs.sort_by_key(|v| v.location);
    Ok(reflection)
}

fn resource_kind(desc_ty: &DescriptorType) -> Option<ResourceKind> {
    Some(match desc_ty {
        DescriptorType::UniformBuffer() => ResourceKind::UniformBuffer,
        DescriptorType::StorageBuffer(..) => ResourceKind::StorageBuffer,
        DescriptorType::CombinedImageSampler() => ResourceKind::CombinedImageSampler,
        DescriptorType::SampledImage() => ResourceKind::SampledImage,
        DescriptorType::StorageImage(..) => ResourceKind::StorageImage,
        DescriptorType::Sampler() => ResourceKind::Sampler,
        _ => return None,
    })
}

fn byte_size(ty: &Type) -> u32 {
    ty.nbyte().map_or(0, |n| n as u32)
}

/// Matrices and arrays occupy one location per column or element.
fn push_interface(
    out: &mut Vec<InterfaceVariable>,
    location: u32,
    name: &Option<String>,
    ty: &Type,
) -> GraphicsResult<()> {
    let (slots, ty) = match ty {
        Type::Array(a) => (a.nelement.unwrap_or(1), &*a.element_ty),
        other => (1, other),
    };
    let (format, columns) = match ty {
        Type::Matrix(m) => (
            vector_format(&m.vector_ty.scalar_ty, m.vector_ty.nscalar)?,
            m.nvector,
        ),
        Type::Vector(v) => (vector_format(&v.scalar_ty, v.nscalar)?, 1),
        Type::Scalar(s) => (vector_format(s, 1)?, 1),
        other => {
            return Err(GraphicsError::InvalidBytecode(format!(
                "unsupported interface type {other:?} at location {location}"
            )))
        }
    };

    let name = name.clone().filter(|n| !n.is_empty());
    for i in 0..slots * columns {
        out.push(InterfaceVariable {
            location: location + i,
            format,
            name: name.clone(),
        });
    }
    Ok(())
}

fn vector_format(scalar: &ScalarType, components: u32) -> GraphicsResult<InterfaceFormat> {
    let (kind, width) = match scalar {
        ScalarType::Float { bits } => (NumericKind::Float, (*bits / 8) as u8),
        ScalarType::Integer {
            bits,
            is_signed: true,
        } => (NumericKind::Sint, (*bits / 8) as u8),
        ScalarType::Integer { bits, .. } => (NumericKind::Uint, (*bits / 8) as u8),
        ScalarType::Boolean => (NumericKind::Bool, 4),
        other => {
            return Err(GraphicsError::InvalidBytecode(format!(
                "unsupported interface component type {other:?}"
            )))
        }
    };
    Ok(InterfaceFormat {
        kind,
        components: components as u8,
        width,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::compile_wgsl;
    use crate::reflect::{
        check_interface, ShaderReflectionInfo, StageFlags, A_NORMAL, A_POSITION, A_UV0,
    };

    const MESH_WGSL: &str = r#"
struct Camera {
    view_proj: mat4x4<f32>,
    position: vec4<f32>,
}

struct Material {
    tint: vec4<f32>,
    roughness: f32,
}

struct Model {
    transform: mat4x4<f32>,
}

@group(0) @binding(0) var<uniform> camera: Camera;
@group(1) @binding(0) var<uniform> material: Material;
@group(1) @binding(1) var albedo: texture_2d<f32>;
@group(1) @binding(2) var albedo_sampler: sampler;
var<push_constant> model: Model;

struct VertexOut {
    @builtin(position) clip: vec4<f32>,
    @location(0) normal: vec3<f32>,
    @location(1) uv: vec2<f32>,
}

@vertex
fn vs_main(
    @location(0) position: vec3<f32>,
    @location(1) normal: vec3<f32>,
    @location(2) uv: vec2<f32>,
) -> VertexOut {
    var out: VertexOut;
    out.clip = camera.view_proj * model.transform * vec4<f32>(position, 1.0);
    out.normal = normal;
    out.uv = uv;
    return out;
}

@fragment
fn fs_main(
    @location(0) normal: vec3<f32>,
    @location(1) uv: vec2<f32>,
) -> @location(0) vec4<f32> {
    let base = textureSample(albedo, albedo_sampler, uv);
    return base * material.tint * (material.roughness + dot(normal, vec3<f32>(0.0, 1.0, 0.0)));
}
"#;

    /// Two entry points with different interfaces in one module.
    const PAIR_WGSL: &str = r#"
struct VertexOut {
    @builtin(position) clip: vec4<f32>,
    @location(0) color: vec4<f32>,
}

@vertex
fn vs_main(@location(0) position: vec3<f32>, @location(1) color: vec4<f32>) -> VertexOut {
    var out: VertexOut;
    out.clip = vec4<f32>(position, 1.0);
    out.color = color;
    return out;
}

@fragment
fn fs_main(@location(0) color: vec4<f32>) -> @location(0) vec4<f32> {
    return color;
}
"#;

    fn spirv_bytes(stage: ShaderStage, entry: &str) -> Vec<u8> {
        let words = compile_wgsl(MESH_WGSL, stage, entry).unwrap();
        bytemuck::cast_slice(&words).to_vec()
    }

    /// Every entry point of `source` in one SPIR-V module.
    fn whole_module_bytes(source: &str) -> Vec<u8> {
        let module = naga::front::wgsl::parse_str(source).unwrap();
        let info = naga::valid::Validator::new(
            naga::valid::ValidationFlags::all(),
            naga::valid::Capabilities::all(),
        )
        .validate(&module)
        .unwrap();
        let options = naga::back::spv::Options {
            lang_version: (1, 3),
            flags: naga::back::spv::WriterFlags::DEBUG,
            ..Default::default()
        };
        let words = naga::back::spv::write_vec(&module, &info, &options, None).unwrap();
        bytemuck::cast_slice(&words).to_vec()
    }

    fn locations(vars: &[InterfaceVariable]) -> Vec<u32> {
        vars.iter().map(|v| v.location).collect()
    }

    #[test]
    fn test_reflect_vertex_stage() {
        let vertex = reflect_stage(&spirv_bytes(ShaderStage::Vertex, "vs_main"), ShaderStage::Vertex)
            .unwrap();

        assert_eq!(vertex.entry_point, "vs_main");
        let camera = vertex
            .bindings
            .iter()
            .find(|b| (b.set, b.binding) == (0, 0))
            .unwrap();
        assert_eq!(camera.kind, ResourceKind::UniformBuffer);
        assert_eq!(camera.stages, StageFlags::VERTEX);
        assert_eq!(camera.size, 80);
        assert_eq!(camera.name.as_deref(), Some("camera"));

        assert_eq!(locations(&vertex.inputs), vec![A_POSITION, A_NORMAL, A_UV0]);
        assert_eq!(vertex.inputs[0].format, InterfaceFormat::float(3));
        assert_eq!(vertex.inputs[2].format, InterfaceFormat::float(2));

        // The clip position is a built-in and is not reported.
        assert_eq!(vertex.outputs.len(), 2);
        assert_eq!(vertex.push_constant_size, Some(64));
    }

    #[test]
    fn test_reflect_fragment_stage() {
        let fragment = reflect_stage(
            &spirv_bytes(ShaderStage::Fragment, "fs_main"),
            ShaderStage::Fragment,
        )
        .unwrap();

        let kinds: Vec<(u32, u32, ResourceKind)> = fragment
            .bindings
            .iter()
            .filter(|b| b.set == 1)
            .map(|b| (b.set, b.binding, b.kind))
            .collect();
        assert_eq!(
            kinds,
            vec![
                (1, 0, ResourceKind::UniformBuffer),
                (1, 1, ResourceKind::SampledImage),
                (1, 2, ResourceKind::Sampler),
            ]
        );
        assert_eq!(fragment.outputs.len(), 1);
        assert_eq!(fragment.outputs[0].format, InterfaceFormat::float(4));
    }

    #[test]
    fn test_entry_points_keep_their_own_interfaces() {
        let stages = reflect_spirv(&whole_module_bytes(PAIR_WGSL)).unwrap();
        assert_eq!(stages.len(), 2);
        let vertex = stages.iter().find(|s| s.stage == ShaderStage::Vertex).unwrap();
        let fragment = stages.iter().find(|s| s.stage == ShaderStage::Fragment).unwrap();

        assert_eq!(vertex.entry_point, "vs_main");
        assert_eq!(locations(&vertex.inputs), vec![0, 1]);
        assert_eq!(vertex.inputs[0].format, InterfaceFormat::float(3));
        assert_eq!(locations(&vertex.outputs), vec![0]);
        assert_eq!(fragment.entry_point, "fs_main");
        assert_eq!(locations(&fragment.inputs), vec![0]);
        assert_eq!(locations(&fragment.outputs), vec![0]);

        check_interface(&vertex.outputs, &fragment.inputs).unwrap();
        let info = ShaderReflectionInfo::merge(stages.clone()).unwrap();
        info.check_stage_interface().unwrap();
        assert_eq!(info.fragment_output_count(), 1);
    }

    #[test]
    fn test_rejects_malformed_bytecode() {
        assert!(matches!(
            reflect_spirv(&[0u8; 7]),
            Err(GraphicsError::InvalidBytecode(_))
        ));
        assert!(matches!(
            reflect_spirv(&[0u8; 8]),
            Err(GraphicsError::InvalidBytecode(_))
        ));
        assert!(matches!(
            reflect_spirv(&[0u8; 40]),
            Err(GraphicsError::InvalidBytecode(_))
        ));

        // Valid header, then an OpName that claims more words than remain.
        let words = [MAGIC, 0x0001_0000, 0, 16, 0, (9 << 16) | 5];
        assert!(matches!(
            reflect_spirv(bytemuck::cast_slice(&words)),
            Err(GraphicsError::InvalidBytecode(_))
        ));
    }

    fn inst(opcode: u32, operands: &[u32]) -> Vec<u32> {
        let mut words = vec![((operands.len() as u32 + 1) << 16) | opcode];
        words.extend_from_slice(operands);
        words
    }

    fn string(s: &str) -> Vec<u32> {
        let mut bytes = s.as_bytes().to_vec();
        bytes.push(0);
        while bytes.len() % 4 != 0 {
            bytes.push(0);
        }
        bytes
            .chunks_exact(4)
            .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect()
    }

    /// A fragment module that loads `uniform sampler2D textures[4]` at set 2, binding 3.
    fn combined_sampler_module() -> Vec<u32> {
        let mut words = vec![MAGIC, 0x0001_0000, 0, 20, 0];
        // OpCapability Shader, OpMemoryModel Logical GLSL450
        words.extend(inst(17, &[1]));
        words.extend(inst(14, &[0, 1]));
        let mut entry = vec![4, 1];
        entry.extend(string("main"));
        words.extend(inst(15, &entry));
        // OriginUpperLeft
        words.extend(inst(16, &[1, 7]));
        let mut name = vec![10];
        name.extend(string("textures"));
        words.extend(inst(5, &name));
        // DescriptorSet 2, Binding 3
        words.extend(inst(71, &[10, 34, 2]));
        words.extend(inst(71, &[10, 33, 3]));
        words.extend(inst(19, &[11]));
        words.extend(inst(33, &[12, 11]));
        words.extend(inst(22, &[2, 32]));
        words.extend(inst(25, &[3, 2, 1, 0, 0, 0, 1, 0]));
        words.extend(inst(27, &[4, 3]));
        words.extend(inst(21, &[5, 32, 0]));
        words.extend(inst(43, &[5, 6, 4]));
        words.extend(inst(28, &[7, 4, 6]));
        // UniformConstant pointer and variable
        words.extend(inst(32, &[8, 0, 7]));
        words.extend(inst(59, &[8, 10, 0]));
        words.extend(inst(54, &[11, 1, 0, 12]));
        words.extend(inst(248, &[13]));
        words.extend(inst(61, &[7, 14, 10]));
        words.extend(inst(253, &[]));
        words.extend(inst(56, &[]));
        words
    }

    #[test]
    fn test_reflect_combined_sampler_array() {
        let words = combined_sampler_module();
        let stages = reflect_spirv(bytemuck::cast_slice(&words)).unwrap();
        assert_eq!(stages.len(), 1);
        assert_eq!(stages[0].stage, ShaderStage::Fragment);

        let binding = &stages[0].bindings[0];
        assert_eq!((binding.set, binding.binding), (2, 3));
        assert_eq!(binding.kind, ResourceKind::CombinedImageSampler);
        assert_eq!(binding.count, 4);
        assert_eq!(binding.name.as_deref(), Some("textures"));
    }

    #[test]
    fn test_missing_stage_is_reported() {
        let words = combined_sampler_module();
        assert!(matches!(
            reflect_stage(bytemuck::cast_slice(&words), ShaderStage::Vertex),
            Err(GraphicsError::InvalidBytecode(_))
        ));
    }
}
