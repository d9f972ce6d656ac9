//! Fixed-function state of graphics pipelines and the standard vertex layout.

use bytemuck::{Pod, Zeroable};

use crate::error::{GraphicsError, GraphicsResult};
use crate::reflect::{InterfaceFormat, InterfaceVariable, A_NORMAL, A_POSITION, A_UV0, A_UV1};
use crate::types::CompareFunction;

/// The vertex every mesh stream is laid out as.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Default, Pod, Zeroable)]
pub struct Vertex {
    pub position: [f32; 3],
    pub normal: [f32; 3],
    pub uv0: [f32; 2],
    pub uv1: [f32; 2],
}

static_assertions::const_assert_eq!(std::mem::size_of::<Vertex>(), 40);

impl Vertex {
    pub fn new(position: [f32; 3], normal: [f32; 3], uv0: [f32; 2]) -> Self {
        Self {
            position,
            normal,
            uv0,
            uv1: uv0,
        }
    }
}

/// One attribute of the standard vertex stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VertexAttribute {
    pub location: u32,
    pub format: InterfaceFormat,
    pub offset: u32,
}

const STANDARD_ATTRIBUTES: [VertexAttribute; 4] = [
    VertexAttribute {
        location: A_POSITION,
        format: float(3),
        offset: 0,
    },
    VertexAttribute {
        location: A_NORMAL,
        format: float(3),
        offset: 12,
    },
    VertexAttribute {
        location: A_UV0,
        format: float(2),
        offset: 24,
    },
    VertexAttribute {
        location: A_UV1,
        format: float(2),
        offset: 32,
    },
];

const fn float(components: u8) -> InterfaceFormat {
    InterfaceFormat {
        kind: crate::reflect::NumericKind::Float,
        components,
        width: 4,
    }
}

/// Where vertex data comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum VertexInput {
    /// Vertices are generated from the vertex index.
    None,
    /// One interleaved [`Vertex`] stream at binding 0.
    #[default]
    Standard,
}

impl VertexInput {
    pub fn stride(self) -> u32 {
        match self {
            VertexInput::None => 0,
            VertexInput::Standard => std::mem::size_of::<Vertex>() as u32,
        }
    }

    /// Attributes feeding the shader inputs the vertex stage declares.
    pub fn attributes(self, inputs: &[InterfaceVariable]) -> GraphicsResult<Vec<VertexAttribute>> {
        inputs
            .iter()
            .map(|input| {
                let available = match self {
                    VertexInput::None => None,
                    VertexInput::Standard => {
                        STANDARD_ATTRIBUTES.iter().find(|a| a.location == input.location)
                    }
                };
                match available {
                    None => Err(GraphicsError::StageInterfaceMismatch(format!(
                        "vertex input {:?} at location {} has no vertex stream",
                        input.name, input.location
                    ))),
                    Some(attribute) if attribute.format != input.format => {
                        Err(GraphicsError::StageInterfaceMismatch(format!(
                            "vertex input {:?} at location {} is {:?}, stream provides {:?}",
                            input.name, input.location, input.format, attribute.format
                        )))
                    }
                    Some(attribute) => Ok(*attribute),
                }
            })
            .collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CullMode {
    None,
    Front,
    #[default]
    Back,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FrontFace {
    #[default]
    CounterClockwise,
    Clockwise,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Topology {
    #[default]
    TriangleList,
    TriangleStrip,
    LineList,
    PointList,
}

/// Colour blending applied to every attachment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BlendMode {
    #[default]
    Opaque,
    /// `src * a + dst * (1 - a)`.
    AlphaBlend,
    /// `src + dst`.
    Additive,
}

/// Constant and slope depth bias.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DepthBias {
    pub constant: f32,
    pub slope: f32,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DepthState {
    pub test: bool,
    pub write: bool,
    pub compare: CompareFunction,
    pub bias: Option<DepthBias>,
}

impl Default for DepthState {
    fn default() -> Self {
        Self {
            test: true,
            write: true,
            compare: CompareFunction::Less,
            bias: None,
        }
    }
}

impl DepthState {
    pub fn disabled() -> Self {
        Self {
            test: false,
            write: false,
            compare: CompareFunction::Always,
            bias: None,
        }
    }
}

/// Everything about a graphics pipeline that is not a shader.
///
/// Viewport and scissor are always dynamic.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FixedFunctionState {
    pub vertex_input: VertexInput,
    pub topology: Topology,
    pub cull_mode: CullMode,
    pub front_face: FrontFace,
    pub blend: BlendMode,
    pub depth: DepthState,
    /// Depth bias is set per draw instead of baked in.
    pub dynamic_depth_bias: bool,
}

impl Default for FixedFunctionState {
    fn default() -> Self {
        Self::opaque()
    }
}

impl FixedFunctionState {
    /// Back-face culled, depth tested and written, no blending.
    pub fn opaque() -> Self {
        Self {
            vertex_input: VertexInput::Standard,
            topology: Topology::TriangleList,
            cull_mode: CullMode::Back,
            front_face: FrontFace::CounterClockwise,
            blend: BlendMode::Opaque,
            depth: DepthState::default(),
            dynamic_depth_bias: false,
        }
    }

    /// Alpha blended, depth tested but not written.
    pub fn alpha_blended() -> Self {
        Self {
            blend: BlendMode::AlphaBlend,
            depth: DepthState {
                write: false,
                ..DepthState::default()
            },
            ..Self::opaque()
        }
    }

    /// Depth-only rendering into a shadow map, bias set per light.
    pub fn shadow() -> Self {
        Self {
            dynamic_depth_bias: true,
            ..Self::opaque()
        }
    }

    /// A unit cube generated from the vertex index, seen from inside.
    pub fn cube_proxy() -> Self {
        Self {
            vertex_input: VertexInput::None,
            cull_mode: CullMode::None,
            depth: DepthState::disabled(),
            ..Self::opaque()
        }
    }

    pub fn with_cull_mode(mut self, cull_mode: CullMode) -> Self {
        self.cull_mode = cull_mode;
        self
    }

    pub fn with_topology(mut self, topology: Topology) -> Self {
        self.topology = topology;
        self
    }

    pub fn with_blend(mut self, blend: BlendMode) -> Self {
        self.blend = blend;
        self
    }

    pub fn with_depth(mut self, depth: DepthState) -> Self {
        self.depth = depth;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reflect::NumericKind;

    fn input(location: u32, format: InterfaceFormat) -> InterfaceVariable {
        InterfaceVariable {
            location,
            format,
            name: None,
        }
    }

    #[test]
    fn test_standard_attributes_follow_declared_inputs() {
        let inputs = [input(A_POSITION, float(3)), input(A_UV0, float(2))];
        let attributes = VertexInput::Standard.attributes(&inputs).unwrap();
        let offsets: Vec<u32> = attributes.iter().map(|a| a.offset).collect();
        assert_eq!(offsets, vec![0, 24]);
        assert_eq!(VertexInput::Standard.stride(), 40);
    }

    #[test]
    fn test_attribute_format_mismatch() {
        let inputs = [input(A_NORMAL, float(4))];
        assert!(matches!(
            VertexInput::Standard.attributes(&inputs),
            Err(GraphicsError::StageInterfaceMismatch(_))
        ));

        let integer = InterfaceFormat {
            kind: NumericKind::Sint,
            components: 2,
            width: 4,
        };
        assert!(VertexInput::Standard.attributes(&[input(A_UV1, integer)]).is_err());
    }

    #[test]
    fn test_unknown_location_and_no_stream() {
        assert!(VertexInput::Standard.attributes(&[input(7, float(4))]).is_err());
        assert!(VertexInput::None.attributes(&[input(A_POSITION, float(3))]).is_err());
        assert!(VertexInput::None.attributes(&[]).unwrap().is_empty());
    }

    #[test]
    fn test_presets() {
        assert!(!FixedFunctionState::alpha_blended().depth.write);
        assert!(FixedFunctionState::shadow().dynamic_depth_bias);
        let proxy = FixedFunctionState::cube_proxy();
        assert_eq!(proxy.cull_mode, CullMode::None);
        assert_eq!(proxy.vertex_input, VertexInput::None);
    }

    #[test]
    fn test_vertex_is_pod() {
        let vertex = Vertex::new([1.0, 2.0, 3.0], [0.0, 1.0, 0.0], [0.5, 0.5]);
        let bytes: &[u8] = bytemuck::bytes_of(&vertex);
        assert_eq!(bytes.len(), 40);
        assert_eq!(&bytes[0..4], &1.0f32.to_ne_bytes());
    }
}
