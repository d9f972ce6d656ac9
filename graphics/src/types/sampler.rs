//! Sampler types and descriptors.

/// Texture coordinate addressing outside `[0, 1]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum AddressMode {
    /// Clamp to the edge texel.
    #[default]
    ClampToEdge,
    /// Wrap around.
    Repeat,
    /// Wrap around, mirroring every other repetition.
    MirrorRepeat,
}

/// Texel filtering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum FilterMode {
    /// Nearest texel.
    #[default]
    Nearest,
    /// Linear interpolation.
    Linear,
}

/// Comparison function for depth sampling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CompareFunction {
    Never,
    Less,
    Equal,
    LessEqual,
    Greater,
    NotEqual,
    GreaterEqual,
    Always,
}

/// Descriptor for creating a sampler.
#[derive(Debug, Clone, PartialEq)]
pub struct SamplerDescriptor {
    /// Address mode for U coordinate.
    pub address_mode_u: AddressMode,
    /// Address mode for V coordinate.
    pub address_mode_v: AddressMode,
    /// Address mode for W coordinate.
    pub address_mode_w: AddressMode,
    /// Magnification filter.
    pub mag_filter: FilterMode,
    /// Minification filter.
    pub min_filter: FilterMode,
    /// Mipmap filter.
    pub mipmap_filter: FilterMode,
    /// Maximum LOD clamp.
    pub lod_max_clamp: f32,
    /// Comparison function for depth sampling.
    pub compare: Option<CompareFunction>,
    /// Maximum anisotropy level (1 disables anisotropic filtering).
    pub anisotropy_clamp: u16,
}

impl SamplerDescriptor {
    /// Create a linear filtering sampler.
    pub fn linear() -> Self {
        Self {
            mag_filter: FilterMode::Linear,
            min_filter: FilterMode::Linear,
            mipmap_filter: FilterMode::Linear,
            ..Default::default()
        }
    }

    /// Create a nearest neighbor filtering sampler.
    pub fn nearest() -> Self {
        Self::default()
    }

    /// Set address mode for all coordinates.
    pub fn with_address_mode(mut self, mode: AddressMode) -> Self {
        self.address_mode_u = mode;
        self.address_mode_v = mode;
        self.address_mode_w = mode;
        self
    }

    /// Set comparison function for depth sampling.
    pub fn with_compare(mut self, compare: CompareFunction) -> Self {
        self.compare = Some(compare);
        self
    }

    /// Set anisotropic filtering level.
    pub fn with_anisotropy(mut self, level: u16) -> Self {
        self.anisotropy_clamp = level;
        self
    }
}

impl Default for SamplerDescriptor {
    fn default() -> Self {
        Self {
            address_mode_u: AddressMode::ClampToEdge,
            address_mode_v: AddressMode::ClampToEdge,
            address_mode_w: AddressMode::ClampToEdge,
            mag_filter: FilterMode::Nearest,
            min_filter: FilterMode::Nearest,
            mipmap_filter: FilterMode::Nearest,
            lod_max_clamp: 32.0,
            compare: None,
            anisotropy_clamp: 1,
        }
    }
}
