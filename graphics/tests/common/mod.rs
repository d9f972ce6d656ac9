//! Common utilities for GPU integration tests.
//!
//! Every test builds a [`TestContext`]; on machines without a Vulkan device
//! it is `None` and the test returns early after printing a notice.

#![allow(dead_code)]

use lumen_graphics::{
    ContextParameters, DeviceContext, Image, PipelineFactory, TextureDescriptor, TextureFormat,
    TextureUsage,
};

/// A headless context with validation off.
pub struct TestContext {
    pub ctx: DeviceContext,
}

impl TestContext {
    /// Create a context, or `None` when no Vulkan device is available.
    pub fn new() -> Option<Self> {
        let _ = env_logger::builder().is_test(true).try_init();
        let params = ContextParameters::new()
            .with_app_name("lumen-graphics-tests")
            .with_validation(false);
        match DeviceContext::initialize(params, None) {
            Ok(ctx) => Some(Self { ctx }),
            Err(e) => {
                eprintln!("skipping GPU test: {e}");
                None
            }
        }
    }

    pub fn factory(&self) -> PipelineFactory {
        PipelineFactory::new(&self.ctx).expect("Failed to create pipeline factory")
    }

    /// A sampled RGBA8 image filled with `pixels`.
    pub fn create_texture_rgba8(&self, width: u32, height: u32, pixels: &[u8]) -> Image {
        let image = self
            .ctx
            .create_image(&TextureDescriptor::new_2d(
                width,
                height,
                TextureFormat::Rgba8Unorm,
                TextureUsage::TEXTURE_BINDING | TextureUsage::COPY_DST | TextureUsage::COPY_SRC,
            ))
            .expect("Failed to create image");
        self.ctx
            .upload_image(&image, pixels)
            .expect("Failed to upload image");
        image
    }
}

/// Decode native-endian `f32` texels; readback bytes carry no alignment.
pub fn decode_f32(bytes: &[u8]) -> Vec<f32> {
    bytes
        .chunks_exact(4)
        .map(|c| f32::from_ne_bytes([c[0], c[1], c[2], c[3]]))
        .collect()
}

/// RGBA of pixel (x, y) in tightly packed RGBA8 data, as floats in [0, 1].
pub fn rgba8_pixel(data: &[u8], width: u32, x: u32, y: u32) -> [f32; 4] {
    let offset = ((y * width + x) * 4) as usize;
    let texel = &data[offset..offset + 4];
    [0, 1, 2, 3].map(|i| f32::from(texel[i]) / 255.0)
}

/// Check every channel of `actual` is within `tolerance` of `expected`.
pub fn assert_close(actual: [f32; 4], expected: [f32; 4], tolerance: f32, what: &str) {
    for (channel, (a, e)) in actual.iter().zip(expected.iter()).enumerate() {
        assert!(
            (a - e).abs() <= tolerance,
            "{what}: channel {channel} is {a}, expected {e} (actual {actual:?}, expected {expected:?})"
        );
    }
}

/// Vertex and fragment shader drawing meshes in a flat colour, with the draw
/// transform in push constants.
pub const FLAT_COLOR_SHADER: &str = r#"
struct DrawConstants {
    mvp: mat4x4<f32>,
};

struct Material {
    color: vec4<f32>,
};

var<push_constant> draw: DrawConstants;
@group(0) @binding(0) var<uniform> material: Material;

@vertex
fn vs_main(@location(0) position: vec3<f32>) -> @builtin(position) vec4<f32> {
    return draw.mvp * vec4<f32>(position, 1.0);
}

@fragment
fn fs_main() -> @location(0) vec4<f32> {
    return material.color;
}
"#;
