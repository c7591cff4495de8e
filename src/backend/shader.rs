// Shader module loading
//
// Vulkan consumes SPIR-V words. Shaders are compiled by build.rs (glslc) and
// loaded at runtime, so a missing compiler only disables drawing.

use anyhow::{Context, Result};
use ash::vk;
use std::path::Path;

/// Read a compiled SPIR-V file into properly aligned words
pub fn load_spirv<P: AsRef<Path>>(path: P) -> Result<Vec<u32>> {
    let path = path.as_ref();
    let mut file = std::fs::File::open(path)
        .with_context(|| format!("Failed to open shader {:?}", path))?;
    ash::util::read_spv(&mut file)
        .with_context(|| format!("Invalid SPIR-V in {:?}", path))
}

/// Create a shader module from SPIR-V words
pub fn create_shader_module(device: &ash::Device, code: &[u32]) -> Result<vk::ShaderModule> {
    anyhow::ensure!(!code.is_empty(), "Shader code is empty");

    let create_info = vk::ShaderModuleCreateInfo::builder()
        .code(code);

    unsafe {
        device.create_shader_module(&create_info, None)
            .context("Failed to create shader module")
    }
}
