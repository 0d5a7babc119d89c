// Shader module loading
//
// Shaders are compiled to SPIR-V by build.rs and read from disk at startup,
// so a shader directory can be swapped without rebuilding.

use anyhow::{Context, Result};
use ash::vk;
use std::fs::File;
use std::path::Path;

use super::VulkanDevice;

/// Load a `.spv` file and create a shader module from it
pub fn load_shader_module(device: &VulkanDevice, path: &Path) -> Result<vk::ShaderModule> {
    let mut file = File::open(path)
        .with_context(|| format!("Failed to open shader {:?} (was it compiled by build.rs?)", path))?;
    // Handles alignment and endianness of the word stream
    let code = ash::util::read_spv(&mut file)
        .with_context(|| format!("Invalid SPIR-V in {:?}", path))?;

    let create_info = vk::ShaderModuleCreateInfo::default().code(&code);

    unsafe { device.device.create_shader_module(&create_info, None) }
        .with_context(|| format!("Failed to create shader module from {:?}", path))
}
