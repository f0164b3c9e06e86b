// Shader loading
//
// Shaders are precompiled SPIR-V (see build.rs) loaded by name at startup.
// The bytecode is kept as u32 words so it can go straight into a module.

use anyhow::{Context, Result};
use ash::vk;
use std::fs::File;
use std::path::Path;

use crate::error::FatalError;

pub const VERTEX_SHADER: &str = "cube.vert.spv";
pub const FRAGMENT_SHADER: &str = "cube.frag.spv";

/// SPIR-V for the cube pipeline.
#[derive(Debug, Clone, Default)]
pub struct ShaderSet {
    pub vertex: Vec<u32>,
    pub fragment: Vec<u32>,
}

impl ShaderSet {
    /// Load `cube.vert.spv` and `cube.frag.spv` from `dir`.
    pub fn load<P: AsRef<Path>>(dir: P) -> Result<Self> {
        let dir = dir.as_ref();
        let shaders = Self {
            vertex: read_spirv(&dir.join(VERTEX_SHADER))?,
            fragment: read_spirv(&dir.join(FRAGMENT_SHADER))?,
        };
        log::info!(
            "Loaded shaders from {:?} ({} + {} words)",
            dir,
            shaders.vertex.len(),
            shaders.fragment.len()
        );
        Ok(shaders)
    }
}

fn read_spirv(path: &Path) -> Result<Vec<u32>> {
    let mut file =
        File::open(path).with_context(|| format!("Failed to open shader {:?}", path))?;
    // read_spv checks the magic number and handles alignment
    ash::util::read_spv(&mut file).with_context(|| format!("Invalid SPIR-V in {:?}", path))
}

/// Create a shader module from SPIR-V words.
pub fn create_shader_module(device: &ash::Device, code: &[u32]) -> Result<vk::ShaderModule> {
    let create_info = vk::ShaderModuleCreateInfo::builder().code(code);
    let module = unsafe { device.create_shader_module(&create_info, None) }
        .map_err(FatalError::api("vkCreateShaderModule"))?;
    Ok(module)
}
