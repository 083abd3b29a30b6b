// Compute kernel compilation
//
// The ray-tracing kernel ships as GLSL source and is compiled to SPIR-V
// at runtime with shaderc, so a changed kernel file can be picked up by
// the hot-reload path without a rebuild of the binary.

use anyhow::{Context, Result};
use ash::vk;
use std::path::Path;

use super::DeviceContext;

/// Compile the GLSL compute kernel at `path` to SPIR-V words.
///
/// A compile failure is fatal; the returned error chain carries the
/// compiler's full diagnostic text.
pub fn compile_kernel(path: &Path) -> Result<Vec<u32>> {
    let source = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read compute kernel {}", path.display()))?;

    let compiler = shaderc::Compiler::new().context("Failed to initialize shader compiler")?;
    let mut options =
        shaderc::CompileOptions::new().context("Failed to create shader compile options")?;
    options.set_optimization_level(shaderc::OptimizationLevel::Performance);

    let file_name = path
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("kernel.comp");

    let artifact = compiler
        .compile_into_spirv(
            &source,
            shaderc::ShaderKind::Compute,
            file_name,
            "main",
            Some(&options),
        )
        .with_context(|| format!("Failed to compile compute kernel {}", path.display()))?;

    log::info!(
        "Compiled {} ({} warnings)",
        path.display(),
        artifact.get_num_warnings()
    );

    Ok(artifact.as_binary().to_vec())
}

/// Wrap compiled SPIR-V words in a shader module.
pub fn create_shader_module(ctx: &DeviceContext, code: &[u32]) -> Result<vk::ShaderModule> {
    let create_info = vk::ShaderModuleCreateInfo::builder().code(code);

    unsafe {
        ctx.device
            .create_shader_module(&create_info, None)
            .context("Failed to create shader module")
    }
}
