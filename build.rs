// Build script to compile GLSL shaders to SPIR-V
//
// The binaries land next to the sources, where `graphics.shader_dir` points
// by default.

use std::path::Path;
use std::process::Command;

const SHADERS: [(&str, &str); 2] = [
    ("shaders/cube.vert", "shaders/cube.vert.spv"),
    ("shaders/cube.frag", "shaders/cube.frag.spv"),
];

fn main() {
    for (input, _) in SHADERS {
        println!("cargo:rerun-if-changed={}", input);
    }

    // Compile shaders using glslc (part of Vulkan SDK)
    for (input, output) in SHADERS {
        compile_shader(input, output);
    }
}

fn compile_shader(input: &str, output: &str) {
    let input_path = Path::new(input);
    let output_path = Path::new(output);

    let result = Command::new("glslc")
        .arg(input_path)
        .arg("-o")
        .arg(output_path)
        .status();

    match result {
        Ok(status) if status.success() => {}
        Ok(status) => {
            panic!("Failed to compile {}: exit code {:?}", input, status.code());
        }
        Err(e) => {
            // Not fatal: prebuilt .spv files may already be in place
            println!("cargo:warning=glslc not found ({}), {} not rebuilt", e, output);
            println!("cargo:warning=Install the Vulkan SDK or run: glslc {} -o {}", input, output);
        }
    }
}
