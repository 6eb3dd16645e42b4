// build.rs
// Precompiles the bundled shaders to SPIR-V when a Vulkan SDK is available

use std::env;
use std::path::{Path, PathBuf};
use std::process::Command;

fn main() {
    println!("cargo:rerun-if-changed=shaders");
    println!("cargo:rerun-if-env-changed=VULKAN_SDK");
    println!("cargo:rerun-if-env-changed=SKIP_SHADERS");

    if env::var_os("SKIP_SHADERS").is_some() {
        eprintln!("info: Skipping shader compilation (SKIP_SHADERS set)");
        return;
    }

    // Without the SDK the renderer compiles the embedded sources at runtime
    let Some(vulkan_sdk) = env::var_os("VULKAN_SDK") else {
        eprintln!("warning: VULKAN_SDK not set, shader precompilation skipped");
        return;
    };

    let glslc = if cfg!(target_os = "windows") {
        PathBuf::from(vulkan_sdk).join("Bin").join("glslc.exe")
    } else {
        PathBuf::from(vulkan_sdk).join("bin").join("glslc")
    };
    if !glslc.exists() {
        eprintln!("warning: glslc not found at {}, shader precompilation skipped", glslc.display());
        return;
    }

    let shader_dir = Path::new("shaders");
    let target_dir = Path::new("../../target/shaders");
    if let Err(e) = std::fs::create_dir_all(target_dir) {
        eprintln!("warning: Failed to create {}: {}", target_dir.display(), e);
        return;
    }

    let entries = match std::fs::read_dir(shader_dir) {
        Ok(entries) => entries,
        Err(_) => {
            eprintln!("info: No shader directory found at {}", shader_dir.display());
            return;
        }
    };

    let mut compiled = 0;
    for entry in entries.flatten() {
        let path = entry.path();
        let is_shader = path.extension().is_some_and(|ext| ext == "vert" || ext == "frag");
        let Some(file_name) = path.file_name().filter(|_| is_shader) else {
            continue;
        };

        // sprite.vert -> sprite.vert.spv
        let mut out_name = file_name.to_os_string();
        out_name.push(".spv");
        let out_file = target_dir.join(out_name);

        let up_to_date = match (std::fs::metadata(&path), std::fs::metadata(&out_file)) {
            (Ok(src), Ok(dst)) => matches!((src.modified(), dst.modified()), (Ok(s), Ok(d)) if s <= d),
            _ => false,
        };
        if up_to_date {
            continue;
        }

        let status = Command::new(&glslc).arg(&path).arg("-o").arg(&out_file).status();
        match status {
            Ok(s) if s.success() => compiled += 1,
            Ok(s) => panic!("glslc failed for {} with {}", path.display(), s),
            Err(e) => panic!("Failed to run glslc for {}: {}", path.display(), e),
        }
    }

    if compiled > 0 {
        eprintln!("info: Compiled {} shader(s)", compiled);
    }
}
