//! Command line options.

use std::path::PathBuf;

/// Options parsed from the command line.
#[derive(Debug, Clone)]
pub struct DemoArgs {
    /// Frames to run after the initial build.
    pub frames: u32,
    /// Instances per mesh.
    pub instances: u32,
    /// Rebuild the top-level structure every frame instead of updating it.
    pub rebuild: bool,
    /// Directory holding `raygen.rgen.spv`, `miss.rmiss.spv` and `hit.rchit.spv`.
    pub shader_dir: Option<PathBuf>,
    pub validation: bool,
    pub width: u32,
    pub height: u32,
}

impl Default for DemoArgs {
    fn default() -> Self {
        Self {
            frames: 120,
            instances: 4,
            rebuild: false,
            shader_dir: None,
            validation: cfg!(debug_assertions),
            width: 320,
            height: 180,
        }
    }
}

impl DemoArgs {
    pub fn from_env() -> Self {
        Self::parse(std::env::args().skip(1))
    }

    /// Parse options. Unknown flags and unparsable values are ignored.
    pub fn parse<I: IntoIterator<Item = String>>(args: I) -> Self {
        let mut parsed = Self::default();
        let args: Vec<String> = args.into_iter().collect();

        let mut i = 0;
        while i < args.len() {
            let value = args.get(i + 1);
            match args[i].as_str() {
                "--frames" => {
                    if let Some(v) = value.and_then(|v| v.parse().ok()) {
                        parsed.frames = v;
                        i += 1;
                    }
                }
                "--instances" => {
                    if let Some(v) = value.and_then(|v| v.parse::<u32>().ok()) {
                        parsed.instances = v.max(1);
                        i += 1;
                    }
                }
                "--width" => {
                    if let Some(v) = value.and_then(|v| v.parse::<u32>().ok()) {
                        parsed.width = v.max(1);
                        i += 1;
                    }
                }
                "--height" => {
                    if let Some(v) = value.and_then(|v| v.parse::<u32>().ok()) {
                        parsed.height = v.max(1);
                        i += 1;
                    }
                }
                "--shader-dir" => {
                    if let Some(v) = value {
                        parsed.shader_dir = Some(PathBuf::from(v));
                        i += 1;
                    }
                }
                "--rebuild" => parsed.rebuild = true,
                "--validation" => parsed.validation = true,
                "--no-validation" => parsed.validation = false,
                _ => {}
            }
            i += 1;
        }

        parsed
    }
}

pub fn print_help() {
    eprintln!(
        "raykit headless ray tracing demo

USAGE:
    cargo run -p raykit-demo -- [OPTIONS]

OPTIONS:
    --frames <N>        Frames to run after the initial build (default: 120)
    --instances <N>     Instances of each mesh (default: 4)
    --rebuild           Rebuild the top level structure every frame
                        instead of updating it
    --shader-dir <DIR>  Trace rays with raygen.rgen.spv, miss.rmiss.spv and
                        hit.rchit.spv from DIR
    --width <N>         Dispatch width (default: 320)
    --height <N>        Dispatch height (default: 180)
    --validation        Enable Vulkan validation layers
    --no-validation     Disable Vulkan validation layers
    -h, --help          Print this help message

ENVIRONMENT VARIABLES:
    RUST_LOG            Set log level (e.g., info, debug, trace)"
    );
}
