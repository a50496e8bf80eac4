use std::ffi::c_void;
use std::path::PathBuf;
use std::ptr;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use clshim::backend::ffi::{cl_platform_id, cl_uint, CL_PLATFORM_NAME, CL_SUCCESS};
use clshim::backend::{candidate_paths, EntryKind};
use clshim::{Intercept, ShimConfig};
use serde::Serialize;

#[derive(Parser, Debug)]
#[command(name = "clshim-probe", version)]
#[command(about = "Inspect how clshim resolves an OpenCL backend", long_about = None)]
struct Cli {
    /// Backend library to load instead of the platform defaults
    #[arg(long, global = true)]
    library: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// List backend candidates in search order
    Candidates,
    /// Load the backend and print the resolution report
    Resolve {
        /// Print the report as JSON
        #[arg(long)]
        json: bool,
        /// Include resolved slots, not just missing ones
        #[arg(long)]
        all: bool,
    },
    /// Resolve extension entry points on the first platform
    Extension {
        /// Extension function names
        #[arg(required = true)]
        names: Vec<String>,
    },
}

#[derive(Serialize)]
struct ExtensionResult<'a> {
    name: &'a str,
    address: Option<String>,
    error: Option<String>,
}

fn main() -> anyhow::Result<()> {
    clshim::logging::init_logging_default();
    let cli = Cli::parse();

    let mut config = ShimConfig::from_env();
    if let Some(library) = &cli.library {
        config = config.with_library_override(library);
    }

    match cli.command {
        Commands::Candidates => {
            for path in candidate_paths(config.library_override.as_deref()) {
                println!("{}", path.display());
            }
        }
        Commands::Resolve { json, all } => {
            let shim = Intercept::initialize(config).context("invalid configuration")?;
            let report = shim.resolution_report();
            if json {
                println!("{}", serde_json::to_string_pretty(report)?);
            } else {
                println!("library: {}", report.library);
                println!(
                    "resolved: {}/{}",
                    report.resolved_count(),
                    report.entries.len()
                );
                for entry in &report.entries {
                    if entry.is_resolved() && !all {
                        continue;
                    }
                    let kind = match entry.kind {
                        EntryKind::Required => "required",
                        EntryKind::Optional => "optional",
                    };
                    match entry.address {
                        Some(address) => println!("  {:<44} {kind:<8} {address:#x}", entry.name),
                        None => println!("  {:<44} {kind:<8} stub", entry.name),
                    }
                }
            }
            if !shim.is_backend_loaded() {
                bail!("no usable backend");
            }
        }
        Commands::Extension { names } => {
            let shim = Intercept::initialize(config).context("invalid configuration")?;
            if !shim.is_backend_loaded() {
                bail!("no usable backend");
            }
            let platform = first_platform(&shim)?;
            eprintln!("platform: {}", platform_name(&shim, platform));

            let results: Vec<ExtensionResult<'_>> = names
                .iter()
                .map(|name| match shim.resolve_extension(platform, name) {
                    Ok(address) => ExtensionResult {
                        name,
                        address: Some(format!("{:#x}", address.as_ptr() as usize)),
                        error: None,
                    },
                    Err(err) => ExtensionResult {
                        name,
                        address: None,
                        error: Some(err.to_string()),
                    },
                })
                .collect();
            println!("{}", serde_json::to_string_pretty(&results)?);
        }
    }
    Ok(())
}

fn first_platform(shim: &Intercept) -> anyhow::Result<cl_platform_id> {
    let mut platform: cl_platform_id = ptr::null_mut();
    let mut count: cl_uint = 0;
    // SAFETY: both out-pointers are live locals of the advertised size.
    let status = unsafe { (shim.dispatch().clGetPlatformIDs)(1, &mut platform, &mut count) };
    if status != CL_SUCCESS || count == 0 {
        bail!("clGetPlatformIDs failed with status {status}");
    }
    Ok(platform)
}

fn platform_name(shim: &Intercept, platform: cl_platform_id) -> String {
    let mut buffer = [0u8; 256];
    let mut size = 0usize;
    // SAFETY: the buffer length is passed along and outlives the call.
    let status = unsafe {
        (shim.dispatch().clGetPlatformInfo)(
            platform,
            CL_PLATFORM_NAME,
            buffer.len(),
            buffer.as_mut_ptr() as *mut c_void,
            &mut size,
        )
    };
    if status != CL_SUCCESS {
        return String::from("<unknown>");
    }
    let len = size.min(buffer.len());
    String::from_utf8_lossy(&buffer[..len])
        .trim_end_matches('\0')
        .to_string()
}
