//! Inspect command implementation
//!
//! Compiles the installer program of a layout and prints it, without
//! touching any device image or requiring the system tools.

use std::path::Path;

use anyhow::{Context, Result};

use crate::device::{assemble_devices, BuildContext};
use crate::infra::tools::Toolset;
use crate::installer::compiler;
use crate::spec::ImageSpec;

/// Execute the inspect command
pub fn execute(
    layout: &Path,
    variant: Option<&str>,
    version: Option<&str>,
    compact: bool,
) -> Result<()> {
    let spec = ImageSpec::from_file(layout)
        .with_context(|| format!("Failed to load layout {}", layout.display()))?;

    let tools = Toolset::system();
    let ctx = BuildContext {
        build_dir: std::env::temp_dir(),
        image_name: spec.name.clone(),
        sector_size: spec.sector_size(),
        tools: &tools,
    };
    let devices =
        assemble_devices(&spec, &ctx).context("Failed to assemble the device layout")?;

    let program = compiler::compile(&spec, &devices, variant, version)
        .context("Failed to compile the installer program")?;

    let rendered = if compact {
        program.to_json()?
    } else {
        program.to_pretty_json()?
    };
    println!("{rendered}");
    Ok(())
}
