//! Check command implementation
//!
//! Validates a layout file: parses it, assembles the device set and
//! compiles the installer program, reporting errors without building.

use std::path::Path;

use anyhow::{Context, Result};

use crate::device::{assemble_devices, BuildContext};
use crate::infra::tools::Toolset;
use crate::installer::compiler;
use crate::spec::ImageSpec;

/// Execute the check command
pub fn execute(layout: &Path) -> Result<()> {
    let spec = ImageSpec::from_file(layout)
        .with_context(|| format!("Failed to load layout {}", layout.display()))?;

    let tools = Toolset::system();
    let ctx = BuildContext {
        build_dir: std::env::temp_dir(),
        image_name: spec.name.clone(),
        sector_size: spec.sector_size(),
        tools: &tools,
    };
    let devices = assemble_devices(&spec, &ctx).context("Invalid device layout")?;
    let program = compiler::compile(&spec, &devices, None, None)
        .context("Installer program does not compile")?;

    println!(
        "{}: {} devices, {} installer actions",
        spec.name,
        devices.len(),
        program.actions.len()
    );
    Ok(())
}
