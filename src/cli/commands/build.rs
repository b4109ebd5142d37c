//! Build command implementation
//!
//! Implements `imgforge build` to produce device images, the generated
//! fstab and the installer program from a layout and a rootfs archive.

use std::path::PathBuf;

use anyhow::{bail, Context, Result};

use crate::infra::{filesystem, tools::Toolset};
use crate::pipeline::{archive, metadata::ImageMetadata, BuildOptions, ImageBuilder};
use crate::spec::ImageSpec;

/// Build command arguments
pub struct BuildArgs {
    /// Path to the image layout file
    pub layout: PathBuf,
    /// Rootfs archive to unpack into the image
    pub rootfs: PathBuf,
    /// Appliance variant appended to the image name
    pub variant: Option<String>,
    /// Appliance version
    pub version: Option<String>,
    /// Directory the build tree is created under
    pub work_dir: PathBuf,
    /// Package listing file embedded in the image metadata
    pub packages: Option<PathBuf>,
    /// Compress artifacts even if the layout does not ask for it
    pub compress: bool,
}

/// Execute the build command
pub fn execute(args: BuildArgs) -> Result<()> {
    if !args.rootfs.exists() {
        bail!("Rootfs archive not found: {}", args.rootfs.display());
    }

    let spec = ImageSpec::from_file(&args.layout)
        .with_context(|| format!("Failed to load layout {}", args.layout.display()))?;

    Toolset::preflight().context("Missing required system tools")?;
    let tools = Toolset::system();

    tracing::info!("Building image: {}", spec.name);

    let compress = args.compress || spec.compress;
    let format = spec.compression_format.unwrap_or_default();

    let options = BuildOptions {
        variant: args.variant,
        version: args.version.clone(),
        work_dir: args.work_dir,
    };
    let mut builder = ImageBuilder::new(spec, options, &tools)
        .context("Failed to assemble the device layout")?;
    let image_name = builder.image_name().to_string();
    let build_dir = builder.build_dir().to_path_buf();

    let artifacts = builder
        .build(&args.rootfs)
        .with_context(|| format!("Build of '{image_name}' failed"))?;

    let (payload, payload_files) = if compress {
        compress_payload(&artifacts.device_files, &build_dir, &image_name, format)?
    } else {
        (None, artifacts.device_files.clone())
    };

    let meta = ImageMetadata::generate(
        &artifacts.program.appliance_name,
        args.version.as_deref(),
        payload.as_deref(),
        args.packages.as_deref(),
    )?;
    let meta_path = build_dir.join(format!("{image_name}.json"));
    filesystem::write_file(&meta_path, &meta.to_json()?)?;

    for file in &payload_files {
        println!("{}", file.display());
    }
    println!("{}", artifacts.installer_program.display());
    println!("{}", meta_path.display());

    tracing::info!("Build of '{image_name}' complete");
    Ok(())
}

/// Compress the produced device files. Several files become one tarball,
/// a single file is compressed in place.
fn compress_payload(
    device_files: &[PathBuf],
    build_dir: &std::path::Path,
    image_name: &str,
    format: crate::spec::CompressionFormat,
) -> Result<(Option<PathBuf>, Vec<PathBuf>)> {
    if device_files.len() > 1 {
        let out = build_dir.join(format!("{image_name}.{}", format.tar_extension()));
        archive::compress_artifacts(device_files, build_dir, &out, format)
            .context("Failed to compress artifacts")?;
        for file in device_files {
            std::fs::remove_file(file)
                .with_context(|| format!("Failed to remove {}", file.display()))?;
        }
        Ok((Some(out.clone()), vec![out]))
    } else if let Some(file) = device_files.first() {
        let out = archive::compress_file(file, format)
            .with_context(|| format!("Failed to compress {}", file.display()))?;
        Ok((Some(out.clone()), vec![out]))
    } else {
        Ok((None, Vec::new()))
    }
}
