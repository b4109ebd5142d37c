//! Image build pipeline
//!
//! Drives one build end to end: create every device's backing artifact,
//! mount the mountable ones into a shared tree, unpack the rootfs into
//! it, run per-device extraction hooks, regenerate the fstab, unmount,
//! package, and compile the installer program.

pub mod archive;
pub mod fstab;
pub mod metadata;

use std::path::{Path, PathBuf};

use tracing::info;

use crate::config::{INSTALLER_PROGRAM_FILENAME, INSTALLER_PROGRAM_IMAGE_PATH};
use crate::device::{assemble_devices, depth_of, BuildContext, Device};
use crate::error::BuildError;
use crate::infra::{filesystem, tools::Toolset};
use crate::installer::{compiler, InstallerProgram};
use crate::spec::ImageSpec;

/// Variant/version selection for one build
#[derive(Debug, Clone, Default)]
pub struct BuildOptions {
    pub variant: Option<String>,
    pub version: Option<String>,
    /// Directory the per-build `build-<image>` tree is created under
    pub work_dir: PathBuf,
}

/// Everything a finished build leaves behind
pub struct BuildArtifacts {
    /// Device image files, in device declaration order
    pub device_files: Vec<PathBuf>,

    /// Serialized installer program
    pub installer_program: PathBuf,

    /// The compiled program itself
    pub program: InstallerProgram,
}

/// One image build over an assembled device set
pub struct ImageBuilder<'a> {
    spec: ImageSpec,
    options: BuildOptions,
    image_name: String,
    build_dir: PathBuf,
    mount_dir: PathBuf,
    devices: Vec<Device>,
    tools: &'a Toolset,
}

impl<'a> ImageBuilder<'a> {
    pub fn new(
        spec: ImageSpec,
        options: BuildOptions,
        tools: &'a Toolset,
    ) -> Result<Self, BuildError> {
        let mut image_name = spec.name.clone();
        if let Some(variant) = &options.variant {
            image_name.push('_');
            image_name.push_str(variant);
        }
        if let Some(version) = &options.version {
            image_name.push('-');
            image_name.push_str(version);
        }

        let build_dir = options.work_dir.join(format!("build-{image_name}"));
        let mount_dir = build_dir.join("rootfs");
        filesystem::create_dir_all(&build_dir)?;
        filesystem::create_dir_all(&mount_dir)?;

        let ctx = BuildContext {
            build_dir: build_dir.clone(),
            image_name: image_name.clone(),
            sector_size: spec.sector_size(),
            tools,
        };
        let devices = assemble_devices(&spec, &ctx)?;

        Ok(ImageBuilder {
            spec,
            options,
            image_name,
            build_dir,
            mount_dir,
            devices,
            tools,
        })
    }

    pub fn image_name(&self) -> &str {
        &self.image_name
    }

    pub fn build_dir(&self) -> &Path {
        &self.build_dir
    }

    fn context(&self) -> BuildContext<'a> {
        BuildContext {
            build_dir: self.build_dir.clone(),
            image_name: self.image_name.clone(),
            sector_size: self.spec.sector_size(),
            tools: self.tools,
        }
    }

    /// Run the whole pipeline over an already-built rootfs archive
    pub fn build(&mut self, rootfs_archive: &Path) -> Result<BuildArtifacts, BuildError> {
        let ctx = self.context();

        info!(image = self.image_name.as_str(), "creating devices");
        for device in &mut self.devices {
            device.create(&ctx)?;
        }

        // Shallow mountpoints first so nothing gets obscured
        let mount_dir = self.mount_dir.clone();
        for idx in self.ordered_indices(|d| d.can_be_mounted(), false) {
            self.devices[idx].mount(&mount_dir, &ctx)?;
        }

        info!(archive = %rootfs_archive.display(), "unpacking rootfs");
        archive::extract_rootfs(rootfs_archive, &mount_dir)?;

        for device in &mut self.devices {
            if device.needs_file_extraction() {
                device.extract_file(&mount_dir, &ctx)?;
            }
        }

        fstab::regenerate(&mount_dir, &self.devices, &self.spec, &ctx)?;

        let program = compiler::compile(
            &self.spec,
            &self.devices,
            self.options.variant.as_deref(),
            self.options.version.as_deref(),
        )?;
        let serialized = program.to_json()?;

        // The installed system carries its own program copy
        let staged = mount_dir
            .join(&INSTALLER_PROGRAM_IMAGE_PATH[1..])
            .join(INSTALLER_PROGRAM_FILENAME);
        filesystem::write_file(&staged, &serialized)?;

        // Unmount deepest first, the exact reverse of mounting
        for idx in self.ordered_indices(|d| d.can_be_mounted(), true) {
            self.devices[idx].unmount(&ctx)?;
        }

        // Package innermost trees first so outer volumes see the
        // emptied mountpoints
        for idx in self.ordered_indices(|d| d.can_be_packaged(), true) {
            self.devices[idx].package_into(&mount_dir, &ctx)?;
        }

        let installer_program = self.build_dir.join(INSTALLER_PROGRAM_FILENAME);
        filesystem::write_file(&installer_program, &serialized)?;
        info!(program = %installer_program.display(), "installer program written");

        let device_files = self
            .devices
            .iter()
            .flat_map(Device::device_files)
            .collect();
        Ok(BuildArtifacts {
            device_files,
            installer_program,
            program,
        })
    }

    /// Indices of matching devices ordered by base mountpoint depth
    fn ordered_indices(&self, keep: impl Fn(&Device) -> bool, reverse: bool) -> Vec<usize> {
        let mut indices: Vec<usize> = self
            .devices
            .iter()
            .enumerate()
            .filter(|(_, d)| keep(d))
            .map(|(i, _)| i)
            .collect();
        if reverse {
            // Ties keep declaration order in both directions
            indices.sort_by_key(|&i| std::cmp::Reverse(depth_of(&self.devices[i])));
        } else {
            indices.sort_by_key(|&i| depth_of(&self.devices[i]));
        }
        indices
    }
}
