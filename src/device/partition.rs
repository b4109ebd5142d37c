//! Standalone partitions on a physical device node
//!
//! A partition device backs one mountpoint with a single raw filesystem
//! image. The installer writes that image straight onto the declared
//! partition node with `dd`; the partition table itself is compiled
//! separately from the slots all partition devices declare.

use std::fs::OpenOptions;
use std::path::{Path, PathBuf};

use tracing::info;

use crate::config::INSTALLER_STAGING_PATH;
use crate::device::{mount_options, BuildContext, PartitionDescriptor};
use crate::error::{BuildError, SpecError};
use crate::infra::{filesystem, loopdev::LoopBinding};
use crate::installer::{ActionKind, InstallerAction};
use crate::layout::TableKind;
use crate::spec::PartitionSpec;

/// A single formatted partition, or the recovery partition
pub struct PartitionDevice {
    spec: PartitionSpec,
    recovery: bool,
    kind: TableKind,
    filename: PathBuf,
    mount_path: Option<PathBuf>,
}

impl PartitionDevice {
    pub fn new(spec: PartitionSpec, recovery: bool, kind: TableKind, ctx: &BuildContext) -> Self {
        // Artifact name follows the target node, falling back to the host
        // device, then the image name
        let stem = spec
            .install_device
            .as_deref()
            .or(spec.device.as_deref())
            .map(basename)
            .unwrap_or(&ctx.image_name);
        let filename = ctx.build_dir.join(format!("{stem}.raw"));
        PartitionDevice {
            spec,
            recovery,
            kind,
            filename,
            mount_path: None,
        }
    }

    pub fn base_mountpoint(&self) -> Option<String> {
        Some(self.mountpoint().to_string())
    }

    /// The mountpoint on the target; recovery partitions always mount at
    /// `/recovery`
    fn mountpoint(&self) -> &str {
        self.spec
            .mountpoint
            .as_deref()
            .unwrap_or(if self.recovery { "/recovery" } else { "/" })
    }

    pub fn table_slot(&self) -> (&PartitionSpec, TableKind) {
        (&self.spec, self.kind)
    }

    /// Allocate the backing file and format it. The recovery partition is
    /// created on the target by the installer, never locally.
    pub fn create(&mut self, ctx: &BuildContext) -> Result<(), BuildError> {
        if self.recovery {
            return Ok(());
        }
        let size = self.require("size", self.spec.size)?;
        let filesystem = self.spec.filesystem.clone();
        let filesystem = self.require("filesystem", filesystem)?;

        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&self.filename)?;
        file.set_len(size * 1024 * 1024)?;
        drop(file);

        info!(
            mountpoint = self.mountpoint(),
            filesystem, "formatting partition"
        );
        let binding = LoopBinding::attach(ctx.tools.mounter.as_ref(), &self.filename, None, None)?;
        ctx.tools
            .formatter
            .mkfs(binding.node(), &filesystem, self.spec.label.as_deref())?;
        binding.detach()?;
        Ok(())
    }

    pub fn mount(&mut self, base: &Path, ctx: &BuildContext) -> Result<(), BuildError> {
        if self.recovery {
            return Ok(());
        }
        let target = base.join(&self.mountpoint()[1..]);
        filesystem::create_dir_all(&target)?;
        ctx.tools.mounter.mount(&self.filename, &target, None)?;
        self.mount_path = Some(target);
        Ok(())
    }

    pub fn unmount(&mut self, ctx: &BuildContext) -> Result<(), BuildError> {
        if let Some(target) = self.mount_path.take() {
            ctx.tools.mounter.unmount(&target)?;
        }
        Ok(())
    }

    pub fn device_files(&self) -> Vec<PathBuf> {
        if self.recovery {
            return Vec::new();
        }
        vec![self.filename.clone()]
    }

    pub fn fstab_entries(&self) -> Result<Vec<String>, BuildError> {
        let mountpoint = if self.recovery {
            "/recovery"
        } else {
            self.mountpoint()
        };
        let check_fs = u8::from(mountpoint.starts_with("/var"));

        let reference = match (&self.spec.label, &self.spec.install_device, &self.spec.device) {
            (Some(label), _, _) => format!("LABEL=\"{label}\""),
            (None, Some(node), _) => node.clone(),
            (None, None, Some(node)) => node.clone(),
            (None, None, None) => return Ok(Vec::new()),
        };

        let filesystem = self.spec.filesystem.as_deref().unwrap_or("auto");
        let mut options = mount_options(
            self.spec.options.as_deref(),
            self.spec.filesystem.as_deref(),
            mountpoint,
            self.spec.readonly,
        )?;
        if self.recovery {
            options.push_str(",noauto");
        }

        Ok(vec![format!(
            "{reference} {mountpoint} {filesystem} {options} 0 {check_fs}"
        )])
    }

    pub fn installer_actions(&self) -> Vec<InstallerAction> {
        let Some(install_device) = self.spec.install_device.clone() else {
            // Image-only partition, the installer never touches it
            return Vec::new();
        };

        if self.recovery {
            // The installer formats the recovery partition and populates it
            // with itself; doing either from recovery would be circular.
            return vec![
                InstallerAction {
                    target: Some(install_device.clone()),
                    filesystem: self.spec.filesystem.clone(),
                    filesystem_label: self.spec.label.clone(),
                    run_on_full_flash: true,
                    run_on_partial_flash: true,
                    run_in_recovery_mode: Some(false),
                    ..InstallerAction::new(ActionKind::Mkfs)
                },
                InstallerAction {
                    target: Some(install_device),
                    filesystem_label: self.spec.label.clone(),
                    run_on_full_flash: true,
                    run_on_partial_flash: true,
                    run_in_recovery_mode: Some(false),
                    ..InstallerAction::new(ActionKind::CopyRecovery)
                },
            ];
        }

        let source = format!(
            "{INSTALLER_STAGING_PATH}{}",
            self.filename
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default()
        );
        vec![InstallerAction {
            source: Some(source),
            target: Some(install_device),
            start_sector: self.spec.start_sector,
            partition_type: self.spec.partition_type.clone(),
            name: self.spec.name.clone(),
            filesystem_label: self.spec.label.clone(),
            flags: self.spec.flags.clone(),
            run_on_full_flash: true,
            // User data partitions survive a partial reflash
            run_on_partial_flash: !self.mountpoint().starts_with("/var"),
            ..InstallerAction::new(ActionKind::Dd)
        }]
    }

    pub fn partitions(&self) -> Vec<PartitionDescriptor> {
        let Some(install_device) = self.spec.install_device.clone() else {
            return Vec::new();
        };
        vec![PartitionDescriptor {
            mountpoint: self.mountpoint().to_string(),
            install_device,
            label: self.spec.label.clone(),
            mapped_ubi_node: None,
            parent_device: None,
        }]
    }

    fn require<T>(&self, field: &str, value: Option<T>) -> Result<T, SpecError> {
        value.ok_or_else(|| SpecError::MissingField {
            device: self.mountpoint().to_string(),
            field: field.to_string(),
        })
    }
}

/// A table slot with no filesystem. Reserves its place in the compiled
/// partition table and produces nothing else.
pub struct BlankDevice {
    spec: PartitionSpec,
    kind: TableKind,
}

impl BlankDevice {
    pub fn new(spec: PartitionSpec, kind: TableKind) -> Self {
        BlankDevice { spec, kind }
    }

    pub fn table_slot(&self) -> (&PartitionSpec, TableKind) {
        (&self.spec, self.kind)
    }
}

fn basename(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infra::tools::Toolset;

    fn ctx(tools: &Toolset) -> BuildContext<'_> {
        BuildContext {
            build_dir: PathBuf::from("/tmp/build"),
            image_name: "demo-rolling".to_string(),
            sector_size: 512,
            tools,
        }
    }

    fn spec() -> PartitionSpec {
        PartitionSpec {
            mountpoint: Some("/var".to_string()),
            size: Some(128),
            filesystem: Some("ext4".to_string()),
            label: Some("data".to_string()),
            install_device: Some("/dev/mmcblk0p3".to_string()),
            ..PartitionSpec::default()
        }
    }

    #[test]
    fn filename_follows_install_device() {
        let tools = crate::infra::tools::testing::fake_toolset();
        let device = PartitionDevice::new(spec(), false, TableKind::Msdos, &ctx(&tools));
        assert_eq!(device.filename, PathBuf::from("/tmp/build/mmcblk0p3.raw"));
    }

    #[test]
    fn var_partition_skips_partial_flash() {
        let tools = crate::infra::tools::testing::fake_toolset();
        let device = PartitionDevice::new(spec(), false, TableKind::Msdos, &ctx(&tools));
        let actions = device.installer_actions();
        assert_eq!(actions.len(), 1);
        assert!(actions[0].run_on_full_flash);
        assert!(!actions[0].run_on_partial_flash);
        assert_eq!(actions[0].source.as_deref(), Some("/installer/mmcblk0p3.raw"));
    }

    #[test]
    fn recovery_emits_mkfs_and_copy() {
        let tools = crate::infra::tools::testing::fake_toolset();
        let mut s = spec();
        s.mountpoint = None;
        let device = PartitionDevice::new(s, true, TableKind::Msdos, &ctx(&tools));
        let actions = device.installer_actions();
        assert_eq!(actions.len(), 2);
        assert!(matches!(actions[0].kind, ActionKind::Mkfs));
        assert!(matches!(actions[1].kind, ActionKind::CopyRecovery));
        assert_eq!(actions[0].run_in_recovery_mode, Some(false));
        assert_eq!(actions[1].run_in_recovery_mode, Some(false));
    }

    #[test]
    fn fstab_prefers_label_and_marks_var_for_fsck() {
        let tools = crate::infra::tools::testing::fake_toolset();
        let device = PartitionDevice::new(spec(), false, TableKind::Msdos, &ctx(&tools));
        let entries = device.fstab_entries().unwrap();
        assert_eq!(
            entries,
            vec!["LABEL=\"data\" /var ext4 defaults,noatime,relatime,discard 0 1"]
        );
    }

    #[test]
    fn recovery_fstab_is_noauto() {
        let tools = crate::infra::tools::testing::fake_toolset();
        let mut s = spec();
        s.mountpoint = None;
        let device = PartitionDevice::new(s, true, TableKind::Msdos, &ctx(&tools));
        let entries = device.fstab_entries().unwrap();
        assert_eq!(
            entries,
            vec!["LABEL=\"data\" /recovery ext4 defaults,noatime,relatime,discard,noauto 0 0"]
        );
    }
}
