//! UBI devices over raw NAND
//!
//! Volumes are laid out deepest mountpoint first, so volume indices are
//! stable and the target's `<mapped_node>_<index>` character devices line
//! up with the generated fstab. The content of each volume is packaged
//! from the shared build tree with `mkfs.ubifs`; optionally all volumes
//! are combined into a single ubinize image the installer writes with one
//! `ubiformat`.

use std::fmt::Write as _;
use std::path::PathBuf;

use tracing::{debug, info};

use crate::config::INSTALLER_STAGING_PATH;
use crate::device::{mount_options, BuildContext, PartitionDescriptor};
use crate::error::BuildError;
use crate::infra::filesystem;
use crate::installer::{ActionKind, InstallerAction};
use crate::layout::mountpoint_depth;
use crate::spec::{UbiSpec, UbiVolumeSpec};

pub struct UbiDevice {
    spec: UbiSpec,
    /// Volumes sorted deepest mountpoint first; index is the volume id
    ordered: Vec<UbiVolumeSpec>,
    /// ubinize output image
    filename: PathBuf,
}

impl UbiDevice {
    pub fn new(spec: UbiSpec, ctx: &BuildContext) -> Self {
        let mut ordered = spec.volumes.clone();
        ordered.sort_by_key(|v| std::cmp::Reverse(mountpoint_depth(&v.mountpoint)));

        let extension = if spec.ubinize { "ubi" } else { "img" };
        let filename = ctx
            .build_dir
            .join(format!("{}.{extension}", node_basename(&spec.mapped_node)));

        UbiDevice {
            spec,
            ordered,
            filename,
        }
    }

    pub fn base_mountpoint(&self) -> String {
        self.ordered
            .last()
            .map(|v| v.mountpoint.clone())
            .unwrap_or_else(|| "/".to_string())
    }

    /// The target-side device node of a volume
    fn volume_node(&self, index: usize) -> String {
        format!("{}_{index}", self.spec.mapped_node)
    }

    /// Local image file a volume is packaged into
    fn volume_image(&self, index: usize, ctx: &BuildContext) -> PathBuf {
        ctx.build_dir
            .join(format!("{}_{index}.img", node_basename(&self.spec.mapped_node)))
    }

    /// Package every volume's subtree into its ubifs image, then
    /// optionally combine them with ubinize
    pub fn package_into(&mut self, base: &std::path::Path, ctx: &BuildContext) -> Result<(), BuildError> {
        let leb = self.spec.logical_eraseblock_size;
        for (index, volume) in self.ordered.iter().enumerate() {
            let tree = base.join(&volume.mountpoint[1..]);
            let image = self.volume_image(index, ctx);
            // One spare eraseblock's worth of headroom
            let max_leb_count = ((volume.size + 1) * 1024 * 1024) / leb;

            info!(
                volume = volume.volume_name().as_str(),
                mountpoint = volume.mountpoint.as_str(),
                "packaging ubifs volume"
            );
            ctx.tools.formatter.mkfs_ubifs(
                &tree,
                &image,
                leb,
                max_leb_count,
                self.spec.minimum_unit_size,
            )?;

            // The subtree now lives in the volume image; leave an empty
            // mountpoint behind
            filesystem::remove_dir_all(&tree)?;
            filesystem::create_dir_all(&tree)?;
        }

        if self.spec.ubinize {
            self.ubinize(ctx)?;
        }
        Ok(())
    }

    fn ubinize(&self, ctx: &BuildContext) -> Result<(), BuildError> {
        let config_path = ctx.build_dir.join("ubifs.conf");
        let mut config = String::new();
        for (index, volume) in self.ordered.iter().enumerate() {
            let _ = writeln!(config, "[{}]", volume.volume_name());
            let _ = writeln!(config, "mode=ubi");
            let _ = writeln!(config, "image={}", self.volume_image(index, ctx).display());
            let _ = writeln!(config, "vol_id={index}");
            let _ = writeln!(config, "vol_size={}MiB", volume.size);
            let _ = writeln!(
                config,
                "vol_type={}",
                if volume.immutable { "static" } else { "dynamic" }
            );
            let _ = writeln!(config, "vol_name={}", volume.volume_name());
            if index == self.ordered.len() - 1 {
                // The shallowest volume soaks up the remaining space
                let _ = writeln!(config, "vol_flags=autoresize");
            }
            let _ = writeln!(config);
        }
        filesystem::write_file(&config_path, &config)?;

        debug!(output = %self.filename.display(), "running ubinize");
        ctx.tools.formatter.ubinize(
            &self.filename,
            self.spec
                .physical_eraseblock_size
                .unwrap_or(self.spec.logical_eraseblock_size),
            self.spec.minimum_unit_size,
            self.spec.subpage_size,
            &config_path,
        )?;

        for index in 0..self.ordered.len() {
            let image = self.volume_image(index, ctx);
            std::fs::remove_file(&image).map_err(BuildError::from)?;
        }
        std::fs::remove_file(&config_path).map_err(BuildError::from)?;
        Ok(())
    }

    pub fn device_files(&self) -> Vec<PathBuf> {
        if self.spec.ubinize {
            return vec![self.filename.clone()];
        }
        (0..self.ordered.len())
            .map(|index| {
                self.filename
                    .with_file_name(format!("{}_{index}.img", node_basename(&self.spec.mapped_node)))
            })
            .collect()
    }

    pub fn fstab_entries(&self) -> Result<Vec<String>, BuildError> {
        let mut entries = Vec::new();
        for (index, volume) in self.ordered.iter().enumerate() {
            let options = mount_options(
                volume.options.as_deref(),
                Some("ubifs"),
                &volume.mountpoint,
                volume.readonly,
            )?;
            entries.push(format!(
                "{} {} ubifs {options} 0 0",
                self.volume_node(index),
                volume.mountpoint
            ));
        }
        Ok(entries)
    }

    pub fn installer_actions(&self) -> Vec<InstallerAction> {
        let Some(install_device) = self.spec.install_device.clone() else {
            return Vec::new();
        };

        if self.spec.ubinize {
            let source = format!(
                "{INSTALLER_STAGING_PATH}{}",
                self.filename
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_default()
            );
            return vec![InstallerAction {
                target: Some(install_device),
                source: Some(source),
                subpage_size: self.spec.subpage_size,
                run_on_full_flash: true,
                run_on_partial_flash: true,
                ..InstallerAction::new(ActionKind::UbiFormat)
            }];
        }

        let mut actions = vec![InstallerAction {
            target: Some(install_device.clone()),
            subpage_size: self.spec.subpage_size,
            run_on_full_flash: true,
            // Reformatting the whole UBI would wipe the preserved volumes
            run_on_partial_flash: false,
            ..InstallerAction::new(ActionKind::UbiFormat)
        }];
        for (index, volume) in self.ordered.iter().enumerate() {
            actions.push(InstallerAction {
                target: Some(self.volume_node(index)),
                size: Some(volume.size),
                source: Some(format!(
                    "{INSTALLER_STAGING_PATH}{}_{index}.img",
                    node_basename(&self.spec.mapped_node)
                )),
                name: Some(volume.volume_name()),
                parent_device: Some(install_device.clone()),
                immutable: Some(volume.immutable),
                run_on_full_flash: true,
                run_on_partial_flash: !volume.mountpoint.starts_with("/var"),
                ..InstallerAction::new(ActionKind::UbiUpdateVol)
            });
        }
        actions
    }

    pub fn partitions(&self) -> Vec<PartitionDescriptor> {
        self.ordered
            .iter()
            .enumerate()
            .map(|(index, volume)| PartitionDescriptor {
                mountpoint: volume.mountpoint.clone(),
                install_device: self.volume_node(index),
                label: None,
                mapped_ubi_node: Some(self.spec.mapped_node.clone()),
                parent_device: self.spec.install_device.clone(),
            })
            .collect()
    }
}

fn node_basename(node: &str) -> &str {
    node.rsplit('/').next().unwrap_or(node)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infra::tools::testing;

    fn ubi_spec() -> UbiSpec {
        UbiSpec {
            mapped_node: "/dev/ubi0".to_string(),
            install_device: Some("/dev/mtd3".to_string()),
            volumes: vec![
                UbiVolumeSpec {
                    mountpoint: "/".to_string(),
                    size: 80,
                    name: None,
                    immutable: false,
                    readonly: None,
                    options: None,
                },
                UbiVolumeSpec {
                    mountpoint: "/var".to_string(),
                    size: 16,
                    name: None,
                    immutable: false,
                    readonly: None,
                    options: None,
                },
            ],
            logical_eraseblock_size: 126_976,
            minimum_unit_size: 2048,
            physical_eraseblock_size: Some(131_072),
            subpage_size: Some(512),
            ubinize: false,
        }
    }

    fn ctx(tools: &crate::infra::tools::Toolset) -> BuildContext<'_> {
        BuildContext {
            build_dir: PathBuf::from("/tmp/build"),
            image_name: "demo".to_string(),
            sector_size: 512,
            tools,
        }
    }

    #[test]
    fn volumes_are_ordered_deepest_first() {
        let tools = testing::fake_toolset();
        let device = UbiDevice::new(ubi_spec(), &ctx(&tools));
        assert_eq!(device.ordered[0].mountpoint, "/var");
        assert_eq!(device.ordered[1].mountpoint, "/");
        assert_eq!(device.base_mountpoint(), "/");
    }

    #[test]
    fn volume_nodes_follow_layout_order() {
        let tools = testing::fake_toolset();
        let device = UbiDevice::new(ubi_spec(), &ctx(&tools));
        let descriptors = device.partitions();
        assert_eq!(descriptors[0].install_device, "/dev/ubi0_0");
        assert_eq!(descriptors[0].mountpoint, "/var");
        assert_eq!(descriptors[1].install_device, "/dev/ubi0_1");
        assert!(descriptors[0].is_ubi());
        assert_eq!(descriptors[0].parent_device.as_deref(), Some("/dev/mtd3"));
    }

    #[test]
    fn per_volume_actions_gate_var_on_partial_flash() {
        let tools = testing::fake_toolset();
        let device = UbiDevice::new(ubi_spec(), &ctx(&tools));
        let actions = device.installer_actions();
        assert_eq!(actions.len(), 3);
        assert!(matches!(actions[0].kind, ActionKind::UbiFormat));
        assert!(!actions[0].run_on_partial_flash);
        // /var volume, id 0
        assert!(matches!(actions[1].kind, ActionKind::UbiUpdateVol));
        assert_eq!(actions[1].target.as_deref(), Some("/dev/ubi0_0"));
        assert!(!actions[1].run_on_partial_flash);
        // rootfs volume, id 1
        assert_eq!(actions[2].name.as_deref(), Some("rootfs"));
        assert_eq!(actions[2].source.as_deref(), Some("/installer/ubi0_1.img"));
        assert!(actions[2].run_on_partial_flash);
    }

    #[test]
    fn ubinize_collapses_to_one_action() {
        let tools = testing::fake_toolset();
        let mut spec = ubi_spec();
        spec.ubinize = true;
        let device = UbiDevice::new(spec, &ctx(&tools));
        let actions = device.installer_actions();
        assert_eq!(actions.len(), 1);
        assert!(matches!(actions[0].kind, ActionKind::UbiFormat));
        assert_eq!(actions[0].source.as_deref(), Some("/installer/ubi0.ubi"));
        assert!(actions[0].run_on_partial_flash);
        assert_eq!(device.device_files(), vec![PathBuf::from("/tmp/build/ubi0.ubi")]);
    }

    #[test]
    fn fstab_lists_volume_nodes() {
        let tools = testing::fake_toolset();
        let device = UbiDevice::new(ubi_spec(), &ctx(&tools));
        let entries = device.fstab_entries().unwrap();
        assert_eq!(
            entries,
            vec![
                "/dev/ubi0_0 /var ubifs defaults,noatime,relatime 0 0",
                "/dev/ubi0_1 / ubifs ro 0 0",
            ]
        );
    }
}
