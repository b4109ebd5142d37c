//! Storage device abstraction
//!
//! One [`Device`] per entry of the spec's device list. Every variant
//! satisfies the same capability contract — mountable, packageable,
//! fstab-bearing, extraction-needing — and the pipeline branches only on
//! those capabilities, never on the concrete variant. Variant-specific
//! code is limited to geometry math and artifact packaging.

pub mod nand;
pub mod partition;
pub mod raw;
pub mod ubi;

use std::path::{Path, PathBuf};

use crate::error::{BuildError, LayoutError, SpecError};
use crate::infra::tools::Toolset;
use crate::installer::InstallerAction;
use crate::config::ALIGNMENT_BYTES;
use crate::layout::{mib_to_sectors, mountpoint_depth, TableKind};
use crate::spec::{DeviceSpec, ImageSpec, PartitionSpec};

pub use nand::NandFileDevice;
pub use partition::{BlankDevice, PartitionDevice};
pub use raw::RawDevice;
pub use ubi::UbiDevice;

/// Shared build-time state handed to device operations
pub struct BuildContext<'a> {
    /// Per-build scratch directory holding every produced artifact
    pub build_dir: PathBuf,

    /// Full image name (`name[_variant][-version]`)
    pub image_name: String,

    /// Sector size of the target storage in bytes
    pub sector_size: u64,

    /// Partitioning/formatting/mounting implementations
    pub tools: &'a Toolset,
}

/// Flat partition descriptor exposed for fstab generation and the
/// installer compiler's mountpoint resolution
#[derive(Debug, Clone)]
pub struct PartitionDescriptor {
    pub mountpoint: String,
    pub install_device: String,
    pub label: Option<String>,

    /// UBI node the volume maps to, when UBI-backed
    pub mapped_ubi_node: Option<String>,

    /// MTD device owning the UBI volume
    pub parent_device: Option<String>,
}

impl PartitionDescriptor {
    /// UBI-backed partitions need attach/detach brackets around erases
    pub fn is_ubi(&self) -> bool {
        self.install_device.contains("ubi")
    }
}

/// One storage target of the build
pub enum Device {
    Blank(BlankDevice),
    Partition(PartitionDevice),
    Raw(RawDevice),
    NandFile(NandFileDevice),
    Ubi(UbiDevice),
}

impl Device {
    pub fn can_be_mounted(&self) -> bool {
        matches!(self, Device::Partition(_) | Device::Raw(_))
    }

    pub fn can_be_packaged(&self) -> bool {
        matches!(self, Device::Ubi(_))
    }

    pub fn has_fstab_entries(&self) -> bool {
        matches!(
            self,
            Device::Partition(_) | Device::Raw(_) | Device::Ubi(_)
        )
    }

    pub fn needs_file_extraction(&self) -> bool {
        match self {
            Device::Raw(d) => d.needs_file_extraction(),
            Device::NandFile(_) => true,
            _ => false,
        }
    }

    /// Shallowest mountpoint this device serves; `None` for devices with
    /// no mount presence
    pub fn base_mountpoint(&self) -> Option<String> {
        match self {
            Device::Partition(d) => d.base_mountpoint(),
            Device::Raw(d) => d.base_mountpoint(),
            Device::Ubi(d) => Some(d.base_mountpoint()),
            _ => None,
        }
    }

    /// Produce the local build artifact backing this device
    pub fn create(&mut self, ctx: &BuildContext) -> Result<(), BuildError> {
        match self {
            Device::Partition(d) => d.create(ctx),
            Device::Raw(d) => d.create(ctx),
            // Blank, NAND and UBI devices materialize later or not at all
            _ => Ok(()),
        }
    }

    /// Mount the device below the shared build tree
    pub fn mount(&mut self, base: &Path, ctx: &BuildContext) -> Result<(), BuildError> {
        match self {
            Device::Partition(d) => d.mount(base, ctx),
            Device::Raw(d) => d.mount(base, ctx),
            _ => Ok(()),
        }
    }

    /// Unmount; exact reverse of mount
    pub fn unmount(&mut self, ctx: &BuildContext) -> Result<(), BuildError> {
        match self {
            Device::Partition(d) => d.unmount(ctx),
            Device::Raw(d) => d.unmount(ctx),
            _ => Ok(()),
        }
    }

    /// Package the mounted tree into this device's image format
    pub fn package_into(&mut self, base: &Path, ctx: &BuildContext) -> Result<(), BuildError> {
        match self {
            Device::Ubi(d) => d.package_into(base, ctx),
            _ => Ok(()),
        }
    }

    /// Per-device extraction hook run while the tree is still mounted
    pub fn extract_file(&mut self, base: &Path, ctx: &BuildContext) -> Result<(), BuildError> {
        match self {
            Device::Raw(d) => d.extract_file(base, ctx),
            Device::NandFile(d) => d.extract_file(base, ctx),
            _ => Ok(()),
        }
    }

    /// Local artifact files this device produced
    pub fn device_files(&self) -> Vec<PathBuf> {
        match self {
            Device::Partition(d) => d.device_files(),
            Device::Raw(d) => d.device_files(),
            Device::NandFile(d) => d.device_files(),
            Device::Ubi(d) => d.device_files(),
            Device::Blank(_) => Vec::new(),
        }
    }

    /// fstab lines for this device's mountpoints
    pub fn fstab_entries(&self, ctx: &BuildContext) -> Result<Vec<String>, BuildError> {
        match self {
            Device::Partition(d) => d.fstab_entries(),
            Device::Raw(d) => d.fstab_entries(ctx),
            Device::Ubi(d) => d.fstab_entries(),
            _ => Ok(Vec::new()),
        }
    }

    /// This device's own installer actions, table actions excluded
    pub fn installer_actions(&self) -> Vec<InstallerAction> {
        match self {
            Device::Partition(d) => d.installer_actions(),
            Device::Raw(d) => d.installer_actions(),
            Device::NandFile(d) => d.installer_actions(),
            Device::Ubi(d) => d.installer_actions(),
            Device::Blank(_) => Vec::new(),
        }
    }

    /// Partition descriptors for fstab and erase-target resolution
    pub fn partitions(&self) -> Vec<PartitionDescriptor> {
        match self {
            Device::Partition(d) => d.partitions(),
            Device::Raw(d) => d.partitions(),
            Device::Ubi(d) => d.partitions(),
            _ => Vec::new(),
        }
    }

    /// The declared partition slot this device occupies in a physical
    /// partition table, with its GPT-ness. Standalone partition devices
    /// only; raw images carry their table inside the image.
    pub fn table_slot(&self) -> Option<(&PartitionSpec, TableKind)> {
        match self {
            Device::Partition(d) => Some(d.table_slot()),
            Device::Blank(d) => Some(d.table_slot()),
            _ => None,
        }
    }
}

/// Instantiate the device set from the spec, sequencing implicit start
/// sectors across consecutive standalone partitions: each partition
/// without explicit geometry starts where the previous one ended, rounded
/// up to the alignment boundary.
pub fn assemble_devices(spec: &ImageSpec, ctx: &BuildContext) -> Result<Vec<Device>, BuildError> {
    let sector_size = ctx.sector_size;
    let pad_sectors = (ALIGNMENT_BYTES / sector_size.max(1)).max(1);
    let mut next_start_sector: Option<u64> = None;
    let mut devices = Vec::with_capacity(spec.devices.len());

    for d in &spec.devices {
        match d {
            DeviceSpec::Raw(raw) => {
                devices.push(Device::Raw(RawDevice::new(
                    raw.clone(),
                    TableKind::Msdos,
                    ctx,
                )));
            }
            DeviceSpec::RawGpt(raw) => {
                devices.push(Device::Raw(RawDevice::new(raw.clone(), TableKind::Gpt, ctx)));
            }
            DeviceSpec::Ubi(ubi) => {
                devices.push(Device::Ubi(UbiDevice::new(ubi.clone(), ctx)));
            }
            DeviceSpec::NandFile(nand) => {
                devices.push(Device::NandFile(NandFileDevice::new(nand.clone(), ctx)));
            }
            DeviceSpec::Partition(p) | DeviceSpec::PartitionGpt(p) | DeviceSpec::Recovery(p) => {
                let gpt = matches!(d, DeviceSpec::PartitionGpt(_));
                let recovery = matches!(d, DeviceSpec::Recovery(_));
                let kind = if gpt { TableKind::Gpt } else { TableKind::Msdos };

                if p.is_blank() && !recovery {
                    devices.push(Device::Blank(BlankDevice::new(p.clone(), kind)));
                    continue;
                }

                let mut p = p.clone();
                if let Some(min_start) = next_start_sector {
                    match p.start_sector {
                        None => p.start_sector = Some(min_start),
                        Some(start) if start < min_start => {
                            return Err(LayoutError::SectorOrder {
                                partition: partition_label(&p),
                                requested: start,
                                minimum: min_start,
                            }
                            .into());
                        }
                        Some(_) => {}
                    }
                }

                if let Some(start) = p.start_sector {
                    next_start_sector = Some(match p.end_sector {
                        Some(end) => end,
                        None => {
                            let end = start + mib_to_sectors(p.size.unwrap_or(0), sector_size);
                            // Bump to the next alignment boundary
                            end + pad_sectors - (end % pad_sectors)
                        }
                    });
                }

                devices.push(Device::Partition(PartitionDevice::new(p, recovery, kind, ctx)));
            }
        }
    }

    Ok(devices)
}

fn partition_label(p: &PartitionSpec) -> String {
    p.mountpoint
        .clone()
        .or_else(|| p.install_device.clone())
        .unwrap_or_else(|| "partition".to_string())
}

/// fstab mount options for one partition or volume.
///
/// Explicit options win. Otherwise: ext4 gets `,discard` appended; `/var`
/// trees and `/recovery` mount `defaults,noatime,relatime` and may never be
/// read-only; everything else defaults to read-only unless the spec says
/// otherwise.
pub fn mount_options(
    options: Option<&str>,
    filesystem: Option<&str>,
    mountpoint: &str,
    readonly: Option<bool>,
) -> Result<String, SpecError> {
    if let Some(options) = options {
        return Ok(options.to_string());
    }

    let additional = match filesystem {
        Some("ext4") => ",discard",
        _ => "",
    };

    if mountpoint.starts_with("/var") || mountpoint == "/recovery" {
        if readonly == Some(true) {
            return Err(SpecError::ReadOnlyVarTree {
                mountpoint: mountpoint.to_string(),
            });
        }
        return Ok(format!("defaults,noatime,relatime{additional}"));
    }

    // Everything outside /var is read-only by default
    if readonly.unwrap_or(true) {
        Ok(format!("ro{additional}"))
    } else {
        Ok(format!("defaults{additional}"))
    }
}

/// Sort key for mount and packaging order
pub fn depth_of(device: &Device) -> usize {
    device
        .base_mountpoint()
        .as_deref()
        .map(mountpoint_depth)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_options_are_read_only_outside_var() {
        assert_eq!(mount_options(None, Some("ext4"), "/", None).unwrap(), "ro,discard");
        assert_eq!(
            mount_options(None, Some("ext4"), "/opt", Some(false)).unwrap(),
            "defaults,discard"
        );
        assert_eq!(
            mount_options(None, Some("ext4"), "/var", None).unwrap(),
            "defaults,noatime,relatime,discard"
        );
        assert_eq!(
            mount_options(None, None, "/recovery", None).unwrap(),
            "defaults,noatime,relatime"
        );
    }

    #[test]
    fn explicit_options_win() {
        assert_eq!(
            mount_options(Some("noatime,nodev"), Some("ext4"), "/", Some(true)).unwrap(),
            "noatime,nodev"
        );
    }

    #[test]
    fn read_only_var_is_rejected() {
        let err = mount_options(None, Some("ext4"), "/var/log", Some(true)).unwrap_err();
        assert!(matches!(err, SpecError::ReadOnlyVarTree { .. }));
    }
}
