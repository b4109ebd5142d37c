//! Image specification data model
//!
//! The spec is a declarative JSON document describing one appliance image:
//! its type, architecture, the storage devices to produce, and any
//! additional installer actions. It is parsed once, validated by type
//! structure, and never mutated during a build.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::SpecError;

/// What kind of image this spec produces
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ImageKind {
    Fs,
    Raw,
    Squash,
    Vm,
}

/// Compression applied to artifact archives
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CompressionFormat {
    Gz,
    Xz,
    Zst,
}

impl CompressionFormat {
    /// File extension for a compressed tarball in this format
    pub fn tar_extension(self) -> &'static str {
        match self {
            CompressionFormat::Gz => ".tar.gz",
            CompressionFormat::Xz => ".tar.xz",
            CompressionFormat::Zst => ".tar.zst",
        }
    }

    /// Bare extension for a single compressed file
    pub fn extension(self) -> &'static str {
        match self {
            CompressionFormat::Gz => "gz",
            CompressionFormat::Xz => "xz",
            CompressionFormat::Zst => "zst",
        }
    }
}

impl Default for CompressionFormat {
    fn default() -> Self {
        CompressionFormat::Gz
    }
}

/// The declarative root of one appliance image build
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageSpec {
    /// Appliance base name
    pub name: String,

    /// Image type tag
    #[serde(rename = "type")]
    pub kind: ImageKind,

    /// Target architecture
    pub arch: String,

    /// Whether artifacts should be compressed after the build
    #[serde(default)]
    pub compress: bool,

    /// Compression format for artifact archives
    #[serde(default)]
    pub compression_format: Option<CompressionFormat>,

    /// Sector size of the target storage, in bytes
    #[serde(default)]
    pub sector_size: Option<u64>,

    /// Ordered storage device declarations
    #[serde(default)]
    pub devices: Vec<DeviceSpec>,

    /// Files shipped alongside the image on the recovery partition.
    /// `src:dest` renames are supported; the installer sees the dest name.
    #[serde(default)]
    pub boot_files: Vec<String>,

    /// Entries appended verbatim to the generated fstab
    #[serde(default)]
    pub custom_fstab_entries: Vec<String>,

    /// Bootloader/u-boot actions appended to the installer program
    #[serde(default)]
    pub additional_actions: Vec<AdditionalAction>,

    /// First-boot scripts advertised to the installer
    #[serde(default)]
    pub scripts: Vec<FirstBootScript>,

    /// Opaque crypto descriptor, passed through to collaborators
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub crypto: Option<serde_json::Value>,
}

impl ImageSpec {
    /// Parse a spec from its JSON representation
    pub fn from_json(json: &str) -> Result<Self, SpecError> {
        serde_json::from_str(json).map_err(|source| SpecError::Parse { source })
    }

    /// Parse a spec from a JSON file on disk
    pub fn from_file(path: &Path) -> Result<Self, SpecError> {
        let content =
            std::fs::read_to_string(path).map_err(|e| SpecError::Parse {
                source: serde_json::Error::io(e),
            })?;
        Self::from_json(&content)
    }

    /// Sector size of the target storage, defaulted
    pub fn sector_size(&self) -> u64 {
        self.sector_size.unwrap_or(crate::config::DEFAULT_SECTOR_SIZE)
    }
}

/// One entry of the spec's device list
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum DeviceSpec {
    /// Raw disk image holding an MBR partition table
    #[serde(rename = "raw")]
    Raw(RawSpec),

    /// Raw disk image holding a GPT partition table
    #[serde(rename = "raw-gpt")]
    RawGpt(RawSpec),

    /// UBI device with ordered volumes over raw NAND
    #[serde(rename = "ubi")]
    Ubi(UbiSpec),

    /// Single file written verbatim to a NAND offset at install time
    #[serde(rename = "nand-file")]
    NandFile(NandFileSpec),

    /// Standalone partition on a physical device node (msdos table)
    #[serde(rename = "partition")]
    Partition(PartitionSpec),

    /// Standalone partition addressed through a GPT table
    #[serde(rename = "partition-gpt")]
    PartitionGpt(PartitionSpec),

    /// Recovery partition: formatted and populated by the installer itself
    #[serde(rename = "partition-recovery")]
    Recovery(PartitionSpec),
}

/// One partition declaration
///
/// Doubles as the child-partition entry of raw devices. A declaration
/// without a `filesystem` is a blank placeholder: it reserves a table slot
/// and nothing else. Absent optional fields fall back to variant defaults
/// and never fail.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PartitionSpec {
    /// Where this partition is mounted on the target
    #[serde(default)]
    pub mountpoint: Option<String>,

    /// Partition size in MiB
    #[serde(default)]
    pub size: Option<u64>,

    /// Filesystem type (ext4, vfat, ...); absent means blank
    #[serde(default)]
    pub filesystem: Option<String>,

    /// Filesystem label
    #[serde(default)]
    pub label: Option<String>,

    /// Device node the installer writes this partition to
    #[serde(default)]
    pub install_device: Option<String>,

    /// Device node on the build host (fallback naming source)
    #[serde(default)]
    pub device: Option<String>,

    /// Explicit geometry: first sector
    #[serde(default)]
    pub start_sector: Option<u64>,

    /// Explicit geometry: last sector
    #[serde(default)]
    pub end_sector: Option<u64>,

    /// primary | extended | logical
    #[serde(default)]
    pub partition_type: Option<String>,

    /// GPT partition name
    #[serde(default)]
    pub name: Option<String>,

    /// Partition flags (boot, msftdata)
    #[serde(default)]
    pub flags: Option<Vec<String>>,

    /// Mounted read-only on the target
    #[serde(default)]
    pub readonly: Option<bool>,

    /// Explicit fstab mount options, overriding the computed defaults
    #[serde(default)]
    pub options: Option<String>,

    /// Marks the partition bootable
    #[serde(default)]
    pub bootable: Option<bool>,

    /// File from the extracted rootfs flashed byte-accurately into this
    /// partition (`:`-prefixed paths are relative to the mount tree)
    #[serde(default)]
    pub flash: Option<String>,

    /// Keep the flash source in the image tree after flashing
    #[serde(default)]
    pub keep_in_image: bool,
}

impl PartitionSpec {
    /// Blank placeholders declare no filesystem
    pub fn is_blank(&self) -> bool {
        self.filesystem.is_none()
    }
}

/// Raw disk device declaration (MBR or GPT)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawSpec {
    /// Device node the installer writes the whole image to
    #[serde(default)]
    pub install_device: Option<String>,

    /// Total disk size in MiB; derived from the partitions when absent
    #[serde(default)]
    pub size: Option<u64>,

    /// Child partitions, in table order
    #[serde(default)]
    pub partitions: Vec<PartitionSpec>,

    /// Whole-image dd descriptor applied during file extraction
    #[serde(default)]
    pub dd: Option<DdSpec>,
}

/// Byte-level copy of an extracted file into a raw disk image
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DdSpec {
    /// Source file, as an absolute path inside the extracted rootfs
    pub file: String,

    /// Abort if the source exceeds this many bytes
    #[serde(default)]
    pub max_file_size: Option<u64>,

    /// Sectors skipped in the input
    #[serde(default)]
    pub input_offset: Option<u64>,

    /// Sectors skipped in the output
    #[serde(default)]
    pub output_offset: Option<u64>,

    /// Keep the source in the image tree after copying
    #[serde(default)]
    pub keep_in_image: bool,
}

/// UBI device declaration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UbiSpec {
    /// UBI node the volumes map to on the target (e.g. /dev/ubi0)
    pub mapped_node: String,

    /// MTD device the installer formats (e.g. /dev/mtd3)
    #[serde(default)]
    pub install_device: Option<String>,

    /// Volumes, any order; laid out deepest mountpoint first
    #[serde(default)]
    pub volumes: Vec<UbiVolumeSpec>,

    /// Logical eraseblock size in bytes
    pub logical_eraseblock_size: u64,

    /// Minimum I/O unit size in bytes
    pub minimum_unit_size: u64,

    /// Physical eraseblock size, required for ubinize
    #[serde(default)]
    pub physical_eraseblock_size: Option<u64>,

    /// NAND subpage size, forwarded to ubiformat
    #[serde(default)]
    pub subpage_size: Option<u64>,

    /// Combine the volumes into a single ubinize image
    #[serde(default)]
    pub ubinize: bool,
}

/// One UBI volume
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UbiVolumeSpec {
    /// Where this volume is mounted on the target
    pub mountpoint: String,

    /// Volume size in MiB
    pub size: u64,

    /// Volume name; derived from the mountpoint when absent
    #[serde(default)]
    pub name: Option<String>,

    /// Volume is created static/immutable
    #[serde(default)]
    pub immutable: bool,

    /// Mounted read-only on the target
    #[serde(default)]
    pub readonly: Option<bool>,

    /// Explicit fstab mount options
    #[serde(default)]
    pub options: Option<String>,
}

impl UbiVolumeSpec {
    /// Volume name: declared, else the mountpoint with `/` folded to `_`,
    /// with the root volume always called `rootfs`
    pub fn volume_name(&self) -> String {
        if let Some(name) = &self.name {
            return name.clone();
        }
        if self.mountpoint == "/" {
            "rootfs".to_string()
        } else {
            self.mountpoint[1..].replace('/', "_")
        }
    }
}

/// NAND file device declaration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NandFileSpec {
    /// Source path inside the rootfs; `src:dest` renames the artifact
    pub file: String,

    /// MTD device the installer nandwrites the file to
    #[serde(default)]
    pub install_device: Option<String>,

    /// Abort if the extracted file exceeds this many bytes
    #[serde(default)]
    pub max_file_size: Option<u64>,

    /// NAND start offset forwarded to nandwrite
    #[serde(default)]
    pub start: Option<u64>,

    /// Logical eraseblock size forwarded to nandwrite
    #[serde(default)]
    pub logical_eraseblock_size: Option<u64>,

    /// Keep the source in the image tree after extraction
    #[serde(default)]
    pub keep_in_image: bool,
}

/// Additional installer action declared in the spec
///
/// Kept as a loosely-typed record: the action compiler matches on `kind`
/// and rejects anything it does not know with [`SpecError::UnknownAction`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdditionalAction {
    /// Action type tag
    #[serde(rename = "type")]
    pub kind: String,

    /// SPL (first-stage bootloader) target device
    #[serde(default)]
    pub spl_device: Option<String>,

    /// SPL image file
    #[serde(default)]
    pub spl_file: Option<String>,

    /// u-boot target device
    #[serde(default, rename = "u-boot_device")]
    pub u_boot_device: Option<String>,

    /// u-boot image file
    #[serde(default, rename = "u-boot_file")]
    pub u_boot_file: Option<String>,

    /// NAND start offset for the u-boot write
    #[serde(default, rename = "u-boot_start")]
    pub u_boot_start: Option<u64>,

    /// Device tree target device
    #[serde(default)]
    pub dtb_device: Option<String>,

    /// Device tree blob file
    #[serde(default)]
    pub dtb_file: Option<String>,

    /// NAND start offset for the dtb write
    #[serde(default)]
    pub dtb_start: Option<u64>,

    /// kobs search exponent
    #[serde(default)]
    pub search_exponent: Option<u64>,

    /// Logical eraseblock size for the NAND writes
    #[serde(default)]
    pub logical_eraseblock_size: Option<u64>,

    /// Opaque environment payload for u-boot_env_update
    #[serde(default)]
    pub environment: Option<serde_json::Value>,
}

/// Script run by the installer on first boot
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FirstBootScript {
    /// Script path inside the installed system
    pub path: String,

    /// Message shown while the script runs
    pub message: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_minimal_spec() {
        let spec = ImageSpec::from_json(
            r#"{"name": "demo", "type": "raw", "arch": "armv7hl"}"#,
        )
        .unwrap();
        assert_eq!(spec.name, "demo");
        assert_eq!(spec.kind, ImageKind::Raw);
        assert_eq!(spec.sector_size(), 512);
        assert!(spec.devices.is_empty());
        assert!(!spec.compress);
    }

    #[test]
    fn parse_device_variants() {
        let spec = ImageSpec::from_json(
            r#"{
                "name": "demo", "type": "raw", "arch": "armv7hl",
                "devices": [
                    {"type": "partition", "mountpoint": "/", "size": 100,
                     "filesystem": "ext4", "install_device": "/dev/mmcblk0p1"},
                    {"type": "partition", "install_device": "/dev/mmcblk0p2"},
                    {"type": "ubi", "mapped_node": "/dev/ubi0",
                     "logical_eraseblock_size": 126976,
                     "minimum_unit_size": 2048,
                     "volumes": [{"mountpoint": "/", "size": 80}]},
                    {"type": "nand-file", "file": "/boot/uImage:kernel.img"}
                ]
            }"#,
        )
        .unwrap();
        assert_eq!(spec.devices.len(), 4);
        match &spec.devices[1] {
            DeviceSpec::Partition(p) => assert!(p.is_blank()),
            other => panic!("unexpected variant: {other:?}"),
        }
        match &spec.devices[2] {
            DeviceSpec::Ubi(u) => assert_eq!(u.volumes[0].volume_name(), "rootfs"),
            other => panic!("unexpected variant: {other:?}"),
        }
    }

    #[test]
    fn volume_name_derivation() {
        let vol = UbiVolumeSpec {
            mountpoint: "/var/lib".to_string(),
            size: 16,
            name: None,
            immutable: false,
            readonly: None,
            options: None,
        };
        assert_eq!(vol.volume_name(), "var_lib");
    }
}
