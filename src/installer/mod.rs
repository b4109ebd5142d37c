//! Installer action program
//!
//! The ordered, conditionally-gated list of operations the on-target
//! installer executes at first boot or recovery time to realize the
//! declared storage layout. Produced once per build, serialized once,
//! never mutated afterwards.
//!
//! Two independent boolean axes gate every action: full flash (pristine
//! storage) versus partial flash (update in place), and whether the action
//! is safe to run while booted from the recovery partition. Table creation
//! and cache erasure are mutually exclusive on the flash axes: a full flash
//! always repartitions and has nothing to erase; a partial flash never
//! repartitions but always re-erases caches.

pub mod compiler;

use serde::{Deserialize, Serialize};

use crate::spec::FirstBootScript;

/// Closed set of installer operation tags
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ActionKind {
    #[serde(rename = "partition_table")]
    PartitionTable,
    #[serde(rename = "dd")]
    Dd,
    #[serde(rename = "mkfs")]
    Mkfs,
    #[serde(rename = "ubiformat")]
    UbiFormat,
    #[serde(rename = "ubiupdatevol")]
    UbiUpdateVol,
    #[serde(rename = "nandwrite")]
    NandWrite,
    #[serde(rename = "flash_kobs")]
    FlashKobs,
    #[serde(rename = "erase_directory")]
    EraseDirectory,
    #[serde(rename = "ubi_attach")]
    UbiAttach,
    #[serde(rename = "ubi_detach")]
    UbiDetach,
    #[serde(rename = "copy_recovery")]
    CopyRecovery,
    #[serde(rename = "backup_u-boot_environment")]
    BackupUBootEnvironment,
    #[serde(rename = "restore_u-boot_environment")]
    RestoreUBootEnvironment,
    #[serde(rename = "u-boot_env_update")]
    UBootEnvUpdate,
}

/// One partition entry inside a `partition_table` action
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableEntry {
    /// Device node this entry describes
    pub target: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub start_sector: Option<u64>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub end_sector: Option<u64>,

    /// Size in MiB
    #[serde(skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub partition_type: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub filesystem_label: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub flags: Option<Vec<String>>,
}

/// One conditionally-gated installer operation
///
/// A flat record: each kind uses the subset of fields it needs and the
/// rest serialize away. Absent spec fields simply leave their action
/// fields unset.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstallerAction {
    /// Operation tag
    #[serde(rename = "type")]
    pub kind: ActionKind,

    /// Target device node or install-device identifier
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,

    /// Source path inside the installer payload
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,

    /// Partition table format, for `partition_table`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub table_type: Option<String>,

    /// Aggregated partition entries, for `partition_table`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub partitions: Option<Vec<TableEntry>>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub start_sector: Option<u64>,

    /// Size in MiB
    #[serde(skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub partition_type: Option<String>,

    /// GPT or UBI volume name
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub filesystem: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub filesystem_label: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub flags: Option<Vec<String>>,

    /// Path below the matched mountpoint, for `erase_directory`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub relative_path: Option<String>,

    /// Owning device node for UBI volume operations
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_device: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub subpage_size: Option<u64>,

    /// kobs search exponent, for `flash_kobs`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub search_exponent: Option<u64>,

    /// NAND start offset, for `nandwrite`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub start: Option<u64>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub logical_eraseblock_size: Option<u64>,

    /// Static volume flag, for `ubiupdatevol`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub immutable: Option<bool>,

    /// Opaque payload for `u-boot_env_update`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub environment: Option<serde_json::Value>,

    /// Files shipped next to the image, for `copy_recovery`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub files: Option<Vec<String>>,

    /// Execute when flashing pristine storage
    pub run_on_full_flash: bool,

    /// Execute when updating an existing installation
    pub run_on_partial_flash: bool,

    /// Present only when explicitly suppressed; the installer defaults
    /// this gate to true
    #[serde(skip_serializing_if = "Option::is_none")]
    pub run_in_recovery_mode: Option<bool>,
}

impl InstallerAction {
    /// A bare action of the given kind with no fields set and both flash
    /// gates off
    pub fn new(kind: ActionKind) -> Self {
        InstallerAction {
            kind,
            target: None,
            source: None,
            table_type: None,
            partitions: None,
            start_sector: None,
            size: None,
            partition_type: None,
            name: None,
            filesystem: None,
            filesystem_label: None,
            flags: None,
            relative_path: None,
            parent_device: None,
            subpage_size: None,
            search_exponent: None,
            start: None,
            logical_eraseblock_size: None,
            immutable: None,
            environment: None,
            files: None,
            run_on_full_flash: false,
            run_on_partial_flash: false,
            run_in_recovery_mode: None,
        }
    }
}

/// The complete installer program for one appliance build
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstallerProgram {
    /// Ordered action list
    pub actions: Vec<InstallerAction>,

    /// Appliance name, variant included
    pub appliance_name: String,

    /// Appliance version, `rolling` when unversioned
    pub appliance_version: String,

    /// A recovery partition exists in the layout
    pub has_recovery: bool,

    /// Install device of the recovery partition
    #[serde(skip_serializing_if = "Option::is_none")]
    pub recovery_device: Option<String>,

    /// Filesystem label of the recovery partition
    #[serde(skip_serializing_if = "Option::is_none")]
    pub recovery_device_filesystem_label: Option<String>,

    /// First-boot scripts
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scripts: Option<Vec<FirstBootScript>>,
}

impl InstallerProgram {
    /// Serialize the program the way it is shipped to the target
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }

    /// Human-readable rendition for build logs
    pub fn to_pretty_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }
}
