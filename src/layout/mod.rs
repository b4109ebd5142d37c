//! Partition table types and sector geometry
//!
//! Pure arithmetic, no I/O: a declared partition list compiles into a
//! [`PartitionTable`] with concrete sector ranges. Writing the table to an
//! image file is the job of [`crate::infra::tools::PartitionEditor`].

use serde::{Deserialize, Serialize};

use crate::config::ALIGNMENT_BYTES;
use crate::error::LayoutError;
use crate::spec::PartitionSpec;

/// Partition table format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TableKind {
    Msdos,
    Gpt,
}

impl TableKind {
    /// Label string understood by parted
    pub fn as_str(self) -> &'static str {
        match self {
            TableKind::Msdos => "msdos",
            TableKind::Gpt => "gpt",
        }
    }
}

/// MBR slot role of a partition
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PartitionRole {
    #[default]
    Primary,
    Extended,
    Logical,
}

impl PartitionRole {
    /// Parse the spec's partition_type string
    pub fn parse(value: &str) -> Result<Self, LayoutError> {
        match value {
            "primary" => Ok(PartitionRole::Primary),
            "extended" => Ok(PartitionRole::Extended),
            "logical" => Ok(PartitionRole::Logical),
            other => Err(LayoutError::InvalidPartitionType {
                value: other.to_string(),
            }),
        }
    }
}

/// One committed partition with concrete geometry
#[derive(Debug, Clone)]
pub struct PartitionEntry {
    /// 1-based partition number within the table
    pub number: u32,

    /// First sector
    pub start_sector: u64,

    /// Last sector
    pub end_sector: u64,

    /// Geometry was declared explicitly and must not be realigned
    pub exact: bool,

    /// MBR slot role
    pub role: PartitionRole,

    /// GPT partition name
    pub name: Option<String>,

    /// Filesystem to format, if any
    pub filesystem: Option<String>,

    /// Filesystem label
    pub label: Option<String>,

    /// Partition flags
    pub flags: Vec<String>,

    /// Mountpoint on the target
    pub mountpoint: Option<String>,
}

impl PartitionEntry {
    /// Size of this partition in sectors
    pub fn sectors(&self) -> u64 {
        self.end_sector - self.start_sector
    }

    /// Byte offset of the partition start
    pub fn byte_offset(&self, sector_size: u64) -> u64 {
        self.start_sector * sector_size
    }

    /// Byte capacity of the partition
    pub fn byte_capacity(&self, sector_size: u64) -> u64 {
        self.sectors() * sector_size
    }
}

/// A compiled partition table for one physical device or image file
#[derive(Debug, Clone)]
pub struct PartitionTable {
    pub kind: TableKind,
    pub sector_size: u64,
    pub entries: Vec<PartitionEntry>,
}

impl PartitionTable {
    /// Compile declared partitions into concrete, ascending sector ranges.
    ///
    /// Geometry assignment: explicit `start_sector`/`end_sector` are taken
    /// as-is (and must not go backwards); everything else starts at the
    /// previous end rounded up to the alignment boundary and spans the
    /// declared size.
    pub fn compile(
        kind: TableKind,
        sector_size: u64,
        partitions: &[PartitionSpec],
    ) -> Result<Self, LayoutError> {
        let mut entries = Vec::with_capacity(partitions.len());
        let mut prev_end: u64 = 0;

        for (idx, p) in partitions.iter().enumerate() {
            let ident = partition_ident(p, idx);

            let role = match &p.partition_type {
                // GPT carries no slot roles; the type string is a GUID there
                Some(t) if kind == TableKind::Msdos => PartitionRole::parse(t)?,
                _ => PartitionRole::Primary,
            };

            let start = match p.start_sector {
                Some(start) => {
                    if start < prev_end {
                        return Err(LayoutError::SectorOrder {
                            partition: ident,
                            requested: start,
                            minimum: prev_end,
                        });
                    }
                    start
                }
                None => align_up(prev_end + 1, sector_size),
            };

            let (end, exact) = match p.end_sector {
                Some(end) => {
                    if end < start {
                        return Err(LayoutError::SectorOrder {
                            partition: ident,
                            requested: end,
                            minimum: start,
                        });
                    }
                    (end, p.start_sector.is_some())
                }
                None => {
                    let size_sectors = mib_to_sectors(p.size.unwrap_or(0), sector_size);
                    (start + size_sectors, false)
                }
            };

            entries.push(PartitionEntry {
                number: (idx + 1) as u32,
                start_sector: start,
                end_sector: end,
                exact,
                role,
                name: p.name.clone(),
                filesystem: p.filesystem.clone(),
                label: p.label.clone(),
                flags: p.flags.clone().unwrap_or_default(),
                mountpoint: p.mountpoint.clone(),
            });

            prev_end = end;
        }

        Ok(PartitionTable {
            kind,
            sector_size,
            entries,
        })
    }

    /// Look a partition up by its GPT name
    pub fn by_name(&self, name: &str) -> Option<&PartitionEntry> {
        self.entries
            .iter()
            .find(|e| e.name.as_deref() == Some(name))
    }

    /// Look a partition up by its mountpoint
    pub fn by_mountpoint(&self, mountpoint: &str) -> Option<&PartitionEntry> {
        self.entries
            .iter()
            .find(|e| e.mountpoint.as_deref() == Some(mountpoint))
    }

    /// Last used sector of the table
    pub fn last_sector(&self) -> u64 {
        self.entries.iter().map(|e| e.end_sector).max().unwrap_or(0)
    }
}

/// Convert a size in MiB to sectors, rounding up
pub fn mib_to_sectors(mib: u64, sector_size: u64) -> u64 {
    (mib * 1024 * 1024).div_ceil(sector_size)
}

/// Round a sector up to the next alignment boundary (1 MiB)
pub fn align_up(sector: u64, sector_size: u64) -> u64 {
    let grain = ALIGNMENT_BYTES / sector_size.max(1);
    sector.div_ceil(grain) * grain
}

/// Mountpoint depth used for mount/unmount and volume ordering.
/// `/` is 0, `/var` is 1, `/var/log` is 2.
pub fn mountpoint_depth(mountpoint: &str) -> usize {
    if mountpoint.len() <= 1 {
        return 0;
    }
    mountpoint[..mountpoint.len() - 1].matches('/').count()
}

/// Base device node with a trailing `p<N>` partition suffix stripped:
/// `/dev/mmcblk0p2` becomes `/dev/mmcblk0`, nodes without a `p` suffix
/// pass through unchanged.
pub fn base_device_node(node: &str) -> &str {
    match node.rfind('p') {
        Some(idx) => &node[..idx],
        None => node,
    }
}

/// Partition number inferred from the device node's positional suffix.
/// Tries a two-digit suffix first (up to 99 partitions), then one digit.
pub fn partition_number(node: &str) -> Result<u32, LayoutError> {
    let digits = |n: usize| {
        node.len()
            .checked_sub(n)
            .and_then(|i| node.get(i..))
            .and_then(|s| s.parse::<u32>().ok())
    };
    digits(2)
        .or_else(|| digits(1))
        .ok_or_else(|| LayoutError::MalformedDeviceNode {
            device: node.to_string(),
        })
}

fn partition_ident(p: &PartitionSpec, idx: usize) -> String {
    p.mountpoint
        .clone()
        .or_else(|| p.name.clone())
        .or_else(|| p.install_device.clone())
        .unwrap_or_else(|| format!("#{}", idx + 1))
}
