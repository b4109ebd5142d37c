//! Fixed constants and default values

/// Default sector size in bytes when the spec does not declare one
pub const DEFAULT_SECTOR_SIZE: u64 = 512;

/// Partition alignment boundary in bytes (1 MiB)
pub const ALIGNMENT_BYTES: u64 = 1024 * 1024;

/// Padding added around a synthesized extended partition (MiB)
pub const EXTENDED_PADDING_MIB: u64 = 5;

/// Padding added to a raw disk when its size is derived from its partitions (MiB)
pub const RAW_DISK_PADDING_MIB: u64 = 8;

/// Chunk size for byte-accurate partition flashing, in sectors
pub const FLASH_CHUNK_SECTORS: u64 = 8192;

/// Name of the serialized installer program document
pub const INSTALLER_PROGRAM_FILENAME: &str = "sysrestore.json";

/// Staging path inside the installer payload
pub const INSTALLER_STAGING_PATH: &str = "/installer/";

/// Where the installer program lands inside the built image
pub const INSTALLER_PROGRAM_IMAGE_PATH: &str = "/boot/sysconfig/";

/// Main image filename expected by the on-target recovery installer
pub const MAIN_IMAGE_FILENAME: &str = "appliance.img";

/// Pseudo-filesystem entries appended to every generated fstab
pub const FIXED_FSTAB_ENTRIES: &[&str] = &[
    "devpts     /dev/pts  devpts  gid=5,mode=620   0 0",
    "tmpfs      /dev/shm  tmpfs   defaults         0 0",
    "proc       /proc     proc    defaults         0 0",
    "sysfs      /sys      sysfs   defaults         0 0",
];

/// Logical paths whose caches must be erased on a partial flash
pub mod erase_targets {
    /// Package and download caches
    pub const VAR_CACHE: &str = "/var/cache";

    /// RPM database; stale copies poison the package state after an update
    pub const VAR_LIB_RPM: &str = "/var/lib/rpm";

    /// Per-orbit user caches
    pub const ORBITS: &str = "/var/lib/orbits";

    /// Glob appended below the orbits directory
    pub const ORBITS_GLOB: &str = "*/.cache";
}
