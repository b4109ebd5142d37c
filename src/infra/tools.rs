//! External tool capability traits
//!
//! Partitioning, filesystem creation, and loop mounting go through these
//! traits so that failures and call contracts stay testable without root
//! privileges or real system tools. The system implementations shell out
//! to parted/sgdisk, mkfs.* and losetup/mount.

use std::path::{Path, PathBuf};

use crate::error::ToolError;
use crate::layout::{PartitionRole, PartitionTable, TableKind};

use super::process;

/// Writes a committed partition table to an image file
pub trait PartitionEditor {
    /// Create a fresh label and add every entry of the table
    fn apply_table(&self, image: &Path, table: &PartitionTable) -> Result<(), ToolError>;

    /// Set a GPT partition's type GUID
    fn set_type_guid(&self, image: &Path, number: u32, guid: &str) -> Result<(), ToolError>;

    /// Read a GPT partition's unique GUID (PARTUUID), lowercase
    fn partition_guid(&self, image: &Path, number: u32) -> Result<String, ToolError>;
}

/// Creates filesystems on device nodes and UBI images from directory trees
pub trait FilesystemFormatter {
    /// mkfs.<filesystem> on a device node, optionally labeled
    fn mkfs(&self, device: &Path, filesystem: &str, label: Option<&str>) -> Result<(), ToolError>;

    /// mkfs.ubifs a directory tree into a volume image
    fn mkfs_ubifs(
        &self,
        tree: &Path,
        output: &Path,
        leb_size: u64,
        max_leb_count: u64,
        min_io_size: u64,
    ) -> Result<(), ToolError>;

    /// ubinize volume images into a single UBI image
    fn ubinize(
        &self,
        output: &Path,
        peb_size: u64,
        min_io_size: u64,
        subpage_size: Option<u64>,
        config: &Path,
    ) -> Result<(), ToolError>;
}

/// Binds image files to loop devices and mounts them
pub trait LoopMounter {
    /// Attach a file (or a byte range of it) to a free loop device and
    /// return the granted node
    fn attach(
        &self,
        file: &Path,
        offset: Option<u64>,
        size_limit: Option<u64>,
    ) -> Result<PathBuf, ToolError>;

    /// Detach a loop device
    fn detach(&self, node: &Path) -> Result<(), ToolError>;

    /// Loop-mount a file at a target directory, optionally at a byte offset
    fn mount(&self, file: &Path, target: &Path, offset: Option<u64>) -> Result<(), ToolError>;

    /// Unmount a mounted target
    fn unmount(&self, target: &Path) -> Result<(), ToolError>;
}

/// The bundle of tool implementations one build runs with
pub struct Toolset {
    pub editor: Box<dyn PartitionEditor>,
    pub formatter: Box<dyn FilesystemFormatter>,
    pub mounter: Box<dyn LoopMounter>,
}

impl Toolset {
    /// Real system tools
    pub fn system() -> Self {
        Toolset {
            editor: Box::new(SystemPartitionEditor),
            formatter: Box::new(SystemFormatter),
            mounter: Box::new(SystemLoopMounter),
        }
    }

    /// Verify the system tools this build will need are installed
    pub fn preflight() -> Result<(), ToolError> {
        process::require_tools(&["parted", "losetup", "mount", "umount"])
    }
}

/// parted/sgdisk-backed editor
pub struct SystemPartitionEditor;

impl PartitionEditor for SystemPartitionEditor {
    fn apply_table(&self, image: &Path, table: &PartitionTable) -> Result<(), ToolError> {
        let image_str = image.display().to_string();
        let mut args: Vec<String> = vec![
            "--script".to_string(),
            image_str.clone(),
            "unit".to_string(),
            "s".to_string(),
            "mklabel".to_string(),
            table.kind.as_str().to_string(),
        ];

        for entry in &table.entries {
            args.push("mkpart".to_string());
            match table.kind {
                TableKind::Msdos => {
                    let role = match entry.role {
                        PartitionRole::Primary => "primary",
                        PartitionRole::Extended => "extended",
                        PartitionRole::Logical => "logical",
                    };
                    args.push(role.to_string());
                }
                TableKind::Gpt => {
                    // parted uses the positional name argument for GPT
                    args.push(
                        entry
                            .name
                            .clone()
                            .unwrap_or_else(|| format!("part{}", entry.number)),
                    );
                }
            }
            if let Some(fs) = &entry.filesystem {
                args.push(fs.clone());
            }
            args.push(format!("{}s", entry.start_sector));
            args.push(format!("{}s", entry.end_sector));
        }

        for entry in &table.entries {
            for flag in &entry.flags {
                args.push("set".to_string());
                args.push(entry.number.to_string());
                args.push(flag.clone());
                args.push("on".to_string());
            }
        }

        process::run("parted", &args)
    }

    fn set_type_guid(&self, image: &Path, number: u32, guid: &str) -> Result<(), ToolError> {
        process::run(
            "sgdisk",
            [
                "-t".to_string(),
                format!("{number}:{guid}"),
                image.display().to_string(),
            ],
        )
    }

    fn partition_guid(&self, image: &Path, number: u32) -> Result<String, ToolError> {
        let out = process::run_capture(
            "sgdisk",
            [
                "--info".to_string(),
                number.to_string(),
                image.display().to_string(),
            ],
        )?;
        out.lines()
            .find_map(|line| {
                line.strip_prefix("Partition unique GUID:")
                    .map(|guid| guid.trim().to_lowercase())
            })
            .ok_or_else(|| ToolError::UnexpectedOutput {
                tool: "sgdisk".to_string(),
                detail: format!("no unique GUID in --info output for partition {number}"),
            })
    }
}

/// mkfs.*-backed formatter
pub struct SystemFormatter;

impl FilesystemFormatter for SystemFormatter {
    fn mkfs(&self, device: &Path, filesystem: &str, label: Option<&str>) -> Result<(), ToolError> {
        let tool = format!("mkfs.{filesystem}");
        let mut args: Vec<String> = Vec::new();
        if filesystem.starts_with("ext") {
            args.push("-m".to_string());
            args.push("1".to_string());
            if let Some(label) = label {
                args.push("-L".to_string());
                args.push(label.to_string());
            }
        } else if filesystem == "vfat" {
            if let Some(label) = label {
                args.push("-n".to_string());
                args.push(label.to_string());
            }
        }
        args.push(device.display().to_string());
        process::run(&tool, &args)
    }

    fn mkfs_ubifs(
        &self,
        tree: &Path,
        output: &Path,
        leb_size: u64,
        max_leb_count: u64,
        min_io_size: u64,
    ) -> Result<(), ToolError> {
        process::run(
            "mkfs.ubifs",
            [
                "-q".to_string(),
                "-r".to_string(),
                tree.display().to_string(),
                "-o".to_string(),
                output.display().to_string(),
                "-e".to_string(),
                leb_size.to_string(),
                "-c".to_string(),
                max_leb_count.to_string(),
                "-m".to_string(),
                min_io_size.to_string(),
            ],
        )
    }

    fn ubinize(
        &self,
        output: &Path,
        peb_size: u64,
        min_io_size: u64,
        subpage_size: Option<u64>,
        config: &Path,
    ) -> Result<(), ToolError> {
        let mut args = vec![
            "-o".to_string(),
            output.display().to_string(),
            "-p".to_string(),
            peb_size.to_string(),
            "-m".to_string(),
            min_io_size.to_string(),
        ];
        if let Some(subpage) = subpage_size {
            args.push("-s".to_string());
            args.push(subpage.to_string());
        }
        args.push(config.display().to_string());
        process::run("ubinize", &args)
    }
}

/// losetup/mount-backed loop mounter
pub struct SystemLoopMounter;

impl LoopMounter for SystemLoopMounter {
    fn attach(
        &self,
        file: &Path,
        offset: Option<u64>,
        size_limit: Option<u64>,
    ) -> Result<PathBuf, ToolError> {
        let mut args = vec!["--find".to_string(), "--show".to_string()];
        if let Some(offset) = offset {
            args.push("--offset".to_string());
            args.push(offset.to_string());
        }
        if let Some(limit) = size_limit {
            args.push("--sizelimit".to_string());
            args.push(limit.to_string());
        }
        args.push(file.display().to_string());
        let node = process::run_capture("losetup", &args)?;
        Ok(PathBuf::from(node.trim()))
    }

    fn detach(&self, node: &Path) -> Result<(), ToolError> {
        process::run("losetup", ["-d".to_string(), node.display().to_string()])
    }

    fn mount(&self, file: &Path, target: &Path, offset: Option<u64>) -> Result<(), ToolError> {
        let options = match offset {
            Some(offset) => format!("loop,offset={offset}"),
            None => "loop".to_string(),
        };
        process::run(
            "mount",
            [
                "-o".to_string(),
                options,
                file.display().to_string(),
                target.display().to_string(),
            ],
        )
    }

    fn unmount(&self, target: &Path) -> Result<(), ToolError> {
        process::run("umount", [target.display().to_string()])
    }
}

/// No-op tool implementations for tests.
///
/// Every call is appended to a shared log so tests can assert order and
/// arguments without root privileges or the real binaries installed.
pub mod testing {
    use std::path::{Path, PathBuf};
    use std::sync::{Arc, Mutex};

    use super::{FilesystemFormatter, LoopMounter, PartitionEditor, Toolset};
    use crate::error::ToolError;
    use crate::layout::PartitionTable;

    pub type CallLog = Arc<Mutex<Vec<String>>>;

    fn log(calls: &CallLog, line: String) {
        calls.lock().unwrap().push(line);
    }

    pub struct FakeEditor {
        calls: CallLog,
    }

    impl PartitionEditor for FakeEditor {
        fn apply_table(&self, image: &Path, table: &PartitionTable) -> Result<(), ToolError> {
            log(
                &self.calls,
                format!(
                    "apply_table {} {} entries={}",
                    image.display(),
                    table.kind.as_str(),
                    table.entries.len()
                ),
            );
            Ok(())
        }

        fn set_type_guid(&self, image: &Path, number: u32, guid: &str) -> Result<(), ToolError> {
            log(
                &self.calls,
                format!("set_type_guid {} {number} {guid}", image.display()),
            );
            Ok(())
        }

        fn partition_guid(&self, image: &Path, number: u32) -> Result<String, ToolError> {
            log(
                &self.calls,
                format!("partition_guid {} {number}", image.display()),
            );
            Ok(format!("00000000-0000-0000-0000-{number:012x}"))
        }
    }

    pub struct FakeFormatter {
        calls: CallLog,
    }

    impl FilesystemFormatter for FakeFormatter {
        fn mkfs(
            &self,
            device: &Path,
            filesystem: &str,
            label: Option<&str>,
        ) -> Result<(), ToolError> {
            log(
                &self.calls,
                format!(
                    "mkfs {} {filesystem} label={}",
                    device.display(),
                    label.unwrap_or("-")
                ),
            );
            Ok(())
        }

        fn mkfs_ubifs(
            &self,
            tree: &Path,
            output: &Path,
            leb_size: u64,
            max_leb_count: u64,
            min_io_size: u64,
        ) -> Result<(), ToolError> {
            log(
                &self.calls,
                format!(
                    "mkfs_ubifs {} {} leb={leb_size} count={max_leb_count} min={min_io_size}",
                    tree.display(),
                    output.display()
                ),
            );
            // The pipeline expects the volume image to exist afterwards
            std::fs::write(output, b"ubifs").map_err(|e| ToolError::Spawn {
                tool: "mkfs.ubifs".to_string(),
                error: e.to_string(),
            })?;
            Ok(())
        }

        fn ubinize(
            &self,
            output: &Path,
            peb_size: u64,
            min_io_size: u64,
            subpage_size: Option<u64>,
            config: &Path,
        ) -> Result<(), ToolError> {
            log(
                &self.calls,
                format!(
                    "ubinize {} peb={peb_size} min={min_io_size} sub={:?} {}",
                    output.display(),
                    subpage_size,
                    config.display()
                ),
            );
            std::fs::write(output, b"ubi").map_err(|e| ToolError::Spawn {
                tool: "ubinize".to_string(),
                error: e.to_string(),
            })?;
            Ok(())
        }
    }

    pub struct FakeMounter {
        calls: CallLog,
    }

    impl LoopMounter for FakeMounter {
        fn attach(
            &self,
            file: &Path,
            offset: Option<u64>,
            size_limit: Option<u64>,
        ) -> Result<PathBuf, ToolError> {
            log(
                &self.calls,
                format!(
                    "attach {} offset={offset:?} limit={size_limit:?}",
                    file.display()
                ),
            );
            Ok(PathBuf::from("/dev/loop-test"))
        }

        fn detach(&self, node: &Path) -> Result<(), ToolError> {
            log(&self.calls, format!("detach {}", node.display()));
            Ok(())
        }

        fn mount(&self, file: &Path, target: &Path, offset: Option<u64>) -> Result<(), ToolError> {
            log(
                &self.calls,
                format!("mount {} {} offset={offset:?}", file.display(), target.display()),
            );
            Ok(())
        }

        fn unmount(&self, target: &Path) -> Result<(), ToolError> {
            log(&self.calls, format!("unmount {}", target.display()));
            Ok(())
        }
    }

    /// A toolset whose calls are recorded into the returned log
    pub fn fake_toolset_with_log() -> (Toolset, CallLog) {
        let calls: CallLog = Arc::new(Mutex::new(Vec::new()));
        let toolset = Toolset {
            editor: Box::new(FakeEditor {
                calls: Arc::clone(&calls),
            }),
            formatter: Box::new(FakeFormatter {
                calls: Arc::clone(&calls),
            }),
            mounter: Box::new(FakeMounter {
                calls: Arc::clone(&calls),
            }),
        };
        (toolset, calls)
    }

    /// A toolset for tests that never inspect the call log
    pub fn fake_toolset() -> Toolset {
        fake_toolset_with_log().0
    }
}
