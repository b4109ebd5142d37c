//! Raw disk images carrying their own partition table
//!
//! One image file holds the whole disk: table, filesystems, flashed blobs.
//! The installer writes it to the target with a single `dd`. Partitions
//! are reached locally through byte offsets into the image, both for
//! formatting (offset loop devices) and mounting (`-o loop,offset=`).

use std::fs::OpenOptions;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use tracing::{debug, info};

use crate::config::{FLASH_CHUNK_SECTORS, INSTALLER_STAGING_PATH, RAW_DISK_PADDING_MIB};
use crate::device::{mount_options, BuildContext, PartitionDescriptor};
use crate::error::{BuildError, ExtractionError};
use crate::infra::{filesystem, loopdev::LoopBinding};
use crate::installer::{ActionKind, InstallerAction};
use crate::layout::{base_device_node, mountpoint_depth, PartitionTable, TableKind};
use crate::spec::{PartitionSpec, RawSpec};

/// A raw disk image with an MBR or GPT partition table
pub struct RawDevice {
    spec: RawSpec,
    kind: TableKind,
    filename: PathBuf,
    table: Option<PartitionTable>,
    mounted: Vec<PathBuf>,
}

impl RawDevice {
    pub fn new(spec: RawSpec, kind: TableKind, ctx: &BuildContext) -> Self {
        // `<image>_<base-node>.raw`, where the base node drops the `p<N>`
        // partition suffix of whichever node the spec names
        let base_node = spec
            .install_device
            .as_deref()
            .or_else(|| spec.partitions.iter().find_map(|p| p.device.as_deref()))
            .map(|node| base_device_node(basename(node)).to_string());
        let filename = match base_node {
            Some(node) => ctx.build_dir.join(format!("{}_{node}.raw", ctx.image_name)),
            None => ctx.build_dir.join(format!("{}.raw", ctx.image_name)),
        };
        RawDevice {
            spec,
            kind,
            filename,
            table: None,
            mounted: Vec::new(),
        }
    }

    pub fn base_mountpoint(&self) -> Option<String> {
        self.spec
            .partitions
            .iter()
            .filter_map(|p| p.mountpoint.as_deref())
            .min_by_key(|m| mountpoint_depth(m))
            .map(str::to_string)
    }

    pub fn needs_file_extraction(&self) -> bool {
        self.spec.dd.is_some() || self.spec.partitions.iter().any(|p| p.flash.is_some())
    }

    /// Allocate the image, write the partition table and format every
    /// partition that declares a filesystem
    pub fn create(&mut self, ctx: &BuildContext) -> Result<(), BuildError> {
        let disk_size = self.spec.size.unwrap_or_else(|| {
            RAW_DISK_PADDING_MIB
                + self
                    .spec
                    .partitions
                    .iter()
                    .map(|p| p.size.unwrap_or(0))
                    .sum::<u64>()
        });

        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&self.filename)?;
        file.set_len(disk_size * 1024 * 1024)?;
        drop(file);

        let table = PartitionTable::compile(self.kind, ctx.sector_size, &self.spec.partitions)?;
        info!(
            image = %self.filename.display(),
            kind = table.kind.as_str(),
            partitions = table.entries.len(),
            "writing partition table"
        );
        ctx.tools.editor.apply_table(&self.filename, &table)?;

        for entry in &table.entries {
            let Some(filesystem) = &entry.filesystem else {
                continue;
            };
            debug!(number = entry.number, filesystem, "formatting partition");
            let binding = LoopBinding::attach(
                ctx.tools.mounter.as_ref(),
                &self.filename,
                Some(entry.byte_offset(ctx.sector_size)),
                Some(entry.byte_capacity(ctx.sector_size)),
            )?;
            ctx.tools
                .formatter
                .mkfs(binding.node(), filesystem, entry.label.as_deref())?;
            binding.detach()?;
        }

        self.table = Some(table);
        Ok(())
    }

    /// Mount every partition with a mountpoint, shallowest first, so no
    /// mount obscures a deeper one
    pub fn mount(&mut self, base: &Path, ctx: &BuildContext) -> Result<(), BuildError> {
        let mut mountable: Vec<(String, u64)> = self
            .committed_table()?
            .entries
            .iter()
            .filter_map(|e| {
                let mountpoint = e.mountpoint.clone()?;
                Some((mountpoint, e.byte_offset(ctx.sector_size)))
            })
            .collect();
        mountable.sort_by_key(|(mountpoint, _)| mountpoint_depth(mountpoint));

        for (mountpoint, offset) in mountable {
            let target = base.join(&mountpoint[1..]);
            filesystem::create_dir_all(&target)?;
            debug!(mountpoint, "mounting partition");
            ctx.tools.mounter.mount(&self.filename, &target, Some(offset))?;
            self.mounted.push(target);
        }
        Ok(())
    }

    /// Unmount in exact reverse mount order. GPT type GUIDs are fixed up
    /// first, while the table is final but the image still local.
    pub fn unmount(&mut self, ctx: &BuildContext) -> Result<(), BuildError> {
        if self.kind == TableKind::Gpt {
            self.fix_type_guids(ctx)?;
        }
        while let Some(target) = self.mounted.pop() {
            debug!(target = %target.display(), "unmounting");
            ctx.tools.mounter.unmount(&target)?;
        }
        Ok(())
    }

    /// Apply declared GPT type GUIDs to the committed table
    fn fix_type_guids(&self, ctx: &BuildContext) -> Result<(), BuildError> {
        let table = self.committed_table()?;
        for p in &self.spec.partitions {
            let (Some(name), Some(guid)) = (&p.name, &p.partition_type) else {
                continue;
            };
            if let Some(entry) = table.by_name(name) {
                debug!(name, guid, number = entry.number, "setting type GUID");
                ctx.tools
                    .editor
                    .set_type_guid(&self.filename, entry.number, guid)?;
            }
        }
        Ok(())
    }

    /// Copy extracted files into the image: the whole-image `dd`
    /// descriptor first, then per-partition `flash` sources
    pub fn extract_file(&mut self, base: &Path, ctx: &BuildContext) -> Result<(), BuildError> {
        if let Some(dd) = self.spec.dd.clone() {
            let source = base.join(&dd.file[1..]);
            let size = std::fs::metadata(&source)
                .map_err(|e| io_error(&source, &e))?
                .len();
            if let Some(max) = dd.max_file_size {
                if size > max {
                    return Err(ExtractionError::FileTooBig {
                        file: PathBuf::from(&dd.file),
                        size,
                        max_size: max,
                    }
                    .into());
                }
            }

            info!(source = %source.display(), "copying boot image into disk");
            copy_range(
                &source,
                &self.filename,
                dd.input_offset.unwrap_or(0) * ctx.sector_size,
                dd.output_offset.unwrap_or(0) * ctx.sector_size,
                ctx.sector_size,
            )?;
            if !dd.keep_in_image {
                std::fs::remove_file(&source).map_err(|e| io_error(&source, &e))?;
            }
        }

        let flashed: Vec<PartitionSpec> = self
            .spec
            .partitions
            .iter()
            .filter(|p| p.flash.is_some())
            .cloned()
            .collect();
        for p in flashed {
            self.flash_partition(&p, base, ctx)?;
        }
        Ok(())
    }

    /// Write one flash source byte-accurately into its named partition
    fn flash_partition(
        &self,
        p: &PartitionSpec,
        base: &Path,
        ctx: &BuildContext,
    ) -> Result<(), BuildError> {
        let flash = p.flash.as_deref().unwrap_or_default();
        // `:`-prefixed sources live inside the extracted tree
        let source = match flash.strip_prefix(':') {
            Some(relative) => base.join(&relative[1..]),
            None => PathBuf::from(flash),
        };

        let table = self.committed_table()?;
        let name = p.name.as_deref().unwrap_or_default();
        let entry = table
            .by_name(name)
            .ok_or_else(|| ExtractionError::PartitionNotFound {
                name: name.to_string(),
                image: self.filename.clone(),
            })?;

        let size = std::fs::metadata(&source)
            .map_err(|e| io_error(&source, &e))?
            .len();
        let capacity = entry.byte_capacity(ctx.sector_size);
        if size > capacity || capacity == 0 {
            return Err(ExtractionError::PartitionOverflow {
                file: source,
                size,
                capacity,
            }
            .into());
        }

        info!(
            source = %source.display(),
            name,
            start_sector = entry.start_sector,
            "flashing partition"
        );
        copy_range(
            &source,
            &self.filename,
            0,
            entry.byte_offset(ctx.sector_size),
            ctx.sector_size,
        )?;

        if !p.keep_in_image {
            std::fs::remove_file(&source).map_err(|e| io_error(&source, &e))?;
        }
        Ok(())
    }

    pub fn device_files(&self) -> Vec<PathBuf> {
        vec![self.filename.clone()]
    }

    pub fn fstab_entries(&self, ctx: &BuildContext) -> Result<Vec<String>, BuildError> {
        match self.kind {
            TableKind::Msdos => self.fstab_entries_by_label(),
            TableKind::Gpt => self.fstab_entries_by_partuuid(ctx),
        }
    }

    fn fstab_entries_by_label(&self) -> Result<Vec<String>, BuildError> {
        let mut entries = Vec::new();
        for p in &self.spec.partitions {
            let (Some(mountpoint), Some(filesystem)) = (&p.mountpoint, &p.filesystem) else {
                continue;
            };
            let check_fs = u8::from(mountpoint.starts_with("/var"));
            let reference = match (&p.label, &p.device) {
                (Some(label), _) => format!("LABEL=\"{label}\""),
                (None, Some(device)) => device.clone(),
                (None, None) => continue,
            };
            let options = mount_options(
                p.options.as_deref(),
                p.filesystem.as_deref(),
                mountpoint,
                p.readonly,
            )?;
            entries.push(format!(
                "{reference} {mountpoint} {filesystem} {options} 0 {check_fs}"
            ));
        }
        Ok(entries)
    }

    /// GPT partitions are addressed by PARTUUID, read back from the
    /// committed table. The root partition is the installer's business and
    /// never listed.
    fn fstab_entries_by_partuuid(&self, ctx: &BuildContext) -> Result<Vec<String>, BuildError> {
        let table = self.committed_table()?;
        let mut entries = Vec::new();
        for p in &self.spec.partitions {
            let (Some(mountpoint), Some(filesystem), Some(name)) =
                (&p.mountpoint, &p.filesystem, &p.name)
            else {
                continue;
            };
            if mountpoint == "/" {
                continue;
            }
            let Some(entry) = table.by_name(name) else {
                continue;
            };
            let guid = ctx.tools.editor.partition_guid(&self.filename, entry.number)?;
            let options = mount_options(
                p.options.as_deref(),
                p.filesystem.as_deref(),
                mountpoint,
                p.readonly,
            )?;
            entries.push(format!(
                "PARTUUID={guid} {mountpoint} {filesystem} {options} 0 0"
            ));
        }
        Ok(entries)
    }

    pub fn installer_actions(&self) -> Vec<InstallerAction> {
        let Some(install_device) = self.spec.install_device.clone() else {
            return Vec::new();
        };
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
            run_on_full_flash: true,
            run_on_partial_flash: true,
            ..InstallerAction::new(ActionKind::Dd)
        }]
    }

    pub fn partitions(&self) -> Vec<PartitionDescriptor> {
        self.spec
            .partitions
            .iter()
            .filter_map(|p| {
                let mountpoint = p.mountpoint.clone()?;
                let install_device = p.install_device.clone().or_else(|| p.device.clone())?;
                Some(PartitionDescriptor {
                    mountpoint,
                    install_device,
                    label: p.label.clone(),
                    mapped_ubi_node: None,
                    parent_device: None,
                })
            })
            .collect()
    }

    fn committed_table(&self) -> Result<&PartitionTable, BuildError> {
        self.table.as_ref().ok_or_else(|| {
            BuildError::Io {
                source: std::io::Error::new(
                    std::io::ErrorKind::Other,
                    format!("partition table of {} not created yet", self.filename.display()),
                ),
            }
        })
    }
}

fn basename(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}

fn io_error(path: &Path, error: &std::io::Error) -> ExtractionError {
    ExtractionError::Io {
        path: path.to_path_buf(),
        error: error.to_string(),
    }
}

/// Copy `source` into `target` at the given byte offsets without
/// truncating, in fixed-size chunks, zero-padding the tail to a whole
/// sector
fn copy_range(
    source: &Path,
    target: &Path,
    input_offset: u64,
    output_offset: u64,
    sector_size: u64,
) -> Result<(), ExtractionError> {
    let mut input = std::fs::File::open(source).map_err(|e| io_error(source, &e))?;
    let mut output = OpenOptions::new()
        .write(true)
        .open(target)
        .map_err(|e| io_error(target, &e))?;

    input
        .seek(SeekFrom::Start(input_offset))
        .map_err(|e| io_error(source, &e))?;
    output
        .seek(SeekFrom::Start(output_offset))
        .map_err(|e| io_error(target, &e))?;

    let chunk = (FLASH_CHUNK_SECTORS * sector_size) as usize;
    let mut buf = vec![0u8; chunk];
    loop {
        let read = input.read(&mut buf).map_err(|e| io_error(source, &e))?;
        if read == 0 {
            break;
        }
        let sector = sector_size as usize;
        let padded = if read % sector != 0 {
            // Align the tail write to a sector boundary
            let padded = read.div_ceil(sector) * sector;
            buf[read..padded].fill(0);
            padded
        } else {
            read
        };
        output
            .write_all(&buf[..padded])
            .map_err(|e| io_error(target, &e))?;
    }
    output.flush().map_err(|e| io_error(target, &e))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infra::tools::testing;

    fn raw_spec() -> RawSpec {
        RawSpec {
            install_device: Some("/dev/mmcblk0p1".to_string()),
            size: None,
            partitions: vec![
                PartitionSpec {
                    mountpoint: Some("/".to_string()),
                    size: Some(64),
                    filesystem: Some("ext4".to_string()),
                    label: Some("root".to_string()),
                    ..PartitionSpec::default()
                },
                PartitionSpec {
                    mountpoint: Some("/var".to_string()),
                    size: Some(32),
                    filesystem: Some("ext4".to_string()),
                    label: Some("var".to_string()),
                    readonly: Some(false),
                    ..PartitionSpec::default()
                },
            ],
            dd: None,
        }
    }

    #[test]
    fn filename_strips_partition_suffix() {
        let (tools, _) = testing::fake_toolset_with_log();
        let ctx = BuildContext {
            build_dir: PathBuf::from("/tmp/build"),
            image_name: "demo-rolling".to_string(),
            sector_size: 512,
            tools: &tools,
        };
        let device = RawDevice::new(raw_spec(), TableKind::Msdos, &ctx);
        assert_eq!(
            device.filename,
            PathBuf::from("/tmp/build/demo-rolling_mmcblk0.raw")
        );
    }

    #[test]
    fn create_formats_each_partition_at_its_offset() {
        let dir = tempfile::tempdir().unwrap();
        let (tools, calls) = testing::fake_toolset_with_log();
        let ctx = BuildContext {
            build_dir: dir.path().to_path_buf(),
            image_name: "demo-rolling".to_string(),
            sector_size: 512,
            tools: &tools,
        };
        let mut device = RawDevice::new(raw_spec(), TableKind::Msdos, &ctx);
        device.create(&ctx).unwrap();

        // 64 + 32 partitions + 8 padding
        let image = dir.path().join("demo-rolling_mmcblk0.raw");
        assert_eq!(std::fs::metadata(&image).unwrap().len(), 104 * 1024 * 1024);

        let calls = calls.lock().unwrap();
        assert!(calls[0].starts_with("apply_table"));
        // attach + mkfs + detach per formatted partition
        assert_eq!(calls.iter().filter(|c| c.starts_with("mkfs ")).count(), 2);
    }

    #[test]
    fn mount_orders_by_depth_and_unmount_reverses() {
        let dir = tempfile::tempdir().unwrap();
        let (tools, calls) = testing::fake_toolset_with_log();
        let ctx = BuildContext {
            build_dir: dir.path().to_path_buf(),
            image_name: "demo".to_string(),
            sector_size: 512,
            tools: &tools,
        };
        // Deeper mountpoint listed first; mount must still start at /
        let mut spec = raw_spec();
        spec.partitions.swap(0, 1);
        let mut device = RawDevice::new(spec, TableKind::Msdos, &ctx);
        device.create(&ctx).unwrap();

        let base = dir.path().join("rootfs");
        device.mount(&base, &ctx).unwrap();
        device.unmount(&ctx).unwrap();

        let calls = calls.lock().unwrap();
        let mounts: Vec<&String> =
            calls.iter().filter(|c| c.starts_with("mount ")).collect();
        assert_eq!(mounts.len(), 2);
        assert!(!mounts[0].contains("rootfs/var"));
        assert!(mounts[1].contains("rootfs/var"));
        let unmounts: Vec<&String> =
            calls.iter().filter(|c| c.starts_with("unmount ")).collect();
        assert_eq!(unmounts.len(), 2);
        assert!(unmounts[0].contains("rootfs/var"));
        assert!(!unmounts[1].contains("rootfs/var"));
        assert_eq!(
            device.mounted.len(),
            0,
            "unmount must drain the mount bookkeeping"
        );
    }

    #[test]
    fn flash_respects_partition_capacity() {
        let dir = tempfile::tempdir().unwrap();
        let (tools, _) = testing::fake_toolset_with_log();
        let ctx = BuildContext {
            build_dir: dir.path().to_path_buf(),
            image_name: "demo".to_string(),
            sector_size: 512,
            tools: &tools,
        };
        let mut spec = raw_spec();
        spec.partitions[1].name = Some("firmware".to_string());
        spec.partitions[1].flash = Some(":/boot/fw.bin".to_string());
        let mut device = RawDevice::new(spec, TableKind::Msdos, &ctx);
        device.create(&ctx).unwrap();

        let tree = dir.path().join("tree");
        std::fs::create_dir_all(tree.join("boot")).unwrap();
        // One byte over the 32 MiB partition
        let oversized = vec![0u8; 32 * 1024 * 1024 + 1];
        std::fs::write(tree.join("boot/fw.bin"), &oversized).unwrap();

        let err = device.extract_file(&tree, &ctx).unwrap_err();
        assert!(matches!(
            err,
            BuildError::Extraction(ExtractionError::PartitionOverflow { .. })
        ));
    }

    #[test]
    fn flash_writes_at_partition_offset_and_pads() {
        let dir = tempfile::tempdir().unwrap();
        let (tools, _) = testing::fake_toolset_with_log();
        let ctx = BuildContext {
            build_dir: dir.path().to_path_buf(),
            image_name: "demo".to_string(),
            sector_size: 512,
            tools: &tools,
        };
        let mut spec = raw_spec();
        spec.partitions[1].name = Some("firmware".to_string());
        spec.partitions[1].flash = Some(":/boot/fw.bin".to_string());
        let mut device = RawDevice::new(spec, TableKind::Msdos, &ctx);
        device.create(&ctx).unwrap();

        let tree = dir.path().join("tree");
        std::fs::create_dir_all(tree.join("boot")).unwrap();
        // 3 bytes, must be padded to a full sector
        std::fs::write(tree.join("boot/fw.bin"), b"abc").unwrap();
        device.extract_file(&tree, &ctx).unwrap();

        let offset = device.table.as_ref().unwrap().by_name("firmware").unwrap()
            .byte_offset(512);
        let image = std::fs::read(dir.path().join("demo_mmcblk0.raw")).unwrap();
        assert_eq!(&image[offset as usize..offset as usize + 3], b"abc");
        assert_eq!(image[offset as usize + 3], 0);
        // Source removed by default
        assert!(!tree.join("boot/fw.bin").exists());
    }
}
