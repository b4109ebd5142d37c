//! Installer program compiler
//!
//! Turns the assembled device set into the ordered action list the
//! installer executes on the target. Ordering is load-bearing:
//! partition tables come first, then every device's own actions in
//! declaration order, then the cache erases, then bootloader actions.

use tracing::{debug, warn};

use crate::config::{erase_targets, EXTENDED_PADDING_MIB, MAIN_IMAGE_FILENAME};
use crate::device::{Device, PartitionDescriptor};
use crate::error::{BuildError, LayoutError, SpecError};
use crate::installer::{ActionKind, InstallerAction, InstallerProgram, TableEntry};
use crate::layout::{base_device_node, partition_number, TableKind};
use crate::spec::{AdditionalAction, ImageSpec, PartitionSpec};

/// Compile the full installer program for one image build
pub fn compile(
    spec: &ImageSpec,
    devices: &[Device],
    variant: Option<&str>,
    version: Option<&str>,
) -> Result<InstallerProgram, BuildError> {
    let mut actions = partition_table_actions(devices, spec.sector_size())?;

    for device in devices {
        actions.extend(device.installer_actions());
    }

    let mut program = InstallerProgram {
        actions,
        appliance_name: appliance_name(&spec.name, variant),
        appliance_version: version.unwrap_or("rolling").to_string(),
        has_recovery: false,
        recovery_device: None,
        recovery_device_filesystem_label: None,
        scripts: None,
    };

    fixup_copy_recovery(&mut program, spec);
    append_erase_actions(&mut program.actions, devices);
    append_additional_actions(&mut program.actions, &spec.additional_actions)?;

    if !spec.scripts.is_empty() {
        program.scripts = Some(spec.scripts.clone());
    }

    Ok(program)
}

/// The appliance name the installer reports: the image name without its
/// `_installer` suffix, with the variant appended
fn appliance_name(image_name: &str, variant: Option<&str>) -> String {
    let base = image_name.strip_suffix("_installer").unwrap_or(image_name);
    match variant {
        Some(variant) => format!("{base}_{variant}"),
        None => base.to_string(),
    }
}

/// A partition table under construction for one physical device node
struct TableGroup {
    node: String,
    kind: TableKind,
    primaries: u32,
    entries: Vec<TableEntry>,
    /// msdos partitions numbered 5 and up, wrapped by a synthesized
    /// extended partition
    logical: Vec<PartitionSpec>,
}

/// Group every standalone partition by its base device node and compile
/// one `partition_table` action per node
fn partition_table_actions(
    devices: &[Device],
    sector_size: u64,
) -> Result<Vec<InstallerAction>, BuildError> {
    let mut groups: Vec<TableGroup> = Vec::new();

    for device in devices {
        let Some((p, kind)) = device.table_slot() else {
            continue;
        };
        let Some(install_device) = p.install_device.as_deref() else {
            continue;
        };
        let node = base_device_node(install_device).to_string();
        let number = partition_number(install_device)?;

        let group = match groups.iter_mut().find(|g| g.node == node) {
            Some(group) => {
                if group.kind != kind {
                    return Err(LayoutError::TableKindMismatch { device: node }.into());
                }
                group
            }
            None => {
                groups.push(TableGroup {
                    node: node.clone(),
                    kind,
                    primaries: 0,
                    entries: Vec::new(),
                    logical: Vec::new(),
                });
                groups.last_mut().unwrap()
            }
        };

        if kind == TableKind::Msdos && number >= 5 {
            group.logical.push(p.clone());
        } else {
            if kind == TableKind::Msdos {
                group.primaries += 1;
            }
            group.entries.push(table_entry(p, install_device));
        }
    }

    let mut actions = Vec::with_capacity(groups.len());
    for mut group in groups {
        if group.primaries >= 4 && !group.logical.is_empty() {
            return Err(LayoutError::PrimaryOverflow { device: group.node }.into());
        }
        if !group.logical.is_empty() {
            group
                .entries
                .push(extended_entry(&group.node, &group.logical, sector_size));
            for p in &group.logical {
                let install_device = p.install_device.as_deref().unwrap_or_default();
                group.entries.push(table_entry(p, install_device));
            }
        }

        debug!(
            node = group.node.as_str(),
            kind = group.kind.as_str(),
            partitions = group.entries.len(),
            "compiled partition table"
        );
        actions.push(InstallerAction {
            target: Some(group.node),
            table_type: Some(group.kind.as_str().to_string()),
            partitions: Some(group.entries),
            run_on_full_flash: true,
            run_on_partial_flash: false,
            // Repartitioning the disk we run from is never sane
            run_in_recovery_mode: Some(false),
            ..InstallerAction::new(ActionKind::PartitionTable)
        });
    }
    Ok(actions)
}

fn table_entry(p: &PartitionSpec, install_device: &str) -> TableEntry {
    TableEntry {
        target: install_device.to_string(),
        start_sector: p.start_sector,
        end_sector: p.end_sector,
        size: p.size,
        partition_type: p.partition_type.clone(),
        name: p.name.clone(),
        filesystem_label: p.label.clone(),
        flags: p.flags.clone(),
    }
}

/// The extended partition wrapping all logical partitions of one node.
/// Sized as the children plus fixed padding, or spanned by explicit
/// sectors when the children carry them.
fn extended_entry(node: &str, logical: &[PartitionSpec], sector_size: u64) -> TableEntry {
    let mut entry = TableEntry {
        target: node.to_string(),
        start_sector: None,
        end_sector: None,
        size: None,
        partition_type: Some("msdos_extended".to_string()),
        name: None,
        filesystem_label: None,
        flags: None,
    };

    let first = &logical[0];
    if first.size.is_some() {
        entry.size = Some(
            EXTENDED_PADDING_MIB + logical.iter().map(|p| p.size.unwrap_or(0)).sum::<u64>(),
        );
    } else if let Some(start) = first.start_sector {
        entry.start_sector = Some(start);
        entry.end_sector = logical
            .last()
            .and_then(|p| p.end_sector)
            .map(|end| end + (EXTENDED_PADDING_MIB * 1024 * 1024).div_ceil(sector_size));
    }
    entry
}

/// Mark the program as recovery-capable and list the files the installer
/// copies onto the recovery partition
fn fixup_copy_recovery(program: &mut InstallerProgram, spec: &ImageSpec) {
    for action in &mut program.actions {
        if action.kind != ActionKind::CopyRecovery {
            continue;
        }
        program.has_recovery = true;
        program.recovery_device = action.target.clone();
        program.recovery_device_filesystem_label = action.filesystem_label.clone();

        let mut files: Vec<String> = spec
            .boot_files
            .iter()
            .map(|f| {
                // The installer sees the dest side of src:dest renames
                f.rsplit(':').next().unwrap_or(f).to_string()
            })
            .collect();
        files.push(MAIN_IMAGE_FILENAME.to_string());
        action.files = Some(files);
    }
}

/// Stale caches and package databases must never survive a partial
/// reflash: the new rootfs knows nothing about them. Resolve each target
/// directory to the partition that actually holds it and erase it there.
fn append_erase_actions(actions: &mut Vec<InstallerAction>, devices: &[Device]) {
    let partitions: Vec<PartitionDescriptor> = devices
        .iter()
        .filter(|d| d.can_be_mounted() || d.can_be_packaged())
        .flat_map(|d| d.partitions())
        .collect();

    // Dedicated submounts below /var/cache are erased whole
    for p in partitions
        .iter()
        .filter(|p| p.mountpoint.starts_with("/var/cache/"))
    {
        push_erase(actions, p, String::new());
    }

    let targets = [
        (erase_targets::VAR_CACHE, None),
        (erase_targets::VAR_LIB_RPM, None),
        (erase_targets::ORBITS, Some(erase_targets::ORBITS_GLOB)),
    ];
    for (target, glob) in targets {
        match resolve_erase(&partitions, target, glob) {
            Some((partition, relative)) => push_erase(actions, partition, relative),
            None => warn!(target, "no partition holds this path, skipping erase"),
        }
    }
}

/// Find the deepest partition holding `target`, walking its ancestors
/// down to `/`, and the path of `target` relative to that mountpoint
fn resolve_erase<'a>(
    partitions: &'a [PartitionDescriptor],
    target: &str,
    glob: Option<&str>,
) -> Option<(&'a PartitionDescriptor, String)> {
    let mut ancestor = target;
    loop {
        if let Some(partition) = partitions.iter().find(|p| p.mountpoint == ancestor) {
            let relative = target[ancestor.len()..].trim_start_matches('/');
            let relative = match (relative.is_empty(), glob) {
                (true, Some(glob)) => glob.to_string(),
                (false, Some(glob)) => format!("{relative}/{glob}"),
                (_, None) => relative.to_string(),
            };
            return Some((partition, relative));
        }
        if ancestor == "/" {
            return None;
        }
        ancestor = match ancestor.rfind('/') {
            Some(0) => "/",
            Some(idx) => &ancestor[..idx],
            None => "/",
        };
    }
}

/// One erase, bracketed by attach/detach when the partition is a UBI
/// volume the installer has to bring up first
fn push_erase(actions: &mut Vec<InstallerAction>, p: &PartitionDescriptor, relative: String) {
    let ubi = p.is_ubi();
    if ubi {
        actions.push(InstallerAction {
            target: p.mapped_ubi_node.clone(),
            parent_device: p.parent_device.clone(),
            run_on_full_flash: false,
            run_on_partial_flash: true,
            ..InstallerAction::new(ActionKind::UbiAttach)
        });
    }
    actions.push(InstallerAction {
        target: Some(p.install_device.clone()),
        filesystem_label: p.label.clone(),
        relative_path: Some(relative),
        run_on_full_flash: false,
        run_on_partial_flash: true,
        ..InstallerAction::new(ActionKind::EraseDirectory)
    });
    if ubi {
        actions.push(InstallerAction {
            target: p.mapped_ubi_node.clone(),
            parent_device: p.parent_device.clone(),
            run_on_full_flash: false,
            run_on_partial_flash: true,
            ..InstallerAction::new(ActionKind::UbiDetach)
        });
    }
}

/// Expand the spec's bootloader actions into concrete installer steps
fn append_additional_actions(
    actions: &mut Vec<InstallerAction>,
    additional: &[AdditionalAction],
) -> Result<(), SpecError> {
    for action in additional {
        match action.kind.as_str() {
            "flash_kobs_u-boot" => {
                // The environment lives in the area the kobs write clobbers
                actions.push(InstallerAction {
                    run_on_full_flash: true,
                    run_on_partial_flash: true,
                    ..InstallerAction::new(ActionKind::BackupUBootEnvironment)
                });

                let search_exponent = Some(action.search_exponent.unwrap_or(2));
                if let (Some(spl_device), Some(spl_file)) =
                    (action.spl_device.clone(), action.spl_file.clone())
                {
                    actions.push(InstallerAction {
                        target: Some(spl_device),
                        source: Some(spl_file),
                        search_exponent,
                        run_on_full_flash: true,
                        run_on_partial_flash: true,
                        ..InstallerAction::new(ActionKind::FlashKobs)
                    });
                    actions.push(InstallerAction {
                        target: action.u_boot_device.clone(),
                        source: action.u_boot_file.clone(),
                        start: action.u_boot_start,
                        logical_eraseblock_size: action.logical_eraseblock_size,
                        run_on_full_flash: true,
                        run_on_partial_flash: true,
                        ..InstallerAction::new(ActionKind::NandWrite)
                    });
                } else {
                    actions.push(InstallerAction {
                        target: action.u_boot_device.clone(),
                        source: action.u_boot_file.clone(),
                        search_exponent,
                        run_on_full_flash: true,
                        run_on_partial_flash: true,
                        ..InstallerAction::new(ActionKind::FlashKobs)
                    });
                }

                if let (Some(dtb_device), Some(dtb_file)) =
                    (action.dtb_device.clone(), action.dtb_file.clone())
                {
                    actions.push(InstallerAction {
                        target: Some(dtb_device),
                        source: Some(dtb_file),
                        start: action.dtb_start,
                        logical_eraseblock_size: action.logical_eraseblock_size,
                        run_on_full_flash: true,
                        run_on_partial_flash: true,
                        ..InstallerAction::new(ActionKind::NandWrite)
                    });
                }

                actions.push(InstallerAction {
                    run_on_full_flash: true,
                    run_on_partial_flash: true,
                    ..InstallerAction::new(ActionKind::RestoreUBootEnvironment)
                });
            }
            "set_u-boot_environment" => {
                actions.push(InstallerAction {
                    environment: action.environment.clone(),
                    run_on_full_flash: true,
                    run_on_partial_flash: true,
                    ..InstallerAction::new(ActionKind::UBootEnvUpdate)
                });
            }
            other => {
                return Err(SpecError::UnknownAction {
                    action: other.to_string(),
                });
            }
        }
    }
    Ok(())
}
