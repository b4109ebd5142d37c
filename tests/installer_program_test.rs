//! End-to-end installer program compilation
//!
//! Full layouts go in, ordered and gated action lists come out:
//! - partition tables precede every per-device action
//! - cache erasure resolves each target to the partition that holds it
//! - the serialized program is byte-stable across compilations

use imgforge::device::{assemble_devices, BuildContext, Device};
use imgforge::infra::tools::{testing, Toolset};
use imgforge::installer::{compiler, ActionKind, InstallerAction};
use imgforge::spec::ImageSpec;

fn assemble(json: &str, tools: &Toolset) -> (ImageSpec, Vec<Device>) {
    let spec = ImageSpec::from_json(json).expect("layout should parse");
    let ctx = BuildContext {
        build_dir: std::path::PathBuf::from("/tmp/build"),
        image_name: spec.name.clone(),
        sector_size: spec.sector_size(),
        tools,
    };
    let devices = assemble_devices(&spec, &ctx).expect("layout should assemble");
    (spec, devices)
}

fn erases(actions: &[InstallerAction]) -> Vec<(&str, &str)> {
    actions
        .iter()
        .filter(|a| a.kind == ActionKind::EraseDirectory)
        .map(|a| {
            (
                a.target.as_deref().unwrap_or(""),
                a.relative_path.as_deref().unwrap_or(""),
            )
        })
        .collect()
}

#[test]
fn erase_targets_resolve_to_the_root_partition() {
    let tools = testing::fake_toolset();
    let (spec, devices) = assemble(
        r#"{
            "name": "box", "type": "raw", "arch": "armv7hl",
            "devices": [
                {"type": "partition", "mountpoint": "/", "size": 100,
                 "filesystem": "ext4", "install_device": "/dev/mmcblk0p1"}
            ]
        }"#,
        &tools,
    );
    let program = compiler::compile(&spec, &devices, None, None).unwrap();
    assert_eq!(
        erases(&program.actions),
        vec![
            ("/dev/mmcblk0p1", "var/cache"),
            ("/dev/mmcblk0p1", "var/lib/rpm"),
            ("/dev/mmcblk0p1", "var/lib/orbits/*/.cache"),
        ]
    );
}

#[test]
fn erase_targets_prefer_the_deepest_holding_partition() {
    let tools = testing::fake_toolset();
    let (spec, devices) = assemble(
        r#"{
            "name": "box", "type": "raw", "arch": "armv7hl",
            "devices": [
                {"type": "partition", "mountpoint": "/", "size": 100,
                 "filesystem": "ext4", "install_device": "/dev/mmcblk0p1"},
                {"type": "partition", "mountpoint": "/var", "size": 50,
                 "filesystem": "ext4", "install_device": "/dev/mmcblk0p2"}
            ]
        }"#,
        &tools,
    );
    let program = compiler::compile(&spec, &devices, None, None).unwrap();
    assert_eq!(
        erases(&program.actions),
        vec![
            ("/dev/mmcblk0p2", "cache"),
            ("/dev/mmcblk0p2", "lib/rpm"),
            ("/dev/mmcblk0p2", "lib/orbits/*/.cache"),
        ]
    );
}

#[test]
fn dedicated_cache_partition_is_erased_whole() {
    let tools = testing::fake_toolset();
    let (spec, devices) = assemble(
        r#"{
            "name": "box", "type": "raw", "arch": "armv7hl",
            "devices": [
                {"type": "partition", "mountpoint": "/", "size": 100,
                 "filesystem": "ext4", "install_device": "/dev/mmcblk0p1"},
                {"type": "partition", "mountpoint": "/var/cache", "size": 20,
                 "filesystem": "ext4", "install_device": "/dev/mmcblk0p2"},
                {"type": "partition", "mountpoint": "/var/cache/dnf", "size": 10,
                 "filesystem": "ext4", "install_device": "/dev/mmcblk0p3"}
            ]
        }"#,
        &tools,
    );
    let program = compiler::compile(&spec, &devices, None, None).unwrap();

    // The /var/cache/dnf submount goes first, then the cache partition
    // itself, then the /-resident targets
    assert_eq!(
        erases(&program.actions),
        vec![
            ("/dev/mmcblk0p3", ""),
            ("/dev/mmcblk0p2", ""),
            ("/dev/mmcblk0p1", "var/lib/rpm"),
            ("/dev/mmcblk0p1", "var/lib/orbits/*/.cache"),
        ]
    );
}

#[test]
fn layout_without_mountpoints_erases_nothing() {
    let tools = testing::fake_toolset();
    let (spec, devices) = assemble(
        r#"{
            "name": "box", "type": "fs", "arch": "armv7hl",
            "devices": [
                {"type": "nand-file", "file": "/boot/uImage",
                 "install_device": "/dev/mtd1"}
            ]
        }"#,
        &tools,
    );
    let program = compiler::compile(&spec, &devices, None, None).unwrap();
    assert!(erases(&program.actions).is_empty());
}

#[test]
fn full_layout_orders_tables_devices_erases_and_bootloader() {
    let tools = testing::fake_toolset();
    let (spec, devices) = assemble(
        r#"{
            "name": "box_installer", "type": "raw", "arch": "armv7hl",
            "boot_files": ["/boot/uImage:kernel.img"],
            "scripts": [{"path": "/usr/sbin/firstboot", "message": "Configuring"}],
            "additional_actions": [
                {"type": "set_u-boot_environment",
                 "environment": {"bootdelay": "0"}}
            ],
            "devices": [
                {"type": "partition", "mountpoint": "/", "size": 200,
                 "filesystem": "ext4", "label": "root",
                 "install_device": "/dev/mmcblk0p1"},
                {"type": "partition-recovery", "mountpoint": "/recovery",
                 "size": 300, "filesystem": "ext4", "label": "recovery",
                 "install_device": "/dev/mmcblk0p2"},
                {"type": "nand-file", "file": "/boot/u-boot.imx",
                 "install_device": "/dev/mtd0", "start": 1024}
            ]
        }"#,
        &tools,
    );
    let program = compiler::compile(&spec, &devices, None, Some("7")).unwrap();

    assert_eq!(program.appliance_name, "box");
    assert_eq!(program.appliance_version, "7");
    assert!(program.has_recovery);
    assert_eq!(program.recovery_device.as_deref(), Some("/dev/mmcblk0p2"));
    assert_eq!(program.scripts.as_ref().map(Vec::len), Some(1));

    let kinds: Vec<ActionKind> = program.actions.iter().map(|a| a.kind).collect();
    assert_eq!(
        kinds,
        vec![
            ActionKind::PartitionTable,
            ActionKind::Dd,
            ActionKind::Mkfs,
            ActionKind::CopyRecovery,
            ActionKind::NandWrite,
            ActionKind::EraseDirectory,
            ActionKind::EraseDirectory,
            ActionKind::EraseDirectory,
            ActionKind::UBootEnvUpdate,
        ]
    );

    let copy = &program.actions[3];
    assert_eq!(
        copy.files.as_ref().unwrap(),
        &vec!["kernel.img".to_string(), "appliance.img".to_string()]
    );
}

#[test]
fn ubinize_collapses_volume_updates_into_one_format() {
    let tools = testing::fake_toolset();
    let (spec, devices) = assemble(
        r#"{
            "name": "box", "type": "fs", "arch": "armv7hl",
            "devices": [
                {"type": "ubi", "mapped_node": "/dev/ubi0",
                 "install_device": "/dev/mtd3", "ubinize": true,
                 "logical_eraseblock_size": 126976,
                 "minimum_unit_size": 2048,
                 "physical_eraseblock_size": 131072,
                 "volumes": [
                    {"mountpoint": "/", "size": 80},
                    {"mountpoint": "/var", "size": 16}
                 ]}
            ]
        }"#,
        &tools,
    );
    let program = compiler::compile(&spec, &devices, None, None).unwrap();

    let formats: Vec<&InstallerAction> = program
        .actions
        .iter()
        .filter(|a| a.kind == ActionKind::UbiFormat)
        .collect();
    assert_eq!(formats.len(), 1);
    assert_eq!(formats[0].source.as_deref(), Some("/installer/ubi0.ubi"));
    assert!(formats[0].run_on_full_flash);
    assert!(formats[0].run_on_partial_flash);
    assert!(!program
        .actions
        .iter()
        .any(|a| a.kind == ActionKind::UbiUpdateVol));
}

#[test]
fn compilation_is_deterministic() {
    let tools = testing::fake_toolset();
    let (spec, devices) = assemble(
        r#"{
            "name": "box", "type": "raw", "arch": "armv7hl",
            "scripts": [
                {"path": "/usr/libexec/first-boot.sh",
                 "message": "Finishing installation"}
            ],
            "devices": [
                {"type": "partition", "mountpoint": "/", "size": 100,
                 "filesystem": "ext4", "install_device": "/dev/mmcblk0p1"},
                {"type": "partition", "mountpoint": "/var", "size": 50,
                 "filesystem": "ext4", "install_device": "/dev/mmcblk0p2"},
                {"type": "ubi", "mapped_node": "/dev/ubi0",
                 "install_device": "/dev/mtd3",
                 "logical_eraseblock_size": 126976,
                 "minimum_unit_size": 2048,
                 "volumes": [{"mountpoint": "/data", "size": 32}]}
            ]
        }"#,
        &tools,
    );

    let first = compiler::compile(&spec, &devices, Some("lite"), Some("2.1")).unwrap();
    let second = compiler::compile(&spec, &devices, Some("lite"), Some("2.1")).unwrap();
    assert_eq!(first, second);
    assert_eq!(first.scripts, second.scripts);
    assert!(first.scripts.as_ref().is_some_and(|s| s.len() == 1));
    assert_eq!(first.to_json().unwrap(), second.to_json().unwrap());
}
