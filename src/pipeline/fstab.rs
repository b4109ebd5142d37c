//! fstab regeneration
//!
//! The fstab shipped inside the rootfs archive describes the build host's
//! view of the world, so it is regenerated from the device set: device
//! entries first, then the fixed pseudo-filesystems, then any custom
//! entries from the spec. The previous file is kept next to it as
//! `fstab.generated`.

use std::fmt::Write as _;
use std::path::Path;

use tracing::debug;

use crate::config::FIXED_FSTAB_ENTRIES;
use crate::device::{BuildContext, Device};
use crate::error::BuildError;
use crate::infra::filesystem;
use crate::spec::ImageSpec;

pub fn regenerate(
    mount_dir: &Path,
    devices: &[Device],
    spec: &ImageSpec,
    ctx: &BuildContext,
) -> Result<(), BuildError> {
    let fstab = mount_dir.join("etc/fstab");
    filesystem::rename(&fstab, &mount_dir.join("etc/fstab.generated"))?;

    let content = render(devices, spec, ctx)?;
    debug!(lines = content.lines().count(), "writing regenerated fstab");
    filesystem::write_file(&fstab, &content)?;
    Ok(())
}

fn render(devices: &[Device], spec: &ImageSpec, ctx: &BuildContext) -> Result<String, BuildError> {
    let mut content = String::new();
    for device in devices.iter().filter(|d| d.has_fstab_entries()) {
        for entry in device.fstab_entries(ctx)? {
            let _ = writeln!(content, "{entry}");
        }
    }
    for entry in FIXED_FSTAB_ENTRIES {
        let _ = writeln!(content, "{entry}");
    }
    for entry in &spec.custom_fstab_entries {
        let _ = writeln!(content, "{entry}");
    }
    Ok(content)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::assemble_devices;
    use crate::infra::tools::testing;

    #[test]
    fn device_entries_come_before_fixed_and_custom() {
        let spec = ImageSpec::from_json(
            r#"{
                "name": "demo", "type": "raw", "arch": "armv7hl",
                "custom_fstab_entries": ["/dev/mmcblk1p1 /media auto defaults,noauto 0 0"],
                "devices": [
                    {"type": "partition", "mountpoint": "/", "size": 100,
                     "filesystem": "ext4", "label": "root",
                     "install_device": "/dev/mmcblk0p1"}
                ]
            }"#,
        )
        .unwrap();
        let tools = testing::fake_toolset();
        let ctx = BuildContext {
            build_dir: std::path::PathBuf::from("/tmp/build"),
            image_name: "demo".to_string(),
            sector_size: 512,
            tools: &tools,
        };
        let devices = assemble_devices(&spec, &ctx).unwrap();
        let content = render(&devices, &spec, &ctx).unwrap();
        let lines: Vec<&str> = content.lines().collect();

        assert_eq!(lines[0], "LABEL=\"root\" / ext4 ro,discard 0 0");
        assert!(lines[1].starts_with("devpts"));
        assert!(lines[4].starts_with("sysfs"));
        assert_eq!(lines[5], "/dev/mmcblk1p1 /media auto defaults,noauto 0 0");
        assert_eq!(lines.len(), 6);
    }
}
