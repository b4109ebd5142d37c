//! Verbatim NAND payloads
//!
//! A NAND file device ships exactly one file out of the built rootfs; the
//! installer writes it to an MTD device with `nandwrite`. A `src:dest`
//! declaration renames the artifact, and the installer only ever sees the
//! dest name.

use std::path::{Path, PathBuf};

use tracing::info;

use crate::config::INSTALLER_STAGING_PATH;
use crate::device::BuildContext;
use crate::error::{BuildError, ExtractionError};
use crate::infra::filesystem;
use crate::installer::{ActionKind, InstallerAction};
use crate::spec::NandFileSpec;

pub struct NandFileDevice {
    spec: NandFileSpec,
    filename: PathBuf,
}

impl NandFileDevice {
    pub fn new(spec: NandFileSpec, ctx: &BuildContext) -> Self {
        let artifact = match spec.file.split_once(':') {
            Some((_, dest)) => dest,
            None => spec.file.rsplit('/').next().unwrap_or(&spec.file),
        };
        let filename = ctx.build_dir.join(artifact);
        NandFileDevice { spec, filename }
    }

    /// Pull the declared file out of the mounted tree into the build dir
    pub fn extract_file(&mut self, base: &Path, _ctx: &BuildContext) -> Result<(), BuildError> {
        let source_path = match self.spec.file.split_once(':') {
            Some((src, _)) => src,
            None => &self.spec.file,
        };
        let source = base.join(&source_path[1..]);

        let size = std::fs::metadata(&source)
            .map_err(|e| ExtractionError::Io {
                path: source.clone(),
                error: e.to_string(),
            })?
            .len();
        if let Some(max) = self.spec.max_file_size {
            if size > max {
                return Err(ExtractionError::FileTooBig {
                    file: source,
                    size,
                    max_size: max,
                }
                .into());
            }
        }

        info!(
            source = %source.display(),
            artifact = %self.filename.display(),
            "extracting NAND payload"
        );
        if self.spec.keep_in_image {
            filesystem::copy_file(&source, &self.filename)?;
        } else {
            filesystem::move_file(&source, &self.filename)?;
        }
        Ok(())
    }

    pub fn device_files(&self) -> Vec<PathBuf> {
        vec![self.filename.clone()]
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
            target: Some(install_device),
            source: Some(source),
            start: self.spec.start,
            logical_eraseblock_size: self.spec.logical_eraseblock_size,
            run_on_full_flash: true,
            run_on_partial_flash: true,
            ..InstallerAction::new(ActionKind::NandWrite)
        }]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infra::tools::testing;

    fn ctx<'a>(tools: &'a crate::infra::tools::Toolset, build_dir: PathBuf) -> BuildContext<'a> {
        BuildContext {
            build_dir,
            image_name: "demo".to_string(),
            sector_size: 512,
            tools,
        }
    }

    #[test]
    fn renamed_artifact_uses_dest_name() {
        let tools = testing::fake_toolset();
        let ctx = ctx(&tools, PathBuf::from("/tmp/build"));
        let device = NandFileDevice::new(
            NandFileSpec {
                file: "/boot/uImage:kernel.img".to_string(),
                install_device: Some("/dev/mtd1".to_string()),
                max_file_size: None,
                start: Some(0x800),
                logical_eraseblock_size: None,
                keep_in_image: false,
            },
            &ctx,
        );
        assert_eq!(device.filename, PathBuf::from("/tmp/build/kernel.img"));
        let actions = device.installer_actions();
        assert_eq!(actions[0].source.as_deref(), Some("/installer/kernel.img"));
        assert_eq!(actions[0].start, Some(0x800));
        assert!(matches!(actions[0].kind, ActionKind::NandWrite));
    }

    #[test]
    fn oversized_file_aborts_extraction() {
        let dir = tempfile::tempdir().unwrap();
        let tools = testing::fake_toolset();
        let ctx = ctx(&tools, dir.path().to_path_buf());
        let tree = dir.path().join("tree");
        std::fs::create_dir_all(tree.join("boot")).unwrap();
        std::fs::write(tree.join("boot/uImage"), vec![0u8; 32]).unwrap();

        let mut device = NandFileDevice::new(
            NandFileSpec {
                file: "/boot/uImage".to_string(),
                install_device: Some("/dev/mtd1".to_string()),
                max_file_size: Some(16),
                start: None,
                logical_eraseblock_size: None,
                keep_in_image: false,
            },
            &ctx,
        );
        let err = device.extract_file(&tree, &ctx).unwrap_err();
        assert!(matches!(
            err,
            BuildError::Extraction(ExtractionError::FileTooBig { .. })
        ));
    }

    #[test]
    fn extraction_moves_by_default() {
        let dir = tempfile::tempdir().unwrap();
        let tools = testing::fake_toolset();
        let ctx = ctx(&tools, dir.path().to_path_buf());
        let tree = dir.path().join("tree");
        std::fs::create_dir_all(tree.join("boot")).unwrap();
        std::fs::write(tree.join("boot/uImage"), b"kernel").unwrap();

        let mut device = NandFileDevice::new(
            NandFileSpec {
                file: "/boot/uImage:kernel.img".to_string(),
                install_device: None,
                max_file_size: None,
                start: None,
                logical_eraseblock_size: None,
                keep_in_image: false,
            },
            &ctx,
        );
        device.extract_file(&tree, &ctx).unwrap();
        assert!(!tree.join("boot/uImage").exists());
        assert_eq!(
            std::fs::read(dir.path().join("kernel.img")).unwrap(),
            b"kernel"
        );
        assert!(device.installer_actions().is_empty());
    }
}
