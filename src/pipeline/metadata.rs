//! Image artifact metadata
//!
//! Every published artifact carries a metadata document: appliance name,
//! version, download size, a SHA-256 checksum, and the package manifest
//! of the rootfs, parsed from the `<image>.packages` listing the rootfs
//! build leaves behind.

use std::io::Read;
use std::path::Path;

use serde::Serialize;
use sha2::{Digest, Sha256};

use crate::error::BuildError;
use crate::infra::filesystem;

const CHECKSUM_BLOCK_SIZE: usize = 65536;

#[derive(Debug, Serialize)]
pub struct ImageMetadata {
    pub packages: Vec<String>,
    pub appliance_name: String,
    pub version: String,
    pub download_size: u64,
    pub checksum: String,
}

impl ImageMetadata {
    /// Metadata for one payload file. `packages_file` is the package
    /// listing of the rootfs; absent when the image carries no manifest.
    pub fn generate(
        appliance_name: &str,
        version: Option<&str>,
        payload: Option<&Path>,
        packages_file: Option<&Path>,
    ) -> Result<Self, BuildError> {
        let (download_size, checksum) = match payload {
            Some(payload) => (
                std::fs::metadata(payload)?.len(),
                sha256_of(payload)?,
            ),
            None => (0, String::new()),
        };

        let packages = match packages_file {
            Some(path) => parse_packages(&filesystem::read_file(path)?),
            None => Vec::new(),
        };

        Ok(ImageMetadata {
            packages,
            appliance_name: appliance_name.to_string(),
            version: version.unwrap_or("rolling").to_string(),
            download_size,
            checksum,
        })
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }
}

/// Streamed SHA-256 of a file, hex encoded
pub fn sha256_of(path: &Path) -> Result<String, BuildError> {
    let mut file = std::fs::File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buf = [0u8; CHECKSUM_BLOCK_SIZE];
    loop {
        let read = file.read(&mut buf)?;
        if read == 0 {
            break;
        }
        hasher.update(&buf[..read]);
    }
    Ok(hex::encode(hasher.finalize()))
}

/// Parse `<name>.<arch> <epoch>:<version>` lines into `name-version.arch`
fn parse_packages(listing: &str) -> Vec<String> {
    listing
        .lines()
        .filter_map(|line| {
            let (nevra, version) = line.split_once(' ')?;
            let (name, arch) = nevra.rsplit_once('.')?;
            let version = version.rsplit(':').next().unwrap_or(version);
            Some(format!("{name}-{version}.{arch}"))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn packages_fold_epoch_and_keep_arch() {
        let listing = "systemd.armv7hl 1:219-18\nbash.armv7hl 4.3.42-1\n";
        assert_eq!(
            parse_packages(listing),
            vec!["systemd-219-18.armv7hl", "bash-4.3.42-1.armv7hl"]
        );
    }

    #[test]
    fn malformed_package_lines_are_skipped() {
        assert!(parse_packages("no-space-here\n\n").is_empty());
    }

    #[test]
    fn checksum_and_size_from_payload() {
        let dir = tempfile::tempdir().unwrap();
        let payload = dir.path().join("image.raw");
        std::fs::write(&payload, b"imgforge").unwrap();

        let metadata =
            ImageMetadata::generate("box", Some("2.1"), Some(&payload), None).unwrap();
        assert_eq!(metadata.download_size, 8);
        assert_eq!(metadata.checksum.len(), 64);
        assert_eq!(metadata.version, "2.1");
        assert!(metadata.packages.is_empty());
    }

    #[test]
    fn missing_payload_yields_empty_checksum() {
        let metadata = ImageMetadata::generate("box", None, None, None).unwrap();
        assert_eq!(metadata.download_size, 0);
        assert!(metadata.checksum.is_empty());
        assert_eq!(metadata.version, "rolling");
    }
}
