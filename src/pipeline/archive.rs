//! Rootfs unpacking and artifact compression
//!
//! The rootfs arrives as a tarball, optionally compressed; the produced
//! device images leave as one compressed tarball when there are several,
//! or as a single compressed file.

use std::fs::File;
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use tracing::info;
use xz2::read::XzDecoder;
use xz2::write::XzEncoder;

use crate::error::BuildError;
use crate::spec::CompressionFormat;

/// Unpack a rootfs tarball into `dest`, transparently decompressing by
/// file extension
pub fn extract_rootfs(archive: &Path, dest: &Path) -> Result<(), BuildError> {
    let file = File::open(archive)?;
    let name = archive
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();

    let reader: Box<dyn Read> = if name.ends_with(".tar.gz") || name.ends_with(".tgz") {
        Box::new(GzDecoder::new(file))
    } else if name.ends_with(".tar.xz") {
        Box::new(XzDecoder::new(file))
    } else if name.ends_with(".tar.zst") {
        Box::new(zstd::stream::read::Decoder::new(file)?)
    } else {
        Box::new(file)
    };

    let mut unpacker = tar::Archive::new(reader);
    unpacker.set_preserve_permissions(true);
    unpacker.unpack(dest)?;
    Ok(())
}

/// Compress several artifact files into one tarball at `out`, with paths
/// stored relative to `base_dir`
pub fn compress_artifacts(
    files: &[PathBuf],
    base_dir: &Path,
    out: &Path,
    format: CompressionFormat,
) -> Result<(), BuildError> {
    info!(out = %out.display(), files = files.len(), "compressing artifacts");
    let file = File::create(out)?;
    match format {
        CompressionFormat::Gz => {
            let encoder = append_all(GzEncoder::new(file, Compression::default()), files, base_dir)?;
            encoder.finish()?;
        }
        CompressionFormat::Xz => {
            let encoder = append_all(XzEncoder::new(file, 6), files, base_dir)?;
            encoder.finish()?;
        }
        CompressionFormat::Zst => {
            let encoder = append_all(zstd::stream::write::Encoder::new(file, 0)?, files, base_dir)?;
            encoder.finish()?;
        }
    }
    Ok(())
}

/// Compress a single artifact in place, removing the original. Returns
/// the compressed file's path.
pub fn compress_file(file: &Path, format: CompressionFormat) -> Result<PathBuf, BuildError> {
    let out = PathBuf::from(format!("{}.{}", file.display(), format.extension()));
    info!(file = %file.display(), out = %out.display(), "compressing");

    let mut input = File::open(file)?;
    let output = File::create(&out)?;
    match format {
        CompressionFormat::Gz => {
            let mut encoder = GzEncoder::new(output, Compression::default());
            io::copy(&mut input, &mut encoder)?;
            encoder.finish()?;
        }
        CompressionFormat::Xz => {
            let mut encoder = XzEncoder::new(output, 6);
            io::copy(&mut input, &mut encoder)?;
            encoder.finish()?;
        }
        CompressionFormat::Zst => {
            let mut encoder = zstd::stream::write::Encoder::new(output, 0)?;
            io::copy(&mut input, &mut encoder)?;
            encoder.finish()?;
        }
    }
    std::fs::remove_file(file)?;
    Ok(out)
}

fn append_all<W: Write>(writer: W, files: &[PathBuf], base_dir: &Path) -> Result<W, BuildError> {
    let mut builder = tar::Builder::new(writer);
    for file in files {
        let name: &Path = match file.strip_prefix(base_dir) {
            Ok(relative) => relative,
            Err(_) => Path::new(file.file_name().unwrap_or(file.as_os_str())),
        };
        builder.append_path_with_name(file, name)?;
    }
    Ok(builder.into_inner()?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tarball_round_trips_through_extraction() {
        let dir = tempfile::tempdir().unwrap();
        let payload = dir.path().join("rootfs.raw");
        std::fs::write(&payload, b"data").unwrap();

        let out = dir.path().join("artifacts.tar.gz");
        compress_artifacts(
            &[payload.clone()],
            dir.path(),
            &out,
            CompressionFormat::Gz,
        )
        .unwrap();

        let dest = dir.path().join("unpacked");
        std::fs::create_dir_all(&dest).unwrap();
        extract_rootfs(&out, &dest).unwrap();
        assert_eq!(std::fs::read(dest.join("rootfs.raw")).unwrap(), b"data");
    }

    #[test]
    fn single_file_compression_replaces_the_original() {
        let dir = tempfile::tempdir().unwrap();
        let payload = dir.path().join("disk.raw");
        std::fs::write(&payload, vec![0u8; 4096]).unwrap();

        let out = compress_file(&payload, CompressionFormat::Gz).unwrap();
        assert_eq!(out, dir.path().join("disk.raw.gz"));
        assert!(out.exists());
        assert!(!payload.exists());
    }
}
