//! Archive extraction for staged images.
//!
//! Blocking helpers; callers run them on `tokio::task::spawn_blocking`.

use std::fs::File;
use std::io::{self, BufReader};
use std::path::Path;

use flate2::read::GzDecoder;
use thiserror::Error;

/// Errors from archive extraction.
#[derive(Debug, Error)]
pub enum ExtractError {
    /// The data did not match its declared archive format.
    #[error("malformed archive: {0}")]
    Malformed(String),

    /// I/O error opening the archive or writing extracted files.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Archive formats the stager can unpack.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchiveFormat {
    Zip,
    Tar,
    TarGz,
}

impl ArchiveFormat {
    /// Map a MIME type to an archive format, `None` for plain payloads.
    pub fn from_content_type(content_type: &str) -> Option<Self> {
        // Parameters like "; charset=binary" are not part of the media type.
        let media_type = content_type
            .split(';')
            .next()
            .unwrap_or(content_type)
            .trim();

        match media_type {
            "application/zip" => Some(Self::Zip),
            "application/x-tar" => Some(Self::Tar),
            "application/gzip" | "application/x-gzip" => Some(Self::TarGz),
            _ => None,
        }
    }
}

/// Extract `archive` into `dest`, which must already exist.
pub fn extract_archive(
    format: ArchiveFormat,
    archive: &Path,
    dest: &Path,
) -> Result<(), ExtractError> {
    match format {
        ArchiveFormat::Zip => extract_zip(archive, dest),
        ArchiveFormat::Tar => extract_tar(archive, dest, false),
        ArchiveFormat::TarGz => extract_tar(archive, dest, true),
    }
}

fn extract_zip(archive: &Path, dest: &Path) -> Result<(), ExtractError> {
    let file = File::open(archive)?;
    let reader = BufReader::with_capacity(1024 * 1024, file);
    let mut archive =
        zip::ZipArchive::new(reader).map_err(|err| ExtractError::Malformed(err.to_string()))?;
    archive
        .extract(dest)
        .map_err(|err| ExtractError::Malformed(err.to_string()))
}

fn extract_tar(archive: &Path, dest: &Path, gzipped: bool) -> Result<(), ExtractError> {
    let file = File::open(archive)?;
    let reader = BufReader::with_capacity(1024 * 1024, file);

    let unpack = |result: io::Result<()>| {
        result.map_err(|err| ExtractError::Malformed(err.to_string()))
    };

    if gzipped {
        let mut archive = tar::Archive::new(GzDecoder::new(reader));
        unpack(archive.unpack(dest))
    } else {
        let mut archive = tar::Archive::new(reader);
        unpack(archive.unpack(dest))
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use rstest::rstest;
    use tempfile::TempDir;

    use super::*;

    #[rstest]
    #[case("application/zip", Some(ArchiveFormat::Zip))]
    #[case("application/zip; charset=binary", Some(ArchiveFormat::Zip))]
    #[case("application/x-tar", Some(ArchiveFormat::Tar))]
    #[case("application/gzip", Some(ArchiveFormat::TarGz))]
    #[case("application/x-gzip", Some(ArchiveFormat::TarGz))]
    #[case("application/octet-stream", None)]
    #[case("text/plain", None)]
    fn content_type_mapping(#[case] content_type: &str, #[case] expected: Option<ArchiveFormat>) {
        assert_eq!(ArchiveFormat::from_content_type(content_type), expected);
    }

    #[test]
    fn malformed_zip_is_rejected() {
        let dir = TempDir::new().unwrap();
        let archive = dir.path().join("broken.zip");
        let mut file = File::create(&archive).unwrap();
        file.write_all(b"this is not a zip archive").unwrap();

        let dest = dir.path().join("out");
        std::fs::create_dir_all(&dest).unwrap();

        let err = extract_archive(ArchiveFormat::Zip, &archive, &dest).unwrap_err();
        assert!(matches!(err, ExtractError::Malformed(_)));
    }

    #[test]
    fn missing_archive_is_io_error() {
        let dir = TempDir::new().unwrap();
        let err = extract_archive(
            ArchiveFormat::Tar,
            &dir.path().join("absent.tar"),
            dir.path(),
        )
        .unwrap_err();
        assert!(matches!(err, ExtractError::Io(_)));
    }
}
