//! Executable extraction from release archives (.zip, .tar.gz).

use std::fs;
use std::io;
use std::path::Path;

use flate2::read::GzDecoder;
use tar::Archive;
use zip::ZipArchive;

use crate::error::{ConvergeError, IoContext, Result};
use crate::fs_ops::set_mode;

/// Extract the entry named `executable` (at any depth) from `archive` into
/// `dest`, marking it executable. Unknown formats and missing entries are
/// verification errors.
pub(crate) fn extract_executable(archive: &Path, executable: &str, dest: &Path) -> Result<()> {
    let name = archive
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or_default();

    if name.ends_with(".zip") {
        extract_from_zip(archive, executable, dest)?;
    } else if name.ends_with(".tar.gz") || name.ends_with(".tgz") {
        extract_from_tar_gz(archive, executable, dest)?;
    } else {
        return Err(ConvergeError::Verification(format!(
            "unsupported archive format: {}",
            name
        )));
    }

    set_mode(dest, 0o755)
}

fn extract_from_zip(archive: &Path, executable: &str, dest: &Path) -> Result<()> {
    let file = fs::File::open(archive).at(archive)?;
    let mut zip = ZipArchive::new(file).map_err(|e| {
        ConvergeError::Verification(format!("malformed zip archive {}: {}", archive.display(), e))
    })?;

    for i in 0..zip.len() {
        let mut entry = zip.by_index(i).map_err(|e| {
            ConvergeError::Verification(format!("failed to read zip entry {}: {}", i, e))
        })?;
        if entry.is_dir() || base_name(entry.name()) != executable {
            continue;
        }
        let mut out = fs::File::create(dest).at(dest)?;
        io::copy(&mut entry, &mut out).map_err(|e| {
            ConvergeError::Verification(format!("failed to extract {}: {}", executable, e))
        })?;
        out.sync_all().at(dest)?;
        return Ok(());
    }

    Err(missing(executable, archive))
}

fn extract_from_tar_gz(archive: &Path, executable: &str, dest: &Path) -> Result<()> {
    let file = fs::File::open(archive).at(archive)?;
    let mut tar = Archive::new(GzDecoder::new(file));
    let malformed = |e: io::Error| {
        ConvergeError::Verification(format!("malformed tar archive {}: {}", archive.display(), e))
    };

    for entry in tar.entries().map_err(malformed)? {
        let mut entry = entry.map_err(malformed)?;
        if !entry.header().entry_type().is_file() {
            continue;
        }
        let path = entry.path().map_err(malformed)?;
        let matches = path
            .file_name()
            .and_then(|n| n.to_str())
            .is_some_and(|n| n == executable);
        if !matches {
            continue;
        }
        let mut out = fs::File::create(dest).at(dest)?;
        io::copy(&mut entry, &mut out).map_err(malformed)?;
        out.sync_all().at(dest)?;
        return Ok(());
    }

    Err(missing(executable, archive))
}

fn base_name(entry: &str) -> &str {
    entry.rsplit('/').next().unwrap_or(entry)
}

fn missing(executable: &str, archive: &Path) -> ConvergeError {
    ConvergeError::Verification(format!(
        "executable {} not found in {}",
        executable,
        archive.display()
    ))
}
