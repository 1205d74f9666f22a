//! Atomic file operations.
//!
//! Every file the pass owns (config, secrets, unit, state, symlink) is replaced
//! through a sibling temporary and a rename, so readers only ever see the old
//! or the new content.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};

use crate::error::{ConvergeError, IoContext, Result};

/// Write `content` to `path` atomically with the given unix mode.
///
/// Permissions are applied to the temporary before it is renamed into place.
pub(crate) fn write_file_atomic(path: &Path, content: &[u8], mode: u32) -> Result<()> {
    let parent = parent_dir(path)?;
    fs::create_dir_all(parent).at(parent)?;

    let mut temp = tempfile::Builder::new()
        .prefix(".converge-")
        .tempfile_in(parent)
        .at(parent)?;

    set_mode(temp.path(), mode)?;
    temp.write_all(content).at(temp.path())?;
    temp.as_file().sync_all().at(temp.path())?;

    temp.persist(path)
        .map_err(|e| ConvergeError::io(path, e.error))?;

    Ok(())
}

/// Write only when the on-disk bytes differ (or the file is missing).
///
/// Returns whether a write happened.
pub(crate) fn write_if_changed(path: &Path, content: &[u8], mode: u32) -> Result<bool> {
    match fs::read(path) {
        Ok(existing) if existing == content => {
            ensure_mode(path, mode)?;
            Ok(false)
        }
        Ok(_) => {
            write_file_atomic(path, content, mode)?;
            Ok(true)
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            write_file_atomic(path, content, mode)?;
            Ok(true)
        }
        Err(e) => Err(ConvergeError::io(path, e)),
    }
}

/// Whether `write_if_changed` would rewrite `path`. Read-only.
pub(crate) fn content_differs(path: &Path, content: &[u8]) -> bool {
    fs::read(path).map_or(true, |existing| existing != content)
}

/// Point `link` at `target`, replacing any previous link in a single rename.
#[cfg(unix)]
pub(crate) fn swap_symlink(link: &Path, target: &Path) -> Result<()> {
    let parent = parent_dir(link)?;
    fs::create_dir_all(parent).at(parent)?;

    let file_name = link
        .file_name()
        .ok_or_else(|| ConvergeError::config(format!("invalid link path {}", link.display())))?;
    let staging = parent.join(format!(
        ".{}.converge-{}",
        file_name.to_string_lossy(),
        std::process::id()
    ));

    // Leftover from an interrupted pass.
    if fs::symlink_metadata(&staging).is_ok() {
        fs::remove_file(&staging).at(&staging)?;
    }

    std::os::unix::fs::symlink(target, &staging).at(&staging)?;
    if let Err(e) = fs::rename(&staging, link) {
        let _ = fs::remove_file(&staging);
        return Err(ConvergeError::io(link, e));
    }
    Ok(())
}

#[cfg(not(unix))]
pub(crate) fn swap_symlink(link: &Path, _target: &Path) -> Result<()> {
    Err(ConvergeError::config(format!(
        "symlink management is only supported on unix hosts ({})",
        link.display()
    )))
}

/// Current target of `link`, or `None` when it is missing or not a symlink.
pub(crate) fn read_link(link: &Path) -> Option<PathBuf> {
    fs::read_link(link).ok()
}

/// Lowercase hex SHA-256 of a byte slice.
pub fn sha256_hex(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

/// Lowercase hex SHA-256 of a file, streamed.
pub(crate) fn sha256_file(path: &Path) -> Result<String> {
    let mut file = fs::File::open(path).at(path)?;
    let mut hasher = Sha256::new();
    std::io::copy(&mut file, &mut hasher).at(path)?;
    Ok(hex::encode(hasher.finalize()))
}

/// Set unix permissions on `path`; a no-op elsewhere.
pub(crate) fn set_mode(path: &Path, mode: u32) -> Result<()> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(path, fs::Permissions::from_mode(mode)).at(path)?;
    }
    #[cfg(not(unix))]
    {
        let _ = (path, mode);
    }
    Ok(())
}

/// Fix permissions only when they drifted from `mode`.
fn ensure_mode(path: &Path, mode: u32) -> Result<()> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let current = fs::metadata(path).at(path)?.permissions().mode() & 0o7777;
        if current != mode {
            log::info!("Fixing mode of {} ({:o} -> {:o})", path.display(), current, mode);
            set_mode(path, mode)?;
        }
    }
    #[cfg(not(unix))]
    {
        let _ = (path, mode);
    }
    Ok(())
}

fn parent_dir(path: &Path) -> Result<&Path> {
    path.parent()
        .filter(|p| !p.as_os_str().is_empty())
        .ok_or_else(|| ConvergeError::config(format!("{} has no parent directory", path.display())))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_if_changed_skips_identical_content() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/config.yml");

        assert!(write_if_changed(&path, b"a: 1\n", 0o640).unwrap());
        assert!(!write_if_changed(&path, b"a: 1\n", 0o640).unwrap());
        assert!(write_if_changed(&path, b"a: 2\n", 0o640).unwrap());
        assert_eq!(fs::read(&path).unwrap(), b"a: 2\n");
    }

    #[cfg(unix)]
    #[test]
    fn atomic_write_applies_mode() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("secret");
        write_file_atomic(&path, b"hunter2", 0o600).unwrap();

        let mode = fs::metadata(&path).unwrap().permissions().mode() & 0o777;
        assert_eq!(mode, 0o600);
        // No temporaries left behind.
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 1);
    }

    #[cfg(unix)]
    #[test]
    fn swap_symlink_replaces_existing_link() {
        let dir = tempfile::tempdir().unwrap();
        let a = dir.path().join("a");
        let b = dir.path().join("b");
        fs::write(&a, "a").unwrap();
        fs::write(&b, "b").unwrap();
        let link = dir.path().join("bin/tool");

        swap_symlink(&link, &a).unwrap();
        assert_eq!(read_link(&link).unwrap(), a);
        swap_symlink(&link, &b).unwrap();
        assert_eq!(read_link(&link).unwrap(), b);
        assert_eq!(fs::read_to_string(&link).unwrap(), "b");
    }

    #[test]
    fn sha256_matches_known_digest() {
        assert_eq!(
            sha256_hex(b"abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }
}
