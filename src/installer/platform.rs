//! Host platform detection for release archive naming.

use std::fmt;

use once_cell::sync::OnceCell;

use crate::error::{ConvergeError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Os {
    Linux,
    Darwin,
    Windows,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Arch {
    Amd64,
    Arm64,
    Arm,
    I386,
}

/// Operating system and architecture, in release-asset vocabulary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Platform {
    pub os: Os,
    pub arch: Arch,
}

/// Global cache for platform detection (initialized once, used everywhere)
static PLATFORM_CACHE: OnceCell<Platform> = OnceCell::new();

impl Platform {
    pub const fn new(os: Os, arch: Arch) -> Self {
        Platform { os, arch }
    }

    /// Detect current platform (cached after first call)
    pub fn detect() -> Result<Self> {
        PLATFORM_CACHE
            .get_or_try_init(|| Self::from_consts(std::env::consts::OS, std::env::consts::ARCH))
            .copied()
    }

    fn from_consts(os: &str, arch: &str) -> Result<Self> {
        let os = match os {
            "linux" => Os::Linux,
            "macos" => Os::Darwin,
            "windows" => Os::Windows,
            other => {
                return Err(ConvergeError::config(format!(
                    "unsupported operating system: {}",
                    other
                )));
            }
        };
        let arch = match arch {
            "x86_64" => Arch::Amd64,
            "aarch64" => Arch::Arm64,
            "arm" => Arch::Arm,
            "x86" => Arch::I386,
            other => {
                return Err(ConvergeError::config(format!(
                    "unsupported architecture: {}",
                    other
                )));
            }
        };
        Ok(Platform { os, arch })
    }

    /// Default release archive name, e.g. `promtail-linux-amd64.zip`.
    pub fn archive_name(&self, stem: &str) -> String {
        match self.os {
            Os::Windows => format!("{}-{}.exe.zip", stem, self),
            _ => format!("{}-{}.zip", stem, self),
        }
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let os = match self.os {
            Os::Linux => "linux",
            Os::Darwin => "darwin",
            Os::Windows => "windows",
        };
        let arch = match self.arch {
            Arch::Amd64 => "amd64",
            Arch::Arm64 => "arm64",
            Arch::Arm => "arm",
            Arch::I386 => "386",
        };
        write!(f, "{}-{}", os, arch)
    }
}

/// Executable shipped inside an archive: the archive name minus its
/// compression suffix (`promtail-linux-amd64.zip` → `promtail-linux-amd64`).
pub fn executable_name(archive_name: &str) -> &str {
    for suffix in [".tar.gz", ".tgz", ".zip"] {
        if let Some(stem) = archive_name.strip_suffix(suffix) {
            return stem;
        }
    }
    archive_name
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn maps_rust_consts_to_release_names() {
        let p = Platform::from_consts("linux", "x86_64").unwrap();
        assert_eq!(p.archive_name("promtail"), "promtail-linux-amd64.zip");

        let p = Platform::from_consts("macos", "aarch64").unwrap();
        assert_eq!(p.archive_name("promtail"), "promtail-darwin-arm64.zip");

        let p = Platform::from_consts("windows", "x86_64").unwrap();
        assert_eq!(p.archive_name("promtail"), "promtail-windows-amd64.exe.zip");

        assert!(Platform::from_consts("plan9", "x86_64").is_err());
        assert!(Platform::from_consts("linux", "riscv64").is_err());
    }

    #[test]
    fn executable_name_strips_archive_suffix() {
        assert_eq!(executable_name("promtail-linux-amd64.zip"), "promtail-linux-amd64");
        assert_eq!(executable_name("promtail-windows-amd64.exe.zip"), "promtail-windows-amd64.exe");
        assert_eq!(executable_name("promtail-linux-arm64.tar.gz"), "promtail-linux-arm64");
        assert_eq!(executable_name("promtail"), "promtail");
    }
}
