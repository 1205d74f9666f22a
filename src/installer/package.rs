//! Host package manager integration.
//!
//! Only the narrow surface the installer needs: query, install, upgrade,
//! remove. Signature and checksum checks stay with the package manager.

use std::process::Command;

use crate::error::{ConvergeError, Result};

/// Package manager operations used by package-mode installs.
pub trait PackageManager {
    /// Installed version of `name`, or `None` when not installed.
    fn installed_version(&self, name: &str) -> Result<Option<String>>;
    fn install(&self, name: &str) -> Result<()>;
    /// Bring `name` to the newest available version.
    fn upgrade(&self, name: &str) -> Result<()>;
    fn remove(&self, name: &str) -> Result<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Family {
    Deb,
    Rpm,
}

/// apt/dpkg or dnf/rpm, picked from what is on `PATH`.
#[derive(Debug, Clone)]
pub struct SystemPackages {
    family: Family,
    frontend: &'static str,
}

impl SystemPackages {
    pub fn detect() -> Result<Self> {
        if which::which("apt-get").is_ok() && which::which("dpkg-query").is_ok() {
            return Ok(SystemPackages {
                family: Family::Deb,
                frontend: "apt-get",
            });
        }
        for frontend in ["dnf", "yum"] {
            if which::which(frontend).is_ok() && which::which("rpm").is_ok() {
                return Ok(SystemPackages {
                    family: Family::Rpm,
                    frontend,
                });
            }
        }
        Err(ConvergeError::Package(
            "no supported package manager found (apt-get or dnf/yum)".into(),
        ))
    }

    fn run(&self, args: &[&str]) -> Result<()> {
        log::debug!("Running {} {}", self.frontend, args.join(" "));
        let mut cmd = Command::new(self.frontend);
        cmd.args(args);
        if self.family == Family::Deb {
            cmd.env("DEBIAN_FRONTEND", "noninteractive");
        }
        let output = cmd.output().map_err(|e| {
            ConvergeError::Package(format!("failed to execute {}: {}", self.frontend, e))
        })?;
        if !output.status.success() {
            return Err(ConvergeError::Package(format!(
                "{} {} failed: {}",
                self.frontend,
                args.join(" "),
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(())
    }
}

impl PackageManager for SystemPackages {
    fn installed_version(&self, name: &str) -> Result<Option<String>> {
        let output = match self.family {
            Family::Deb => Command::new("dpkg-query")
                .args(["-W", "-f", "${Status}\t${Version}", name])
                .output(),
            Family::Rpm => Command::new("rpm")
                .args(["-q", "--qf", "%{VERSION}", name])
                .output(),
        }
        .map_err(|e| ConvergeError::Package(format!("failed to query {}: {}", name, e)))?;

        // Both tools exit non-zero for unknown packages.
        if !output.status.success() {
            return Ok(None);
        }
        let stdout = String::from_utf8_lossy(&output.stdout);
        Ok(match self.family {
            Family::Deb => parse_dpkg_status(&stdout),
            Family::Rpm => Some(stdout.trim().to_string()).filter(|v| !v.is_empty()),
        })
    }

    fn install(&self, name: &str) -> Result<()> {
        self.run(&["install", "-y", name])
    }

    fn upgrade(&self, name: &str) -> Result<()> {
        match self.family {
            // apt-get install moves an installed package to the candidate version.
            Family::Deb => self.run(&["install", "-y", name]),
            Family::Rpm => self.run(&["upgrade", "-y", name]),
        }
    }

    fn remove(&self, name: &str) -> Result<()> {
        self.run(&["remove", "-y", name])
    }
}

/// Stand-in for archive installs on hosts without a supported package manager.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoPackageManager;

impl NoPackageManager {
    fn unavailable() -> ConvergeError {
        ConvergeError::Package("no package manager available on this host".into())
    }
}

impl PackageManager for NoPackageManager {
    fn installed_version(&self, _name: &str) -> Result<Option<String>> {
        Err(Self::unavailable())
    }

    fn install(&self, _name: &str) -> Result<()> {
        Err(Self::unavailable())
    }

    fn upgrade(&self, _name: &str) -> Result<()> {
        Err(Self::unavailable())
    }

    fn remove(&self, _name: &str) -> Result<()> {
        Err(Self::unavailable())
    }
}

/// `install ok installed\t2.9.2` → `Some("2.9.2")`; any other status → `None`.
fn parse_dpkg_status(line: &str) -> Option<String> {
    let (status, version) = line.trim().split_once('\t')?;
    if status.ends_with(" installed") && !version.is_empty() {
        Some(version.to_string())
    } else {
        None
    }
}
