//! Installer: places the agent binary or package on the host.
//!
//! ## Module Organization
//!
//! - `platform` - Platform detection and archive naming
//! - `download` - Fetcher seam and blocking HTTP implementation
//! - `extract` - Executable extraction from .zip / .tar.gz
//! - `package` - Host package manager seam

mod download;
mod extract;
mod package;
mod platform;

pub use download::{Fetcher, HttpFetcher};
pub use package::{NoPackageManager, PackageManager, SystemPackages};
pub use platform::{Arch, Os, Platform};

use std::fs;
use std::path::{Path, PathBuf};

use chrono::Utc;
use url::Url;

use crate::desired::{ArchiveSource, DesiredState, InstallSpec, PackageEnsure};
use crate::error::{ConvergeError, IoContext, Result};
use crate::fs_ops::{self, sha256_file};
use crate::state::InstalledArtifact;

/// What the host currently has, as far as installation is concerned.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ObservedInstall {
    /// Artifact recorded by the last successful archive install.
    pub artifact: Option<InstalledArtifact>,
    /// Where the stable symlink points now.
    pub link_target: Option<PathBuf>,
    /// Whether the recorded artifact's executable still exists.
    pub artifact_present: bool,
    /// Installed package version (package mode only).
    pub package_version: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InstallAction {
    /// Download, verify, extract and place a versioned binary, then repoint.
    Fetch {
        url: Url,
        version: String,
        checksum: String,
        executable: PathBuf,
    },
    /// The versioned binary is intact but the symlink drifted.
    Relink { target: PathBuf },
    InstallPackage { name: String },
    UpgradePackage { name: String },
    RemovePackage { name: String },
}

impl std::fmt::Display for InstallAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            InstallAction::Fetch { url, version, .. } => {
                write!(f, "fetch {} from {}", version, url)
            }
            InstallAction::Relink { target } => write!(f, "relink to {}", target.display()),
            InstallAction::InstallPackage { name } => write!(f, "install package {}", name),
            InstallAction::UpgradePackage { name } => write!(f, "upgrade package {}", name),
            InstallAction::RemovePackage { name } => write!(f, "remove package {}", name),
        }
    }
}

/// Result of applying an install plan.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InstallOutcome {
    /// Newly placed artifact, to be persisted.
    pub artifact: Option<InstalledArtifact>,
    pub changed: bool,
}

/// Asset and directory stem of upstream releases; `binary_name` only names
/// the stable link.
const RELEASE_STEM: &str = "promtail";

/// Names and paths for an archive install of one version.
#[derive(Debug, Clone, PartialEq, Eq)]
struct ArchiveLayout {
    url: Url,
    archive_name: String,
    version_dir: PathBuf,
    executable: PathBuf,
}

fn archive_layout(
    desired: &DesiredState,
    src: &ArchiveSource,
    platform: Platform,
) -> Result<ArchiveLayout> {
    let archive_name = src
        .archive_name
        .clone()
        .unwrap_or_else(|| platform.archive_name(RELEASE_STEM));
    let url = release_url(&src.source_url, &src.version, &archive_name)?;
    let version_dir = src
        .install_root
        .join(format!("{}-{}", RELEASE_STEM, src.version));
    let executable = version_dir.join(platform::executable_name(&archive_name));
    Ok(ArchiveLayout {
        url,
        archive_name,
        version_dir,
        executable,
    })
}

/// `<source_url>/<version>/<archive_name>`, tolerant of a trailing slash.
/// Both parts are pushed as single path segments, so reserved characters are
/// percent-encoded instead of starting a query or fragment.
fn release_url(base: &Url, version: &str, archive_name: &str) -> Result<Url> {
    let mut url = base.clone();
    url.set_query(None);
    url.set_fragment(None);
    url.path_segments_mut()
        .map_err(|()| {
            ConvergeError::config(format!("source_url '{}' cannot carry a path", base))
        })?
        .pop_if_empty()
        .push(version)
        .push(archive_name);
    Ok(url)
}

/// Gather the installation-relevant host state.
pub fn observe(
    desired: &DesiredState,
    recorded: Option<&InstalledArtifact>,
    packages: &dyn PackageManager,
) -> Result<ObservedInstall> {
    match &desired.install {
        InstallSpec::Package { name, .. } => Ok(ObservedInstall {
            package_version: packages.installed_version(name)?,
            ..Default::default()
        }),
        InstallSpec::Archive(_) => Ok(ObservedInstall {
            artifact: recorded.cloned(),
            link_target: fs_ops::read_link(&desired.binary_link()),
            artifact_present: recorded.is_some_and(|a| a.path.is_file()),
            package_version: None,
        }),
    }
}

/// Compute the install actions needed to converge. Pure.
pub fn plan_install(
    desired: &DesiredState,
    observed: &ObservedInstall,
    platform: Platform,
) -> Result<Vec<InstallAction>> {
    match &desired.install {
        InstallSpec::Package {
            name,
            ensure,
            version,
        } => {
            if let (Some(wanted), Some(have)) = (version, &observed.package_version)
                && *ensure != PackageEnsure::Absent
                && !have.contains(wanted.trim_start_matches('v'))
            {
                log::warn!(
                    "Package {} is at {} but binaryversion {} was declared; \
                     package installs do not pin versions",
                    name,
                    have,
                    wanted
                );
            }
            let name = name.clone();
            let action = match (ensure, &observed.package_version) {
                (PackageEnsure::Installed, None) => Some(InstallAction::InstallPackage { name }),
                (PackageEnsure::Installed, Some(_)) => None,
                (PackageEnsure::Latest, None) => Some(InstallAction::InstallPackage { name }),
                (PackageEnsure::Latest, Some(_)) => Some(InstallAction::UpgradePackage { name }),
                (PackageEnsure::Absent, Some(_)) => Some(InstallAction::RemovePackage { name }),
                (PackageEnsure::Absent, None) => None,
            };
            Ok(action.into_iter().collect())
        }
        InstallSpec::Archive(src) => {
            let layout = archive_layout(desired, src, platform)?;

            let current = observed.artifact_present
                && observed.artifact.as_ref().is_some_and(|a| {
                    a.version == src.version
                        && a.checksum == src.checksum
                        && a.path == layout.executable
                });

            if !current {
                return Ok(vec![InstallAction::Fetch {
                    url: layout.url,
                    version: src.version.clone(),
                    checksum: src.checksum.clone(),
                    executable: layout.executable,
                }]);
            }
            if observed.link_target.as_deref() != Some(layout.executable.as_path()) {
                return Ok(vec![InstallAction::Relink {
                    target: layout.executable,
                }]);
            }
            Ok(Vec::new())
        }
    }
}

/// Apply install actions in order. The first failure aborts.
pub fn apply_install(
    desired: &DesiredState,
    actions: &[InstallAction],
    platform: Platform,
    fetcher: &dyn Fetcher,
    packages: &dyn PackageManager,
) -> Result<InstallOutcome> {
    let mut outcome = InstallOutcome::default();

    for action in actions {
        log::info!("Installer: {}", action);
        match action {
            InstallAction::Fetch {
                url,
                version,
                checksum,
                executable,
            } => {
                let InstallSpec::Archive(src) = &desired.install else {
                    return Err(ConvergeError::config("fetch planned for a package install"));
                };
                let layout = archive_layout(desired, src, platform)?;
                fetch_and_place(fetcher, url, checksum, &layout, &src.install_root)?;
                fs_ops::swap_symlink(&desired.binary_link(), executable)?;
                outcome.artifact = Some(InstalledArtifact {
                    path: executable.clone(),
                    version: version.clone(),
                    checksum: checksum.clone(),
                    installed_at: Utc::now(),
                });
            }
            InstallAction::Relink { target } => {
                fs_ops::swap_symlink(&desired.binary_link(), target)?;
            }
            InstallAction::InstallPackage { name } => packages.install(name)?,
            InstallAction::UpgradePackage { name } => packages.upgrade(name)?,
            InstallAction::RemovePackage { name } => packages.remove(name)?,
        }
        outcome.changed = true;
    }

    Ok(outcome)
}

/// Download into a staging directory on the install root's filesystem,
/// verify, extract, then rename the executable into its versioned directory.
/// Nothing outside the staging directory is touched until verification and
/// extraction both succeeded.
fn fetch_and_place(
    fetcher: &dyn Fetcher,
    url: &Url,
    checksum: &str,
    layout: &ArchiveLayout,
    install_root: &Path,
) -> Result<()> {
    fs::create_dir_all(install_root).at(install_root)?;
    let staging = tempfile::Builder::new()
        .prefix(".promtail-converge-")
        .tempdir_in(install_root)
        .at(install_root)?;

    let archive = staging.path().join(&layout.archive_name);
    let bytes = download::download_to(fetcher, url, &archive)?;
    log::debug!("Downloaded {} bytes from {}", bytes, url);

    let actual = sha256_file(&archive)?;
    if !actual.eq_ignore_ascii_case(checksum) {
        return Err(ConvergeError::Verification(format!(
            "checksum mismatch for {}: expected {}, got {}",
            url, checksum, actual
        )));
    }

    let executable_name = layout
        .executable
        .file_name()
        .ok_or_else(|| ConvergeError::config("executable path has no file name"))?;
    let staged = staging.path().join(executable_name);
    extract::extract_executable(&archive, &executable_name.to_string_lossy(), &staged)?;

    fs::create_dir_all(&layout.version_dir).at(&layout.version_dir)?;
    fs::rename(&staged, &layout.executable).at(&layout.executable)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::desired::DesiredStateInput;

    const LINUX_AMD64: Platform = Platform::new(Os::Linux, Arch::Amd64);

    fn archive_desired(root: &Path) -> DesiredState {
        let raw = format!(
            r#"
install_method = "archive"
source_url = "https://releases.example.com/download/"
binaryversion = "v2.9.2"
checksum = "{}"
bin_dir = "{}/bin"
install_root = "{}/opt"

[config]
clients = []
positions = {{}}
scrape_configs = []
"#,
            "a".repeat(64),
            root.display(),
            root.display()
        );
        let input = DesiredStateInput::parse(&raw, Path::new("d.toml")).unwrap();
        DesiredState::try_from_input(input).unwrap()
    }

    #[test]
    fn fresh_host_plans_a_fetch_with_platform_url() {
        let root = Path::new("/srv");
        let desired = archive_desired(root);
        let plan = plan_install(&desired, &ObservedInstall::default(), LINUX_AMD64).unwrap();

        assert_eq!(
            plan,
            vec![InstallAction::Fetch {
                url: Url::parse(
                    "https://releases.example.com/download/v2.9.2/promtail-linux-amd64.zip"
                )
                .unwrap(),
                version: "v2.9.2".into(),
                checksum: "a".repeat(64),
                executable: PathBuf::from("/srv/opt/promtail-v2.9.2/promtail-linux-amd64"),
            }]
        );
    }

    #[test]
    fn matching_artifact_and_link_plans_nothing() {
        let desired = archive_desired(Path::new("/srv"));
        let exe = PathBuf::from("/srv/opt/promtail-v2.9.2/promtail-linux-amd64");
        let observed = ObservedInstall {
            artifact: Some(InstalledArtifact {
                path: exe.clone(),
                version: "v2.9.2".into(),
                checksum: "a".repeat(64),
                installed_at: Utc::now(),
            }),
            link_target: Some(exe.clone()),
            artifact_present: true,
            package_version: None,
        };
        assert!(plan_install(&desired, &observed, LINUX_AMD64).unwrap().is_empty());

        let drifted = ObservedInstall {
            link_target: Some(PathBuf::from("/elsewhere")),
            ..observed.clone()
        };
        assert_eq!(
            plan_install(&desired, &drifted, LINUX_AMD64).unwrap(),
            vec![InstallAction::Relink { target: exe }]
        );

        let missing = ObservedInstall {
            artifact_present: false,
            ..observed
        };
        assert!(matches!(
            plan_install(&desired, &missing, LINUX_AMD64).unwrap()[..],
            [InstallAction::Fetch { .. }]
        ));
    }

    #[test]
    fn changed_version_or_checksum_refetches() {
        let desired = archive_desired(Path::new("/srv"));
        let observed = ObservedInstall {
            artifact: Some(InstalledArtifact {
                path: PathBuf::from("/srv/opt/promtail-v2.9.1/promtail-linux-amd64"),
                version: "v2.9.1".into(),
                checksum: "a".repeat(64),
                installed_at: Utc::now(),
            }),
            link_target: Some(PathBuf::from("/srv/opt/promtail-v2.9.1/promtail-linux-amd64")),
            artifact_present: true,
            package_version: None,
        };
        assert!(matches!(
            plan_install(&desired, &observed, LINUX_AMD64).unwrap()[..],
            [InstallAction::Fetch { ref version, .. }] if version == "v2.9.2"
        ));
    }

    #[test]
    fn package_ensure_matrix() {
        let mut desired = archive_desired(Path::new("/srv"));
        let installed = ObservedInstall {
            package_version: Some("2.9.2".into()),
            ..Default::default()
        };
        let absent = ObservedInstall::default();
        let name = "promtail".to_string();

        let mut plan_for = |ensure, observed: &ObservedInstall| {
            desired.install = InstallSpec::Package {
                name: name.clone(),
                ensure,
                version: None,
            };
            plan_install(&desired, observed, LINUX_AMD64).unwrap()
        };

        assert_eq!(
            plan_for(PackageEnsure::Installed, &absent),
            vec![InstallAction::InstallPackage { name: name.clone() }]
        );
        assert!(plan_for(PackageEnsure::Installed, &installed).is_empty());
        assert_eq!(
            plan_for(PackageEnsure::Latest, &installed),
            vec![InstallAction::UpgradePackage { name: name.clone() }]
        );
        assert_eq!(
            plan_for(PackageEnsure::Absent, &installed),
            vec![InstallAction::RemovePackage { name: name.clone() }]
        );
        assert!(plan_for(PackageEnsure::Absent, &absent).is_empty());
    }

    #[test]
    fn release_asset_ignores_the_link_name() {
        let mut desired = archive_desired(Path::new("/srv"));
        desired.binary_name = "promtail-agent".into();

        let plan = plan_install(&desired, &ObservedInstall::default(), LINUX_AMD64).unwrap();
        let [InstallAction::Fetch { url, executable, .. }] = &plan[..] else {
            panic!("expected a fetch, got {:?}", plan);
        };
        assert!(url.as_str().ends_with("/v2.9.2/promtail-linux-amd64.zip"));
        assert_eq!(
            executable,
            &PathBuf::from("/srv/opt/promtail-v2.9.2/promtail-linux-amd64")
        );
        assert_eq!(desired.binary_link(), PathBuf::from("/srv/bin/promtail-agent"));
    }

    #[test]
    fn version_cannot_inject_query_or_fragment() {
        let base = Url::parse("https://releases.example.com/download/").unwrap();
        let url = release_url(&base, "v2.9.2?x=1#frag", "promtail-linux-amd64.zip").unwrap();

        assert_eq!(url.query(), None);
        assert_eq!(url.fragment(), None);
        assert_eq!(
            url.path(),
            "/download/v2.9.2%3Fx=1%23frag/promtail-linux-amd64.zip"
        );

        let spaced = release_url(&base, "v2.9 beta", "promtail.zip").unwrap();
        assert_eq!(spaced.path(), "/download/v2.9%20beta/promtail.zip");
    }
}
