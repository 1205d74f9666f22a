//! Desired state parsing and validation.
//!
//! This module contains two logical entities:
//!  * `DesiredStateInput`: the raw declared input, as read from disk.
//!  * `DesiredState`: validated, strongly typed and immutable for the whole pass.

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use serde_json::Value;
use url::Url;

use crate::error::{ConvergeError, IoContext, Result};

const DEFAULT_SOURCE_URL: &str = "https://github.com/grafana/loki/releases/download";
const DEFAULT_BIN_DIR: &str = "/usr/local/bin";
const DEFAULT_INSTALL_ROOT: &str = "/opt";
const DEFAULT_BINARY_NAME: &str = "promtail";
const DEFAULT_CONFIG_FILE: &str = "/etc/promtail/config.yml";
const DEFAULT_SERVICE_NAME: &str = "promtail";
const DEFAULT_UNIT_DIR: &str = "/etc/systemd/system";
const DEFAULT_STATE_FILE: &str = "/var/lib/promtail-converge/state.json";

/// Raw desired state as declared by the configuration-management layer.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DesiredStateInput {
    pub install_method: Option<String>,
    pub source_url: Option<String>,
    pub binaryversion: Option<String>,
    pub checksum: Option<String>,
    pub checksum_type: Option<String>,
    pub archive_name: Option<String>,
    pub bin_dir: Option<PathBuf>,
    pub install_root: Option<PathBuf>,
    pub binary_name: Option<String>,
    pub package_name: Option<String>,
    pub package_ensure: Option<String>,
    pub state_file: Option<PathBuf>,
    #[serde(default)]
    pub config: ConfigInput,
    #[serde(default)]
    pub secrets: SecretsInput,
    #[serde(default)]
    pub service: ServiceInput,
}

/// `[config]` table: the rendered file location and one fragment per section.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ConfigInput {
    pub file: Option<PathBuf>,
    pub clients: Option<Value>,
    pub positions: Option<Value>,
    pub scrape_configs: Option<Value>,
    pub server: Option<Value>,
    pub target_config: Option<Value>,
}

/// `[secrets]` table. Path and content come in pairs.
#[derive(Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SecretsInput {
    pub password_file_path: Option<PathBuf>,
    pub password_file_content: Option<String>,
    pub password_app_file_path: Option<PathBuf>,
    pub password_app_file_content: Option<String>,
}

impl fmt::Debug for SecretsInput {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SecretsInput")
            .field("password_file_path", &self.password_file_path)
            .field("password_app_file_path", &self.password_app_file_path)
            .finish_non_exhaustive()
    }
}

/// `[service]` table.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ServiceInput {
    pub name: Option<String>,
    pub ensure: Option<String>,
    pub enable: Option<bool>,
    pub manage: Option<bool>,
    pub unit_dir: Option<PathBuf>,
    #[serde(default)]
    pub extra_args: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstallMethod {
    Package,
    Archive,
}

impl InstallMethod {
    fn parse(s: &str) -> Result<Self> {
        match s {
            "package" => Ok(InstallMethod::Package),
            "archive" => Ok(InstallMethod::Archive),
            other => Err(ConvergeError::config(format!(
                "unknown install_method '{}' (expected package|archive)",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PackageEnsure {
    Installed,
    Latest,
    Absent,
}

impl PackageEnsure {
    fn parse(s: &str) -> Result<Self> {
        match s {
            "installed" | "present" => Ok(PackageEnsure::Installed),
            "latest" => Ok(PackageEnsure::Latest),
            "absent" => Ok(PackageEnsure::Absent),
            other => Err(ConvergeError::config(format!(
                "unknown package_ensure '{}' (expected installed|latest|absent)",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceEnsure {
    Running,
    Stopped,
}

impl ServiceEnsure {
    fn parse(s: &str) -> Result<Self> {
        match s {
            "running" => Ok(ServiceEnsure::Running),
            "stopped" => Ok(ServiceEnsure::Stopped),
            other => Err(ConvergeError::config(format!(
                "unknown service ensure '{}' (expected running|stopped)",
                other
            ))),
        }
    }
}

impl fmt::Display for ServiceEnsure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ServiceEnsure::Running => f.write_str("running"),
            ServiceEnsure::Stopped => f.write_str("stopped"),
        }
    }
}

/// Where the release archive comes from and what it must hash to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveSource {
    pub source_url: Url,
    pub version: String,
    /// Lowercase hex SHA-256 of the archive.
    pub checksum: String,
    pub archive_name: Option<String>,
    pub install_root: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InstallSpec {
    Package {
        name: String,
        ensure: PackageEnsure,
        /// Informational only; see `installer::package`.
        version: Option<String>,
    },
    Archive(ArchiveSource),
}

/// Content destined for a restricted file. Never printed.
#[derive(Clone, PartialEq, Eq)]
pub struct SecretMaterial(String);

impl SecretMaterial {
    pub fn new(content: impl Into<String>) -> Self {
        SecretMaterial(content.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for SecretMaterial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SecretMaterial(<redacted>)")
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SecretFile {
    pub path: PathBuf,
    pub content: SecretMaterial,
}

/// Declared configuration fragments, one per top-level section.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConfigFragments {
    pub clients: Value,
    pub positions: Value,
    pub scrape_configs: Value,
    pub server: Option<Value>,
    pub target_config: Option<Value>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceSpec {
    pub name: String,
    pub ensure: ServiceEnsure,
    pub enable: bool,
    pub manage: bool,
    pub unit_dir: PathBuf,
    pub extra_args: Vec<String>,
}

/// Validated desired state. Built once per pass and never mutated.
#[derive(Debug, Clone, PartialEq)]
pub struct DesiredState {
    pub install: InstallSpec,
    pub bin_dir: PathBuf,
    pub binary_name: String,
    pub config_file: PathBuf,
    pub fragments: ConfigFragments,
    pub secrets: Vec<SecretFile>,
    pub service: ServiceSpec,
    pub state_file: PathBuf,
}

impl DesiredState {
    /// Read and validate a desired-state file (TOML, or YAML by extension).
    pub fn load(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path).at(path)?;
        let input = DesiredStateInput::parse(&raw, path)?;
        Self::try_from_input(input)
    }

    /// Validate inputs and return the desired state.
    pub fn try_from_input(cfg: DesiredStateInput) -> Result<Self> {
        let method = InstallMethod::parse(cfg.install_method.as_deref().unwrap_or("archive"))?;

        let install = match method {
            InstallMethod::Package => {
                let ensure =
                    PackageEnsure::parse(cfg.package_ensure.as_deref().unwrap_or("installed"))?;
                InstallSpec::Package {
                    name: non_empty(cfg.package_name, "package_name")?
                        .unwrap_or_else(|| DEFAULT_BINARY_NAME.to_string()),
                    ensure,
                    version: cfg.binaryversion,
                }
            }
            InstallMethod::Archive => {
                let raw_url = cfg.source_url.as_deref().unwrap_or(DEFAULT_SOURCE_URL);
                let source_url = Url::parse(raw_url).map_err(|e| {
                    ConvergeError::config(format!("invalid source_url '{}': {}", raw_url, e))
                })?;
                let version = non_empty(cfg.binaryversion, "binaryversion")?.ok_or_else(|| {
                    ConvergeError::config("binaryversion is required for archive installs")
                })?;
                if version.contains('/') {
                    return Err(ConvergeError::config(format!(
                        "binaryversion '{}' must not contain '/'",
                        version
                    )));
                }
                let checksum_type = cfg.checksum_type.as_deref().unwrap_or("sha256");
                if checksum_type != "sha256" {
                    return Err(ConvergeError::config(format!(
                        "unsupported checksum_type '{}' (only sha256)",
                        checksum_type
                    )));
                }
                let checksum = cfg.checksum.ok_or_else(|| {
                    ConvergeError::config("checksum is required for archive installs")
                })?;
                let checksum = checksum.trim().to_ascii_lowercase();
                if checksum.len() != 64 || !checksum.bytes().all(|b| b.is_ascii_hexdigit()) {
                    return Err(ConvergeError::config(
                        "checksum must be a 64 character hex SHA-256 digest",
                    ));
                }
                InstallSpec::Archive(ArchiveSource {
                    source_url,
                    version,
                    checksum,
                    archive_name: non_empty(cfg.archive_name, "archive_name")?,
                    install_root: absolute(cfg.install_root, DEFAULT_INSTALL_ROOT, "install_root")?,
                })
            }
        };

        let fragments = ConfigFragments {
            clients: required_section(cfg.config.clients, "clients")?,
            positions: required_section(cfg.config.positions, "positions")?,
            scrape_configs: required_section(cfg.config.scrape_configs, "scrape_configs")?,
            server: cfg.config.server,
            target_config: cfg.config.target_config,
        };

        let mut secrets = Vec::new();
        push_secret(
            &mut secrets,
            cfg.secrets.password_file_path,
            cfg.secrets.password_file_content,
            "password_file",
        )?;
        push_secret(
            &mut secrets,
            cfg.secrets.password_app_file_path,
            cfg.secrets.password_app_file_content,
            "password_app_file",
        )?;

        let service = ServiceSpec {
            name: non_empty(cfg.service.name, "service.name")?
                .unwrap_or_else(|| DEFAULT_SERVICE_NAME.to_string()),
            ensure: ServiceEnsure::parse(cfg.service.ensure.as_deref().unwrap_or("running"))?,
            enable: cfg.service.enable.unwrap_or(true),
            manage: cfg.service.manage.unwrap_or(true),
            unit_dir: match cfg.service.unit_dir {
                Some(dir) => absolute(Some(dir), DEFAULT_UNIT_DIR, "service.unit_dir")?,
                None => default_unit_dir()?,
            },
            extra_args: cfg.service.extra_args,
        };

        let binary_name = non_empty(cfg.binary_name, "binary_name")?
            .unwrap_or_else(|| DEFAULT_BINARY_NAME.to_string());
        if binary_name.contains('/') {
            return Err(ConvergeError::config("binary_name must be a bare file name"));
        }

        Ok(DesiredState {
            install,
            bin_dir: absolute(cfg.bin_dir, DEFAULT_BIN_DIR, "bin_dir")?,
            binary_name,
            config_file: absolute(cfg.config.file, DEFAULT_CONFIG_FILE, "config.file")?,
            fragments,
            secrets,
            service,
            state_file: absolute(cfg.state_file, DEFAULT_STATE_FILE, "state_file")?,
        })
    }

    pub fn install_method(&self) -> InstallMethod {
        match self.install {
            InstallSpec::Package { .. } => InstallMethod::Package,
            InstallSpec::Archive(_) => InstallMethod::Archive,
        }
    }

    /// Whether the service component runs this pass. A removed package takes
    /// its unit with it, so there is nothing left to start or stop.
    pub fn manages_service(&self) -> bool {
        let removed = matches!(
            self.install,
            InstallSpec::Package {
                ensure: PackageEnsure::Absent,
                ..
            }
        );
        self.service.manage && !removed
    }

    /// Stable path the service unit executes, independent of version.
    pub fn binary_link(&self) -> PathBuf {
        self.bin_dir.join(&self.binary_name)
    }
}

impl DesiredStateInput {
    /// Parse raw text, picking YAML for `.yml`/`.yaml` and TOML otherwise.
    pub fn parse(raw: &str, path: &Path) -> Result<Self> {
        let is_yaml = matches!(
            path.extension().and_then(|e| e.to_str()),
            Some("yml") | Some("yaml")
        );
        if is_yaml {
            serde_yaml::from_str(raw).map_err(|e| {
                ConvergeError::config(format!("failed to parse {}: {}", path.display(), e))
            })
        } else {
            toml::from_str(raw).map_err(|e| {
                ConvergeError::config(format!("failed to parse {}: {}", path.display(), e))
            })
        }
    }
}

fn required_section(value: Option<Value>, name: &str) -> Result<Value> {
    match value {
        Some(Value::Null) | None => Err(ConvergeError::config(format!(
            "required config section '{}' is missing",
            name
        ))),
        Some(v) => Ok(v),
    }
}

fn push_secret(
    out: &mut Vec<SecretFile>,
    path: Option<PathBuf>,
    content: Option<String>,
    what: &str,
) -> Result<()> {
    match (path, content) {
        (None, None) => Ok(()),
        (Some(path), Some(content)) => {
            if !path.is_absolute() {
                return Err(ConvergeError::config(format!(
                    "{}_path must be absolute, got {}",
                    what,
                    path.display()
                )));
            }
            if content.is_empty() {
                return Err(ConvergeError::config(format!("{}_content is empty", what)));
            }
            out.push(SecretFile {
                path,
                content: SecretMaterial::new(content),
            });
            Ok(())
        }
        (Some(_), None) => Err(ConvergeError::config(format!(
            "{}_path is set but {}_content is missing",
            what, what
        ))),
        (None, Some(_)) => Err(ConvergeError::config(format!(
            "{}_content is set but {}_path is missing",
            what, what
        ))),
    }
}

fn absolute(value: Option<PathBuf>, default: &str, name: &str) -> Result<PathBuf> {
    let path = value.unwrap_or_else(|| PathBuf::from(default));
    if path.is_absolute() {
        Ok(path)
    } else {
        Err(ConvergeError::config(format!(
            "{} must be an absolute path, got {}",
            name,
            path.display()
        )))
    }
}

/// System unit directory for root, the user manager's otherwise; matches the
/// scope `Systemctl` talks to.
fn default_unit_dir() -> Result<PathBuf> {
    if !crate::service::user_scope() {
        return Ok(PathBuf::from(DEFAULT_UNIT_DIR));
    }
    let home = std::env::var_os("HOME").ok_or_else(|| {
        ConvergeError::config("HOME is not set; declare service.unit_dir explicitly")
    })?;
    Ok(PathBuf::from(home).join(".config/systemd/user"))
}

fn non_empty(value: Option<String>, name: &str) -> Result<Option<String>> {
    match value {
        Some(s) if s.trim().is_empty() => {
            Err(ConvergeError::config(format!("{} must not be empty", name)))
        }
        other => Ok(other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ARCHIVE_TOML: &str = r#"
install_method = "archive"
binaryversion = "v2.9.2"
checksum = "ABCDEF0123456789abcdef0123456789abcdef0123456789abcdef0123456789"

[[config.clients]]
url = "https://logs.example.com/loki/api/v1/push"

[config.positions]
filename = "/var/lib/promtail/positions.yaml"

[[config.scrape_configs]]
job_name = "system"

[secrets]
password_file_path = "/etc/promtail/.password"
password_file_content = "s3cret"

[service]
ensure = "stopped"
enable = false
"#;

    fn parse(raw: &str) -> Result<DesiredState> {
        let input = DesiredStateInput::parse(raw, Path::new("desired.toml"))?;
        DesiredState::try_from_input(input)
    }

    #[test]
    fn archive_input_is_validated_with_defaults() {
        let desired = parse(ARCHIVE_TOML).unwrap();

        assert_eq!(desired.install_method(), InstallMethod::Archive);
        let InstallSpec::Archive(src) = &desired.install else {
            panic!("expected archive install");
        };
        assert_eq!(src.version, "v2.9.2");
        assert_eq!(src.source_url.as_str(), DEFAULT_SOURCE_URL);
        // Checksums are normalised to lowercase.
        assert!(src.checksum.starts_with("abcdef"));
        assert_eq!(desired.binary_link(), PathBuf::from("/usr/local/bin/promtail"));
        assert_eq!(desired.config_file, PathBuf::from(DEFAULT_CONFIG_FILE));
        assert_eq!(desired.service.ensure, ServiceEnsure::Stopped);
        assert!(!desired.service.enable);
        assert_eq!(desired.secrets.len(), 1);
        assert!(desired.fragments.server.is_none());
    }

    #[test]
    fn default_unit_dir_follows_the_service_manager_scope() {
        let desired = parse(ARCHIVE_TOML).unwrap();
        let expected = if crate::service::user_scope() {
            PathBuf::from(std::env::var_os("HOME").unwrap()).join(".config/systemd/user")
        } else {
            PathBuf::from(DEFAULT_UNIT_DIR)
        };
        assert_eq!(desired.service.unit_dir, expected);

        let raw = ARCHIVE_TOML.replace("[service]\n", "[service]\nunit_dir = \"/run/systemd\"\n");
        assert_eq!(parse(&raw).unwrap().service.unit_dir, PathBuf::from("/run/systemd"));
    }

    #[test]
    fn secret_content_is_redacted_in_debug_output() {
        let desired = parse(ARCHIVE_TOML).unwrap();
        let rendered = format!("{:?}", desired);
        assert!(!rendered.contains("s3cret"));
        assert!(rendered.contains("<redacted>"));
    }

    #[test]
    fn yaml_input_is_accepted() {
        let raw = r#"
install_method: package
package_ensure: latest
config:
  clients:
    - url: http://loki:3100/loki/api/v1/push
  positions:
    filename: /tmp/positions.yaml
  scrape_configs: []
"#;
        let input = DesiredStateInput::parse(raw, Path::new("desired.yaml")).unwrap();
        let desired = DesiredState::try_from_input(input).unwrap();
        assert_eq!(
            desired.install,
            InstallSpec::Package {
                name: "promtail".to_string(),
                ensure: PackageEnsure::Latest,
                version: None,
            }
        );
    }

    #[test]
    fn missing_required_section_is_rejected() {
        let raw = ARCHIVE_TOML.replace(
            "[config.positions]\nfilename = \"/var/lib/promtail/positions.yaml\"\n",
            "",
        );
        let err = parse(&raw).unwrap_err();
        assert!(matches!(err, ConvergeError::Configuration(ref m) if m.contains("positions")));
    }

    #[test]
    fn unpaired_secret_is_rejected() {
        let raw = ARCHIVE_TOML.replace("password_file_content = \"s3cret\"\n", "");
        assert!(matches!(parse(&raw), Err(ConvergeError::Configuration(_))));
    }

    #[test]
    fn bad_enums_and_checksums_are_rejected() {
        let raw = ARCHIVE_TOML.replace("\"archive\"", "\"tarball\"");
        assert!(matches!(parse(&raw), Err(ConvergeError::Configuration(_))));

        let raw = ARCHIVE_TOML.replace("ensure = \"stopped\"", "ensure = \"paused\"");
        assert!(matches!(parse(&raw), Err(ConvergeError::Configuration(_))));

        let raw = ARCHIVE_TOML.replace("ABCDEF0123456789", "not-hex");
        assert!(matches!(parse(&raw), Err(ConvergeError::Configuration(_))));
    }

    #[test]
    fn relative_paths_are_rejected() {
        let raw = format!("bin_dir = \"bin\"\n{}", ARCHIVE_TOML);
        assert!(matches!(
            parse(&raw),
            Err(ConvergeError::Configuration(ref m)) if m.contains("bin_dir")
        ));
    }
}
