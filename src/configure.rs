//! Configurer: renders the agent configuration and writes secret files.
//!
//! Each section fragment is copied verbatim under its top-level key. Optional
//! sections that were not declared are left out so the agent applies its own
//! defaults. Mapping keys serialize in sorted order, which makes the rendered
//! bytes a function of the fragments alone.

use serde::Serialize;
use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::desired::{ConfigFragments, DesiredState, SecretFile};
use crate::error::{ConvergeError, Result};
use crate::fs_ops::write_if_changed;

const HEADER: &str = "# Managed by promtail-converge. Local changes will be overwritten.\n";
const CONFIG_MODE: u32 = 0o640;
const SECRET_MODE: u32 = 0o600;

/// The document consumed by the agent, in its schema's key order.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConfigDocument {
    pub clients: Value,
    pub positions: Value,
    pub scrape_configs: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub server: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target_config: Option<Value>,
}

#[derive(Debug, Clone, Copy)]
enum Shape {
    Mapping,
    ListOfMappings,
}

impl ConfigDocument {
    /// Assemble the document, rejecting fragments of the wrong shape.
    pub fn from_fragments(fragments: &ConfigFragments) -> Result<Self> {
        check_shape("clients", &fragments.clients, Shape::ListOfMappings)?;
        check_shape("positions", &fragments.positions, Shape::Mapping)?;
        check_shape("scrape_configs", &fragments.scrape_configs, Shape::ListOfMappings)?;
        if let Some(server) = &fragments.server {
            check_shape("server", server, Shape::Mapping)?;
        }
        if let Some(target) = &fragments.target_config {
            check_shape("target_config", target, Shape::Mapping)?;
        }

        Ok(ConfigDocument {
            clients: fragments.clients.clone(),
            positions: fragments.positions.clone(),
            scrape_configs: fragments.scrape_configs.clone(),
            server: fragments.server.clone(),
            target_config: fragments.target_config.clone(),
        })
    }

    pub fn serialize(&self) -> Result<String> {
        let body = serde_yaml::to_string(self).map_err(|e| {
            ConvergeError::config(format!("failed to serialize config document: {}", e))
        })?;
        Ok(format!("{}{}", HEADER, body))
    }
}

fn check_shape(section: &str, value: &Value, shape: Shape) -> Result<()> {
    let ok = match shape {
        Shape::Mapping => value.is_object(),
        Shape::ListOfMappings => value
            .as_array()
            .is_some_and(|items| items.iter().all(Value::is_object)),
    };
    if ok {
        return Ok(());
    }
    let expected = match shape {
        Shape::Mapping => "a mapping",
        Shape::ListOfMappings => "a list of mappings",
    };
    Err(ConvergeError::config(format!(
        "config section '{}' must be {}, got {}",
        section,
        expected,
        kind(value)
    )))
}

fn kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "a list",
        Value::Object(_) => "a mapping",
    }
}

/// A rendered, validated document ready to be written.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderedConfig {
    pub text: String,
}

/// Render the configuration. Pure; runs before anything touches the disk.
pub fn render(desired: &DesiredState) -> Result<RenderedConfig> {
    let document = ConfigDocument::from_fragments(&desired.fragments)?;
    check_secret_isolation(&document, &desired.secrets)?;
    let text = document.serialize()?;
    Ok(RenderedConfig { text })
}

/// Reject a document carrying a secret's content as a string value. Secrets
/// are referenced by path; substrings of longer values do not count.
fn check_secret_isolation(document: &ConfigDocument, secrets: &[SecretFile]) -> Result<()> {
    let sections = [
        Some(&document.clients),
        Some(&document.positions),
        Some(&document.scrape_configs),
        document.server.as_ref(),
        document.target_config.as_ref(),
    ];
    for secret in secrets {
        let needle = trim_newlines(secret.content.expose());
        if needle.is_empty() {
            continue;
        }
        if sections.iter().flatten().any(|v| holds_scalar(v, needle)) {
            return Err(ConvergeError::config(format!(
                "config contains the content of {} inline; reference the file path instead",
                secret.path.display()
            )));
        }
    }
    Ok(())
}

fn holds_scalar(value: &Value, needle: &str) -> bool {
    match value {
        Value::String(s) => trim_newlines(s) == needle,
        Value::Array(items) => items.iter().any(|v| holds_scalar(v, needle)),
        Value::Object(map) => map.values().any(|v| holds_scalar(v, needle)),
        _ => false,
    }
}

fn trim_newlines(s: &str) -> &str {
    s.trim_end_matches(['\r', '\n'])
}

/// What the configurer changed on disk.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConfigOutcome {
    pub config_written: bool,
    pub secrets_written: usize,
}

impl ConfigOutcome {
    pub fn changed(&self) -> bool {
        self.config_written || self.secrets_written > 0
    }
}

/// Write secret files, then the config file. Unchanged files are not touched.
pub fn apply_config(desired: &DesiredState, rendered: &RenderedConfig) -> Result<ConfigOutcome> {
    let mut outcome = ConfigOutcome::default();

    for secret in &desired.secrets {
        if write_if_changed(&secret.path, secret.content.expose().as_bytes(), SECRET_MODE)? {
            log::info!("Configurer: wrote secret file {}", secret.path.display());
            outcome.secrets_written += 1;
        }
    }

    if write_if_changed(&desired.config_file, rendered.text.as_bytes(), CONFIG_MODE)? {
        log::info!("Configurer: wrote {}", desired.config_file.display());
        outcome.config_written = true;
    } else {
        log::debug!("Configurer: {} already up to date", desired.config_file.display());
    }

    Ok(outcome)
}

/// Fingerprint of everything the running service reads at start-up: the
/// rendered document, the secret files, plus labelled extras such as the unit
/// file or the installed artifact identity.
pub fn fingerprint(
    rendered: &RenderedConfig,
    secrets: &[SecretFile],
    extras: &[(&str, &str)],
) -> String {
    let mut hasher = Sha256::new();
    hasher.update(b"config\0");
    hasher.update(rendered.text.as_bytes());
    for secret in secrets {
        hasher.update(b"\0secret\0");
        hasher.update(secret.path.to_string_lossy().as_bytes());
        hasher.update(b"\0");
        hasher.update(secret.content.expose().as_bytes());
    }
    for (label, value) in extras {
        hasher.update(b"\0");
        hasher.update(label.as_bytes());
        hasher.update(b"\0");
        hasher.update(value.as_bytes());
    }
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn fragments() -> ConfigFragments {
        ConfigFragments {
            clients: json!([{ "url": "http://loki:3100/loki/api/v1/push" }]),
            positions: json!({ "filename": "/var/lib/promtail/positions.yaml" }),
            scrape_configs: json!([{
                "job_name": "system",
                "static_configs": [{
                    "targets": ["localhost"],
                    "labels": { "job": "varlogs", "__path__": "/var/log/*.log" }
                }]
            }]),
            server: None,
            target_config: None,
        }
    }

    #[test]
    fn absent_optional_sections_are_omitted() {
        let text = ConfigDocument::from_fragments(&fragments())
            .unwrap()
            .serialize()
            .unwrap();
        assert!(text.starts_with(HEADER));
        assert!(text.contains("clients:"));
        assert!(text.contains("positions:"));
        assert!(text.contains("scrape_configs:"));
        assert!(!text.contains("server"));
        assert!(!text.contains("target_config"));
    }

    #[test]
    fn output_is_stable_regardless_of_key_insertion_order() {
        let mut a = fragments();
        a.server = Some(json!({
            "http_listen_port": 9080,
            "grpc_listen_port": 0,
            "log_level": "info"
        }));
        let mut b = fragments();
        let mut server = serde_json::Map::new();
        server.insert("log_level".into(), json!("info"));
        server.insert("grpc_listen_port".into(), json!(0));
        server.insert("http_listen_port".into(), json!(9080));
        b.server = Some(Value::Object(server));

        let ta = ConfigDocument::from_fragments(&a).unwrap().serialize().unwrap();
        let tb = ConfigDocument::from_fragments(&b).unwrap().serialize().unwrap();
        assert_eq!(ta, tb);

        // Top-level keys follow the agent's schema order.
        let clients = ta.find("clients:").unwrap();
        let positions = ta.find("positions:").unwrap();
        let scrape = ta.find("scrape_configs:").unwrap();
        let server = ta.find("server:").unwrap();
        assert!(clients < positions && positions < scrape && scrape < server);
    }

    #[test]
    fn malformed_fragments_are_rejected() {
        let mut f = fragments();
        f.positions = json!(["not", "a", "mapping"]);
        let err = ConfigDocument::from_fragments(&f).unwrap_err();
        assert!(matches!(err, ConvergeError::Configuration(ref m) if m.contains("positions")));

        let mut f = fragments();
        f.clients = json!({ "url": "http://loki" });
        assert!(ConfigDocument::from_fragments(&f).is_err());

        let mut f = fragments();
        f.scrape_configs = json!(["job"]);
        assert!(ConfigDocument::from_fragments(&f).is_err());

        let mut f = fragments();
        f.target_config = Some(json!("sync_period: 10s"));
        assert!(ConfigDocument::from_fragments(&f).is_err());
    }

    #[test]
    fn fingerprint_tracks_every_input() {
        let doc = ConfigDocument::from_fragments(&fragments()).unwrap();
        let rendered = RenderedConfig {
            text: doc.serialize().unwrap(),
        };
        let secret = SecretFile {
            path: "/etc/promtail/.password".into(),
            content: crate::desired::SecretMaterial::new("one"),
        };
        let other = SecretFile {
            content: crate::desired::SecretMaterial::new("two"),
            ..secret.clone()
        };

        let base = fingerprint(&rendered, &[secret.clone()], &[]);
        assert_eq!(base, fingerprint(&rendered, &[secret.clone()], &[]));
        assert_ne!(base, fingerprint(&rendered, &[other], &[]));
        assert_ne!(base, fingerprint(&rendered, &[secret], &[("unit", "[Unit]")]));
        assert_ne!(base, fingerprint(&rendered, &[], &[]));
    }

    fn secret(content: &str) -> SecretFile {
        SecretFile {
            path: "/etc/promtail/.password".into(),
            content: crate::desired::SecretMaterial::new(content),
        }
    }

    #[test]
    fn secret_appearing_inside_longer_values_is_allowed() {
        let mut f = fragments();
        f.clients = json!([{
            "url": "http://loki:3100/loki/api/v1/push",
            "basic_auth": { "username": "agent", "password_file": "/etc/promtail/.password" }
        }]);
        f.server = Some(json!({ "http_listen_port": 9080, "log_level": "info" }));
        let doc = ConfigDocument::from_fragments(&f).unwrap();

        // Substrings of the URL, the header and a number's digits.
        for content in ["loki", "promtail", "80", "Managed"] {
            assert!(check_secret_isolation(&doc, &[secret(content)]).is_ok(), "{content}");
        }
    }

    #[test]
    fn inlined_secret_value_is_rejected() {
        let mut f = fragments();
        f.scrape_configs = json!([{
            "job_name": "journal",
            "journal": { "labels": { "token": "s3cret" } }
        }]);
        let doc = ConfigDocument::from_fragments(&f).unwrap();

        let err = check_secret_isolation(&doc, &[secret("s3cret\n")]).unwrap_err();
        assert!(matches!(err, ConvergeError::Configuration(_)));
        assert!(!err.to_string().contains("s3cret"));
        assert!(check_secret_isolation(&doc, &[secret("s3cre")]).is_ok());
    }
}
