//! Systemd unit file generation for archive installs.
//!
//! Package installs ship their own unit; archive installs get one that
//! executes the stable symlink, so a version bump never touches the unit.

use std::path::PathBuf;

use crate::desired::DesiredState;
use crate::error::Result;
use crate::fs_ops::write_if_changed;

use super::user_scope;

const UNIT_MODE: u32 = 0o644;

pub(crate) fn unit_path(desired: &DesiredState) -> PathBuf {
    desired
        .service
        .unit_dir
        .join(format!("{}.service", desired.service.name))
}

/// Generate the unit file content.
pub(crate) fn render_unit(desired: &DesiredState) -> String {
    let mut content = String::with_capacity(1024);

    // [Unit] section
    content.push_str("[Unit]\n");
    content.push_str("Description=Promtail log shipping agent\n");
    content.push_str("Documentation=https://grafana.com/docs/loki/latest/send-data/promtail/\n");
    content.push_str("Wants=network-online.target\n");
    content.push_str("After=network-online.target\n");
    content.push('\n');

    // [Service] section
    content.push_str("[Service]\n");
    content.push_str("Type=simple\n");

    let mut exec_start = format!(
        "ExecStart={} -config.file={}",
        desired.binary_link().display(),
        desired.config_file.display()
    );
    for arg in &desired.service.extra_args {
        exec_start.push(' ');
        exec_start.push_str(arg);
    }
    content.push_str(&exec_start);
    content.push('\n');

    content.push_str("Restart=on-failure\n");
    content.push_str("RestartSec=5s\n");
    content.push_str("TimeoutStopSec=20s\n");

    // Security and sandboxing
    content.push_str("NoNewPrivileges=true\n");
    content.push_str("ProtectSystem=full\n");
    content.push_str("ProtectKernelTunables=true\n");
    content.push_str("ProtectControlGroups=true\n");
    content.push_str("RestrictSUIDSGID=true\n");

    // Logging
    content.push_str("StandardOutput=journal\n");
    content.push_str("StandardError=journal\n");
    content.push_str(&format!("SyslogIdentifier={}\n", desired.service.name));
    content.push('\n');

    // [Install] section
    content.push_str("[Install]\n");
    // The user manager has no multi-user.target.
    let wanted_by = if user_scope() {
        "default.target"
    } else {
        "multi-user.target"
    };
    content.push_str(&format!("WantedBy={}\n", wanted_by));

    content
}

/// Write the unit when its content changed. Returns whether it was written.
pub(crate) fn write_unit(desired: &DesiredState, content: &str) -> Result<bool> {
    let path = unit_path(desired);
    let written = write_if_changed(&path, content.as_bytes(), UNIT_MODE)?;
    if written {
        log::info!("Service: wrote unit file {}", path.display());
    }
    Ok(written)
}
