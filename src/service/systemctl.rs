//! Service control via systemd (systemctl).

use std::process::Command;

use crate::desired::ServiceEnsure;
use crate::error::{ConvergeError, Result};

use super::{ServiceControl, ServiceState};

/// `systemctl`, scoped to the user manager when not running as root.
#[derive(Debug, Clone, Copy)]
pub struct Systemctl {
    user: bool,
}

impl Systemctl {
    pub fn new() -> Self {
        Systemctl {
            user: user_scope(),
        }
    }

    fn command(&self, verb: &str, unit: Option<&str>) -> Command {
        let mut cmd = Command::new("systemctl");
        if self.user {
            cmd.arg("--user");
        }
        cmd.arg(verb);
        if let Some(unit) = unit {
            cmd.arg(format!("{}.service", unit));
        }
        cmd
    }

    /// Exit status only; used for the `is-*` queries.
    fn query(&self, verb: &str, name: &str) -> Result<bool> {
        let output = self.command(verb, Some(name)).output().map_err(|e| {
            ConvergeError::Service(format!("Failed to execute systemctl {}: {}", verb, e))
        })?;
        Ok(output.status.success())
    }

    fn run(&self, verb: &str, name: Option<&str>) -> Result<()> {
        let output = self.command(verb, name).output().map_err(|e| {
            ConvergeError::Service(format!("Failed to execute systemctl {}: {}", verb, e))
        })?;

        if !output.status.success() {
            return Err(ConvergeError::Service(format!(
                "systemctl {} {} failed: {}",
                verb,
                name.unwrap_or_default(),
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(())
    }
}

impl Default for Systemctl {
    fn default() -> Self {
        Self::new()
    }
}

impl ServiceControl for Systemctl {
    fn observe(&self, name: &str) -> Result<ServiceState> {
        // is-active: exit 0 if active, 3 if inactive; unknown units also fail.
        let running = self.query("is-active", name)?;
        let enabled = self.query("is-enabled", name)?;
        Ok(ServiceState {
            ensure: if running {
                ServiceEnsure::Running
            } else {
                ServiceEnsure::Stopped
            },
            enabled,
        })
    }

    fn start(&self, name: &str) -> Result<()> {
        self.run("start", Some(name))
    }

    fn stop(&self, name: &str) -> Result<()> {
        self.run("stop", Some(name))
    }

    fn restart(&self, name: &str) -> Result<()> {
        self.run("restart", Some(name))
    }

    fn enable(&self, name: &str) -> Result<()> {
        self.run("enable", Some(name))
    }

    fn disable(&self, name: &str) -> Result<()> {
        self.run("disable", Some(name))
    }

    fn daemon_reload(&self) -> Result<()> {
        self.run("daemon-reload", None)
    }
}

/// Non-root processes talk to the per-user service manager.
#[inline]
pub(crate) fn user_scope() -> bool {
    !nix::unistd::getuid().is_root()
}
