//! Service Manager: converges run state and boot enablement.
//!
//! State machine over {stopped, running} × {enabled, disabled}. What the host
//! reports at the start of the pass is the initial state; a unit the service
//! manager does not know about reads as stopped + disabled.

mod systemctl;
mod unit;

pub use systemctl::Systemctl;
pub(crate) use systemctl::user_scope;
pub(crate) use unit::{render_unit, unit_path, write_unit};

use std::fmt;

use crate::desired::{ServiceEnsure, ServiceSpec};
use crate::error::Result;

/// Observed or desired service state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ServiceState {
    pub ensure: ServiceEnsure,
    /// Start on boot; orthogonal to the current run state.
    pub enabled: bool,
}

impl Default for ServiceState {
    fn default() -> Self {
        ServiceState {
            ensure: ServiceEnsure::Stopped,
            enabled: false,
        }
    }
}

/// Host service manager operations against a named unit.
pub trait ServiceControl {
    fn observe(&self, name: &str) -> Result<ServiceState>;
    fn start(&self, name: &str) -> Result<()>;
    fn stop(&self, name: &str) -> Result<()>;
    fn restart(&self, name: &str) -> Result<()>;
    fn enable(&self, name: &str) -> Result<()>;
    fn disable(&self, name: &str) -> Result<()>;
    fn daemon_reload(&self) -> Result<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceAction {
    DaemonReload,
    Enable,
    Disable,
    Start,
    Stop,
    Restart,
}

impl fmt::Display for ServiceAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let verb = match self {
            ServiceAction::DaemonReload => "daemon-reload",
            ServiceAction::Enable => "enable",
            ServiceAction::Disable => "disable",
            ServiceAction::Start => "start",
            ServiceAction::Stop => "stop",
            ServiceAction::Restart => "restart",
        };
        f.write_str(verb)
    }
}

/// Compute service actions. Pure.
///
/// `config_changed` means the configuration fingerprint differs from the one
/// the service last picked up; `unit_changed` means the unit file was
/// rewritten in this pass.
pub fn plan_service(
    desired: &ServiceSpec,
    observed: ServiceState,
    config_changed: bool,
    unit_changed: bool,
) -> Vec<ServiceAction> {
    let mut actions = Vec::new();

    if unit_changed {
        actions.push(ServiceAction::DaemonReload);
    }

    match (desired.enable, observed.enabled) {
        (true, false) => actions.push(ServiceAction::Enable),
        (false, true) => actions.push(ServiceAction::Disable),
        _ => {}
    }

    match (desired.ensure, observed.ensure) {
        (ServiceEnsure::Running, ServiceEnsure::Stopped) => actions.push(ServiceAction::Start),
        // A fresh start already reads the new configuration.
        (ServiceEnsure::Running, ServiceEnsure::Running) if config_changed => {
            actions.push(ServiceAction::Restart)
        }
        (ServiceEnsure::Stopped, ServiceEnsure::Running) => actions.push(ServiceAction::Stop),
        _ => {}
    }

    actions
}

/// Run actions in order; the first failure aborts and is returned.
pub fn apply_service(
    control: &dyn ServiceControl,
    name: &str,
    actions: &[ServiceAction],
) -> Result<()> {
    for action in actions {
        log::info!("Service: {} {}", action, name);
        match action {
            ServiceAction::DaemonReload => control.daemon_reload()?,
            ServiceAction::Enable => control.enable(name)?,
            ServiceAction::Disable => control.disable(name)?,
            ServiceAction::Start => control.start(name)?,
            ServiceAction::Stop => control.stop(name)?,
            ServiceAction::Restart => control.restart(name)?,
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn spec(ensure: ServiceEnsure, enable: bool) -> ServiceSpec {
        ServiceSpec {
            name: "promtail".into(),
            ensure,
            enable,
            manage: true,
            unit_dir: PathBuf::from("/etc/systemd/system"),
            extra_args: Vec::new(),
        }
    }

    const RUNNING_ENABLED: ServiceState = ServiceState {
        ensure: ServiceEnsure::Running,
        enabled: true,
    };

    #[test]
    fn absent_service_is_started_and_enabled() {
        let actions = plan_service(
            &spec(ServiceEnsure::Running, true),
            ServiceState::default(),
            true,
            true,
        );
        assert_eq!(
            actions,
            vec![
                ServiceAction::DaemonReload,
                ServiceAction::Enable,
                ServiceAction::Start
            ]
        );
    }

    #[test]
    fn converged_service_needs_nothing() {
        let actions = plan_service(
            &spec(ServiceEnsure::Running, true),
            RUNNING_ENABLED,
            false,
            false,
        );
        assert!(actions.is_empty());
    }

    #[test]
    fn config_change_restarts_only_a_running_service() {
        assert_eq!(
            plan_service(&spec(ServiceEnsure::Running, true), RUNNING_ENABLED, true, false),
            vec![ServiceAction::Restart]
        );

        let stopped = ServiceState {
            ensure: ServiceEnsure::Stopped,
            enabled: false,
        };
        let actions = plan_service(&spec(ServiceEnsure::Stopped, false), stopped, true, false);
        assert!(actions.is_empty());
    }

    #[test]
    fn desired_stopped_stops_and_disables() {
        assert_eq!(
            plan_service(&spec(ServiceEnsure::Stopped, false), RUNNING_ENABLED, true, false),
            vec![ServiceAction::Disable, ServiceAction::Stop]
        );
    }
}
