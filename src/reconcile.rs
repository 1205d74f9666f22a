//! One reconciliation pass: Installer → Configurer → Service Manager.
//!
//! Each step requires the previous one to have succeeded; the first error
//! aborts the pass. Runtime state is persisted as steps complete, and the
//! applied configuration fingerprint only once every service action succeeded,
//! so a failed start or restart is retried by the next pass.

use std::path::PathBuf;

use chrono::{DateTime, Utc};

use crate::configure::{self, ConfigOutcome, RenderedConfig};
use crate::desired::{DesiredState, InstallSpec};
use crate::error::Result;
use crate::fs_ops::content_differs;
use crate::installer::{self, Fetcher, InstallAction, PackageManager, Platform};
use crate::service::{self, ServiceAction, ServiceControl, ServiceState};
use crate::state::{InstalledArtifact, RuntimeState};

/// The external collaborators a pass drives.
pub struct Host<'a> {
    pub platform: Platform,
    pub fetcher: &'a dyn Fetcher,
    pub packages: &'a dyn PackageManager,
    pub services: &'a dyn ServiceControl,
}

/// What a pass did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PassReport {
    pub install: Vec<InstallAction>,
    pub config: ConfigOutcome,
    pub unit_written: bool,
    pub service: Vec<ServiceAction>,
    pub fingerprint: String,
}

impl PassReport {
    pub fn changed(&self) -> bool {
        !self.install.is_empty()
            || self.config.changed()
            || self.unit_written
            || !self.service.is_empty()
    }
}

/// What a pass would do, computed without writing anything.
#[derive(Debug, Clone, PartialEq)]
pub struct PassPlan {
    pub install: Vec<InstallAction>,
    pub config_changed: bool,
    pub secrets_changed: Vec<PathBuf>,
    pub unit_changed: bool,
    pub service: Vec<ServiceAction>,
    pub rendered: RenderedConfig,
}

/// Observed host state, for reporting.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusReport {
    pub artifact: Option<InstalledArtifact>,
    pub link_target: Option<PathBuf>,
    pub package_version: Option<String>,
    pub service: Option<ServiceState>,
    pub applied_config: Option<String>,
    pub applied_at: Option<DateTime<Utc>>,
}

/// Run one reconciliation pass.
pub fn reconcile(desired: &DesiredState, host: &Host<'_>) -> Result<PassReport> {
    let mut state = RuntimeState::load(&desired.state_file)?;
    let initial = state.clone();

    // Fragments are validated here, before the first write of the pass.
    let rendered = configure::render(desired)?;
    let unit = managed_unit(desired);

    // Installer
    let observed = installer::observe(desired, state.artifact.as_ref(), host.packages)?;
    log::debug!("Observed install state: {:?}", observed);
    let install = installer::plan_install(desired, &observed, host.platform)?;
    let outcome =
        installer::apply_install(desired, &install, host.platform, host.fetcher, host.packages)?;
    if let Some(artifact) = outcome.artifact {
        state.artifact = Some(artifact);
        state.save(&desired.state_file)?;
    }
    // `latest` asks the package manager every pass; only a version change counts.
    let (package_version, binary_changed) = match &desired.install {
        InstallSpec::Package { name, .. } if outcome.changed => {
            let now = host.packages.installed_version(name)?;
            let changed = now != observed.package_version;
            (now, changed)
        }
        InstallSpec::Package { .. } => (observed.package_version.clone(), false),
        InstallSpec::Archive(_) => (None, outcome.changed),
    };

    // Configurer
    let config = configure::apply_config(desired, &rendered)?;

    // Service Manager
    let fingerprint = fingerprint_for(
        desired,
        &rendered,
        unit.as_deref(),
        package_version.as_deref(),
    );
    let mut report = PassReport {
        install,
        config,
        fingerprint: fingerprint.clone(),
        ..Default::default()
    };

    if desired.manages_service() {
        let unit_written = match &unit {
            Some(content) => service::write_unit(desired, content)?,
            None => false,
        };
        let observed = host.services.observe(&desired.service.name)?;
        log::debug!("Observed service state: {:?}", observed);

        let config_changed = state.applied_config.as_deref() != Some(fingerprint.as_str());
        // Reload whenever the unit could be newer than what systemd loaded.
        let reload = unit_written || (unit.is_some() && config_changed);
        let restart = config_changed || binary_changed;
        let actions = service::plan_service(&desired.service, observed, restart, reload);
        service::apply_service(host.services, &desired.service.name, &actions)?;

        report.unit_written = unit_written;
        report.service = actions;
    } else if desired.service.manage {
        log::info!(
            "Package is declared absent; not managing service {}",
            desired.service.name
        );
    } else {
        log::debug!("Service management disabled for {}", desired.service.name);
    }

    if state.applied_config.as_deref() != Some(fingerprint.as_str()) {
        state.applied_config = Some(fingerprint);
        state.applied_at = Some(Utc::now());
    }
    if state != initial {
        state.save(&desired.state_file)?;
    }

    if report.changed() {
        log::info!("Reconciliation pass converged with changes");
    } else {
        log::info!("Reconciliation pass found the host already converged");
    }
    Ok(report)
}

/// Compute what `reconcile` would do, without side effects on the host.
pub fn plan(desired: &DesiredState, host: &Host<'_>) -> Result<PassPlan> {
    let state = RuntimeState::load(&desired.state_file)?;
    let rendered = configure::render(desired)?;
    let unit = managed_unit(desired);

    let observed = installer::observe(desired, state.artifact.as_ref(), host.packages)?;
    let install = installer::plan_install(desired, &observed, host.platform)?;

    let config_changed = content_differs(&desired.config_file, rendered.text.as_bytes());
    let secrets_changed = desired
        .secrets
        .iter()
        .filter(|s| content_differs(&s.path, s.content.expose().as_bytes()))
        .map(|s| s.path.clone())
        .collect();
    let unit_changed = unit
        .as_deref()
        .is_some_and(|u| content_differs(&service::unit_path(desired), u.as_bytes()));

    let service = if desired.manages_service() {
        let fingerprint = fingerprint_for(
            desired,
            &rendered,
            unit.as_deref(),
            observed.package_version.as_deref(),
        );
        let fingerprint_changed = state.applied_config.as_deref() != Some(fingerprint.as_str());
        let observed = host.services.observe(&desired.service.name)?;
        let reload = unit_changed || (unit.is_some() && fingerprint_changed);
        // A fresh binary also needs the running process replaced.
        let binary_changed = install
            .iter()
            .any(|a| !matches!(a, InstallAction::UpgradePackage { .. }));
        let restart = fingerprint_changed || binary_changed;
        service::plan_service(&desired.service, observed, restart, reload)
    } else {
        Vec::new()
    };

    Ok(PassPlan {
        install,
        config_changed,
        secrets_changed,
        unit_changed,
        service,
        rendered,
    })
}

/// Report observed state without planning anything.
pub fn status(desired: &DesiredState, host: &Host<'_>) -> Result<StatusReport> {
    let state = RuntimeState::load(&desired.state_file)?;
    let observed = installer::observe(desired, state.artifact.as_ref(), host.packages)?;
    let service = if desired.manages_service() {
        Some(host.services.observe(&desired.service.name)?)
    } else {
        None
    };
    Ok(StatusReport {
        artifact: observed.artifact,
        link_target: observed.link_target,
        package_version: observed.package_version,
        service,
        applied_config: state.applied_config,
        applied_at: state.applied_at,
    })
}

/// Unit content, for archive installs whose service is managed here.
fn managed_unit(desired: &DesiredState) -> Option<String> {
    match desired.install {
        InstallSpec::Archive(_) if desired.manages_service() => {
            Some(service::render_unit(desired))
        }
        _ => None,
    }
}

fn fingerprint_for(
    desired: &DesiredState,
    rendered: &RenderedConfig,
    unit: Option<&str>,
    package_version: Option<&str>,
) -> String {
    let artifact = match &desired.install {
        InstallSpec::Archive(src) => Some(format!("{}:{}", src.version, src.checksum)),
        InstallSpec::Package { .. } => package_version.map(str::to_string),
    };
    let mut extras: Vec<(&str, &str)> = Vec::new();
    if let Some(unit) = unit {
        extras.push(("unit", unit));
    }
    if let Some(artifact) = artifact.as_deref() {
        extras.push(("artifact", artifact));
    }
    configure::fingerprint(rendered, &desired.secrets, &extras)
}
