mod cli;

use anyhow::{Context, Result};
use clap::Parser;
use log::error;

use promtail_converge::desired::{DesiredState, InstallMethod};
use promtail_converge::installer::{
    HttpFetcher, NoPackageManager, PackageManager, Platform, SystemPackages,
};
use promtail_converge::service::Systemctl;
use promtail_converge::{Host, PassReport};

fn main() {
    // Initialize logger with custom format
    env_logger::Builder::new()
        .format(|buf, record| {
            use std::io::Write;
            writeln!(
                buf,
                "[{} {} {}:{}] {}",
                buf.timestamp_millis(),
                record.level(),
                record.file().unwrap_or("unknown"),
                record.line().unwrap_or(0),
                record.args()
            )
        })
        .filter_level(log::LevelFilter::Info)
        .parse_default_env()
        .init();

    if let Err(e) = real_main() {
        error!("{e:#}");
        std::process::exit(1);
    }
}

fn real_main() -> Result<()> {
    let args = cli::Args::parse();

    match args.sub {
        cli::Cmd::Apply { common } => {
            let desired = load_desired(&common)?;
            with_host(&desired, |host| {
                let report = promtail_converge::reconcile(&desired, host)
                    .context("reconciliation pass failed")?;
                print_report(&report);
                Ok(())
            })
        }
        cli::Cmd::Plan {
            common,
            show_config,
        } => {
            let desired = load_desired(&common)?;
            with_host(&desired, |host| {
                let plan = promtail_converge::plan(&desired, host).context("planning failed")?;
                for action in &plan.install {
                    println!("install: {}", action);
                }
                for path in &plan.secrets_changed {
                    println!("config:  write secret {}", path.display());
                }
                if plan.config_changed {
                    println!("config:  write {}", desired.config_file.display());
                }
                if plan.unit_changed {
                    println!("service: write unit for {}", desired.service.name);
                }
                for action in &plan.service {
                    println!("service: {} {}", action, desired.service.name);
                }
                if show_config {
                    print!("{}", plan.rendered.text);
                }
                Ok(())
            })
        }
        cli::Cmd::Render { common } => {
            let desired = load_desired(&common)?;
            let rendered = promtail_converge::configure::render(&desired)
                .context("failed to render configuration")?;
            print!("{}", rendered.text);
            Ok(())
        }
        cli::Cmd::Status { common } => {
            let desired = load_desired(&common)?;
            with_host(&desired, |host| {
                let status = promtail_converge::status(&desired, host)?;
                match (&status.artifact, &status.package_version) {
                    (Some(a), _) => println!("artifact: {} ({})", a.version, a.path.display()),
                    (None, Some(v)) => println!("package:  {}", v),
                    (None, None) => println!("artifact: not installed"),
                }
                if let Some(target) = &status.link_target {
                    println!(
                        "link:     {} -> {}",
                        desired.binary_link().display(),
                        target.display()
                    );
                }
                if let Some(service) = status.service {
                    let boot = if service.enabled { "enabled" } else { "disabled" };
                    println!("service:  {} ({}, {})", desired.service.name, service.ensure, boot);
                }
                match (&status.applied_config, status.applied_at) {
                    (Some(fp), Some(at)) => {
                        println!("applied:  {} at {}", &fp[..12.min(fp.len())], at)
                    }
                    _ => println!("applied:  never"),
                }
                Ok(())
            })
        }
    }
}

fn load_desired(common: &cli::Common) -> Result<DesiredState> {
    let mut desired = DesiredState::load(&common.desired).with_context(|| {
        format!("Failed to load desired state from {}", common.desired.display())
    })?;
    if let Some(state) = &common.state {
        desired.state_file = state.clone();
    }
    Ok(desired)
}

/// Build the real host collaborators and hand them to `f`.
fn with_host<T>(desired: &DesiredState, f: impl FnOnce(&Host<'_>) -> Result<T>) -> Result<T> {
    let platform = Platform::detect()?;
    let fetcher = HttpFetcher::new()?;
    let packages: Box<dyn PackageManager> = match desired.install_method() {
        InstallMethod::Package => Box::new(SystemPackages::detect()?),
        InstallMethod::Archive => Box::new(NoPackageManager),
    };
    let services = Systemctl::new();

    let host = Host {
        platform,
        fetcher: &fetcher,
        packages: packages.as_ref(),
        services: &services,
    };
    f(&host)
}

fn print_report(report: &PassReport) {
    if !report.changed() {
        println!("promtail is converged, nothing to do");
        return;
    }
    for action in &report.install {
        println!("installed: {}", action);
    }
    if report.config.secrets_written > 0 {
        println!("configured: {} secret file(s) written", report.config.secrets_written);
    }
    if report.config.config_written {
        println!("configured: config file written");
    }
    if report.unit_written {
        println!("service: unit file written");
    }
    for action in &report.service {
        println!("service: {}", action);
    }
}
