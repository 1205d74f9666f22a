use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(version, about = "Converge a host onto a declared Promtail installation")]
pub struct Args {
    #[command(subcommand)]
    pub sub: Cmd,
}

/// Options shared by every sub-command.
#[derive(clap::Args, Debug, Clone)]
pub struct Common {
    /// Desired-state file (TOML, or YAML with a .yml/.yaml extension)
    #[arg(long, short = 'd', default_value = "/etc/promtail-converge/desired.toml")]
    pub desired: PathBuf,

    /// Override the runtime state file declared in the desired state
    #[arg(long)]
    pub state: Option<PathBuf>,
}

#[derive(Subcommand, Debug)]
pub enum Cmd {
    /// Run one reconciliation pass (Exit 0 = converged, 1 = failed)
    Apply {
        #[command(flatten)]
        common: Common,
    },
    /// Show the actions a pass would take, without applying them
    Plan {
        #[command(flatten)]
        common: Common,

        /// Also print the rendered configuration document
        #[arg(long)]
        show_config: bool,
    },
    /// Print the rendered configuration document
    Render {
        #[command(flatten)]
        common: Common,
    },
    /// Show the observed artifact and service state
    Status {
        #[command(flatten)]
        common: Common,
    },
}
