//! Declarative provisioning for the Promtail log-shipping agent.
//!
//! A reconciliation pass converges a host toward a [`DesiredState`]:
//!
//! 1. [`installer`] places the binary (release archive) or package,
//! 2. [`configure`] renders the agent configuration and secret files,
//! 3. [`service`] keeps the systemd unit in the desired run/enable state,
//!    restarting it when the applied configuration changed.
//!
//! Each component is a pure planner over desired and observed state plus a
//! thin apply step, driven by [`reconcile::reconcile`].

pub mod configure;
pub mod desired;
pub mod error;
mod fs_ops;
pub mod installer;
pub mod reconcile;
pub mod service;
pub mod state;

pub use desired::DesiredState;
pub use error::{ConvergeError, Result};
pub use fs_ops::sha256_hex;
pub use reconcile::{Host, PassPlan, PassReport, StatusReport, plan, reconcile, status};
