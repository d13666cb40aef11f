//! Trading safeguards: configuration, validation firewall, risk kernel.

mod config;
mod firewall;
mod risk_kernel;

pub use config::{CopierConfig, FirewallConfig, IngestConfig, RiskConfig};
pub use firewall::{Firewall, FirewallStats, ValidationError};
pub use risk_kernel::{RiskDecision, RiskKernel, RiskStatus};

#[cfg(test)]
pub(crate) use firewall::tests as firewall_fixtures;
