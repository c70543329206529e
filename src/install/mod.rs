//! Installation engines.
//!
//! Two variants put the relay and UI on a cluster. The imperative installer
//! creates and patches objects itself; the Helm installer drives a chart
//! release. Both persist the resolved values after a successful apply and
//! delete them after a removal, so the store only ever describes what is
//! actually installed.

pub mod helm;
pub mod imperative;
pub mod resources;

use std::fmt;

use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;
use serde_json::Value;

use crate::params::Parameters;
use crate::status::InstallationStatus;
use crate::values::ResolvedValues;
use crate::Result;

pub use helm::{HelmCli, HelmEngine, HelmInstaller};
pub use imperative::ImperativeInstaller;

/// Which installation engine to use
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum InstallMode {
    /// Create and patch objects directly
    #[default]
    Imperative,
    /// Drive the `cilium` Helm release
    Helm,
}

impl From<&str> for InstallMode {
    /// `helm` selects the Helm engine; anything else the imperative one
    fn from(mode: &str) -> Self {
        if mode.trim().eq_ignore_ascii_case("helm") {
            Self::Helm
        } else {
            Self::Imperative
        }
    }
}

impl fmt::Display for InstallMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Imperative => write!(f, "classic"),
            Self::Helm => write!(f, "helm"),
        }
    }
}

/// Puts Hubble components on a cluster and takes them off again
#[cfg_attr(test, automock)]
#[async_trait]
pub trait Installer: Send + Sync {
    /// Engine variant
    fn mode(&self) -> InstallMode;

    /// Values merged beneath every other configuration source
    fn defaults(&self) -> Value;

    /// Install or update to match `values`, then persist them.
    ///
    /// Returns the status right after submission; components are usually
    /// still progressing.
    async fn apply(&self, params: &Parameters, values: &ResolvedValues) -> Result<InstallationStatus>;

    /// Remove what `apply` installed, then delete the persisted values.
    /// Removing an absent installation succeeds.
    async fn remove(&self, params: &Parameters, purge: bool) -> Result<()>;
}
