//! Hubble lifecycle manager
//!
//! Enables and disables Hubble Relay and the Hubble UI on a cluster that
//! already runs the Cilium agent, and opens local tunnels to them.
//!
//! # Modules
//!
//! - [`values`] - Layered configuration merging, `--set` parsing, redaction
//! - [`ca`] - CA lookup, generation and leaf issuance for relay mTLS
//! - [`pki`] - Certificate primitives
//! - [`store`] - Persisted values record kept in a cluster secret
//! - [`install`] - Imperative and Helm installation engines
//! - [`wait`] - Readiness polling
//! - [`tunnel`] - Supervised local port-forwards
//! - [`hubble`] - Enable and disable flows
//! - [`commands`] - Command line interface
//! - [`error`] - Error types

#![deny(missing_docs)]

pub mod ca;
pub mod cluster;
pub mod commands;
pub mod config;
pub mod error;
pub mod hubble;
pub mod install;
pub mod params;
pub mod pki;
pub mod retry;
pub mod status;
pub mod store;
pub mod tunnel;
pub mod values;
pub mod wait;

#[cfg(test)]
mod testing;

use std::time::Duration;

pub use commands::Cli;
pub use error::Error;

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

// =============================================================================
// Default Configuration Constants
// =============================================================================

/// Name of the relay Deployment, Service and ServiceAccount
pub const RELAY_NAME: &str = "hubble-relay";

/// Name of the UI Deployment, Service and ServiceAccount
pub const UI_NAME: &str = "hubble-ui";

/// Service in front of every agent's Hubble server
pub const PEER_SERVICE_NAME: &str = "hubble-peer";

/// Namespace Cilium runs in unless told otherwise
pub const DEFAULT_NAMESPACE: &str = "kube-system";

/// Local port for `port-forward`
pub const DEFAULT_RELAY_PORT: u16 = 4245;

/// Local port for `ui`
pub const DEFAULT_UI_PORT: u16 = 12000;

/// Secret holding the persisted values
pub const DEFAULT_VALUES_SECRET_NAME: &str = "cilium-cli-helm-values";

/// Upper bound on the readiness wait
pub const DEFAULT_WAIT_DURATION: Duration = Duration::from_secs(5 * 60);

/// Helm repository serving the Cilium chart
pub const DEFAULT_CHART_REPOSITORY: &str = "https://helm.cilium.io";

/// Chart version used when none is given
pub const DEFAULT_CHART_VERSION: &str = DEFAULT_CILIUM_VERSION;

/// Cilium release the relay image tag follows
pub const DEFAULT_CILIUM_VERSION: &str = "1.16.6";

/// Hubble UI image tag
pub const DEFAULT_UI_VERSION: &str = "v0.13.1";
