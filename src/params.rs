//! Resolved invocation parameters.
//!
//! [`Parameters`] is built once from the command line and passed by
//! reference into the installers, the readiness waiter and the tunnel
//! manager. Nothing mutates it after construction.

use std::path::PathBuf;
use std::time::Duration;

use crate::{
    DEFAULT_CHART_REPOSITORY, DEFAULT_CHART_VERSION, DEFAULT_NAMESPACE, DEFAULT_RELAY_PORT,
    DEFAULT_UI_PORT, DEFAULT_VALUES_SECRET_NAME, DEFAULT_WAIT_DURATION,
};

/// Where the Helm chart comes from
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ChartSource {
    /// Local chart directory
    Directory(PathBuf),
    /// Named chart in a chart repository
    Repository {
        /// Repository URL
        repo: String,
        /// Chart name
        chart: String,
        /// Chart version
        version: String,
    },
}

impl Default for ChartSource {
    fn default() -> Self {
        Self::Repository {
            repo: DEFAULT_CHART_REPOSITORY.to_string(),
            chart: "cilium".to_string(),
            version: DEFAULT_CHART_VERSION.to_string(),
        }
    }
}

impl ChartSource {
    /// Chart version if known
    pub fn version(&self) -> Option<&str> {
        match self {
            Self::Directory(_) => None,
            Self::Repository { version, .. } => Some(version),
        }
    }
}

/// Layered Helm value inputs, as given on the command line
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct HelmValueInputs {
    /// `--helm-values` files
    pub value_files: Vec<PathBuf>,
    /// `--helm-set` entries
    pub set: Vec<String>,
    /// `--helm-set-string` entries
    pub set_string: Vec<String>,
    /// `--helm-set-file` entries
    pub set_file: Vec<String>,
}

/// Resolved configuration for one enable, disable, or port-forward invocation
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Parameters {
    /// Kubeconfig context
    pub context: Option<String>,
    /// Installation namespace
    pub namespace: String,
    /// Deploy the relay
    pub relay: bool,
    /// Relay image override
    pub relay_image: Option<String>,
    /// Relay image tag
    pub relay_version: Option<String>,
    /// Deploy the UI
    pub ui: bool,
    /// UI frontend image override
    pub ui_image: Option<String>,
    /// UI backend image override
    pub ui_backend_image: Option<String>,
    /// UI image tag (frontend and backend)
    pub ui_version: Option<String>,
    /// Create a CA if none exists
    pub create_ca: bool,
    /// Wait for components to become ready
    pub wait: bool,
    /// Upper bound on the readiness wait
    pub wait_duration: Duration,
    /// Helm chart location
    pub chart: ChartSource,
    /// Layered Helm value inputs
    pub helm_values: HelmValueInputs,
    /// Write the resolved values to this file
    pub helm_gen_values_file: Option<PathBuf>,
    /// Name of the persisted values secret
    pub values_secret_name: String,
    /// Redact certificates and keys in terminal output
    pub redact_cert_keys: bool,
    /// Local port for the relay tunnel
    pub relay_port: u16,
    /// Local port for the UI tunnel
    pub ui_port: u16,
    /// Open a browser once the UI tunnel is up
    pub open_browser: bool,
}

impl Default for Parameters {
    fn default() -> Self {
        Self {
            context: None,
            namespace: DEFAULT_NAMESPACE.to_string(),
            relay: true,
            relay_image: None,
            relay_version: None,
            ui: false,
            ui_image: None,
            ui_backend_image: None,
            ui_version: None,
            create_ca: true,
            wait: true,
            wait_duration: DEFAULT_WAIT_DURATION,
            chart: ChartSource::default(),
            helm_values: HelmValueInputs::default(),
            helm_gen_values_file: None,
            values_secret_name: DEFAULT_VALUES_SECRET_NAME.to_string(),
            redact_cert_keys: true,
            relay_port: DEFAULT_RELAY_PORT,
            ui_port: DEFAULT_UI_PORT,
            open_browser: true,
        }
    }
}
