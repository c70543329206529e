//! `hubble enable`

use std::path::PathBuf;
use std::time::Duration;

use clap::{ArgAction, Args};
use tokio_util::sync::CancellationToken;
use tracing::info;

use super::GlobalArgs;
use crate::params::{ChartSource, HelmValueInputs, Parameters};
use crate::{
    Result, DEFAULT_CHART_REPOSITORY, DEFAULT_CHART_VERSION, DEFAULT_VALUES_SECRET_NAME,
};

/// Chart and values options shared by enable and disable
#[derive(Args, Debug, Clone)]
pub struct ChartArgs {
    /// Helm chart directory
    #[arg(long)]
    pub chart_directory: Option<PathBuf>,

    /// Chart version to use from the repository
    #[arg(long, default_value = DEFAULT_CHART_VERSION)]
    pub chart_version: String,

    /// Secret name to store the auto-generated helm values in. The namespace
    /// is the one Cilium is installed in.
    #[arg(long, default_value = DEFAULT_VALUES_SECRET_NAME)]
    pub helm_values_secret_name: String,

    /// Do not print certificate keys in the terminal. The stored values are
    /// always unredacted.
    #[arg(
        long,
        default_value_t = true,
        action = ArgAction::Set,
        num_args = 0..=1,
        default_missing_value = "true"
    )]
    pub redact_helm_certificate_keys: bool,
}

impl ChartArgs {
    /// Chart location
    pub fn chart(&self) -> ChartSource {
        match &self.chart_directory {
            Some(dir) => ChartSource::Directory(dir.clone()),
            None => ChartSource::Repository {
                repo: DEFAULT_CHART_REPOSITORY.to_string(),
                chart: "cilium".to_string(),
                version: self.chart_version.clone(),
            },
        }
    }
}

/// Enable Hubble
#[derive(Args, Debug, Clone)]
pub struct EnableArgs {
    /// Deploy Hubble Relay
    #[arg(long, default_value_t = true, action = ArgAction::Set, num_args = 0..=1, default_missing_value = "true")]
    pub relay: bool,

    /// Image path to use for Relay
    #[arg(long)]
    pub relay_image: Option<String>,

    /// Version of Relay to deploy
    #[arg(long)]
    pub relay_version: Option<String>,

    /// Enable Hubble UI
    #[arg(long, default_value_t = false, action = ArgAction::Set, num_args = 0..=1, default_missing_value = "true")]
    pub ui: bool,

    /// Image path to use for the UI frontend
    #[arg(long)]
    pub ui_image: Option<String>,

    /// Image path to use for the UI backend
    #[arg(long)]
    pub ui_backend_image: Option<String>,

    /// Version of the UI to deploy
    #[arg(long)]
    pub ui_version: Option<String>,

    /// Automatically create a CA if none exists
    #[arg(long, default_value_t = true, action = ArgAction::Set, num_args = 0..=1, default_missing_value = "true")]
    pub create_ca: bool,

    /// Wait for Hubble to become ready
    #[arg(long, default_value_t = true, action = ArgAction::Set, num_args = 0..=1, default_missing_value = "true")]
    pub wait: bool,

    /// Maximum time to wait for readiness
    #[arg(long, default_value = "5m", value_parser = humantime::parse_duration)]
    pub wait_duration: Duration,

    /// Helm values from a YAML file (repeatable)
    #[arg(long = "helm-values")]
    pub helm_values: Vec<PathBuf>,

    /// Set helm values on the command line (repeatable, or comma separated)
    #[arg(long = "helm-set")]
    pub helm_set: Vec<String>,

    /// Set helm string values on the command line
    #[arg(long = "helm-set-string")]
    pub helm_set_string: Vec<String>,

    /// Set helm values from files given on the command line (key=path)
    #[arg(long = "helm-set-file")]
    pub helm_set_file: Vec<String>,

    /// Write the auto-generated helm values into this file
    #[arg(long = "helm-auto-gen-values")]
    pub helm_auto_gen_values: Option<PathBuf>,

    /// Chart and persisted values options
    #[command(flatten)]
    pub chart: ChartArgs,
}

impl EnableArgs {
    /// Parameters for an enable in `namespace`
    pub fn parameters(&self, global: &GlobalArgs, namespace: String) -> Parameters {
        Parameters {
            context: global.context.clone(),
            namespace,
            relay: self.relay,
            relay_image: self.relay_image.clone(),
            relay_version: self.relay_version.clone(),
            ui: self.ui,
            ui_image: self.ui_image.clone(),
            ui_backend_image: self.ui_backend_image.clone(),
            ui_version: self.ui_version.clone(),
            create_ca: self.create_ca,
            wait: self.wait,
            wait_duration: self.wait_duration,
            chart: self.chart.chart(),
            helm_values: HelmValueInputs {
                value_files: self.helm_values.clone(),
                set: self.helm_set.clone(),
                set_string: self.helm_set_string.clone(),
                set_file: self.helm_set_file.clone(),
            },
            helm_gen_values_file: self.helm_auto_gen_values.clone(),
            values_secret_name: self.chart.helm_values_secret_name.clone(),
            redact_cert_keys: self.chart.redact_helm_certificate_keys,
            ..Default::default()
        }
    }
}

/// Run `hubble enable`
pub async fn run(global: &GlobalArgs, args: EnableArgs, cancel: CancellationToken) -> Result<()> {
    let cluster = global.cluster().await?;
    let hubble = global.hubble(cluster);
    let namespace = hubble
        .target_namespace(
            global.namespace.as_deref(),
            &args.chart.helm_values_secret_name,
        )
        .await?;
    let params = args.parameters(global, namespace);

    let status = hubble.enable(&params, &cancel).await?;
    if params.wait {
        info!(status = %status, "Hubble is ready");
    } else {
        info!(status = %status, "Hubble enable submitted");
    }
    Ok(())
}
