//! `hubble disable`

use clap::Args;
use tracing::info;

use super::enable::ChartArgs;
use super::GlobalArgs;
use crate::params::Parameters;
use crate::Result;

/// Disable Hubble
#[derive(Args, Debug, Clone)]
pub struct DisableArgs {
    /// Also tear down the agent: uninstall the Helm release, or leave the
    /// agent configuration untouched in classic mode
    #[arg(long)]
    pub purge: bool,

    /// Chart and persisted values options
    #[command(flatten)]
    pub chart: ChartArgs,
}

impl DisableArgs {
    /// Parameters for a disable in `namespace`
    pub fn parameters(&self, global: &GlobalArgs, namespace: String) -> Parameters {
        Parameters {
            context: global.context.clone(),
            namespace,
            chart: self.chart.chart(),
            values_secret_name: self.chart.helm_values_secret_name.clone(),
            redact_cert_keys: self.chart.redact_helm_certificate_keys,
            ..Default::default()
        }
    }
}

/// Run `hubble disable`
pub async fn run(global: &GlobalArgs, args: DisableArgs) -> Result<()> {
    let cluster = global.cluster().await?;
    let hubble = global.hubble(cluster);
    let namespace = hubble
        .target_namespace(
            global.namespace.as_deref(),
            &args.chart.helm_values_secret_name,
        )
        .await?;
    let params = args.parameters(global, namespace);

    hubble.disable(&params, args.purge).await?;
    info!(namespace = %params.namespace, "Hubble was successfully disabled");
    Ok(())
}
