//! `hubble port-forward`

use clap::Args;
use tokio_util::sync::CancellationToken;
use tracing::info;

use super::{supervise, GlobalArgs};
use crate::params::Parameters;
use crate::tunnel::TunnelManager;
use crate::{Result, DEFAULT_RELAY_PORT, DEFAULT_VALUES_SECRET_NAME};

/// Forward the relay to a local port
#[derive(Args, Debug, Clone)]
pub struct PortForwardArgs {
    /// Local port to forward to
    #[arg(long = "port-forward", default_value_t = DEFAULT_RELAY_PORT)]
    pub port: u16,

    /// Secret the installation persisted its values in, used to find its namespace
    #[arg(long, default_value = DEFAULT_VALUES_SECRET_NAME)]
    pub helm_values_secret_name: String,
}

impl PortForwardArgs {
    /// Parameters for a relay tunnel in `namespace`
    pub fn parameters(&self, global: &GlobalArgs, namespace: String) -> Parameters {
        Parameters {
            context: global.context.clone(),
            namespace,
            values_secret_name: self.helm_values_secret_name.clone(),
            relay_port: self.port,
            ..Default::default()
        }
    }
}

/// Run `hubble port-forward` until interrupted
pub async fn run(global: &GlobalArgs, args: PortForwardArgs, cancel: CancellationToken) -> Result<()> {
    let cluster = global.cluster().await?;
    let namespace = global
        .hubble(cluster.clone())
        .target_namespace(global.namespace.as_deref(), &args.helm_values_secret_name)
        .await?;
    let params = args.parameters(global, namespace);

    let session = TunnelManager::new(cluster)
        .start_relay(&params, cancel.clone())
        .await?;
    info!(
        address = %format!("localhost:{}", session.local_port()),
        namespace = %params.namespace,
        "Hubble Relay is available, press Ctrl-C to stop"
    );

    supervise(session, cancel).await;
    Ok(())
}
