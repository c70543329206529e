//! `hubble ui`

use clap::{ArgAction, Args};
use tokio_util::sync::CancellationToken;
use tracing::info;

use super::{supervise, GlobalArgs};
use crate::params::Parameters;
use crate::tunnel::{SystemBrowser, TunnelManager};
use crate::{Result, DEFAULT_UI_PORT, DEFAULT_VALUES_SECRET_NAME};

/// Open the Hubble UI through a local tunnel
#[derive(Args, Debug, Clone)]
pub struct UiArgs {
    /// Local port to forward to
    #[arg(long = "port-forward", default_value_t = DEFAULT_UI_PORT)]
    pub port: u16,

    /// Open the browser once the tunnel is up
    #[arg(long, default_value_t = true, action = ArgAction::Set, num_args = 0..=1, default_missing_value = "true")]
    pub open_browser: bool,

    /// Secret the installation persisted its values in, used to find its namespace
    #[arg(long, default_value = DEFAULT_VALUES_SECRET_NAME)]
    pub helm_values_secret_name: String,
}

impl UiArgs {
    /// Parameters for a UI tunnel in `namespace`
    pub fn parameters(&self, global: &GlobalArgs, namespace: String) -> Parameters {
        Parameters {
            context: global.context.clone(),
            namespace,
            values_secret_name: self.helm_values_secret_name.clone(),
            ui_port: self.port,
            open_browser: self.open_browser,
            ..Default::default()
        }
    }
}

/// Run `hubble ui` until interrupted
pub async fn run(global: &GlobalArgs, args: UiArgs, cancel: CancellationToken) -> Result<()> {
    let cluster = global.cluster().await?;
    let namespace = global
        .hubble(cluster.clone())
        .target_namespace(global.namespace.as_deref(), &args.helm_values_secret_name)
        .await?;
    let params = args.parameters(global, namespace);

    let session = TunnelManager::new(cluster)
        .start_ui(&params, &SystemBrowser, cancel.clone())
        .await?;
    info!(url = %session.url(), "Hubble UI is available, press Ctrl-C to stop");

    supervise(session, cancel).await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commands::{Cli, Commands};
    use clap::Parser;

    #[test]
    fn browser_can_be_disabled() {
        let cli = Cli::try_parse_from(["hubble", "ui", "--open-browser=false"]).unwrap();
        let Commands::Ui(args) = &cli.command else {
            panic!("expected ui");
        };
        assert!(!args.open_browser);
        assert_eq!(args.port, DEFAULT_UI_PORT);

        let params = args.parameters(&cli.global, "kube-system".into());
        assert!(!params.open_browser);
        assert_eq!(params.ui_port, DEFAULT_UI_PORT);
    }

    #[test]
    fn explicit_namespace_and_port() {
        let cli = Cli::try_parse_from(["hubble", "-n", "cilium", "ui", "--port-forward", "8080"]).unwrap();
        let Commands::Ui(args) = &cli.command else {
            panic!("expected ui");
        };
        let params = args.parameters(&cli.global, "cilium".into());
        assert_eq!(params.ui_port, 8080);
        assert!(params.open_browser);
        assert_eq!(cli.global.namespace.as_deref(), Some("cilium"));
    }
}
