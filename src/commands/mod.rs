//! Command line interface

pub mod disable;
pub mod enable;
pub mod port_forward;
pub mod ui;

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Args, Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::cluster::KubeCluster;
use crate::config;
use crate::hubble::Hubble;
use crate::install::{HelmCli, HelmInstaller, ImperativeInstaller, InstallMode, Installer};
use crate::store::ValuesStore;
use crate::tunnel::{TunnelSession, TunnelState};
use crate::wait::ReadinessWaiter;
use crate::Result;

/// Manage Hubble relay and UI on a Cilium cluster
#[derive(Parser, Debug)]
#[command(name = "hubble")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Options shared by every command
    #[command(flatten)]
    pub global: GlobalArgs,

    /// Command to run
    #[command(subcommand)]
    pub command: Commands,
}

/// Subcommands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Enable Hubble observability
    Enable(enable::EnableArgs),
    /// Disable Hubble observability
    Disable(disable::DisableArgs),
    /// Forward the relay port to localhost
    PortForward(port_forward::PortForwardArgs),
    /// Open the Hubble UI
    Ui(ui::UiArgs),
}

/// Cluster selection shared by every command
#[derive(Args, Debug, Clone)]
pub struct GlobalArgs {
    /// Namespace Cilium is running in
    #[arg(short = 'n', long, env = "HUBBLE_NAMESPACE", global = true)]
    pub namespace: Option<String>,

    /// Kubernetes configuration context
    #[arg(long, env = "HUBBLE_CONTEXT", global = true)]
    pub context: Option<String>,

    /// Path to kubeconfig
    #[arg(long, env = "KUBECONFIG", global = true)]
    pub kubeconfig: Option<PathBuf>,

    /// Installation mode: `helm`, or `classic` to manage objects directly
    #[arg(long, env = "CILIUM_CLI_MODE", default_value = "classic", global = true)]
    pub mode: String,
}

impl GlobalArgs {
    /// Selected installation engine
    pub fn install_mode(&self) -> InstallMode {
        InstallMode::from(self.mode.as_str())
    }

    /// Connect to the selected cluster
    pub async fn cluster(&self) -> Result<Arc<KubeCluster>> {
        let client =
            config::create_client(self.kubeconfig.as_deref(), self.context.as_deref()).await?;
        Ok(Arc::new(KubeCluster::new(client)))
    }

    /// Orchestrator wired to `cluster` with the selected engine
    pub fn hubble(&self, cluster: Arc<KubeCluster>) -> Hubble {
        let installer: Arc<dyn Installer> = match self.install_mode() {
            InstallMode::Imperative => {
                Arc::new(ImperativeInstaller::new(cluster.clone(), cluster.clone()))
            }
            InstallMode::Helm => {
                let helm = HelmCli::new(self.kubeconfig.clone(), self.context.clone());
                Arc::new(HelmInstaller::new(Arc::new(helm), cluster.clone()))
            }
        };
        debug!(mode = %installer.mode(), "Selected installer");
        Hubble::new(
            installer,
            ValuesStore::new(cluster.clone()),
            ReadinessWaiter::new(cluster),
        )
    }
}

impl Cli {
    /// Run the selected command until it finishes or Ctrl-C is pressed
    pub async fn run(self) -> Result<()> {
        let cancel = CancellationToken::new();
        let interrupt = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("Interrupted, shutting down");
                interrupt.cancel();
            }
        });

        match self.command {
            Commands::Enable(args) => enable::run(&self.global, args, cancel).await,
            Commands::Disable(args) => disable::run(&self.global, args).await,
            Commands::PortForward(args) => port_forward::run(&self.global, args, cancel).await,
            Commands::Ui(args) => ui::run(&self.global, args, cancel).await,
        }
    }
}

/// Log every state transition of `session` until `cancel` fires, then stop it
pub(crate) async fn supervise(session: TunnelSession, cancel: CancellationToken) {
    let mut states = session.watch();
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            changed = states.changed() => {
                if changed.is_err() {
                    break;
                }
                let state = states.borrow_and_update().clone();
                match &state {
                    TunnelState::Connected => info!(url = %session.url(), "Tunnel connected"),
                    TunnelState::Disconnected(reason) => {
                        info!(reason = %reason, "Tunnel disconnected, reconnecting")
                    }
                    TunnelState::Connecting => debug!("Tunnel connecting"),
                    TunnelState::Closed => break,
                }
            }
        }
    }
    session.stop().await;
    info!("Tunnel closed");
}
