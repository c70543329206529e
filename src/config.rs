//! Kubernetes client resolution.
//!
//! Resolution chain:
//! 1. `--kubeconfig` path, with the `--context` override if given
//! 2. `--context` alone: the default kubeconfig (`KUBECONFIG` or `~/.kube/config`)
//! 3. neither: kube's inference (kubeconfig, then in-cluster service account)

use std::path::Path;
use std::time::Duration;

use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::{Client, Config};
use tracing::debug;

use crate::{Error, Result};

/// Connect timeout for API requests
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Read timeout for API requests. Port-forward streams are long-lived, so
/// this stays unset for them by kube itself.
pub const READ_TIMEOUT: Duration = Duration::from_secs(30);

fn options(context: Option<&str>) -> KubeConfigOptions {
    KubeConfigOptions {
        context: context.map(str::to_string),
        ..Default::default()
    }
}

/// Resolve the kube client configuration
pub async fn client_config(kubeconfig: Option<&Path>, context: Option<&str>) -> Result<Config> {
    let mut config = match (kubeconfig, context) {
        (Some(path), _) => {
            let kc = Kubeconfig::read_from(path).map_err(|e| {
                Error::config(format!(
                    "failed to read kubeconfig {}: {}",
                    path.display(),
                    e
                ))
            })?;
            Config::from_custom_kubeconfig(kc, &options(context))
                .await
                .map_err(|e| Error::config(format!("failed to load kubeconfig: {}", e)))?
        }
        (None, Some(_)) => Config::from_kubeconfig(&options(context))
            .await
            .map_err(|e| Error::config(format!("failed to load kubeconfig: {}", e)))?,
        (None, None) => Config::infer()
            .await
            .map_err(|e| Error::config(format!("failed to infer kube config: {}", e)))?,
    };
    config.connect_timeout = Some(CONNECT_TIMEOUT);
    config.read_timeout = Some(READ_TIMEOUT);
    debug!(cluster_url = %config.cluster_url, "Resolved kube config");
    Ok(config)
}

/// Build a kube client following the resolution chain
pub async fn create_client(kubeconfig: Option<&Path>, context: Option<&str>) -> Result<Client> {
    let config = client_config(kubeconfig, context).await?;
    Client::try_from(config).map_err(|e| Error::config(format!("failed to create client: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const KUBECONFIG: &str = r#"
apiVersion: v1
kind: Config
clusters:
- name: one
  cluster:
    server: https://one.example.com:6443
- name: two
  cluster:
    server: https://two.example.com:6443
contexts:
- name: one
  context: {cluster: one, user: u}
- name: two
  context: {cluster: two, user: u}
current-context: one
users:
- name: u
  user: {token: abc}
"#;

    fn kubeconfig_file() -> tempfile::NamedTempFile {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        f.write_all(KUBECONFIG.as_bytes()).unwrap();
        f
    }

    #[tokio::test]
    async fn explicit_kubeconfig_uses_current_context() {
        let f = kubeconfig_file();
        let config = client_config(Some(f.path()), None).await.unwrap();
        assert_eq!(config.cluster_url.host(), Some("one.example.com"));
        assert_eq!(config.connect_timeout, Some(CONNECT_TIMEOUT));
    }

    #[tokio::test]
    async fn context_override_selects_cluster() {
        let f = kubeconfig_file();
        let config = client_config(Some(f.path()), Some("two")).await.unwrap();
        assert_eq!(config.cluster_url.host(), Some("two.example.com"));
    }

    #[tokio::test]
    async fn missing_kubeconfig_is_config_error() {
        let err = client_config(Some(Path::new("/no/such/kubeconfig")), None)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }
}
