//! Helm installer: drives the agent's `cilium` release.
//!
//! Hubble is part of the agent chart, so enabling it is an upgrade of the
//! existing release with `--reuse-values` and the Hubble keys layered on
//! top. The CA is obtained here as well and folded into `tls.ca` so the
//! chart signs the relay and server certificates with it.

use std::io::Write;
use std::path::PathBuf;
use std::process::Output;
use std::sync::Arc;

use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;
use serde_json::{json, Value};
use tokio::process::Command;
use tracing::{debug, info};

use super::{InstallMode, Installer};
use crate::ca::CaManager;
use crate::cluster::SecretClient;
use crate::params::{ChartSource, Parameters};
use crate::status::InstallationStatus;
use crate::store::{PersistedValuesRecord, ValuesStore};
use crate::values::{deep_merge, ResolvedValues};
use crate::{Error, Result};

/// Name of the agent release
pub const RELEASE_NAME: &str = "cilium";

/// One render or upgrade of the release
#[derive(Clone, Debug, PartialEq)]
pub struct HelmRequest {
    /// Release name
    pub release: String,
    /// Release namespace
    pub namespace: String,
    /// Chart to render
    pub chart: ChartSource,
    /// Values passed with `-f`
    pub values: Value,
    /// Keep the release's current values underneath `values`
    pub reuse_values: bool,
}

/// Chart rendering and release management
#[cfg_attr(test, automock)]
#[async_trait]
pub trait HelmEngine: Send + Sync {
    /// User-supplied values of a deployed release; `None` when there is no such release
    async fn release_values(&self, release: &str, namespace: &str) -> Result<Option<Value>>;

    /// Render the chart without touching the cluster
    async fn template(&self, request: &HelmRequest) -> Result<String>;

    /// Upgrade the release
    async fn upgrade(&self, request: &HelmRequest) -> Result<()>;

    /// Uninstall the release; returns whether it existed
    async fn uninstall(&self, release: &str, namespace: &str) -> Result<bool>;
}

fn is_release_not_found(stderr: &str) -> bool {
    let stderr = stderr.to_ascii_lowercase();
    stderr.contains("release: not found") || stderr.contains("release not loaded")
}

fn chart_args(chart: &ChartSource) -> Vec<String> {
    match chart {
        ChartSource::Directory(path) => vec![path.display().to_string()],
        ChartSource::Repository {
            repo,
            chart,
            version,
        } => vec![
            chart.clone(),
            "--repo".to_string(),
            repo.clone(),
            "--version".to_string(),
            version.clone(),
        ],
    }
}

/// The `helm` binary
#[derive(Clone, Debug)]
pub struct HelmCli {
    binary: PathBuf,
    kubeconfig: Option<PathBuf>,
    context: Option<String>,
}

impl HelmCli {
    /// `helm` from `PATH`, targeting the given kubeconfig and context
    pub fn new(kubeconfig: Option<PathBuf>, context: Option<String>) -> Self {
        Self {
            binary: PathBuf::from("helm"),
            kubeconfig,
            context,
        }
    }

    /// Use a specific helm binary
    pub fn with_binary(mut self, binary: impl Into<PathBuf>) -> Self {
        self.binary = binary.into();
        self
    }

    fn global_args(&self) -> Vec<String> {
        let mut args = Vec::new();
        if let Some(kubeconfig) = &self.kubeconfig {
            args.push("--kubeconfig".to_string());
            args.push(kubeconfig.display().to_string());
        }
        if let Some(context) = &self.context {
            args.push("--kube-context".to_string());
            args.push(context.clone());
        }
        args
    }

    fn render_args(&self, verb: &str, request: &HelmRequest, values_file: &str) -> Vec<String> {
        let mut args = vec![verb.to_string(), request.release.clone()];
        args.extend(chart_args(&request.chart));
        args.extend([
            "--namespace".to_string(),
            request.namespace.clone(),
            "--values".to_string(),
            values_file.to_string(),
        ]);
        if request.reuse_values && verb == "upgrade" {
            args.push("--reuse-values".to_string());
        }
        args.extend(self.global_args());
        args
    }

    async fn run(&self, args: &[String]) -> Result<Output> {
        let mut cmd = Command::new(&self.binary);
        cmd.args(args);
        debug!(binary = %self.binary.display(), args = ?args, "Executing helm");
        cmd.output().await.map_err(|e| {
            Error::install(format!(
                "failed to execute {}: {}",
                self.binary.display(),
                e
            ))
        })
    }

    fn failed(args: &[String], output: &Output) -> Error {
        Error::install(format!(
            "helm {} failed: {}",
            args.first().map(String::as_str).unwrap_or_default(),
            String::from_utf8_lossy(&output.stderr).trim()
        ))
    }

    /// Values go through a private temporary file so key material never
    /// appears on a command line.
    fn values_file(values: &Value) -> Result<tempfile::NamedTempFile> {
        let yaml = serde_yaml::to_string(values)
            .map_err(|e| Error::install(format!("unable to serialize values: {}", e)))?;
        let mut file = tempfile::Builder::new()
            .prefix("hubble-values-")
            .suffix(".yaml")
            .tempfile()?;
        file.write_all(yaml.as_bytes())?;
        file.flush()?;
        Ok(file)
    }

    async fn run_with_values(&self, verb: &str, request: &HelmRequest) -> Result<String> {
        let file = Self::values_file(&request.values)?;
        let args = self.render_args(verb, request, &file.path().display().to_string());
        let output = self.run(&args).await?;
        if !output.status.success() {
            return Err(Self::failed(&args, &output));
        }
        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }
}

#[async_trait]
impl HelmEngine for HelmCli {
    async fn release_values(&self, release: &str, namespace: &str) -> Result<Option<Value>> {
        let mut args = vec![
            "get".to_string(),
            "values".to_string(),
            release.to_string(),
            "--namespace".to_string(),
            namespace.to_string(),
            "--output".to_string(),
            "json".to_string(),
        ];
        args.extend(self.global_args());

        let output = self.run(&args).await?;
        if !output.status.success() {
            if is_release_not_found(&String::from_utf8_lossy(&output.stderr)) {
                return Ok(None);
            }
            return Err(Self::failed(&args, &output));
        }

        let values: Value = serde_json::from_slice(&output.stdout)
            .map_err(|e| Error::install(format!("unable to parse release values: {}", e)))?;
        Ok(Some(if values.is_null() { json!({}) } else { values }))
    }

    async fn template(&self, request: &HelmRequest) -> Result<String> {
        self.run_with_values("template", request).await
    }

    async fn upgrade(&self, request: &HelmRequest) -> Result<()> {
        self.run_with_values("upgrade", request).await?;
        info!(release = %request.release, namespace = %request.namespace, "Helm release upgraded");
        Ok(())
    }

    async fn uninstall(&self, release: &str, namespace: &str) -> Result<bool> {
        let mut args = vec![
            "uninstall".to_string(),
            release.to_string(),
            "--namespace".to_string(),
            namespace.to_string(),
            "--wait".to_string(),
        ];
        args.extend(self.global_args());

        let output = self.run(&args).await?;
        if output.status.success() {
            return Ok(true);
        }
        if is_release_not_found(&String::from_utf8_lossy(&output.stderr)) {
            return Ok(false);
        }
        Err(Self::failed(&args, &output))
    }
}

/// Installs Hubble by upgrading the agent's Helm release
pub struct HelmInstaller {
    engine: Arc<dyn HelmEngine>,
    ca: CaManager,
    store: ValuesStore,
}

impl HelmInstaller {
    /// Installer driving `engine`; secrets back the CA lookup and the values store
    pub fn new(engine: Arc<dyn HelmEngine>, secrets: Arc<dyn SecretClient>) -> Self {
        Self {
            engine,
            ca: CaManager::without_secret_persistence(secrets.clone()),
            store: ValuesStore::new(secrets),
        }
    }

    /// Use a specific values store
    pub fn with_store(mut self, store: ValuesStore) -> Self {
        self.store = store;
        self
    }

    fn request(params: &Parameters, values: Value) -> HelmRequest {
        HelmRequest {
            release: RELEASE_NAME.to_string(),
            namespace: params.namespace.clone(),
            chart: params.chart.clone(),
            values,
            reuse_values: true,
        }
    }
}

#[async_trait]
impl Installer for HelmInstaller {
    fn mode(&self) -> InstallMode {
        InstallMode::Helm
    }

    fn defaults(&self) -> Value {
        json!({})
    }

    async fn apply(&self, params: &Parameters, values: &ResolvedValues) -> Result<InstallationStatus> {
        let namespace = params.namespace.as_str();
        let Some(release_values) = self.engine.release_values(RELEASE_NAME, namespace).await?
        else {
            return Err(Error::install(format!(
                "Helm release {} not found in namespace {}, install Cilium with Helm or use --mode classic",
                RELEASE_NAME, namespace
            )));
        };

        let ca = self.ca.ensure(params, Some(values)).await?;
        let mut values = values.clone();
        ca.fold_into(&mut values);
        values.set("hubble.tls.enabled", Value::Bool(true));
        values.set("hubble.tls.auto.enabled", Value::Bool(true));
        values.set("hubble.tls.auto.method", Value::String("helm".to_string()));

        let request = Self::request(params, values.tree().clone());

        let mut preview = request.clone();
        preview.values = release_values;
        deep_merge(&mut preview.values, values.tree().clone());
        let manifest = self
            .engine
            .template(&preview)
            .await
            .map_err(|e| Error::install(format!("unable to render chart: {}", e)))?;
        debug!(bytes = manifest.len(), "Rendered chart");

        self.engine
            .upgrade(&request)
            .await
            .map_err(|e| Error::install(format!("unable to upgrade release {}: {}", RELEASE_NAME, e)))?;

        let relay = values.relay_enabled();
        let ui = values.ui_enabled();
        self.store
            .save(
                &PersistedValuesRecord::new(values, namespace, params.chart.version()),
                &params.values_secret_name,
                namespace,
            )
            .await?;

        info!(namespace = %namespace, relay, ui, "Hubble enabled");
        Ok(InstallationStatus::unknown(relay, ui))
    }

    async fn remove(&self, params: &Parameters, purge: bool) -> Result<()> {
        let namespace = params.namespace.as_str();

        if purge {
            if self.engine.uninstall(RELEASE_NAME, namespace).await? {
                info!(namespace = %namespace, "Uninstalled Helm release {}", RELEASE_NAME);
            } else {
                debug!(namespace = %namespace, "Helm release {} already absent", RELEASE_NAME);
            }
        } else if self
            .engine
            .release_values(RELEASE_NAME, namespace)
            .await?
            .is_some()
        {
            let off = json!({"hubble": {"relay": {"enabled": false}, "ui": {"enabled": false}}});
            self.engine
                .upgrade(&Self::request(params, off))
                .await
                .map_err(|e| {
                    Error::install(format!("unable to upgrade release {}: {}", RELEASE_NAME, e))
                })?;
        } else {
            debug!(namespace = %namespace, "Helm release {} not found, nothing to disable", RELEASE_NAME);
        }

        self.store
            .delete(&params.values_secret_name, namespace)
            .await?;
        info!(namespace = %namespace, "Hubble disabled");
        Ok(())
    }
}
