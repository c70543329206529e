//! Enable and disable flows.
//!
//! [`Hubble`] wires the config merger, the selected installer, the values
//! store and the readiness waiter together. It holds no state of its own;
//! everything durable lives in the cluster.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::install::Installer;
use crate::params::Parameters;
use crate::status::InstallationStatus;
use crate::store::ValuesStore;
use crate::values::{merge, ResolvedValues};
use crate::wait::ReadinessWaiter;
use crate::{Error, Result, DEFAULT_NAMESPACE};

/// Lifecycle operations over one cluster
pub struct Hubble {
    installer: Arc<dyn Installer>,
    store: ValuesStore,
    waiter: ReadinessWaiter,
}

impl Hubble {
    /// Orchestrator over the given components
    pub fn new(installer: Arc<dyn Installer>, store: ValuesStore, waiter: ReadinessWaiter) -> Self {
        Self {
            installer,
            store,
            waiter,
        }
    }

    /// Namespace to operate on: the explicit one, else wherever a previous
    /// enable persisted its values, else the default.
    pub async fn target_namespace(&self, explicit: Option<&str>, secret_name: &str) -> Result<String> {
        if let Some(namespace) = explicit {
            return Ok(namespace.to_string());
        }
        match self.store.find(secret_name).await? {
            Some(namespace) => {
                info!(namespace = %namespace, "Using namespace of the existing installation");
                Ok(namespace)
            }
            None => Ok(DEFAULT_NAMESPACE.to_string()),
        }
    }

    /// Merge every configuration source for `params`
    pub async fn resolve(&self, params: &Parameters) -> Result<ResolvedValues> {
        let prior = self
            .store
            .try_load(&params.values_secret_name, &params.namespace)
            .await?
            .map(|record| record.values);
        if prior.is_some() {
            debug!("Merging values persisted by a previous enable");
        }
        merge::resolve(params, self.installer.defaults(), prior.as_ref())
    }

    /// Install or update, then optionally wait for readiness.
    ///
    /// A failed or timed-out wait is returned as an error but leaves the
    /// installation in place.
    pub async fn enable(
        &self,
        params: &Parameters,
        cancel: &CancellationToken,
    ) -> Result<InstallationStatus> {
        let values = self.resolve(params).await?;

        if let Some(path) = &params.helm_gen_values_file {
            std::fs::write(path, values.to_yaml()?).map_err(|e| {
                Error::config(format!("unable to write {}: {}", path.display(), e))
            })?;
            info!(path = %path.display(), "Wrote generated values");
        }
        debug!(
            mode = %self.installer.mode(),
            "Resolved values:\n{}",
            values.display(params.redact_cert_keys)?
        );

        let status = self.installer.apply(params, &values).await?;
        if !params.wait {
            return Ok(status);
        }

        self.waiter
            .wait_ready(&params.namespace, &values, params.wait_duration, cancel)
            .await
            .inspect_err(|e| {
                warn!(error = %e, namespace = %params.namespace, "Installation left in place")
            })
    }

    /// Remove the installation and its persisted values
    pub async fn disable(&self, params: &Parameters, purge: bool) -> Result<()> {
        self.installer.remove(params, purge).await
    }
}
