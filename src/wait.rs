//! Readiness waiting for the relay and UI deployments.

use std::sync::Arc;
use std::time::Duration;

use k8s_openapi::api::apps::v1::Deployment;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::cluster::DeploymentReader;
use crate::status::{ComponentStatus, InstallationStatus};
use crate::values::ResolvedValues;
use crate::{Error, Result, RELAY_NAME, UI_NAME};

/// Default interval between status samples
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(2);

/// Classify a deployment's rollout
pub fn deployment_status(deployment: Option<&Deployment>) -> ComponentStatus {
    let Some(deployment) = deployment else {
        return ComponentStatus::Unknown;
    };
    let Some(status) = &deployment.status else {
        return ComponentStatus::Progressing;
    };

    for condition in status.conditions.iter().flatten() {
        let reason = condition.reason.as_deref().unwrap_or_default();
        let failed = (condition.type_ == "Progressing" && reason == "ProgressDeadlineExceeded")
            || (condition.type_ == "ReplicaFailure" && condition.status == "True");
        if failed {
            let reason = if reason.is_empty() {
                condition.type_.as_str()
            } else {
                reason
            };
            return ComponentStatus::Failed(match &condition.message {
                Some(message) => format!("{}: {}", reason, message),
                None => reason.to_string(),
            });
        }
    }

    let generation = deployment.metadata.generation.unwrap_or(0);
    if status.observed_generation.unwrap_or(0) < generation {
        return ComponentStatus::Progressing;
    }

    let desired = deployment
        .spec
        .as_ref()
        .and_then(|s| s.replicas)
        .unwrap_or(1);
    let rolled_out = status.updated_replicas.unwrap_or(0) >= desired
        && status.available_replicas.unwrap_or(0) >= desired
        && status.ready_replicas.unwrap_or(0) >= desired;
    if rolled_out {
        ComponentStatus::Ready
    } else {
        ComponentStatus::Progressing
    }
}

/// Polls component status until ready, failed, timed out or cancelled
pub struct ReadinessWaiter {
    reader: Arc<dyn DeploymentReader>,
    interval: Duration,
}

impl ReadinessWaiter {
    /// Waiter sampling through `reader`
    pub fn new(reader: Arc<dyn DeploymentReader>) -> Self {
        Self {
            reader,
            interval: DEFAULT_POLL_INTERVAL,
        }
    }

    /// Override the poll interval
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// One sample of every component enabled in `values`
    pub async fn sample(&self, namespace: &str, values: &ResolvedValues) -> Result<InstallationStatus> {
        let mut status = InstallationStatus::default();
        if values.relay_enabled() {
            let d = self.reader.get_deployment(namespace, RELAY_NAME).await?;
            status.relay = Some(deployment_status(d.as_ref()));
        }
        if values.ui_enabled() {
            let d = self.reader.get_deployment(namespace, UI_NAME).await?;
            status.ui = Some(deployment_status(d.as_ref()));
        }
        Ok(status)
    }

    /// Wait until every enabled component is Ready.
    ///
    /// Returns `Error::ComponentFailed` as soon as a component reports a
    /// failed rollout and `Error::Timeout` with the last observed status once
    /// `timeout` elapses. Sampling errors are logged and polling continues.
    pub async fn wait_ready(
        &self,
        namespace: &str,
        values: &ResolvedValues,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<InstallationStatus> {
        let deadline = Instant::now() + timeout;
        let mut last = InstallationStatus::unknown(values.relay_enabled(), values.ui_enabled());
        info!(namespace = %namespace, timeout = ?timeout, "Waiting for Hubble to become ready");

        loop {
            match self.sample(namespace, values).await {
                Ok(status) => {
                    if status != last {
                        debug!(status = %status, "Hubble status changed");
                    }
                    last = status;
                }
                Err(e) => warn!(error = %e, "Failed to read Hubble status, retrying"),
            }

            if last.all_ready() {
                info!(status = %last, "Hubble is ready");
                return Ok(last);
            }
            if let Some((component, reason)) = last.first_failure() {
                return Err(Error::ComponentFailed {
                    component: component.to_string(),
                    reason: reason.to_string(),
                    status: last.clone(),
                });
            }

            let now = Instant::now();
            if now >= deadline {
                return Err(Error::Timeout { status: last });
            }
            let pause = self.interval.min(deadline - now);
            tokio::select! {
                _ = cancel.cancelled() => return Err(Error::Cancelled),
                _ = tokio::time::sleep(pause) => {}
            }
        }
    }
}
