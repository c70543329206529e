//! Persisted values store.
//!
//! The resolved values of the last successful enable are kept in one secret
//! per installation so that disable and later enables can recover the
//! configuration without the original flags. Saves replace the whole secret;
//! merging already happened in the config merger.

use std::collections::BTreeMap;
use std::sync::Arc;

use k8s_openapi::api::core::v1::Secret;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use k8s_openapi::ByteString;
use tracing::{debug, info, warn};

use crate::cluster::{SecretClient, MANAGED_BY, MANAGED_BY_LABEL};
use crate::retry::{retry_with_backoff, RetryConfig};
use crate::values::ResolvedValues;
use crate::{Error, Result};

const VALUES_KEY: &str = "values.yaml";
const NAMESPACE_KEY: &str = "namespace";
const RELAY_KEY: &str = "relay";
const UI_KEY: &str = "ui";
const CHART_VERSION_KEY: &str = "chart-version";

/// What an enable persisted
#[derive(Clone, Debug, PartialEq)]
pub struct PersistedValuesRecord {
    /// Resolved values, unredacted
    pub values: ResolvedValues,
    /// Installation namespace
    pub namespace: String,
    /// Relay enabled at save time
    pub relay: bool,
    /// UI enabled at save time
    pub ui: bool,
    /// Chart version used, if any
    pub chart_version: Option<String>,
}

impl PersistedValuesRecord {
    /// Record for `values` installed in `namespace`
    pub fn new(values: ResolvedValues, namespace: &str, chart_version: Option<&str>) -> Self {
        Self {
            relay: values.relay_enabled(),
            ui: values.ui_enabled(),
            values,
            namespace: namespace.to_string(),
            chart_version: chart_version.map(str::to_string),
        }
    }

    fn to_secret(&self, name: &str) -> Result<Secret> {
        let mut data = BTreeMap::new();
        let mut put = |key: &str, value: String| {
            data.insert(key.to_string(), ByteString(value.into_bytes()));
        };
        put(VALUES_KEY, self.values.to_yaml()?);
        put(NAMESPACE_KEY, self.namespace.clone());
        put(RELAY_KEY, self.relay.to_string());
        put(UI_KEY, self.ui.to_string());
        if let Some(version) = &self.chart_version {
            put(CHART_VERSION_KEY, version.clone());
        }

        let labels = BTreeMap::from([
            (MANAGED_BY_LABEL.to_string(), MANAGED_BY.to_string()),
            ("app.kubernetes.io/part-of".to_string(), "hubble".to_string()),
        ]);

        Ok(Secret {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some(self.namespace.clone()),
                labels: Some(labels),
                ..Default::default()
            },
            data: Some(data),
            type_: Some("Opaque".to_string()),
            ..Default::default()
        })
    }

    fn from_secret(secret: &Secret, namespace: &str) -> Result<Self> {
        let data = secret.data.clone().unwrap_or_default();
        let text = |key: &str| -> Result<Option<String>> {
            data.get(key)
                .map(|b| {
                    String::from_utf8(b.0.clone()).map_err(|_| {
                        Error::config(format!("persisted values key {} is not UTF-8", key))
                    })
                })
                .transpose()
        };

        let values = ResolvedValues::from_yaml(&text(VALUES_KEY)?.unwrap_or_default())?;
        Ok(Self {
            relay: text(RELAY_KEY)?
                .and_then(|v| v.parse().ok())
                .unwrap_or_else(|| values.relay_enabled()),
            ui: text(UI_KEY)?
                .and_then(|v| v.parse().ok())
                .unwrap_or_else(|| values.ui_enabled()),
            namespace: text(NAMESPACE_KEY)?.unwrap_or_else(|| namespace.to_string()),
            chart_version: text(CHART_VERSION_KEY)?,
            values,
        })
    }
}

/// Load, save and delete persisted values records
#[derive(Clone)]
pub struct ValuesStore {
    secrets: Arc<dyn SecretClient>,
    retry: RetryConfig,
}

impl ValuesStore {
    /// Store backed by `secrets`
    pub fn new(secrets: Arc<dyn SecretClient>) -> Self {
        Self {
            secrets,
            retry: RetryConfig::with_max_attempts(3),
        }
    }

    /// Override the retry policy used for writes
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Load the record; `Error::NotFound` when there is none
    pub async fn load(&self, name: &str, namespace: &str) -> Result<PersistedValuesRecord> {
        self.try_load(name, namespace).await?.ok_or_else(|| {
            Error::not_found(format!("persisted values secret {}/{}", namespace, name))
        })
    }

    /// Load the record if present
    pub async fn try_load(
        &self,
        name: &str,
        namespace: &str,
    ) -> Result<Option<PersistedValuesRecord>> {
        match self.secrets.get_secret(namespace, name).await? {
            Some(secret) => {
                debug!(secret = %name, namespace = %namespace, "Loaded persisted values");
                PersistedValuesRecord::from_secret(&secret, namespace).map(Some)
            }
            None => Ok(None),
        }
    }

    /// Replace the record
    pub async fn save(
        &self,
        record: &PersistedValuesRecord,
        name: &str,
        namespace: &str,
    ) -> Result<()> {
        let secret = record.to_secret(name)?;
        retry_with_backoff(&self.retry, "save_values", || {
            self.secrets.put_secret(namespace, secret.clone())
        })
        .await?;
        info!(secret = %name, namespace = %namespace, "Saved Helm values");
        Ok(())
    }

    /// Delete the record. Deleting an absent record succeeds.
    pub async fn delete(&self, name: &str, namespace: &str) -> Result<()> {
        let existed = retry_with_backoff(&self.retry, "delete_values", || {
            self.secrets.delete_secret(namespace, name)
        })
        .await?;
        if existed {
            info!(secret = %name, namespace = %namespace, "Deleted persisted Helm values");
        } else {
            debug!(secret = %name, namespace = %namespace, "Persisted Helm values already absent");
        }
        Ok(())
    }

    /// Namespace holding a record with this name, if any
    pub async fn find(&self, name: &str) -> Result<Option<String>> {
        let namespaces = self.secrets.find_secret(name).await?;
        if namespaces.len() > 1 {
            warn!(
                secret = %name,
                namespaces = ?namespaces,
                "Persisted values found in several namespaces, using the first"
            );
        }
        Ok(namespaces.into_iter().next())
    }
}
