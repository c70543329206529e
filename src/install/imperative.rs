//! Imperative installer: creates, patches and deletes objects directly.
//!
//! Every object is reconciled by reading the live copy and sending a merge
//! patch with only the desired fields that differ, so server-assigned fields
//! such as a Service's cluster IP survive re-application.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::SystemTime;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Secret;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use k8s_openapi::ByteString;
use serde_json::{json, Value};
use tracing::{debug, info, warn};

use super::resources::{
    self, Desired, AGENT_CONFIG_NAME, AGENT_DAEMONSET_NAME, RELAY_CLIENT_CERTS_SECRET,
    SERVER_CERTS_SECRET,
};
use super::{InstallMode, Installer};
use crate::ca::{CaManager, CaState};
use crate::cluster::{ResourceClient, ResourceKind, SecretClient, MANAGED_BY, MANAGED_BY_LABEL};
use crate::params::Parameters;
use crate::pki::LeafCertificate;
use crate::status::InstallationStatus;
use crate::store::{PersistedValuesRecord, ValuesStore};
use crate::values::ResolvedValues;
use crate::{Error, Result};

const RESTARTED_AT_ANNOTATION: &str = "kubectl.kubernetes.io/restartedAt";

/// Outcome of reconciling one object
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Change {
    Created,
    Patched,
    Unchanged,
}

/// Installs the relay and UI by managing their objects one by one
pub struct ImperativeInstaller {
    resources: Arc<dyn ResourceClient>,
    secrets: Arc<dyn SecretClient>,
    ca: CaManager,
    store: ValuesStore,
}

impl ImperativeInstaller {
    /// Installer over the given cluster seams
    pub fn new(resources: Arc<dyn ResourceClient>, secrets: Arc<dyn SecretClient>) -> Self {
        Self {
            resources,
            ca: CaManager::new(secrets.clone()),
            store: ValuesStore::new(secrets.clone()),
            secrets,
        }
    }

    /// Use a specific values store
    pub fn with_store(mut self, store: ValuesStore) -> Self {
        self.store = store;
        self
    }

    async fn reconcile(&self, namespace: &str, desired: &Desired) -> Result<Change> {
        let kind = desired.kind;
        let name = desired.name.as_str();

        let Some(live) = self.resources.get(kind, namespace, name).await? else {
            self.resources
                .create(kind, namespace, desired.object.clone())
                .await
                .map_err(|e| Error::install(format!("unable to create {} {}: {}", kind, name, e)))?;
            info!(kind = %kind, name = %name, namespace = %namespace, "Created");
            return Ok(Change::Created);
        };

        match resources::diff(&desired.object, &live) {
            None => {
                debug!(kind = %kind, name = %name, "Up to date");
                Ok(Change::Unchanged)
            }
            Some(patch) => {
                self.resources
                    .patch(kind, namespace, name, patch)
                    .await
                    .map_err(|e| {
                        Error::install(format!("unable to update {} {}: {}", kind, name, e))
                    })?;
                info!(kind = %kind, name = %name, namespace = %namespace, "Updated");
                Ok(Change::Patched)
            }
        }
    }

    async fn reconcile_all(&self, namespace: &str, objects: &[Desired]) -> Result<()> {
        for desired in objects {
            self.reconcile(namespace, desired).await?;
        }
        Ok(())
    }

    /// Delete in reverse creation order; absent objects are fine
    async fn remove_all(&self, namespace: &str, objects: &[Desired]) -> Result<()> {
        for desired in objects.iter().rev() {
            let existed = self
                .resources
                .delete(desired.kind, namespace, &desired.name)
                .await
                .map_err(|e| {
                    Error::install(format!(
                        "unable to delete {} {}: {}",
                        desired.kind, desired.name, e
                    ))
                })?;
            if existed {
                info!(kind = %desired.kind, name = %desired.name, namespace = %namespace, "Deleted");
            }
        }
        Ok(())
    }

    /// Write a TLS secret unless the live one was issued by the same CA
    async fn ensure_tls_secret(
        &self,
        namespace: &str,
        name: &str,
        ca: &CaState,
        issue: fn(&CaState) -> Result<LeafCertificate>,
    ) -> Result<()> {
        let ca_pem = ca.ca.ca_cert_pem();
        if let Some(existing) = self.secrets.get_secret(namespace, name).await? {
            let data = existing.data.unwrap_or_default();
            let same_ca = data.get("ca.crt").map(|b| b.0.as_slice()) == Some(ca_pem.as_bytes());
            if same_ca && data.contains_key("tls.crt") && data.contains_key("tls.key") {
                debug!(secret = %name, "TLS secret already issued by current CA");
                return Ok(());
            }
        }

        let leaf = issue(ca)?;
        self.secrets
            .put_secret(namespace, tls_secret(name, namespace, &ca_pem, &leaf))
            .await?;
        info!(secret = %name, namespace = %namespace, "Issued TLS certificate");
        Ok(())
    }

    /// Patch `cilium-config`. Returns whether anything changed.
    async fn configure_agent(&self, namespace: &str, patch: Value, required: bool) -> Result<bool> {
        let live = self
            .resources
            .get(ResourceKind::ConfigMap, namespace, AGENT_CONFIG_NAME)
            .await?;
        let Some(live) = live else {
            if required {
                return Err(Error::install(format!(
                    "ConfigMap {}/{} not found, is Cilium installed in this namespace?",
                    namespace, AGENT_CONFIG_NAME
                )));
            }
            debug!(namespace = %namespace, "No agent configuration to revert");
            return Ok(false);
        };

        let Some(patch) = resources::diff(&patch, &live) else {
            return Ok(false);
        };
        self.resources
            .patch(ResourceKind::ConfigMap, namespace, AGENT_CONFIG_NAME, patch)
            .await
            .map_err(|e| Error::install(format!("unable to update {}: {}", AGENT_CONFIG_NAME, e)))?;
        info!(namespace = %namespace, "Updated agent configuration");
        Ok(true)
    }

    /// Roll the agent DaemonSet so it picks up configuration changes
    async fn restart_agent(&self, namespace: &str) -> Result<()> {
        let patch = json!({"spec": {"template": {"metadata": {"annotations": {
            RESTARTED_AT_ANNOTATION: humantime::format_rfc3339_seconds(SystemTime::now()).to_string()
        }}}}});
        match self
            .resources
            .patch(ResourceKind::DaemonSet, namespace, AGENT_DAEMONSET_NAME, patch)
            .await
        {
            Ok(()) => {
                info!(namespace = %namespace, "Restarting Cilium agents");
                Ok(())
            }
            Err(e) if e.is_not_found() => {
                warn!(namespace = %namespace, "DaemonSet {} not found, agents not restarted", AGENT_DAEMONSET_NAME);
                Ok(())
            }
            Err(e) => Err(Error::install(format!(
                "unable to restart {}: {}",
                AGENT_DAEMONSET_NAME, e
            ))),
        }
    }

    fn relay_identities(namespace: &str) -> Vec<Desired> {
        resources::relay_objects(&ResolvedValues::default(), namespace)
    }

    fn ui_identities(namespace: &str) -> Vec<Desired> {
        resources::ui_objects(&ResolvedValues::default(), namespace)
    }
}

fn tls_secret(name: &str, namespace: &str, ca_pem: &str, leaf: &LeafCertificate) -> Secret {
    Secret {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(namespace.to_string()),
            labels: Some(BTreeMap::from([(
                MANAGED_BY_LABEL.to_string(),
                MANAGED_BY.to_string(),
            )])),
            ..Default::default()
        },
        data: Some(BTreeMap::from([
            ("ca.crt".to_string(), ByteString(ca_pem.as_bytes().to_vec())),
            ("tls.crt".to_string(), ByteString(leaf.cert_pem.as_bytes().to_vec())),
            ("tls.key".to_string(), ByteString(leaf.key_pem.as_bytes().to_vec())),
        ])),
        type_: Some("kubernetes.io/tls".to_string()),
        ..Default::default()
    }
}

#[async_trait]
impl Installer for ImperativeInstaller {
    fn mode(&self) -> InstallMode {
        InstallMode::Imperative
    }

    fn defaults(&self) -> Value {
        resources::defaults()
    }

    async fn apply(&self, params: &Parameters, values: &ResolvedValues) -> Result<InstallationStatus> {
        let namespace = params.namespace.as_str();
        let relay = values.relay_enabled();
        let ui = values.ui_enabled();
        if ui && !relay {
            warn!("UI enabled without relay, it will have no flow source until a relay is running");
        }

        // Fail before touching anything when the agent is not there
        if self
            .resources
            .get(ResourceKind::ConfigMap, namespace, AGENT_CONFIG_NAME)
            .await?
            .is_none()
        {
            return Err(Error::install(format!(
                "ConfigMap {}/{} not found, is Cilium installed in this namespace?",
                namespace, AGENT_CONFIG_NAME
            )));
        }

        let ca = self.ca.ensure(params, Some(values)).await?;
        self.ensure_tls_secret(namespace, SERVER_CERTS_SECRET, &ca, CaState::server_certificate)
            .await?;

        if relay {
            self.ensure_tls_secret(
                namespace,
                RELAY_CLIENT_CERTS_SECRET,
                &ca,
                CaState::relay_client_certificate,
            )
            .await?;
            self.reconcile_all(namespace, &resources::relay_objects(values, namespace))
                .await?;
        } else {
            self.remove_all(namespace, &Self::relay_identities(namespace))
                .await?;
            self.secrets
                .delete_secret(namespace, RELAY_CLIENT_CERTS_SECRET)
                .await?;
        }

        if ui {
            self.reconcile_all(namespace, &resources::ui_objects(values, namespace))
                .await?;
        } else {
            self.remove_all(namespace, &Self::ui_identities(namespace))
                .await?;
        }

        if self
            .configure_agent(namespace, resources::agent_enable_patch(values), true)
            .await?
        {
            self.restart_agent(namespace).await?;
        }

        let mut persisted = values.clone();
        ca.fold_into(&mut persisted);
        self.store
            .save(
                &PersistedValuesRecord::new(persisted, namespace, None),
                &params.values_secret_name,
                namespace,
            )
            .await?;

        info!(namespace = %namespace, relay, ui, "Hubble enabled");
        Ok(InstallationStatus::unknown(relay, ui))
    }

    async fn remove(&self, params: &Parameters, purge: bool) -> Result<()> {
        let namespace = params.namespace.as_str();

        self.remove_all(namespace, &Self::ui_identities(namespace))
            .await?;
        self.remove_all(namespace, &Self::relay_identities(namespace))
            .await?;
        for secret in [RELAY_CLIENT_CERTS_SECRET, SERVER_CERTS_SECRET] {
            self.secrets.delete_secret(namespace, secret).await?;
        }

        if purge {
            debug!(namespace = %namespace, "Agent is being removed, leaving its configuration alone");
        } else if self
            .configure_agent(namespace, resources::agent_disable_patch(), false)
            .await?
        {
            self.restart_agent(namespace).await?;
        }
        self.ca.remove_owned(namespace).await?;

        self.store
            .delete(&params.values_secret_name, namespace)
            .await?;
        info!(namespace = %namespace, "Hubble disabled");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ca::CA_SECRET_NAME;
    use crate::testing::FakeCluster;
    use crate::values::merge;
    use crate::{PEER_SERVICE_NAME, RELAY_NAME, UI_NAME};

    fn installer(cluster: &Arc<FakeCluster>) -> ImperativeInstaller {
        ImperativeInstaller::new(cluster.clone(), cluster.clone())
    }

    fn resolve(installer: &ImperativeInstaller, params: &Parameters) -> ResolvedValues {
        merge::resolve(params, installer.defaults(), None).unwrap()
    }

    #[tokio::test]
    async fn story_enable_relay_creates_objects_then_persists_values() {
        let cluster = FakeCluster::with_agent("kube-system");
        let installer = installer(&cluster);
        let params = Parameters::default();
        let values = resolve(&installer, &params);

        let status = installer.apply(&params, &values).await.unwrap();
        assert_eq!(status, InstallationStatus::unknown(true, false));

        let deployment = cluster
            .object(ResourceKind::Deployment, "kube-system", RELAY_NAME)
            .unwrap();
        assert_eq!(
            deployment["spec"]["template"]["spec"]["containers"][0]["image"],
            json!(resources::image(&values, "hubble.relay.image").unwrap())
        );
        assert!(cluster
            .object(ResourceKind::Service, "kube-system", PEER_SERVICE_NAME)
            .is_some());
        assert!(cluster.names(ResourceKind::ClusterRole).is_empty());

        let secrets = cluster.secret_names("kube-system");
        for name in [
            CA_SECRET_NAME,
            SERVER_CERTS_SECRET,
            RELAY_CLIENT_CERTS_SECRET,
            "cilium-cli-helm-values",
        ] {
            assert!(secrets.contains(&name.to_string()), "missing {}", name);
        }

        let config = cluster
            .object(ResourceKind::ConfigMap, "kube-system", AGENT_CONFIG_NAME)
            .unwrap();
        assert_eq!(config["data"]["enable-hubble"], json!("true"));
        assert_eq!(config["data"]["cluster-name"], json!("default"));
        let agent = cluster
            .object(ResourceKind::DaemonSet, "kube-system", AGENT_DAEMONSET_NAME)
            .unwrap();
        assert!(agent["spec"]["template"]["metadata"]["annotations"][RESTARTED_AT_ANNOTATION]
            .is_string());

        // The values record is written after every cluster mutation
        let ops = cluster.ops();
        assert_eq!(ops.last().unwrap(), "put secret/cilium-cli-helm-values");
    }

    #[tokio::test]
    async fn reapplying_changes_nothing_and_keeps_cluster_fields() {
        let cluster = FakeCluster::with_agent("kube-system");
        let installer = installer(&cluster);
        let params = Parameters {
            ui: true,
            ..Default::default()
        };
        let values = resolve(&installer, &params);
        installer.apply(&params, &values).await.unwrap();
        let before = cluster.ops().len();

        installer.apply(&params, &values).await.unwrap();

        let after: Vec<_> = cluster.ops().into_iter().skip(before).collect();
        assert_eq!(after, vec!["put secret/cilium-cli-helm-values"]);
        let service = cluster
            .object(ResourceKind::Service, "kube-system", RELAY_NAME)
            .unwrap();
        assert_eq!(service["spec"]["clusterIP"], json!("10.96.0.42"));
        assert_eq!(service["metadata"]["resourceVersion"], json!("1"));
    }

    #[tokio::test]
    async fn changed_values_are_patched_in_place() {
        let cluster = FakeCluster::with_agent("kube-system");
        let installer = installer(&cluster);
        let params = Parameters::default();
        installer
            .apply(&params, &resolve(&installer, &params))
            .await
            .unwrap();

        let updated = Parameters {
            relay_image: Some("registry.local/hubble-relay:dev".into()),
            ..Default::default()
        };
        installer
            .apply(&updated, &resolve(&installer, &updated))
            .await
            .unwrap();

        assert!(cluster
            .ops()
            .contains(&format!("patch Deployment/{}", RELAY_NAME)));
        let deployment = cluster
            .object(ResourceKind::Deployment, "kube-system", RELAY_NAME)
            .unwrap();
        assert_eq!(
            deployment["spec"]["template"]["spec"]["containers"][0]["image"],
            json!("registry.local/hubble-relay:dev")
        );
        let service = cluster
            .object(ResourceKind::Service, "kube-system", RELAY_NAME)
            .unwrap();
        assert_eq!(service["spec"]["clusterIP"], json!("10.96.0.42"));
    }

    #[tokio::test]
    async fn disabling_the_ui_removes_only_its_objects() {
        let cluster = FakeCluster::with_agent("kube-system");
        let installer = installer(&cluster);
        let with_ui = Parameters {
            ui: true,
            ..Default::default()
        };
        installer
            .apply(&with_ui, &resolve(&installer, &with_ui))
            .await
            .unwrap();
        assert!(cluster
            .object(ResourceKind::ClusterRoleBinding, "", UI_NAME)
            .is_some());

        let without_ui = Parameters::default();
        installer
            .apply(&without_ui, &resolve(&installer, &without_ui))
            .await
            .unwrap();

        assert!(cluster
            .object(ResourceKind::Deployment, "kube-system", UI_NAME)
            .is_none());
        assert!(cluster.names(ResourceKind::ClusterRole).is_empty());
        assert!(cluster
            .object(ResourceKind::Deployment, "kube-system", RELAY_NAME)
            .is_some());
    }

    #[tokio::test]
    async fn missing_agent_fails_before_any_change() {
        let cluster = FakeCluster::new();
        let installer = installer(&cluster);
        let params = Parameters::default();

        let err = installer
            .apply(&params, &resolve(&installer, &params))
            .await
            .unwrap_err();

        assert!(matches!(err, Error::Install(_)));
        assert!(cluster.ops().is_empty());
    }

    #[tokio::test]
    async fn failed_create_leaves_values_unsaved() {
        let cluster = FakeCluster::with_agent("kube-system");
        cluster.fail_create_of(ResourceKind::Deployment, RELAY_NAME);
        let installer = installer(&cluster);
        let params = Parameters::default();

        let err = installer
            .apply(&params, &resolve(&installer, &params))
            .await
            .unwrap_err();

        assert!(err.to_string().contains("admission webhook denied"));
        assert!(cluster.secret("kube-system", "cilium-cli-helm-values").is_none());
    }

    #[tokio::test]
    async fn story_remove_twice_is_clean_and_idempotent() {
        let cluster = FakeCluster::with_agent("kube-system");
        let installer = installer(&cluster);
        let params = Parameters {
            ui: true,
            ..Default::default()
        };
        installer
            .apply(&params, &resolve(&installer, &params))
            .await
            .unwrap();

        installer.remove(&params, false).await.unwrap();
        installer.remove(&params, false).await.unwrap();

        for kind in [
            ResourceKind::Deployment,
            ResourceKind::Service,
            ResourceKind::ServiceAccount,
            ResourceKind::ClusterRole,
            ResourceKind::ClusterRoleBinding,
        ] {
            assert!(cluster.names(kind).is_empty(), "{} left behind", kind);
        }
        assert!(cluster.secret_names("kube-system").is_empty());

        let config = cluster
            .object(ResourceKind::ConfigMap, "kube-system", AGENT_CONFIG_NAME)
            .unwrap();
        assert_eq!(config["data"]["enable-hubble"], json!("false"));
        assert!(config["data"].get("hubble-tls-cert-file").is_none());
        assert_eq!(config["data"]["cluster-name"], json!("default"));
    }

    #[tokio::test]
    async fn purge_leaves_agent_configuration_alone() {
        let cluster = FakeCluster::with_agent("kube-system");
        let installer = installer(&cluster);
        let params = Parameters::default();
        installer
            .apply(&params, &resolve(&installer, &params))
            .await
            .unwrap();
        let before = cluster.ops().len();

        installer.remove(&params, true).await.unwrap();

        let after: Vec<_> = cluster.ops().into_iter().skip(before).collect();
        assert!(!after.iter().any(|op| op.starts_with("patch")));
        assert!(cluster
            .object(ResourceKind::Deployment, "kube-system", RELAY_NAME)
            .is_none());
    }

    #[tokio::test]
    async fn remove_on_a_bare_cluster_succeeds() {
        let cluster = FakeCluster::new();
        installer(&cluster)
            .remove(&Parameters::default(), true)
            .await
            .unwrap();
    }
}
