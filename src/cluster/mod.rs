//! Cluster API seams.
//!
//! Every component talks to the cluster through these traits so it can be
//! exercised against mocks and in-memory fakes. [`KubeCluster`] implements
//! all of them over a kube [`Client`](kube::Client).

mod client;

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::{DaemonSet, Deployment};
use k8s_openapi::api::core::v1::{ConfigMap, Secret, Service, ServiceAccount};
use k8s_openapi::api::rbac::v1::{ClusterRole, ClusterRoleBinding};
use kube::discovery::ApiResource;
#[cfg(test)]
use mockall::automock;
use serde_json::Value;

use crate::Result;

pub use client::KubeCluster;

/// Label marking objects created by this tool
pub const MANAGED_BY_LABEL: &str = "app.kubernetes.io/managed-by";

/// Value of [`MANAGED_BY_LABEL`]
pub const MANAGED_BY: &str = "hubble-ctl";

/// Secret access shared by the values store and the CA manager
#[cfg_attr(test, automock)]
#[async_trait]
pub trait SecretClient: Send + Sync {
    /// Fetch a secret; `None` when absent
    async fn get_secret(&self, namespace: &str, name: &str) -> Result<Option<Secret>>;

    /// Create the secret, or replace it wholesale if it exists
    async fn put_secret(&self, namespace: &str, secret: Secret) -> Result<()>;

    /// Delete a secret; returns whether it existed
    async fn delete_secret(&self, namespace: &str, name: &str) -> Result<bool>;

    /// Namespaces holding a secret with this name
    async fn find_secret(&self, name: &str) -> Result<Vec<String>>;
}

/// Kinds of objects the imperative installer manages
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ResourceKind {
    /// ServiceAccount
    ServiceAccount,
    /// ConfigMap
    ConfigMap,
    /// Secret
    Secret,
    /// Service
    Service,
    /// Deployment
    Deployment,
    /// DaemonSet
    DaemonSet,
    /// ClusterRole
    ClusterRole,
    /// ClusterRoleBinding
    ClusterRoleBinding,
}

impl ResourceKind {
    /// API resource descriptor for dynamic access
    pub fn api_resource(&self) -> ApiResource {
        match self {
            Self::ServiceAccount => ApiResource::erase::<ServiceAccount>(&()),
            Self::ConfigMap => ApiResource::erase::<ConfigMap>(&()),
            Self::Secret => ApiResource::erase::<Secret>(&()),
            Self::Service => ApiResource::erase::<Service>(&()),
            Self::Deployment => ApiResource::erase::<Deployment>(&()),
            Self::DaemonSet => ApiResource::erase::<DaemonSet>(&()),
            Self::ClusterRole => ApiResource::erase::<ClusterRole>(&()),
            Self::ClusterRoleBinding => ApiResource::erase::<ClusterRoleBinding>(&()),
        }
    }

    /// Whether objects of this kind live in a namespace
    pub fn namespaced(&self) -> bool {
        !matches!(self, Self::ClusterRole | Self::ClusterRoleBinding)
    }

    /// Kind name
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ServiceAccount => "ServiceAccount",
            Self::ConfigMap => "ConfigMap",
            Self::Secret => "Secret",
            Self::Service => "Service",
            Self::Deployment => "Deployment",
            Self::DaemonSet => "DaemonSet",
            Self::ClusterRole => "ClusterRole",
            Self::ClusterRoleBinding => "ClusterRoleBinding",
        }
    }
}

impl std::fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Untyped object access. Objects are JSON documents as served by the API.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ResourceClient: Send + Sync {
    /// Fetch an object; `None` when absent
    async fn get(&self, kind: ResourceKind, namespace: &str, name: &str) -> Result<Option<Value>>;

    /// Create an object
    async fn create(&self, kind: ResourceKind, namespace: &str, object: Value) -> Result<()>;

    /// Apply a JSON merge patch to an existing object
    async fn patch(
        &self,
        kind: ResourceKind,
        namespace: &str,
        name: &str,
        patch: Value,
    ) -> Result<()>;

    /// Delete an object; returns whether it existed
    async fn delete(&self, kind: ResourceKind, namespace: &str, name: &str) -> Result<bool>;
}

/// Deployment status reads for the readiness waiter
#[cfg_attr(test, automock)]
#[async_trait]
pub trait DeploymentReader: Send + Sync {
    /// Fetch a deployment; `None` when absent
    async fn get_deployment(&self, namespace: &str, name: &str) -> Result<Option<Deployment>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cluster_scoped_kinds() {
        assert!(!ResourceKind::ClusterRole.namespaced());
        assert!(!ResourceKind::ClusterRoleBinding.namespaced());
        assert!(ResourceKind::Deployment.namespaced());
    }

    #[test]
    fn api_resources_match_kinds() {
        let ar = ResourceKind::Deployment.api_resource();
        assert_eq!(ar.group, "apps");
        assert_eq!(ar.plural, "deployments");

        let ar = ResourceKind::ClusterRoleBinding.api_resource();
        assert_eq!(ar.group, "rbac.authorization.k8s.io");
        assert_eq!(ar.kind, ResourceKind::ClusterRoleBinding.as_str());
    }
}
