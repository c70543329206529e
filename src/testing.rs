//! In-memory cluster used by scenario tests.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::Secret;
use serde_json::{json, Value};

use crate::cluster::{DeploymentReader, ResourceClient, ResourceKind, SecretClient};
use crate::tunnel::{Dialer, TunnelStream, TunnelTarget};
use crate::values::deep_merge;
use crate::{Error, Result};

type ObjectKey = (ResourceKind, String, String);

/// Stateful fake of every cluster seam
#[derive(Default)]
pub struct FakeCluster {
    objects: Mutex<BTreeMap<ObjectKey, Value>>,
    secrets: Mutex<BTreeMap<(String, String), Secret>>,
    ops: Mutex<Vec<String>>,
    fail_create: Mutex<Option<(ResourceKind, String)>>,
}

impl FakeCluster {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Cluster with the agent installed: `cilium-config` and the `cilium` DaemonSet
    pub fn with_agent(namespace: &str) -> Arc<Self> {
        let cluster = Self::new();
        cluster.insert(
            ResourceKind::ConfigMap,
            namespace,
            json!({
                "apiVersion": "v1",
                "kind": "ConfigMap",
                "metadata": {"name": "cilium-config", "namespace": namespace},
                "data": {"enable-hubble": "false", "cluster-name": "default"}
            }),
        );
        cluster.insert(
            ResourceKind::DaemonSet,
            namespace,
            json!({
                "apiVersion": "apps/v1",
                "kind": "DaemonSet",
                "metadata": {"name": "cilium", "namespace": namespace},
                "spec": {"template": {"metadata": {"annotations": {}}}}
            }),
        );
        cluster
    }

    fn key(kind: ResourceKind, namespace: &str, name: &str) -> ObjectKey {
        let namespace = if kind.namespaced() { namespace } else { "" };
        (kind, namespace.to_string(), name.to_string())
    }

    fn log(&self, op: String) {
        self.ops.lock().unwrap().push(op);
    }

    /// Insert an object directly, bypassing create semantics
    pub fn insert(&self, kind: ResourceKind, namespace: &str, object: Value) {
        let name = object["metadata"]["name"].as_str().unwrap_or_default().to_string();
        self.objects
            .lock()
            .unwrap()
            .insert(Self::key(kind, namespace, &name), object);
    }

    /// Read an object
    pub fn object(&self, kind: ResourceKind, namespace: &str, name: &str) -> Option<Value> {
        self.objects
            .lock()
            .unwrap()
            .get(&Self::key(kind, namespace, name))
            .cloned()
    }

    /// Names of all objects of `kind`
    pub fn names(&self, kind: ResourceKind) -> Vec<String> {
        self.objects
            .lock()
            .unwrap()
            .keys()
            .filter(|(k, _, _)| *k == kind)
            .map(|(_, _, name)| name.clone())
            .collect()
    }

    /// Read a secret
    pub fn secret(&self, namespace: &str, name: &str) -> Option<Secret> {
        self.secrets
            .lock()
            .unwrap()
            .get(&(namespace.to_string(), name.to_string()))
            .cloned()
    }

    /// Names of all secrets in `namespace`
    pub fn secret_names(&self, namespace: &str) -> Vec<String> {
        self.secrets
            .lock()
            .unwrap()
            .keys()
            .filter(|(ns, _)| ns == namespace)
            .map(|(_, name)| name.clone())
            .collect()
    }

    /// Mutations in the order they happened
    pub fn ops(&self) -> Vec<String> {
        self.ops.lock().unwrap().clone()
    }

    /// Make creates of this object fail
    pub fn fail_create_of(&self, kind: ResourceKind, name: &str) {
        *self.fail_create.lock().unwrap() = Some((kind, name.to_string()));
    }

    /// Mark a deployment fully rolled out
    pub fn mark_ready(&self, namespace: &str, name: &str) {
        self.set_deployment_status(
            namespace,
            name,
            json!({
                "observedGeneration": 1,
                "replicas": 1,
                "updatedReplicas": 1,
                "readyReplicas": 1,
                "availableReplicas": 1
            }),
        );
    }

    /// Replace a deployment's status
    pub fn set_deployment_status(&self, namespace: &str, name: &str, status: Value) {
        let mut objects = self.objects.lock().unwrap();
        if let Some(obj) = objects.get_mut(&Self::key(ResourceKind::Deployment, namespace, name)) {
            obj["metadata"]["generation"] = json!(1);
            obj["status"] = status;
        }
    }
}

#[async_trait]
impl SecretClient for FakeCluster {
    async fn get_secret(&self, namespace: &str, name: &str) -> Result<Option<Secret>> {
        Ok(self.secret(namespace, name))
    }

    async fn put_secret(&self, namespace: &str, secret: Secret) -> Result<()> {
        let name = secret.metadata.name.clone().unwrap_or_default();
        self.log(format!("put secret/{}", name));
        self.secrets
            .lock()
            .unwrap()
            .insert((namespace.to_string(), name), secret);
        Ok(())
    }

    async fn delete_secret(&self, namespace: &str, name: &str) -> Result<bool> {
        self.log(format!("delete secret/{}", name));
        Ok(self
            .secrets
            .lock()
            .unwrap()
            .remove(&(namespace.to_string(), name.to_string()))
            .is_some())
    }

    async fn find_secret(&self, name: &str) -> Result<Vec<String>> {
        Ok(self
            .secrets
            .lock()
            .unwrap()
            .keys()
            .filter(|(_, n)| n == name)
            .map(|(ns, _)| ns.clone())
            .collect())
    }
}

#[async_trait]
impl ResourceClient for FakeCluster {
    async fn get(&self, kind: ResourceKind, namespace: &str, name: &str) -> Result<Option<Value>> {
        Ok(self.object(kind, namespace, name))
    }

    async fn create(&self, kind: ResourceKind, namespace: &str, object: Value) -> Result<()> {
        let name = object["metadata"]["name"].as_str().unwrap_or_default().to_string();
        if self.fail_create.lock().unwrap().as_ref() == Some(&(kind, name.clone())) {
            return Err(Error::install(format!("admission webhook denied {}/{}", kind, name)));
        }
        let key = Self::key(kind, namespace, &name);
        let mut objects = self.objects.lock().unwrap();
        if objects.contains_key(&key) {
            return Err(Error::install(format!("{} {} already exists", kind, name)));
        }
        let mut object = object;
        object["metadata"]["resourceVersion"] = json!("1");
        if kind == ResourceKind::Service {
            object["spec"]["clusterIP"] = json!("10.96.0.42");
        }
        objects.insert(key, object);
        drop(objects);
        self.log(format!("create {}/{}", kind, name));
        Ok(())
    }

    async fn patch(
        &self,
        kind: ResourceKind,
        namespace: &str,
        name: &str,
        patch: Value,
    ) -> Result<()> {
        let mut objects = self.objects.lock().unwrap();
        let obj = objects
            .get_mut(&Self::key(kind, namespace, name))
            .ok_or_else(|| Error::not_found(format!("{} {}", kind, name)))?;
        deep_merge(obj, patch);
        drop(objects);
        self.log(format!("patch {}/{}", kind, name));
        Ok(())
    }

    async fn delete(&self, kind: ResourceKind, namespace: &str, name: &str) -> Result<bool> {
        let existed = self
            .objects
            .lock()
            .unwrap()
            .remove(&Self::key(kind, namespace, name))
            .is_some();
        if existed {
            self.log(format!("delete {}/{}", kind, name));
        }
        Ok(existed)
    }
}

#[async_trait]
impl DeploymentReader for FakeCluster {
    async fn get_deployment(&self, namespace: &str, name: &str) -> Result<Option<Deployment>> {
        self.object(ResourceKind::Deployment, namespace, name)
            .map(|v| {
                serde_json::from_value(v)
                    .map_err(|e| Error::install(format!("bad deployment: {}", e)))
            })
            .transpose()
    }
}

/// Dials only services that exist; the stream is an in-memory pipe
#[async_trait]
impl Dialer for FakeCluster {
    async fn dial(&self, target: &TunnelTarget) -> Result<TunnelStream> {
        if self
            .object(ResourceKind::Service, &target.namespace, &target.service)
            .is_none()
        {
            return Err(Error::tunnel(format!("service {} not found", target)));
        }
        self.log(format!("dial {}", target));
        let (client, _server) = tokio::io::duplex(64);
        Ok(Box::new(client))
    }
}
