use async_trait::async_trait;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{Pod, Secret, Service};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::api::{DeleteParams, DynamicObject, ListParams, Patch, PatchParams, PostParams};
use kube::{Api, Client};
use serde_json::Value;
use tracing::debug;

use super::{DeploymentReader, ResourceClient, ResourceKind, SecretClient};
use crate::tunnel::{Dialer, TunnelStream, TunnelTarget};
use crate::{Error, Result};

/// All cluster seams backed by a live kube client
#[derive(Clone)]
pub struct KubeCluster {
    client: Client,
}

impl KubeCluster {
    /// Wrap a kube client
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn dynamic_api(&self, kind: ResourceKind, namespace: &str) -> Api<DynamicObject> {
        let ar = kind.api_resource();
        if kind.namespaced() {
            Api::namespaced_with(self.client.clone(), namespace, &ar)
        } else {
            Api::all_with(self.client.clone(), &ar)
        }
    }
}

/// Map a 404 from a delete call to `Ok(false)`
fn deleted<T>(result: std::result::Result<T, kube::Error>) -> Result<bool> {
    match result {
        Ok(_) => Ok(true),
        Err(kube::Error::Api(e)) if e.code == 404 => Ok(false),
        Err(e) => Err(e.into()),
    }
}

#[async_trait]
impl SecretClient for KubeCluster {
    async fn get_secret(&self, namespace: &str, name: &str) -> Result<Option<Secret>> {
        let api: Api<Secret> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.get_opt(name).await?)
    }

    async fn put_secret(&self, namespace: &str, mut secret: Secret) -> Result<()> {
        let api: Api<Secret> = Api::namespaced(self.client.clone(), namespace);
        let name = secret
            .metadata
            .name
            .clone()
            .ok_or_else(|| Error::install("secret has no name"))?;
        secret.metadata.resource_version = None;

        match api.create(&PostParams::default(), &secret).await {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(e)) if e.code == 409 => {
                debug!(secret = %name, namespace = %namespace, "Secret exists, replacing");
                api.replace(&name, &PostParams::default(), &secret).await?;
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn delete_secret(&self, namespace: &str, name: &str) -> Result<bool> {
        let api: Api<Secret> = Api::namespaced(self.client.clone(), namespace);
        deleted(api.delete(name, &DeleteParams::default()).await)
    }

    async fn find_secret(&self, name: &str) -> Result<Vec<String>> {
        let api: Api<Secret> = Api::all(self.client.clone());
        let list = api
            .list_metadata(&ListParams::default().fields(&format!("metadata.name={}", name)))
            .await?;
        let mut namespaces: Vec<String> = list
            .items
            .into_iter()
            .filter_map(|s| s.metadata.namespace)
            .collect();
        namespaces.sort();
        Ok(namespaces)
    }
}

#[async_trait]
impl ResourceClient for KubeCluster {
    async fn get(&self, kind: ResourceKind, namespace: &str, name: &str) -> Result<Option<Value>> {
        let obj = self.dynamic_api(kind, namespace).get_opt(name).await?;
        obj.map(|o| {
            serde_json::to_value(o)
                .map_err(|e| Error::install(format!("failed to serialize {}: {}", kind, e)))
        })
        .transpose()
    }

    async fn create(&self, kind: ResourceKind, namespace: &str, object: Value) -> Result<()> {
        let obj: DynamicObject = serde_json::from_value(object)
            .map_err(|e| Error::install(format!("invalid {} object: {}", kind, e)))?;
        self.dynamic_api(kind, namespace)
            .create(&PostParams::default(), &obj)
            .await?;
        Ok(())
    }

    async fn patch(
        &self,
        kind: ResourceKind,
        namespace: &str,
        name: &str,
        patch: Value,
    ) -> Result<()> {
        self.dynamic_api(kind, namespace)
            .patch(name, &PatchParams::default(), &Patch::Merge(&patch))
            .await?;
        Ok(())
    }

    async fn delete(&self, kind: ResourceKind, namespace: &str, name: &str) -> Result<bool> {
        deleted(
            self.dynamic_api(kind, namespace)
                .delete(name, &DeleteParams::background())
                .await,
        )
    }
}

#[async_trait]
impl DeploymentReader for KubeCluster {
    async fn get_deployment(&self, namespace: &str, name: &str) -> Result<Option<Deployment>> {
        let api: Api<Deployment> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.get_opt(name).await?)
    }
}

fn pod_is_ready(pod: &Pod) -> bool {
    let Some(status) = &pod.status else {
        return false;
    };
    status.phase.as_deref() == Some("Running")
        && status
            .conditions
            .as_ref()
            .map(|c| c.iter().any(|c| c.type_ == "Ready" && c.status == "True"))
            .unwrap_or(false)
}

/// Resolve a service target port to the container port of `pod`
fn container_port(pod: &Pod, target_port: &IntOrString) -> Option<u16> {
    match target_port {
        IntOrString::Int(port) => u16::try_from(*port).ok(),
        IntOrString::String(name) => pod
            .spec
            .as_ref()?
            .containers
            .iter()
            .flat_map(|c| c.ports.iter().flatten())
            .find(|p| p.name.as_deref() == Some(name.as_str()))
            .and_then(|p| u16::try_from(p.container_port).ok()),
    }
}

#[async_trait]
impl Dialer for KubeCluster {
    async fn dial(&self, target: &TunnelTarget) -> Result<TunnelStream> {
        let services: Api<Service> = Api::namespaced(self.client.clone(), &target.namespace);
        let service = services
            .get_opt(&target.service)
            .await?
            .ok_or_else(|| Error::tunnel(format!("service {} not found", target.service)))?;
        let spec = service
            .spec
            .ok_or_else(|| Error::tunnel(format!("service {} has no spec", target.service)))?;

        let selector = spec.selector.unwrap_or_default();
        if selector.is_empty() {
            return Err(Error::tunnel(format!(
                "service {} has no pod selector",
                target.service
            )));
        }
        let target_port = spec
            .ports
            .unwrap_or_default()
            .into_iter()
            .find(|p| p.port == i32::from(target.port))
            .map(|p| p.target_port.unwrap_or(IntOrString::Int(p.port)))
            .ok_or_else(|| {
                Error::tunnel(format!(
                    "service {} does not expose port {}",
                    target.service, target.port
                ))
            })?;

        let labels = selector
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect::<Vec<_>>()
            .join(",");
        let pods: Api<Pod> = Api::namespaced(self.client.clone(), &target.namespace);
        let pod = pods
            .list(&ListParams::default().labels(&labels))
            .await?
            .items
            .into_iter()
            .find(pod_is_ready)
            .ok_or_else(|| {
                Error::tunnel(format!("no ready pod backs service {}", target.service))
            })?;
        let pod_name = pod
            .metadata
            .name
            .clone()
            .ok_or_else(|| Error::tunnel("selected pod has no name"))?;
        let port = container_port(&pod, &target_port).ok_or_else(|| {
            Error::tunnel(format!(
                "cannot resolve target port {:?} on pod {}",
                target_port, pod_name
            ))
        })?;

        debug!(pod = %pod_name, port = port, service = %target.service, "Opening port-forward stream");
        let mut forwarder = pods.portforward(&pod_name, &[port]).await?;
        let stream = forwarder
            .take_stream(port)
            .ok_or_else(|| Error::tunnel(format!("no stream for port {}", port)))?;

        // The forwarder task ends once the stream is closed
        tokio::spawn(async move {
            if let Err(e) = forwarder.join().await {
                debug!(error = %e, "Port-forward connection closed with error");
            }
        });

        Ok(Box::new(stream))
    }
}
