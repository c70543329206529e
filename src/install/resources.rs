//! Desired objects for the imperative installer, derived from resolved values.

use serde_json::{json, Value};

use crate::cluster::{ResourceKind, MANAGED_BY, MANAGED_BY_LABEL};
use crate::values::ResolvedValues;
use crate::{
    DEFAULT_CILIUM_VERSION, DEFAULT_UI_VERSION, PEER_SERVICE_NAME, RELAY_NAME, UI_NAME,
};

/// Secret with the agents' Hubble server certificate
pub const SERVER_CERTS_SECRET: &str = "hubble-server-certs";

/// Secret with the relay's client certificate
pub const RELAY_CLIENT_CERTS_SECRET: &str = "hubble-relay-client-certs";

/// Relay configuration map
pub const RELAY_CONFIG_NAME: &str = "hubble-relay-config";

/// UI nginx configuration map
pub const UI_NGINX_CONFIG_NAME: &str = "hubble-ui-nginx";

/// Agent configuration map
pub const AGENT_CONFIG_NAME: &str = "cilium-config";

/// Agent DaemonSet
pub const AGENT_DAEMONSET_NAME: &str = "cilium";

/// Relay gRPC port
pub const RELAY_PORT: u16 = 4245;

/// Hubble server port on each agent
pub const HUBBLE_SERVER_PORT: u16 = 4244;

/// UI frontend port
pub const UI_FRONTEND_PORT: u16 = 8081;

/// UI backend port
pub const UI_BACKEND_PORT: u16 = 8090;

const RELAY_TLS_DIR: &str = "/var/lib/hubble-relay/tls";
const AGENT_TLS_DIR: &str = "/var/lib/cilium/tls/hubble";

/// Defaults the imperative installer merges beneath every other source
pub fn defaults() -> Value {
    json!({
        "hubble": {
            "enabled": false,
            "listenAddress": format!(":{}", HUBBLE_SERVER_PORT),
            "peerService": {"servicePort": 443, "targetPort": HUBBLE_SERVER_PORT},
            "relay": {
                "enabled": false,
                "replicas": 1,
                "image": {
                    "repository": "quay.io/cilium/hubble-relay",
                    "tag": format!("v{}", DEFAULT_CILIUM_VERSION),
                    "override": ""
                }
            },
            "ui": {
                "enabled": false,
                "replicas": 1,
                "frontend": {"image": {
                    "repository": "quay.io/cilium/hubble-ui",
                    "tag": DEFAULT_UI_VERSION,
                    "override": ""
                }},
                "backend": {"image": {
                    "repository": "quay.io/cilium/hubble-ui-backend",
                    "tag": DEFAULT_UI_VERSION,
                    "override": ""
                }}
            }
        }
    })
}

/// Image reference at `prefix`: the override if set, else `repository:tag`
pub fn image(values: &ResolvedValues, prefix: &str) -> Option<String> {
    if let Some(image) = values.get_str(&format!("{}.override", prefix)) {
        return Some(image.to_string());
    }
    let repository = values.get_str(&format!("{}.repository", prefix))?;
    Some(match values.get_str(&format!("{}.tag", prefix)) {
        Some(tag) => format!("{}:{}", repository, tag),
        None => repository.to_string(),
    })
}

fn metadata(name: &str, namespace: Option<&str>, app: &str) -> Value {
    let mut meta = json!({
        "name": name,
        "labels": {
            "k8s-app": app,
            "app.kubernetes.io/name": app,
            "app.kubernetes.io/part-of": "cilium",
            MANAGED_BY_LABEL: MANAGED_BY
        }
    });
    if let Some(ns) = namespace {
        meta["namespace"] = json!(ns);
    }
    meta
}

/// A desired object with its kind
#[derive(Clone, Debug, PartialEq)]
pub struct Desired {
    /// Object kind
    pub kind: ResourceKind,
    /// Object name
    pub name: String,
    /// Full object
    pub object: Value,
}

impl Desired {
    fn new(kind: ResourceKind, object: Value) -> Self {
        let name = object["metadata"]["name"]
            .as_str()
            .unwrap_or_default()
            .to_string();
        Self { kind, name, object }
    }
}

fn service_account(name: &str, namespace: &str) -> Desired {
    Desired::new(
        ResourceKind::ServiceAccount,
        json!({
            "apiVersion": "v1",
            "kind": "ServiceAccount",
            "metadata": metadata(name, Some(namespace), name)
        }),
    )
}

fn replicas(values: &ResolvedValues, path: &str) -> i64 {
    values.get_i64(path).unwrap_or(1)
}

/// Relay objects in creation order
pub fn relay_objects(values: &ResolvedValues, namespace: &str) -> Vec<Desired> {
    let relay_image = image(values, "hubble.relay.image").unwrap_or_default();
    let peer_port = values.get_i64("hubble.peerService.servicePort").unwrap_or(443);

    let config = format!(
        "cluster-name: {cluster}\n\
         peer-service: \"{peer}.{ns}.svc.cluster.local:{peer_port}\"\n\
         listen-address: :{port}\n\
         tls-client-cert-file: {dir}/client.crt\n\
         tls-client-key-file: {dir}/client.key\n\
         tls-hubble-server-ca-files: {dir}/hubble-server-ca.crt\n\
         disable-server-tls: true\n",
        cluster = values.get_str("cluster.name").unwrap_or("default"),
        peer = PEER_SERVICE_NAME,
        ns = namespace,
        peer_port = peer_port,
        port = RELAY_PORT,
        dir = RELAY_TLS_DIR,
    );

    vec![
        service_account(RELAY_NAME, namespace),
        Desired::new(
            ResourceKind::ConfigMap,
            json!({
                "apiVersion": "v1",
                "kind": "ConfigMap",
                "metadata": metadata(RELAY_CONFIG_NAME, Some(namespace), RELAY_NAME),
                "data": {"config.yaml": config}
            }),
        ),
        Desired::new(
            ResourceKind::Service,
            json!({
                "apiVersion": "v1",
                "kind": "Service",
                "metadata": metadata(PEER_SERVICE_NAME, Some(namespace), "cilium"),
                "spec": {
                    "type": "ClusterIP",
                    "internalTrafficPolicy": "Local",
                    "selector": {"k8s-app": "cilium"},
                    "ports": [{
                        "name": "peer-service",
                        "port": peer_port,
                        "protocol": "TCP",
                        "targetPort": values.get_i64("hubble.peerService.targetPort")
                            .unwrap_or(i64::from(HUBBLE_SERVER_PORT))
                    }]
                }
            }),
        ),
        Desired::new(
            ResourceKind::Deployment,
            json!({
                "apiVersion": "apps/v1",
                "kind": "Deployment",
                "metadata": metadata(RELAY_NAME, Some(namespace), RELAY_NAME),
                "spec": {
                    "replicas": replicas(values, "hubble.relay.replicas"),
                    "selector": {"matchLabels": {"k8s-app": RELAY_NAME}},
                    "template": {
                        "metadata": {"labels": {"k8s-app": RELAY_NAME, "app.kubernetes.io/name": RELAY_NAME}},
                        "spec": {
                            "serviceAccountName": RELAY_NAME,
                            "automountServiceAccountToken": false,
                            "containers": [{
                                "name": RELAY_NAME,
                                "image": relay_image,
                                "imagePullPolicy": "IfNotPresent",
                                "command": ["hubble-relay"],
                                "args": ["serve"],
                                "ports": [{"name": "grpc", "containerPort": RELAY_PORT, "protocol": "TCP"}],
                                "readinessProbe": {"tcpSocket": {"port": "grpc"}},
                                "livenessProbe": {"tcpSocket": {"port": "grpc"}},
                                "volumeMounts": [
                                    {"name": "config", "mountPath": "/etc/hubble-relay", "readOnly": true},
                                    {"name": "tls", "mountPath": RELAY_TLS_DIR, "readOnly": true}
                                ]
                            }],
                            "volumes": [
                                {"name": "config", "configMap": {
                                    "name": RELAY_CONFIG_NAME,
                                    "items": [{"key": "config.yaml", "path": "config.yaml"}]
                                }},
                                {"name": "tls", "projected": {"sources": [{"secret": {
                                    "name": RELAY_CLIENT_CERTS_SECRET,
                                    "items": [
                                        {"key": "ca.crt", "path": "hubble-server-ca.crt"},
                                        {"key": "tls.crt", "path": "client.crt"},
                                        {"key": "tls.key", "path": "client.key"}
                                    ]
                                }}]}}
                            ]
                        }
                    }
                }
            }),
        ),
        Desired::new(
            ResourceKind::Service,
            json!({
                "apiVersion": "v1",
                "kind": "Service",
                "metadata": metadata(RELAY_NAME, Some(namespace), RELAY_NAME),
                "spec": {
                    "type": "ClusterIP",
                    "selector": {"k8s-app": RELAY_NAME},
                    "ports": [{"name": "grpc", "port": 80, "protocol": "TCP", "targetPort": "grpc"}]
                }
            }),
        ),
    ]
}

const NGINX_CONF: &str = r#"server {
    listen       8081;
    listen       [::]:8081;
    server_name  localhost;
    root /app;
    index index.html;
    client_max_body_size 1G;

    location / {
        proxy_set_header Host $host;
        proxy_set_header X-Real-IP $remote_addr;

        location /api {
            proxy_http_version 1.1;
            proxy_pass_request_headers on;
            proxy_pass http://127.0.0.1:8090;
        }
        location / {
            try_files $uri $uri/ /index.html /index.html;
        }
    }
}
"#;

/// UI objects in creation order
pub fn ui_objects(values: &ResolvedValues, namespace: &str) -> Vec<Desired> {
    let frontend = image(values, "hubble.ui.frontend.image").unwrap_or_default();
    let backend = image(values, "hubble.ui.backend.image").unwrap_or_default();
    let read = json!(["get", "list", "watch"]);

    vec![
        service_account(UI_NAME, namespace),
        Desired::new(
            ResourceKind::ClusterRole,
            json!({
                "apiVersion": "rbac.authorization.k8s.io/v1",
                "kind": "ClusterRole",
                "metadata": metadata(UI_NAME, None, UI_NAME),
                "rules": [
                    {"apiGroups": ["networking.k8s.io"], "resources": ["networkpolicies"], "verbs": read},
                    {"apiGroups": [""], "resources": ["componentstatuses", "endpoints", "namespaces", "nodes", "pods", "services"], "verbs": read},
                    {"apiGroups": ["apiextensions.k8s.io"], "resources": ["customresourcedefinitions"], "verbs": read},
                    {"apiGroups": ["cilium.io"], "resources": ["*"], "verbs": read}
                ]
            }),
        ),
        Desired::new(
            ResourceKind::ClusterRoleBinding,
            json!({
                "apiVersion": "rbac.authorization.k8s.io/v1",
                "kind": "ClusterRoleBinding",
                "metadata": metadata(UI_NAME, None, UI_NAME),
                "roleRef": {"apiGroup": "rbac.authorization.k8s.io", "kind": "ClusterRole", "name": UI_NAME},
                "subjects": [{"kind": "ServiceAccount", "name": UI_NAME, "namespace": namespace}]
            }),
        ),
        Desired::new(
            ResourceKind::ConfigMap,
            json!({
                "apiVersion": "v1",
                "kind": "ConfigMap",
                "metadata": metadata(UI_NGINX_CONFIG_NAME, Some(namespace), UI_NAME),
                "data": {"nginx.conf": NGINX_CONF}
            }),
        ),
        Desired::new(
            ResourceKind::Deployment,
            json!({
                "apiVersion": "apps/v1",
                "kind": "Deployment",
                "metadata": metadata(UI_NAME, Some(namespace), UI_NAME),
                "spec": {
                    "replicas": replicas(values, "hubble.ui.replicas"),
                    "selector": {"matchLabels": {"k8s-app": UI_NAME}},
                    "template": {
                        "metadata": {"labels": {"k8s-app": UI_NAME, "app.kubernetes.io/name": UI_NAME}},
                        "spec": {
                            "serviceAccountName": UI_NAME,
                            "containers": [
                                {
                                    "name": "frontend",
                                    "image": frontend,
                                    "imagePullPolicy": "IfNotPresent",
                                    "ports": [{"name": "http", "containerPort": UI_FRONTEND_PORT}],
                                    "volumeMounts": [
                                        {"name": "hubble-ui-nginx-conf", "mountPath": "/etc/nginx/conf.d/default.conf", "subPath": "nginx.conf"},
                                        {"name": "tmp-dir", "mountPath": "/tmp"}
                                    ]
                                },
                                {
                                    "name": "backend",
                                    "image": backend,
                                    "imagePullPolicy": "IfNotPresent",
                                    "env": [
                                        {"name": "EVENTS_SERVER_PORT", "value": UI_BACKEND_PORT.to_string()},
                                        {"name": "FLOWS_API_ADDR", "value": format!("{}:80", RELAY_NAME)}
                                    ],
                                    "ports": [{"name": "grpc", "containerPort": UI_BACKEND_PORT}]
                                }
                            ],
                            "volumes": [
                                {"name": "hubble-ui-nginx-conf", "configMap": {"name": UI_NGINX_CONFIG_NAME, "defaultMode": 420}},
                                {"name": "tmp-dir", "emptyDir": {}}
                            ]
                        }
                    }
                }
            }),
        ),
        Desired::new(
            ResourceKind::Service,
            json!({
                "apiVersion": "v1",
                "kind": "Service",
                "metadata": metadata(UI_NAME, Some(namespace), UI_NAME),
                "spec": {
                    "type": "ClusterIP",
                    "selector": {"k8s-app": UI_NAME},
                    "ports": [{"name": "http", "port": 80, "targetPort": UI_FRONTEND_PORT}]
                }
            }),
        ),
    ]
}

/// `cilium-config` entries that turn the agent's Hubble server on
pub fn agent_enable_patch(values: &ResolvedValues) -> Value {
    json!({"data": {
        "enable-hubble": "true",
        "hubble-listen-address": values.get_str("hubble.listenAddress")
            .map(str::to_string)
            .unwrap_or_else(|| format!(":{}", HUBBLE_SERVER_PORT)),
        "hubble-disable-tls": "false",
        "hubble-tls-cert-file": format!("{}/server.crt", AGENT_TLS_DIR),
        "hubble-tls-key-file": format!("{}/server.key", AGENT_TLS_DIR),
        "hubble-tls-client-ca-files": format!("{}/client-ca.crt", AGENT_TLS_DIR)
    }})
}

/// `cilium-config` entries that turn it off again
pub fn agent_disable_patch() -> Value {
    json!({"data": {
        "enable-hubble": "false",
        "hubble-listen-address": null,
        "hubble-disable-tls": null,
        "hubble-tls-cert-file": null,
        "hubble-tls-key-file": null,
        "hubble-tls-client-ca-files": null
    }})
}

/// Whether every field of `desired` is present with the same value in `live`.
/// Arrays must match element-wise; extra live fields are ignored.
pub fn is_subset(desired: &Value, live: &Value) -> bool {
    match (desired, live) {
        (Value::Object(d), Value::Object(l)) => d
            .iter()
            .all(|(k, v)| l.get(k).map(|lv| is_subset(v, lv)).unwrap_or(v.is_null())),
        (Value::Array(d), Value::Array(l)) => {
            d.len() == l.len() && d.iter().zip(l).all(|(dv, lv)| is_subset(dv, lv))
        }
        (Value::Number(d), Value::String(l)) | (Value::String(l), Value::Number(d)) => {
            d.to_string() == *l
        }
        (d, l) => d == l,
    }
}

/// JSON merge patch carrying only the desired fields that differ from
/// `live`. Fields only present on the live object (resource versions,
/// assigned cluster IPs) are left alone. `None` when nothing differs.
pub fn diff(desired: &Value, live: &Value) -> Option<Value> {
    match (desired, live) {
        (Value::Object(d), Value::Object(l)) => {
            let mut patch = serde_json::Map::new();
            for (key, want) in d {
                match l.get(key) {
                    Some(have) => {
                        if let Some(sub) = diff(want, have) {
                            patch.insert(key.clone(), sub);
                        }
                    }
                    None if want.is_null() => {}
                    None => {
                        patch.insert(key.clone(), want.clone());
                    }
                }
            }
            (!patch.is_empty()).then_some(Value::Object(patch))
        }
        (d, l) if is_subset(d, l) => None,
        (d, _) => Some(d.clone()),
    }
}
