//! Certificate authority management for relay mTLS.
//!
//! The CA is looked up in this order:
//! 1. the `cilium-ca` secret in the installation namespace
//! 2. `tls.ca.cert` / `tls.ca.key` in previously persisted values
//! 3. a freshly generated CA, when `--create-ca` is set
//!
//! An existing CA is never replaced. Getting a new one takes a disable
//! followed by an enable.

use std::collections::BTreeMap;
use std::sync::Arc;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use k8s_openapi::api::core::v1::Secret;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use k8s_openapi::ByteString;
use serde_json::Value;
use tracing::{debug, info};

use crate::cluster::{SecretClient, MANAGED_BY, MANAGED_BY_LABEL};
use crate::params::Parameters;
use crate::pki::{CertificateAuthority, LeafCertificate, LeafUsage};
use crate::values::ResolvedValues;
use crate::{Error, Result};

/// Secret holding the CA
pub const CA_SECRET_NAME: &str = "cilium-ca";

/// Common name of generated CAs
pub const CA_COMMON_NAME: &str = "Cilium CA";

/// Name the agents' Hubble server presents
pub const SERVER_NAME: &str = "*.default.hubble-grpc.cilium.io";

/// Name the relay presents as a client
pub const RELAY_CLIENT_NAME: &str = "*.hubble-relay.cilium.io";

/// Where the CA came from
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CaOrigin {
    /// The `cilium-ca` secret
    Secret,
    /// Previously persisted values
    PersistedValues,
    /// Generated by this invocation
    Generated,
}

/// A loaded or generated CA. `Debug` output carries no key material.
#[derive(Clone, Debug)]
pub struct CaState {
    /// The authority
    pub ca: CertificateAuthority,
    /// Where it came from
    pub origin: CaOrigin,
}

impl CaState {
    /// Certificate for the agents' Hubble server
    pub fn server_certificate(&self) -> Result<LeafCertificate> {
        Ok(self.ca.issue(SERVER_NAME, &[SERVER_NAME], LeafUsage::Server)?)
    }

    /// Client certificate for the relay
    pub fn relay_client_certificate(&self) -> Result<LeafCertificate> {
        Ok(self
            .ca
            .issue(RELAY_CLIENT_NAME, &[RELAY_CLIENT_NAME], LeafUsage::Client)?)
    }

    /// Write the CA into `tls.ca` as base64 PEM, the chart's layout
    pub fn fold_into(&self, values: &mut ResolvedValues) {
        values.set(
            "tls.ca.cert",
            Value::String(STANDARD.encode(self.ca.ca_cert_pem())),
        );
        values.set(
            "tls.ca.key",
            Value::String(STANDARD.encode(self.ca.ca_key_pem())),
        );
    }
}

fn decode_values_pem(values: &ResolvedValues, path: &str) -> Result<Option<String>> {
    let Some(encoded) = values.get_str(path) else {
        return Ok(None);
    };
    let bytes = STANDARD
        .decode(encoded.trim())
        .map_err(|e| Error::certificate(format!("{} is not valid base64: {}", path, e)))?;
    String::from_utf8(bytes)
        .map(Some)
        .map_err(|_| Error::certificate(format!("{} is not UTF-8 PEM", path)))
}

fn secret_text(secret: &Secret, key: &str) -> Option<String> {
    secret
        .data
        .as_ref()?
        .get(key)
        .and_then(|b| String::from_utf8(b.0.clone()).ok())
}

/// Loads, generates and persists the CA
pub struct CaManager {
    secrets: Arc<dyn SecretClient>,
    persist_secret: bool,
}

impl CaManager {
    /// Manager that stores generated CAs in the `cilium-ca` secret
    pub fn new(secrets: Arc<dyn SecretClient>) -> Self {
        Self {
            secrets,
            persist_secret: true,
        }
    }

    /// Manager that leaves persistence to the values store (Helm owns the secret)
    pub fn without_secret_persistence(secrets: Arc<dyn SecretClient>) -> Self {
        Self {
            secrets,
            persist_secret: false,
        }
    }

    /// Load the CA from `cilium-ca`, if present
    pub async fn load_secret(&self, namespace: &str) -> Result<Option<CertificateAuthority>> {
        let Some(secret) = self.secrets.get_secret(namespace, CA_SECRET_NAME).await? else {
            return Ok(None);
        };
        let (Some(cert), Some(key)) = (
            secret_text(&secret, "ca.crt"),
            secret_text(&secret, "ca.key"),
        ) else {
            return Err(Error::certificate(format!(
                "secret {}/{} lacks ca.crt or ca.key",
                namespace, CA_SECRET_NAME
            )));
        };
        CertificateAuthority::from_pem(&cert, &key)
            .map(Some)
            .map_err(|e| {
                Error::certificate(format!(
                    "unable to parse CA in secret {}/{}: {}",
                    namespace, CA_SECRET_NAME, e
                ))
            })
    }

    fn load_values(prior: &ResolvedValues) -> Result<Option<CertificateAuthority>> {
        match (
            decode_values_pem(prior, "tls.ca.cert")?,
            decode_values_pem(prior, "tls.ca.key")?,
        ) {
            (Some(cert), Some(key)) => CertificateAuthority::from_pem(&cert, &key)
                .map(Some)
                .map_err(|e| {
                    Error::certificate(format!("unable to parse CA in persisted values: {}", e))
                }),
            _ => Ok(None),
        }
    }

    /// Return the existing CA or create one if allowed
    pub async fn ensure(
        &self,
        params: &Parameters,
        prior: Option<&ResolvedValues>,
    ) -> Result<CaState> {
        let namespace = &params.namespace;

        if let Some(ca) = self.load_secret(namespace).await? {
            debug!(namespace = %namespace, "Using CA from secret {}", CA_SECRET_NAME);
            return Ok(CaState {
                ca,
                origin: CaOrigin::Secret,
            });
        }

        if let Some(ca) = prior.map(Self::load_values).transpose()?.flatten() {
            debug!(namespace = %namespace, "Using CA from persisted values");
            return Ok(CaState {
                ca,
                origin: CaOrigin::PersistedValues,
            });
        }

        if !params.create_ca {
            return Err(Error::certificate(format!(
                "no CA found in {}/{} and CA creation is disabled (--create-ca=false)",
                namespace, CA_SECRET_NAME
            )));
        }

        let ca = CertificateAuthority::new(CA_COMMON_NAME)?;
        info!(namespace = %namespace, "Generated new CA");
        if self.persist_secret {
            self.secrets
                .put_secret(namespace, ca_secret(&ca, namespace))
                .await?;
            info!(namespace = %namespace, secret = CA_SECRET_NAME, "Stored CA");
        }
        Ok(CaState {
            ca,
            origin: CaOrigin::Generated,
        })
    }

    /// Delete `cilium-ca` if this tool created it. A CA installed by someone
    /// else is left alone.
    pub async fn remove_owned(&self, namespace: &str) -> Result<()> {
        let Some(secret) = self.secrets.get_secret(namespace, CA_SECRET_NAME).await? else {
            return Ok(());
        };
        let owned = secret
            .metadata
            .labels
            .as_ref()
            .and_then(|l| l.get(MANAGED_BY_LABEL))
            .map(|v| v == MANAGED_BY)
            .unwrap_or(false);
        if owned {
            self.secrets.delete_secret(namespace, CA_SECRET_NAME).await?;
            info!(namespace = %namespace, "Deleted CA secret");
        }
        Ok(())
    }
}

/// The `cilium-ca` secret for `ca`
pub fn ca_secret(ca: &CertificateAuthority, namespace: &str) -> Secret {
    Secret {
        metadata: ObjectMeta {
            name: Some(CA_SECRET_NAME.to_string()),
            namespace: Some(namespace.to_string()),
            labels: Some(BTreeMap::from([(
                MANAGED_BY_LABEL.to_string(),
                MANAGED_BY.to_string(),
            )])),
            ..Default::default()
        },
        data: Some(BTreeMap::from([
            (
                "ca.crt".to_string(),
                ByteString(ca.ca_cert_pem().as_bytes().to_vec()),
            ),
            (
                "ca.key".to_string(),
                ByteString(ca.ca_key_pem().as_bytes().to_vec()),
            ),
        ])),
        type_: Some("Opaque".to_string()),
        ..Default::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::MockSecretClient;
    use crate::pki::CertificateInfo;
    use crate::testing::FakeCluster;

    fn params(create_ca: bool) -> Parameters {
        Parameters {
            create_ca,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn story_ca_is_created_once_and_reused() {
        let cluster = FakeCluster::new();
        let manager = CaManager::new(cluster.clone());

        let first = manager.ensure(&params(true), None).await.unwrap();
        assert_eq!(first.origin, CaOrigin::Generated);
        assert!(cluster.secret("kube-system", CA_SECRET_NAME).is_some());

        let second = manager.ensure(&params(true), None).await.unwrap();
        assert_eq!(second.origin, CaOrigin::Secret);
        assert_eq!(second.ca, first.ca);
    }

    #[tokio::test]
    async fn persisted_values_supply_the_ca_without_a_secret() {
        let cluster = FakeCluster::new();
        let manager = CaManager::without_secret_persistence(cluster.clone());

        let generated = manager.ensure(&params(true), None).await.unwrap();
        assert!(cluster.secret("kube-system", CA_SECRET_NAME).is_none());

        let mut values = ResolvedValues::default();
        generated.fold_into(&mut values);

        let reloaded = manager.ensure(&params(false), Some(&values)).await.unwrap();
        assert_eq!(reloaded.origin, CaOrigin::PersistedValues);
        assert_eq!(reloaded.ca, generated.ca);
    }

    #[tokio::test]
    async fn missing_ca_without_creation_is_an_error() {
        let cluster = FakeCluster::new();
        let err = CaManager::new(cluster)
            .ensure(&params(false), None)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Certificate(_)));
        assert!(err.to_string().contains("--create-ca=false"));
    }

    #[tokio::test]
    async fn corrupted_secret_is_a_certificate_error() {
        let mut secrets = MockSecretClient::new();
        secrets.expect_get_secret().returning(|_, _| {
            Ok(Some(Secret {
                data: Some(BTreeMap::from([
                    ("ca.crt".to_string(), ByteString(b"garbage".to_vec())),
                    ("ca.key".to_string(), ByteString(b"garbage".to_vec())),
                ])),
                ..Default::default()
            }))
        });
        secrets.expect_put_secret().never();

        let err = CaManager::new(Arc::new(secrets))
            .ensure(&params(true), None)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Certificate(_)));
    }

    #[tokio::test]
    async fn invalid_persisted_values_are_rejected() {
        let cluster = FakeCluster::new();
        let mut values = ResolvedValues::default();
        values.set("tls.ca.cert", Value::String("%%%".into()));
        values.set("tls.ca.key", Value::String("%%%".into()));

        let err = CaManager::new(cluster)
            .ensure(&params(true), Some(&values))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("base64"));
    }

    #[tokio::test]
    async fn leaf_certificates_are_signed_by_the_ca() {
        let state = CaManager::new(FakeCluster::new())
            .ensure(&params(true), None)
            .await
            .unwrap();

        let server = state.server_certificate().unwrap();
        assert!(state.ca.verifies(&server.cert_pem).unwrap());
        assert_eq!(
            CertificateInfo::from_pem(&server.cert_pem).unwrap().dns_names,
            vec![SERVER_NAME]
        );

        let client = state.relay_client_certificate().unwrap();
        assert!(state.ca.verifies(&client.cert_pem).unwrap());
        assert_eq!(
            CertificateInfo::from_pem(&client.cert_pem).unwrap().common_name,
            RELAY_CLIENT_NAME
        );
    }

    #[tokio::test]
    async fn only_owned_ca_secrets_are_removed() {
        let cluster = FakeCluster::new();
        let manager = CaManager::new(cluster.clone());
        manager.ensure(&params(true), None).await.unwrap();
        manager.remove_owned("kube-system").await.unwrap();
        assert!(cluster.secret("kube-system", CA_SECRET_NAME).is_none());

        // A CA installed with the agent carries no managed-by label
        let foreign = CertificateAuthority::new("Agent CA").unwrap();
        let mut secret = ca_secret(&foreign, "kube-system");
        secret.metadata.labels = None;
        cluster.put_secret("kube-system", secret).await.unwrap();

        manager.remove_owned("kube-system").await.unwrap();
        assert!(cluster.secret("kube-system", CA_SECRET_NAME).is_some());
    }

    #[test]
    fn debug_output_is_redacted() {
        let state = CaState {
            ca: CertificateAuthority::new(CA_COMMON_NAME).unwrap(),
            origin: CaOrigin::Generated,
        };
        let debug = format!("{:?}", state);
        assert!(!debug.contains("BEGIN"));
        assert!(debug.contains("Generated"));
    }
}
