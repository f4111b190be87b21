//! The secret pipeline
//!
//! Runs once per reconcile pass, before any chart deployment. Each step is
//! idempotent and individually retryable: it re-checks existing state, does
//! nothing when the secret is already present and valid, and records every
//! payload it touches in the pass-scoped [`SecretsCache`]. The control-plane
//! API is the durable store; the cache only feeds dependency checks and
//! template values within a single pass.

pub mod bucket;
pub mod pki;

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::Secret;
use k8s_openapi::ByteString;
use kube::api::{Api, DeleteParams, PostParams};
use kube::Client;
use rand::rngs::OsRng;
use rand::RngCore;
use tracing::{info, warn};

use crate::catalog::{ChartCatalog, SecretDescriptor, SecretKind};
use crate::command::CommandRunner;
use crate::version::ClusterVersion;
use crate::{Error, Result, CLOUD_API_URL_ENV, CLUSTER_FINALIZER, SHARED_SECRETS_NAMESPACE};

use bucket::ObjectStore;

/// Key/value payload of one secret
pub type SecretData = BTreeMap<String, Vec<u8>>;

/// Object-storage credential secret, shared source and tenant copy
pub const OBJECT_STORAGE_SECRET: &str = "object-storage";
/// Cloud API credential secret; carries the tenant finalizer
pub const CLOUD_CREDENTIALS_SECRET: &str = "cloud-credentials";
/// Registry pull credential secret propagated from the shared namespace
pub const REGISTRY_PULL_SECRET: &str = "registry-pull-secret";
/// Shared CA bundle secret; carries the tenant finalizer
pub const CLUSTER_CA_SECRET: &str = "cluster-ca";
/// Node-watcher bootstrap token secret
pub const WATCHER_TOKEN_SECRET: &str = "node-watcher-token";
/// Key under which the backup bucket name is recorded
pub const BUCKET_KEY: &str = "bucket";

/// Pass-scoped mapping from secret name to payload.
///
/// Populated as secrets are generated, copied, or found; consulted by the
/// pre-flight dependency check and when building chart values. Never
/// persisted beyond the pass.
#[derive(Debug, Default)]
pub struct SecretsCache {
    inner: BTreeMap<String, SecretData>,
}

impl SecretsCache {
    /// Empty cache for a fresh pass
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a secret's payload
    pub fn insert(&mut self, name: impl Into<String>, data: SecretData) {
        self.inner.insert(name.into(), data);
    }

    /// Payload of a cached secret
    pub fn get(&self, name: &str) -> Option<&SecretData> {
        self.inner.get(name)
    }

    /// Whether a secret was seen this pass
    pub fn contains(&self, name: &str) -> bool {
        self.inner.contains_key(name)
    }
}

/// Hex-encode bytes (lowercase, two digits per byte)
pub(crate) fn hex_encode(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

pub(crate) fn to_byte_map(data: &SecretData) -> BTreeMap<String, ByteString> {
    data.iter()
        .map(|(k, v)| (k.clone(), ByteString(v.clone())))
        .collect()
}

pub(crate) fn secret_payload(secret: &Secret) -> SecretData {
    secret
        .data
        .as_ref()
        .map(|d| d.iter().map(|(k, v)| (k.clone(), v.0.clone())).collect())
        .unwrap_or_default()
}

/// Write parameters for [`create_secret`]
#[derive(Clone, Copy, Debug)]
pub struct SecretWrite<'a> {
    /// Target namespace
    pub namespace: &'a str,
    /// Secret name
    pub name: &'a str,
    /// Secret type
    pub kind: SecretKind,
    /// Replace an existing secret instead of leaving it untouched
    pub overwrite: bool,
    /// Finalizer to attach at creation time, if any
    pub finalizer: Option<&'a str>,
}

/// Create a secret, honoring the create-if-absent / replace-on-overwrite
/// contract every pipeline step relies on for idempotence.
pub async fn create_secret(client: &Client, write: SecretWrite<'_>, data: &SecretData) -> Result<()> {
    let api: Api<Secret> = Api::namespaced(client.clone(), write.namespace);

    if api.get_opt(write.name).await?.is_some() {
        if !write.overwrite {
            info!(
                namespace = %write.namespace,
                secret = %write.name,
                "not writing a secret which already exists"
            );
            return Ok(());
        }
        info!(
            namespace = %write.namespace,
            secret = %write.name,
            "replacing existing secret"
        );
        api.delete(write.name, &DeleteParams::default()).await?;
    }

    let mut secret = Secret {
        data: Some(to_byte_map(data)),
        type_: Some(write.kind.k8s_type().to_string()),
        ..Default::default()
    };
    secret.metadata.name = Some(write.name.to_string());
    secret.metadata.namespace = Some(write.namespace.to_string());
    if let Some(finalizer) = write.finalizer {
        secret.metadata.finalizers = Some(vec![finalizer.to_string()]);
    }

    api.create(&PostParams::default(), &secret).await?;
    Ok(())
}

/// Fetch a secret's payload, `None` if absent
pub async fn get_secret_data(client: &Client, namespace: &str, name: &str) -> Result<Option<SecretData>> {
    let api: Api<Secret> = Api::namespaced(client.clone(), namespace);
    Ok(api.get_opt(name).await?.map(|s| secret_payload(&s)))
}

/// Fetch a secret and, when present, record its payload in the cache.
pub async fn check_secret(
    client: &Client,
    namespace: &str,
    name: &str,
    cache: &mut SecretsCache,
) -> Result<bool> {
    match get_secret_data(client, namespace, name).await? {
        Some(data) => {
            cache.insert(name, data);
            Ok(true)
        }
        None => Ok(false),
    }
}

/// Whether a payload carries every required data key with non-empty content
pub fn validate_format(data: &SecretData, required: &[String]) -> bool {
    required
        .iter()
        .all(|key| data.get(key).is_some_and(|v| !v.is_empty()))
}

/// Propagate one secret from the shared namespace into the tenant namespace.
///
/// An existing tenant copy that satisfies its required format is left
/// untouched; an invalid copy is deleted and recreated from the shared
/// source; an absent copy is created. The payload lands in the cache either
/// way.
pub async fn propagate_secret(
    client: &Client,
    descriptor: &SecretDescriptor,
    tenant_namespace: &str,
    required_format: Option<&[String]>,
    cache: &mut SecretsCache,
) -> Result<()> {
    let name = descriptor.name.as_str();

    if let Some(existing) = get_secret_data(client, tenant_namespace, name).await? {
        let valid = required_format.map_or(true, |req| validate_format(&existing, req));
        if valid {
            info!(namespace = %tenant_namespace, secret = %name, "already has valid secret");
            cache.insert(name, existing);
            return Ok(());
        }
        warn!(
            namespace = %tenant_namespace,
            secret = %name,
            "secret fails required format, recreating from shared source"
        );
    }

    let shared = get_secret_data(client, SHARED_SECRETS_NAMESPACE, name)
        .await?
        .ok_or_else(|| {
            Error::secret_data(name, format!("missing from {SHARED_SECRETS_NAMESPACE}"))
        })?;

    create_secret(
        client,
        SecretWrite {
            namespace: tenant_namespace,
            name,
            kind: descriptor.kind,
            overwrite: true,
            finalizer: descriptor.finalize.then_some(CLUSTER_FINALIZER),
        },
        &shared,
    )
    .await?;
    cache.insert(name, shared);
    Ok(())
}

/// Inputs shared by every pipeline step
#[derive(Clone, Copy, Debug)]
pub struct PipelineParams<'a> {
    /// Tenant cluster name
    pub cluster_name: &'a str,
    /// Per-tenant namespace on the management cluster
    pub namespace: &'a str,
    /// Externally reachable API server hostname
    pub endpoint_host: &'a str,
    /// Resolved target version
    pub version: &'a ClusterVersion,
    /// Pod network range for the join-authority configuration
    pub pod_cidr: &'a str,
    /// Service network range for the join-authority configuration
    pub service_cidr: &'a str,
}

/// Run the full secret pipeline for one tenant, returning the pass cache.
pub async fn reconcile_secrets(
    client: &Client,
    runner: &dyn CommandRunner,
    store: &dyn ObjectStore,
    catalog: &ChartCatalog,
    params: &PipelineParams<'_>,
) -> Result<SecretsCache> {
    info!(cluster = %params.cluster_name, "reconciling secrets");
    let mut cache = SecretsCache::new();

    pki::ensure_pki_secrets(client, runner, params, &mut cache).await?;

    ensure_watcher_token(client, params.namespace, &mut cache).await?;

    propagate_secret(
        client,
        &SecretDescriptor {
            name: OBJECT_STORAGE_SECRET.to_string(),
            kind: SecretKind::Opaque,
            finalize: false,
        },
        params.namespace,
        catalog.required_format(OBJECT_STORAGE_SECRET),
        &mut cache,
    )
    .await?;

    let bucket_name = ensure_bucket(store, params.cluster_name, &cache).await?;
    persist_bucket_name(client, params.namespace, &bucket_name, &mut cache).await?;

    stamp_api_url(client, params.namespace, &mut cache).await?;

    propagate_secret(
        client,
        &SecretDescriptor {
            name: REGISTRY_PULL_SECRET.to_string(),
            kind: SecretKind::DockerCredentials,
            finalize: false,
        },
        params.namespace,
        catalog.required_format(REGISTRY_PULL_SECRET),
        &mut cache,
    )
    .await?;

    propagate_secret(
        client,
        &SecretDescriptor {
            name: CLUSTER_CA_SECRET.to_string(),
            kind: SecretKind::Opaque,
            finalize: true,
        },
        params.namespace,
        catalog.required_format(CLUSTER_CA_SECRET),
        &mut cache,
    )
    .await?;

    Ok(cache)
}

/// The formatted node-watcher credential: a fresh random token plus the
/// fixed watcher identity fields.
pub fn generate_watcher_token() -> Vec<u8> {
    let mut raw = [0u8; 32];
    OsRng.fill_bytes(&mut raw);
    let token = hex_encode(&raw);
    format!("{token},node-watcher,node-watcher").into_bytes()
}

async fn ensure_watcher_token(
    client: &Client,
    namespace: &str,
    cache: &mut SecretsCache,
) -> Result<()> {
    if check_secret(client, namespace, WATCHER_TOKEN_SECRET, cache).await? {
        info!(namespace = %namespace, secret = WATCHER_TOKEN_SECRET, "already present");
        return Ok(());
    }

    let mut data = SecretData::new();
    data.insert(WATCHER_TOKEN_SECRET.to_string(), generate_watcher_token());

    create_secret(
        client,
        SecretWrite {
            namespace,
            name: WATCHER_TOKEN_SECRET,
            kind: SecretKind::Opaque,
            overwrite: false,
            finalizer: None,
        },
        &data,
    )
    .await?;
    cache.insert(WATCHER_TOKEN_SECRET, data);
    Ok(())
}

/// Reuse the recorded bucket if the object-storage secret already names one,
/// otherwise provision a fresh bucket with the propagated credentials.
async fn ensure_bucket(
    store: &dyn ObjectStore,
    cluster_name: &str,
    cache: &SecretsCache,
) -> Result<String> {
    let data = cache.get(OBJECT_STORAGE_SECRET).ok_or_else(|| {
        Error::secret_data(OBJECT_STORAGE_SECRET, "not available while provisioning bucket")
    })?;

    if let Some(existing) = data.get(BUCKET_KEY).filter(|b| !b.is_empty()) {
        let name = String::from_utf8_lossy(existing).to_string();
        info!(bucket = %name, "bucket already recorded, not creating");
        return Ok(name);
    }

    let creds = bucket::BucketCredentials::from_secret_data(data)?;
    bucket::provision_bucket(store, &creds, cluster_name).await
}

async fn persist_bucket_name(
    client: &Client,
    namespace: &str,
    bucket_name: &str,
    cache: &mut SecretsCache,
) -> Result<()> {
    let data = cache.get(OBJECT_STORAGE_SECRET).ok_or_else(|| {
        Error::secret_data(OBJECT_STORAGE_SECRET, "not available while recording bucket")
    })?;

    if data.get(BUCKET_KEY).map(|b| b.as_slice()) == Some(bucket_name.as_bytes()) {
        info!(bucket = %bucket_name, "bucket name already recorded, not updating");
        return Ok(());
    }

    let mut updated = data.clone();
    updated.insert(BUCKET_KEY.to_string(), bucket_name.as_bytes().to_vec());
    create_secret(
        client,
        SecretWrite {
            namespace,
            name: OBJECT_STORAGE_SECRET,
            kind: SecretKind::Opaque,
            overwrite: true,
            finalizer: None,
        },
        &updated,
    )
    .await?;
    cache.insert(OBJECT_STORAGE_SECRET, updated);
    Ok(())
}

/// Write the environment's control-plane API URL into the tenant's cloud
/// credential secret and attach the tenant finalizer so the credential
/// survives until deletion releases it.
async fn stamp_api_url(client: &Client, namespace: &str, cache: &mut SecretsCache) -> Result<()> {
    let api_url = std::env::var(CLOUD_API_URL_ENV)
        .map_err(|_| Error::MissingEnv(CLOUD_API_URL_ENV))?;

    let api: Api<Secret> = Api::namespaced(client.clone(), namespace);
    let mut secret = api.get_opt(CLOUD_CREDENTIALS_SECRET).await?.ok_or_else(|| {
        Error::secret_data(CLOUD_CREDENTIALS_SECRET, format!("missing from {namespace}"))
    })?;

    let data = secret_payload(&secret);
    let finalizers = secret.metadata.finalizers.get_or_insert_with(Vec::new);
    let already_stamped = data.get("apiurl").map(|v| v.as_slice()) == Some(api_url.as_bytes())
        && finalizers.iter().any(|f| f == CLUSTER_FINALIZER);
    if already_stamped {
        info!(namespace = %namespace, secret = CLOUD_CREDENTIALS_SECRET, "already stamped");
        cache.insert(CLOUD_CREDENTIALS_SECRET, data);
        return Ok(());
    }

    if !finalizers.iter().any(|f| f == CLUSTER_FINALIZER) {
        finalizers.push(CLUSTER_FINALIZER.to_string());
    }
    let mut updated = data;
    updated.insert("apiurl".to_string(), api_url.into_bytes());
    secret.data = Some(to_byte_map(&updated));

    api.replace(CLOUD_CREDENTIALS_SECRET, &PostParams::default(), &secret)
        .await?;
    cache.insert(CLOUD_CREDENTIALS_SECRET, updated);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn watcher_token_has_credential_format() {
        let token = String::from_utf8(generate_watcher_token()).unwrap();
        let mut fields = token.split(',');

        let secret = fields.next().unwrap();
        assert_eq!(secret.len(), 64);
        assert!(secret.bytes().all(|b| b.is_ascii_hexdigit()));
        assert_eq!(fields.next(), Some("node-watcher"));
        assert_eq!(fields.next(), Some("node-watcher"));
        assert_eq!(fields.next(), None);
    }

    #[test]
    fn watcher_tokens_are_unique() {
        assert_ne!(generate_watcher_token(), generate_watcher_token());
    }

    #[test]
    fn format_validation_requires_nonempty_keys() {
        let mut data = SecretData::new();
        data.insert("access".into(), b"AKIA".to_vec());
        data.insert("secret".into(), b"s3cr3t".to_vec());
        data.insert("endpoint".into(), Vec::new());

        let required = |keys: &[&str]| keys.iter().map(|s| s.to_string()).collect::<Vec<_>>();

        assert!(validate_format(&data, &required(&["access", "secret"])));
        assert!(!validate_format(&data, &required(&["access", "endpoint"])));
        assert!(!validate_format(&data, &required(&["missing"])));
        assert!(validate_format(&data, &[]));
    }

    #[test]
    fn cache_records_and_reports_payloads() {
        let mut cache = SecretsCache::new();
        assert!(!cache.contains("k8s-certs"));

        let mut data = SecretData::new();
        data.insert("ca.crt".into(), b"pem".to_vec());
        cache.insert("k8s-certs", data);

        assert!(cache.contains("k8s-certs"));
        assert_eq!(
            cache.get("k8s-certs").unwrap().get("ca.crt").unwrap(),
            b"pem"
        );
    }

    #[test]
    fn hex_encoding_is_lowercase_two_digit() {
        assert_eq!(hex_encode(&[0x00, 0xff, 0x0a]), "00ff0a");
    }
}
