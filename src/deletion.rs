//! Guarded tenant deletion
//!
//! Deletion runs behind a single hard gate: no live machine may still
//! reference the tenant. Past the gate, finalizer release on the critical
//! secrets is best-effort - teardown must keep moving even if a secondary
//! secret is unreachable - and the namespace delete treats a concurrent
//! modification as success, since the object is already transitioning away.

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{Namespace, Secret};
use kube::api::{Api, DeleteParams, DynamicObject, ListParams, Patch, PatchParams};
use kube::discovery::ApiResource;
use kube::Client;
use tracing::{info, warn};

#[cfg(test)]
use mockall::automock;

use crate::error::is_kube_conflict;
use crate::secrets::{CLOUD_CREDENTIALS_SECRET, CLUSTER_CA_SECRET};
use crate::{Error, Result, CLUSTER_FINALIZER, FIELD_MANAGER};

/// Secrets whose finalizer the protocol releases before the namespace goes
const FINALIZED_SECRETS: [&str; 2] = [CLOUD_CREDENTIALS_SECRET, CLUSTER_CA_SECRET];

/// How deletion went, beyond plain success: best-effort steps that failed
/// are reported, not fatal.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct DeletionReport {
    /// Human-readable notes for each degraded best-effort step
    pub degraded: Vec<String>,
}

/// Cluster operations the protocol needs, behind a seam so the ordering and
/// severity rules are testable without an API server.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait TenantOps: Send + Sync {
    /// Number of machine objects still present in the tenant namespace
    async fn live_machine_count(&self, namespace: &str) -> Result<usize>;

    /// Remove the tenant finalizer from one secret
    async fn release_secret_finalizer(&self, namespace: &str, name: &str) -> Result<()>;

    /// Delete the tenant namespace; idempotent, and a concurrent
    /// modification conflict counts as success
    async fn delete_namespace(&self, namespace: &str) -> Result<()>;
}

/// Run the deletion protocol for one tenant.
pub async fn delete_tenant(ops: &dyn TenantOps, cluster_name: &str) -> Result<DeletionReport> {
    let namespace = crate::tenant_namespace(cluster_name);
    info!(cluster = %cluster_name, "deleting tenant");

    // The sole hard gate: a separate actor removes machines; we only retry.
    let count = ops.live_machine_count(&namespace).await?;
    if count > 0 {
        return Err(Error::WorkloadsPresent { count });
    }

    let mut report = DeletionReport::default();
    for secret in FINALIZED_SECRETS {
        if let Err(err) = ops.release_secret_finalizer(&namespace, secret).await {
            warn!(
                cluster = %cluster_name,
                secret = %secret,
                error = %err,
                "could not release secret finalizer, continuing teardown"
            );
            report.degraded.push(format!("finalizer not released on {secret}: {err}"));
        }
    }

    ops.delete_namespace(&namespace).await?;
    info!(cluster = %cluster_name, namespace = %namespace, "tenant namespace deleted");
    Ok(report)
}

/// Machine objects owned by the compute-provisioning collaborator
fn machine_api_resource() -> ApiResource {
    ApiResource {
        group: "canopy.dev".into(),
        version: "v1alpha1".into(),
        api_version: "canopy.dev/v1alpha1".into(),
        kind: "Machine".into(),
        plural: "machines".into(),
    }
}

/// Live-cluster implementation of [`TenantOps`]
pub struct TenantOpsImpl {
    client: Client,
}

impl TenantOpsImpl {
    /// Create ops over the management cluster client
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl TenantOps for TenantOpsImpl {
    async fn live_machine_count(&self, namespace: &str) -> Result<usize> {
        let ar = machine_api_resource();
        let api: Api<DynamicObject> = Api::namespaced_with(self.client.clone(), namespace, &ar);
        let machines = api.list(&ListParams::default()).await?;
        Ok(machines.items.len())
    }

    async fn release_secret_finalizer(&self, namespace: &str, name: &str) -> Result<()> {
        let api: Api<Secret> = Api::namespaced(self.client.clone(), namespace);
        let Some(secret) = api.get_opt(name).await? else {
            // nothing to release
            return Ok(());
        };

        let finalizers: Vec<String> = secret
            .metadata
            .finalizers
            .unwrap_or_default()
            .into_iter()
            .filter(|f| f != CLUSTER_FINALIZER)
            .collect();
        let patch = serde_json::json!({"metadata": {"finalizers": finalizers}});
        api.patch(
            name,
            &PatchParams::apply(FIELD_MANAGER),
            &Patch::Merge(&patch),
        )
        .await?;
        Ok(())
    }

    async fn delete_namespace(&self, namespace: &str) -> Result<()> {
        let api: Api<Namespace> = Api::all(self.client.clone());
        match api.delete(namespace, &DeleteParams::default()).await {
            Ok(_) => Ok(()),
            // already gone: deletion is idempotent
            Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(()),
            // concurrent modification: the namespace is already on its way out
            Err(err) if is_kube_conflict(&err) => Ok(()),
            Err(err) => Err(err.into()),
        }
    }
}
