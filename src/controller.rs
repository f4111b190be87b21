//! Kubernetes controller reconciliation wiring
//!
//! The supervisor loop: one reconcile invocation per TenantCluster event,
//! deletion gated behind our finalizer so the protocol always runs before
//! the object disappears. Failures surface through the error policy, which
//! requeues quickly for transient conditions and on a slow cadence for
//! configuration errors a human has to fix.

use std::sync::Arc;
use std::time::Duration;

use kube::api::{Api, Patch, PatchParams};
use kube::runtime::controller::Action;
use kube::{Client, ResourceExt};
use tracing::{info, warn};

use crate::crd::TenantCluster;
use crate::deletion::{delete_tenant, TenantOpsImpl};
use crate::orchestrator::Orchestrator;
use crate::{Error, Result, CLUSTER_FINALIZER, FIELD_MANAGER};

/// Requeue cadence after a clean convergence pass
const REQUEUE_CONVERGED: Duration = Duration::from_secs(300);
/// Requeue cadence while waiting out a transient condition
const REQUEUE_TRANSIENT: Duration = Duration::from_secs(15);
/// Requeue cadence after a non-transient failure
const REQUEUE_FAILED: Duration = Duration::from_secs(120);

/// Controller context containing shared state and clients
pub struct Context {
    /// Management cluster client
    pub client: Client,
    /// The convergence driver shared by all tenants
    pub orchestrator: Orchestrator,
}

/// Whether the tenant carries our finalizer
pub fn has_finalizer(tenant: &TenantCluster) -> bool {
    tenant
        .metadata
        .finalizers
        .as_ref()
        .is_some_and(|f| f.iter().any(|x| x == CLUSTER_FINALIZER))
}

async fn set_finalizers(client: &Client, name: &str, finalizers: Vec<String>) -> Result<()> {
    let api: Api<TenantCluster> = Api::all(client.clone());
    let patch = serde_json::json!({"metadata": {"finalizers": finalizers}});
    api.patch(
        name,
        &PatchParams::apply(FIELD_MANAGER),
        &Patch::Merge(&patch),
    )
    .await?;
    Ok(())
}

/// Reconcile one TenantCluster event
pub async fn reconcile(tenant: Arc<TenantCluster>, ctx: Arc<Context>) -> Result<Action> {
    let name = tenant.name_any();

    if tenant.metadata.deletion_timestamp.is_some() {
        if !has_finalizer(&tenant) {
            return Ok(Action::await_change());
        }

        let ops = TenantOpsImpl::new(ctx.client.clone());
        return match delete_tenant(&ops, &name).await {
            Ok(report) => {
                for note in &report.degraded {
                    warn!(cluster = %name, "{note}");
                }
                let remaining: Vec<String> = tenant
                    .metadata
                    .finalizers
                    .clone()
                    .unwrap_or_default()
                    .into_iter()
                    .filter(|f| f != CLUSTER_FINALIZER)
                    .collect();
                set_finalizers(&ctx.client, &name, remaining).await?;
                Ok(Action::await_change())
            }
            Err(Error::WorkloadsPresent { count }) => {
                info!(cluster = %name, machines = count, "deletion blocked on live machines");
                Ok(Action::requeue(REQUEUE_TRANSIENT))
            }
            Err(err) => Err(err),
        };
    }

    if !has_finalizer(&tenant) {
        let mut finalizers = tenant.metadata.finalizers.clone().unwrap_or_default();
        finalizers.push(CLUSTER_FINALIZER.to_string());
        set_finalizers(&ctx.client, &name, finalizers).await?;
        // pick the object back up with the finalizer in place
        return Ok(Action::requeue(Duration::from_secs(1)));
    }

    ctx.orchestrator.reconcile(&tenant).await?;
    Ok(Action::requeue(REQUEUE_CONVERGED))
}

/// Decide the retry cadence for a failed reconcile
pub fn error_policy(tenant: Arc<TenantCluster>, error: &Error, _ctx: Arc<Context>) -> Action {
    let name = tenant.name_any();
    if error.is_transient() {
        info!(cluster = %name, error = %error, "waiting out transient condition");
        Action::requeue(REQUEUE_TRANSIENT)
    } else {
        warn!(cluster = %name, error = %error, "reconcile failed");
        Action::requeue(REQUEUE_FAILED)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::TenantClusterSpec;

    fn tenant(finalizers: Option<Vec<&str>>) -> TenantCluster {
        let mut tc = TenantCluster::new("blue", TenantClusterSpec::default());
        tc.metadata.finalizers =
            finalizers.map(|f| f.into_iter().map(str::to_string).collect());
        tc
    }

    #[test]
    fn finalizer_presence_is_detected() {
        assert!(!has_finalizer(&tenant(None)));
        assert!(!has_finalizer(&tenant(Some(vec!["other.io/thing"]))));
        assert!(has_finalizer(&tenant(Some(vec![
            "other.io/thing",
            CLUSTER_FINALIZER
        ]))));
    }
}
