//! Dual-target deployment orchestrator
//!
//! The reconcile driver for one tenant: resolve the target version, load its
//! catalog, ensure the external endpoint, run the secret pipeline, deploy
//! management-side charts into the per-tenant namespace, then build a
//! short-lived tenant client and deploy tenant-side charts into the tenant's
//! own system namespace, finishing with the one-time addon bootstrap.
//!
//! No step is transactional. Every step is idempotent and re-checks state,
//! so a pass retried from the top after any failure converges instead of
//! duplicating work. The pre-flight dependency check keeps a chart set from
//! half-converging: either every chart's secrets are available before the
//! first deploy, or nothing deploys at all.

use std::path::PathBuf;
use std::sync::Arc;

use kube::api::{Api, PostParams};
use kube::{Client, ResourceExt};
use tracing::{debug, info, instrument, warn};

use crate::bootstrap;
use crate::catalog::{Chart, ChartCatalog, SecretDescriptor};
use crate::charts::{ChartDeployer, ChartEngine};
use crate::command::CommandRunner;
use crate::crd::{TenantCluster, APISERVER_PORT};
use crate::endpoint;
use crate::error::is_kube_conflict;
use crate::secrets::bucket::ObjectStore;
use crate::secrets::{
    self, SecretWrite, SecretsCache, BUCKET_KEY, CLOUD_CREDENTIALS_SECRET, OBJECT_STORAGE_SECRET,
};
use crate::staleness::{StalenessProbe, VersionOracle};
use crate::version::{self, ClusterVersion, MissingVersionPolicy};
use crate::{Error, Result, VERSION_ANNOTATION};

/// The per-tenant convergence driver.
///
/// One instance serves every tenant; all per-pass state lives on the stack
/// of [`Orchestrator::reconcile`]. The command runner and object store are
/// injected process-wide dependencies, both safe for concurrent passes.
pub struct Orchestrator {
    client: Client,
    catalog_root: PathBuf,
    missing_version_policy: MissingVersionPolicy,
    runner: Arc<dyn CommandRunner>,
    store: Arc<dyn ObjectStore>,
}

impl Orchestrator {
    /// Create the orchestrator over its injected dependencies
    pub fn new(
        client: Client,
        catalog_root: PathBuf,
        missing_version_policy: MissingVersionPolicy,
        runner: Arc<dyn CommandRunner>,
        store: Arc<dyn ObjectStore>,
    ) -> Self {
        Self {
            client,
            catalog_root,
            missing_version_policy,
            runner,
            store,
        }
    }

    /// Run one full convergence pass for a tenant.
    #[instrument(skip_all, fields(cluster = %tenant.name_any()))]
    pub async fn reconcile(&self, tenant: &TenantCluster) -> Result<()> {
        let cluster_name = tenant.name_any();
        let namespace = tenant.tenant_namespace();

        let resolved = version::resolve(
            tenant.declared_version(),
            &self.catalog_root,
            self.missing_version_policy,
        )?;
        info!(version = %resolved.version, "resolved target version");
        if resolved.pinned {
            self.write_back_version(&cluster_name, &resolved.version)
                .await?;
        }

        let catalog = ChartCatalog::load(&self.catalog_root, &resolved.version)?;

        ensure_namespace(&self.client, &namespace).await?;

        let endpoint_host = endpoint::ensure_endpoint(&self.client, tenant).await?;

        let params = secrets::PipelineParams {
            cluster_name: &cluster_name,
            namespace: &namespace,
            endpoint_host: &endpoint_host,
            version: &resolved.version,
            pod_cidr: tenant.pod_cidr(),
            service_cidr: tenant.service_cidr(),
        };
        let cache = secrets::reconcile_secrets(
            &self.client,
            self.runner.as_ref(),
            self.store.as_ref(),
            &catalog,
            &params,
        )
        .await?;
        verify_side_secrets(catalog.management_secrets(), &cache)?;

        let values = chart_values(&cluster_name, &endpoint_host, &resolved.version, &cache);

        // Management side: pre-flight the whole chart list before deploying
        // anything, so a missing secret cannot leave the set half-converged.
        let management = load_charts(&catalog, catalog.management_charts())?;
        check_dependencies(&management, &cache)?;
        let engine = ChartDeployer::new(self.client.clone());
        let probe = VersionOracle::new(self.client.clone());
        deploy_charts(
            &engine,
            &probe,
            &namespace,
            &management,
            &values,
            &resolved.version,
        )
        .await?;

        // Tenant side, through a short-lived admin client. The credential
        // file exists only while the client is constructed.
        let tenant_client = {
            let kubeconfig = bootstrap::admin_kubeconfig_file(&self.client, &cluster_name).await?;
            bootstrap::tenant_cluster_client(kubeconfig.path()).await?
        };

        ensure_tenant_cloud_credentials(&tenant_client, &catalog, &cache).await?;
        verify_side_secrets(catalog.tenant_secrets(), &cache)?;

        let tenant_charts = load_charts(&catalog, catalog.tenant_charts())?;
        check_dependencies(&tenant_charts, &cache)?;
        let tenant_engine = ChartDeployer::new(tenant_client.clone());
        let tenant_probe = VersionOracle::new(tenant_client.clone());
        deploy_charts(
            &tenant_engine,
            &tenant_probe,
            bootstrap::TENANT_SYSTEM_NAMESPACE,
            &tenant_charts,
            &values,
            &resolved.version,
        )
        .await?;

        if bootstrap::proxy_addon_present(&tenant_client).await? {
            debug!("proxy addon present, skipping addon bootstrap");
        } else {
            let kubeconfig = bootstrap::admin_kubeconfig_file(&self.client, &cluster_name).await?;
            bootstrap::bootstrap_addons(
                self.runner.as_ref(),
                kubeconfig.path(),
                &endpoint_host,
                tenant.pod_cidr(),
                tenant.service_cidr(),
            )
            .await?;
        }

        info!(version = %resolved.version, "converged");
        Ok(())
    }

    /// Persist a pinned version back onto the tenant annotation.
    ///
    /// Compare-and-set through the object's resourceVersion: losing the race
    /// to another writer is benign since both candidates were resolved from
    /// the same catalogs.
    async fn write_back_version(&self, cluster_name: &str, version: &ClusterVersion) -> Result<()> {
        let api: Api<TenantCluster> = Api::all(self.client.clone());
        let mut tenant = api.get(cluster_name).await?;
        tenant
            .metadata
            .annotations
            .get_or_insert_with(Default::default)
            .insert(VERSION_ANNOTATION.to_string(), version.to_string());

        match api
            .replace(cluster_name, &PostParams::default(), &tenant)
            .await
        {
            Ok(_) => {
                info!(version = %version, "pinned declared version");
                Ok(())
            }
            Err(err) if is_kube_conflict(&err) => {
                debug!("version pin raced with another writer, keeping theirs");
                Ok(())
            }
            Err(err) => Err(err.into()),
        }
    }
}

async fn ensure_namespace(client: &Client, namespace: &str) -> Result<()> {
    use k8s_openapi::api::core::v1::Namespace;

    let api: Api<Namespace> = Api::all(client.clone());
    if api.get_opt(namespace).await?.is_some() {
        return Ok(());
    }

    let mut ns = Namespace::default();
    ns.metadata.name = Some(namespace.to_string());
    match api.create(&PostParams::default(), &ns).await {
        Ok(_) => {
            info!(namespace = %namespace, "created tenant namespace");
            Ok(())
        }
        // concurrent pass won the create
        Err(kube::Error::Api(ae)) if ae.code == 409 => Ok(()),
        Err(err) => Err(err.into()),
    }
}

/// Load charts in catalog order
pub fn load_charts(catalog: &ChartCatalog, names: &[String]) -> Result<Vec<Chart>> {
    names.iter().map(|name| catalog.chart(name)).collect()
}

/// Pre-flight dependency check: every chart's required secrets must already
/// be in the cache, or the pass aborts before deploying anything.
pub fn check_dependencies(charts: &[Chart], cache: &SecretsCache) -> Result<()> {
    for chart in charts {
        for secret in &chart.secrets_required {
            if !cache.contains(&secret.name) {
                return Err(Error::UnsatisfiedChartDependency {
                    chart: chart.name.clone(),
                    secret: secret.name.clone(),
                });
            }
        }
    }
    Ok(())
}

/// Cross-check that the pipeline produced every secret the catalog declares
/// for a side; drift between the two is a catalog bug worth failing loudly.
pub fn verify_side_secrets(declared: &[SecretDescriptor], cache: &SecretsCache) -> Result<()> {
    for descriptor in declared {
        if !cache.contains(&descriptor.name) {
            return Err(Error::secret_data(
                &descriptor.name,
                "declared in catalog but not produced by the secret pipeline",
            ));
        }
    }
    Ok(())
}

/// Deploy charts in order, skipping any whose declared resources are all
/// current. The development sentinel forces every chart through regardless
/// of staleness.
pub async fn deploy_charts(
    engine: &dyn ChartEngine,
    probe: &dyn StalenessProbe,
    namespace: &str,
    charts: &[Chart],
    values: &serde_json::Value,
    version: &ClusterVersion,
) -> Result<()> {
    let marker = version.to_string();
    for chart in charts {
        if !version.is_dev() {
            let mut any_stale = false;
            for resource in &chart.resources {
                if probe.is_stale(namespace, resource, version).await? {
                    any_stale = true;
                    break;
                }
            }
            if !any_stale {
                info!(chart = %chart.name, version = %marker, "chart already current, skipping");
                continue;
            }
        }
        engine.deploy_chart(chart, namespace, values, &marker).await?;
    }
    Ok(())
}

/// Values every chart template renders against
pub fn chart_values(
    cluster_name: &str,
    endpoint_host: &str,
    version: &ClusterVersion,
    cache: &SecretsCache,
) -> serde_json::Value {
    let bucket = cache
        .get(OBJECT_STORAGE_SECRET)
        .and_then(|data| data.get(BUCKET_KEY))
        .map(|b| String::from_utf8_lossy(b).to_string());

    serde_json::json!({
        "cluster_name": cluster_name,
        "endpoint": endpoint_host,
        "endpoint_port": APISERVER_PORT,
        "version": version.to_string(),
        "kubernetes_version": version.kubernetes_version(),
        "bucket": bucket,
    })
}

/// Copy the cloud credential secret into the tenant cluster's system
/// namespace, leaving a valid existing copy untouched.
async fn ensure_tenant_cloud_credentials(
    tenant_client: &Client,
    catalog: &ChartCatalog,
    cache: &SecretsCache,
) -> Result<()> {
    let source = cache.get(CLOUD_CREDENTIALS_SECRET).ok_or_else(|| {
        Error::secret_data(CLOUD_CREDENTIALS_SECRET, "not produced by the secret pipeline")
    })?;

    let existing = secrets::get_secret_data(
        tenant_client,
        bootstrap::TENANT_SYSTEM_NAMESPACE,
        CLOUD_CREDENTIALS_SECRET,
    )
    .await?;
    if let Some(existing) = existing {
        let valid = catalog
            .required_format(CLOUD_CREDENTIALS_SECRET)
            .map_or(!existing.is_empty(), |req| {
                secrets::validate_format(&existing, req)
            });
        if valid {
            debug!(secret = CLOUD_CREDENTIALS_SECRET, "tenant already has a valid copy");
            return Ok(());
        }
        warn!(
            secret = CLOUD_CREDENTIALS_SECRET,
            "tenant copy fails required format, replacing"
        );
    }

    secrets::create_secret(
        tenant_client,
        SecretWrite {
            namespace: bootstrap::TENANT_SYSTEM_NAMESPACE,
            name: CLOUD_CREDENTIALS_SECRET,
            kind: crate::catalog::SecretKind::Opaque,
            overwrite: true,
            finalizer: None,
        },
        source,
    )
    .await
}
