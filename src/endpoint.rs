//! The tenant API server's externally reachable endpoint
//!
//! Each tenant gets a load-balanced Service in front of its API server. The
//! address assignment is asynchronous on every load-balancer integration we
//! run against, so a missing address is a retryable condition for the pass,
//! not a failure of the controlling process.

use k8s_openapi::api::core::v1::{Service, ServicePort, ServiceSpec};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::api::{Api, Patch, PatchParams, PostParams};
use kube::{Client, ResourceExt};
use tracing::info;

use crate::crd::{TenantCluster, APISERVER_PORT};
use crate::{Error, Result, FIELD_MANAGER};

/// Name of the load-balanced Service fronting the tenant API server
pub const APISERVER_SERVICE: &str = "kube-apiserver";

/// Ensure the load-balanced Service exists, read back its assigned address,
/// and persist it onto the tenant's status. Returns the address.
pub async fn ensure_endpoint(client: &Client, tenant: &TenantCluster) -> Result<String> {
    let namespace = tenant.tenant_namespace();
    let cluster_name = tenant.name_any();
    let api: Api<Service> = Api::namespaced(client.clone(), &namespace);

    let service = match api.get_opt(APISERVER_SERVICE).await? {
        Some(service) => service,
        None => {
            info!(cluster = %cluster_name, "creating API server endpoint service");
            api.create(&PostParams::default(), &apiserver_service()).await?
        }
    };

    let host =
        ingress_host(&service).ok_or_else(|| Error::EndpointNotReady(cluster_name.clone()))?;

    if tenant.endpoint_host() != Some(host.as_str()) {
        info!(cluster = %cluster_name, endpoint = %host, "recording API endpoint");
        let tenants: Api<TenantCluster> = Api::all(client.clone());
        let status = serde_json::json!({
            "status": {
                "apiEndpoints": [{"host": host, "port": APISERVER_PORT}],
            }
        });
        tenants
            .patch_status(
                &cluster_name,
                &PatchParams::apply(FIELD_MANAGER),
                &Patch::Merge(&status),
            )
            .await?;
    }

    Ok(host)
}

/// The assigned load-balancer address, IP preferred over hostname
pub fn ingress_host(service: &Service) -> Option<String> {
    let ingress = service
        .status
        .as_ref()?
        .load_balancer
        .as_ref()?
        .ingress
        .as_ref()?
        .first()?;
    ingress.ip.clone().or_else(|| ingress.hostname.clone())
}

fn apiserver_service() -> Service {
    let mut service = Service::default();
    service.metadata.name = Some(APISERVER_SERVICE.to_string());
    service.metadata.labels = Some(
        [("app".to_string(), APISERVER_SERVICE.to_string())]
            .into_iter()
            .collect(),
    );
    service.spec = Some(ServiceSpec {
        type_: Some("LoadBalancer".to_string()),
        selector: Some(
            [("app".to_string(), APISERVER_SERVICE.to_string())]
                .into_iter()
                .collect(),
        ),
        ports: Some(vec![ServicePort {
            name: Some("https".to_string()),
            port: APISERVER_PORT,
            target_port: Some(IntOrString::Int(APISERVER_PORT)),
            protocol: Some("TCP".to_string()),
            ..Default::default()
        }]),
        ..Default::default()
    });
    service
}
