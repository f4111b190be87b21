//! TenantCluster Custom Resource Definition
//!
//! A TenantCluster represents one managed Kubernetes cluster whose control
//! plane runs inside a per-tenant namespace on the management cluster. The
//! requested software version travels as an annotation so that an external
//! versioning actor can set and pin it without touching the spec.

use kube::{CustomResource, ResourceExt};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::VERSION_ANNOTATION;

/// Default pod network range handed to the CNI and the proxy addon
pub const DEFAULT_POD_CIDR: &str = "10.2.0.0/16";

/// Default service network range handed to the DNS addon
pub const DEFAULT_SERVICE_CIDR: &str = "10.128.0.0/16";

/// Port the tenant API server is exposed on
pub const APISERVER_PORT: i32 = 6443;

/// Specification for a TenantCluster
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "canopy.dev",
    version = "v1alpha1",
    kind = "TenantCluster",
    plural = "tenantclusters",
    shortname = "tc",
    status = "TenantClusterStatus",
    namespaced = false,
    printcolumn = r#"{"name":"Endpoint","type":"string","jsonPath":".status.apiEndpoints[0].host"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct TenantClusterSpec {
    /// Network configuration; ranges default to the platform-wide values
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub networking: Option<NetworkingSpec>,
}

/// Network ranges for a tenant cluster
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct NetworkingSpec {
    /// Pod network CIDR
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pod_cidr: Option<String>,

    /// Service network CIDR
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_cidr: Option<String>,
}

/// One reachable API server address
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ApiEndpoint {
    /// Load-balanced hostname or IP address
    pub host: String,
    /// TCP port
    pub port: i32,
}

/// Status for a TenantCluster
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TenantClusterStatus {
    /// Externally reachable API server endpoints
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub api_endpoints: Vec<ApiEndpoint>,
}

impl TenantCluster {
    /// The version string declared on the object, if any
    pub fn declared_version(&self) -> Option<&str> {
        self.metadata
            .annotations
            .as_ref()
            .and_then(|a| a.get(VERSION_ANNOTATION))
            .map(String::as_str)
    }

    /// The per-tenant namespace on the management cluster
    pub fn tenant_namespace(&self) -> String {
        crate::tenant_namespace(&self.name_any())
    }

    /// The first recorded API endpoint host, if the endpoint has been assigned
    pub fn endpoint_host(&self) -> Option<&str> {
        self.status
            .as_ref()
            .and_then(|s| s.api_endpoints.first())
            .map(|e| e.host.as_str())
    }

    /// Pod network range, falling back to the platform default
    pub fn pod_cidr(&self) -> &str {
        self.spec
            .networking
            .as_ref()
            .and_then(|n| n.pod_cidr.as_deref())
            .unwrap_or(DEFAULT_POD_CIDR)
    }

    /// Service network range, falling back to the platform default
    pub fn service_cidr(&self) -> &str {
        self.spec
            .networking
            .as_ref()
            .and_then(|n| n.service_cidr.as_deref())
            .unwrap_or(DEFAULT_SERVICE_CIDR)
    }
}
