//! Resource staleness oracle
//!
//! A chart redeploys when any of its declared resources is stale: missing,
//! or carrying a convergence-version marker that differs from the target.
//! Kind dispatch is a closed enum; a kind outside the set is a hard error
//! rather than a silent skip. Kinds whose marker cannot be introspected
//! (CustomResourceDefinition, CSIDriver, StorageClass) report a permanent
//! "up to date" sentinel and never force a redeploy on their own.

use std::str::FromStr;

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::{DaemonSet, Deployment, StatefulSet};
use k8s_openapi::api::core::v1::{ConfigMap, Service, ServiceAccount};
use k8s_openapi::api::rbac::v1::{ClusterRole, ClusterRoleBinding, Role, RoleBinding};
use kube::{Api, Client, Resource};

#[cfg(test)]
use mockall::automock;

use crate::catalog::ResourceRef;
use crate::version::ClusterVersion;
use crate::{Error, Result, CONVERGED_VERSION_ANNOTATION};

/// The closed set of resource kinds charts may declare
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[allow(missing_docs)]
pub enum ResourceKind {
    Service,
    Deployment,
    Role,
    RoleBinding,
    ConfigMap,
    DaemonSet,
    StatefulSet,
    ServiceAccount,
    ClusterRole,
    ClusterRoleBinding,
    CustomResourceDefinition,
    CsiDriver,
    StorageClass,
}

impl ResourceKind {
    /// Whether this kind lives outside any namespace
    pub fn is_cluster_scoped(&self) -> bool {
        matches!(
            self,
            ResourceKind::ClusterRole
                | ResourceKind::ClusterRoleBinding
                | ResourceKind::CustomResourceDefinition
                | ResourceKind::CsiDriver
                | ResourceKind::StorageClass
        )
    }

    /// Whether the oracle can read a convergence marker off this kind
    pub fn has_version_marker(&self) -> bool {
        !matches!(
            self,
            ResourceKind::CustomResourceDefinition
                | ResourceKind::CsiDriver
                | ResourceKind::StorageClass
        )
    }
}

impl FromStr for ResourceKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "service" => Ok(ResourceKind::Service),
            "deployment" => Ok(ResourceKind::Deployment),
            "role" => Ok(ResourceKind::Role),
            "rolebinding" => Ok(ResourceKind::RoleBinding),
            "configmap" => Ok(ResourceKind::ConfigMap),
            "daemonset" => Ok(ResourceKind::DaemonSet),
            "statefulset" => Ok(ResourceKind::StatefulSet),
            "serviceaccount" => Ok(ResourceKind::ServiceAccount),
            "clusterrole" => Ok(ResourceKind::ClusterRole),
            "clusterrolebinding" => Ok(ResourceKind::ClusterRoleBinding),
            "customresourcedefinition" => Ok(ResourceKind::CustomResourceDefinition),
            "csidriver" => Ok(ResourceKind::CsiDriver),
            "storageclass" => Ok(ResourceKind::StorageClass),
            _ => Err(Error::UnsupportedResourceKind(s.to_string())),
        }
    }
}

/// What the oracle observed on one resource
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum VersionMarker {
    /// The object does not exist yet
    Absent,
    /// The kind carries no introspectable marker; always considered current
    AlwaysCurrent,
    /// The marker annotation value, empty if the object exists unannotated
    Recorded(String),
}

/// Pure staleness decision over an observed marker
pub fn is_stale_marker(marker: &VersionMarker, target: &ClusterVersion) -> bool {
    match marker {
        VersionMarker::Absent => true,
        VersionMarker::AlwaysCurrent => false,
        VersionMarker::Recorded(v) => *v != target.to_string(),
    }
}

/// Async seam the deployment loop consults per declared resource
#[cfg_attr(test, automock)]
#[async_trait]
pub trait StalenessProbe: Send + Sync {
    /// Whether `resource` in `namespace` needs redeploying to reach `target`
    async fn is_stale(
        &self,
        namespace: &str,
        resource: &ResourceRef,
        target: &ClusterVersion,
    ) -> Result<bool>;
}

/// Probe backed by the live API server
pub struct VersionOracle {
    client: Client,
}

impl VersionOracle {
    /// Create an oracle over the given client
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    /// Fetch the convergence marker for one resource
    pub async fn marker(&self, namespace: &str, resource: &ResourceRef) -> Result<VersionMarker> {
        let kind: ResourceKind = resource.kind.parse()?;
        if !kind.has_version_marker() {
            return Ok(VersionMarker::AlwaysCurrent);
        }

        let client = self.client.clone();
        let name = resource.name.as_str();
        match kind {
            ResourceKind::Service => {
                marker_of(Api::<Service>::namespaced(client, namespace), name).await
            }
            ResourceKind::Deployment => {
                marker_of(Api::<Deployment>::namespaced(client, namespace), name).await
            }
            ResourceKind::Role => {
                marker_of(Api::<Role>::namespaced(client, namespace), name).await
            }
            ResourceKind::RoleBinding => {
                marker_of(Api::<RoleBinding>::namespaced(client, namespace), name).await
            }
            ResourceKind::ConfigMap => {
                marker_of(Api::<ConfigMap>::namespaced(client, namespace), name).await
            }
            ResourceKind::DaemonSet => {
                marker_of(Api::<DaemonSet>::namespaced(client, namespace), name).await
            }
            ResourceKind::StatefulSet => {
                marker_of(Api::<StatefulSet>::namespaced(client, namespace), name).await
            }
            ResourceKind::ServiceAccount => {
                marker_of(Api::<ServiceAccount>::namespaced(client, namespace), name).await
            }
            ResourceKind::ClusterRole => marker_of(Api::<ClusterRole>::all(client), name).await,
            ResourceKind::ClusterRoleBinding => {
                marker_of(Api::<ClusterRoleBinding>::all(client), name).await
            }
            // handled by the has_version_marker short-circuit above
            ResourceKind::CustomResourceDefinition
            | ResourceKind::CsiDriver
            | ResourceKind::StorageClass => Ok(VersionMarker::AlwaysCurrent),
        }
    }
}

async fn marker_of<K>(api: Api<K>, name: &str) -> Result<VersionMarker>
where
    K: Resource<DynamicType = ()> + Clone + std::fmt::Debug + serde::de::DeserializeOwned,
{
    match api.get_opt(name).await? {
        None => Ok(VersionMarker::Absent),
        Some(obj) => {
            let recorded = obj
                .meta()
                .annotations
                .as_ref()
                .and_then(|a| a.get(CONVERGED_VERSION_ANNOTATION))
                .cloned()
                .unwrap_or_default();
            Ok(VersionMarker::Recorded(recorded))
        }
    }
}

#[async_trait]
impl StalenessProbe for VersionOracle {
    async fn is_stale(
        &self,
        namespace: &str,
        resource: &ResourceRef,
        target: &ClusterVersion,
    ) -> Result<bool> {
        let marker = self.marker(namespace, resource).await?;
        let stale = is_stale_marker(&marker, target);
        tracing::debug!(
            namespace = %namespace,
            kind = %resource.kind,
            name = %resource.name,
            ?marker,
            stale,
            "checked resource convergence marker"
        );
        Ok(stale)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn target() -> ClusterVersion {
        ClusterVersion::Release("v1.14.5-002".parse().unwrap())
    }

    #[test]
    fn kind_parsing_is_case_insensitive() {
        assert_eq!(
            "DaemonSet".parse::<ResourceKind>().unwrap(),
            ResourceKind::DaemonSet
        );
        assert_eq!(
            "clusterrolebinding".parse::<ResourceKind>().unwrap(),
            ResourceKind::ClusterRoleBinding
        );
        assert_eq!(
            "STORAGECLASS".parse::<ResourceKind>().unwrap(),
            ResourceKind::StorageClass
        );
    }

    #[test]
    fn unknown_kind_is_a_hard_error() {
        let err = "FloopGadget".parse::<ResourceKind>().unwrap_err();
        match err {
            Error::UnsupportedResourceKind(kind) => assert_eq!(kind, "FloopGadget"),
            other => panic!("expected UnsupportedResourceKind, got {other:?}"),
        }
    }

    #[test]
    fn marker_free_kinds_never_report_stale() {
        for kind in [
            ResourceKind::CustomResourceDefinition,
            ResourceKind::CsiDriver,
            ResourceKind::StorageClass,
        ] {
            assert!(!kind.has_version_marker());
        }
        assert!(!is_stale_marker(&VersionMarker::AlwaysCurrent, &target()));
    }

    #[test]
    fn absent_object_is_stale() {
        assert!(is_stale_marker(&VersionMarker::Absent, &target()));
    }

    #[test]
    fn marker_mismatch_is_stale() {
        assert!(is_stale_marker(
            &VersionMarker::Recorded("v1.14.3-001".into()),
            &target()
        ));
        assert!(is_stale_marker(&VersionMarker::Recorded(String::new()), &target()));
        assert!(!is_stale_marker(
            &VersionMarker::Recorded("v1.14.5-002".into()),
            &target()
        ));
    }

    #[test]
    fn scoping_matches_kubernetes() {
        assert!(ResourceKind::ClusterRole.is_cluster_scoped());
        assert!(ResourceKind::StorageClass.is_cluster_scoped());
        assert!(!ResourceKind::Deployment.is_cluster_scoped());
        assert!(!ResourceKind::ServiceAccount.is_cluster_scoped());
    }
}
