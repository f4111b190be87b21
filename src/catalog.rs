//! The versioned chart catalog
//!
//! A catalog is a directory named after a resolved version. Its root
//! descriptor (`charts.json`) lists the charts to deploy on each side, the
//! secrets each side requires, and the required-data-key format used to
//! validate secrets before reuse. Each listed chart has its own directory
//! containing a descriptor (`chart.json`) plus the manifest templates the
//! chart renders.
//!
//! Exactly one catalog instance exists per reconcile pass and it is never
//! mutated after load.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::version::ClusterVersion;
use crate::{Error, Result};

/// Root descriptor file name inside a version directory
pub const CATALOG_FILE: &str = "charts.json";

/// Per-chart descriptor file name inside a chart directory
pub const CHART_FILE: &str = "chart.json";

/// What kind of Kubernetes secret a descriptor materializes as
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
pub enum SecretKind {
    /// `Opaque`
    #[default]
    #[serde(rename = "opaque")]
    Opaque,
    /// `kubernetes.io/dockerconfigjson`
    #[serde(rename = "docker-credentials")]
    DockerCredentials,
}

impl SecretKind {
    /// The Kubernetes `type` field value for this kind
    pub fn k8s_type(&self) -> &'static str {
        match self {
            SecretKind::Opaque => "Opaque",
            SecretKind::DockerCredentials => "kubernetes.io/dockerconfigjson",
        }
    }
}

/// A secret a chart set depends on
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
pub struct SecretDescriptor {
    /// Secret name
    #[serde(rename = "Name")]
    pub name: String,

    /// Secret type
    #[serde(rename = "Kind", default)]
    pub kind: SecretKind,

    /// Whether the secret carries the tenant finalizer and must survive
    /// until the deletion protocol releases it
    #[serde(rename = "Finalize", default)]
    pub finalize: bool,
}

/// One deployed object whose convergence marker gates a chart's redeploy
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
pub struct ResourceRef {
    /// Resource kind, matched case-insensitively by the staleness oracle
    #[serde(rename = "Kind")]
    pub kind: String,

    /// Resource name
    #[serde(rename = "Name")]
    pub name: String,
}

#[derive(Debug, Deserialize, Serialize)]
struct RootDescriptor {
    #[serde(rename = "CpcCharts")]
    management_charts: Vec<String>,

    #[serde(rename = "LkeCharts")]
    tenant_charts: Vec<String>,

    #[serde(rename = "CpcSecrets", default)]
    management_secrets: Vec<SecretDescriptor>,

    #[serde(rename = "LkeSecrets", default)]
    tenant_secrets: Vec<SecretDescriptor>,

    #[serde(rename = "SecretsRequiredFormat", default)]
    secrets_required_format: BTreeMap<String, Vec<String>>,
}

#[derive(Debug, Deserialize, Serialize)]
struct ChartDescriptor {
    #[serde(rename = "Resources")]
    resources: Vec<ResourceRef>,

    #[serde(rename = "SecretsRequired", default)]
    secrets_required: Vec<SecretDescriptor>,
}

/// A chart loaded from its descriptor: declared resources, required secrets,
/// and the directory holding its manifest templates
#[derive(Clone, Debug)]
pub struct Chart {
    /// Chart name, as listed in the root descriptor
    pub name: String,
    /// Directory containing the chart's descriptor and templates
    pub dir: PathBuf,
    /// Resources whose staleness gates redeploy; never empty
    pub resources: Vec<ResourceRef>,
    /// Catalog secrets this chart consumes
    pub secrets_required: Vec<SecretDescriptor>,
}

/// The chart catalog for one resolved version
#[derive(Debug)]
pub struct ChartCatalog {
    dir: PathBuf,
    version: ClusterVersion,
    root: RootDescriptor,
}

impl ChartCatalog {
    /// Load the catalog for `version` from the version-scoped directory
    /// under `catalog_root`.
    pub fn load(catalog_root: &Path, version: &ClusterVersion) -> Result<Self> {
        let dir = catalog_root.join(version.to_string());
        let descriptor = dir.join(CATALOG_FILE);
        let raw = std::fs::read(&descriptor).map_err(|e| {
            Error::catalog(format!("reading {}: {e}", descriptor.display()))
        })?;
        let root: RootDescriptor = serde_json::from_slice(&raw).map_err(|e| {
            Error::catalog(format!("parsing {}: {e}", descriptor.display()))
        })?;

        Ok(Self {
            dir,
            version: version.clone(),
            root,
        })
    }

    /// The version this catalog was loaded for
    pub fn version(&self) -> &ClusterVersion {
        &self.version
    }

    /// Management-side chart names, in deployment order
    pub fn management_charts(&self) -> &[String] {
        &self.root.management_charts
    }

    /// Tenant-side chart names, in deployment order
    pub fn tenant_charts(&self) -> &[String] {
        &self.root.tenant_charts
    }

    /// Secrets required in the tenant's management-side namespace
    pub fn management_secrets(&self) -> &[SecretDescriptor] {
        &self.root.management_secrets
    }

    /// Secrets required inside the tenant cluster itself
    pub fn tenant_secrets(&self) -> &[SecretDescriptor] {
        &self.root.tenant_secrets
    }

    /// Required data keys for a secret, used to validate it before reuse
    pub fn required_format(&self, secret: &str) -> Option<&[String]> {
        self.root
            .secrets_required_format
            .get(secret)
            .map(Vec::as_slice)
    }

    /// Load one chart's descriptor from its directory.
    ///
    /// A chart declaring zero resources cannot be staleness-checked and is
    /// rejected rather than silently always-redeployed.
    pub fn chart(&self, name: &str) -> Result<Chart> {
        let dir = self.dir.join(name);
        let descriptor = dir.join(CHART_FILE);
        let raw = std::fs::read(&descriptor).map_err(|e| {
            Error::catalog(format!("chart {name}: reading {}: {e}", descriptor.display()))
        })?;
        let parsed: ChartDescriptor = serde_json::from_slice(&raw).map_err(|e| {
            Error::catalog(format!("chart {name}: parsing {}: {e}", descriptor.display()))
        })?;

        if parsed.resources.is_empty() {
            return Err(Error::catalog(format!(
                "chart {name} declares no resources"
            )));
        }

        Ok(Chart {
            name: name.to_string(),
            dir,
            resources: parsed.resources,
            secrets_required: parsed.secrets_required,
        })
    }
}
