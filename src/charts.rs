//! Chart rendering and application
//!
//! A chart directory holds manifest templates (`*.yaml`) rendered with
//! minijinja against the values assembled for the pass, then applied to the
//! target cluster with server-side apply. Every applied object is stamped
//! with the convergence-version marker the staleness oracle reads back on
//! later passes. Nothing here is Tiller-shaped: rendering is local, applying
//! is plain API calls.

use std::path::Path;
use std::str::FromStr;

use async_trait::async_trait;
use kube::api::{Api, DynamicObject, Patch, PatchParams};
use kube::discovery::ApiResource;
use kube::Client;
use serde::Deserialize;
use tracing::{debug, info};

#[cfg(test)]
use mockall::automock;

use crate::catalog::Chart;
use crate::staleness::ResourceKind;
use crate::{Error, Result, CONVERGED_VERSION_ANNOTATION, FIELD_MANAGER};

/// Seam for deploying one chart into one namespace
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ChartEngine: Send + Sync {
    /// Render `chart` with `values` and apply the result into `namespace`,
    /// stamping each object with `marker` as its convergence version.
    async fn deploy_chart(
        &self,
        chart: &Chart,
        namespace: &str,
        values: &serde_json::Value,
        marker: &str,
    ) -> Result<()>;
}

/// Engine applying rendered manifests through a Kubernetes client
pub struct ChartDeployer {
    client: Client,
}

impl ChartDeployer {
    /// Create a deployer targeting the cluster behind `client`
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl ChartEngine for ChartDeployer {
    async fn deploy_chart(
        &self,
        chart: &Chart,
        namespace: &str,
        values: &serde_json::Value,
        marker: &str,
    ) -> Result<()> {
        let manifest = render_chart(&chart.dir, namespace, values)?;
        let applied = apply_manifest(&self.client, namespace, &manifest, marker).await?;
        info!(
            chart = %chart.name,
            namespace = %namespace,
            objects = applied,
            "deployed chart"
        );
        Ok(())
    }
}

/// Render every manifest template in a chart directory into one multi-doc
/// YAML stream. Files render in name order so output is deterministic.
pub fn render_chart(chart_dir: &Path, namespace: &str, values: &serde_json::Value) -> Result<String> {
    let mut context = values.clone();
    if let Some(map) = context.as_object_mut() {
        map.insert(
            "namespace".to_string(),
            serde_json::Value::String(namespace.to_string()),
        );
    }

    let mut template_files = Vec::new();
    for entry in std::fs::read_dir(chart_dir)? {
        let path = entry?.path();
        if path.extension().is_some_and(|e| e == "yaml") {
            template_files.push(path);
        }
    }
    template_files.sort();

    if template_files.is_empty() {
        return Err(Error::catalog(format!(
            "chart directory {} contains no manifest templates",
            chart_dir.display()
        )));
    }

    let env = minijinja::Environment::new();
    let mut rendered = Vec::new();
    for path in &template_files {
        let source = std::fs::read_to_string(path)?;
        let doc = env.render_str(&source, &context)?;
        rendered.push(doc);
    }
    Ok(rendered.join("\n---\n"))
}

/// Apply a multi-doc manifest with server-side apply, returning the number
/// of objects applied.
pub async fn apply_manifest(
    client: &Client,
    default_namespace: &str,
    manifest: &str,
    marker: &str,
) -> Result<usize> {
    let mut applied = 0;
    // Materialize the (!Send) deserializer into owned documents before the
    // await loop so the future stays Send. Each document's parse Result is
    // kept in order, so error handling is identical to streaming: prior
    // documents are applied, then the first parse error is returned.
    let docs: Vec<std::result::Result<serde_yaml::Value, serde_yaml::Error>> =
        serde_yaml::Deserializer::from_str(manifest)
            .map(serde_yaml::Value::deserialize)
            .collect();
    for doc in docs {
        let value = doc.map_err(|e| Error::serialization(format!("manifest parse: {e}")))?;
        if value.is_null() {
            continue;
        }
        let mut object: serde_json::Value = serde_json::to_value(&value)
            .map_err(|e| Error::serialization(format!("manifest convert: {e}")))?;

        let api_version = object_str(&object, "apiVersion")?;
        let kind = object_str(&object, "kind")?;
        let name = object
            .pointer("/metadata/name")
            .and_then(|v| v.as_str())
            .ok_or_else(|| Error::serialization(format!("{kind} object without metadata.name")))?
            .to_string();
        let ar = build_api_resource(&api_version, &kind);

        let cluster_scoped = ResourceKind::from_str(&kind)
            .map(|k| k.is_cluster_scoped())
            .unwrap_or(false);

        stamp_marker(&mut object, marker);

        let api: Api<DynamicObject> = if cluster_scoped {
            Api::all_with(client.clone(), &ar)
        } else {
            Api::namespaced_with(client.clone(), default_namespace, &ar)
        };
        api.patch(
            &name,
            &PatchParams::apply(FIELD_MANAGER).force(),
            &Patch::Apply(&object),
        )
        .await?;

        debug!(kind = %kind, name = %name, marker = %marker, "applied object");
        applied += 1;
    }
    Ok(applied)
}

fn object_str(object: &serde_json::Value, field: &str) -> Result<String> {
    object
        .get(field)
        .and_then(|v| v.as_str())
        .map(str::to_string)
        .ok_or_else(|| Error::serialization(format!("manifest object without {field}")))
}

fn stamp_marker(object: &mut serde_json::Value, marker: &str) {
    let metadata = object
        .as_object_mut()
        .and_then(|o| o.get_mut("metadata"))
        .and_then(|m| m.as_object_mut());
    if let Some(metadata) = metadata {
        let annotations = metadata
            .entry("annotations")
            .or_insert_with(|| serde_json::json!({}));
        if let Some(annotations) = annotations.as_object_mut() {
            annotations.insert(
                CONVERGED_VERSION_ANNOTATION.to_string(),
                serde_json::Value::String(marker.to_string()),
            );
        }
    }
}

/// Build an ApiResource from a manifest's apiVersion and kind.
fn build_api_resource(api_version: &str, kind: &str) -> ApiResource {
    let (group, version) = parse_api_version(api_version);
    ApiResource {
        group: group.to_string(),
        version: version.to_string(),
        api_version: api_version.to_string(),
        kind: kind.to_string(),
        plural: pluralize_kind(kind),
    }
}

/// Parse API version into group and version components
fn parse_api_version(api_version: &str) -> (&str, &str) {
    match api_version.rfind('/') {
        Some(idx) => (&api_version[..idx], &api_version[idx + 1..]),
        // Core API (e.g., "v1")
        None => ("", api_version),
    }
}

/// Convert a Kind to its plural form for Kubernetes API paths.
///
/// Standard suffix rules cover every kind our charts carry; Kubernetes
/// plurals are all-lowercase.
fn pluralize_kind(kind: &str) -> String {
    let lower = kind.to_lowercase();
    if lower.ends_with('s') || lower.ends_with("ch") || lower.ends_with("sh") {
        format!("{lower}es")
    } else if lower.ends_with('y') && !lower.ends_with("ay") && !lower.ends_with("ey") {
        format!("{}ies", &lower[..lower.len() - 1])
    } else {
        format!("{lower}s")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pluralization_matches_api_paths() {
        assert_eq!(pluralize_kind("Deployment"), "deployments");
        assert_eq!(pluralize_kind("StorageClass"), "storageclasses");
        assert_eq!(pluralize_kind("NetworkPolicy"), "networkpolicies");
        assert_eq!(pluralize_kind("Gateway"), "gateways");
        assert_eq!(pluralize_kind("DaemonSet"), "daemonsets");
    }

    #[test]
    fn api_version_splits_into_group_and_version() {
        assert_eq!(parse_api_version("apps/v1"), ("apps", "v1"));
        assert_eq!(parse_api_version("v1"), ("", "v1"));
        assert_eq!(
            parse_api_version("rbac.authorization.k8s.io/v1"),
            ("rbac.authorization.k8s.io", "v1")
        );
    }

    #[test]
    fn marker_stamp_lands_in_annotations() {
        let mut object = serde_json::json!({
            "apiVersion": "v1",
            "kind": "Service",
            "metadata": {"name": "kube-apiserver"},
        });
        stamp_marker(&mut object, "v1.14.5-002");
        assert_eq!(
            object.pointer(&format!(
                "/metadata/annotations/{}",
                CONVERGED_VERSION_ANNOTATION.replace('/', "~1")
            )),
            Some(&serde_json::json!("v1.14.5-002"))
        );
    }

    #[test]
    fn render_substitutes_values_in_name_order() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("10-service.yaml"),
            "kind: Service\nmetadata:\n  name: kube-apiserver-{{ cluster_name }}\n",
        )
        .unwrap();
        std::fs::write(
            dir.path().join("20-deployment.yaml"),
            "kind: Deployment\nmetadata:\n  namespace: {{ namespace }}\n",
        )
        .unwrap();
        // descriptor files are not templates
        std::fs::write(dir.path().join("chart.json"), "{}").unwrap();

        let values = serde_json::json!({"cluster_name": "blue"});
        let out = render_chart(dir.path(), "kube-system-blue", &values).unwrap();

        let service_at = out.find("kube-apiserver-blue").unwrap();
        let deployment_at = out.find("namespace: kube-system-blue").unwrap();
        assert!(service_at < deployment_at);
    }

    #[test]
    fn chart_without_templates_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("chart.json"), "{}").unwrap();

        let err = render_chart(dir.path(), "ns", &serde_json::json!({})).unwrap_err();
        assert!(matches!(err, Error::Catalog(_)));
    }
}
