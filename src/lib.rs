//! Canopy - control-plane convergence operator for managed tenant clusters
//!
//! Canopy runs on a management cluster and continuously converges the control
//! plane of each tenant Kubernetes cluster it manages. For every tenant it
//! resolves a target software version, materializes the graph of credential
//! and PKI secrets that version requires, deploys a versioned catalog of
//! resource bundles ("charts") to both the management cluster's per-tenant
//! namespace and the tenant cluster's own system namespace, and tears
//! everything down on deletion without stranding live workloads.
//!
//! # Architecture
//!
//! A reconcile pass is a straight-line sequence of idempotent steps; safety
//! under crash/retry comes from every step re-checking existing state before
//! acting, not from transactions. Passes for different tenants run
//! concurrently and share nothing mutable except the read-only chart catalogs
//! on disk and the injected object-storage session.
//!
//! # Modules
//!
//! - [`crd`] - TenantCluster Custom Resource Definition
//! - [`version`] - resolution of declared versions against on-disk catalogs
//! - [`catalog`] - the versioned chart catalog and its on-disk JSON format
//! - [`staleness`] - per-resource convergence-version inspection
//! - [`charts`] - chart rendering and server-side apply
//! - [`secrets`] - the secret generation/propagation pipeline
//! - [`bootstrap`] - join tokens and one-time addon installation
//! - [`endpoint`] - the tenant API server's load-balanced endpoint
//! - [`orchestrator`] - the dual-target deployment driver
//! - [`deletion`] - the guarded deletion protocol
//! - [`command`] - external tool execution
//! - [`controller`] - kube-runtime reconciliation wiring
//! - [`error`] - error types for the operator

#![deny(missing_docs)]

pub mod bootstrap;
pub mod catalog;
pub mod charts;
pub mod command;
pub mod controller;
pub mod crd;
pub mod deletion;
pub mod endpoint;
pub mod error;
pub mod orchestrator;
pub mod secrets;
pub mod staleness;
pub mod version;

pub use error::Error;

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Annotation on the TenantCluster object declaring the requested version
pub const VERSION_ANNOTATION: &str = "canopy.dev/version";

/// Annotation stamped on every deployed resource recording the version it
/// was last converged to. The staleness oracle reads this marker back.
pub const CONVERGED_VERSION_ANNOTATION: &str = "canopy.dev/converged-version";

/// Finalizer protecting tenant-critical objects until the deletion protocol
/// explicitly releases them. Must contain a '/' to pass apiserver validation.
pub const CLUSTER_FINALIZER: &str = "canopy.dev/cluster";

/// Namespace on the management cluster holding the shared source copies of
/// propagated secrets (object-storage credentials, registry credentials, CA
/// bundle).
pub const SHARED_SECRETS_NAMESPACE: &str = "kube-system";

/// Environment variable carrying the control-plane API base URL stamped into
/// each tenant's cloud credential secret. Absence is a fatal configuration
/// error surfaced by the secret pipeline.
pub const CLOUD_API_URL_ENV: &str = "CLOUD_API_URL";

/// Field manager used for all server-side apply patches
pub const FIELD_MANAGER: &str = "canopy-controller";

/// The external join-authority tool: generates PKI trees and client
/// credentials, registers bootstrap tokens, and installs cluster addons.
pub const JOIN_AUTHORITY_TOOL: &str = "kubeadm";

/// The namespace on the management cluster holding one tenant's control
/// plane components and secrets.
pub fn tenant_namespace(cluster: &str) -> String {
    format!("kube-system-{cluster}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tenant_namespace_is_prefixed() {
        assert_eq!(tenant_namespace("prod-7"), "kube-system-prod-7");
    }

    #[test]
    fn finalizer_is_apiserver_valid() {
        // Finalizers without a qualified prefix are rejected by the apiserver.
        assert!(CLUSTER_FINALIZER.contains('/'));
    }
}
