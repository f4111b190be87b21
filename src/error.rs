//! Error types for the Canopy operator
//!
//! The taxonomy follows how errors are handled, not where they arise:
//! configuration errors are fatal for the pass and not retried here,
//! transient infrastructure errors are retried by the caller on the next
//! pass, dependency errors abort a pass before any chart mutation, external
//! tool failures carry the captured process output, and guard violations
//! block deletion until a separate actor remediates.

use thiserror::Error;

/// Main error type for Canopy operations
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// The tenant declared no version and policy forbids defaulting
    #[error("cluster declares no version annotation")]
    MissingVersion,

    /// The declared version string cannot name a catalog
    #[error("invalid version {0:?}")]
    InvalidVersion(String),

    /// No on-disk catalog satisfies the declared version
    #[error("no catalog matches version {0:?}")]
    NoSuchVersion(String),

    /// Catalog descriptor missing, malformed, or self-inconsistent
    #[error("catalog error: {0}")]
    Catalog(String),

    /// Resource kind outside the closed set the staleness oracle knows
    #[error("unsupported resource kind {0:?}")]
    UnsupportedResourceKind(String),

    /// Required environment configuration is absent; fatal, not retryable
    #[error("environment variable {0} is not set")]
    MissingEnv(&'static str),

    /// The tenant API server endpoint has no assigned address yet;
    /// retryable on the next pass
    #[error("endpoint not ready for cluster {0}")]
    EndpointNotReady(String),

    /// Bucket provisioning failed or exhausted its attempts
    #[error("bucket provisioning failed: {0}")]
    BucketProvisioning(String),

    /// A chart's required secret is missing from the cache; detected before
    /// any chart of the pass is deployed
    #[error("chart {chart} requires secret {secret} which is not available")]
    UnsatisfiedChartDependency {
        /// Chart whose dependency check failed
        chart: String,
        /// The missing secret
        secret: String,
    },

    /// An external tool exited non-zero
    #[error("{program} failed with status {code:?}: {stderr}")]
    ExternalTool {
        /// Program that was invoked
        program: String,
        /// Exit code, if the process exited at all
        code: Option<i32>,
        /// Captured standard error
        stderr: String,
    },

    /// Live workload resources still reference the tenant; deletion is
    /// blocked until a separate actor removes them
    #[error("cannot delete cluster with {count} live machine(s)")]
    WorkloadsPresent {
        /// Number of machines still present
        count: usize,
    },

    /// A secret exists but its payload is unusable
    #[error("secret {secret}: {reason}")]
    SecretData {
        /// Secret name
        secret: String,
        /// What was wrong with its data
        reason: String,
    },

    /// Kubernetes API error
    #[error("kubernetes error: {0}")]
    Kube(#[from] kube::Error),

    /// Filesystem or process I/O error
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Template rendering error
    #[error("template error: {0}")]
    Template(#[from] minijinja::Error),

    /// Serialization/deserialization error
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl Error {
    /// Create a catalog error with the given message
    pub fn catalog(msg: impl Into<String>) -> Self {
        Self::Catalog(msg.into())
    }

    /// Create a serialization error with the given message
    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::Serialization(msg.into())
    }

    /// Create a secret payload error
    pub fn secret_data(secret: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::SecretData {
            secret: secret.into(),
            reason: reason.into(),
        }
    }

    /// Whether the condition clears on its own and the pass should simply be
    /// re-run soon, as opposed to configuration that a human must fix.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Error::EndpointNotReady(_) | Error::WorkloadsPresent { .. } | Error::Kube(_)
        )
    }
}

/// Whether a Kubernetes API error is an optimistic-concurrency conflict.
///
/// Conflicts on writes we treat as best-effort mean another writer got
/// there first; the object is already moving where we wanted it.
pub fn is_kube_conflict(err: &kube::Error) -> bool {
    matches!(err, kube::Error::Api(ae) if ae.code == 409)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dependency_error_names_chart_and_secret() {
        let err = Error::UnsatisfiedChartDependency {
            chart: "apiserver".to_string(),
            secret: "k8s-certs".to_string(),
        };
        let msg = err.to_string();
        assert!(msg.contains("apiserver"));
        assert!(msg.contains("k8s-certs"));
    }

    #[test]
    fn endpoint_not_ready_is_transient() {
        assert!(Error::EndpointNotReady("c1".into()).is_transient());
        assert!(Error::WorkloadsPresent { count: 2 }.is_transient());
        assert!(!Error::MissingVersion.is_transient());
        assert!(!Error::MissingEnv("CLOUD_API_URL").is_transient());
    }

    #[test]
    fn external_tool_error_carries_output() {
        let err = Error::ExternalTool {
            program: "kubeadm".to_string(),
            code: Some(1),
            stderr: "unable to load config".to_string(),
        };
        assert!(err.to_string().contains("kubeadm"));
        assert!(err.to_string().contains("unable to load config"));
    }
}
