//! Tenant cluster bootstrap
//!
//! Covers everything that talks to the tenant cluster through its admin
//! credential: materializing a scoped kubeconfig file, join-token
//! maintenance for the machine-provisioning collaborator, and the one-time
//! addon bootstrap (proxy, config upload, cluster DNS) that runs exactly
//! once per tenant, guarded by the presence of the proxy daemon set.

use std::io::Write;
use std::path::Path;

use k8s_openapi::api::apps::v1::DaemonSet;
use kube::api::Api;
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::{Client, Config};
use tempfile::NamedTempFile;
use tracing::info;

use crate::command::{args, run_checked, CommandRunner};
use crate::secrets::get_secret_data;
use crate::{Error, Result, JOIN_AUTHORITY_TOOL};

/// Secret holding the tenant admin credential
pub const ADMIN_KUBECONFIG_SECRET: &str = "admin-kubeconfig";

/// Data key inside the admin credential secret
pub const ADMIN_KUBECONFIG_KEY: &str = "admin.conf";

/// Marker workload whose presence means addon bootstrap already ran
pub const PROXY_DAEMONSET: &str = "kube-proxy";

/// System namespace inside the tenant cluster
pub const TENANT_SYSTEM_NAMESPACE: &str = "kube-system";

/// Write the tenant's admin credential to a temporary file.
///
/// The file is removed when the returned handle drops, on every exit path;
/// callers keep it alive only for the duration of the operation that needs
/// a file-backed credential.
pub async fn admin_kubeconfig_file(client: &Client, cluster_name: &str) -> Result<NamedTempFile> {
    let namespace = crate::tenant_namespace(cluster_name);
    let data = get_secret_data(client, &namespace, ADMIN_KUBECONFIG_SECRET)
        .await?
        .ok_or_else(|| {
            Error::secret_data(ADMIN_KUBECONFIG_SECRET, format!("missing from {namespace}"))
        })?;

    let kubeconfig = data
        .get(ADMIN_KUBECONFIG_KEY)
        .filter(|v| !v.is_empty())
        .ok_or_else(|| {
            Error::secret_data(
                ADMIN_KUBECONFIG_SECRET,
                format!("{ADMIN_KUBECONFIG_KEY} is empty for cluster {cluster_name}"),
            )
        })?;

    let mut file = NamedTempFile::new()?;
    file.write_all(kubeconfig)?;
    file.flush()?;
    Ok(file)
}

/// Build a short-lived client for the tenant cluster from a kubeconfig file.
pub async fn tenant_cluster_client(kubeconfig_path: &Path) -> Result<Client> {
    let kubeconfig = Kubeconfig::read_from(kubeconfig_path)
        .map_err(|e| Error::serialization(format!("admin kubeconfig: {e}")))?;
    let config = Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
        .await
        .map_err(|e| Error::serialization(format!("admin kubeconfig: {e}")))?;
    Ok(Client::try_from(config)?)
}

/// Whether the proxy addon already runs in the tenant cluster
pub async fn proxy_addon_present(tenant_client: &Client) -> Result<bool> {
    let api: Api<DaemonSet> = Api::namespaced(tenant_client.clone(), TENANT_SYSTEM_NAMESPACE);
    Ok(api.get_opt(PROXY_DAEMONSET).await?.is_some())
}

/// Parsed view of `token list` output: reusable tokens and expired ones
#[derive(Debug, Default, PartialEq, Eq)]
pub struct TokenList {
    /// Tokens still valid for joining
    pub valid: Vec<String>,
    /// Tokens the tool marked `<invalid>`; candidates for pruning
    pub expired: Vec<String>,
}

/// Parse the join-authority tool's token table. The first line is a header;
/// the second column is the TTL, `<invalid>` for expired tokens.
pub fn parse_token_list(stdout: &str) -> TokenList {
    let mut list = TokenList::default();
    for line in stdout.lines().skip(1) {
        let mut columns = line.split_whitespace();
        let (Some(token), Some(ttl)) = (columns.next(), columns.next()) else {
            continue;
        };
        if ttl == "<invalid>" {
            list.expired.push(token.to_string());
        } else {
            list.valid.push(token.to_string());
        }
    }
    list
}

/// Return a valid bootstrap join token for the tenant, pruning expired
/// tokens, reusing an existing valid one, and creating a fresh token only
/// when none remains.
pub async fn join_token(runner: &dyn CommandRunner, kubeconfig: &Path) -> Result<String> {
    let kc = kubeconfig.to_string_lossy().to_string();

    let listed = run_checked(
        runner,
        JOIN_AUTHORITY_TOOL,
        &args(["--kubeconfig", kc.as_str(), "token", "list"]),
    )
    .await?;
    let tokens = parse_token_list(&listed.stdout);

    for expired in &tokens.expired {
        run_checked(
            runner,
            JOIN_AUTHORITY_TOOL,
            &args(["--kubeconfig", kc.as_str(), "token", "delete", expired]),
        )
        .await?;
    }

    if let Some(token) = tokens.valid.first() {
        return Ok(token.clone());
    }

    let created = run_checked(
        runner,
        JOIN_AUTHORITY_TOOL,
        &args(["--kubeconfig", kc.as_str(), "token", "create", "--ttl", "1h"]),
    )
    .await?;
    Ok(created.stdout)
}

/// One-time addon bootstrap: register a bootstrap token, install the proxy
/// addon, upload the authority's own config, and install cluster DNS. Four
/// sequential tool invocations; any failure aborts the pass.
pub async fn bootstrap_addons(
    runner: &dyn CommandRunner,
    kubeconfig: &Path,
    endpoint_host: &str,
    pod_cidr: &str,
    service_cidr: &str,
) -> Result<()> {
    let kc = kubeconfig.to_string_lossy().to_string();

    run_checked(
        runner,
        JOIN_AUTHORITY_TOOL,
        &args([
            "--kubeconfig",
            kc.as_str(),
            "init",
            "phase",
            "bootstrap-token",
        ]),
    )
    .await?;

    run_checked(
        runner,
        JOIN_AUTHORITY_TOOL,
        &args([
            "--kubeconfig",
            kc.as_str(),
            "init",
            "phase",
            "addon",
            "kube-proxy",
            "--apiserver-advertise-address",
            endpoint_host,
            "--pod-network-cidr",
            pod_cidr,
        ]),
    )
    .await?;

    run_checked(
        runner,
        JOIN_AUTHORITY_TOOL,
        &args([
            "--kubeconfig",
            kc.as_str(),
            "init",
            "phase",
            "upload-config",
            "kubeadm",
        ]),
    )
    .await?;

    run_checked(
        runner,
        JOIN_AUTHORITY_TOOL,
        &args([
            "--kubeconfig",
            kc.as_str(),
            "init",
            "phase",
            "addon",
            "coredns",
            "--service-cidr",
            service_cidr,
        ]),
    )
    .await?;

    info!(endpoint = %endpoint_host, "bootstrapped tenant addons");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::{CommandOutput, MockCommandRunner};

    fn ok_output(stdout: &str) -> Result<CommandOutput> {
        Ok(CommandOutput {
            code: Some(0),
            stdout: stdout.to_string(),
            stderr: String::new(),
        })
    }

    #[test]
    fn token_table_parses_valid_and_expired_rows() {
        let stdout = "\
TOKEN                     TTL         EXPIRES   USAGES    DESCRIPTION
abcdef.0123456789abcdef   <invalid>   -         signing   -
012345.fedcba9876543210   22h         2019-07-01T12:00:00Z signing -
999999.aaaaaaaaaaaaaaaa   <invalid>   -         signing   -";

        let list = parse_token_list(stdout);
        assert_eq!(list.valid, ["012345.fedcba9876543210"]);
        assert_eq!(
            list.expired,
            ["abcdef.0123456789abcdef", "999999.aaaaaaaaaaaaaaaa"]
        );
    }

    #[test]
    fn empty_token_table_parses_to_nothing() {
        let list = parse_token_list("TOKEN TTL EXPIRES USAGES DESCRIPTION");
        assert_eq!(list, TokenList::default());
    }

    #[tokio::test]
    async fn join_token_prunes_expired_and_reuses_valid() {
        let mut runner = MockCommandRunner::new();
        let mut seq = mockall::Sequence::new();
        runner
            .expect_run()
            .times(1)
            .in_sequence(&mut seq)
            .withf(|_, args| args.ends_with(&["token".into(), "list".into()]))
            .returning(|_, _| {
                ok_output(
                    "TOKEN TTL EXPIRES USAGES DESCRIPTION\n\
                     old.token <invalid> - signing -\n\
                     live.token 12h - signing -",
                )
            });
        runner
            .expect_run()
            .times(1)
            .in_sequence(&mut seq)
            .withf(|_, args| {
                args.windows(2)
                    .any(|w| w == ["delete".to_string(), "old.token".to_string()])
            })
            .returning(|_, _| ok_output(""));

        let token = join_token(&runner, Path::new("/tmp/kc")).await.unwrap();
        assert_eq!(token, "live.token");
    }

    #[tokio::test]
    async fn join_token_creates_when_none_valid() {
        let mut runner = MockCommandRunner::new();
        let mut seq = mockall::Sequence::new();
        runner
            .expect_run()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _| ok_output("TOKEN TTL EXPIRES USAGES DESCRIPTION"));
        runner
            .expect_run()
            .times(1)
            .in_sequence(&mut seq)
            .withf(|_, args| args.iter().any(|a| a == "create"))
            .returning(|_, _| ok_output("fresh.token"));

        let token = join_token(&runner, Path::new("/tmp/kc")).await.unwrap();
        assert_eq!(token, "fresh.token");
    }

    #[tokio::test]
    async fn addon_bootstrap_runs_four_phases_in_order() {
        let mut runner = MockCommandRunner::new();
        let mut seq = mockall::Sequence::new();

        let phases: [&[&str]; 4] = [
            &["bootstrap-token"],
            &["addon", "kube-proxy"],
            &["upload-config", "kubeadm"],
            &["addon", "coredns"],
        ];
        for phase in phases {
            let expected: Vec<String> = phase.iter().map(|s| s.to_string()).collect();
            runner
                .expect_run()
                .times(1)
                .in_sequence(&mut seq)
                .withf(move |program, args| {
                    program == JOIN_AUTHORITY_TOOL
                        && args.windows(expected.len()).any(|w| w == expected)
                })
                .returning(|_, _| ok_output(""));
        }

        bootstrap_addons(
            &runner,
            Path::new("/tmp/kc"),
            "203.0.113.9",
            "10.2.0.0/16",
            "10.128.0.0/16",
        )
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn addon_bootstrap_aborts_on_first_failure() {
        let mut runner = MockCommandRunner::new();
        let mut seq = mockall::Sequence::new();
        runner
            .expect_run()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _| ok_output(""));
        runner
            .expect_run()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _| {
                Ok(CommandOutput {
                    code: Some(1),
                    stdout: String::new(),
                    stderr: "proxy addon failed".into(),
                })
            });
        // phases three and four never run

        let err = bootstrap_addons(
            &runner,
            Path::new("/tmp/kc"),
            "203.0.113.9",
            "10.2.0.0/16",
            "10.128.0.0/16",
        )
        .await
        .unwrap_err();
        assert!(matches!(err, Error::ExternalTool { .. }));
    }

    #[tokio::test]
    async fn addon_bootstrap_passes_network_parameters() {
        let mut inspecting = MockCommandRunner::new();
        let mut seq = mockall::Sequence::new();
        inspecting
            .expect_run()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _| ok_output(""));
        inspecting
            .expect_run()
            .times(1)
            .in_sequence(&mut seq)
            .withf(|_, args| {
                args.windows(2).any(|w| {
                    w == [
                        "--apiserver-advertise-address".to_string(),
                        "198.51.100.4".to_string(),
                    ]
                }) && args
                    .windows(2)
                    .any(|w| w == ["--pod-network-cidr".to_string(), "10.64.0.0/16".to_string()])
            })
            .returning(|_, _| ok_output(""));
        inspecting
            .expect_run()
            .times(2)
            .in_sequence(&mut seq)
            .returning(|_, _| ok_output(""));

        bootstrap_addons(
            &inspecting,
            Path::new("/tmp/kc"),
            "198.51.100.4",
            "10.64.0.0/16",
            "10.128.0.0/16",
        )
        .await
        .unwrap();
    }
}
