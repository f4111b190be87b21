//! External tool execution
//!
//! Every external process (the join-authority tool, primarily) runs through
//! the [`CommandRunner`] seam so orchestration logic stays testable without
//! spawning real processes. Output is captured, logged, and returned as
//! structured data rather than inspected via side channels.

use async_trait::async_trait;
use tokio::process::Command;
use tracing::debug;

#[cfg(test)]
use mockall::automock;

use crate::{Error, Result};

/// Captured result of one process invocation
#[derive(Clone, Debug)]
pub struct CommandOutput {
    /// Exit code; `None` if the process was terminated by a signal
    pub code: Option<i32>,
    /// Captured standard output, trimmed
    pub stdout: String,
    /// Captured standard error, trimmed
    pub stderr: String,
}

impl CommandOutput {
    /// Whether the process exited zero
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }
}

/// Seam for spawning external tools
#[cfg_attr(test, automock)]
#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// Run `program` with `args` to completion and capture its output.
    ///
    /// A non-zero exit is not an error at this level; callers decide via
    /// [`run_checked`] whether it is fatal.
    async fn run(&self, program: &str, args: &[String]) -> Result<CommandOutput>;
}

/// Runner that spawns real processes via tokio
pub struct ProcessRunner;

#[async_trait]
impl CommandRunner for ProcessRunner {
    async fn run(&self, program: &str, args: &[String]) -> Result<CommandOutput> {
        debug!(program = %program, ?args, "running external tool");

        let output = Command::new(program)
            .args(args)
            .kill_on_drop(true)
            .output()
            .await?;

        let stdout = String::from_utf8_lossy(&output.stdout).trim().to_string();
        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        if !stdout.is_empty() {
            debug!(program = %program, "stdout: {stdout}");
        }
        if !stderr.is_empty() {
            debug!(program = %program, "stderr: {stderr}");
        }

        Ok(CommandOutput {
            code: output.status.code(),
            stdout,
            stderr,
        })
    }
}

/// Run a tool and fail the pass if it exits non-zero, carrying the captured
/// stderr in the error.
pub async fn run_checked(
    runner: &dyn CommandRunner,
    program: &str,
    args: &[String],
) -> Result<CommandOutput> {
    let output = runner.run(program, args).await?;
    if !output.success() {
        return Err(Error::ExternalTool {
            program: program.to_string(),
            code: output.code,
            stderr: output.stderr,
        });
    }
    Ok(output)
}

/// Build an argument vector from string-ish pieces
pub fn args<I, S>(parts: I) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    parts.into_iter().map(Into::into).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn run_checked_passes_through_success() {
        let mut runner = MockCommandRunner::new();
        runner.expect_run().times(1).returning(|_, _| {
            Ok(CommandOutput {
                code: Some(0),
                stdout: "token-abc".into(),
                stderr: String::new(),
            })
        });

        let out = run_checked(&runner, "kubeadm", &args(["token", "list"]))
            .await
            .unwrap();
        assert_eq!(out.stdout, "token-abc");
    }

    #[tokio::test]
    async fn run_checked_maps_nonzero_exit_to_tool_failure() {
        let mut runner = MockCommandRunner::new();
        runner.expect_run().times(1).returning(|_, _| {
            Ok(CommandOutput {
                code: Some(2),
                stdout: String::new(),
                stderr: "no such config".into(),
            })
        });

        let err = run_checked(&runner, "kubeadm", &args(["init"]))
            .await
            .unwrap_err();
        match err {
            Error::ExternalTool {
                program,
                code,
                stderr,
            } => {
                assert_eq!(program, "kubeadm");
                assert_eq!(code, Some(2));
                assert_eq!(stderr, "no such config");
            }
            other => panic!("expected ExternalTool, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn process_runner_captures_real_output() {
        let out = ProcessRunner
            .run("sh", &args(["-c", "echo hello; echo oops >&2; exit 3"]))
            .await
            .unwrap();
        assert_eq!(out.code, Some(3));
        assert_eq!(out.stdout, "hello");
        assert_eq!(out.stderr, "oops");
        assert!(!out.success());
    }
}
