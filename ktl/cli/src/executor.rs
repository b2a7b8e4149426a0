//! A script-runner [`NodeExecutor`] (`spec.md` §6 "custom script runner"):
//! shells out to one configured command per node, passing the node id and
//! command (`apply`/`delete`) as arguments. Helm/kube-apply glue is an
//! external collaborator this workspace does not implement (`spec.md` §2);
//! this executor is the minimal concrete one needed to drive the Stack
//! Runner end to end.

use async_trait::async_trait;
use ktl_protocol::domain::{NodeId, RunCommand};
use ktl_protocol::external::{NodeExecutor, NodeExecutorError};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;

pub struct ShellNodeExecutor {
    program: String,
    args: Vec<String>,
}

impl ShellNodeExecutor {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }
}

#[async_trait]
impl NodeExecutor for ShellNodeExecutor {
    async fn execute(
        &self,
        cancel: CancellationToken,
        node: &NodeId,
        command: RunCommand,
    ) -> Result<(), NodeExecutorError> {
        let command_label = match command {
            RunCommand::Apply => "apply",
            RunCommand::Delete => "delete",
        };

        let mut child = Command::new(&self.program)
            .args(&self.args)
            .arg(command_label)
            .arg(node.0.as_str())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| NodeExecutorError::Permanent(format!("spawn failed: {e}")))?;

        tokio::select! {
            _ = cancel.cancelled() => {
                let _ = child.kill().await;
                Err(NodeExecutorError::Cancelled)
            }
            status = child.wait() => {
                let status = status.map_err(|e| NodeExecutorError::Transient(e.to_string()))?;
                if status.success() {
                    Ok(())
                } else {
                    classify_exit_status(status)
                }
            }
        }
    }
}

/// Exit code `>= 100` is treated as permanent (validation/policy denial by
/// convention); everything else is retried as transient, matching the
/// classifier externalization called out in `spec.md` §9.
fn classify_exit_status(status: std::process::ExitStatus) -> Result<(), NodeExecutorError> {
    let code = status.code().unwrap_or(-1);
    let message = format!("exited with status {code}");
    if code >= 100 {
        Err(NodeExecutorError::Permanent(message))
    } else {
        Err(NodeExecutorError::Transient(message))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::process::ExitStatusExt;

    #[test]
    fn exit_code_below_100_classifies_as_transient() {
        let status = std::process::ExitStatus::from_raw(7 << 8);
        assert!(matches!(
            classify_exit_status(status),
            Err(NodeExecutorError::Transient(_))
        ));
    }

    #[test]
    fn exit_code_100_and_above_classifies_as_permanent() {
        let status = std::process::ExitStatus::from_raw(100 << 8);
        assert!(matches!(
            classify_exit_status(status),
            Err(NodeExecutorError::Permanent(_))
        ));
    }

    #[tokio::test]
    async fn execute_runs_configured_program_with_node_and_command_args() {
        let executor = ShellNodeExecutor::new("true", Vec::new());
        let result = executor
            .execute(
                CancellationToken::new(),
                &NodeId::new("c", "n", "release"),
                RunCommand::Apply,
            )
            .await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn execute_classifies_a_nonzero_exit_as_an_error() {
        let executor = ShellNodeExecutor::new("false", Vec::new());
        let result = executor
            .execute(
                CancellationToken::new(),
                &NodeId::new("c", "n", "release"),
                RunCommand::Delete,
            )
            .await;
        assert!(result.is_err());
    }
}
