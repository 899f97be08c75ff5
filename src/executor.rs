use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use tracing::{info, warn};

use crate::patch::{ExecutionStatus, PatchExecution, PatchResult};
use crate::runner::CommandRunner;

/// Cooperative cancellation shared between the orchestrator and an
/// in-flight execution. Checked between commands only; a command that
/// already started always runs to completion.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Executes one patch's commands strictly in order.
pub struct PatchExecutor<'a> {
    runner: &'a dyn CommandRunner,
    cancel: CancelToken,
}

impl<'a> PatchExecutor<'a> {
    pub fn new(runner: &'a dyn CommandRunner) -> Self {
        Self {
            runner,
            cancel: CancelToken::new(),
        }
    }

    pub fn with_cancel_token(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Pre-flight guard: an execution with no commands or an empty patch
    /// id is rejected before anything runs.
    pub fn validate(&self, execution: &PatchExecution) -> bool {
        !execution.patch_id.trim().is_empty() && !execution.commands.is_empty()
    }

    /// Run every command, best-effort: a failing command is recorded and
    /// execution continues, but any failure marks the patch `Failed`.
    ///
    /// Commands never run concurrently; later commands routinely depend
    /// on filesystem and git state left by earlier ones.
    pub async fn execute(&self, execution: &mut PatchExecution) {
        if !self.validate(execution) {
            execution.status = ExecutionStatus::Failed;
            execution.finished_at = Some(Utc::now());
            warn!(
                target: "patchbay",
                event = "execution_rejected",
                patch_id = %execution.patch_id,
                commands = execution.commands.len()
            );
            return;
        }

        execution.status = ExecutionStatus::Running;
        execution.started_at = Some(Utc::now());
        execution.results.clear();
        let mut any_failed = false;
        let mut cancelled = false;

        let commands = execution.commands.clone();
        for (index, command) in commands.iter().enumerate() {
            if self.cancel.is_cancelled() {
                cancelled = true;
                warn!(
                    target: "patchbay",
                    event = "execution_cancelled",
                    patch_id = %execution.patch_id,
                    completed_commands = index
                );
                break;
            }

            let start = Instant::now();
            let result = match self.runner.run(command).await {
                Ok(output) if output.success() => PatchResult {
                    success: true,
                    output: non_empty(output.stdout),
                    error: non_empty(output.stderr),
                    duration_ms: start.elapsed().as_millis() as u64,
                },
                Ok(output) => PatchResult {
                    success: false,
                    output: non_empty(output.stdout),
                    error: Some(if output.stderr.trim().is_empty() {
                        format!("exit code {}", output.exit_code)
                    } else {
                        output.stderr
                    }),
                    duration_ms: start.elapsed().as_millis() as u64,
                },
                Err(err) => PatchResult {
                    success: false,
                    output: None,
                    error: Some(err.to_string()),
                    duration_ms: start.elapsed().as_millis() as u64,
                },
            };

            info!(
                target: "patchbay",
                event = "command_finished",
                patch_id = %execution.patch_id,
                command_index = index,
                kind = command.kind.as_str(),
                success = result.success,
                duration_ms = result.duration_ms
            );

            any_failed |= !result.success;
            execution.results.push(result);
        }

        execution.status = if any_failed || cancelled {
            ExecutionStatus::Failed
        } else {
            ExecutionStatus::Completed
        };
        execution.finished_at = Some(Utc::now());
    }
}

fn non_empty(text: String) -> Option<String> {
    if text.trim().is_empty() {
        None
    } else {
        Some(text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::patch::PatchCommand;
    use crate::runner::fake::ScriptedRunner;
    use crate::runner::CommandOutput;

    fn execution(commands: Vec<PatchCommand>) -> PatchExecution {
        PatchExecution::new("v1.4.100(P0.1.0)", commands)
    }

    #[tokio::test]
    async fn all_commands_run_and_patch_completes() {
        let runner = ScriptedRunner::passing();
        let executor = PatchExecutor::new(&runner);
        let mut exec = execution(vec![
            PatchCommand::shell("mkdir -p src-nextgen"),
            PatchCommand::git("add", vec!["-A".into()]),
        ]);

        executor.execute(&mut exec).await;

        assert_eq!(exec.status, ExecutionStatus::Completed);
        assert_eq!(exec.results.len(), exec.commands.len());
        assert!(exec.results.iter().all(|r| r.success));
        assert!(exec.started_at.is_some() && exec.finished_at.is_some());
    }

    #[tokio::test]
    async fn failing_command_does_not_abort_the_rest() {
        let runner = ScriptedRunner::failing("broken", "boom");
        let executor = PatchExecutor::new(&runner);
        let mut exec = execution(vec![
            PatchCommand::shell("broken"),
            PatchCommand::shell("after"),
        ]);

        executor.execute(&mut exec).await;

        assert_eq!(exec.status, ExecutionStatus::Failed);
        assert_eq!(exec.results.len(), 2);
        assert!(!exec.results[0].success);
        assert_eq!(exec.results[0].error.as_deref(), Some("boom"));
        assert!(exec.results[1].success, "second command still ran");
        assert_eq!(
            runner.calls.lock().unwrap().as_slice(),
            &["broken".to_string(), "after".to_string()]
        );
    }

    #[tokio::test]
    async fn nonzero_exit_without_stderr_is_still_a_failure() {
        let runner = ScriptedRunner::passing().with_response(
            "quiet-fail",
            CommandOutput {
                stdout: String::new(),
                stderr: String::new(),
                exit_code: 2,
            },
        );
        let executor = PatchExecutor::new(&runner);
        let mut exec = execution(vec![PatchCommand::shell("quiet-fail")]);

        executor.execute(&mut exec).await;

        assert_eq!(exec.status, ExecutionStatus::Failed);
        assert_eq!(exec.results[0].error.as_deref(), Some("exit code 2"));
    }

    #[tokio::test]
    async fn empty_execution_fails_validation() {
        let runner = ScriptedRunner::passing();
        let executor = PatchExecutor::new(&runner);

        let mut no_commands = execution(vec![]);
        assert!(!executor.validate(&no_commands));
        executor.execute(&mut no_commands).await;
        assert_eq!(no_commands.status, ExecutionStatus::Failed);
        assert!(no_commands.results.is_empty());

        let blank_id = PatchExecution::new("  ", vec![PatchCommand::shell("noop")]);
        assert!(!executor.validate(&blank_id));
    }

    #[tokio::test]
    async fn cancellation_stops_between_commands_and_keeps_results() {
        let runner = ScriptedRunner::passing();
        let cancel = CancelToken::new();
        let executor = PatchExecutor::new(&runner).with_cancel_token(cancel.clone());

        // Cancel before the run: no command starts, existing state kept.
        cancel.cancel();
        let mut exec = execution(vec![
            PatchCommand::shell("first"),
            PatchCommand::shell("second"),
        ]);
        executor.execute(&mut exec).await;

        assert_eq!(exec.status, ExecutionStatus::Failed);
        assert!(exec.results.is_empty());
        assert!(runner.calls.lock().unwrap().is_empty());
    }
}
