use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

use crate::config::OrchestratorConfig;
use crate::executor::{CancelToken, PatchExecutor};
use crate::gates::{all_validations_passed, failed_validations, GateOutcome, GatePipeline};
use crate::graph::{DependencyGraph, GraphError, PatchPlacement};
use crate::patch::{ExecutionStatus, PatchExecution};
use crate::queue::{PatchQueue, QueuedPatch};
use crate::rollback::RollbackController;
use crate::runner::CommandRunner;
use crate::{AppError, AppResult};

/// Lifecycle of one migration run.
///
/// `RollbackFailed` is terminal and escalates to an operator; the
/// orchestrator never retries a rollback on its own.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RunStatus {
    Pending,
    Running,
    Completed,
    Failed,
    RollingBack,
    RolledBack,
    RollbackFailed,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Pending => "pending",
            RunStatus::Running => "running",
            RunStatus::Completed => "completed",
            RunStatus::Failed => "failed",
            RunStatus::RollingBack => "rolling-back",
            RunStatus::RolledBack => "rolled-back",
            RunStatus::RollbackFailed => "rollback-failed",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "kebab-case")]
pub enum RollbackOutcome {
    NotNeeded,
    Skipped { reason: String },
    RolledBack { point_id: String, files_restored: usize },
    RollbackFailed { error: AppError },
}

/// Everything that happened to one patch during a run.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PatchOutcome {
    pub patch_id: String,
    pub file_name: String,
    pub execution: PatchExecution,
    pub gates: Vec<GateOutcome>,
    pub passed: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunReport {
    pub status: RunStatus,
    pub environment: String,
    pub mount_env: crate::config::MountEnv,
    pub execution_order: Vec<String>,
    pub placements: Vec<PatchPlacement>,
    pub patches: Vec<PatchOutcome>,
    pub rollback: RollbackOutcome,
}

impl RunReport {
    pub fn succeeded(&self) -> bool {
        self.status == RunStatus::Completed
    }
}

/// Options for one run.
#[derive(Debug, Clone)]
pub struct RunOptions {
    /// Resolve, validate and report without executing anything.
    pub dry_run: bool,
    /// Create a rollback point before each patch executes.
    pub auto_backup: bool,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            dry_run: false,
            auto_backup: true,
        }
    }
}

/// Drives one migration run: resolve order, execute patches, judge
/// gates, and fall back to the rollback controller when a required gate
/// fails. All state is owned here for the duration of the run.
pub struct Orchestrator {
    config: OrchestratorConfig,
    runner: Arc<dyn CommandRunner>,
    rollback: RollbackController,
    cancel: CancelToken,
}

impl Orchestrator {
    pub fn new(config: OrchestratorConfig, runner: Arc<dyn CommandRunner>) -> Self {
        let rollback = RollbackController::new(config.clone(), Arc::clone(&runner));
        Self {
            config,
            runner,
            rollback,
            cancel: CancelToken::new(),
        }
    }

    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    pub fn rollback_controller(&self) -> &RollbackController {
        &self.rollback
    }

    /// Run every pending patch in dependency order.
    ///
    /// Graph problems abort before anything executes; command and gate
    /// failures are captured as structured results and decide the run's
    /// terminal state instead of crashing the process.
    pub async fn run(&self, queue: &PatchQueue, options: &RunOptions) -> AppResult<RunReport> {
        let _lock = queue.lock()?;

        let pending = queue.pending()?;
        let definitions: Vec<_> = pending
            .iter()
            .map(|queued| queued.patch.definition.clone())
            .collect();
        let graph = DependencyGraph::build(&definitions).map_err(graph_error)?;
        let execution_order = graph.execution_order();
        let placements = graph.placement_report();
        for placement in placements.iter().filter(|p| p.can_run_earlier) {
            info!(
                target: "patchbay",
                event = "patch_could_run_earlier",
                patch = %placement.patch_id,
                declared_index = placement.declared_index,
                earliest_index = placement.earliest_index
            );
        }

        let mut report = RunReport {
            status: RunStatus::Pending,
            environment: self.config.environment.clone(),
            mount_env: self.config.mount_env,
            execution_order: execution_order.clone(),
            placements,
            patches: Vec::new(),
            rollback: RollbackOutcome::NotNeeded,
        };

        if options.dry_run || pending.is_empty() {
            report.status = RunStatus::Completed;
            return Ok(report);
        }

        report.status = RunStatus::Running;
        let pipeline = GatePipeline::for_config(&self.config, Arc::clone(&self.runner));

        for patch_id in &execution_order {
            if self.cancel.is_cancelled() {
                warn!(target: "patchbay", event = "run_cancelled", at_patch = %patch_id);
                report.status = RunStatus::Failed;
                break;
            }

            let queued = pending
                .iter()
                .find(|queued| &queued.patch.definition.id == patch_id)
                .expect("execution order only contains queued patches");

            let outcome = self
                .run_one_patch(queue, queued, &pipeline, options)
                .await?;
            let passed = outcome.passed;
            report.patches.push(outcome);

            if !passed {
                report.status = RunStatus::Failed;
                break;
            }
        }

        if report.status == RunStatus::Running {
            report.status = RunStatus::Completed;
            info!(
                target: "patchbay",
                event = "run_completed",
                patches = report.patches.len()
            );
            return Ok(report);
        }

        // A required failure (or cancellation) halts forward progress;
        // consult the rollback controller for the way back.
        report.status = RunStatus::RollingBack;
        report.rollback = self.evaluate_rollback(options).await;
        report.status = match &report.rollback {
            RollbackOutcome::RolledBack { .. } => RunStatus::RolledBack,
            RollbackOutcome::RollbackFailed { .. } => RunStatus::RollbackFailed,
            RollbackOutcome::NotNeeded | RollbackOutcome::Skipped { .. } => RunStatus::Failed,
        };
        Ok(report)
    }

    async fn run_one_patch(
        &self,
        queue: &PatchQueue,
        queued: &QueuedPatch,
        pipeline: &GatePipeline,
        options: &RunOptions,
    ) -> AppResult<PatchOutcome> {
        let patch_id = &queued.patch.definition.id;
        info!(target: "patchbay", event = "patch_start", patch = %patch_id);

        // The rollback point must exist before any required gate is
        // allowed to fail destructively.
        if options.auto_backup {
            self.rollback
                .create_rollback_point(
                    self.config.mount_env,
                    &format!("before {patch_id}"),
                    Some(patch_id),
                )
                .await?;
        }

        let mut execution =
            PatchExecution::new(patch_id.clone(), queued.patch.commands.clone());
        let executor =
            PatchExecutor::new(self.runner.as_ref()).with_cancel_token(self.cancel.clone());
        executor.execute(&mut execution).await;

        let gates = pipeline.run_all().await;
        let commands_ok = execution.status == ExecutionStatus::Completed;
        let required_ok = all_validations_passed(&gates);
        let passed = commands_ok && required_ok;

        for failure in failed_validations(&gates) {
            warn!(target: "patchbay", event = "gate_failure", patch = %patch_id, failure = %failure);
        }

        let outcome = PatchOutcome {
            patch_id: patch_id.clone(),
            file_name: queued.file_name.clone(),
            execution,
            gates,
            passed,
        };

        queue.write_summary(patch_id, &crate::report::summary_markdown(&outcome))?;
        if passed {
            queue.complete(queued)?;
        } else {
            queue.fail(queued)?;
        }

        info!(
            target: "patchbay",
            event = "patch_finished",
            patch = %patch_id,
            passed,
            commands_ok,
            required_gates_ok = required_ok
        );
        Ok(outcome)
    }

    /// Restore the last good rollback point, but only through a strategy
    /// that verifies: integrity must hold and the file-backup mechanism
    /// must have passed its dry run.
    async fn evaluate_rollback(&self, options: &RunOptions) -> RollbackOutcome {
        if !options.auto_backup {
            return RollbackOutcome::Skipped {
                reason: "auto-backup disabled for this run".into(),
            };
        }

        let entry = match self.rollback.latest_rollback_point() {
            Ok(Some(entry)) => entry,
            Ok(None) => {
                return RollbackOutcome::RollbackFailed {
                    error: AppError::new("ROLLBACK/NO_POINTS", "no rollback point to restore"),
                }
            }
            Err(err) => return RollbackOutcome::RollbackFailed { error: err },
        };

        let mechanisms = self.rollback.test_recovery_mechanisms().await;
        let file_backup_ok = mechanisms
            .iter()
            .filter(|m| m.kind == crate::rollback::RecoveryKind::FileBackup)
            .all(|m| m.is_functional);
        if !file_backup_ok {
            return RollbackOutcome::RollbackFailed {
                error: AppError::new(
                    "ROLLBACK/MECHANISM",
                    "file-backup recovery mechanism failed its dry run",
                ),
            };
        }

        match self.rollback.restore(&entry) {
            Ok(files_restored) => {
                info!(
                    target: "patchbay",
                    event = "rolled_back",
                    point = %entry.point.id,
                    files_restored
                );
                RollbackOutcome::RolledBack {
                    point_id: entry.point.id.clone(),
                    files_restored,
                }
            }
            Err(err) => {
                error!(
                    target: "patchbay",
                    event = "rollback_failed",
                    point = %entry.point.id,
                    error = %err
                );
                RollbackOutcome::RollbackFailed { error: err }
            }
        }
    }
}

fn graph_error(err: GraphError) -> AppError {
    let code = match err {
        GraphError::Cycle(_) => "GRAPH/CYCLE",
        GraphError::UnknownDependency { .. } => "GRAPH/UNKNOWN_DEPENDENCY",
        GraphError::DuplicateId(_) => "GRAPH/DUPLICATE_ID",
    };
    AppError::new(code, err.to_string())
}
