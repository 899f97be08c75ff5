use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Instant;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::config::{GateCommands, OrchestratorConfig};
use crate::patch::PatchCommand;
use crate::runner::CommandRunner;
use crate::{AppError, AppResult};

/// Verdict of one validation gate.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidationResult {
    pub success: bool,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
    pub duration_ms: u64,
}

impl ValidationResult {
    pub fn pass(message: impl Into<String>) -> Self {
        Self {
            success: true,
            message: message.into(),
            details: None,
            duration_ms: 0,
        }
    }

    pub fn fail(message: impl Into<String>) -> Self {
        Self {
            success: false,
            message: message.into(),
            details: None,
            duration_ms: 0,
        }
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }
}

type GateFuture = Pin<Box<dyn Future<Output = ValidationResult> + Send>>;
type GateFn = Arc<dyn Fn() -> GateFuture + Send + Sync>;

/// A named check, required or optional, producing a pass/fail verdict.
pub struct ValidationGate {
    pub name: String,
    pub description: String,
    pub required: bool,
    validator: GateFn,
}

impl std::fmt::Debug for ValidationGate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ValidationGate")
            .field("name", &self.name)
            .field("description", &self.description)
            .field("required", &self.required)
            .finish_non_exhaustive()
    }
}

impl ValidationGate {
    pub fn new(
        name: impl Into<String>,
        description: impl Into<String>,
        required: bool,
        validator: impl Fn() -> GateFuture + Send + Sync + 'static,
    ) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            required,
            validator: Arc::new(validator),
        }
    }

    /// Gate that shells out to an external verification command. A
    /// non-zero exit or non-empty stderr is a failure; the pipeline only
    /// ever looks at process output, never at the tool's internals.
    pub fn command(
        name: impl Into<String>,
        description: impl Into<String>,
        required: bool,
        runner: Arc<dyn CommandRunner>,
        command_line: impl Into<String>,
    ) -> Self {
        let name = name.into();
        let description = description.into();
        let command_line = command_line.into();
        let gate_name = name.clone();
        Self::new(name, description, required, move || {
            let runner = Arc::clone(&runner);
            let command_line = command_line.clone();
            let gate_name = gate_name.clone();
            Box::pin(async move {
                let command = PatchCommand::shell(command_line.clone());
                match runner.run(&command).await {
                    Ok(output) => {
                        let stderr_clean = output.stderr.trim().is_empty();
                        if output.success() && stderr_clean {
                            ValidationResult::pass(format!("{gate_name} passed"))
                                .with_details(serde_json::json!({ "stdout": output.stdout }))
                        } else {
                            let reason = if stderr_clean {
                                format!("exit code {}", output.exit_code)
                            } else {
                                output.stderr.trim().to_string()
                            };
                            ValidationResult::fail(format!("{gate_name} failed: {reason}"))
                                .with_details(serde_json::json!({
                                    "stdout": output.stdout,
                                    "stderr": output.stderr,
                                    "exitCode": output.exit_code,
                                }))
                        }
                    }
                    Err(err) => {
                        ValidationResult::fail(format!("{gate_name} could not run: {err}"))
                    }
                }
            })
        })
    }
}

/// One gate's recorded outcome, in registration order.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GateOutcome {
    pub gate: String,
    pub required: bool,
    pub result: ValidationResult,
}

/// Ordered set of validation gates for one migration run.
///
/// Constructed per run; callers pass the instance around rather than
/// importing shared state.
#[derive(Debug)]
pub struct GatePipeline {
    gates: Vec<ValidationGate>,
}

impl GatePipeline {
    pub fn new() -> Self {
        Self { gates: Vec::new() }
    }

    /// The representative default set: compilation, lint, unit tests,
    /// dual-mount integration and environment-specific verification.
    /// Each is individually swappable via `remove_gate`/`add_gate`.
    pub fn with_default_gates(runner: Arc<dyn CommandRunner>, commands: &GateCommands) -> Self {
        let mut pipeline = Self::new();
        pipeline
            .add_gate(ValidationGate::command(
                "compile-check",
                "Compiler check over the migrated tree",
                true,
                Arc::clone(&runner),
                commands.compile.clone(),
            ))
            .expect("default gate names are unique");
        pipeline
            .add_gate(ValidationGate::command(
                "lint-check",
                "Static lint check",
                true,
                Arc::clone(&runner),
                commands.lint.clone(),
            ))
            .expect("default gate names are unique");
        pipeline
            .add_gate(ValidationGate::command(
                "unit-tests",
                "Unit test execution",
                true,
                Arc::clone(&runner),
                commands.unit_tests.clone(),
            ))
            .expect("default gate names are unique");
        pipeline
            .add_gate(ValidationGate::command(
                "dual-mount",
                "Dual-mount system integration check",
                true,
                Arc::clone(&runner),
                commands.dual_mount.clone(),
            ))
            .expect("default gate names are unique");
        pipeline
            .add_gate(ValidationGate::command(
                "environment-specific",
                "Environment-specific verification",
                true,
                runner,
                commands.environment_specific.clone(),
            ))
            .expect("default gate names are unique");
        pipeline
    }

    pub fn for_config(config: &OrchestratorConfig, runner: Arc<dyn CommandRunner>) -> Self {
        Self::with_default_gates(runner, &config.gate_commands)
    }

    pub fn add_gate(&mut self, gate: ValidationGate) -> AppResult<&mut Self> {
        if self.gates.iter().any(|g| g.name == gate.name) {
            return Err(AppError::new(
                "GATE/DUPLICATE",
                format!("gate '{}' is already registered", gate.name),
            ));
        }
        self.gates.push(gate);
        Ok(self)
    }

    pub fn remove_gate(&mut self, name: &str) {
        self.gates.retain(|gate| gate.name != name);
    }

    pub fn gate_names(&self) -> Vec<&str> {
        self.gates.iter().map(|gate| gate.name.as_str()).collect()
    }

    /// Run every registered gate, in registration order. A failing gate
    /// never stops the rest: operators see the complete result set.
    pub async fn run_all(&self) -> Vec<GateOutcome> {
        self.run_filtered(|_| true).await
    }

    /// Run only the gates marked required.
    pub async fn run_required(&self) -> Vec<GateOutcome> {
        self.run_filtered(|gate| gate.required).await
    }

    async fn run_filtered(&self, include: impl Fn(&ValidationGate) -> bool) -> Vec<GateOutcome> {
        let mut outcomes = Vec::new();
        for gate in self.gates.iter().filter(|gate| include(gate)) {
            let start = Instant::now();
            let mut result = (gate.validator)().await;
            // Wall-clock time is recorded here so every gate is timed the
            // same way, whatever its validator does.
            result.duration_ms = start.elapsed().as_millis() as u64;
            info!(
                target: "patchbay",
                event = "gate_finished",
                gate = %gate.name,
                required = gate.required,
                success = result.success,
                duration_ms = result.duration_ms
            );
            outcomes.push(GateOutcome {
                gate: gate.name.clone(),
                required: gate.required,
                result,
            });
        }
        outcomes
    }
}

impl Default for GatePipeline {
    fn default() -> Self {
        Self::new()
    }
}

/// True iff every **required** gate in the result set passed. Optional
/// failures are reported but do not block a run.
pub fn all_validations_passed(outcomes: &[GateOutcome]) -> bool {
    outcomes
        .iter()
        .filter(|outcome| outcome.required)
        .all(|outcome| outcome.result.success)
}

/// Ordered `"<gate>: <message>"` lines for every failing gate, required
/// or optional alike.
pub fn failed_validations(outcomes: &[GateOutcome]) -> Vec<String> {
    outcomes
        .iter()
        .filter(|outcome| !outcome.result.success)
        .map(|outcome| format!("{}: {}", outcome.gate, outcome.result.message))
        .collect()
}
