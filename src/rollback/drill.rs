use std::fs;
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::config::{MountEnv, OrchestratorConfig};
use crate::patch::PatchCommand;
use crate::runner::CommandRunner;

use super::manifest::file_sha256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RecoveryKind {
    GitRollback,
    FileBackup,
    ConfigRestore,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecoveryTestResults {
    pub success: bool,
    pub duration_ms: u64,
    pub errors: Vec<String>,
}

/// A way out of a bad migration, with the verdict of its latest dry run.
/// A mechanism whose dry run failed must not be relied upon live.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecoveryMechanism {
    pub id: String,
    pub name: String,
    pub kind: RecoveryKind,
    pub is_functional: bool,
    pub last_tested: DateTime<Utc>,
    pub test_results: RecoveryTestResults,
}

/// Candidate config files probed by the config-restore drill, in order.
const CONFIG_CANDIDATES: [&str; 3] = ["package.json", "app.json", ".env"];

/// Exercise every registered recovery mechanism in dry-run mode.
///
/// The drills only read state or touch scratch space, so re-running with
/// no intervening change yields the same verdicts.
pub async fn test_recovery_mechanisms(
    config: &OrchestratorConfig,
    runner: &dyn CommandRunner,
) -> Vec<RecoveryMechanism> {
    let mut results = Vec::new();

    results.push(drill_git_rollback(runner).await);
    results.push(drill_file_backup(config));
    results.push(drill_config_restore(config));

    for mechanism in &results {
        info!(
            target: "patchbay",
            event = "recovery_drill",
            mechanism = %mechanism.id,
            functional = mechanism.is_functional,
            duration_ms = mechanism.test_results.duration_ms
        );
    }

    results
}

fn mechanism(
    id: &str,
    name: &str,
    kind: RecoveryKind,
    start: Instant,
    errors: Vec<String>,
) -> RecoveryMechanism {
    let success = errors.is_empty();
    RecoveryMechanism {
        id: id.to_string(),
        name: name.to_string(),
        kind,
        is_functional: success,
        last_tested: Utc::now(),
        test_results: RecoveryTestResults {
            success,
            duration_ms: start.elapsed().as_millis() as u64,
            errors,
        },
    }
}

/// Git revert path: usable only when the working root is a repository
/// with a resolvable HEAD.
async fn drill_git_rollback(runner: &dyn CommandRunner) -> RecoveryMechanism {
    let start = Instant::now();
    let probe = PatchCommand::git("rev-parse", vec!["--verify".into(), "HEAD".into()]);
    let errors = match runner.run(&probe).await {
        Ok(output) if output.success() => Vec::new(),
        Ok(output) => vec![format!(
            "git HEAD not resolvable: {}",
            output.stderr.trim()
        )],
        Err(err) => vec![format!("git probe failed: {err}")],
    };
    mechanism("git-rollback", "Git Rollback", RecoveryKind::GitRollback, start, errors)
}

/// File backup path: write a probe file to scratch space, copy it the
/// way a snapshot would, and verify the copy hashes identically.
fn drill_file_backup(config: &OrchestratorConfig) -> RecoveryMechanism {
    let start = Instant::now();
    let mut errors = Vec::new();

    let outcome = (|| -> crate::AppResult<()> {
        let staging = tempfile::Builder::new()
            .prefix("patchbay-drill-")
            .tempdir_in(resolve_scratch_root(config))
            .map_err(crate::AppError::from)?;
        let probe = staging.path().join("probe.txt");
        fs::write(&probe, b"patchbay recovery probe").map_err(crate::AppError::from)?;
        let copy = staging.path().join("probe-copy.txt");
        fs::copy(&probe, &copy).map_err(crate::AppError::from)?;
        if file_sha256(&probe)? != file_sha256(&copy)? {
            return Err(crate::AppError::new(
                "DRILL/HASH_MISMATCH",
                "probe copy hash mismatch",
            ));
        }
        Ok(())
    })();
    if let Err(err) = outcome {
        errors.push(err.to_string());
    }

    mechanism("file-backup", "File Backup", RecoveryKind::FileBackup, start, errors)
}

/// Config restore path: round-trip the project's config file through
/// scratch space and verify nothing changed.
fn drill_config_restore(config: &OrchestratorConfig) -> RecoveryMechanism {
    let start = Instant::now();
    let mut errors = Vec::new();

    let source = CONFIG_CANDIDATES
        .iter()
        .map(|name| config.working_root.join(name))
        .find(|path| path.is_file());

    match source {
        None => errors.push(format!(
            "no config file found (looked for {})",
            CONFIG_CANDIDATES.join(", ")
        )),
        Some(source) => {
            let outcome = (|| -> crate::AppResult<()> {
                let staging = tempfile::Builder::new()
                    .prefix("patchbay-config-")
                    .tempdir_in(resolve_scratch_root(config))
                    .map_err(crate::AppError::from)?;
                let staged = staging.path().join("config.staged");
                fs::copy(&source, &staged).map_err(crate::AppError::from)?;
                if file_sha256(&source)? != file_sha256(&staged)? {
                    return Err(crate::AppError::new(
                        "DRILL/HASH_MISMATCH",
                        "staged config hash mismatch",
                    ));
                }
                Ok(())
            })();
            if let Err(err) = outcome {
                errors.push(err.to_string());
            }
        }
    }

    mechanism(
        "config-restore",
        "Config Restore",
        RecoveryKind::ConfigRestore,
        start,
        errors,
    )
}

fn resolve_scratch_root(config: &OrchestratorConfig) -> std::path::PathBuf {
    if config.backup_root.exists() || fs::create_dir_all(&config.backup_root).is_ok() {
        config.backup_root.clone()
    } else {
        std::env::temp_dir()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
    Critical,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcedureStep {
    pub step: u32,
    pub action: String,
    pub command: String,
    /// Probe command run during validation; the action itself is never
    /// executed by a drill.
    pub validation: String,
    pub rollback: String,
}

/// A documented, multi-step rollback procedure for one environment.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RollbackProcedure {
    pub id: String,
    pub name: String,
    pub steps: Vec<ProcedureStep>,
    pub environment: MountEnv,
    pub estimated_time_ms: u64,
    pub risk_level: RiskLevel,
    pub is_tested: bool,
}

/// The documented procedures for both sides of the dual mount.
pub fn builtin_procedures() -> Vec<RollbackProcedure> {
    [MountEnv::Legacy, MountEnv::Nextgen]
        .into_iter()
        .map(|env| {
            let label = env.as_str();
            RollbackProcedure {
                id: format!("{label}-rollback"),
                name: format!(
                    "{} Environment Rollback",
                    if env == MountEnv::Legacy { "Legacy" } else { "NextGen" }
                ),
                steps: vec![
                    ProcedureStep {
                        step: 1,
                        action: format!("Stop {label} environment"),
                        command: format!("npm run stop:{label}"),
                        validation: format!("npm run status:{label}"),
                        rollback: format!("npm run start:{label}"),
                    },
                    ProcedureStep {
                        step: 2,
                        action: format!("Restore {label} configuration"),
                        command: format!("git checkout {label}-config"),
                        validation: "git status --porcelain".into(),
                        rollback: "git checkout HEAD -- config/".into(),
                    },
                    ProcedureStep {
                        step: 3,
                        action: format!("Restart {label} environment"),
                        command: format!("npm run start:{label}"),
                        validation: format!("npm run status:{label}"),
                        rollback: format!("npm run stop:{label}"),
                    },
                ],
                environment: env,
                estimated_time_ms: 30_000,
                risk_level: RiskLevel::Medium,
                is_tested: false,
            }
        })
        .collect()
}

/// Walk each documented procedure and run every step's validation probe.
/// `is_tested` is set only when every step's probe succeeds.
pub async fn validate_rollback_procedures(
    runner: &dyn CommandRunner,
    procedures: Vec<RollbackProcedure>,
    environment: Option<MountEnv>,
) -> Vec<RollbackProcedure> {
    let mut validated = Vec::new();
    for mut procedure in procedures {
        if let Some(env) = environment {
            if procedure.environment != env {
                continue;
            }
        }

        let mut all_ok = true;
        for step in &procedure.steps {
            let probe = PatchCommand::shell(step.validation.clone());
            let ok = match runner.run(&probe).await {
                Ok(output) => output.success(),
                Err(_) => false,
            };
            if !ok {
                all_ok = false;
            }
        }
        procedure.is_tested = all_ok;
        info!(
            target: "patchbay",
            event = "procedure_validated",
            procedure = %procedure.id,
            tested = procedure.is_tested
        );
        validated.push(procedure);
    }
    validated
}
