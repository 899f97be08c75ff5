//! Rollback points, integrity verification and recovery drills.
//!
//! A rollback point is a checksummed snapshot of the configured file set
//! plus commit/branch metadata, created before a risky patch executes.
//! The controller never trusts a snapshot it has not just re-verified.

use std::sync::Arc;

use crate::config::{MountEnv, OrchestratorConfig};
use crate::runner::CommandRunner;
use crate::{AppError, AppResult};

pub mod drill;
pub mod integrity;
pub mod manifest;
pub mod point;
pub mod strategy;

pub use drill::{
    builtin_procedures, test_recovery_mechanisms, validate_rollback_procedures, ProcedureStep,
    RecoveryKind, RecoveryMechanism, RiskLevel, RollbackProcedure,
};
pub use integrity::{validate_backup_integrity, BackupIntegrity};
pub use manifest::{RollbackMetadata, RollbackPoint};
pub use point::{
    create_rollback_point, find_rollback_point, latest_rollback_point, list_rollback_points,
    restore, RollbackEntry,
};
pub use strategy::{RollbackValidationResult, StrategyStatus};

/// Per-run rollback surface. Owns nothing global: each migration run
/// constructs its own controller over its own config and runner.
pub struct RollbackController {
    config: OrchestratorConfig,
    runner: Arc<dyn CommandRunner>,
    procedures: Vec<RollbackProcedure>,
}

impl RollbackController {
    pub fn new(config: OrchestratorConfig, runner: Arc<dyn CommandRunner>) -> Self {
        Self {
            config,
            runner,
            procedures: builtin_procedures(),
        }
    }

    pub fn with_procedures(mut self, procedures: Vec<RollbackProcedure>) -> Self {
        self.procedures = procedures;
        self
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    pub async fn create_rollback_point(
        &self,
        environment: MountEnv,
        description: &str,
        for_patch: Option<&str>,
    ) -> AppResult<RollbackEntry> {
        point::create_rollback_point(
            &self.config,
            self.runner.as_ref(),
            environment,
            description,
            for_patch,
        )
        .await
    }

    pub fn validate_backup_integrity(&self, entry: &RollbackEntry) -> AppResult<BackupIntegrity> {
        integrity::validate_backup_integrity(entry)
    }

    pub fn latest_rollback_point(&self) -> AppResult<Option<RollbackEntry>> {
        point::latest_rollback_point(&self.config.backup_root)
    }

    pub fn find_rollback_point(&self, id: &str) -> AppResult<Option<RollbackEntry>> {
        point::find_rollback_point(&self.config.backup_root, id)
    }

    pub fn list_rollback_points(&self) -> AppResult<Vec<RollbackEntry>> {
        point::list_rollback_points(&self.config.backup_root)
    }

    /// Restore the snapshot over the working root. Integrity is
    /// re-verified first; a mismatching point is never applied.
    pub fn restore(&self, entry: &RollbackEntry) -> AppResult<usize> {
        point::restore(entry, &self.config.working_root)
    }

    pub async fn test_recovery_mechanisms(&self) -> Vec<RecoveryMechanism> {
        drill::test_recovery_mechanisms(&self.config, self.runner.as_ref()).await
    }

    pub async fn validate_rollback_procedures(
        &self,
        environment: Option<MountEnv>,
    ) -> Vec<RollbackProcedure> {
        drill::validate_rollback_procedures(
            self.runner.as_ref(),
            self.procedures.clone(),
            environment,
        )
        .await
    }

    /// Composite gate over the whole strategy: the latest (or named)
    /// rollback point must verify, every recovery mechanism must pass its
    /// dry run, and every procedure for the active environment must be
    /// tested.
    pub async fn validate_rollback_strategy(
        &self,
        rollback_point_id: Option<&str>,
    ) -> AppResult<RollbackValidationResult> {
        let entry = match rollback_point_id {
            Some(id) => self.find_rollback_point(id)?.ok_or_else(|| {
                AppError::new(
                    "ROLLBACK/POINT_NOT_FOUND",
                    format!("rollback point not found: {id}"),
                )
            })?,
            None => self.latest_rollback_point()?.ok_or_else(|| {
                AppError::new("ROLLBACK/NO_POINTS", "no rollback points exist yet")
            })?,
        };

        let backup_integrity = self.validate_backup_integrity(&entry)?;
        let recovery_mechanisms = self.test_recovery_mechanisms().await;
        let procedures = self
            .validate_rollback_procedures(Some(self.config.mount_env))
            .await;

        Ok(strategy::compose(
            backup_integrity,
            recovery_mechanisms,
            procedures,
        ))
    }
}
