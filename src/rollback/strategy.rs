use serde::{Deserialize, Serialize};

use super::drill::{RecoveryMechanism, RollbackProcedure};
use super::integrity::BackupIntegrity;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StrategyStatus {
    Success,
    Warning,
    Error,
}

/// Composite verdict over the whole rollback strategy: backup integrity,
/// recovery mechanisms and documented procedures for the active
/// environment.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RollbackValidationResult {
    pub rollback_point_id: String,
    pub is_valid: bool,
    pub backup_integrity: BackupIntegrity,
    pub recovery_mechanisms: Vec<RecoveryMechanism>,
    pub procedures: Vec<RollbackProcedure>,
    pub overall_status: StrategyStatus,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
    pub recommendations: Vec<String>,
}

pub(super) fn compose(
    backup_integrity: BackupIntegrity,
    recovery_mechanisms: Vec<RecoveryMechanism>,
    procedures: Vec<RollbackProcedure>,
) -> RollbackValidationResult {
    let has_errors = !backup_integrity.errors.is_empty()
        || recovery_mechanisms.iter().any(|m| !m.is_functional)
        || procedures.iter().any(|p| !p.is_tested);
    let has_warnings = !backup_integrity.warnings.is_empty()
        || recovery_mechanisms
            .iter()
            .any(|m| !m.test_results.errors.is_empty());

    let overall_status = if has_errors {
        StrategyStatus::Error
    } else if has_warnings {
        StrategyStatus::Warning
    } else {
        StrategyStatus::Success
    };

    let recommendations = recommendations(&backup_integrity, &recovery_mechanisms, &procedures);

    RollbackValidationResult {
        rollback_point_id: backup_integrity.rollback_point_id.clone(),
        is_valid: overall_status == StrategyStatus::Success,
        errors: backup_integrity.errors.clone(),
        warnings: backup_integrity.warnings.clone(),
        backup_integrity,
        recovery_mechanisms,
        procedures,
        overall_status,
        recommendations,
    }
}

fn recommendations(
    integrity: &BackupIntegrity,
    mechanisms: &[RecoveryMechanism],
    procedures: &[RollbackProcedure],
) -> Vec<String> {
    let mut out = Vec::new();

    if !integrity.is_valid {
        out.push("CRITICAL: backup integrity check failed - verify backup files".to_string());
    }

    let failed_mechanisms = mechanisms.iter().filter(|m| !m.is_functional).count();
    if failed_mechanisms > 0 {
        out.push(format!(
            "WARNING: {failed_mechanisms} recovery mechanism(s) failed their dry run"
        ));
    }

    let untested = procedures.iter().filter(|p| !p.is_tested).count();
    if untested > 0 {
        out.push(format!(
            "INFO: {untested} rollback procedure(s) need testing"
        ));
    }

    if out.is_empty() {
        out.push("All rollback systems are operational".to_string());
    }

    out
}
