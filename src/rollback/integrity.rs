use serde::{Deserialize, Serialize};
use walkdir::WalkDir;

use crate::AppResult;

use super::manifest::tree_checksum;
use super::point::RollbackEntry;

/// Result of verifying a stored snapshot against its manifest.
///
/// Always recomputed from disk on demand; an integrity verdict is never
/// cached, so it can never go stale behind a mutated backup.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackupIntegrity {
    pub rollback_point_id: String,
    pub is_valid: bool,
    pub checksum: String,
    pub expected_checksum: String,
    pub files_verified: usize,
    pub total_files: usize,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

/// Recompute the checksum over the stored backup files and compare with
/// the manifest. Missing members and content drift produce per-file
/// diagnostics; unexpected extra files are warnings.
pub fn validate_backup_integrity(entry: &RollbackEntry) -> AppResult<BackupIntegrity> {
    let files_root = entry.files_root();
    let mut errors = Vec::new();
    let mut warnings = Vec::new();

    let mut present = Vec::new();
    for rel in &entry.point.files {
        let path = files_root.join(rel);
        if path.is_file() {
            present.push(rel.clone());
        } else {
            errors.push(format!("missing snapshot member: {rel}"));
        }
    }

    for walked in WalkDir::new(&files_root).follow_links(false) {
        let walked = match walked {
            Ok(walked) => walked,
            Err(err) => {
                errors.push(format!("unreadable snapshot entry: {err}"));
                continue;
            }
        };
        if !walked.file_type().is_file() {
            continue;
        }
        if let Ok(rel) = walked.path().strip_prefix(&files_root) {
            let rel = rel.to_string_lossy().replace('\\', "/");
            if !entry.point.files.iter().any(|f| f == &rel) {
                warnings.push(format!("unexpected file in snapshot: {rel}"));
            }
        }
    }

    // Hash whatever members are present; with a complete set this is the
    // manifest checksum, with a partial set it documents the drift.
    let checksum = tree_checksum(&files_root, &present)?;
    let matches = errors.is_empty() && checksum == entry.point.checksum;
    if !matches && errors.is_empty() {
        errors.push("checksum mismatch detected".to_string());
    }

    Ok(BackupIntegrity {
        rollback_point_id: entry.point.id.clone(),
        is_valid: matches,
        checksum,
        expected_checksum: entry.point.checksum.clone(),
        files_verified: present.len(),
        total_files: entry.point.files.len(),
        errors,
        warnings,
    })
}
