use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use fs2::available_space;
use tracing::warn;
use uuid::Uuid;
use walkdir::WalkDir;

use crate::config::{MountEnv, OrchestratorConfig};
use crate::patch::PatchVersionInfo;
use crate::runner::CommandRunner;
use crate::{AppError, AppResult};

use super::manifest::{
    self, read_manifest, tree_checksum, write_atomic, RollbackMetadata, RollbackPoint,
    FILES_DIR_NAME, MANIFEST_FILE_NAME,
};

const PARTIAL_SUFFIX: &str = ".partial";
const REQUIRED_FREE_MULTIPLIER: f64 = 1.2;
const DEFAULT_MAX_COUNT: usize = 5;
const HARD_MAX_COUNT: usize = 20;
const DEFAULT_MAX_BYTES: u64 = 2_000_000_000;
const HARD_MAX_BYTES: u64 = 20_000_000_000;
const MIN_RETENTION_BYTES: u64 = 50_000_000;

/// A rollback point as stored on disk.
#[derive(Debug, Clone)]
pub struct RollbackEntry {
    pub directory: PathBuf,
    pub manifest_path: PathBuf,
    pub point: RollbackPoint,
    pub total_size_bytes: u64,
}

impl RollbackEntry {
    pub fn files_root(&self) -> PathBuf {
        self.directory.join(FILES_DIR_NAME)
    }
}

pub(super) struct RetentionConfig {
    max_count: usize,
    max_bytes: u64,
}

impl RetentionConfig {
    pub(super) fn load() -> Self {
        let max_count = env::var("PATCHBAY_BACKUP_MAX_COUNT")
            .ok()
            .and_then(|value| value.parse::<usize>().ok())
            .filter(|value| *value > 0)
            .map(|value| value.min(HARD_MAX_COUNT))
            .unwrap_or(DEFAULT_MAX_COUNT);

        let max_bytes = env::var("PATCHBAY_BACKUP_MAX_BYTES")
            .ok()
            .and_then(|value| value.parse::<u64>().ok())
            .filter(|value| *value > 0)
            .map(|value| value.clamp(MIN_RETENTION_BYTES, HARD_MAX_BYTES))
            .unwrap_or(DEFAULT_MAX_BYTES);

        Self {
            max_count,
            max_bytes,
        }
    }
}

/// Create a rollback point: snapshot the configured file set, hash it,
/// and record provenance metadata. The snapshot is staged under a
/// `.partial` directory and renamed only once fully copied.
pub async fn create_rollback_point(
    config: &OrchestratorConfig,
    runner: &dyn CommandRunner,
    environment: MountEnv,
    description: &str,
    for_patch: Option<&str>,
) -> AppResult<RollbackEntry> {
    let metadata = gather_metadata(runner, for_patch).await;
    let config = config.clone();
    let environment_owned = environment;
    let description = description.to_string();
    let retention = RetentionConfig::load();
    tokio::task::spawn_blocking(move || {
        create_rollback_point_sync(&config, environment_owned, &description, metadata, &retention)
    })
    .await
    .map_err(|err| {
        AppError::new("ROLLBACK/TASK", "Rollback snapshot task panicked")
            .with_context("error", err.to_string())
    })?
}

async fn gather_metadata(runner: &dyn CommandRunner, for_patch: Option<&str>) -> RollbackMetadata {
    use crate::patch::PatchCommand;

    let mut metadata = RollbackMetadata::unknown();
    if let Ok(author) = env::var("USER") {
        if !author.is_empty() {
            metadata.author = author;
        }
    }

    let head = PatchCommand::git("rev-parse", vec!["HEAD".into()]);
    if let Ok(output) = runner.run(&head).await {
        if output.success() {
            metadata.commit_hash = output.stdout.trim().to_string();
        }
    }
    let branch = PatchCommand::git("rev-parse", vec!["--abbrev-ref".into(), "HEAD".into()]);
    if let Ok(output) = runner.run(&branch).await {
        if output.success() {
            metadata.branch = output.stdout.trim().to_string();
        }
    }

    if let Some(info) = for_patch.and_then(PatchVersionInfo::parse) {
        metadata.phase = info.phase;
        metadata.step = info.step;
        metadata.attempt = info.attempt;
    }

    metadata
}

fn create_rollback_point_sync(
    config: &OrchestratorConfig,
    environment: MountEnv,
    description: &str,
    metadata: RollbackMetadata,
    retention: &RetentionConfig,
) -> AppResult<RollbackEntry> {
    let root = &config.backup_root;
    fs::create_dir_all(root).map_err(|err| {
        AppError::from(err)
            .with_context("operation", "create_backup_root")
            .with_context("path", root.display().to_string())
    })?;

    let files = collect_snapshot_files(config)?;
    if files.is_empty() {
        return Err(AppError::new(
            "ROLLBACK/EMPTY_SNAPSHOT",
            "No files found under the configured snapshot paths",
        ));
    }

    let snapshot_bytes: u64 = files
        .iter()
        .map(|rel| {
            fs::metadata(config.working_root.join(rel))
                .map(|meta| meta.len())
                .unwrap_or(0)
        })
        .sum();
    let required = required_free_bytes(snapshot_bytes);
    let available = free_disk_space(root)?;
    if available < required {
        return Err(AppError::new(
            "ROLLBACK/LOW_DISK",
            format!("Not enough disk space (need ~{}).", format_bytes(required)),
        )
        .with_context("available_bytes", available.to_string())
        .with_context("required_bytes", required.to_string()));
    }

    let timestamp = Utc::now();
    let point_dir = unique_point_dir(root, &timestamp)?;
    fs::create_dir_all(&point_dir).map_err(|err| {
        AppError::from(err)
            .with_context("operation", "create_point_dir")
            .with_context("path", point_dir.display().to_string())
    })?;
    manifest::sync_dir(root).ok();

    let result = (|| -> AppResult<RollbackEntry> {
        let staging = point_dir.join(format!("{FILES_DIR_NAME}{PARTIAL_SUFFIX}"));
        let files_dir = point_dir.join(FILES_DIR_NAME);
        for rel in &files {
            let source = config.working_root.join(rel);
            let target = staging.join(rel);
            if let Some(parent) = target.parent() {
                fs::create_dir_all(parent).map_err(AppError::from)?;
            }
            fs::copy(&source, &target).map_err(|err| {
                AppError::from(err)
                    .with_context("operation", "copy_snapshot_member")
                    .with_context("from", source.display().to_string())
                    .with_context("to", target.display().to_string())
            })?;
        }
        fs::rename(&staging, &files_dir).map_err(|err| {
            AppError::from(err)
                .with_context("operation", "finalize_snapshot")
                .with_context("from", staging.display().to_string())
                .with_context("to", files_dir.display().to_string())
        })?;
        manifest::sync_dir(&point_dir).ok();

        // Hash the snapshot itself: what we verify later is what we
        // stored, not what the working tree has since become.
        let checksum = tree_checksum(&files_dir, &files)?;
        let point = RollbackPoint {
            id: format!("rp-{}", Uuid::now_v7()),
            created_at: timestamp,
            version: env!("CARGO_PKG_VERSION").to_string(),
            environment,
            description: description.to_string(),
            git_tag: Some(format!(
                "rollback-{}-{}",
                env!("CARGO_PKG_VERSION"),
                environment.as_str()
            )),
            files: files.clone(),
            checksum,
            metadata,
        };

        let manifest_path = point_dir.join(MANIFEST_FILE_NAME);
        let payload = serde_json::to_vec_pretty(&point).map_err(AppError::from)?;
        write_atomic(&manifest_path, &payload)?;

        load_entry(&point_dir, point)
    })();

    if result.is_err() {
        let _ = fs::remove_dir_all(&point_dir);
    }

    let entry = result?;
    apply_retention(root, retention)?;
    Ok(entry)
}

/// Files under the configured snapshot paths, relative to the working
/// root, sorted by path.
fn collect_snapshot_files(config: &OrchestratorConfig) -> AppResult<Vec<String>> {
    let mut files = Vec::new();
    for source in config.snapshot_sources() {
        if !source.exists() {
            continue;
        }
        for entry in WalkDir::new(&source).follow_links(false) {
            let entry = entry.map_err(|err| {
                AppError::new("ROLLBACK/WALK", err.to_string())
                    .with_context("path", source.display().to_string())
            })?;
            if !entry.file_type().is_file() {
                continue;
            }
            let rel = entry
                .path()
                .strip_prefix(&config.working_root)
                .map_err(|_| {
                    AppError::new(
                        "ROLLBACK/OUTSIDE_ROOT",
                        "Snapshot path is outside the working root",
                    )
                    .with_context("path", entry.path().display().to_string())
                })?;
            files.push(rel.to_string_lossy().replace('\\', "/"));
        }
    }
    files.sort();
    files.dedup();
    Ok(files)
}

pub fn list_rollback_points(backup_root: &Path) -> AppResult<Vec<RollbackEntry>> {
    if !backup_root.exists() {
        return Ok(Vec::new());
    }

    let mut out = Vec::new();
    for entry in fs::read_dir(backup_root).map_err(|err| {
        AppError::from(err)
            .with_context("operation", "read_backup_root")
            .with_context("path", backup_root.display().to_string())
    })? {
        let entry = match entry {
            Ok(entry) => entry,
            Err(err) => {
                warn!(target: "patchbay", error = %err, "skip_invalid_backup_entry");
                continue;
            }
        };
        let path = entry.path();
        if !path.is_dir() {
            continue;
        }
        let manifest_path = path.join(MANIFEST_FILE_NAME);
        let point = match read_manifest(&manifest_path) {
            Ok(point) => point,
            Err(err) => {
                warn!(
                    target: "patchbay",
                    error = %err,
                    path = %manifest_path.display(),
                    "skip_point_missing_manifest"
                );
                continue;
            }
        };
        match load_entry(&path, point) {
            Ok(loaded) => out.push(loaded),
            Err(err) => {
                warn!(
                    target: "patchbay",
                    error = %err,
                    path = %path.display(),
                    "skip_point_invalid"
                );
            }
        }
    }

    out.sort_by(|a, b| a.point.created_at.cmp(&b.point.created_at));
    Ok(out)
}

pub fn find_rollback_point(backup_root: &Path, id: &str) -> AppResult<Option<RollbackEntry>> {
    Ok(list_rollback_points(backup_root)?
        .into_iter()
        .find(|entry| entry.point.id == id))
}

pub fn latest_rollback_point(backup_root: &Path) -> AppResult<Option<RollbackEntry>> {
    Ok(list_rollback_points(backup_root)?.into_iter().next_back())
}

fn load_entry(dir: &Path, point: RollbackPoint) -> AppResult<RollbackEntry> {
    let manifest_path = dir.join(MANIFEST_FILE_NAME);
    let files_dir = dir.join(FILES_DIR_NAME);
    if !files_dir.exists() {
        return Err(
            AppError::new("ROLLBACK/MISSING_FILES", "Rollback point missing snapshot")
                .with_context("path", files_dir.display().to_string()),
        );
    }
    if !manifest_path.exists() {
        return Err(
            AppError::new("ROLLBACK/MISSING_MANIFEST", "Rollback point missing manifest")
                .with_context("path", manifest_path.display().to_string()),
        );
    }

    let total_size_bytes = dir_size(dir)?;
    Ok(RollbackEntry {
        directory: dir.to_path_buf(),
        manifest_path,
        point,
        total_size_bytes,
    })
}

/// Restore a rollback point over the working root. Refuses to touch the
/// tree when the snapshot fails its integrity check.
pub fn restore(entry: &RollbackEntry, working_root: &Path) -> AppResult<usize> {
    let integrity = super::integrity::validate_backup_integrity(entry)?;
    if !integrity.is_valid {
        return Err(AppError::new(
            "ROLLBACK/INTEGRITY",
            "Rollback point failed integrity verification and must not be used",
        )
        .with_context("rollback_point_id", entry.point.id.clone())
        .with_context("errors", integrity.errors.join("; ")));
    }

    let files_root = entry.files_root();
    let mut restored = 0_usize;
    for rel in &entry.point.files {
        let source = files_root.join(rel);
        let target = working_root.join(rel);
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent).map_err(AppError::from)?;
        }
        fs::copy(&source, &target).map_err(|err| {
            AppError::from(err)
                .with_context("operation", "restore_snapshot_member")
                .with_context("from", source.display().to_string())
                .with_context("to", target.display().to_string())
        })?;
        restored += 1;
    }
    Ok(restored)
}

fn dir_size(path: &Path) -> AppResult<u64> {
    let mut total = 0_u64;
    for entry in WalkDir::new(path).follow_links(false) {
        let entry = entry.map_err(|err| AppError::new("ROLLBACK/WALK", err.to_string()))?;
        if entry.file_type().is_file() {
            total += entry.metadata().map(|meta| meta.len()).unwrap_or(0);
        }
    }
    Ok(total)
}

fn required_free_bytes(snapshot_bytes: u64) -> u64 {
    if snapshot_bytes == 0 {
        return 100_000_000;
    }
    ((snapshot_bytes as f64 * REQUIRED_FREE_MULTIPLIER).ceil()) as u64
}

fn free_disk_space(path: &Path) -> AppResult<u64> {
    if let Ok(fake) = env::var("PATCHBAY_FAKE_FREE_BYTES") {
        if let Ok(value) = fake.parse::<u64>() {
            return Ok(value);
        }
    }

    let mut owned: Option<PathBuf> = None;
    let target = if path.exists() {
        path
    } else if let Some(parent) = path.parent() {
        owned = Some(parent.to_path_buf());
        owned.as_ref().unwrap()
    } else {
        owned = Some(env::current_dir().unwrap_or_else(|_| PathBuf::from("/")));
        owned.as_ref().unwrap()
    };

    available_space(target).map_err(|err| {
        AppError::from(err)
            .with_context("operation", "available_space")
            .with_context("path", target.display().to_string())
    })
}

fn unique_point_dir(root: &Path, timestamp: &DateTime<Utc>) -> AppResult<PathBuf> {
    let base = timestamp.format("%Y%m%d-%H%M%S").to_string();
    for suffix in 0..100 {
        let candidate = if suffix == 0 {
            root.join(&base)
        } else {
            root.join(format!("{base}-{suffix:02}"))
        };
        if !candidate.exists() {
            return Ok(candidate);
        }
    }
    Err(AppError::new(
        "ROLLBACK/NAME_COLLISION",
        "Unable to allocate rollback point directory",
    ))
}

fn apply_retention(root: &Path, retention: &RetentionConfig) -> AppResult<()> {
    let mut entries = list_rollback_points(root)?;
    if entries.is_empty() {
        return Ok(());
    }
    let mut total: u64 = entries.iter().map(|e| e.total_size_bytes).sum();

    while entries.len() > retention.max_count || total > retention.max_bytes {
        let entry = entries.remove(0);
        let size = entry.total_size_bytes;
        if let Err(err) = fs::remove_dir_all(&entry.directory) {
            warn!(
                target: "patchbay",
                error = %err,
                path = %entry.directory.display(),
                "failed_to_remove_old_rollback_point"
            );
            continue;
        }
        total = total.saturating_sub(size);
    }

    Ok(())
}

fn format_bytes(bytes: u64) -> String {
    if bytes == 0 {
        return "0 MB".to_string();
    }
    let mb = (bytes as f64) / 1_000_000.0;
    if mb < 1.0 {
        "1 MB".to_string()
    } else {
        format!("{:.0} MB", mb.ceil())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runner::fake::ScriptedRunner;
    use tempfile::tempdir;

    fn seeded_config(root: &Path) -> OrchestratorConfig {
        fs::create_dir_all(root.join("src")).unwrap();
        fs::write(root.join("src/App.tsx"), "export const App = 1;").unwrap();
        fs::write(root.join("src/theme.ts"), "export const theme = {};").unwrap();
        OrchestratorConfig::for_root(root)
    }

    #[tokio::test]
    async fn creates_snapshot_with_manifest_and_checksum() {
        let tmp = tempdir().unwrap();
        let config = seeded_config(tmp.path());
        let runner = ScriptedRunner::passing();

        let entry = create_rollback_point(
            &config,
            &runner,
            MountEnv::Legacy,
            "before dual-mount toggle",
            Some("v1.4.110(P0.2.0)"),
        )
        .await
        .unwrap();

        assert_eq!(
            entry.point.files,
            vec!["src/App.tsx".to_string(), "src/theme.ts".to_string()]
        );
        assert!(entry.files_root().join("src/App.tsx").exists());
        assert_eq!(entry.point.metadata.phase, 0);
        assert_eq!(entry.point.metadata.step, 2);
        assert_eq!(entry.point.metadata.attempt, 0);

        let reloaded = read_manifest(&entry.manifest_path).unwrap();
        assert_eq!(reloaded.checksum, entry.point.checksum);
    }

    #[tokio::test]
    async fn empty_snapshot_set_is_rejected() {
        let tmp = tempdir().unwrap();
        let config = OrchestratorConfig::for_root(tmp.path());
        let runner = ScriptedRunner::passing();

        let err = create_rollback_point(&config, &runner, MountEnv::Legacy, "noop", None)
            .await
            .unwrap_err();
        assert_eq!(err.code(), "ROLLBACK/EMPTY_SNAPSHOT");
    }

    #[tokio::test]
    async fn restore_copies_snapshot_back() {
        let tmp = tempdir().unwrap();
        let config = seeded_config(tmp.path());
        let runner = ScriptedRunner::passing();

        let entry = create_rollback_point(&config, &runner, MountEnv::Legacy, "seed", None)
            .await
            .unwrap();

        fs::write(tmp.path().join("src/App.tsx"), "broken edit").unwrap();
        let restored = restore(&entry, &config.working_root).unwrap();
        assert_eq!(restored, 2);
        assert_eq!(
            fs::read_to_string(tmp.path().join("src/App.tsx")).unwrap(),
            "export const App = 1;"
        );
    }

    #[tokio::test]
    async fn listing_is_ordered_and_latest_wins() {
        let tmp = tempdir().unwrap();
        let config = seeded_config(tmp.path());
        let runner = ScriptedRunner::passing();

        let first = create_rollback_point(&config, &runner, MountEnv::Legacy, "first", None)
            .await
            .unwrap();
        let second = create_rollback_point(&config, &runner, MountEnv::Legacy, "second", None)
            .await
            .unwrap();

        let listed = list_rollback_points(&config.backup_root).unwrap();
        assert_eq!(listed.len(), 2);
        assert_eq!(listed[0].point.id, first.point.id);
        let latest = latest_rollback_point(&config.backup_root).unwrap().unwrap();
        assert_eq!(latest.point.id, second.point.id);
    }
}
