use std::fs::{self, File};
use std::path::{Path, PathBuf};

use fs2::FileExt;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::patch::{PatchCommand, PatchDefinition};
use crate::{AppError, AppResult};

pub const COMPLETED_DIR: &str = ".completed";
pub const FAILED_DIR: &str = ".failed";
pub const ARCHIVE_DIR: &str = ".archive";
pub const LOCK_FILE: &str = ".patchbay.lock";

/// On-disk patch file: the definition plus its command list. Minimal
/// required fields are `id` and `commands`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PatchFile {
    #[serde(flatten)]
    pub definition: PatchDefinition,
    pub commands: Vec<PatchCommand>,
}

/// A pending patch and where it came from.
#[derive(Debug, Clone)]
pub struct QueuedPatch {
    pub path: PathBuf,
    pub file_name: String,
    pub patch: PatchFile,
}

/// The patch-queue directory and its lifecycle subdirectories.
///
/// Only one orchestrator process may mutate a queue at a time; `lock()`
/// takes an advisory file lock and concurrent runners fail fast.
pub struct PatchQueue {
    root: PathBuf,
}

impl PatchQueue {
    pub fn open(root: impl Into<PathBuf>) -> AppResult<Self> {
        let root = root.into();
        if !root.is_dir() {
            return Err(AppError::new(
                "QUEUE/MISSING",
                format!("patch queue directory not found: {}", root.display()),
            ));
        }
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn lock(&self) -> AppResult<QueueLock> {
        QueueLock::acquire(&self.root)
    }

    /// Pending patch files, sorted by file name (oldest naming first,
    /// matching the `phase.step` file naming convention).
    pub fn pending(&self) -> AppResult<Vec<QueuedPatch>> {
        let mut out = Vec::new();
        for entry in fs::read_dir(&self.root).map_err(|err| {
            AppError::from(err)
                .with_context("operation", "read_queue_dir")
                .with_context("path", self.root.display().to_string())
        })? {
            let entry = entry.map_err(AppError::from)?;
            let path = entry.path();
            let name = match path.file_name().and_then(|n| n.to_str()) {
                Some(name) => name.to_string(),
                None => continue,
            };
            if !path.is_file() || !name.ends_with(".json") || name.starts_with('.') {
                continue;
            }
            match load_patch_file(&path) {
                Ok(patch) => out.push(QueuedPatch {
                    path,
                    file_name: name,
                    patch,
                }),
                Err(err) => {
                    warn!(
                        target: "patchbay",
                        error = %err,
                        path = %path.display(),
                        "skip_unparseable_patch"
                    );
                    return Err(err.with_context("file", name));
                }
            }
        }
        out.sort_by(|a, b| a.file_name.cmp(&b.file_name));
        Ok(out)
    }

    pub fn definitions(&self) -> AppResult<Vec<PatchDefinition>> {
        Ok(self
            .pending()?
            .into_iter()
            .map(|queued| queued.patch.definition)
            .collect())
    }

    /// Move an executed patch into `.completed/`.
    pub fn complete(&self, queued: &QueuedPatch) -> AppResult<PathBuf> {
        self.move_into(queued, COMPLETED_DIR)
    }

    /// Move a failed patch into `.failed/`.
    pub fn fail(&self, queued: &QueuedPatch) -> AppResult<PathBuf> {
        self.move_into(queued, FAILED_DIR)
    }

    /// Retire a patch into `.archive/` without executing it.
    pub fn archive(&self, queued: &QueuedPatch) -> AppResult<PathBuf> {
        self.move_into(queued, ARCHIVE_DIR)
    }

    fn move_into(&self, queued: &QueuedPatch, dir: &str) -> AppResult<PathBuf> {
        let target_dir = self.root.join(dir);
        fs::create_dir_all(&target_dir).map_err(|err| {
            AppError::from(err)
                .with_context("operation", "create_queue_subdir")
                .with_context("path", target_dir.display().to_string())
        })?;
        let target = target_dir.join(&queued.file_name);
        fs::rename(&queued.path, &target).map_err(|err| {
            AppError::from(err)
                .with_context("operation", "move_patch_file")
                .with_context("from", queued.path.display().to_string())
                .with_context("to", target.display().to_string())
        })?;
        info!(
            target: "patchbay",
            event = "patch_moved",
            patch = %queued.patch.definition.id,
            to = dir
        );
        Ok(target)
    }

    /// Write the per-patch execution summary next to the queue.
    pub fn write_summary(&self, patch_id: &str, body: &str) -> AppResult<PathBuf> {
        let summaries = self.root.join("summaries");
        fs::create_dir_all(&summaries).map_err(AppError::from)?;
        let path = summaries.join(format!("summary-{}.md", sanitize_for_file_name(patch_id)));
        fs::write(&path, body).map_err(|err| {
            AppError::from(err)
                .with_context("operation", "write_summary")
                .with_context("path", path.display().to_string())
        })?;
        Ok(path)
    }
}

/// Patch ids like `v1.4.100(P0.1.0)` contain characters that do not
/// belong in file names.
fn sanitize_for_file_name(id: &str) -> String {
    id.chars()
        .map(|c| if c.is_alphanumeric() || c == '.' || c == '-' { c } else { '_' })
        .collect()
}

/// Queue patch files may carry `//` comment lines; strip them before
/// parsing, as the original tooling did.
fn strip_json_comments(raw: &str) -> String {
    raw.lines()
        .filter(|line| !line.trim_start().starts_with("//"))
        .collect::<Vec<_>>()
        .join("\n")
}

pub fn load_patch_file(path: &Path) -> AppResult<PatchFile> {
    let raw = fs::read_to_string(path).map_err(|err| {
        AppError::from(err)
            .with_context("operation", "read_patch_file")
            .with_context("path", path.display().to_string())
    })?;
    let cleaned = strip_json_comments(&raw);
    let patch: PatchFile = serde_json::from_str(&cleaned).map_err(|err| {
        AppError::from(err)
            .with_context("operation", "parse_patch_file")
            .with_context("path", path.display().to_string())
    })?;
    if patch.definition.id.trim().is_empty() {
        return Err(AppError::new("QUEUE/MISSING_ID", "patch file has no id")
            .with_context("path", path.display().to_string()));
    }
    Ok(patch)
}

/// Advisory exclusive lock over a queue directory.
#[derive(Debug)]
pub struct QueueLock {
    file: File,
    path: PathBuf,
}

impl QueueLock {
    pub fn acquire(queue_root: &Path) -> AppResult<Self> {
        let path = queue_root.join(LOCK_FILE);
        let file = File::create(&path).map_err(|err| {
            AppError::from(err)
                .with_context("operation", "create_lock_file")
                .with_context("path", path.display().to_string())
        })?;
        file.try_lock_exclusive().map_err(|err| {
            AppError::new(
                "QUEUE/LOCKED",
                "another orchestrator run holds the patch queue",
            )
            .with_context("path", path.display().to_string())
            .with_context("error", err.to_string())
        })?;
        Ok(Self { file, path })
    }
}

impl Drop for QueueLock {
    fn drop(&mut self) {
        let _ = fs2::FileExt::unlock(&self.file);
        let _ = fs::remove_file(&self.path);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn write_patch(dir: &Path, name: &str, id: &str, deps: &[&str]) -> PathBuf {
        let deps = deps
            .iter()
            .map(|d| format!("\"{d}\""))
            .collect::<Vec<_>>()
            .join(",");
        let body = format!(
            r#"// migration patch
{{
  "id": "{id}",
  "dependencies": [{deps}],
  "commands": [
    {{ "type": "shell", "command": "true" }}
  ]
}}"#
        );
        let path = dir.join(name);
        fs::write(&path, body).unwrap();
        path
    }

    #[test]
    fn pending_strips_comments_and_sorts_by_file_name() {
        let tmp = tempdir().unwrap();
        write_patch(tmp.path(), "patch-b.json", "B", &["A"]);
        write_patch(tmp.path(), "patch-a.json", "A", &[]);
        fs::write(tmp.path().join("notes.txt"), "not a patch").unwrap();

        let queue = PatchQueue::open(tmp.path()).unwrap();
        let pending = queue.pending().unwrap();
        assert_eq!(pending.len(), 2);
        assert_eq!(pending[0].patch.definition.id, "A");
        assert_eq!(pending[1].patch.definition.id, "B");
        assert_eq!(pending[1].patch.definition.dependencies, vec!["A"]);
    }

    #[test]
    fn unparseable_patch_is_an_error() {
        let tmp = tempdir().unwrap();
        fs::write(tmp.path().join("broken.json"), "{ nope").unwrap();
        let queue = PatchQueue::open(tmp.path()).unwrap();
        let err = queue.pending().unwrap_err();
        assert!(err.context().contains_key("file"));
    }

    #[test]
    fn lifecycle_moves_between_subdirectories() {
        let tmp = tempdir().unwrap();
        write_patch(tmp.path(), "patch-a.json", "A", &[]);
        let queue = PatchQueue::open(tmp.path()).unwrap();

        let pending = queue.pending().unwrap();
        let moved = queue.complete(&pending[0]).unwrap();
        assert!(moved.starts_with(tmp.path().join(COMPLETED_DIR)));
        assert!(queue.pending().unwrap().is_empty());

        write_patch(tmp.path(), "patch-b.json", "B", &[]);
        let pending = queue.pending().unwrap();
        let moved = queue.fail(&pending[0]).unwrap();
        assert!(moved.starts_with(tmp.path().join(FAILED_DIR)));
    }

    #[test]
    fn second_lock_fails_fast() {
        let tmp = tempdir().unwrap();
        let queue = PatchQueue::open(tmp.path()).unwrap();
        let _held = queue.lock().unwrap();
        let err = queue.lock().unwrap_err();
        assert_eq!(err.code(), "QUEUE/LOCKED");
    }

    #[test]
    fn lock_is_released_on_drop() {
        let tmp = tempdir().unwrap();
        let queue = PatchQueue::open(tmp.path()).unwrap();
        drop(queue.lock().unwrap());
        assert!(queue.lock().is_ok());
    }

    #[test]
    fn summary_file_name_is_sanitized() {
        let tmp = tempdir().unwrap();
        let queue = PatchQueue::open(tmp.path()).unwrap();
        let path = queue.write_summary("v1.4.100(P0.1.0)", "# ok\n").unwrap();
        assert_eq!(
            path.file_name().unwrap().to_str().unwrap(),
            "summary-v1.4.100_P0.1.0_.md"
        );
    }

    #[test]
    fn missing_id_is_rejected() {
        let tmp = tempdir().unwrap();
        let path = tmp.path().join("anon.json");
        fs::write(&path, r#"{"id":"","commands":[]}"#).unwrap();
        let err = load_patch_file(&path).unwrap_err();
        assert_eq!(err.code(), "QUEUE/MISSING_ID");
    }
}
