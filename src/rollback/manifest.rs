use std::fs::{self, File};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::config::MountEnv;
use crate::{AppError, AppResult};

pub const MANIFEST_FILE_NAME: &str = "rollback.json";
pub const FILES_DIR_NAME: &str = "files";

/// Commit/branch provenance captured when a rollback point is created.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct RollbackMetadata {
    pub author: String,
    pub commit_hash: String,
    pub branch: String,
    pub phase: u32,
    pub step: u32,
    pub attempt: u32,
}

impl RollbackMetadata {
    pub fn unknown() -> Self {
        Self {
            author: "system".into(),
            commit_hash: "unknown".into(),
            branch: "unknown".into(),
            phase: 0,
            step: 0,
            attempt: 0,
        }
    }
}

/// A checksummed snapshot of files plus metadata. Immutable once
/// created; the manifest is the only record of what the snapshot holds.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RollbackPoint {
    pub id: String,
    pub created_at: DateTime<Utc>,
    pub version: String,
    pub environment: MountEnv,
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub git_tag: Option<String>,
    /// Snapshot members, relative to the working root, sorted by path.
    pub files: Vec<String>,
    /// Deterministic hash over file contents ordered by path.
    pub checksum: String,
    pub metadata: RollbackMetadata,
}

pub fn read_manifest(path: &Path) -> AppResult<RollbackPoint> {
    let mut file = File::open(path).map_err(|err| {
        AppError::from(err)
            .with_context("operation", "open_manifest")
            .with_context("path", path.display().to_string())
    })?;
    let mut buf = Vec::new();
    file.read_to_end(&mut buf).map_err(AppError::from)?;
    let manifest: RollbackPoint = serde_json::from_slice(&buf).map_err(|err| {
        AppError::from(err)
            .with_context("operation", "parse_manifest")
            .with_context("path", path.display().to_string())
    })?;
    Ok(manifest)
}

pub fn file_sha256(path: &Path) -> AppResult<String> {
    let mut file = File::open(path).map_err(|err| {
        AppError::from(err)
            .with_context("operation", "open_file_for_hashing")
            .with_context("path", path.display().to_string())
    })?;
    let mut hasher = Sha256::new();
    let mut buf = [0_u8; 8192];
    loop {
        let read = file.read(&mut buf).map_err(AppError::from)?;
        if read == 0 {
            break;
        }
        hasher.update(&buf[..read]);
    }
    Ok(format!("{:x}", hasher.finalize()))
}

/// Deterministic checksum over a file set: NUL-framed relative path then
/// content, in path order, so the same tree always hashes the same.
pub fn tree_checksum(root: &Path, relative_files: &[String]) -> AppResult<String> {
    let mut sorted: Vec<&String> = relative_files.iter().collect();
    sorted.sort();

    let mut hasher = Sha256::new();
    let mut buf = [0_u8; 8192];
    for rel in sorted {
        hasher.update(rel.as_bytes());
        hasher.update([0]);
        let path = root.join(rel);
        let mut file = File::open(&path).map_err(|err| {
            AppError::from(err)
                .with_context("operation", "open_tree_member")
                .with_context("path", path.display().to_string())
        })?;
        loop {
            let read = file.read(&mut buf).map_err(AppError::from)?;
            if read == 0 {
                break;
            }
            hasher.update(&buf[..read]);
        }
        hasher.update([0]);
    }
    Ok(format!("{:x}", hasher.finalize()))
}

/// Write via a temp sibling then rename, syncing the file and directory,
/// so a crash never leaves a half-written manifest behind.
pub fn write_atomic(path: &Path, payload: &[u8]) -> AppResult<()> {
    let parent = path.parent().ok_or_else(|| {
        AppError::new("FS/NO_PARENT", "Path does not have a parent directory")
            .with_context("path", path.display().to_string())
    })?;
    fs::create_dir_all(parent).map_err(AppError::from)?;

    let tmp: PathBuf = path.with_extension("partial");
    {
        let mut file = File::create(&tmp).map_err(|err| {
            AppError::from(err)
                .with_context("operation", "create_partial")
                .with_context("path", tmp.display().to_string())
        })?;
        file.write_all(payload).map_err(AppError::from)?;
        file.sync_all().ok();
    }
    fs::rename(&tmp, path).map_err(|err| {
        AppError::from(err)
            .with_context("operation", "finalize_atomic_write")
            .with_context("from", tmp.display().to_string())
            .with_context("to", path.display().to_string())
    })?;
    sync_dir(parent).ok();
    Ok(())
}

pub fn sync_dir(path: &Path) -> std::io::Result<()> {
    File::open(path)?.sync_all()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::{tempdir, NamedTempFile};

    #[test]
    fn file_sha256_matches_manual_digest() {
        let mut tmp = NamedTempFile::new().unwrap();
        std::io::Write::write_all(&mut tmp, b"hello world").unwrap();
        let expected = format!("{:x}", Sha256::digest(b"hello world"));
        let actual = file_sha256(tmp.path()).unwrap();
        assert_eq!(expected, actual);
    }

    #[test]
    fn tree_checksum_is_order_independent_and_content_sensitive() {
        let tmp = tempdir().unwrap();
        fs::create_dir_all(tmp.path().join("src")).unwrap();
        fs::write(tmp.path().join("src/a.ts"), "alpha").unwrap();
        fs::write(tmp.path().join("src/b.ts"), "beta").unwrap();

        let forward = tree_checksum(
            tmp.path(),
            &["src/a.ts".to_string(), "src/b.ts".to_string()],
        )
        .unwrap();
        let reversed = tree_checksum(
            tmp.path(),
            &["src/b.ts".to_string(), "src/a.ts".to_string()],
        )
        .unwrap();
        assert_eq!(forward, reversed);

        fs::write(tmp.path().join("src/b.ts"), "changed").unwrap();
        let drifted = tree_checksum(
            tmp.path(),
            &["src/a.ts".to_string(), "src/b.ts".to_string()],
        )
        .unwrap();
        assert_ne!(forward, drifted);
    }

    #[test]
    fn manifest_roundtrip() {
        let tmp = tempdir().unwrap();
        let point = RollbackPoint {
            id: "rp-test".into(),
            created_at: Utc::now(),
            version: "0.1.0".into(),
            environment: MountEnv::Nextgen,
            description: "before P0.3.1".into(),
            git_tag: Some("rollback-0.1.0-nextgen".into()),
            files: vec!["src/a.ts".into()],
            checksum: "abc".into(),
            metadata: RollbackMetadata::unknown(),
        };
        let path = tmp.path().join(MANIFEST_FILE_NAME);
        write_atomic(&path, &serde_json::to_vec_pretty(&point).unwrap()).unwrap();

        let loaded = read_manifest(&path).unwrap();
        assert_eq!(loaded.id, point.id);
        assert_eq!(loaded.environment, MountEnv::Nextgen);
        assert_eq!(loaded.files, point.files);
        assert_eq!(loaded.checksum, point.checksum);
    }
}
