use std::cmp::Ordering;

use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use semver::Version;
use serde::{Deserialize, Serialize};

/// A declared unit of migration work.
///
/// `dependencies` reference other patch ids in the same set; the graph
/// resolver rejects unknown ids and cycles before anything executes.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct PatchDefinition {
    #[serde(alias = "patchId")]
    pub id: String,
    #[serde(default)]
    pub name: String,
    /// "phase.step" label, e.g. `0.3`.
    #[serde(default)]
    pub step: String,
    #[serde(default)]
    pub dependencies: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CommandKind {
    Shell,
    File,
    Git,
}

impl CommandKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            CommandKind::Shell => "shell",
            CommandKind::File => "file",
            CommandKind::Git => "git",
        }
    }
}

/// One command inside a patch. Immutable once attached to an execution.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct PatchCommand {
    #[serde(rename = "type")]
    pub kind: CommandKind,
    pub command: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<String>,
}

impl PatchCommand {
    pub fn shell(command: impl Into<String>) -> Self {
        Self {
            kind: CommandKind::Shell,
            command: command.into(),
            args: Vec::new(),
        }
    }

    pub fn git(command: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            kind: CommandKind::Git,
            command: command.into(),
            args,
        }
    }

    pub fn file(op: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            kind: CommandKind::File,
            command: op.into(),
            args,
        }
    }
}

/// Outcome of one executed command.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PatchResult {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub duration_ms: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl ExecutionStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, ExecutionStatus::Completed | ExecutionStatus::Failed)
    }
}

/// A patch bound to its commands plus the per-command results.
///
/// `results.len() == commands.len()` once the status is terminal, except
/// when the run was cancelled between commands.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PatchExecution {
    pub patch_id: String,
    pub commands: Vec<PatchCommand>,
    #[serde(default)]
    pub results: Vec<PatchResult>,
    pub status: ExecutionStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
}

impl PatchExecution {
    pub fn new(patch_id: impl Into<String>, commands: Vec<PatchCommand>) -> Self {
        Self {
            patch_id: patch_id.into(),
            commands,
            results: Vec::new(),
            status: ExecutionStatus::Pending,
            started_at: None,
            finished_at: None,
        }
    }

    pub fn failed_results(&self) -> impl Iterator<Item = (usize, &PatchResult)> {
        self.results
            .iter()
            .enumerate()
            .filter(|(_, result)| !result.success)
    }
}

/// Version and placement information parsed from ids shaped like
/// `v1.4.100(P0.3.1)`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PatchVersionInfo {
    pub version: Version,
    pub phase: u32,
    pub step: u32,
    pub attempt: u32,
}

static ID_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^v(\d+\.\d+\.\d+)\(P(\d+)\.(\d+)\.(\d+)\)$").expect("static pattern is valid")
});

impl PatchVersionInfo {
    /// Parse a versioned patch id. Plain ids (no version envelope) return
    /// `None`; they are still valid patches, just not orderable by phase.
    pub fn parse(id: &str) -> Option<Self> {
        let caps = ID_PATTERN.captures(id.trim())?;
        let version = Version::parse(caps.get(1)?.as_str()).ok()?;
        Some(Self {
            version,
            phase: caps.get(2)?.as_str().parse().ok()?,
            step: caps.get(3)?.as_str().parse().ok()?,
            attempt: caps.get(4)?.as_str().parse().ok()?,
        })
    }

    pub fn step_label(&self) -> String {
        format!("{}.{}", self.phase, self.step)
    }
}

impl PartialOrd for PatchVersionInfo {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for PatchVersionInfo {
    fn cmp(&self, other: &Self) -> Ordering {
        self.phase
            .cmp(&other.phase)
            .then(self.step.cmp(&other.step))
            .then(self.attempt.cmp(&other.attempt))
            .then(self.version.cmp(&other.version))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_versioned_patch_id() {
        let info = PatchVersionInfo::parse("v1.4.121(P0.3.1)").expect("parse");
        assert_eq!(info.version, Version::new(1, 4, 121));
        assert_eq!(info.phase, 0);
        assert_eq!(info.step, 3);
        assert_eq!(info.attempt, 1);
        assert_eq!(info.step_label(), "0.3");
    }

    #[test]
    fn plain_ids_are_not_versioned() {
        assert!(PatchVersionInfo::parse("bootstrap").is_none());
        assert!(PatchVersionInfo::parse("v1.4.100").is_none());
    }

    #[test]
    fn orders_by_phase_step_attempt() {
        let a = PatchVersionInfo::parse("v1.4.100(P0.1.0)").unwrap();
        let b = PatchVersionInfo::parse("v1.4.101(P0.1.1)").unwrap();
        let c = PatchVersionInfo::parse("v1.4.110(P0.2.0)").unwrap();
        let d = PatchVersionInfo::parse("v2.0.0(P1.0.0)").unwrap();
        let mut ids = vec![d.clone(), c.clone(), b.clone(), a.clone()];
        ids.sort();
        assert_eq!(ids, vec![a, b, c, d]);
    }

    #[test]
    fn command_json_uses_original_field_names() {
        let command: PatchCommand =
            serde_json::from_str(r#"{"type":"git","command":"checkout","args":["main"]}"#).unwrap();
        assert_eq!(command.kind, CommandKind::Git);
        assert_eq!(command.command, "checkout");
        assert_eq!(command.args, vec!["main".to_string()]);
    }

    #[test]
    fn definition_accepts_patch_id_alias() {
        let def: PatchDefinition =
            serde_json::from_str(r#"{"patchId":"v1.4.100(P0.1.0)","dependencies":[]}"#).unwrap();
        assert_eq!(def.id, "v1.4.100(P0.1.0)");
    }
}
