use std::env;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

pub const USE_NEXTGEN_ENV: &str = "PATCHBAY_USE_NEXTGEN";
pub const ENVIRONMENT_ENV: &str = "PATCHBAY_ENVIRONMENT";
pub const ROOT_ENV: &str = "PATCHBAY_ROOT";
pub const BACKUP_DIR_ENV: &str = "PATCHBAY_BACKUP_DIR";
pub const SNAPSHOT_PATHS_ENV: &str = "PATCHBAY_SNAPSHOT_PATHS";

/// Which side of the dual-mount boundary a run targets.
///
/// The toggle is read from the environment exactly once, here; nothing
/// else in the crate consults `PATCHBAY_USE_NEXTGEN` directly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MountEnv {
    Legacy,
    Nextgen,
}

impl MountEnv {
    pub fn as_str(&self) -> &'static str {
        match self {
            MountEnv::Legacy => "legacy",
            MountEnv::Nextgen => "nextgen",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.to_ascii_lowercase().as_str() {
            "legacy" => Some(MountEnv::Legacy),
            "nextgen" => Some(MountEnv::Nextgen),
            _ => None,
        }
    }
}

impl std::fmt::Display for MountEnv {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

fn env_flag(name: &str) -> bool {
    match env::var(name) {
        Ok(value) => matches!(value.as_str(), "1" | "true" | "TRUE" | "yes" | "YES"),
        Err(_) => false,
    }
}

/// External commands the default validation gates shell out to.
///
/// The defaults mirror the checks the migration tooling runs against the
/// app codebase; each can be overridden per deployment.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GateCommands {
    pub compile: String,
    pub lint: String,
    pub unit_tests: String,
    pub dual_mount: String,
    pub environment_specific: String,
}

impl Default for GateCommands {
    fn default() -> Self {
        Self {
            compile: "npx tsc --noEmit --skipLibCheck".into(),
            lint: "npx eslint . --ext .ts,.tsx --max-warnings=0".into(),
            unit_tests: "yarn test:unit --watchAll=false".into(),
            dual_mount: "node scripts/validate-dual-mount.js".into(),
            environment_specific: "node scripts/validate-environment-specific.js".into(),
        }
    }
}

impl GateCommands {
    fn load() -> Self {
        let mut commands = Self::default();
        if let Ok(value) = env::var("PATCHBAY_COMPILE_CMD") {
            commands.compile = value;
        }
        if let Ok(value) = env::var("PATCHBAY_LINT_CMD") {
            commands.lint = value;
        }
        if let Ok(value) = env::var("PATCHBAY_UNIT_TESTS_CMD") {
            commands.unit_tests = value;
        }
        if let Ok(value) = env::var("PATCHBAY_DUAL_MOUNT_CMD") {
            commands.dual_mount = value;
        }
        if let Ok(value) = env::var("PATCHBAY_ENV_SPECIFIC_CMD") {
            commands.environment_specific = value;
        }
        commands
    }
}

/// Per-run configuration, resolved once at startup.
///
/// Every run constructs its own config; there is no process-global state.
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    pub mount_env: MountEnv,
    /// Environment name used to select environment-specific gates and
    /// rollback procedures. Defaults to the mount env's name.
    pub environment: String,
    /// Root of the tree patches mutate and rollback points snapshot.
    pub working_root: PathBuf,
    /// Where rollback points are stored.
    pub backup_root: PathBuf,
    /// Paths (relative to `working_root`) captured in a rollback point.
    pub snapshot_paths: Vec<PathBuf>,
    pub gate_commands: GateCommands,
}

impl OrchestratorConfig {
    pub fn load() -> Self {
        let mount_env = if env_flag(USE_NEXTGEN_ENV) {
            MountEnv::Nextgen
        } else {
            MountEnv::Legacy
        };

        let working_root = env::var(ROOT_ENV)
            .map(PathBuf::from)
            .ok()
            .or_else(|| env::current_dir().ok())
            .unwrap_or_else(|| PathBuf::from("."));

        let backup_root = env::var(BACKUP_DIR_ENV)
            .map(PathBuf::from)
            .unwrap_or_else(|_| working_root.join("backups"));

        let snapshot_paths = env::var(SNAPSHOT_PATHS_ENV)
            .map(|raw| {
                raw.split(':')
                    .filter(|part| !part.is_empty())
                    .map(PathBuf::from)
                    .collect::<Vec<_>>()
            })
            .ok()
            .filter(|paths| !paths.is_empty())
            .unwrap_or_else(|| vec![PathBuf::from("src")]);

        let environment =
            env::var(ENVIRONMENT_ENV).unwrap_or_else(|_| mount_env.as_str().to_string());

        Self {
            mount_env,
            environment,
            working_root,
            backup_root,
            snapshot_paths,
            gate_commands: GateCommands::load(),
        }
    }

    /// Config rooted at an explicit directory, for tests and the CLI's
    /// `--root` override. Gate command overrides still come from the
    /// environment so the toggle stays in one place.
    pub fn for_root(root: impl Into<PathBuf>) -> Self {
        let working_root = root.into();
        Self {
            mount_env: MountEnv::Legacy,
            environment: MountEnv::Legacy.as_str().to_string(),
            backup_root: working_root.join("backups"),
            snapshot_paths: vec![PathBuf::from("src")],
            gate_commands: GateCommands::load(),
            working_root,
        }
    }

    pub fn with_mount_env(mut self, mount_env: MountEnv) -> Self {
        self.mount_env = mount_env;
        self.environment = mount_env.as_str().to_string();
        self
    }

    pub fn with_snapshot_paths(mut self, paths: Vec<PathBuf>) -> Self {
        self.snapshot_paths = paths;
        self
    }

    pub fn snapshot_sources(&self) -> impl Iterator<Item = PathBuf> + '_ {
        self.snapshot_paths
            .iter()
            .map(|p| join_under(&self.working_root, p))
    }
}

fn join_under(root: &Path, path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        root.join(path)
    }
}
