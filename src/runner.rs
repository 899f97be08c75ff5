use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;

use serde::{Deserialize, Serialize};
use tokio::process::Command;

use crate::patch::{CommandKind, PatchCommand};
use crate::{AppError, AppResult};

/// Captured output of one external command.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

pub type RunnerFuture<'a> = Pin<Box<dyn Future<Output = AppResult<CommandOutput>> + Send + 'a>>;

/// Seam between the orchestrator and the outside world.
///
/// Core logic only ever sees `{stdout, stderr, exit_code}`, so tests can
/// inject a scripted runner and never spawn a real process.
pub trait CommandRunner: Send + Sync {
    fn run<'a>(&'a self, command: &'a PatchCommand) -> RunnerFuture<'a>;
}

/// Runs commands for real: `shell` via `sh -c`, `git` via the git
/// binary, `file` as interpreted filesystem operations under the
/// working root.
pub struct SystemRunner {
    working_root: PathBuf,
}

impl SystemRunner {
    pub fn new(working_root: impl Into<PathBuf>) -> Self {
        Self {
            working_root: working_root.into(),
        }
    }

    pub fn working_root(&self) -> &Path {
        &self.working_root
    }

    async fn run_shell(&self, command: &PatchCommand) -> AppResult<CommandOutput> {
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg(&command.command);
        // Positional args land in $0.. so queue authors can parameterize
        // a shared command string.
        if !command.args.is_empty() {
            cmd.args(&command.args);
        }
        self.spawn(cmd, &command.command).await
    }

    async fn run_git(&self, command: &PatchCommand) -> AppResult<CommandOutput> {
        let mut cmd = Command::new("git");
        cmd.arg(&command.command).args(&command.args);
        self.spawn(cmd, &format!("git {}", command.command)).await
    }

    async fn spawn(&self, mut cmd: Command, label: &str) -> AppResult<CommandOutput> {
        cmd.current_dir(&self.working_root);
        let output = cmd.output().await.map_err(|err| {
            AppError::from(err)
                .with_context("operation", "spawn_command")
                .with_context("command", label.to_string())
        })?;
        Ok(CommandOutput {
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            exit_code: output.status.code().unwrap_or(-1),
        })
    }

    fn resolve(&self, raw: &str) -> PathBuf {
        let path = Path::new(raw);
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.working_root.join(path)
        }
    }

    fn run_file_op(&self, command: &PatchCommand) -> AppResult<CommandOutput> {
        let args = &command.args;
        let arg = |index: usize| -> AppResult<&String> {
            args.get(index).ok_or_else(|| {
                AppError::new(
                    "FILE_OP/MISSING_ARG",
                    format!("file op '{}' needs argument #{index}", command.command),
                )
            })
        };

        match command.command.as_str() {
            "copy" => {
                let from = self.resolve(arg(0)?);
                let to = self.resolve(arg(1)?);
                if let Some(parent) = to.parent() {
                    std::fs::create_dir_all(parent).map_err(AppError::from)?;
                }
                std::fs::copy(&from, &to).map_err(|err| {
                    AppError::from(err)
                        .with_context("operation", "copy")
                        .with_context("from", from.display().to_string())
                        .with_context("to", to.display().to_string())
                })?;
            }
            "move" => {
                let from = self.resolve(arg(0)?);
                let to = self.resolve(arg(1)?);
                if let Some(parent) = to.parent() {
                    std::fs::create_dir_all(parent).map_err(AppError::from)?;
                }
                std::fs::rename(&from, &to).map_err(|err| {
                    AppError::from(err)
                        .with_context("operation", "move")
                        .with_context("from", from.display().to_string())
                        .with_context("to", to.display().to_string())
                })?;
            }
            "delete" => {
                let target = self.resolve(arg(0)?);
                let result = if target.is_dir() {
                    std::fs::remove_dir_all(&target)
                } else {
                    std::fs::remove_file(&target)
                };
                result.map_err(|err| {
                    AppError::from(err)
                        .with_context("operation", "delete")
                        .with_context("path", target.display().to_string())
                })?;
            }
            "mkdir" => {
                let target = self.resolve(arg(0)?);
                std::fs::create_dir_all(&target).map_err(|err| {
                    AppError::from(err)
                        .with_context("operation", "mkdir")
                        .with_context("path", target.display().to_string())
                })?;
            }
            "write" => {
                let target = self.resolve(arg(0)?);
                let contents = arg(1)?;
                if let Some(parent) = target.parent() {
                    std::fs::create_dir_all(parent).map_err(AppError::from)?;
                }
                std::fs::write(&target, contents).map_err(|err| {
                    AppError::from(err)
                        .with_context("operation", "write")
                        .with_context("path", target.display().to_string())
                })?;
            }
            other => {
                return Err(AppError::new(
                    "FILE_OP/UNKNOWN",
                    format!("unknown file op '{other}'"),
                ));
            }
        }

        Ok(CommandOutput {
            stdout: String::new(),
            stderr: String::new(),
            exit_code: 0,
        })
    }
}

impl CommandRunner for SystemRunner {
    fn run<'a>(&'a self, command: &'a PatchCommand) -> RunnerFuture<'a> {
        Box::pin(async move {
            match command.kind {
                CommandKind::Shell => self.run_shell(command).await,
                CommandKind::Git => self.run_git(command).await,
                CommandKind::File => self.run_file_op(command),
            }
        })
    }
}

#[cfg(test)]
pub(crate) mod fake {
    use std::collections::HashMap;
    use std::sync::Mutex;

    use super::*;

    /// Scripted runner for tests: responses keyed by command string,
    /// with a call log for asserting sequencing.
    pub struct ScriptedRunner {
        responses: HashMap<String, CommandOutput>,
        default: CommandOutput,
        pub calls: Mutex<Vec<String>>,
    }

    impl ScriptedRunner {
        pub fn passing() -> Self {
            Self {
                responses: HashMap::new(),
                default: CommandOutput {
                    stdout: String::new(),
                    stderr: String::new(),
                    exit_code: 0,
                },
                calls: Mutex::new(Vec::new()),
            }
        }

        pub fn with_response(mut self, command: &str, output: CommandOutput) -> Self {
            self.responses.insert(command.to_string(), output);
            self
        }

        pub fn failing(command: &str, stderr: &str) -> Self {
            Self::passing().with_response(
                command,
                CommandOutput {
                    stdout: String::new(),
                    stderr: stderr.to_string(),
                    exit_code: 1,
                },
            )
        }
    }

    impl CommandRunner for ScriptedRunner {
        fn run<'a>(&'a self, command: &'a PatchCommand) -> RunnerFuture<'a> {
            Box::pin(async move {
                self.calls
                    .lock()
                    .expect("call log lock")
                    .push(command.command.clone());
                Ok(self
                    .responses
                    .get(&command.command)
                    .cloned()
                    .unwrap_or_else(|| self.default.clone()))
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn shell_commands_capture_stdout_and_exit_code() {
        let tmp = tempdir().unwrap();
        let runner = SystemRunner::new(tmp.path());
        let out = runner
            .run(&PatchCommand::shell("printf hello"))
            .await
            .unwrap();
        assert_eq!(out.stdout, "hello");
        assert_eq!(out.exit_code, 0);

        let out = runner.run(&PatchCommand::shell("exit 3")).await.unwrap();
        assert_eq!(out.exit_code, 3);
    }

    #[tokio::test]
    async fn file_ops_run_under_the_working_root() {
        let tmp = tempdir().unwrap();
        let runner = SystemRunner::new(tmp.path());

        runner
            .run(&PatchCommand::file(
                "write",
                vec!["src/index.ts".into(), "export {};".into()],
            ))
            .await
            .unwrap();
        runner
            .run(&PatchCommand::file(
                "copy",
                vec!["src/index.ts".into(), "src-nextgen/index.ts".into()],
            ))
            .await
            .unwrap();

        let copied = tmp.path().join("src-nextgen/index.ts");
        assert_eq!(std::fs::read_to_string(copied).unwrap(), "export {};");
    }

    #[tokio::test]
    async fn unknown_file_op_is_an_error() {
        let tmp = tempdir().unwrap();
        let runner = SystemRunner::new(tmp.path());
        let err = runner
            .run(&PatchCommand::file("chmod", vec!["x".into()]))
            .await
            .unwrap_err();
        assert_eq!(err.code(), "FILE_OP/UNKNOWN");
    }
}
