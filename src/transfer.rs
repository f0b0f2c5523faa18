//! Copying files between this machine and worker nodes.

use crate::error::{MinerError, Result};
use std::path::Path;
use std::process::Command;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandResult {
    pub success: bool,
    pub code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

/// Runs external programs. Swapped out in tests.
pub trait CommandExecutor: Send + Sync {
    fn execute(&self, program: &str, args: &[String]) -> std::io::Result<CommandResult>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct ProcessCommandExecutor;

impl CommandExecutor for ProcessCommandExecutor {
    fn execute(&self, program: &str, args: &[String]) -> std::io::Result<CommandResult> {
        let output = Command::new(program).args(args).output()?;
        Ok(CommandResult {
            success: output.status.success(),
            code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }
}

/// File transfer to and from worker nodes.
///
/// Failures are per node; callers log them and move on.
pub trait RemoteTransfer {
    /// Copy a local file into a directory on the node.
    fn upload(&self, local: &Path, node: &str, remote_dir: &str) -> Result<()>;

    /// Copy remote files matching `remote_pattern` into a local directory.
    fn download(&self, node: &str, remote_pattern: &str, local_dir: &Path) -> Result<()>;
}

/// `scp`-based transfer.
#[derive(Debug, Clone)]
pub struct ScpTransfer<E = ProcessCommandExecutor> {
    program: String,
    user: Option<String>,
    executor: E,
}

impl ScpTransfer<ProcessCommandExecutor> {
    pub fn new(program: impl Into<String>, user: Option<String>) -> Self {
        Self::with_executor(program, user, ProcessCommandExecutor)
    }
}

impl<E: CommandExecutor> ScpTransfer<E> {
    pub fn with_executor(program: impl Into<String>, user: Option<String>, executor: E) -> Self {
        Self {
            program: program.into(),
            user,
            executor,
        }
    }

    fn remote_spec(&self, node: &str, path: &str) -> String {
        match &self.user {
            Some(user) => format!("{}@{}:{}", user, node, path),
            None => format!("{}:{}", node, path),
        }
    }

    fn run(&self, node: &str, args: Vec<String>) -> Result<()> {
        let command = format!("{} {}", self.program, args.join(" "));
        let result = self
            .executor
            .execute(&self.program, &args)
            .map_err(|e| MinerError::Command {
                command: command.clone(),
                message: e.to_string(),
            })?;

        if result.success {
            return Ok(());
        }
        let stderr = if result.stderr.trim().is_empty() {
            result.stdout
        } else {
            result.stderr
        };
        Err(MinerError::Transfer {
            node: node.to_string(),
            message: format!("`{}` exited with {:?}: {}", command, result.code, stderr.trim()),
        })
    }
}

impl<E: CommandExecutor> RemoteTransfer for ScpTransfer<E> {
    fn upload(&self, local: &Path, node: &str, remote_dir: &str) -> Result<()> {
        let args = vec![
            local.to_string_lossy().into_owned(),
            self.remote_spec(node, remote_dir),
        ];
        self.run(node, args)
    }

    fn download(&self, node: &str, remote_pattern: &str, local_dir: &Path) -> Result<()> {
        std::fs::create_dir_all(local_dir)?;
        let args = vec![
            self.remote_spec(node, remote_pattern),
            local_dir.to_string_lossy().into_owned(),
        ];
        self.run(node, args)
    }
}
