use std::path::Path;

use async_trait::async_trait;

use crate::error::ShellError;

/// Exit status and combined stdout/stderr of a remote command that ran.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutput {
    pub exit_code: i32,
    pub output: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Command execution and file transfer on a worker instance.
///
/// An `Err` means the channel itself failed. A command that ran and exited
/// non-zero is an `Ok` with its real exit code.
#[async_trait]
pub trait RemoteShell: Send + Sync {
    async fn run_command(&self, addr: &str, command: &str) -> Result<CommandOutput, ShellError>;

    async fn copy_file(&self, addr: &str, local: &Path, remote: &str) -> Result<(), ShellError>;

    async fn check_path(&self, addr: &str, path: &str) -> Result<bool, ShellError>;
}
