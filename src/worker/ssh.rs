use std::path::Path;
use std::process::{Output, Stdio};

use async_trait::async_trait;
use tokio::process::Command;

use crate::config::SshConfig;
use crate::error::ShellError;
use crate::worker::lifecycle::shell_quote;
use crate::worker::remote::{CommandOutput, RemoteShell};

/// Exit status ssh and scp use for their own failures.
const SSH_ERROR_STATUS: i32 = 255;

/// [`RemoteShell`] over the system `ssh` and `scp` binaries.
///
/// Connections to the same host are multiplexed through a persistent control
/// master, so repeated calls do not pay for a new handshake.
#[derive(Debug, Clone)]
pub struct SshShell {
    config: SshConfig,
}

impl SshShell {
    pub fn new(config: SshConfig) -> Self {
        Self { config }
    }

    fn common_args(&self) -> Vec<String> {
        vec![
            "-F".to_string(),
            "/dev/null".to_string(),
            "-i".to_string(),
            self.config.key_path.display().to_string(),
            "-o".to_string(),
            "BatchMode yes".to_string(),
            "-o".to_string(),
            "ControlMaster auto".to_string(),
            "-o".to_string(),
            "ControlPersist yes".to_string(),
            "-o".to_string(),
            format!("ControlPath {}", self.config.control_path),
            "-o".to_string(),
            "StrictHostKeyChecking no".to_string(),
            "-o".to_string(),
            "UserKnownHostsFile /dev/null".to_string(),
            "-o".to_string(),
            format!("ConnectTimeout={}", self.config.connect_timeout_secs),
        ]
    }

    fn destination(&self, addr: &str) -> String {
        format!("{}@{}", self.config.user, addr)
    }

    async fn ssh(&self, addr: &str, command: &str) -> Result<Output, ShellError> {
        Command::new("ssh")
            .args(self.common_args())
            .arg(self.destination(addr))
            .arg(command)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await
            .map_err(|source| ShellError::Spawn {
                program: "ssh",
                source,
            })
    }
}

/// Concatenate stdout and stderr into one output string.
fn combined(output: &Output) -> String {
    let mut text = String::from_utf8_lossy(&output.stdout).into_owned();
    text.push_str(&String::from_utf8_lossy(&output.stderr));
    text
}

/// Map an ssh process result to the remote command's outcome.
///
/// ssh reports its own failures as exit status 255, which a remote command
/// can also return. A task exiting 255 is therefore taken as a broken
/// channel: its caller gets a dispatch failure and the instance is retired.
fn command_outcome(addr: &str, output: Output) -> Result<CommandOutput, ShellError> {
    match output.status.code() {
        Some(SSH_ERROR_STATUS) | None => Err(ShellError::Transport {
            addr: addr.to_string(),
            message: match output.status.code() {
                Some(code) => format!("ssh exited with {}: {}", code, combined(&output).trim()),
                None => "ssh terminated by signal".to_string(),
            },
        }),
        Some(exit_code) => Ok(CommandOutput {
            exit_code,
            output: combined(&output),
        }),
    }
}

#[async_trait]
impl RemoteShell for SshShell {
    async fn run_command(&self, addr: &str, command: &str) -> Result<CommandOutput, ShellError> {
        let output = self.ssh(addr, command).await?;
        command_outcome(addr, output)
    }

    async fn copy_file(&self, addr: &str, local: &Path, remote: &str) -> Result<(), ShellError> {
        let output = Command::new("scp")
            .args(self.common_args())
            .arg("-p")
            .arg(local)
            .arg(format!("{}:{}", self.destination(addr), remote))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await
            .map_err(|source| ShellError::Spawn {
                program: "scp",
                source,
            })?;

        if output.status.success() {
            Ok(())
        } else {
            Err(ShellError::CopyFailed {
                addr: addr.to_string(),
                remote: remote.to_string(),
                message: combined(&output).trim().to_string(),
            })
        }
    }

    async fn check_path(&self, addr: &str, path: &str) -> Result<bool, ShellError> {
        let output = self.ssh(addr, &format!("test -e {}", shell_quote(path))).await?;
        command_outcome(addr, output).map(|out| out.success())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::process::ExitStatusExt;
    use std::path::PathBuf;
    use std::process::ExitStatus;

    fn output(raw_status: i32, stdout: &str, stderr: &str) -> Output {
        Output {
            status: ExitStatus::from_raw(raw_status),
            stdout: stdout.as_bytes().to_vec(),
            stderr: stderr.as_bytes().to_vec(),
        }
    }

    #[test]
    fn common_args_use_key_and_multiplexing() {
        let shell = SshShell::new(SshConfig {
            key_path: PathBuf::from("/keys/id_rsa"),
            ..Default::default()
        });
        let args = shell.common_args();
        assert!(args.windows(2).any(|w| w[0] == "-i" && w[1] == "/keys/id_rsa"));
        assert!(args.contains(&"ControlMaster auto".to_string()));
        assert!(args.contains(&"BatchMode yes".to_string()));
        assert!(args.contains(&"ConnectTimeout=10".to_string()));
        assert_eq!(shell.destination("192.0.2.1"), "batch@192.0.2.1");
    }

    #[test]
    fn nonzero_exit_is_a_normal_outcome() {
        // Raw wait status: exit code lives in the high byte.
        let result = command_outcome("h", output(3 << 8, "out\n", "err\n")).unwrap();
        assert_eq!(result.exit_code, 3);
        assert_eq!(result.output, "out\nerr\n");
    }

    #[test]
    fn ssh_error_status_is_a_transport_failure() {
        let err = command_outcome("h", output(255 << 8, "", "Connection refused")).unwrap_err();
        assert!(matches!(err, ShellError::Transport { .. }));
        assert!(err.to_string().contains("Connection refused"));
    }

    #[test]
    fn killed_by_signal_is_a_transport_failure() {
        let err = command_outcome("h", output(9, "", "")).unwrap_err();
        assert!(matches!(err, ShellError::Transport { .. }));
    }

    #[test]
    fn remote_exit_255_is_reported_as_transport_failure() {
        let err = command_outcome("h", output(255 << 8, "partial output\n", "")).unwrap_err();
        assert!(matches!(err, ShellError::Transport { ref addr, .. } if addr == "h"));
        assert!(err.to_string().contains("ssh exited with 255"));
    }
}
