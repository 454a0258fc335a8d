//! Remote execution channel - how the engine reaches a managed host.
//!
//! The engine is agnostic to the delivery mechanism; everything goes through
//! the `RemoteChannel` trait. The shipped implementation shells out over SSH,
//! tests inject an in-memory fleet.

use async_trait::async_trait;
use drift_common::EngineError;
use std::future::Future;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::debug;

/// Outcome of one remote command.
#[derive(Debug, Clone)]
pub struct CommandOutput {
    pub exit_code: i32,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
}

impl CommandOutput {
    pub fn stdout_text(&self) -> String {
        String::from_utf8_lossy(&self.stdout).to_string()
    }

    pub fn stderr_text(&self) -> String {
        String::from_utf8_lossy(&self.stderr).to_string()
    }

    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Abstracts whatever mechanism delivers commands and file content to a
/// managed host.
#[async_trait]
pub trait RemoteChannel: Send + Sync {
    /// Run a command on the node. A nonzero exit code is NOT an `Err`; only
    /// transport-level failures are.
    async fn execute(&self, node: &str, command: &str) -> Result<CommandOutput, EngineError>;

    /// Read a file from the node. `Ok(None)` means the path does not exist.
    async fn read_file(&self, node: &str, path: &str) -> Result<Option<Vec<u8>>, EngineError>;

    /// Write a file on the node, setting the mode when given.
    async fn write_file(
        &self,
        node: &str,
        path: &str,
        contents: &[u8],
        mode: Option<u32>,
    ) -> Result<(), EngineError>;
}

/// Wrap a remote operation in its bounded timeout. A timeout is treated
/// identically to an explicit transport failure.
pub async fn with_timeout<T, F>(duration: Duration, fut: F) -> Result<T, EngineError>
where
    F: Future<Output = Result<T, EngineError>>,
{
    match tokio::time::timeout(duration, fut).await {
        Ok(result) => result,
        Err(_) => Err(EngineError::Transport(format!(
            "operation timed out after {:?}",
            duration
        ))),
    }
}

/// SSH-backed channel: one `ssh` invocation per operation.
pub struct SshChannel {
    user: String,
    connect_timeout: Duration,
    op_timeout: Duration,
}

impl SshChannel {
    pub fn new(user: &str, connect_timeout: Duration, op_timeout: Duration) -> Self {
        Self {
            user: user.to_string(),
            connect_timeout,
            op_timeout,
        }
    }

    fn ssh_command(&self, node: &str) -> Command {
        let mut cmd = Command::new("ssh");
        cmd.arg("-o")
            .arg("BatchMode=yes")
            .arg("-o")
            .arg(format!("ConnectTimeout={}", self.connect_timeout.as_secs()))
            .arg(format!("{}@{}", self.user, node));
        cmd
    }

    async fn run(&self, node: &str, remote: &str, stdin: Option<&[u8]>) -> Result<CommandOutput, EngineError> {
        let mut cmd = self.ssh_command(node);
        cmd.arg(remote)
            .stdin(if stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        debug!("ssh {}: {}", node, remote);

        let run = async {
            let mut child = cmd
                .spawn()
                .map_err(|e| EngineError::Transport(format!("ssh spawn failed: {}", e)))?;

            if let Some(bytes) = stdin {
                let mut handle = child
                    .stdin
                    .take()
                    .ok_or_else(|| EngineError::Transport("no stdin handle".into()))?;
                handle
                    .write_all(bytes)
                    .await
                    .map_err(|e| EngineError::Transport(format!("stdin write failed: {}", e)))?;
                drop(handle);
            }

            let output = child
                .wait_with_output()
                .await
                .map_err(|e| EngineError::Transport(format!("ssh wait failed: {}", e)))?;

            Ok(CommandOutput {
                exit_code: output.status.code().unwrap_or(-1),
                stdout: output.stdout,
                stderr: output.stderr,
            })
        };

        with_timeout(self.op_timeout, run).await
    }
}

/// Exit code ssh itself uses for connection/auth failures.
const SSH_TRANSPORT_EXIT: i32 = 255;

#[async_trait]
impl RemoteChannel for SshChannel {
    async fn execute(&self, node: &str, command: &str) -> Result<CommandOutput, EngineError> {
        let output = self.run(node, command, None).await?;
        if output.exit_code == SSH_TRANSPORT_EXIT {
            return Err(EngineError::Transport(format!(
                "ssh to {} failed: {}",
                node,
                output.stderr_text().trim()
            )));
        }
        Ok(output)
    }

    async fn read_file(&self, node: &str, path: &str) -> Result<Option<Vec<u8>>, EngineError> {
        let remote = format!(
            "if test -f {p}; then cat {p}; else echo {m} >&2; fi",
            p = shell_quote(path),
            m = ABSENT_MARKER
        );
        let output = self.run(node, &remote, None).await?;
        if output.exit_code == SSH_TRANSPORT_EXIT {
            return Err(EngineError::Transport(format!(
                "ssh to {} failed: {}",
                node,
                output.stderr_text().trim()
            )));
        }
        interpret_read(node, path, output)
    }

    async fn write_file(
        &self,
        node: &str,
        path: &str,
        contents: &[u8],
        mode: Option<u32>,
    ) -> Result<(), EngineError> {
        let quoted = shell_quote(path);
        let remote = match mode {
            Some(m) => format!("cat > {q} && chmod {m:o} {q}", q = quoted, m = m),
            None => format!("cat > {q}", q = quoted),
        };
        let output = self.run(node, &remote, Some(contents)).await?;
        if !output.success() {
            return Err(EngineError::Transport(format!(
                "write to {}:{} failed: {}",
                node,
                path,
                output.stderr_text().trim()
            )));
        }
        Ok(())
    }
}

/// Stderr marker distinguishing a genuinely absent file from a failed read.
const ABSENT_MARKER: &str = "DRIFTD_ABSENT";

/// A `cat` that fails on an existing file (permissions, I/O error) must not
/// pass for an empty read; only the explicit marker means absent.
fn interpret_read(
    node: &str,
    path: &str,
    output: CommandOutput,
) -> Result<Option<Vec<u8>>, EngineError> {
    if output.stderr_text().contains(ABSENT_MARKER) {
        return Ok(None);
    }
    if !output.success() {
        return Err(EngineError::Transport(format!(
            "read {}:{} failed: {}",
            node,
            path,
            output.stderr_text().trim()
        )));
    }
    Ok(Some(output.stdout))
}

/// Minimal single-quote shell escaping for paths embedded in ssh commands.
fn shell_quote(path: &str) -> String {
    format!("'{}'", path.replace('\'', r"'\''"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_read_marker_means_absent() {
        let output = CommandOutput {
            exit_code: 0,
            stdout: Vec::new(),
            stderr: format!("{}\n", ABSENT_MARKER).into_bytes(),
        };
        let result = interpret_read("web1", "/etc/nginx/nginx.conf", output).unwrap();
        assert!(result.is_none());
    }

    #[test]
    fn test_read_success_returns_content() {
        let output = CommandOutput {
            exit_code: 0,
            stdout: b"worker_processes 4;\n".to_vec(),
            stderr: Vec::new(),
        };
        let result = interpret_read("web1", "/etc/nginx/nginx.conf", output).unwrap();
        assert_eq!(result.unwrap(), b"worker_processes 4;\n");
    }

    #[test]
    fn test_read_failure_on_existing_file_is_an_error() {
        // cat on an unreadable file: nonzero exit, no absence marker. Must
        // surface as an error, not an empty read.
        let output = CommandOutput {
            exit_code: 1,
            stdout: Vec::new(),
            stderr: b"cat: /etc/nginx/nginx.conf: Permission denied\n".to_vec(),
        };
        let err = interpret_read("web1", "/etc/nginx/nginx.conf", output).unwrap_err();
        assert!(matches!(err, EngineError::Transport(_)));
        assert!(err.to_string().contains("Permission denied"));
    }

    #[test]
    fn test_shell_quote_plain() {
        assert_eq!(shell_quote("/etc/nginx/nginx.conf"), "'/etc/nginx/nginx.conf'");
    }

    #[test]
    fn test_shell_quote_embedded_quote() {
        assert_eq!(shell_quote("/tmp/a'b"), r"'/tmp/a'\''b'");
    }

    #[tokio::test]
    async fn test_with_timeout_expires() {
        let result: Result<(), EngineError> = with_timeout(Duration::from_millis(10), async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(())
        })
        .await;
        assert!(matches!(result, Err(EngineError::Transport(_))));
    }

    #[tokio::test]
    async fn test_with_timeout_passes_result() {
        let result = with_timeout(Duration::from_secs(1), async { Ok::<_, EngineError>(42) }).await;
        assert_eq!(result.unwrap(), 42);
    }
}
