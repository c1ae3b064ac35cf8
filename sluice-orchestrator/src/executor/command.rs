//! External command execution
//!
//! Every tool the executors drive (git, podman, kubectl) runs through
//! `ExternalCommand`: output is captured, stdin can carry a secret, and the
//! process is killed if it outlives its timeout.

use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::debug;

#[derive(Debug, Error)]
pub enum CommandError {
    #[error("failed to execute '{program}': {source}")]
    Spawn {
        program: String,
        source: std::io::Error,
    },

    #[error("'{program}' did not finish within {timeout:?}")]
    TimedOut { program: String, timeout: Duration },
}

/// Captured result of a finished command
#[derive(Debug, Clone)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    /// Last non-empty stderr lines, for failure details
    pub fn stderr_tail(&self, lines: usize) -> String {
        let collected: Vec<&str> = self
            .stderr
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .collect();
        let start = collected.len().saturating_sub(lines);
        collected[start..].join("\n")
    }
}

/// Builder for one external command invocation
#[derive(Debug, Clone)]
pub struct ExternalCommand {
    program: String,
    args: Vec<String>,
    current_dir: Option<PathBuf>,
    envs: HashMap<String, String>,
    stdin: Option<String>,
    timeout: Duration,
}

impl ExternalCommand {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            current_dir: None,
            envs: HashMap::new(),
            stdin: None,
            timeout: Duration::from_secs(600),
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    #[cfg(test)]
    pub fn current_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.current_dir = Some(dir.into());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.envs.insert(key.into(), value.into());
        self
    }

    /// Data written to the child's stdin; never logged
    pub fn stdin(mut self, data: impl Into<String>) -> Self {
        self.stdin = Some(data.into());
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Runs the command to completion
    ///
    /// A non-zero exit is not an error here; callers classify it.
    pub async fn run(self) -> Result<CommandOutput, CommandError> {
        debug!("Executing: {} {:?}", self.program, self.args);

        let mut command = Command::new(&self.program);
        command
            .args(&self.args)
            .envs(&self.envs)
            .stdin(if self.stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        if let Some(dir) = &self.current_dir {
            command.current_dir(dir);
        }

        let mut child = command.spawn().map_err(|source| CommandError::Spawn {
            program: self.program.clone(),
            source,
        })?;

        if let Some(data) = &self.stdin {
            if let Some(mut stdin) = child.stdin.take() {
                stdin
                    .write_all(data.as_bytes())
                    .await
                    .map_err(|source| CommandError::Spawn {
                        program: self.program.clone(),
                        source,
                    })?;
                // Dropping stdin closes the pipe so the child sees EOF
            }
        }

        let output = match tokio::time::timeout(self.timeout, child.wait_with_output()).await {
            Ok(result) => result.map_err(|source| CommandError::Spawn {
                program: self.program.clone(),
                source,
            })?,
            Err(_) => {
                return Err(CommandError::TimedOut {
                    program: self.program,
                    timeout: self.timeout,
                });
            }
        };

        let result = CommandOutput {
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
            exit_code: output.status.code().unwrap_or(-1),
        };

        if result.success() {
            debug!(
                "{} completed: stdout_len={}, stderr_len={}",
                self.program,
                result.stdout.len(),
                result.stderr.len()
            );
        } else {
            debug!(
                "{} failed: exit_code={} stderr='{}'",
                self.program,
                result.exit_code,
                result.stderr.trim()
            );
        }

        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_captures_stdout_and_exit_code() {
        let output = ExternalCommand::new("sh")
            .args(["-c", "echo hello; echo oops >&2; exit 3"])
            .run()
            .await
            .unwrap();
        assert_eq!(output.stdout.trim(), "hello");
        assert_eq!(output.stderr.trim(), "oops");
        assert_eq!(output.exit_code, 3);
        assert!(!output.success());
    }

    #[tokio::test]
    async fn test_stdin_is_delivered() {
        let output = ExternalCommand::new("sh")
            .args(["-c", "cat"])
            .stdin("s3cret")
            .run()
            .await
            .unwrap();
        assert_eq!(output.stdout, "s3cret");
    }

    #[tokio::test]
    async fn test_env_and_cwd() {
        let dir = tempfile::tempdir().unwrap();
        let output = ExternalCommand::new("sh")
            .args(["-c", "echo $GREETING; pwd"])
            .env("GREETING", "hi")
            .current_dir(dir.path())
            .run()
            .await
            .unwrap();
        let mut lines = output.stdout.lines();
        assert_eq!(lines.next(), Some("hi"));
        let cwd = std::fs::canonicalize(lines.next().unwrap()).unwrap();
        assert_eq!(cwd, std::fs::canonicalize(dir.path()).unwrap());
    }

    #[tokio::test]
    async fn test_timeout_kills_command() {
        let result = ExternalCommand::new("sleep")
            .arg("5")
            .timeout(Duration::from_millis(100))
            .run()
            .await;
        assert!(matches!(result, Err(CommandError::TimedOut { .. })));
    }

    #[tokio::test]
    async fn test_missing_program() {
        let result = ExternalCommand::new("sluice-definitely-not-installed")
            .run()
            .await;
        assert!(matches!(result, Err(CommandError::Spawn { .. })));
    }

    #[test]
    fn test_stderr_tail() {
        let output = CommandOutput {
            stdout: String::new(),
            stderr: "one\n\ntwo\nthree\n".to_string(),
            exit_code: 1,
        };
        assert_eq!(output.stderr_tail(2), "two\nthree");
        assert_eq!(output.stderr_tail(10), "one\ntwo\nthree");
    }
}
