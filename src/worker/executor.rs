//! Command execution for jobs.
//!
//! Two reserved directives bypass the shell:
//! - `sleep N` waits N seconds
//! - `fail` always fails
//!
//! Everything else runs through the host shell with a timeout. The child is
//! killed if the timeout fires.

use std::path::PathBuf;
use std::process::Stdio;
use std::sync::LazyLock;
use std::time::Duration;

use regex::Regex;
use tokio::process::Command;
use tracing::{debug, info};

use crate::error::ExecError;

/// Maximum output size before truncation (64KB).
const MAX_OUTPUT_SIZE: usize = 64 * 1024;

static SLEEP_DIRECTIVE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)^sleep\s+(\d+)$").expect("sleep directive pattern is valid")
});

/// How a job command will be carried out.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Directive {
    Sleep(u64),
    Fail,
    Shell(String),
}

impl Directive {
    pub fn parse(command: &str) -> Self {
        let cmd = command.trim();
        if let Some(secs) = SLEEP_DIRECTIVE
            .captures(cmd)
            .and_then(|c| c.get(1))
            .and_then(|m| m.as_str().parse::<u64>().ok())
        {
            return Self::Sleep(secs);
        }
        if cmd.eq_ignore_ascii_case("fail") {
            return Self::Fail;
        }
        Self::Shell(cmd.to_string())
    }
}

/// Build the host shell invocation for a command line.
fn shell_command(cmd: &str) -> Command {
    if cfg!(target_os = "windows") {
        let mut c = Command::new("cmd");
        c.args(["/C", cmd]);
        c
    } else {
        let mut c = Command::new("sh");
        c.args(["-c", cmd]);
        c
    }
}

/// Runs job commands.
#[derive(Debug, Clone, Default)]
pub struct CommandExecutor {
    working_dir: Option<PathBuf>,
}

impl CommandExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the working directory for shell commands.
    pub fn with_working_dir(mut self, dir: PathBuf) -> Self {
        self.working_dir = Some(dir);
        self
    }

    /// Run `command`, returning its trimmed stdout on success.
    pub async fn run(&self, command: &str, timeout: Duration) -> Result<String, ExecError> {
        match Directive::parse(command) {
            Directive::Sleep(secs) => {
                info!(seconds = secs, "Simulating sleep");
                tokio::time::timeout(timeout, tokio::time::sleep(Duration::from_secs(secs)))
                    .await
                    .map_err(|_| ExecError::Timeout(timeout))?;
                Ok(format!("Slept for {secs} second(s)"))
            }
            Directive::Fail => Err(ExecError::Simulated),
            Directive::Shell(cmd) => self.run_shell(&cmd, timeout).await,
        }
    }

    async fn run_shell(&self, cmd: &str, timeout: Duration) -> Result<String, ExecError> {
        let mut command = shell_command(cmd);
        if let Some(dir) = &self.working_dir {
            command.current_dir(dir);
        }
        command
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let child = command
            .spawn()
            .map_err(|e| ExecError::Spawn(e.to_string()))?;

        // Dropping the child on timeout kills it.
        let output = match tokio::time::timeout(timeout, child.wait_with_output()).await {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => return Err(ExecError::Spawn(e.to_string())),
            Err(_) => return Err(ExecError::Timeout(timeout)),
        };

        let stdout = String::from_utf8_lossy(&output.stdout);
        if output.status.success() {
            debug!(bytes = output.stdout.len(), "Command succeeded");
            return Ok(truncate_output(stdout.trim()));
        }

        let code = output.status.code().unwrap_or(-1);
        let stderr = String::from_utf8_lossy(&output.stderr);
        let message = if stderr.trim().is_empty() {
            format!("Command failed with exit code {code}")
        } else {
            truncate_output(stderr.trim())
        };
        Err(ExecError::Failed { code, message })
    }
}

/// Truncate output to fit within limits (UTF-8 safe).
fn truncate_output(s: &str) -> String {
    if s.len() <= MAX_OUTPUT_SIZE {
        s.to_string()
    } else {
        let half = MAX_OUTPUT_SIZE / 2;
        let head_end = floor_char_boundary(s, half);
        let tail_start = floor_char_boundary(s, s.len() - half);
        format!(
            "{}\n\n... [truncated {} bytes] ...\n\n{}",
            &s[..head_end],
            tail_start - head_end,
            &s[tail_start..]
        )
    }
}

/// Find the largest byte index <= `i` that is a valid char boundary.
fn floor_char_boundary(s: &str, i: usize) -> usize {
    if i >= s.len() {
        return s.len();
    }
    let mut pos = i;
    while pos > 0 && !s.is_char_boundary(pos) {
        pos -= 1;
    }
    pos
}

#[cfg(test)]
mod tests {
    use super::*;

    const TIMEOUT: Duration = Duration::from_secs(10);

    #[test]
    fn directives_parse() {
        assert_eq!(Directive::parse("sleep 3"), Directive::Sleep(3));
        assert_eq!(Directive::parse("  SLEEP   12 "), Directive::Sleep(12));
        assert_eq!(Directive::parse("fail"), Directive::Fail);
        assert_eq!(Directive::parse("FAIL"), Directive::Fail);
        assert_eq!(
            Directive::parse("sleep 1; echo hi"),
            Directive::Shell("sleep 1; echo hi".into())
        );
        assert_eq!(Directive::parse("sleep"), Directive::Shell("sleep".into()));
        assert_eq!(Directive::parse("failure"), Directive::Shell("failure".into()));
    }

    #[tokio::test]
    async fn fail_directive() {
        let err = CommandExecutor::new().run("fail", TIMEOUT).await.unwrap_err();
        assert!(matches!(err, ExecError::Simulated));
        assert_eq!(err.to_string(), "Simulated job failure for testing retries/DLQ");
    }

    #[tokio::test]
    async fn sleep_directive() {
        let out = CommandExecutor::new().run("sleep 0", TIMEOUT).await.unwrap();
        assert_eq!(out, "Slept for 0 second(s)");
    }

    #[tokio::test]
    async fn sleep_directive_respects_timeout() {
        let err = CommandExecutor::new()
            .run("sleep 5", Duration::from_millis(50))
            .await
            .unwrap_err();
        assert!(matches!(err, ExecError::Timeout(_)));
    }

    #[tokio::test]
    async fn echo_output_is_trimmed() {
        let out = CommandExecutor::new().run("echo hello", TIMEOUT).await.unwrap();
        assert_eq!(out, "hello");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn stderr_becomes_error_message() {
        let err = CommandExecutor::new()
            .run("echo oops 1>&2; exit 3", TIMEOUT)
            .await
            .unwrap_err();
        match err {
            ExecError::Failed { code, message } => {
                assert_eq!(code, 3);
                assert_eq!(message, "oops");
            }
            other => panic!("expected failure, got {other:?}"),
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn silent_failure_reports_exit_code() {
        let err = CommandExecutor::new().run("exit 7", TIMEOUT).await.unwrap_err();
        assert_eq!(err.to_string(), "Command failed with exit code 7");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn shell_timeout() {
        let start = std::time::Instant::now();
        let err = CommandExecutor::new()
            .run("sleep 5; echo late", Duration::from_millis(100))
            .await
            .unwrap_err();
        assert!(matches!(err, ExecError::Timeout(_)));
        assert!(start.elapsed() < Duration::from_secs(4));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn working_dir_is_used() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("marker.txt"), "x").unwrap();
        let out = CommandExecutor::new()
            .with_working_dir(dir.path().to_path_buf())
            .run("ls", TIMEOUT)
            .await
            .unwrap();
        assert!(out.contains("marker.txt"));
    }

    #[test]
    fn truncation_keeps_head_and_tail() {
        let s = format!("{}{}", "a".repeat(MAX_OUTPUT_SIZE), "b".repeat(100));
        let out = truncate_output(&s);
        assert!(out.starts_with('a'));
        assert!(out.ends_with('b'));
        assert!(out.contains("[truncated"));
        assert!(out.len() < s.len());
    }

    #[test]
    fn truncation_is_utf8_safe() {
        let s = "é".repeat(MAX_OUTPUT_SIZE);
        let out = truncate_output(&s);
        assert!(out.contains("[truncated"));
        assert_eq!(truncate_output("short"), "short");
    }
}
