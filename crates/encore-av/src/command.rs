//! Deadline-bound invocations of ffmpeg-family executables.

use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use encore_core::{Error, Result};
use tokio::process::Command;

/// Deadline for short tool runs such as probes and version checks.
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Lines of stderr kept in a failure message. ffmpeg prints its banner and
/// per-stream progress there, so only the end is useful.
const STDERR_TAIL_LINES: usize = 8;

/// What a finished tool run printed.
#[derive(Debug, Clone)]
pub struct ToolOutput {
    pub status: ExitStatus,
    pub stdout: String,
    pub stderr: String,
}

impl ToolOutput {
    /// Last few non-empty stderr lines, joined with ` | `.
    pub fn stderr_tail(&self) -> String {
        let lines: Vec<&str> = self
            .stderr
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .collect();
        let start = lines.len().saturating_sub(STDERR_TAIL_LINES);
        lines[start..].join(" | ")
    }
}

/// One invocation of an external tool.
///
/// The child gets a null stdin and is spawned with `kill_on_drop`: once the
/// deadline passes the wait future is dropped and the process dies with it,
/// so an abandoned transcode never keeps writing into a scratch directory.
///
/// ```no_run
/// use encore_av::ToolCommand;
/// use std::path::PathBuf;
///
/// # async fn example() -> encore_core::Result<()> {
/// let output = ToolCommand::new(PathBuf::from("ffprobe"))
///     .args(["-v", "error", "-show_entries", "format=duration"])
///     .arg("/path/to/track.flac")
///     .execute()
///     .await?;
/// println!("{}", output.stdout);
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct ToolCommand {
    program: PathBuf,
    args: Vec<String>,
    current_dir: Option<PathBuf>,
    timeout: Duration,
}

impl ToolCommand {
    pub fn new(program: PathBuf) -> Self {
        Self {
            program,
            args: Vec::new(),
            current_dir: None,
            timeout: DEFAULT_TIMEOUT,
        }
    }

    pub fn arg(&mut self, s: impl Into<String>) -> &mut Self {
        self.args.push(s.into());
        self
    }

    pub fn args(&mut self, iter: impl IntoIterator<Item = impl Into<String>>) -> &mut Self {
        self.args.extend(iter.into_iter().map(Into::into));
        self
    }

    /// Run the child from `dir` instead of the caller's working directory.
    pub fn current_dir(&mut self, dir: impl Into<PathBuf>) -> &mut Self {
        self.current_dir = Some(dir.into());
        self
    }

    pub fn timeout(&mut self, d: Duration) -> &mut Self {
        self.timeout = d;
        self
    }

    /// Short name used in errors and logs (`ffmpeg`, not `/usr/bin/ffmpeg`).
    pub fn tool_name(&self) -> String {
        self.program
            .file_name()
            .unwrap_or(self.program.as_os_str())
            .to_string_lossy()
            .into_owned()
    }

    /// Run to completion and return whatever the tool printed, whatever its
    /// exit status. Only spawn failures and the deadline are errors here.
    pub async fn output(&self) -> Result<ToolOutput> {
        let tool = self.tool_name();
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &self.current_dir {
            cmd.current_dir(dir);
        }

        tracing::debug!(tool = %tool, args = ?self.args, "Spawning tool");
        let child = cmd
            .spawn()
            .map_err(|e| Error::tool(&tool, format!("failed to spawn: {e}")))?;

        let output = tokio::time::timeout(self.timeout, child.wait_with_output())
            .await
            .map_err(|_| Error::timeout(&tool, self.timeout))?
            .map_err(|e| Error::tool(&tool, format!("I/O error waiting for process: {e}")))?;

        Ok(ToolOutput {
            status: output.status,
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }

    /// Like [`output`](Self::output), but a non-zero exit becomes
    /// [`Error::Tool`] carrying the tail of stderr.
    pub async fn execute(&self) -> Result<ToolOutput> {
        let output = self.output().await?;
        if !output.status.success() {
            return Err(Error::tool(
                self.tool_name(),
                format!("exited with {}: {}", output.status, output.stderr_tail()),
            ));
        }
        Ok(output)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[cfg(unix)]
    #[test]
    fn stderr_tail_keeps_last_lines() {
        let stderr: String = (0..20).map(|i| format!("line {i}\n\n")).collect();
        let out = ToolOutput {
            status: exit_ok(),
            stdout: String::new(),
            stderr,
        };
        let tail = out.stderr_tail();
        assert!(tail.starts_with("line 12"));
        assert!(tail.ends_with("line 19"));
        assert_eq!(tail.matches(" | ").count(), STDERR_TAIL_LINES - 1);
    }

    #[cfg(unix)]
    fn exit_ok() -> ExitStatus {
        use std::os::unix::process::ExitStatusExt;
        ExitStatus::from_raw(0)
    }

    #[test]
    fn tool_name_strips_directories() {
        let cmd = ToolCommand::new(PathBuf::from("/usr/local/bin/ffmpeg"));
        assert_eq!(cmd.tool_name(), "ffmpeg");
    }

    #[tokio::test]
    async fn spawn_failure_is_tool_error() {
        let result = ToolCommand::new(PathBuf::from("nonexistent_tool_xyz_12345"))
            .execute()
            .await;
        assert!(matches!(result, Err(Error::Tool { .. })));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn deadline_is_timeout_error() {
        let result = ToolCommand::new(PathBuf::from("sleep"))
            .arg("10")
            .timeout(Duration::from_millis(100))
            .execute()
            .await;
        let err = result.unwrap_err();
        assert!(matches!(err, Error::Timeout { .. }), "unexpected error: {err}");
        assert!(err.is_transient());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn output_tolerates_failure_but_execute_does_not() {
        let out = ToolCommand::new(PathBuf::from("false")).output().await.unwrap();
        assert!(!out.status.success());
        let result = ToolCommand::new(PathBuf::from("false")).execute().await;
        assert!(matches!(result, Err(Error::Tool { .. })));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn runs_in_current_dir() {
        let dir = tempfile::tempdir().unwrap();
        let out = ToolCommand::new(PathBuf::from("pwd"))
            .current_dir(dir.path())
            .execute()
            .await
            .unwrap();
        let printed = std::fs::canonicalize(out.stdout.trim()).unwrap();
        assert_eq!(printed, std::fs::canonicalize(dir.path()).unwrap());
    }
}
