//! Supervised external processes.
//!
//! Generic lifecycle wrapper around the remux server, tunnel, and transcoder
//! binaries: spawn with prefixed log pumps, poll exit status, and terminate
//! with a bounded grace period before a forced kill.

use std::ffi::OsStr;
use std::process::Stdio;
use std::time::Duration;

use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader, Lines};
use tokio::process::{Child, ChildStderr, Command};

/// Errors from spawning or signaling an external process
#[derive(Debug, Error)]
pub enum ProcessError {
    #[error("Failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        source: std::io::Error,
    },

    #[error("Failed to signal {name}: {reason}")]
    Signal { name: String, reason: String },
}

/// A spawned external process with supervised lifecycle.
///
/// Dropping the handle does not kill the process; callers own shutdown via
/// [`SupervisedProcess::terminate`].
pub struct SupervisedProcess {
    name: String,
    child: Option<Child>,
}

impl SupervisedProcess {
    /// Spawns `program` with both output streams pumped to the log, each
    /// line tagged with the process name.
    ///
    /// # Errors
    ///
    /// - `ProcessError::Spawn` - The binary is missing or not executable
    pub fn spawn<I, S>(name: &str, program: &OsStr, args: I) -> Result<Self, ProcessError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        let mut process = Self::spawn_inner(name, program, args)?;
        if let Some(child) = process.child.as_mut()
            && let Some(stderr) = child.stderr.take()
        {
            pump_lines(process.name.clone(), BufReader::new(stderr).lines());
        }
        Ok(process)
    }

    /// Spawns `program` but hands the stderr line stream to the caller
    /// instead of pumping it, for processes that report state on stderr
    /// (the tunnel prints its assigned public URL there). Stdout is pumped
    /// as usual.
    pub fn spawn_with_stderr<I, S>(
        name: &str,
        program: &OsStr,
        args: I,
    ) -> Result<(Self, Lines<BufReader<ChildStderr>>), ProcessError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        let mut process = Self::spawn_inner(name, program, args)?;
        let stderr = process
            .child
            .as_mut()
            .and_then(|child| child.stderr.take())
            .ok_or_else(|| ProcessError::Spawn {
                program: program.to_string_lossy().into_owned(),
                source: std::io::Error::other("stderr pipe missing"),
            })?;
        Ok((process, BufReader::new(stderr).lines()))
    }

    fn spawn_inner<I, S>(name: &str, program: &OsStr, args: I) -> Result<Self, ProcessError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        let mut child = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|source| ProcessError::Spawn {
                program: program.to_string_lossy().into_owned(),
                source,
            })?;

        if let Some(stdout) = child.stdout.take() {
            pump_lines(name.to_string(), BufReader::new(stdout).lines());
        }

        tracing::debug!(
            "Spawned {} (pid {:?})",
            name,
            child.id()
        );

        Ok(Self {
            name: name.to_string(),
            child: Some(child),
        })
    }

    /// Returns the exit code if the process has exited, `None` while it is
    /// still running or after [`SupervisedProcess::terminate`]. Death by
    /// signal reports as -1.
    pub fn exit_code(&mut self) -> Option<i32> {
        let child = self.child.as_mut()?;
        let status = child.try_wait().ok().flatten()?;
        Some(status.code().unwrap_or(-1))
    }

    /// Waits for the process to exit and returns its exit code.
    ///
    /// Returns `None` if the handle was already terminated.
    pub async fn wait(&mut self) -> Option<i32> {
        let child = self.child.as_mut()?;
        match child.wait().await {
            Ok(status) => Some(status.code().unwrap_or(-1)),
            Err(e) => {
                tracing::warn!("Failed waiting on {}: {e}", self.name);
                None
            }
        }
    }

    /// Terminates the process: graceful stop signal, bounded wait, then a
    /// forced kill with an unconditional wait.
    ///
    /// Idempotent - a second call observes no child and returns immediately.
    pub async fn terminate(&mut self, grace: Duration) {
        let Some(mut child) = self.child.take() else {
            return;
        };

        if let Ok(Some(status)) = child.try_wait() {
            tracing::debug!("{} already exited with {status}", self.name);
            return;
        }

        Self::request_stop(&mut child);

        match tokio::time::timeout(grace, child.wait()).await {
            Ok(result) => {
                if let Ok(status) = result {
                    tracing::debug!("{} stopped gracefully with {status}", self.name);
                }
            }
            Err(_) => {
                tracing::warn!(
                    "{} ignored stop for {}ms, killing",
                    self.name,
                    grace.as_millis()
                );
                let _ = child.start_kill();
                let _ = child.wait().await;
            }
        }
    }

    #[cfg(unix)]
    fn request_stop(child: &mut Child) {
        use nix::sys::signal::{Signal, kill};
        use nix::unistd::Pid;

        match child.id() {
            Some(pid) => {
                let _ = kill(Pid::from_raw(pid as i32), Signal::SIGTERM);
            }
            None => {
                let _ = child.start_kill();
            }
        }
    }

    #[cfg(not(unix))]
    fn request_stop(child: &mut Child) {
        let _ = child.start_kill();
    }

    /// Sends a Unix signal to the running process (config reloads).
    ///
    /// # Errors
    ///
    /// - `ProcessError::Signal` - The process is not running or delivery failed
    #[cfg(unix)]
    pub fn send_signal(&self, signal: nix::sys::signal::Signal) -> Result<(), ProcessError> {
        use nix::sys::signal::kill;
        use nix::unistd::Pid;

        let pid = self
            .child
            .as_ref()
            .and_then(|child| child.id())
            .ok_or_else(|| ProcessError::Signal {
                name: self.name.clone(),
                reason: "process is not running".to_string(),
            })?;

        kill(Pid::from_raw(pid as i32), signal).map_err(|errno| ProcessError::Signal {
            name: self.name.clone(),
            reason: errno.to_string(),
        })
    }
}

/// Forwards lines from a subprocess stream to the log, tagged with `prefix`.
pub fn pump_lines<R>(prefix: String, mut lines: Lines<BufReader<R>>)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        while let Ok(Some(line)) = lines.next_line().await {
            tracing::info!(target: "streamcast::subprocess", "[{prefix}] {line}");
        }
    });
}

#[cfg(test)]
mod tests {
    use std::ffi::OsString;

    use super::*;

    fn sh(script: &str) -> (OsString, Vec<String>) {
        (
            OsString::from("sh"),
            vec!["-c".to_string(), script.to_string()],
        )
    }

    #[tokio::test]
    async fn test_wait_reports_exit_code() {
        let (program, args) = sh("exit 7");
        let mut process = SupervisedProcess::spawn("test-exit", &program, args).unwrap();
        assert_eq!(process.wait().await, Some(7));
    }

    #[tokio::test]
    async fn test_exit_code_none_while_running() {
        let (program, args) = sh("sleep 5");
        let mut process = SupervisedProcess::spawn("test-running", &program, args).unwrap();
        assert_eq!(process.exit_code(), None);
        process.terminate(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn test_terminate_is_idempotent() {
        let (program, args) = sh("sleep 5");
        let mut process = SupervisedProcess::spawn("test-idempotent", &program, args).unwrap();
        process.terminate(Duration::from_secs(1)).await;
        // Second call observes no child and returns immediately.
        process.terminate(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn test_spawn_missing_binary_fails() {
        let program = OsString::from("definitely-not-a-real-binary");
        let result = SupervisedProcess::spawn("test-missing", &program, Vec::<String>::new());
        assert!(matches!(result, Err(ProcessError::Spawn { .. })));
    }

    #[tokio::test]
    async fn test_spawn_with_stderr_yields_lines() {
        let (program, args) = sh("echo to-stderr >&2");
        let (_process, mut lines) =
            SupervisedProcess::spawn_with_stderr("test-stderr", &program, args).unwrap();
        let line = lines.next_line().await.unwrap();
        assert_eq!(line.as_deref(), Some("to-stderr"));
    }
}
