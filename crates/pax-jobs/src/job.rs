use std::fmt;
use std::io::{Read, Write};
use std::process::Child;

use tracing::debug;

/// Exit-code callback run exactly once at the first terminal observation of
/// a job, whether that observation is a `wait`, a `communicate`, or a `kill`.
pub type Finalizer = Box<dyn FnOnce(Option<i32>) + Send>;

/// A spawned subprocess whose terminal state is observed exactly once.
pub struct Job {
    command: Vec<String>,
    pid: u32,
    child: Option<Child>,
    context: Option<String>,
    finalizer: Option<Finalizer>,
}

/// Exit code plus whatever stderr the process produced, before any error
/// classification is applied.
#[derive(Debug)]
pub struct ExitObservation {
    pub exitcode: Option<i32>,
    pub stderr: Option<String>,
}

impl Job {
    /// Adopt an already-spawned child. Capture of stdout/stderr is governed
    /// by how the caller configured the `Command`.
    #[must_use]
    pub fn new(command: Vec<String>, child: Child) -> Self {
        let pid = child.id();
        Self {
            command,
            pid,
            child: Some(child),
            context: None,
            finalizer: None,
        }
    }

    /// Label error output with the subsystem that ran this job, e.g. `pip`.
    #[must_use]
    pub fn with_context(mut self, context: impl Into<String>) -> Self {
        self.context = Some(context.into());
        self
    }

    #[must_use]
    pub fn with_finalizer(mut self, finalizer: Finalizer) -> Self {
        self.finalizer = Some(finalizer);
        self
    }

    #[must_use]
    pub fn command(&self) -> &[String] {
        &self.command
    }

    #[must_use]
    pub fn pid(&self) -> u32 {
        self.pid
    }

    #[must_use]
    pub fn context(&self) -> Option<&str> {
        self.context.as_deref()
    }

    fn finalize(&mut self, exitcode: Option<i32>) {
        if let Some(finalizer) = self.finalizer.take() {
            finalizer(exitcode);
        }
    }

    /// Wait for termination and report the raw observation. I/O failures
    /// while reaping are surfaced as a [`JobError`] with no exit code.
    pub fn finish(&mut self) -> Result<ExitObservation, JobError> {
        let Some(mut child) = self.child.take() else {
            // Already observed; report a clean repeat observation.
            return Ok(ExitObservation {
                exitcode: Some(0),
                stderr: None,
            });
        };
        let stderr = child.stderr.take().map(|mut pipe| {
            let mut captured = String::new();
            let _ = pipe.read_to_string(&mut captured);
            captured
        });
        let status = child.wait().map_err(|err| {
            self.finalize(None);
            self.error(None, Some(format!("failed to reap process: {err}")))
        })?;
        let exitcode = status.code();
        self.finalize(exitcode);
        Ok(ExitObservation {
            exitcode,
            stderr: stderr.filter(|captured| !captured.is_empty()),
        })
    }

    /// Wait for termination, mapping any non-zero exit to a [`JobError`].
    pub fn wait(&mut self) -> Result<(), JobError> {
        let observation = self.finish()?;
        self.check_exit(observation)
    }

    /// Feed `input` to stdin (closing it), then wait, capturing stdout.
    pub fn communicate(&mut self, input: Option<&[u8]>) -> Result<Vec<u8>, JobError> {
        let Some(mut child) = self.child.take() else {
            return Ok(Vec::new());
        };
        if let Some(bytes) = input {
            if let Some(mut stdin) = child.stdin.take() {
                stdin.write_all(bytes).map_err(|err| {
                    self.error(None, Some(format!("failed to write stdin: {err}")))
                })?;
            }
        } else {
            drop(child.stdin.take());
        }
        let output = child.wait_with_output().map_err(|err| {
            self.finalize(None);
            self.error(None, Some(format!("failed to reap process: {err}")))
        })?;
        let exitcode = output.status.code();
        self.finalize(exitcode);
        let stderr = String::from_utf8_lossy(&output.stderr).into_owned();
        self.check_exit(ExitObservation {
            exitcode,
            stderr: Some(stderr).filter(|captured| !captured.is_empty()),
        })?;
        Ok(output.stdout)
    }

    /// Terminate the process. Idempotent: a job that already exited (or was
    /// already killed) is left alone.
    pub fn kill(&mut self) {
        if let Some(child) = self.child.as_mut() {
            if let Err(err) = child.kill() {
                debug!(pid = self.pid, "kill ignored: {err}");
            }
            let exitcode = child.wait().ok().and_then(|status| status.code());
            self.finalize(exitcode);
        }
        self.child = None;
    }

    fn check_exit(&self, observation: ExitObservation) -> Result<(), JobError> {
        match observation.exitcode {
            Some(0) => Ok(()),
            code => Err(self.error(code, observation.stderr)),
        }
    }

    /// Build the structured error for this job.
    #[must_use]
    pub fn error(&self, exitcode: Option<i32>, stderr: Option<String>) -> JobError {
        JobError {
            pid: self.pid,
            command: self.command.clone(),
            exitcode,
            stderr,
            context: self.context.clone(),
        }
    }
}

impl Drop for Job {
    fn drop(&mut self) {
        // Never leave a subprocess running past its handle.
        self.kill();
    }
}

/// Structured failure of one subprocess.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobError {
    pub pid: u32,
    pub command: Vec<String>,
    pub exitcode: Option<i32>,
    pub stderr: Option<String>,
    pub context: Option<String>,
}

impl JobError {
    /// Stderr lines prefixed with the job context for display.
    pub fn contextualized_stderr(&self) -> impl Iterator<Item = String> + '_ {
        self.stderr
            .as_deref()
            .unwrap_or_default()
            .lines()
            .map(move |line| match self.context.as_deref() {
                Some(context) => format!("{context}: {line}"),
                None => line.to_string(),
            })
    }
}

impl fmt::Display for JobError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.exitcode {
            Some(code) => write!(
                f,
                "Executing `{}` failed with exit code {code} (pid {})",
                self.command.join(" "),
                self.pid
            )?,
            None => write!(
                f,
                "Executing `{}` failed before producing an exit code (pid {})",
                self.command.join(" "),
                self.pid
            )?,
        }
        for line in self.contextualized_stderr() {
            write!(f, "\n{line}")?;
        }
        Ok(())
    }
}

impl std::error::Error for JobError {}

/// Common surface over plain jobs and log-scraping jobs so callers can treat
/// them uniformly inside [`crate::SpawnedJob`].
pub trait ManagedJob: Send {
    fn wait(&mut self) -> Result<(), JobError>;
    fn communicate(&mut self, input: Option<&[u8]>) -> Result<Vec<u8>, JobError>;
    fn kill(&mut self);
    fn command(&self) -> &[String];
}

impl ManagedJob for Job {
    fn wait(&mut self) -> Result<(), JobError> {
        Job::wait(self)
    }

    fn communicate(&mut self, input: Option<&[u8]>) -> Result<Vec<u8>, JobError> {
        Job::communicate(self, input)
    }

    fn kill(&mut self) {
        Job::kill(self);
    }

    fn command(&self) -> &[String] {
        Job::command(self)
    }
}
