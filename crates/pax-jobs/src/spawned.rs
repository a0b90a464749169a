use std::path::PathBuf;

use crate::{JobError, ManagedJob};

/// How a [`SpawnedJob`] failed: the process itself, or the deferred
/// result-extraction step that runs after it succeeds.
#[derive(Debug, thiserror::Error)]
pub enum JobFailure {
    #[error(transparent)]
    Job(#[from] JobError),
    #[error(transparent)]
    Extract(#[from] anyhow::Error),
}

type Extract<T> = Box<dyn FnOnce() -> anyhow::Result<T> + Send>;
type ExtractStdout<T> = Box<dyn FnOnce(Vec<u8>) -> anyhow::Result<T> + Send>;
type ExtractFile<T> = Box<dyn FnOnce(&PathBuf) -> anyhow::Result<T> + Send>;

/// A job paired with a deferred result extraction.
///
/// The variants mirror the ways a subprocess can hand back a result: no work
/// at all, a side effect inspected after the wait, captured stdout, or a file
/// the job must produce.
pub enum SpawnedJob<T> {
    /// No subprocess needed; the result is already known.
    Completed(Option<T>),
    /// Wait for the job, then compute the result from its side effects.
    AndThen {
        job: Box<dyn ManagedJob>,
        extract: Extract<T>,
    },
    /// Wait for the job and derive the result from captured stdout.
    Stdout {
        job: Box<dyn ManagedJob>,
        extract: ExtractStdout<T>,
    },
    /// Wait for the job and derive the result from a file it produced.
    File {
        job: Box<dyn ManagedJob>,
        path: PathBuf,
        extract: ExtractFile<T>,
    },
}

impl<T> SpawnedJob<T> {
    #[must_use]
    pub fn completed(value: T) -> Self {
        Self::Completed(Some(value))
    }

    pub fn and_then<J, F>(job: J, extract: F) -> Self
    where
        J: ManagedJob + 'static,
        F: FnOnce() -> anyhow::Result<T> + Send + 'static,
    {
        Self::AndThen {
            job: Box::new(job),
            extract: Box::new(extract),
        }
    }

    pub fn stdout<J, F>(job: J, extract: F) -> Self
    where
        J: ManagedJob + 'static,
        F: FnOnce(Vec<u8>) -> anyhow::Result<T> + Send + 'static,
    {
        Self::Stdout {
            job: Box::new(job),
            extract: Box::new(extract),
        }
    }

    pub fn from_file<J, F>(job: J, path: PathBuf, extract: F) -> Self
    where
        J: ManagedJob + 'static,
        F: FnOnce(&PathBuf) -> anyhow::Result<T> + Send + 'static,
    {
        Self::File {
            job: Box::new(job),
            path,
            extract: Box::new(extract),
        }
    }

    /// Block until the job terminates and produce its result.
    pub fn await_result(self) -> Result<T, JobFailure> {
        match self {
            Self::Completed(value) => value.ok_or_else(|| {
                JobFailure::Extract(anyhow::anyhow!("completed job already consumed"))
            }),
            Self::AndThen { mut job, extract } => {
                job.wait()?;
                extract().map_err(JobFailure::Extract)
            }
            Self::Stdout { mut job, extract } => {
                let stdout = job.communicate(None)?;
                extract(stdout).map_err(JobFailure::Extract)
            }
            Self::File { mut job, path, extract } => {
                job.wait()?;
                extract(&path).map_err(JobFailure::Extract)
            }
        }
    }

    /// Terminate the underlying process, if any, without awaiting it.
    pub fn kill(&mut self) {
        match self {
            Self::Completed(_) => {}
            Self::AndThen { job, .. } | Self::Stdout { job, .. } | Self::File { job, .. } => {
                job.kill();
            }
        }
    }
}
