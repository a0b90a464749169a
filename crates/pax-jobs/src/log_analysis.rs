use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::PathBuf;

use tracing::debug;

use crate::{Job, JobError, ManagedJob};

/// A structured error extracted from an external tool's log output.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ErrorMessage(pub String);

/// Verdict for one analyzed log line.
#[derive(Debug)]
pub enum Analysis {
    /// Keep feeding this analyzer lines; optionally collect a message now.
    Continue(Option<ErrorMessage>),
    /// This analyzer is done; optionally collect a final message.
    Complete(Option<ErrorMessage>),
}

/// Streaming analysis of an external tool's log file.
///
/// Analyzers are only consulted when the tool failed; each active analyzer
/// sees every line until it reports [`Analysis::Complete`] and drops out.
pub trait LogAnalyzer: Send {
    /// Whether this analyzer wants to see the log for the given exit code.
    fn should_collect(&self, returncode: i32) -> bool;

    /// Inspect one log line.
    fn analyze(&mut self, line: &str) -> Analysis;

    /// Called after the last line; a chance to flush buffered state.
    fn analysis_completed(&mut self) -> Option<ErrorMessage> {
        None
    }
}

/// A [`Job`] whose failures are explained by scraping an external log file.
///
/// The wrapped tool is opaque: its stdout is reserved for structured data and
/// its diagnostics land in `log_path`. On a non-zero exit the log is streamed
/// through the analyzers and the collected messages become the error's
/// stderr. If nothing was collected and the process produced no stderr of its
/// own, the whole log is attached instead; noise beats silence when a build
/// fails.
pub struct LogScrapeJob {
    job: Job,
    log_path: PathBuf,
    analyzers: Vec<Box<dyn LogAnalyzer>>,
}

impl LogScrapeJob {
    #[must_use]
    pub fn new(job: Job, log_path: PathBuf, analyzers: Vec<Box<dyn LogAnalyzer>>) -> Self {
        Self {
            job,
            log_path,
            analyzers,
        }
    }

    fn scrape(&mut self, returncode: i32) -> Vec<ErrorMessage> {
        let mut active: Vec<&mut Box<dyn LogAnalyzer>> = self
            .analyzers
            .iter_mut()
            .filter(|analyzer| analyzer.should_collect(returncode))
            .collect();
        let mut collected = Vec::new();
        let Ok(file) = File::open(&self.log_path) else {
            debug!(log = %self.log_path.display(), "log file missing; nothing to scrape");
            return collected;
        };
        for line in BufReader::new(file).lines() {
            let Ok(line) = line else { break };
            let mut still_active = Vec::new();
            for analyzer in active.drain(..) {
                match analyzer.analyze(&line) {
                    Analysis::Continue(message) => {
                        collected.extend(message);
                        still_active.push(analyzer);
                    }
                    Analysis::Complete(message) => {
                        collected.extend(message);
                    }
                }
            }
            active = still_active;
            if active.is_empty() {
                break;
            }
        }
        for analyzer in active {
            collected.extend(analyzer.analysis_completed());
        }
        collected
    }

    fn explain(&mut self, error: JobError) -> JobError {
        let Some(returncode) = error.exitcode else {
            return error;
        };
        let messages = self.scrape(returncode);
        if messages.is_empty() {
            if error.stderr.is_some() {
                return error;
            }
            // Fall back to the raw log rather than reporting nothing.
            let dumped = std::fs::read_to_string(&self.log_path).ok();
            return JobError {
                stderr: dumped,
                ..error
            };
        }
        let combined = messages
            .into_iter()
            .map(|message| message.0)
            .collect::<Vec<_>>()
            .join("\n");
        JobError {
            stderr: Some(combined),
            ..error
        }
    }
}

impl ManagedJob for LogScrapeJob {
    fn wait(&mut self) -> Result<(), JobError> {
        match self.job.wait() {
            Ok(()) => Ok(()),
            Err(error) => Err(self.explain(error)),
        }
    }

    fn communicate(&mut self, input: Option<&[u8]>) -> Result<Vec<u8>, JobError> {
        match self.job.communicate(input) {
            Ok(stdout) => Ok(stdout),
            Err(error) => Err(self.explain(error)),
        }
    }

    fn kill(&mut self) {
        self.job.kill();
    }

    fn command(&self) -> &[String] {
        self.job.command()
    }
}

#[cfg(test)]
mod tests {
    use std::process::{Command, Stdio};

    use super::*;

    /// Collects `ERROR: `-prefixed lines, stopping at the first blank line.
    struct ErrorLines {
        done: bool,
    }

    impl LogAnalyzer for ErrorLines {
        fn should_collect(&self, returncode: i32) -> bool {
            returncode != 0
        }

        fn analyze(&mut self, line: &str) -> Analysis {
            if self.done {
                return Analysis::Complete(None);
            }
            if let Some(rest) = line.strip_prefix("ERROR: ") {
                Analysis::Continue(Some(ErrorMessage(rest.to_string())))
            } else if line.is_empty() {
                self.done = true;
                Analysis::Complete(None)
            } else {
                Analysis::Continue(None)
            }
        }
    }

    fn failing_job() -> Job {
        let command = vec!["/bin/sh".to_string(), "-c".to_string(), "exit 2".to_string()];
        let child = Command::new(&command[0])
            .args(&command[1..])
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .expect("spawn");
        Job::new(command, child).with_context("tool")
    }

    #[cfg(unix)]
    #[test]
    fn collected_messages_become_stderr() {
        let temp = tempfile::tempdir().unwrap();
        let log = temp.path().join("tool.log");
        std::fs::write(
            &log,
            "info: starting\nERROR: first problem\nERROR: second problem\n\nERROR: past the blank\n",
        )
        .unwrap();

        let mut scrape = LogScrapeJob::new(
            failing_job(),
            log,
            vec![Box::new(ErrorLines { done: false })],
        );
        let error = scrape.wait().unwrap_err();
        assert_eq!(error.exitcode, Some(2));
        assert_eq!(
            error.stderr.as_deref(),
            Some("first problem\nsecond problem")
        );
    }

    #[cfg(unix)]
    #[test]
    fn empty_analysis_falls_back_to_full_log() {
        let temp = tempfile::tempdir().unwrap();
        let log = temp.path().join("tool.log");
        std::fs::write(&log, "nothing matched here\n").unwrap();

        let mut scrape = LogScrapeJob::new(
            failing_job(),
            log,
            vec![Box::new(ErrorLines { done: false })],
        );
        let error = scrape.wait().unwrap_err();
        assert_eq!(error.stderr.as_deref(), Some("nothing matched here\n"));
    }

    #[cfg(unix)]
    #[test]
    fn successful_jobs_skip_scraping() {
        let temp = tempfile::tempdir().unwrap();
        let command = vec!["/bin/sh".to_string(), "-c".to_string(), "exit 0".to_string()];
        let child = Command::new(&command[0])
            .args(&command[1..])
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .expect("spawn");
        let mut scrape = LogScrapeJob::new(
            Job::new(command, child),
            temp.path().join("absent.log"),
            vec![Box::new(ErrorLines { done: false })],
        );
        assert!(scrape.wait().is_ok());
    }
}
