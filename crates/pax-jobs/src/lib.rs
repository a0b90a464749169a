//! Bounded-concurrency subprocess orchestration: single jobs, deferred
//! results, parallel execution with injected error policy, and log scraping
//! for opaque external tools.

mod job;
mod log_analysis;
mod map;
mod parallel;
mod spawned;

pub use job::{ExitObservation, Finalizer, Job, JobError, ManagedJob};
pub use log_analysis::{Analysis, ErrorMessage, LogAnalyzer, LogScrapeJob};
pub use map::{iter_map_parallel, map_parallel};
pub use parallel::{
    execute_parallel, ErrorAction, ErrorHandler, Log, ParallelResult, Raise, Retain,
};
pub use spawned::{JobFailure, SpawnedJob};
