use std::path::PathBuf;

use clap::{Args, Parser, Subcommand, ValueEnum};

#[derive(Parser, Debug)]
#[command(author, version, about = "Reproducible resolve/lock pipeline for Python requirements")]
pub struct PaxCli {
    #[arg(
        short,
        long,
        help = "Suppress human output (errors still print to stderr)",
        global = true
    )]
    pub quiet: bool,
    #[arg(short, long, action = clap::ArgAction::Count, help = "Increase logging (-vv reaches trace)", global = true)]
    pub verbose: u8,
    #[arg(long, help = "Force trace logging regardless of -v/-q", global = true)]
    pub trace: bool,
    #[arg(long, help = "Emit machine-readable JSON output", global = true)]
    pub json: bool,
    #[command(subcommand)]
    pub command: PaxCommand,
}

#[derive(Subcommand, Debug)]
pub enum PaxCommand {
    /// Resolve requirements into installed distributions.
    Resolve(ResolveArgs),
    /// Fetch requirements into the download cache without building.
    Download(ResolveArgs),
    /// Lock-file operations.
    #[command(subcommand)]
    Lock(LockCommand),
    /// Inspect or clear the pax cache.
    #[command(subcommand)]
    Cache(CacheCommand),
}

#[derive(Subcommand, Debug)]
pub enum LockCommand {
    /// Resolve and persist a reproducible lock file.
    Create(LockCreateArgs),
}

#[derive(Subcommand, Debug)]
pub enum CacheCommand {
    /// Print the resolved cache root.
    Dir,
    /// Summarize cache contents.
    Info,
    /// Delete the entire cache root.
    Purge,
}

#[derive(Args, Debug)]
pub struct ResolveArgs {
    /// Requirement specifiers, e.g. `ansicolors==1.1.8`.
    #[arg(required = true)]
    pub requirements: Vec<String>,
    #[arg(long, value_name = "FILE", help = "Constraints file(s) forwarded to pip")]
    pub constraint: Vec<PathBuf>,
    #[arg(long, help = "Interpreter to resolve for (defaults to python3 on PATH)")]
    pub python: Option<PathBuf>,
    #[arg(long, value_name = "TAG", help = "Resolve for a foreign platform tag instead")]
    pub platform: Vec<String>,
    #[arg(long, help = "Primary package index URL")]
    pub index_url: Option<String>,
    #[arg(long, value_name = "N", help = "Maximum concurrent jobs")]
    pub max_jobs: Option<usize>,
}

#[derive(Args, Debug)]
pub struct LockCreateArgs {
    #[command(flatten)]
    pub resolve: ResolveArgs,
    #[arg(short, long, default_value = "pax.lock", help = "Lock file destination")]
    pub output: PathBuf,
    #[arg(long, value_enum, default_value = "strict", help = "Lock style")]
    pub style: StyleArg,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
pub enum StyleArg {
    Strict,
    Sources,
    Universal,
}

impl From<StyleArg> for pax_lock::LockStyle {
    fn from(style: StyleArg) -> Self {
        match style {
            StyleArg::Strict => Self::Strict,
            StyleArg::Sources => Self::Sources,
            StyleArg::Universal => Self::Universal,
        }
    }
}
