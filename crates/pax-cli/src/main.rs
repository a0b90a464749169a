use std::fs;
use std::path::Path;

use clap::Parser;
use color_eyre::eyre::eyre;
use color_eyre::Result;
use pax_domain::{AbbreviatedPlatform, Interpreter, Target};
use pax_resolver::{Pip, ResolveError, ResolveRequest, ResolverSettings};
use pax_store::PaxRoot;
use serde_json::json;

mod cli;

use cli::{CacheCommand, LockCommand, PaxCli, PaxCommand, ResolveArgs};

const PAX_VERSION: &str = env!("CARGO_PKG_VERSION");

fn main() -> Result<()> {
    color_eyre::install()?;
    let cli = PaxCli::parse();
    init_tracing(cli.trace, cli.verbose);

    let code = match run(&cli) {
        Ok(()) => 0,
        Err(err) => {
            eprintln!("{err:?}");
            exit_code_for(&err)
        }
    };
    if code == 0 {
        Ok(())
    } else {
        std::process::exit(code);
    }
}

fn init_tracing(trace: bool, verbose: u8) {
    let level = if trace {
        "trace"
    } else {
        match verbose {
            0 => "info",
            1 => "debug",
            _ => "trace",
        }
    };
    let filter = format!("pax={level},pax_cli={level}");
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_level(true)
        .with_writer(std::io::stderr)
        .finish();
    let _ = tracing::subscriber::set_global_default(subscriber);
}

/// 1 for user-addressable resolve failures, 2 for anything unexpected.
fn exit_code_for(err: &color_eyre::Report) -> i32 {
    match err.downcast_ref::<ResolveError>() {
        Some(
            ResolveError::Unsatisfiable(_)
            | ResolveError::Untranslatable { .. }
            | ResolveError::RequiresPython { .. },
        ) => 1,
        _ => 2,
    }
}

fn run(cli: &PaxCli) -> Result<()> {
    match &cli.command {
        PaxCommand::Resolve(args) => run_resolve(cli, args),
        PaxCommand::Download(args) => run_download(cli, args),
        PaxCommand::Lock(LockCommand::Create(args)) => run_lock_create(cli, args),
        PaxCommand::Cache(command) => run_cache(cli, command),
    }
}

/// anyhow errors do not convert into eyre reports on their own; stringify
/// them unless they carry a typed resolve failure worth preserving.
fn to_report(err: anyhow::Error) -> color_eyre::Report {
    match err.downcast::<ResolveError>() {
        Ok(resolve_err) => color_eyre::Report::new(resolve_err),
        Err(other) => eyre!("{other:?}"),
    }
}

fn build_request(args: &ResolveArgs) -> Result<(Pip, ResolveRequest)> {
    let targets: Vec<Target> = if args.platform.is_empty() {
        let interpreter = match &args.python {
            Some(python) => Interpreter::discover(python).map_err(to_report)?,
            None => Interpreter::discover_default().map_err(to_report)?,
        };
        vec![Target::Local(interpreter)]
    } else {
        args.platform
            .iter()
            .map(|tag| {
                Target::Abbreviated(AbbreviatedPlatform {
                    platform_tag: tag.clone(),
                    python_version: None,
                })
            })
            .collect()
    };

    let pip_python = match targets.first() {
        Some(Target::Local(interpreter)) => interpreter.python.clone(),
        _ => match &args.python {
            Some(python) => python.clone(),
            None => Interpreter::discover_default().map_err(to_report)?.python,
        },
    };

    let settings = ResolverSettings {
        max_jobs: args.max_jobs,
        index_url: args.index_url.clone(),
        ..ResolverSettings::default()
    };
    Ok((
        Pip::new(pip_python),
        ResolveRequest {
            targets,
            requirements: args.requirements.clone(),
            constraint_files: args.constraint.clone(),
            settings,
        },
    ))
}

fn run_resolve(cli: &PaxCli, args: &ResolveArgs) -> Result<()> {
    let root = PaxRoot::resolve().map_err(to_report)?;
    let (pip, request) = build_request(args)?;
    let resolved = pax_resolver::resolve(&root, &pip, &request)?;

    if cli.json {
        let distributions: Vec<_> = resolved
            .distributions
            .iter()
            .map(|dist| {
                json!({
                    "target": dist.target.id(),
                    "name": dist.distribution.name.as_str(),
                    "version": dist.distribution.version.to_string(),
                    "fingerprint": dist.distribution.fingerprint.to_string(),
                    "location": dist.distribution.location,
                })
            })
            .collect();
        println!(
            "{}",
            serde_json::to_string_pretty(&json!({ "distributions": distributions }))?
        );
    } else if !cli.quiet {
        for dist in &resolved.distributions {
            println!(
                "{} {} ({}) [{}]",
                dist.distribution.name,
                dist.distribution.version,
                dist.target.id(),
                dist.distribution.fingerprint
            );
        }
    }
    Ok(())
}

fn run_download(cli: &PaxCli, args: &ResolveArgs) -> Result<()> {
    let root = PaxRoot::resolve().map_err(to_report)?;
    let (pip, request) = build_request(args)?;
    let downloaded = pax_resolver::download(&root, &pip, &request)?;

    if cli.json {
        let targets: Vec<_> = downloaded
            .iter()
            .map(|target_downloads| {
                json!({
                    "target": target_downloads.target.id(),
                    "artifacts": target_downloads
                        .artifacts
                        .iter()
                        .map(|artifact| {
                            json!({
                                "path": artifact.path,
                                "fingerprint": artifact.fingerprint.to_string(),
                            })
                        })
                        .collect::<Vec<_>>(),
                })
            })
            .collect();
        println!(
            "{}",
            serde_json::to_string_pretty(&json!({ "targets": targets }))?
        );
    } else if !cli.quiet {
        for target_downloads in &downloaded {
            for artifact in &target_downloads.artifacts {
                println!(
                    "{} ({}) [{}]",
                    artifact.path.display(),
                    target_downloads.target.id(),
                    artifact.fingerprint
                );
            }
        }
    }
    Ok(())
}

fn run_lock_create(cli: &PaxCli, args: &cli::LockCreateArgs) -> Result<()> {
    let root = PaxRoot::resolve().map_err(to_report)?;
    let (pip, request) = build_request(&args.resolve)?;
    let lockfile = pax_lock::create_lock(
        &root,
        &pip,
        &request,
        args.style.into(),
        PAX_VERSION,
        &args.output,
    )
    .map_err(to_report)?;
    if cli.json {
        println!(
            "{}",
            serde_json::to_string_pretty(&json!({
                "lock": args.output,
                "fingerprint": lockfile.fingerprint()?.to_string(),
                "resolves": lockfile.locked_resolves.len(),
            }))?
        );
    } else if !cli.quiet {
        println!("wrote {}", args.output.display());
    }
    Ok(())
}

fn run_cache(cli: &PaxCli, command: &CacheCommand) -> Result<()> {
    let root = PaxRoot::resolve().map_err(to_report)?;
    match command {
        CacheCommand::Dir => {
            println!("{}", root.path().display());
        }
        CacheCommand::Info => {
            let (entries, bytes) = cache_usage(root.path())?;
            if cli.json {
                println!(
                    "{}",
                    serde_json::to_string_pretty(&json!({
                        "root": root.path(),
                        "entries": entries,
                        "bytes": bytes,
                    }))?
                );
            } else {
                println!("{}: {entries} file(s), {bytes} byte(s)", root.path().display());
            }
        }
        CacheCommand::Purge => {
            if root.path().exists() {
                fs::remove_dir_all(root.path())
                    .map_err(|err| eyre!("failed to purge {}: {err}", root.path().display()))?;
            }
            if !cli.quiet {
                println!("purged {}", root.path().display());
            }
        }
    }
    Ok(())
}

fn cache_usage(root: &Path) -> Result<(u64, u64)> {
    if !root.exists() {
        return Ok((0, 0));
    }
    let mut entries = 0u64;
    let mut bytes = 0u64;
    let mut stack = vec![root.to_path_buf()];
    while let Some(dir) = stack.pop() {
        for entry in fs::read_dir(&dir)? {
            let entry = entry?;
            let metadata = entry.metadata()?;
            if metadata.is_dir() {
                stack.push(entry.path());
            } else if metadata.is_file() {
                entries += 1;
                bytes += metadata.len();
            }
        }
    }
    Ok((entries, bytes))
}
