use std::fs;
use std::io::ErrorKind;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use camino::Utf8PathBuf;
use clap::Parser;
use console::style;
use kiln::conf::CONFIG_FILE_NAME;
use kiln::{BuildError, Builder, Cache, Cancel, Options, RunError, TargetGraph};

/// Incremental build orchestrator.
#[derive(Parser, Debug)]
#[command(name = "kiln", version, about)]
struct Cli {
    /// Targets to bring up to date.
    targets: Vec<String>,

    /// Configuration file to read targets from.
    #[arg(long, short = 'f', default_value = CONFIG_FILE_NAME)]
    file: Utf8PathBuf,

    /// Echo commands; repeat to also echo their output.
    #[arg(short = 'v', action = clap::ArgAction::Count)]
    verbose: u8,

    /// Maximum number of targets running at once.
    #[arg(long, short = 'j', default_value_t = 4, value_parser = clap::value_parser!(u16).range(1..))]
    jobs: u16,

    /// Fingerprint file contents instead of size and modification time.
    #[arg(long)]
    content: bool,

    /// Delete the fingerprint cache and exit.
    #[arg(long)]
    clear_cache: bool,

    /// Use this cache file instead of the one in the user cache directory.
    #[arg(long)]
    cache_file: Option<Utf8PathBuf>,

    /// Print the target graph as a Mermaid diagram and exit.
    #[arg(long)]
    graph: bool,
}

fn main() -> ExitCode {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(err) => {
            let _ = err.print();
            // Help and version are not errors.
            return if err.use_stderr() {
                ExitCode::FAILURE
            } else {
                ExitCode::SUCCESS
            };
        }
    };

    if let Err(err) = kiln::init_logging(cli.verbose) {
        eprintln!("couldn't set up logging: {err}");
    }

    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => match err.downcast_ref::<BuildError>() {
            Some(BuildError::Interrupted) => {
                eprintln!("{}", style("interrupted").yellow());
                ExitCode::SUCCESS
            }
            Some(BuildError::Run(RunError::Failed { target, stderr, .. })) => {
                eprintln!("{}", style(format!("Target '{target}' failed")).red().bold());
                if !stderr.is_empty() {
                    eprint!("{stderr}");
                }
                eprintln!("{err}");
                ExitCode::FAILURE
            }
            _ => {
                eprintln!("{} {err:#}", style("error:").red().bold());
                ExitCode::FAILURE
            }
        },
    }
}

fn run(cli: Cli) -> Result<()> {
    let cache_path = match cli.cache_file {
        Some(path) => path,
        None => default_cache_path()?,
    };

    if cli.clear_cache {
        match fs::remove_file(&cache_path) {
            Ok(()) => eprintln!("Removed {cache_path}"),
            Err(err) if err.kind() == ErrorKind::NotFound => {}
            Err(err) => {
                return Err(err).with_context(|| format!("couldn't remove {cache_path}"));
            }
        }
        return Ok(());
    }

    if cli.graph {
        let graph = TargetGraph::build(&cli.file, &cli.targets)?;
        print!("{graph}");
        return Ok(());
    }

    let cache = Cache::open(&cache_path)
        .with_context(|| format!("couldn't open the cache at {cache_path}"))?;
    let cache = Arc::new(cache);

    let options = Options {
        log_commands: cli.verbose >= 1,
        log_output: cli.verbose >= 2,
        jobs: cli.jobs.into(),
        content_hash: cli.content,
        ..Options::default()
    };

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("couldn't start the async runtime")?;

    let interrupt = Cancel::new();
    let result = runtime.block_on(async {
        let trigger = interrupt.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                trigger.cancel();
            }
        });

        let mut builder = Builder::new(cache.clone(), options);
        builder.build(&cli.file, &cli.targets, &interrupt).await
    });

    if let Some(err) = cache.err() {
        tracing::warn!("the cache failed during this build, everything was rebuilt: {err}");
    }
    if let Ok(cache) = Arc::try_unwrap(cache) {
        cache.close()?;
    }

    let report = result?;
    if cli.verbose >= 2 && report.graph.is_some() {
        tracing::debug!("\n{}", report.render_mermaid());
    }

    Ok(())
}

fn default_cache_path() -> Result<Utf8PathBuf> {
    let dir = dirs::cache_dir().context("couldn't find the user cache directory")?;
    let path = Utf8PathBuf::try_from(dir.join("kiln").join("cache.db"))?;
    Ok(path)
}
