use std::fmt::Debug;
use std::io::Write;
use std::sync::Arc;
use std::time::Instant;

use camino::Utf8Path;

use crate::cache::Cache;
use crate::cancel::Cancel;
use crate::diagnostics::Diagnostics;
use crate::error::BuildError;
use crate::fingerprint::Fingerprinter;
use crate::graph::TargetGraph;
use crate::{runner, stale};

/// How a [`Builder`] runs targets.
pub struct Options {
    /// Echo every command as `$ <command>` before running it.
    pub log_commands: bool,
    /// Forward the captured output of every command.
    pub log_output: bool,
    /// Maximum number of targets running at once.
    pub jobs: usize,
    /// Hash file contents instead of size and modification time.
    pub content_hash: bool,
    /// Program invoked as `<shell> -c <command>`.
    pub shell: String,
    pub stdout: Box<dyn Write + Send>,
    pub stderr: Box<dyn Write + Send>,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            log_commands: false,
            log_output: false,
            jobs: 4,
            content_hash: false,
            shell: String::from("sh"),
            stdout: Box::new(std::io::stdout()),
            stderr: Box::new(std::io::stderr()),
        }
    }
}

impl Debug for Options {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Options")
            .field("log_commands", &self.log_commands)
            .field("log_output", &self.log_output)
            .field("jobs", &self.jobs)
            .field("content_hash", &self.content_hash)
            .field("shell", &self.shell)
            .finish_non_exhaustive()
    }
}

/// Brings targets up to date.
///
/// A build goes through three phases, checking for an interrupt between
/// each of them:
/// 1. the target graph is loaded from the configuration files,
/// 2. every target is marked clean or dirty against the cache,
/// 3. dirty targets are run, dependencies first.
///
/// When the last phase stops early, targets that did not finish are made to
/// look changed to the next build.
#[derive(Debug)]
pub struct Builder {
    cache: Arc<Cache>,
    options: Options,
}

impl Builder {
    pub fn new(cache: Arc<Cache>, options: Options) -> Self {
        Self { cache, options }
    }

    pub fn options(&self) -> &Options {
        &self.options
    }

    pub async fn build(
        &mut self,
        file: &Utf8Path,
        targets: &[String],
        interrupt: &Cancel,
    ) -> Result<Diagnostics, BuildError> {
        let start = Instant::now();

        if targets.is_empty() {
            tracing::info!("no targets requested");
            return Ok(Diagnostics {
                elapsed: start.elapsed(),
                ..Diagnostics::default()
            });
        }

        let graph = {
            let file = file.to_owned();
            let targets = targets.to_vec();
            tokio::task::spawn_blocking(move || TargetGraph::build(&file, &targets)).await??
        };
        tracing::info!("loaded {} targets in {:.2?}", graph.len() - 1, start.elapsed());
        check(interrupt)?;

        let (mut graph, dirty) = {
            let cache = self.cache.clone();
            let fingerprinter = Fingerprinter::new(self.options.content_hash);
            let mut graph = graph;
            tokio::task::spawn_blocking(move || {
                stale::propagate(&mut graph, &cache, &fingerprinter).map(|dirty| (graph, dirty))
            })
            .await??
        };

        let result = match check(interrupt) {
            Ok(()) => runner::run(&mut graph, &mut self.options, interrupt).await,
            Err(err) => Err(err),
        };
        let mut report = match result {
            Ok(report) => report,
            Err(err) => {
                stale::forget_unfinished(&graph, &self.cache);
                return Err(err);
            }
        };
        report.graph = Some(graph);
        report.dirty = dirty;
        report.elapsed = start.elapsed();

        tracing::info!("{report}");
        Ok(report)
    }
}

fn check(interrupt: &Cancel) -> Result<(), BuildError> {
    if interrupt.is_cancelled() {
        return Err(BuildError::Interrupted);
    }
    Ok(())
}
