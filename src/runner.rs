//! Scheduler and executor.
//!
//! A single orchestrator owns every piece of scheduling state: the ready
//! queue, the per-target state machine, the worker count and the graph's
//! `clean` flags. Workers are tokio tasks running one target's commands in
//! order; they report back exclusively through an unbounded channel, so the
//! orchestrator never shares the graph.
//!
//! The algorithm works as follows:
//! 1. A readiness scan seeded at the root queues every dirty target whose
//!    children are all done (clean targets count as done).
//! 2. Workers are started for the highest priority targets until `jobs`
//!    workers are alive or the queue runs dry.
//! 3. The orchestrator waits for the next event or an external interrupt.
//! 4. When a target finishes, only its parents are re-examined and any that
//!    became ready are queued, then the pool is topped up again.
//! 5. The first failure is kept and cancels everything still running; the
//!    loop then drains the remaining workers before returning it.

use std::io::Write;
use std::process::Stdio;
use std::time::{Duration, Instant};

use camino::Utf8PathBuf;
use indicatif::ProgressStyle;
use petgraph::graph::NodeIndex;
use tokio::sync::mpsc;
use tracing::{Instrument, Level};
use tracing_indicatif::span_ext::IndicatifSpanExt;

use crate::build::Options;
use crate::cancel::Cancel;
use crate::diagnostics::{Diagnostics, TaskExecution};
use crate::error::{BuildError, RunError};
use crate::graph::TargetGraph;
use crate::queue::ReadyQueue;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    /// Dirty, waiting on at least one child.
    Pending,
    Queued,
    Running,
    Done,
    Failed,
}

/// Everything a worker needs, detached from the graph.
#[derive(Debug)]
struct Job {
    index: NodeIndex,
    name: String,
    dir: Utf8PathBuf,
    shell: String,
    commands: Vec<String>,
}

#[derive(Debug)]
enum Event {
    /// A command is about to be launched.
    Command { text: String },
    /// A command exited, whatever its status.
    Output { stdout: Vec<u8>, stderr: Vec<u8> },
    Finished {
        index: NodeIndex,
        result: Result<(), RunError>,
        commands: usize,
        start: Instant,
        duration: Duration,
    },
}

struct Scheduler<'a> {
    graph: &'a mut TargetGraph,
    options: &'a mut Options,
    states: Vec<State>,
    queue: ReadyQueue,
    workers: usize,
    cancel: Cancel,
    events: mpsc::UnboundedSender<Event>,
    error: Option<BuildError>,
    span: tracing::Span,
    report: Diagnostics,
}

/// Runs every dirty target reachable from the root of `graph`.
///
/// Targets that finish are marked clean in the graph. On success the whole
/// graph is clean when this returns. `interrupt` stops the run from outside
/// and turns into [`BuildError::Interrupted`] once in-flight work drained.
pub(crate) async fn run(
    graph: &mut TargetGraph,
    options: &mut Options,
    interrupt: &Cancel,
) -> Result<Diagnostics, BuildError> {
    let states = graph
        .graph
        .node_indices()
        .map(|index| {
            if graph[index].clean {
                State::Done
            } else {
                State::Pending
            }
        })
        .collect::<Vec<_>>();

    let dirty = states.iter().filter(|&&s| s == State::Pending).count();
    let span = tracing::span!(Level::INFO, "running_targets");
    // The root never runs.
    span.pb_set_length(dirty.saturating_sub(1) as u64);
    span.pb_set_style(&progress_style(
        "{spinner:.green} [{elapsed}] [{bar:40.cyan/blue}] {pos}/{len} {msg}",
    ));
    span.pb_set_message("Running targets...");

    let (tx, rx) = mpsc::unbounded_channel();
    let mut scheduler = Scheduler {
        graph,
        options,
        states,
        queue: ReadyQueue::new(),
        workers: 0,
        cancel: Cancel::new(),
        events: tx,
        error: None,
        span: span.clone(),
        report: Diagnostics::default(),
    };

    scheduler.drive(rx, interrupt).instrument(span).await;

    if let Some(err) = scheduler.error {
        return Err(err);
    }

    assert!(
        scheduler.queue.is_empty()
            && scheduler
                .graph
                .graph
                .node_indices()
                .all(|index| scheduler.graph[index].clean),
        "build finished without error but some targets are still dirty"
    );

    Ok(scheduler.report)
}

impl Scheduler<'_> {
    async fn drive(&mut self, mut events: mpsc::UnboundedReceiver<Event>, interrupt: &Cancel) {
        let root = self.graph.root();
        self.seed(root);

        loop {
            self.start_max();
            if self.workers == 0 {
                break;
            }

            tokio::select! {
                event = events.recv() => match event {
                    Some(event) => {
                        if let Err(err) = self.handle(event) {
                            self.fail(err.into());
                        }
                    }
                    // We hold a sender ourselves.
                    None => break,
                },
                () = interrupt.cancelled(), if self.error.is_none() => {
                    tracing::info!("interrupted, waiting for {} workers", self.workers);
                    self.fail(BuildError::Interrupted);
                }
            }
        }
    }

    fn state(&self, index: NodeIndex) -> State {
        self.states[index.index()]
    }

    fn set_state(&mut self, index: NodeIndex, state: State) {
        self.states[index.index()] = state;
    }

    fn is_ready(&self, index: NodeIndex) -> bool {
        self.graph
            .children(index)
            .all(|child| self.state(child) == State::Done)
    }

    /// Initial readiness scan. A dirty target with all children done is
    /// queued, otherwise the scan descends into its unfinished children.
    fn seed(&mut self, root: NodeIndex) {
        let mut seen = vec![false; self.states.len()];
        let mut stack = vec![root];

        while let Some(index) = stack.pop() {
            if std::mem::replace(&mut seen[index.index()], true) {
                continue;
            }
            if self.state(index) != State::Pending {
                continue;
            }

            if self.is_ready(index) {
                self.enqueue(index);
            } else {
                stack.extend(
                    self.graph
                        .children(index)
                        .filter(|&child| self.state(child) == State::Pending),
                );
            }
        }

        tracing::debug!("{} targets ready to start", self.queue.len());
    }

    fn enqueue(&mut self, index: NodeIndex) {
        if self.graph[index].is_root() {
            self.complete(index);
            return;
        }

        tracing::debug!("queued {}", self.graph[index]);
        self.set_state(index, State::Queued);
        let priority = self.graph[index].priority;
        self.queue.insert(index, priority);
    }

    /// Marks a target done and queues parents that became ready.
    fn complete(&mut self, index: NodeIndex) {
        self.set_state(index, State::Done);
        self.graph[index].clean = true;

        let parents: Vec<_> = self.graph.parents(index).collect();
        for parent in parents {
            if self.state(parent) == State::Pending && self.is_ready(parent) {
                self.enqueue(parent);
            }
        }
    }

    /// Keeps the first error and cancels everything in flight.
    fn fail(&mut self, err: BuildError) {
        if self.error.is_none() {
            self.error = Some(err);
        } else {
            tracing::debug!("discarding error after the first: {err}");
        }
        self.cancel.cancel();
    }

    fn start_max(&mut self) {
        while self.error.is_none() && self.workers < self.options.jobs.max(1) {
            let Some(index) = self.queue.pop() else {
                break;
            };
            self.start(index);
        }
    }

    fn start(&mut self, index: NodeIndex) {
        let node = &self.graph[index];
        let job = Job {
            index,
            name: node.name().to_owned(),
            dir: node.dir.clone(),
            shell: self.options.shell.clone(),
            commands: node.commands.iter().map(|c| c.text.clone()).collect(),
        };

        let span = tracing::span!(parent: &self.span, Level::INFO, "target", name = %node);
        span.pb_set_message(&format!("Running {}", node.name()));

        self.set_state(index, State::Running);
        self.workers += 1;
        self.report.peak_workers = self.report.peak_workers.max(self.workers);

        let events = self.events.clone();
        let cancel = self.cancel.clone();
        tokio::spawn(run_target(job, events, cancel).instrument(span));
    }

    fn handle(&mut self, event: Event) -> std::io::Result<()> {
        match event {
            Event::Command { text } => {
                if self.options.log_commands {
                    writeln!(self.options.stdout, "$ {text}")?;
                }
            }
            Event::Output { stdout, stderr } => {
                if self.options.log_output {
                    self.options.stdout.write_all(&stdout)?;
                    self.options.stderr.write_all(&stderr)?;
                }
            }
            Event::Finished {
                index,
                result,
                commands,
                start,
                duration,
            } => {
                self.workers -= 1;
                self.span.pb_inc(1);
                self.report.commands_run += commands;

                match result {
                    Ok(()) => {
                        tracing::debug!("finished {} in {duration:.2?}", self.graph[index]);
                        self.report
                            .execution_times
                            .insert(index, TaskExecution { start, duration });
                        self.complete(index);
                    }
                    Err(err) => {
                        tracing::debug!("failed {}: {err}", self.graph[index]);
                        self.set_state(index, State::Failed);
                        self.fail(err.into());
                    }
                }
            }
        }

        Ok(())
    }
}

/// Worker body: runs the commands of one target in order, stopping at the
/// first one that fails.
async fn run_target(job: Job, events: mpsc::UnboundedSender<Event>, cancel: Cancel) {
    let start = Instant::now();
    let mut commands = 0;
    let mut result = Ok(());

    for command in &job.commands {
        result = run_command(&job, command, &events, &cancel).await;
        if result.is_err() {
            break;
        }
        commands += 1;
    }

    let _ = events.send(Event::Finished {
        index: job.index,
        result,
        commands,
        start,
        duration: start.elapsed(),
    });
}

async fn run_command(
    job: &Job,
    command: &str,
    events: &mpsc::UnboundedSender<Event>,
    cancel: &Cancel,
) -> Result<(), RunError> {
    let _ = events.send(Event::Command {
        text: command.to_owned(),
    });

    let cancelled = || RunError::Cancelled {
        target: job.name.clone(),
        command: command.to_owned(),
    };
    if cancel.is_cancelled() {
        return Err(cancelled());
    }

    let mut process = tokio::process::Command::new(&job.shell);
    process
        .arg("-c")
        .arg(command)
        .current_dir(&job.dir)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    // Own group, so cancelling reaches whatever the shell started.
    #[cfg(unix)]
    process.process_group(0);

    let child = process.spawn().map_err(|source| RunError::Spawn {
        target: job.name.clone(),
        command: command.to_owned(),
        source,
    })?;
    let pid = child.id();

    let output = tokio::select! {
        biased;
        () = cancel.cancelled() => {
            kill_group(pid);
            return Err(cancelled());
        }
        output = child.wait_with_output() => output.map_err(|source| RunError::Spawn {
            target: job.name.clone(),
            command: command.to_owned(),
            source,
        })?,
    };

    let failed = (!output.status.success()).then(|| RunError::Failed {
        target: job.name.clone(),
        command: command.to_owned(),
        code: output.status.code(),
        stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
    });

    let _ = events.send(Event::Output {
        stdout: output.stdout,
        stderr: output.stderr,
    });

    match failed {
        Some(err) => Err(err),
        None => Ok(()),
    }
}

/// Kills the process group led by `pid`.
#[cfg(unix)]
fn kill_group(pid: Option<u32>) {
    use nix::sys::signal::{Signal, killpg};
    use nix::unistd::Pid;

    let Some(pid) = pid.and_then(|pid| i32::try_from(pid).ok()) else {
        return;
    };
    if let Err(err) = killpg(Pid::from_raw(pid), Signal::SIGKILL) {
        tracing::debug!("couldn't kill process group {pid}: {err}");
    }
}

/// Without process groups only the shell itself is killed, on drop.
#[cfg(not(unix))]
fn kill_group(_pid: Option<u32>) {}

fn progress_style(template: &str) -> ProgressStyle {
    ProgressStyle::default_bar()
        .template(template)
        .map(|style| style.progress_chars("=>-"))
        .unwrap_or_else(|_| ProgressStyle::default_bar())
}
