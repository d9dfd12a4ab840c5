use camino::Utf8PathBuf;
use thiserror::Error;

use crate::conf::Pos;

/// A malformed configuration file.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("{pos}: {message}")]
pub struct ParseError {
    pub message: String,
    pub pos: Pos,
}

impl ParseError {
    pub(crate) fn new(message: impl Into<String>, pos: Pos) -> Self {
        Self {
            message: message.into(),
            pos,
        }
    }
}

#[derive(Debug, Error)]
pub enum GraphError {
    #[error("Couldn't read configuration file '{path}'.\n{source}")]
    Read {
        path: Utf8PathBuf,
        source: std::io::Error,
    },

    #[error("Couldn't convert path to UTF-8.\n{0}")]
    PathFormat(#[from] camino::FromPathBufError),

    #[error("{path}:{source}")]
    Parse { path: Utf8PathBuf, source: ParseError },

    #[error("No target '{target}' in '{path}'")]
    UnknownTarget { path: Utf8PathBuf, target: String },

    #[error("Dependency cycle detected: {}", .chain.join(" -> "))]
    Cycle { chain: Vec<String> },
}

#[derive(Debug, Error)]
pub enum FingerprintError {
    #[error("Couldn't compile glob pattern '{pattern}'.\n{source}")]
    Pattern {
        pattern: String,
        source: glob::PatternError,
    },

    #[error("Couldn't run glob.\n{0}")]
    Glob(#[from] glob::GlobError),

    #[error("Couldn't convert path to UTF-8.\n{0}")]
    PathFormat(#[from] camino::FromPathBufError),

    #[error("Couldn't stat '{path}'.\n{source}")]
    Stat {
        path: Utf8PathBuf,
        source: std::io::Error,
    },
}

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("Couldn't create cache directory.\n{0}")]
    Io(#[from] std::io::Error),

    #[error("Cache store error.\n{0}")]
    Store(#[from] rusqlite::Error),
}

/// Failure of a single target while the scheduler is running.
#[derive(Debug, Error)]
pub enum RunError {
    #[error("Target '{target}': command `{command}` {}", exit_status(.code))]
    Failed {
        target: String,
        command: String,
        code: Option<i32>,
        stderr: String,
    },

    #[error("Target '{target}': couldn't launch `{command}`.\n{source}")]
    Spawn {
        target: String,
        command: String,
        source: std::io::Error,
    },

    #[error("Target '{target}': command `{command}` was cancelled")]
    Cancelled { target: String, command: String },
}

fn exit_status(code: &Option<i32>) -> String {
    match code {
        Some(code) => format!("exited with status {code}"),
        None => String::from("was terminated by a signal"),
    }
}

#[derive(Debug, Error)]
pub enum BuildError {
    #[error(transparent)]
    Graph(#[from] GraphError),

    #[error("Error while checking files:\n{0}")]
    Fingerprint(#[from] FingerprintError),

    #[error("Error while running targets:\n{0}")]
    Run(#[from] RunError),

    #[error("Couldn't resolve path.\n{0}")]
    Io(#[from] std::io::Error),

    #[error("Build phase panicked.\n{0}")]
    Join(#[from] tokio::task::JoinError),

    #[error("Build was interrupted")]
    Interrupted,
}

impl BuildError {
    /// Whether the build stopped because of an external interrupt rather than
    /// a failure.
    pub fn is_interrupted(&self) -> bool {
        matches!(self, BuildError::Interrupted)
    }
}
