#![forbid(unsafe_code)]
#![doc = include_str!("../README.md")]

mod build;
mod cache;
mod cancel;
pub mod conf;
mod diagnostics;
mod error;
mod fingerprint;
mod graph;
mod queue;
mod runner;
pub mod stale;
#[cfg(feature = "logging")]
mod utils;

pub use crate::build::{Builder, Options};
pub use crate::cache::{Cache, LOCK_TIMEOUT, VALUE_SIZE};
pub use crate::cancel::Cancel;
pub use crate::diagnostics::{Diagnostics, TaskExecution};
pub use crate::error::*;
pub use crate::fingerprint::{Fingerprint, Fingerprinter};
pub use crate::graph::{Node, NodeKind, TargetGraph};
#[cfg(feature = "logging")]
pub use crate::utils::init_logging;
