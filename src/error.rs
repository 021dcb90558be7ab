//! Error types for manifest loading, job execution, and fan-out aggregation.
//!
//! Manifest and job errors are concrete `thiserror` enums so callers can
//! match on the kind. Sibling failures inside a concurrent fan-out are
//! collected into an [`ErrorStack`] in completion order; the stack is
//! flattened as it travels upward so every underlying error identity
//! survives to the top level.

use std::fmt;
use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// Errors surfaced while loading or resolving a manifest. All are fatal
/// before any traversal starts.
#[derive(Debug, Error)]
pub enum ManifestError {
    #[error("failure reading manifest {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failure parsing manifest {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml_bw::Error,
    },
    #[error("failure expanding import pattern {pattern}: {source}")]
    Pattern {
        pattern: String,
        #[source]
        source: glob::PatternError,
    },
    #[error("duplicate target {name} found in {path}")]
    Duplicate { name: String, path: PathBuf },
    #[error("target {name}: workspaces and group at the same level")]
    MixedNode { name: String },
    #[error("group member {name} does not exist")]
    UnknownTarget { name: String },
    #[error("cyclic group reference: {}", .chain.join(" -> "))]
    Cycle { chain: Vec<String> },
}

/// A single job's failure. `Interrupted` is reserved for scheduler-initiated
/// cancellation; an organic non-zero exit is always `Run`.
#[derive(Debug, Error)]
pub enum JobError {
    #[error("failed-to-start: {command}: {source}")]
    Spawn {
        command: String,
        #[source]
        source: io::Error,
    },
    #[error("run: {command}: {reason}")]
    Run { command: String, reason: String },
    #[error("interrupted: {name}")]
    Interrupted { name: String },
}

impl JobError {
    pub fn is_interrupted(&self) -> bool {
        matches!(self, JobError::Interrupted { .. })
    }
}

/// Sibling errors from a concurrent fan-out, in completion order.
///
/// Child stacks are absorbed rather than nested, so iterating the top-level
/// stack visits every leaf error of the traversal exactly once.
#[derive(Debug, Default)]
pub struct ErrorStack {
    errors: Vec<JobError>,
}

impl ErrorStack {
    pub fn push(&mut self, err: JobError) {
        self.errors.push(err);
    }

    /// Flatten another stack into this one, preserving its internal order.
    pub fn absorb(&mut self, other: ErrorStack) {
        self.errors.extend(other.errors);
    }

    pub fn is_empty(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn len(&self) -> usize {
        self.errors.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &JobError> {
        self.errors.iter()
    }

    /// True when every underlying error is a cancellation, letting callers
    /// tell an interrupted run apart from an organic failure.
    pub fn interrupted_only(&self) -> bool {
        !self.errors.is_empty() && self.errors.iter().all(JobError::is_interrupted)
    }

    pub fn into_result(self) -> Result<(), ErrorStack> {
        if self.errors.is_empty() {
            Ok(())
        } else {
            Err(self)
        }
    }
}

impl From<JobError> for ErrorStack {
    fn from(err: JobError) -> Self {
        ErrorStack { errors: vec![err] }
    }
}

impl fmt::Display for ErrorStack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, err) in self.errors.iter().enumerate() {
            if i > 0 {
                write!(f, "; ")?;
            }
            write!(f, "{}", err)?;
        }
        Ok(())
    }
}

impl std::error::Error for ErrorStack {}
