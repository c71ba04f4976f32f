//! Error type shared by the harness operations.

use crate::capture::CapturedOutput;
use crate::config::LoadError;
use crate::patch::PatchError;
use std::io;
use std::path::PathBuf;
use std::time::Duration;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// An external command exited non-zero and errors were not allowed.
    #[error(
        "expected `{command}` to exit with status 0, got {}\n{}",
        describe_status(.output),
        .output.render()
    )]
    CommandFailed {
        command: String,
        output: CapturedOutput,
    },

    #[error("failed to spawn `{command}`: {source}")]
    Spawn {
        command: String,
        #[source]
        source: io::Error,
    },

    /// The command was killed after running past its timeout.
    #[error("`{command}` timed out after {timeout:?}\n{}", .output.render())]
    Timeout {
        command: String,
        timeout: Duration,
        output: CapturedOutput,
    },

    /// No task definition file was found, or it could not be loaded.
    #[error("failed to load task definitions: {reason}\n{}", .output.render())]
    TaskLoadFailed {
        reason: String,
        output: CapturedOutput,
    },

    #[error("don't know how to run task `{name}` (available: {})", .available.join(", "))]
    UnknownTask {
        name: String,
        available: Vec<String>,
        output: CapturedOutput,
    },

    #[error("task `{name}` failed: {reason}\n{}", .output.render())]
    TaskFailed {
        name: String,
        reason: String,
        output: CapturedOutput,
    },

    /// A sandbox-relative path was required.
    #[error("path {} should be relative to the sandbox", .path.display())]
    InvalidPath { path: PathBuf },

    #[error("fixture {} not found", .path.display())]
    FixtureNotFound { path: PathBuf },

    #[error("{report}")]
    FixtureMismatch { report: String },

    #[error(transparent)]
    Patch(#[from] PatchError),

    #[error("failed to capture output: {0}")]
    Capture(#[source] io::Error),

    #[error(transparent)]
    Config(#[from] LoadError),

    #[error(transparent)]
    Io(#[from] io::Error),
}

impl Error {
    /// Output captured before the failure, when the failure carries any.
    pub fn output(&self) -> Option<&CapturedOutput> {
        match self {
            Error::CommandFailed { output, .. }
            | Error::TaskLoadFailed { output, .. }
            | Error::UnknownTask { output, .. }
            | Error::TaskFailed { output, .. }
            | Error::Timeout { output, .. } => Some(output),
            _ => None,
        }
    }
}

fn describe_status(output: &CapturedOutput) -> String {
    match output.signal {
        Some(signal) => format!("signal {signal}"),
        None => output.exit_status.to_string(),
    }
}
