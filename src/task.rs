//! Run an in-process task as though it were a fresh process.
//!
//! The invoker holds the global-state lock, then patches the working
//! directory, the environment and the argument vector (in that order) and
//! captures standard output and error while a freshly constructed
//! [`TaskRunner`] loads its definitions and runs one task. Every patch is
//! unwound before the result is returned.

use crate::capture::{CaptureError, CapturedOutput, capture};
use crate::error::{Error, Result};
use crate::patch::{Argv, Environment, WorkingDir, args, exclusive, with_patched};
use crate::taskfile::Application;
use std::collections::BTreeMap;
use std::ffi::OsString;
use std::path::Path;

/// Failure reported by a task runner.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TaskError {
    /// Definitions could not be found or parsed, or the runner rejected its
    /// arguments.
    #[error("{0}")]
    Load(String),
    #[error("don't know how to run task `{name}`")]
    Unknown {
        name: String,
        available: Vec<String>,
    },
    #[error("task `{name}` failed: {reason}")]
    Failed { name: String, reason: String },
}

/// An in-process task runner.
///
/// The invoker builds a new runner for every invocation, so implementations
/// may keep whatever registry they like without leaking it across runs.
pub trait TaskRunner {
    /// Configure the runner from an argument vector (program name excluded).
    fn init(&mut self, argv: &[OsString]) -> Result<(), TaskError>;

    /// Load task definitions from `path`, or from the default location in
    /// the current directory.
    fn load_definitions(&mut self, path: Option<&Path>) -> Result<(), TaskError>;

    /// Names of all loaded tasks, sorted.
    fn task_names(&self) -> Vec<String>;

    fn invoke(&mut self, name: &str, args: &[String]) -> Result<(), TaskError>;
}

/// Everything needed to run one task.
#[derive(Debug, Clone, Copy)]
pub struct Invocation<'a> {
    /// Working directory for the task, normally a sandbox.
    pub dir: &'a Path,
    /// Variables merged over the current environment.
    pub env: &'a BTreeMap<String, String>,
    /// Definition file; the runner's default lookup when `None`.
    pub task_file: Option<&'a Path>,
    pub name: &'a str,
    pub args: &'a [String],
}

/// Run `name` from the Taskfile in `dir` and return its captured output.
pub fn run_task(
    dir: &Path,
    env: &BTreeMap<String, String>,
    task_file: Option<&Path>,
    name: &str,
    args: &[String],
) -> Result<CapturedOutput> {
    let invocation = Invocation {
        dir,
        env,
        task_file,
        name,
        args,
    };
    run_task_with(Application::default, &invocation)
}

/// Run a task with a runner built by `new_runner` under full isolation.
pub fn run_task_with<R, F>(new_runner: F, invocation: &Invocation<'_>) -> Result<CapturedOutput>
where
    R: TaskRunner,
    F: FnOnce() -> R,
{
    let _lock = exclusive();
    tracing::debug!(
        task = invocation.name,
        dir = %invocation.dir.display(),
        "invoking task"
    );
    let env = Environment::merged(
        invocation
            .env
            .iter()
            .map(|(k, v)| (k.as_str(), v.as_str())),
    );

    with_patched(WorkingDir, invocation.dir.to_path_buf(), || {
        with_patched(Environment, env, || {
            with_patched(Argv, Vec::new(), || run_captured(new_runner, invocation))
        })
    })
}

fn run_captured<R, F>(new_runner: F, invocation: &Invocation<'_>) -> Result<CapturedOutput>
where
    R: TaskRunner,
    F: FnOnce() -> R,
{
    let result = capture(|| {
        let mut runner = new_runner();
        runner.init(&args())?;
        runner.load_definitions(invocation.task_file)?;
        let available = runner.task_names();
        if !available.iter().any(|n| n == invocation.name) {
            return Err(TaskError::Unknown {
                name: invocation.name.to_string(),
                available,
            });
        }
        runner.invoke(invocation.name, invocation.args)
    });

    match result {
        Ok(((), output)) => Ok(output),
        Err(CaptureError::Redirect(e)) => Err(Error::Capture(e)),
        Err(CaptureError::Body { error, mut output }) => {
            output.exit_status = 1;
            tracing::debug!(task = invocation.name, error = %error, "task failed");
            Err(match error {
                TaskError::Load(reason) => Error::TaskLoadFailed { reason, output },
                TaskError::Unknown { name, available } => Error::UnknownTask {
                    name,
                    available,
                    output,
                },
                TaskError::Failed { name, reason } => Error::TaskFailed {
                    name,
                    reason,
                    output,
                },
            })
        }
    }
}
