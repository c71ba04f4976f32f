//! Run external commands with a controlled working directory and environment.

use crate::capture::CapturedOutput;
use crate::config::Launcher;
use crate::error::{Error, Result};
use nix::sys::signal::{Signal, killpg};
use nix::unistd::Pid;
use std::collections::BTreeMap;
use std::io::{self, Read, Write};
use std::os::unix::process::CommandExt;
use std::path::PathBuf;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// A command to run, either through the shell or as an argument vector.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandLine {
    /// Run with `sh -c`; globs and other shell syntax apply.
    Shell(String),
    /// Run directly, with no shell involved.
    Argv(Vec<String>),
}

impl CommandLine {
    /// Text used in errors and logs.
    pub fn display(&self) -> String {
        match self {
            CommandLine::Shell(cmd) => cmd.clone(),
            CommandLine::Argv(argv) => argv.join(" "),
        }
    }

    fn with_prefix(self, prefix: &[String]) -> CommandLine {
        if prefix.is_empty() {
            return self;
        }
        match self {
            CommandLine::Shell(cmd) => CommandLine::Shell(format!("{} {cmd}", prefix.join(" "))),
            CommandLine::Argv(argv) => {
                CommandLine::Argv(prefix.iter().cloned().chain(argv).collect())
            }
        }
    }

    fn to_command(&self) -> Result<Command> {
        match self {
            CommandLine::Shell(cmd) => {
                let mut c = Command::new("sh");
                c.arg("-c").arg(cmd);
                Ok(c)
            }
            CommandLine::Argv(argv) => {
                let (program, args) = argv.split_first().ok_or_else(|| Error::Spawn {
                    command: String::new(),
                    source: io::Error::new(io::ErrorKind::InvalidInput, "empty argument vector"),
                })?;
                let mut c = Command::new(program);
                c.args(args);
                Ok(c)
            }
        }
    }
}

impl From<&str> for CommandLine {
    fn from(cmd: &str) -> Self {
        CommandLine::Shell(cmd.to_string())
    }
}

impl From<String> for CommandLine {
    fn from(cmd: String) -> Self {
        CommandLine::Shell(cmd)
    }
}

impl From<Vec<String>> for CommandLine {
    fn from(argv: Vec<String>) -> Self {
        CommandLine::Argv(argv)
    }
}

impl<const N: usize> From<[&str; N]> for CommandLine {
    fn from(argv: [&str; N]) -> Self {
        CommandLine::Argv(argv.iter().map(|s| s.to_string()).collect())
    }
}

/// How to run a command.
#[derive(Debug, Clone)]
pub struct RunOptions {
    /// Working directory; the current one when unset.
    pub cwd: Option<PathBuf>,
    /// Variables set on top of the (possibly inherited) environment.
    pub env: BTreeMap<String, String>,
    pub inherit_env: bool,
    /// Return the output of a failing command instead of an error.
    pub allow_error: bool,
    pub stdin: Option<Vec<u8>>,
    pub timeout: Option<Duration>,
    pub launcher: Option<Launcher>,
    /// Where the launcher manifest search starts, usually the test file.
    pub source: Option<PathBuf>,
}

impl Default for RunOptions {
    fn default() -> Self {
        RunOptions {
            cwd: None,
            env: BTreeMap::new(),
            inherit_env: true,
            allow_error: false,
            stdin: None,
            timeout: None,
            launcher: None,
            source: None,
        }
    }
}

impl RunOptions {
    pub fn cwd(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cwd = Some(dir.into());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn envs<I, K, V>(mut self, vars: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        self.env
            .extend(vars.into_iter().map(|(k, v)| (k.into(), v.into())));
        self
    }

    pub fn inherit_env(mut self, inherit: bool) -> Self {
        self.inherit_env = inherit;
        self
    }

    pub fn allow_error(mut self) -> Self {
        self.allow_error = true;
        self
    }

    pub fn stdin(mut self, input: impl Into<Vec<u8>>) -> Self {
        self.stdin = Some(input.into());
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Use `launcher` when its manifest is found above `source`.
    pub fn launcher(mut self, launcher: Launcher, source: impl Into<PathBuf>) -> Self {
        self.launcher = Some(launcher);
        self.source = Some(source.into());
        self
    }
}

/// Run `command` and collect its status and output.
///
/// A non-zero exit is an [`Error::CommandFailed`] unless `allow_error` is set.
/// A command killed by signal `n` reports exit status `128 + n`.
pub fn run(command: impl Into<CommandLine>, options: &RunOptions) -> Result<CapturedOutput> {
    let mut command = command.into();
    let mut launcher_env = None;
    if let (Some(launcher), Some(source)) = (&options.launcher, &options.source)
        && let Some(manifest) = launcher.find_manifest(source)
    {
        tracing::debug!(manifest = %manifest.display(), "using launcher");
        command = command.with_prefix(&launcher.wrapper);
        launcher_env = launcher
            .env_var
            .as_ref()
            .map(|var| (var.clone(), manifest.display().to_string()));
    }
    let shown = command.display();

    let mut cmd = command.to_command()?;
    if let Some(cwd) = &options.cwd {
        cmd.current_dir(cwd);
    }
    if !options.inherit_env {
        cmd.env_clear();
    }
    if let Some((key, value)) = &launcher_env {
        cmd.env(key, value);
    }
    for (k, v) in &options.env {
        cmd.env(k, v);
    }
    cmd.stdin(if options.stdin.is_some() {
        Stdio::piped()
    } else {
        Stdio::null()
    });
    cmd.stdout(Stdio::piped());
    cmd.stderr(Stdio::piped());
    if options.timeout.is_some() {
        // Own process group, so a timeout takes shell grandchildren down too.
        cmd.process_group(0);
    }

    tracing::debug!(command = %shown, cwd = ?options.cwd, "spawning command");
    let spawn_error = |source| Error::Spawn {
        command: shown.clone(),
        source,
    };
    let mut child = cmd.spawn().map_err(spawn_error)?;

    let writer = match (&options.stdin, child.stdin.take()) {
        (Some(input), Some(mut pipe)) => {
            let input = input.clone();
            // A child that exits without reading its input closes the pipe.
            Some(thread::spawn(move || {
                let _ = pipe.write_all(&input);
            }))
        }
        _ => None,
    };
    let stdout = drain(child.stdout.take());
    let stderr = drain(child.stderr.take());

    let (status, timed_out) = match options.timeout {
        None => (child.wait().map_err(spawn_error)?, None),
        Some(timeout) => {
            let (status, expired) = wait_timeout(&mut child, timeout).map_err(spawn_error)?;
            (status, expired.then_some(timeout))
        }
    };
    if let Some(writer) = writer {
        let _ = writer.join();
    }

    // Every process holding the pipes is gone by now, so the readers finish.
    let (exit_status, signal) = decode_status(status);
    let output = CapturedOutput {
        stdout: collect(stdout)?,
        stderr: collect(stderr)?,
        exit_status,
        signal,
    };

    if let Some(timeout) = timed_out {
        tracing::debug!(command = %shown, ?timeout, "command timed out");
        return Err(Error::Timeout {
            command: shown,
            timeout,
            output,
        });
    }
    tracing::debug!(command = %shown, exit_status, "command finished");

    if output.success() || options.allow_error {
        Ok(output)
    } else {
        Err(Error::CommandFailed {
            command: shown,
            output,
        })
    }
}

/// Wait for `child`, killing its process group once `timeout` has elapsed.
///
/// Returns the final status and whether the timeout expired. A descendant
/// that moved itself to another process group survives the kill and keeps
/// the output pipes open.
fn wait_timeout(child: &mut Child, timeout: Duration) -> io::Result<(ExitStatus, bool)> {
    let start = Instant::now();
    loop {
        if let Some(status) = child.try_wait()? {
            return Ok((status, false));
        }
        if start.elapsed() > timeout {
            let group = Pid::from_raw(child.id() as i32);
            if let Err(e) = killpg(group, Signal::SIGKILL) {
                tracing::debug!(error = %e, "killpg failed, killing the child only");
                let _ = child.kill();
            }
            return Ok((child.wait()?, true));
        }
        thread::sleep(Duration::from_millis(10));
    }
}

fn drain<R: Read + Send + 'static>(pipe: Option<R>) -> Option<JoinHandle<io::Result<Vec<u8>>>> {
    pipe.map(|mut pipe| {
        thread::spawn(move || {
            let mut buf = Vec::new();
            pipe.read_to_end(&mut buf)?;
            Ok(buf)
        })
    })
}

fn collect(reader: Option<JoinHandle<io::Result<Vec<u8>>>>) -> Result<Vec<u8>> {
    match reader {
        Some(handle) => {
            let bytes = handle
                .join()
                .map_err(|_| io::Error::other("output reader panicked"))??;
            Ok(bytes)
        }
        None => Ok(Vec::new()),
    }
}

fn decode_status(status: ExitStatus) -> (i32, Option<i32>) {
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return (128 + signal, Some(signal));
        }
    }
    (status.code().unwrap_or(-1), None)
}
