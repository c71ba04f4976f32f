//! Process-level capture of standard output and standard error.
//!
//! File descriptors 1 and 2 are pointed at unnamed temporary files for the
//! duration of a body, so writes from child processes that inherit those
//! descriptors are captured along with the process's own writes.

use nix::unistd::{close, dup, dup2};
use serde::Serialize;
use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::os::fd::{AsRawFd, RawFd};

const STDOUT_FD: RawFd = 1;
const STDERR_FD: RawFd = 2;

/// Output collected from a subject.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CapturedOutput {
    #[serde(serialize_with = "serialize_lossy")]
    pub stdout: Vec<u8>,
    #[serde(serialize_with = "serialize_lossy")]
    pub stderr: Vec<u8>,
    /// Exit status. Always 0 for an in-process capture that completed.
    pub exit_status: i32,
    /// Signal that terminated an external command (Unix only).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub signal: Option<i32>,
}

impl CapturedOutput {
    /// Standard output decoded as UTF-8 (lossily).
    pub fn stdout_str(&self) -> String {
        String::from_utf8_lossy(&self.stdout).into_owned()
    }

    /// Standard error decoded as UTF-8 (lossily).
    pub fn stderr_str(&self) -> String {
        String::from_utf8_lossy(&self.stderr).into_owned()
    }

    pub fn success(&self) -> bool {
        self.exit_status == 0 && self.signal.is_none()
    }

    /// Render both streams for diagnostics.
    pub fn render(&self) -> String {
        format!(
            "---- stdout ----\n{}\n---- stderr ----\n{}\n---- end ----",
            self.stdout_str().trim_end(),
            self.stderr_str().trim_end()
        )
    }
}

fn serialize_lossy<S>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error>
where
    S: serde::Serializer,
{
    serializer.serialize_str(&String::from_utf8_lossy(bytes))
}

/// Failure of a captured body, or of the capture itself.
#[derive(Debug, thiserror::Error)]
pub enum CaptureError<E> {
    #[error("failed to redirect standard streams: {0}")]
    Redirect(#[source] io::Error),
    /// The body failed; `output` holds everything written before the failure.
    #[error("{error}")]
    Body { error: E, output: CapturedOutput },
}

impl<E> CaptureError<E> {
    /// Output written before the failure, if the body got to run.
    pub fn output(&self) -> Option<&CapturedOutput> {
        match self {
            CaptureError::Redirect(_) => None,
            CaptureError::Body { output, .. } => Some(output),
        }
    }
}

/// Run `body` with stdout and stderr redirected into fresh buffers.
///
/// The original descriptors are back in place before this returns, whether
/// the body succeeded, failed or panicked.
pub fn capture<T, E>(
    body: impl FnOnce() -> Result<T, E>,
) -> Result<(T, CapturedOutput), CaptureError<E>> {
    let mut stdout = tempfile::tempfile().map_err(CaptureError::Redirect)?;
    let mut stderr = tempfile::tempfile().map_err(CaptureError::Redirect)?;

    let mut redirect = Redirect::install(&stdout, &stderr).map_err(CaptureError::Redirect)?;
    let result = body();
    redirect.restore().map_err(CaptureError::Redirect)?;

    let output = CapturedOutput {
        stdout: read_back(&mut stdout).map_err(CaptureError::Redirect)?,
        stderr: read_back(&mut stderr).map_err(CaptureError::Redirect)?,
        exit_status: 0,
        signal: None,
    };
    tracing::debug!(
        stdout = output.stdout.len(),
        stderr = output.stderr.len(),
        ok = result.is_ok(),
        "capture finished"
    );

    match result {
        Ok(value) => Ok((value, output)),
        Err(error) => Err(CaptureError::Body { error, output }),
    }
}

fn read_back(file: &mut File) -> io::Result<Vec<u8>> {
    file.seek(SeekFrom::Start(0))?;
    let mut buf = Vec::new();
    file.read_to_end(&mut buf)?;
    Ok(buf)
}

fn flush_std() {
    let _ = io::stdout().flush();
    let _ = io::stderr().flush();
}

/// Saved copies of fds 1 and 2 while they point elsewhere.
struct Redirect {
    saved: Option<(RawFd, RawFd)>,
}

impl Redirect {
    fn install(stdout: &File, stderr: &File) -> io::Result<Self> {
        flush_std();
        let saved_out = dup(STDOUT_FD)?;
        let saved_err = match dup(STDERR_FD) {
            Ok(fd) => fd,
            Err(e) => {
                let _ = close(saved_out);
                return Err(e.into());
            }
        };
        let redirect = Redirect {
            saved: Some((saved_out, saved_err)),
        };
        // On failure the drop of `redirect` puts back whatever was replaced.
        dup2(stdout.as_raw_fd(), STDOUT_FD)?;
        dup2(stderr.as_raw_fd(), STDERR_FD)?;
        tracing::trace!(saved_out, saved_err, "standard streams redirected");
        Ok(redirect)
    }

    fn restore(&mut self) -> io::Result<()> {
        let Some((saved_out, saved_err)) = self.saved.take() else {
            return Ok(());
        };
        flush_std();
        let out = dup2(saved_out, STDOUT_FD);
        let err = dup2(saved_err, STDERR_FD);
        let _ = close(saved_out);
        let _ = close(saved_err);
        out?;
        err?;
        Ok(())
    }
}

impl Drop for Redirect {
    fn drop(&mut self) {
        if self.saved.is_some()
            && let Err(e) = self.restore()
        {
            tracing::error!(error = %e, "failed to restore standard streams");
        }
    }
}
