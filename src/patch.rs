//! Scoped overrides of process-wide state.
//!
//! Each piece of global state is described by a [`GlobalState`]: how to read
//! its current value and how to apply a new one. A [`Patch`] applies a value
//! and puts the original back exactly once, when it is restored explicitly or
//! when it is dropped (including during unwinding). Patches nest; the inner
//! one is restored first.
//!
//! Restoration failures are never dropped silently: [`with_patched`] returns
//! them when the body succeeded, and logs them at `error` level when the body
//! already failed or the stack is unwinding.

use parking_lot::{ReentrantMutex, ReentrantMutexGuard, RwLock};
use std::collections::BTreeMap;
use std::ffi::OsString;
use std::io;
use std::path::PathBuf;
use std::sync::LazyLock;

/// Error applying or restoring a patched value.
#[derive(Debug, thiserror::Error)]
pub enum PatchError {
    #[error("failed to read current {resource}: {source}")]
    Snapshot {
        resource: &'static str,
        #[source]
        source: io::Error,
    },
    #[error("failed to apply {resource}: {source}")]
    Apply {
        resource: &'static str,
        #[source]
        source: io::Error,
    },
    #[error("failed to restore {resource}: {source}")]
    Restore {
        resource: &'static str,
        #[source]
        source: io::Error,
    },
}

/// A single piece of process-wide mutable state.
pub trait GlobalState {
    type Value;

    /// Human-readable name used in errors and logs.
    fn name(&self) -> &'static str;

    fn snapshot(&self) -> io::Result<Self::Value>;

    fn apply(&self, value: &Self::Value) -> io::Result<()>;
}

static EXCLUSIVE: LazyLock<ReentrantMutex<()>> = LazyLock::new(|| ReentrantMutex::new(()));

/// Serialize access to process-global state.
///
/// The lock is re-entrant so composite operations can nest patches freely on
/// one thread while other threads wait.
pub fn exclusive() -> ReentrantMutexGuard<'static, ()> {
    EXCLUSIVE.lock()
}

/// An applied override that restores the original value when finished.
pub struct Patch<S: GlobalState> {
    state: S,
    original: Option<S::Value>,
}

impl<S: GlobalState> Patch<S> {
    /// Snapshot the current value of `state` and apply `value`.
    pub fn apply(state: S, value: S::Value) -> Result<Self, PatchError> {
        let resource = state.name();
        let original = state
            .snapshot()
            .map_err(|source| PatchError::Snapshot { resource, source })?;
        // Build the patch first so a partially applied value is rolled back.
        let patch = Patch {
            state,
            original: Some(original),
        };
        patch
            .state
            .apply(&value)
            .map_err(|source| PatchError::Apply { resource, source })?;
        tracing::debug!(resource, "patched");
        Ok(patch)
    }

    /// Put the original value back.
    pub fn restore(mut self) -> Result<(), PatchError> {
        self.restore_inner()
    }

    fn restore_inner(&mut self) -> Result<(), PatchError> {
        let Some(original) = self.original.take() else {
            return Ok(());
        };
        let resource = self.state.name();
        self.state
            .apply(&original)
            .map_err(|source| PatchError::Restore { resource, source })?;
        tracing::debug!(resource, "restored");
        Ok(())
    }
}

impl<S: GlobalState> Drop for Patch<S> {
    fn drop(&mut self) {
        if let Err(e) = self.restore_inner() {
            tracing::error!(error = %e, "patch restoration failed");
        }
    }
}

/// Run `body` with `state` set to `value`, restoring the original afterwards.
pub fn with_patched<S, T, E>(
    state: S,
    value: S::Value,
    body: impl FnOnce() -> Result<T, E>,
) -> Result<T, E>
where
    S: GlobalState,
    E: From<PatchError>,
{
    let patch = Patch::apply(state, value)?;
    match body() {
        Ok(result) => {
            patch.restore()?;
            Ok(result)
        }
        Err(e) => {
            if let Err(restore) = patch.restore() {
                tracing::error!(error = %restore, "restoration failed after body error");
            }
            Err(e)
        }
    }
}

/// [`GlobalState`] built from a getter and a setter.
pub struct FnState<G, F> {
    name: &'static str,
    get: G,
    set: F,
}

impl<G, F> FnState<G, F> {
    pub fn new(name: &'static str, get: G, set: F) -> Self {
        FnState { name, get, set }
    }
}

impl<V, G, F> GlobalState for FnState<G, F>
where
    G: Fn() -> io::Result<V>,
    F: Fn(&V) -> io::Result<()>,
{
    type Value = V;

    fn name(&self) -> &'static str {
        self.name
    }

    fn snapshot(&self) -> io::Result<V> {
        (self.get)()
    }

    fn apply(&self, value: &V) -> io::Result<()> {
        (self.set)(value)
    }
}

/// Closure form of [`with_patched`].
pub fn with_patched_fn<V, T, E>(
    value: V,
    get: impl Fn() -> io::Result<V>,
    set: impl Fn(&V) -> io::Result<()>,
    body: impl FnOnce() -> Result<T, E>,
) -> Result<T, E>
where
    E: From<PatchError>,
{
    with_patched(FnState::new("value", get, set), value, body)
}

/// The process working directory.
pub struct WorkingDir;

impl GlobalState for WorkingDir {
    type Value = PathBuf;

    fn name(&self) -> &'static str {
        "working directory"
    }

    fn snapshot(&self) -> io::Result<PathBuf> {
        std::env::current_dir()
    }

    fn apply(&self, value: &PathBuf) -> io::Result<()> {
        std::env::set_current_dir(value)
    }
}

/// The whole process environment block.
pub struct Environment;

pub type EnvSnapshot = BTreeMap<OsString, OsString>;

impl Environment {
    /// The current environment with `overlay` applied on top.
    pub fn merged<I, K, V>(overlay: I) -> EnvSnapshot
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<OsString>,
        V: Into<OsString>,
    {
        let mut vars: EnvSnapshot = std::env::vars_os().collect();
        for (k, v) in overlay {
            vars.insert(k.into(), v.into());
        }
        vars
    }
}

impl GlobalState for Environment {
    type Value = EnvSnapshot;

    fn name(&self) -> &'static str {
        "environment"
    }

    fn snapshot(&self) -> io::Result<EnvSnapshot> {
        Ok(std::env::vars_os().collect())
    }

    fn apply(&self, value: &EnvSnapshot) -> io::Result<()> {
        for (key, val) in value {
            let name = key.as_encoded_bytes();
            if name.is_empty() || name.contains(&b'=') || name.contains(&0) {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidInput,
                    format!("invalid environment variable name {key:?}"),
                ));
            }
            if val.as_encoded_bytes().contains(&0) {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidInput,
                    format!("environment variable {key:?} contains a NUL byte"),
                ));
            }
        }
        for (key, _) in std::env::vars_os() {
            if !value.contains_key(&key) {
                // SAFETY: callers hold `exclusive()`; the environment is only
                // mutated through patches.
                unsafe { std::env::remove_var(&key) };
            }
        }
        for (key, val) in value {
            if std::env::var_os(key).as_ref() != Some(val) {
                // SAFETY: see above.
                unsafe { std::env::set_var(key, val) };
            }
        }
        Ok(())
    }
}

static ARGV: LazyLock<RwLock<Vec<OsString>>> =
    LazyLock::new(|| RwLock::new(std::env::args_os().skip(1).collect()));

/// The argument vector (without the program name) seen by task loaders.
pub fn args() -> Vec<OsString> {
    ARGV.read().clone()
}

/// The process argument vector as observed through [`args`].
pub struct Argv;

impl GlobalState for Argv {
    type Value = Vec<OsString>;

    fn name(&self) -> &'static str {
        "argument vector"
    }

    fn snapshot(&self) -> io::Result<Vec<OsString>> {
        Ok(args())
    }

    fn apply(&self, value: &Vec<OsString>) -> io::Result<()> {
        *ARGV.write() = value.clone();
        Ok(())
    }
}
