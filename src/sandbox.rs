//! Per-test temporary directories and the helpers that operate on them.

use crate::capture::CapturedOutput;
use crate::command::{CommandLine, RunOptions, run};
use crate::config::{HarnessConfig, discover_config};
use crate::error::{Error, Result};
use crate::fixture::FixtureTree;
use crate::matcher::FixtureMatch;
use crate::search;
use crate::task::run_task;
use crate::taskfile::TASKFILE_NAMES;
use std::collections::BTreeMap;
use std::io;
use std::path::{Component, Path, PathBuf};
use std::time::Duration;
use tempfile::TempDir;

/// Create a [`Sandbox`] for the calling test file.
///
/// ```no_run
/// let sandbox = cmdsandbox::sandbox!().unwrap();
/// sandbox.file("input.txt", "data\n").unwrap();
/// ```
#[macro_export]
macro_rules! sandbox {
    () => {
        $crate::Sandbox::new(::std::path::Path::new(env!("CARGO_MANIFEST_DIR")).join(file!()))
    };
}

/// An exclusively owned temporary directory for one test case.
///
/// The directory and everything in it is deleted when the sandbox is dropped.
#[derive(Debug)]
pub struct Sandbox {
    dir: TempDir,
    source: PathBuf,
    config: HarnessConfig,
    env: BTreeMap<String, String>,
}

impl Sandbox {
    /// A sandbox for the test defined in `source`, configured from the
    /// nearest `cmdsandbox.{yaml,yml,toml}` above it.
    pub fn new(source: impl Into<PathBuf>) -> Result<Self> {
        let source = source.into();
        let config = discover_config(&source)?;
        Sandbox::with_config(source, config)
    }

    pub fn with_config(source: impl Into<PathBuf>, config: HarnessConfig) -> Result<Self> {
        let dir = tempfile::Builder::new().prefix("cmdsandbox").tempdir()?;
        tracing::debug!(path = %dir.path().display(), "sandbox created");
        Ok(Sandbox {
            dir,
            source: source.into(),
            config,
            env: BTreeMap::new(),
        })
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    /// The test file this sandbox belongs to.
    pub fn source(&self) -> &Path {
        &self.source
    }

    pub fn config(&self) -> &HarnessConfig {
        &self.config
    }

    /// Add variables for every later command and task. Later calls win.
    pub fn environment<I, K, V>(&mut self, vars: I) -> &mut Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        self.env
            .extend(vars.into_iter().map(|(k, v)| (k.into(), v.into())));
        self
    }

    /// Configured variables overlaid with the ones added to this sandbox.
    pub fn env(&self) -> BTreeMap<String, String> {
        let mut env = self.config.env.clone();
        env.extend(self.env.iter().map(|(k, v)| (k.clone(), v.clone())));
        env
    }

    /// Resolve a sandbox-relative path.
    pub fn resolve(&self, path: impl AsRef<Path>) -> Result<PathBuf> {
        let path = path.as_ref();
        let escapes = path.components().any(|c| {
            matches!(
                c,
                Component::RootDir | Component::Prefix(_) | Component::ParentDir
            )
        });
        if escapes || path.as_os_str().is_empty() {
            return Err(Error::InvalidPath {
                path: path.to_path_buf(),
            });
        }
        Ok(self.path().join(path))
    }

    /// Write `contents` to `path`, creating parent directories.
    pub fn file(&self, path: impl AsRef<Path>, contents: impl AsRef<[u8]>) -> Result<PathBuf> {
        let dest = self.resolve(path)?;
        if let Some(parent) = dest.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&dest, contents)?;
        Ok(dest)
    }

    /// Write the default Taskfile.
    pub fn task_file(&self, contents: impl AsRef<[u8]>) -> Result<PathBuf> {
        self.file(TASKFILE_NAMES[0], contents)
    }

    /// Locate `<fixture_root>/<path>` above the test source.
    pub fn find_fixture(&self, path: Option<&Path>) -> Option<PathBuf> {
        search::find_fixture(
            &self.source,
            &self.config.fixture_root,
            path,
            &self.config.project_marker,
        )
    }

    fn fixture(&self, path: Option<&Path>) -> Result<PathBuf> {
        self.find_fixture(path).ok_or_else(|| Error::FixtureNotFound {
            path: match path {
                Some(p) => Path::new(&self.config.fixture_root).join(p),
                None => PathBuf::from(&self.config.fixture_root),
            },
        })
    }

    /// Copy a fixture file or directory into the sandbox, at `dest` or at
    /// the same relative path. Follows `cp -r`: copying onto an existing
    /// directory puts the source inside it.
    pub fn fixture_file(&self, path: impl AsRef<Path>, dest: Option<&Path>) -> Result<PathBuf> {
        let path = path.as_ref();
        if path.is_absolute() {
            return Err(Error::InvalidPath {
                path: path.to_path_buf(),
            });
        }
        let source = self.fixture(Some(path))?;
        let mut dest = self.resolve(dest.unwrap_or(path))?;
        if dest.is_dir()
            && let Some(name) = source.file_name()
        {
            dest = dest.join(name);
        }
        if let Some(parent) = dest.parent() {
            std::fs::create_dir_all(parent)?;
        }
        copy_recursive(&source, &dest)?;
        tracing::debug!(from = %source.display(), to = %dest.display(), "fixture copied");
        Ok(dest)
    }

    /// Base options for commands in this sandbox.
    pub fn options(&self) -> RunOptions {
        let mut options = RunOptions::default()
            .cwd(self.path())
            .envs(self.env())
            .inherit_env(self.config.inherit_env);
        options.timeout = self.config.timeout.map(Duration::from_secs);
        if let Some(launcher) = &self.config.launcher {
            options = options.launcher(launcher.clone(), &self.source);
        }
        options
    }

    /// Run a command in the sandbox; a non-zero exit is an error.
    pub fn command(&self, command: impl Into<CommandLine>) -> Result<CapturedOutput> {
        run(command, &self.options())
    }

    /// Run a command with explicit options, usually built from [`Sandbox::options`].
    pub fn command_with(
        &self,
        command: impl Into<CommandLine>,
        options: RunOptions,
    ) -> Result<CapturedOutput> {
        run(command, &options)
    }

    /// Run a task from the sandbox's Taskfile in-process.
    pub fn run_task(&self, name: &str, args: &[&str]) -> Result<CapturedOutput> {
        let args: Vec<String> = args.iter().map(|a| a.to_string()).collect();
        run_task(self.path(), &self.env(), None, name, &args)
    }

    /// Compare the fixture at `fixture` with the sandbox, or with `local`
    /// inside it.
    pub fn match_fixture(
        &self,
        fixture: impl AsRef<Path>,
        local: Option<&Path>,
    ) -> Result<FixtureMatch> {
        let fixture = fixture.as_ref();
        if fixture.is_absolute() {
            return Err(Error::InvalidPath {
                path: fixture.to_path_buf(),
            });
        }
        let root = self.fixture(None)?;
        if let Some(local) = local {
            self.resolve(local)?;
        }
        Ok(FixtureMatch::new(
            FixtureTree::new(root, Some(fixture)),
            FixtureTree::new(self.path(), local),
        ))
    }

    /// Fail with the match report unless the fixture matches.
    pub fn assert_fixture(&self, fixture: impl AsRef<Path>, local: Option<&Path>) -> Result<()> {
        let result = self.match_fixture(fixture, local)?;
        if result.matches() {
            Ok(())
        } else {
            Err(Error::FixtureMismatch {
                report: result.failure_message(),
            })
        }
    }

    /// Read a file from the sandbox as text.
    pub fn read(&self, path: impl AsRef<Path>) -> Result<String> {
        Ok(std::fs::read_to_string(self.resolve(path)?)?)
    }
}

fn copy_recursive(from: &Path, to: &Path) -> io::Result<()> {
    if from.is_dir() {
        std::fs::create_dir_all(to)?;
        for entry in std::fs::read_dir(from)? {
            let entry = entry?;
            copy_recursive(&entry.path(), &to.join(entry.file_name()))?;
        }
    } else {
        std::fs::copy(from, to)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    /// A project with a fixture tree and a test source inside it.
    fn project() -> (TempDir, PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("project");
        std::fs::create_dir_all(root.join("tests/fixtures/sub")).unwrap();
        std::fs::write(root.join("Cargo.toml"), "[package]\n").unwrap();
        std::fs::write(root.join("tests/fixtures/data.txt"), "Fixture data.\n").unwrap();
        std::fs::write(root.join("tests/fixtures/sub/sub1.txt"), "Subfixture 1.\n").unwrap();
        std::fs::write(root.join("tests/fixtures/sub/sub2.txt"), "Subfixture 2.\n").unwrap();
        (dir, root.join("tests/case.rs"))
    }

    fn sandbox(source: &Path) -> Sandbox {
        Sandbox::with_config(source, HarnessConfig::default()).unwrap()
    }

    #[test]
    fn absolute_and_escaping_paths_are_rejected() {
        let (_dir, source) = project();
        let sb = sandbox(&source);
        assert!(matches!(sb.file("/data", "x"), Err(Error::InvalidPath { .. })));
        assert!(matches!(sb.file("../data", "x"), Err(Error::InvalidPath { .. })));
        assert!(matches!(sb.read("a/../../b"), Err(Error::InvalidPath { .. })));
    }

    #[test]
    fn file_creates_parents() {
        let (_dir, source) = project();
        let sb = sandbox(&source);
        sb.file("nested/dir/data.txt", "a thing\n").unwrap();
        assert_eq!(sb.read("nested/dir/data.txt").unwrap(), "a thing\n");
    }

    #[test]
    fn directory_removed_on_drop() {
        let (_dir, source) = project();
        let sb = sandbox(&source);
        let path = sb.path().to_path_buf();
        assert!(path.is_dir());
        assert!(path.file_name().unwrap().to_string_lossy().starts_with("cmdsandbox"));
        drop(sb);
        assert!(!path.exists());
    }

    #[test]
    fn fixture_file_copies_files_and_directories() {
        let (_dir, source) = project();
        let sb = sandbox(&source);
        sb.fixture_file("data.txt", None).unwrap();
        assert_eq!(sb.read("data.txt").unwrap(), "Fixture data.\n");

        sb.fixture_file("sub", Some(Path::new("copy"))).unwrap();
        assert_eq!(sb.read("copy/sub1.txt").unwrap(), "Subfixture 1.\n");

        // Onto an existing directory the source lands inside it.
        sb.fixture_file("sub", Some(Path::new("copy"))).unwrap();
        assert_eq!(sb.read("copy/sub/sub2.txt").unwrap(), "Subfixture 2.\n");
    }

    #[test]
    fn missing_fixture() {
        let (_dir, source) = project();
        let sb = sandbox(&source);
        assert!(matches!(
            sb.fixture_file("nope.txt", None),
            Err(Error::FixtureNotFound { .. })
        ));
    }

    #[test]
    fn fixture_matching() {
        let (_dir, source) = project();
        let sb = sandbox(&source);
        sb.file("sub1.txt", "Subfixture 1.\n").unwrap();
        sb.file("sub2.txt", "Subfixture 2.\n").unwrap();
        assert!(sb.match_fixture("sub", None).unwrap().matches());
        sb.assert_fixture("sub", None).unwrap();

        sb.file("sub2.txt", "changed\n").unwrap();
        let err = sb.assert_fixture("sub", None).unwrap_err();
        assert!(err.to_string().contains("sub2.txt does not match fixture:"));
    }

    #[test]
    fn fixture_matching_local_subdirectory() {
        let (_dir, source) = project();
        let sb = sandbox(&source);
        sb.fixture_file("data.txt", Some(Path::new("out/data.txt"))).unwrap();
        assert!(
            sb.match_fixture("data.txt", Some(Path::new("out/data.txt")))
                .unwrap()
                .matches()
        );
    }

    #[test]
    fn environment_accumulates() {
        let (_dir, source) = project();
        let mut config = HarnessConfig::default();
        config.env.insert("FROM_CONFIG".into(), "1".into());
        config.env.insert("OVERRIDE".into(), "config".into());
        let mut sb = Sandbox::with_config(&source, config).unwrap();
        sb.environment([("OVERRIDE", "first")]);
        sb.environment([("OVERRIDE", "second"), ("EXTRA", "x")]);
        let env = sb.env();
        assert_eq!(env["FROM_CONFIG"], "1");
        assert_eq!(env["OVERRIDE"], "second");
        assert_eq!(env["EXTRA"], "x");
    }

    #[test]
    fn commands_run_in_the_sandbox() {
        let (_dir, source) = project();
        let mut sb = sandbox(&source);
        sb.environment([("CMDSANDBOX_GREETING", "hi")]);
        sb.file("here.txt", "").unwrap();
        assert_eq!(sb.command("ls").unwrap().stdout_str(), "here.txt\n");
        assert_eq!(
            sb.command("echo $CMDSANDBOX_GREETING").unwrap().stdout_str(),
            "hi\n"
        );
        assert_eq!(
            sb.command_with("exit 4", sb.options().allow_error())
                .unwrap()
                .exit_status,
            4
        );
    }
}
