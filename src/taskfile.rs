//! The bundled task runner.
//!
//! Tasks are declared in a `Taskfile.yaml` (or `.yml` / `.toml`):
//!
//! ```yaml
//! include: [tasks/release.yaml]
//! tasks:
//!   greet:
//!     description: Say hello
//!     args: [who]
//!     steps:
//!       - echo: "hello ${who}"
//!   build:
//!     deps: [greet]
//!     steps:
//!       - run: cargo build
//!       - write_file: { path: out/done.txt, contents: "ok\n" }
//! ```

use crate::config::load_file;
use crate::env::interpolate_with;
use crate::task::{TaskError, TaskRunner};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::ffi::OsString;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::process::Command;

/// Default definition file names, searched in the current directory.
pub const TASKFILE_NAMES: [&str; 3] = ["Taskfile.yaml", "Taskfile.yml", "Taskfile.toml"];

/// Root document of a task definition file.
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct Taskfile {
    /// Other definition files, relative to this one.
    #[serde(default)]
    pub include: Vec<PathBuf>,

    /// Tasks by name.
    #[serde(default)]
    pub tasks: BTreeMap<String, TaskDef>,
}

/// A single task.
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct TaskDef {
    #[serde(default)]
    pub description: Option<String>,

    /// Names bound to positional arguments, usable as `${name}`.
    #[serde(default)]
    pub args: Vec<String>,

    /// Tasks invoked before this one.
    #[serde(default)]
    pub deps: Vec<String>,

    #[serde(default)]
    pub steps: Vec<Step>,
}

/// One action of a task.
///
/// Each step is a single-key map where the key determines the action.
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case", deny_unknown_fields)]
pub struct Step {
    /// Print a line to standard output.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub echo: Option<String>,

    /// Print a line to standard error.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub warn: Option<String>,

    /// Run a shell command; a non-zero exit fails the task.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run: Option<String>,

    /// Write a file relative to the working directory.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub write_file: Option<WriteFile>,

    /// Fail the task with a message.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fail: Option<String>,
}

/// Write a file with specific contents.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct WriteFile {
    pub path: String,
    pub contents: String,
}

enum Action<'a> {
    Echo(&'a str),
    Warn(&'a str),
    Run(&'a str),
    WriteFile(&'a WriteFile),
    Fail(&'a str),
}

impl Step {
    fn action(&self) -> Result<Action<'_>, String> {
        let actions: Vec<Action<'_>> = [
            self.echo.as_deref().map(Action::Echo),
            self.warn.as_deref().map(Action::Warn),
            self.run.as_deref().map(Action::Run),
            self.write_file.as_ref().map(Action::WriteFile),
            self.fail.as_deref().map(Action::Fail),
        ]
        .into_iter()
        .flatten()
        .collect();
        match <[Action<'_>; 1]>::try_from(actions) {
            Ok([action]) => Ok(action),
            Err(actions) => Err(format!(
                "a step must have exactly one action, found {}",
                actions.len()
            )),
        }
    }
}

/// Generate the JSON Schema for task definition files.
pub fn generate_schema() -> schemars::schema::RootSchema {
    schemars::schema_for!(Taskfile)
}

/// Starter Taskfile written by `cmdsandbox init`.
pub const TASKFILE_TEMPLATE: &str = r#"tasks:
  hello:
    description: Print a greeting
    args: [who]
    steps:
      - echo: "hello ${who}"
"#;

/// A task registry and its invocation state.
///
/// Owned, never global: build a new one for every run.
#[derive(Debug, Default)]
pub struct Application {
    taskfile: Option<PathBuf>,
    trace: bool,
    tasks: BTreeMap<String, TaskDef>,
    loaded: Vec<PathBuf>,
    invoked: HashSet<String>,
}

impl Application {
    /// Files loaded so far, in load order.
    pub fn loaded_files(&self) -> &[PathBuf] {
        &self.loaded
    }

    pub fn task(&self, name: &str) -> Option<&TaskDef> {
        self.tasks.get(name)
    }

    fn load_path(&mut self, path: &Path) -> Result<(), TaskError> {
        let canonical = path.canonicalize().unwrap_or_else(|_| path.to_path_buf());
        if self.loaded.contains(&canonical) {
            return Ok(());
        }
        self.loaded.push(canonical);

        let taskfile: Taskfile = load_file(path).map_err(|e| TaskError::Load(e.to_string()))?;
        tracing::debug!(
            path = %path.display(),
            tasks = taskfile.tasks.len(),
            includes = taskfile.include.len(),
            "loaded task definitions"
        );

        let base = path.parent().unwrap_or(Path::new(""));
        for include in &taskfile.include {
            self.load_path(&base.join(include))?;
        }
        for (name, def) in taskfile.tasks {
            if self.tasks.insert(name.clone(), def).is_some() {
                return Err(TaskError::Load(format!(
                    "task `{name}` is defined more than once (in {})",
                    path.display()
                )));
            }
        }
        Ok(())
    }

    fn invoke_task(
        &mut self,
        name: &str,
        args: &[String],
        stack: &mut Vec<String>,
    ) -> Result<(), TaskError> {
        if stack.iter().any(|n| n == name) {
            return Err(TaskError::Failed {
                name: name.to_string(),
                reason: format!("circular dependency: {} -> {name}", stack.join(" -> ")),
            });
        }
        if self.invoked.contains(name) {
            return Ok(());
        }
        let def = match self.tasks.get(name) {
            Some(def) => def.clone(),
            None => {
                let parent = stack.last().cloned().unwrap_or_default();
                return Err(TaskError::Failed {
                    name: parent,
                    reason: format!("don't know how to run dependency `{name}`"),
                });
            }
        };
        self.trace_line("Invoke", name);

        stack.push(name.to_string());
        for dep in &def.deps {
            self.invoke_task(dep, &[], stack)?;
        }
        stack.pop();

        self.invoked.insert(name.to_string());
        self.execute(name, &def, args)
    }

    fn execute(&self, name: &str, def: &TaskDef, args: &[String]) -> Result<(), TaskError> {
        let failed = |reason: String| TaskError::Failed {
            name: name.to_string(),
            reason,
        };
        if args.len() > def.args.len() {
            return Err(failed(format!(
                "expected at most {} argument(s), got {}",
                def.args.len(),
                args.len()
            )));
        }
        let vars: HashMap<String, String> = def.args.iter().cloned().zip(args.iter().cloned()).collect();
        let expand = |s: &str| interpolate_with(s, &vars).map_err(|e| failed(e.to_string()));

        self.trace_line("Execute", name);
        for step in &def.steps {
            match step.action().map_err(failed)? {
                Action::Echo(text) => {
                    let line = expand(text)?;
                    let mut out = io::stdout().lock();
                    writeln!(out, "{line}")
                        .and_then(|()| out.flush())
                        .map_err(|e| failed(e.to_string()))?;
                }
                Action::Warn(text) => {
                    let line = expand(text)?;
                    writeln!(io::stderr().lock(), "{line}").map_err(|e| failed(e.to_string()))?;
                }
                Action::Run(cmd) => {
                    let cmd = expand(cmd)?;
                    let _ = io::stdout().flush();
                    tracing::debug!(task = name, cmd = %cmd, "running step");
                    let status = Command::new("sh")
                        .arg("-c")
                        .arg(&cmd)
                        .status()
                        .map_err(|e| failed(format!("failed to spawn `{cmd}`: {e}")))?;
                    if !status.success() {
                        return Err(failed(format!("command `{cmd}` exited with {status}")));
                    }
                }
                Action::WriteFile(file) => {
                    let path = PathBuf::from(expand(&file.path)?);
                    let contents = expand(&file.contents)?;
                    if let Some(parent) = path.parent()
                        && !parent.as_os_str().is_empty()
                    {
                        std::fs::create_dir_all(parent).map_err(|e| failed(e.to_string()))?;
                    }
                    std::fs::write(&path, contents).map_err(|e| {
                        failed(format!("failed to write {}: {e}", path.display()))
                    })?;
                }
                Action::Fail(message) => return Err(failed(expand(message)?)),
            }
        }
        Ok(())
    }

    fn trace_line(&self, what: &str, name: &str) {
        if self.trace {
            let _ = writeln!(io::stderr().lock(), "** {what} {name}");
        }
    }
}

impl TaskRunner for Application {
    fn init(&mut self, argv: &[OsString]) -> Result<(), TaskError> {
        let mut iter = argv.iter();
        while let Some(arg) = iter.next() {
            let arg = arg.to_string_lossy();
            match arg.as_ref() {
                "-f" | "--taskfile" => {
                    let path = iter.next().ok_or_else(|| {
                        TaskError::Load(format!("option {arg} requires a value"))
                    })?;
                    self.taskfile = Some(PathBuf::from(path));
                }
                "-t" | "--trace" => self.trace = true,
                other => {
                    if let Some(path) = other.strip_prefix("--taskfile=") {
                        self.taskfile = Some(PathBuf::from(path));
                    } else {
                        return Err(TaskError::Load(format!("unrecognized argument `{other}`")));
                    }
                }
            }
        }
        Ok(())
    }

    fn load_definitions(&mut self, path: Option<&Path>) -> Result<(), TaskError> {
        let explicit = path.map(Path::to_path_buf).or_else(|| self.taskfile.clone());
        let path = match explicit {
            Some(path) => path,
            None => match TASKFILE_NAMES
                .iter()
                .map(PathBuf::from)
                .find(|candidate| candidate.is_file())
            {
                Some(found) => found,
                None => {
                    let searched = TASKFILE_NAMES.join(", ");
                    let _ = writeln!(
                        io::stderr().lock(),
                        "No Taskfile found (looking for: {searched})"
                    );
                    let cwd = std::env::current_dir()
                        .map(|d| d.display().to_string())
                        .unwrap_or_default();
                    return Err(TaskError::Load(format!("no Taskfile found in {cwd}")));
                }
            },
        };
        self.load_path(&path)
    }

    fn task_names(&self) -> Vec<String> {
        self.tasks.keys().cloned().collect()
    }

    fn invoke(&mut self, name: &str, args: &[String]) -> Result<(), TaskError> {
        if !self.tasks.contains_key(name) {
            return Err(TaskError::Unknown {
                name: name.to_string(),
                available: self.task_names(),
            });
        }
        self.invoke_task(name, args, &mut Vec::new())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn load(dir: &Path, yaml: &str) -> Result<Application, TaskError> {
        let path = dir.join("Taskfile.yaml");
        std::fs::write(&path, yaml).unwrap();
        let mut app = Application::default();
        app.load_definitions(Some(&path))?;
        Ok(app)
    }

    #[test]
    fn parse_taskfile() {
        let yaml = r#"
tasks:
  greet:
    description: Say hello
    args: [who]
    steps:
      - echo: "hello ${who}"
      - warn: done
  build:
    deps: [greet]
"#;
        let taskfile: Taskfile = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(taskfile.tasks.len(), 2);
        let greet = &taskfile.tasks["greet"];
        assert_eq!(greet.description.as_deref(), Some("Say hello"));
        assert_eq!(greet.args, vec!["who"]);
        assert_eq!(greet.steps[0].echo.as_deref(), Some("hello ${who}"));
        assert_eq!(taskfile.tasks["build"].deps, vec!["greet"]);
    }

    #[test]
    fn parse_toml_taskfile() {
        let toml = r#"
[tasks.greet]
args = ["who"]

[[tasks.greet.steps]]
echo = "hello ${who}"
"#;
        let taskfile: Taskfile = toml::from_str(toml).unwrap();
        assert_eq!(taskfile.tasks["greet"].steps.len(), 1);
    }

    #[test]
    fn step_needs_exactly_one_action() {
        let empty = Step::default();
        assert!(empty.action().is_err());
        let double = Step {
            echo: Some("a".into()),
            warn: Some("b".into()),
            ..Default::default()
        };
        assert_eq!(
            double.action().err().unwrap(),
            "a step must have exactly one action, found 2"
        );
        let single = Step {
            fail: Some("x".into()),
            ..Default::default()
        };
        assert!(matches!(single.action(), Ok(Action::Fail("x"))));
    }

    #[test]
    fn init_parses_options() {
        let mut app = Application::default();
        app.init(&[
            OsString::from("--trace"),
            OsString::from("-f"),
            OsString::from("other.yaml"),
        ])
        .unwrap();
        assert!(app.trace);
        assert_eq!(app.taskfile, Some(PathBuf::from("other.yaml")));
    }

    #[test]
    fn init_rejects_unknown_arguments() {
        let mut app = Application::default();
        let err = app.init(&[OsString::from("--test-threads=1")]).unwrap_err();
        assert!(matches!(err, TaskError::Load(msg) if msg.contains("--test-threads=1")));
        let err = Application::default()
            .init(&[OsString::from("-f")])
            .unwrap_err();
        assert!(matches!(err, TaskError::Load(_)));
    }

    #[test]
    fn includes_resolve_relative_to_including_file() {
        let dir = tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("tasks")).unwrap();
        std::fs::write(
            dir.path().join("tasks/extra.yaml"),
            "tasks:\n  extra:\n    steps:\n      - echo: extra\n",
        )
        .unwrap();
        let app = load(
            dir.path(),
            "include: [tasks/extra.yaml]\ntasks:\n  main:\n    deps: [extra]\n",
        )
        .unwrap();
        assert_eq!(app.task_names(), vec!["extra", "main"]);
        assert_eq!(app.loaded_files().len(), 2);
    }

    #[test]
    fn duplicate_task_is_rejected() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("more.yaml"), "tasks:\n  a: {}\n").unwrap();
        let err = load(dir.path(), "include: [more.yaml]\ntasks:\n  a: {}\n").unwrap_err();
        assert!(matches!(err, TaskError::Load(msg) if msg.contains("more than once")));
    }

    #[test]
    fn invalid_taskfile_is_a_load_error() {
        let dir = tempdir().unwrap();
        let err = load(dir.path(), "tasks: [not, a, map]\n").unwrap_err();
        assert!(matches!(err, TaskError::Load(_)));
    }

    #[test]
    fn unknown_task() {
        let dir = tempdir().unwrap();
        let mut app = load(dir.path(), "tasks:\n  a: {}\n").unwrap();
        let err = app.invoke("b", &[]).unwrap_err();
        assert_eq!(
            err,
            TaskError::Unknown {
                name: "b".into(),
                available: vec!["a".into()]
            }
        );
    }

    #[test]
    fn circular_dependencies_are_rejected() {
        let dir = tempdir().unwrap();
        let mut app = load(
            dir.path(),
            "tasks:\n  a:\n    deps: [b]\n  b:\n    deps: [a]\n",
        )
        .unwrap();
        let err = app.invoke("a", &[]).unwrap_err();
        assert!(
            matches!(&err, TaskError::Failed { reason, .. } if reason.contains("a -> b -> a")),
            "{err}"
        );
    }

    #[test]
    fn missing_dependency_fails() {
        let dir = tempdir().unwrap();
        let mut app = load(dir.path(), "tasks:\n  a:\n    deps: [ghost]\n").unwrap();
        let err = app.invoke("a", &[]).unwrap_err();
        assert!(matches!(err, TaskError::Failed { name, .. } if name == "a"));
    }

    #[test]
    fn too_many_arguments() {
        let dir = tempdir().unwrap();
        let mut app = load(dir.path(), "tasks:\n  a: {}\n").unwrap();
        let err = app.invoke("a", &["x".to_string()]).unwrap_err();
        assert!(matches!(err, TaskError::Failed { .. }));
    }

    #[test]
    fn fail_step_interpolates_arguments() {
        let dir = tempdir().unwrap();
        let mut app = load(
            dir.path(),
            "tasks:\n  a:\n    args: [what]\n    steps:\n      - fail: \"broke ${what}\"\n",
        )
        .unwrap();
        let err = app.invoke("a", &["it".to_string()]).unwrap_err();
        assert_eq!(
            err,
            TaskError::Failed {
                name: "a".into(),
                reason: "broke it".into()
            }
        );
    }

    #[test]
    fn dependencies_run_once() {
        let dir = tempdir().unwrap();
        let out = dir.path().join("log");
        let yaml = format!(
            r#"
tasks:
  shared:
    steps:
      - run: "echo shared >> {log}"
  left:
    deps: [shared]
  right:
    deps: [shared]
  top:
    deps: [left, right]
    steps:
      - run: "echo top >> {log}"
"#,
            log = out.display()
        );
        let mut app = load(dir.path(), &yaml).unwrap();
        app.invoke("top", &[]).unwrap();
        assert_eq!(std::fs::read_to_string(&out).unwrap(), "shared\ntop\n");
    }

    #[test]
    fn failing_run_step() {
        let dir = tempdir().unwrap();
        let mut app = load(dir.path(), "tasks:\n  a:\n    steps:\n      - run: \"exit 3\"\n").unwrap();
        let err = app.invoke("a", &[]).unwrap_err();
        assert!(matches!(err, TaskError::Failed { reason, .. } if reason.contains("exit 3")));
    }

    #[test]
    fn schema_names_steps() {
        let schema = serde_json::to_string(&generate_schema()).unwrap();
        assert!(schema.contains("write_file"));
        assert!(schema.contains("deps"));
    }

    #[test]
    fn template_parses() {
        let taskfile: Taskfile = serde_yaml::from_str(TASKFILE_TEMPLATE).unwrap();
        assert!(taskfile.tasks.contains_key("hello"));
    }
}
