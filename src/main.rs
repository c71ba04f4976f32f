use clap::{Args, Parser, Subcommand, ValueEnum};
use cmdsandbox::expect::{Expect, OutputMatch, OutputMatchStructured};
use cmdsandbox::matcher::Discrepancy;
use cmdsandbox::search::{Target, find_from_dir};
use cmdsandbox::taskfile::{TASKFILE_TEMPLATE, generate_schema};
use cmdsandbox::{CapturedOutput, CommandLine, Error, FixtureMatch, FixtureTree, RunOptions};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Clone, Copy, Default, ValueEnum)]
enum OutputFormat {
    /// Human-readable output
    #[default]
    Human,
    /// Machine-readable JSON output
    Json,
}

#[derive(Parser)]
#[command(name = "cmdsandbox")]
#[command(about = "Run commands and tasks in isolation and compare results against fixtures")]
#[command(version)]
struct Cli {
    /// Increase log verbosity (-v debug, -vv trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Compare an expected file or directory with an actual one
    Compare {
        expected: PathBuf,
        actual: PathBuf,
        #[arg(short, long, default_value = "human")]
        output: OutputFormat,
    },
    /// Run an external command and check its outcome
    Exec(ExecArgs),
    /// Run a Taskfile task in-process with isolated state
    Task {
        /// Directory to run the task in
        #[arg(short, long, default_value = ".")]
        dir: PathBuf,
        /// Environment variable (KEY=VALUE), may be repeated
        #[arg(short, long = "env", value_parser = parse_key_val)]
        env: Vec<(String, String)>,
        /// Task definition file (defaults to Taskfile.{yaml,yml,toml} in DIR)
        #[arg(short, long)]
        file: Option<PathBuf>,
        #[arg(short, long, default_value = "human")]
        output: OutputFormat,
        name: String,
        args: Vec<String>,
    },
    /// Search upward for a file
    Find {
        name: PathBuf,
        /// Directory to start from
        #[arg(long, default_value = ".")]
        from: PathBuf,
        /// Directory at which to stop (not searched)
        #[arg(long)]
        backstop: Option<PathBuf>,
    },
    /// Scaffold a new Taskfile
    Init {
        #[arg(default_value = "Taskfile.yaml")]
        path: PathBuf,
    },
    /// Output the Taskfile schema
    Schema,
}

#[derive(Args)]
struct ExecArgs {
    /// Working directory (defaults to a fresh temporary directory)
    #[arg(short, long)]
    dir: Option<PathBuf>,
    /// Environment variable (KEY=VALUE), may be repeated
    #[arg(short, long = "env", value_parser = parse_key_val)]
    env: Vec<(String, String)>,
    /// Do not inherit the host environment
    #[arg(long)]
    clean_env: bool,
    /// Run the command through `sh -c`
    #[arg(long)]
    shell: bool,
    /// Report a non-zero exit instead of failing
    #[arg(long)]
    allow_error: bool,
    /// Data written to the command's standard input
    #[arg(long)]
    stdin: Option<String>,
    /// Timeout in seconds
    #[arg(long)]
    timeout: Option<u64>,
    #[arg(long)]
    expect_exit: Option<i32>,
    #[arg(long)]
    expect_signal: Option<i32>,
    #[arg(long)]
    expect_stdout: Option<String>,
    #[arg(long)]
    expect_stdout_contains: Option<String>,
    #[arg(long)]
    expect_stdout_regex: Option<String>,
    #[arg(long)]
    expect_stderr: Option<String>,
    #[arg(long)]
    expect_stderr_contains: Option<String>,
    #[arg(short, long, default_value = "human")]
    output: OutputFormat,
    #[arg(last = true, required = true)]
    command: Vec<String>,
}

impl ExecArgs {
    fn expect(&self) -> Expect {
        let stdout = output_match(
            &self.expect_stdout,
            &self.expect_stdout_contains,
            &self.expect_stdout_regex,
        );
        let stderr = output_match(&self.expect_stderr, &self.expect_stderr_contains, &None);
        Expect {
            exit: self.expect_exit,
            signal: self.expect_signal,
            stdout,
            stderr,
        }
    }
}

fn output_match(
    equals: &Option<String>,
    contains: &Option<String>,
    regex: &Option<String>,
) -> Option<OutputMatch> {
    if equals.is_none() && contains.is_none() && regex.is_none() {
        return None;
    }
    Some(OutputMatch::Structured(OutputMatchStructured {
        equals: equals.clone(),
        contains: contains.clone(),
        regex: regex.clone(),
    }))
}

fn parse_key_val(s: &str) -> Result<(String, String), String> {
    match s.split_once('=') {
        Some((k, v)) if !k.is_empty() => Ok((k.to_string(), v.to_string())),
        _ => Err(format!("invalid KEY=VALUE: no `=` found in `{s}`")),
    }
}

fn init_tracing(verbose: u8) {
    let level = match verbose {
        0 => "warn",
        1 => "debug",
        _ => "trace",
    };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(format!("cmdsandbox={level}")));
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .finish();

    let _ = tracing::subscriber::set_global_default(subscriber);
}

fn main() {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    match run(cli.command) {
        Ok(true) => {}
        Ok(false) => std::process::exit(1),
        Err(e) => {
            eprintln!("Error: {e}");
            std::process::exit(1);
        }
    }
}

/// Run a subcommand; `Ok(false)` means a check failed.
fn run(command: Command) -> Result<bool, Error> {
    match command {
        Command::Compare {
            expected,
            actual,
            output,
        } => {
            for path in [&expected, &actual] {
                if !path.exists() {
                    return Err(Error::FixtureNotFound { path: path.clone() });
                }
            }
            let result = FixtureMatch::new(FixtureTree::at(&expected), FixtureTree::at(&actual));
            match output {
                OutputFormat::Human => {
                    if result.matches() {
                        println!("✓ {} matches {}", expected.display(), actual.display());
                    } else {
                        print!("{}", result.failure_message());
                    }
                }
                OutputFormat::Json => print_json(&serde_json::json!({
                    "expected": expected.display().to_string(),
                    "actual": actual.display().to_string(),
                    "matches": result.matches(),
                    "discrepancies": result
                        .discrepancies()
                        .iter()
                        .map(discrepancy_json)
                        .collect::<Vec<_>>(),
                })),
            }
            Ok(result.matches())
        }
        Command::Exec(args) => exec(args),
        Command::Task {
            dir,
            env,
            file,
            output,
            name,
            args,
        } => {
            let env: BTreeMap<String, String> = env.into_iter().collect();
            let dir = fs::canonicalize(&dir)?;
            let file = file.map(|f| absolute(&f)).transpose()?;
            match cmdsandbox::run_task(&dir, &env, file.as_deref(), &name, &args) {
                Ok(captured) => {
                    report_output(output, &captured, &[]);
                    Ok(true)
                }
                Err(e) => {
                    let Some(captured) = e.output() else {
                        return Err(e);
                    };
                    let failure = e.to_string();
                    let headline = failure.lines().next().unwrap_or_default().to_string();
                    report_output(output, captured, &[headline]);
                    Ok(false)
                }
            }
        }
        Command::Find {
            name,
            from,
            backstop,
        } => {
            let backstop = backstop.map(|b| absolute(&b)).transpose()?;
            match find_from_dir(&from, Target::name(&name), backstop.as_deref()) {
                Some(found) => {
                    println!("{}", found.display());
                    Ok(true)
                }
                None => {
                    eprintln!("{} not found", name.display());
                    Ok(false)
                }
            }
        }
        Command::Init { path } => {
            if path.exists() {
                eprintln!("Error: file already exists: {}", path.display());
                return Ok(false);
            }
            if let Some(parent) = path.parent()
                && !parent.as_os_str().is_empty()
            {
                fs::create_dir_all(parent)?;
            }
            fs::write(&path, TASKFILE_TEMPLATE)?;
            println!("Created: {}", path.display());
            Ok(true)
        }
        Command::Schema => {
            let schema = generate_schema();
            print_json(&serde_json::to_value(&schema).unwrap_or_default());
            Ok(true)
        }
    }
}

fn exec(args: ExecArgs) -> Result<bool, Error> {
    let scratch;
    let dir = match &args.dir {
        Some(dir) => dir.clone(),
        None => {
            scratch = tempfile::Builder::new().prefix("cmdsandbox").tempdir()?;
            scratch.path().to_path_buf()
        }
    };

    let expect = args.expect();
    let mut options = RunOptions::default()
        .cwd(dir)
        .envs(args.env.iter().cloned())
        .inherit_env(!args.clean_env)
        .allow_error();
    if let Some(stdin) = &args.stdin {
        options = options.stdin(stdin.as_bytes());
    }
    if let Some(secs) = args.timeout {
        options = options.timeout(Duration::from_secs(secs));
    }

    let command = if args.shell {
        CommandLine::Shell(args.command.join(" "))
    } else {
        CommandLine::Argv(args.command.clone())
    };
    let captured = cmdsandbox::command::run(command, &options)?;

    let mut failures = expect.check(&captured);
    if args.allow_error && expect.exit.is_none() && expect.signal.is_none() {
        failures.retain(|f| !f.starts_with("exit code:"));
    }
    report_output(args.output, &captured, &failures);
    Ok(failures.is_empty())
}

fn report_output(format: OutputFormat, captured: &CapturedOutput, failures: &[String]) {
    match format {
        OutputFormat::Human => {
            print!("{}", captured.stdout_str());
            eprint!("{}", captured.stderr_str());
            for failure in failures {
                eprintln!("✗ {failure}");
            }
        }
        OutputFormat::Json => print_json(&serde_json::json!({
            "passed": failures.is_empty(),
            "output": captured,
            "failures": failures,
        })),
    }
}

fn discrepancy_json(discrepancy: &Discrepancy) -> serde_json::Value {
    let path = discrepancy.path().display().to_string();
    match discrepancy {
        Discrepancy::Missing(_) => serde_json::json!({ "path": path, "kind": "missing" }),
        Discrepancy::Unexpected(_) => serde_json::json!({ "path": path, "kind": "unexpected" }),
        Discrepancy::ShouldBeDirectory(_) => {
            serde_json::json!({ "path": path, "kind": "should_be_directory" })
        }
        Discrepancy::ShouldNotBeDirectory(_) => {
            serde_json::json!({ "path": path, "kind": "should_not_be_directory" })
        }
        Discrepancy::ContentMismatch { diff, .. } => {
            serde_json::json!({ "path": path, "kind": "content_mismatch", "diff": diff })
        }
        Discrepancy::Unreadable { error, .. } => {
            serde_json::json!({ "path": path, "kind": "unreadable", "error": error })
        }
    }
}

fn print_json(value: &serde_json::Value) {
    match serde_json::to_string_pretty(value) {
        Ok(json) => println!("{json}"),
        Err(e) => eprintln!("Error: failed to serialize output: {e}"),
    }
}

fn absolute(path: &Path) -> std::io::Result<PathBuf> {
    if path.is_absolute() {
        Ok(path.to_path_buf())
    } else {
        Ok(std::env::current_dir()?.join(path))
    }
}
