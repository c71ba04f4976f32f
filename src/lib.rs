//! Sandboxed test harness for command-line tools and in-process task runners.
//!
//! Each test case gets its own [`Sandbox`] directory. A case runs an external
//! command ([`command::run`]) or an in-process task ([`task::run_task`]) in
//! that directory, then checks the result against expected fixture data with
//! [`FixtureMatch`].
//!
//! ```no_run
//! use std::path::Path;
//!
//! let sandbox = cmdsandbox::sandbox!()?;
//! sandbox.fixture_file("input.txt", None)?;
//! sandbox.command("sort input.txt > sorted.txt")?;
//! sandbox.assert_fixture("sorted.txt", Some(Path::new("sorted.txt")))?;
//! # Ok::<(), cmdsandbox::Error>(())
//! ```

pub mod capture;
pub mod command;
pub mod config;
pub mod env;
pub mod error;
pub mod expect;
pub mod fixture;
pub mod matcher;
pub mod patch;
pub mod sandbox;
pub mod search;
pub mod task;
pub mod taskfile;

pub use capture::{CapturedOutput, capture};
pub use command::{CommandLine, RunOptions};
pub use config::{HarnessConfig, Launcher};
pub use error::{Error, Result};
pub use fixture::FixtureTree;
pub use matcher::FixtureMatch;
pub use patch::with_patched;
pub use sandbox::Sandbox;
pub use search::{Target, find_file};
pub use task::{TaskRunner, run_task};
