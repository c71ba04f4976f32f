//! Compare an expected fixture tree against the actual sandbox state.
//!
//! Both trees are walked once when the match is built. The verdict and the
//! failure report are derived from that one snapshot, so the report always
//! describes the same state the verdict was computed from.

use crate::fixture::{FixtureTree, NodeKind};
use similar::TextDiff;
use std::collections::BTreeSet;
use std::fmt::Write as _;
use std::path::{Path, PathBuf};

/// One reason the trees differ. Each path gets at most one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Discrepancy {
    /// Present in the fixture, absent from the actual tree.
    Missing(PathBuf),
    /// Present in the actual tree, absent from the fixture.
    Unexpected(PathBuf),
    ShouldBeDirectory(PathBuf),
    ShouldNotBeDirectory(PathBuf),
    /// Both are files with different bytes; `diff` is a unified diff.
    ContentMismatch { path: PathBuf, diff: String },
    /// A directory in either tree could not be listed.
    Unreadable { path: PathBuf, error: String },
}

impl Discrepancy {
    pub fn path(&self) -> &Path {
        match self {
            Discrepancy::Missing(p)
            | Discrepancy::Unexpected(p)
            | Discrepancy::ShouldBeDirectory(p)
            | Discrepancy::ShouldNotBeDirectory(p)
            | Discrepancy::ContentMismatch { path: p, .. }
            | Discrepancy::Unreadable { path: p, .. } => p,
        }
    }
}

/// The outcome of comparing a fixture with the actual tree.
#[derive(Debug)]
pub struct FixtureMatch {
    expected: FixtureTree,
    actual: FixtureTree,
    discrepancies: Vec<Discrepancy>,
}

impl FixtureMatch {
    pub fn new(expected: FixtureTree, actual: FixtureTree) -> Self {
        let discrepancies = compare(&expected, &actual);
        tracing::debug!(
            expected = %expected.full_path().display(),
            actual = %actual.full_path().display(),
            discrepancies = discrepancies.len(),
            "fixture compared"
        );
        FixtureMatch {
            expected,
            actual,
            discrepancies,
        }
    }

    pub fn matches(&self) -> bool {
        self.discrepancies.is_empty()
    }

    pub fn discrepancies(&self) -> &[Discrepancy] {
        &self.discrepancies
    }

    pub fn expected(&self) -> &FixtureTree {
        &self.expected
    }

    pub fn actual(&self) -> &FixtureTree {
        &self.actual
    }

    pub fn description(&self) -> String {
        format!("match fixture {}", self.fixture_name())
    }

    fn fixture_name(&self) -> String {
        self.expected
            .selector()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| self.expected.full_path().display().to_string())
    }

    /// Human-readable report, one entry per differing path.
    pub fn failure_message(&self) -> String {
        let mut buf = format!("expected fixture {} to match files:\n", self.fixture_name());
        for discrepancy in &self.discrepancies {
            let path = discrepancy.path().display();
            match discrepancy {
                Discrepancy::Missing(_) => {
                    let _ = writeln!(buf, "  {path} is not found");
                }
                Discrepancy::Unexpected(_) => {
                    let _ = writeln!(buf, "  {path} should not exist");
                }
                Discrepancy::ShouldBeDirectory(_) => {
                    let _ = writeln!(buf, "  {path} should be a directory");
                }
                Discrepancy::ShouldNotBeDirectory(_) => {
                    let _ = writeln!(buf, "  {path} should not be a directory");
                }
                Discrepancy::ContentMismatch { diff, .. } => {
                    let _ = writeln!(buf, "  {path} does not match fixture:");
                    for line in diff.lines() {
                        let _ = writeln!(buf, "    {line}");
                    }
                }
                Discrepancy::Unreadable { error, .. } => {
                    let _ = writeln!(buf, "  {path} is unreadable: {error}");
                }
            }
        }
        buf
    }
}

fn compare(expected: &FixtureTree, actual: &FixtureTree) -> Vec<Discrepancy> {
    let expected_paths: BTreeSet<&Path> = expected.paths().into_iter().collect();
    let actual_paths: BTreeSet<&Path> = actual.paths().into_iter().collect();

    let mut discrepancies = Vec::new();
    for path in expected_paths.union(&actual_paths) {
        let discrepancy = match (expected.kind_of(path), actual.kind_of(path)) {
            (Some(_), None) => Some(Discrepancy::Missing(path.to_path_buf())),
            (None, Some(_)) => Some(Discrepancy::Unexpected(path.to_path_buf())),
            (Some(NodeKind::Directory), Some(NodeKind::Directory)) => None,
            (Some(NodeKind::Directory), Some(NodeKind::File)) => {
                Some(Discrepancy::ShouldBeDirectory(path.to_path_buf()))
            }
            (Some(NodeKind::File), Some(NodeKind::Directory)) => {
                Some(Discrepancy::ShouldNotBeDirectory(path.to_path_buf()))
            }
            (Some(NodeKind::File), Some(NodeKind::File)) => compare_files(
                path,
                &expected.absolute(path),
                &actual.absolute(path),
            ),
            (None, None) => None,
        };
        discrepancies.extend(discrepancy);
    }

    let mut unreadable: Vec<_> = expected
        .unreadable()
        .iter()
        .chain(actual.unreadable())
        .collect();
    unreadable.sort_by(|a, b| a.path.cmp(&b.path));
    unreadable.dedup_by(|a, b| a.path == b.path);
    if !unreadable.is_empty() {
        discrepancies.retain(|d| !unreadable.iter().any(|u| u.path.as_path() == d.path()));
        discrepancies.extend(unreadable.into_iter().map(|u| Discrepancy::Unreadable {
            path: u.path.clone(),
            error: u.error.clone(),
        }));
        discrepancies.sort_by(|a, b| a.path().cmp(b.path()));
    }
    discrepancies
}

fn compare_files(path: &Path, expected: &Path, actual: &Path) -> Option<Discrepancy> {
    let expected_bytes = read(expected);
    let actual_bytes = read(actual);
    let diff = match (&expected_bytes, &actual_bytes) {
        (Ok(e), Ok(a)) if e == a => return None,
        (Ok(e), Ok(a)) => render_diff(e, a),
        (Err(e), _) | (_, Err(e)) => format!("unreadable: {e}"),
    };
    Some(Discrepancy::ContentMismatch {
        path: path.to_path_buf(),
        diff,
    })
}

fn read(path: &Path) -> std::io::Result<Vec<u8>> {
    std::fs::read(path)
}

fn render_diff(expected: &[u8], actual: &[u8]) -> String {
    match (std::str::from_utf8(expected), std::str::from_utf8(actual)) {
        (Ok(e), Ok(a)) => TextDiff::from_lines(e, a)
            .unified_diff()
            .header("fixture", "actual")
            .to_string(),
        _ => format!(
            "binary contents differ ({} bytes expected, {} bytes actual)",
            expected.len(),
            actual.len()
        ),
    }
}
