//! Upward file search, in the manner of locating `.git`.

use std::path::{Path, PathBuf};

/// What to look for in each directory.
pub enum Target<'a> {
    /// A relative path that must exist under the directory.
    Name(&'a Path),
    /// A predicate on the directory; the returned path is the match.
    Predicate(&'a dyn Fn(&Path) -> Option<PathBuf>),
}

impl<'a> Target<'a> {
    pub fn name<P: AsRef<Path> + ?Sized>(name: &'a P) -> Self {
        Target::Name(name.as_ref())
    }
}

/// Walk upward from the directory containing `start`.
///
/// The walk ends at the filesystem root or at `backstop`, which is not
/// itself tested. The first match wins.
pub fn find_file(start: &Path, target: Target<'_>, backstop: Option<&Path>) -> Option<PathBuf> {
    let start = absolute(start);
    find_from_dir(start.parent()?, target, backstop)
}

/// Like [`find_file`], but `dir` itself is the first directory tested.
pub fn find_from_dir(dir: &Path, target: Target<'_>, backstop: Option<&Path>) -> Option<PathBuf> {
    let mut dir = absolute(dir);
    loop {
        if backstop.is_some_and(|b| b == dir) {
            return None;
        }
        let found = match &target {
            Target::Name(name) => {
                let candidate = dir.join(name);
                candidate.exists().then_some(candidate)
            }
            Target::Predicate(pred) => pred(&dir),
        };
        if found.is_some() {
            return found;
        }
        match dir.parent() {
            Some(parent) if parent != dir => dir = parent.to_path_buf(),
            _ => return None,
        }
    }
}

/// First ancestor of `start` that holds `marker` (e.g. `Cargo.toml`).
pub fn find_project_root(start: &Path, marker: &str) -> Option<PathBuf> {
    find_file(start, Target::name(marker), None).and_then(|p| p.parent().map(Path::to_path_buf))
}

/// Locate `<fixture_root>/<path>` above `start`, stopping at the project root.
pub fn find_fixture(
    start: &Path,
    fixture_root: &str,
    path: Option<&Path>,
    marker: &str,
) -> Option<PathBuf> {
    let relative = match path {
        Some(p) => Path::new(fixture_root).join(p),
        None => PathBuf::from(fixture_root),
    };
    let backstop = find_project_root(start, marker);
    find_file(start, Target::Name(&relative), backstop.as_deref())
}

fn absolute(path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        std::env::current_dir()
            .map(|cwd| cwd.join(path))
            .unwrap_or_else(|_| path.to_path_buf())
    }
}
