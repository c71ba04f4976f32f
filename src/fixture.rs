//! Normalized, comparable view of a file or directory tree.

use std::cell::OnceCell;
use std::io;
use std::path::{Path, PathBuf};

/// Whether a member is a directory or anything else.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeKind {
    File,
    Directory,
}

/// A member of a tree, relative to the tree's full path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Member {
    pub path: PathBuf,
    pub kind: NodeKind,
}

/// A directory under the tree that could not be listed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Unreadable {
    /// Relative to the tree's full path; `.` for the tree itself.
    pub path: PathBuf,
    pub error: String,
}

#[derive(Debug, Default)]
struct Snapshot {
    members: Vec<Member>,
    unreadable: Vec<Unreadable>,
}

impl Snapshot {
    fn record(&mut self, base: &Path, path: &Path, error: io::Error) {
        let relative = match path.strip_prefix(base) {
            Ok(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
            _ => PathBuf::from("."),
        };
        tracing::debug!(path = %path.display(), error = %error, "unreadable fixture entry");
        self.unreadable.push(Unreadable {
            path: relative,
            error: error.to_string(),
        });
    }
}

/// A file or directory located at `root`, optionally narrowed by `selector`.
///
/// The member list is computed from the filesystem on first use and cached,
/// so every later question about the tree sees the same snapshot. Symbolic
/// links are members in their own right and are never descended into.
#[derive(Debug)]
pub struct FixtureTree {
    root: PathBuf,
    selector: Option<PathBuf>,
    is_dir: OnceCell<bool>,
    snapshot: OnceCell<Snapshot>,
}

impl FixtureTree {
    pub fn new(root: impl Into<PathBuf>, selector: Option<impl Into<PathBuf>>) -> Self {
        FixtureTree {
            root: root.into(),
            selector: selector.map(Into::into),
            is_dir: OnceCell::new(),
            snapshot: OnceCell::new(),
        }
    }

    /// A tree over `root` itself.
    pub fn at(root: impl Into<PathBuf>) -> Self {
        FixtureTree::new(root, None::<PathBuf>)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn selector(&self) -> Option<&Path> {
        self.selector.as_deref()
    }

    /// Absolute path to the target.
    pub fn full_path(&self) -> PathBuf {
        match &self.selector {
            Some(selector) => self.root.join(selector),
            None => self.root.clone(),
        }
    }

    fn is_dir(&self) -> bool {
        *self.is_dir.get_or_init(|| self.full_path().is_dir())
    }

    fn snapshot(&self) -> &Snapshot {
        self.snapshot.get_or_init(|| {
            let full = self.full_path();
            let mut snapshot = Snapshot::default();
            if self.is_dir() {
                walk(&full, &full, &mut snapshot);
                snapshot.members.sort_by(|a, b| a.path.cmp(&b.path));
                snapshot.unreadable.sort_by(|a, b| a.path.cmp(&b.path));
            } else if full.exists()
                && let Some(name) = full.file_name()
            {
                snapshot.members.push(Member {
                    path: PathBuf::from(name),
                    kind: NodeKind::File,
                });
            }
            tracing::trace!(
                path = %full.display(),
                count = snapshot.members.len(),
                "fixture tree walked"
            );
            snapshot
        })
    }

    /// Sorted members of the tree. A single file is its own only member.
    pub fn members(&self) -> &[Member] {
        &self.snapshot().members
    }

    /// Directories the walk could not list, sorted by path.
    pub fn unreadable(&self) -> &[Unreadable] {
        &self.snapshot().unreadable
    }

    /// Relative member paths.
    pub fn paths(&self) -> Vec<&Path> {
        self.members().iter().map(|m| m.path.as_path()).collect()
    }

    /// Absolute member paths.
    pub fn full_members(&self) -> Vec<PathBuf> {
        self.members().iter().map(|m| self.absolute(&m.path)).collect()
    }

    /// Kind of the member at `relative`, if present.
    pub fn kind_of(&self, relative: &Path) -> Option<NodeKind> {
        self.members()
            .binary_search_by(|m| m.path.as_path().cmp(relative))
            .ok()
            .map(|i| self.members()[i].kind)
    }

    /// Convert an absolute path under the tree to a member path.
    pub fn relative(&self, file: &Path) -> PathBuf {
        if self.is_dir() {
            let full = self.full_path();
            file.strip_prefix(&full)
                .map(Path::to_path_buf)
                .unwrap_or_else(|_| file.to_path_buf())
        } else {
            file.file_name().map(PathBuf::from).unwrap_or_default()
        }
    }

    /// Convert a member path to an absolute path.
    pub fn absolute(&self, file: &Path) -> PathBuf {
        if self.is_dir() {
            self.full_path().join(file)
        } else {
            self.full_path()
        }
    }
}

fn walk(base: &Path, dir: &Path, snapshot: &mut Snapshot) {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) => return snapshot.record(base, dir, e),
    };
    for entry in entries {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                snapshot.record(base, dir, e);
                continue;
            }
        };
        let path = entry.path();
        let Ok(relative) = path.strip_prefix(base) else {
            continue;
        };
        let file_type = match entry.file_type() {
            Ok(file_type) => file_type,
            Err(e) => {
                snapshot.record(base, &path, e);
                continue;
            }
        };
        // A link to a directory reports as a directory but is not walked.
        let kind = if file_type.is_dir() || (file_type.is_symlink() && path.is_dir()) {
            NodeKind::Directory
        } else {
            NodeKind::File
        };
        snapshot.members.push(Member {
            path: relative.to_path_buf(),
            kind,
        });
        if file_type.is_dir() {
            walk(base, &path, snapshot);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn write(root: &Path, path: &str) {
        let path = root.join(path);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, "").unwrap();
    }

    #[test]
    fn single_file() {
        let dir = tempdir().unwrap();
        write(dir.path(), "data.txt");
        let tree = FixtureTree::new(dir.path(), Some("data.txt"));
        assert_eq!(tree.full_path(), dir.path().join("data.txt"));
        assert_eq!(tree.paths(), vec![Path::new("data.txt")]);
        assert_eq!(tree.full_members(), vec![dir.path().join("data.txt")]);
    }

    #[test]
    fn missing_file_is_empty() {
        let dir = tempdir().unwrap();
        let tree = FixtureTree::new(dir.path(), Some("data.txt"));
        assert_eq!(tree.full_path(), dir.path().join("data.txt"));
        assert!(tree.members().is_empty());
        assert!(tree.full_members().is_empty());
    }

    #[test]
    fn folder_lists_sorted_members() {
        let dir = tempdir().unwrap();
        write(dir.path(), "sub/two.txt");
        write(dir.path(), "sub/one.txt");
        let tree = FixtureTree::new(dir.path(), Some("sub"));
        assert_eq!(tree.full_path(), dir.path().join("sub"));
        assert_eq!(
            tree.paths(),
            vec![Path::new("one.txt"), Path::new("two.txt")]
        );
        assert_eq!(
            tree.full_members(),
            vec![dir.path().join("sub/one.txt"), dir.path().join("sub/two.txt")]
        );
    }

    #[test]
    fn nested_directories_and_dotfiles_are_members() {
        let dir = tempdir().unwrap();
        write(dir.path(), "inner/deep.txt");
        write(dir.path(), ".hidden");
        let tree = FixtureTree::at(dir.path());
        assert_eq!(
            tree.paths(),
            vec![
                Path::new(".hidden"),
                Path::new("inner"),
                Path::new("inner/deep.txt")
            ]
        );
        assert_eq!(tree.kind_of(Path::new("inner")), Some(NodeKind::Directory));
        assert_eq!(tree.kind_of(Path::new("inner/deep.txt")), Some(NodeKind::File));
        assert_eq!(tree.kind_of(Path::new("absent")), None);
    }

    #[test]
    fn members_are_a_snapshot() {
        let dir = tempdir().unwrap();
        write(dir.path(), "a.txt");
        let tree = FixtureTree::at(dir.path());
        assert_eq!(tree.members().len(), 1);
        write(dir.path(), "b.txt");
        assert_eq!(tree.members().len(), 1);
    }

    #[test]
    fn relative_paths() {
        let dir = tempdir().unwrap();
        write(dir.path(), "data/inner.txt");
        // A file tree maps everything to its basename.
        let file_tree = FixtureTree::at(dir.path().join("data/inner.txt"));
        assert_eq!(
            file_tree.relative(&dir.path().join("data/inner.txt")),
            PathBuf::from("inner.txt")
        );
        // A folder tree strips its own path.
        let folder_tree = FixtureTree::at(dir.path());
        assert_eq!(
            folder_tree.relative(&dir.path().join("data/inner.txt")),
            PathBuf::from("data/inner.txt")
        );
    }

    #[test]
    fn absolute_paths() {
        let dir = tempdir().unwrap();
        write(dir.path(), "data/inner.txt");
        let file_tree = FixtureTree::at(dir.path().join("data/inner.txt"));
        assert_eq!(
            file_tree.absolute(Path::new("inner.txt")),
            dir.path().join("data/inner.txt")
        );
        let folder_tree = FixtureTree::at(dir.path());
        assert_eq!(
            folder_tree.absolute(Path::new("data/inner.txt")),
            dir.path().join("data/inner.txt")
        );
    }

    #[test]
    fn symlinks_are_listed_but_not_followed() {
        let dir = tempdir().unwrap();
        write(dir.path(), "x.txt");
        std::os::unix::fs::symlink(dir.path(), dir.path().join("loop")).unwrap();
        std::os::unix::fs::symlink("x.txt", dir.path().join("alias.txt")).unwrap();
        let tree = FixtureTree::at(dir.path());
        assert_eq!(
            tree.paths(),
            vec![Path::new("alias.txt"), Path::new("loop"), Path::new("x.txt")]
        );
        assert_eq!(tree.kind_of(Path::new("loop")), Some(NodeKind::Directory));
        assert_eq!(tree.kind_of(Path::new("alias.txt")), Some(NodeKind::File));
        assert!(tree.unreadable().is_empty());
    }

    #[test]
    fn unreadable_directories_are_reported() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempdir().unwrap();
        write(dir.path(), "locked/secret.txt");
        let locked = dir.path().join("locked");
        std::fs::set_permissions(&locked, std::fs::Permissions::from_mode(0o000)).unwrap();
        let listable = std::fs::read_dir(&locked).is_ok();
        let tree = FixtureTree::at(dir.path());
        let unreadable = tree.unreadable().to_vec();
        std::fs::set_permissions(&locked, std::fs::Permissions::from_mode(0o755)).unwrap();
        if listable {
            // Running as root: permissions do not apply.
            return;
        }
        assert_eq!(tree.paths(), vec![Path::new("locked")]);
        assert_eq!(unreadable.len(), 1);
        assert_eq!(unreadable[0].path, Path::new("locked"));
    }
}
