//! Path resolution and its inverse.

use std::collections::VecDeque;
use tracing::trace;

use super::directory::{DOT, DOTDOT, SEPARATOR};
use super::inode::FileType;
use super::storage::BlockIO;
use super::{FSError, FileSystem, InodeId, Result};

/// Splits `path` into the path of its parent and its last segment.
/// Trailing separators are ignored; a bare name has an empty parent path.
pub fn split_parent(path: &str) -> (&str, &str) {
    let trimmed = path.trim_end_matches(SEPARATOR);
    match trimmed.rfind(SEPARATOR) {
        Some(0) => ("/", &trimmed[1..]),
        Some(index) => (&trimmed[..index], &trimmed[index + 1..]),
        None => ("", trimmed),
    }
}

fn segments(path: &str) -> impl DoubleEndedIterator<Item = &str> {
    path.split(SEPARATOR).filter(|segment| !segment.is_empty())
}

impl<Device: BlockIO> FileSystem<Device> {
    /// Resolves `path` starting at `start`, or at the root when the path is
    /// absolute. Every segment but the last must name a directory; symbolic
    /// links on the way are followed, a link in the last segment is not.
    pub fn resolve(&self, start: InodeId, path: &str) -> Result<InodeId> {
        self.walk(start, path, false)
    }

    /// Like [`FileSystem::resolve`], but a symbolic link in the last segment
    /// is followed as well.
    pub fn resolve_follow(&self, start: InodeId, path: &str) -> Result<InodeId> {
        self.walk(start, path, true)
    }

    fn walk(&self, start: InodeId, path: &str, follow_last: bool) -> Result<InodeId> {
        let mut current = if path.starts_with(SEPARATOR) {
            self.root
        } else {
            start
        };
        // segments still to visit, each with the position in `path` it stems from
        let mut pending: VecDeque<(String, usize)> = segments(path)
            .enumerate()
            .map(|(position, segment)| (segment.to_string(), position))
            .collect();
        let mut followed = 0;
        while let Some((segment, position)) = pending.pop_front() {
            self.expect_kind(current, FileType::Directory)?;
            if segment == DOT {
                continue;
            }
            let next = match self.find_entry(current, &segment) {
                Ok(next) => next,
                Err(FSError::NotFound { .. }) => {
                    return Err(FSError::PathNotFound { segment, position })
                }
                Err(err) => return Err(err),
            };
            if self.get_inode(next)?.is_symlink() && (follow_last || !pending.is_empty()) {
                followed += 1;
                if followed > Self::MAX_SYMLINK_DEPTH {
                    return Err(FSError::SymlinkLoop {
                        path: path.to_string(),
                    });
                }
                let target = self.read_link(next)?;
                trace!("Following symlink {segment:?} -> {target:?}");
                if target.starts_with(SEPARATOR) {
                    current = self.root;
                }
                for segment in segments(&target).rev() {
                    pending.push_front((segment.to_string(), position));
                }
                continue;
            }
            current = next;
        }
        Ok(current)
    }

    /// Resolves everything but the last segment of `path` and returns the
    /// directory together with that last segment.
    pub fn resolve_parent<'p>(&self, start: InodeId, path: &'p str) -> Result<(InodeId, &'p str)> {
        let (parent, name) = split_parent(path);
        let parent = self.resolve_follow(start, parent)?;
        self.expect_kind(parent, FileType::Directory)?;
        Ok((parent, name))
    }

    /// The directory holding `id`. Directories know it through `..`,
    /// files are looked up in every live directory.
    fn parent_of(&self, id: InodeId) -> Result<InodeId> {
        if self.get_inode(id)?.is_dir() {
            return self
                .find_entry(id, DOTDOT)
                .map_err(|_| FSError::OrphanInode(id));
        }
        for dir in self.inodes.iter().filter(|inode| inode.is_dir()) {
            let entries = self.list_entries(dir.id)?;
            if entries.iter().any(|entry| entry.inode == id && !entry.is_dot()) {
                return Ok(dir.id);
            }
        }
        Err(FSError::OrphanInode(id))
    }

    fn name_in(&self, parent: InodeId, child: InodeId) -> Result<String> {
        self.list_entries(parent)?
            .into_iter()
            .find(|entry| entry.inode == child && !entry.is_dot())
            .map(|entry| entry.name)
            .ok_or(FSError::OrphanInode(child))
    }

    /// Builds the absolute path of `target` by walking up to the root.
    /// Gives up once the walk is longer than there are inodes.
    pub fn path_of(&self, target: InodeId) -> Result<String> {
        self.get_inode(target)?;
        let mut names = Vec::new();
        let mut current = target;
        while current != self.root {
            if names.len() >= self.inodes.capacity() {
                return Err(FSError::ResolutionLoop(target));
            }
            let parent = self.parent_of(current)?;
            names.push(self.name_in(parent, current)?);
            current = parent;
        }
        names.reverse();
        Ok(format!("{SEPARATOR}{}", names.join("/")))
    }
}

#[cfg(test)]
fn tree() -> (FileSystem, [InodeId; 4]) {
    let mut fs = FileSystem::format(super::Geometry {
        block_count: 64,
        inode_count: 16,
        block_size: 32,
    })
    .unwrap();
    let root = fs.root();
    let a = fs.make_directory(root, "a", 0o755, 0).unwrap();
    let b = fs.make_directory(a, "b", 0o755, 0).unwrap();
    let c = fs.make_directory(b, "c", 0o755, 0).unwrap();
    let file = fs.create_file(c, "notes.txt", 0o644, 0).unwrap();
    (fs, [a, b, c, file])
}

#[test]
fn test_split_parent() {
    assert_eq!(split_parent("/a/b/c"), ("/a/b", "c"));
    assert_eq!(split_parent("/c"), ("/", "c"));
    assert_eq!(split_parent("c"), ("", "c"));
    assert_eq!(split_parent("a/b/"), ("a", "b"));
}

#[test]
fn test_resolve_forms() {
    let (fs, [a, b, c, file]) = tree();
    let root = fs.root();
    assert_eq!(fs.resolve(root, "/a/b/c").unwrap(), c);
    assert_eq!(fs.resolve(root, "a/b/c").unwrap(), c);
    assert_eq!(fs.resolve(b, "../../b/c").unwrap(), fs.resolve(root, "/a/b/c").unwrap());
    assert_eq!(fs.resolve(b, "./c/../../b").unwrap(), b);
    assert_eq!(fs.resolve(c, "").unwrap(), c);
    assert_eq!(fs.resolve(c, "/").unwrap(), root);
    assert_eq!(fs.resolve(root, "..").unwrap(), root);
    assert_eq!(fs.resolve(root, "//a///b/").unwrap(), b);
    assert_eq!(fs.resolve(a, "b/c/notes.txt").unwrap(), file);
}

#[test]
fn test_resolve_failures() {
    let (fs, [_, _, _, file]) = tree();
    let root = fs.root();
    match fs.resolve(root, "/a/x/c") {
        Err(FSError::PathNotFound { segment, position }) => {
            assert_eq!(segment, "x");
            assert_eq!(position, 1);
        }
        other => panic!("unexpected {other:?}"),
    }
    assert!(matches!(
        fs.resolve(root, "/a/b/c/notes.txt/more"),
        Err(FSError::NotADirectory(id)) if id == file
    ));
}

#[test]
fn test_path_of() {
    let (fs, [a, _, c, file]) = tree();
    assert_eq!(fs.path_of(fs.root()).unwrap(), "/");
    assert_eq!(fs.path_of(a).unwrap(), "/a");
    assert_eq!(fs.path_of(c).unwrap(), "/a/b/c");
    assert_eq!(fs.path_of(file).unwrap(), "/a/b/c/notes.txt");
}

#[test]
fn test_path_of_detects_loops() {
    let (mut fs, [a, b, _, _]) = tree();
    // a <-> b, detached from the root
    fs.add_entry(b, "a", a).unwrap();
    fs.retarget_entry(a, DOTDOT, b).unwrap();
    assert!(matches!(fs.path_of(a), Err(FSError::ResolutionLoop(id)) if id == a));
}

#[test]
fn test_path_of_orphan() {
    let (mut fs, _) = tree();
    let stray = fs.allocate_inode(FileType::File, 0o644, 0).unwrap();
    assert!(matches!(fs.path_of(stray), Err(FSError::OrphanInode(id)) if id == stray));
}

#[test]
fn test_resolve_through_symlinks() {
    let (mut fs, [a, b, c, file]) = tree();
    let root = fs.root();
    let abs = fs.create_symlink(root, "deep", "/a/b/c", 0).unwrap();
    let rel = fs.create_symlink(a, "down", "b/c", 0).unwrap();
    let up = fs.create_symlink(c, "up", "../..", 0).unwrap();
    assert_eq!(fs.resolve(root, "/deep/notes.txt").unwrap(), file);
    assert_eq!(fs.resolve(root, "a/down/notes.txt").unwrap(), file);
    assert_eq!(fs.resolve(root, "/deep/up/b").unwrap(), b);
    // the last segment is only followed on request
    assert_eq!(fs.resolve(root, "/deep").unwrap(), abs);
    assert_eq!(fs.resolve_follow(root, "/deep").unwrap(), c);
    assert_eq!(fs.resolve(a, "down").unwrap(), rel);
    assert_eq!(fs.resolve_follow(c, "up").unwrap(), a);
    assert_eq!(fs.resolve_parent(root, "/deep/new").unwrap(), (c, "new"));
    assert_eq!(fs.resolve(c, "up").unwrap(), up);
    match fs.resolve(root, "/deep/missing") {
        Err(FSError::PathNotFound { segment, position }) => {
            assert_eq!(segment, "missing");
            assert_eq!(position, 1);
        }
        other => panic!("unexpected {other:?}"),
    }
}

#[test]
fn test_symlink_loops_are_bounded() {
    let (mut fs, [a, _, _, _]) = tree();
    let root = fs.root();
    fs.create_symlink(root, "ping", "pong", 0).unwrap();
    fs.create_symlink(root, "pong", "/ping", 0).unwrap();
    fs.create_symlink(a, "me", "me/me", 0).unwrap();
    assert!(matches!(
        fs.resolve(root, "ping/x"),
        Err(FSError::SymlinkLoop { .. })
    ));
    assert!(matches!(
        fs.resolve_follow(root, "pong"),
        Err(FSError::SymlinkLoop { .. })
    ));
    assert!(matches!(
        fs.resolve(root, "/a/me/x"),
        Err(FSError::SymlinkLoop { .. })
    ));
}
