//! Directories are regular byte streams holding packed entry records:
//!
//! ```text
//! [inode id: u32 LE][name length: u8][name bytes]
//! ```
//!
//! Entries are appended at the end and the stream is compacted on removal.

use tracing::debug;

use super::inode::{FileType, Inode};
use super::storage::BlockIO;
use super::{FSError, FileSystem, InodeId, Result};

pub const DOT: &str = ".";
pub const DOTDOT: &str = "..";
pub const MAX_NAME_LEN: usize = 255;
pub const SEPARATOR: char = '/';

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    pub name: String,
    pub inode: InodeId,
}

impl DirEntry {
    pub fn new(name: impl Into<String>, inode: InodeId) -> Self {
        Self {
            name: name.into(),
            inode,
        }
    }

    pub fn is_dot(&self) -> bool {
        self.name == DOT || self.name == DOTDOT
    }

    pub fn encode_into(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.inode.to_le_bytes());
        out.push(self.name.len() as u8);
        out.extend_from_slice(self.name.as_bytes());
    }

    pub fn encoded_len(&self) -> usize {
        4 + 1 + self.name.len()
    }
}

pub fn encode_entries(entries: &[DirEntry]) -> Vec<u8> {
    let mut out = Vec::with_capacity(entries.iter().map(DirEntry::encoded_len).sum());
    for entry in entries {
        entry.encode_into(&mut out);
    }
    out
}

/// Returns `None` when the stream is cut short or a name is not UTF-8.
pub fn decode_entries(mut data: &[u8]) -> Option<Vec<DirEntry>> {
    let mut entries = Vec::new();
    while !data.is_empty() {
        let (id, rest) = data.split_first_chunk::<4>()?;
        let (len, rest) = rest.split_first()?;
        let len = *len as usize;
        if rest.len() < len {
            return None;
        }
        let name = std::str::from_utf8(&rest[..len]).ok()?;
        entries.push(DirEntry::new(name, u32::from_le_bytes(*id)));
        data = &rest[len..];
    }
    Some(entries)
}

/// Any name an entry may carry, including the `.` and `..` self entries.
fn validate_entry_name(name: &str) -> Result<()> {
    if name.is_empty() || name.len() > MAX_NAME_LEN || name.contains(SEPARATOR) {
        return Err(FSError::InvalidName {
            name: name.to_string(),
        });
    }
    Ok(())
}

/// A name a caller may create, rename to or remove.
pub fn validate_name(name: &str) -> Result<()> {
    validate_entry_name(name)?;
    if name == DOT || name == DOTDOT {
        return Err(FSError::InvalidName {
            name: name.to_string(),
        });
    }
    Ok(())
}

impl<Device: BlockIO> FileSystem<Device> {
    pub const DIRECTORY_PERMISSIONS: u16 = 0o755;

    pub fn list_entries(&self, dir: InodeId) -> Result<Vec<DirEntry>> {
        let size = self.expect_kind(dir, FileType::Directory)?.size;
        let data = self.read_data(dir, 0, size)?;
        decode_entries(&data).ok_or(FSError::CorruptDirectory(dir))
    }

    /// Every entry of `dir` together with a copy of the inode it names.
    pub fn list_directory(&self, dir: InodeId) -> Result<Vec<(DirEntry, Inode)>> {
        self.list_entries(dir)?
            .into_iter()
            .map(|entry| {
                let inode = self.stat(entry.inode)?;
                Ok((entry, inode))
            })
            .collect()
    }

    pub fn find_entry(&self, dir: InodeId, name: &str) -> Result<InodeId> {
        self.list_entries(dir)?
            .into_iter()
            .find(|entry| entry.name == name)
            .map(|entry| entry.inode)
            .ok_or_else(|| FSError::NotFound {
                name: name.to_string(),
            })
    }

    /// Appends `name -> target` to `dir` and counts the new link on `target`.
    pub fn add_entry(&mut self, dir: InodeId, name: &str, target: InodeId) -> Result<()> {
        validate_entry_name(name)?;
        let entries = self.list_entries(dir)?;
        if entries.iter().any(|entry| entry.name == name) {
            return Err(FSError::NameExists {
                name: name.to_string(),
            });
        }
        self.get_inode(target)?;
        let mut record = Vec::new();
        DirEntry::new(name, target).encode_into(&mut record);
        let size = self.get_inode(dir)?.size;
        self.write_data(dir, size, &record)?;
        self.link(target)?;
        Ok(())
    }

    /// Removes `name` from `dir` and drops the link it held, which may
    /// reclaim the target. Returns the target's id.
    pub fn remove_entry(&mut self, dir: InodeId, name: &str) -> Result<InodeId> {
        let mut entries = self.list_entries(dir)?;
        let index = entries
            .iter()
            .position(|entry| entry.name == name)
            .ok_or_else(|| FSError::NotFound {
                name: name.to_string(),
            })?;
        let removed = entries.remove(index);
        self.store_entries(dir, &entries)?;
        self.unlink(removed.inode)?;
        Ok(removed.inode)
    }

    /// Points an existing entry at another inode, moving the link with it.
    pub(crate) fn retarget_entry(&mut self, dir: InodeId, name: &str, target: InodeId) -> Result<()> {
        let mut entries = self.list_entries(dir)?;
        let entry = entries
            .iter_mut()
            .find(|entry| entry.name == name)
            .ok_or_else(|| FSError::NotFound {
                name: name.to_string(),
            })?;
        let previous = std::mem::replace(&mut entry.inode, target);
        if previous == target {
            return Ok(());
        }
        self.get_inode(target)?;
        self.store_entries(dir, &entries)?;
        self.link(target)?;
        self.unlink(previous)?;
        Ok(())
    }

    /// Rewrites the whole entry stream. Never grows the directory past its
    /// current size unless `entries` is longer than what is stored.
    fn store_entries(&mut self, dir: InodeId, entries: &[DirEntry]) -> Result<()> {
        let data = encode_entries(entries);
        self.write_data(dir, 0, &data)?;
        self.truncate_data(dir, data.len() as u64)
    }

    pub(crate) fn seed_directory(&mut self, dir: InodeId, parent: InodeId) -> Result<()> {
        self.add_entry(dir, DOT, dir)?;
        self.add_entry(dir, DOTDOT, parent)
    }

    pub fn make_directory(
        &mut self,
        parent: InodeId,
        name: &str,
        permissions: u16,
        owner: u32,
    ) -> Result<InodeId> {
        validate_name(name)?;
        if self.list_entries(parent)?.iter().any(|entry| entry.name == name) {
            return Err(FSError::NameExists {
                name: name.to_string(),
            });
        }
        let dir = self.allocate_inode(FileType::Directory, permissions, owner)?;
        let created = self
            .seed_directory(dir, parent)
            .and_then(|()| self.add_entry(parent, name, dir));
        if let Err(err) = created {
            // the parent only gained a link if `..` made it in
            if self.find_entry(dir, DOTDOT).is_ok() {
                self.inodes.update(parent, |inode| {
                    inode.link_count = inode.link_count.saturating_sub(1)
                })?;
            }
            self.discard_inode(dir)?;
            return Err(err);
        }
        debug!("Created directory {name:?} (inode {dir}) in {parent}");
        Ok(dir)
    }

    /// Removes the directory `name` from `parent`. Without `recursive` the
    /// directory must hold nothing but `.` and `..`.
    pub fn remove_directory(&mut self, parent: InodeId, name: &str, recursive: bool) -> Result<()> {
        validate_name(name)?;
        let dir = self.find_entry(parent, name)?;
        if dir == self.root {
            return Err(FSError::RootDirectory);
        }
        let children: Vec<DirEntry> = self
            .list_entries(dir)?
            .into_iter()
            .filter(|entry| !entry.is_dot())
            .collect();
        if !children.is_empty() && !recursive {
            return Err(FSError::DirectoryNotEmpty(dir));
        }
        for child in children {
            if self.get_inode(child.inode)?.is_dir() {
                self.remove_directory(dir, &child.name, true)?;
            } else {
                self.remove_entry(dir, &child.name)?;
            }
        }
        self.remove_entry(parent, name)?;
        self.remove_entry(dir, DOTDOT)?;
        self.remove_entry(dir, DOT)?;
        debug!("Removed directory {name:?} (inode {dir}) from {parent}");
        Ok(())
    }

    /// Whether `dir` is `ancestor` or lies below it.
    fn is_within(&self, dir: InodeId, ancestor: InodeId) -> Result<bool> {
        let mut current = dir;
        for _ in 0..=self.inodes.capacity() {
            if current == ancestor {
                return Ok(true);
            }
            if current == self.root {
                return Ok(false);
            }
            current = self.find_entry(current, DOTDOT)?;
        }
        Err(FSError::ResolutionLoop(dir))
    }

    /// Moves `parent/name` to `new_parent/new_name`.
    pub fn rename(
        &mut self,
        parent: InodeId,
        name: &str,
        new_parent: InodeId,
        new_name: &str,
    ) -> Result<()> {
        validate_name(name)?;
        validate_name(new_name)?;
        let target = self.find_entry(parent, name)?;
        if parent == new_parent && name == new_name {
            return Ok(());
        }
        self.expect_kind(new_parent, FileType::Directory)?;
        let is_dir = self.get_inode(target)?.is_dir();
        if is_dir && self.is_within(new_parent, target)? {
            return Err(FSError::InvalidMove);
        }
        self.add_entry(new_parent, new_name, target)?;
        self.remove_entry(parent, name)?;
        if is_dir && parent != new_parent {
            self.retarget_entry(target, DOTDOT, new_parent)?;
        }
        debug!("Renamed {name:?} in {parent} to {new_name:?} in {new_parent}");
        Ok(())
    }
}

#[cfg(test)]
fn test_fs() -> FileSystem {
    FileSystem::format(super::Geometry {
        block_count: 32,
        inode_count: 16,
        block_size: 32,
    })
    .unwrap()
}

#[test]
fn test_entry_codec() {
    let entries = vec![DirEntry::new(".", 0), DirEntry::new("..", 0), DirEntry::new("notes.txt", 7)];
    let data = encode_entries(&entries);
    assert_eq!(data.len(), 6 + 7 + 14);
    assert_eq!(decode_entries(&data).unwrap(), entries);
    assert!(decode_entries(&data[..data.len() - 1]).is_none());
}

#[test]
fn test_add_find_remove_entry() {
    let mut fs = test_fs();
    let root = fs.root();
    let file = fs.allocate_inode(FileType::File, 0o644, 0).unwrap();
    fs.add_entry(root, "a", file).unwrap();
    assert_eq!(fs.get_inode(file).unwrap().link_count, 1);
    assert_eq!(fs.find_entry(root, "a").unwrap(), file);
    assert!(matches!(
        fs.add_entry(root, "a", file),
        Err(FSError::NameExists { .. })
    ));
    fs.add_entry(root, "b", file).unwrap();
    assert_eq!(fs.get_inode(file).unwrap().link_count, 2);
    assert_eq!(fs.remove_entry(root, "a").unwrap(), file);
    assert_eq!(fs.get_inode(file).unwrap().link_count, 1);
    assert!(matches!(fs.find_entry(root, "a"), Err(FSError::NotFound { .. })));
    fs.remove_entry(root, "b").unwrap();
    assert!(matches!(fs.get_inode(file), Err(FSError::InodeNotFound(_))));
}

#[test]
fn test_list_entries_on_file() {
    let mut fs = test_fs();
    let file = fs.create_file(fs.root(), "f", 0o644, 0).unwrap();
    assert!(matches!(fs.list_entries(file), Err(FSError::NotADirectory(_))));
}

#[test]
fn test_directory_grows_and_compacts() {
    let mut fs = test_fs();
    let root = fs.root();
    let free = fs.superblock().free_blocks;
    for name in ["alpha", "beta", "gamma", "delta"] {
        fs.create_file(root, name, 0o644, 0).unwrap();
    }
    let grown = fs.get_inode(root).unwrap().blocks.len();
    assert!(grown > 1);
    for name in ["alpha", "beta", "gamma", "delta"] {
        fs.remove_file(root, name).unwrap();
    }
    assert_eq!(fs.get_inode(root).unwrap().blocks.len(), 1);
    assert_eq!(fs.superblock().free_blocks, free);
}

#[test]
fn test_make_and_remove_directory() {
    let mut fs = test_fs();
    let root = fs.root();
    let before = fs.superblock();
    let dir = fs.make_directory(root, "docs", 0o755, 0).unwrap();
    assert_eq!(fs.get_inode(dir).unwrap().link_count, 2);
    assert_eq!(fs.get_inode(root).unwrap().link_count, 3);
    assert_eq!(fs.find_entry(dir, DOTDOT).unwrap(), root);
    assert_eq!(fs.find_entry(dir, DOT).unwrap(), dir);
    fs.create_file(dir, "readme", 0o644, 0).unwrap();
    assert!(matches!(
        fs.remove_directory(root, "docs", false),
        Err(FSError::DirectoryNotEmpty(_))
    ));
    fs.remove_directory(root, "docs", true).unwrap();
    assert_eq!(fs.get_inode(root).unwrap().link_count, 2);
    assert_eq!(fs.superblock(), before);
}

#[test]
fn test_make_directory_rolls_back() {
    let mut fs = FileSystem::format(super::Geometry {
        block_count: 1,
        inode_count: 4,
        block_size: 16,
    })
    .unwrap();
    let root = fs.root();
    let before = fs.superblock();
    assert!(matches!(
        fs.make_directory(root, "d", 0o755, 0),
        Err(FSError::Exhausted(super::Resource::Blocks))
    ));
    assert_eq!(fs.superblock(), before);
    assert_eq!(fs.get_inode(root).unwrap().link_count, 2);
    assert!(fs.check().is_empty());
}

#[test]
fn test_rename_moves_directory() {
    let mut fs = test_fs();
    let root = fs.root();
    let a = fs.make_directory(root, "a", 0o755, 0).unwrap();
    let b = fs.make_directory(root, "b", 0o755, 0).unwrap();
    fs.rename(root, "b", a, "inner").unwrap();
    assert_eq!(fs.find_entry(a, "inner").unwrap(), b);
    assert_eq!(fs.find_entry(b, DOTDOT).unwrap(), a);
    assert_eq!(fs.get_inode(a).unwrap().link_count, 3);
    assert_eq!(fs.get_inode(root).unwrap().link_count, 3);
    assert!(matches!(fs.rename(root, "a", b, "loop"), Err(FSError::InvalidMove)));
    assert!(fs.check().is_empty());
}

#[test]
fn test_rejects_dot_names() {
    let mut fs = test_fs();
    let root = fs.root();
    assert!(matches!(
        fs.make_directory(root, "..", 0o755, 0),
        Err(FSError::InvalidName { .. })
    ));
    assert!(matches!(
        fs.remove_directory(root, ".", true),
        Err(FSError::InvalidName { .. })
    ));
    assert!(matches!(
        fs.create_file(root, "a/b", 0o644, 0),
        Err(FSError::InvalidName { .. })
    ));
}
