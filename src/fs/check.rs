//! Usage reporting and a consistency checker for a whole volume.

use std::collections::{BTreeMap, HashMap, HashSet};
use thiserror::Error;
use tracing::warn;

use super::directory::{DirEntry, DOT, DOTDOT};
use super::storage::BlockIO;
use super::{BlockId, FileSystem, InodeId};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Health {
    Healthy,
    Warning,
    Critical,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResourceUsage {
    pub total: usize,
    pub free: usize,
}

impl ResourceUsage {
    pub fn used(&self) -> usize {
        self.total - self.free
    }

    pub fn percent(&self) -> f64 {
        if self.total == 0 {
            return 0.0;
        }
        self.used() as f64 * 100.0 / self.total as f64
    }

    pub fn health(&self) -> Health {
        match self.percent() {
            p if p > 90.0 => Health::Critical,
            p if p > 75.0 => Health::Warning,
            _ => Health::Healthy,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Usage {
    pub block_size: usize,
    pub blocks: ResourceUsage,
    pub inodes: ResourceUsage,
}

/// One problem found by [`FileSystem::check`].
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Inconsistency {
    #[error("superblock records {recorded} free blocks, the bitmap has {actual}")]
    FreeBlockCount { recorded: usize, actual: usize },
    #[error("superblock records {recorded} free inodes, the table has {actual}")]
    FreeInodeCount { recorded: usize, actual: usize },
    #[error("inode {id} sits in slot {slot}")]
    MisplacedInode { slot: usize, id: InodeId },
    #[error("the root inode {0} is missing or not a directory")]
    BadRoot(InodeId),
    #[error("block {block} of inode {inode} is outside the volume")]
    BlockOutOfRange { inode: InodeId, block: BlockId },
    #[error("block {block} is owned by inodes {first} and {second}")]
    SharedBlock { block: BlockId, first: InodeId, second: InodeId },
    #[error("block {block} is owned by inode {inode} but marked free")]
    FreeBlockInUse { block: BlockId, inode: InodeId },
    #[error("block {0} is marked allocated but has no owner")]
    UnownedBlock(BlockId),
    #[error("inode {inode} holds {blocks} blocks for {size} bytes")]
    SizeMismatch { inode: InodeId, size: u64, blocks: usize },
    #[error("directory {0} cannot be decoded")]
    UnreadableDirectory(InodeId),
    #[error("directory {0} lacks its . or .. entry")]
    MissingDotEntries(InodeId),
    #[error("the . entry of directory {dir} points at inode {target}")]
    BadSelfEntry { dir: InodeId, target: InodeId },
    #[error("the .. entry of directory {dir} points at inode {target}, which does not hold it")]
    BadParentEntry { dir: InodeId, target: InodeId },
    #[error("directory {dir} holds more than one entry named {name:?}")]
    DuplicateEntry { dir: InodeId, name: String },
    #[error("entry {name:?} in directory {dir} points at missing inode {target}")]
    DanglingEntry { dir: InodeId, name: String, target: InodeId },
    #[error("inode {inode} records {recorded} links but {actual} entries reference it")]
    LinkCount { inode: InodeId, recorded: u32, actual: u32 },
}

impl<Device: BlockIO> FileSystem<Device> {
    pub fn usage(&self) -> Usage {
        Usage {
            block_size: self.storage.block_size(),
            blocks: ResourceUsage {
                total: self.storage.block_count(),
                free: self.storage.blocks_free(),
            },
            inodes: ResourceUsage {
                total: self.inodes.capacity(),
                free: self.inodes.inodes_free(),
            },
        }
    }

    /// Cross-checks the free sets, block ownership, sizes, directory
    /// contents and link counts. An empty result means a sound volume.
    pub fn check(&self) -> Vec<Inconsistency> {
        let mut found = Vec::new();
        let bitmap = self.storage.bitmap();

        let actual = bitmap.iter().filter(|used| !**used).count();
        if actual != self.storage.blocks_free() {
            found.push(Inconsistency::FreeBlockCount {
                recorded: self.storage.blocks_free(),
                actual,
            });
        }
        let actual = self.inodes.slots().iter().filter(|slot| slot.is_none()).count();
        if actual != self.inodes.inodes_free() {
            found.push(Inconsistency::FreeInodeCount {
                recorded: self.inodes.inodes_free(),
                actual,
            });
        }
        match self.get_inode(self.root) {
            Ok(root) if root.is_dir() => {}
            _ => found.push(Inconsistency::BadRoot(self.root)),
        }

        let mut owners: HashMap<BlockId, InodeId> = HashMap::new();
        for (slot, inode) in self.inodes.slots().iter().enumerate() {
            let Some(inode) = inode else { continue };
            if inode.id as usize != slot {
                found.push(Inconsistency::MisplacedInode { slot, id: inode.id });
            }
            let expected = inode.size.div_ceil(self.storage.block_size() as u64);
            if inode.blocks.len() as u64 != expected {
                found.push(Inconsistency::SizeMismatch {
                    inode: inode.id,
                    size: inode.size,
                    blocks: inode.blocks.len(),
                });
            }
            for &block in &inode.blocks {
                if block as usize >= bitmap.len() {
                    found.push(Inconsistency::BlockOutOfRange {
                        inode: inode.id,
                        block,
                    });
                    continue;
                }
                if let Some(first) = owners.insert(block, inode.id) {
                    found.push(Inconsistency::SharedBlock {
                        block,
                        first,
                        second: inode.id,
                    });
                }
                if !bitmap[block as usize] {
                    found.push(Inconsistency::FreeBlockInUse {
                        block,
                        inode: inode.id,
                    });
                }
            }
        }
        for (block, used) in bitmap.iter().enumerate() {
            if *used && !owners.contains_key(&(block as BlockId)) {
                found.push(Inconsistency::UnownedBlock(block as BlockId));
            }
        }
        // directory contents can only be trusted once the blocks are sound
        if !found.is_empty() {
            return found;
        }

        let mut listings: BTreeMap<InodeId, Vec<DirEntry>> = BTreeMap::new();
        for dir in self.inodes.iter().filter(|inode| inode.is_dir()) {
            match self.list_entries(dir.id) {
                Ok(entries) => {
                    listings.insert(dir.id, entries);
                }
                Err(_) => found.push(Inconsistency::UnreadableDirectory(dir.id)),
            }
        }
        let mut references: HashMap<InodeId, u32> = HashMap::new();
        for (&dir, entries) in &listings {
            let target_of = |name: &str| {
                entries
                    .iter()
                    .find(|entry| entry.name == name)
                    .map(|entry| entry.inode)
            };
            match (target_of(DOT), target_of(DOTDOT)) {
                (Some(dot), Some(dotdot)) => {
                    if dot != dir {
                        found.push(Inconsistency::BadSelfEntry { dir, target: dot });
                    }
                    let parent_ok = if dir == self.root {
                        dotdot == self.root
                    } else {
                        listings.get(&dotdot).is_some_and(|parent| {
                            parent
                                .iter()
                                .any(|entry| entry.inode == dir && !entry.is_dot())
                        })
                    };
                    if !parent_ok {
                        found.push(Inconsistency::BadParentEntry {
                            dir,
                            target: dotdot,
                        });
                    }
                }
                _ => found.push(Inconsistency::MissingDotEntries(dir)),
            }
            let mut names = HashSet::new();
            for entry in entries {
                if !names.insert(entry.name.as_str()) {
                    found.push(Inconsistency::DuplicateEntry {
                        dir,
                        name: entry.name.clone(),
                    });
                }
                if self.get_inode(entry.inode).is_err() {
                    found.push(Inconsistency::DanglingEntry {
                        dir,
                        name: entry.name.clone(),
                        target: entry.inode,
                    });
                    continue;
                }
                *references.entry(entry.inode).or_default() += 1;
            }
        }
        for inode in self.inodes.iter() {
            let actual = references.get(&inode.id).copied().unwrap_or(0);
            if actual != inode.link_count {
                found.push(Inconsistency::LinkCount {
                    inode: inode.id,
                    recorded: inode.link_count,
                    actual,
                });
            }
        }
        for problem in &found {
            warn!("Integrity check: {problem}");
        }
        found
    }
}

#[test]
fn test_usage_levels() {
    let usage = ResourceUsage { total: 100, free: 30 };
    assert_eq!(usage.used(), 70);
    assert_eq!(usage.health(), Health::Healthy);
    assert_eq!(ResourceUsage { total: 100, free: 20 }.health(), Health::Warning);
    assert_eq!(ResourceUsage { total: 100, free: 5 }.health(), Health::Critical);
}

#[test]
fn test_fresh_volume_is_consistent() {
    let mut fs = FileSystem::format(super::Geometry::default()).unwrap();
    let root = fs.root();
    let dir = fs.make_directory(root, "d", 0o755, 0).unwrap();
    let file = fs.create_file(dir, "f", 0o644, 0).unwrap();
    fs.write(file, 0, &[1; 2000]).unwrap();
    fs.hard_link(file, root, "g").unwrap();
    assert!(fs.check().is_empty());
    let usage = fs.usage();
    assert_eq!(usage.inodes.used(), 3);
    assert_eq!(usage.blocks.used(), 2 + 4);
}

#[test]
fn test_detects_bad_link_count() {
    let mut fs = FileSystem::format(super::Geometry::default()).unwrap();
    let file = fs.create_file(fs.root(), "f", 0o644, 0).unwrap();
    fs.update_inode(file, |inode| inode.link_count = 5).unwrap();
    assert_eq!(
        fs.check(),
        vec![Inconsistency::LinkCount {
            inode: file,
            recorded: 5,
            actual: 1
        }]
    );
}

#[test]
fn test_detects_broken_parent_entries() {
    let mut fs = FileSystem::format(super::Geometry::default()).unwrap();
    let root = fs.root();
    let dir = fs.make_directory(root, "d", 0o755, 0).unwrap();
    let file = fs.create_file(root, "f", 0o644, 0).unwrap();
    fs.retarget_entry(dir, DOTDOT, file).unwrap();
    fs.retarget_entry(root, DOTDOT, dir).unwrap();
    assert_eq!(
        fs.check(),
        vec![
            Inconsistency::BadParentEntry { dir: root, target: dir },
            Inconsistency::BadParentEntry { dir, target: file },
        ]
    );
}

#[test]
fn test_detects_bad_self_and_duplicate_entries() {
    let mut fs = FileSystem::format(super::Geometry::default()).unwrap();
    let root = fs.root();
    let a = fs.make_directory(root, "a", 0o755, 0).unwrap();
    let b = fs.make_directory(root, "b", 0o755, 0).unwrap();
    fs.retarget_entry(a, DOT, b).unwrap();
    assert!(fs.check().contains(&Inconsistency::BadSelfEntry { dir: a, target: b }));
    fs.retarget_entry(a, DOT, a).unwrap();
    assert!(fs.check().is_empty());

    let mut entries = fs.list_entries(root).unwrap();
    entries.push(DirEntry::new("a", a));
    fs.write_data(root, 0, &super::directory::encode_entries(&entries)).unwrap();
    fs.link(a).unwrap();
    assert_eq!(
        fs.check(),
        vec![Inconsistency::DuplicateEntry {
            dir: root,
            name: "a".to_string()
        }]
    );
}
