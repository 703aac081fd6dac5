//! The inode table: a fixed arena of slots addressed by inode id.

use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::trace;

use super::{BlockId, FSError, InodeId, Resource, Result};

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileType {
    File,
    Directory,
    /// Holds the path it points to as its data
    Symlink,
}

/// One of the rwx permission bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    Read = 0b100,
    Write = 0b010,
    Execute = 0b001,
}

pub(crate) fn now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_secs())
        .unwrap_or(0)
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Inode {
    /// Index of the slot holding this inode
    pub id: InodeId,
    pub kind: FileType,
    /// Owner and other rwx triplets, e.g. `0o755`
    pub permissions: u16,
    pub owner: u32,
    /// Number of directory entries referencing this inode
    pub link_count: u32,
    /// Size in bytes
    pub size: u64,
    /// Owned blocks, in file byte order
    pub blocks: Vec<BlockId>,
    pub atime: u64,
    pub mtime: u64,
    pub ctime: u64,
}

impl Inode {
    pub fn new(id: InodeId, kind: FileType, permissions: u16, owner: u32) -> Self {
        let now = now();
        Self {
            id,
            kind,
            permissions,
            owner,
            link_count: 0,
            size: 0,
            blocks: Vec::new(),
            atime: now,
            mtime: now,
            ctime: now,
        }
    }

    pub fn is_dir(&self) -> bool {
        self.kind == FileType::Directory
    }

    pub fn is_symlink(&self) -> bool {
        self.kind == FileType::Symlink
    }

    /// Root (uid 0) may do anything. The owner is judged by the owner
    /// triplet, everybody else by the other triplet.
    pub fn permits(&self, uid: u32, access: Access) -> bool {
        if uid == 0 {
            return true;
        }
        let triplet = if uid == self.owner {
            (self.permissions >> 6) & 0b111
        } else {
            self.permissions & 0b111
        };
        triplet & access as u16 != 0
    }

    /// Marks a content change.
    pub(crate) fn touch(&mut self) {
        let now = now();
        self.mtime = now;
        self.ctime = now;
    }
}

#[derive(Debug, Clone)]
pub struct InodeTable {
    slots: Vec<Option<Inode>>,
    inodes_free: usize,
}

impl InodeTable {
    pub fn new(capacity: u32) -> Self {
        Self {
            slots: vec![None; capacity as usize],
            inodes_free: capacity as usize,
        }
    }

    /// Rebuilds a table from its slots. Slot `i` must hold inode `i`.
    pub fn from_slots(slots: Vec<Option<Inode>>) -> Self {
        let inodes_free = slots.iter().filter(|slot| slot.is_none()).count();
        Self { slots, inodes_free }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub fn inodes_free(&self) -> usize {
        self.inodes_free
    }

    pub fn slots(&self) -> &[Option<Inode>] {
        &self.slots
    }

    pub fn iter(&self) -> impl Iterator<Item = &Inode> {
        self.slots.iter().flatten()
    }

    /// Takes the first free slot. The new inode has no links yet.
    pub fn allocate(&mut self, kind: FileType, permissions: u16, owner: u32) -> Result<InodeId> {
        let index = self
            .slots
            .iter()
            .position(Option::is_none)
            .ok_or(FSError::Exhausted(Resource::Inodes))?;
        let id = index as InodeId;
        self.slots[index] = Some(Inode::new(id, kind, permissions, owner));
        self.inodes_free -= 1;
        trace!("Allocated inode {id} ({kind:?})");
        Ok(id)
    }

    pub fn get(&self, id: InodeId) -> Result<&Inode> {
        self.slots
            .get(id as usize)
            .and_then(Option::as_ref)
            .ok_or(FSError::InodeNotFound(id))
    }

    pub fn update<R>(&mut self, id: InodeId, mutator: impl FnOnce(&mut Inode) -> R) -> Result<R> {
        self.slots
            .get_mut(id as usize)
            .and_then(Option::as_mut)
            .map(mutator)
            .ok_or(FSError::InodeNotFound(id))
    }

    pub fn link(&mut self, id: InodeId) -> Result<u32> {
        self.update(id, |inode| {
            inode.link_count += 1;
            inode.ctime = now();
            inode.link_count
        })
    }

    /// Drops one link and hands back the inode once it has none left,
    /// at which point its slot is already free again.
    pub fn unlink(&mut self, id: InodeId) -> Result<Option<Inode>> {
        let remaining = self.update(id, |inode| {
            inode.link_count = inode.link_count.saturating_sub(1);
            inode.ctime = now();
            inode.link_count
        })?;
        if remaining > 0 {
            return Ok(None);
        }
        self.release(id).map(Some)
    }

    /// Empties the slot unconditionally.
    pub fn release(&mut self, id: InodeId) -> Result<Inode> {
        let inode = self
            .slots
            .get_mut(id as usize)
            .and_then(Option::take)
            .ok_or(FSError::InodeNotFound(id))?;
        self.inodes_free += 1;
        trace!("Released inode {id}");
        Ok(inode)
    }
}

#[test]
fn test_allocate_first_fit() {
    let mut table = InodeTable::new(3);
    assert_eq!(table.allocate(FileType::File, 0o644, 0).unwrap(), 0);
    assert_eq!(table.allocate(FileType::File, 0o644, 0).unwrap(), 1);
    table.release(0).unwrap();
    assert_eq!(table.allocate(FileType::Directory, 0o755, 0).unwrap(), 0);
    assert_eq!(table.allocate(FileType::File, 0o644, 0).unwrap(), 2);
    assert!(matches!(
        table.allocate(FileType::File, 0o644, 0),
        Err(FSError::Exhausted(Resource::Inodes))
    ));
    assert_eq!(table.inodes_free(), 0);
}

#[test]
fn test_unlink_releases_at_zero() {
    let mut table = InodeTable::new(2);
    let id = table.allocate(FileType::File, 0o644, 0).unwrap();
    table.link(id).unwrap();
    table.link(id).unwrap();
    assert!(table.unlink(id).unwrap().is_none());
    assert_eq!(table.get(id).unwrap().link_count, 1);
    let released = table.unlink(id).unwrap().unwrap();
    assert_eq!(released.id, id);
    assert!(matches!(table.get(id), Err(FSError::InodeNotFound(_))));
    assert_eq!(table.inodes_free(), 2);
}

#[test]
fn test_permissions() {
    let inode = Inode::new(1, FileType::File, 0o640, 1000);
    assert!(inode.permits(0, Access::Write));
    assert!(inode.permits(1000, Access::Read));
    assert!(inode.permits(1000, Access::Write));
    assert!(!inode.permits(1000, Access::Execute));
    assert!(!inode.permits(1001, Access::Read));
    let public = Inode::new(2, FileType::Directory, 0o755, 1000);
    assert!(public.permits(1001, Access::Execute));
    assert!(!public.permits(1001, Access::Write));
}
