//! The storage engine of a simulated single-volume filesystem.
//!
//! A [`FileSystem`] owns a block [`Storage`] and an [`InodeTable`] and is
//! addressed purely by inode id. Names only exist as directory entries,
//! paths only exist in the resolver.

use packed_struct::prelude::*;
use thiserror::Error;
use tracing::debug;

pub mod check;
pub mod directory;
pub mod file;
pub mod inode;
pub mod path;
pub mod session;
pub mod storage;
pub mod symlink;

use inode::{Access, FileType, Inode, InodeTable};
use storage::{BlockIO, MemoryDevice, Storage};

pub type BlockId = u32;
pub type InodeId = u32;

/// The resource a failed allocation ran out of.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resource {
    Blocks,
    Inodes,
}

impl std::fmt::Display for Resource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Resource::Blocks => f.write_str("blocks"),
            Resource::Inodes => f.write_str("inodes"),
        }
    }
}

#[derive(Error, Debug)]
#[non_exhaustive]
pub enum FSError {
    #[error("No free {0} left on the volume")]
    Exhausted(Resource),
    #[error("Block {0} is outside the volume")]
    InvalidBlockId(BlockId),
    #[error("Inode {0} does not exist")]
    InodeNotFound(InodeId),
    #[error("No entry named {name:?}")]
    NotFound { name: String },
    #[error("Inode {0} is not a directory")]
    NotADirectory(InodeId),
    #[error("Inode {0} is not a regular file")]
    NotAFile(InodeId),
    #[error("Inode {0} is not a symbolic link")]
    NotASymlink(InodeId),
    #[error("Symbolic link {0} does not hold a valid path")]
    InvalidSymlink(InodeId),
    #[error("Too many symbolic links while resolving {path:?}")]
    SymlinkLoop { path: String },
    #[error("An entry named {name:?} already exists")]
    NameExists { name: String },
    #[error("{name:?} is not a valid entry name")]
    InvalidName { name: String },
    #[error("Directory {0} is not empty")]
    DirectoryNotEmpty(InodeId),
    #[error("Path segment {segment:?} (position {position}) does not exist")]
    PathNotFound { segment: String, position: usize },
    #[error("Walking up from inode {0} never reached the root")]
    ResolutionLoop(InodeId),
    #[error("Inode {0} has no parent directory referencing it")]
    OrphanInode(InodeId),
    #[error("The contents of directory {0} cannot be decoded")]
    CorruptDirectory(InodeId),
    #[error("The image is corrupt: {0}")]
    CorruptImage(String),
    #[error("The image could not be encoded: {0}")]
    Encode(String),
    #[error("The block size is not valid (must be at least 16 and a multiple of 16)")]
    InvalidBlockSize,
    #[error("The volume geometry is invalid (block and inode counts must be between 1 and 2^32 - 1)")]
    InvalidGeometry,
    #[error("{len} bytes do not fit into a block of {block_size} bytes")]
    BlockOverflow { len: usize, block_size: usize },
    #[error("Access {access:?} to inode {inode} denied")]
    PermissionDenied { inode: InodeId, access: Access },
    #[error("A directory cannot be moved inside itself")]
    InvalidMove,
    #[error("The root directory cannot be removed")]
    RootDirectory,
    #[error("Block device error")]
    Device(#[source] Box<dyn std::error::Error + Send + Sync>),
}

pub type Result<T> = std::result::Result<T, FSError>;

/// Shape of a freshly formatted volume.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Geometry {
    pub block_count: u32,
    pub inode_count: u32,
    pub block_size: u32,
}

impl Geometry {
    pub const DEFAULT_BLOCK_COUNT: u32 = 4096;
    pub const DEFAULT_INODE_COUNT: u32 = 1024;
    pub const DEFAULT_BLOCK_SIZE: u32 = 512;
    pub const MIN_BLOCK_SIZE: u32 = 16;

    pub fn validate(&self) -> Result<()> {
        if self.block_size < Self::MIN_BLOCK_SIZE || self.block_size % 16 != 0 {
            return Err(FSError::InvalidBlockSize);
        }
        if self.block_count == 0 || self.inode_count == 0 {
            return Err(FSError::InvalidGeometry);
        }
        Ok(())
    }
}

impl Default for Geometry {
    fn default() -> Self {
        Self {
            block_count: Self::DEFAULT_BLOCK_COUNT,
            inode_count: Self::DEFAULT_INODE_COUNT,
            block_size: Self::DEFAULT_BLOCK_SIZE,
        }
    }
}

/// Volume-wide metadata. The free counts are always taken from the
/// live free sets, so a snapshot can never disagree with them.
#[derive(PackedStruct, Debug, Clone, Copy, PartialEq, Eq)]
#[packed_struct(endian = "lsb")]
pub struct Superblock {
    pub block_count: u32,
    pub inode_count: u32,
    pub block_size: u32,
    pub root_inode: u32,
    pub free_blocks: u32,
    pub free_inodes: u32,
}

impl Superblock {
    pub const SIZE: usize = 24;
}

#[derive(Debug)]
pub struct FileSystem<Device: BlockIO = MemoryDevice> {
    storage: Storage<Device>,
    inodes: InodeTable,
    root: InodeId,
}

impl FileSystem<MemoryDevice> {
    /// Formats a fresh in-memory volume and creates its root directory.
    pub fn format(geometry: Geometry) -> Result<Self> {
        geometry.validate()?;
        let device = MemoryDevice::new(geometry.block_size as usize, geometry.block_count as usize);
        Self::format_device(device, geometry.inode_count)
    }
}

impl<Device: BlockIO> FileSystem<Device> {
    pub const ROOT_PERMISSIONS: u16 = 0o755;

    /// Formats `device`, discarding whatever it held.
    pub fn format_device(device: Device, inode_count: u32) -> Result<Self> {
        if inode_count == 0 {
            return Err(FSError::InvalidGeometry);
        }
        let storage = Storage::format(device)?;
        let mut fs = Self {
            storage,
            inodes: InodeTable::new(inode_count),
            root: 0,
        };
        let root = fs.allocate_inode(FileType::Directory, Self::ROOT_PERMISSIONS, 0)?;
        fs.root = root;
        fs.seed_directory(root, root)?;
        debug!(
            "Formatted volume: {} blocks of {} bytes, {} inodes, root inode {}",
            fs.storage.block_count(),
            fs.storage.block_size(),
            inode_count,
            root
        );
        Ok(fs)
    }

    pub(crate) fn from_parts(storage: Storage<Device>, inodes: InodeTable, root: InodeId) -> Self {
        Self {
            storage,
            inodes,
            root,
        }
    }

    pub fn root(&self) -> InodeId {
        self.root
    }

    pub fn block_size(&self) -> usize {
        self.storage.block_size()
    }

    pub fn superblock(&self) -> Superblock {
        Superblock {
            block_count: self.storage.block_count() as u32,
            inode_count: self.inodes.capacity() as u32,
            block_size: self.storage.block_size() as u32,
            root_inode: self.root,
            free_blocks: self.storage.blocks_free() as u32,
            free_inodes: self.inodes.inodes_free() as u32,
        }
    }

    pub fn storage(&self) -> &Storage<Device> {
        &self.storage
    }

    pub fn inodes(&self) -> &InodeTable {
        &self.inodes
    }

    pub fn allocate_inode(
        &mut self,
        kind: FileType,
        permissions: u16,
        owner: u32,
    ) -> Result<InodeId> {
        self.inodes.allocate(kind, permissions, owner)
    }

    pub fn get_inode(&self, id: InodeId) -> Result<&Inode> {
        self.inodes.get(id)
    }

    /// Returns a copy of the inode's metadata.
    pub fn stat(&self, id: InodeId) -> Result<Inode> {
        self.inodes.get(id).cloned()
    }

    pub fn update_inode<R>(&mut self, id: InodeId, mutator: impl FnOnce(&mut Inode) -> R) -> Result<R> {
        self.inodes.update(id, mutator)
    }

    pub fn link(&mut self, id: InodeId) -> Result<u32> {
        self.inodes.link(id)
    }

    /// Drops one link. When none remain the inode's blocks go back to the
    /// block store and its slot to the free set.
    pub fn unlink(&mut self, id: InodeId) -> Result<u32> {
        match self.inodes.unlink(id)? {
            Some(released) => {
                for block in released.blocks {
                    self.storage.free_block(block)?;
                }
                debug!("Reclaimed inode {}", id);
                Ok(0)
            }
            None => Ok(self.inodes.get(id)?.link_count),
        }
    }

    /// Frees an inode that never became reachable, regardless of its links.
    pub(crate) fn discard_inode(&mut self, id: InodeId) -> Result<()> {
        let released = self.inodes.release(id)?;
        for block in released.blocks {
            self.storage.free_block(block)?;
        }
        Ok(())
    }

    pub(crate) fn expect_kind(&self, id: InodeId, kind: FileType) -> Result<&Inode> {
        let inode = self.inodes.get(id)?;
        if inode.kind == kind {
            return Ok(inode);
        }
        Err(match kind {
            FileType::File => FSError::NotAFile(id),
            FileType::Directory => FSError::NotADirectory(id),
            FileType::Symlink => FSError::NotASymlink(id),
        })
    }
}

#[test]
fn test_format_creates_root() {
    let fs = FileSystem::format(Geometry {
        block_count: 8,
        inode_count: 4,
        block_size: 64,
    })
    .unwrap();
    let root = fs.get_inode(fs.root()).unwrap();
    assert_eq!(root.kind, FileType::Directory);
    assert_eq!(root.link_count, 2);
    assert_eq!(root.blocks.len(), 1);
    let superblock = fs.superblock();
    assert_eq!(superblock.free_blocks, 7);
    assert_eq!(superblock.free_inodes, 3);
    assert_eq!(superblock.root_inode, fs.root());
}

#[test]
fn test_format_rejects_bad_geometry() {
    let bad_block_size = Geometry {
        block_size: 100,
        ..Geometry::default()
    };
    assert!(matches!(
        FileSystem::format(bad_block_size),
        Err(FSError::InvalidBlockSize)
    ));
    let no_inodes = Geometry {
        inode_count: 0,
        ..Geometry::default()
    };
    assert!(matches!(
        FileSystem::format(no_inodes),
        Err(FSError::InvalidGeometry)
    ));
}

#[test]
fn test_superblock_pack_size() {
    let superblock = FileSystem::format(Geometry::default()).unwrap().superblock();
    let packed = superblock.pack().unwrap();
    assert_eq!(packed.len(), Superblock::SIZE);
    assert_eq!(Superblock::unpack_from_slice(&packed).unwrap(), superblock);
}
