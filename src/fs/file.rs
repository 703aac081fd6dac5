//! Byte-level reads and writes over an inode's block list.

use tracing::{debug, trace};

use super::directory::validate_name;
use super::inode::FileType;
use super::storage::BlockIO;
use super::{BlockId, FSError, FileSystem, InodeId, Result};

impl<Device: BlockIO> FileSystem<Device> {
    pub const FILE_PERMISSIONS: u16 = 0o644;

    fn blocks_for(&self, size: u64) -> usize {
        size.div_ceil(self.storage.block_size() as u64) as usize
    }

    /// Reads up to `length` bytes at `offset`; the result is cut short at
    /// the end of the file.
    pub fn read(&self, id: InodeId, offset: u64, length: u64) -> Result<Vec<u8>> {
        self.expect_kind(id, FileType::File)?;
        self.read_data(id, offset, length)
    }

    pub fn read_all(&self, id: InodeId) -> Result<Vec<u8>> {
        let size = self.expect_kind(id, FileType::File)?.size;
        self.read_data(id, 0, size)
    }

    /// Writes `data` at `offset`, growing the file as needed. If the
    /// volume runs out of blocks the file is left exactly as it was.
    pub fn write(&mut self, id: InodeId, offset: u64, data: &[u8]) -> Result<usize> {
        self.expect_kind(id, FileType::File)?;
        self.write_data(id, offset, data)
    }

    pub fn truncate(&mut self, id: InodeId, new_size: u64) -> Result<()> {
        self.expect_kind(id, FileType::File)?;
        self.truncate_data(id, new_size)
    }

    pub(crate) fn read_data(&self, id: InodeId, offset: u64, length: u64) -> Result<Vec<u8>> {
        let inode = self.get_inode(id)?;
        let end = offset.saturating_add(length).min(inode.size);
        if offset >= end {
            return Ok(Vec::new());
        }
        let block_size = self.storage.block_size() as u64;
        let mut out = Vec::with_capacity((end - offset) as usize);
        let mut buffer = vec![0; block_size as usize];
        let mut pos = offset;
        while pos < end {
            let block = inode.blocks[(pos / block_size) as usize];
            let inner = (pos % block_size) as usize;
            let chunk = (block_size - inner as u64).min(end - pos) as usize;
            self.storage.read_block_into(block, &mut buffer)?;
            out.extend_from_slice(&buffer[inner..inner + chunk]);
            pos += chunk as u64;
        }
        Ok(out)
    }

    pub(crate) fn write_data(&mut self, id: InodeId, offset: u64, data: &[u8]) -> Result<usize> {
        let end = offset
            .checked_add(data.len() as u64)
            .ok_or(FSError::Exhausted(super::Resource::Blocks))?;
        if end > self.get_inode(id)?.size {
            self.grow(id, end)?;
        }
        let blocks = self.get_inode(id)?.blocks.clone();
        let block_size = self.storage.block_size();
        let mut buffer = vec![0; block_size];
        let mut written = 0;
        while written < data.len() {
            let pos = offset + written as u64;
            let block = blocks[(pos / block_size as u64) as usize];
            let inner = (pos % block_size as u64) as usize;
            let chunk = (block_size - inner).min(data.len() - written);
            if chunk < block_size {
                self.storage.read_block_into(block, &mut buffer)?;
            }
            buffer[inner..inner + chunk].copy_from_slice(&data[written..written + chunk]);
            self.storage.write_block(block, &buffer)?;
            written += chunk;
        }
        self.inodes.update(id, |inode| inode.touch())?;
        trace!("Wrote {written} bytes at {offset} to inode {id}");
        Ok(written)
    }

    /// Extends the file to `new_size` with zeroes. Every block is
    /// allocated before the inode changes, and handed back on failure.
    fn grow(&mut self, id: InodeId, new_size: u64) -> Result<()> {
        let have = self.get_inode(id)?.blocks.len();
        let need = self.blocks_for(new_size);
        let missing = need.saturating_sub(have);
        if missing > self.storage.blocks_free() {
            debug!(
                "Growing inode {id} to {new_size} bytes needs {missing} blocks, {} free",
                self.storage.blocks_free()
            );
            return Err(FSError::Exhausted(super::Resource::Blocks));
        }
        let mut fresh: Vec<BlockId> = Vec::with_capacity(missing);
        for _ in have..need {
            match self.storage.allocate_block() {
                Ok(block) => fresh.push(block),
                Err(err) => {
                    debug!(
                        "Growing inode {id} to {new_size} bytes failed after {} blocks, rolling back",
                        fresh.len()
                    );
                    for block in fresh {
                        self.storage.free_block(block)?;
                    }
                    return Err(err);
                }
            }
        }
        self.inodes.update(id, |inode| {
            inode.blocks.extend(fresh);
            inode.size = new_size;
            inode.touch();
        })
    }

    pub(crate) fn truncate_data(&mut self, id: InodeId, new_size: u64) -> Result<()> {
        let inode = self.get_inode(id)?;
        if new_size > inode.size {
            return self.grow(id, new_size);
        }
        if new_size == inode.size {
            return Ok(());
        }
        let keep = self.blocks_for(new_size);
        let block_size = self.storage.block_size();
        let tail = (new_size % block_size as u64) as usize;
        // bytes past the end of the last block must read back as zero
        if tail != 0 {
            let last = inode.blocks[keep - 1];
            let mut buffer = self.storage.read_block(last)?;
            buffer[tail..].fill(0);
            self.storage.write_block(last, &buffer)?;
        }
        let dropped = self.inodes.update(id, |inode| {
            let dropped = inode.blocks.split_off(keep);
            inode.size = new_size;
            inode.touch();
            dropped
        })?;
        for block in dropped {
            self.storage.free_block(block)?;
        }
        Ok(())
    }

    pub fn create_file(
        &mut self,
        parent: InodeId,
        name: &str,
        permissions: u16,
        owner: u32,
    ) -> Result<InodeId> {
        validate_name(name)?;
        self.expect_kind(parent, FileType::Directory)?;
        let file = self.allocate_inode(FileType::File, permissions, owner)?;
        if let Err(err) = self.add_entry(parent, name, file) {
            self.discard_inode(file)?;
            return Err(err);
        }
        debug!("Created file {name:?} (inode {file}) in {parent}");
        Ok(file)
    }

    /// Removes one name of a regular file or symbolic link; the data goes
    /// once no name is left.
    pub fn remove_file(&mut self, parent: InodeId, name: &str) -> Result<()> {
        validate_name(name)?;
        let target = self.find_entry(parent, name)?;
        if self.get_inode(target)?.is_dir() {
            return Err(FSError::NotAFile(target));
        }
        self.remove_entry(parent, name)?;
        Ok(())
    }

    /// Copies the contents and permissions of the regular file `source` into
    /// a new file `parent/name`. Nothing is left behind if the volume fills up.
    pub fn copy_file(
        &mut self,
        source: InodeId,
        parent: InodeId,
        name: &str,
        owner: u32,
    ) -> Result<InodeId> {
        let original = self.expect_kind(source, FileType::File)?;
        let (permissions, needed) = (original.permissions, original.blocks.len());
        if needed > self.storage.blocks_free() {
            return Err(FSError::Exhausted(super::Resource::Blocks));
        }
        let data = self.read_data(source, 0, original.size)?;
        let copy = self.create_file(parent, name, permissions, owner)?;
        if let Err(err) = self.write_data(copy, 0, &data) {
            debug!("Copying inode {source} to {name:?} failed, removing the copy");
            self.remove_entry(parent, name)?;
            return Err(err);
        }
        debug!("Copied inode {source} to {name:?} (inode {copy}) in {parent}");
        Ok(copy)
    }

    /// Adds `parent/name` as another name for the regular file `target`.
    pub fn hard_link(&mut self, target: InodeId, parent: InodeId, name: &str) -> Result<()> {
        validate_name(name)?;
        self.expect_kind(target, FileType::File)?;
        self.add_entry(parent, name, target)
    }
}

#[cfg(test)]
fn test_fs(block_count: u32) -> FileSystem {
    FileSystem::format(super::Geometry {
        block_count,
        inode_count: 8,
        block_size: 16,
    })
    .unwrap()
}

#[test]
fn test_write_read_across_blocks() {
    let mut fs = test_fs(16);
    let file = fs.create_file(fs.root(), "f", 0o644, 0).unwrap();
    let data: Vec<u8> = (0..50).collect();
    assert_eq!(fs.write(file, 0, &data).unwrap(), 50);
    let inode = fs.get_inode(file).unwrap();
    assert_eq!(inode.size, 50);
    assert_eq!(inode.blocks.len(), 4);
    assert_eq!(fs.read(file, 0, 50).unwrap(), data);
    assert_eq!(fs.read(file, 10, 20).unwrap(), data[10..30].to_vec());
    assert_eq!(fs.read(file, 40, 100).unwrap(), data[40..].to_vec());
    assert!(fs.read(file, 60, 5).unwrap().is_empty());
}

#[test]
fn test_partial_block_overwrite() {
    let mut fs = test_fs(16);
    let file = fs.create_file(fs.root(), "f", 0o644, 0).unwrap();
    fs.write(file, 0, b"hello world, hello blocks").unwrap();
    fs.write(file, 13, b"HELLO").unwrap();
    assert_eq!(fs.read_all(file).unwrap(), b"hello world, HELLO blocks");
}

#[test]
fn test_write_past_end_zero_fills() {
    let mut fs = test_fs(16);
    let file = fs.create_file(fs.root(), "f", 0o644, 0).unwrap();
    fs.write(file, 0, b"abc").unwrap();
    fs.write(file, 20, b"xyz").unwrap();
    let data = fs.read_all(file).unwrap();
    assert_eq!(data.len(), 23);
    assert_eq!(&data[..3], b"abc");
    assert!(data[3..20].iter().all(|b| *b == 0));
    assert_eq!(&data[20..], b"xyz");
}

#[test]
fn test_truncate_shrink_then_extend() {
    let mut fs = test_fs(16);
    let file = fs.create_file(fs.root(), "f", 0o644, 0).unwrap();
    fs.write(file, 0, &[7; 40]).unwrap();
    let free = fs.superblock().free_blocks;
    fs.truncate(file, 5).unwrap();
    assert_eq!(fs.get_inode(file).unwrap().blocks.len(), 1);
    assert_eq!(fs.superblock().free_blocks, free + 2);
    fs.truncate(file, 20).unwrap();
    let data = fs.read_all(file).unwrap();
    assert_eq!(&data[..5], &[7; 5]);
    assert!(data[5..].iter().all(|b| *b == 0));
    fs.truncate(file, 0).unwrap();
    assert!(fs.get_inode(file).unwrap().blocks.is_empty());
}

#[test]
fn test_failed_growth_leaves_file_untouched() {
    let mut fs = test_fs(4);
    let file = fs.create_file(fs.root(), "f", 0o644, 0).unwrap();
    fs.write(file, 0, b"0123456789").unwrap();
    let free = fs.superblock().free_blocks;
    assert!(matches!(
        fs.write(file, 10, &[1; 64]),
        Err(FSError::Exhausted(super::Resource::Blocks))
    ));
    assert_eq!(fs.superblock().free_blocks, free);
    assert_eq!(fs.read_all(file).unwrap(), b"0123456789");
}

#[test]
fn test_type_mismatch() {
    let mut fs = test_fs(8);
    let root = fs.root();
    assert!(matches!(fs.read(root, 0, 1), Err(FSError::NotAFile(_))));
    assert!(matches!(fs.write(root, 0, b"x"), Err(FSError::NotAFile(_))));
    assert!(matches!(fs.truncate(root, 0), Err(FSError::NotAFile(_))));
    let dir = fs.make_directory(root, "d", 0o755, 0).unwrap();
    assert!(matches!(fs.remove_file(root, "d"), Err(FSError::NotAFile(_))));
    assert!(matches!(fs.hard_link(dir, root, "e"), Err(FSError::NotAFile(_))));
}

#[test]
fn test_hard_link_keeps_data_alive() {
    let mut fs = test_fs(16);
    let root = fs.root();
    let file = fs.create_file(root, "a", 0o644, 0).unwrap();
    fs.write(file, 0, b"shared").unwrap();
    fs.hard_link(file, root, "b").unwrap();
    assert_eq!(fs.get_inode(file).unwrap().link_count, 2);
    fs.remove_file(root, "a").unwrap();
    let again = fs.find_entry(root, "b").unwrap();
    assert_eq!(fs.read_all(again).unwrap(), b"shared");
    fs.remove_file(root, "b").unwrap();
    assert!(fs.get_inode(file).is_err());
}

#[test]
fn test_huge_growth_is_refused() {
    let mut fs = test_fs(16);
    let file = fs.create_file(fs.root(), "f", 0o644, 0).unwrap();
    fs.write(file, 0, b"keep").unwrap();
    let free = fs.superblock().free_blocks;
    assert!(matches!(
        fs.truncate(file, u64::MAX),
        Err(FSError::Exhausted(super::Resource::Blocks))
    ));
    assert!(matches!(
        fs.write(file, u64::MAX / 2, b"far away"),
        Err(FSError::Exhausted(super::Resource::Blocks))
    ));
    assert!(matches!(
        fs.write(file, u64::MAX, b"x"),
        Err(FSError::Exhausted(super::Resource::Blocks))
    ));
    assert_eq!(fs.superblock().free_blocks, free);
    assert_eq!(fs.read_all(file).unwrap(), b"keep");
}

#[test]
fn test_copy_file() {
    let mut fs = test_fs(16);
    let root = fs.root();
    let source = fs.create_file(root, "src", 0o600, 7).unwrap();
    fs.write(source, 0, b"copied across two blocks").unwrap();
    let copy = fs.copy_file(source, root, "dst", 9).unwrap();
    assert_ne!(copy, source);
    assert_eq!(fs.read_all(copy).unwrap(), b"copied across two blocks");
    let inode = fs.get_inode(copy).unwrap();
    assert_eq!((inode.permissions, inode.owner, inode.link_count), (0o600, 9, 1));
    fs.write(copy, 0, b"C").unwrap();
    assert_eq!(fs.read(source, 0, 1).unwrap(), b"c");
    assert!(matches!(
        fs.copy_file(source, root, "dst", 0),
        Err(FSError::NameExists { .. })
    ));
    assert!(matches!(fs.copy_file(root, root, "x", 0), Err(FSError::NotAFile(_))));
}

#[test]
fn test_copy_file_rolls_back() {
    // the root fills exactly two blocks, so the new entry takes the last free one
    let mut fs = test_fs(4);
    let root = fs.root();
    let source = fs.create_file(root, "src", 0o644, 0).unwrap();
    fs.create_file(root, "abcdef", 0o644, 0).unwrap();
    fs.write(source, 0, &[3; 16]).unwrap();
    assert_eq!(fs.get_inode(root).unwrap().size, 32);
    let before = fs.superblock();
    assert_eq!(before.free_blocks, 1);
    let entries = fs.list_entries(root).unwrap();
    assert!(matches!(
        fs.copy_file(source, root, "dst", 0),
        Err(FSError::Exhausted(super::Resource::Blocks))
    ));
    assert_eq!(fs.superblock(), before);
    assert_eq!(fs.list_entries(root).unwrap(), entries);
    assert!(fs.check().is_empty());

    fs.write(source, 16, &[3; 16]).unwrap();
    assert!(matches!(
        fs.copy_file(source, root, "dst", 0),
        Err(FSError::Exhausted(super::Resource::Blocks))
    ));
    assert_eq!(fs.superblock().free_blocks, 0);
}
