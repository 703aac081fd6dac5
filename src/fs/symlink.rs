//! Symbolic links. A link's data is the UTF-8 path it points to; the path
//! is only interpreted when a lookup walks through the link.

use tracing::debug;

use super::directory::validate_name;
use super::inode::FileType;
use super::storage::BlockIO;
use super::{FSError, FileSystem, InodeId, Result};

impl<Device: BlockIO> FileSystem<Device> {
    pub const SYMLINK_PERMISSIONS: u16 = 0o777;
    /// Links followed by a single lookup before it gives up.
    pub const MAX_SYMLINK_DEPTH: usize = 40;

    /// Creates `parent/name` pointing at `target`. The target does not
    /// need to exist.
    pub fn create_symlink(
        &mut self,
        parent: InodeId,
        name: &str,
        target: &str,
        owner: u32,
    ) -> Result<InodeId> {
        validate_name(name)?;
        if target.is_empty() {
            return Err(FSError::InvalidName {
                name: target.to_string(),
            });
        }
        self.expect_kind(parent, FileType::Directory)?;
        let link = self.allocate_inode(FileType::Symlink, Self::SYMLINK_PERMISSIONS, owner)?;
        let created = self
            .write_data(link, 0, target.as_bytes())
            .and_then(|_| self.add_entry(parent, name, link));
        if let Err(err) = created {
            self.discard_inode(link)?;
            return Err(err);
        }
        debug!("Created symlink {name:?} -> {target:?} (inode {link}) in {parent}");
        Ok(link)
    }

    pub fn read_link(&self, id: InodeId) -> Result<String> {
        let size = self.expect_kind(id, FileType::Symlink)?.size;
        let data = self.read_data(id, 0, size)?;
        String::from_utf8(data).map_err(|_| FSError::InvalidSymlink(id))
    }
}

#[cfg(test)]
fn test_fs() -> FileSystem {
    FileSystem::format(super::Geometry {
        block_count: 32,
        inode_count: 16,
        block_size: 16,
    })
    .unwrap()
}

#[test]
fn test_create_and_read_link() {
    let mut fs = test_fs();
    let root = fs.root();
    let link = fs
        .create_symlink(root, "far", "/some/rather/long/target/path", 0)
        .unwrap();
    let inode = fs.get_inode(link).unwrap();
    assert!(inode.is_symlink());
    assert_eq!(inode.blocks.len(), 2);
    assert_eq!(fs.read_link(link).unwrap(), "/some/rather/long/target/path");
    assert!(matches!(fs.read_link(root), Err(FSError::NotASymlink(_))));
    assert!(matches!(fs.read_all(link), Err(FSError::NotAFile(_))));
    assert_eq!(fs.path_of(link).unwrap(), "/far");
    fs.remove_file(root, "far").unwrap();
    assert!(fs.get_inode(link).is_err());
    assert!(fs.check().is_empty());
}

#[test]
fn test_symlink_rolls_back() {
    let mut fs = FileSystem::format(super::Geometry {
        block_count: 2,
        inode_count: 4,
        block_size: 16,
    })
    .unwrap();
    let root = fs.root();
    let before = fs.superblock();
    assert!(matches!(
        fs.create_symlink(root, "l", "a/target/that/needs/two/blocks", 0),
        Err(FSError::Exhausted(super::Resource::Blocks))
    ));
    assert!(matches!(
        fs.create_symlink(root, "l", "", 0),
        Err(FSError::InvalidName { .. })
    ));
    assert_eq!(fs.superblock(), before);
    assert!(fs.check().is_empty());
}
