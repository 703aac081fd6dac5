use super::inode::{Access, FileType};
use super::storage::BlockIO;
use super::{FSError, FileSystem, InodeId, Result};

/// Who is asking and from where. Passed to every path-based call instead of
/// living inside the engine, so any number of sessions can share a volume.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Session {
    uid: u32,
    cwd: InodeId,
}

impl Session {
    pub fn new(uid: u32, cwd: InodeId) -> Self {
        Self { uid, cwd }
    }

    /// A session for `uid` sitting in the root directory.
    pub fn at_root<Device: BlockIO>(fs: &FileSystem<Device>, uid: u32) -> Self {
        Self::new(uid, fs.root())
    }

    pub fn uid(&self) -> u32 {
        self.uid
    }

    pub fn cwd(&self) -> InodeId {
        self.cwd
    }

    pub fn resolve<Device: BlockIO>(&self, fs: &FileSystem<Device>, path: &str) -> Result<InodeId> {
        fs.resolve(self.cwd, path)
    }

    pub fn resolve_follow<Device: BlockIO>(&self, fs: &FileSystem<Device>, path: &str) -> Result<InodeId> {
        fs.resolve_follow(self.cwd, path)
    }

    pub fn resolve_parent<'p, Device: BlockIO>(
        &self,
        fs: &FileSystem<Device>,
        path: &'p str,
    ) -> Result<(InodeId, &'p str)> {
        fs.resolve_parent(self.cwd, path)
    }

    pub fn chdir<Device: BlockIO>(&mut self, fs: &FileSystem<Device>, path: &str) -> Result<()> {
        let target = self.resolve_follow(fs, path)?;
        fs.expect_kind(target, FileType::Directory)?;
        self.ensure_access(fs, target, Access::Execute)?;
        self.cwd = target;
        Ok(())
    }

    pub fn pwd<Device: BlockIO>(&self, fs: &FileSystem<Device>) -> Result<String> {
        fs.path_of(self.cwd)
    }

    pub fn ensure_access<Device: BlockIO>(
        &self,
        fs: &FileSystem<Device>,
        inode: InodeId,
        access: Access,
    ) -> Result<()> {
        if fs.get_inode(inode)?.permits(self.uid, access) {
            Ok(())
        } else {
            Err(FSError::PermissionDenied { inode, access })
        }
    }
}

#[test]
fn test_sessions_are_independent() {
    let mut fs = FileSystem::format(super::Geometry::default()).unwrap();
    let root = fs.root();
    let home = fs.make_directory(root, "home", 0o755, 0).unwrap();
    let alice = fs.make_directory(home, "alice", 0o700, 1000).unwrap();
    let mut first = Session::at_root(&fs, 1000);
    let second = Session::at_root(&fs, 1001);
    first.chdir(&fs, "home/alice").unwrap();
    assert_eq!(first.cwd(), alice);
    assert_eq!(first.pwd(&fs).unwrap(), "/home/alice");
    assert_eq!(second.pwd(&fs).unwrap(), "/");
    assert_eq!(first.resolve(&fs, "..").unwrap(), home);
    let mut intruder = second;
    assert!(matches!(
        intruder.chdir(&fs, "/home/alice"),
        Err(FSError::PermissionDenied { access: Access::Execute, .. })
    ));
    assert_eq!(intruder.cwd(), root);
}

#[test]
fn test_chdir_follows_symlinks() {
    let mut fs = FileSystem::format(super::Geometry::default()).unwrap();
    let root = fs.root();
    let var = fs.make_directory(root, "var", 0o755, 0).unwrap();
    let log = fs.make_directory(var, "log", 0o755, 0).unwrap();
    fs.create_symlink(root, "logs", "var/log", 0).unwrap();
    let mut session = Session::at_root(&fs, 0);
    session.chdir(&fs, "/logs").unwrap();
    assert_eq!(session.cwd(), log);
    assert_eq!(session.pwd(&fs).unwrap(), "/var/log");
}
