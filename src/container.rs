mod image;

pub use image::{decode, encode, pack_bitmap, unpack_bitmap, ImageHeader, RecordHeader, RecordTag};

use eyre::{ensure, Context, Result};
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, trace, warn};

use crate::fs::storage::BlockIO;
use crate::fs::FileSystem;

/// The single file a volume is persisted to.
#[derive(Debug, Clone)]
pub struct ImageFile {
    path: PathBuf,
}

impl ImageFile {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn exists(&self) -> bool {
        self.path.is_file()
    }

    pub fn load(&self) -> Result<FileSystem> {
        debug!("Loading image from {:?}", self.path);
        let bytes = fs::read(&self.path)
            .with_context(|| format!("Couldn't read image file {:?}", self.path))?;
        trace!("Read {} bytes", bytes.len());
        decode(&bytes).wrap_err("Failed to decode image... Maybe it is corrupt?")
    }

    /// Writes the image next to its destination first and renames it into
    /// place, so the old image stays intact until the new one is complete.
    pub fn save<Device: BlockIO>(&self, volume: &FileSystem<Device>) -> Result<()> {
        debug!("Saving image to {:?}", self.path);
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            ensure!(
                parent.is_dir(),
                "target file location {parent:?} is not a directory"
            );
        }
        let bytes = encode(volume).wrap_err("Failed to encode volume")?;
        let staging = self.staging_path();
        let written = File::create(&staging)
            .with_context(|| format!("Couldn't create {staging:?}"))
            .and_then(|mut file| {
                file.write_all(&bytes)?;
                file.sync_all()?;
                Ok(())
            })
            .and_then(|()| {
                fs::rename(&staging, &self.path)
                    .with_context(|| format!("Couldn't move {staging:?} into place"))
            });
        if let Err(err) = written {
            if staging.exists() {
                if let Err(cleanup) = fs::remove_file(&staging) {
                    warn!("Couldn't remove {staging:?}: {cleanup}");
                }
            }
            return Err(err);
        }
        trace!("Wrote {} bytes", bytes.len());
        Ok(())
    }

    /// Moves the current image out of the way, e.g. before replacing an
    /// image that failed to load. Returns where it went.
    pub fn set_aside(&self) -> Result<PathBuf> {
        let backup = self.sibling(".corrupt");
        fs::rename(&self.path, &backup)
            .with_context(|| format!("Couldn't move {:?} to {backup:?}", self.path))?;
        warn!("Moved unreadable image {:?} to {backup:?}", self.path);
        Ok(backup)
    }

    fn staging_path(&self) -> PathBuf {
        self.sibling(".tmp")
    }

    fn sibling(&self, suffix: &str) -> PathBuf {
        let mut name = self.path.file_name().unwrap_or_default().to_os_string();
        name.push(suffix);
        self.path.with_file_name(name)
    }
}

#[cfg(test)]
pub(crate) fn scratch_path(name: &str) -> PathBuf {
    use rand::RngCore;
    std::env::temp_dir().join(format!("simfs-{name}-{:016x}.img", rand::thread_rng().next_u64()))
}

#[test]
fn test_save_and_load_file() {
    let path = scratch_path("container");
    let image = ImageFile::new(&path);
    assert!(!image.exists());
    let mut volume = FileSystem::format(crate::fs::Geometry::default()).unwrap();
    let root = volume.root();
    let file = volume.create_file(root, "hello.txt", 0o644, 0).unwrap();
    volume.write(file, 0, b"hello").unwrap();
    image.save(&volume).unwrap();
    assert!(image.exists());
    assert!(!image.staging_path().exists());
    let loaded = image.load().unwrap();
    let file = loaded.resolve(loaded.root(), "hello.txt").unwrap();
    assert_eq!(loaded.read_all(file).unwrap(), b"hello");
    fs::remove_file(&path).unwrap();
}

#[test]
fn test_load_garbage_fails() {
    let path = scratch_path("garbage");
    fs::write(&path, b"definitely not an image").unwrap();
    assert!(ImageFile::new(&path).load().is_err());
    fs::remove_file(&path).unwrap();
}

#[test]
fn test_failed_save_leaves_no_staging_file() {
    let path = scratch_path("blocked");
    // a directory in the image's place makes the final rename fail
    fs::create_dir(&path).unwrap();
    fs::write(path.join("occupied"), b"x").unwrap();
    let image = ImageFile::new(&path);
    let volume = FileSystem::format(crate::fs::Geometry::default()).unwrap();
    assert!(image.save(&volume).is_err());
    assert!(!image.staging_path().exists());
    fs::remove_dir_all(&path).unwrap();
}

#[test]
fn test_set_aside() {
    let path = scratch_path("aside");
    fs::write(&path, b"unreadable").unwrap();
    let image = ImageFile::new(&path);
    let backup = image.set_aside().unwrap();
    assert!(!image.exists());
    assert_eq!(fs::read(&backup).unwrap(), b"unreadable");
    fs::remove_file(&backup).unwrap();
}
