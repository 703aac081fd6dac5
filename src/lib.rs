pub mod container;
pub mod fs;

use std::path::Path;

use eyre::{Context, Result};
use tracing::{info, warn};

use container::ImageFile;
use fs::{FileSystem, Geometry};

/// A volume bound to the image file it was loaded from and is saved to.
#[derive(Debug)]
pub struct SimFs {
    image: ImageFile,
    volume: FileSystem,
    fresh: bool,
    /// The image on disk could not be loaded and has not been replaced yet
    discarded: bool,
}

impl SimFs {
    /// Loads the image at `path`. A missing or unreadable image is replaced
    /// by a freshly formatted volume; [`SimFs::is_fresh`] tells which happened.
    /// An unreadable image stays on disk until the first [`SimFs::save`]
    /// moves it aside.
    pub fn open_or_format(path: impl AsRef<Path>, geometry: Geometry) -> Result<Self> {
        let image = ImageFile::new(path);
        let mut discarded = false;
        if image.exists() {
            match image.load() {
                Ok(volume) => {
                    info!("Loaded volume from {:?}", image.path());
                    return Ok(Self {
                        image,
                        volume,
                        fresh: false,
                        discarded: false,
                    });
                }
                Err(err) => {
                    warn!("Ignoring unreadable image {:?}: {err:#}", image.path());
                    discarded = true;
                }
            }
        }
        let mut fs = Self::format(image.path(), geometry)?;
        fs.discarded = discarded;
        Ok(fs)
    }

    /// Formats a new volume for `path` without looking at what is there.
    pub fn format(path: impl AsRef<Path>, geometry: Geometry) -> Result<Self> {
        let image = ImageFile::new(path);
        let volume = FileSystem::format(geometry).wrap_err("Failed to format volume")?;
        info!("Formatted a new volume for {:?}", image.path());
        Ok(Self {
            image,
            volume,
            fresh: true,
            discarded: false,
        })
    }

    pub fn is_fresh(&self) -> bool {
        self.fresh
    }

    /// Whether an image exists at the path that could not be loaded.
    pub fn discarded_image(&self) -> bool {
        self.discarded
    }

    pub fn path(&self) -> &Path {
        self.image.path()
    }

    pub fn volume(&self) -> &FileSystem {
        &self.volume
    }

    pub fn volume_mut(&mut self) -> &mut FileSystem {
        &mut self.volume
    }

    pub fn save(&mut self) -> Result<()> {
        if self.discarded && self.image.exists() {
            self.image.set_aside()?;
        }
        self.discarded = false;
        self.image.save(&self.volume)
    }
}

#[test]
fn test_open_or_format() {
    let path = container::scratch_path("lib");
    let geometry = Geometry {
        block_count: 64,
        inode_count: 16,
        block_size: 64,
    };
    let mut first = SimFs::open_or_format(&path, geometry).unwrap();
    assert!(first.is_fresh());
    let root = first.volume().root();
    first.volume_mut().make_directory(root, "kept", 0o755, 0).unwrap();
    first.save().unwrap();

    let second = SimFs::open_or_format(&path, geometry).unwrap();
    assert!(!second.is_fresh());
    assert!(second.volume().resolve(root, "/kept").is_ok());

    std::fs::write(&path, b"garbage").unwrap();
    let mut third = SimFs::open_or_format(&path, geometry).unwrap();
    assert!(third.is_fresh());
    assert!(third.discarded_image());
    assert!(third.volume().resolve(root, "/kept").is_err());
    assert_eq!(std::fs::read(&path).unwrap(), b"garbage");
    third.save().unwrap();
    assert!(!third.discarded_image());
    let mut backup = path.clone().into_os_string();
    backup.push(".corrupt");
    assert_eq!(std::fs::read(&backup).unwrap(), b"garbage");
    assert!(!SimFs::open_or_format(&path, geometry).unwrap().is_fresh());
    std::fs::remove_file(&path).unwrap();
    std::fs::remove_file(&backup).unwrap();
}
