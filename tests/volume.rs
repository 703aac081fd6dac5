use simfs::container::{decode, encode, ImageFile};
use simfs::fs::inode::FileType;
use simfs::fs::session::Session;
use simfs::fs::{FSError, FileSystem, Geometry, Resource};

fn volume(block_count: u32, block_size: u32) -> FileSystem {
    FileSystem::format(Geometry {
        block_count,
        inode_count: 32,
        block_size,
    })
    .unwrap()
}

fn assert_same_volume(loaded: &FileSystem, original: &FileSystem) {
    assert_eq!(loaded.superblock(), original.superblock());
    assert_eq!(loaded.storage().bitmap(), original.storage().bitmap());
    let live: Vec<_> = original.inodes().iter().map(|inode| inode.id).collect();
    assert_eq!(
        loaded.inodes().iter().map(|inode| inode.id).collect::<Vec<_>>(),
        live
    );
    for id in live {
        let inode = original.stat(id).unwrap();
        assert_eq!(loaded.stat(id).unwrap(), inode);
        match inode.kind {
            FileType::File => assert_eq!(loaded.read_all(id).unwrap(), original.read_all(id).unwrap()),
            FileType::Directory => {
                assert_eq!(loaded.list_entries(id).unwrap(), original.list_entries(id).unwrap());
                assert_eq!(loaded.path_of(id).unwrap(), original.path_of(id).unwrap());
            }
            FileType::Symlink => assert_eq!(loaded.read_link(id).unwrap(), original.read_link(id).unwrap()),
        }
    }
}

#[test]
fn save_and_load_preserves_everything() {
    let mut fs = volume(128, 64);
    let root = fs.root();
    let docs = fs.make_directory(root, "docs", 0o755, 1000).unwrap();
    let notes = fs.create_file(docs, "notes.txt", 0o600, 1000).unwrap();
    let text: Vec<u8> = b"the quick brown fox ".repeat(20);
    fs.write(notes, 0, &text).unwrap();
    fs.hard_link(notes, root, "notes-link").unwrap();
    fs.create_symlink(root, "latest", "/docs/notes.txt", 1000).unwrap();

    // churn: things created, then partly undone
    let scratch = fs.make_directory(root, "scratch", 0o700, 0).unwrap();
    for index in 0..6 {
        let file = fs.create_file(scratch, &format!("tmp{index}"), 0o644, 0).unwrap();
        fs.write(file, 0, &vec![index as u8; 100 * index]).unwrap();
    }
    fs.remove_file(scratch, "tmp1").unwrap();
    fs.remove_file(scratch, "tmp4").unwrap();
    let tmp5 = fs.resolve(scratch, "tmp5").unwrap();
    fs.truncate(tmp5, 130).unwrap();
    fs.make_directory(scratch, "nested", 0o755, 0).unwrap();
    fs.create_file(root, "gone", 0o644, 0).unwrap();
    fs.remove_file(root, "gone").unwrap();
    fs.make_directory(docs, "old", 0o755, 0).unwrap();
    fs.remove_directory(docs, "old", false).unwrap();
    fs.remove_file(docs, "notes.txt").unwrap();
    fs.rename(root, "notes-link", docs, "notes.txt").unwrap();

    let path = std::env::temp_dir().join(format!("simfs-volume-{}.img", std::process::id()));
    let image = ImageFile::new(&path);
    image.save(&fs).unwrap();
    let loaded = image.load().unwrap();
    std::fs::remove_file(&path).unwrap();

    assert_same_volume(&loaded, &fs);
    assert_eq!(loaded.resolve_follow(root, "/latest").unwrap(), notes);
    assert_eq!(loaded.read_all(notes).unwrap(), text);
    assert!(loaded.resolve(root, "/scratch/tmp4").is_err());
    assert!(loaded.check().is_empty());
}

#[test]
fn encoded_image_is_stable() {
    let mut fs = volume(16, 32);
    let file = fs.create_file(fs.root(), "a", 0o644, 0).unwrap();
    fs.write(file, 0, b"abc").unwrap();
    let first = encode(&fs).unwrap();
    let second = encode(&decode(&first).unwrap()).unwrap();
    assert_eq!(first, second);
}

#[test]
fn equivalent_paths_resolve_alike() {
    let mut fs = volume(128, 64);
    let root = fs.root();
    let a = fs.make_directory(root, "a", 0o755, 0).unwrap();
    let b = fs.make_directory(a, "b", 0o755, 0).unwrap();
    fs.make_directory(b, "c", 0o755, 0).unwrap();
    let expected = fs.resolve(root, "/a/b/c").unwrap();
    for (start, path) in [
        (root, "a/b/c"),
        (a, "b/c"),
        (b, "c"),
        (b, "./c"),
        (b, "../b/c"),
        (b, "../../a/b/c"),
        (expected, "."),
        (expected, "/a/b/c/"),
    ] {
        assert_eq!(fs.resolve(start, path).unwrap(), expected, "{path}");
    }
    assert_eq!(fs.resolve(root, "..").unwrap(), root);
    assert_eq!(fs.path_of(root).unwrap(), "/");
    assert_eq!(fs.path_of(expected).unwrap(), "/a/b/c");
}

#[test]
fn link_counts_follow_entries() {
    let mut fs = volume(128, 64);
    let root = fs.root();
    let file = fs.create_file(root, "f", 0o644, 0).unwrap();
    assert_eq!(fs.stat(file).unwrap().link_count, 1);
    fs.hard_link(file, root, "g").unwrap();
    let dir = fs.make_directory(root, "d", 0o755, 0).unwrap();
    fs.hard_link(file, dir, "h").unwrap();
    assert_eq!(fs.stat(file).unwrap().link_count, 3);
    assert_eq!(fs.stat(root).unwrap().link_count, 3);
    fs.remove_file(root, "f").unwrap();
    fs.remove_directory(root, "d", true).unwrap();
    assert_eq!(fs.stat(file).unwrap().link_count, 1);
    assert_eq!(fs.stat(root).unwrap().link_count, 2);
    assert!(fs.check().is_empty());
}

#[test]
fn truncated_blocks_are_reused() {
    let mut fs = volume(64, 64);
    let root = fs.root();
    let file = fs.create_file(root, "big", 0o644, 0).unwrap();
    fs.write(file, 0, &[0xAB; 500]).unwrap();
    assert_eq!(fs.stat(file).unwrap().blocks.len(), 8);
    let free = fs.superblock().free_blocks;
    fs.truncate(file, 100).unwrap();
    assert_eq!(fs.stat(file).unwrap().size, 100);
    assert_eq!(fs.stat(file).unwrap().blocks.len(), 2);
    assert_eq!(fs.superblock().free_blocks, free + 6);

    let other = fs.create_file(root, "other", 0o644, 0).unwrap();
    fs.write(other, 0, &[0x11; 6 * 64]).unwrap();
    assert_eq!(fs.superblock().free_blocks, free);
    assert_eq!(fs.read_all(file).unwrap(), vec![0xAB; 100]);
    assert_eq!(fs.read_all(other).unwrap(), vec![0x11; 6 * 64]);
}

#[test]
fn exhaustion_leaves_volume_unchanged() {
    let mut fs = volume(4, 16);
    let root = fs.root();
    let file = fs.create_file(root, "f", 0o644, 0).unwrap();
    fs.write(file, 0, b"0123456789abcdef").unwrap();
    let before = fs.superblock();
    let inode = fs.stat(file).unwrap();
    assert!(matches!(
        fs.write(file, 16, &[0; 64]),
        Err(FSError::Exhausted(Resource::Blocks))
    ));
    assert_eq!(fs.superblock(), before);
    assert_eq!(fs.stat(file).unwrap().blocks, inode.blocks);
    assert_eq!(fs.read_all(file).unwrap(), b"0123456789abcdef");
}

#[test]
fn inode_exhaustion_is_reported() {
    let mut fs = FileSystem::format(Geometry {
        block_count: 64,
        inode_count: 3,
        block_size: 64,
    })
    .unwrap();
    let root = fs.root();
    fs.create_file(root, "a", 0o644, 0).unwrap();
    fs.create_file(root, "b", 0o644, 0).unwrap();
    assert!(matches!(
        fs.create_file(root, "c", 0o644, 0),
        Err(FSError::Exhausted(Resource::Inodes))
    ));
    assert!(matches!(fs.resolve(root, "c"), Err(FSError::PathNotFound { .. })));
}

#[test]
fn sessions_enforce_permissions() {
    let mut fs = volume(128, 64);
    let root = fs.root();
    let private = fs.make_directory(root, "private", 0o700, 1000).unwrap();
    let owner = Session::at_root(&fs, 1000);
    let stranger = Session::at_root(&fs, 1001);
    let dir = owner.resolve(&fs, "private").unwrap();
    assert_eq!(dir, private);
    owner
        .ensure_access(&fs, dir, simfs::fs::inode::Access::Write)
        .unwrap();
    assert!(matches!(
        stranger.ensure_access(&fs, dir, simfs::fs::inode::Access::Read),
        Err(FSError::PermissionDenied { .. })
    ));
}

#[test]
fn random_writes_match_a_flat_buffer() {
    use rand::Rng;
    let mut rng = rand::thread_rng();
    let mut fs = volume(256, 32);
    let file = fs.create_file(fs.root(), "scratch", 0o644, 0).unwrap();
    let mut model: Vec<u8> = Vec::new();
    for _ in 0..64 {
        let offset = rng.gen_range(0..2048usize);
        let mut data = vec![0u8; rng.gen_range(1..200usize)];
        rng.fill(&mut data[..]);
        fs.write(file, offset as u64, &data).unwrap();
        if model.len() < offset + data.len() {
            model.resize(offset + data.len(), 0);
        }
        model[offset..offset + data.len()].copy_from_slice(&data);
        if rng.gen_bool(0.1) {
            let size = rng.gen_range(0..=model.len());
            fs.truncate(file, size as u64).unwrap();
            model.truncate(size);
        }
    }
    assert_eq!(fs.read_all(file).unwrap(), model);
    assert!(fs.check().is_empty());
}
