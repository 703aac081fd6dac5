use packed_struct::prelude::*;
use tracing::{debug, trace};

use crate::fs::inode::{Inode, InodeTable};
use crate::fs::storage::{BlockIO, MemoryDevice, Storage};
use crate::fs::{FSError, FileSystem, Geometry, Result, Superblock};

#[derive(PrimitiveEnum_u32, Clone, Copy, PartialEq, Debug)]
pub enum RecordTag {
    Superblock = 0x5355_5042,
    InodeTable = 0x494E_4F44,
    BlockBitmap = 0x424D_4150,
    BlockData = 0x4441_5441,
}

#[derive(PackedStruct, Debug)]
#[packed_struct(endian = "lsb")]
pub struct ImageHeader {
    /// Magic string "SIMFSIMG"
    pub magic: [u8; 8],
    /// Bumped whenever the record layout changes
    pub version: u32,
}

impl ImageHeader {
    pub const SIZE: usize = 12;
    pub const MAGIC: &'static [u8; 8] = b"SIMFSIMG";
    pub const VERSION: u32 = 1;

    pub fn current() -> Self {
        Self {
            magic: *Self::MAGIC,
            version: Self::VERSION,
        }
    }
}

/// Precedes every record; `length` counts the payload bytes that follow.
#[derive(PackedStruct, Debug)]
#[packed_struct(endian = "lsb")]
pub struct RecordHeader {
    /// A [`RecordTag`]
    pub tag: u32,
    pub length: u64,
}

impl RecordHeader {
    pub const SIZE: usize = 12;
}

fn corrupt(reason: impl Into<String>) -> FSError {
    FSError::CorruptImage(reason.into())
}

fn push_record(out: &mut Vec<u8>, tag: RecordTag, payload: &[u8]) -> Result<()> {
    let header = RecordHeader {
        tag: tag.to_primitive(),
        length: payload.len() as u64,
    }
    .pack()
    .map_err(|err| FSError::Encode(format!("{err:?}")))?;
    out.extend_from_slice(&header);
    out.extend_from_slice(payload);
    trace!("Encoded {tag:?} record of {} bytes", payload.len());
    Ok(())
}

/// Packs one bit per block, least significant bit first.
pub fn pack_bitmap(bits: &[bool]) -> Vec<u8> {
    let mut out = vec![0u8; bits.len().div_ceil(8)];
    for (index, _) in bits.iter().enumerate().filter(|(_, used)| **used) {
        out[index / 8] |= 1 << (index % 8);
    }
    out
}

pub fn unpack_bitmap(bytes: &[u8], count: usize) -> Option<Vec<bool>> {
    if bytes.len() != count.div_ceil(8) {
        return None;
    }
    let bits: Vec<bool> = (0..count)
        .map(|index| bytes[index / 8] & (1 << (index % 8)) != 0)
        .collect();
    // padding bits past the last block must stay clear
    let padding = (count..bytes.len() * 8).any(|index| bytes[index / 8] & (1 << (index % 8)) != 0);
    (!padding).then_some(bits)
}

/// Serializes the whole volume: superblock, inode table, block bitmap and
/// every block, each as a tagged record behind the image header.
pub fn encode<Device: BlockIO>(fs: &FileSystem<Device>) -> Result<Vec<u8>> {
    let storage = fs.storage();
    let mut out = Vec::with_capacity(
        ImageHeader::SIZE + storage.block_count() * storage.block_size() + 4 * RecordHeader::SIZE,
    );
    let header = ImageHeader::current()
        .pack()
        .map_err(|err| FSError::Encode(format!("{err:?}")))?;
    out.extend_from_slice(&header);

    let superblock = fs
        .superblock()
        .pack()
        .map_err(|err| FSError::Encode(format!("{err:?}")))?;
    push_record(&mut out, RecordTag::Superblock, &superblock)?;

    let table = bincode::serialize(fs.inodes().slots()).map_err(|err| FSError::Encode(err.to_string()))?;
    push_record(&mut out, RecordTag::InodeTable, &table)?;

    push_record(&mut out, RecordTag::BlockBitmap, &pack_bitmap(storage.bitmap()))?;

    let mut data = Vec::with_capacity(storage.block_count() * storage.block_size());
    let mut buffer = vec![0; storage.block_size()];
    for block in 0..storage.block_count() {
        storage.read_block_into(block as u32, &mut buffer)?;
        data.extend_from_slice(&buffer);
    }
    push_record(&mut out, RecordTag::BlockData, &data)?;
    debug!("Encoded image of {} bytes", out.len());
    Ok(out)
}

struct Reader<'a> {
    bytes: &'a [u8],
}

impl<'a> Reader<'a> {
    fn take(&mut self, len: usize, what: &str) -> Result<&'a [u8]> {
        if self.bytes.len() < len {
            return Err(corrupt(format!(
                "truncated {what}: need {len} bytes, {} left",
                self.bytes.len()
            )));
        }
        let (head, rest) = self.bytes.split_at(len);
        self.bytes = rest;
        Ok(head)
    }
}

#[derive(Default)]
struct Records<'a> {
    superblock: Option<&'a [u8]>,
    inode_table: Option<&'a [u8]>,
    block_bitmap: Option<&'a [u8]>,
    block_data: Option<&'a [u8]>,
}

fn read_records(bytes: &[u8]) -> Result<Records<'_>> {
    let mut reader = Reader { bytes };
    let header = ImageHeader::unpack_from_slice(reader.take(ImageHeader::SIZE, "image header")?)
        .map_err(|err| corrupt(format!("bad image header: {err:?}")))?;
    if &header.magic != ImageHeader::MAGIC {
        return Err(corrupt("bad magic"));
    }
    if header.version != ImageHeader::VERSION {
        return Err(corrupt(format!(
            "unsupported version {} (expected {})",
            header.version,
            ImageHeader::VERSION
        )));
    }
    let mut records = Records::default();
    while !reader.bytes.is_empty() {
        let record = RecordHeader::unpack_from_slice(reader.take(RecordHeader::SIZE, "record header")?)
            .map_err(|err| corrupt(format!("bad record header: {err:?}")))?;
        let tag = RecordTag::from_primitive(record.tag)
            .ok_or_else(|| corrupt(format!("unknown record tag {:#010x}", record.tag)))?;
        let length = usize::try_from(record.length)
            .map_err(|_| corrupt(format!("{tag:?} record is too long")))?;
        let payload = reader.take(length, "record payload")?;
        let slot = match tag {
            RecordTag::Superblock => &mut records.superblock,
            RecordTag::InodeTable => &mut records.inode_table,
            RecordTag::BlockBitmap => &mut records.block_bitmap,
            RecordTag::BlockData => &mut records.block_data,
        };
        if slot.replace(payload).is_some() {
            return Err(corrupt(format!("duplicate {tag:?} record")));
        }
    }
    Ok(records)
}

/// Rebuilds a volume from [`encode`]d bytes. Nothing is handed out unless
/// every record is present and they all agree with each other.
pub fn decode(bytes: &[u8]) -> Result<FileSystem> {
    let records = read_records(bytes)?;
    let missing = |tag: RecordTag| corrupt(format!("missing {tag:?} record"));

    let superblock = records.superblock.ok_or_else(|| missing(RecordTag::Superblock))?;
    if superblock.len() != Superblock::SIZE {
        return Err(corrupt("superblock record has the wrong length"));
    }
    let superblock = Superblock::unpack_from_slice(superblock)
        .map_err(|err| corrupt(format!("bad superblock: {err:?}")))?;
    Geometry {
        block_count: superblock.block_count,
        inode_count: superblock.inode_count,
        block_size: superblock.block_size,
    }
    .validate()
    .map_err(|err| corrupt(format!("bad geometry: {err}")))?;
    let block_count = superblock.block_count as usize;
    let block_size = superblock.block_size as usize;

    let table = records.inode_table.ok_or_else(|| missing(RecordTag::InodeTable))?;
    let slots: Vec<Option<Inode>> =
        bincode::deserialize(table).map_err(|err| corrupt(format!("bad inode table: {err}")))?;
    if slots.len() != superblock.inode_count as usize {
        return Err(corrupt(format!(
            "inode table holds {} slots, superblock says {}",
            slots.len(),
            superblock.inode_count
        )));
    }
    let inodes = InodeTable::from_slots(slots);

    let bitmap = records.block_bitmap.ok_or_else(|| missing(RecordTag::BlockBitmap))?;
    let bitmap = unpack_bitmap(bitmap, block_count).ok_or_else(|| corrupt("bad block bitmap"))?;

    let data = records.block_data.ok_or_else(|| missing(RecordTag::BlockData))?;
    if data.len() != block_count * block_size {
        return Err(corrupt(format!(
            "block data holds {} bytes, expected {}",
            data.len(),
            block_count * block_size
        )));
    }
    let device = MemoryDevice::from_bytes(block_size, data.to_vec())
        .ok_or_else(|| corrupt("block data is not a whole number of blocks"))?;
    let storage = Storage::from_parts(device, bitmap)?;

    if storage.blocks_free() != superblock.free_blocks as usize {
        return Err(corrupt(format!(
            "superblock records {} free blocks, the bitmap has {}",
            superblock.free_blocks,
            storage.blocks_free()
        )));
    }
    if inodes.inodes_free() != superblock.free_inodes as usize {
        return Err(corrupt(format!(
            "superblock records {} free inodes, the table has {}",
            superblock.free_inodes,
            inodes.inodes_free()
        )));
    }

    let fs = FileSystem::from_parts(storage, inodes, superblock.root_inode);
    if let Some(problem) = fs.check().into_iter().next() {
        return Err(corrupt(problem.to_string()));
    }
    debug!(
        "Decoded image: {} blocks, {} inodes in use",
        block_count,
        fs.usage().inodes.used()
    );
    Ok(fs)
}

#[cfg(test)]
fn sample() -> FileSystem {
    let mut fs = FileSystem::format(Geometry {
        block_count: 32,
        inode_count: 8,
        block_size: 32,
    })
    .unwrap();
    let root = fs.root();
    let dir = fs.make_directory(root, "dir", 0o755, 0).unwrap();
    let file = fs.create_file(dir, "data.bin", 0o600, 1000).unwrap();
    fs.write(file, 0, &[0x5A; 100]).unwrap();
    fs
}

#[test]
fn test_bitmap_layout() {
    use hex_literal::hex;
    let bits = [true, false, true, false, false, false, false, false, true, true];
    assert_eq!(pack_bitmap(&bits), hex!("05 03"));
    assert_eq!(unpack_bitmap(&hex!("05 03"), 10).unwrap(), bits);
    assert!(unpack_bitmap(&hex!("05 07"), 10).is_none());
    assert!(unpack_bitmap(&hex!("05"), 10).is_none());
}

#[test]
fn test_roundtrip() {
    let fs = sample();
    let image = encode(&fs).unwrap();
    let loaded = decode(&image).unwrap();
    assert_eq!(loaded.superblock(), fs.superblock());
    let file = loaded.resolve(loaded.root(), "/dir/data.bin").unwrap();
    assert_eq!(loaded.read_all(file).unwrap(), vec![0x5A; 100]);
    assert_eq!(loaded.stat(file).unwrap(), fs.stat(file).unwrap());
}

#[test]
fn test_rejects_truncated_image() {
    let image = encode(&sample()).unwrap();
    for len in [0, 5, ImageHeader::SIZE + 3, image.len() - 1] {
        assert!(matches!(decode(&image[..len]), Err(FSError::CorruptImage(_))));
    }
}

#[test]
fn test_rejects_bad_magic() {
    let mut image = encode(&sample()).unwrap();
    image[0] ^= 0xFF;
    assert!(matches!(decode(&image), Err(FSError::CorruptImage(_))));
}

#[test]
fn test_rejects_count_mismatch() {
    let fs = sample();
    let mut superblock = fs.superblock();
    superblock.free_blocks += 1;
    let mut image = encode(&fs).unwrap();
    let offset = ImageHeader::SIZE + RecordHeader::SIZE;
    image[offset..offset + Superblock::SIZE].copy_from_slice(&superblock.pack().unwrap());
    match decode(&image) {
        Err(FSError::CorruptImage(reason)) => assert!(reason.contains("free blocks")),
        other => panic!("unexpected {other:?}"),
    }
}

#[test]
fn test_rejects_missing_record() {
    let image = encode(&sample()).unwrap();
    // drop the trailing block data record
    let storage_len = 32 * 32;
    let cut = image.len() - storage_len - RecordHeader::SIZE;
    match decode(&image[..cut]) {
        Err(FSError::CorruptImage(reason)) => assert!(reason.contains("BlockData")),
        other => panic!("unexpected {other:?}"),
    }
}

#[test]
fn test_rejects_broken_parent_entry() {
    let mut fs = sample();
    let dir = fs.resolve(fs.root(), "/dir").unwrap();
    let file = fs.resolve(fs.root(), "/dir/data.bin").unwrap();
    fs.retarget_entry(dir, crate::fs::directory::DOTDOT, file).unwrap();
    match decode(&encode(&fs).unwrap()) {
        Err(FSError::CorruptImage(reason)) => assert!(reason.contains("..")),
        other => panic!("unexpected {other:?}"),
    }
}
