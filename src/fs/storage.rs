//! This module implements the block store
//! on top of an underlying block device.
//! It tracks which blocks are owned by
//! an inode and hands out free ones.

use super::{BlockId, FSError, Result};
use thiserror::Error;
use tracing::{error, trace};

/// Trait that abstracts out a block device,
/// this crate only implements an in-memory backing,
/// though.
pub trait BlockIO {
    /// Error type returned from the IO methods
    type IoError: std::error::Error + Send + Sync + 'static;
    /// The total amount of blocks available
    /// to do IO
    fn block_count(&self) -> usize;
    /// The size of a single block. It is required
    /// all blocks are the same size.
    fn block_size(&self) -> usize;
    /// Read a single block at offset `block_number` (starting at 0),
    /// stores the block into the `block` argument (must be `block_size` long).
    fn read_block(&self, block_number: u64, block: &mut [u8])
        -> std::result::Result<(), Self::IoError>;
    /// Write a single `block` at offset `block_number` (starting at 0).
    /// The `block` argument must be `block_size` long.
    fn write_block(&mut self, block_number: u64, block: &[u8])
        -> std::result::Result<(), Self::IoError>;
}

#[derive(Error, Debug)]
pub enum MemoryDeviceError {
    #[error("block {0} is outside the device")]
    OutOfRange(u64),
    #[error("buffer of {0} bytes does not match the block size")]
    BadBuffer(usize),
}

/// A device that keeps every block in one contiguous buffer.
#[derive(Debug, Clone)]
pub struct MemoryDevice {
    block_size: usize,
    data: Vec<u8>,
}

impl MemoryDevice {
    pub fn new(block_size: usize, block_count: usize) -> Self {
        Self {
            block_size,
            data: vec![0; block_size * block_count],
        }
    }

    /// Wraps raw block contents, e.g. the data section of an image.
    /// `data` must hold a whole number of blocks.
    pub fn from_bytes(block_size: usize, data: Vec<u8>) -> Option<Self> {
        if block_size == 0 || data.len() % block_size != 0 {
            return None;
        }
        Some(Self { block_size, data })
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    fn range(&self, block_number: u64, len: usize) -> std::result::Result<std::ops::Range<usize>, MemoryDeviceError> {
        if len != self.block_size {
            return Err(MemoryDeviceError::BadBuffer(len));
        }
        if block_number >= self.block_count() as u64 {
            return Err(MemoryDeviceError::OutOfRange(block_number));
        }
        let start = block_number as usize * self.block_size;
        Ok(start..start + self.block_size)
    }
}

impl BlockIO for MemoryDevice {
    type IoError = MemoryDeviceError;

    fn block_count(&self) -> usize {
        self.data.len().checked_div(self.block_size).unwrap_or(0)
    }

    fn block_size(&self) -> usize {
        self.block_size
    }

    fn read_block(&self, block_number: u64, block: &mut [u8]) -> std::result::Result<(), MemoryDeviceError> {
        let range = self.range(block_number, block.len())?;
        block.copy_from_slice(&self.data[range]);
        Ok(())
    }

    fn write_block(&mut self, block_number: u64, block: &[u8]) -> std::result::Result<(), MemoryDeviceError> {
        let range = self.range(block_number, block.len())?;
        self.data[range].copy_from_slice(block);
        Ok(())
    }
}

fn device_error(err: impl std::error::Error + Send + Sync + 'static) -> FSError {
    FSError::Device(Box::new(err))
}

#[derive(Debug)]
pub struct Storage<Device: BlockIO> {
    device: Device,
    block_size: usize,
    block_count: usize,
    blocks_free: usize,
    allocated: Vec<bool>,
}

impl<Device: BlockIO> Storage<Device> {
    fn check_device(device: &Device) -> Result<()> {
        let block_size = device.block_size();
        if block_size < 16 || block_size % 16 != 0 {
            return Err(FSError::InvalidBlockSize);
        }
        let block_count = device.block_count();
        if block_count == 0 || block_count > u32::MAX as usize {
            return Err(FSError::InvalidGeometry);
        }
        Ok(())
    }

    /// Takes over `device` with every block free.
    pub fn format(device: Device) -> Result<Self> {
        Self::check_device(&device)?;
        let block_count = device.block_count();
        Ok(Self {
            block_size: device.block_size(),
            block_count,
            blocks_free: block_count,
            allocated: vec![false; block_count],
            device,
        })
    }

    /// Rebuilds the store from a device and its allocation bitmap.
    pub fn from_parts(device: Device, allocated: Vec<bool>) -> Result<Self> {
        Self::check_device(&device)?;
        let block_count = device.block_count();
        if allocated.len() != block_count {
            return Err(FSError::InvalidGeometry);
        }
        Ok(Self {
            block_size: device.block_size(),
            block_count,
            blocks_free: allocated.iter().filter(|used| !**used).count(),
            allocated,
            device,
        })
    }

    pub fn block_size(&self) -> usize {
        self.block_size
    }

    pub fn block_count(&self) -> usize {
        self.block_count
    }

    pub fn blocks_free(&self) -> usize {
        self.blocks_free
    }

    pub fn bitmap(&self) -> &[bool] {
        &self.allocated
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    pub fn is_allocated(&self, block: BlockId) -> bool {
        self.allocated.get(block as usize).copied().unwrap_or(false)
    }

    fn check_id(&self, block: BlockId) -> Result<u64> {
        if (block as usize) < self.block_count {
            Ok(block as u64)
        } else {
            Err(FSError::InvalidBlockId(block))
        }
    }

    /// First-fit allocation. The block is zeroed before it is handed out.
    pub fn allocate_block(&mut self) -> Result<BlockId> {
        let index = self
            .allocated
            .iter()
            .position(|used| !used)
            .ok_or(FSError::Exhausted(super::Resource::Blocks))?;
        let block = index as BlockId;
        self.device
            .write_block(block as u64, &vec![0; self.block_size])
            .map_err(device_error)?;
        self.allocated[index] = true;
        self.blocks_free -= 1;
        trace!("Allocated block {block}, {} left", self.blocks_free);
        Ok(block)
    }

    pub fn free_block(&mut self, block: BlockId) -> Result<()> {
        let index = self.check_id(block)? as usize;
        if !self.allocated[index] {
            error!("Block {block} freed while not allocated");
            debug_assert!(false, "block {block} freed while not allocated");
            return Ok(());
        }
        self.allocated[index] = false;
        self.blocks_free += 1;
        trace!("Freed block {block}, {} left", self.blocks_free);
        Ok(())
    }

    pub fn read_block(&self, block: BlockId) -> Result<Vec<u8>> {
        let mut buffer = vec![0; self.block_size];
        self.read_block_into(block, &mut buffer)?;
        Ok(buffer)
    }

    pub fn read_block_into(&self, block: BlockId, buffer: &mut [u8]) -> Result<()> {
        let number = self.check_id(block)?;
        if buffer.len() != self.block_size {
            return Err(FSError::BlockOverflow {
                len: buffer.len(),
                block_size: self.block_size,
            });
        }
        self.device.read_block(number, buffer).map_err(device_error)
    }

    /// Writes `data` at the start of the block, zero-filling the rest.
    pub fn write_block(&mut self, block: BlockId, data: &[u8]) -> Result<()> {
        let number = self.check_id(block)?;
        if data.len() > self.block_size {
            return Err(FSError::BlockOverflow {
                len: data.len(),
                block_size: self.block_size,
            });
        }
        if data.len() == self.block_size {
            return self.device.write_block(number, data).map_err(device_error);
        }
        let mut buffer = vec![0; self.block_size];
        buffer[..data.len()].copy_from_slice(data);
        self.device.write_block(number, &buffer).map_err(device_error)
    }
}

#[cfg(test)]
fn small_store(block_count: usize) -> Storage<MemoryDevice> {
    Storage::format(MemoryDevice::new(32, block_count)).unwrap()
}

#[test]
fn test_allocate_until_exhausted() {
    let mut storage = small_store(3);
    assert_eq!(storage.allocate_block().unwrap(), 0);
    assert_eq!(storage.allocate_block().unwrap(), 1);
    assert_eq!(storage.allocate_block().unwrap(), 2);
    assert!(matches!(
        storage.allocate_block(),
        Err(FSError::Exhausted(super::Resource::Blocks))
    ));
    storage.free_block(1).unwrap();
    assert_eq!(storage.blocks_free(), 1);
    assert_eq!(storage.allocate_block().unwrap(), 1);
}

#[test]
fn test_allocation_zeroes_block() {
    let mut storage = small_store(2);
    let block = storage.allocate_block().unwrap();
    storage.write_block(block, &[0xAB; 32]).unwrap();
    storage.free_block(block).unwrap();
    let again = storage.allocate_block().unwrap();
    assert_eq!(again, block);
    assert_eq!(storage.read_block(again).unwrap(), vec![0; 32]);
}

#[test]
fn test_short_write_is_padded() {
    let mut storage = small_store(1);
    let block = storage.allocate_block().unwrap();
    storage.write_block(block, &[0xFF; 32]).unwrap();
    storage.write_block(block, b"abc").unwrap();
    let data = storage.read_block(block).unwrap();
    assert_eq!(&data[..3], b"abc");
    assert!(data[3..].iter().all(|b| *b == 0));
    assert!(matches!(
        storage.write_block(block, &[0; 33]),
        Err(FSError::BlockOverflow { len: 33, .. })
    ));
}

#[test]
fn test_out_of_range_block() {
    let mut storage = small_store(2);
    assert!(matches!(storage.read_block(2), Err(FSError::InvalidBlockId(2))));
    assert!(matches!(
        storage.write_block(7, b"x"),
        Err(FSError::InvalidBlockId(7))
    ));
    assert!(matches!(storage.free_block(9), Err(FSError::InvalidBlockId(9))));
}

#[test]
fn test_rejects_bad_block_size() {
    assert!(matches!(
        Storage::format(MemoryDevice::new(20, 4)),
        Err(FSError::InvalidBlockSize)
    ));
}
