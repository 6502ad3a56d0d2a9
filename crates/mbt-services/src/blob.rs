//! Transfer and block geometry shared by the BLOB client and server.

use mbt_core::wire::XferMode;
use mbt_core::Bitmap;
use serde::{Deserialize, Serialize};

/// Largest block size log the protocol allows.
pub const BLOCK_SIZE_LOG_MAX: u8 = 0x20;
/// Smallest block size log the protocol allows.
pub const BLOCK_SIZE_LOG_MIN: u8 = 0x06;
/// Smallest chunk any server must accept.
pub const CHUNK_SIZE_MIN: u16 = 8;

/// One BLOB transfer as agreed between client and server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlobXfer {
    pub id: u64,
    pub size: u32,
    pub mode: XferMode,
    pub block_size_log: u8,
    pub chunk_size: u16,
}

impl Default for BlobXfer {
    fn default() -> Self {
        Self { id: 0, size: 0, mode: XferMode::None, block_size_log: 0, chunk_size: 0 }
    }
}

impl BlobXfer {
    pub fn block_count(&self) -> u32 {
        block_count(self.size, self.block_size_log)
    }

    /// Block `idx` with chunk geometry derived from `chunk_size`. Nothing is
    /// marked missing.
    pub fn block(&self, idx: u16, chunk_size: u16) -> Block {
        let size = block_size(self.size, self.block_size_log, idx as u32);
        Block {
            number: idx,
            offset: ((idx as u64) << self.block_size_log) as u32,
            size,
            chunk_count: chunk_count(size, chunk_size).min(u16::MAX as u32) as u16,
            missing: Bitmap::new(chunk_count(size, chunk_size) as usize),
        }
    }
}

/// A block of the BLOB currently being moved.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Block {
    pub number: u16,
    /// Byte offset of the block inside the BLOB.
    pub offset: u32,
    pub size: u32,
    pub chunk_count: u16,
    pub missing: Bitmap,
}

impl Block {
    /// Size of chunk `idx`; the last chunk of a block may be short.
    pub fn chunk_size(&self, chunk_size: u16, idx: u16) -> u32 {
        let cs = chunk_size as u64;
        if (idx as u64 + 1) * cs <= self.size as u64 {
            chunk_size as u32
        } else {
            (self.size as u64 % cs.max(1)) as u32
        }
    }
}

pub fn block_count(size: u32, block_size_log: u8) -> u32 {
    if block_size_log >= BLOCK_SIZE_LOG_MAX {
        return 1;
    }
    (size as u64).div_ceil(1u64 << block_size_log) as u32
}

pub fn block_size(size: u32, block_size_log: u8, idx: u32) -> u32 {
    let full = 1u64 << block_size_log.min(BLOCK_SIZE_LOG_MAX);
    if (idx as u64 + 1) * full <= size as u64 {
        full as u32
    } else {
        (size as u64 % full) as u32
    }
}

pub fn chunk_count(block_size: u32, chunk_size: u16) -> u32 {
    if chunk_size == 0 {
        return 0;
    }
    block_size.div_ceil(chunk_size as u32)
}
