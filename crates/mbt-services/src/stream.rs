//! Storage behind a BLOB transfer.
//!
//! The client reads chunks from a stream, the server writes them. Offsets
//! passed to `read`/`write` are relative to the start of `block`.

use std::sync::{Arc, Mutex, MutexGuard};

use bytes::Bytes;

use crate::blob::{BlobXfer, Block};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoMode {
    Read,
    Write,
}

#[derive(Debug, thiserror::Error)]
pub enum StreamError {
    #[error("stream does not support {0}")]
    Unsupported(&'static str),
    #[error("range {offset}+{len} outside stream")]
    OutOfRange { offset: u64, len: usize },
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("rejected: {0}")]
    Rejected(String),
}

pub trait BlobStream: Send {
    fn open(&mut self, _xfer: &BlobXfer, _mode: IoMode) -> Result<(), StreamError> {
        Ok(())
    }

    fn close(&mut self, _xfer: &BlobXfer) {}

    fn block_start(&mut self, _xfer: &BlobXfer, _block: &Block) -> Result<(), StreamError> {
        Ok(())
    }

    fn block_end(&mut self, _xfer: &BlobXfer, _block: &Block) {}

    fn read(
        &mut self,
        _xfer: &BlobXfer,
        _block: &Block,
        _offset: u32,
        _len: u32,
    ) -> Result<Bytes, StreamError> {
        Err(StreamError::Unsupported("read"))
    }

    fn write(
        &mut self,
        _xfer: &BlobXfer,
        _block: &Block,
        _offset: u32,
        _data: &[u8],
    ) -> Result<(), StreamError> {
        Err(StreamError::Unsupported("write"))
    }
}

/// Counters kept by a [`MemoryStream`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StreamStats {
    pub opens: usize,
    pub closes: usize,
    pub blocks_started: usize,
    pub blocks_ended: usize,
    pub writes: usize,
}

#[derive(Debug, Default)]
struct MemoryInner {
    data: Vec<u8>,
    stats: StreamStats,
    fail_writes: bool,
}

/// In-memory stream. Clones share the same buffer, so a test or driver can
/// keep a handle and inspect what the state machine wrote.
#[derive(Debug, Clone, Default)]
pub struct MemoryStream {
    inner: Arc<Mutex<MemoryInner>>,
}

impl MemoryStream {
    /// A stream serving `data` to a client.
    pub fn from_bytes(data: impl Into<Vec<u8>>) -> Self {
        let stream = Self::default();
        stream.lock().data = data.into();
        stream
    }

    /// An empty stream for a server to fill.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contents(&self) -> Vec<u8> {
        self.lock().data.clone()
    }

    pub fn stats(&self) -> StreamStats {
        self.lock().stats.clone()
    }

    /// Make every subsequent write fail.
    pub fn set_fail_writes(&self, fail: bool) {
        self.lock().fail_writes = fail;
    }

    fn lock(&self) -> MutexGuard<'_, MemoryInner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl BlobStream for MemoryStream {
    fn open(&mut self, xfer: &BlobXfer, mode: IoMode) -> Result<(), StreamError> {
        let mut inner = self.lock();
        inner.stats.opens += 1;
        if mode == IoMode::Write && inner.data.len() < xfer.size as usize {
            inner.data.resize(xfer.size as usize, 0);
        }
        Ok(())
    }

    fn close(&mut self, _xfer: &BlobXfer) {
        self.lock().stats.closes += 1;
    }

    fn block_start(&mut self, _xfer: &BlobXfer, _block: &Block) -> Result<(), StreamError> {
        self.lock().stats.blocks_started += 1;
        Ok(())
    }

    fn block_end(&mut self, _xfer: &BlobXfer, _block: &Block) {
        self.lock().stats.blocks_ended += 1;
    }

    fn read(
        &mut self,
        _xfer: &BlobXfer,
        block: &Block,
        offset: u32,
        len: u32,
    ) -> Result<Bytes, StreamError> {
        let inner = self.lock();
        let start = block.offset as usize + offset as usize;
        let end = start + len as usize;
        if end > inner.data.len() {
            return Err(StreamError::OutOfRange { offset: start as u64, len: len as usize });
        }
        Ok(Bytes::copy_from_slice(&inner.data[start..end]))
    }

    fn write(
        &mut self,
        _xfer: &BlobXfer,
        block: &Block,
        offset: u32,
        data: &[u8],
    ) -> Result<(), StreamError> {
        let mut inner = self.lock();
        if inner.fail_writes {
            return Err(StreamError::Rejected("writes disabled".into()));
        }
        let start = block.offset as usize + offset as usize;
        let end = start + data.len();
        if inner.data.len() < end {
            inner.data.resize(end, 0);
        }
        inner.data[start..end].copy_from_slice(data);
        inner.stats.writes += 1;
        Ok(())
    }
}
