//! Firmware images for the simulation.
//!
//! The distributor serves its image straight out of a memory map. The
//! metadata sent with Update Start names the new firmware ID and carries a
//! BLAKE3 digest the targets verify the received image against.

use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use bytes::{BufMut, Bytes, BytesMut};
use memmap2::Mmap;
use rand::RngCore;

use mbt_core::config::SimConfig;
use mbt_services::blob::{BlobXfer, Block};
use mbt_services::stream::{BlobStream, StreamError};

const DIGEST_LEN: usize = 32;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum MetaError {
    #[error("metadata truncated: {0} bytes")]
    Truncated(usize),
    #[error("firmware ID too long: {0} bytes")]
    FwidTooLong(usize),
}

/// Update metadata as understood by the simulated targets.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageMeta {
    pub size: u32,
    pub digest: [u8; DIGEST_LEN],
    pub fwid: Bytes,
}

impl ImageMeta {
    pub fn for_image(data: &[u8], fwid: Bytes) -> Self {
        Self { size: data.len() as u32, digest: *blake3::hash(data).as_bytes(), fwid }
    }

    /// `size (u32 LE) | digest | fwid`
    pub fn encode(&self) -> Result<Bytes, MetaError> {
        if 4 + DIGEST_LEN + self.fwid.len() > 255 {
            return Err(MetaError::FwidTooLong(self.fwid.len()));
        }
        let mut buf = BytesMut::with_capacity(4 + DIGEST_LEN + self.fwid.len());
        buf.put_u32_le(self.size);
        buf.put_slice(&self.digest);
        buf.put_slice(&self.fwid);
        Ok(buf.freeze())
    }

    pub fn decode(data: &[u8]) -> Result<Self, MetaError> {
        if data.len() < 4 + DIGEST_LEN {
            return Err(MetaError::Truncated(data.len()));
        }
        let size = u32::from_le_bytes([data[0], data[1], data[2], data[3]]);
        let mut digest = [0u8; DIGEST_LEN];
        digest.copy_from_slice(&data[4..4 + DIGEST_LEN]);
        Ok(Self { size, digest, fwid: Bytes::copy_from_slice(&data[4 + DIGEST_LEN..]) })
    }

    /// Does `data` hold exactly the image described?
    pub fn matches(&self, data: &[u8]) -> bool {
        data.len() >= self.size as usize && blake3::hash(&data[..self.size as usize]).as_bytes() == &self.digest
    }
}

/// Firmware ID the distributed image is known by.
pub fn fwid_for(data: &[u8]) -> Bytes {
    let hash = blake3::hash(data);
    Bytes::from(format!("sim-{}", &hash.to_hex()[..12]))
}

/// Resolve the image to distribute. Without a configured path a random
/// image of `image_size` bytes is written below the state directory.
pub fn prepare(sim: &SimConfig) -> Result<PathBuf> {
    if !sim.image_path.as_os_str().is_empty() {
        return Ok(sim.image_path.clone());
    }
    std::fs::create_dir_all(&sim.state_dir)
        .with_context(|| format!("failed to create {}", sim.state_dir.display()))?;
    let path = sim.state_dir.join("image.bin");
    let mut data = vec![0u8; sim.image_size as usize];
    rand::thread_rng().fill_bytes(&mut data);
    std::fs::write(&path, &data).with_context(|| format!("failed to write {}", path.display()))?;
    tracing::info!(path = %path.display(), size = data.len(), "generated firmware image");
    Ok(path)
}

/// Read-only image backed by a memory map.
#[derive(Clone)]
pub struct MmapStream {
    map: Arc<Mmap>,
}

impl MmapStream {
    pub fn open(path: &Path) -> Result<Self> {
        let file = File::open(path).with_context(|| format!("failed to open image: {}", path.display()))?;
        // SAFETY: the image is not modified while the simulation runs.
        let map = unsafe { Mmap::map(&file) }
            .with_context(|| format!("failed to mmap image: {}", path.display()))?;
        Ok(Self { map: Arc::new(map) })
    }

    pub fn bytes(&self) -> &[u8] {
        &self.map
    }
}

impl BlobStream for MmapStream {
    fn read(&mut self, _xfer: &BlobXfer, block: &Block, offset: u32, len: u32) -> Result<Bytes, StreamError> {
        let start = block.offset as usize + offset as usize;
        let end = start + len as usize;
        self.map
            .get(start..end)
            .map(Bytes::copy_from_slice)
            .ok_or(StreamError::OutOfRange { offset: start as u64, len: len as usize })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mbt_core::wire::XferMode;

    #[test]
    fn meta_survives_encoding() {
        let data = vec![7u8; 1000];
        let meta = ImageMeta::for_image(&data, fwid_for(&data));
        let decoded = ImageMeta::decode(&meta.encode().unwrap()).unwrap();
        assert_eq!(decoded, meta);
        assert!(decoded.matches(&data));

        let mut corrupt = data.clone();
        corrupt[500] ^= 1;
        assert!(!decoded.matches(&corrupt));
        assert!(!decoded.matches(&data[..999]));
    }

    #[test]
    fn meta_rejects_short_input() {
        assert_eq!(ImageMeta::decode(&[0; 10]), Err(MetaError::Truncated(10)));
        let meta = ImageMeta { size: 1, digest: [0; 32], fwid: Bytes::from(vec![b'x'; 220]) };
        assert_eq!(meta.encode(), Err(MetaError::FwidTooLong(220)));
    }

    #[test]
    fn mmap_stream_reads_chunks() {
        let dir = std::env::temp_dir().join(format!("mbtd-image-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("image.bin");
        let data: Vec<u8> = (0..=255u8).cycle().take(1024).collect();
        std::fs::write(&path, &data).unwrap();

        let mut stream = MmapStream::open(&path).unwrap();
        let xfer = BlobXfer { id: 1, size: 1024, mode: XferMode::Push, block_size_log: 9, chunk_size: 100 };
        let block = xfer.block(1, 100);
        let chunk = stream.read(&xfer, &block, 100, 100).unwrap();
        assert_eq!(&chunk[..], &data[612..712]);
        assert!(stream.read(&xfer, &block, 500, 100).is_err());

        std::fs::remove_dir_all(&dir).ok();
    }
}
