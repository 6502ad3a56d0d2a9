//! Block and chunk bitmaps, plus the variable-length chunk index codec used by
//! Block-Status and Partial Block Report messages.
//!
//! Bit `i` lives in byte `i / 8` at position `i % 8` (LSB first), which is the
//! on-air layout of every bitmap in the BLOB Transfer protocol.

use bytes::BufMut;
use serde::{Deserialize, Serialize};

use crate::wire::WireError;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Bitmap {
    len: usize,
    bits: Vec<u8>,
}

impl Bitmap {
    /// A bitmap of `len` bits, all clear.
    pub fn new(len: usize) -> Self {
        Self { len, bits: vec![0; len.div_ceil(8)] }
    }

    /// A bitmap of `len` bits, all set.
    pub fn filled(len: usize) -> Self {
        let mut map = Self::new(len);
        map.set_all();
        map
    }

    /// Build from on-air bytes. Bits past `len` are dropped; missing bytes are clear.
    pub fn from_bytes(len: usize, bytes: &[u8]) -> Self {
        let mut map = Self::new(len);
        let n = bytes.len().min(map.bits.len());
        map.bits[..n].copy_from_slice(&bytes[..n]);
        map.mask_tail();
        map
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Out-of-range indices read as clear.
    pub fn get(&self, idx: usize) -> bool {
        idx < self.len && self.bits[idx / 8] & (1 << (idx % 8)) != 0
    }

    /// Out-of-range indices are ignored.
    pub fn set(&mut self, idx: usize, value: bool) {
        if idx >= self.len {
            return;
        }
        let mask = 1u8 << (idx % 8);
        if value {
            self.bits[idx / 8] |= mask;
        } else {
            self.bits[idx / 8] &= !mask;
        }
    }

    pub fn set_all(&mut self) {
        self.bits.fill(0xff);
        self.mask_tail();
    }

    pub fn clear_all(&mut self) {
        self.bits.fill(0);
    }

    pub fn count_set(&self) -> usize {
        self.bits.iter().map(|b| b.count_ones() as usize).sum()
    }

    pub fn any(&self) -> bool {
        self.bits.iter().any(|b| *b != 0)
    }

    /// First set bit at or after `from`.
    pub fn next_set(&self, from: usize) -> Option<usize> {
        (from..self.len).find(|&i| self.get(i))
    }

    pub fn iter_set(&self) -> impl Iterator<Item = usize> + '_ {
        (0..self.len).filter(move |&i| self.get(i))
    }

    /// OR `other` into `self`. Bits past `self.len()` are ignored.
    pub fn union_with(&mut self, other: &Bitmap) {
        for (a, b) in self.bits.iter_mut().zip(other.bits.iter()) {
            *a |= *b;
        }
        self.mask_tail();
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bits
    }

    fn mask_tail(&mut self) {
        let rem = self.len % 8;
        if rem != 0 {
            if let Some(last) = self.bits.last_mut() {
                *last &= (1u8 << rem) - 1;
            }
        }
    }
}

// ── Chunk index codec ─────────────────────────────────────────────────────────
//
// UTF-8 style: 1 byte below 0x80, 2 bytes below 0x800, 3 bytes otherwise.

/// Encoded size of a chunk index.
pub fn chunk_index_len(idx: u16) -> usize {
    match idx {
        0..=0x7f => 1,
        0x80..=0x7ff => 2,
        _ => 3,
    }
}

pub fn encode_chunk_index(idx: u16, out: &mut impl BufMut) {
    match idx {
        0..=0x7f => out.put_u8(idx as u8),
        0x80..=0x7ff => {
            out.put_u8(0xc0 | (idx >> 6) as u8);
            out.put_u8(0x80 | (idx & 0x3f) as u8);
        }
        _ => {
            out.put_u8(0xe0 | (idx >> 12) as u8);
            out.put_u8(0x80 | ((idx >> 6) & 0x3f) as u8);
            out.put_u8(0x80 | (idx & 0x3f) as u8);
        }
    }
}

fn continuation(byte: Option<&u8>) -> Result<u16, WireError> {
    match byte {
        Some(b) if b & 0xc0 == 0x80 => Ok((b & 0x3f) as u16),
        _ => Err(WireError::InvalidEncoding),
    }
}

/// Decode one chunk index, advancing `buf` past it.
pub fn decode_chunk_index(buf: &mut &[u8]) -> Result<u16, WireError> {
    let first = *buf.first().ok_or(WireError::InvalidEncoding)?;
    let (value, used) = if first & 0x80 == 0 {
        (first as u16, 1)
    } else if first & 0xe0 == 0xc0 {
        (((first & 0x1f) as u16) << 6 | continuation(buf.get(1))?, 2)
    } else if first & 0xf0 == 0xe0 {
        let mid = continuation(buf.get(1))?;
        let low = continuation(buf.get(2))?;
        (((first & 0x0f) as u16) << 12 | mid << 6 | low, 3)
    } else {
        return Err(WireError::InvalidEncoding);
    };
    *buf = &buf[used..];
    Ok(value)
}

/// Decode a whole run of chunk indices.
pub fn decode_chunk_indices(mut bytes: &[u8]) -> Result<Vec<u16>, WireError> {
    let mut out = Vec::new();
    while !bytes.is_empty() {
        out.push(decode_chunk_index(&mut bytes)?);
    }
    Ok(out)
}
