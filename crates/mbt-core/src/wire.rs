//! mbt wire format — opcodes, status codes and message bodies for the BLOB
//! Transfer and Firmware Update models.
//!
//! Every multi-byte field is little-endian. Opcodes are big-endian and take
//! one byte for the `0x00..=0x7e` range or two bytes for the `0x80xx` range.
//! Fixed-size bodies are zerocopy structs so their layout is checked at
//! compile time; variable tails are handled with `bytes`.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use static_assertions::assert_eq_size;
use zerocopy::byteorder::{LittleEndian, U16, U32, U64};
use zerocopy::{AsBytes, FromBytes, FromZeroes};

use crate::bitmap::{decode_chunk_indices, encode_chunk_index};

// ── Addressing ────────────────────────────────────────────────────────────────

/// 16-bit mesh element or group address.
pub type Address = u16;

/// The unassigned address. A group address of this value means "send unicast".
pub const ADDR_UNASSIGNED: Address = 0x0000;

/// Group addresses occupy the top quarter of the address space.
pub fn is_group(addr: Address) -> bool {
    addr >= 0xc000
}

// ── Opcodes ───────────────────────────────────────────────────────────────────

pub type Opcode = u16;

pub mod op {
    use super::Opcode;

    pub const BLOB_XFER_GET: Opcode = 0x8300;
    pub const BLOB_XFER_START: Opcode = 0x8301;
    pub const BLOB_XFER_CANCEL: Opcode = 0x8302;
    pub const BLOB_XFER_STATUS: Opcode = 0x8303;
    pub const BLOB_BLOCK_GET: Opcode = 0x8305;
    pub const BLOB_BLOCK_START: Opcode = 0x8306;
    pub const BLOB_INFO_GET: Opcode = 0x830a;
    pub const BLOB_INFO_STATUS: Opcode = 0x830b;
    pub const BLOB_CHUNK: Opcode = 0x0066;
    pub const BLOB_BLOCK_STATUS: Opcode = 0x0067;
    pub const BLOB_BLOCK_REPORT: Opcode = 0x0068;

    pub const DFU_INFO_GET: Opcode = 0x8308;
    pub const DFU_INFO_STATUS: Opcode = 0x8309;
    pub const DFU_METADATA_CHECK: Opcode = 0x830c;
    pub const DFU_METADATA_STATUS: Opcode = 0x830d;
    pub const DFU_UPDATE_GET: Opcode = 0x830e;
    pub const DFU_UPDATE_START: Opcode = 0x830f;
    pub const DFU_UPDATE_CANCEL: Opcode = 0x8310;
    pub const DFU_UPDATE_APPLY: Opcode = 0x8311;
    pub const DFU_UPDATE_STATUS: Opcode = 0x8312;
}

/// Bytes needed to carry an opcode.
pub fn opcode_len(opcode: Opcode) -> usize {
    if opcode < 0x7f {
        1
    } else {
        2
    }
}

fn put_opcode(buf: &mut BytesMut, opcode: Opcode) {
    if opcode < 0x7f {
        buf.put_u8(opcode as u8);
    } else {
        buf.put_u16(opcode);
    }
}

fn take_opcode(buf: &mut &[u8]) -> Result<Opcode, WireError> {
    need(buf, 1)?;
    let first = buf[0];
    if first == 0x7f {
        return Err(WireError::UnknownOpcode(first as Opcode));
    }
    if first & 0x80 == 0 {
        buf.advance(1);
        return Ok(first as Opcode);
    }
    if first & 0xc0 != 0x80 {
        // Three-byte vendor opcodes are not spoken here.
        return Err(WireError::UnknownOpcode(first as Opcode));
    }
    need(buf, 2)?;
    Ok(buf.get_u16())
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WireError {
    #[error("message truncated: need {need} bytes, have {have}")]
    Truncated { need: usize, have: usize },
    #[error("invalid chunk index encoding")]
    InvalidEncoding,
    #[error("unknown opcode 0x{0:04x}")]
    UnknownOpcode(Opcode),
    #[error("unknown {kind} value {value}")]
    UnknownValue { kind: &'static str, value: u8 },
    #[error("{0} bytes of trailing data")]
    Trailing(usize),
    #[error("field too long: {0} bytes")]
    TooLong(usize),
}

fn need(buf: &[u8], n: usize) -> Result<(), WireError> {
    if buf.len() < n {
        Err(WireError::Truncated { need: n, have: buf.len() })
    } else {
        Ok(())
    }
}

fn done(buf: &[u8]) -> Result<(), WireError> {
    if buf.is_empty() {
        Ok(())
    } else {
        Err(WireError::Trailing(buf.len()))
    }
}

// ── Enumerations ──────────────────────────────────────────────────────────────

macro_rules! wire_enum {
    ($(#[$meta:meta])* $name:ident { $($(#[$vmeta:meta])* $variant:ident = $value:expr),+ $(,)? }) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
        #[repr(u8)]
        pub enum $name {
            $($(#[$vmeta])* $variant = $value),+
        }

        impl TryFrom<u8> for $name {
            type Error = WireError;

            fn try_from(value: u8) -> Result<Self, Self::Error> {
                match value {
                    $(v if v == $value => Ok($name::$variant),)+
                    other => Err(WireError::UnknownValue { kind: stringify!($name), value: other }),
                }
            }
        }

        impl From<$name> for u8 {
            fn from(v: $name) -> u8 {
                v as u8
            }
        }
    };
}

wire_enum! {
    /// BLOB transfer mode. Capability fields carry a bitmask of these.
    XferMode {
        None = 0x00,
        Push = 0x01,
        Pull = 0x02,
    }
}

/// Bitmask advertising both transfer modes.
pub const MODES_ALL: u8 = 0x03;

impl XferMode {
    /// True if this mode's bit is present in `modes`.
    pub fn is_in(self, modes: u8) -> bool {
        self != XferMode::None && modes & (self as u8) != 0
    }
}

wire_enum! {
    /// Phase of a BLOB Transfer Server.
    XferPhase {
        Inactive = 0,
        WaitingForStart = 1,
        WaitingForBlock = 2,
        WaitingForChunk = 3,
        Complete = 4,
        Suspended = 5,
    }
}

wire_enum! {
    /// Status codes carried by BLOB Transfer responses.
    BlobStatus {
        Success = 0,
        InvalidBlockNum = 1,
        InvalidBlockSize = 2,
        InvalidChunkSize = 3,
        WrongPhase = 4,
        InvalidParam = 5,
        WrongBlobId = 6,
        BlobTooLarge = 7,
        UnsupportedMode = 8,
        Internal = 9,
        InfoUnavailable = 10,
    }
}

wire_enum! {
    /// Format of the missing-chunks field in a Block-Status.
    MissingFormat {
        All = 0,
        None = 1,
        Some = 2,
        Encoded = 3,
    }
}

wire_enum! {
    /// Status codes carried by Firmware Update responses.
    DfuStatus {
        Success = 0,
        Resources = 1,
        WrongPhase = 2,
        Internal = 3,
        FwIdx = 4,
        Metadata = 5,
        TemporarilyUnavailable = 6,
        BlobXferBusy = 7,
    }
}

wire_enum! {
    /// Firmware Update Server phase.
    DfuPhase {
        Idle = 0,
        TransferErr = 1,
        TransferActive = 2,
        Verify = 3,
        VerifyOk = 4,
        VerifyFail = 5,
        Applying = 6,
        TransferCanceled = 7,
        ApplySuccess = 8,
        ApplyFail = 9,
        Unknown = 10,
    }
}

wire_enum! {
    /// What happens to the node once the new image is applied.
    DfuEffect {
        None = 0,
        CompChangeNoRpr = 1,
        CompChange = 2,
        Unprov = 3,
    }
}

impl Default for DfuPhase {
    fn default() -> Self {
        DfuPhase::Idle
    }
}

impl Default for DfuEffect {
    fn default() -> Self {
        DfuEffect::None
    }
}

// ── Fixed bodies ──────────────────────────────────────────────────────────────

/// BLOB Transfer Start body.
///
/// Wire size: 16 bytes.
#[derive(Debug, Clone, AsBytes, FromBytes, FromZeroes)]
#[repr(C, packed)]
struct XferStartWire {
    mode: u8,
    id: U64<LittleEndian>,
    size: U32<LittleEndian>,
    block_size_log: u8,
    mtu_size: U16<LittleEndian>,
}

assert_eq_size!(XferStartWire, [u8; 16]);

/// BLOB Block Start body. Wire size: 4 bytes.
#[derive(Debug, Clone, AsBytes, FromBytes, FromZeroes)]
#[repr(C, packed)]
struct BlockStartWire {
    block: U16<LittleEndian>,
    chunk_size: U16<LittleEndian>,
}

assert_eq_size!(BlockStartWire, [u8; 4]);

/// BLOB Information Status body.
///
/// Wire size: 13 bytes.
#[derive(Debug, Clone, AsBytes, FromBytes, FromZeroes)]
#[repr(C, packed)]
struct InfoStatusWire {
    min_block_size_log: u8,
    max_block_size_log: u8,
    max_chunks: U16<LittleEndian>,
    max_chunk_size: U16<LittleEndian>,
    max_size: U32<LittleEndian>,
    mtu_size: U16<LittleEndian>,
    modes: u8,
}

assert_eq_size!(InfoStatusWire, [u8; 13]);

/// Firmware Update Start header, followed by the metadata.
///
/// Wire size: 12 bytes.
#[derive(Debug, Clone, AsBytes, FromBytes, FromZeroes)]
#[repr(C, packed)]
struct UpdateStartWire {
    ttl: u8,
    timeout_base: U16<LittleEndian>,
    blob_id: U64<LittleEndian>,
    img_idx: u8,
}

assert_eq_size!(UpdateStartWire, [u8; 12]);

/// Optional tail of a Firmware Update Status. Wire size: 13 bytes.
#[derive(Debug, Clone, AsBytes, FromBytes, FromZeroes)]
#[repr(C, packed)]
struct UpdateInfoWire {
    ttl: u8,
    effect: u8,
    timeout_base: U16<LittleEndian>,
    blob_id: U64<LittleEndian>,
    img_idx: u8,
}

assert_eq_size!(UpdateInfoWire, [u8; 13]);

fn take_fixed<T: FromBytes>(buf: &mut &[u8]) -> Result<T, WireError> {
    let size = std::mem::size_of::<T>();
    let value = T::read_from_prefix(buf).ok_or(WireError::Truncated { need: size, have: buf.len() })?;
    buf.advance(size);
    Ok(value)
}

// ── Message types ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct XferStart {
    pub mode: XferMode,
    pub id: u64,
    pub size: u32,
    pub block_size_log: u8,
    pub mtu_size: u16,
}

/// Transfer parameters reported once a server has accepted a start.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct XferDetail {
    pub size: u32,
    pub block_size_log: u8,
    pub mtu_size: u16,
    /// One bit per block still to be received, LSB first.
    pub missing_blocks: Bytes,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct XferStatus {
    pub status: BlobStatus,
    pub mode: XferMode,
    pub phase: XferPhase,
    pub id: Option<u64>,
    pub detail: Option<XferDetail>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MissingChunks {
    All,
    None,
    /// Bitmap of missing chunks, LSB first.
    Some(Bytes),
    /// Explicit list of missing chunk indices.
    Encoded(Vec<u16>),
}

impl MissingChunks {
    pub fn format(&self) -> MissingFormat {
        match self {
            MissingChunks::All => MissingFormat::All,
            MissingChunks::None => MissingFormat::None,
            MissingChunks::Some(_) => MissingFormat::Some,
            MissingChunks::Encoded(_) => MissingFormat::Encoded,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockStatus {
    pub status: BlobStatus,
    pub block: u16,
    pub chunk_size: u16,
    pub missing: MissingChunks,
}

/// Transfer capabilities advertised by a BLOB Transfer Server.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct BlobCaps {
    pub min_block_size_log: u8,
    pub max_block_size_log: u8,
    pub max_chunks: u16,
    pub max_chunk_size: u16,
    pub max_size: u32,
    pub mtu_size: u16,
    pub modes: u8,
}

/// One entry of a firmware image list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FwImage {
    pub fwid: Bytes,
    pub uri: Bytes,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DfuInfoStatus {
    /// Total number of images on the node.
    pub total: u8,
    pub first_index: u8,
    pub images: Vec<FwImage>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpdateStart {
    pub ttl: u8,
    pub timeout_base: u16,
    pub blob_id: u64,
    pub img_idx: u8,
    pub metadata: Bytes,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UpdateInfo {
    pub ttl: u8,
    pub effect: DfuEffect,
    pub timeout_base: u16,
    pub blob_id: u64,
    pub img_idx: u8,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpdateStatus {
    pub status: DfuStatus,
    pub phase: DfuPhase,
    pub info: Option<UpdateInfo>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MetadataStatus {
    pub status: DfuStatus,
    pub effect: DfuEffect,
    pub img_idx: u8,
}

/// Every message understood by the BLOB Transfer and Firmware Update models.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    XferGet,
    XferStart(XferStart),
    XferCancel { id: u64 },
    XferStatus(XferStatus),
    BlockGet,
    BlockStart { block: u16, chunk_size: u16 },
    BlockStatus(BlockStatus),
    Chunk { index: u16, data: Bytes },
    BlockReport { missing: Vec<u16> },
    InfoGet,
    InfoStatus(BlobCaps),
    DfuInfoGet { first_index: u8, entries_limit: u8 },
    DfuInfoStatus(DfuInfoStatus),
    MetadataCheck { img_idx: u8, metadata: Bytes },
    MetadataStatus(MetadataStatus),
    UpdateGet,
    UpdateStart(UpdateStart),
    UpdateCancel,
    UpdateApply,
    UpdateStatus(UpdateStatus),
}

impl Message {
    pub fn opcode(&self) -> Opcode {
        match self {
            Message::XferGet => op::BLOB_XFER_GET,
            Message::XferStart(_) => op::BLOB_XFER_START,
            Message::XferCancel { .. } => op::BLOB_XFER_CANCEL,
            Message::XferStatus(_) => op::BLOB_XFER_STATUS,
            Message::BlockGet => op::BLOB_BLOCK_GET,
            Message::BlockStart { .. } => op::BLOB_BLOCK_START,
            Message::BlockStatus(_) => op::BLOB_BLOCK_STATUS,
            Message::Chunk { .. } => op::BLOB_CHUNK,
            Message::BlockReport { .. } => op::BLOB_BLOCK_REPORT,
            Message::InfoGet => op::BLOB_INFO_GET,
            Message::InfoStatus(_) => op::BLOB_INFO_STATUS,
            Message::DfuInfoGet { .. } => op::DFU_INFO_GET,
            Message::DfuInfoStatus(_) => op::DFU_INFO_STATUS,
            Message::MetadataCheck { .. } => op::DFU_METADATA_CHECK,
            Message::MetadataStatus(_) => op::DFU_METADATA_STATUS,
            Message::UpdateGet => op::DFU_UPDATE_GET,
            Message::UpdateStart(_) => op::DFU_UPDATE_START,
            Message::UpdateCancel => op::DFU_UPDATE_CANCEL,
            Message::UpdateApply => op::DFU_UPDATE_APPLY,
            Message::UpdateStatus(_) => op::DFU_UPDATE_STATUS,
        }
    }

    /// True for messages handled by the BLOB Transfer models.
    pub fn is_blob(&self) -> bool {
        matches!(
            self,
            Message::XferGet
                | Message::XferStart(_)
                | Message::XferCancel { .. }
                | Message::XferStatus(_)
                | Message::BlockGet
                | Message::BlockStart { .. }
                | Message::BlockStatus(_)
                | Message::Chunk { .. }
                | Message::BlockReport { .. }
                | Message::InfoGet
                | Message::InfoStatus(_)
        )
    }

    /// Encode opcode and payload into one access-layer frame.
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(32);
        put_opcode(&mut buf, self.opcode());
        self.encode_payload(&mut buf);
        buf.freeze()
    }

    fn encode_payload(&self, buf: &mut BytesMut) {
        match self {
            Message::XferGet
            | Message::BlockGet
            | Message::InfoGet
            | Message::UpdateGet
            | Message::UpdateCancel
            | Message::UpdateApply => {}
            Message::XferStart(m) => {
                let wire = XferStartWire {
                    mode: m.mode.into(),
                    id: U64::new(m.id),
                    size: U32::new(m.size),
                    block_size_log: m.block_size_log,
                    mtu_size: U16::new(m.mtu_size),
                };
                buf.put_slice(wire.as_bytes());
            }
            Message::XferCancel { id } => buf.put_u64_le(*id),
            Message::XferStatus(m) => {
                buf.put_u8((u8::from(m.status) & 0x0f) | (u8::from(m.mode) << 6));
                buf.put_u8(m.phase.into());
                if let Some(id) = m.id {
                    buf.put_u64_le(id);
                    if let Some(detail) = &m.detail {
                        buf.put_u32_le(detail.size);
                        buf.put_u8(detail.block_size_log);
                        buf.put_u16_le(detail.mtu_size);
                        buf.put_slice(&detail.missing_blocks);
                    }
                }
            }
            Message::BlockStart { block, chunk_size } => {
                let wire = BlockStartWire { block: U16::new(*block), chunk_size: U16::new(*chunk_size) };
                buf.put_slice(wire.as_bytes());
            }
            Message::BlockStatus(m) => {
                buf.put_u8((u8::from(m.status) & 0x0f) | (u8::from(m.missing.format()) << 6));
                buf.put_u16_le(m.block);
                buf.put_u16_le(m.chunk_size);
                match &m.missing {
                    MissingChunks::All | MissingChunks::None => {}
                    MissingChunks::Some(bits) => buf.put_slice(bits),
                    MissingChunks::Encoded(list) => {
                        for idx in list {
                            encode_chunk_index(*idx, buf);
                        }
                    }
                }
            }
            Message::Chunk { index, data } => {
                buf.put_u16_le(*index);
                buf.put_slice(data);
            }
            Message::BlockReport { missing } => {
                for idx in missing {
                    encode_chunk_index(*idx, buf);
                }
            }
            Message::InfoStatus(caps) => {
                let wire = InfoStatusWire {
                    min_block_size_log: caps.min_block_size_log,
                    max_block_size_log: caps.max_block_size_log,
                    max_chunks: U16::new(caps.max_chunks),
                    max_chunk_size: U16::new(caps.max_chunk_size),
                    max_size: U32::new(caps.max_size),
                    mtu_size: U16::new(caps.mtu_size),
                    modes: caps.modes,
                };
                buf.put_slice(wire.as_bytes());
            }
            Message::DfuInfoGet { first_index, entries_limit } => {
                buf.put_u8(*first_index);
                buf.put_u8(*entries_limit);
            }
            Message::DfuInfoStatus(m) => {
                buf.put_u8(m.total);
                buf.put_u8(m.first_index);
                for img in &m.images {
                    buf.put_u8(img.fwid.len() as u8);
                    buf.put_slice(&img.fwid);
                    buf.put_u8(img.uri.len() as u8);
                    buf.put_slice(&img.uri);
                }
            }
            Message::MetadataCheck { img_idx, metadata } => {
                buf.put_u8(*img_idx);
                buf.put_slice(metadata);
            }
            Message::MetadataStatus(m) => {
                buf.put_u8((u8::from(m.status) & 0x07) | ((u8::from(m.effect) & 0x03) << 3));
                buf.put_u8(m.img_idx);
            }
            Message::UpdateStart(m) => {
                let wire = UpdateStartWire {
                    ttl: m.ttl,
                    timeout_base: U16::new(m.timeout_base),
                    blob_id: U64::new(m.blob_id),
                    img_idx: m.img_idx,
                };
                buf.put_slice(wire.as_bytes());
                buf.put_slice(&m.metadata);
            }
            Message::UpdateStatus(m) => {
                buf.put_u8((u8::from(m.status) & 0x07) | (u8::from(m.phase) << 3));
                if let Some(info) = &m.info {
                    let wire = UpdateInfoWire {
                        ttl: info.ttl,
                        effect: info.effect.into(),
                        timeout_base: U16::new(info.timeout_base),
                        blob_id: U64::new(info.blob_id),
                        img_idx: info.img_idx,
                    };
                    buf.put_slice(wire.as_bytes());
                }
            }
        }
    }

    /// Decode one access-layer frame.
    pub fn decode(frame: &[u8]) -> Result<Message, WireError> {
        let mut buf = frame;
        let opcode = take_opcode(&mut buf)?;
        Self::decode_payload(opcode, buf)
    }

    pub fn decode_payload(opcode: Opcode, mut buf: &[u8]) -> Result<Message, WireError> {
        let buf = &mut buf;
        let msg = match opcode {
            op::BLOB_XFER_GET => Message::XferGet,
            op::BLOB_BLOCK_GET => Message::BlockGet,
            op::BLOB_INFO_GET => Message::InfoGet,
            op::DFU_UPDATE_GET => Message::UpdateGet,
            op::DFU_UPDATE_CANCEL => Message::UpdateCancel,
            op::DFU_UPDATE_APPLY => Message::UpdateApply,
            op::BLOB_XFER_START => {
                let wire: XferStartWire = take_fixed(buf)?;
                Message::XferStart(XferStart {
                    mode: XferMode::try_from(wire.mode)?,
                    id: wire.id.get(),
                    size: wire.size.get(),
                    block_size_log: wire.block_size_log,
                    mtu_size: wire.mtu_size.get(),
                })
            }
            op::BLOB_XFER_CANCEL => {
                need(buf, 8)?;
                Message::XferCancel { id: buf.get_u64_le() }
            }
            op::BLOB_XFER_STATUS => {
                need(buf, 2)?;
                let first = buf.get_u8();
                let status = BlobStatus::try_from(first & 0x0f)?;
                let mode = XferMode::try_from(first >> 6)?;
                let phase = XferPhase::try_from(buf.get_u8())?;
                let mut id = None;
                let mut detail = None;
                if buf.len() >= 8 {
                    id = Some(buf.get_u64_le());
                    if buf.len() >= 7 {
                        let size = buf.get_u32_le();
                        let block_size_log = buf.get_u8();
                        let mtu_size = buf.get_u16_le();
                        let missing_blocks = Bytes::copy_from_slice(buf);
                        buf.advance(buf.len());
                        detail = Some(XferDetail { size, block_size_log, mtu_size, missing_blocks });
                    }
                }
                Message::XferStatus(XferStatus { status, mode, phase, id, detail })
            }
            op::BLOB_BLOCK_START => {
                let wire: BlockStartWire = take_fixed(buf)?;
                Message::BlockStart { block: wire.block.get(), chunk_size: wire.chunk_size.get() }
            }
            op::BLOB_BLOCK_STATUS => {
                need(buf, 5)?;
                let first = buf.get_u8();
                let status = BlobStatus::try_from(first & 0x0f)?;
                let format = MissingFormat::try_from(first >> 6)?;
                let block = buf.get_u16_le();
                let chunk_size = buf.get_u16_le();
                let rest = std::mem::take(buf);
                let missing = match format {
                    MissingFormat::All => MissingChunks::All,
                    MissingFormat::None => MissingChunks::None,
                    MissingFormat::Some => MissingChunks::Some(Bytes::copy_from_slice(rest)),
                    MissingFormat::Encoded => MissingChunks::Encoded(decode_chunk_indices(rest)?),
                };
                Message::BlockStatus(BlockStatus { status, block, chunk_size, missing })
            }
            op::BLOB_CHUNK => {
                need(buf, 3)?;
                let index = buf.get_u16_le();
                let data = Bytes::copy_from_slice(buf);
                buf.advance(buf.len());
                Message::Chunk { index, data }
            }
            op::BLOB_BLOCK_REPORT => {
                let missing = decode_chunk_indices(buf)?;
                buf.advance(buf.len());
                Message::BlockReport { missing }
            }
            op::BLOB_INFO_STATUS => {
                let wire: InfoStatusWire = take_fixed(buf)?;
                Message::InfoStatus(BlobCaps {
                    min_block_size_log: wire.min_block_size_log,
                    max_block_size_log: wire.max_block_size_log,
                    max_chunks: wire.max_chunks.get(),
                    max_chunk_size: wire.max_chunk_size.get(),
                    max_size: wire.max_size.get(),
                    mtu_size: wire.mtu_size.get(),
                    modes: wire.modes,
                })
            }
            op::DFU_INFO_GET => {
                need(buf, 2)?;
                Message::DfuInfoGet { first_index: buf.get_u8(), entries_limit: buf.get_u8() }
            }
            op::DFU_INFO_STATUS => {
                need(buf, 2)?;
                let total = buf.get_u8();
                let first_index = buf.get_u8();
                let mut images = Vec::new();
                while !buf.is_empty() {
                    let fwid = take_prefixed(buf)?;
                    let uri = take_prefixed(buf)?;
                    images.push(FwImage { fwid, uri });
                }
                Message::DfuInfoStatus(DfuInfoStatus { total, first_index, images })
            }
            op::DFU_METADATA_CHECK => {
                need(buf, 1)?;
                let img_idx = buf.get_u8();
                let metadata = Bytes::copy_from_slice(buf);
                buf.advance(buf.len());
                Message::MetadataCheck { img_idx, metadata }
            }
            op::DFU_METADATA_STATUS => {
                need(buf, 2)?;
                let first = buf.get_u8();
                Message::MetadataStatus(MetadataStatus {
                    status: DfuStatus::try_from(first & 0x07)?,
                    effect: DfuEffect::try_from((first >> 3) & 0x03)?,
                    img_idx: buf.get_u8(),
                })
            }
            op::DFU_UPDATE_START => {
                let wire: UpdateStartWire = take_fixed(buf)?;
                let metadata = Bytes::copy_from_slice(buf);
                buf.advance(buf.len());
                Message::UpdateStart(UpdateStart {
                    ttl: wire.ttl,
                    timeout_base: wire.timeout_base.get(),
                    blob_id: wire.blob_id.get(),
                    img_idx: wire.img_idx,
                    metadata,
                })
            }
            op::DFU_UPDATE_STATUS => {
                need(buf, 1)?;
                let first = buf.get_u8();
                let status = DfuStatus::try_from(first & 0x07)?;
                let phase = DfuPhase::try_from(first >> 3)?;
                let info = if buf.is_empty() {
                    None
                } else {
                    let wire: UpdateInfoWire = take_fixed(buf)?;
                    Some(UpdateInfo {
                        ttl: wire.ttl,
                        effect: DfuEffect::try_from(wire.effect)?,
                        timeout_base: wire.timeout_base.get(),
                        blob_id: wire.blob_id.get(),
                        img_idx: wire.img_idx,
                    })
                };
                Message::UpdateStatus(UpdateStatus { status, phase, info })
            }
            other => return Err(WireError::UnknownOpcode(other)),
        };
        done(buf)?;
        Ok(msg)
    }
}

fn take_prefixed(buf: &mut &[u8]) -> Result<Bytes, WireError> {
    need(buf, 1)?;
    let len = buf.get_u8() as usize;
    need(buf, len)?;
    let out = Bytes::copy_from_slice(&buf[..len]);
    buf.advance(len);
    Ok(out)
}
