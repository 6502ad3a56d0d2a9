//! BLOB Transfer Server — receives a BLOB block by block and chunk by chunk.
//!
//! The server is armed by the application with [`BlobSrv::recv`], then driven
//! entirely by client messages and its two timers: the receive timeout (no
//! traffic for too long suspends the transfer) and, in Pull mode, the report
//! timer that asks the client for missing chunks.
//!
//! Progress that must survive a reboot (transfer parameters, client address,
//! pending blocks) is written to a [`StateStore`] at every block boundary.

use std::time::{Duration, Instant};

use mbt_core::config::BlobServerConfig;
use mbt_core::timeout::{server_pull_timeout, server_timeout, SERVER_REPORT_DELAY};
use mbt_core::wire::{
    Address, BlobCaps, BlobStatus, BlockStatus, Message, MissingChunks, XferDetail, XferMode,
    XferPhase, XferStart, XferStatus, ADDR_UNASSIGNED,
};
use mbt_core::Bitmap;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::blob::{chunk_count, BlobXfer, Block, BLOCK_SIZE_LOG_MAX, BLOCK_SIZE_LOG_MIN};
use crate::store::StateStore;
use crate::stream::{BlobStream, IoMode};
use crate::timer::{earliest, Timer};
use crate::transport::{MsgCtx, Transport};

/// Opcode plus chunk index ahead of the chunk data.
const CHUNK_OVERHEAD: u16 = 3;
/// Block-Status header ahead of the missing-chunks bitmap.
const BLOCK_STATUS_OVERHEAD: u16 = 6;
/// Smallest MTU a client may announce.
const MTU_SIZE_MIN: u16 = 0x14;
/// Block numbers are 16 bits on the wire.
const BLOCKS_MAX: u32 = 0x1_0000;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BlobSrvError {
    #[error("a transfer is already in progress")]
    Busy,
    #[error("no transfer to cancel")]
    Already,
    #[error("message discarded: {0}")]
    Discarded(&'static str),
    #[error("stream error: {0}")]
    Stream(String),
    #[error("could not recover transfer 0x{0:016x}")]
    NotRecovered(u64),
    #[error("state store: {0}")]
    Store(String),
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("rejected by application: {0}")]
pub struct HandlerError(pub String);

/// Application hooks for a BLOB Transfer Server.
///
/// Passed by the driver into every call that may fire one, so the
/// application state never has to be shared with the server.
pub trait BlobSrvHandler {
    /// A client sent a valid Transfer Start. An error rejects it.
    fn start(&mut self, _cli: Address, _xfer: &BlobXfer) -> Result<(), HandlerError> {
        Ok(())
    }

    /// The transfer finished, or was cancelled when `success` is false.
    fn end(&mut self, _id: u64, _success: bool) {}

    /// The client went quiet; the transfer can resume later.
    fn suspended(&mut self) {}

    fn resume(&mut self) {}

    /// Supply a stream for a transfer interrupted by a reboot. `None`
    /// abandons it.
    fn recover(&mut self, _xfer: &BlobXfer) -> Option<Box<dyn BlobStream>> {
        None
    }
}

impl BlobSrvHandler for () {}

/// State persisted across reboots.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BlobSrvState {
    pub xfer: BlobXfer,
    /// Client that started the transfer; unassigned until Transfer Start.
    pub cli: Address,
    pub app_idx: u16,
    pub ttl: u8,
    pub timeout_base: u16,
    pub mtu_size: u16,
    /// Blocks not yet received.
    pub blocks: Bitmap,
}

impl Default for BlobSrvState {
    fn default() -> Self {
        Self {
            xfer: BlobXfer::default(),
            cli: ADDR_UNASSIGNED,
            app_idx: 0,
            ttl: 0,
            timeout_base: 0,
            mtu_size: 0,
            blocks: Bitmap::default(),
        }
    }
}

pub struct BlobSrv {
    cfg: BlobServerConfig,
    phase: XferPhase,
    state: BlobSrvState,
    block: Block,
    io: Option<Box<dyn BlobStream>>,
    store: Box<dyn StateStore<BlobSrvState>>,
    rx_timeout: Timer,
    report: Timer,
}

impl BlobSrv {
    pub fn new(cfg: BlobServerConfig, store: Box<dyn StateStore<BlobSrvState>>) -> Self {
        Self {
            cfg,
            phase: XferPhase::Inactive,
            state: BlobSrvState::default(),
            block: Block::default(),
            io: None,
            store,
            rx_timeout: Timer::default(),
            report: Timer::default(),
        }
    }

    pub fn phase(&self) -> XferPhase {
        self.phase
    }

    pub fn state(&self) -> &BlobSrvState {
        &self.state
    }

    /// The transfer being received, if any.
    pub fn xfer(&self) -> Option<&BlobXfer> {
        (self.phase != XferPhase::Inactive).then_some(&self.state.xfer)
    }

    /// True while the server is receiving or waiting for a client.
    pub fn is_busy(&self) -> bool {
        !matches!(self.phase, XferPhase::Inactive | XferPhase::Suspended | XferPhase::Complete)
    }

    /// Percentage of blocks received.
    pub fn progress(&self) -> u8 {
        match self.phase {
            XferPhase::Inactive | XferPhase::WaitingForStart => 0,
            XferPhase::Complete => 100,
            _ => {
                let total = self.state.blocks.len();
                if total == 0 {
                    return 0;
                }
                let received = total - self.state.blocks.count_set();
                (100 * received / total) as u8
            }
        }
    }

    /// Capabilities advertised in Information Status.
    pub fn caps(&self) -> BlobCaps {
        BlobCaps {
            min_block_size_log: self.cfg.block_size_log_min.max(BLOCK_SIZE_LOG_MIN),
            max_block_size_log: self.cfg.block_size_log_max.min(BLOCK_SIZE_LOG_MAX),
            max_chunks: self.max_chunk_count(self.cfg.mtu_size),
            max_chunk_size: self.max_chunk_size(self.cfg.mtu_size),
            max_size: self.cfg.max_blob_size,
            mtu_size: self.cfg.mtu_size,
            modes: self.cfg.modes,
        }
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        earliest([self.rx_timeout.deadline(), self.report.deadline()])
    }

    // ── Application API ───────────────────────────────────────────────────

    /// Prepare to receive BLOB `id` into `io`.
    pub fn recv(
        &mut self,
        now: Instant,
        id: u64,
        io: Box<dyn BlobStream>,
        ttl: u8,
        timeout_base: u16,
    ) -> Result<(), BlobSrvError> {
        if self.is_busy() {
            return Err(BlobSrvError::Busy);
        }
        if let Some(mut old) = self.io.take() {
            old.close(&self.state.xfer);
        }

        self.state = BlobSrvState {
            xfer: BlobXfer { id, ..BlobXfer::default() },
            ttl,
            timeout_base,
            ..BlobSrvState::default()
        };
        self.block = Block::default();
        self.io = Some(io);
        self.phase_set(XferPhase::WaitingForStart);
        self.reset_timer(now);
        self.store_state();
        info!(id = format_args!("0x{id:016x}"), "waiting for BLOB transfer");
        Ok(())
    }

    /// Abort the current transfer.
    pub fn cancel(&mut self, handler: &mut dyn BlobSrvHandler) -> Result<(), BlobSrvError> {
        if self.phase == XferPhase::Inactive {
            return Err(BlobSrvError::Already);
        }
        self.cancel_xfer(handler);
        Ok(())
    }

    /// Reload persisted state after a reboot.
    ///
    /// Returns `Ok(true)` if a transfer was recovered. An interrupted
    /// transfer comes back Suspended (or WaitingForStart if no client had
    /// started it yet) and needs a stream from [`BlobSrvHandler::recover`].
    pub fn restore(
        &mut self,
        now: Instant,
        handler: &mut dyn BlobSrvHandler,
    ) -> Result<bool, BlobSrvError> {
        let Some(state) = self.store.load().map_err(|e| BlobSrvError::Store(e.to_string()))? else {
            return Ok(false);
        };
        let id = state.xfer.id;
        self.state = state;

        let Some(mut io) = handler.recover(&self.state.xfer) else {
            warn!(id = format_args!("0x{id:016x}"), "no stream to recover BLOB transfer, abandoning");
            self.abandon();
            return Err(BlobSrvError::NotRecovered(id));
        };
        if self.state.cli != ADDR_UNASSIGNED {
            if let Err(e) = io.open(&self.state.xfer, IoMode::Write) {
                warn!(error = %e, "failed to reopen stream, abandoning transfer");
                self.abandon();
                return Err(BlobSrvError::NotRecovered(id));
            }
            self.phase_set(XferPhase::Suspended);
        } else {
            self.phase_set(XferPhase::WaitingForStart);
            self.reset_timer(now);
        }
        self.io = Some(io);
        info!(id = format_args!("0x{id:016x}"), phase = ?self.phase, "BLOB transfer recovered");
        Ok(true)
    }

    // ── Timers ────────────────────────────────────────────────────────────

    pub fn poll(&mut self, now: Instant, net: &mut dyn Transport, handler: &mut dyn BlobSrvHandler) {
        if self.rx_timeout.fire(now) {
            self.on_rx_timeout(handler);
        }
        if self.report.fire(now) {
            self.on_report(now, net);
        }
    }

    fn on_rx_timeout(&mut self, handler: &mut dyn BlobSrvHandler) {
        debug!(phase = ?self.phase, "BLOB receive timeout");
        match self.phase {
            XferPhase::WaitingForStart => self.cancel_xfer(handler),
            XferPhase::Inactive | XferPhase::Complete | XferPhase::Suspended => {}
            _ if self.state.xfer.mode == XferMode::Pull && !self.state.blocks.any() => {
                self.end(handler)
            }
            _ => self.suspend(handler),
        }
    }

    fn on_report(&mut self, now: Instant, net: &mut dyn Transport) {
        if !matches!(self.phase, XferPhase::WaitingForBlock | XferPhase::WaitingForChunk) {
            return;
        }
        self.block_report(net);
        self.report.arm_in(now, SERVER_REPORT_DELAY);
    }

    fn timeout(&self) -> Duration {
        if self.state.xfer.mode == XferMode::Pull {
            server_pull_timeout(self.state.timeout_base, SERVER_REPORT_DELAY)
        } else {
            server_timeout(self.state.timeout_base)
        }
    }

    fn reset_timer(&mut self, now: Instant) {
        let after = self.timeout();
        self.rx_timeout.arm_in(now, after);
    }

    // ── Transitions ───────────────────────────────────────────────────────

    fn phase_set(&mut self, phase: XferPhase) {
        if self.phase != phase {
            debug!(from = ?self.phase, to = ?phase, "BLOB server phase");
        }
        self.phase = phase;
    }

    fn store_state(&mut self) {
        if let Err(e) = self.store.save(&self.state) {
            warn!(error = %e, "failed to persist BLOB server state");
        }
    }

    fn erase_state(&mut self) {
        if let Err(e) = self.store.erase() {
            warn!(error = %e, "failed to erase BLOB server state");
        }
    }

    fn abandon(&mut self) {
        self.state = BlobSrvState::default();
        self.phase_set(XferPhase::Inactive);
        self.erase_state();
    }

    fn cancel_xfer(&mut self, handler: &mut dyn BlobSrvHandler) {
        let id = self.state.xfer.id;
        self.rx_timeout.cancel();
        self.report.cancel();
        if let Some(mut io) = self.io.take() {
            io.close(&self.state.xfer);
        }
        self.abandon();
        info!(id = format_args!("0x{id:016x}"), "BLOB transfer cancelled");
        handler.end(id, false);
    }

    fn end(&mut self, handler: &mut dyn BlobSrvHandler) {
        let id = self.state.xfer.id;
        self.rx_timeout.cancel();
        self.report.cancel();
        if let Some(mut io) = self.io.take() {
            io.close(&self.state.xfer);
        }
        self.phase_set(XferPhase::Complete);
        self.erase_state();
        info!(id = format_args!("0x{id:016x}"), "BLOB transfer complete");
        handler.end(id, true);
    }

    fn suspend(&mut self, handler: &mut dyn BlobSrvHandler) {
        self.rx_timeout.cancel();
        self.report.cancel();
        self.phase_set(XferPhase::Suspended);
        info!(block = self.block.number, "BLOB transfer suspended");
        handler.suspended();
    }

    fn resume(&mut self, phase: XferPhase, handler: &mut dyn BlobSrvHandler) {
        debug!(block = self.block.number, "BLOB transfer resumed");
        self.phase_set(phase);
        handler.resume();
    }

    // ── Limits ────────────────────────────────────────────────────────────

    fn max_chunk_size(&self, mtu: u16) -> u16 {
        self.cfg.max_chunk_size.min(mtu.saturating_sub(CHUNK_OVERHEAD))
    }

    fn max_chunk_count(&self, mtu: u16) -> u16 {
        let bitmap_limit = mtu.saturating_sub(BLOCK_STATUS_OVERHEAD) as u32 * 8;
        (self.cfg.max_chunks as u32).min(bitmap_limit) as u16
    }

    // ── Responses ─────────────────────────────────────────────────────────

    fn rsp_ctx(&self, ctx: MsgCtx) -> MsgCtx {
        if self.phase == XferPhase::Inactive {
            ctx
        } else {
            MsgCtx { ttl: self.state.ttl, ..ctx }
        }
    }

    fn send(&self, net: &mut dyn Transport, ctx: MsgCtx, msg: Message) {
        if let Err(e) = net.send(ctx, msg) {
            warn!(dst = format_args!("0x{:04x}", ctx.addr), error = %e, "failed to send BLOB response");
        }
    }

    fn xfer_status(&self, status: BlobStatus) -> XferStatus {
        let id = (self.phase != XferPhase::Inactive).then_some(self.state.xfer.id);
        let detail = (!matches!(self.phase, XferPhase::Inactive | XferPhase::WaitingForStart)).then(|| {
            XferDetail {
                size: self.state.xfer.size,
                block_size_log: self.state.xfer.block_size_log,
                mtu_size: self.state.mtu_size,
                missing_blocks: bytes::Bytes::copy_from_slice(self.state.blocks.as_bytes()),
            }
        });
        let mode = if self.phase == XferPhase::Inactive { XferMode::None } else { self.state.xfer.mode };
        XferStatus { status, mode, phase: self.phase, id, detail }
    }

    fn xfer_status_rsp(&self, net: &mut dyn Transport, ctx: MsgCtx, status: BlobStatus) {
        let msg = Message::XferStatus(self.xfer_status(status));
        self.send(net, self.rsp_ctx(ctx), msg);
    }

    fn missing_chunks(&self) -> MissingChunks {
        match self.phase {
            XferPhase::Inactive | XferPhase::WaitingForStart => return MissingChunks::All,
            XferPhase::Complete => return MissingChunks::None,
            _ => {}
        }
        let count = self.block.missing.count_set();
        if count == 0 {
            MissingChunks::None
        } else if self.state.xfer.mode == XferMode::Pull {
            MissingChunks::Encoded(self.pull_request())
        } else if count == self.block.chunk_count as usize {
            MissingChunks::All
        } else {
            MissingChunks::Some(bytes::Bytes::copy_from_slice(self.block.missing.as_bytes()))
        }
    }

    /// The next chunks a Pull-mode server asks for.
    fn pull_request(&self) -> Vec<u16> {
        self.block
            .missing
            .iter_set()
            .take(self.cfg.pull_req_count.max(1) as usize)
            .map(|i| i as u16)
            .collect()
    }

    fn block_status_rsp(&self, net: &mut dyn Transport, ctx: MsgCtx, status: BlobStatus) {
        let msg = Message::BlockStatus(BlockStatus {
            status,
            block: self.block.number,
            chunk_size: self.state.xfer.chunk_size,
            missing: self.missing_chunks(),
        });
        self.send(net, self.rsp_ctx(ctx), msg);
    }

    /// Unsolicited Partial Block Report to the client (Pull mode).
    fn block_report(&self, net: &mut dyn Transport) {
        let missing = self.pull_request();
        debug!(block = self.block.number, ?missing, "sending partial block report");
        let ctx = MsgCtx::new(self.state.cli, self.state.app_idx, self.state.ttl);
        self.send(net, ctx, Message::BlockReport { missing });
    }

    // ── Message handlers ──────────────────────────────────────────────────

    /// Handle one BLOB Transfer message from `ctx.addr`. Messages for other
    /// models are discarded.
    pub fn handle_message(
        &mut self,
        now: Instant,
        net: &mut dyn Transport,
        ctx: MsgCtx,
        msg: &Message,
        handler: &mut dyn BlobSrvHandler,
    ) -> Result<(), BlobSrvError> {
        match msg {
            Message::XferGet => {
                self.handle_xfer_get(net, ctx, handler);
                Ok(())
            }
            Message::XferStart(start) => self.handle_xfer_start(now, net, ctx, start, handler),
            Message::XferCancel { id } => {
                self.handle_xfer_cancel(net, ctx, *id, handler);
                Ok(())
            }
            Message::BlockGet => {
                self.handle_block_get(net, ctx);
                Ok(())
            }
            Message::BlockStart { block, chunk_size } => {
                self.handle_block_start(now, net, ctx, *block, *chunk_size, handler);
                Ok(())
            }
            Message::Chunk { index, data } => self.handle_chunk(now, net, *index, data, handler),
            Message::InfoGet => {
                self.send(net, ctx, Message::InfoStatus(self.caps()));
                Ok(())
            }
            _ => Err(BlobSrvError::Discarded("not a BLOB server message")),
        }
    }

    fn handle_xfer_get(&mut self, net: &mut dyn Transport, ctx: MsgCtx, handler: &mut dyn BlobSrvHandler) {
        if self.phase == XferPhase::WaitingForBlock
            && self.state.xfer.mode == XferMode::Pull
            && !self.state.blocks.any()
        {
            self.end(handler);
        }
        self.xfer_status_rsp(net, ctx, BlobStatus::Success);
    }

    fn handle_xfer_start(
        &mut self,
        now: Instant,
        net: &mut dyn Transport,
        ctx: MsgCtx,
        start: &XferStart,
        handler: &mut dyn BlobSrvHandler,
    ) -> Result<(), BlobSrvError> {
        if start.mode == XferMode::None {
            return Err(BlobSrvError::Discarded("invalid transfer mode"));
        }
        let status = self.start_xfer(now, ctx, start, handler);
        if status != BlobStatus::Success {
            warn!(src = format_args!("0x{:04x}", ctx.addr), ?status, "transfer start rejected");
        }
        self.xfer_status_rsp(net, ctx, status);
        Ok(())
    }

    fn start_xfer(
        &mut self,
        now: Instant,
        ctx: MsgCtx,
        start: &XferStart,
        handler: &mut dyn BlobSrvHandler,
    ) -> BlobStatus {
        if self.phase == XferPhase::Inactive {
            return BlobStatus::WrongPhase;
        }
        if start.id != self.state.xfer.id {
            return BlobStatus::WrongBlobId;
        }

        if self.phase != XferPhase::WaitingForStart {
            let xfer = &self.state.xfer;
            if xfer.mode != start.mode
                || xfer.size != start.size
                || xfer.block_size_log != start.block_size_log
                || self.state.mtu_size > start.mtu_size
            {
                return BlobStatus::WrongPhase;
            }
            if self.phase == XferPhase::Suspended {
                self.state.cli = ctx.addr;
                self.state.app_idx = ctx.app_idx;
                self.state.mtu_size = start.mtu_size;
                self.reset_timer(now);
                self.resume(XferPhase::WaitingForBlock, handler);
                self.store_state();
            }
            // Anything else is a retransmission of the start we already took.
            return BlobStatus::Success;
        }

        if !start.mode.is_in(self.cfg.modes) {
            return BlobStatus::UnsupportedMode;
        }
        if start.size > self.cfg.max_blob_size {
            return BlobStatus::BlobTooLarge;
        }
        let caps = self.caps();
        if start.block_size_log < caps.min_block_size_log || start.block_size_log > caps.max_block_size_log {
            return BlobStatus::InvalidBlockSize;
        }
        if start.mtu_size < MTU_SIZE_MIN || start.size == 0 {
            return BlobStatus::InvalidParam;
        }

        self.state.cli = ctx.addr;
        self.state.app_idx = ctx.app_idx;
        self.state.mtu_size = start.mtu_size;
        self.state.xfer = BlobXfer {
            id: start.id,
            size: start.size,
            mode: start.mode,
            block_size_log: start.block_size_log,
            chunk_size: 0,
        };

        let blocks = self.state.xfer.block_count();
        if blocks > BLOCKS_MAX {
            self.cancel_xfer(handler);
            return BlobStatus::InvalidParam;
        }
        self.state.blocks = Bitmap::filled(blocks as usize);

        let opened = match self.io.as_mut() {
            Some(io) => io.open(&self.state.xfer, IoMode::Write).map_err(|e| e.to_string()),
            None => Err("no stream".to_string()),
        };
        if let Err(e) = opened {
            warn!(error = %e, "failed to open BLOB stream");
            self.cancel_xfer(handler);
            return BlobStatus::Internal;
        }

        if let Err(e) = handler.start(ctx.addr, &self.state.xfer) {
            warn!(error = %e, "application refused BLOB transfer");
            self.cancel_xfer(handler);
            return BlobStatus::Internal;
        }

        self.reset_timer(now);
        self.phase_set(XferPhase::WaitingForBlock);
        self.store_state();
        info!(
            id = format_args!("0x{:016x}", start.id),
            size = start.size,
            blocks,
            mode = ?start.mode,
            "BLOB transfer started"
        );
        BlobStatus::Success
    }

    fn handle_xfer_cancel(
        &mut self,
        net: &mut dyn Transport,
        ctx: MsgCtx,
        id: u64,
        handler: &mut dyn BlobSrvHandler,
    ) {
        let mut status = BlobStatus::Success;
        if self.phase != XferPhase::Inactive {
            if id != self.state.xfer.id {
                status = BlobStatus::WrongBlobId;
            } else {
                self.cancel_xfer(handler);
            }
        }
        self.xfer_status_rsp(net, ctx, status);
    }

    fn handle_block_get(&self, net: &mut dyn Transport, ctx: MsgCtx) {
        let status = match self.phase {
            XferPhase::WaitingForBlock | XferPhase::WaitingForChunk | XferPhase::Complete => {
                BlobStatus::Success
            }
            XferPhase::Suspended => BlobStatus::InfoUnavailable,
            XferPhase::Inactive | XferPhase::WaitingForStart => BlobStatus::WrongPhase,
        };
        self.block_status_rsp(net, ctx, status);
    }

    fn handle_block_start(
        &mut self,
        now: Instant,
        net: &mut dyn Transport,
        ctx: MsgCtx,
        number: u16,
        chunk_size: u16,
        handler: &mut dyn BlobSrvHandler,
    ) {
        let status = self.start_block(now, number, chunk_size, handler);
        if status != BlobStatus::Success {
            warn!(block = number, chunk_size, ?status, "block start rejected");
        }
        self.block_status_rsp(net, ctx, status);
    }

    fn start_block(
        &mut self,
        now: Instant,
        number: u16,
        chunk_size: u16,
        handler: &mut dyn BlobSrvHandler,
    ) -> BlobStatus {
        match self.phase {
            XferPhase::Inactive | XferPhase::WaitingForStart => return BlobStatus::WrongPhase,
            XferPhase::Complete => {}
            _ => self.reset_timer(now),
        }

        if self.phase == XferPhase::WaitingForChunk {
            if self.block.number == number && self.state.xfer.chunk_size == chunk_size {
                return BlobStatus::Success;
            }
            return BlobStatus::WrongPhase;
        }

        if number as u32 >= self.state.xfer.block_count() {
            return BlobStatus::InvalidBlockNum;
        }

        let block_size = crate::blob::block_size(self.state.xfer.size, self.state.xfer.block_size_log, number as u32);
        if chunk_size == 0
            || chunk_size > self.max_chunk_size(self.state.mtu_size)
            || chunk_count(block_size, chunk_size) > self.max_chunk_count(self.state.mtu_size) as u32
        {
            return BlobStatus::InvalidChunkSize;
        }

        self.state.xfer.chunk_size = chunk_size;
        self.block = self.state.xfer.block(number, chunk_size);

        if self.phase == XferPhase::Complete || !self.state.blocks.get(number as usize) {
            debug!(block = number, "block already received");
            return BlobStatus::Success;
        }

        if self.phase == XferPhase::Suspended {
            self.resume(XferPhase::WaitingForBlock, handler);
        }

        self.block.missing.set_all();
        self.phase_set(XferPhase::WaitingForChunk);

        let started = match self.io.as_mut() {
            Some(io) => io.block_start(&self.state.xfer, &self.block).map_err(|e| e.to_string()),
            None => Err("no stream".to_string()),
        };
        if let Err(e) = started {
            warn!(block = number, error = %e, "stream refused block");
            self.cancel_xfer(handler);
            return BlobStatus::Internal;
        }

        if self.state.xfer.mode == XferMode::Pull {
            self.report.arm_in(now, SERVER_REPORT_DELAY);
        }
        debug!(block = number, chunks = self.block.chunk_count, "receiving block");
        BlobStatus::Success
    }

    fn handle_chunk(
        &mut self,
        now: Instant,
        net: &mut dyn Transport,
        index: u16,
        data: &[u8],
        handler: &mut dyn BlobSrvHandler,
    ) -> Result<(), BlobSrvError> {
        match self.phase {
            XferPhase::WaitingForChunk => {}
            // A chunk for the interrupted block picks the transfer up again.
            XferPhase::Suspended if self.block.missing.any() => {}
            _ => return Err(BlobSrvError::Discarded("not waiting for chunks")),
        }
        if index >= self.block.chunk_count {
            return Err(BlobSrvError::Discarded("chunk index out of range"));
        }
        let expected = self.block.chunk_size(self.state.xfer.chunk_size, index);
        if data.len() != expected as usize {
            warn!(index, len = data.len(), expected, "chunk has unexpected size");
            return Err(BlobSrvError::Discarded("unexpected chunk size"));
        }

        if self.phase == XferPhase::Suspended {
            self.resume(XferPhase::WaitingForChunk, handler);
        }
        if self.state.xfer.mode == XferMode::Pull {
            self.report.arm_in(now, SERVER_REPORT_DELAY);
        }
        self.reset_timer(now);

        if !self.block.missing.get(index as usize) {
            debug!(index, "duplicate chunk");
            return Ok(());
        }

        let offset = self.state.xfer.chunk_size as u32 * index as u32;
        let written = match self.io.as_mut() {
            Some(io) => io.write(&self.state.xfer, &self.block, offset, data).map_err(|e| e.to_string()),
            None => Err("no stream".to_string()),
        };
        if let Err(e) = written {
            warn!(block = self.block.number, index, error = %e, "chunk write failed");
            return Err(BlobSrvError::Stream(e));
        }

        self.block.missing.set(index as usize, false);
        if self.block.missing.any() {
            return Ok(());
        }

        debug!(block = self.block.number, "block complete");
        if self.state.xfer.mode == XferMode::Pull {
            self.block_report(net);
        }
        if let Some(io) = self.io.as_mut() {
            io.block_end(&self.state.xfer, &self.block);
        }
        self.state.blocks.set(self.block.number as usize, false);

        if self.state.blocks.any() || self.state.xfer.mode == XferMode::Pull {
            // A Pull-mode server stays here until the client confirms with
            // Transfer Get, or the receive timeout ends the transfer.
            self.phase_set(XferPhase::WaitingForBlock);
            self.store_state();
            return Ok(());
        }

        self.end(handler);
        Ok(())
    }
}
