//! BLOB Transfer Client — sends one BLOB to a set of targets.
//!
//! The procedure runs as a chain of broadcast steps (see [`tx`]):
//! capabilities, Transfer Start, then per block Block Start, chunks and a
//! block check, and finally a transfer check. Targets that fail a step are
//! dropped and reported; the transfer succeeds if at least one target is
//! still active at the end.
//!
//! Like every model in this crate the client is sans-IO. Callers feed it
//! responses through [`BlobCli::handle_message`], call [`BlobCli::poll`] at
//! [`BlobCli::next_deadline`], and drain outcomes with
//! [`BlobCli::poll_event`].

mod tx;

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use mbt_core::config::BlobClientConfig;
use mbt_core::timeout::client_timeout;
use mbt_core::wire::{
    Address, BlobCaps, BlobStatus, BlockStatus, Message, MissingChunks, XferMode, XferPhase,
    XferStatus, MODES_ALL,
};
use mbt_core::Bitmap;
use tracing::{debug, info, warn};

use crate::blob::{BlobXfer, Block, BLOCK_SIZE_LOG_MAX, BLOCK_SIZE_LOG_MIN, CHUNK_SIZE_MIN};
use crate::stream::{BlobStream, IoMode};
use crate::timer::earliest;
use crate::transport::{MsgCtx, Transport};

pub use tx::{BroadcastMsg, BroadcastRequest};
use tx::{Broadcast, Tx, TxMsg};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BlobCliError {
    #[error("client is busy")]
    Busy,
    #[error("invalid transfer parameters: {0}")]
    InvalidParams(&'static str),
    #[error("no targets")]
    NoTargets,
    #[error("operation not allowed in state {0:?}")]
    InvalidState(CliState),
    #[error("stream: {0}")]
    Io(String),
    #[error("0x{0:04x} is not a target")]
    UnknownTarget(Address),
    #[error("unexpected message: {0}")]
    Unexpected(&'static str),
}

/// Where the messages of a transfer go.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlobCliInputs {
    pub targets: Vec<Address>,
    /// Group address shared by the targets, `ADDR_UNASSIGNED` for unicast.
    pub group: Address,
    pub app_idx: u16,
    pub ttl: u8,
    pub timeout_base: u16,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PullState {
    /// Chunks of the current block the target asked for.
    pub missing: Bitmap,
    /// Don't send again before this instant.
    pub report_deadline: Option<Instant>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlobTarget {
    pub addr: Address,
    /// `Success` while the target takes part in the transfer, the reason it
    /// was dropped otherwise.
    pub status: BlobStatus,
    pub acked: bool,
    pub procedure_complete: bool,
    pub timedout: bool,
    /// Left out of broadcasts without being dropped.
    pub skip: bool,
    pub pull: Option<PullState>,
}

impl BlobTarget {
    fn new(addr: Address) -> Self {
        Self {
            addr,
            status: BlobStatus::Success,
            acked: false,
            procedure_complete: false,
            timedout: false,
            skip: false,
            pull: None,
        }
    }

    /// Takes part in the current step and may answer it.
    fn listening(&self) -> bool {
        self.status == BlobStatus::Success && !self.skip
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CliState {
    None,
    CapsGet,
    Start,
    BlockStart,
    BlockSend,
    BlockCheck,
    XferCheck,
    Cancel,
    Suspended,
    XferProgressGet,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BlobCliEvent {
    /// Capability retrieval finished; `None` when no target is left.
    Caps(Option<BlobCaps>),
    LostTarget { addr: Address, reason: BlobStatus },
    /// Every remaining target timed out. Resume with [`BlobCli::resume`].
    Suspended,
    End { xfer: BlobXfer, success: bool },
    Progress { addr: Address, status: XferStatus },
    ProgressComplete,
    /// A broadcast started with [`BlobCli::broadcast`] finished.
    BroadcastDone { tag: u8 },
}

/// What runs once the current broadcast is over.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
enum Step {
    #[default]
    Idle,
    CapsCollected,
    BlockStart,
    ChunkSend,
    ChunkSendEnd,
    BlockCheckEnd,
    TransferComplete,
    ProgressChecked,
    TransferCancel,
    External(u8),
}

enum Missing {
    All,
    None,
    Bits(Bitmap),
}

pub struct BlobCli {
    cfg: BlobClientConfig,
    state: CliState,
    inputs: Option<BlobCliInputs>,
    targets: Vec<BlobTarget>,
    xfer: Option<BlobXfer>,
    io: Option<Box<dyn BlobStream>>,
    caps: BlobCaps,
    block: Block,
    block_count: u32,
    chunk_idx: u16,
    last_chunk_sent: bool,
    tx: Tx,
    queued: Option<Step>,
    events: VecDeque<BlobCliEvent>,
}

impl BlobCli {
    pub fn new(cfg: BlobClientConfig) -> Self {
        Self {
            cfg,
            state: CliState::None,
            inputs: None,
            targets: Vec::new(),
            xfer: None,
            io: None,
            caps: BlobCaps::default(),
            block: Block::default(),
            block_count: 0,
            chunk_idx: 0,
            last_chunk_sent: false,
            tx: Tx::default(),
            queued: None,
            events: VecDeque::new(),
        }
    }

    pub fn state(&self) -> CliState {
        self.state
    }

    pub fn is_busy(&self) -> bool {
        self.state != CliState::None
    }

    pub fn targets(&self) -> &[BlobTarget] {
        &self.targets
    }

    pub fn target(&self, addr: Address) -> Option<&BlobTarget> {
        self.targets.iter().find(|t| t.addr == addr)
    }

    pub fn target_mut(&mut self, addr: Address) -> Option<&mut BlobTarget> {
        self.targets.iter_mut().find(|t| t.addr == addr)
    }

    fn target_index(&self, addr: Address) -> Result<usize, BlobCliError> {
        self.targets
            .iter()
            .position(|t| t.addr == addr)
            .ok_or(BlobCliError::UnknownTarget(addr))
    }

    pub fn inputs(&self) -> Option<&BlobCliInputs> {
        self.inputs.as_ref()
    }

    pub fn xfer(&self) -> Option<&BlobXfer> {
        self.xfer.as_ref()
    }

    /// Is any target still taking part?
    pub fn targets_active(&self) -> bool {
        self.targets.iter().any(|t| t.status == BlobStatus::Success)
    }

    fn targets_timedout(&self) -> bool {
        self.targets.iter().any(|t| t.timedout)
    }

    /// Percentage of blocks confirmed by the targets.
    pub fn progress(&self) -> u8 {
        match self.state {
            CliState::None | CliState::CapsGet => 0,
            // Every block is in, only the final Transfer Get is left.
            CliState::XferCheck => 100,
            _ if self.block_count == 0 => 0,
            _ => (100 * self.block.number as u32 / self.block_count).min(100) as u8,
        }
    }

    pub fn poll_event(&mut self) -> Option<BlobCliEvent> {
        self.events.pop_front()
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        earliest([self.tx.complete.deadline(), self.tx.retry.deadline()])
    }

    pub fn poll(&mut self, now: Instant, net: &mut dyn Transport) {
        if self.tx.complete.fire(now) {
            self.on_tx_complete(now, net);
            self.run(now, net);
        }
        if self.tx.retry.fire(now) {
            self.on_retry_timeout(now, net);
            self.run(now, net);
        }
    }

    /// Replace the target list. Every target starts out active.
    pub fn set_targets(&mut self, inputs: BlobCliInputs) -> Result<(), BlobCliError> {
        if self.is_busy() || self.tx.inited {
            return Err(BlobCliError::Busy);
        }
        if inputs.targets.is_empty() {
            return Err(BlobCliError::NoTargets);
        }
        self.targets = inputs.targets.iter().copied().map(BlobTarget::new).collect();
        self.inputs = Some(inputs);
        Ok(())
    }

    /// Ask every target for its capabilities and intersect them. Incompatible
    /// targets are dropped. Finishes with [`BlobCliEvent::Caps`].
    pub fn caps_get(&mut self, now: Instant, net: &mut dyn Transport) -> Result<(), BlobCliError> {
        if self.is_busy() {
            return Err(BlobCliError::Busy);
        }
        if self.inputs.is_none() {
            return Err(BlobCliError::NoTargets);
        }
        self.caps = BlobCaps {
            min_block_size_log: BLOCK_SIZE_LOG_MIN,
            max_block_size_log: BLOCK_SIZE_LOG_MAX,
            max_chunks: self.cfg.max_chunks,
            max_chunk_size: self.cfg.max_chunk_size,
            max_size: u32::MAX,
            mtu_size: u16::MAX,
            modes: MODES_ALL,
        };
        self.state = CliState::CapsGet;
        info!("retrieving BLOB capabilities");
        self.broadcast_start(now, net, Broadcast::acked(TxMsg::InfoGet, Step::CapsCollected));
        self.run(now, net);
        Ok(())
    }

    /// Send `xfer` from `io` to the current targets.
    pub fn send(
        &mut self,
        now: Instant,
        net: &mut dyn Transport,
        xfer: BlobXfer,
        mut io: Box<dyn BlobStream>,
    ) -> Result<(), BlobCliError> {
        if self.is_busy() {
            return Err(BlobCliError::Busy);
        }
        if self.inputs.is_none() || !self.targets_active() {
            return Err(BlobCliError::NoTargets);
        }
        if !matches!(xfer.mode, XferMode::Push | XferMode::Pull) {
            return Err(BlobCliError::InvalidParams("mode"));
        }
        if !(BLOCK_SIZE_LOG_MIN..=BLOCK_SIZE_LOG_MAX).contains(&xfer.block_size_log) {
            return Err(BlobCliError::InvalidParams("block size"));
        }
        if xfer.chunk_size < CHUNK_SIZE_MIN || xfer.chunk_size > self.cfg.max_chunk_size {
            return Err(BlobCliError::InvalidParams("chunk size"));
        }
        if xfer.size == 0 {
            return Err(BlobCliError::InvalidParams("empty BLOB"));
        }
        let chunks_per_block = crate::blob::chunk_count(
            crate::blob::block_size(xfer.size, xfer.block_size_log, 0),
            xfer.chunk_size,
        );
        if chunks_per_block > self.cfg.max_chunks as u32 {
            return Err(BlobCliError::InvalidParams("too many chunks per block"));
        }
        io.open(&xfer, IoMode::Read).map_err(|e| BlobCliError::Io(e.to_string()))?;

        info!(
            id = format_args!("0x{:016x}", xfer.id),
            size = xfer.size,
            mode = ?xfer.mode,
            block_size_log = xfer.block_size_log,
            chunk_size = xfer.chunk_size,
            "starting BLOB transfer"
        );
        self.xfer = Some(xfer);
        self.io = Some(io);
        self.block_count = xfer.block_count();
        self.block_set(0);
        self.xfer_start(now, net);
        self.run(now, net);
        Ok(())
    }

    /// Stop the transfer and tell the targets.
    pub fn cancel(&mut self, now: Instant, net: &mut dyn Transport) {
        if !self.is_busy() {
            debug!("no transfer to cancel");
            return;
        }
        info!(state = ?self.state, "cancelling BLOB transfer");
        match self.state {
            CliState::CapsGet => self.reset_state(),
            CliState::Suspended => self.end(false),
            CliState::Cancel => {}
            _ if !self.tx.inited && !self.tx.sending => {
                // Idle between broadcasts, e.g. waiting for Pull reports.
                self.tx.retry.cancel();
                self.queued = Some(Step::TransferCancel);
            }
            _ => {
                self.tx.cancelled = true;
                self.state = CliState::Cancel;
            }
        }
        self.run(now, net);
    }

    /// Pause a running transfer between steps. Only possible before the last
    /// block goes out.
    pub fn suspend(&mut self) -> Result<(), BlobCliError> {
        if !matches!(self.state, CliState::BlockStart | CliState::BlockSend | CliState::BlockCheck) {
            return Err(BlobCliError::InvalidState(self.state));
        }
        if self.last_chunk_sent {
            return Err(BlobCliError::InvalidState(self.state));
        }
        self.tx.retry.cancel();
        self.tx.complete.cancel();
        self.tx.inited = false;
        self.tx.sending = false;
        self.state = CliState::Suspended;
        info!("BLOB transfer suspended");
        Ok(())
    }

    /// Continue a suspended transfer from the first block. Targets that timed
    /// out get another chance.
    pub fn resume(&mut self, now: Instant, net: &mut dyn Transport) -> Result<(), BlobCliError> {
        if self.state != CliState::Suspended {
            return Err(BlobCliError::InvalidState(self.state));
        }
        for t in &mut self.targets {
            if t.timedout {
                t.status = BlobStatus::Success;
                t.timedout = false;
            }
        }
        info!("resuming BLOB transfer");
        self.block_set(0);
        self.xfer_start(now, net);
        self.run(now, net);
        Ok(())
    }

    /// Cancel `xfer` on the targets without having started it, e.g. after
    /// the client lost its own state.
    pub fn send_cancel(
        &mut self,
        now: Instant,
        net: &mut dyn Transport,
        xfer: BlobXfer,
    ) -> Result<(), BlobCliError> {
        if self.is_busy() {
            return Err(BlobCliError::Busy);
        }
        if self.inputs.is_none() {
            return Err(BlobCliError::NoTargets);
        }
        self.xfer = Some(xfer);
        self.transfer_cancel(now, net);
        self.run(now, net);
        Ok(())
    }

    /// Query every target's transfer status. Each answer is reported as
    /// [`BlobCliEvent::Progress`], then [`BlobCliEvent::ProgressComplete`].
    pub fn xfer_progress_get(
        &mut self,
        now: Instant,
        net: &mut dyn Transport,
    ) -> Result<(), BlobCliError> {
        if self.is_busy() {
            return Err(BlobCliError::Busy);
        }
        if self.inputs.is_none() {
            return Err(BlobCliError::NoTargets);
        }
        self.state = CliState::XferProgressGet;
        self.broadcast_start(now, net, Broadcast::acked(TxMsg::XferGet, Step::ProgressChecked));
        self.run(now, net);
        Ok(())
    }

    pub fn handle_message(
        &mut self,
        now: Instant,
        net: &mut dyn Transport,
        ctx: MsgCtx,
        msg: &Message,
    ) -> Result<(), BlobCliError> {
        let res = match msg {
            Message::InfoStatus(caps) => self.handle_info_status(ctx.addr, caps),
            Message::XferStatus(status) => self.handle_xfer_status(ctx.addr, status),
            Message::BlockStatus(status) => self.handle_block_status(ctx.addr, status),
            Message::BlockReport { missing } => self.handle_block_report(now, ctx.addr, missing),
            _ => Err(BlobCliError::Unexpected("not a BLOB client message")),
        };
        self.run(now, net);
        res
    }

    // ── Steps ─────────────────────────────────────────────────────────────────

    fn run(&mut self, now: Instant, net: &mut dyn Transport) {
        while let Some(step) = self.queued.take() {
            match step {
                Step::Idle => {}
                Step::CapsCollected => self.caps_collected(),
                Step::BlockStart => self.block_start(now, net),
                Step::ChunkSend => self.chunk_send(now, net),
                Step::ChunkSendEnd => self.chunk_send_end(now, net),
                Step::BlockCheckEnd => self.block_check_end(now, net),
                Step::TransferComplete => self.transfer_complete(),
                Step::ProgressChecked => self.progress_checked(),
                Step::TransferCancel => self.transfer_cancel(now, net),
                Step::External(tag) => self.events.push_back(BlobCliEvent::BroadcastDone { tag }),
            }
        }
    }

    fn reset_state(&mut self) {
        self.tx.retry.cancel();
        self.tx.complete.cancel();
        self.tx.inited = false;
        self.tx.sending = false;
        self.tx.cli_deadline = None;
        self.state = CliState::None;
        self.xfer = None;
        self.io = None;
        self.last_chunk_sent = false;
    }

    fn end(&mut self, success: bool) {
        let xfer = self.xfer.unwrap_or_default();
        if let Some(mut io) = self.io.take() {
            io.close(&xfer);
        }
        info!(id = format_args!("0x{:016x}", xfer.id), success, "BLOB transfer ended");
        self.reset_state();
        self.events.push_back(BlobCliEvent::End { xfer, success });
    }

    fn caps_collected(&mut self) {
        let success = self.targets_active();
        self.reset_state();

        if success {
            let caps = &mut self.caps;
            while caps.max_block_size_log > caps.min_block_size_log
                && (1u64 << caps.max_block_size_log)
                    > caps.max_chunk_size as u64 * caps.max_chunks as u64
            {
                caps.max_block_size_log -= 1;
            }
            info!(caps = ?self.caps, "capabilities collected");
        } else {
            warn!("no compatible targets");
        }
        self.events.push_back(BlobCliEvent::Caps(success.then_some(self.caps)));
    }

    fn block_set(&mut self, idx: u16) {
        let Some(xfer) = self.xfer else { return };
        self.block = xfer.block(idx, xfer.chunk_size);
        self.chunk_idx = 0;
        if xfer.mode == XferMode::Push {
            self.block.missing.set_all();
            return;
        }
        let chunks = self.block.chunk_count as usize;
        for t in &mut self.targets {
            match t.pull.as_mut() {
                Some(p) => {
                    p.missing = Bitmap::new(chunks);
                    p.report_deadline = None;
                }
                None => t.pull = Some(PullState { missing: Bitmap::new(chunks), report_deadline: None }),
            }
        }
    }

    fn xfer_start(&mut self, now: Instant, net: &mut dyn Transport) {
        self.state = CliState::Start;
        self.broadcast_start(now, net, Broadcast::acked(TxMsg::XferStart, Step::BlockStart));
    }

    fn enter_suspended(&mut self) {
        warn!("all targets timed out, suspending transfer");
        self.state = CliState::Suspended;
        self.tx.retry.cancel();
        self.events.push_back(BlobCliEvent::Suspended);
    }

    fn block_start(&mut self, now: Instant, net: &mut dyn Transport) {
        if !self.targets_active() {
            if self.targets_timedout() {
                self.enter_suspended();
            } else {
                self.end(false);
            }
            return;
        }
        let Some(xfer) = self.xfer else { return };
        debug!(block = self.block.number, chunks = self.block.chunk_count, "block start");

        self.chunk_idx = 0;
        self.state = CliState::BlockStart;
        self.tx.cli_deadline = None;
        for t in &mut self.targets {
            t.procedure_complete = false;
            if let Some(p) = t.pull.as_mut() {
                p.report_deadline = None;
            }
        }

        if let Some(io) = self.io.as_mut() {
            if let Err(e) = io.block_start(&xfer, &self.block) {
                warn!(block = self.block.number, error = %e, "stream refused block");
                self.transfer_cancel(now, net);
                return;
            }
        }
        self.broadcast_start(now, net, Broadcast::acked(TxMsg::BlockStart, Step::ChunkSend));
    }

    fn chunk_send(&mut self, now: Instant, net: &mut dyn Transport) {
        if !self.targets_active() {
            if self.targets_timedout() {
                self.enter_suspended();
            } else {
                self.end(false);
            }
            return;
        }
        self.state = CliState::BlockSend;
        let ctx = Broadcast {
            send: TxMsg::Chunk,
            next: Step::ChunkSendEnd,
            post_send_delay: Duration::from_millis(self.cfg.chunk_interval_ms),
            chunk_sent_hook: true,
            ..Broadcast::default()
        };
        self.broadcast_start(now, net, ctx);
    }

    fn chunk_send_end(&mut self, now: Instant, net: &mut dyn Transport) {
        let next = self.block.missing.next_set(self.chunk_idx as usize + 1);
        let pull = self.xfer.map_or(false, |x| x.mode == XferMode::Pull);
        if !pull {
            self.block.missing.set(self.chunk_idx as usize, false);
        }
        match next {
            Some(idx) => {
                self.chunk_idx = idx as u16;
                self.chunk_send(now, net);
            }
            None if pull => self.block_report_wait(now),
            None => self.block_check(now, net),
        }
    }

    fn block_check(&mut self, now: Instant, net: &mut dyn Transport) {
        self.state = CliState::BlockCheck;
        debug!(block = self.block.number, "checking block");
        self.broadcast_start(now, net, Broadcast::acked(TxMsg::BlockGet, Step::BlockCheckEnd));
    }

    /// Pull mode: all requested chunks are out, wait for the next reports.
    fn block_report_wait(&mut self, now: Instant) {
        self.tx.ctx = Broadcast { next: Step::BlockCheckEnd, ..Broadcast::default() };
        if self.tx.cli_deadline.is_none() {
            let (ttl, timeout_base) = self.inputs.as_ref().map_or((0, 0), |i| (i.ttl, i.timeout_base));
            self.tx.cli_deadline = Some(now + client_timeout(ttl, timeout_base));
        }
        self.start_retry_timer(now);
    }

    fn block_check_end(&mut self, now: Instant, net: &mut dyn Transport) {
        if !self.targets_active() {
            if self.targets_timedout() {
                self.enter_suspended();
            } else {
                self.end(false);
            }
            return;
        }

        if let Some(idx) = self.block.missing.next_set(0) {
            debug!(block = self.block.number, missing = self.block.missing.count_set(), "resending missing chunks");
            self.chunk_idx = idx as u16;
            self.chunk_send(now, net);
            return;
        }

        if let (Some(io), Some(xfer)) = (self.io.as_mut(), self.xfer) {
            io.block_end(&xfer, &self.block);
        }

        let next = self.block.number as u32 + 1;
        if next >= self.block_count {
            self.confirm_transfer(now, net);
            return;
        }
        self.block_set(next as u16);
        self.queued = Some(Step::BlockStart);
    }

    fn confirm_transfer(&mut self, now: Instant, net: &mut dyn Transport) {
        debug!("confirming transfer");
        self.state = CliState::XferCheck;
        self.broadcast_start(now, net, Broadcast::acked(TxMsg::XferGet, Step::TransferComplete));
    }

    fn transfer_cancel(&mut self, now: Instant, net: &mut dyn Transport) {
        self.state = CliState::Cancel;
        self.broadcast_start(now, net, Broadcast::acked(TxMsg::XferCancel, Step::TransferComplete));
    }

    fn transfer_complete(&mut self) {
        let success = self.targets_active() && self.state == CliState::XferCheck;
        self.end(success);
    }

    fn progress_checked(&mut self) {
        self.reset_state();
        self.events.push_back(BlobCliEvent::ProgressComplete);
    }

    fn update_missing_chunks(&mut self) {
        self.block.missing.clear_all();
        for t in &self.targets {
            if t.procedure_complete || t.timedout || t.status != BlobStatus::Success {
                continue;
            }
            if let Some(p) = &t.pull {
                self.block.missing.union_with(&p.missing);
            }
        }
    }

    // ── Responses ─────────────────────────────────────────────────────────────

    fn handle_info_status(&mut self, src: Address, caps: &BlobCaps) -> Result<(), BlobCliError> {
        if self.state != CliState::CapsGet {
            return Err(BlobCliError::Unexpected("not collecting capabilities"));
        }
        if caps.min_block_size_log < BLOCK_SIZE_LOG_MIN
            || caps.max_block_size_log > BLOCK_SIZE_LOG_MAX
            || caps.min_block_size_log > caps.max_block_size_log
            || caps.max_chunks == 0
            || caps.max_chunk_size < CHUNK_SIZE_MIN
            || caps.max_size == 0
            || caps.mtu_size < 0x14
        {
            warn!(src = format_args!("0x{src:04x}"), "invalid capabilities");
            return Err(BlobCliError::Unexpected("invalid capabilities"));
        }

        let idx = self.target_index(src)?;
        if !self.targets[idx].listening() {
            return Ok(());
        }
        let status = self.caps_adjust(caps);
        if status != BlobStatus::Success {
            self.target_drop(idx, status);
        }
        self.broadcast_rsp(idx);
        Ok(())
    }

    fn caps_adjust(&mut self, caps: &BlobCaps) -> BlobStatus {
        let ours = &mut self.caps;
        if caps.modes & ours.modes == 0 {
            return BlobStatus::UnsupportedMode;
        }
        if caps.max_block_size_log < ours.min_block_size_log
            || caps.min_block_size_log > ours.max_block_size_log
        {
            return BlobStatus::InvalidBlockSize;
        }
        ours.min_block_size_log = ours.min_block_size_log.max(caps.min_block_size_log);
        ours.max_block_size_log = ours.max_block_size_log.min(caps.max_block_size_log);
        ours.max_chunks = ours.max_chunks.min(caps.max_chunks);
        ours.max_chunk_size = ours.max_chunk_size.min(caps.max_chunk_size);
        ours.max_size = ours.max_size.min(caps.max_size);
        ours.mtu_size = ours.mtu_size.min(caps.mtu_size);
        ours.modes &= caps.modes;
        BlobStatus::Success
    }

    fn handle_xfer_status(&mut self, src: Address, status: &XferStatus) -> Result<(), BlobCliError> {
        let expected: &[XferPhase] = match self.state {
            CliState::Start => &[XferPhase::WaitingForBlock, XferPhase::WaitingForChunk],
            CliState::XferCheck => &[XferPhase::Complete],
            CliState::Cancel => &[XferPhase::Inactive],
            CliState::XferProgressGet => {
                let idx = self.target_index(src)?;
                if !self.targets[idx].listening() {
                    return Ok(());
                }
                self.events.push_back(BlobCliEvent::Progress { addr: src, status: status.clone() });
                self.broadcast_rsp(idx);
                return Ok(());
            }
            _ => return Err(BlobCliError::Unexpected("not expecting transfer status")),
        };

        let idx = self.target_index(src)?;
        if !self.targets[idx].listening() {
            return Ok(());
        }
        let id = self.xfer.map_or(0, |x| x.id);

        if status.status != BlobStatus::Success {
            self.target_drop(idx, status.status);
        } else if !expected.contains(&status.phase) {
            debug!(src = format_args!("0x{src:04x}"), phase = ?status.phase, "unexpected phase");
            return Ok(());
        } else if status.phase != XferPhase::Inactive && status.id != Some(id) {
            self.target_drop(idx, BlobStatus::WrongBlobId);
        }
        self.broadcast_rsp(idx);
        Ok(())
    }

    fn handle_block_status(&mut self, src: Address, status: &BlockStatus) -> Result<(), BlobCliError> {
        if self.xfer.is_none() {
            return Err(BlobCliError::Unexpected("no transfer"));
        }
        if !matches!(self.state, CliState::BlockStart | CliState::BlockSend | CliState::BlockCheck) {
            return Err(BlobCliError::Unexpected("not expecting block status"));
        }
        let idx = self.target_index(src)?;
        if !self.targets[idx].listening() {
            return Ok(());
        }

        let chunks = self.block.chunk_count as usize;
        let missing = match &status.missing {
            MissingChunks::All => Missing::All,
            MissingChunks::None => Missing::None,
            MissingChunks::Some(bytes) => Missing::Bits(Bitmap::from_bytes(chunks, bytes)),
            MissingChunks::Encoded(list) if list.is_empty() => Missing::None,
            MissingChunks::Encoded(list) => Missing::Bits(bitmap_from_list(chunks, list)?),
        };
        self.rx_block_status(idx, status.status, status.block, missing);
        Ok(())
    }

    fn handle_block_report(
        &mut self,
        now: Instant,
        src: Address,
        missing: &[u16],
    ) -> Result<(), BlobCliError> {
        let Some(xfer) = self.xfer else {
            return Err(BlobCliError::Unexpected("no transfer"));
        };
        if xfer.mode != XferMode::Pull {
            return Err(BlobCliError::Unexpected("block report outside Pull mode"));
        }
        if !matches!(self.state, CliState::BlockStart | CliState::BlockSend | CliState::BlockCheck) {
            return Err(BlobCliError::Unexpected("not expecting block report"));
        }
        let idx = self.target_index(src)?;
        if !self.targets[idx].listening() {
            return Ok(());
        }
        let waiting = self.targets[idx].pull.as_ref().map_or(false, |p| p.missing.any());
        if !waiting {
            debug!(src = format_args!("0x{src:04x}"), "report from target that has its chunks");
            return Ok(());
        }

        let (ttl, timeout_base) = self.inputs.as_ref().map_or((0, 0), |i| (i.ttl, i.timeout_base));
        self.tx.cli_deadline = Some(now + client_timeout(ttl, timeout_base));

        let missing = if missing.is_empty() {
            Missing::None
        } else {
            Missing::Bits(bitmap_from_list(self.block.chunk_count as usize, missing)?)
        };
        self.rx_block_status(idx, BlobStatus::Success, self.block.number, missing);
        Ok(())
    }

    fn rx_block_status(&mut self, idx: usize, status: BlobStatus, number: u16, missing: Missing) {
        if status != BlobStatus::Success && status != BlobStatus::InfoUnavailable {
            self.target_drop(idx, status);
            self.broadcast_rsp(idx);
            return;
        }
        if number != self.block.number {
            debug!(got = number, want = self.block.number, "status for another block");
            return;
        }

        let pull = self.xfer.map_or(false, |x| x.mode == XferMode::Pull);
        let chunks = self.block.chunk_count as usize;
        match missing {
            Missing::None => {
                self.targets[idx].procedure_complete = true;
                if pull {
                    if let Some(p) = self.targets[idx].pull.as_mut() {
                        p.missing.clear_all();
                    }
                    self.update_missing_chunks();
                }
                debug!(addr = format_args!("0x{:04x}", self.targets[idx].addr), "target has the block");
            }
            Missing::All if pull => {
                if let Some(p) = self.targets[idx].pull.as_mut() {
                    p.missing = Bitmap::filled(chunks);
                    p.report_deadline = None;
                }
                self.update_missing_chunks();
            }
            Missing::All => self.block.missing.set_all(),
            Missing::Bits(bits) if pull => {
                if let Some(p) = self.targets[idx].pull.as_mut() {
                    p.missing = bits;
                    p.report_deadline = None;
                }
                self.update_missing_chunks();
            }
            Missing::Bits(bits) => self.block.missing.union_with(&bits),
        }

        if self.pull_sending() {
            if !self.tx.sending && !self.tx.inited {
                self.broadcast_complete();
            }
            return;
        }
        self.broadcast_rsp(idx);
    }
}

fn bitmap_from_list(len: usize, list: &[u16]) -> Result<Bitmap, BlobCliError> {
    let mut bits = Bitmap::new(len);
    for &idx in list {
        if idx as usize >= len {
            return Err(BlobCliError::Unexpected("missing chunk outside block"));
        }
        bits.set(idx as usize, true);
    }
    Ok(bits)
}
