//! Firmware Update Client — distributes one image to a set of targets.
//!
//! The procedure is layered on the [`BlobCli`]: Update Start goes out as a
//! broadcast through its engine, the image itself as a BLOB transfer, and
//! the later steps (refresh, apply, confirm, cancel) as further broadcasts.
//! Per target the client remembers the image index, the effect the update
//! will have and the last reported phase.
//!
//! Single-target requests (image list, metadata check, status) run
//! alongside, one at a time, each bounded by a request timeout.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use bytes::Bytes;
use mbt_core::config::{BlobClientConfig, DfuConfig};
use mbt_core::wire::{
    Address, BlobStatus, DfuEffect, DfuInfoStatus, DfuPhase, DfuStatus, FwImage, Message,
    MetadataStatus, UpdateStart, UpdateStatus, XferMode,
};
use tracing::{debug, info, warn};

use crate::blob::BlobXfer;
use crate::blob_cli::{
    BlobCli, BlobCliError, BlobCliEvent, BlobCliInputs, BroadcastMsg, BroadcastRequest, CliState,
};
use crate::stream::BlobStream;
use crate::timer::{earliest, Timer};
use crate::transport::{MsgCtx, Transport};

const TAG_START: u8 = 1;
const TAG_REFRESH: u8 = 2;
const TAG_APPLY: u8 = 3;
const TAG_CONFIRM: u8 = 4;
const TAG_CANCEL: u8 = 5;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DfuCliError {
    #[error("client is busy")]
    Busy,
    #[error("not allowed in state {0:?}")]
    InvalidState(DfuCliState),
    #[error("nothing to cancel")]
    Already,
    #[error("request timed out")]
    Timeout,
    #[error(transparent)]
    Blob(#[from] BlobCliError),
    #[error("unexpected message: {0}")]
    Unexpected(&'static str),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DfuCliState {
    Idle,
    Transfer,
    Refresh,
    Verified,
    Apply,
    Applied,
    Confirm,
    Cancel,
    Suspended,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DfuTargetSpec {
    pub addr: Address,
    pub img_idx: u8,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DfuCliInputs {
    pub targets: Vec<DfuTargetSpec>,
    pub group: Address,
    pub app_idx: u16,
    pub ttl: u8,
    pub timeout_base: u16,
}

/// Block and chunk size chosen by the caller, skipping capability retrieval.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlobParams {
    pub block_size_log: u8,
    pub chunk_size: u16,
}

/// The image to distribute.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DfuXfer {
    pub blob_id: u64,
    pub size: u32,
    pub fwid: Bytes,
    pub metadata: Bytes,
    /// Preferred transfer mode; the other one is used if no target offers it.
    pub mode: XferMode,
    pub blob_params: Option<BlobParams>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DfuTarget {
    pub addr: Address,
    pub img_idx: u8,
    pub effect: DfuEffect,
    /// `Success` while the target takes part, the failure reason otherwise.
    pub status: DfuStatus,
    pub phase: DfuPhase,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DfuRsp {
    Images { total: u8, images: Vec<FwImage> },
    Metadata(MetadataStatus),
    Status(UpdateStatus),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DfuCliEvent {
    LostTarget { addr: Address, status: DfuStatus },
    /// The transfer stage is over: `Success` once every remaining target
    /// verified the image, the failure reason otherwise.
    Ended(DfuStatus),
    Applied,
    Confirmed,
    Suspended,
    Response { addr: Address, result: Result<DfuRsp, DfuCliError> },
}

#[derive(Debug)]
enum ReqKind {
    Images { max: u8, total: u8, images: Vec<FwImage> },
    Metadata { img_idx: u8 },
    Status,
}

#[derive(Debug)]
struct Request {
    ctx: MsgCtx,
    kind: ReqKind,
}

pub struct DfuCli {
    cfg: DfuConfig,
    blob: BlobCli,
    state: DfuCliState,
    targets: Vec<DfuTarget>,
    xfer: Option<DfuXfer>,
    io: Option<Box<dyn BlobStream>>,
    completed: bool,
    req: Option<Request>,
    req_timer: Timer,
    events: VecDeque<DfuCliEvent>,
}

impl DfuCli {
    pub fn new(blob_cfg: BlobClientConfig, cfg: DfuConfig) -> Self {
        Self {
            cfg,
            blob: BlobCli::new(blob_cfg),
            state: DfuCliState::Idle,
            targets: Vec::new(),
            xfer: None,
            io: None,
            completed: false,
            req: None,
            req_timer: Timer::default(),
            events: VecDeque::new(),
        }
    }

    pub fn state(&self) -> DfuCliState {
        self.state
    }

    pub fn is_busy(&self) -> bool {
        self.state != DfuCliState::Idle
    }

    pub fn targets(&self) -> &[DfuTarget] {
        &self.targets
    }

    pub fn target(&self, addr: Address) -> Option<&DfuTarget> {
        self.targets.iter().find(|t| t.addr == addr)
    }

    pub fn blob(&self) -> &BlobCli {
        &self.blob
    }

    pub fn progress(&self) -> u8 {
        match self.state {
            DfuCliState::Transfer => self.blob.progress(),
            DfuCliState::Idle if !self.completed => 0,
            _ => 100,
        }
    }

    pub fn poll_event(&mut self) -> Option<DfuCliEvent> {
        self.events.pop_front()
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        earliest([self.blob.next_deadline(), self.req_timer.deadline()])
    }

    pub fn poll(&mut self, now: Instant, net: &mut dyn Transport) {
        self.blob.poll(now, net);
        if self.req_timer.fire(now) {
            if let Some(req) = self.req.take() {
                warn!(addr = format_args!("0x{:04x}", req.ctx.addr), "DFU request timed out");
                self.events.push_back(DfuCliEvent::Response {
                    addr: req.ctx.addr,
                    result: Err(DfuCliError::Timeout),
                });
            }
        }
        self.pump(now, net);
    }

    // ── Distribution ──────────────────────────────────────────────────────────

    /// Start distributing `xfer` from `io` to the given targets.
    pub fn send(
        &mut self,
        now: Instant,
        net: &mut dyn Transport,
        inputs: DfuCliInputs,
        xfer: DfuXfer,
        io: Box<dyn BlobStream>,
    ) -> Result<(), DfuCliError> {
        if self.is_busy() {
            return Err(DfuCliError::Busy);
        }
        self.blob.set_targets(BlobCliInputs {
            targets: inputs.targets.iter().map(|t| t.addr).collect(),
            group: inputs.group,
            app_idx: inputs.app_idx,
            ttl: inputs.ttl,
            timeout_base: inputs.timeout_base,
        })?;
        self.targets = inputs
            .targets
            .iter()
            .map(|t| DfuTarget {
                addr: t.addr,
                img_idx: t.img_idx,
                effect: DfuEffect::None,
                status: DfuStatus::Success,
                phase: DfuPhase::Unknown,
            })
            .collect();

        info!(
            blob_id = format_args!("0x{:016x}", xfer.blob_id),
            size = xfer.size,
            targets = self.targets.len(),
            "starting firmware distribution"
        );
        self.xfer = Some(xfer);
        self.io = Some(io);
        self.completed = false;
        self.state = DfuCliState::Transfer;
        self.initiate(now, net);
        self.pump(now, net);
        Ok(())
    }

    /// Pause the BLOB transfer.
    pub fn suspend(&mut self) -> Result<(), DfuCliError> {
        if self.state != DfuCliState::Transfer {
            return Err(DfuCliError::InvalidState(self.state));
        }
        self.blob.suspend()?;
        self.state = DfuCliState::Suspended;
        Ok(())
    }

    /// Continue a suspended transfer. Targets that only timed out rejoin.
    pub fn resume(&mut self, now: Instant, net: &mut dyn Transport) -> Result<(), DfuCliError> {
        if self.state != DfuCliState::Suspended {
            return Err(DfuCliError::InvalidState(self.state));
        }
        for t in &mut self.targets {
            if self.blob.target(t.addr).map_or(false, |b| b.timedout) {
                t.status = DfuStatus::Success;
            }
        }
        self.state = DfuCliState::Transfer;
        self.blob.resume(now, net)?;
        self.pump(now, net);
        Ok(())
    }

    /// Install the verified image on every target.
    pub fn apply(&mut self, now: Instant, net: &mut dyn Transport) -> Result<(), DfuCliError> {
        if self.state != DfuCliState::Verified {
            return Err(DfuCliError::InvalidState(self.state));
        }
        info!("applying firmware");
        self.state = DfuCliState::Apply;
        self.broadcast(now, net, BroadcastMsg::Fixed(Message::UpdateApply), TAG_APPLY, false);
        self.pump(now, net);
        Ok(())
    }

    /// Check that the targets now run the new firmware.
    pub fn confirm(&mut self, now: Instant, net: &mut dyn Transport) -> Result<(), DfuCliError> {
        if self.state != DfuCliState::Applied {
            return Err(DfuCliError::InvalidState(self.state));
        }
        info!("confirming firmware");
        self.state = DfuCliState::Confirm;
        let probe = Message::DfuInfoGet { first_index: 0, entries_limit: u8::MAX };
        self.broadcast(now, net, BroadcastMsg::Fixed(probe), TAG_CONFIRM, true);
        self.pump(now, net);
        Ok(())
    }

    /// Cancel the distribution, or with `target` cancel the update on one
    /// node only (answered through a [`DfuCliEvent::Response`]).
    pub fn cancel(
        &mut self,
        now: Instant,
        net: &mut dyn Transport,
        target: Option<MsgCtx>,
    ) -> Result<(), DfuCliError> {
        if let Some(ctx) = target {
            return self.request(now, net, ctx, Message::UpdateCancel, ReqKind::Status);
        }
        match self.state {
            DfuCliState::Idle => return Err(DfuCliError::Already),
            DfuCliState::Cancel => return Ok(()),
            _ => {}
        }
        info!(state = ?self.state, "cancelling firmware distribution");
        self.state = DfuCliState::Cancel;

        // A running BLOB transfer ends first and reports back through End.
        if !matches!(self.blob.state(), CliState::None | CliState::CapsGet) {
            self.blob.cancel(now, net);
        } else {
            self.blob.broadcast_abort();
            self.cancel_targets(now, net);
        }
        self.pump(now, net);
        Ok(())
    }

    // ── Requests ──────────────────────────────────────────────────────────────

    /// Read up to `max` entries of a node's firmware image list.
    pub fn imgs_get(
        &mut self,
        now: Instant,
        net: &mut dyn Transport,
        ctx: MsgCtx,
        max: u8,
    ) -> Result<(), DfuCliError> {
        let msg = Message::DfuInfoGet { first_index: 0, entries_limit: max };
        self.request(now, net, ctx, msg, ReqKind::Images { max, total: 0, images: Vec::new() })
    }

    /// Ask a node whether it would accept an image with `metadata`.
    pub fn metadata_check(
        &mut self,
        now: Instant,
        net: &mut dyn Transport,
        ctx: MsgCtx,
        img_idx: u8,
        metadata: Bytes,
    ) -> Result<(), DfuCliError> {
        let msg = Message::MetadataCheck { img_idx, metadata };
        self.request(now, net, ctx, msg, ReqKind::Metadata { img_idx })
    }

    pub fn status_get(&mut self, now: Instant, net: &mut dyn Transport, ctx: MsgCtx) -> Result<(), DfuCliError> {
        self.request(now, net, ctx, Message::UpdateGet, ReqKind::Status)
    }

    fn request(
        &mut self,
        now: Instant,
        net: &mut dyn Transport,
        ctx: MsgCtx,
        msg: Message,
        kind: ReqKind,
    ) -> Result<(), DfuCliError> {
        if self.req.is_some() {
            return Err(DfuCliError::Busy);
        }
        debug!(dst = format_args!("0x{:04x}", ctx.addr), opcode = format_args!("0x{:04x}", msg.opcode()), "DFU request");
        if let Err(e) = net.send(ctx, msg) {
            warn!(dst = format_args!("0x{:04x}", ctx.addr), error = %e, "failed to send DFU request");
        }
        self.req = Some(Request { ctx, kind });
        self.req_timer.arm_in(now, Duration::from_millis(self.cfg.request_timeout_ms));
        Ok(())
    }

    fn req_complete(&mut self, result: Result<DfuRsp, DfuCliError>) {
        self.req_timer.cancel();
        if let Some(req) = self.req.take() {
            self.events.push_back(DfuCliEvent::Response { addr: req.ctx.addr, result });
        }
    }

    fn req_for(&self, addr: Address) -> Option<&ReqKind> {
        self.req.as_ref().filter(|r| r.ctx.addr == addr).map(|r| &r.kind)
    }

    // ── Steps ─────────────────────────────────────────────────────────────────

    fn broadcast(&mut self, now: Instant, net: &mut dyn Transport, msg: BroadcastMsg, tag: u8, optional: bool) {
        let force_unicast = matches!(msg, BroadcastMsg::PerTarget(_));
        let req = BroadcastRequest { msg, tag, acked: true, optional, force_unicast };
        if let Err(e) = self.blob.broadcast(now, net, req) {
            warn!(tag, error = %e, "DFU broadcast refused");
            self.failed(DfuStatus::Internal);
        }
    }

    /// Send Update Start, per target if their image indices differ.
    fn initiate(&mut self, now: Instant, net: &mut dyn Transport) {
        let Some(xfer) = self.xfer.clone() else { return };
        let (ttl, timeout_base) = self.blob.inputs().map_or((0, 0), |i| (i.ttl, i.timeout_base));
        let start = |img_idx| {
            Message::UpdateStart(UpdateStart {
                ttl,
                timeout_base,
                blob_id: xfer.blob_id,
                img_idx,
                metadata: xfer.metadata.clone(),
            })
        };

        let first = self.targets.first().map_or(0, |t| t.img_idx);
        let msg = if self.targets.iter().all(|t| t.img_idx == first) {
            BroadcastMsg::Fixed(start(first))
        } else {
            BroadcastMsg::PerTarget(self.targets.iter().map(|t| (t.addr, start(t.img_idx))).collect())
        };
        self.broadcast(now, net, msg, TAG_START, false);
    }

    /// Update Start is out: move the image.
    fn transfer(&mut self, now: Instant, net: &mut dyn Transport) {
        if !self.blob.targets_active() {
            self.failed(DfuStatus::Internal);
            return;
        }
        let all_skip = self
            .blob
            .targets()
            .iter()
            .filter(|t| t.status == BlobStatus::Success)
            .all(|t| t.skip);
        if all_skip {
            info!("every target already has the image");
            self.refresh(now, net);
            return;
        }

        let Some((mode, params)) = self.xfer.as_ref().map(|x| (x.mode, x.blob_params)) else { return };
        match params {
            Some(p) => self.blob_send(now, net, mode, p.block_size_log, p.chunk_size),
            None => {
                if let Err(e) = self.blob.caps_get(now, net) {
                    warn!(error = %e, "capability retrieval refused");
                    self.failed(DfuStatus::Internal);
                }
            }
        }
    }

    fn caps_collected(&mut self, now: Instant, net: &mut dyn Transport, caps: Option<mbt_core::wire::BlobCaps>) {
        let wanted = self.xfer.as_ref().map(|x| (x.mode, x.size));
        let (Some(caps), Some((preferred, size))) = (caps, wanted) else {
            warn!("no target can receive the image");
            self.failed(DfuStatus::Resources);
            return;
        };
        let mode = if preferred.is_in(caps.modes) {
            preferred
        } else if XferMode::Push.is_in(caps.modes) {
            XferMode::Push
        } else {
            XferMode::Pull
        };
        if size > caps.max_size {
            warn!(size, max = caps.max_size, "image too large for targets");
            self.failed(DfuStatus::Resources);
            return;
        }
        self.blob_send(now, net, mode, caps.max_block_size_log, caps.max_chunk_size);
    }

    fn blob_send(&mut self, now: Instant, net: &mut dyn Transport, mode: XferMode, block_size_log: u8, chunk_size: u16) {
        let ids = self.xfer.as_ref().map(|x| (x.blob_id, x.size));
        let (Some((id, size)), Some(io)) = (ids, self.io.take()) else {
            self.failed(DfuStatus::Internal);
            return;
        };
        let blob = BlobXfer { id, size, mode, block_size_log, chunk_size };
        if let Err(e) = self.blob.send(now, net, blob, io) {
            warn!(error = %e, "BLOB transfer refused");
            self.failed(DfuStatus::Internal);
        }
    }

    /// Ask every target for its phase after the transfer.
    fn refresh(&mut self, now: Instant, net: &mut dyn Transport) {
        self.state = DfuCliState::Refresh;
        for addr in self.targets.iter().map(|t| t.addr).collect::<Vec<_>>() {
            if let Some(t) = self.blob.target_mut(addr) {
                t.skip = false;
            }
        }
        self.broadcast(now, net, BroadcastMsg::Fixed(Message::UpdateGet), TAG_REFRESH, false);
    }

    fn cancel_targets(&mut self, now: Instant, net: &mut dyn Transport) {
        self.broadcast(now, net, BroadcastMsg::Fixed(Message::UpdateCancel), TAG_CANCEL, true);
    }

    fn failed(&mut self, status: DfuStatus) {
        warn!(?status, state = ?self.state, "firmware distribution failed");
        self.state = DfuCliState::Idle;
        self.io = None;
        self.events.push_back(DfuCliEvent::Ended(status));
    }

    fn target_failed(&mut self, addr: Address, status: DfuStatus) {
        if let Some(b) = self.blob.target_mut(addr) {
            if b.status == BlobStatus::Success {
                b.status = BlobStatus::Internal;
            }
        }
        let Some(t) = self.targets.iter_mut().find(|t| t.addr == addr) else { return };
        if t.status != DfuStatus::Success {
            return;
        }
        warn!(addr = format_args!("0x{addr:04x}"), ?status, "DFU target failed");
        t.status = status;
        self.events.push_back(DfuCliEvent::LostTarget { addr, status });
    }

    fn broadcast_done(&mut self, now: Instant, net: &mut dyn Transport, tag: u8) {
        match (tag, self.state) {
            (TAG_START, DfuCliState::Transfer) => self.transfer(now, net),
            (TAG_REFRESH, DfuCliState::Refresh) => {
                if !self.blob.targets_active() {
                    self.failed(DfuStatus::Internal);
                    return;
                }
                info!("image verified on targets");
                self.state = DfuCliState::Verified;
                self.events.push_back(DfuCliEvent::Ended(DfuStatus::Success));
            }
            (TAG_APPLY, DfuCliState::Apply) => {
                if !self.blob.targets_active() {
                    self.failed(DfuStatus::Internal);
                    return;
                }
                self.state = DfuCliState::Applied;
                self.events.push_back(DfuCliEvent::Applied);
            }
            (TAG_CONFIRM, DfuCliState::Confirm) => self.confirmed(),
            (TAG_CANCEL, DfuCliState::Cancel) => self.failed(DfuStatus::Internal),
            (tag, state) => debug!(tag, ?state, "stale broadcast completion"),
        }
    }

    /// Silent targets expected to unprovision count as updated; every other
    /// target must have answered the probe.
    fn confirmed(&mut self) {
        let mut failed = Vec::new();
        for t in &self.targets {
            let Some(b) = self.blob.target(t.addr) else { continue };
            if b.status != BlobStatus::Success || t.status != DfuStatus::Success {
                continue;
            }
            let ok = if t.effect == DfuEffect::Unprov { !b.acked } else { b.acked };
            if !ok {
                failed.push(t.addr);
            }
        }
        for addr in failed {
            self.target_failed(addr, DfuStatus::Internal);
        }

        if !self.blob.targets_active() {
            self.failed(DfuStatus::Internal);
            return;
        }
        info!("firmware distribution confirmed");
        self.state = DfuCliState::Idle;
        self.completed = true;
        self.io = None;
        self.events.push_back(DfuCliEvent::Confirmed);
    }

    fn pump(&mut self, now: Instant, net: &mut dyn Transport) {
        while let Some(ev) = self.blob.poll_event() {
            match ev {
                BlobCliEvent::BroadcastDone { tag } => self.broadcast_done(now, net, tag),
                BlobCliEvent::Caps(caps) => {
                    if self.state == DfuCliState::Transfer {
                        self.caps_collected(now, net, caps);
                    }
                }
                BlobCliEvent::LostTarget { addr, reason } => self.blob_lost_target(addr, reason),
                BlobCliEvent::Suspended => {
                    if self.state == DfuCliState::Transfer {
                        self.state = DfuCliState::Suspended;
                        self.events.push_back(DfuCliEvent::Suspended);
                    }
                }
                BlobCliEvent::End { success, .. } => self.blob_end(now, net, success),
                BlobCliEvent::Progress { .. } | BlobCliEvent::ProgressComplete => {}
            }
        }
    }

    fn blob_lost_target(&mut self, addr: Address, reason: BlobStatus) {
        let Some(t) = self.targets.iter().find(|t| t.addr == addr) else { return };
        let expected_silence =
            matches!(self.state, DfuCliState::Apply | DfuCliState::Confirm) && t.effect == DfuEffect::Unprov;
        if expected_silence {
            debug!(addr = format_args!("0x{addr:04x}"), "unprovisioning target went silent");
            if let Some(b) = self.blob.target_mut(addr) {
                b.status = BlobStatus::Success;
                b.timedout = false;
            }
            return;
        }
        debug!(addr = format_args!("0x{addr:04x}"), ?reason, "BLOB target lost");
        let status = if self.state == DfuCliState::Apply { DfuStatus::WrongPhase } else { DfuStatus::Internal };
        self.target_failed(addr, status);
    }

    fn blob_end(&mut self, now: Instant, net: &mut dyn Transport, success: bool) {
        match self.state {
            DfuCliState::Transfer if success => {
                info!("image transferred");
                self.refresh(now, net);
            }
            DfuCliState::Cancel => self.cancel_targets(now, net),
            DfuCliState::Transfer | DfuCliState::Suspended => self.failed(DfuStatus::Internal),
            state => debug!(?state, success, "BLOB end outside transfer"),
        }
    }

    // ── Responses ─────────────────────────────────────────────────────────────

    pub fn handle_message(
        &mut self,
        now: Instant,
        net: &mut dyn Transport,
        ctx: MsgCtx,
        msg: &Message,
    ) -> Result<(), DfuCliError> {
        let res = if msg.is_blob() {
            self.blob.handle_message(now, net, ctx, msg).map_err(DfuCliError::from)
        } else {
            match msg {
                Message::UpdateStatus(s) => self.handle_status(now, net, ctx.addr, s),
                Message::DfuInfoStatus(s) => self.handle_info_status(now, net, ctx.addr, s),
                Message::MetadataStatus(s) => self.handle_metadata_status(ctx.addr, s),
                _ => Err(DfuCliError::Unexpected("not a DFU client message")),
            }
        };
        self.pump(now, net);
        res
    }

    fn handle_status(
        &mut self,
        now: Instant,
        net: &mut dyn Transport,
        src: Address,
        s: &UpdateStatus,
    ) -> Result<(), DfuCliError> {
        if matches!(self.req_for(src), Some(ReqKind::Status)) {
            self.req_complete(Ok(DfuRsp::Status(s.clone())));
            return Ok(());
        }
        if !matches!(
            self.state,
            DfuCliState::Transfer | DfuCliState::Refresh | DfuCliState::Apply | DfuCliState::Cancel
        ) {
            return Err(DfuCliError::Unexpected("not expecting update status"));
        }
        let Some(t) = self.targets.iter_mut().find(|t| t.addr == src) else {
            return Err(DfuCliError::Unexpected("status from unknown node"));
        };
        if self.blob.target(src).map_or(true, |b| b.status != BlobStatus::Success) {
            return Ok(());
        }

        t.phase = s.phase;
        if let Some(info) = &s.info {
            t.effect = info.effect;
        }
        let (effect, phase) = (t.effect, s.phase);

        let accepted_idle = self.state == DfuCliState::Apply
            && s.status == DfuStatus::WrongPhase
            && phase == DfuPhase::Idle
            && effect != DfuEffect::Unprov;
        if s.status != DfuStatus::Success && !accepted_idle {
            self.target_failed(src, s.status);
            self.blob.broadcast_ack(now, net, src)?;
            return Ok(());
        }

        match self.state {
            DfuCliState::Transfer => match phase {
                DfuPhase::Verify | DfuPhase::VerifyOk => {
                    debug!(addr = format_args!("0x{src:04x}"), "target already has the image");
                    if let Some(b) = self.blob.target_mut(src) {
                        b.skip = true;
                    }
                }
                DfuPhase::TransferActive | DfuPhase::TransferErr => {}
                _ => self.target_failed(src, DfuStatus::WrongPhase),
            },
            DfuCliState::Refresh => match phase {
                // Still verifying; asked again on the next retry.
                DfuPhase::Verify => return Ok(()),
                DfuPhase::VerifyOk | DfuPhase::Applying | DfuPhase::ApplySuccess => {}
                _ => self.target_failed(src, DfuStatus::WrongPhase),
            },
            DfuCliState::Apply => {
                if phase != DfuPhase::Applying && (effect == DfuEffect::Unprov || phase != DfuPhase::Idle) {
                    self.target_failed(src, DfuStatus::WrongPhase);
                }
            }
            _ => {}
        }
        self.blob.broadcast_ack(now, net, src)?;
        Ok(())
    }

    fn handle_info_status(
        &mut self,
        now: Instant,
        net: &mut dyn Transport,
        src: Address,
        s: &DfuInfoStatus,
    ) -> Result<(), DfuCliError> {
        if matches!(self.req_for(src), Some(ReqKind::Images { .. })) {
            self.images_page(now, net, s);
            return Ok(());
        }
        if self.state != DfuCliState::Confirm {
            return Err(DfuCliError::Unexpected("not expecting firmware information"));
        }
        let Some(t) = self.targets.iter().find(|t| t.addr == src) else {
            return Err(DfuCliError::Unexpected("information from unknown node"));
        };
        if self.blob.target(src).map_or(true, |b| b.status != BlobStatus::Success) {
            return Ok(());
        }

        let fwid = self.xfer.as_ref().map(|x| x.fwid.clone()).unwrap_or_default();
        let running = t
            .img_idx
            .checked_sub(s.first_index)
            .and_then(|i| s.images.get(i as usize))
            .map(|img| img.fwid.clone());
        if t.effect == DfuEffect::Unprov {
            warn!(addr = format_args!("0x{src:04x}"), "target should have unprovisioned");
            self.target_failed(src, DfuStatus::Internal);
        } else if running.as_ref() != Some(&fwid) {
            warn!(addr = format_args!("0x{src:04x}"), running = ?running.map(hex::encode), "new firmware not running");
            self.target_failed(src, DfuStatus::Internal);
        }
        self.blob.broadcast_ack(now, net, src)?;
        Ok(())
    }

    fn images_page(&mut self, now: Instant, net: &mut dyn Transport, s: &DfuInfoStatus) {
        let Some(Request { ctx, kind: ReqKind::Images { max, total, images } }) = self.req.as_mut() else {
            return;
        };
        if s.first_index as usize != images.len() {
            debug!(first = s.first_index, have = images.len(), "out of order image page");
            return;
        }
        *total = s.total;
        let room = (*max as usize).saturating_sub(images.len());
        images.extend(s.images.iter().take(room).cloned());

        let have = images.len();
        let more = !s.images.is_empty() && have < *max as usize && have < s.total as usize;
        if more {
            let msg = Message::DfuInfoGet { first_index: have as u8, entries_limit: *max - have as u8 };
            let ctx = *ctx;
            if let Err(e) = net.send(ctx, msg) {
                warn!(error = %e, "failed to request next image page");
            }
            self.req_timer.arm_in(now, Duration::from_millis(self.cfg.request_timeout_ms));
            return;
        }

        let (total, images) = (*total, std::mem::take(images));
        self.req_complete(Ok(DfuRsp::Images { total, images }));
    }

    fn handle_metadata_status(&mut self, src: Address, s: &MetadataStatus) -> Result<(), DfuCliError> {
        match self.req_for(src) {
            Some(ReqKind::Metadata { img_idx }) if *img_idx == s.img_idx => {
                self.req_complete(Ok(DfuRsp::Metadata(*s)));
                Ok(())
            }
            _ => Err(DfuCliError::Unexpected("no metadata check pending")),
        }
    }
}
