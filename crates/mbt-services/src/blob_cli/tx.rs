//! Broadcast engine.
//!
//! Every step of a transfer is a broadcast: one message to every active
//! target, through the group address or unicast to each target in turn,
//! followed by collection of responses with bounded retries. Targets that
//! stay silent are dropped unless the step is optional.
//!
//! Each send completes through the `complete` timer (after the step's
//! post-send delay), so a step never recurses into the next one.

use std::time::{Duration, Instant};

use mbt_core::timeout::retry_interval;
use mbt_core::wire::{Address, BlobStatus, Message, XferMode, XferStart, ADDR_UNASSIGNED};
use tracing::{debug, warn};

use super::{BlobCli, BlobCliError, BlobCliEvent, CliState, Step};
use crate::timer::Timer;
use crate::transport::{MsgCtx, Transport};

/// Payload of a broadcast started by a higher-layer model.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BroadcastMsg {
    /// Same message for every target.
    Fixed(Message),
    /// A message per target address. Requires unicast delivery.
    PerTarget(Vec<(Address, Message)>),
}

/// A broadcast step run through the engine on behalf of another model.
/// Completion is reported as [`BlobCliEvent::BroadcastDone`] with `tag`.
#[derive(Debug, Clone)]
pub struct BroadcastRequest {
    pub msg: BroadcastMsg,
    pub tag: u8,
    /// Wait for a response from every target.
    pub acked: bool,
    /// Silent targets are not dropped when retries run out.
    pub optional: bool,
    /// Unicast even if a group address is configured.
    pub force_unicast: bool,
}

#[derive(Debug, Clone, Default)]
pub(super) enum TxMsg {
    #[default]
    Nothing,
    InfoGet,
    XferStart,
    XferGet,
    XferCancel,
    BlockStart,
    BlockGet,
    Chunk,
    App(BroadcastMsg),
}

#[derive(Debug, Clone, Default)]
pub(super) struct Broadcast {
    pub(super) send: TxMsg,
    pub(super) next: Step,
    pub(super) acked: bool,
    pub(super) optional: bool,
    pub(super) force_unicast: bool,
    pub(super) post_send_delay: Duration,
    /// Run Pull-mode bookkeeping after each chunk goes out.
    pub(super) chunk_sent_hook: bool,
}

impl Broadcast {
    pub(super) fn acked(send: TxMsg, next: Step) -> Self {
        Self { send, next, acked: true, ..Self::default() }
    }
}

#[derive(Debug, Default)]
pub(super) struct Tx {
    pub(super) ctx: Broadcast,
    pub(super) inited: bool,
    /// Cursor into the target list.
    pub(super) target: Option<usize>,
    pub(super) pending: usize,
    pub(super) retries: u8,
    pub(super) sending: bool,
    pub(super) cancelled: bool,
    /// Pull mode: give up on silent targets after this instant.
    pub(super) cli_deadline: Option<Instant>,
    pub(super) retry: Timer,
    pub(super) complete: Timer,
}

impl BlobCli {
    pub(super) fn unicast(&self) -> bool {
        self.group() == ADDR_UNASSIGNED || self.tx.ctx.force_unicast
    }

    pub(super) fn group(&self) -> Address {
        self.inputs.as_ref().map_or(ADDR_UNASSIGNED, |i| i.group)
    }

    /// Sending chunks to Pull-mode targets, paced by their reports.
    pub(super) fn pull_sending(&self) -> bool {
        self.state == CliState::BlockSend && self.xfer.map_or(false, |x| x.mode == XferMode::Pull)
    }

    /// Clear acks on every active target and return how many there are.
    pub(super) fn targets_reset(&mut self) -> usize {
        let mut count = 0;
        for t in &mut self.targets {
            if t.status == BlobStatus::Success {
                t.acked = false;
                if !t.skip {
                    count += 1;
                }
            }
        }
        count
    }

    /// Advance the cursor to the next target that still needs this step.
    fn next_target(&mut self, now: Instant) -> bool {
        let start = self.tx.target.map_or(0, |i| i + 1);
        let pull = self.pull_sending();
        for i in start..self.targets.len() {
            let t = &self.targets[i];
            if t.acked || t.procedure_complete || t.status != BlobStatus::Success || t.timedout || t.skip {
                continue;
            }
            if pull {
                let Some(p) = &t.pull else { continue };
                if p.report_deadline.map_or(false, |d| now < d) || !p.missing.get(self.chunk_idx as usize) {
                    continue;
                }
            }
            self.tx.target = Some(i);
            return true;
        }
        self.tx.target = None;
        false
    }

    pub(super) fn broadcast_start(&mut self, now: Instant, net: &mut dyn Transport, ctx: Broadcast) {
        if self.tx.inited || self.tx.sending {
            warn!("BLOB client broadcast already in progress");
            return;
        }
        self.tx.ctx = ctx;
        self.tx.inited = true;
        self.tx.cancelled = false;
        self.tx.retries = self.cfg.block_retries.max(1);
        self.tx.pending = self.targets_reset();
        self.tx.target = None;

        if !self.next_target(now) {
            debug!(state = ?self.state, "no targets for broadcast");
            self.broadcast_complete();
            return;
        }
        self.send_to_target(now, net);
    }

    fn send_to_target(&mut self, now: Instant, net: &mut dyn Transport) {
        let Some(idx) = self.tx.target else { return };
        self.tx.sending = true;
        let dst = if self.unicast() { self.targets[idx].addr } else { self.group() };
        if let Some(msg) = self.build(dst) {
            let (app_idx, ttl) = self.inputs.as_ref().map_or((0, 0), |i| (i.app_idx, i.ttl));
            if let Err(e) = net.send(MsgCtx::new(dst, app_idx, ttl), msg) {
                warn!(dst = format_args!("0x{dst:04x}"), error = %e, "BLOB client send failed");
            }
        }
        self.tx.complete.arm_in(now, self.tx.ctx.post_send_delay);
    }

    fn build(&mut self, dst: Address) -> Option<Message> {
        let xfer = self.xfer.unwrap_or_default();
        let msg = match &self.tx.ctx.send {
            TxMsg::Nothing => return None,
            TxMsg::InfoGet => Message::InfoGet,
            TxMsg::XferStart => Message::XferStart(XferStart {
                mode: xfer.mode,
                id: xfer.id,
                size: xfer.size,
                block_size_log: xfer.block_size_log,
                mtu_size: self.cfg.mtu_size,
            }),
            TxMsg::XferGet => Message::XferGet,
            TxMsg::XferCancel => Message::XferCancel { id: xfer.id },
            TxMsg::BlockStart => Message::BlockStart { block: self.block.number, chunk_size: xfer.chunk_size },
            TxMsg::BlockGet => Message::BlockGet,
            TxMsg::Chunk => return self.build_chunk(),
            TxMsg::App(BroadcastMsg::Fixed(msg)) => msg.clone(),
            TxMsg::App(BroadcastMsg::PerTarget(list)) => {
                match list.iter().find(|(addr, _)| *addr == dst) {
                    Some((_, msg)) => msg.clone(),
                    None => {
                        warn!(dst = format_args!("0x{dst:04x}"), "no message for destination");
                        return None;
                    }
                }
            }
        };
        Some(msg)
    }

    fn build_chunk(&mut self) -> Option<Message> {
        let xfer = self.xfer?;
        let idx = self.chunk_idx;
        let len = self.block.chunk_size(xfer.chunk_size, idx);
        let offset = xfer.chunk_size as u32 * idx as u32;
        if self.block.number as u32 + 1 == self.block_count {
            self.last_chunk_sent = true;
        }

        let read = match self.io.as_mut() {
            Some(io) => io.read(&xfer, &self.block, offset, len).map_err(|e| e.to_string()),
            None => Err("no stream".to_string()),
        };
        match read {
            Ok(data) => Some(Message::Chunk { index: idx, data }),
            Err(e) => {
                warn!(block = self.block.number, chunk = idx, error = %e, "chunk read failed, cancelling");
                self.tx.cancelled = true;
                self.state = CliState::Cancel;
                None
            }
        }
    }

    pub(super) fn on_tx_complete(&mut self, now: Instant, net: &mut dyn Transport) {
        if !self.tx.inited || !self.tx.sending {
            return;
        }
        self.tx.sending = false;

        if self.tx.cancelled {
            self.broadcast_complete();
            return;
        }
        if self.tx.ctx.chunk_sent_hook {
            self.chunk_tx_complete(now);
        }
        if self.unicast() && self.next_target(now) {
            self.send_to_target(now, net);
            return;
        }
        if self.tx.ctx.acked && self.tx.pending > 0 {
            self.start_retry_timer(now);
            return;
        }
        self.broadcast_complete();
    }

    pub(super) fn start_retry_timer(&mut self, now: Instant) {
        if self.pull_sending() {
            let mut next = self.tx.cli_deadline;
            for t in &self.targets {
                if t.procedure_complete || t.status != BlobStatus::Success {
                    continue;
                }
                let Some(p) = &t.pull else { continue };
                if !p.missing.any() {
                    continue;
                }
                let due = p.report_deadline.unwrap_or(now);
                next = Some(next.map_or(due, |n| n.min(due)));
            }
            self.tx.retry.arm(next.unwrap_or(now).max(now));
            return;
        }
        let (ttl, timeout_base) = self.inputs.as_ref().map_or((0, 0), |i| (i.ttl, i.timeout_base));
        self.tx.retry.arm_in(now, retry_interval(ttl, timeout_base, self.cfg.block_retries));
    }

    pub(super) fn on_retry_timeout(&mut self, now: Instant, net: &mut dyn Transport) {
        if self.pull_sending() {
            if self.tx.cli_deadline.map_or(false, |d| now >= d) && !self.tx.ctx.optional {
                warn!("no block report from pull targets");
                self.drop_remaining_targets();
            }
            self.broadcast_complete();
            return;
        }
        if !self.tx.inited {
            return;
        }
        if self.tx.cancelled {
            self.broadcast_complete();
            return;
        }

        self.tx.retries = self.tx.retries.saturating_sub(1);
        self.tx.target = None;

        if self.tx.retries == 0 {
            debug!(state = ?self.state, pending = self.tx.pending, "broadcast timed out");
            if !self.tx.ctx.optional {
                self.drop_remaining_targets();
            }
            self.broadcast_complete();
            return;
        }

        if !self.tx.ctx.acked || !self.next_target(now) {
            self.broadcast_complete();
            return;
        }
        debug!(state = ?self.state, retries = self.tx.retries, "retrying broadcast");
        self.send_to_target(now, net);
    }

    /// Record a response from target `idx` to the current acked broadcast.
    pub(super) fn broadcast_rsp(&mut self, idx: usize) {
        if !self.tx.inited || !self.tx.ctx.acked {
            return;
        }
        let t = &mut self.targets[idx];
        if t.acked {
            return;
        }
        t.acked = true;
        self.tx.pending = self.tx.pending.saturating_sub(1);
        if self.tx.pending == 0 && !self.tx.sending {
            self.broadcast_complete();
        }
    }

    pub(super) fn broadcast_complete(&mut self) {
        debug!(state = ?self.state, cancelled = self.tx.cancelled, "broadcast complete");
        self.tx.inited = false;
        self.tx.retry.cancel();
        self.queued = Some(if self.tx.cancelled { Step::TransferCancel } else { self.tx.ctx.next });
    }

    pub(super) fn target_drop(&mut self, idx: usize, reason: BlobStatus) {
        let t = &mut self.targets[idx];
        if t.status != BlobStatus::Success {
            return;
        }
        warn!(addr = format_args!("0x{:04x}", t.addr), ?reason, "dropping BLOB target");
        t.status = reason;
        let addr = t.addr;
        self.events.push_back(BlobCliEvent::LostTarget { addr, reason });
    }

    fn drop_remaining_targets(&mut self) {
        self.tx.pending = 0;
        for i in 0..self.targets.len() {
            let t = &self.targets[i];
            if t.acked || t.timedout || t.procedure_complete || t.skip || t.status != BlobStatus::Success {
                continue;
            }
            self.targets[i].timedout = true;
            self.target_drop(i, BlobStatus::Internal);
        }
        if self.pull_sending() {
            self.update_missing_chunks();
        }
    }

    /// Pull mode: once the last requested chunk is out, give the target(s)
    /// one report window before the chunks are sent again.
    fn chunk_tx_complete(&mut self, now: Instant) {
        if self.xfer.map_or(true, |x| x.mode != XferMode::Pull) {
            return;
        }
        let Some(idx) = self.tx.target else { return };
        let next = self.chunk_idx as usize + 1;
        let more = self.targets[idx]
            .pull
            .as_ref()
            .map_or(false, |p| p.missing.next_set(next).is_some());
        if more {
            return;
        }

        let deadline = Some(now + mbt_core::timeout::BLOCK_REPORT_WINDOW);
        if self.unicast() {
            if let Some(p) = self.targets[idx].pull.as_mut() {
                p.report_deadline = deadline;
            }
        } else {
            for t in &mut self.targets {
                if let Some(p) = t.pull.as_mut() {
                    p.report_deadline = deadline;
                }
            }
        }
    }

    /// Run a step of another model through the engine.
    pub fn broadcast(
        &mut self,
        now: Instant,
        net: &mut dyn Transport,
        req: BroadcastRequest,
    ) -> Result<(), BlobCliError> {
        if self.inputs.is_none() {
            return Err(BlobCliError::NoTargets);
        }
        if self.state != CliState::None || self.tx.inited || self.tx.sending {
            return Err(BlobCliError::Busy);
        }
        let ctx = Broadcast {
            send: TxMsg::App(req.msg),
            next: Step::External(req.tag),
            acked: req.acked,
            optional: req.optional,
            force_unicast: req.force_unicast,
            post_send_delay: Duration::ZERO,
            chunk_sent_hook: false,
        };
        self.broadcast_start(now, net, ctx);
        self.run(now, net);
        Ok(())
    }

    /// Abandon whatever is in flight without notifying the targets.
    pub fn broadcast_abort(&mut self) {
        if !self.tx.inited && self.state != CliState::Suspended {
            return;
        }
        if !matches!(self.state, CliState::None | CliState::CapsGet) {
            if let (Some(mut io), Some(xfer)) = (self.io.take(), self.xfer) {
                io.close(&xfer);
            }
        }
        self.reset_state();
    }

    /// Acknowledge a response to a broadcast started with [`BlobCli::broadcast`].
    pub fn broadcast_ack(
        &mut self,
        now: Instant,
        net: &mut dyn Transport,
        addr: Address,
    ) -> Result<(), BlobCliError> {
        let idx = self.target_index(addr)?;
        self.broadcast_rsp(idx);
        self.run(now, net);
        Ok(())
    }
}
