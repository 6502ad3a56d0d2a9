//! Firmware Update Server.
//!
//! Wraps a [`BlobSrv`] that carries the image and walks the update phases
//! on top of it: Idle → TransferActive → Verify → VerifyOk → Applying.
//! The application decides through [`DfuSrvHandler`] whether an update is
//! acceptable, supplies the stream the image is written to, verifies the
//! received image and applies it.
//!
//! The update state is persisted at every phase change so an interrupted
//! transfer can be resumed by the distributor after a reboot.

use std::time::Instant;

use bytes::Bytes;
use mbt_core::config::{BlobServerConfig, DfuConfig};
use mbt_core::wire::{
    Address, DfuEffect, DfuInfoStatus, DfuPhase, DfuStatus, FwImage, Message, MetadataStatus,
    UpdateInfo, UpdateStart, UpdateStatus,
};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::blob::BlobXfer;
use crate::blob_srv::{BlobSrv, BlobSrvError, BlobSrvHandler, BlobSrvState, HandlerError};
use crate::store::StateStore;
use crate::stream::BlobStream;
use crate::transport::{MsgCtx, Transport};

/// Bound on the encoded image list in one Information Status.
const INFO_STATUS_MAX: usize = 377;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DfuSrvError {
    #[error("not allowed in phase {0:?}")]
    WrongPhase(DfuPhase),
    #[error(transparent)]
    Blob(#[from] BlobSrvError),
    #[error("state store: {0}")]
    Store(String),
    #[error("unexpected message: {0}")]
    Unexpected(&'static str),
}

/// Why the application refused to start receiving an image.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StartError {
    /// The image is already present; skip the transfer and go to Verify.
    #[error("image already present")]
    AlreadyHave,
    #[error("out of resources")]
    NoResources,
    #[error("busy")]
    Busy,
    #[error("{0}")]
    Failed(String),
}

/// Application side of a Firmware Update Server.
pub trait DfuSrvHandler: Send {
    /// Vet the metadata of an incoming update and report its effect.
    fn check(&mut self, img_idx: u8, img: &FwImage, metadata: &[u8]) -> Result<DfuEffect, HandlerError>;

    /// Accept an update and return the stream the image goes into.
    fn start(
        &mut self,
        img_idx: u8,
        img: &FwImage,
        metadata: &[u8],
    ) -> Result<Box<dyn BlobStream>, StartError>;

    /// The transfer finished. On success the application must follow up
    /// with [`DfuSrv::verified`] or [`DfuSrv::rejected`].
    fn end(&mut self, img_idx: u8, img: &FwImage, success: bool);

    /// Reopen the stream of an update interrupted by a reboot.
    fn recover(&mut self, _img_idx: u8, _img: &FwImage) -> Option<Box<dyn BlobStream>> {
        None
    }

    /// Install the verified image. Report completion with
    /// [`DfuSrv::applied`].
    fn apply(&mut self, img_idx: u8, img: &FwImage) -> Result<(), HandlerError>;
}

/// Update parameters and phase, persisted across reboots.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateState {
    pub phase: DfuPhase,
    pub img_idx: Option<u8>,
    pub ttl: u8,
    pub timeout_base: u16,
    pub blob_id: u64,
    /// Fletcher-16 of the metadata the update was started with.
    pub meta: u16,
    pub effect: DfuEffect,
}

impl Default for UpdateState {
    fn default() -> Self {
        Self {
            phase: DfuPhase::Idle,
            img_idx: None,
            ttl: 0,
            timeout_base: 0,
            blob_id: 0,
            meta: 0,
            effect: DfuEffect::None,
        }
    }
}

/// Fletcher-16 over `data`.
pub fn fletcher16(data: &[u8]) -> u16 {
    let (mut sum1, mut sum2) = (0u16, 0u16);
    for &b in data {
        sum1 = (sum1 + b as u16) % 255;
        sum2 = (sum2 + sum1) % 255;
    }
    (sum2 << 8) | sum1
}

/// Persistence backends of a [`DfuSrv`].
pub struct DfuSrvStores {
    pub blob: Box<dyn StateStore<BlobSrvState>>,
    pub update: Box<dyn StateStore<UpdateState>>,
}

pub struct DfuSrv {
    cfg: DfuConfig,
    blob: BlobSrv,
    core: DfuCore,
}

/// Everything but the BLOB server, so the server can call back into it.
struct DfuCore {
    imgs: Vec<FwImage>,
    update: UpdateState,
    handler: Box<dyn DfuSrvHandler>,
    store: Box<dyn StateStore<UpdateState>>,
}

impl DfuCore {
    fn image(&self) -> Option<(u8, &FwImage)> {
        let idx = self.update.img_idx?;
        self.imgs.get(idx as usize).map(|img| (idx, img))
    }

    fn is_busy(&self) -> bool {
        !matches!(
            self.update.phase,
            DfuPhase::Idle | DfuPhase::TransferErr | DfuPhase::ApplyFail
        )
    }

    fn phase_set(&mut self, phase: DfuPhase) {
        if self.update.phase != phase {
            info!(from = ?self.update.phase, to = ?phase, "DFU phase change");
        }
        self.update.phase = phase;
        self.store_state();
    }

    fn store_state(&mut self) {
        let res = if self.update.phase == DfuPhase::Idle {
            self.store.erase()
        } else {
            self.store.save(&self.update)
        };
        if let Err(e) = res {
            warn!(error = %e, "failed to persist DFU state");
        }
    }

    fn reset(&mut self) {
        self.update = UpdateState::default();
        self.store_state();
    }

    /// The transfer is over without an image.
    fn xfer_failed(&mut self) {
        if !matches!(
            self.update.phase,
            DfuPhase::Idle | DfuPhase::VerifyFail | DfuPhase::ApplyFail
        ) {
            if let Some((idx, img)) = self.image() {
                let img = img.clone();
                self.handler.end(idx, &img, false);
            }
        }
        self.reset();
    }

    fn verify(&mut self) {
        self.phase_set(DfuPhase::Verify);
        if let Some((idx, img)) = self.image() {
            let img = img.clone();
            self.handler.end(idx, &img, true);
        }
    }
}

impl BlobSrvHandler for DfuCore {
    fn start(&mut self, _cli: Address, xfer: &BlobXfer) -> Result<(), HandlerError> {
        match self.update.phase {
            DfuPhase::TransferActive => Ok(()),
            DfuPhase::TransferErr => {
                self.phase_set(DfuPhase::TransferActive);
                Ok(())
            }
            phase => {
                warn!(id = format_args!("0x{:016x}", xfer.id), ?phase, "BLOB transfer outside update");
                Err(HandlerError(format!("update in phase {phase:?}")))
            }
        }
    }

    fn end(&mut self, _id: u64, success: bool) {
        if success {
            self.verify();
        } else {
            self.xfer_failed();
        }
    }

    fn suspended(&mut self) {
        self.phase_set(DfuPhase::TransferErr);
    }

    fn resume(&mut self) {
        self.phase_set(DfuPhase::TransferActive);
    }

    fn recover(&mut self, _xfer: &BlobXfer) -> Option<Box<dyn BlobStream>> {
        let (idx, img) = self.image()?;
        let img = img.clone();
        self.handler.recover(idx, &img)
    }
}

impl DfuSrv {
    pub fn new(
        blob_cfg: BlobServerConfig,
        cfg: DfuConfig,
        imgs: Vec<FwImage>,
        handler: Box<dyn DfuSrvHandler>,
        stores: DfuSrvStores,
    ) -> Self {
        Self {
            cfg,
            blob: BlobSrv::new(blob_cfg, stores.blob),
            core: DfuCore { imgs, update: UpdateState::default(), handler, store: stores.update },
        }
    }

    pub fn phase(&self) -> DfuPhase {
        self.core.update.phase
    }

    pub fn update(&self) -> &UpdateState {
        &self.core.update
    }

    pub fn blob(&self) -> &BlobSrv {
        &self.blob
    }

    pub fn imgs(&self) -> &[FwImage] {
        &self.core.imgs
    }

    /// Replace the firmware id of image `idx`, typically once a new image
    /// has been applied.
    pub fn set_fwid(&mut self, idx: u8, fwid: Bytes) -> bool {
        match self.core.imgs.get_mut(idx as usize) {
            Some(img) => {
                img.fwid = fwid;
                true
            }
            None => false,
        }
    }

    pub fn is_busy(&self) -> bool {
        self.core.is_busy()
    }

    /// Percentage of the image received.
    pub fn progress(&self) -> u8 {
        match self.core.update.phase {
            DfuPhase::TransferActive | DfuPhase::TransferErr => self.blob.progress(),
            DfuPhase::Idle | DfuPhase::TransferCanceled | DfuPhase::Unknown => 0,
            _ => 100,
        }
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.blob.next_deadline()
    }

    pub fn poll(&mut self, now: Instant, net: &mut dyn Transport) {
        self.blob.poll(now, net, &mut self.core);
    }

    /// Reload persisted state after a reboot. An update that was receiving
    /// comes back as TransferErr and resumes with the next matching Update
    /// Start; one whose stream cannot be reopened is dropped.
    pub fn restore(&mut self, now: Instant) -> Result<(), DfuSrvError> {
        let Some(update) = self.core.store.load().map_err(|e| DfuSrvError::Store(e.to_string()))? else {
            return Ok(());
        };
        info!(phase = ?update.phase, "restoring DFU state");
        self.core.update = update;

        if !matches!(self.core.update.phase, DfuPhase::TransferActive | DfuPhase::TransferErr) {
            return Ok(());
        }
        match self.blob.restore(now, &mut self.core) {
            Ok(true) => self.core.phase_set(DfuPhase::TransferErr),
            Ok(false) | Err(BlobSrvError::NotRecovered(_)) => {
                warn!("update transfer could not be recovered");
                self.core.reset();
            }
            Err(e) => return Err(e.into()),
        }
        Ok(())
    }

    /// The received image checked out.
    pub fn verified(&mut self) -> Result<(), DfuSrvError> {
        if self.core.update.phase != DfuPhase::Verify {
            return Err(DfuSrvError::WrongPhase(self.core.update.phase));
        }
        self.core.phase_set(DfuPhase::VerifyOk);
        Ok(())
    }

    /// The received image is unusable.
    pub fn rejected(&mut self) -> Result<(), DfuSrvError> {
        if self.core.update.phase != DfuPhase::Verify {
            return Err(DfuSrvError::WrongPhase(self.core.update.phase));
        }
        self.core.phase_set(DfuPhase::VerifyFail);
        Ok(())
    }

    /// The application finished installing the image.
    pub fn applied(&mut self) -> Result<(), DfuSrvError> {
        if self.core.update.phase != DfuPhase::Applying {
            return Err(DfuSrvError::WrongPhase(self.core.update.phase));
        }
        info!("update applied");
        self.core.reset();
        Ok(())
    }

    /// Abort the update. The BLOB receive is cancelled as well.
    pub fn cancel(&mut self) {
        if self.core.update.phase == DfuPhase::Idle {
            return;
        }
        info!(phase = ?self.core.update.phase, "cancelling update");
        if let Err(e) = self.blob.cancel(&mut self.core) {
            debug!(error = %e, "no BLOB transfer to cancel");
        }
        if self.core.update.phase != DfuPhase::Idle {
            self.core.xfer_failed();
        }
    }

    pub fn handle_message(
        &mut self,
        now: Instant,
        net: &mut dyn Transport,
        ctx: MsgCtx,
        msg: &Message,
    ) -> Result<(), DfuSrvError> {
        if msg.is_blob() {
            return Ok(self.blob.handle_message(now, net, ctx, msg, &mut self.core)?);
        }
        match msg {
            Message::DfuInfoGet { first_index, entries_limit } => {
                self.info_status_rsp(net, ctx, *first_index, *entries_limit);
            }
            Message::MetadataCheck { img_idx, metadata } => {
                let rsp = self.metadata_check(*img_idx, metadata);
                send(net, ctx, Message::MetadataStatus(rsp));
            }
            Message::UpdateGet => self.status_rsp(net, ctx, DfuStatus::Success),
            Message::UpdateStart(start) => {
                let status = self.start(now, start);
                self.status_rsp(net, ctx, status);
            }
            Message::UpdateCancel => {
                self.cancel();
                self.status_rsp(net, ctx, DfuStatus::Success);
            }
            Message::UpdateApply => self.apply(net, ctx),
            _ => return Err(DfuSrvError::Unexpected("not a DFU server message")),
        }
        Ok(())
    }

    fn info_status_rsp(&self, net: &mut dyn Transport, ctx: MsgCtx, first: u8, limit: u8) {
        let mut images = Vec::new();
        let mut len = 0;
        for img in self.core.imgs.iter().skip(first as usize).take(limit as usize) {
            len += 2 + img.fwid.len() + img.uri.len();
            if len > INFO_STATUS_MAX {
                break;
            }
            images.push(img.clone());
        }
        let rsp = DfuInfoStatus {
            total: self.core.imgs.len().min(u8::MAX as usize) as u8,
            first_index: first,
            images,
        };
        send(net, ctx, Message::DfuInfoStatus(rsp));
    }

    fn metadata_check(&mut self, img_idx: u8, metadata: &[u8]) -> MetadataStatus {
        let Some(img) = self.core.imgs.get(img_idx as usize).cloned() else {
            return MetadataStatus { status: DfuStatus::FwIdx, effect: DfuEffect::None, img_idx };
        };
        if metadata.len() > self.cfg.metadata_max {
            return MetadataStatus { status: DfuStatus::Metadata, effect: DfuEffect::None, img_idx };
        }
        match self.core.handler.check(img_idx, &img, metadata) {
            Ok(effect) => MetadataStatus { status: DfuStatus::Success, effect, img_idx },
            Err(e) => {
                debug!(img_idx, error = %e, "metadata rejected");
                MetadataStatus { status: DfuStatus::Metadata, effect: DfuEffect::None, img_idx }
            }
        }
    }

    fn start(&mut self, now: Instant, m: &UpdateStart) -> DfuStatus {
        let meta = fletcher16(&m.metadata);
        let Some(img) = self.core.imgs.get(m.img_idx as usize).cloned() else {
            warn!(img_idx = m.img_idx, "no such image");
            return DfuStatus::FwIdx;
        };
        if m.metadata.len() > self.cfg.metadata_max {
            return DfuStatus::Metadata;
        }

        let u = &self.core.update;
        if u.phase != DfuPhase::Idle {
            let same = u.img_idx == Some(m.img_idx)
                && u.ttl == m.ttl
                && u.timeout_base == m.timeout_base
                && u.blob_id == m.blob_id
                && u.meta == meta;
            if same && !matches!(u.phase, DfuPhase::VerifyFail | DfuPhase::ApplyFail) {
                debug!(phase = ?u.phase, "repeated Update Start");
                return DfuStatus::Success;
            }
            warn!(phase = ?u.phase, "Update Start while busy");
            return DfuStatus::WrongPhase;
        }
        if self.blob.is_busy() {
            return DfuStatus::BlobXferBusy;
        }

        let effect = match self.core.handler.check(m.img_idx, &img, &m.metadata) {
            Ok(effect) => effect,
            Err(e) => {
                warn!(img_idx = m.img_idx, error = %e, "metadata check failed");
                return DfuStatus::Metadata;
            }
        };

        self.core.update = UpdateState {
            phase: DfuPhase::Idle,
            img_idx: Some(m.img_idx),
            ttl: m.ttl,
            timeout_base: m.timeout_base,
            blob_id: m.blob_id,
            meta,
            effect,
        };

        let io = match self.core.handler.start(m.img_idx, &img, &m.metadata) {
            Ok(io) => io,
            Err(StartError::AlreadyHave) => {
                info!(img_idx = m.img_idx, "image already present, skipping transfer");
                self.core.verify();
                return DfuStatus::Success;
            }
            Err(e) => {
                warn!(img_idx = m.img_idx, error = %e, "update refused by application");
                self.core.update = UpdateState::default();
                return match e {
                    StartError::NoResources => DfuStatus::Resources,
                    StartError::Busy => DfuStatus::BlobXferBusy,
                    _ => DfuStatus::Internal,
                };
            }
        };

        if let Err(e) = self.blob.recv(now, m.blob_id, io, m.ttl, m.timeout_base) {
            warn!(error = %e, "BLOB server refused receive");
            self.core.update = UpdateState::default();
            return DfuStatus::BlobXferBusy;
        }
        info!(
            img_idx = m.img_idx,
            blob_id = format_args!("0x{:016x}", m.blob_id),
            ?effect,
            "update started"
        );
        self.core.phase_set(DfuPhase::TransferActive);
        DfuStatus::Success
    }

    fn apply(&mut self, net: &mut dyn Transport, ctx: MsgCtx) {
        match self.core.update.phase {
            DfuPhase::Applying => {
                self.status_rsp(net, ctx, DfuStatus::Success);
                return;
            }
            DfuPhase::VerifyOk => {}
            phase => {
                debug!(?phase, "apply in wrong phase");
                self.status_rsp(net, ctx, DfuStatus::WrongPhase);
                return;
            }
        }

        self.core.phase_set(DfuPhase::Applying);
        // The status goes out before the application gets a chance to reboot.
        self.status_rsp(net, ctx, DfuStatus::Success);

        let Some((idx, img)) = self.core.image() else { return };
        let img = img.clone();
        if let Err(e) = self.core.handler.apply(idx, &img) {
            warn!(img_idx = idx, error = %e, "apply failed");
            self.core.phase_set(DfuPhase::ApplyFail);
        }
    }

    fn status_rsp(&self, net: &mut dyn Transport, ctx: MsgCtx, status: DfuStatus) {
        let u = &self.core.update;
        let info = match (u.phase, u.img_idx) {
            (DfuPhase::Idle, _) | (_, None) => None,
            (_, Some(img_idx)) => Some(UpdateInfo {
                ttl: u.ttl,
                effect: u.effect,
                timeout_base: u.timeout_base,
                blob_id: u.blob_id,
                img_idx,
            }),
        };
        send(net, ctx, Message::UpdateStatus(UpdateStatus { status, phase: u.phase, info }));
    }
}

fn send(net: &mut dyn Transport, ctx: MsgCtx, msg: Message) {
    if let Err(e) = net.send(ctx, msg) {
        warn!(dst = format_args!("0x{:04x}", ctx.addr), error = %e, "failed to send DFU response");
    }
}
