//! Simulated update target — a Firmware Update Server that checks the
//! received image against the digest in the update metadata and swaps its
//! firmware ID on apply.

use std::ops::ControlFlow;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;

use bytes::Bytes;

use mbt_core::config::MbtConfig;
use mbt_core::wire::{Address, DfuEffect, DfuPhase, FwImage, Message};
use mbt_services::blob_srv::HandlerError;
use mbt_services::dfu_srv::{DfuSrv, DfuSrvHandler, DfuSrvStores, StartError};
use mbt_services::store::JsonFileStore;
use mbt_services::stream::{BlobStream, MemoryStream};
use mbt_services::{MsgCtx, Transport};

use crate::image::ImageMeta;
use crate::node::Model;

pub const FACTORY_FWID: &[u8] = b"sim-factory";

#[derive(Default)]
struct Staged {
    meta: Option<ImageMeta>,
    stream: MemoryStream,
}

#[derive(Clone, Default)]
struct Shared(Arc<Mutex<Staged>>);

impl Shared {
    fn lock(&self) -> MutexGuard<'_, Staged> {
        self.0.lock().unwrap_or_else(|p| p.into_inner())
    }
}

struct SimHandler {
    addr: Address,
    staged: Shared,
}

impl DfuSrvHandler for SimHandler {
    fn check(&mut self, _img_idx: u8, _img: &FwImage, metadata: &[u8]) -> Result<DfuEffect, HandlerError> {
        ImageMeta::decode(metadata).map_err(|e| HandlerError(e.to_string()))?;
        Ok(DfuEffect::None)
    }

    fn start(&mut self, _img_idx: u8, img: &FwImage, metadata: &[u8]) -> Result<Box<dyn BlobStream>, StartError> {
        let meta = ImageMeta::decode(metadata).map_err(|e| StartError::Failed(e.to_string()))?;
        if meta.fwid == img.fwid {
            return Err(StartError::AlreadyHave);
        }
        tracing::info!(
            addr = format_args!("0x{:04x}", self.addr),
            fwid = %String::from_utf8_lossy(&meta.fwid),
            size = meta.size,
            "receiving firmware"
        );
        let stream = MemoryStream::new();
        let mut staged = self.staged.lock();
        staged.meta = Some(meta);
        staged.stream = stream.clone();
        Ok(Box::new(stream))
    }

    fn end(&mut self, _img_idx: u8, _img: &FwImage, success: bool) {
        tracing::info!(addr = format_args!("0x{:04x}", self.addr), success, "firmware receive ended");
        if !success {
            *self.staged.lock() = Staged::default();
        }
    }

    fn apply(&mut self, _img_idx: u8, _img: &FwImage) -> Result<(), HandlerError> {
        if self.staged.lock().meta.is_none() {
            return Err(HandlerError("nothing staged".into()));
        }
        Ok(())
    }
}

pub struct Target {
    addr: Address,
    srv: DfuSrv,
    staged: Shared,
}

impl Target {
    pub fn new(addr: Address, config: &MbtConfig, state_dir: &Path) -> anyhow::Result<Self> {
        let dir = state_dir.join(format!("target-{addr:04x}"));
        std::fs::create_dir_all(&dir)?;
        let staged = Shared::default();
        let srv = DfuSrv::new(
            config.blob_server.clone(),
            config.dfu.clone(),
            vec![FwImage { fwid: Bytes::from_static(FACTORY_FWID), uri: Bytes::new() }],
            Box::new(SimHandler { addr, staged: staged.clone() }),
            DfuSrvStores {
                blob: Box::new(JsonFileStore::new(dir.join("blob.json"))),
                update: Box::new(JsonFileStore::new(dir.join("update.json"))),
            },
        );
        Ok(Self { addr, srv, staged })
    }

    pub fn srv(&self) -> &DfuSrv {
        &self.srv
    }

    fn verify(&mut self) {
        let ok = {
            let staged = self.staged.lock();
            staged.meta.as_ref().map_or(false, |m| m.matches(&staged.stream.contents()))
        };
        tracing::info!(addr = format_args!("0x{:04x}", self.addr), ok, "image verified");
        let res = if ok { self.srv.verified() } else { self.srv.rejected() };
        if let Err(e) = res {
            tracing::warn!(error = %e, "verification result not accepted");
        }
    }

    fn install(&mut self) {
        let fwid = self.staged.lock().meta.take().map(|m| m.fwid);
        let idx = self.srv.update().img_idx.unwrap_or(0);
        if let Some(fwid) = fwid {
            tracing::info!(
                addr = format_args!("0x{:04x}", self.addr),
                fwid = %String::from_utf8_lossy(&fwid),
                "firmware installed"
            );
            self.srv.set_fwid(idx, fwid);
        }
        if let Err(e) = self.srv.applied() {
            tracing::warn!(error = %e, "apply completion not accepted");
        }
    }
}

impl Model for Target {
    fn start(&mut self, now: Instant, _net: &mut dyn Transport) {
        if let Err(e) = self.srv.restore(now) {
            tracing::warn!(addr = format_args!("0x{:04x}", self.addr), error = %e, "failed to restore DFU state");
        }
    }

    fn handle(&mut self, now: Instant, net: &mut dyn Transport, ctx: MsgCtx, msg: &Message) {
        if let Err(e) = self.srv.handle_message(now, net, ctx, msg) {
            tracing::debug!(addr = format_args!("0x{:04x}", self.addr), error = %e, "message ignored");
        }
    }

    fn next_deadline(&self) -> Option<Instant> {
        self.srv.next_deadline()
    }

    fn poll(&mut self, now: Instant, net: &mut dyn Transport) {
        self.srv.poll(now, net);
    }

    fn settle(&mut self, _now: Instant, _net: &mut dyn Transport) -> ControlFlow<()> {
        match self.srv.phase() {
            DfuPhase::Verify => self.verify(),
            DfuPhase::Applying => self.install(),
            _ => {}
        }
        ControlFlow::Continue(())
    }
}
