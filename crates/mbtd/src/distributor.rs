//! Distributor — runs a Firmware Update Client over every simulated target
//! and walks the update from transfer through apply and confirm.
//!
//! Before the distribution starts every target is asked, one at a time, for
//! its firmware list and whether it would take the new metadata. Answers are
//! only logged; the distribution itself decides per target.

use std::collections::VecDeque;
use std::ops::ControlFlow;
use std::time::{Duration, Instant};

use tokio::sync::oneshot;

use mbt_core::wire::{Address, DfuStatus, Message, XferMode};
use mbt_services::dfu_cli::{DfuCli, DfuCliError, DfuCliEvent, DfuCliInputs, DfuRsp, DfuXfer};
use mbt_services::stream::BlobStream;
use mbt_services::{MsgCtx, Transport};

use crate::node::Model;

/// How a distribution ended.
#[derive(Debug)]
pub struct Report {
    pub result: Result<(), DfuStatus>,
    pub lost: Vec<(Address, DfuStatus)>,
    pub elapsed: Duration,
}

/// Largest image list read from a target during preflight.
const PREFLIGHT_IMAGES: u8 = 4;

#[derive(Debug, Clone, Copy)]
enum Probe {
    Images(Address),
    Metadata(Address),
}

pub struct Distributor {
    cli: DfuCli,
    job: Option<(DfuCliInputs, DfuXfer, Box<dyn BlobStream>)>,
    preflight: VecDeque<Address>,
    probe: Option<Probe>,
    started: Option<Instant>,
    last_progress: u8,
    lost: Vec<(Address, DfuStatus)>,
    done: Option<oneshot::Sender<Report>>,
}

impl Distributor {
    pub fn new(
        cli: DfuCli,
        inputs: DfuCliInputs,
        xfer: DfuXfer,
        image: Box<dyn BlobStream>,
        done: oneshot::Sender<Report>,
    ) -> Self {
        Self {
            cli,
            preflight: inputs.targets.iter().map(|t| t.addr).collect(),
            probe: None,
            job: Some((inputs, xfer, image)),
            started: None,
            last_progress: 0,
            lost: Vec::new(),
            done: Some(done),
        }
    }

    fn finish(&mut self, now: Instant, result: Result<(), DfuStatus>) -> ControlFlow<()> {
        let report = Report {
            result,
            lost: std::mem::take(&mut self.lost),
            elapsed: self.started.map_or(Duration::ZERO, |s| now.saturating_duration_since(s)),
        };
        if let Some(done) = self.done.take() {
            let _ = done.send(report);
        }
        ControlFlow::Break(())
    }

    /// Issue the next preflight request, or start the distribution once
    /// every target has been probed.
    fn advance(&mut self, now: Instant, net: &mut dyn Transport) {
        let Some((inputs, xfer, _)) = &self.job else { return };
        let ctx = MsgCtx::new(0, inputs.app_idx, inputs.ttl);
        let sent = match self.probe {
            Some(Probe::Images(addr)) => {
                let img_idx = inputs.targets.iter().find(|t| t.addr == addr).map_or(0, |t| t.img_idx);
                let metadata = xfer.metadata.clone();
                self.probe = Some(Probe::Metadata(addr));
                self.cli.metadata_check(now, net, ctx.to(addr), img_idx, metadata)
            }
            _ => match self.preflight.pop_front() {
                Some(addr) => {
                    self.probe = Some(Probe::Images(addr));
                    self.cli.imgs_get(now, net, ctx.to(addr), PREFLIGHT_IMAGES)
                }
                None => {
                    self.probe = None;
                    return self.distribute(now, net);
                }
            },
        };
        if let Err(e) = sent {
            tracing::warn!(error = %e, "preflight request refused, skipping");
            self.preflight.clear();
            self.probe = None;
            self.distribute(now, net);
        }
    }

    fn probed(&mut self, now: Instant, net: &mut dyn Transport, addr: Address, result: Result<DfuRsp, DfuCliError>) {
        let fwid = self.job.as_ref().map(|(_, xfer, _)| xfer.fwid.clone()).unwrap_or_default();
        match result {
            Ok(DfuRsp::Images { total, images }) => {
                let current = images.first().map(|img| String::from_utf8_lossy(&img.fwid).into_owned());
                let has_new = images.iter().any(|img| img.fwid == fwid);
                tracing::info!(addr = format_args!("0x{addr:04x}"), total, ?current, has_new, "target firmware");
            }
            Ok(DfuRsp::Metadata(status)) => {
                if status.status == DfuStatus::Success {
                    tracing::info!(addr = format_args!("0x{addr:04x}"), effect = ?status.effect, "target accepts image");
                } else {
                    tracing::warn!(addr = format_args!("0x{addr:04x}"), status = ?status.status, "target rejects image");
                }
            }
            Ok(other) => tracing::debug!(addr = format_args!("0x{addr:04x}"), ?other, "unexpected answer"),
            Err(e) => {
                tracing::warn!(addr = format_args!("0x{addr:04x}"), error = %e, "target did not answer preflight");
                // No point asking a silent node twice.
                self.probe = None;
            }
        }
        self.advance(now, net);
    }

    fn distribute(&mut self, now: Instant, net: &mut dyn Transport) {
        let Some((inputs, xfer, image)) = self.job.take() else { return };
        tracing::info!(
            targets = inputs.targets.len(),
            group = format_args!("0x{:04x}", inputs.group),
            mode = ?xfer.mode,
            "distribution starting"
        );
        self.started = Some(now);
        if let Err(e) = self.cli.send(now, net, inputs, xfer, image) {
            tracing::error!(error = %e, "failed to start distribution");
            let _ = self.finish(now, Err(DfuStatus::Internal));
        }
    }

    fn report_progress(&mut self) {
        let progress = self.cli.progress();
        if progress / 10 != self.last_progress / 10 {
            tracing::info!(progress, state = ?self.cli.state(), "distribution progress");
        }
        self.last_progress = progress;
    }
}

impl Model for Distributor {
    fn start(&mut self, now: Instant, net: &mut dyn Transport) {
        tracing::info!(targets = self.preflight.len(), "probing targets");
        self.advance(now, net);
    }

    fn handle(&mut self, now: Instant, net: &mut dyn Transport, ctx: MsgCtx, msg: &Message) {
        if let Err(e) = self.cli.handle_message(now, net, ctx, msg) {
            tracing::debug!(src = format_args!("0x{:04x}", ctx.addr), error = %e, "response ignored");
        }
    }

    fn next_deadline(&self) -> Option<Instant> {
        self.cli.next_deadline()
    }

    fn poll(&mut self, now: Instant, net: &mut dyn Transport) {
        self.cli.poll(now, net);
    }

    fn settle(&mut self, now: Instant, net: &mut dyn Transport) -> ControlFlow<()> {
        if self.done.is_none() {
            return ControlFlow::Break(());
        }
        self.report_progress();

        while let Some(ev) = self.cli.poll_event() {
            match ev {
                DfuCliEvent::LostTarget { addr, status } => {
                    tracing::warn!(addr = format_args!("0x{addr:04x}"), ?status, "target lost");
                    self.lost.push((addr, status));
                }
                DfuCliEvent::Ended(DfuStatus::Success) => {
                    tracing::info!("image verified by targets, applying");
                    if let Err(e) = self.cli.apply(now, net) {
                        tracing::error!(error = %e, "apply refused");
                        return self.finish(now, Err(DfuStatus::Internal));
                    }
                }
                DfuCliEvent::Ended(status) => {
                    tracing::error!(?status, "distribution failed");
                    return self.finish(now, Err(status));
                }
                DfuCliEvent::Applied => {
                    tracing::info!("targets applied the image, confirming");
                    if let Err(e) = self.cli.confirm(now, net) {
                        tracing::error!(error = %e, "confirm refused");
                        return self.finish(now, Err(DfuStatus::Internal));
                    }
                }
                DfuCliEvent::Confirmed => return self.finish(now, Ok(())),
                DfuCliEvent::Suspended => {
                    tracing::warn!("transfer suspended, resuming");
                    if let Err(e) = self.cli.resume(now, net) {
                        tracing::error!(error = %e, "resume refused");
                        return self.finish(now, Err(DfuStatus::Internal));
                    }
                }
                DfuCliEvent::Response { addr, result } => self.probed(now, net, addr, result),
            }
        }
        ControlFlow::Continue(())
    }
}

/// Preferred transfer mode for the simulation.
pub fn mode(pull: bool) -> XferMode {
    if pull {
        XferMode::Pull
    } else {
        XferMode::Push
    }
}
