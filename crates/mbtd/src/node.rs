//! Node task — drives one sans-IO model from its inbox and its timers.

use std::ops::ControlFlow;
use std::time::Instant;

use tokio::sync::{broadcast, mpsc};

use mbt_core::wire::{Address, Message};
use mbt_services::{MsgCtx, Transport};

use crate::network::{Frame, Port};

/// A state machine hosted by a [`Node`].
pub trait Model: Send + 'static {
    /// Called once before the first frame.
    fn start(&mut self, _now: Instant, _net: &mut dyn Transport) {}

    fn handle(&mut self, now: Instant, net: &mut dyn Transport, ctx: MsgCtx, msg: &Message);

    fn next_deadline(&self) -> Option<Instant>;

    fn poll(&mut self, now: Instant, net: &mut dyn Transport);

    /// Runs after every frame or timer. `Break` stops the node.
    fn settle(&mut self, _now: Instant, _net: &mut dyn Transport) -> ControlFlow<()> {
        ControlFlow::Continue(())
    }
}

pub struct Node<M> {
    model: M,
    port: Port,
    inbox: mpsc::UnboundedReceiver<Frame>,
    shutdown: broadcast::Receiver<()>,
}

impl<M: Model> Node<M> {
    pub fn new(
        model: M,
        port: Port,
        inbox: mpsc::UnboundedReceiver<Frame>,
        shutdown: broadcast::Receiver<()>,
    ) -> Self {
        Self { model, port, inbox, shutdown }
    }

    fn addr(&self) -> Address {
        self.port.addr()
    }

    /// Run until shutdown, a closed inbox, or the model asks to stop.
    /// Returns the model for inspection.
    pub async fn run(mut self) -> M {
        let addr = self.addr();
        self.model.start(Instant::now(), &mut self.port);
        if self.model.settle(Instant::now(), &mut self.port).is_break() {
            return self.model;
        }

        loop {
            let deadline = self.model.next_deadline();
            tokio::select! {
                _ = self.shutdown.recv() => {
                    tracing::debug!(addr = format_args!("0x{addr:04x}"), "node shutting down");
                    return self.model;
                }

                frame = self.inbox.recv() => {
                    let Some(frame) = frame else {
                        tracing::debug!(addr = format_args!("0x{addr:04x}"), "inbox closed");
                        return self.model;
                    };
                    self.deliver(frame);
                }

                _ = sleep_until(deadline) => {
                    self.model.poll(Instant::now(), &mut self.port);
                }
            }

            if self.model.settle(Instant::now(), &mut self.port).is_break() {
                return self.model;
            }
        }
    }

    fn deliver(&mut self, frame: Frame) {
        let msg = match Message::decode(&frame.data) {
            Ok(msg) => msg,
            Err(e) => {
                tracing::warn!(src = format_args!("0x{:04x}", frame.src), error = %e, "undecodable frame");
                return;
            }
        };
        let ctx = MsgCtx::new(frame.src, frame.app_idx, frame.ttl);
        self.model.handle(Instant::now(), &mut self.port, ctx, &msg);
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(tokio::time::Instant::from_std(at)).await,
        None => std::future::pending().await,
    }
}
