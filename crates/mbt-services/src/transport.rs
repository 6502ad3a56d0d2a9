//! Transport seam between the state machines and whatever carries frames.
//!
//! State machines never block on the network: they hand a message to the
//! transport and carry on. Responses come back through the model's
//! `handle_message` entry point.

use mbt_core::wire::{Address, Message};

/// Addressing for one outgoing or incoming message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MsgCtx {
    /// Destination when sending, source when receiving.
    pub addr: Address,
    pub app_idx: u16,
    pub ttl: u8,
}

impl MsgCtx {
    pub fn new(addr: Address, app_idx: u16, ttl: u8) -> Self {
        Self { addr, app_idx, ttl }
    }

    /// Same key and TTL, different peer.
    pub fn to(self, addr: Address) -> Self {
        Self { addr, ..self }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("no route to 0x{0:04x}")]
    NoRoute(Address),
    #[error("transport closed")]
    Closed,
}

pub trait Transport {
    /// Queue `msg` for delivery. Returning does not mean it arrived.
    fn send(&mut self, ctx: MsgCtx, msg: Message) -> Result<(), TransportError>;

    /// True if `addr` is one of this node's own elements.
    fn is_local(&self, _addr: Address) -> bool {
        false
    }
}

/// Transport that only records what was sent. Drivers flush it after each
/// call into a state machine.
#[derive(Debug, Default)]
pub struct Outbox {
    pub local: Vec<Address>,
    pub sent: Vec<(MsgCtx, Message)>,
}

impl Outbox {
    pub fn new(local: Address) -> Self {
        Self { local: vec![local], sent: Vec::new() }
    }

    pub fn drain(&mut self) -> std::vec::Drain<'_, (MsgCtx, Message)> {
        self.sent.drain(..)
    }
}

impl Transport for Outbox {
    fn send(&mut self, ctx: MsgCtx, msg: Message) -> Result<(), TransportError> {
        self.sent.push((ctx, msg));
        Ok(())
    }

    fn is_local(&self, addr: Address) -> bool {
        self.local.contains(&addr)
    }
}
