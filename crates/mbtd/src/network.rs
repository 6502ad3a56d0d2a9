//! In-process mesh — carries encoded access messages between simulated
//! nodes.
//!
//! Every node owns an unbounded inbox keyed by its unicast address. Group
//! addresses fan out to their subscribers, never back to the sender. Each
//! delivery is independently dropped with the configured loss probability.

use std::sync::Arc;

use bytes::Bytes;
use dashmap::DashMap;
use rand::Rng;
use tokio::sync::mpsc;

use mbt_core::wire::{is_group, Address, Message};
use mbt_services::{MsgCtx, Transport, TransportError};

/// One frame as it travels the simulated mesh.
#[derive(Debug, Clone)]
pub struct Frame {
    pub src: Address,
    pub dst: Address,
    pub app_idx: u16,
    pub ttl: u8,
    pub data: Bytes,
}

#[derive(Clone)]
pub struct Mesh {
    inner: Arc<MeshInner>,
}

struct MeshInner {
    nodes: DashMap<Address, mpsc::UnboundedSender<Frame>>,
    groups: DashMap<Address, Vec<Address>>,
    loss_percent: u8,
}

impl Mesh {
    pub fn new(loss_percent: u8) -> Self {
        Self {
            inner: Arc::new(MeshInner {
                nodes: DashMap::new(),
                groups: DashMap::new(),
                loss_percent: loss_percent.min(100),
            }),
        }
    }

    /// Attach a node and return its inbox.
    pub fn join(&self, addr: Address) -> mpsc::UnboundedReceiver<Frame> {
        let (tx, rx) = mpsc::unbounded_channel();
        if self.inner.nodes.insert(addr, tx).is_some() {
            tracing::warn!(addr = format_args!("0x{addr:04x}"), "node rejoined, old inbox dropped");
        }
        rx
    }

    pub fn subscribe(&self, group: Address, addr: Address) {
        let mut members = self.inner.groups.entry(group).or_default();
        if !members.contains(&addr) {
            members.push(addr);
        }
    }

    pub fn port(&self, addr: Address) -> Port {
        Port { addr, mesh: self.clone() }
    }

    fn lost(&self) -> bool {
        self.inner.loss_percent > 0 && rand::thread_rng().gen_range(0..100u8) < self.inner.loss_percent
    }

    fn deliver(&self, frame: Frame) -> Result<(), TransportError> {
        let dsts: Vec<Address> = if is_group(frame.dst) {
            self.inner
                .groups
                .get(&frame.dst)
                .map(|m| m.iter().copied().filter(|a| *a != frame.src).collect())
                .unwrap_or_default()
        } else {
            vec![frame.dst]
        };

        for dst in dsts {
            let Some(tx) = self.inner.nodes.get(&dst) else {
                if !is_group(frame.dst) {
                    return Err(TransportError::NoRoute(dst));
                }
                continue;
            };
            if self.lost() {
                tracing::trace!(src = format_args!("0x{:04x}", frame.src), dst = format_args!("0x{dst:04x}"), "frame lost");
                continue;
            }
            if tx.send(frame.clone()).is_err() && !is_group(frame.dst) {
                return Err(TransportError::Closed);
            }
        }
        Ok(())
    }
}

/// A node's handle on the mesh.
#[derive(Clone)]
pub struct Port {
    addr: Address,
    mesh: Mesh,
}

impl Port {
    pub fn addr(&self) -> Address {
        self.addr
    }
}

impl Transport for Port {
    fn send(&mut self, ctx: MsgCtx, msg: Message) -> Result<(), TransportError> {
        tracing::trace!(
            src = format_args!("0x{:04x}", self.addr),
            dst = format_args!("0x{:04x}", ctx.addr),
            opcode = format_args!("0x{:04x}", msg.opcode()),
            "tx"
        );
        self.mesh.deliver(Frame {
            src: self.addr,
            dst: ctx.addr,
            app_idx: ctx.app_idx,
            ttl: ctx.ttl,
            data: msg.encode(),
        })
    }

    fn is_local(&self, addr: Address) -> bool {
        addr == self.addr
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn group_fans_out_except_sender() {
        let mesh = Mesh::new(0);
        let mut a = mesh.join(0x0001);
        let mut b = mesh.join(0x0002);
        let mut c = mesh.join(0x0003);
        for addr in [0x0001, 0x0002, 0x0003] {
            mesh.subscribe(0xc000, addr);
        }

        let mut port = mesh.port(0x0001);
        port.send(MsgCtx::new(0xc000, 0, 7), Message::UpdateGet).unwrap();

        assert!(a.try_recv().is_err());
        for rx in [&mut b, &mut c] {
            let frame = rx.try_recv().unwrap();
            assert_eq!(frame.src, 0x0001);
            assert_eq!(Message::decode(&frame.data).unwrap(), Message::UpdateGet);
        }
    }

    #[test]
    fn unicast_to_unknown_node_fails() {
        let mesh = Mesh::new(0);
        let mut port = mesh.port(0x0001);
        assert!(matches!(
            port.send(MsgCtx::new(0x0042, 0, 7), Message::UpdateGet),
            Err(TransportError::NoRoute(0x0042))
        ));
        assert!(port.is_local(0x0001));
    }

    #[test]
    fn total_loss_delivers_nothing() {
        let mesh = Mesh::new(100);
        let mut rx = mesh.join(0x0002);
        let mut port = mesh.port(0x0001);
        port.send(MsgCtx::new(0x0002, 0, 7), Message::UpdateApply).unwrap();
        assert!(rx.try_recv().is_err());
    }
}
