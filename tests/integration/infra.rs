use crate::*;

// ══════════════════════════════════════════════════════════════════════════════
//  Virtual mesh: one client, N servers, a virtual clock
// ══════════════════════════════════════════════════════════════════════════════

/// Anything the simulated mesh can host.
pub trait SimNode {
    fn handle(&mut self, now: Instant, net: &mut Outbox, ctx: MsgCtx, msg: &Message);
    fn next_deadline(&self) -> Option<Instant>;
    fn poll(&mut self, now: Instant, net: &mut Outbox);
    /// Application follow-up after every delivery round.
    fn settle(&mut self) {}
}

/// One message as seen on the simulated air.
#[derive(Debug, Clone)]
pub struct Delivery {
    /// Virtual time since the simulation started.
    pub at: Duration,
    pub src: Address,
    pub dst: Address,
    pub msg: Message,
}

pub struct Sim<C, S> {
    pub now: Instant,
    pub start: Instant,
    pub client: C,
    pub servers: Vec<S>,
    pub client_addr: Address,
    pub server_addrs: Vec<Address>,
    pub group: Address,
    client_out: Outbox,
    server_out: Vec<Outbox>,
    /// Return true to lose a delivery.
    pub drop: Box<dyn FnMut(&Delivery) -> bool>,
    /// Every delivery attempt, lost ones included.
    pub trace: Vec<Delivery>,
}

impl<C: SimNode, S: SimNode> Sim<C, S> {
    pub fn new(client: C, servers: Vec<(Address, S)>, group: Address) -> Self {
        let now = Instant::now();
        let (server_addrs, servers): (Vec<_>, Vec<_>) = servers.into_iter().unzip();
        Self {
            now,
            start: now,
            client,
            server_out: server_addrs.iter().map(|&a| Outbox::new(a)).collect(),
            servers,
            client_addr: CLIENT,
            server_addrs,
            group,
            client_out: Outbox::new(CLIENT),
            drop: Box::new(|_| false),
            trace: Vec::new(),
        }
    }

    pub fn elapsed(&self) -> Duration {
        self.now - self.start
    }

    pub fn server(&mut self, addr: Address) -> &mut S {
        let idx = self.server_addrs.iter().position(|a| *a == addr).expect("known server");
        &mut self.servers[idx]
    }

    /// Run a closure against the client with its outbox, as a driver would.
    pub fn with_client<R>(&mut self, f: impl FnOnce(&mut C, Instant, &mut Outbox) -> R) -> R {
        f(&mut self.client, self.now, &mut self.client_out)
    }

    pub fn with_server<R>(&mut self, addr: Address, f: impl FnOnce(&mut S, Instant, &mut Outbox) -> R) -> R {
        let idx = self.server_addrs.iter().position(|a| *a == addr).expect("known server");
        f(&mut self.servers[idx], self.now, &mut self.server_out[idx])
    }

    fn route(&self, dst: Address) -> Vec<usize> {
        if dst == self.group && dst != ADDR_UNASSIGNED {
            (0..self.servers.len()).collect()
        } else {
            self.server_addrs.iter().position(|a| *a == dst).into_iter().collect()
        }
    }

    fn record(&mut self, src: Address, dst: Address, msg: &Message) -> Option<Message> {
        // Every frame crosses the codec, as it would on the air.
        let msg = Message::decode(&msg.encode()).expect("frame decodes");
        let d = Delivery { at: self.elapsed(), src, dst, msg };
        let lost = (self.drop)(&d);
        let msg = d.msg.clone();
        self.trace.push(d);
        (!lost).then_some(msg)
    }

    /// Deliver queued frames until the mesh is quiet.
    pub fn flush(&mut self) {
        loop {
            let mut moved = false;

            let sent: Vec<_> = self.client_out.drain().collect();
            for (ctx, msg) in sent {
                moved = true;
                for idx in self.route(ctx.addr) {
                    let dst = self.server_addrs[idx];
                    let Some(msg) = self.record(self.client_addr, dst, &msg) else { continue };
                    let from = MsgCtx::new(self.client_addr, ctx.app_idx, ctx.ttl);
                    self.servers[idx].handle(self.now, &mut self.server_out[idx], from, &msg);
                }
            }

            for idx in 0..self.servers.len() {
                let sent: Vec<_> = self.server_out[idx].drain().collect();
                for (ctx, msg) in sent {
                    moved = true;
                    if ctx.addr != self.client_addr {
                        continue;
                    }
                    let src = self.server_addrs[idx];
                    let Some(msg) = self.record(src, self.client_addr, &msg) else { continue };
                    self.client.handle(self.now, &mut self.client_out, MsgCtx::new(src, ctx.app_idx, ctx.ttl), &msg);
                }
            }

            self.client.settle();
            for s in &mut self.servers {
                s.settle();
            }
            if !moved {
                break;
            }
        }
    }

    fn next_deadline(&self) -> Option<Instant> {
        earliest(std::iter::once(self.client.next_deadline()).chain(self.servers.iter().map(|s| s.next_deadline())))
    }

    /// Advance the clock to the next timer and fire it.
    pub fn step(&mut self) -> bool {
        self.flush();
        let Some(at) = self.next_deadline() else { return false };
        self.now = self.now.max(at);
        self.client.poll(self.now, &mut self.client_out);
        for (s, out) in self.servers.iter_mut().zip(self.server_out.iter_mut()) {
            s.poll(self.now, out);
        }
        self.flush();
        true
    }

    /// Run until `done` holds, the mesh goes idle, or `limit` of virtual
    /// time passes. Returns whether `done` was reached.
    pub fn run_until(&mut self, limit: Duration, mut done: impl FnMut(&mut Self) -> bool) -> bool {
        let give_up = self.now + limit;
        self.flush();
        loop {
            if done(self) {
                return true;
            }
            if self.now > give_up || !self.step() {
                return done(self);
            }
        }
    }

    /// Messages from the client matching `pred`, counted per destination
    /// server (group sends count once per member).
    pub fn count_sent(&self, pred: impl Fn(&Message) -> bool) -> usize {
        self.trace.iter().filter(|d| d.src == self.client_addr && pred(&d.msg)).count()
    }
}

// ── Node adapters ────────────────────────────────────────────────────────────

impl SimNode for BlobCli {
    fn handle(&mut self, now: Instant, net: &mut Outbox, ctx: MsgCtx, msg: &Message) {
        let _ = self.handle_message(now, net, ctx, msg);
    }
    fn next_deadline(&self) -> Option<Instant> {
        BlobCli::next_deadline(self)
    }
    fn poll(&mut self, now: Instant, net: &mut Outbox) {
        BlobCli::poll(self, now, net)
    }
}

impl SimNode for DfuCli {
    fn handle(&mut self, now: Instant, net: &mut Outbox, ctx: MsgCtx, msg: &Message) {
        let _ = self.handle_message(now, net, ctx, msg);
    }
    fn next_deadline(&self) -> Option<Instant> {
        DfuCli::next_deadline(self)
    }
    fn poll(&mut self, now: Instant, net: &mut Outbox) {
        DfuCli::poll(self, now, net)
    }
}

/// What a BLOB server's application saw.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SrvEvent {
    Start(u64),
    End(u64, bool),
    Suspended,
    Resumed,
}

#[derive(Default)]
pub struct Recorder {
    pub events: Vec<SrvEvent>,
}

impl BlobSrvHandler for Recorder {
    fn start(&mut self, _cli: Address, xfer: &BlobXfer) -> Result<(), HandlerError> {
        self.events.push(SrvEvent::Start(xfer.id));
        Ok(())
    }
    fn end(&mut self, id: u64, success: bool) {
        self.events.push(SrvEvent::End(id, success));
    }
    fn suspended(&mut self) {
        self.events.push(SrvEvent::Suspended);
    }
    fn resume(&mut self) {
        self.events.push(SrvEvent::Resumed);
    }
}

/// A BLOB Transfer Server with an in-memory stream.
pub struct BlobNode {
    pub srv: BlobSrv,
    pub app: Recorder,
    pub stream: MemoryStream,
}

impl BlobNode {
    pub fn new(cfg: BlobServerConfig) -> Self {
        Self { srv: BlobSrv::new(cfg, Box::new(MemoryStore::new())), app: Recorder::default(), stream: MemoryStream::new() }
    }

    /// Prepare to receive `id`.
    pub fn expect(mut self, id: u64) -> Self {
        let stream = self.stream.clone();
        self.srv.recv(Instant::now(), id, Box::new(stream), 0, 0).expect("server idle");
        self
    }
}

impl SimNode for BlobNode {
    fn handle(&mut self, now: Instant, net: &mut Outbox, ctx: MsgCtx, msg: &Message) {
        let _ = self.srv.handle_message(now, net, ctx, msg, &mut self.app);
    }
    fn next_deadline(&self) -> Option<Instant> {
        self.srv.next_deadline()
    }
    fn poll(&mut self, now: Instant, net: &mut Outbox) {
        self.srv.poll(now, net, &mut self.app)
    }
}

/// Firmware Update Server that verifies every image and applies by swapping
/// its firmware ID.
pub struct DfuNode {
    pub srv: DfuSrv,
    pub received: Arc<Mutex<Option<MemoryStream>>>,
    pub reject: bool,
}

struct DfuApp {
    effect: DfuEffect,
    received: Arc<Mutex<Option<MemoryStream>>>,
}

impl DfuSrvHandler for DfuApp {
    fn check(&mut self, _img_idx: u8, _img: &FwImage, metadata: &[u8]) -> Result<DfuEffect, HandlerError> {
        if metadata.starts_with(b"bad") {
            return Err(HandlerError("unknown metadata".into()));
        }
        Ok(self.effect)
    }

    fn start(&mut self, _img_idx: u8, img: &FwImage, metadata: &[u8]) -> Result<Box<dyn BlobStream>, StartError> {
        if metadata == &img.fwid[..] {
            return Err(StartError::AlreadyHave);
        }
        let stream = MemoryStream::new();
        *self.received.lock().unwrap() = Some(stream.clone());
        Ok(Box::new(stream))
    }

    fn end(&mut self, _img_idx: u8, _img: &FwImage, _success: bool) {}

    fn apply(&mut self, _img_idx: u8, _img: &FwImage) -> Result<(), HandlerError> {
        Ok(())
    }
}

impl DfuNode {
    pub fn new(fwid: &'static [u8], effect: DfuEffect) -> Self {
        let received = Arc::new(Mutex::new(None));
        let srv = DfuSrv::new(
            BlobServerConfig::default(),
            DfuConfig::default(),
            vec![FwImage { fwid: Bytes::from_static(fwid), uri: Bytes::new() }],
            Box::new(DfuApp { effect, received: received.clone() }),
            DfuSrvStores { blob: Box::new(MemoryStore::new()), update: Box::new(MemoryStore::new()) },
        );
        Self { srv, received, reject: false }
    }

    pub fn contents(&self) -> Option<Vec<u8>> {
        self.received.lock().unwrap().as_ref().map(|s| s.contents())
    }

    pub fn fwid(&self) -> Bytes {
        self.srv.imgs()[0].fwid.clone()
    }
}

impl SimNode for DfuNode {
    fn handle(&mut self, now: Instant, net: &mut Outbox, ctx: MsgCtx, msg: &Message) {
        let _ = self.srv.handle_message(now, net, ctx, msg);
    }
    fn next_deadline(&self) -> Option<Instant> {
        self.srv.next_deadline()
    }
    fn poll(&mut self, now: Instant, net: &mut Outbox) {
        self.srv.poll(now, net)
    }
    fn settle(&mut self) {
        match self.srv.phase() {
            DfuPhase::Verify if self.reject => self.srv.rejected().unwrap(),
            DfuPhase::Verify => self.srv.verified().unwrap(),
            DfuPhase::Applying => {
                self.srv.set_fwid(0, Bytes::from_static(NEW_FWID));
                self.srv.applied().unwrap();
            }
            _ => {}
        }
    }
}

// ── Fixtures ─────────────────────────────────────────────────────────────────

pub const CLIENT: Address = 0x0001;
pub const GROUP: Address = 0xc000;
pub const NEW_FWID: &[u8] = b"fw-2.0";

pub fn image(size: usize) -> Vec<u8> {
    (0..size).map(|i| (i * 7 + i / 251) as u8).collect()
}

pub fn blob_inputs(targets: &[Address], group: Address) -> BlobCliInputs {
    BlobCliInputs { targets: targets.to_vec(), group, app_idx: 0, ttl: 0, timeout_base: 0 }
}

pub fn blob_events(cli: &mut BlobCli) -> Vec<BlobCliEvent> {
    std::iter::from_fn(|| cli.poll_event()).collect()
}

pub fn dfu_events(cli: &mut DfuCli) -> Vec<DfuCliEvent> {
    std::iter::from_fn(|| cli.poll_event()).collect()
}
