use crate::*;

const ID: u64 = 0x1122_3344_5566_7788;
const A: Address = 0x0100;
const B: Address = 0x0101;

fn push_xfer(size: u32, block_size_log: u8, chunk_size: u16) -> BlobXfer {
    BlobXfer { id: ID, size, mode: XferMode::Push, block_size_log, chunk_size }
}

fn blob_sim(servers: Vec<(Address, BlobNode)>) -> Sim<BlobCli, BlobNode> {
    let addrs: Vec<Address> = servers.iter().map(|(a, _)| *a).collect();
    let mut cli = BlobCli::new(BlobClientConfig::default());
    cli.set_targets(blob_inputs(&addrs, GROUP)).unwrap();
    Sim::new(cli, servers, GROUP)
}

fn ended(sim: &mut Sim<BlobCli, BlobNode>, events: &mut Vec<BlobCliEvent>) -> bool {
    events.extend(blob_events(&mut sim.client));
    events.iter().any(|e| matches!(e, BlobCliEvent::End { .. }))
}

/// 1000 bytes in one 1024 byte block of 100 byte chunks: ten chunks per
/// target, one successful end.
#[test]
fn test_push_single_block() {
    let data = image(1000);
    let mut sim = blob_sim(vec![
        (A, BlobNode::new(BlobServerConfig::default()).expect(ID)),
        (B, BlobNode::new(BlobServerConfig::default()).expect(ID)),
    ]);

    sim.with_client(|cli, now, net| cli.send(now, net, push_xfer(1000, 10, 100), Box::new(MemoryStream::from_bytes(data.clone()))))
        .unwrap();

    let mut events = Vec::new();
    assert!(sim.run_until(Duration::from_secs(60), |s| ended(s, &mut events)));

    let ends: Vec<_> = events.iter().filter(|e| matches!(e, BlobCliEvent::End { .. })).collect();
    assert_eq!(ends.len(), 1);
    assert!(matches!(ends[0], BlobCliEvent::End { success: true, xfer } if xfer.id == ID));
    assert!(!events.iter().any(|e| matches!(e, BlobCliEvent::LostTarget { .. })));

    // Group sends reach both servers: 10 chunks each.
    assert_eq!(sim.count_sent(|m| matches!(m, Message::Chunk { .. })), 20);
    for addr in [A, B] {
        let node = sim.server(addr);
        assert_eq!(node.stream.contents(), data);
        assert_eq!(node.srv.phase(), XferPhase::Complete);
        assert_eq!(node.app.events, vec![SrvEvent::Start(ID), SrvEvent::End(ID, true)]);
    }
    assert_eq!(sim.client.state(), CliState::None);
    assert_eq!(sim.client.progress(), 0);
}

#[test]
fn test_push_many_blocks_short_tail() {
    // 3 full 256 byte blocks and a 100 byte tail, odd chunk size.
    let data = image(868);
    let mut sim = blob_sim(vec![(A, BlobNode::new(BlobServerConfig::default()).expect(ID))]);

    sim.with_client(|cli, now, net| cli.send(now, net, push_xfer(868, 8, 60), Box::new(MemoryStream::from_bytes(data.clone()))))
        .unwrap();

    let mut events = Vec::new();
    assert!(sim.run_until(Duration::from_secs(60), |s| ended(s, &mut events)));
    assert!(events.iter().any(|e| matches!(e, BlobCliEvent::End { success: true, .. })));
    assert_eq!(sim.server(A).stream.contents(), data);

    let block_starts: Vec<u16> = sim
        .trace
        .iter()
        .filter_map(|d| match d.msg {
            Message::BlockStart { block, .. } => Some(block),
            _ => None,
        })
        .collect();
    assert_eq!(block_starts, vec![0, 1, 2, 3]);
    // 5 chunks per full block, 2 for the tail.
    assert_eq!(sim.count_sent(|m| matches!(m, Message::Chunk { .. })), 3 * 5 + 2);
}

/// A target whose smallest block is larger than every other target's
/// largest gets dropped; the rest define the envelope.
#[test]
fn test_caps_drop_incompatible_target() {
    let big = BlobServerConfig { block_size_log_min: 13, block_size_log_max: 15, ..BlobServerConfig::default() };
    let mut sim = blob_sim(vec![
        (A, BlobNode::new(BlobServerConfig::default())),
        (B, BlobNode::new(big)),
    ]);

    sim.with_client(|cli, now, net| cli.caps_get(now, net)).unwrap();
    let mut events = Vec::new();
    assert!(sim.run_until(Duration::from_secs(60), |s| {
        events.extend(blob_events(&mut s.client));
        events.iter().any(|e| matches!(e, BlobCliEvent::Caps(_)))
    }));

    assert_eq!(events[0], BlobCliEvent::LostTarget { addr: B, reason: BlobStatus::InvalidBlockSize });
    let BlobCliEvent::Caps(Some(caps)) = events[1] else { panic!("expected caps, got {:?}", events[1]) };
    let own = sim.server(A).srv.caps();
    assert_eq!(caps.min_block_size_log, own.min_block_size_log);
    assert_eq!(caps.max_block_size_log, own.max_block_size_log);
    assert_eq!(caps.max_chunk_size, own.max_chunk_size);
    assert_eq!(events.len(), 2);
    assert_eq!(sim.client.target(B).unwrap().status, BlobStatus::InvalidBlockSize);
}

#[test]
fn test_lost_frames_are_retried() {
    let data = image(2000);
    let mut sim = blob_sim(vec![
        (A, BlobNode::new(BlobServerConfig::default()).expect(ID)),
        (B, BlobNode::new(BlobServerConfig::default()).expect(ID)),
    ]);
    // Lose the first Block Start to B and every third chunk on the first pass.
    let mut block_starts = 0;
    let mut chunks = 0;
    sim.drop = Box::new(move |d| match d.msg {
        Message::BlockStart { .. } if d.dst == B => {
            block_starts += 1;
            block_starts == 1
        }
        Message::Chunk { .. } => {
            chunks += 1;
            chunks <= 20 && chunks % 3 == 0
        }
        _ => false,
    });

    sim.with_client(|cli, now, net| cli.send(now, net, push_xfer(2000, 10, 128), Box::new(MemoryStream::from_bytes(data.clone()))))
        .unwrap();

    let mut events = Vec::new();
    assert!(sim.run_until(Duration::from_secs(120), |s| ended(s, &mut events)));
    assert!(events.iter().any(|e| matches!(e, BlobCliEvent::End { success: true, .. })));
    assert_eq!(sim.server(A).stream.contents(), data);
    assert_eq!(sim.server(B).stream.contents(), data);
}

#[test]
fn test_silent_target_is_dropped() {
    let data = image(512);
    let mut sim = blob_sim(vec![
        (A, BlobNode::new(BlobServerConfig::default()).expect(ID)),
        (B, BlobNode::new(BlobServerConfig::default()).expect(ID)),
    ]);
    sim.drop = Box::new(|d| d.src == B);

    sim.with_client(|cli, now, net| cli.send(now, net, push_xfer(512, 9, 64), Box::new(MemoryStream::from_bytes(data.clone()))))
        .unwrap();

    let mut events = Vec::new();
    assert!(sim.run_until(Duration::from_secs(300), |s| ended(s, &mut events)));
    assert!(events.contains(&BlobCliEvent::LostTarget { addr: B, reason: BlobStatus::Internal }));
    assert!(events.iter().any(|e| matches!(e, BlobCliEvent::End { success: true, .. })));
    assert_eq!(sim.server(A).stream.contents(), data);
    assert!(sim.client.target(B).unwrap().timedout);
}

#[test]
fn test_all_silent_suspends_then_resumes() {
    let data = image(512);
    let mut sim = blob_sim(vec![(A, BlobNode::new(BlobServerConfig::default()).expect(ID))]);
    let deaf = Arc::new(Mutex::new(true));
    let gate = deaf.clone();
    sim.drop = Box::new(move |d| *gate.lock().unwrap() && d.src == A);

    sim.with_client(|cli, now, net| cli.send(now, net, push_xfer(512, 9, 64), Box::new(MemoryStream::from_bytes(data.clone()))))
        .unwrap();

    let mut events = Vec::new();
    assert!(sim.run_until(Duration::from_secs(300), |s| {
        events.extend(blob_events(&mut s.client));
        events.contains(&BlobCliEvent::Suspended)
    }));
    assert_eq!(sim.client.state(), CliState::Suspended);

    *deaf.lock().unwrap() = false;
    sim.with_client(|cli, now, net| cli.resume(now, net)).unwrap();
    events.clear();
    assert!(sim.run_until(Duration::from_secs(600), |s| ended(s, &mut events)));
    assert!(events.iter().any(|e| matches!(e, BlobCliEvent::End { success: true, .. })));
    assert_eq!(sim.server(A).stream.contents(), data);
}

#[test]
fn test_cancel_reaches_targets() {
    let data = image(4096);
    let mut sim = blob_sim(vec![(A, BlobNode::new(BlobServerConfig::default()).expect(ID))]);
    // Hold back the first block check so the transfer is still running.
    sim.drop = Box::new(|d| matches!(d.msg, Message::BlockGet));

    sim.with_client(|cli, now, net| cli.send(now, net, push_xfer(4096, 10, 256), Box::new(MemoryStream::from_bytes(data.clone()))))
        .unwrap();
    assert!(sim.run_until(Duration::from_secs(10), |s| s.client.state() == CliState::BlockCheck));
    assert_eq!(sim.server(A).srv.phase(), XferPhase::WaitingForBlock);

    sim.with_client(|cli, now, net| cli.cancel(now, net));
    let mut events = Vec::new();
    assert!(sim.run_until(Duration::from_secs(60), |s| ended(s, &mut events)));
    assert!(events.iter().any(|e| matches!(e, BlobCliEvent::End { success: false, .. })));
    assert_eq!(sim.server(A).srv.phase(), XferPhase::Inactive);
    assert!(sim.server(A).app.events.contains(&SrvEvent::End(ID, false)));
}

#[test]
fn test_busy_client_refuses_second_transfer() {
    let mut sim = blob_sim(vec![(A, BlobNode::new(BlobServerConfig::default()).expect(ID))]);
    sim.with_client(|cli, now, net| cli.send(now, net, push_xfer(1000, 10, 100), Box::new(MemoryStream::from_bytes(image(1000)))))
        .unwrap();
    let second = sim.with_client(|cli, now, net| {
        cli.send(now, net, push_xfer(1000, 10, 100), Box::new(MemoryStream::from_bytes(image(1000))))
    });
    assert!(second.is_err());
}

/// A server stuck waiting for chunks suspends after its timeout and picks
/// up again when the client repeats Block Start.
#[test]
fn test_server_suspends_and_resumes_on_block_start() {
    let start = Instant::now();
    let mut node = BlobNode::new(BlobServerConfig::default());
    node.srv.recv(start, ID, Box::new(node.stream.clone()), 0, 0).unwrap();
    let mut out = Outbox::new(A);
    let cli = MsgCtx::new(CLIENT, 0, 0);
    let xfer = Message::XferStart(mbt_core::wire::XferStart {
        mode: XferMode::Push,
        id: ID,
        size: 1000,
        block_size_log: 10,
        mtu_size: 384,
    });
    let block = Message::BlockStart { block: 0, chunk_size: 100 };

    node.handle(start, &mut out, cli, &xfer);
    node.handle(start, &mut out, cli, &block);
    assert_eq!(node.srv.phase(), XferPhase::WaitingForChunk);
    let deadline = node.next_deadline().unwrap();
    assert_eq!(deadline - start, Duration::from_secs(10));

    let later = start + Duration::from_secs(11);
    node.poll(later, &mut out);
    assert_eq!(node.srv.phase(), XferPhase::Suspended);
    assert_eq!(node.next_deadline(), None);
    assert_eq!(node.app.events.last(), Some(&SrvEvent::Suspended));

    out.drain().for_each(drop);
    node.handle(later, &mut out, cli, &block);
    assert_eq!(node.srv.phase(), XferPhase::WaitingForChunk);
    assert_eq!(node.app.events.last(), Some(&SrvEvent::Resumed));
    assert_eq!(node.next_deadline(), Some(later + Duration::from_secs(10)));
}
