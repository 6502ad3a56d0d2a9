use crate::*;

const ID: u64 = 0x00c0_ffee;
const A: Address = 0x0200;
const B: Address = 0x0201;

fn pull_xfer(size: u32) -> BlobXfer {
    BlobXfer { id: ID, size, mode: XferMode::Pull, block_size_log: 10, chunk_size: 100 }
}

fn pull_sim(servers: Vec<(Address, BlobServerConfig)>) -> Sim<BlobCli, BlobNode> {
    let addrs: Vec<Address> = servers.iter().map(|(a, _)| *a).collect();
    let mut cli = BlobCli::new(BlobClientConfig::default());
    cli.set_targets(blob_inputs(&addrs, GROUP)).unwrap();
    let nodes = servers.into_iter().map(|(a, cfg)| (a, BlobNode::new(cfg).expect(ID))).collect();
    Sim::new(cli, nodes, GROUP)
}

fn run_to_end(sim: &mut Sim<BlobCli, BlobNode>, limit: Duration) -> Vec<BlobCliEvent> {
    let mut events = Vec::new();
    let done = sim.run_until(limit, |s| {
        events.extend(blob_events(&mut s.client));
        events.iter().any(|e| matches!(e, BlobCliEvent::End { .. }))
    });
    assert!(done, "transfer did not end, events so far: {events:?}");
    events
}

/// The servers pace the transfer: four chunks per request, the rest
/// asked for in partial block reports.
#[test]
fn test_pull_transfer_paced_by_reports() {
    let data = image(1000);
    let cfg = BlobServerConfig { pull_req_count: 4, ..BlobServerConfig::default() };
    let mut sim = pull_sim(vec![(A, cfg.clone()), (B, cfg)]);

    sim.with_client(|cli, now, net| cli.send(now, net, pull_xfer(1000), Box::new(MemoryStream::from_bytes(data.clone()))))
        .unwrap();
    let events = run_to_end(&mut sim, Duration::from_secs(600));

    assert!(events.iter().any(|e| matches!(e, BlobCliEvent::End { success: true, .. })));
    assert!(!events.iter().any(|e| matches!(e, BlobCliEvent::LostTarget { .. })));
    for addr in [A, B] {
        let node = sim.server(addr);
        assert_eq!(node.stream.contents(), data);
        assert!(node.app.events.contains(&SrvEvent::End(ID, true)));
    }

    // Requests come in rounds of at most four chunks.
    let reports: Vec<Vec<u16>> = sim
        .trace
        .iter()
        .filter(|d| d.src == A)
        .filter_map(|d| match &d.msg {
            Message::BlockReport { missing } => Some(missing.clone()),
            _ => None,
        })
        .collect();
    assert!(reports.iter().all(|r| r.len() <= 4));
    assert!(reports.contains(&vec![4, 5, 6, 7]));
    assert_eq!(reports.last(), Some(&Vec::new()));

    // Chunks follow requests; nothing goes out before the server asks.
    let first_report = sim.trace.iter().position(|d| matches!(d.msg, Message::BlockReport { .. })).unwrap();
    let chunk_ids_before: Vec<u16> = sim.trace[..first_report]
        .iter()
        .filter_map(|d| match d.msg {
            Message::Chunk { index, .. } => Some(index),
            _ => None,
        })
        .collect();
    assert!(chunk_ids_before.iter().all(|&i| i < 4));
}

#[test]
fn test_pull_lost_chunk_is_requested_again() {
    let data = image(600);
    let cfg = BlobServerConfig { pull_req_count: 8, ..BlobServerConfig::default() };
    let mut sim = pull_sim(vec![(A, cfg)]);
    let mut seen = false;
    sim.drop = Box::new(move |d| match d.msg {
        Message::Chunk { index: 2, .. } if !seen => {
            seen = true;
            true
        }
        _ => false,
    });

    sim.with_client(|cli, now, net| cli.send(now, net, pull_xfer(600), Box::new(MemoryStream::from_bytes(data.clone()))))
        .unwrap();
    let events = run_to_end(&mut sim, Duration::from_secs(600));

    assert!(events.iter().any(|e| matches!(e, BlobCliEvent::End { success: true, .. })));
    assert_eq!(sim.server(A).stream.contents(), data);
    assert!(sim.trace.iter().any(|d| matches!(&d.msg, Message::BlockReport { missing } if missing == &vec![2])));
    assert_eq!(sim.count_sent(|m| matches!(m, Message::Chunk { index: 2, .. })), 2);
}

#[test]
fn test_push_only_server_rejects_pull() {
    let data = image(300);
    let push_only = BlobServerConfig { modes: XferMode::Push as u8, ..BlobServerConfig::default() };
    let mut sim = pull_sim(vec![(A, BlobServerConfig::default()), (B, push_only)]);

    sim.with_client(|cli, now, net| cli.send(now, net, pull_xfer(300), Box::new(MemoryStream::from_bytes(data.clone()))))
        .unwrap();
    let events = run_to_end(&mut sim, Duration::from_secs(600));

    assert!(events.contains(&BlobCliEvent::LostTarget { addr: B, reason: BlobStatus::UnsupportedMode }));
    assert!(events.iter().any(|e| matches!(e, BlobCliEvent::End { success: true, .. })));
    assert_eq!(sim.server(A).stream.contents(), data);
    assert!(sim.server(B).stream.contents().is_empty());
}
