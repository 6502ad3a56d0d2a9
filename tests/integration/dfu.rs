use crate::*;

const T1: Address = 0x0300;
const T2: Address = 0x0301;
const T3: Address = 0x0302;
const T4: Address = 0x0303;
const OLD_FWID: &[u8] = b"fw-1.0";

fn dfu_sim(nodes: Vec<(Address, DfuNode)>) -> Sim<DfuCli, DfuNode> {
    Sim::new(DfuCli::new(BlobClientConfig::default(), DfuConfig::default()), nodes, GROUP)
}

fn dfu_inputs(addrs: &[Address]) -> DfuCliInputs {
    DfuCliInputs {
        targets: addrs.iter().map(|&addr| DfuTargetSpec { addr, img_idx: 0 }).collect(),
        group: GROUP,
        app_idx: 0,
        ttl: 0,
        timeout_base: 0,
    }
}

fn new_image(size: u32, metadata: &'static [u8]) -> DfuXfer {
    DfuXfer {
        blob_id: 0xd0d0_0001,
        size,
        fwid: Bytes::from_static(NEW_FWID),
        metadata: Bytes::from_static(metadata),
        mode: XferMode::Push,
        blob_params: None,
    }
}

fn start(sim: &mut Sim<DfuCli, DfuNode>, addrs: &[Address], xfer: DfuXfer, data: &[u8]) {
    let io = Box::new(MemoryStream::from_bytes(data.to_vec()));
    sim.with_client(|cli, now, net| cli.send(now, net, dfu_inputs(addrs), xfer, io)).unwrap();
}

/// Run until an event matching `last` shows up and return everything seen.
fn until(
    sim: &mut Sim<DfuCli, DfuNode>,
    limit: Duration,
    last: impl Fn(&DfuCliEvent) -> bool,
) -> Vec<DfuCliEvent> {
    let mut events = Vec::new();
    let done = sim.run_until(limit, |s| {
        events.extend(dfu_events(&mut s.client));
        events.iter().any(&last)
    });
    assert!(done, "gave up waiting, events so far: {events:?}");
    events
}

fn ended(e: &DfuCliEvent) -> bool {
    matches!(e, DfuCliEvent::Ended(_))
}

fn lost(events: &[DfuCliEvent]) -> Vec<(Address, DfuStatus)> {
    events
        .iter()
        .filter_map(|e| match e {
            DfuCliEvent::LostTarget { addr, status } => Some((*addr, *status)),
            _ => None,
        })
        .collect()
}

fn silence(sim: &mut Sim<DfuCli, DfuNode>) -> Arc<Mutex<Vec<Address>>> {
    let silenced: Arc<Mutex<Vec<Address>>> = Arc::default();
    let list = silenced.clone();
    sim.drop = Box::new(move |d| list.lock().unwrap().contains(&d.src));
    silenced
}

#[test]
fn test_update_transfer_apply_confirm() {
    let data = image(3000);
    let mut sim = dfu_sim(vec![
        (T1, DfuNode::new(OLD_FWID, DfuEffect::None)),
        (T2, DfuNode::new(OLD_FWID, DfuEffect::None)),
        (T3, DfuNode::new(OLD_FWID, DfuEffect::None)),
    ]);

    start(&mut sim, &[T1, T2, T3], new_image(3000, NEW_FWID), &data);
    let events = until(&mut sim, Duration::from_secs(120), ended);
    assert_eq!(events, vec![DfuCliEvent::Ended(DfuStatus::Success)]);
    assert_eq!(sim.client.state(), DfuCliState::Verified);
    for addr in [T1, T2, T3] {
        let node = sim.server(addr);
        assert_eq!(node.contents().as_deref(), Some(&data[..]));
        assert_eq!(node.srv.phase(), DfuPhase::VerifyOk);
        assert_eq!(sim.client.target(addr).unwrap().phase, DfuPhase::VerifyOk);
    }
    // Capabilities were retrieved before the transfer.
    assert!(sim.trace.iter().any(|d| matches!(d.msg, Message::InfoGet)));

    sim.with_client(|cli, now, net| cli.apply(now, net)).unwrap();
    let events = until(&mut sim, Duration::from_secs(120), |e| *e == DfuCliEvent::Applied);
    assert_eq!(events, vec![DfuCliEvent::Applied]);
    for addr in [T1, T2, T3] {
        assert_eq!(sim.server(addr).fwid(), Bytes::from_static(NEW_FWID));
        assert_eq!(sim.server(addr).srv.phase(), DfuPhase::Idle);
    }

    sim.with_client(|cli, now, net| cli.confirm(now, net)).unwrap();
    let events = until(&mut sim, Duration::from_secs(120), |e| *e == DfuCliEvent::Confirmed);
    assert_eq!(events, vec![DfuCliEvent::Confirmed]);
    assert_eq!(sim.client.state(), DfuCliState::Idle);
    assert_eq!(sim.client.progress(), 100);
}

/// Apply judgement: a target that unprovisions may go silent, one that
/// already finished and answers Idle counts as applied, any other silent
/// target failed to apply.
#[test]
fn test_apply_tolerates_expected_silence() {
    let data = image(1500);
    let mut sim = dfu_sim(vec![
        (T1, DfuNode::new(OLD_FWID, DfuEffect::None)),
        (T2, DfuNode::new(OLD_FWID, DfuEffect::Unprov)),
        (T3, DfuNode::new(OLD_FWID, DfuEffect::None)),
        (T4, DfuNode::new(OLD_FWID, DfuEffect::None)),
    ]);
    let silenced = silence(&mut sim);

    start(&mut sim, &[T1, T2, T3, T4], new_image(1500, NEW_FWID), &data);
    let events = until(&mut sim, Duration::from_secs(120), ended);
    assert_eq!(events, vec![DfuCliEvent::Ended(DfuStatus::Success)]);
    assert_eq!(sim.client.target(T2).unwrap().effect, DfuEffect::Unprov);

    // T3 lost its update state and is back to Idle.
    sim.server(T3).srv.cancel();
    assert_eq!(sim.server(T3).srv.phase(), DfuPhase::Idle);
    silenced.lock().unwrap().extend([T2, T4]);

    sim.with_client(|cli, now, net| cli.apply(now, net)).unwrap();
    let events = until(&mut sim, Duration::from_secs(120), |e| *e == DfuCliEvent::Applied);
    assert_eq!(lost(&events), vec![(T4, DfuStatus::WrongPhase)]);
    assert_eq!(sim.client.target(T2).unwrap().status, DfuStatus::Success);
    assert_eq!(sim.client.target(T3).unwrap().status, DfuStatus::Success);
    assert_eq!(sim.client.target(T3).unwrap().phase, DfuPhase::Idle);
    assert_eq!(sim.client.state(), DfuCliState::Applied);

    // T3 never ran the new image, T2 stays silent as expected.
    sim.with_client(|cli, now, net| cli.confirm(now, net)).unwrap();
    let events = until(&mut sim, Duration::from_secs(120), |e| *e == DfuCliEvent::Confirmed);
    assert_eq!(lost(&events), vec![(T3, DfuStatus::Internal)]);
    assert_eq!(sim.client.target(T1).unwrap().status, DfuStatus::Success);
    assert_eq!(sim.client.target(T2).unwrap().status, DfuStatus::Success);
}

#[test]
fn test_unprov_target_answering_confirm_fails() {
    let data = image(500);
    let mut sim = dfu_sim(vec![
        (T1, DfuNode::new(OLD_FWID, DfuEffect::None)),
        (T2, DfuNode::new(OLD_FWID, DfuEffect::Unprov)),
    ]);

    start(&mut sim, &[T1, T2], new_image(500, NEW_FWID), &data);
    until(&mut sim, Duration::from_secs(120), ended);
    sim.with_client(|cli, now, net| cli.apply(now, net)).unwrap();
    until(&mut sim, Duration::from_secs(120), |e| *e == DfuCliEvent::Applied);

    sim.with_client(|cli, now, net| cli.confirm(now, net)).unwrap();
    let events = until(&mut sim, Duration::from_secs(120), |e| *e == DfuCliEvent::Confirmed);
    assert_eq!(lost(&events), vec![(T2, DfuStatus::Internal)]);
}

#[test]
fn test_target_with_image_skips_transfer() {
    let data = image(2000);
    let mut sim = dfu_sim(vec![
        (T1, DfuNode::new(OLD_FWID, DfuEffect::None)),
        (T2, DfuNode::new(NEW_FWID, DfuEffect::None)),
    ]);

    start(&mut sim, &[T1, T2], new_image(2000, NEW_FWID), &data);
    let events = until(&mut sim, Duration::from_secs(120), ended);
    assert_eq!(events, vec![DfuCliEvent::Ended(DfuStatus::Success)]);

    assert_eq!(sim.server(T1).contents().as_deref(), Some(&data[..]));
    assert_eq!(sim.server(T2).contents(), None);
    assert_eq!(sim.server(T2).srv.phase(), DfuPhase::VerifyOk);
    // T2 hears the group transfer and refuses it, which must not count
    // against it.
    assert!(sim.trace.iter().any(|d| d.src == T2 && matches!(d.msg, Message::XferStatus(_))));
    assert_eq!(sim.client.target(T2).unwrap().status, DfuStatus::Success);
    assert_eq!(sim.client.target(T2).unwrap().phase, DfuPhase::VerifyOk);
}

#[test]
fn test_every_target_with_image_goes_straight_to_refresh() {
    let mut sim = dfu_sim(vec![
        (T1, DfuNode::new(NEW_FWID, DfuEffect::None)),
        (T2, DfuNode::new(NEW_FWID, DfuEffect::None)),
    ]);

    start(&mut sim, &[T1, T2], new_image(2000, NEW_FWID), &image(2000));
    let events = until(&mut sim, Duration::from_secs(120), ended);
    assert_eq!(events, vec![DfuCliEvent::Ended(DfuStatus::Success)]);
    assert!(!sim.trace.iter().any(|d| d.msg.is_blob()));
}

#[test]
fn test_rejected_image_drops_target() {
    let data = image(1000);
    let mut bad = DfuNode::new(OLD_FWID, DfuEffect::None);
    bad.reject = true;
    let mut sim = dfu_sim(vec![(T1, DfuNode::new(OLD_FWID, DfuEffect::None)), (T2, bad)]);

    start(&mut sim, &[T1, T2], new_image(1000, NEW_FWID), &data);
    let events = until(&mut sim, Duration::from_secs(120), ended);
    assert_eq!(lost(&events), vec![(T2, DfuStatus::WrongPhase)]);
    assert_eq!(events.last(), Some(&DfuCliEvent::Ended(DfuStatus::Success)));
    assert_eq!(sim.server(T2).srv.phase(), DfuPhase::VerifyFail);
}

#[test]
fn test_unknown_metadata_fails_distribution() {
    let mut sim = dfu_sim(vec![(T1, DfuNode::new(OLD_FWID, DfuEffect::None))]);

    start(&mut sim, &[T1], new_image(1000, b"bad-metadata"), &image(1000));
    let events = until(&mut sim, Duration::from_secs(120), ended);
    assert_eq!(lost(&events), vec![(T1, DfuStatus::Metadata)]);
    assert_eq!(events.last(), Some(&DfuCliEvent::Ended(DfuStatus::Internal)));
    assert_eq!(sim.client.state(), DfuCliState::Idle);
    assert_eq!(sim.server(T1).srv.phase(), DfuPhase::Idle);
}

#[test]
fn test_cancel_mid_transfer() {
    let data = image(8192);
    let mut sim = dfu_sim(vec![
        (T1, DfuNode::new(OLD_FWID, DfuEffect::None)),
        (T2, DfuNode::new(OLD_FWID, DfuEffect::None)),
    ]);

    start(&mut sim, &[T1, T2], new_image(8192, NEW_FWID), &data);
    assert!(sim.run_until(Duration::from_secs(60), |s| s.client.blob().state() == CliState::BlockSend));
    assert_eq!(sim.server(T1).srv.phase(), DfuPhase::TransferActive);

    sim.with_client(|cli, now, net| cli.cancel(now, net, None)).unwrap();
    let events = until(&mut sim, Duration::from_secs(120), ended);
    assert_eq!(events.last(), Some(&DfuCliEvent::Ended(DfuStatus::Internal)));
    assert!(sim.trace.iter().any(|d| matches!(d.msg, Message::XferCancel { .. })));
    assert!(sim.trace.iter().any(|d| matches!(d.msg, Message::UpdateCancel)));
    for addr in [T1, T2] {
        assert_eq!(sim.server(addr).srv.phase(), DfuPhase::Idle);
    }
    assert_eq!(sim.client.state(), DfuCliState::Idle);

    let again = sim.with_client(|cli, now, net| cli.cancel(now, net, None));
    assert_eq!(again, Err(mbt_services::DfuCliError::Already));
}

#[test]
fn test_busy_client_refuses_second_distribution() {
    let mut sim = dfu_sim(vec![(T1, DfuNode::new(OLD_FWID, DfuEffect::None))]);
    start(&mut sim, &[T1], new_image(1000, NEW_FWID), &image(1000));

    let io = Box::new(MemoryStream::from_bytes(image(1000)));
    let second =
        sim.with_client(|cli, now, net| cli.send(now, net, dfu_inputs(&[T1]), new_image(1000, NEW_FWID), io));
    assert_eq!(second, Err(mbt_services::DfuCliError::Busy));
}

#[test]
fn test_single_node_requests() {
    let mut sim = dfu_sim(vec![(T1, DfuNode::new(OLD_FWID, DfuEffect::CompChange))]);
    let node = MsgCtx::new(T1, 0, 0);

    sim.with_client(|cli, now, net| cli.imgs_get(now, net, node, 8)).unwrap();
    let events = until(&mut sim, Duration::from_secs(10), |e| matches!(e, DfuCliEvent::Response { .. }));
    let DfuCliEvent::Response { addr, result: Ok(mbt_services::DfuRsp::Images { total, images }) } = &events[0] else {
        panic!("unexpected {events:?}");
    };
    assert_eq!(*addr, T1);
    assert_eq!(*total, 1);
    assert_eq!(images[0].fwid, Bytes::from_static(OLD_FWID));

    sim.with_client(|cli, now, net| cli.metadata_check(now, net, node, 0, Bytes::from_static(NEW_FWID))).unwrap();
    let events = until(&mut sim, Duration::from_secs(10), |e| matches!(e, DfuCliEvent::Response { .. }));
    let DfuCliEvent::Response { result: Ok(mbt_services::DfuRsp::Metadata(m)), .. } = &events[0] else {
        panic!("unexpected {events:?}");
    };
    assert_eq!((m.status, m.effect), (DfuStatus::Success, DfuEffect::CompChange));

    sim.with_client(|cli, now, net| cli.metadata_check(now, net, node, 0, Bytes::from_static(b"bad"))).unwrap();
    let events = until(&mut sim, Duration::from_secs(10), |e| matches!(e, DfuCliEvent::Response { .. }));
    let DfuCliEvent::Response { result: Ok(mbt_services::DfuRsp::Metadata(m)), .. } = &events[0] else {
        panic!("unexpected {events:?}");
    };
    assert_eq!(m.status, DfuStatus::Metadata);

    sim.with_client(|cli, now, net| cli.status_get(now, net, node)).unwrap();
    let events = until(&mut sim, Duration::from_secs(10), |e| matches!(e, DfuCliEvent::Response { .. }));
    let DfuCliEvent::Response { result: Ok(mbt_services::DfuRsp::Status(s)), .. } = &events[0] else {
        panic!("unexpected {events:?}");
    };
    assert_eq!((s.status, s.phase), (DfuStatus::Success, DfuPhase::Idle));

    // Nothing answers a node outside the mesh.
    let stranger = MsgCtx::new(0x0999, 0, 0);
    sim.with_client(|cli, now, net| cli.status_get(now, net, stranger)).unwrap();
    let sent_at = sim.now;
    let events = until(&mut sim, Duration::from_secs(30), |e| matches!(e, DfuCliEvent::Response { .. }));
    assert_eq!(
        events,
        vec![DfuCliEvent::Response { addr: 0x0999, result: Err(mbt_services::DfuCliError::Timeout) }]
    );
    assert_eq!(sim.now - sent_at, Duration::from_millis(5000));
}

#[test]
fn test_fixed_blob_params_skip_capabilities() {
    let data = image(2500);
    let mut sim = dfu_sim(vec![(T1, DfuNode::new(OLD_FWID, DfuEffect::None))]);
    let xfer = DfuXfer {
        blob_params: Some(BlobParams { block_size_log: 10, chunk_size: 200 }),
        ..new_image(2500, NEW_FWID)
    };

    start(&mut sim, &[T1], xfer, &data);
    let events = until(&mut sim, Duration::from_secs(120), ended);
    assert_eq!(events, vec![DfuCliEvent::Ended(DfuStatus::Success)]);
    assert_eq!(sim.server(T1).contents().as_deref(), Some(&data[..]));
    assert!(!sim.trace.iter().any(|d| matches!(d.msg, Message::InfoGet)));
    let xfer_start = sim.trace.iter().find_map(|d| match &d.msg {
        Message::XferStart(s) => Some(*s),
        _ => None,
    });
    assert_eq!(xfer_start.map(|s| s.block_size_log), Some(10));
    assert!(sim
        .trace
        .iter()
        .all(|d| !matches!(d.msg, Message::BlockStart { chunk_size, .. } if chunk_size != 200)));
}
