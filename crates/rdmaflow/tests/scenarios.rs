//! End-to-end scenarios: handshakes, data movement, teardown ordering and failures.

mod common;

use std::sync::{Arc, Mutex};

use common::{device, progress_rounds, progress_until, recording_connection_callbacks, recording_pool, Pair, Recorder, Seen};
use rdmaflow::ops::{
    AtomicCmpSwp, AtomicFetchAdd, Read, Receive, RecvOpcode, Send as SendOp, SendImm, SyncEventGet,
    SyncEventNotifyAdd, SyncEventNotifySet, Write, WriteImm,
};
use rdmaflow::{
    AccessFlags, AddrType, BufList, CmListener, ConnectionCallbacks, ConnectionDetails, ConnectionState, Context,
    ContextState, ErrorKind, Event, Fabric, ImmData, MemoryRegion, RdmaAddress, SyncEvent, TaskStatus, UserData,
};

fn all_pools(ctx: &mut Context, rec: &Recorder) {
    recording_pool::<Receive>(ctx, rec, 8);
    recording_pool::<SendOp>(ctx, rec, 4);
    recording_pool::<SendImm>(ctx, rec, 4);
    recording_pool::<Read>(ctx, rec, 4);
    recording_pool::<Write>(ctx, rec, 4);
    recording_pool::<WriteImm>(ctx, rec, 4);
    recording_pool::<AtomicCmpSwp>(ctx, rec, 4);
    recording_pool::<AtomicFetchAdd>(ctx, rec, 4);
    recording_pool::<SyncEventGet>(ctx, rec, 4);
    recording_pool::<SyncEventNotifySet>(ctx, rec, 4);
    recording_pool::<SyncEventNotifyAdd>(ctx, rec, 4);
}

fn region(ctx: &Context, len: usize) -> Arc<MemoryRegion> {
    MemoryRegion::register(ctx.device(), vec![0u8; len], AccessFlags::ALL).unwrap()
}

#[test]
fn test_allocate_then_free_never_calls_back() {
    let mut pair = Pair::connect(all_pools);
    let conn = pair.client_conn;
    let local = region(&pair.client, 64);
    let remote_mr = region(&pair.server, 64);
    let remote = remote_mr.remote(0, 8).unwrap();
    let event = SyncEvent::create(&pair.server_dev, 0).unwrap().remote();
    let mut src = local.buf(0, 8).unwrap();
    src.fill(&7u64.to_ne_bytes()).unwrap();
    let word = local.buf(8, 8).unwrap();
    let ctx = &mut pair.client;

    let tasks = vec![
        ctx.allocate(Receive::new(None), UserData(1)).unwrap().as_task(),
        ctx.allocate(SendOp::new(conn, src.clone()), UserData(2)).unwrap().as_task(),
        ctx.allocate(SendImm::new(conn, src.clone(), ImmData::new(1)), UserData(3)).unwrap().as_task(),
        ctx.allocate(Read::new(conn, remote, word.clone()), UserData(4)).unwrap().as_task(),
        ctx.allocate(Write::new(conn, src.clone(), remote), UserData(5)).unwrap().as_task(),
        ctx.allocate(WriteImm::new(conn, src.clone(), remote, ImmData::new(2)), UserData(6))
            .unwrap()
            .as_task(),
        ctx.allocate(AtomicCmpSwp::new(conn, remote, word.clone(), 0, 1), UserData(7))
            .unwrap()
            .as_task(),
        ctx.allocate(AtomicFetchAdd::new(conn, remote, word.clone(), 1), UserData(8))
            .unwrap()
            .as_task(),
        ctx.allocate(SyncEventGet::new(conn, event, word.clone()), UserData(9)).unwrap().as_task(),
        ctx.allocate(SyncEventNotifySet::new(conn, event, src.clone()), UserData(10))
            .unwrap()
            .as_task(),
        ctx.allocate(SyncEventNotifyAdd::new(conn, event, word.clone(), 1), UserData(11))
            .unwrap()
            .as_task(),
    ];
    assert_eq!(tasks.len(), 11);
    for task in tasks {
        ctx.free(task).unwrap();
    }
    pair.progress(3);
    assert_eq!(pair.client_log.len(), 0);
    assert_eq!(pair.client.metrics().tasks_submitted, 0);
}

#[test]
fn test_pool_capacity_bounds_in_flight() {
    let mut pair = Pair::connect(|ctx, rec| {
        recording_pool::<Receive>(ctx, rec, 8);
        recording_pool::<SendOp>(ctx, rec, 4);
    });
    let mr = region(&pair.client, 64);
    let conn = pair.client_conn;
    let mut handles = Vec::new();
    for i in 0..4 {
        let mut src = mr.buf(i * 16, 16).unwrap();
        src.fill(b"x").unwrap();
        let task = pair.client.allocate(SendOp::new(conn, src), UserData(i as u64)).unwrap();
        pair.client.submit(task).unwrap();
        handles.push(task);
    }
    let mut src = mr.buf(0, 16).unwrap();
    src.fill(b"x").unwrap();
    let err = pair.client.allocate(SendOp::new(conn, src), UserData(9)).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ResourceExhausted);
    assert_eq!(pair.client.in_flight(), 4);

    pair.client.progress().unwrap();
    assert_eq!(pair.client_log.successes(), 4);
    for task in handles {
        assert_eq!(pair.client.task(task).unwrap().status(), TaskStatus::Completed);
    }
}

#[test]
fn test_send_queue_bounds_submissions() {
    let mut pair = Pair::connect(|ctx, rec| {
        ctx.set_send_queue_size(2).unwrap();
        recording_pool::<Receive>(ctx, rec, 8);
        recording_pool::<SendOp>(ctx, rec, 8);
    });
    let mr = region(&pair.client, 64);
    let conn = pair.client_conn;
    let mut results = Vec::new();
    for i in 0..3u64 {
        let mut src = mr.buf(0, 8).unwrap();
        src.fill(b"y").unwrap();
        let task = pair.client.allocate(SendOp::new(conn, src), UserData(i)).unwrap();
        results.push(pair.client.submit(task).map_err(|e| e.kind()));
    }
    assert_eq!(results, vec![Ok(()), Ok(()), Err(ErrorKind::ResourceExhausted)]);
}

#[test]
fn test_disconnect_fails_bound_tasks_before_disconnection() {
    let mut pair = Pair::connect(|ctx, rec| {
        recording_pool::<Receive>(ctx, rec, 8);
        recording_pool::<SendOp>(ctx, rec, 8);
    });
    let mr = region(&pair.client, 64);
    let conn = pair.client_conn;
    for i in 0..3u64 {
        let mut src = mr.buf(0, 8).unwrap();
        src.fill(b"z").unwrap();
        let task = pair.client.allocate(SendOp::new(conn, src), UserData(i)).unwrap();
        pair.client.submit(task).unwrap();
    }
    pair.client.disconnect(conn).unwrap();
    assert_eq!(pair.client.connection_state(conn).unwrap(), ConnectionState::Disconnecting);
    assert_eq!(pair.client.in_flight(), 0);

    progress_until(&mut [&mut pair.server, &mut pair.client], 5, |ctxs| {
        ctxs[1].connection_state(conn).map_or(true, |s| s == ConnectionState::Disconnected)
    });
    pair.progress(1);

    let log = pair.client_log.all();
    assert_eq!(log.len(), 4);
    for seen in &log[..3] {
        assert!(matches!(
            seen,
            Seen::Failure {
                kind: Some(ErrorKind::ConnectionAborted),
                ..
            }
        ));
    }
    assert_eq!(log[3], Seen::Disconnected(conn));
    assert!(pair.server_log.all().contains(&Seen::Disconnected(pair.server_conn)));
    assert_eq!(pair.client.metrics().tasks_failed, 3);
    assert_eq!(pair.client.metrics().bytes_sent, 0);
}

#[test]
fn test_peer_disconnect_fails_its_tasks_first() {
    let mut pair = Pair::connect(|ctx, rec| {
        recording_pool::<Receive>(ctx, rec, 8);
        recording_pool::<SendOp>(ctx, rec, 8);
    });
    let mr = region(&pair.server, 16);
    let mut src = mr.buf(0, 8).unwrap();
    src.fill(b"late").unwrap();
    let task = pair.server.allocate(SendOp::new(pair.server_conn, src), UserData(1)).unwrap();
    pair.server.submit(task).unwrap();

    pair.client.disconnect(pair.client_conn).unwrap();
    pair.server.progress().unwrap();

    let log = pair.server_log.all();
    assert_eq!(log.len(), 2);
    assert!(matches!(log[0], Seen::Failure { .. }));
    assert_eq!(log[1], Seen::Disconnected(pair.server_conn));
}

#[test]
fn test_message_lands_before_peer_disconnect() {
    let mut pair = Pair::connect(|ctx, rec| {
        recording_pool::<Receive>(ctx, rec, 4);
        recording_pool::<SendOp>(ctx, rec, 4);
    });
    let landing = region(&pair.server, 16);
    let recv = pair
        .server
        .allocate(Receive::new(Some(landing.buf(0, 16).unwrap().into())), UserData(7))
        .unwrap();
    pair.server.submit(recv).unwrap();

    let local = region(&pair.client, 16);
    let mut src = local.buf(0, 16).unwrap();
    src.fill(b"last words").unwrap();
    let send = pair.client.allocate(SendOp::new(pair.client_conn, src), UserData(1)).unwrap();
    pair.client.submit(send).unwrap();
    pair.client.progress().unwrap();
    assert_eq!(pair.client_log.successes(), 1);
    pair.client.disconnect(pair.client_conn).unwrap();

    pair.server.progress().unwrap();
    let log = pair.server_log.all();
    assert_eq!(
        log,
        vec![
            Seen::Success {
                task: recv.as_task(),
                tag: UserData(7)
            },
            Seen::Disconnected(pair.server_conn),
        ]
    );
    assert_eq!(landing.read_at(0, 10).unwrap(), b"last words".to_vec());
    assert_eq!(pair.server.task(recv).unwrap().op().result_len(), 10);
}

#[test]
fn test_message_outlives_connection_until_receive_posted() {
    let mut pair = Pair::connect(|ctx, rec| {
        recording_pool::<Receive>(ctx, rec, 4);
        recording_pool::<SendOp>(ctx, rec, 4);
    });
    let local = region(&pair.client, 16);
    let mut src = local.buf(0, 16).unwrap();
    src.fill(b"orphan").unwrap();
    let send = pair.client.allocate(SendOp::new(pair.client_conn, src), UserData(1)).unwrap();
    pair.client.submit(send).unwrap();
    pair.client.progress().unwrap();
    pair.client.disconnect(pair.client_conn).unwrap();
    pair.progress(3);
    assert_eq!(pair.server_log.all(), vec![Seen::Disconnected(pair.server_conn)]);
    assert!(pair.server.connection_state(pair.server_conn).is_err());

    let landing = region(&pair.server, 16);
    let recv = pair
        .server
        .allocate(Receive::new(Some(landing.buf(0, 16).unwrap().into())), UserData(2))
        .unwrap();
    pair.server.submit(recv).unwrap();
    pair.server.progress().unwrap();
    assert_eq!(pair.server_log.successes(), 1);
    assert_eq!(landing.read_at(0, 6).unwrap(), b"orphan".to_vec());
    assert_eq!(pair.server.task(recv).unwrap().op().result_connection(), Some(pair.server_conn));
}

#[test]
fn test_unconsumed_messages_bounded_by_receive_queue() {
    let mut pair = Pair::connect(|ctx, rec| {
        ctx.set_recv_queue_size(2).unwrap();
        recording_pool::<Receive>(ctx, rec, 4);
        recording_pool::<SendOp>(ctx, rec, 8);
    });
    let local = region(&pair.client, 8);
    let send = |pair: &mut Pair, tag: u64| {
        let mut src = local.buf(0, 8).unwrap();
        src.fill(&tag.to_ne_bytes()).unwrap();
        let task = pair.client.allocate(SendOp::new(pair.client_conn, src), UserData(tag)).unwrap();
        pair.client.submit(task).unwrap();
    };
    for tag in 0..3 {
        send(&mut pair, tag);
    }
    pair.client.progress().unwrap();
    let log = pair.client_log.all();
    assert_eq!(log.len(), 3);
    assert!(matches!(log[0], Seen::Success { tag: UserData(0), .. }));
    assert!(matches!(log[1], Seen::Success { tag: UserData(1), .. }));
    assert!(matches!(
        log[2],
        Seen::Failure {
            tag: UserData(2),
            kind: Some(ErrorKind::DriverFailure),
            ..
        }
    ));

    let landing = region(&pair.server, 8);
    let recv = pair
        .server
        .allocate(Receive::new(Some(landing.buf(0, 8).unwrap().into())), UserData(9))
        .unwrap();
    pair.server.submit(recv).unwrap();
    pair.server.progress().unwrap();
    assert_eq!(landing.read_u64(0), Some(0));

    pair.client_log.clear();
    send(&mut pair, 3);
    send(&mut pair, 4);
    pair.client.progress().unwrap();
    let log = pair.client_log.all();
    assert!(matches!(log[0], Seen::Success { tag: UserData(3), .. }));
    assert!(matches!(log[1], Seen::Failure { tag: UserData(4), .. }));
    assert_eq!(pair.fabric.stats().messages_dropped, 2);
}

#[test]
fn test_write_with_immediate_round_trip() {
    let mut pair = Pair::connect(all_pools);
    let target = region(&pair.server, 32);
    let recv = pair.server.allocate(Receive::new(None), UserData(50)).unwrap();
    pair.server.submit(recv).unwrap();

    let local = region(&pair.client, 32);
    let mut src = local.buf(0, 32).unwrap();
    src.fill(b"immediate payload").unwrap();
    let imm = ImmData::new(0xdead_beef);
    let write = pair
        .client
        .allocate(
            WriteImm::new(pair.client_conn, src, target.remote(0, 32).unwrap(), imm),
            UserData(51),
        )
        .unwrap();
    pair.client.submit(write).unwrap();
    pair.progress(2);

    let done = pair.server.task(recv).unwrap();
    assert_eq!(done.status(), TaskStatus::Completed);
    assert_eq!(done.op().result_opcode(), Some(RecvOpcode::RecvWriteWithImm));
    let got = done.op().result_immediate().unwrap();
    assert_eq!(got, imm);
    assert_eq!(got.to_be_bytes(), [0xde, 0xad, 0xbe, 0xef]);
    assert_eq!(done.op().result_len(), 17);
    assert_eq!(done.op().result_connection(), Some(pair.server_conn));
    assert_eq!(target.read_at(0, 17).unwrap(), b"immediate payload".to_vec());
    assert_eq!(pair.client_log.successes(), 1);
}

#[test]
fn test_send_with_immediate_lands_in_receive() {
    let mut pair = Pair::connect(all_pools);
    let landing = region(&pair.server, 16);
    let recv = pair
        .server
        .allocate(Receive::new(Some(BufList::from(landing.buf(0, 16).unwrap()))), UserData(1))
        .unwrap();
    pair.server.submit(recv).unwrap();

    let local = region(&pair.client, 16);
    let mut src = local.buf(0, 16).unwrap();
    src.fill(b"hey").unwrap();
    let send = pair
        .client
        .allocate(SendImm::new(pair.client_conn, src, ImmData::new(42)), UserData(2))
        .unwrap();
    pair.client.submit(send).unwrap();
    pair.progress(2);

    let done = pair.server.task(recv).unwrap();
    assert_eq!(done.op().result_opcode(), Some(RecvOpcode::RecvSendWithImm));
    assert_eq!(done.op().result_immediate().map(ImmData::value), Some(42));
    assert_eq!(done.op().result_len(), 3);
    assert_eq!(landing.read_at(0, 3).unwrap(), b"hey".to_vec());
}

#[test]
fn test_messages_wait_for_posted_receive() {
    let mut pair = Pair::connect(all_pools);
    let local = region(&pair.client, 16);
    let mut src = local.buf(0, 16).unwrap();
    src.fill(b"early").unwrap();
    let send = pair.client.allocate(SendOp::new(pair.client_conn, src), UserData(1)).unwrap();
    pair.client.submit(send).unwrap();
    pair.progress(2);
    assert_eq!(pair.server_log.len(), 0);

    let landing = region(&pair.server, 16);
    let recv = pair
        .server
        .allocate(Receive::new(Some(landing.buf(0, 16).unwrap().into())), UserData(2))
        .unwrap();
    pair.server.submit(recv).unwrap();
    pair.server.progress().unwrap();
    assert_eq!(pair.server_log.successes(), 1);
    assert_eq!(landing.read_at(0, 5).unwrap(), b"early".to_vec());
}

#[test]
fn test_receive_too_small_fails() {
    let mut pair = Pair::connect(all_pools);
    let landing = region(&pair.server, 4);
    let recv = pair
        .server
        .allocate(Receive::new(Some(landing.buf(0, 4).unwrap().into())), UserData(2))
        .unwrap();
    pair.server.submit(recv).unwrap();

    let local = region(&pair.client, 16);
    let mut src = local.buf(0, 16).unwrap();
    src.fill(b"too long").unwrap();
    let send = pair.client.allocate(SendOp::new(pair.client_conn, src), UserData(1)).unwrap();
    pair.client.submit(send).unwrap();
    pair.progress(2);

    assert_eq!(pair.server_log.failures(), 1);
    assert_eq!(
        pair.server.task(recv).unwrap().error().map(|e| e.kind()),
        Some(ErrorKind::DriverFailure)
    );
}

#[test]
fn test_atomic_compare_and_swap() {
    const X: u64 = 0x1111;
    const Y: u64 = 0x2222;
    const Z: u64 = 0x3333;

    let mut pair = Pair::connect(all_pools);
    let cell = region(&pair.server, 8);
    cell.write_u64(0, X);
    let results = region(&pair.client, 16);

    let hit = pair
        .client
        .allocate(
            AtomicCmpSwp::new(pair.client_conn, cell.remote(0, 8).unwrap(), results.buf(0, 8).unwrap(), X, Y),
            UserData(1),
        )
        .unwrap();
    pair.client.submit(hit).unwrap();
    pair.client.progress().unwrap();
    let done = pair.client.task(hit).unwrap();
    assert_eq!(done.op().fetched(), Some(X));
    assert_eq!(done.op().result_buf().data_u64(), Some(X));
    assert_eq!(cell.read_u64(0), Some(Y));

    cell.write_u64(0, X);
    let miss = pair
        .client
        .allocate(
            AtomicCmpSwp::new(pair.client_conn, cell.remote(0, 8).unwrap(), results.buf(8, 8).unwrap(), Z, Y),
            UserData(2),
        )
        .unwrap();
    pair.client.submit(miss).unwrap();
    pair.client.progress().unwrap();
    let done = pair.client.task(miss).unwrap();
    assert_eq!(done.op().result_buf().data_u64(), Some(X));
    assert_eq!(cell.read_u64(0), Some(X));
    assert_eq!(pair.client_log.successes(), 2);
}

#[test]
fn test_fetch_add_and_resubmit() {
    let mut pair = Pair::connect(all_pools);
    let cell = region(&pair.server, 8);
    cell.write_u64(0, 10);
    let results = region(&pair.client, 8);

    let task = pair
        .client
        .allocate(
            AtomicFetchAdd::new(pair.client_conn, cell.remote(0, 8).unwrap(), results.buf(0, 8).unwrap(), 5),
            UserData(1),
        )
        .unwrap();
    pair.client.submit(task).unwrap();
    pair.client.progress().unwrap();
    assert_eq!(pair.client.task(task).unwrap().op().fetched(), Some(10));

    let op = pair.client.task_mut(task).unwrap().op_mut();
    op.set_add(1);
    op.set_result_buf(results.buf(0, 8).unwrap());
    pair.client.submit(task).unwrap();
    pair.client.progress().unwrap();
    assert_eq!(pair.client.task(task).unwrap().op().fetched(), Some(15));
    assert_eq!(cell.read_u64(0), Some(16));
    assert_eq!(pair.client.metrics().tasks_submitted, 2);
}

#[test]
fn test_read_and_write_remote_memory() {
    let mut pair = Pair::connect(all_pools);
    let remote_mr = region(&pair.server, 32);
    remote_mr.write_at(0, b"server bytes");
    let local = region(&pair.client, 32);

    let read = pair
        .client
        .allocate(
            Read::new(pair.client_conn, remote_mr.remote(0, 12).unwrap(), local.buf(0, 16).unwrap()),
            UserData(1),
        )
        .unwrap();
    pair.client.submit(read).unwrap();

    let mut src = local.buf(16, 16).unwrap();
    src.fill(b"client").unwrap();
    let write = pair
        .client
        .allocate(Write::new(pair.client_conn, src, remote_mr.remote(16, 16).unwrap()), UserData(2))
        .unwrap();
    pair.client.submit(write).unwrap();
    pair.client.progress().unwrap();

    assert_eq!(pair.client.task(read).unwrap().op().result_len(), 12);
    assert_eq!(local.read_at(0, 12).unwrap(), b"server bytes".to_vec());
    assert_eq!(remote_mr.read_at(16, 6).unwrap(), b"client".to_vec());
    assert_eq!(pair.client.metrics().bytes_sent, 18);
}

#[test]
fn test_sync_event_operations() {
    let mut pair = Pair::connect(all_pools);
    let event = SyncEvent::create(&pair.server_dev, 3).unwrap();
    let local = region(&pair.client, 32);

    let add = pair
        .client
        .allocate(
            SyncEventNotifyAdd::new(pair.client_conn, event.remote(), local.buf(0, 8).unwrap(), 4),
            UserData(1),
        )
        .unwrap();
    pair.client.submit(add).unwrap();
    pair.client.progress().unwrap();
    assert_eq!(pair.client.task(add).unwrap().op().fetched(), Some(3));
    assert_eq!(event.value(), 7);

    let mut value = local.buf(8, 8).unwrap();
    value.fill(&100u64.to_ne_bytes()).unwrap();
    let set = pair
        .client
        .allocate(SyncEventNotifySet::new(pair.client_conn, event.remote(), value), UserData(2))
        .unwrap();
    pair.client.submit(set).unwrap();
    pair.client.progress().unwrap();
    assert_eq!(event.value(), 100);

    let get = pair
        .client
        .allocate(SyncEventGet::new(pair.client_conn, event.remote(), local.buf(16, 8).unwrap()), UserData(3))
        .unwrap();
    pair.client.submit(get).unwrap();
    pair.client.progress().unwrap();
    let done = pair.client.task(get).unwrap();
    assert_eq!(done.op().result_len(), 8);
    assert_eq!(done.op().dst().data_u64(), Some(100));
}

#[test]
fn test_remote_permissions_enforced() {
    let mut pair = Pair::connect(all_pools);
    let read_only = MemoryRegion::register(&pair.server_dev, vec![0u8; 16], AccessFlags::REMOTE_READ).unwrap();
    let local = region(&pair.client, 16);
    let mut src = local.buf(0, 8).unwrap();
    src.fill(b"nope").unwrap();
    let write = pair
        .client
        .allocate(Write::new(pair.client_conn, src, read_only.remote(0, 8).unwrap()), UserData(1))
        .unwrap();
    pair.client.submit(write).unwrap();
    pair.client.progress().unwrap();
    assert_eq!(
        pair.client.task(write).unwrap().error().map(|e| e.kind()),
        Some(ErrorKind::DriverFailure)
    );
    assert_eq!(read_only.read_at(0, 4).unwrap(), vec![0u8; 4]);
}

#[test]
fn test_injected_fabric_failure() {
    let mut pair = Pair::connect(all_pools);
    let local = region(&pair.client, 16);
    let mut src = local.buf(0, 8).unwrap();
    src.fill(b"flaky").unwrap();
    let send = pair.client.allocate(SendOp::new(pair.client_conn, src), UserData(1)).unwrap();

    pair.fabric.inject_failures(1);
    pair.client.submit(send).unwrap();
    pair.client.progress().unwrap();
    assert_eq!(pair.client_log.failures(), 1);

    pair.client.submit(send).unwrap();
    pair.client.progress().unwrap();
    assert_eq!(pair.client_log.successes(), 1);
    assert_eq!(pair.fabric.stats().injected_failures, 1);
}

#[test]
fn test_connect_without_listener_times_out_once() {
    let fabric = Fabric::new();
    let _server_dev = device(&fabric, common::SERVER_IP);
    let client_dev = device(&fabric, common::CLIENT_IP);
    let log = Recorder::default();
    let mut client = Context::new(&client_dev).unwrap();
    recording_pool::<Receive>(&mut client, &log, 2);
    client.set_connection_request_timeout(30).unwrap();
    client
        .set_connection_state_callbacks(recording_connection_callbacks(&log))
        .unwrap();
    client.start().unwrap();

    let address = RdmaAddress::create(AddrType::Ipv4, common::SERVER_IP, common::PORT).unwrap();
    let conn = client.connect_to_addr(&address, UserData(1)).unwrap();
    client.progress().unwrap();
    assert_eq!(client.connection_state(conn).unwrap(), ConnectionState::ResolvingAddress);

    std::thread::sleep(common::short_timeout() * 2);
    client.progress().unwrap();
    assert_eq!(client.connection_state(conn).unwrap(), ConnectionState::Failed);
    for _ in 0..3 {
        client.progress().unwrap();
    }
    assert_eq!(log.all(), vec![Seen::Failed(conn, ErrorKind::ConnectionAborted)]);
    assert_eq!(client.metrics().connections_established, 0);
}

#[test]
fn test_server_accept_flow() {
    let fabric = Fabric::new();
    let server_dev = device(&fabric, common::SERVER_IP);
    let client_dev = device(&fabric, common::CLIENT_IP);

    let requests = Arc::new(Mutex::new(Vec::new()));
    let mut server = Context::new(&server_dev).unwrap();
    server.set_user_data(UserData(0xabc));
    recording_pool::<Receive>(&mut server, &Recorder::default(), 2);
    let seen = requests.clone();
    server
        .set_connection_state_callbacks(ConnectionCallbacks::new().on_request(move |ctx, conn, ctx_tag| {
            let state = ctx.connection_state(conn).unwrap();
            seen.lock().unwrap().push((conn, state, ctx_tag));
            ctx.accept(conn, &[]).unwrap();
            assert_eq!(ctx.reject(conn).unwrap_err().kind(), ErrorKind::BadState);
        }))
        .unwrap();
    server.start().unwrap();
    server.progress().unwrap();
    assert_eq!(server.state(), ContextState::Running);
    server.start_listen(common::PORT).unwrap();

    let log = Recorder::default();
    let mut client = Context::new(&client_dev).unwrap();
    recording_pool::<Receive>(&mut client, &log, 2);
    client
        .set_connection_state_callbacks(recording_connection_callbacks(&log))
        .unwrap();
    client.start().unwrap();
    let address = RdmaAddress::create(AddrType::Ipv4, common::SERVER_IP, common::PORT).unwrap();
    let conn = client.connect_to_addr(&address, UserData(5)).unwrap();

    client.progress().unwrap();
    assert_eq!(client.connection_state(conn).unwrap(), ConnectionState::Connecting);
    server.progress().unwrap();
    let (server_conn, state, ctx_tag) = requests.lock().unwrap()[0];
    assert_eq!(state, ConnectionState::AwaitingAccept);
    assert_eq!(ctx_tag, UserData(0xabc));
    assert_eq!(server.connection_state(server_conn).unwrap(), ConnectionState::Connected);
    assert_eq!(server.connection_address(server_conn).unwrap().unwrap().address(), common::CLIENT_IP);

    assert!(log.all().is_empty());
    client.progress().unwrap();
    assert_eq!(log.all(), vec![Seen::Established(conn)]);
    assert_eq!(client.connection_state(conn).unwrap(), ConnectionState::Connected);

    server.stop_listen(common::PORT).unwrap();
    assert_eq!(server.connection_state(server_conn).unwrap(), ConnectionState::Connected);
}

#[test]
fn test_rejected_request_fails_client() {
    let fabric = Fabric::new();
    let server_dev = device(&fabric, common::SERVER_IP);
    let client_dev = device(&fabric, common::CLIENT_IP);

    let mut server = Context::new(&server_dev).unwrap();
    recording_pool::<Receive>(&mut server, &Recorder::default(), 2);
    server
        .set_connection_state_callbacks(ConnectionCallbacks::new().on_request(|ctx, conn, _| {
            ctx.reject(conn).unwrap();
            assert_eq!(ctx.accept(conn, &[]).unwrap_err().kind(), ErrorKind::InvalidArgument);
        }))
        .unwrap();
    server.start().unwrap();
    server.start_listen(common::PORT).unwrap();

    let log = Recorder::default();
    let mut client = Context::new(&client_dev).unwrap();
    recording_pool::<Receive>(&mut client, &log, 2);
    client
        .set_connection_state_callbacks(recording_connection_callbacks(&log))
        .unwrap();
    client.start().unwrap();
    let address = RdmaAddress::create(AddrType::Ipv4, common::SERVER_IP, common::PORT).unwrap();
    let conn = client.connect_to_addr(&address, UserData(5)).unwrap();

    progress_rounds(&mut [&mut client, &mut server], 3);
    assert_eq!(log.all(), vec![Seen::Failed(conn, ErrorKind::ConnectionAborted)]);
    assert!(server.connections().is_empty());
}

#[test]
fn test_connection_table_limit_rejects_extra_clients() {
    let fabric = Fabric::new();
    let server_dev = device(&fabric, common::SERVER_IP);
    let client_dev = device(&fabric, common::CLIENT_IP);

    let mut server = Context::new(&server_dev).unwrap();
    server.set_max_num_connections(1).unwrap();
    recording_pool::<Receive>(&mut server, &Recorder::default(), 2);
    server
        .set_connection_state_callbacks(ConnectionCallbacks::new().on_request(|ctx, conn, _| {
            ctx.accept(conn, &[]).unwrap();
        }))
        .unwrap();
    server.start().unwrap();
    server.start_listen(common::PORT).unwrap();

    let log = Recorder::default();
    let mut client = Context::new(&client_dev).unwrap();
    recording_pool::<Receive>(&mut client, &log, 2);
    client
        .set_connection_state_callbacks(recording_connection_callbacks(&log))
        .unwrap();
    client.start().unwrap();
    let address = RdmaAddress::create(AddrType::Ipv4, common::SERVER_IP, common::PORT).unwrap();
    let first = client.connect_to_addr(&address, UserData(1)).unwrap();
    let second = client.connect_to_addr(&address, UserData(2)).unwrap();

    progress_rounds(&mut [&mut client, &mut server], 3);
    let seen = log.all();
    assert!(seen.contains(&Seen::Established(first)));
    assert!(seen.contains(&Seen::Failed(second, ErrorKind::ConnectionAborted)));
}

#[test]
fn test_bridged_connection() {
    let fabric = Fabric::new();
    let server_dev = device(&fabric, common::SERVER_IP);
    let client_dev = device(&fabric, common::CLIENT_IP);
    let listener = CmListener::bind(&server_dev, common::PORT).unwrap();

    let server_log = Recorder::default();
    let mut server = Context::new(&server_dev).unwrap();
    recording_pool::<Receive>(&mut server, &server_log, 2);
    server
        .set_connection_state_callbacks(recording_connection_callbacks(&server_log))
        .unwrap();
    server.start().unwrap();

    let client_log = Recorder::default();
    let mut client = Context::new(&client_dev).unwrap();
    recording_pool::<Receive>(&mut client, &client_log, 2);
    client
        .set_connection_state_callbacks(recording_connection_callbacks(&client_log))
        .unwrap();
    client.start().unwrap();
    let address = RdmaAddress::create(AddrType::Ipv4, common::SERVER_IP, common::PORT).unwrap();
    let conn = client.connect_to_addr(&address, UserData(1)).unwrap();
    client.progress().unwrap();

    let request = listener.get_request().expect("request queued");
    assert_eq!(request.source().address(), common::CLIENT_IP);
    let bridged = server.bridge_prepare_connection(request).unwrap();
    assert_eq!(server.connection_state(bridged).unwrap(), ConnectionState::AwaitingAccept);
    assert!(listener.get_request().is_none());

    server.bridge_accept(bridged, b"bridged").unwrap();
    assert_eq!(server.connection_state(bridged).unwrap(), ConnectionState::Connecting);
    client.progress().unwrap();
    assert_eq!(client_log.all(), vec![Seen::Established(conn)]);
    assert_eq!(client.connection_private_data(conn).unwrap(), b"bridged");

    server.bridge_established(bridged).unwrap();
    server.progress().unwrap();
    assert_eq!(server.connection_state(bridged).unwrap(), ConnectionState::Connected);
    assert!(server_log.all().contains(&Seen::Established(bridged)));
    assert_eq!(
        server.bridge_established(bridged).unwrap_err().kind(),
        ErrorKind::BadState
    );
}

#[test]
fn test_dropped_cm_request_rejects_client() {
    let fabric = Fabric::new();
    let server_dev = device(&fabric, common::SERVER_IP);
    let client_dev = device(&fabric, common::CLIENT_IP);
    let listener = CmListener::bind(&server_dev, common::PORT).unwrap();

    let log = Recorder::default();
    let mut client = Context::new(&client_dev).unwrap();
    recording_pool::<Receive>(&mut client, &log, 2);
    client
        .set_connection_state_callbacks(recording_connection_callbacks(&log))
        .unwrap();
    client.start().unwrap();
    let address = RdmaAddress::create(AddrType::Ipv4, common::SERVER_IP, common::PORT).unwrap();
    let conn = client.connect_to_addr(&address, UserData(1)).unwrap();
    client.progress().unwrap();

    listener.get_request().unwrap().reject();
    client.progress().unwrap();
    assert_eq!(log.all(), vec![Seen::Failed(conn, ErrorKind::ConnectionAborted)]);
}

#[test]
fn test_bridge_prepare_across_fabrics_rejected() {
    let fabric = Fabric::new();
    let other = Fabric::new();
    let server_dev = device(&fabric, common::SERVER_IP);
    let foreign_dev = device(&other, common::SERVER_IP);
    let foreign_client = device(&other, common::CLIENT_IP);
    let listener = CmListener::bind(&foreign_dev, common::PORT).unwrap();

    let mut client = Context::new(&foreign_client).unwrap();
    recording_pool::<Receive>(&mut client, &Recorder::default(), 2);
    client.start().unwrap();
    let address = RdmaAddress::create(AddrType::Ipv4, common::SERVER_IP, common::PORT).unwrap();
    client.connect_to_addr(&address, UserData(1)).unwrap();
    client.progress().unwrap();

    let mut server = Context::new(&server_dev).unwrap();
    recording_pool::<Receive>(&mut server, &Recorder::default(), 2);
    server.start().unwrap();
    let err = server
        .bridge_prepare_connection(listener.get_request().unwrap())
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidArgument);
}

fn exported_pair() -> (Fabric, Context, Context, Recorder, Recorder) {
    let fabric = Fabric::new();
    let a_log = Recorder::default();
    let b_log = Recorder::default();
    let mut a = Context::new(&device(&fabric, "10.30.0.1")).unwrap();
    let mut b = Context::new(&device(&fabric, "10.30.0.2")).unwrap();
    for (ctx, log) in [(&mut a, &a_log), (&mut b, &b_log)] {
        ctx.set_permissions(AccessFlags::ALL).unwrap();
        recording_pool::<Receive>(ctx, log, 4);
        recording_pool::<SendOp>(ctx, log, 4);
        ctx.set_connection_state_callbacks(recording_connection_callbacks(log))
            .unwrap();
        ctx.start().unwrap();
    }
    (fabric, a, b, a_log, b_log)
}

#[test]
fn test_export_connect_handshake() {
    let (_fabric, mut a, mut b, a_log, b_log) = exported_pair();
    let (a_details, a_conn) = a.export().unwrap();
    let (b_details, b_conn) = b.export().unwrap();
    let shipped = ConnectionDetails::from(b_details.as_bytes().to_vec());

    a.connect(&shipped, a_conn).unwrap();
    assert_eq!(a.connection_state(a_conn).unwrap(), ConnectionState::Connecting);
    b.progress().unwrap();
    b.connect(&a_details, b_conn).unwrap();
    assert_eq!(b.connection_state(b_conn).unwrap(), ConnectionState::Connected);
    progress_rounds(&mut [&mut a, &mut b], 2);

    assert_eq!(a.connection_state(a_conn).unwrap(), ConnectionState::Connected);
    assert!(a_log.all().contains(&Seen::Established(a_conn)));
    assert!(b_log.all().contains(&Seen::Established(b_conn)));

    let landing = MemoryRegion::register(b.device(), vec![0u8; 8], AccessFlags::ALL).unwrap();
    let recv = b
        .allocate(Receive::new(Some(landing.buf(0, 8).unwrap().into())), UserData(1))
        .unwrap();
    b.submit(recv).unwrap();
    let source = MemoryRegion::register(a.device(), vec![0u8; 8], AccessFlags::ALL).unwrap();
    let mut src = source.buf(0, 8).unwrap();
    src.fill(b"dc").unwrap();
    let send = a.allocate(SendOp::new(a_conn, src), UserData(2)).unwrap();
    a.submit(send).unwrap();
    progress_rounds(&mut [&mut a, &mut b], 1);
    assert_eq!(landing.read_at(0, 2).unwrap(), b"dc".to_vec());
}

#[test]
fn test_details_invalid_after_restart() {
    let (_fabric, mut a, mut b, _, _) = exported_pair();
    let (a_details, a_conn) = a.export().unwrap();
    let (_, b_conn) = b.export().unwrap();
    assert_eq!(a.connection_state(a_conn).unwrap(), ConnectionState::Idle);

    a.stop().unwrap();
    a.progress().unwrap();
    a.start().unwrap();

    let err = b.connect(&a_details, b_conn).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ConnectionAborted);
    assert_eq!(b.connection_state(b_conn).unwrap(), ConnectionState::Idle);

    let mut bytes = a_details.as_bytes().to_vec();
    let last = bytes.len() - 1;
    bytes[last] ^= 0xff;
    let err = b.connect(&ConnectionDetails::from(bytes), b_conn).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ConnectionAborted);
}

#[test]
fn test_stop_requires_disconnect() {
    let mut pair = Pair::connect(|ctx, rec| recording_pool::<Receive>(ctx, rec, 2));
    assert_eq!(pair.client.stop().unwrap_err().kind(), ErrorKind::BadState);
    pair.client.disconnect(pair.client_conn).unwrap();
    pair.progress(2);
    pair.client.stop().unwrap();
    pair.client.progress().unwrap();
    assert_eq!(pair.client.state(), ContextState::Idle);

    let events: Vec<Event> = pair.server.poll_events().unwrap().collect();
    assert!(events.is_empty());
    pair.server.stop().unwrap();
}

#[test]
fn test_device_removal_is_engine_failure() {
    let mut pair = Pair::connect(|ctx, rec| recording_pool::<Receive>(ctx, rec, 2));
    pair.server_dev.remove();
    assert_eq!(pair.server.progress().unwrap_err().kind(), ErrorKind::DriverFailure);
    assert_eq!(pair.server.state(), ContextState::Failed);
    let Pair { server, .. } = pair;
    assert!(server.destroy().is_ok());
}
