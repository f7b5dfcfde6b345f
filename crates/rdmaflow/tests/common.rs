//! Shared fixtures for the integration tests.

#![allow(dead_code)]

use std::sync::{Arc, Mutex};
use std::time::Duration;

use rdmaflow::{
    AccessFlags, AddrType, ConnectionCallbacks, ConnectionId, ConnectionState, Context, Device, DeviceSpec,
    ErrorKind, Fabric, Operation, RdmaAddress, TaskRef, UserData,
};

pub const PORT: u16 = 4791;
pub const SERVER_IP: &str = "10.20.0.1";
pub const CLIENT_IP: &str = "10.20.0.2";

/// One observed callback.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Seen {
    Success { task: TaskRef, tag: UserData },
    Failure { task: TaskRef, tag: UserData, kind: Option<ErrorKind> },
    Established(ConnectionId),
    Failed(ConnectionId, ErrorKind),
    Disconnected(ConnectionId),
}

/// Callback log shared between a test and the contexts it drives.
#[derive(Debug, Clone, Default)]
pub struct Recorder(Arc<Mutex<Vec<Seen>>>);

impl Recorder {
    pub fn push(&self, seen: Seen) {
        self.0.lock().unwrap().push(seen);
    }

    pub fn all(&self) -> Vec<Seen> {
        self.0.lock().unwrap().clone()
    }

    pub fn len(&self) -> usize {
        self.0.lock().unwrap().len()
    }

    pub fn successes(&self) -> usize {
        self.all().iter().filter(|s| matches!(s, Seen::Success { .. })).count()
    }

    pub fn failures(&self) -> usize {
        self.all().iter().filter(|s| matches!(s, Seen::Failure { .. })).count()
    }

    pub fn clear(&self) {
        self.0.lock().unwrap().clear();
    }
}

pub fn device(fabric: &Fabric, ip: &str) -> Device {
    Device::open(fabric, DeviceSpec::new(ip).with_ipv4(ip.parse().unwrap())).unwrap()
}

/// Configures a pool whose callbacks only record; the task stays with the caller.
pub fn recording_pool<P: Operation>(ctx: &mut Context, rec: &Recorder, capacity: u32) {
    let ok = rec.clone();
    let err = rec.clone();
    ctx.set_task_conf::<P>(
        move |_, task, tag, _| ok.push(Seen::Success { task: task.as_task(), tag }),
        move |ctx, task, tag, _| {
            let kind = ctx.task(task).ok().and_then(|t| t.error().map(|e| e.kind()));
            err.push(Seen::Failure {
                task: task.as_task(),
                tag,
                kind,
            });
        },
        capacity,
    )
    .unwrap();
}

pub fn recording_connection_callbacks(rec: &Recorder) -> ConnectionCallbacks {
    let established = rec.clone();
    let failed = rec.clone();
    let disconnected = rec.clone();
    ConnectionCallbacks::new()
        .on_established(move |_, conn, _, _| established.push(Seen::Established(conn)))
        .on_failure(move |_, conn, error, _, _| failed.push(Seen::Failed(conn, error.kind())))
        .on_disconnection(move |_, conn, _, _| disconnected.push(Seen::Disconnected(conn)))
}

/// Progresses every context until `done` holds; panics after `max_rounds`.
pub fn progress_until(ctxs: &mut [&mut Context], max_rounds: usize, mut done: impl FnMut(&[&mut Context]) -> bool) {
    for _ in 0..max_rounds {
        if done(ctxs) {
            return;
        }
        for ctx in ctxs.iter_mut() {
            ctx.progress().unwrap();
        }
    }
    assert!(done(ctxs), "condition not reached after {} rounds", max_rounds);
}

pub fn progress_rounds(ctxs: &mut [&mut Context], rounds: usize) {
    for _ in 0..rounds {
        for ctx in ctxs.iter_mut() {
            ctx.progress().unwrap();
        }
    }
}

/// A started server and client joined by one connection.
pub struct Pair {
    pub fabric: Fabric,
    pub server_dev: Device,
    pub client_dev: Device,
    pub server: Context,
    pub client: Context,
    pub server_conn: ConnectionId,
    pub client_conn: ConnectionId,
    pub server_log: Recorder,
    pub client_log: Recorder,
}

impl Pair {
    /// `setup` configures task pools on each context before it starts. The server
    /// grants every remote permission.
    pub fn connect(mut setup: impl FnMut(&mut Context, &Recorder)) -> Pair {
        let fabric = Fabric::new();
        let server_dev = device(&fabric, SERVER_IP);
        let client_dev = device(&fabric, CLIENT_IP);
        let server_log = Recorder::default();
        let client_log = Recorder::default();

        let accepted = Arc::new(Mutex::new(None));
        let mut server = Context::new(&server_dev).unwrap();
        server.set_permissions(AccessFlags::ALL).unwrap();
        setup(&mut server, &server_log);
        let slot = accepted.clone();
        let failed = server_log.clone();
        let disconnected = server_log.clone();
        server
            .set_connection_state_callbacks(
                ConnectionCallbacks::new()
                    .on_request(move |ctx, conn, _| {
                        ctx.accept(conn, b"welcome").unwrap();
                        *slot.lock().unwrap() = Some(conn);
                    })
                    .on_failure(move |_, conn, error, _, _| failed.push(Seen::Failed(conn, error.kind())))
                    .on_disconnection(move |_, conn, _, _| disconnected.push(Seen::Disconnected(conn))),
            )
            .unwrap();
        server.start().unwrap();
        server.start_listen(PORT).unwrap();

        let mut client = Context::new(&client_dev).unwrap();
        client.set_permissions(AccessFlags::ALL).unwrap();
        setup(&mut client, &client_log);
        client
            .set_connection_state_callbacks(recording_connection_callbacks(&client_log))
            .unwrap();
        client.start().unwrap();

        let address = RdmaAddress::create(AddrType::Ipv4, SERVER_IP, PORT).unwrap();
        let client_conn = client.connect_to_addr(&address, UserData(100)).unwrap();
        progress_until(&mut [&mut server, &mut client], 10, |ctxs| {
            ctxs[1].connection_state(client_conn).ok() == Some(ConnectionState::Connected)
        });
        let server_conn = accepted.lock().unwrap().expect("server accepted");
        client_log.clear();

        Pair {
            fabric,
            server_dev,
            client_dev,
            server,
            client,
            server_conn,
            client_conn,
            server_log,
            client_log,
        }
    }

    pub fn progress(&mut self, rounds: usize) {
        progress_rounds(&mut [&mut self.server, &mut self.client], rounds);
    }
}

pub fn short_timeout() -> Duration {
    Duration::from_millis(30)
}
