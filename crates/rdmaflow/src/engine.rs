//! The progress engine.
//!
//! Nothing happens in the background: every handshake step, task execution and
//! completion is driven by [`Context::poll_events`]. [`Context::progress`] polls and
//! then invokes the registered callbacks for each event, in order.

use std::time::Instant;

use tracing::{debug, error, trace, warn};

use crate::connection::{ConnectionId, ConnectionOrigin, ConnectionState};
use crate::context::{Context, ContextState};
use crate::error::{RdmaError, Result};
use crate::exec::{for_opcode, ExecEnv, Sealed};
use crate::fabric::{InboundMessage, ListenTarget, PendingRequest, WireEvent};
use crate::ops::Receive;
use crate::task::{Operation, TaskRef, TaskStatus, UserData};

/// Something the engine did during one poll.
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    /// The context moved between lifecycle states.
    StateChanged {
        /// State before the change.
        from: ContextState,
        /// State after the change.
        to: ContextState,
    },
    /// The task is owned by the caller again.
    TaskCompleted {
        /// The completed task.
        task: TaskRef,
        /// Tag the task carried.
        tag: UserData,
        /// Outcome; the error is also kept on the task.
        result: std::result::Result<(), RdmaError>,
    },
    /// A client knocked on a listening port; accept or reject it.
    ConnectionRequest {
        /// The connection concerned.
        conn: ConnectionId,
    },
    /// A handshake completed.
    ConnectionEstablished {
        /// The connection concerned.
        conn: ConnectionId,
    },
    /// A handshake failed; the error says why.
    ConnectionFailed {
        /// The failed connection.
        conn: ConnectionId,
        /// Why it failed.
        error: RdmaError,
    },
    /// A connected connection went down.
    ConnectionDisconnected {
        /// The connection concerned.
        conn: ConnectionId,
    },
}

impl Event {
    /// Connection the event concerns, if any.
    pub fn connection(&self) -> Option<ConnectionId> {
        match self {
            Event::ConnectionRequest { conn }
            | Event::ConnectionEstablished { conn }
            | Event::ConnectionFailed { conn, .. }
            | Event::ConnectionDisconnected { conn } => Some(*conn),
            Event::StateChanged { .. } | Event::TaskCompleted { .. } => None,
        }
    }
}

/// Events produced by one poll, in the order they happened.
#[derive(Debug)]
pub struct Events(std::collections::vec_deque::IntoIter<Event>);

impl Iterator for Events {
    type Item = Event;

    fn next(&mut self) -> Option<Event> {
        self.0.next()
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.0.size_hint()
    }
}

impl ExactSizeIterator for Events {}

impl Context {
    /// Runs one round of progress and returns what happened, without invoking callbacks.
    ///
    /// Connections reported failed or disconnected stay queryable until the next poll.
    pub fn poll_events(&mut self) -> Result<Events> {
        if self.dispatching {
            return Err(RdmaError::BadState {
                operation: "poll",
                state: "inside a callback".to_string(),
            });
        }
        match self.state {
            ContextState::Failed => return Err(RdmaError::bad_state("poll", self.state)),
            ContextState::Idle => {
                self.connections.reap();
                return Ok(self.take_events());
            }
            _ => {}
        }
        self.metrics.inc_polls();

        if self.device.is_removed() {
            self.fail_context();
            return Err(RdmaError::driver(format!("device {} removed", self.device.info().name())));
        }

        let reaped = self.connections.reap();
        if reaped > 0 {
            trace!(reaped, "released connections");
        }

        match self.state {
            ContextState::Starting => self.set_state(ContextState::Running),
            ContextState::Stopping => {
                self.flush_receives();
                self.set_state(ContextState::Idle);
                return Ok(self.take_events());
            }
            _ => {}
        }

        self.process_inbox();
        self.match_receives();
        self.advance_handshakes();
        self.execute_send_queue();
        Ok(self.take_events())
    }

    /// Polls once and dispatches every event to its callback. Returns the number of
    /// events handled.
    ///
    /// Callbacks may submit, free and allocate tasks and drive connections, but must
    /// not call `progress` themselves.
    pub fn progress(&mut self) -> Result<usize> {
        let events = self.poll_events()?;
        let count = events.len();
        self.dispatching = true;
        for event in events {
            self.dispatch(event);
        }
        self.dispatching = false;
        Ok(count)
    }

    fn take_events(&mut self) -> Events {
        for event in &self.pending {
            if let Event::ConnectionFailed { conn, .. } | Event::ConnectionDisconnected { conn } = event {
                if let Some(entry) = self.connections.get_mut(*conn) {
                    entry.reap = true;
                }
            }
        }
        Events(std::mem::take(&mut self.pending).into_iter())
    }

    fn fail_context(&mut self) {
        error!(device = %self.device.info().name(), "device lost, context failed");
        self.device.fabric().lock().quiesce_endpoint(self.endpoint);
        self.pending.clear();
        self.state = ContextState::Failed;
    }

    fn flush_receives(&mut self) {
        let posted: Vec<TaskRef> = self.recv_queue.drain(..).collect();
        debug!(count = posted.len(), "flushing posted receives");
        for task in posted {
            self.complete(task, Err(RdmaError::aborted("context stopped")));
        }
    }

    fn process_inbox(&mut self) {
        let inbox = self.device.fabric().lock().take_inbox(self.endpoint);
        for event in inbox {
            self.handle_wire(event);
        }
    }

    fn reply(&self, to: crate::fabric::EndpointId, event: WireEvent) {
        self.device.fabric().lock().deliver(to, event);
    }

    fn handle_wire(&mut self, event: WireEvent) {
        match event {
            WireEvent::ConnectRequest { from, source } => {
                match self.connections.insert(ConnectionOrigin::Server, UserData::default()) {
                    Ok(id) => {
                        if let Some(conn) = self.connections.get_mut(id) {
                            conn.peer = Some(from);
                            conn.lease = Some(source.lease());
                            if conn.transition(ConnectionState::AwaitingAccept).is_ok() {
                                debug!(conn = %id, %source, "connection request");
                                self.pending.push_back(Event::ConnectionRequest { conn: id });
                            }
                        }
                    }
                    Err(e) => {
                        warn!(%source, error = %e, "refusing connection request");
                        self.reply(from.endpoint, WireEvent::ConnectRejected { to: from.conn });
                    }
                }
            }
            WireEvent::ConnectAccepted { to, from, private_data } => {
                let expected = self.connections.get(to).map_or(false, |c| {
                    c.origin == ConnectionOrigin::Client && c.state == ConnectionState::Connecting
                });
                if !expected {
                    debug!(conn = %to, "late accept, tearing down");
                    self.reply(
                        from.endpoint,
                        WireEvent::Disconnect {
                            to: from.conn,
                            from: self.local_ref(to),
                        },
                    );
                    return;
                }
                if let Some(conn) = self.connections.get_mut(to) {
                    conn.peer = Some(from);
                    conn.private_data = private_data;
                    conn.deadline = None;
                    if conn.transition(ConnectionState::Connected).is_ok() {
                        self.established(to);
                    }
                }
            }
            WireEvent::ConnectRejected { to } => {
                let handshaking = self.connections.get(to).map_or(false, |c| {
                    matches!(c.state, ConnectionState::ResolvingAddress | ConnectionState::Connecting)
                });
                if handshaking {
                    self.fail_connection(to, RdmaError::aborted("rejected by peer"));
                }
            }
            WireEvent::PeerBound { to, from, session_key } => {
                let Some(conn) = self.connections.get_mut(to) else {
                    return;
                };
                if conn.origin != ConnectionOrigin::Exported || conn.session_key != Some(session_key) {
                    warn!(conn = %to, "peer bind with wrong session key ignored");
                    return;
                }
                match conn.state {
                    ConnectionState::Idle => conn.peer_bound = Some(from),
                    ConnectionState::Connecting if conn.peer == Some(from) => {
                        conn.deadline = None;
                        if conn.transition(ConnectionState::Connected).is_ok() {
                            self.established(to);
                        }
                    }
                    state => debug!(conn = %to, ?state, "peer bind ignored"),
                }
            }
            WireEvent::Disconnect { to, from } => {
                let bound = self.connections.get(to).map_or(false, |c| {
                    c.peer == Some(from)
                        && matches!(
                            c.state,
                            ConnectionState::Connecting
                                | ConnectionState::Connected
                                | ConnectionState::Disconnecting
                        )
                });
                if bound {
                    self.fail_bound_tasks(to);
                    self.finish_disconnect(to);
                }
                self.reply(from.endpoint, WireEvent::DisconnectAck { to: from.conn });
            }
            WireEvent::DisconnectAck { to } => {
                let waiting = self
                    .connections
                    .get(to)
                    .map_or(false, |c| c.state == ConnectionState::Disconnecting);
                if waiting {
                    self.finish_disconnect(to);
                }
            }
            WireEvent::Message(message) => {
                self.backlog.push_back(message);
                self.match_receives();
            }
        }
    }

    /// Hands queued messages to posted receives in arrival order. Messages outlive
    /// their connection: once the sender saw success the data is still delivered.
    fn match_receives(&mut self) {
        let mut consumed = 0usize;
        while !self.recv_queue.is_empty() {
            let Some(message) = self.backlog.pop_front() else {
                break;
            };
            consumed += 1;
            if self.connections.get(message.to).map_or(true, |c| c.state.is_terminal()) {
                trace!(conn = %message.to, "delivering message for closed connection");
            }
            if let Some(task) = self.recv_queue.pop_front() {
                self.deliver_to_receive(task, &message);
            }
        }
        if consumed > 0 {
            self.device.fabric().lock().release_messages(self.endpoint, consumed);
        }
    }

    fn deliver_to_receive(&mut self, task: TaskRef, message: &InboundMessage) {
        let result = task
            .downcast::<Receive>()
            .and_then(|handle| {
                <Receive as crate::exec::Pooled>::pool_mut(&mut self.pools)
                    .as_mut()
                    .and_then(|pool| pool.get_mut(handle))
            })
            .map(|entry| entry.op.deliver(message));
        match result {
            Some(result) => self.complete(task, result),
            None => warn!(?task, "posted receive vanished"),
        }
    }

    fn advance_handshakes(&mut self) {
        let now = Instant::now();
        for id in self.connections.ids() {
            let Some(conn) = self.connections.get(id) else {
                continue;
            };
            let expired = conn.deadline.map_or(false, |deadline| now >= deadline);
            match conn.state {
                ConnectionState::ResolvingAddress if expired => {
                    self.fail_connection(id, RdmaError::aborted("address resolution timed out"));
                }
                ConnectionState::ResolvingAddress => self.resolve(id),
                ConnectionState::Connecting if expired => {
                    self.fail_connection(id, RdmaError::aborted("connection request timed out"));
                }
                ConnectionState::Disconnecting if expired => {
                    debug!(conn = %id, "disconnect not acknowledged");
                    self.finish_disconnect(id);
                }
                _ => {}
            }
        }
    }

    /// Sends the request once something listens on the address. Until then the
    /// connection keeps resolving, bounded by its deadline.
    fn resolve(&mut self, id: ConnectionId) {
        let Some(address) = self
            .connections
            .get(id)
            .and_then(|c| c.lease.as_ref())
            .map(|lease| lease.address().clone())
        else {
            return;
        };
        let Some(source) = self.source_address(address.kind()) else {
            self.fail_connection(id, RdmaError::driver("device has no local address"));
            return;
        };
        let from = self.local_ref(id);
        let sent = {
            let mut fabric = self.device.fabric().lock();
            match fabric.resolve(&address) {
                Some(ListenTarget::Engine(endpoint)) => {
                    fabric.deliver(endpoint, WireEvent::ConnectRequest { from, source })
                }
                Some(ListenTarget::External(queue)) => fabric.push_cm_request(
                    queue,
                    PendingRequest {
                        from,
                        source,
                        port: address.port(),
                    },
                ),
                None => false,
            }
        };
        if sent {
            if let Some(conn) = self.connections.get_mut(id) {
                if conn.transition(ConnectionState::Connecting).is_ok() {
                    debug!(conn = %id, %address, "connection request sent");
                }
            }
        }
    }

    fn execute_send_queue(&mut self) {
        let queued: Vec<TaskRef> = self.send_queue.drain(..).collect();
        for task in queued {
            for_opcode!(task.opcode(), P => self.execute_task::<P>(task));
        }
    }

    fn execute_task<P: Operation>(&mut self, task: TaskRef) {
        let Some(handle) = task.downcast::<P>() else {
            return;
        };
        let peer = P::pool(&self.pools)
            .and_then(|pool| pool.get(handle))
            .and_then(|entry| entry.op.connection())
            .and_then(|id| self.connections.get(id))
            .filter(|conn| conn.state == ConnectionState::Connected)
            .and_then(|conn| conn.peer);

        let fabric = self.device.fabric().clone();
        let result = {
            let mut state = fabric.lock();
            let Some(entry) = P::pool_mut(&mut self.pools)
                .as_mut()
                .and_then(|pool| pool.get_mut(handle))
            else {
                return;
            };
            match peer {
                None => Err(RdmaError::aborted("connection is not connected")),
                Some(peer) => {
                    if state.take_failure() {
                        Err(RdmaError::driver("injected fabric failure"))
                    } else {
                        let mut env = ExecEnv::new(&mut *state, peer);
                        entry.op.execute(&mut env)
                    }
                }
            }
        };
        self.complete(task, result);
    }

    fn dispatch(&mut self, event: Event) {
        let ctx_tag = self.user_data;
        match event {
            Event::StateChanged { from, to } => {
                if let Some(mut cb) = self.state_callback.take() {
                    cb(self, from, to);
                    self.state_callback.get_or_insert(cb);
                }
            }
            Event::TaskCompleted { task, .. } => {
                for_opcode!(task.opcode(), P => self.dispatch_task::<P>(task));
            }
            Event::ConnectionRequest { conn } => {
                if let Some(mut cb) = self.conn_callbacks.request.take() {
                    cb(self, conn, ctx_tag);
                    self.conn_callbacks.request.get_or_insert(cb);
                }
            }
            Event::ConnectionEstablished { conn } => {
                let conn_tag = self.conn_tag(conn);
                if let Some(mut cb) = self.conn_callbacks.established.take() {
                    cb(self, conn, conn_tag, ctx_tag);
                    self.conn_callbacks.established.get_or_insert(cb);
                }
            }
            Event::ConnectionFailed { conn, error } => {
                let conn_tag = self.conn_tag(conn);
                if let Some(mut cb) = self.conn_callbacks.failure.take() {
                    cb(self, conn, &error, conn_tag, ctx_tag);
                    self.conn_callbacks.failure.get_or_insert(cb);
                }
            }
            Event::ConnectionDisconnected { conn } => {
                let conn_tag = self.conn_tag(conn);
                if let Some(mut cb) = self.conn_callbacks.disconnection.take() {
                    cb(self, conn, conn_tag, ctx_tag);
                    self.conn_callbacks.disconnection.get_or_insert(cb);
                }
            }
        }
    }

    fn conn_tag(&self, conn: ConnectionId) -> UserData {
        self.connections.get(conn).map(|c| c.user_data).unwrap_or_default()
    }

    fn dispatch_task<P: Operation>(&mut self, task: TaskRef) {
        let Some(handle) = task.downcast::<P>() else {
            return;
        };
        let Some(pool) = P::pool_mut(&mut self.pools).as_mut() else {
            return;
        };
        let Some(entry) = pool.get(handle) else {
            return;
        };
        if entry.status != TaskStatus::Completed {
            return;
        }
        let tag = entry.tag;
        let ok = matches!(entry.outcome, Some(Ok(())));
        let slot = if ok { &mut pool.on_success } else { &mut pool.on_error };
        let Some(mut cb) = slot.take() else {
            return;
        };
        let ctx_tag = self.user_data;
        cb(self, handle, tag, ctx_tag);
        if let Some(pool) = P::pool_mut(&mut self.pools).as_mut() {
            let slot = if ok { &mut pool.on_success } else { &mut pool.on_error };
            slot.get_or_insert(cb);
        }
    }
}
