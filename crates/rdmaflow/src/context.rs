//! The RDMA context: lifecycle, transport properties, connections and task pools.
//!
//! A context is configured while [`ContextState::Idle`], started, and then driven by
//! repeatedly calling [`Context::progress`] (or [`Context::poll_events`]). All methods
//! take `&mut self`; a context can move between threads but is never shared.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::address::{AddrType, RdmaAddress};
use crate::cm::CmRequest;
use crate::config::{AccessFlags, Datapath, Mtu, RdmaConfig, TransportType};
use crate::connection::{ConnectionId, ConnectionOrigin, ConnectionState, ConnectionTable};
use crate::details::{self, ConnectionDetails, DetailsRecord};
use crate::device::{Device, DeviceInfo};
use crate::engine::Event;
use crate::error::{RdmaError, Result};
use crate::exec::{for_opcode, Limits, TaskPool, TaskPools};
use crate::fabric::{EndpointId, InboundMessage, PeerRef, WireEvent};
use crate::metrics::{EngineMetrics, MetricsSnapshot};
use crate::task::{Operation, Task, TaskHandle, TaskRef, TaskStatus, UserData};

/// Lifecycle state of a context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ContextState {
    /// Configurable; no queues exist.
    Idle,
    /// Started; the next poll brings it up.
    Starting,
    /// Running; tasks and connections are live.
    Running,
    /// Stopped; the next poll flushes posted receives.
    Stopping,
    /// Terminal: the device failed. Only `destroy` is allowed.
    Failed,
}

/// `(context, connection, context tag)`
pub type ConnectionRequestCallback = Box<dyn FnMut(&mut Context, ConnectionId, UserData) + Send>;
/// `(context, connection, connection tag, context tag)`
pub type ConnectionEventCallback = Box<dyn FnMut(&mut Context, ConnectionId, UserData, UserData) + Send>;
/// `(context, connection, reason, connection tag, context tag)`
pub type ConnectionFailureCallback =
    Box<dyn FnMut(&mut Context, ConnectionId, &RdmaError, UserData, UserData) + Send>;
/// `(context, from, to)`
pub type StateChangedCallback = Box<dyn FnMut(&mut Context, ContextState, ContextState) + Send>;

/// Connection event handlers, invoked from [`Context::progress`].
#[derive(Default)]
pub struct ConnectionCallbacks {
    pub(crate) request: Option<ConnectionRequestCallback>,
    pub(crate) established: Option<ConnectionEventCallback>,
    pub(crate) failure: Option<ConnectionFailureCallback>,
    pub(crate) disconnection: Option<ConnectionEventCallback>,
}

impl ConnectionCallbacks {
    /// No callbacks registered.
    pub fn new() -> Self {
        Self::default()
    }

    /// A request arrived on a listening port. The handler should accept or reject.
    pub fn on_request(
        mut self,
        f: impl FnMut(&mut Context, ConnectionId, UserData) + Send + 'static,
    ) -> Self {
        self.request = Some(Box::new(f));
        self
    }

    /// The connection is usable.
    pub fn on_established(
        mut self,
        f: impl FnMut(&mut Context, ConnectionId, UserData, UserData) + Send + 'static,
    ) -> Self {
        self.established = Some(Box::new(f));
        self
    }

    /// A handshake failed, was rejected or timed out.
    pub fn on_failure(
        mut self,
        f: impl FnMut(&mut Context, ConnectionId, &RdmaError, UserData, UserData) + Send + 'static,
    ) -> Self {
        self.failure = Some(Box::new(f));
        self
    }

    /// A connected connection went down.
    pub fn on_disconnection(
        mut self,
        f: impl FnMut(&mut Context, ConnectionId, UserData, UserData) + Send + 'static,
    ) -> Self {
        self.disconnection = Some(Box::new(f));
        self
    }
}

impl std::fmt::Debug for ConnectionCallbacks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionCallbacks")
            .field("request", &self.request.is_some())
            .field("established", &self.established.is_some())
            .field("failure", &self.failure.is_some())
            .field("disconnection", &self.disconnection.is_some())
            .finish()
    }
}

/// Opaque accelerator handle, meaningful only to the co-processor runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AcceleratorHandle(u64);

impl AcceleratorHandle {
    /// Raw handle value.
    pub fn raw(self) -> u64 {
        self.0
    }
}

/// Connections and task pools on one device, driven by [`Context::progress`].
pub struct Context {
    pub(crate) device: Device,
    pub(crate) endpoint: EndpointId,
    pub(crate) state: ContextState,
    pub(crate) config: RdmaConfig,
    pub(crate) user_data: UserData,
    pub(crate) pools: TaskPools,
    pub(crate) conn_callbacks: ConnectionCallbacks,
    pub(crate) state_callback: Option<StateChangedCallback>,
    pub(crate) connections: ConnectionTable,
    pub(crate) listening: Vec<u16>,
    pub(crate) send_queue: VecDeque<TaskRef>,
    pub(crate) recv_queue: VecDeque<TaskRef>,
    pub(crate) backlog: VecDeque<InboundMessage>,
    pub(crate) pending: VecDeque<Event>,
    pub(crate) epoch: u64,
    pub(crate) metrics: EngineMetrics,
    pub(crate) dispatching: bool,
}

impl Context {
    /// Creates an idle context bound to `device`, with default properties.
    pub fn new(device: &Device) -> Result<Self> {
        let endpoint = {
            let mut fabric = device.fabric().lock();
            if fabric.device_removed(device.id()) {
                return Err(RdmaError::driver(format!("device {} removed", device.info().name())));
            }
            fabric.add_endpoint(device.id())
        };
        let config = RdmaConfig::default();
        Ok(Self {
            device: device.clone(),
            endpoint,
            state: ContextState::Idle,
            connections: ConnectionTable::new(config.max_num_connections as usize),
            config,
            user_data: UserData::default(),
            pools: TaskPools::default(),
            conn_callbacks: ConnectionCallbacks::default(),
            state_callback: None,
            listening: Vec::new(),
            send_queue: VecDeque::new(),
            recv_queue: VecDeque::new(),
            backlog: VecDeque::new(),
            pending: VecDeque::new(),
            epoch: 0,
            metrics: EngineMetrics::new(),
            dispatching: false,
        })
    }

    /// Creates a context and applies `config` through the validating setters.
    pub fn with_config(device: &Device, config: &RdmaConfig) -> Result<Self> {
        let mut ctx = Self::new(device)?;
        ctx.apply_config(config)?;
        Ok(ctx)
    }

    /// Device the context runs on.
    pub fn device(&self) -> &Device {
        &self.device
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ContextState {
        self.state
    }

    /// Tag handed to every callback as the context tag.
    pub fn user_data(&self) -> UserData {
        self.user_data
    }

    /// Sets the context tag.
    pub fn set_user_data(&mut self, user_data: UserData) {
        self.user_data = user_data;
    }

    /// Current configuration.
    pub fn config(&self) -> &RdmaConfig {
        &self.config
    }

    /// Counters since the context was created.
    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    // ---- lifecycle ----

    /// Starts the context. Requires it idle with at least one task pool configured.
    pub fn start(&mut self) -> Result<()> {
        if self.state != ContextState::Idle {
            return Err(RdmaError::bad_state("start", self.state));
        }
        if self.device.is_removed() {
            return Err(RdmaError::driver(format!("device {} removed", self.device.info().name())));
        }
        if self.pools.configured() == 0 {
            return Err(RdmaError::invalid("no task pool configured"));
        }
        {
            let mut fabric = self.device.fabric().lock();
            self.epoch = fabric.next_id();
            let endpoint = fabric
                .endpoint_mut(self.endpoint)
                .ok_or_else(|| RdmaError::unexpected("context endpoint missing"))?;
            endpoint.running = true;
            endpoint.epoch = self.epoch;
            endpoint.permissions = self.config.permissions;
            endpoint.transport = self.config.transport;
            endpoint.recv_limit = self.config.recv_queue_size as usize;
            endpoint.queued_messages = 0;
            endpoint.inbox.clear();
        }
        self.connections = ConnectionTable::new(self.config.max_num_connections as usize);
        info!(
            device = %self.device.info().name(),
            transport = ?self.config.transport,
            send_queue = self.config.send_queue_size,
            recv_queue = self.config.recv_queue_size,
            "context starting"
        );
        self.set_state(ContextState::Starting);
        Ok(())
    }

    /// Stops the context. Fails while send-side tasks are in flight or connections are
    /// still connected. Outgoing handshakes are reported failed, and posted receives
    /// are flushed with errors by the next poll.
    pub fn stop(&mut self) -> Result<()> {
        if !matches!(self.state, ContextState::Starting | ContextState::Running) {
            return Err(RdmaError::bad_state("stop", self.state));
        }
        if !self.send_queue.is_empty() {
            return Err(RdmaError::BadState {
                operation: "stop",
                state: format!("{} task(s) in flight", self.send_queue.len()),
            });
        }
        let busy = self
            .connections
            .iter()
            .filter(|c| matches!(c.state, ConnectionState::Connected | ConnectionState::Disconnecting))
            .count();
        if busy > 0 {
            return Err(RdmaError::BadState {
                operation: "stop",
                state: format!("{} connection(s) still connected", busy),
            });
        }

        let handshakes: Vec<ConnectionId> = self
            .connections
            .iter()
            .filter(|c| matches!(c.state, ConnectionState::ResolvingAddress | ConnectionState::Connecting))
            .map(|c| c.id)
            .collect();
        {
            let mut fabric = self.device.fabric().lock();
            for conn in self.connections.iter() {
                let Some(peer) = conn.peer else { continue };
                if conn.state.is_terminal() {
                    continue;
                }
                let event = if conn.state == ConnectionState::AwaitingAccept {
                    WireEvent::ConnectRejected { to: peer.conn }
                } else {
                    WireEvent::Disconnect {
                        to: peer.conn,
                        from: PeerRef {
                            endpoint: self.endpoint,
                            conn: conn.id,
                        },
                    }
                };
                fabric.deliver(peer.endpoint, event);
            }
            fabric.quiesce_endpoint(self.endpoint);
        }
        for &id in &handshakes {
            self.fail_connection(id, RdmaError::aborted("context stopped"));
        }
        for id in self.connections.ids() {
            if !handshakes.contains(&id) {
                self.connections.remove(id);
            }
        }
        self.listening.clear();
        self.backlog.clear();

        info!(device = %self.device.info().name(), "context stopping");
        self.set_state(ContextState::Stopping);
        if self.recv_queue.is_empty() {
            self.set_state(ContextState::Idle);
        }
        Ok(())
    }

    /// Destroys the context. Requires it idle with every task freed, or failed.
    pub fn destroy(self) -> std::result::Result<(), (Self, RdmaError)> {
        if self.state == ContextState::Failed {
            return Ok(());
        }
        if self.state != ContextState::Idle {
            let err = RdmaError::bad_state("destroy", self.state);
            return Err((self, err));
        }
        let allocated = self.pools.allocated();
        if allocated > 0 {
            let err = RdmaError::BadState {
                operation: "destroy",
                state: format!("{} task(s) still allocated", allocated),
            };
            return Err((self, err));
        }
        let open = self.connections.iter().filter(|c| !c.state.is_terminal()).count();
        if open > 0 {
            let err = RdmaError::BadState {
                operation: "destroy",
                state: format!("{} connection(s) still open", open),
            };
            return Err((self, err));
        }
        Ok(())
    }

    pub(crate) fn set_state(&mut self, next: ContextState) {
        let from = self.state;
        if from == next {
            return;
        }
        debug!(?from, to = ?next, "context state");
        self.state = next;
        self.pending.push_back(Event::StateChanged { from, to: next });
    }

    pub(crate) fn require_active(&self, operation: &'static str) -> Result<()> {
        match self.state {
            ContextState::Starting | ContextState::Running => Ok(()),
            state => Err(RdmaError::bad_state(operation, state)),
        }
    }

    /// Replaces the callback told about context state changes.
    pub fn set_state_changed_callback(
        &mut self,
        f: impl FnMut(&mut Context, ContextState, ContextState) + Send + 'static,
    ) -> Result<()> {
        if self.state != ContextState::Idle {
            return Err(RdmaError::bad_state("set_state_changed_callback", self.state));
        }
        self.state_callback = Some(Box::new(f));
        Ok(())
    }

    /// Replaces the connection callbacks. Only while idle.
    pub fn set_connection_state_callbacks(&mut self, callbacks: ConnectionCallbacks) -> Result<()> {
        if self.state != ContextState::Idle {
            return Err(RdmaError::bad_state("set_connection_state_callbacks", self.state));
        }
        self.conn_callbacks = callbacks;
        Ok(())
    }

    // ---- transport properties ----

    fn update(
        &mut self,
        operation: &'static str,
        f: impl FnOnce(&mut RdmaConfig, &DeviceInfo) -> Result<()>,
    ) -> Result<()> {
        if self.state != ContextState::Idle {
            return Err(RdmaError::bad_state(operation, self.state));
        }
        let mut next = self.config.clone();
        f(&mut next, self.device.info())?;
        self.config = next;
        Ok(())
    }

    /// Applies every property of `config`, or none of them.
    pub fn apply_config(&mut self, config: &RdmaConfig) -> Result<()> {
        self.update("apply_config", |c, info| {
            c.send_queue_size = queue_size(config.send_queue_size, info.max_send_queue_size(), "send queue")?;
            c.recv_queue_size = queue_size(config.recv_queue_size, info.max_recv_queue_size(), "receive queue")?;
            c.max_send_buf_list_len =
                list_len(config.max_send_buf_list_len, info.max_send_buf_list_len(), "send buffer list")?;
            c.recv_buf_list_len =
                list_len(config.recv_buf_list_len, info.max_recv_buf_list_len(), "receive buffer list")?;
            info.transport_type_is_supported(config.transport)?;
            c.transport = config.transport;
            c.mtu = mtu(config.mtu, info)?;
            c.permissions = config.permissions;
            c.grh_enabled = config.grh_enabled;
            c.gid_index = gid_index(config.gid_index, info)?;
            c.service_level = service_level(config.service_level)?;
            c.connection_request_timeout_ms = request_timeout(config.connection_request_timeout_ms)?;
            c.max_num_connections = max_connections(config.max_num_connections)?;
            c.rnr_retry_count = rnr_retry_count(config.rnr_retry_count)?;
            info.datapath_is_supported(config.datapath)?;
            c.datapath = config.datapath;
            Ok(())
        })
    }

    /// Rounded up to a power of two.
    pub fn set_send_queue_size(&mut self, size: u32) -> Result<()> {
        self.update("set_send_queue_size", |c, info| {
            c.send_queue_size = queue_size(size, info.max_send_queue_size(), "send queue")?;
            Ok(())
        })
    }

    /// Rounded up to a power of two.
    pub fn set_recv_queue_size(&mut self, size: u32) -> Result<()> {
        self.update("set_recv_queue_size", |c, info| {
            c.recv_queue_size = queue_size(size, info.max_recv_queue_size(), "receive queue")?;
            Ok(())
        })
    }

    /// Bounded by the device maximum.
    pub fn set_max_send_buf_list_len(&mut self, len: u32) -> Result<()> {
        self.update("set_max_send_buf_list_len", |c, info| {
            c.max_send_buf_list_len = list_len(len, info.max_send_buf_list_len(), "send buffer list")?;
            Ok(())
        })
    }

    /// Bounded by the device maximum.
    pub fn set_recv_buf_list_len(&mut self, len: u32) -> Result<()> {
        self.update("set_recv_buf_list_len", |c, info| {
            c.recv_buf_list_len = list_len(len, info.max_recv_buf_list_len(), "receive buffer list")?;
            Ok(())
        })
    }

    /// Fails with `NotSupported` when the device lacks the transport.
    pub fn set_transport_type(&mut self, transport: TransportType) -> Result<()> {
        self.update("set_transport_type", |c, info| {
            info.transport_type_is_supported(transport)?;
            c.transport = transport;
            Ok(())
        })
    }

    /// Fails above the device maximum.
    pub fn set_mtu(&mut self, value: Mtu) -> Result<()> {
        self.update("set_mtu", |c, info| {
            c.mtu = mtu(value, info)?;
            Ok(())
        })
    }

    /// Remote access granted to peers.
    pub fn set_permissions(&mut self, permissions: AccessFlags) -> Result<()> {
        self.update("set_permissions", |c, _| {
            c.permissions = permissions;
            Ok(())
        })
    }

    /// Enables the global routing header.
    pub fn set_grh_enabled(&mut self, enabled: bool) -> Result<()> {
        self.update("set_grh_enabled", |c, _| {
            c.grh_enabled = enabled;
            Ok(())
        })
    }

    /// Must index an existing GID table entry.
    pub fn set_gid_index(&mut self, index: u32) -> Result<()> {
        self.update("set_gid_index", |c, info| {
            c.gid_index = gid_index(index, info)?;
            Ok(())
        })
    }

    /// Valid range is 0..=15.
    pub fn set_service_level(&mut self, level: u8) -> Result<()> {
        self.update("set_service_level", |c, _| {
            c.service_level = service_level(level)?;
            Ok(())
        })
    }

    /// Bounds address resolution, handshakes and disconnect acknowledgement. Unlike the
    /// other properties it can be changed at any time; running handshakes keep the
    /// deadline they started with.
    pub fn set_connection_request_timeout(&mut self, timeout_ms: u16) -> Result<()> {
        if self.state == ContextState::Failed {
            return Err(RdmaError::bad_state("set_connection_request_timeout", self.state));
        }
        self.config.connection_request_timeout_ms = request_timeout(timeout_ms)?;
        Ok(())
    }

    /// At least one.
    pub fn set_max_num_connections(&mut self, max: u16) -> Result<()> {
        self.update("set_max_num_connections", |c, _| {
            c.max_num_connections = max_connections(max)?;
            Ok(())
        })
    }

    /// Valid range is 0..=7.
    pub fn set_rnr_retry_count(&mut self, count: u8) -> Result<()> {
        self.update("set_rnr_retry_count", |c, _| {
            c.rnr_retry_count = rnr_retry_count(count)?;
            Ok(())
        })
    }

    /// Fails with `NotSupported` when the device lacks the datapath.
    pub fn set_datapath(&mut self, datapath: Datapath) -> Result<()> {
        self.update("set_datapath", |c, info| {
            info.datapath_is_supported(datapath)?;
            c.datapath = datapath;
            Ok(())
        })
    }

    /// Configured send queue depth.
    pub fn send_queue_size(&self) -> u32 {
        self.config.send_queue_size
    }

    /// Configured receive queue depth.
    pub fn recv_queue_size(&self) -> u32 {
        self.config.recv_queue_size
    }

    /// Maximum send-side buffer-list length.
    pub fn max_send_buf_list_len(&self) -> u32 {
        self.config.max_send_buf_list_len
    }

    /// Maximum receive buffer-list length.
    pub fn recv_buf_list_len(&self) -> u32 {
        self.config.recv_buf_list_len
    }

    /// Configured transport.
    pub fn transport_type(&self) -> TransportType {
        self.config.transport
    }

    /// Configured path MTU.
    pub fn mtu(&self) -> Mtu {
        self.config.mtu
    }

    /// Remote access granted to peers.
    pub fn permissions(&self) -> AccessFlags {
        self.config.permissions
    }

    /// Whether the global routing header is on.
    pub fn grh_enabled(&self) -> bool {
        self.config.grh_enabled
    }

    /// Configured GID index.
    pub fn gid_index(&self) -> u32 {
        self.config.gid_index
    }

    /// Configured service level.
    pub fn service_level(&self) -> u8 {
        self.config.service_level
    }

    /// Handshake and disconnect bound.
    pub fn connection_request_timeout(&self) -> Duration {
        Duration::from_millis(self.config.connection_request_timeout_ms as u64)
    }

    /// Size of the connection table.
    pub fn max_num_connections(&self) -> u16 {
        self.config.max_num_connections
    }

    /// Receiver-not-ready retry count.
    pub fn rnr_retry_count(&self) -> u8 {
        self.config.rnr_retry_count
    }

    /// Configured datapath.
    pub fn datapath(&self) -> Datapath {
        self.config.datapath
    }

    /// Handle for GPU-initiated work. Needs a started context on the GPU datapath.
    pub fn get_gpu_handle(&self) -> Result<AcceleratorHandle> {
        self.accelerator_handle("get_gpu_handle", Datapath::Gpu)
    }

    /// Handle for DPA-initiated work. Needs a started context on the DPA datapath.
    pub fn get_dpa_handle(&self) -> Result<AcceleratorHandle> {
        self.accelerator_handle("get_dpa_handle", Datapath::Dpa)
    }

    fn accelerator_handle(&self, operation: &'static str, datapath: Datapath) -> Result<AcceleratorHandle> {
        self.require_active(operation)?;
        if self.config.datapath != datapath {
            return Err(RdmaError::BadState {
                operation,
                state: format!("started with {:?} datapath", self.config.datapath),
            });
        }
        Ok(AcceleratorHandle((self.epoch << 16) | (self.endpoint.0 & 0xffff)))
    }

    // ---- connections ----

    fn request_deadline(&self) -> Instant {
        Instant::now() + self.connection_request_timeout()
    }

    fn reject_dc(&self, operation: &str) -> Result<()> {
        if self.config.transport == TransportType::Dc {
            return Err(RdmaError::not_supported(format!(
                "{} with DC transport; use export/connect",
                operation
            )));
        }
        Ok(())
    }

    pub(crate) fn local_ref(&self, conn: ConnectionId) -> PeerRef {
        PeerRef {
            endpoint: self.endpoint,
            conn,
        }
    }

    /// Starts a client handshake towards `address`. The outcome arrives as an
    /// established or failure event.
    pub fn connect_to_addr(&mut self, address: &RdmaAddress, user_data: UserData) -> Result<ConnectionId> {
        self.require_active("connect_to_addr")?;
        self.reject_dc("connect_to_addr")?;
        let deadline = self.request_deadline();
        let id = self.connections.insert(ConnectionOrigin::Client, user_data)?;
        let conn = self.connections.lookup_mut(id)?;
        conn.lease = Some(address.lease());
        conn.deadline = Some(deadline);
        conn.transition(ConnectionState::ResolvingAddress)?;
        debug!(conn = %id, %address, "connecting");
        Ok(id)
    }

    /// Accepts connection requests on `port` until `stop_listen`.
    pub fn start_listen(&mut self, port: u16) -> Result<()> {
        self.require_active("start_listen")?;
        self.reject_dc("start_listen")?;
        if self.listening.contains(&port) {
            return Err(RdmaError::BadState {
                operation: "start_listen",
                state: format!("already listening on port {}", port),
            });
        }
        self.device
            .fabric()
            .lock()
            .listen(self.device.id(), port, crate::fabric::ListenTarget::Engine(self.endpoint))?;
        self.listening.push(port);
        info!(port, "listening");
        Ok(())
    }

    /// Stops accepting new requests on `port`; existing connections are unaffected.
    pub fn stop_listen(&mut self, port: u16) -> Result<()> {
        let Some(pos) = self.listening.iter().position(|p| *p == port) else {
            return Err(RdmaError::invalid(format!("not listening on port {}", port)));
        };
        self.device
            .fabric()
            .lock()
            .unlisten(self.device.id(), port, crate::fabric::ListenTarget::Engine(self.endpoint));
        self.listening.remove(pos);
        info!(port, "stopped listening");
        Ok(())
    }

    /// Ports this context listens on.
    pub fn listening_ports(&self) -> &[u16] {
        &self.listening
    }

    fn answer_request(
        &mut self,
        operation: &'static str,
        conn: ConnectionId,
        origin: ConnectionOrigin,
        private_data: &[u8],
    ) -> Result<PeerRef> {
        self.require_active(operation)?;
        if private_data.len() > u8::MAX as usize {
            return Err(RdmaError::invalid(format!(
                "private data of {} bytes exceeds {}",
                private_data.len(),
                u8::MAX
            )));
        }
        let entry = self.connections.lookup(conn)?;
        if entry.origin != origin {
            return Err(RdmaError::BadState {
                operation,
                state: format!("{:?} connection", entry.origin),
            });
        }
        if entry.state != ConnectionState::AwaitingAccept {
            return Err(RdmaError::bad_state(operation, entry.state));
        }
        entry
            .peer
            .ok_or_else(|| RdmaError::unexpected(format!("{} has no peer", conn)))
    }

    fn send_accept(&mut self, conn: ConnectionId, peer: PeerRef, private_data: &[u8]) -> bool {
        let event = WireEvent::ConnectAccepted {
            to: peer.conn,
            from: self.local_ref(conn),
            private_data: private_data.to_vec(),
        };
        self.device.fabric().lock().deliver(peer.endpoint, event)
    }

    /// Accepts a request surfaced by the request event. The connection is connected
    /// immediately; no established event follows on this side.
    pub fn accept(&mut self, conn: ConnectionId, private_data: &[u8]) -> Result<()> {
        let peer = self.answer_request("accept", conn, ConnectionOrigin::Server, private_data)?;
        if !self.send_accept(conn, peer, private_data) {
            self.fail_connection(conn, RdmaError::aborted("client went away before accept"));
            return Ok(());
        }
        self.connections.lookup_mut(conn)?.transition(ConnectionState::Connected)?;
        self.metrics.inc_connections_established();
        info!(conn = %conn, "accepted");
        Ok(())
    }

    /// Rejects a pending request and releases the connection immediately.
    pub fn reject(&mut self, conn: ConnectionId) -> Result<()> {
        self.require_active("reject")?;
        let entry = self.connections.lookup(conn)?;
        if entry.state != ConnectionState::AwaitingAccept {
            return Err(RdmaError::bad_state("reject", entry.state));
        }
        if let Some(peer) = entry.peer {
            self.device
                .fabric()
                .lock()
                .deliver(peer.endpoint, WireEvent::ConnectRejected { to: peer.conn });
        }
        self.connections.remove(conn);
        info!(conn = %conn, "rejected");
        Ok(())
    }

    /// Begins tearing down a connected connection. Tasks bound to it complete with
    /// errors before the disconnection event.
    pub fn disconnect(&mut self, conn: ConnectionId) -> Result<()> {
        self.require_active("disconnect")?;
        let deadline = self.request_deadline();
        let entry = self.connections.lookup_mut(conn)?;
        if entry.state != ConnectionState::Connected {
            return Err(RdmaError::bad_state("disconnect", entry.state));
        }
        entry.transition(ConnectionState::Disconnecting)?;
        entry.deadline = Some(deadline);
        let peer = entry.peer;

        self.fail_bound_tasks(conn);
        let delivered = match peer {
            Some(peer) => {
                let event = WireEvent::Disconnect {
                    to: peer.conn,
                    from: self.local_ref(conn),
                };
                self.device.fabric().lock().deliver(peer.endpoint, event)
            }
            None => false,
        };
        if !delivered {
            self.finish_disconnect(conn);
        }
        info!(conn = %conn, "disconnecting");
        Ok(())
    }

    /// Adopts a request from an external connection manager. Ownership of the request
    /// passes to the context; a valid connection id is returned even if the accept
    /// that follows fails.
    pub fn bridge_prepare_connection(&mut self, request: CmRequest) -> Result<ConnectionId> {
        if !request.fabric().same(self.device.fabric()) {
            return Err(RdmaError::invalid("request belongs to another fabric"));
        }
        self.require_active("bridge_prepare_connection")?;
        self.reject_dc("bridge_prepare_connection")?;
        let id = self.connections.insert(ConnectionOrigin::Bridged, UserData::default())?;
        let (from, source) = request.adopt();
        let conn = self.connections.lookup_mut(id)?;
        conn.peer = Some(from);
        conn.lease = Some(source.lease());
        conn.transition(ConnectionState::AwaitingAccept)?;
        debug!(conn = %id, %source, "bridged connection adopted");
        Ok(id)
    }

    /// Accepts a bridged request, like `accept` for requests taken from a [`crate::CmListener`].
    pub fn bridge_accept(&mut self, conn: ConnectionId, private_data: &[u8]) -> Result<()> {
        let peer = self.answer_request("bridge_accept", conn, ConnectionOrigin::Bridged, private_data)?;
        if !self.send_accept(conn, peer, private_data) {
            self.fail_connection(conn, RdmaError::aborted("client went away before accept"));
            return Ok(());
        }
        self.connections.lookup_mut(conn)?.transition(ConnectionState::Connecting)?;
        Ok(())
    }

    /// The external manager reports the handshake finished.
    pub fn bridge_established(&mut self, conn: ConnectionId) -> Result<()> {
        self.require_active("bridge_established")?;
        let entry = self.connections.lookup_mut(conn)?;
        if entry.origin != ConnectionOrigin::Bridged {
            return Err(RdmaError::BadState {
                operation: "bridge_established",
                state: format!("{:?} connection", entry.origin),
            });
        }
        if entry.state != ConnectionState::Connecting {
            return Err(RdmaError::bad_state("bridge_established", entry.state));
        }
        entry.transition(ConnectionState::Connected)?;
        self.established(conn);
        Ok(())
    }

    /// Creates a connection and the details a peer needs to bind to it. The details
    /// stay valid until this context stops.
    pub fn export(&mut self) -> Result<(ConnectionDetails, ConnectionId)> {
        self.require_active("export")?;
        let key = details::session_key()?;
        let gid = if self.config.grh_enabled {
            self.device
                .info()
                .gids(self.config.gid_index, 1)
                .ok()
                .and_then(|g| g.first().map(|gid| gid.0))
        } else {
            None
        };
        let id = self.connections.insert(ConnectionOrigin::Exported, UserData::default())?;
        let record = DetailsRecord::new(self.endpoint, self.epoch, id, self.config.transport, gid, key);
        let details = match ConnectionDetails::seal(&record) {
            Ok(details) => details,
            Err(e) => {
                self.connections.remove(id);
                return Err(e);
            }
        };
        self.connections.lookup_mut(id)?.session_key = Some(key);
        debug!(conn = %id, "exported");
        Ok((details, id))
    }

    /// Binds an exported connection to the peer connection described by `details`.
    pub fn connect(&mut self, details: &ConnectionDetails, conn: ConnectionId) -> Result<()> {
        self.require_active("connect")?;
        let entry = self.connections.lookup(conn)?;
        if entry.origin != ConnectionOrigin::Exported {
            return Err(RdmaError::BadState {
                operation: "connect",
                state: format!("{:?} connection", entry.origin),
            });
        }
        if entry.state != ConnectionState::Idle {
            return Err(RdmaError::bad_state("connect", entry.state));
        }
        let record = details.open()?;
        if record.transport != self.config.transport {
            return Err(RdmaError::aborted(format!(
                "peer uses {:?}, this context {:?}",
                record.transport, self.config.transport
            )));
        }
        let peer = PeerRef {
            endpoint: record.endpoint,
            conn: record.conn,
        };
        {
            let mut fabric = self.device.fabric().lock();
            let valid = fabric
                .endpoint(record.endpoint)
                .map(|e| e.running && e.epoch == record.epoch)
                .unwrap_or(false);
            if !valid {
                return Err(RdmaError::aborted("connection details are stale; the exporter restarted"));
            }
            let bound = WireEvent::PeerBound {
                to: record.conn,
                from: self.local_ref(conn),
                session_key: record.session_key,
            };
            if !fabric.deliver(record.endpoint, bound) {
                return Err(RdmaError::aborted("exporter unreachable"));
            }
        }
        let deadline = self.request_deadline();
        let entry = self.connections.lookup_mut(conn)?;
        entry.peer = Some(peer);
        if entry.peer_bound == Some(peer) {
            entry.transition(ConnectionState::Connected)?;
            self.established(conn);
        } else {
            entry.deadline = Some(deadline);
            entry.transition(ConnectionState::Connecting)?;
        }
        Ok(())
    }

    /// Current state of a connection.
    pub fn connection_state(&self, conn: ConnectionId) -> Result<ConnectionState> {
        Ok(self.connections.lookup(conn)?.state)
    }

    /// How the connection came to be.
    pub fn connection_origin(&self, conn: ConnectionId) -> Result<ConnectionOrigin> {
        Ok(self.connections.lookup(conn)?.origin)
    }

    /// Tag given when the connection was created.
    pub fn connection_user_data(&self, conn: ConnectionId) -> Result<UserData> {
        Ok(self.connections.lookup(conn)?.user_data)
    }

    /// Replaces the connection tag.
    pub fn set_connection_user_data(&mut self, conn: ConnectionId, user_data: UserData) -> Result<()> {
        self.connections.lookup_mut(conn)?.user_data = user_data;
        Ok(())
    }

    /// Address the connection was made to (client) or from (server, bridged).
    pub fn connection_address(&self, conn: ConnectionId) -> Result<Option<RdmaAddress>> {
        Ok(self
            .connections
            .lookup(conn)?
            .lease
            .as_ref()
            .map(|lease| lease.address().clone()))
    }

    /// Private data the server attached to its accept.
    pub fn connection_private_data(&self, conn: ConnectionId) -> Result<&[u8]> {
        Ok(&self.connections.lookup(conn)?.private_data)
    }

    /// Error that failed the connection, if it failed.
    pub fn connection_failure(&self, conn: ConnectionId) -> Result<Option<&RdmaError>> {
        Ok(self.connections.lookup(conn)?.failure.as_ref())
    }

    /// Ids of every connection in the table.
    pub fn connections(&self) -> Vec<ConnectionId> {
        self.connections.ids()
    }

    pub(crate) fn established(&mut self, conn: ConnectionId) {
        self.metrics.inc_connections_established();
        info!(conn = %conn, "connection established");
        self.pending.push_back(Event::ConnectionEstablished { conn });
    }

    pub(crate) fn fail_connection(&mut self, conn: ConnectionId, error: RdmaError) {
        let Some(entry) = self.connections.get_mut(conn) else { return };
        if entry.transition(ConnectionState::Failed).is_err() {
            return;
        }
        warn!(conn = %conn, %error, "connection failed");
        entry.failure = Some(error.clone());
        self.metrics.inc_connections_failed();
        self.pending.push_back(Event::ConnectionFailed { conn, error });
    }

    pub(crate) fn finish_disconnect(&mut self, conn: ConnectionId) {
        let Some(entry) = self.connections.get_mut(conn) else { return };
        if entry.transition(ConnectionState::Disconnected).is_err() {
            return;
        }
        info!(conn = %conn, "disconnected");
        self.metrics.inc_connections_disconnected();
        self.pending.push_back(Event::ConnectionDisconnected { conn });
    }

    /// Local address handed to the server as the request's source.
    pub(crate) fn source_address(&self, preferred: AddrType) -> Option<RdmaAddress> {
        let info = self.device.info();
        [preferred, AddrType::Ipv4, AddrType::Ipv6, AddrType::Gid]
            .into_iter()
            .find_map(|kind| info.local_address(kind, 0))
    }

    // ---- tasks ----

    /// Configures the pool for payload `P`. Only while idle.
    pub fn set_task_conf<P: Operation>(
        &mut self,
        on_success: impl FnMut(&mut Context, TaskHandle<P>, UserData, UserData) + Send + 'static,
        on_error: impl FnMut(&mut Context, TaskHandle<P>, UserData, UserData) + Send + 'static,
        capacity: u32,
    ) -> Result<()> {
        if self.state != ContextState::Idle {
            return Err(RdmaError::bad_state("set_task_conf", self.state));
        }
        if capacity == 0 {
            return Err(RdmaError::invalid("task pool capacity must be positive"));
        }
        self.device.info().task_is_supported(P::OPCODE)?;
        let slot = P::pool_mut(&mut self.pools);
        if let Some(existing) = slot.as_ref() {
            if existing.allocated() > 0 {
                return Err(RdmaError::BadState {
                    operation: "set_task_conf",
                    state: format!("{} {:?} task(s) still allocated", existing.allocated(), P::OPCODE),
                });
            }
        }
        *slot = Some(TaskPool::new(capacity, Box::new(on_success), Box::new(on_error)));
        debug!(opcode = ?P::OPCODE, capacity, "task pool configured");
        Ok(())
    }

    pub(crate) fn limits(&self) -> Limits {
        Limits {
            max_send_buf_list_len: self.config.max_send_buf_list_len as usize,
            recv_buf_list_len: self.config.recv_buf_list_len as usize,
            max_message_size: self.device.info().max_message_size() as u64,
        }
    }

    fn missing_pool<P: Operation>() -> RdmaError {
        RdmaError::invalid(format!("no task pool configured for {:?}", P::OPCODE))
    }

    fn stale_task(task: impl std::fmt::Debug) -> RdmaError {
        RdmaError::invalid(format!("stale or unknown task {:?}", task))
    }

    /// Allocates a task from the pool of `P`. Operands are validated first; nothing
    /// changes on failure.
    pub fn allocate<P: Operation>(&mut self, op: P, tag: UserData) -> Result<TaskHandle<P>> {
        self.require_active("allocate")?;
        crate::exec::Sealed::validate(&op, &self.limits())?;
        let pool = P::pool_mut(&mut self.pools)
            .as_mut()
            .ok_or_else(Self::missing_pool::<P>)?;
        pool.alloc(op, tag)
    }

    /// Read access to a task, in any status.
    pub fn task<P: Operation>(&self, handle: TaskHandle<P>) -> Result<&Task<P>> {
        let pool = P::pool(&self.pools).ok_or_else(Self::missing_pool::<P>)?;
        pool.get(handle).ok_or_else(|| Self::stale_task(handle))
    }

    /// Mutable access while the caller owns the task.
    pub fn task_mut<P: Operation>(&mut self, handle: TaskHandle<P>) -> Result<&mut Task<P>> {
        let pool = P::pool_mut(&mut self.pools)
            .as_mut()
            .ok_or_else(Self::missing_pool::<P>)?;
        let task = pool.get_mut(handle).ok_or_else(|| Self::stale_task(handle))?;
        if task.status == TaskStatus::Submitted {
            return Err(RdmaError::bad_state("task_mut", task.status));
        }
        Ok(task)
    }

    /// Hands a task to the engine. Also used to resubmit a completed task.
    pub fn submit(&mut self, task: impl Into<TaskRef>) -> Result<()> {
        let task = task.into();
        for_opcode!(task.opcode(), P => self.submit_typed::<P>(task))
    }

    fn submit_typed<P: Operation>(&mut self, task: TaskRef) -> Result<()> {
        let handle = task
            .downcast::<P>()
            .ok_or_else(|| RdmaError::unexpected("opcode dispatch mismatch"))?;
        self.require_active("submit")?;
        let limits = self.limits();
        let pool = P::pool(&self.pools).ok_or_else(Self::missing_pool::<P>)?;
        let entry = pool.get(handle).ok_or_else(|| Self::stale_task(handle))?;
        if entry.status == TaskStatus::Submitted {
            return Err(RdmaError::bad_state("submit", entry.status));
        }
        crate::exec::Sealed::validate(&entry.op, &limits)?;

        if P::OPCODE.is_receive() {
            if self.recv_queue.len() >= self.config.recv_queue_size as usize {
                return Err(RdmaError::ResourceExhausted {
                    resource: "receive queue",
                    capacity: self.config.recv_queue_size as usize,
                });
            }
        } else {
            let conn = entry
                .op
                .connection()
                .ok_or_else(|| RdmaError::unexpected("send-side task without connection"))?;
            let state = self.connections.lookup(conn)?.state;
            if state != ConnectionState::Connected {
                return Err(RdmaError::BadState {
                    operation: "submit",
                    state: format!("{} is {:?}", conn, state),
                });
            }
            if self.send_queue.len() >= self.config.send_queue_size as usize {
                return Err(RdmaError::ResourceExhausted {
                    resource: "send queue",
                    capacity: self.config.send_queue_size as usize,
                });
            }
        }

        let entry = P::pool_mut(&mut self.pools)
            .as_mut()
            .and_then(|pool| pool.get_mut(handle))
            .ok_or_else(|| Self::stale_task(handle))?;
        entry.status = TaskStatus::Submitted;
        entry.outcome = None;
        if P::OPCODE.is_receive() {
            self.recv_queue.push_back(task);
        } else {
            self.send_queue.push_back(task);
        }
        self.metrics.inc_tasks_submitted();
        Ok(())
    }

    /// Returns a task the caller owns to its pool without running it.
    pub fn free(&mut self, task: impl Into<TaskRef>) -> Result<()> {
        let task = task.into();
        for_opcode!(task.opcode(), P => self.free_typed::<P>(task))
    }

    fn free_typed<P: Operation>(&mut self, task: TaskRef) -> Result<()> {
        let handle = task
            .downcast::<P>()
            .ok_or_else(|| RdmaError::unexpected("opcode dispatch mismatch"))?;
        let pool = P::pool_mut(&mut self.pools)
            .as_mut()
            .ok_or_else(Self::missing_pool::<P>)?;
        let status = pool.get(handle).ok_or_else(|| Self::stale_task(handle))?.status;
        if status == TaskStatus::Submitted {
            return Err(RdmaError::bad_state("free", status));
        }
        pool.release(handle);
        Ok(())
    }

    /// Number of tasks currently owned by the engine.
    pub fn in_flight(&self) -> usize {
        self.send_queue.len() + self.recv_queue.len()
    }

    pub(crate) fn task_connection(&self, task: TaskRef) -> Option<ConnectionId> {
        for_opcode!(task.opcode(), P => self.typed_connection::<P>(task))
    }

    fn typed_connection<P: Operation>(&self, task: TaskRef) -> Option<ConnectionId> {
        let handle = task.downcast::<P>()?;
        P::pool(&self.pools)?.get(handle)?.op.connection()
    }

    /// Completes every queued task bound to `conn` with a connection-aborted error.
    pub(crate) fn fail_bound_tasks(&mut self, conn: ConnectionId) {
        let queued: Vec<TaskRef> = self.send_queue.drain(..).collect();
        for task in queued {
            if self.task_connection(task) == Some(conn) {
                self.complete(task, Err(RdmaError::aborted(format!("{} disconnected", conn))));
            } else {
                self.send_queue.push_back(task);
            }
        }
    }

    pub(crate) fn complete(&mut self, task: TaskRef, result: Result<u64>) {
        for_opcode!(task.opcode(), P => self.complete_typed::<P>(task, result))
    }

    fn complete_typed<P: Operation>(&mut self, task: TaskRef, result: Result<u64>) {
        let Some(handle) = task.downcast::<P>() else { return };
        let Some(entry) = P::pool_mut(&mut self.pools).as_mut().and_then(|p| p.get_mut(handle)) else {
            return;
        };
        match &result {
            Ok(bytes) if P::OPCODE.is_receive() => self.metrics.add_bytes_received(*bytes),
            Ok(bytes) => self.metrics.add_bytes_sent(*bytes),
            Err(e) => debug!(opcode = ?P::OPCODE, error = %e, "task failed"),
        }
        let outcome = result.map(|_| ());
        self.metrics.record_completion(outcome.is_ok());
        entry.status = TaskStatus::Completed;
        entry.outcome = Some(outcome.clone());
        let tag = entry.tag;
        self.pending.push_back(Event::TaskCompleted {
            task,
            tag,
            result: outcome,
        });
    }
}

impl Drop for Context {
    fn drop(&mut self) {
        self.device.fabric().lock().remove_endpoint(self.endpoint);
    }
}

impl std::fmt::Debug for Context {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Context")
            .field("device", &self.device)
            .field("state", &self.state)
            .field("connections", &self.connections.len())
            .field("in_flight", &self.in_flight())
            .field("listening", &self.listening)
            .finish()
    }
}

fn queue_size(size: u32, max: u32, what: &str) -> Result<u32> {
    if size == 0 {
        return Err(RdmaError::invalid(format!("{} size must be positive", what)));
    }
    match size.checked_next_power_of_two() {
        Some(rounded) if rounded <= max => Ok(rounded),
        _ => Err(RdmaError::not_supported(format!(
            "{} size {} exceeds device maximum {}",
            what, size, max
        ))),
    }
}

fn list_len(len: u32, max: u32, what: &str) -> Result<u32> {
    if len == 0 {
        return Err(RdmaError::invalid(format!("{} length must be positive", what)));
    }
    if len > max {
        return Err(RdmaError::not_supported(format!(
            "{} length {} exceeds device maximum {}",
            what, len, max
        )));
    }
    Ok(len)
}

fn mtu(value: Mtu, info: &DeviceInfo) -> Result<Mtu> {
    if value > info.max_mtu() {
        return Err(RdmaError::not_supported(format!(
            "MTU {} exceeds device maximum {}",
            value.bytes(),
            info.max_mtu().bytes()
        )));
    }
    Ok(value)
}

fn gid_index(index: u32, info: &DeviceInfo) -> Result<u32> {
    if index >= info.gid_table_size() && index != 0 {
        return Err(RdmaError::not_supported(format!(
            "GID index {} outside table of {}",
            index,
            info.gid_table_size()
        )));
    }
    Ok(index)
}

fn service_level(level: u8) -> Result<u8> {
    if level > 15 {
        return Err(RdmaError::invalid(format!("service level {} above 15", level)));
    }
    Ok(level)
}

fn request_timeout(timeout_ms: u16) -> Result<u16> {
    if timeout_ms == 0 {
        return Err(RdmaError::invalid("connection request timeout must be positive"));
    }
    Ok(timeout_ms)
}

fn max_connections(max: u16) -> Result<u16> {
    if max == 0 {
        return Err(RdmaError::invalid("max connections must be positive"));
    }
    Ok(max)
}

fn rnr_retry_count(count: u8) -> Result<u8> {
    if count > 7 {
        return Err(RdmaError::invalid(format!("RNR retry count {} above 7", count)));
    }
    Ok(count)
}
