//! In-process software fabric.
//!
//! The fabric stands in for the interconnect, the connection manager and memory
//! registration. Devices attach to it, every [`crate::Context`] owns one endpoint on
//! it, and control and data messages travel between endpoint inboxes. Registered
//! memory regions and sync events are looked up by key when a peer addresses them.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Weak};

use parking_lot::{Mutex, MutexGuard};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::address::RdmaAddress;
use crate::buffer::MemoryRegion;
use crate::config::{AccessFlags, TransportType};
use crate::connection::ConnectionId;
use crate::device::DeviceInfo;
use crate::error::{RdmaError, Result};
use crate::sync_event::SyncEvent;
use crate::task::ImmData;

/// Identifier of a device attached to a fabric.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DeviceId(pub(crate) u64);

/// Identifier of a context's endpoint on a fabric.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EndpointId(pub(crate) u64);

/// Counters kept by the fabric itself.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FabricStats {
    /// Control and data messages queued on a running endpoint.
    pub messages_delivered: u64,
    /// Messages refused: unreachable endpoint or receiver not ready.
    pub messages_dropped: u64,
    /// Payload bytes carried by data operations.
    pub bytes_moved: u64,
    /// One-sided operations that reached remote memory.
    pub remote_ops: u64,
    /// One-sided operations refused by the target.
    pub remote_op_errors: u64,
    /// Injected failures consumed.
    pub injected_failures: u64,
}

/// A connection on a specific endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct PeerRef {
    pub endpoint: EndpointId,
    pub conn: ConnectionId,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum MessageKind {
    Send,
    SendImm,
    WriteImm,
}

#[derive(Debug, Clone)]
pub(crate) struct InboundMessage {
    pub to: ConnectionId,
    pub kind: MessageKind,
    pub imm: Option<ImmData>,
    pub payload: Vec<u8>,
    /// Bytes carried; for write-with-immediate the length written remotely.
    pub len: u64,
}

#[derive(Debug, Clone)]
pub(crate) enum WireEvent {
    ConnectRequest {
        from: PeerRef,
        source: RdmaAddress,
    },
    ConnectAccepted {
        to: ConnectionId,
        from: PeerRef,
        private_data: Vec<u8>,
    },
    ConnectRejected {
        to: ConnectionId,
    },
    PeerBound {
        to: ConnectionId,
        from: PeerRef,
        session_key: [u8; 16],
    },
    Disconnect {
        to: ConnectionId,
        from: PeerRef,
    },
    DisconnectAck {
        to: ConnectionId,
    },
    Message(InboundMessage),
}

/// Who receives connection requests arriving on a listening port.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ListenTarget {
    Engine(EndpointId),
    External(u64),
}

/// A request parked on an external connection manager queue.
#[derive(Debug, Clone)]
pub(crate) struct PendingRequest {
    pub from: PeerRef,
    pub source: RdmaAddress,
    pub port: u16,
}

pub(crate) struct DeviceRecord {
    pub info: Arc<DeviceInfo>,
    pub removed: bool,
}

pub(crate) struct EndpointRecord {
    pub device: DeviceId,
    pub inbox: VecDeque<WireEvent>,
    pub epoch: u64,
    pub running: bool,
    pub permissions: AccessFlags,
    pub transport: TransportType,
    /// Messages the endpoint accepts before senders see receiver-not-ready.
    pub recv_limit: usize,
    /// Messages delivered but not yet consumed by a receive.
    pub queued_messages: usize,
}

pub(crate) struct FabricState {
    next_id: u64,
    devices: HashMap<DeviceId, DeviceRecord>,
    endpoints: HashMap<EndpointId, EndpointRecord>,
    listeners: HashMap<(DeviceId, u16), ListenTarget>,
    cm_queues: HashMap<u64, VecDeque<PendingRequest>>,
    regions: HashMap<u32, Weak<MemoryRegion>>,
    sync_events: HashMap<u64, Weak<SyncEvent>>,
    pending_failures: u64,
    pub stats: FabricStats,
}

impl FabricState {
    fn new() -> Self {
        Self {
            next_id: 1,
            devices: HashMap::new(),
            endpoints: HashMap::new(),
            listeners: HashMap::new(),
            cm_queues: HashMap::new(),
            regions: HashMap::new(),
            sync_events: HashMap::new(),
            pending_failures: 0,
            stats: FabricStats::default(),
        }
    }

    pub fn next_id(&mut self) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    pub fn add_device(&mut self, record: DeviceRecord) -> DeviceId {
        let id = DeviceId(self.next_id());
        self.devices.insert(id, record);
        id
    }

    pub fn remove_device(&mut self, id: DeviceId) {
        if let Some(record) = self.devices.get_mut(&id) {
            record.removed = true;
        }
        self.listeners.retain(|(device, _), _| *device != id);
    }

    pub fn device_removed(&self, id: DeviceId) -> bool {
        self.devices.get(&id).map(|d| d.removed).unwrap_or(true)
    }

    pub fn add_endpoint(&mut self, device: DeviceId) -> EndpointId {
        let id = EndpointId(self.next_id());
        self.endpoints.insert(
            id,
            EndpointRecord {
                device,
                inbox: VecDeque::new(),
                epoch: 0,
                running: false,
                permissions: AccessFlags::empty(),
                transport: TransportType::Rc,
                recv_limit: usize::MAX,
                queued_messages: 0,
            },
        );
        id
    }

    pub fn remove_endpoint(&mut self, id: EndpointId) {
        self.endpoints.remove(&id);
        self.listeners.retain(|_, target| *target != ListenTarget::Engine(id));
    }

    pub fn endpoint(&self, id: EndpointId) -> Option<&EndpointRecord> {
        self.endpoints.get(&id)
    }

    pub fn endpoint_mut(&mut self, id: EndpointId) -> Option<&mut EndpointRecord> {
        self.endpoints.get_mut(&id)
    }

    /// Closes every listener owned by the endpoint and discards its inbox.
    pub fn quiesce_endpoint(&mut self, id: EndpointId) {
        self.listeners.retain(|_, target| *target != ListenTarget::Engine(id));
        if let Some(endpoint) = self.endpoints.get_mut(&id) {
            endpoint.running = false;
            endpoint.inbox.clear();
            endpoint.queued_messages = 0;
        }
    }

    /// Queues an event on a running endpoint. Returns false when it is unreachable.
    pub fn deliver(&mut self, to: EndpointId, event: WireEvent) -> bool {
        match self.endpoints.get_mut(&to) {
            Some(endpoint) if endpoint.running => {
                endpoint.inbox.push_back(event);
                self.stats.messages_delivered += 1;
                true
            }
            _ => {
                self.stats.messages_dropped += 1;
                false
            }
        }
    }

    /// Queues a data message, charging it against the receiver's message budget.
    pub fn deliver_message(&mut self, to: EndpointId, message: InboundMessage) -> Result<()> {
        let endpoint = match self.endpoints.get_mut(&to) {
            Some(endpoint) if endpoint.running => endpoint,
            _ => {
                self.stats.messages_dropped += 1;
                return Err(RdmaError::aborted("peer unreachable"));
            }
        };
        if endpoint.queued_messages >= endpoint.recv_limit {
            self.stats.messages_dropped += 1;
            return Err(RdmaError::driver(format!(
                "receiver not ready: {} message(s) queued",
                endpoint.queued_messages
            )));
        }
        endpoint.queued_messages += 1;
        endpoint.inbox.push_back(WireEvent::Message(message));
        self.stats.messages_delivered += 1;
        Ok(())
    }

    /// Returns message budget once queued messages have been consumed or discarded.
    pub fn release_messages(&mut self, id: EndpointId, count: usize) {
        if let Some(endpoint) = self.endpoints.get_mut(&id) {
            endpoint.queued_messages = endpoint.queued_messages.saturating_sub(count);
        }
    }

    pub fn take_inbox(&mut self, id: EndpointId) -> VecDeque<WireEvent> {
        self.endpoints
            .get_mut(&id)
            .map(|endpoint| std::mem::take(&mut endpoint.inbox))
            .unwrap_or_default()
    }

    pub fn listen(&mut self, device: DeviceId, port: u16, target: ListenTarget) -> Result<()> {
        if self.device_removed(device) {
            return Err(RdmaError::driver("device removed"));
        }
        if self.listeners.contains_key(&(device, port)) {
            return Err(RdmaError::driver(format!("port {} already in use", port)));
        }
        debug!(port, ?target, "listening");
        self.listeners.insert((device, port), target);
        Ok(())
    }

    /// Stops listening; returns whether the port was owned by `target`.
    pub fn unlisten(&mut self, device: DeviceId, port: u16, target: ListenTarget) -> bool {
        if self.listeners.get(&(device, port)) == Some(&target) {
            self.listeners.remove(&(device, port));
            true
        } else {
            false
        }
    }

    /// Finds the listener behind an address, if any device owns it.
    pub fn resolve(&self, address: &RdmaAddress) -> Option<ListenTarget> {
        self.devices
            .iter()
            .filter(|(_, record)| !record.removed && record.info.owns(address))
            .find_map(|(id, _)| self.listeners.get(&(*id, address.port())).copied())
    }

    pub fn open_cm_queue(&mut self) -> u64 {
        let id = self.next_id();
        self.cm_queues.insert(id, VecDeque::new());
        id
    }

    pub fn close_cm_queue(&mut self, id: u64) -> VecDeque<PendingRequest> {
        self.cm_queues.remove(&id).unwrap_or_default()
    }

    pub fn push_cm_request(&mut self, queue: u64, request: PendingRequest) -> bool {
        match self.cm_queues.get_mut(&queue) {
            Some(q) => {
                q.push_back(request);
                true
            }
            None => false,
        }
    }

    pub fn pop_cm_request(&mut self, queue: u64) -> Option<PendingRequest> {
        self.cm_queues.get_mut(&queue)?.pop_front()
    }

    pub fn register_region(&mut self, region: &Arc<MemoryRegion>) {
        self.regions.retain(|_, weak| weak.strong_count() > 0);
        self.regions.insert(region.key(), Arc::downgrade(region));
    }

    pub fn unregister_region(&mut self, key: u32) {
        self.regions.remove(&key);
    }

    pub fn region(&mut self, key: u32) -> Option<Arc<MemoryRegion>> {
        let region = self.regions.get(&key)?.upgrade();
        if region.is_none() {
            self.regions.remove(&key);
        }
        region
    }

    pub fn register_sync_event(&mut self, event: &Arc<SyncEvent>) {
        self.sync_events.retain(|_, weak| weak.strong_count() > 0);
        self.sync_events.insert(event.id(), Arc::downgrade(event));
    }

    pub fn sync_event(&mut self, id: u64) -> Option<Arc<SyncEvent>> {
        let event = self.sync_events.get(&id)?.upgrade();
        if event.is_none() {
            self.sync_events.remove(&id);
        }
        event
    }

    /// Consumes one injected failure, if any are pending.
    pub fn take_failure(&mut self) -> bool {
        if self.pending_failures > 0 {
            self.pending_failures -= 1;
            self.stats.injected_failures += 1;
            true
        } else {
            false
        }
    }
}

/// A shared, in-process interconnect. Cloning yields another handle to the same fabric.
#[derive(Clone)]
pub struct Fabric {
    state: Arc<Mutex<FabricState>>,
}

impl Fabric {
    /// An empty fabric with no devices attached.
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(FabricState::new())),
        }
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, FabricState> {
        self.state.lock()
    }

    pub(crate) fn try_lock(&self) -> Option<MutexGuard<'_, FabricState>> {
        self.state.try_lock()
    }

    /// Snapshot of the fabric counters.
    pub fn stats(&self) -> FabricStats {
        self.state.lock().stats.clone()
    }

    /// Makes the next `count` data operations executed on this fabric fail with a
    /// driver error.
    pub fn inject_failures(&self, count: u64) {
        self.state.lock().pending_failures += count;
    }

    pub(crate) fn same(&self, other: &Fabric) -> bool {
        Arc::ptr_eq(&self.state, &other.state)
    }
}

impl Default for Fabric {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Fabric {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("Fabric")
            .field("devices", &state.devices.len())
            .field("endpoints", &state.endpoints.len())
            .field("listeners", &state.listeners.len())
            .field("stats", &state.stats)
            .finish()
    }
}
