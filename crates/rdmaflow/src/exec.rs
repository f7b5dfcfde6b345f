//! Crate-private execution plumbing: per-opcode pools and the sealed traits behind
//! [`crate::Operation`].

use std::sync::Arc;

use crate::buffer::{MemoryRegion, RemoteBuf};
use crate::config::AccessFlags;
use crate::error::{RdmaError, Result};
use crate::fabric::{DeviceId, FabricState, InboundMessage, MessageKind, PeerRef};
use crate::ops;
use crate::sync_event::{RemoteSyncEvent, SyncEvent};
use crate::task::{ImmData, Operation, Task, TaskCallback, TaskHandle, UserData};

/// Per-opcode behavior, implemented in [`crate::ops`].
pub trait Sealed: Sized {
    /// Operand checks run at allocation and again at submission.
    fn validate(&self, limits: &Limits) -> Result<()>;

    /// Performs the operation against the peer. Returns bytes transferred.
    fn execute(&mut self, env: &mut ExecEnv<'_>) -> Result<u64>;
}

/// Access to the pool that holds tasks of this payload.
pub trait Pooled: Sized {
    fn pool(pools: &TaskPools) -> Option<&TaskPool<Self>>;
    fn pool_mut(pools: &mut TaskPools) -> &mut Option<TaskPool<Self>>;
}

/// Limits operand validation is checked against.
#[derive(Debug, Clone, Copy)]
pub struct Limits {
    pub max_send_buf_list_len: usize,
    pub recv_buf_list_len: usize,
    pub max_message_size: u64,
}

struct PoolSlot<P> {
    generation: u32,
    task: Option<Task<P>>,
}

/// Fixed-capacity arena of tasks of one opcode.
pub struct TaskPool<P> {
    slots: Vec<PoolSlot<P>>,
    free: Vec<u32>,
    pub(crate) on_success: Option<TaskCallback<P>>,
    pub(crate) on_error: Option<TaskCallback<P>>,
}

impl<P: Operation> TaskPool<P> {
    pub(crate) fn new(capacity: u32, on_success: TaskCallback<P>, on_error: TaskCallback<P>) -> Self {
        Self {
            slots: (0..capacity)
                .map(|_| PoolSlot {
                    generation: 0,
                    task: None,
                })
                .collect(),
            free: (0..capacity).rev().collect(),
            on_success: Some(on_success),
            on_error: Some(on_error),
        }
    }

    pub(crate) fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Slots currently holding a task, whatever its status.
    pub(crate) fn allocated(&self) -> usize {
        self.slots.len() - self.free.len()
    }

    pub(crate) fn alloc(&mut self, op: P, tag: UserData) -> Result<TaskHandle<P>> {
        let capacity = self.capacity();
        let slot = self.free.pop().ok_or(RdmaError::ResourceExhausted {
            resource: "task pool",
            capacity,
        })?;
        let entry = &mut self.slots[slot as usize];
        entry.task = Some(Task::new(op, tag));
        Ok(TaskHandle::new(slot, entry.generation))
    }

    pub(crate) fn get(&self, handle: TaskHandle<P>) -> Option<&Task<P>> {
        let entry = self.slots.get(handle.slot() as usize)?;
        if entry.generation != handle.generation() {
            return None;
        }
        entry.task.as_ref()
    }

    pub(crate) fn get_mut(&mut self, handle: TaskHandle<P>) -> Option<&mut Task<P>> {
        let entry = self.slots.get_mut(handle.slot() as usize)?;
        if entry.generation != handle.generation() {
            return None;
        }
        entry.task.as_mut()
    }

    /// Returns the slot to the free list; the handle goes stale.
    pub(crate) fn release(&mut self, handle: TaskHandle<P>) -> Option<Task<P>> {
        let entry = self.slots.get_mut(handle.slot() as usize)?;
        if entry.generation != handle.generation() {
            return None;
        }
        let task = entry.task.take()?;
        entry.generation = entry.generation.wrapping_add(1);
        self.free.push(handle.slot());
        Some(task)
    }
}

macro_rules! task_pools {
    ($($field:ident: $op:ident),* $(,)?) => {
        /// One optional pool per opcode; `None` until configured.
        #[derive(Default)]
        pub struct TaskPools {
            $(pub(crate) $field: Option<TaskPool<ops::$op>>,)*
        }

        impl TaskPools {
            pub(crate) fn configured(&self) -> usize {
                0 $(+ self.$field.is_some() as usize)*
            }

            /// Slots holding tasks across every pool.
            pub(crate) fn allocated(&self) -> usize {
                0 $(+ self.$field.as_ref().map(|p| p.allocated()).unwrap_or(0))*
            }
        }

        $(
            impl Pooled for ops::$op {
                fn pool(pools: &TaskPools) -> Option<&TaskPool<Self>> {
                    pools.$field.as_ref()
                }

                fn pool_mut(pools: &mut TaskPools) -> &mut Option<TaskPool<Self>> {
                    &mut pools.$field
                }
            }
        )*
    };
}

task_pools! {
    receive: Receive,
    send: Send,
    send_imm: SendImm,
    read: Read,
    write: Write,
    write_imm: WriteImm,
    atomic_cmp_swp: AtomicCmpSwp,
    atomic_fetch_add: AtomicFetchAdd,
    sync_event_get: SyncEventGet,
    sync_event_notify_set: SyncEventNotifySet,
    sync_event_notify_add: SyncEventNotifyAdd,
}

/// Runs `$body` with `$P` bound to the payload type of `$opcode`.
macro_rules! for_opcode {
    ($opcode:expr, $P:ident => $body:expr) => {{
        use $crate::task::TaskOpcode as Opcode;
        match $opcode {
            Opcode::Receive => {
                type $P = $crate::ops::Receive;
                $body
            }
            Opcode::Send => {
                type $P = $crate::ops::Send;
                $body
            }
            Opcode::SendImm => {
                type $P = $crate::ops::SendImm;
                $body
            }
            Opcode::Read => {
                type $P = $crate::ops::Read;
                $body
            }
            Opcode::Write => {
                type $P = $crate::ops::Write;
                $body
            }
            Opcode::WriteImm => {
                type $P = $crate::ops::WriteImm;
                $body
            }
            Opcode::AtomicCmpSwp => {
                type $P = $crate::ops::AtomicCmpSwp;
                $body
            }
            Opcode::AtomicFetchAdd => {
                type $P = $crate::ops::AtomicFetchAdd;
                $body
            }
            Opcode::SyncEventGet => {
                type $P = $crate::ops::SyncEventGet;
                $body
            }
            Opcode::SyncEventNotifySet => {
                type $P = $crate::ops::SyncEventNotifySet;
                $body
            }
            Opcode::SyncEventNotifyAdd => {
                type $P = $crate::ops::SyncEventNotifyAdd;
                $body
            }
        }
    }};
}

pub(crate) use for_opcode;

/// What an executing task sees of the fabric.
pub struct ExecEnv<'a> {
    pub(crate) fabric: &'a mut FabricState,
    pub(crate) peer: PeerRef,
}

impl<'a> ExecEnv<'a> {
    pub(crate) fn new(fabric: &'a mut FabricState, peer: PeerRef) -> Self {
        Self { fabric, peer }
    }

    fn peer_access(&self, need: AccessFlags) -> Result<DeviceId> {
        match self.fabric.endpoint(self.peer.endpoint) {
            Some(endpoint) if endpoint.running => {
                if endpoint.permissions.contains(need) {
                    Ok(endpoint.device)
                } else {
                    Err(RdmaError::driver(format!(
                        "remote access error: peer does not grant {:?}",
                        need
                    )))
                }
            }
            _ => Err(RdmaError::aborted("peer unreachable")),
        }
    }

    /// Looks up a peer region and checks it may be accessed with `need` over the
    /// given range.
    pub(crate) fn remote_region(&mut self, remote: &RemoteBuf, need: AccessFlags) -> Result<(Arc<MemoryRegion>, usize)> {
        let device = match self.peer_access(need) {
            Ok(device) => device,
            Err(e) => {
                self.fabric.stats.remote_op_errors += 1;
                return Err(e);
            }
        };
        let region = self.fabric.region(remote.key);
        let checked = match region {
            None => Err(RdmaError::driver(format!("remote access error: unknown key {:#x}", remote.key))),
            Some(region) if region.device() != device => Err(RdmaError::driver(format!(
                "remote access error: key {:#x} not registered on the peer device",
                remote.key
            ))),
            Some(region) if !region.access().contains(need) => Err(RdmaError::driver(format!(
                "remote access error: key {:#x} does not allow {:?}",
                remote.key, need
            ))),
            Some(region) => in_range(remote, region.len()).map(|offset| (region, offset)),
        };
        match checked {
            Ok(found) => {
                self.fabric.stats.remote_ops += 1;
                Ok(found)
            }
            Err(e) => {
                self.fabric.stats.remote_op_errors += 1;
                Err(e)
            }
        }
    }

    pub(crate) fn remote_event(&mut self, remote: &RemoteSyncEvent, need: AccessFlags) -> Result<Arc<SyncEvent>> {
        let device = match self.peer_access(need) {
            Ok(device) => device,
            Err(e) => {
                self.fabric.stats.remote_op_errors += 1;
                return Err(e);
            }
        };
        match self.fabric.sync_event(remote.id) {
            Some(event) if event.device() == device => {
                self.fabric.stats.remote_ops += 1;
                Ok(event)
            }
            _ => {
                self.fabric.stats.remote_op_errors += 1;
                Err(RdmaError::driver(format!(
                    "remote access error: unknown sync event {}",
                    remote.id
                )))
            }
        }
    }

    /// Sends a message to the peer connection.
    pub(crate) fn deliver(&mut self, kind: MessageKind, imm: Option<ImmData>, payload: Vec<u8>, len: u64) -> Result<()> {
        let message = InboundMessage {
            to: self.peer.conn,
            kind,
            imm,
            payload,
            len,
        };
        self.fabric.deliver_message(self.peer.endpoint, message)?;
        self.fabric.stats.bytes_moved += len;
        Ok(())
    }

    pub(crate) fn moved(&mut self, bytes: u64) {
        self.fabric.stats.bytes_moved += bytes;
    }
}

fn in_range(remote: &RemoteBuf, region_len: usize) -> Result<usize> {
    let offset = usize::try_from(remote.offset).ok();
    let len = usize::try_from(remote.len).ok();
    match (offset, len) {
        (Some(offset), Some(len)) if offset.checked_add(len).map(|end| end <= region_len).unwrap_or(false) => {
            Ok(offset)
        }
        _ => Err(RdmaError::driver(format!(
            "remote access error: {}+{} outside region of {} bytes",
            remote.offset, remote.len, region_len
        ))),
    }
}
