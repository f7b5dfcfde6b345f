//! Generic task lifecycle shared by every opcode.
//!
//! A task is a slot in a per-opcode pool. [`Task<P>`] carries the lifecycle status, the
//! caller's tag and the outcome; `P` is the opcode payload from [`crate::ops`]. Callers
//! hold typed [`TaskHandle`]s and convert them into [`TaskRef`]s to hand a task of any
//! opcode to the engine.

use std::marker::PhantomData;

use serde::{Deserialize, Serialize};

use crate::connection::ConnectionId;
use crate::context::Context;
use crate::error::RdmaError;
use crate::exec;

/// Opaque caller-chosen tag attached to tasks, connections and contexts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct UserData(pub u64);

/// 32-bit immediate value, held in network byte order.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ImmData([u8; 4]);

impl ImmData {
    /// Immediate data holding `value`.
    pub fn new(value: u32) -> Self {
        Self(value.to_be_bytes())
    }

    /// Decodes four big-endian bytes.
    pub fn from_be_bytes(bytes: [u8; 4]) -> Self {
        Self(bytes)
    }

    /// The value as a native integer.
    pub fn value(self) -> u32 {
        u32::from_be_bytes(self.0)
    }

    /// The wire representation.
    pub fn to_be_bytes(self) -> [u8; 4] {
        self.0
    }
}

/// Kind of operation a task performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TaskOpcode {
    /// Posted receive.
    Receive,
    /// Two-sided send.
    Send,
    /// Send with immediate data.
    SendImm,
    /// One-sided read.
    Read,
    /// One-sided write.
    Write,
    /// Write with immediate data.
    WriteImm,
    /// Remote compare-and-swap.
    AtomicCmpSwp,
    /// Remote fetch-and-add.
    AtomicFetchAdd,
    /// Read of a peer sync event.
    SyncEventGet,
    /// Set of a peer sync event.
    SyncEventNotifySet,
    /// Add to a peer sync event.
    SyncEventNotifyAdd,
}

impl TaskOpcode {
    /// Every opcode, in declaration order.
    pub const ALL: [TaskOpcode; 11] = [
        TaskOpcode::Receive,
        TaskOpcode::Send,
        TaskOpcode::SendImm,
        TaskOpcode::Read,
        TaskOpcode::Write,
        TaskOpcode::WriteImm,
        TaskOpcode::AtomicCmpSwp,
        TaskOpcode::AtomicFetchAdd,
        TaskOpcode::SyncEventGet,
        TaskOpcode::SyncEventNotifySet,
        TaskOpcode::SyncEventNotifyAdd,
    ];

    /// Receive tasks sit on the receive queue; everything else on the send queue.
    pub fn is_receive(self) -> bool {
        self == TaskOpcode::Receive
    }
}

/// Lifecycle of an allocated task. Free slots have no status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TaskStatus {
    /// Owned by the caller, never submitted.
    Allocated,
    /// Owned by the engine.
    Submitted,
    /// Completion delivered; owned by the caller again.
    Completed,
}

/// Opcode payloads. Sealed: only the payloads in [`crate::ops`] implement it.
pub trait Operation: exec::Sealed + exec::Pooled + Send + Sized + 'static {
    const OPCODE: TaskOpcode;

    /// Connection the task runs on; `None` for receives.
    fn connection(&self) -> Option<ConnectionId>;
}

/// Completion callback: `(context, task, task tag, context tag)`.
///
/// Inside the callback exactly one disposition applies: resubmit the task, free it,
/// or do neither and keep it for later.
pub type TaskCallback<P> = Box<dyn FnMut(&mut Context, TaskHandle<P>, UserData, UserData) + Send>;

/// Typed handle to a task of opcode payload `P`.
pub struct TaskHandle<P> {
    slot: u32,
    generation: u32,
    _op: PhantomData<fn() -> P>,
}

impl<P: Operation> TaskHandle<P> {
    pub(crate) fn new(slot: u32, generation: u32) -> Self {
        Self {
            slot,
            generation,
            _op: PhantomData,
        }
    }

    /// Generic form accepted by `submit` and `free`.
    pub fn as_task(self) -> TaskRef {
        TaskRef {
            opcode: P::OPCODE,
            slot: self.slot,
            generation: self.generation,
        }
    }

    pub(crate) fn slot(self) -> u32 {
        self.slot
    }

    pub(crate) fn generation(self) -> u32 {
        self.generation
    }
}

impl<P> Clone for TaskHandle<P> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<P> Copy for TaskHandle<P> {}

impl<P> PartialEq for TaskHandle<P> {
    fn eq(&self, other: &Self) -> bool {
        self.slot == other.slot && self.generation == other.generation
    }
}

impl<P> Eq for TaskHandle<P> {}

impl<P> std::hash::Hash for TaskHandle<P> {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.slot.hash(state);
        self.generation.hash(state);
    }
}

impl<P> std::fmt::Debug for TaskHandle<P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskHandle")
            .field("op", &std::any::type_name::<P>())
            .field("slot", &self.slot)
            .field("generation", &self.generation)
            .finish()
    }
}

/// Opcode-erased task handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TaskRef {
    opcode: TaskOpcode,
    slot: u32,
    generation: u32,
}

impl TaskRef {
    /// Opcode of the payload type.
    pub fn opcode(self) -> TaskOpcode {
        self.opcode
    }

    /// Recovers the typed handle when the opcode matches `P`.
    pub fn downcast<P: Operation>(self) -> Option<TaskHandle<P>> {
        (self.opcode == P::OPCODE).then(|| TaskHandle::new(self.slot, self.generation))
    }
}

impl<P: Operation> From<TaskHandle<P>> for TaskRef {
    fn from(handle: TaskHandle<P>) -> Self {
        handle.as_task()
    }
}

/// An allocated task: lifecycle, tag, payload and last outcome.
#[derive(Debug)]
pub struct Task<P> {
    pub(crate) tag: UserData,
    pub(crate) status: TaskStatus,
    pub(crate) op: P,
    pub(crate) outcome: Option<Result<(), RdmaError>>,
}

impl<P> Task<P> {
    pub(crate) fn new(op: P, tag: UserData) -> Self {
        Self {
            tag,
            status: TaskStatus::Allocated,
            op,
            outcome: None,
        }
    }

    /// Tag handed to the completion callbacks.
    pub fn tag(&self) -> UserData {
        self.tag
    }

    /// Replaces the tag.
    pub fn set_tag(&mut self, tag: UserData) {
        self.tag = tag;
    }

    /// Where the task is in its lifecycle.
    pub fn status(&self) -> TaskStatus {
        self.status
    }

    /// The payload.
    pub fn op(&self) -> &P {
        &self.op
    }

    /// Mutable payload; only while the caller owns the task.
    pub fn op_mut(&mut self) -> &mut P {
        &mut self.op
    }

    /// Outcome of the last completion, `None` before the first one.
    pub fn outcome(&self) -> Option<&Result<(), RdmaError>> {
        self.outcome.as_ref()
    }

    /// The error of the last completion, if it failed.
    pub fn error(&self) -> Option<&RdmaError> {
        self.outcome.as_ref().and_then(|o| o.as_ref().err())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ops::{Receive, Send as SendOp};

    #[test]
    fn test_imm_data_is_big_endian() {
        let imm = ImmData::new(0x0102_0304);
        assert_eq!(imm.to_be_bytes(), [1, 2, 3, 4]);
        assert_eq!(imm.value(), 0x0102_0304);
        assert_eq!(ImmData::from_be_bytes([0, 0, 0, 7]).value(), 7);
    }

    #[test]
    fn test_handle_roundtrip_through_ref() {
        let handle: TaskHandle<SendOp> = TaskHandle::new(3, 9);
        let task = handle.as_task();
        assert_eq!(task.opcode(), TaskOpcode::Send);
        assert_eq!(task.downcast::<SendOp>(), Some(handle));
        assert!(task.downcast::<Receive>().is_none());
        assert_eq!(TaskRef::from(handle), task);
    }

    #[test]
    fn test_opcode_table() {
        assert_eq!(TaskOpcode::ALL.len(), 11);
        assert!(TaskOpcode::Receive.is_receive());
        assert!(!TaskOpcode::WriteImm.is_receive());
    }

    #[test]
    fn test_task_accessors() {
        let mut task = Task::new(7u32, UserData(5));
        assert_eq!(task.status(), TaskStatus::Allocated);
        assert_eq!(task.tag(), UserData(5));
        task.set_tag(UserData(6));
        *task.op_mut() += 1;
        assert_eq!(*task.op(), 8);
        assert!(task.outcome().is_none());
        task.outcome = Some(Err(RdmaError::aborted("gone")));
        assert!(task.error().is_some());
    }
}
