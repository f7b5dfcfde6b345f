//! Opcode payloads.
//!
//! Each payload holds the operands of one kind of task and, after completion, its
//! results. Operands can be changed through setters whenever the caller owns the
//! task; they are validated at allocation and again at submission.

use serde::{Deserialize, Serialize};

use crate::buffer::{BufList, BufRef, RemoteBuf};
use crate::config::AccessFlags;
use crate::connection::ConnectionId;
use crate::error::{RdmaError, Result};
use crate::exec::{ExecEnv, Limits, Sealed};
use crate::fabric::{InboundMessage, MessageKind};
use crate::sync_event::RemoteSyncEvent;
use crate::task::{ImmData, Operation, TaskOpcode};

/// How the data landing in a receive task arrived.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RecvOpcode {
    /// A send.
    RecvSend,
    /// A send with immediate data.
    RecvSendWithImm,
    /// A remote write with immediate data; only the length and immediate land here.
    RecvWriteWithImm,
}

fn check_local_list(list: &BufList, max: usize, what: &str) -> Result<()> {
    if list.is_empty() {
        return Err(RdmaError::invalid(format!("{} buffer list is empty", what)));
    }
    if list.len() > max {
        return Err(RdmaError::invalid(format!(
            "{} buffer list of {} exceeds limit {}",
            what,
            list.len(),
            max
        )));
    }
    Ok(())
}

fn check_message_size(len: u64, limits: &Limits) -> Result<()> {
    if len > limits.max_message_size {
        return Err(RdmaError::invalid(format!(
            "message of {} bytes exceeds maximum {}",
            len, limits.max_message_size
        )));
    }
    Ok(())
}

fn check_word_dst(buf: &BufRef, what: &str) -> Result<()> {
    if buf.free_len() < 8 {
        return Err(RdmaError::invalid(format!(
            "{} buffer needs 8 free bytes, has {}",
            what,
            buf.free_len()
        )));
    }
    Ok(())
}

fn check_word_remote(remote: &RemoteBuf) -> Result<()> {
    if remote.len != 8 {
        return Err(RdmaError::invalid(format!(
            "atomic target must be 8 bytes, got {}",
            remote.len
        )));
    }
    Ok(())
}

/// Receives a message sent by a peer, or the notification of a write with immediate.
#[derive(Debug, Clone, Default)]
pub struct Receive {
    dst: Option<BufList>,
    result_len: u64,
    result_opcode: Option<RecvOpcode>,
    result_imm: Option<ImmData>,
    result_conn: Option<ConnectionId>,
}

impl Receive {
    /// `None` accepts only empty messages and writes with immediate.
    pub fn new(dst: Option<BufList>) -> Self {
        Self {
            dst,
            ..Self::default()
        }
    }

    /// Where landed data goes; `None` accepts only zero-length messages.
    pub fn dst(&self) -> Option<&BufList> {
        self.dst.as_ref()
    }

    /// Mutable destination, if any.
    pub fn dst_mut(&mut self) -> Option<&mut BufList> {
        self.dst.as_mut()
    }

    /// Replaces the destination.
    pub fn set_dst(&mut self, dst: Option<BufList>) {
        self.dst = dst;
    }

    /// Bytes landed by the last completion.
    pub fn result_len(&self) -> u64 {
        self.result_len
    }

    /// How the last message arrived.
    pub fn result_opcode(&self) -> Option<RecvOpcode> {
        self.result_opcode
    }

    /// Immediate data of the last completion. Only meaningful once completed.
    pub fn result_immediate(&self) -> Option<ImmData> {
        self.result_imm
    }

    /// Connection the last message arrived on.
    pub fn result_connection(&self) -> Option<ConnectionId> {
        self.result_conn
    }

    pub(crate) fn deliver(&mut self, message: &InboundMessage) -> Result<u64> {
        self.result_conn = Some(message.to);
        self.result_imm = message.imm;
        self.result_len = 0;
        self.result_opcode = Some(match message.kind {
            MessageKind::Send => RecvOpcode::RecvSend,
            MessageKind::SendImm => RecvOpcode::RecvSendWithImm,
            MessageKind::WriteImm => RecvOpcode::RecvWriteWithImm,
        });
        if message.kind == MessageKind::WriteImm {
            self.result_len = message.len;
            return Ok(0);
        }
        if !message.payload.is_empty() {
            match self.dst.as_mut() {
                Some(dst) => dst.scatter(&message.payload)?,
                None => {
                    return Err(RdmaError::driver(format!(
                        "local length error: {} byte message into receive without buffer",
                        message.payload.len()
                    )))
                }
            }
        }
        self.result_len = message.payload.len() as u64;
        Ok(self.result_len)
    }
}

impl Sealed for Receive {
    fn validate(&self, limits: &Limits) -> Result<()> {
        match &self.dst {
            Some(dst) => check_local_list(dst, limits.recv_buf_list_len, "receive"),
            None => Ok(()),
        }
    }

    fn execute(&mut self, _env: &mut ExecEnv<'_>) -> Result<u64> {
        Err(RdmaError::unexpected("receive tasks are matched, not executed"))
    }
}

impl Operation for Receive {
    const OPCODE: TaskOpcode = TaskOpcode::Receive;

    fn connection(&self) -> Option<ConnectionId> {
        None
    }
}

/// Sends the data of `src` to the peer's next posted receive.
#[derive(Debug, Clone)]
pub struct Send {
    conn: ConnectionId,
    src: BufList,
}

impl Send {
    /// Sends the data segment of `src` to the peer.
    pub fn new(conn: ConnectionId, src: impl Into<BufList>) -> Self {
        Self {
            conn,
            src: src.into(),
        }
    }

    /// Connection the task runs on.
    pub fn conn(&self) -> ConnectionId {
        self.conn
    }

    /// Moves the task to another connection.
    pub fn set_conn(&mut self, conn: ConnectionId) {
        self.conn = conn;
    }

    /// Source of the operation.
    pub fn src(&self) -> &BufList {
        &self.src
    }

    /// Mutable source buffers.
    pub fn src_mut(&mut self) -> &mut BufList {
        &mut self.src
    }

    /// Replaces the source.
    pub fn set_src(&mut self, src: impl Into<BufList>) {
        self.src = src.into();
    }
}

impl Sealed for Send {
    fn validate(&self, limits: &Limits) -> Result<()> {
        check_local_list(&self.src, limits.max_send_buf_list_len, "send source")?;
        check_message_size(self.src.data_len() as u64, limits)
    }

    fn execute(&mut self, env: &mut ExecEnv<'_>) -> Result<u64> {
        let payload = self.src.gather();
        let len = payload.len() as u64;
        env.deliver(MessageKind::Send, None, payload, len)?;
        Ok(len)
    }
}

impl Operation for Send {
    const OPCODE: TaskOpcode = TaskOpcode::Send;

    fn connection(&self) -> Option<ConnectionId> {
        Some(self.conn)
    }
}

/// A send carrying 32 bits of immediate data.
#[derive(Debug, Clone)]
pub struct SendImm {
    conn: ConnectionId,
    src: BufList,
    imm: ImmData,
}

impl SendImm {
    /// Sends `src` with immediate data.
    pub fn new(conn: ConnectionId, src: impl Into<BufList>, imm: ImmData) -> Self {
        Self {
            conn,
            src: src.into(),
            imm,
        }
    }

    /// Connection the task runs on.
    pub fn conn(&self) -> ConnectionId {
        self.conn
    }

    /// Moves the task to another connection.
    pub fn set_conn(&mut self, conn: ConnectionId) {
        self.conn = conn;
    }

    /// Source of the operation.
    pub fn src(&self) -> &BufList {
        &self.src
    }

    /// Replaces the source.
    pub fn set_src(&mut self, src: impl Into<BufList>) {
        self.src = src.into();
    }

    /// Immediate data sent with the payload.
    pub fn immediate(&self) -> ImmData {
        self.imm
    }

    /// Replaces the immediate data.
    pub fn set_immediate(&mut self, imm: ImmData) {
        self.imm = imm;
    }
}

impl Sealed for SendImm {
    fn validate(&self, limits: &Limits) -> Result<()> {
        check_local_list(&self.src, limits.max_send_buf_list_len, "send source")?;
        check_message_size(self.src.data_len() as u64, limits)
    }

    fn execute(&mut self, env: &mut ExecEnv<'_>) -> Result<u64> {
        let payload = self.src.gather();
        let len = payload.len() as u64;
        env.deliver(MessageKind::SendImm, Some(self.imm), payload, len)?;
        Ok(len)
    }
}

impl Operation for SendImm {
    const OPCODE: TaskOpcode = TaskOpcode::SendImm;

    fn connection(&self) -> Option<ConnectionId> {
        Some(self.conn)
    }
}

/// Reads peer memory into local buffers.
#[derive(Debug, Clone)]
pub struct Read {
    conn: ConnectionId,
    src: RemoteBuf,
    dst: BufList,
    result_len: u64,
}

impl Read {
    /// Reads `src` from peer memory into `dst`.
    pub fn new(conn: ConnectionId, src: RemoteBuf, dst: impl Into<BufList>) -> Self {
        Self {
            conn,
            src,
            dst: dst.into(),
            result_len: 0,
        }
    }

    /// Connection the task runs on.
    pub fn conn(&self) -> ConnectionId {
        self.conn
    }

    /// Moves the task to another connection.
    pub fn set_conn(&mut self, conn: ConnectionId) {
        self.conn = conn;
    }

    /// Source of the operation.
    pub fn src(&self) -> RemoteBuf {
        self.src
    }

    /// Replaces the source.
    pub fn set_src(&mut self, src: RemoteBuf) {
        self.src = src;
    }

    /// Destination of the operation.
    pub fn dst(&self) -> &BufList {
        &self.dst
    }

    /// Mutable destination buffers.
    pub fn dst_mut(&mut self) -> &mut BufList {
        &mut self.dst
    }

    /// Replaces the destination.
    pub fn set_dst(&mut self, dst: impl Into<BufList>) {
        self.dst = dst.into();
    }

    /// Bytes read by the last completion.
    pub fn result_len(&self) -> u64 {
        self.result_len
    }
}

impl Sealed for Read {
    fn validate(&self, limits: &Limits) -> Result<()> {
        check_local_list(&self.dst, limits.max_send_buf_list_len, "read destination")?;
        check_message_size(self.src.len, limits)?;
        if (self.dst.free_len() as u64) < self.src.len {
            return Err(RdmaError::invalid(format!(
                "read of {} bytes into {} free",
                self.src.len,
                self.dst.free_len()
            )));
        }
        Ok(())
    }

    fn execute(&mut self, env: &mut ExecEnv<'_>) -> Result<u64> {
        self.result_len = 0;
        let (region, offset) = env.remote_region(&self.src, AccessFlags::REMOTE_READ)?;
        let bytes = region
            .read_at(offset, self.src.len as usize)
            .ok_or_else(|| RdmaError::driver("remote access error: read out of range"))?;
        self.dst.scatter(&bytes)?;
        env.moved(bytes.len() as u64);
        self.result_len = bytes.len() as u64;
        Ok(self.result_len)
    }
}

impl Operation for Read {
    const OPCODE: TaskOpcode = TaskOpcode::Read;

    fn connection(&self) -> Option<ConnectionId> {
        Some(self.conn)
    }
}

fn write_remote(env: &mut ExecEnv<'_>, src: &BufList, dst: &RemoteBuf) -> Result<u64> {
    let payload = src.gather();
    let (region, offset) = env.remote_region(dst, AccessFlags::REMOTE_WRITE)?;
    if !region.write_at(offset, &payload) {
        return Err(RdmaError::driver("remote access error: write out of range"));
    }
    env.moved(payload.len() as u64);
    Ok(payload.len() as u64)
}

fn check_write(src: &BufList, dst: &RemoteBuf, limits: &Limits) -> Result<()> {
    check_local_list(src, limits.max_send_buf_list_len, "write source")?;
    check_message_size(src.data_len() as u64, limits)?;
    if src.data_len() as u64 > dst.len {
        return Err(RdmaError::invalid(format!(
            "write of {} bytes into remote buffer of {}",
            src.data_len(),
            dst.len
        )));
    }
    Ok(())
}

/// Writes local data into peer memory.
#[derive(Debug, Clone)]
pub struct Write {
    conn: ConnectionId,
    src: BufList,
    dst: RemoteBuf,
}

impl Write {
    /// Writes `src` into peer memory at `dst`.
    pub fn new(conn: ConnectionId, src: impl Into<BufList>, dst: RemoteBuf) -> Self {
        Self {
            conn,
            src: src.into(),
            dst,
        }
    }

    /// Connection the task runs on.
    pub fn conn(&self) -> ConnectionId {
        self.conn
    }

    /// Moves the task to another connection.
    pub fn set_conn(&mut self, conn: ConnectionId) {
        self.conn = conn;
    }

    /// Source of the operation.
    pub fn src(&self) -> &BufList {
        &self.src
    }

    /// Replaces the source.
    pub fn set_src(&mut self, src: impl Into<BufList>) {
        self.src = src.into();
    }

    /// Destination of the operation.
    pub fn dst(&self) -> RemoteBuf {
        self.dst
    }

    /// Replaces the destination.
    pub fn set_dst(&mut self, dst: RemoteBuf) {
        self.dst = dst;
    }
}

impl Sealed for Write {
    fn validate(&self, limits: &Limits) -> Result<()> {
        check_write(&self.src, &self.dst, limits)
    }

    fn execute(&mut self, env: &mut ExecEnv<'_>) -> Result<u64> {
        write_remote(env, &self.src, &self.dst)
    }
}

impl Operation for Write {
    const OPCODE: TaskOpcode = TaskOpcode::Write;

    fn connection(&self) -> Option<ConnectionId> {
        Some(self.conn)
    }
}

/// A write that also completes the peer's next receive with immediate data.
#[derive(Debug, Clone)]
pub struct WriteImm {
    conn: ConnectionId,
    src: BufList,
    dst: RemoteBuf,
    imm: ImmData,
}

impl WriteImm {
    /// Writes `src` into peer memory and notifies a posted receive with `imm`.
    pub fn new(conn: ConnectionId, src: impl Into<BufList>, dst: RemoteBuf, imm: ImmData) -> Self {
        Self {
            conn,
            src: src.into(),
            dst,
            imm,
        }
    }

    /// Connection the task runs on.
    pub fn conn(&self) -> ConnectionId {
        self.conn
    }

    /// Moves the task to another connection.
    pub fn set_conn(&mut self, conn: ConnectionId) {
        self.conn = conn;
    }

    /// Source of the operation.
    pub fn src(&self) -> &BufList {
        &self.src
    }

    /// Replaces the source.
    pub fn set_src(&mut self, src: impl Into<BufList>) {
        self.src = src.into();
    }

    /// Destination of the operation.
    pub fn dst(&self) -> RemoteBuf {
        self.dst
    }

    /// Replaces the destination.
    pub fn set_dst(&mut self, dst: RemoteBuf) {
        self.dst = dst;
    }

    /// Immediate data sent with the payload.
    pub fn immediate(&self) -> ImmData {
        self.imm
    }

    /// Replaces the immediate data.
    pub fn set_immediate(&mut self, imm: ImmData) {
        self.imm = imm;
    }
}

impl Sealed for WriteImm {
    fn validate(&self, limits: &Limits) -> Result<()> {
        check_write(&self.src, &self.dst, limits)
    }

    fn execute(&mut self, env: &mut ExecEnv<'_>) -> Result<u64> {
        let written = write_remote(env, &self.src, &self.dst)?;
        env.deliver(MessageKind::WriteImm, Some(self.imm), Vec::new(), written)?;
        Ok(written)
    }
}

impl Operation for WriteImm {
    const OPCODE: TaskOpcode = TaskOpcode::WriteImm;

    fn connection(&self) -> Option<ConnectionId> {
        Some(self.conn)
    }
}

/// Atomic compare-and-swap on an 8-byte peer cell.
#[derive(Debug, Clone)]
pub struct AtomicCmpSwp {
    conn: ConnectionId,
    dst: RemoteBuf,
    result: BufRef,
    cmp: u64,
    swap: u64,
    fetched: Option<u64>,
}

impl AtomicCmpSwp {
    /// Compare-and-swap on the 8-byte word at `dst`; the old value lands in `result`.
    pub fn new(conn: ConnectionId, dst: RemoteBuf, result: BufRef, cmp: u64, swap: u64) -> Self {
        Self {
            conn,
            dst,
            result,
            cmp,
            swap,
            fetched: None,
        }
    }

    /// Connection the task runs on.
    pub fn conn(&self) -> ConnectionId {
        self.conn
    }

    /// Moves the task to another connection.
    pub fn set_conn(&mut self, conn: ConnectionId) {
        self.conn = conn;
    }

    /// Destination of the operation.
    pub fn dst(&self) -> RemoteBuf {
        self.dst
    }

    /// Replaces the destination.
    pub fn set_dst(&mut self, dst: RemoteBuf) {
        self.dst = dst;
    }

    /// Receives the pre-operation value of the cell.
    pub fn result_buf(&self) -> &BufRef {
        &self.result
    }

    /// Replaces the buffer the old value lands in.
    pub fn set_result_buf(&mut self, result: BufRef) {
        self.result = result;
    }

    /// Value compared against.
    pub fn compare(&self) -> u64 {
        self.cmp
    }

    /// Replaces the compare value.
    pub fn set_compare(&mut self, cmp: u64) {
        self.cmp = cmp;
    }

    /// Value swapped in on a match.
    pub fn swap(&self) -> u64 {
        self.swap
    }

    /// Replaces the swap value.
    pub fn set_swap(&mut self, swap: u64) {
        self.swap = swap;
    }

    /// Value the cell held before the last completed operation.
    pub fn fetched(&self) -> Option<u64> {
        self.fetched
    }
}

impl Sealed for AtomicCmpSwp {
    fn validate(&self, _limits: &Limits) -> Result<()> {
        check_word_remote(&self.dst)?;
        check_word_dst(&self.result, "compare-and-swap result")
    }

    fn execute(&mut self, env: &mut ExecEnv<'_>) -> Result<u64> {
        self.fetched = None;
        let (region, offset) = env.remote_region(&self.dst, AccessFlags::REMOTE_ATOMIC)?;
        let old = region
            .compare_swap(offset, self.cmp, self.swap)
            .ok_or_else(|| RdmaError::driver("remote access error: atomic out of range"))?;
        self.result.append(&old.to_ne_bytes())?;
        self.fetched = Some(old);
        Ok(8)
    }
}

impl Operation for AtomicCmpSwp {
    const OPCODE: TaskOpcode = TaskOpcode::AtomicCmpSwp;

    fn connection(&self) -> Option<ConnectionId> {
        Some(self.conn)
    }
}

/// Atomic wrapping add on an 8-byte peer cell.
#[derive(Debug, Clone)]
pub struct AtomicFetchAdd {
    conn: ConnectionId,
    dst: RemoteBuf,
    result: BufRef,
    add: u64,
    fetched: Option<u64>,
}

impl AtomicFetchAdd {
    /// Fetch-and-add on the 8-byte word at `dst`; the old value lands in `result`.
    pub fn new(conn: ConnectionId, dst: RemoteBuf, result: BufRef, add: u64) -> Self {
        Self {
            conn,
            dst,
            result,
            add,
            fetched: None,
        }
    }

    /// Connection the task runs on.
    pub fn conn(&self) -> ConnectionId {
        self.conn
    }

    /// Moves the task to another connection.
    pub fn set_conn(&mut self, conn: ConnectionId) {
        self.conn = conn;
    }

    /// Destination of the operation.
    pub fn dst(&self) -> RemoteBuf {
        self.dst
    }

    /// Replaces the destination.
    pub fn set_dst(&mut self, dst: RemoteBuf) {
        self.dst = dst;
    }

    /// Buffer the old value lands in.
    pub fn result_buf(&self) -> &BufRef {
        &self.result
    }

    /// Replaces the buffer the old value lands in.
    pub fn set_result_buf(&mut self, result: BufRef) {
        self.result = result;
    }

    /// Value added.
    pub fn add(&self) -> u64 {
        self.add
    }

    /// Replaces the value added.
    pub fn set_add(&mut self, add: u64) {
        self.add = add;
    }

    /// Old value, once the task succeeded.
    pub fn fetched(&self) -> Option<u64> {
        self.fetched
    }
}

impl Sealed for AtomicFetchAdd {
    fn validate(&self, _limits: &Limits) -> Result<()> {
        check_word_remote(&self.dst)?;
        check_word_dst(&self.result, "fetch-and-add result")
    }

    fn execute(&mut self, env: &mut ExecEnv<'_>) -> Result<u64> {
        self.fetched = None;
        let (region, offset) = env.remote_region(&self.dst, AccessFlags::REMOTE_ATOMIC)?;
        let old = region
            .fetch_add(offset, self.add)
            .ok_or_else(|| RdmaError::driver("remote access error: atomic out of range"))?;
        self.result.append(&old.to_ne_bytes())?;
        self.fetched = Some(old);
        Ok(8)
    }
}

impl Operation for AtomicFetchAdd {
    const OPCODE: TaskOpcode = TaskOpcode::AtomicFetchAdd;

    fn connection(&self) -> Option<ConnectionId> {
        Some(self.conn)
    }
}

/// Reads a peer sync event into a local 8-byte buffer.
#[derive(Debug, Clone)]
pub struct SyncEventGet {
    conn: ConnectionId,
    event: RemoteSyncEvent,
    dst: BufRef,
    result_len: u64,
}

impl SyncEventGet {
    /// Reads the peer event value into `dst`.
    pub fn new(conn: ConnectionId, event: RemoteSyncEvent, dst: BufRef) -> Self {
        Self {
            conn,
            event,
            dst,
            result_len: 0,
        }
    }

    /// Connection the task runs on.
    pub fn conn(&self) -> ConnectionId {
        self.conn
    }

    /// Moves the task to another connection.
    pub fn set_conn(&mut self, conn: ConnectionId) {
        self.conn = conn;
    }

    /// Peer event addressed.
    pub fn event(&self) -> RemoteSyncEvent {
        self.event
    }

    /// Addresses another peer event.
    pub fn set_event(&mut self, event: RemoteSyncEvent) {
        self.event = event;
    }

    /// Destination of the operation.
    pub fn dst(&self) -> &BufRef {
        &self.dst
    }

    /// Replaces the destination.
    pub fn set_dst(&mut self, dst: BufRef) {
        self.dst = dst;
    }

    /// Bytes landed by the last completion.
    pub fn result_len(&self) -> u64 {
        self.result_len
    }
}

impl Sealed for SyncEventGet {
    fn validate(&self, _limits: &Limits) -> Result<()> {
        check_word_dst(&self.dst, "sync event get destination")
    }

    fn execute(&mut self, env: &mut ExecEnv<'_>) -> Result<u64> {
        self.result_len = 0;
        let event = env.remote_event(&self.event, AccessFlags::REMOTE_READ)?;
        self.dst.append(&event.value().to_ne_bytes())?;
        self.result_len = 8;
        Ok(8)
    }
}

impl Operation for SyncEventGet {
    const OPCODE: TaskOpcode = TaskOpcode::SyncEventGet;

    fn connection(&self) -> Option<ConnectionId> {
        Some(self.conn)
    }
}

/// Sets a peer sync event to the 8-byte value held in `src`.
#[derive(Debug, Clone)]
pub struct SyncEventNotifySet {
    conn: ConnectionId,
    event: RemoteSyncEvent,
    src: BufRef,
}

impl SyncEventNotifySet {
    /// Sets the peer event to the word in `src`.
    pub fn new(conn: ConnectionId, event: RemoteSyncEvent, src: BufRef) -> Self {
        Self { conn, event, src }
    }

    /// Connection the task runs on.
    pub fn conn(&self) -> ConnectionId {
        self.conn
    }

    /// Moves the task to another connection.
    pub fn set_conn(&mut self, conn: ConnectionId) {
        self.conn = conn;
    }

    /// Peer event addressed.
    pub fn event(&self) -> RemoteSyncEvent {
        self.event
    }

    /// Addresses another peer event.
    pub fn set_event(&mut self, event: RemoteSyncEvent) {
        self.event = event;
    }

    /// Source of the operation.
    pub fn src(&self) -> &BufRef {
        &self.src
    }

    /// Replaces the source.
    pub fn set_src(&mut self, src: BufRef) {
        self.src = src;
    }
}

impl Sealed for SyncEventNotifySet {
    fn validate(&self, _limits: &Limits) -> Result<()> {
        if self.src.data_len() != 8 {
            return Err(RdmaError::invalid(format!(
                "notify-set source must hold 8 bytes, holds {}",
                self.src.data_len()
            )));
        }
        Ok(())
    }

    fn execute(&mut self, env: &mut ExecEnv<'_>) -> Result<u64> {
        let value = self
            .src
            .data_u64()
            .ok_or_else(|| RdmaError::unexpected("notify-set source lost its data"))?;
        let event = env.remote_event(&self.event, AccessFlags::REMOTE_WRITE)?;
        event.set(value);
        Ok(8)
    }
}

impl Operation for SyncEventNotifySet {
    const OPCODE: TaskOpcode = TaskOpcode::SyncEventNotifySet;

    fn connection(&self) -> Option<ConnectionId> {
        Some(self.conn)
    }
}

/// Adds to a peer sync event; the previous value lands in `result`.
#[derive(Debug, Clone)]
pub struct SyncEventNotifyAdd {
    conn: ConnectionId,
    event: RemoteSyncEvent,
    result: BufRef,
    add: u64,
    fetched: Option<u64>,
}

impl SyncEventNotifyAdd {
    /// Adds `add` to the peer event; the old value lands in `result`.
    pub fn new(conn: ConnectionId, event: RemoteSyncEvent, result: BufRef, add: u64) -> Self {
        Self {
            conn,
            event,
            result,
            add,
            fetched: None,
        }
    }

    /// Connection the task runs on.
    pub fn conn(&self) -> ConnectionId {
        self.conn
    }

    /// Moves the task to another connection.
    pub fn set_conn(&mut self, conn: ConnectionId) {
        self.conn = conn;
    }

    /// Peer event addressed.
    pub fn event(&self) -> RemoteSyncEvent {
        self.event
    }

    /// Addresses another peer event.
    pub fn set_event(&mut self, event: RemoteSyncEvent) {
        self.event = event;
    }

    /// Buffer the old value lands in.
    pub fn result_buf(&self) -> &BufRef {
        &self.result
    }

    /// Replaces the buffer the old value lands in.
    pub fn set_result_buf(&mut self, result: BufRef) {
        self.result = result;
    }

    /// Value added.
    pub fn add(&self) -> u64 {
        self.add
    }

    /// Replaces the value added.
    pub fn set_add(&mut self, add: u64) {
        self.add = add;
    }

    /// Old value, once the task succeeded.
    pub fn fetched(&self) -> Option<u64> {
        self.fetched
    }
}

impl Sealed for SyncEventNotifyAdd {
    fn validate(&self, _limits: &Limits) -> Result<()> {
        check_word_dst(&self.result, "notify-add result")
    }

    fn execute(&mut self, env: &mut ExecEnv<'_>) -> Result<u64> {
        self.fetched = None;
        let event = env.remote_event(&self.event, AccessFlags::REMOTE_ATOMIC)?;
        let old = event.add(self.add);
        self.result.append(&old.to_ne_bytes())?;
        self.fetched = Some(old);
        Ok(8)
    }
}

impl Operation for SyncEventNotifyAdd {
    const OPCODE: TaskOpcode = TaskOpcode::SyncEventNotifyAdd;

    fn connection(&self) -> Option<ConnectionId> {
        Some(self.conn)
    }
}
