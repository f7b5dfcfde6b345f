//! Registered memory and the buffer descriptors tasks consume.
//!
//! The engine never allocates or frees task memory. Callers register a
//! [`MemoryRegion`] with a device, carve [`BufRef`] views out of it for local
//! operands, and ship [`RemoteBuf`] descriptors to peers out of band.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::config::AccessFlags;
use crate::device::Device;
use crate::error::{RdmaError, Result};
use crate::fabric::{DeviceId, Fabric};

static REGION_KEYS: AtomicU32 = AtomicU32::new(1);

/// A block of memory registered with a device.
pub struct MemoryRegion {
    key: u32,
    device: DeviceId,
    access: AccessFlags,
    data: Mutex<Vec<u8>>,
    fabric: Fabric,
}

impl MemoryRegion {
    /// Registers `data` with `device`, making it addressable by peers through its key.
    pub fn register(device: &Device, data: Vec<u8>, access: AccessFlags) -> Result<Arc<Self>> {
        if data.is_empty() {
            return Err(RdmaError::invalid("cannot register an empty region"));
        }
        let mut fabric = device.fabric().lock();
        if fabric.device_removed(device.id()) {
            return Err(RdmaError::driver("device removed"));
        }
        let region = Arc::new(Self {
            key: REGION_KEYS.fetch_add(1, Ordering::Relaxed) | 0x8000_0000,
            device: device.id(),
            access,
            data: Mutex::new(data),
            fabric: device.fabric().clone(),
        });
        fabric.register_region(&region);
        Ok(region)
    }

    /// Remote key peers use to address this region.
    pub fn key(&self) -> u32 {
        self.key
    }

    /// Size of the region in bytes.
    pub fn len(&self) -> usize {
        self.data.lock().len()
    }

    /// True when empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Access the region was registered with.
    pub fn access(&self) -> AccessFlags {
        self.access
    }

    pub(crate) fn device(&self) -> DeviceId {
        self.device
    }

    /// Copies `len` bytes out, or `None` when the range is outside the region.
    pub fn read_at(&self, offset: usize, len: usize) -> Option<Vec<u8>> {
        let data = self.data.lock();
        let end = offset.checked_add(len)?;
        data.get(offset..end).map(|s| s.to_vec())
    }

    /// Copies `bytes` in at `offset`. Returns false when they do not fit.
    pub fn write_at(&self, offset: usize, bytes: &[u8]) -> bool {
        let mut data = self.data.lock();
        let Some(end) = offset.checked_add(bytes.len()) else {
            return false;
        };
        match data.get_mut(offset..end) {
            Some(dst) => {
                dst.copy_from_slice(bytes);
                true
            }
            None => false,
        }
    }

    /// Reads a native-endian word.
    pub fn read_u64(&self, offset: usize) -> Option<u64> {
        let bytes = self.read_at(offset, 8)?;
        let mut raw = [0u8; 8];
        raw.copy_from_slice(&bytes);
        Some(u64::from_ne_bytes(raw))
    }

    /// Writes a native-endian word.
    pub fn write_u64(&self, offset: usize, value: u64) -> bool {
        self.write_at(offset, &value.to_ne_bytes())
    }

    /// Atomically compares the 8-byte cell at `offset` with `compare` and swaps in
    /// `swap` on a match. Returns the previous value.
    pub(crate) fn compare_swap(&self, offset: usize, compare: u64, swap: u64) -> Option<u64> {
        let mut data = self.data.lock();
        let cell = data.get_mut(offset..offset.checked_add(8)?)?;
        let mut raw = [0u8; 8];
        raw.copy_from_slice(cell);
        let old = u64::from_ne_bytes(raw);
        if old == compare {
            cell.copy_from_slice(&swap.to_ne_bytes());
        }
        Some(old)
    }

    /// Atomically adds `add` (wrapping) to the 8-byte cell at `offset`. Returns the
    /// previous value.
    pub(crate) fn fetch_add(&self, offset: usize, add: u64) -> Option<u64> {
        let mut data = self.data.lock();
        let cell = data.get_mut(offset..offset.checked_add(8)?)?;
        let mut raw = [0u8; 8];
        raw.copy_from_slice(cell);
        let old = u64::from_ne_bytes(raw);
        cell.copy_from_slice(&old.wrapping_add(add).to_ne_bytes());
        Some(old)
    }

    /// A local view of `len` bytes starting at `offset`, with no data yet.
    pub fn buf(self: &Arc<Self>, offset: usize, len: usize) -> Result<BufRef> {
        self.check_range(offset, len)?;
        Ok(BufRef {
            region: Arc::clone(self),
            offset,
            len,
            data_len: 0,
        })
    }

    /// A descriptor peers can use to address `len` bytes starting at `offset`.
    pub fn remote(&self, offset: usize, len: usize) -> Result<RemoteBuf> {
        self.check_range(offset, len)?;
        Ok(RemoteBuf {
            key: self.key,
            offset: offset as u64,
            len: len as u64,
        })
    }

    fn check_range(&self, offset: usize, len: usize) -> Result<()> {
        let size = self.len();
        match offset.checked_add(len) {
            Some(end) if len > 0 && end <= size => Ok(()),
            _ => Err(RdmaError::invalid(format!(
                "range {}+{} outside region of {} bytes",
                offset, len, size
            ))),
        }
    }
}

impl Drop for MemoryRegion {
    fn drop(&mut self) {
        // Dropped under the fabric lock, the entry is swept on the next registration.
        if let Some(mut fabric) = self.fabric.try_lock() {
            fabric.unregister_region(self.key);
        }
    }
}

impl std::fmt::Debug for MemoryRegion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryRegion")
            .field("key", &format_args!("{:#x}", self.key))
            .field("device", &self.device)
            .field("access", &self.access)
            .field("len", &self.len())
            .finish()
    }
}

/// A non-owning view over part of a registered region.
///
/// `[offset, offset + data_len)` holds data: it is what gets sent or written when the
/// buffer is a source. Operations that land data into the buffer append after
/// `data_len` and grow it.
#[derive(Clone)]
pub struct BufRef {
    region: Arc<MemoryRegion>,
    offset: usize,
    len: usize,
    data_len: usize,
}

impl BufRef {
    /// Region the view belongs to.
    pub fn region(&self) -> &Arc<MemoryRegion> {
        &self.region
    }

    /// Start of the view within its region.
    pub fn offset(&self) -> usize {
        self.offset
    }

    /// Total size of the view.
    pub fn len(&self) -> usize {
        self.len
    }

    /// True when empty.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Bytes of data at the front of the view.
    pub fn data_len(&self) -> usize {
        self.data_len
    }

    /// Space left after the data segment.
    pub fn free_len(&self) -> usize {
        self.len - self.data_len
    }

    /// Marks the first `data_len` bytes as data. Fails past the end of the view.
    pub fn set_data_len(&mut self, data_len: usize) -> Result<()> {
        if data_len > self.len {
            return Err(RdmaError::invalid(format!(
                "data length {} exceeds buffer of {}",
                data_len, self.len
            )));
        }
        self.data_len = data_len;
        Ok(())
    }

    /// Overwrites the start of the view with `bytes` and marks them as its data.
    pub fn fill(&mut self, bytes: &[u8]) -> Result<()> {
        if bytes.len() > self.len {
            return Err(RdmaError::invalid(format!(
                "{} bytes do not fit in buffer of {}",
                bytes.len(),
                self.len
            )));
        }
        if !self.region.write_at(self.offset, bytes) {
            return Err(RdmaError::unexpected("buffer outside its region"));
        }
        self.data_len = bytes.len();
        Ok(())
    }

    /// Empties the data segment.
    pub fn reset(&mut self) {
        self.data_len = 0;
    }

    /// Copy of the data segment.
    pub fn data(&self) -> Vec<u8> {
        self.region
            .read_at(self.offset, self.data_len)
            .unwrap_or_default()
    }

    /// The data segment as a native-endian u64, when it is exactly 8 bytes.
    pub fn data_u64(&self) -> Option<u64> {
        if self.data_len != 8 {
            return None;
        }
        self.region.read_u64(self.offset)
    }

    /// Appends `bytes` after the data segment.
    pub(crate) fn append(&mut self, bytes: &[u8]) -> Result<()> {
        if bytes.len() > self.free_len() {
            return Err(RdmaError::driver("local length error"));
        }
        if !self.region.write_at(self.offset + self.data_len, bytes) {
            return Err(RdmaError::unexpected("buffer outside its region"));
        }
        self.data_len += bytes.len();
        Ok(())
    }
}

impl std::fmt::Debug for BufRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BufRef")
            .field("key", &format_args!("{:#x}", self.region.key))
            .field("offset", &self.offset)
            .field("len", &self.len)
            .field("data_len", &self.data_len)
            .finish()
    }
}

/// An ordered list of local buffers, gathered on send and scattered on receive.
#[derive(Debug, Clone, Default)]
pub struct BufList(Vec<BufRef>);

impl BufList {
    /// A list of `bufs`, in order.
    pub fn new(bufs: Vec<BufRef>) -> Self {
        Self(bufs)
    }

    /// Buffers in order.
    pub fn bufs(&self) -> &[BufRef] {
        &self.0
    }

    /// Mutable buffers in order.
    pub fn bufs_mut(&mut self) -> &mut [BufRef] {
        &mut self.0
    }

    /// Appends a buffer to the end of the list.
    pub fn push(&mut self, buf: BufRef) {
        self.0.push(buf);
    }

    /// Number of buffers in the list.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// True when empty.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Data bytes across all buffers.
    pub fn data_len(&self) -> usize {
        self.0.iter().map(BufRef::data_len).sum()
    }

    /// Free bytes across all buffers.
    pub fn free_len(&self) -> usize {
        self.0.iter().map(BufRef::free_len).sum()
    }

    /// Empties the data segment of every buffer.
    pub fn reset(&mut self) {
        self.0.iter_mut().for_each(BufRef::reset);
    }

    pub(crate) fn gather(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.data_len());
        for buf in &self.0 {
            out.extend_from_slice(&buf.data());
        }
        out
    }

    /// Lands `bytes` in the free space of the list, filling buffers in order.
    pub(crate) fn scatter(&mut self, bytes: &[u8]) -> Result<()> {
        if bytes.len() > self.free_len() {
            return Err(RdmaError::driver(format!(
                "local length error: {} bytes into {} free",
                bytes.len(),
                self.free_len()
            )));
        }
        let mut rest = bytes;
        for buf in &mut self.0 {
            if rest.is_empty() {
                break;
            }
            let n = rest.len().min(buf.free_len());
            buf.append(&rest[..n])?;
            rest = &rest[n..];
        }
        Ok(())
    }
}

impl From<BufRef> for BufList {
    fn from(buf: BufRef) -> Self {
        Self(vec![buf])
    }
}

impl From<Vec<BufRef>> for BufList {
    fn from(bufs: Vec<BufRef>) -> Self {
        Self(bufs)
    }
}

/// A peer's memory as seen from this side: remote key, offset and length.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RemoteBuf {
    /// Remote key of the region.
    pub key: u32,
    /// Byte offset into the region.
    pub offset: u64,
    /// Length in bytes.
    pub len: u64,
}

impl RemoteBuf {
    /// Describes `len` bytes at `offset` of the region with `key`.
    pub fn new(key: u32, offset: u64, len: u64) -> Self {
        Self { key, offset, len }
    }
}
