//! Peer-visible 64-bit synchronization events.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::device::Device;
use crate::error::{RdmaError, Result};
use crate::fabric::DeviceId;

/// A counter-like object peers can read, set or add to through dedicated tasks.
#[derive(Debug)]
pub struct SyncEvent {
    id: u64,
    device: DeviceId,
    value: AtomicU64,
}

impl SyncEvent {
    /// Creates an event on `device` and publishes it for remote access.
    pub fn create(device: &Device, initial: u64) -> Result<Arc<Self>> {
        let mut fabric = device.fabric().lock();
        if fabric.device_removed(device.id()) {
            return Err(RdmaError::driver("device removed"));
        }
        let event = Arc::new(Self {
            id: fabric.next_id(),
            device: device.id(),
            value: AtomicU64::new(initial),
        });
        fabric.register_sync_event(&event);
        Ok(event)
    }

    /// Fabric-wide id peers address the event by.
    pub fn id(&self) -> u64 {
        self.id
    }

    pub(crate) fn device(&self) -> DeviceId {
        self.device
    }

    /// Current value.
    pub fn value(&self) -> u64 {
        self.value.load(Ordering::Acquire)
    }

    /// Overwrites the value.
    pub fn set(&self, value: u64) {
        self.value.store(value, Ordering::Release);
    }

    /// Wrapping add; returns the previous value.
    pub fn add(&self, delta: u64) -> u64 {
        self.value.fetch_add(delta, Ordering::AcqRel)
    }

    /// Descriptor to hand to peers out of band.
    pub fn remote(&self) -> RemoteSyncEvent {
        RemoteSyncEvent { id: self.id }
    }
}

/// A peer's sync event as addressed from this side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RemoteSyncEvent {
    /// Id of the event on the peer.
    pub id: u64,
}
