//! External connection manager.
//!
//! A [`CmListener`] owns a listening port outside of any context. Requests arriving on
//! it are handed out as [`CmRequest`]s, which a context adopts with
//! `bridge_prepare_connection`. A request dropped without being adopted is rejected
//! back to the client.

use tracing::debug;

use crate::address::RdmaAddress;
use crate::device::Device;
use crate::error::Result;
use crate::fabric::{DeviceId, Fabric, ListenTarget, PeerRef, WireEvent};

/// A listening port driven by code outside the engine.
pub struct CmListener {
    fabric: Fabric,
    device: DeviceId,
    port: u16,
    queue: u64,
}

impl CmListener {
    /// Listens on `port` of `device`; requests queue up until taken.
    pub fn bind(device: &Device, port: u16) -> Result<Self> {
        let fabric = device.fabric().clone();
        let queue = {
            let mut state = fabric.lock();
            let queue = state.open_cm_queue();
            if let Err(e) = state.listen(device.id(), port, ListenTarget::External(queue)) {
                state.close_cm_queue(queue);
                return Err(e);
            }
            queue
        };
        Ok(Self {
            fabric,
            device: device.id(),
            port,
            queue,
        })
    }

    /// Port number.
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Next pending connection request, if any.
    pub fn get_request(&self) -> Option<CmRequest> {
        let pending = self.fabric.lock().pop_cm_request(self.queue)?;
        debug!(port = self.port, source = %pending.source, "cm request");
        Some(CmRequest {
            fabric: self.fabric.clone(),
            from: pending.from,
            source: pending.source,
            port: pending.port,
            adopted: false,
        })
    }
}

impl Drop for CmListener {
    fn drop(&mut self) {
        let mut state = self.fabric.lock();
        state.unlisten(self.device, self.port, ListenTarget::External(self.queue));
        for pending in state.close_cm_queue(self.queue) {
            state.deliver(pending.from.endpoint, WireEvent::ConnectRejected { to: pending.from.conn });
        }
    }
}

impl std::fmt::Debug for CmListener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CmListener")
            .field("device", &self.device)
            .field("port", &self.port)
            .finish()
    }
}

/// A foreign connection handle. Ownership passes to the context that adopts it.
pub struct CmRequest {
    fabric: Fabric,
    from: PeerRef,
    source: RdmaAddress,
    port: u16,
    adopted: bool,
}

impl CmRequest {
    /// Address of the requesting client.
    pub fn source(&self) -> &RdmaAddress {
        &self.source
    }

    /// Port the request arrived on.
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Turns the client away.
    pub fn reject(self) {}

    pub(crate) fn fabric(&self) -> &Fabric {
        &self.fabric
    }

    pub(crate) fn adopt(mut self) -> (PeerRef, RdmaAddress) {
        self.adopted = true;
        (self.from, self.source.clone())
    }
}

impl Drop for CmRequest {
    fn drop(&mut self) {
        if !self.adopted {
            debug!(source = %self.source, "cm request rejected");
            self.fabric
                .lock()
                .deliver(self.from.endpoint, WireEvent::ConnectRejected { to: self.from.conn });
        }
    }
}

impl std::fmt::Debug for CmRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CmRequest")
            .field("source", &self.source)
            .field("port", &self.port)
            .finish()
    }
}
