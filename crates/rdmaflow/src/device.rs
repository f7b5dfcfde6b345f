//! Device bindings and capability queries.
//!
//! A [`Device`] is the opaque binding a [`crate::Context`] is constructed from. Its
//! [`DeviceInfo`] answers the capability questions callers ask before sizing queues,
//! buffer lists or choosing opcodes; the context setters validate against the same
//! limits.

use std::net::{Ipv4Addr, Ipv6Addr};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::address::{raw_ip, AddrType, RdmaAddress};
use crate::config::{Datapath, Mtu, TransportType};
use crate::error::{RdmaError, Result};
use crate::fabric::{DeviceId, DeviceRecord, Fabric};
use crate::task::TaskOpcode;

/// A 16-byte global identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Gid(pub [u8; 16]);

impl Gid {
    /// Parses a GID written in IPv6 notation.
    pub fn parse(text: &str) -> Result<Self> {
        text.parse::<Ipv6Addr>()
            .map(|ip| Gid(ip.octets()))
            .map_err(|_| RdmaError::invalid(format!("malformed GID {:?}", text)))
    }
}

impl std::fmt::Display for Gid {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", Ipv6Addr::from(self.0))
    }
}

/// Limits and features reported by a device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceCaps {
    /// Largest send queue.
    pub max_send_queue_size: u32,
    /// Largest receive queue.
    pub max_recv_queue_size: u32,
    /// Largest send-side buffer list.
    pub max_send_buf_list_len: u32,
    /// Largest receive buffer list.
    pub max_recv_buf_list_len: u32,
    /// Largest single message in bytes.
    pub max_message_size: u32,
    /// Largest path MTU.
    pub max_mtu: Mtu,
    /// Transports the device offers.
    pub transports: Vec<TransportType>,
    /// Task kinds the device executes.
    pub opcodes: Vec<TaskOpcode>,
    /// Datapaths the device can be driven from.
    pub datapaths: Vec<Datapath>,
}

impl Default for DeviceCaps {
    fn default() -> Self {
        Self {
            max_send_queue_size: 32768,
            max_recv_queue_size: 32768,
            max_send_buf_list_len: 16,
            max_recv_buf_list_len: 16,
            max_message_size: 1 << 30,
            max_mtu: Mtu::Mtu4096,
            transports: vec![TransportType::Rc, TransportType::Dc],
            opcodes: TaskOpcode::ALL.to_vec(),
            datapaths: vec![Datapath::Cpu, Datapath::Gpu, Datapath::Dpa],
        }
    }
}

/// Everything needed to attach a device to a [`Fabric`].
#[derive(Debug, Clone)]
pub struct DeviceSpec {
    /// Device name, used in logs.
    pub name: String,
    /// IPv4 address, if any.
    pub ipv4: Option<Ipv4Addr>,
    /// IPv6 address, if any.
    pub ipv6: Option<Ipv6Addr>,
    /// GID table contents.
    pub gids: Vec<Gid>,
    /// Capabilities the device reports.
    pub caps: DeviceCaps,
}

impl DeviceSpec {
    /// A device with default capabilities and no addresses.
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            ipv4: None,
            ipv6: None,
            gids: Vec::new(),
            caps: DeviceCaps::default(),
        }
    }

    /// Gives the device an IPv4 address.
    pub fn with_ipv4(mut self, ip: Ipv4Addr) -> Self {
        self.ipv4 = Some(ip);
        self
    }

    /// Gives the device an IPv6 address.
    pub fn with_ipv6(mut self, ip: Ipv6Addr) -> Self {
        self.ipv6 = Some(ip);
        self
    }

    /// Appends a GID table entry.
    pub fn with_gid(mut self, gid: Gid) -> Self {
        self.gids.push(gid);
        self
    }

    /// Replaces the default capabilities.
    pub fn with_caps(mut self, caps: DeviceCaps) -> Self {
        self.caps = caps;
        self
    }
}

/// Static information about a device, used for capability negotiation.
#[derive(Debug, Clone)]
pub struct DeviceInfo {
    name: String,
    ipv4: Option<Ipv4Addr>,
    ipv6: Option<Ipv6Addr>,
    gids: Vec<Gid>,
    caps: DeviceCaps,
}

impl DeviceInfo {
    /// Device name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Device capabilities.
    pub fn caps(&self) -> &DeviceCaps {
        &self.caps
    }

    /// Largest send queue the device allows.
    pub fn max_send_queue_size(&self) -> u32 {
        self.caps.max_send_queue_size
    }

    /// Largest receive queue the device allows.
    pub fn max_recv_queue_size(&self) -> u32 {
        self.caps.max_recv_queue_size
    }

    /// Maximum send-side buffer-list length.
    pub fn max_send_buf_list_len(&self) -> u32 {
        self.caps.max_send_buf_list_len
    }

    /// Largest receive buffer list.
    pub fn max_recv_buf_list_len(&self) -> u32 {
        self.caps.max_recv_buf_list_len
    }

    /// Largest single message in bytes.
    pub fn max_message_size(&self) -> u32 {
        self.caps.max_message_size
    }

    /// Largest path MTU.
    pub fn max_mtu(&self) -> Mtu {
        self.caps.max_mtu
    }

    /// Entries in the GID table.
    pub fn gid_table_size(&self) -> u32 {
        self.gids.len() as u32
    }

    /// Returns `count` GID table entries starting at `start`.
    pub fn gids(&self, start: u32, count: u32) -> Result<Vec<Gid>> {
        let start = start as usize;
        let end = start
            .checked_add(count as usize)
            .ok_or_else(|| RdmaError::invalid("GID range overflows"))?;
        if count == 0 || end > self.gids.len() {
            return Err(RdmaError::invalid(format!(
                "GID range {}..{} outside table of {}",
                start,
                end,
                self.gids.len()
            )));
        }
        Ok(self.gids[start..end].to_vec())
    }

    /// Fails with `NotSupported` when the transport is missing.
    pub fn transport_type_is_supported(&self, transport: TransportType) -> Result<()> {
        if self.caps.transports.contains(&transport) {
            Ok(())
        } else {
            Err(RdmaError::not_supported(format!("transport {:?} on {}", transport, self.name)))
        }
    }

    /// Fails with `NotSupported` when the device cannot run `opcode`.
    pub fn task_is_supported(&self, opcode: TaskOpcode) -> Result<()> {
        if self.caps.opcodes.contains(&opcode) {
            Ok(())
        } else {
            Err(RdmaError::not_supported(format!("{:?} tasks on {}", opcode, self.name)))
        }
    }

    /// Fails with `NotSupported` when the datapath is missing.
    pub fn datapath_is_supported(&self, datapath: Datapath) -> Result<()> {
        if self.caps.datapaths.contains(&datapath) {
            Ok(())
        } else {
            Err(RdmaError::not_supported(format!("{:?} datapath on {}", datapath, self.name)))
        }
    }

    /// The device's own address of the given kind, if it has one.
    pub fn local_address(&self, kind: AddrType, port: u16) -> Option<RdmaAddress> {
        let text = match kind {
            AddrType::Ipv4 => self.ipv4.map(|ip| ip.to_string()),
            AddrType::Ipv6 => self.ipv6.map(|ip| ip.to_string()),
            AddrType::Gid => self.gids.first().map(|gid| gid.to_string()),
        }?;
        RdmaAddress::create(kind, &text, port).ok()
    }

    pub(crate) fn owns(&self, address: &RdmaAddress) -> bool {
        let raw = address.raw();
        match address.kind() {
            AddrType::Ipv4 => self.ipv4.map(|ip| raw_ip(ip.into()) == raw).unwrap_or(false),
            AddrType::Ipv6 => self.ipv6.map(|ip| raw_ip(ip.into()) == raw).unwrap_or(false),
            AddrType::Gid => self.gids.iter().any(|gid| gid.0 == raw),
        }
    }
}

/// An opaque device binding attached to a fabric.
#[derive(Clone)]
pub struct Device {
    id: DeviceId,
    info: Arc<DeviceInfo>,
    fabric: Fabric,
}

impl Device {
    /// Attaches a new device to `fabric`.
    pub fn open(fabric: &Fabric, spec: DeviceSpec) -> Result<Self> {
        if spec.name.is_empty() {
            return Err(RdmaError::invalid("device name is empty"));
        }
        let info = Arc::new(DeviceInfo {
            name: spec.name,
            ipv4: spec.ipv4,
            ipv6: spec.ipv6,
            gids: spec.gids,
            caps: spec.caps,
        });
        let id = fabric.lock().add_device(DeviceRecord {
            info: Arc::clone(&info),
            removed: false,
        });
        Ok(Self {
            id,
            info,
            fabric: fabric.clone(),
        })
    }

    /// Identifier on the fabric.
    pub fn id(&self) -> DeviceId {
        self.id
    }

    /// Static description of the device.
    pub fn info(&self) -> &DeviceInfo {
        &self.info
    }

    /// Fabric the device is attached to.
    pub fn fabric(&self) -> &Fabric {
        &self.fabric
    }

    /// Simulates hot removal. Contexts bound to the device fail on their next poll.
    pub fn remove(&self) {
        warn!(device = %self.info.name, "device removed");
        self.fabric.lock().remove_device(self.id);
    }

    /// True once the device was removed.
    pub fn is_removed(&self) -> bool {
        self.fabric.lock().device_removed(self.id)
    }
}

impl std::fmt::Debug for Device {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Device")
            .field("id", &self.id)
            .field("name", &self.info.name)
            .finish()
    }
}
