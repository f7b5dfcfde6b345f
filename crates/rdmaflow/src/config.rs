//! Transport properties of an RDMA context.
//!
//! Every property has a setter on [`crate::Context`] that is only valid while the
//! context is idle. [`RdmaConfig`] bundles them so a whole configuration can be
//! loaded from JSON and applied in one call.

use serde::{Deserialize, Serialize};

use crate::error::{RdmaError, Result};

/// Transport service used by the queues of a context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum TransportType {
    /// Reliable connected.
    #[default]
    Rc,
    /// Dynamically connected; only usable with the export/connect flow.
    Dc,
}

/// Path MTU.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default)]
pub enum Mtu {
    /// 256 bytes.
    Mtu256,
    /// 512 bytes.
    Mtu512,
    /// 1024 bytes.
    #[default]
    Mtu1024,
    /// 2048 bytes.
    Mtu2048,
    /// 4096 bytes.
    Mtu4096,
}

impl Mtu {
    /// MTU in bytes.
    pub fn bytes(self) -> u32 {
        match self {
            Mtu::Mtu256 => 256,
            Mtu::Mtu512 => 512,
            Mtu::Mtu1024 => 1024,
            Mtu::Mtu2048 => 2048,
            Mtu::Mtu4096 => 4096,
        }
    }
}

/// Datapath the queues are driven from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum Datapath {
    /// Host CPU.
    #[default]
    Cpu,
    /// GPU-initiated work.
    Gpu,
    /// Data path accelerator.
    Dpa,
}

bitflags::bitflags! {
    /// RDMA access permissions, used for contexts and memory regions.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
    pub struct AccessFlags: u32 {
        /// Local read access.
        const LOCAL_READ = 1;
        /// Local write access.
        const LOCAL_WRITE = 1 << 1;
        /// Peers may read.
        const REMOTE_READ = 1 << 2;
        /// Peers may write.
        const REMOTE_WRITE = 1 << 3;
        /// Peers may run atomics.
        const REMOTE_ATOMIC = 1 << 4;
        /// Every permission.
        const ALL = Self::LOCAL_READ.bits()
            | Self::LOCAL_WRITE.bits()
            | Self::REMOTE_READ.bits()
            | Self::REMOTE_WRITE.bits()
            | Self::REMOTE_ATOMIC.bits();
    }
}

impl Default for AccessFlags {
    fn default() -> Self {
        Self::LOCAL_READ | Self::LOCAL_WRITE
    }
}

/// Transport properties of a context.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RdmaConfig {
    /// Send queue depth; bounds in-flight send-side tasks. Rounded up to a power of two.
    pub send_queue_size: u32,
    /// Receive queue depth; bounds posted receive tasks. Rounded up to a power of two.
    pub recv_queue_size: u32,
    /// Maximum local buffer-list length for send-side tasks.
    pub max_send_buf_list_len: u32,
    /// Maximum destination buffer-list length for receive tasks.
    pub recv_buf_list_len: u32,
    /// Transport service.
    pub transport: TransportType,
    /// Path MTU, capped by the device.
    pub mtu: Mtu,
    /// Remote access the context grants its peers.
    pub permissions: AccessFlags,
    /// Global routing header on outgoing packets.
    pub grh_enabled: bool,
    /// GID table index used as the local address.
    pub gid_index: u32,
    /// Service level, 0..=15.
    pub service_level: u8,
    /// Bound on address resolution, handshakes and disconnect acknowledgement.
    pub connection_request_timeout_ms: u16,
    /// Size of the connection table.
    pub max_num_connections: u16,
    /// Receiver-not-ready retry count, 0..=7 (7 means infinite).
    pub rnr_retry_count: u8,
    /// Datapath the queues are driven from.
    pub datapath: Datapath,
}

impl Default for RdmaConfig {
    fn default() -> Self {
        Self {
            send_queue_size: 128,
            recv_queue_size: 128,
            max_send_buf_list_len: 1,
            recv_buf_list_len: 1,
            transport: TransportType::Rc,
            mtu: Mtu::Mtu1024,
            permissions: AccessFlags::default(),
            grh_enabled: true,
            gid_index: 0,
            service_level: 0,
            connection_request_timeout_ms: 5000,
            max_num_connections: 16,
            rnr_retry_count: 7,
            datapath: Datapath::Cpu,
        }
    }
}

impl RdmaConfig {
    /// Parses a configuration from JSON; missing fields take their defaults.
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json).map_err(|e| RdmaError::invalid(format!("config: {}", e)))
    }

    /// Pretty-printed JSON.
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self).map_err(|e| RdmaError::unexpected(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_access_flags_basic() {
        let flags = AccessFlags::LOCAL_READ | AccessFlags::REMOTE_WRITE;
        assert!(flags.contains(AccessFlags::LOCAL_READ));
        assert!(flags.contains(AccessFlags::REMOTE_WRITE));
        assert!(!flags.contains(AccessFlags::REMOTE_ATOMIC));
        assert!(AccessFlags::ALL.contains(flags));
    }

    #[test]
    fn test_access_flags_from_bits_rejects_unknown() {
        assert_eq!(AccessFlags::from_bits(0x3), Some(AccessFlags::LOCAL_READ | AccessFlags::LOCAL_WRITE));
        assert!(AccessFlags::from_bits(0x20).is_none());
        assert_eq!(AccessFlags::from_bits(0), Some(AccessFlags::empty()));
        assert_eq!(AccessFlags::ALL, AccessFlags::all());
    }

    #[test]
    fn test_permissions_from_json_by_name() {
        let config = RdmaConfig::from_json(r#"{"permissions": "LOCAL_READ | REMOTE_WRITE"}"#).unwrap();
        assert_eq!(config.permissions, AccessFlags::LOCAL_READ | AccessFlags::REMOTE_WRITE);
        assert_eq!(RdmaConfig::default().permissions, AccessFlags::LOCAL_READ | AccessFlags::LOCAL_WRITE);
        assert!(RdmaConfig::from_json(r#"{"permissions": "REMOTE_EXECUTE"}"#).is_err());
    }

    #[test]
    fn test_mtu_ordering() {
        assert!(Mtu::Mtu4096 > Mtu::Mtu1024);
        assert_eq!(Mtu::Mtu2048.bytes(), 2048);
    }

    #[test]
    fn test_config_defaults() {
        let config = RdmaConfig::default();
        assert_eq!(config.send_queue_size, 128);
        assert_eq!(config.transport, TransportType::Rc);
        assert_eq!(config.connection_request_timeout_ms, 5000);
        assert_eq!(config.max_num_connections, 16);
        assert_eq!(config.datapath, Datapath::Cpu);
    }

    #[test]
    fn test_config_from_partial_json() {
        let config = RdmaConfig::from_json(r#"{"send_queue_size": 32, "mtu": "Mtu4096"}"#).unwrap();
        assert_eq!(config.send_queue_size, 32);
        assert_eq!(config.mtu, Mtu::Mtu4096);
        assert_eq!(config.recv_queue_size, 128);
    }

    #[test]
    fn test_config_json_roundtrip() {
        let mut config = RdmaConfig::default();
        config.transport = TransportType::Dc;
        config.service_level = 3;
        let json = config.to_json().unwrap();
        assert_eq!(RdmaConfig::from_json(&json).unwrap(), config);
    }

    #[test]
    fn test_config_bad_json() {
        let err = RdmaConfig::from_json("{not json").unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::InvalidArgument);
    }
}
