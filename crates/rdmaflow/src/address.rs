//! Address objects describing remote endpoints.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::{RdmaError, Result};

/// Kind of address carried by an [`RdmaAddress`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AddrType {
    /// IPv4 dotted quad.
    Ipv4,
    /// IPv6 textual form.
    Ipv6,
    /// InfiniBand GID, written like an IPv6 address.
    Gid,
}

struct AddressInner {
    kind: AddrType,
    text: String,
    port: u16,
    raw: [u8; 16],
    users: AtomicUsize,
}

/// A reusable description of a remote endpoint: type, textual address and port.
///
/// Cloning is cheap. Connections that reference the address hold a lease on it;
/// [`RdmaAddress::destroy`] fails while any lease is outstanding.
#[derive(Clone)]
pub struct RdmaAddress {
    inner: Arc<AddressInner>,
}

impl RdmaAddress {
    /// Parses and validates an address. GIDs use the IPv6 textual form.
    pub fn create(kind: AddrType, address: &str, port: u16) -> Result<Self> {
        let raw = parse_raw(kind, address)?;
        Ok(Self {
            inner: Arc::new(AddressInner {
                kind,
                text: address.to_string(),
                port,
                raw,
                users: AtomicUsize::new(0),
            }),
        })
    }

    /// Address type.
    pub fn kind(&self) -> AddrType {
        self.inner.kind
    }

    /// Address as given at creation.
    pub fn address(&self) -> &str {
        &self.inner.text
    }

    /// Port number.
    pub fn port(&self) -> u16 {
        self.inner.port
    }

    /// Returns `(type, address, port)`.
    pub fn params(&self) -> (AddrType, &str, u16) {
        (self.inner.kind, &self.inner.text, self.inner.port)
    }

    /// Number of connections currently referencing this address.
    pub fn users(&self) -> usize {
        self.inner.users.load(Ordering::Acquire)
    }

    /// True while any connection holds a lease.
    pub fn in_use(&self) -> bool {
        self.users() > 0
    }

    /// Destroys the address. Fails with `BadState`, handing the address back, while a
    /// connection still references it.
    pub fn destroy(self) -> std::result::Result<(), (RdmaAddress, RdmaError)> {
        let users = self.users();
        if users > 0 {
            let err = RdmaError::BadState {
                operation: "destroy address",
                state: format!("in use by {} connection(s)", users),
            };
            return Err((self, err));
        }
        Ok(())
    }

    /// Normalized 16-byte form; IPv4 addresses are IPv4-mapped.
    pub(crate) fn raw(&self) -> [u8; 16] {
        self.inner.raw
    }

    pub(crate) fn lease(&self) -> AddressLease {
        self.inner.users.fetch_add(1, Ordering::AcqRel);
        AddressLease { address: self.clone() }
    }
}

impl std::fmt::Debug for RdmaAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RdmaAddress")
            .field("kind", &self.inner.kind)
            .field("address", &self.inner.text)
            .field("port", &self.inner.port)
            .finish()
    }
}

impl std::fmt::Display for RdmaAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.inner.kind {
            AddrType::Ipv4 => write!(f, "{}:{}", self.inner.text, self.inner.port),
            AddrType::Ipv6 | AddrType::Gid => write!(f, "[{}]:{}", self.inner.text, self.inner.port),
        }
    }
}

impl PartialEq for RdmaAddress {
    fn eq(&self, other: &Self) -> bool {
        self.inner.kind == other.inner.kind
            && self.inner.raw == other.inner.raw
            && self.inner.port == other.inner.port
    }
}

impl Eq for RdmaAddress {}

/// A connection's reference to an address; released on drop.
#[derive(Debug)]
pub(crate) struct AddressLease {
    address: RdmaAddress,
}

impl AddressLease {
    pub(crate) fn address(&self) -> &RdmaAddress {
        &self.address
    }
}

impl Drop for AddressLease {
    fn drop(&mut self) {
        self.address.inner.users.fetch_sub(1, Ordering::AcqRel);
    }
}

fn parse_raw(kind: AddrType, address: &str) -> Result<[u8; 16]> {
    if address.is_empty() {
        return Err(RdmaError::invalid("empty address"));
    }
    match kind {
        AddrType::Ipv4 => address
            .parse::<Ipv4Addr>()
            .map(|ip| ip.to_ipv6_mapped().octets())
            .map_err(|_| RdmaError::invalid(format!("malformed IPv4 address {:?}", address))),
        AddrType::Ipv6 => address
            .parse::<Ipv6Addr>()
            .map(|ip| ip.octets())
            .map_err(|_| RdmaError::invalid(format!("malformed IPv6 address {:?}", address))),
        AddrType::Gid => address
            .parse::<Ipv6Addr>()
            .map(|ip| ip.octets())
            .map_err(|_| RdmaError::invalid(format!("malformed GID {:?}", address))),
    }
}

/// Normalizes an IP address to the 16-byte form used by [`RdmaAddress`].
pub(crate) fn raw_ip(ip: IpAddr) -> [u8; 16] {
    match ip {
        IpAddr::V4(v4) => v4.to_ipv6_mapped().octets(),
        IpAddr::V6(v6) => v6.octets(),
    }
}
