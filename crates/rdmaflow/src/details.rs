//! Connection details exchanged out of band by the export/connect flow.
//!
//! The blob is a bincode-encoded record followed by its SHA-256 digest. It names the
//! exporting endpoint, the epoch it was started in and the exported connection, plus a
//! random session key the binding peer must echo back.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::config::TransportType;
use crate::connection::ConnectionId;
use crate::error::{RdmaError, Result};
use crate::fabric::EndpointId;

const MAGIC: u32 = 0x5244_4d41;
const VERSION: u16 = 1;
const DIGEST_LEN: usize = 32;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct DetailsRecord {
    magic: u32,
    version: u16,
    pub endpoint: EndpointId,
    pub epoch: u64,
    pub conn: ConnectionId,
    pub transport: TransportType,
    pub gid: Option<[u8; 16]>,
    pub session_key: [u8; 16],
}

impl DetailsRecord {
    pub fn new(
        endpoint: EndpointId,
        epoch: u64,
        conn: ConnectionId,
        transport: TransportType,
        gid: Option<[u8; 16]>,
        session_key: [u8; 16],
    ) -> Self {
        Self {
            magic: MAGIC,
            version: VERSION,
            endpoint,
            epoch,
            conn,
            transport,
            gid,
            session_key,
        }
    }
}

/// Fresh random key tying a blob to one export.
pub(crate) fn session_key() -> Result<[u8; 16]> {
    let mut key = [0u8; 16];
    getrandom::getrandom(&mut key).map_err(|e| RdmaError::driver(format!("entropy source: {}", e)))?;
    Ok(key)
}

/// Opaque connection details. Treat the contents as secret routing and key material.
#[derive(Clone, PartialEq, Eq)]
pub struct ConnectionDetails(Vec<u8>);

impl ConnectionDetails {
    pub(crate) fn seal(record: &DetailsRecord) -> Result<Self> {
        let mut bytes =
            bincode::serialize(record).map_err(|e| RdmaError::unexpected(format!("encode details: {}", e)))?;
        let digest = Sha256::digest(&bytes);
        bytes.extend_from_slice(&digest);
        Ok(Self(bytes))
    }

    pub(crate) fn open(&self) -> Result<DetailsRecord> {
        if self.0.len() <= DIGEST_LEN {
            return Err(RdmaError::aborted("connection details truncated"));
        }
        let (body, digest) = self.0.split_at(self.0.len() - DIGEST_LEN);
        if Sha256::digest(body).as_slice() != digest {
            return Err(RdmaError::aborted("connection details corrupted"));
        }
        let record: DetailsRecord =
            bincode::deserialize(body).map_err(|e| RdmaError::aborted(format!("connection details: {}", e)))?;
        if record.magic != MAGIC || record.version != VERSION {
            return Err(RdmaError::aborted("connection details from an incompatible peer"));
        }
        Ok(record)
    }

    /// Raw bytes, for shipping to the peer.
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Encoded size in bytes.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// True when empty.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<Vec<u8>> for ConnectionDetails {
    fn from(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }
}

impl From<&[u8]> for ConnectionDetails {
    fn from(bytes: &[u8]) -> Self {
        Self(bytes.to_vec())
    }
}

impl std::fmt::Debug for ConnectionDetails {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionDetails")
            .field("len", &self.0.len())
            .finish_non_exhaustive()
    }
}
