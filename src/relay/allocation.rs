//! Relay allocation input
//!
//! Allocations are produced by the relay service and consumed as plain data.

use bytes::Bytes;
use uuid::Uuid;

/// Relay server endpoint as reported by the relay service
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayServer {
    /// IPv4 address in dotted notation
    pub ipv4: String,
    /// UDP port
    pub port: u16,
}

/// Allocation granted to the hosting peer
#[derive(Debug, Clone)]
pub struct Allocation {
    /// Allocation identifier
    pub allocation_id: Uuid,
    /// Relay server to route through
    pub relay_server: RelayServer,
    /// Key used to sign relay messages
    pub key: Bytes,
    /// Connection data identifying this peer to the relay
    pub connection_data: Bytes,
    /// Maximum number of peers that may join
    pub max_connections: usize,
}

impl Allocation {
    /// Allocation identifier in its wire form
    pub fn allocation_id_bytes(&self) -> Bytes {
        Bytes::copy_from_slice(self.allocation_id.as_bytes())
    }
}

/// Allocation granted to a peer joining through a join code
#[derive(Debug, Clone)]
pub struct JoinAllocation {
    /// Allocation identifier
    pub allocation_id: Uuid,
    /// Relay server to route through
    pub relay_server: RelayServer,
    /// Key used to sign relay messages
    pub key: Bytes,
    /// Connection data identifying this peer to the relay
    pub connection_data: Bytes,
    /// Connection data of the host this allocation joins
    pub host_connection_data: Bytes,
}

impl JoinAllocation {
    /// Allocation identifier in its wire form
    pub fn allocation_id_bytes(&self) -> Bytes {
        Bytes::copy_from_slice(self.allocation_id.as_bytes())
    }
}
