//! Relay session descriptor
//!
//! Everything a packet driver needs to open a session through the relay:
//! server endpoint, allocation ID, connection tokens, key and transport
//! security flag. Byte fields are always present, empty when not supplied.

use std::fmt;
use std::net::{Ipv4Addr, SocketAddrV4};

use bytes::Bytes;

use crate::error::RelayError;
use crate::relay::allocation::{Allocation, JoinAllocation};

/// Immutable relay session parameters
#[derive(Clone, PartialEq, Eq)]
pub struct RelaySessionDescriptor {
    server: SocketAddrV4,
    allocation_id: Bytes,
    connection_data: Bytes,
    host_connection_data: Bytes,
    key: Bytes,
    secure: bool,
}

impl RelaySessionDescriptor {
    /// Start building a descriptor for the given relay server
    pub fn builder(ipv4: impl Into<String>, port: u16) -> RelaySessionDescriptorBuilder {
        RelaySessionDescriptorBuilder {
            ipv4: ipv4.into(),
            port,
            allocation_id: Bytes::new(),
            connection_data: Bytes::new(),
            host_connection_data: Bytes::new(),
            key: Bytes::new(),
            secure: false,
        }
    }

    /// Descriptor for the hosting peer
    pub fn from_allocation(allocation: &Allocation, secure: bool) -> Result<Self, RelayError> {
        Self::builder(
            allocation.relay_server.ipv4.clone(),
            allocation.relay_server.port,
        )
        .allocation_id(allocation.allocation_id_bytes())
        .connection_data(&allocation.connection_data)
        .key(&allocation.key)
        .secure(secure)
        .build()
    }

    /// Descriptor for a peer joining a host
    pub fn from_join_allocation(
        allocation: &JoinAllocation,
        secure: bool,
    ) -> Result<Self, RelayError> {
        Self::builder(
            allocation.relay_server.ipv4.clone(),
            allocation.relay_server.port,
        )
        .allocation_id(allocation.allocation_id_bytes())
        .connection_data(&allocation.connection_data)
        .host_connection_data(Some(&allocation.host_connection_data))
        .key(&allocation.key)
        .secure(secure)
        .build()
    }

    /// Relay server endpoint
    pub fn server(&self) -> SocketAddrV4 {
        self.server
    }

    pub fn allocation_id(&self) -> &Bytes {
        &self.allocation_id
    }

    pub fn connection_data(&self) -> &Bytes {
        &self.connection_data
    }

    /// Host connection data; empty for the hosting peer
    pub fn host_connection_data(&self) -> &Bytes {
        &self.host_connection_data
    }

    pub fn key(&self) -> &Bytes {
        &self.key
    }

    pub fn is_secure(&self) -> bool {
        self.secure
    }

    /// Whether this descriptor joins another peer's allocation
    pub fn is_joining(&self) -> bool {
        !self.host_connection_data.is_empty()
    }
}

impl fmt::Debug for RelaySessionDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RelaySessionDescriptor")
            .field("server", &self.server)
            .field("allocation_id", &self.allocation_id)
            .field("connection_data_len", &self.connection_data.len())
            .field("host_connection_data_len", &self.host_connection_data.len())
            .field("key_len", &self.key.len())
            .field("secure", &self.secure)
            .finish()
    }
}

/// Builder for [`RelaySessionDescriptor`]
#[derive(Debug, Clone)]
pub struct RelaySessionDescriptorBuilder {
    ipv4: String,
    port: u16,
    allocation_id: Bytes,
    connection_data: Bytes,
    host_connection_data: Bytes,
    key: Bytes,
    secure: bool,
}

impl RelaySessionDescriptorBuilder {
    pub fn allocation_id(mut self, bytes: impl AsRef<[u8]>) -> Self {
        self.allocation_id = Bytes::copy_from_slice(bytes.as_ref());
        self
    }

    pub fn connection_data(mut self, bytes: impl AsRef<[u8]>) -> Self {
        self.connection_data = Bytes::copy_from_slice(bytes.as_ref());
        self
    }

    /// Host connection data, absent for the hosting peer
    pub fn host_connection_data<B: AsRef<[u8]>>(mut self, bytes: Option<B>) -> Self {
        self.host_connection_data = bytes
            .map(|b| Bytes::copy_from_slice(b.as_ref()))
            .unwrap_or_default();
        self
    }

    pub fn key(mut self, bytes: impl AsRef<[u8]>) -> Self {
        self.key = Bytes::copy_from_slice(bytes.as_ref());
        self
    }

    pub fn secure(mut self, secure: bool) -> Self {
        self.secure = secure;
        self
    }

    /// Validate the server address and produce the descriptor
    pub fn build(self) -> Result<RelaySessionDescriptor, RelayError> {
        let ip: Ipv4Addr = self
            .ipv4
            .parse()
            .map_err(|_| RelayError::InvalidAddress(self.ipv4.clone()))?;

        Ok(RelaySessionDescriptor {
            server: SocketAddrV4::new(ip, self.port),
            allocation_id: self.allocation_id,
            connection_data: self.connection_data,
            host_connection_data: self.host_connection_data,
            key: self.key,
            secure: self.secure,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::relay::allocation::RelayServer;
    use uuid::Uuid;

    #[test]
    fn test_builder_defaults_to_empty_fields() {
        let descriptor = RelaySessionDescriptor::builder("203.0.113.5", 7777)
            .build()
            .unwrap();

        assert_eq!(descriptor.server().to_string(), "203.0.113.5:7777");
        assert!(descriptor.allocation_id().is_empty());
        assert!(descriptor.connection_data().is_empty());
        assert!(descriptor.host_connection_data().is_empty());
        assert!(descriptor.key().is_empty());
        assert!(!descriptor.is_secure());
        assert!(!descriptor.is_joining());
    }

    #[test]
    fn test_builder_copies_fields() {
        let descriptor = RelaySessionDescriptor::builder("203.0.113.5", 7777)
            .allocation_id([0xAA])
            .key([0xBB])
            .connection_data([0xCC])
            .host_connection_data(None::<&[u8]>)
            .secure(true)
            .build()
            .unwrap();

        assert_eq!(&descriptor.allocation_id()[..], &[0xAA]);
        assert_eq!(&descriptor.key()[..], &[0xBB]);
        assert_eq!(&descriptor.connection_data()[..], &[0xCC]);
        assert!(descriptor.host_connection_data().is_empty());
        assert!(descriptor.is_secure());
    }

    #[test]
    fn test_invalid_address() {
        let result = RelaySessionDescriptor::builder("relay.example", 7777).build();
        assert_eq!(
            result,
            Err(RelayError::InvalidAddress("relay.example".to_string()))
        );

        // IPv6 relay endpoints are not supported
        let result = RelaySessionDescriptor::builder("::1", 7777).build();
        assert!(result.is_err());
    }

    #[test]
    fn test_from_join_allocation() {
        let allocation_id = Uuid::new_v4();
        let join = JoinAllocation {
            allocation_id,
            relay_server: RelayServer {
                ipv4: "198.51.100.7".to_string(),
                port: 443,
            },
            key: Bytes::from_static(&[1, 2, 3]),
            connection_data: Bytes::from_static(&[4, 5]),
            host_connection_data: Bytes::from_static(&[6, 7, 8]),
        };

        let descriptor = RelaySessionDescriptor::from_join_allocation(&join, false).unwrap();
        assert_eq!(&descriptor.allocation_id()[..], allocation_id.as_bytes());
        assert_eq!(&descriptor.host_connection_data()[..], &[6, 7, 8]);
        assert!(descriptor.is_joining());
    }

    #[test]
    fn test_debug_hides_key() {
        let descriptor = RelaySessionDescriptor::builder("203.0.113.5", 7777)
            .key([0x5E, 0xC2])
            .build()
            .unwrap();

        let debug = format!("{:?}", descriptor);
        assert!(debug.contains("key_len: 2"));
        assert!(!debug.contains("94")); // 0x5E
    }
}
