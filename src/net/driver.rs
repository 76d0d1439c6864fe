//! Packet driver abstraction
//!
//! A packet driver is a connection-oriented datagram engine routed through a
//! relay. It owns the native connection table, its own timeouts and its
//! reliability pipeline. The transport only:
//! - Drives one synchronous update pass per tick
//! - Pops ready events per connection
//! - Writes whole packets through a send buffer

use std::fmt;

use bytes::{Bytes, BytesMut};

use crate::error::DriverError;
use crate::relay::RelaySessionDescriptor;

/// Largest payload a driver accepts in a single packet
pub const MAX_PAYLOAD_SIZE: usize = 1400;

/// Opaque handle to a connection in a driver's connection table
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionHandle {
    index: u32,
    generation: u32,
}

impl ConnectionHandle {
    pub fn new(index: u32, generation: u32) -> Self {
        Self { index, generation }
    }

    /// Position in the driver's connection table
    pub fn index(&self) -> u32 {
        self.index
    }

    /// Incremented each time the table position is reused
    pub fn generation(&self) -> u32 {
        self.generation
    }
}

impl fmt::Display for ConnectionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.index, self.generation)
    }
}

/// Connection state as tracked by the driver
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    /// No such connection, or it has been torn down
    Disconnected,
    /// Connect request issued, waiting for the relay
    Connecting,
    /// Connection established
    Connected,
}

/// Event popped from a connection's queue
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NetworkEvent {
    /// The connection has been established
    Connect,
    /// A packet arrived
    Data(Bytes),
    /// The connection was closed, refused or timed out
    Disconnect,
}

impl NetworkEvent {
    pub fn name(&self) -> &'static str {
        match self {
            NetworkEvent::Connect => "Connect",
            NetworkEvent::Data(_) => "Data",
            NetworkEvent::Disconnect => "Disconnect",
        }
    }
}

/// Driver-owned buffer for exactly one outbound packet
#[derive(Debug)]
pub struct SendBuffer {
    connection: ConnectionHandle,
    data: BytesMut,
    capacity: usize,
}

impl SendBuffer {
    /// Create a send buffer bound to a connection
    pub fn new(connection: ConnectionHandle, capacity: usize) -> Self {
        Self {
            connection,
            data: BytesMut::with_capacity(capacity),
            capacity,
        }
    }

    /// Connection this packet will be sent on
    pub fn connection(&self) -> ConnectionHandle {
        self.connection
    }

    /// Append bytes to the packet
    pub fn write_bytes(&mut self, bytes: &[u8]) -> Result<(), DriverError> {
        let size = self.data.len() + bytes.len();
        if size > self.capacity {
            return Err(DriverError::PacketTooLarge {
                size,
                max: self.capacity,
            });
        }
        self.data.extend_from_slice(bytes);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Bytes still available in this packet
    pub fn remaining(&self) -> usize {
        self.capacity - self.data.len()
    }

    /// Consume the buffer, returning the packet payload
    pub fn into_payload(self) -> Bytes {
        self.data.freeze()
    }
}

/// Connection-oriented packet driver
///
/// All methods are non-blocking. Events caused by remote activity become
/// visible only after [`PacketDriver::update`] has run. Dropping a driver
/// releases it and tears down every connection it owns.
pub trait PacketDriver {
    /// Bind the driver to the relay allocation
    fn bind(&mut self) -> Result<(), DriverError>;

    /// Start accepting incoming connections
    fn listen(&mut self) -> Result<(), DriverError>;

    /// Issue an asynchronous connect; completion surfaces as a Connect event
    fn connect(&mut self) -> Result<ConnectionHandle, DriverError>;

    /// Take the next accepted connection, if any
    fn accept(&mut self) -> Option<ConnectionHandle>;

    /// Run one update pass to completion
    fn update(&mut self);

    /// Pop the next ready event for a connection
    fn pop_event(&mut self, connection: ConnectionHandle) -> Option<NetworkEvent>;

    fn connection_state(&self, connection: ConnectionHandle) -> ConnectionState;

    /// Obtain a buffer for one outbound packet
    fn begin_send(&mut self, connection: ConnectionHandle) -> Result<SendBuffer, DriverError>;

    /// Send a filled buffer as a single packet, returning the bytes sent
    fn end_send(&mut self, buffer: SendBuffer) -> Result<usize, DriverError>;

    /// Request teardown of a connection
    fn disconnect(&mut self, connection: ConnectionHandle) -> Result<(), DriverError>;
}

/// Creates drivers configured with relay parameters
pub trait DriverFactory {
    type Driver: PacketDriver;

    fn create(&mut self, descriptor: &RelaySessionDescriptor) -> Result<Self::Driver, DriverError>;
}
