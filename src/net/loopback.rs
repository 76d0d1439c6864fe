//! In-process relay and packet driver
//!
//! `LoopbackRelay` plays both parts of a relay deployment inside one thread:
//! - The relay service: hands out host allocations, join codes and join allocations
//! - The relay server: routes packets between drivers bound to those allocations
//!
//! Hosts listen under their allocation's connection data; joining peers reach
//! them through the host connection data of their join allocation. Traffic is
//! staged at the receiving endpoint and only becomes visible after that
//! endpoint's next `update()`, which mirrors a driver's update pass.

use std::cell::RefCell;
use std::collections::{HashMap, VecDeque};
use std::rc::Rc;

use bytes::Bytes;
use rand::Rng;
use tracing::{debug, trace, warn};
use uuid::Uuid;

use crate::error::{DriverError, RelayError};
use crate::net::driver::{
    ConnectionHandle, ConnectionState, DriverFactory, NetworkEvent, PacketDriver, SendBuffer,
    MAX_PAYLOAD_SIZE,
};
use crate::relay::{Allocation, JoinAllocation, RelayServer, RelaySessionDescriptor};

/// Length of generated join codes
pub const JOIN_CODE_LENGTH: usize = 6;

/// Join code alphabet (no 0/O or 1/I)
const JOIN_CODE_CHARSET: &[u8] = b"ABCDEFGHJKLMNPQRSTUVWXYZ23456789";

/// Size of generated keys and connection data
const TOKEN_SIZE: usize = 16;

type EndpointId = u64;

/// Allocation known to the relay
#[derive(Debug, Clone)]
struct AllocationRecord {
    key: Bytes,
    /// Only set for host allocations
    max_connections: Option<usize>,
}

/// Other end of a routed connection
#[derive(Debug, Clone, Copy)]
struct Remote {
    endpoint: EndpointId,
    connection: ConnectionHandle,
}

/// Traffic delivered to an endpoint but not yet visible to it
#[derive(Debug)]
enum Staged {
    Accept(ConnectionHandle),
    Event(ConnectionHandle, NetworkEvent),
}

#[derive(Debug)]
struct ConnectionEntry {
    generation: u32,
    free: bool,
    incoming: bool,
    state: ConnectionState,
    remote: Option<Remote>,
    events: VecDeque<NetworkEvent>,
}

/// Relay-side state of one driver
#[derive(Debug)]
struct Endpoint {
    descriptor: RelaySessionDescriptor,
    bound: bool,
    listening: bool,
    max_connections: usize,
    connections: Vec<ConnectionEntry>,
    staged: VecDeque<Staged>,
    accept_queue: VecDeque<ConnectionHandle>,
    pending_connects: Vec<ConnectionHandle>,
}

impl Endpoint {
    fn new(descriptor: RelaySessionDescriptor) -> Self {
        Self {
            descriptor,
            bound: false,
            listening: false,
            max_connections: usize::MAX,
            connections: Vec::new(),
            staged: VecDeque::new(),
            accept_queue: VecDeque::new(),
            pending_connects: Vec::new(),
        }
    }

    /// Open a connection, reusing a free table position when there is one
    fn open(&mut self, incoming: bool, state: ConnectionState) -> ConnectionHandle {
        if let Some(index) = self.connections.iter().position(|entry| entry.free) {
            let entry = &mut self.connections[index];
            entry.generation = entry.generation.wrapping_add(1);
            entry.free = false;
            entry.incoming = incoming;
            entry.state = state;
            entry.remote = None;
            entry.events.clear();
            return ConnectionHandle::new(index as u32, entry.generation);
        }

        self.connections.push(ConnectionEntry {
            generation: 0,
            free: false,
            incoming,
            state,
            remote: None,
            events: VecDeque::new(),
        });
        ConnectionHandle::new((self.connections.len() - 1) as u32, 0)
    }

    fn entry(&self, handle: ConnectionHandle) -> Option<&ConnectionEntry> {
        self.connections
            .get(handle.index() as usize)
            .filter(|entry| !entry.free && entry.generation == handle.generation())
    }

    fn entry_mut(&mut self, handle: ConnectionHandle) -> Option<&mut ConnectionEntry> {
        self.connections
            .get_mut(handle.index() as usize)
            .filter(|entry| !entry.free && entry.generation == handle.generation())
    }

    fn live_incoming(&self) -> usize {
        self.connections
            .iter()
            .filter(|entry| {
                !entry.free && entry.incoming && entry.state != ConnectionState::Disconnected
            })
            .count()
    }
}

/// Shared relay state
#[derive(Debug)]
struct RelayHub {
    server: RelayServer,
    allocations: HashMap<Bytes, AllocationRecord>,
    /// Host connection data by allocation, for join allocations
    hosts: HashMap<Uuid, Bytes>,
    join_codes: HashMap<String, Uuid>,
    /// Listening endpoint by connection data
    listeners: HashMap<Bytes, EndpointId>,
    endpoints: HashMap<EndpointId, Endpoint>,
    next_endpoint: EndpointId,
}

impl RelayHub {
    fn new(server: RelayServer) -> Self {
        Self {
            server,
            allocations: HashMap::new(),
            hosts: HashMap::new(),
            join_codes: HashMap::new(),
            listeners: HashMap::new(),
            endpoints: HashMap::new(),
            next_endpoint: 1,
        }
    }

    fn endpoint(&self, id: EndpointId) -> Result<&Endpoint, DriverError> {
        self.endpoints.get(&id).ok_or(DriverError::Released)
    }

    fn endpoint_mut(&mut self, id: EndpointId) -> Result<&mut Endpoint, DriverError> {
        self.endpoints.get_mut(&id).ok_or(DriverError::Released)
    }

    /// Deliver traffic to a remote endpoint, dropping it if the endpoint is gone
    fn stage(&mut self, endpoint: EndpointId, staged: Staged) {
        if let Some(target) = self.endpoints.get_mut(&endpoint) {
            target.staged.push_back(staged);
        }
    }

    /// Forget the way back from a remote connection to us
    fn unlink(&mut self, remote: Remote) {
        if let Some(entry) = self
            .endpoints
            .get_mut(&remote.endpoint)
            .and_then(|endpoint| endpoint.entry_mut(remote.connection))
        {
            entry.remote = None;
        }
    }

    fn create_endpoint(&mut self, descriptor: &RelaySessionDescriptor) -> EndpointId {
        let id = self.next_endpoint;
        self.next_endpoint += 1;
        self.endpoints.insert(id, Endpoint::new(descriptor.clone()));
        debug!(endpoint = id, server = %descriptor.server(), "Relay endpoint created");
        id
    }

    fn bind(&mut self, id: EndpointId) -> Result<(), DriverError> {
        let endpoint = self.endpoints.get_mut(&id).ok_or(DriverError::Released)?;
        let descriptor = &endpoint.descriptor;

        let record = self
            .allocations
            .get(descriptor.allocation_id())
            .ok_or_else(|| DriverError::BindFailed("unknown allocation".to_string()))?;
        if record.key != *descriptor.key() {
            return Err(DriverError::BindFailed("key mismatch".to_string()));
        }

        endpoint.bound = true;
        if let Some(max) = record.max_connections {
            endpoint.max_connections = max;
        }
        Ok(())
    }

    fn listen(&mut self, id: EndpointId) -> Result<(), DriverError> {
        let endpoint = self.endpoint(id)?;
        if !endpoint.bound {
            return Err(DriverError::ListenFailed("not bound".to_string()));
        }

        let key = endpoint.descriptor.connection_data().clone();
        if key.is_empty() {
            return Err(DriverError::ListenFailed(
                "missing connection data".to_string(),
            ));
        }
        if let Some(owner) = self.listeners.get(&key) {
            if *owner != id {
                return Err(DriverError::ListenFailed(
                    "connection data already in use".to_string(),
                ));
            }
        }

        self.listeners.insert(key, id);
        self.endpoint_mut(id)?.listening = true;
        debug!(endpoint = id, "Relay endpoint listening");
        Ok(())
    }

    fn connect(&mut self, id: EndpointId) -> Result<ConnectionHandle, DriverError> {
        let endpoint = self.endpoint_mut(id)?;
        let handle = endpoint.open(false, ConnectionState::Connecting);
        endpoint.pending_connects.push(handle);
        trace!(endpoint = id, connection = %handle, "Connect requested");
        Ok(handle)
    }

    fn accept(&mut self, id: EndpointId) -> Option<ConnectionHandle> {
        let endpoint = self.endpoints.get_mut(&id)?;
        while let Some(handle) = endpoint.accept_queue.pop_front() {
            if endpoint.entry(handle).is_some() {
                return Some(handle);
            }
        }
        None
    }

    fn update(&mut self, id: EndpointId) {
        let Some(endpoint) = self.endpoints.get_mut(&id) else {
            return;
        };

        while let Some(staged) = endpoint.staged.pop_front() {
            match staged {
                Staged::Accept(handle) => {
                    if endpoint.entry(handle).is_some() {
                        endpoint.accept_queue.push_back(handle);
                    }
                }
                Staged::Event(handle, event) => {
                    let Some(entry) = endpoint.entry_mut(handle) else {
                        continue;
                    };
                    if event == NetworkEvent::Disconnect {
                        // Both ends may have closed; report it once
                        if entry.events.contains(&NetworkEvent::Disconnect) {
                            continue;
                        }
                        entry.state = ConnectionState::Disconnected;
                        entry.remote = None;
                    }
                    entry.events.push_back(event);
                }
            }
        }

        let pending = std::mem::take(&mut endpoint.pending_connects);
        for handle in pending {
            self.resolve_connect(id, handle);
        }
    }

    /// Route a pending connect to its host, or refuse it
    fn resolve_connect(&mut self, id: EndpointId, local: ConnectionHandle) {
        let host_key = match self.endpoints.get(&id) {
            Some(endpoint) => match endpoint.entry(local) {
                Some(entry) if entry.state == ConnectionState::Connecting => {
                    endpoint.descriptor.host_connection_data().clone()
                }
                _ => return,
            },
            None => return,
        };

        let host_id = self
            .listeners
            .get(&host_key)
            .copied()
            .filter(|host| *host != id);

        let remote = host_id.and_then(|host_id| {
            let host = self.endpoints.get_mut(&host_id)?;
            if !host.listening {
                return None;
            }
            if host.live_incoming() >= host.max_connections {
                warn!(
                    host = host_id,
                    max = host.max_connections,
                    "Relay host full, refusing connection"
                );
                return None;
            }

            let connection = host.open(true, ConnectionState::Connected);
            if let Some(entry) = host.entry_mut(connection) {
                entry.remote = Some(Remote {
                    endpoint: id,
                    connection: local,
                });
            }
            host.staged.push_back(Staged::Accept(connection));
            Some(Remote {
                endpoint: host_id,
                connection,
            })
        });

        let Some(entry) = self
            .endpoints
            .get_mut(&id)
            .and_then(|endpoint| endpoint.entry_mut(local))
        else {
            return;
        };

        match remote {
            Some(remote) => {
                entry.state = ConnectionState::Connected;
                entry.remote = Some(remote);
                entry.events.push_back(NetworkEvent::Connect);
                debug!(endpoint = id, host = remote.endpoint, "Connection routed to host");
            }
            None => {
                entry.state = ConnectionState::Disconnected;
                entry.events.push_back(NetworkEvent::Disconnect);
                debug!(endpoint = id, "No host reachable, connection refused");
            }
        }
    }

    fn pop_event(&mut self, id: EndpointId, handle: ConnectionHandle) -> Option<NetworkEvent> {
        let entry = self.endpoints.get_mut(&id)?.entry_mut(handle)?;
        let event = entry.events.pop_front()?;
        if event == NetworkEvent::Disconnect {
            entry.free = true;
        }
        Some(event)
    }

    fn connection_state(&self, id: EndpointId, handle: ConnectionHandle) -> ConnectionState {
        self.endpoints
            .get(&id)
            .and_then(|endpoint| endpoint.entry(handle))
            .map(|entry| entry.state)
            .unwrap_or(ConnectionState::Disconnected)
    }

    /// Remote end of a connection that can carry data
    fn route(&self, id: EndpointId, handle: ConnectionHandle) -> Result<Remote, DriverError> {
        let entry = self
            .endpoint(id)?
            .entry(handle)
            .ok_or(DriverError::UnknownConnection(handle))?;

        match (entry.state, entry.remote) {
            (ConnectionState::Connected, Some(remote)) => Ok(remote),
            _ => Err(DriverError::ConnectionClosed(handle)),
        }
    }

    fn end_send(&mut self, id: EndpointId, buffer: SendBuffer) -> Result<usize, DriverError> {
        let remote = self.route(id, buffer.connection())?;
        let payload = buffer.into_payload();
        let size = payload.len();

        trace!(endpoint = id, remote = remote.endpoint, size, "Relaying packet");
        self.stage(
            remote.endpoint,
            Staged::Event(remote.connection, NetworkEvent::Data(payload)),
        );
        Ok(size)
    }

    fn disconnect(&mut self, id: EndpointId, handle: ConnectionHandle) -> Result<(), DriverError> {
        let endpoint = self.endpoint_mut(id)?;
        let entry = endpoint
            .entry_mut(handle)
            .ok_or(DriverError::UnknownConnection(handle))?;
        if entry.state == ConnectionState::Disconnected {
            return Ok(());
        }

        entry.state = ConnectionState::Disconnected;
        let remote = entry.remote.take();
        endpoint.pending_connects.retain(|pending| *pending != handle);
        endpoint
            .staged
            .push_back(Staged::Event(handle, NetworkEvent::Disconnect));

        if let Some(remote) = remote {
            self.unlink(remote);
            self.stage(
                remote.endpoint,
                Staged::Event(remote.connection, NetworkEvent::Disconnect),
            );
        }
        debug!(endpoint = id, connection = %handle, "Connection closed locally");
        Ok(())
    }

    /// Tear down an endpoint and notify every peer it was connected to
    fn release(&mut self, id: EndpointId) {
        let Some(endpoint) = self.endpoints.remove(&id) else {
            return;
        };

        for entry in endpoint.connections.iter().filter(|entry| !entry.free) {
            if let Some(remote) = entry.remote {
                self.unlink(remote);
                self.stage(
                    remote.endpoint,
                    Staged::Event(remote.connection, NetworkEvent::Disconnect),
                );
            }
        }

        if endpoint.listening {
            self.forget_host(&endpoint.descriptor);
        } else if endpoint.descriptor.is_joining() {
            self.allocations.remove(endpoint.descriptor.allocation_id());
        }

        self.listeners.retain(|_, owner| *owner != id);
        debug!(endpoint = id, "Relay endpoint released");
    }

    /// Drop every record of a finished host session; its join code stops resolving
    fn forget_host(&mut self, descriptor: &RelaySessionDescriptor) {
        self.allocations.remove(descriptor.allocation_id());

        let connection_data = descriptor.connection_data();
        let sessions: Vec<Uuid> = self
            .hosts
            .iter()
            .filter(|(_, data)| *data == connection_data)
            .map(|(id, _)| *id)
            .collect();
        self.hosts.retain(|_, data| *data != *connection_data);
        self.join_codes.retain(|_, host| !sessions.contains(host));
    }
}

fn random_token() -> Bytes {
    let token: [u8; TOKEN_SIZE] = rand::thread_rng().gen();
    Bytes::copy_from_slice(&token)
}

fn random_join_code() -> String {
    let mut rng = rand::thread_rng();
    (0..JOIN_CODE_LENGTH)
        .map(|_| JOIN_CODE_CHARSET[rng.gen_range(0..JOIN_CODE_CHARSET.len())] as char)
        .collect()
}

/// Single-threaded in-process relay
///
/// Cloning yields another handle to the same relay.
#[derive(Debug, Clone)]
pub struct LoopbackRelay {
    hub: Rc<RefCell<RelayHub>>,
}

impl LoopbackRelay {
    /// Create a relay announcing itself at 127.0.0.1:7777
    pub fn new() -> Self {
        Self::with_server(RelayServer {
            ipv4: "127.0.0.1".to_string(),
            port: 7777,
        })
    }

    /// Create a relay announcing the given server endpoint in its allocations
    pub fn with_server(server: RelayServer) -> Self {
        Self {
            hub: Rc::new(RefCell::new(RelayHub::new(server))),
        }
    }

    /// Grant a host allocation for up to `max_connections` peers
    pub fn create_allocation(&self, max_connections: usize) -> Allocation {
        let mut hub = self.hub.borrow_mut();
        let allocation = Allocation {
            allocation_id: Uuid::new_v4(),
            relay_server: hub.server.clone(),
            key: random_token(),
            connection_data: random_token(),
            max_connections,
        };

        hub.allocations.insert(
            allocation.allocation_id_bytes(),
            AllocationRecord {
                key: allocation.key.clone(),
                max_connections: Some(max_connections),
            },
        );
        hub.hosts.insert(
            allocation.allocation_id,
            allocation.connection_data.clone(),
        );

        debug!(
            allocation_id = %allocation.allocation_id,
            max_connections,
            "Host allocation created"
        );
        allocation
    }

    /// Join code for a host allocation; repeated calls return the same code
    pub fn join_code(&self, allocation: &Allocation) -> String {
        let mut hub = self.hub.borrow_mut();
        if let Some((code, _)) = hub
            .join_codes
            .iter()
            .find(|(_, id)| **id == allocation.allocation_id)
        {
            return code.clone();
        }

        let code = loop {
            let code = random_join_code();
            if !hub.join_codes.contains_key(&code) {
                break code;
            }
        };
        hub.join_codes.insert(code.clone(), allocation.allocation_id);
        code
    }

    /// Grant an allocation joining the host behind a join code
    pub fn join_allocation(&self, join_code: &str) -> Result<JoinAllocation, RelayError> {
        let mut hub = self.hub.borrow_mut();
        let code = join_code.trim().to_uppercase();

        let host_connection_data = hub
            .join_codes
            .get(&code)
            .and_then(|host| hub.hosts.get(host))
            .cloned()
            .ok_or_else(|| RelayError::UnknownJoinCode(join_code.to_string()))?;

        let allocation = JoinAllocation {
            allocation_id: Uuid::new_v4(),
            relay_server: hub.server.clone(),
            key: random_token(),
            connection_data: random_token(),
            host_connection_data,
        };

        hub.allocations.insert(
            allocation.allocation_id_bytes(),
            AllocationRecord {
                key: allocation.key.clone(),
                max_connections: None,
            },
        );

        debug!(join_code = %code, "Join allocation created");
        Ok(allocation)
    }

    /// Number of live drivers
    pub fn endpoint_count(&self) -> usize {
        self.hub.borrow().endpoints.len()
    }

    /// Number of listening hosts
    pub fn listener_count(&self) -> usize {
        self.hub.borrow().listeners.len()
    }

    /// Number of allocations the relay still honours
    pub fn allocation_count(&self) -> usize {
        self.hub.borrow().allocations.len()
    }
}

impl Default for LoopbackRelay {
    fn default() -> Self {
        Self::new()
    }
}

impl DriverFactory for LoopbackRelay {
    type Driver = LoopbackDriver;

    fn create(
        &mut self,
        descriptor: &RelaySessionDescriptor,
    ) -> Result<LoopbackDriver, DriverError> {
        let endpoint = self.hub.borrow_mut().create_endpoint(descriptor);
        Ok(LoopbackDriver {
            hub: self.hub.clone(),
            endpoint,
        })
    }
}

/// Packet driver attached to a [`LoopbackRelay`]
#[derive(Debug)]
pub struct LoopbackDriver {
    hub: Rc<RefCell<RelayHub>>,
    endpoint: EndpointId,
}

impl PacketDriver for LoopbackDriver {
    fn bind(&mut self) -> Result<(), DriverError> {
        self.hub.borrow_mut().bind(self.endpoint)
    }

    fn listen(&mut self) -> Result<(), DriverError> {
        self.hub.borrow_mut().listen(self.endpoint)
    }

    fn connect(&mut self) -> Result<ConnectionHandle, DriverError> {
        self.hub.borrow_mut().connect(self.endpoint)
    }

    fn accept(&mut self) -> Option<ConnectionHandle> {
        self.hub.borrow_mut().accept(self.endpoint)
    }

    fn update(&mut self) {
        self.hub.borrow_mut().update(self.endpoint);
    }

    fn pop_event(&mut self, connection: ConnectionHandle) -> Option<NetworkEvent> {
        self.hub.borrow_mut().pop_event(self.endpoint, connection)
    }

    fn connection_state(&self, connection: ConnectionHandle) -> ConnectionState {
        self.hub.borrow().connection_state(self.endpoint, connection)
    }

    fn begin_send(&mut self, connection: ConnectionHandle) -> Result<SendBuffer, DriverError> {
        self.hub.borrow().route(self.endpoint, connection)?;
        Ok(SendBuffer::new(connection, MAX_PAYLOAD_SIZE))
    }

    fn end_send(&mut self, buffer: SendBuffer) -> Result<usize, DriverError> {
        self.hub.borrow_mut().end_send(self.endpoint, buffer)
    }

    fn disconnect(&mut self, connection: ConnectionHandle) -> Result<(), DriverError> {
        self.hub.borrow_mut().disconnect(self.endpoint, connection)
    }
}

impl Drop for LoopbackDriver {
    fn drop(&mut self) {
        self.hub.borrow_mut().release(self.endpoint);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn host_driver(relay: &mut LoopbackRelay, max: usize) -> (LoopbackDriver, String) {
        let allocation = relay.create_allocation(max);
        let code = relay.join_code(&allocation);
        let descriptor = RelaySessionDescriptor::from_allocation(&allocation, false).unwrap();
        let mut driver = relay.create(&descriptor).unwrap();
        driver.bind().unwrap();
        driver.listen().unwrap();
        (driver, code)
    }

    fn client_driver(relay: &mut LoopbackRelay, code: &str) -> LoopbackDriver {
        let join = relay.join_allocation(code).unwrap();
        let descriptor = RelaySessionDescriptor::from_join_allocation(&join, false).unwrap();
        relay.create(&descriptor).unwrap()
    }

    #[test]
    fn test_join_code_format() {
        let relay = LoopbackRelay::new();
        let allocation = relay.create_allocation(4);
        let code = relay.join_code(&allocation);

        assert_eq!(code.len(), JOIN_CODE_LENGTH);
        assert!(code.bytes().all(|b| JOIN_CODE_CHARSET.contains(&b)));
        assert_eq!(relay.join_code(&allocation), code);
    }

    #[test]
    fn test_unknown_join_code() {
        let relay = LoopbackRelay::new();
        let err = relay.join_allocation("NOPE42").unwrap_err();
        assert_eq!(err, RelayError::UnknownJoinCode("NOPE42".to_string()));
    }

    #[test]
    fn test_join_code_case_insensitive() {
        let relay = LoopbackRelay::new();
        let allocation = relay.create_allocation(4);
        let code = relay.join_code(&allocation);

        let join = relay.join_allocation(&code.to_lowercase()).unwrap();
        assert_eq!(join.host_connection_data, allocation.connection_data);
    }

    #[test]
    fn test_bind_unknown_allocation() {
        let mut relay = LoopbackRelay::new();
        let descriptor = RelaySessionDescriptor::builder("127.0.0.1", 7777)
            .allocation_id([0xAA])
            .connection_data([0xCC])
            .build()
            .unwrap();
        let mut driver = relay.create(&descriptor).unwrap();

        assert!(matches!(driver.bind(), Err(DriverError::BindFailed(_))));
        assert!(matches!(driver.listen(), Err(DriverError::ListenFailed(_))));
    }

    #[test]
    fn test_bind_key_mismatch() {
        let mut relay = LoopbackRelay::new();
        let allocation = relay.create_allocation(4);
        let descriptor = RelaySessionDescriptor::builder("127.0.0.1", 7777)
            .allocation_id(allocation.allocation_id_bytes())
            .connection_data(&allocation.connection_data)
            .key([0x00])
            .build()
            .unwrap();
        let mut driver = relay.create(&descriptor).unwrap();

        assert_eq!(
            driver.bind(),
            Err(DriverError::BindFailed("key mismatch".to_string()))
        );
    }

    #[test]
    fn test_connect_accept_and_data() {
        let mut relay = LoopbackRelay::new();
        let (mut host, code) = host_driver(&mut relay, 4);
        let mut client = client_driver(&mut relay, &code);

        let connection = client.connect().unwrap();
        assert_eq!(client.connection_state(connection), ConnectionState::Connecting);

        // Nothing is visible before the update pass
        assert_eq!(client.pop_event(connection), None);
        client.update();
        assert_eq!(client.pop_event(connection), Some(NetworkEvent::Connect));
        assert_eq!(client.connection_state(connection), ConnectionState::Connected);

        let mut buffer = client.begin_send(connection).unwrap();
        buffer.write_bytes(b"ping").unwrap();
        assert_eq!(client.end_send(buffer).unwrap(), 4);

        assert_eq!(host.accept(), None);
        host.update();
        let accepted = host.accept().unwrap();
        assert_eq!(host.accept(), None);
        assert_eq!(
            host.pop_event(accepted),
            Some(NetworkEvent::Data(Bytes::from_static(b"ping")))
        );
        assert_eq!(host.pop_event(accepted), None);
    }

    #[test]
    fn test_connect_without_host() {
        let mut relay = LoopbackRelay::new();
        let (host, code) = host_driver(&mut relay, 4);
        let mut client = client_driver(&mut relay, &code);
        drop(host);
        assert_eq!(relay.listener_count(), 0);

        let connection = client.connect().unwrap();
        client.update();

        assert_eq!(client.pop_event(connection), Some(NetworkEvent::Disconnect));
        assert_eq!(client.connection_state(connection), ConnectionState::Disconnected);
    }

    #[test]
    fn test_host_full_refuses() {
        let mut relay = LoopbackRelay::new();
        let (_host, code) = host_driver(&mut relay, 1);

        let mut first = client_driver(&mut relay, &code);
        let first_conn = first.connect().unwrap();
        first.update();
        assert_eq!(first.pop_event(first_conn), Some(NetworkEvent::Connect));

        let mut second = client_driver(&mut relay, &code);
        let second_conn = second.connect().unwrap();
        second.update();
        assert_eq!(second.pop_event(second_conn), Some(NetworkEvent::Disconnect));
    }

    #[test]
    fn test_disconnect_notifies_both_ends() {
        let mut relay = LoopbackRelay::new();
        let (mut host, code) = host_driver(&mut relay, 4);
        let mut client = client_driver(&mut relay, &code);

        let connection = client.connect().unwrap();
        client.update();
        client.pop_event(connection);
        host.update();
        let accepted = host.accept().unwrap();

        host.disconnect(accepted).unwrap();
        // Idempotent
        host.disconnect(accepted).unwrap();
        assert!(matches!(
            host.begin_send(accepted),
            Err(DriverError::ConnectionClosed(_))
        ));

        host.update();
        assert_eq!(host.pop_event(accepted), Some(NetworkEvent::Disconnect));
        // Handle is stale once the disconnect has been popped
        assert_eq!(host.pop_event(accepted), None);
        assert!(matches!(
            host.disconnect(accepted),
            Err(DriverError::UnknownConnection(_))
        ));

        client.update();
        assert_eq!(client.pop_event(connection), Some(NetworkEvent::Disconnect));
    }

    #[test]
    fn test_released_driver_disconnects_peers() {
        let mut relay = LoopbackRelay::new();
        let (host, code) = host_driver(&mut relay, 4);
        let mut client = client_driver(&mut relay, &code);

        let connection = client.connect().unwrap();
        client.update();
        client.pop_event(connection);
        assert_eq!(relay.endpoint_count(), 2);

        drop(host);
        assert_eq!(relay.endpoint_count(), 1);

        client.update();
        assert_eq!(client.pop_event(connection), Some(NetworkEvent::Disconnect));
    }

    #[test]
    fn test_handle_reuse_bumps_generation() {
        let mut relay = LoopbackRelay::new();
        let (_host, code) = host_driver(&mut relay, 4);
        let mut client = client_driver(&mut relay, &code);

        let first = client.connect().unwrap();
        client.disconnect(first).unwrap();
        client.update();
        assert_eq!(client.pop_event(first), Some(NetworkEvent::Disconnect));

        let second = client.connect().unwrap();
        assert_eq!(second.index(), first.index());
        assert_ne!(second.generation(), first.generation());
        assert_eq!(client.connection_state(first), ConnectionState::Disconnected);
    }

    #[test]
    fn test_released_host_forgets_session() {
        let mut relay = LoopbackRelay::new();
        let (host, code) = host_driver(&mut relay, 4);
        let client = client_driver(&mut relay, &code);
        assert_eq!(relay.allocation_count(), 2);

        drop(client);
        assert_eq!(relay.allocation_count(), 1);

        drop(host);
        assert_eq!(relay.allocation_count(), 0);
        assert_eq!(
            relay.join_allocation(&code).unwrap_err(),
            RelayError::UnknownJoinCode(code.clone())
        );
    }

    #[test]
    fn test_unlistened_host_keeps_allocation() {
        let mut relay = LoopbackRelay::new();
        let allocation = relay.create_allocation(4);
        let descriptor = RelaySessionDescriptor::from_allocation(&allocation, false).unwrap();

        let mut driver = relay.create(&descriptor).unwrap();
        driver.bind().unwrap();
        drop(driver);

        // A failed start can be retried against the same allocation
        let mut driver = relay.create(&descriptor).unwrap();
        driver.bind().unwrap();
        driver.listen().unwrap();
        assert_eq!(relay.listener_count(), 1);
    }
}
