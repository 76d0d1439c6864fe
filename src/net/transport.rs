//! Relay transport
//!
//! Implements the upstream transport contract on top of a packet driver whose
//! traffic is routed through a relay session:
//! - One client connection, or an append-only list of server connections
//! - Mapping between driver connection handles and upstream peer IDs
//! - One event pump per tick, surfacing connect, data and disconnect events
//!
//! Everything runs on the thread that calls [`Transport::poll`]. Failures are
//! logged and reported to the caller; sends to unknown or dead peers are
//! dropped silently.

use std::fmt;

use tracing::{debug, error, info, trace, warn};

use crate::config::TransportConfig;
use crate::error::{DriverError, RelayError, Result, TransportError};
use crate::net::driver::{
    ConnectionHandle, ConnectionState, DriverFactory, NetworkEvent, PacketDriver,
};
use crate::net::events::{
    ChannelId, EventDispatcher, TransportEvent, TransportListener, RELIABLE_CHANNEL,
};
use crate::net::slots::{peer_id_for_slot, ConnectionSlots, PeerId};
use crate::relay::RelaySessionDescriptor;

/// URI scheme advertised by relay servers
pub const RELAY_SCHEME: &str = "relay";

/// Address reported for every relayed peer; the relay hides real addresses
pub const RELAY_CLIENT_ADDRESS: &str = "RelayClient";

/// Largest payload handed to a single send, on every channel
pub const MAX_PACKET_SIZE: usize = 1200;

/// Transport contract expected by the upstream networking layer
pub trait Transport {
    /// Whether this transport can run on the current platform
    fn available(&self) -> bool;

    /// Start connecting to a host; completion is reported by a later poll
    fn client_connect(&mut self, address: &str) -> Result<()>;

    fn client_connected(&self) -> bool;

    fn client_disconnect(&mut self);

    fn client_send(&mut self, payload: &[u8], channel: ChannelId);

    /// Start accepting peers
    fn server_start(&mut self) -> Result<()>;

    fn server_active(&self) -> bool;

    fn server_send(&mut self, peer: PeerId, payload: &[u8], channel: ChannelId);

    fn server_disconnect(&mut self, peer: PeerId);

    fn server_client_address(&self, peer: PeerId) -> String;

    fn server_stop(&mut self);

    fn server_uri(&self) -> String;

    /// Largest payload accepted by a single send on a channel
    fn max_packet_size(&self, channel: ChannelId) -> usize;

    /// Pump driver events; call exactly once per tick
    fn poll(&mut self);

    /// Stop both roles and release every driver
    fn shutdown(&mut self);
}

/// Client role lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ClientState {
    /// No connection attempt made
    Idle,
    /// Connect issued, waiting for the driver's Connect event
    Connecting,
    /// Connection established
    Connected,
    /// Connection closed by the remote end or the relay
    Disconnected,
}

impl ClientState {
    pub fn name(&self) -> &'static str {
        match self {
            ClientState::Idle => "Idle",
            ClientState::Connecting => "Connecting",
            ClientState::Connected => "Connected",
            ClientState::Disconnected => "Disconnected",
        }
    }
}

impl fmt::Display for ClientState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// Server role lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ServerState {
    /// Not started, or stopped
    Idle,
    /// Bound and listening, not yet polled
    Listening,
    /// Polled at least once
    Active,
}

impl ServerState {
    pub fn name(&self) -> &'static str {
        match self {
            ServerState::Idle => "Idle",
            ServerState::Listening => "Listening",
            ServerState::Active => "Active",
        }
    }
}

impl fmt::Display for ServerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// Traffic counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TransportStats {
    pub packets_sent: u64,
    pub bytes_sent: u64,
    pub packets_received: u64,
    pub bytes_received: u64,
    /// Sends that never reached a driver, or that the driver rejected
    pub dropped_sends: u64,
}

/// Connection adapter between the upstream transport contract and a relay-routed packet driver
pub struct RelayTransport<F: DriverFactory> {
    factory: F,
    max_connections: usize,
    descriptor: Option<RelaySessionDescriptor>,
    client_driver: Option<F::Driver>,
    client_connection: Option<ConnectionHandle>,
    client_state: ClientState,
    server_driver: Option<F::Driver>,
    server_connections: Option<ConnectionSlots>,
    server_state: ServerState,
    events: EventDispatcher,
    stats: TransportStats,
}

impl<F: DriverFactory> RelayTransport<F> {
    /// Create a transport with default settings
    pub fn new(factory: F) -> Self {
        Self::with_config(factory, &TransportConfig::default())
    }

    /// Create a transport using the limits from a configuration
    pub fn with_config(factory: F, config: &TransportConfig) -> Self {
        Self {
            factory,
            max_connections: config.max_connections,
            descriptor: None,
            client_driver: None,
            client_connection: None,
            client_state: ClientState::Idle,
            server_driver: None,
            server_connections: None,
            server_state: ServerState::Idle,
            events: EventDispatcher::new(),
            stats: TransportStats::default(),
        }
    }

    /// Set the relay session used by the next connect or start; last write wins
    pub fn configure(&mut self, descriptor: RelaySessionDescriptor) {
        info!(
            relay = %descriptor.server(),
            joining = descriptor.is_joining(),
            secure = descriptor.is_secure(),
            "Relay data set"
        );
        self.descriptor = Some(descriptor);
    }

    pub fn relay_descriptor(&self) -> Option<&RelaySessionDescriptor> {
        self.descriptor.as_ref()
    }

    /// Register a listener for transport events
    pub fn subscribe(&mut self, listener: impl TransportListener + 'static) {
        self.events.subscribe(listener);
    }

    pub fn client_state(&self) -> ClientState {
        self.client_state
    }

    pub fn server_state(&self) -> ServerState {
        self.server_state
    }

    /// Number of peers currently connected to the server
    pub fn connection_count(&self) -> usize {
        self.server_connections
            .as_ref()
            .map(ConnectionSlots::live_count)
            .unwrap_or(0)
    }

    /// Live peers in connection order
    pub fn peers(&self) -> Vec<PeerId> {
        self.server_connections
            .as_ref()
            .map(|slots| slots.iter_live().map(|(peer, _)| peer).collect())
            .unwrap_or_default()
    }

    pub fn stats(&self) -> TransportStats {
        self.stats
    }

    /// Copy a payload into a driver send buffer and send it as one packet
    fn send_packet(
        driver: &mut F::Driver,
        connection: ConnectionHandle,
        payload: &[u8],
        stats: &mut TransportStats,
    ) {
        let result = match driver.begin_send(connection) {
            Ok(mut buffer) => match buffer.write_bytes(payload) {
                Ok(()) => driver.end_send(buffer),
                Err(e) => Err(e),
            },
            Err(e) => Err(e),
        };

        match result {
            Ok(size) => {
                stats.packets_sent += 1;
                stats.bytes_sent += size as u64;
                trace!(connection = %connection, size, "Packet sent");
            }
            // The peer left but the slot is cleared only on the next poll
            Err(e @ (DriverError::ConnectionClosed(_) | DriverError::UnknownConnection(_))) => {
                stats.dropped_sends += 1;
                trace!(connection = %connection, error = %e, "Send to closed connection dropped");
            }
            Err(e) => {
                stats.dropped_sends += 1;
                warn!(connection = %connection, error = %e, "Send failed");
            }
        }
    }

    fn poll_client(&mut self) {
        let Some(driver) = self.client_driver.as_mut() else {
            return;
        };
        driver.update();

        let Some(connection) = self.client_connection else {
            return;
        };

        while let Some(event) = driver.pop_event(connection) {
            match event {
                NetworkEvent::Connect => {
                    self.client_state = ClientState::Connected;
                    info!(connection = %connection, "Client connected to relay");
                    self.events.dispatch(TransportEvent::ClientConnected);
                }
                NetworkEvent::Data(payload) => {
                    self.stats.packets_received += 1;
                    self.stats.bytes_received += payload.len() as u64;
                    trace!(size = payload.len(), "Client received packet");
                    self.events.dispatch(TransportEvent::ClientDataReceived {
                        payload,
                        channel: RELIABLE_CHANNEL,
                    });
                }
                NetworkEvent::Disconnect => {
                    self.client_connection = None;
                    self.client_state = ClientState::Disconnected;
                    info!(connection = %connection, "Client disconnected by relay");
                    self.events.dispatch(TransportEvent::ClientDisconnected);
                    break;
                }
            }
        }
    }

    fn poll_server(&mut self) {
        let (Some(driver), Some(slots)) = (
            self.server_driver.as_mut(),
            self.server_connections.as_mut(),
        ) else {
            return;
        };
        driver.update();

        if self.server_state == ServerState::Listening {
            self.server_state = ServerState::Active;
            debug!("Server active");
        }

        while let Some(connection) = driver.accept() {
            let peer = slots.push(connection);
            info!(peer, connection = %connection, "Peer connected");
            self.events.dispatch(TransportEvent::ServerConnected {
                peer,
                address: RELAY_CLIENT_ADDRESS.to_string(),
            });
        }

        for index in 0..slots.len() {
            let Some(connection) = slots.handle_at(index) else {
                continue;
            };
            let peer = peer_id_for_slot(index);

            while let Some(event) = driver.pop_event(connection) {
                match event {
                    NetworkEvent::Data(payload) => {
                        self.stats.packets_received += 1;
                        self.stats.bytes_received += payload.len() as u64;
                        trace!(peer, size = payload.len(), "Server received packet");
                        self.events.dispatch(TransportEvent::ServerDataReceived {
                            peer,
                            payload,
                            channel: RELIABLE_CHANNEL,
                        });
                    }
                    NetworkEvent::Disconnect => {
                        slots.clear(peer);
                        info!(peer, connection = %connection, "Peer disconnected");
                        self.events
                            .dispatch(TransportEvent::ServerDisconnected { peer });
                        break;
                    }
                    NetworkEvent::Connect => {
                        trace!(peer, "Ignoring connect event on accepted connection");
                    }
                }
            }
        }
    }
}

impl<F: DriverFactory> Transport for RelayTransport<F> {
    fn available(&self) -> bool {
        cfg!(not(target_arch = "wasm32"))
    }

    fn client_connect(&mut self, address: &str) -> Result<()> {
        let Some(descriptor) = self.descriptor.as_ref() else {
            error!("Client connect requested but relay data not set");
            return Err(RelayError::MissingRelayData.into());
        };

        if matches!(
            self.client_state,
            ClientState::Connecting | ClientState::Connected
        ) {
            warn!(state = %self.client_state, "Client connect requested while already active");
            return Err(TransportError::ClientAlreadyActive);
        }

        // A driver left behind by a remote disconnect is released first
        self.client_driver = None;

        let mut driver = self.factory.create(descriptor).map_err(|e| {
            error!(error = %e, "Failed to create client driver");
            e
        })?;
        let connection = driver.connect().map_err(|e| {
            error!(error = %e, "Client connect failed");
            e
        })?;

        info!(
            relay = %descriptor.server(),
            address,
            connection = %connection,
            "Client connecting to relay"
        );

        self.client_driver = Some(driver);
        self.client_connection = Some(connection);
        self.client_state = ClientState::Connecting;
        Ok(())
    }

    fn client_connected(&self) -> bool {
        if self.client_state != ClientState::Connected {
            return false;
        }
        match (self.client_driver.as_ref(), self.client_connection) {
            (Some(driver), Some(connection)) => {
                driver.connection_state(connection) == ConnectionState::Connected
            }
            _ => false,
        }
    }

    fn client_disconnect(&mut self) {
        if let (Some(driver), Some(connection)) =
            (self.client_driver.as_mut(), self.client_connection.take())
        {
            if let Err(e) = driver.disconnect(connection) {
                debug!(connection = %connection, error = %e, "Client disconnect failed");
            }
            // Flush the disconnect before the driver goes away
            driver.update();
        }

        self.client_state = ClientState::Idle;
        if self.client_driver.take().is_some() {
            self.descriptor = None;
            info!("Client disconnected");
        }
    }

    fn client_send(&mut self, payload: &[u8], _channel: ChannelId) {
        if !self.client_connected() {
            self.stats.dropped_sends += 1;
            trace!(size = payload.len(), "Client send without connection dropped");
            return;
        }
        let (Some(driver), Some(connection)) =
            (self.client_driver.as_mut(), self.client_connection)
        else {
            self.stats.dropped_sends += 1;
            trace!(size = payload.len(), "Client send without connection dropped");
            return;
        };

        Self::send_packet(driver, connection, payload, &mut self.stats);
    }

    fn server_start(&mut self) -> Result<()> {
        let Some(descriptor) = self.descriptor.as_ref() else {
            error!("Server start requested but relay data not set");
            return Err(RelayError::MissingRelayData.into());
        };

        if self.server_driver.is_some() {
            warn!(state = %self.server_state, "Server start requested while already active");
            return Err(TransportError::ServerAlreadyActive);
        }

        let mut driver = self.factory.create(descriptor).map_err(|e| {
            error!(error = %e, "Failed to create server driver");
            e
        })?;

        if let Err(e) = driver.bind() {
            error!(error = %e, "Server failed to bind");
            return Err(e.into());
        }
        if let Err(e) = driver.listen() {
            error!(error = %e, "Server failed to listen");
            return Err(e.into());
        }

        info!(relay = %descriptor.server(), "Server started on relay");

        self.server_driver = Some(driver);
        self.server_connections = Some(ConnectionSlots::with_capacity(self.max_connections));
        self.server_state = ServerState::Listening;
        Ok(())
    }

    fn server_active(&self) -> bool {
        self.server_driver.is_some() && self.server_connections.is_some()
    }

    fn server_send(&mut self, peer: PeerId, payload: &[u8], _channel: ChannelId) {
        let (Some(driver), Some(slots)) = (
            self.server_driver.as_mut(),
            self.server_connections.as_ref(),
        ) else {
            self.stats.dropped_sends += 1;
            return;
        };

        let Some(connection) = slots.get(peer) else {
            self.stats.dropped_sends += 1;
            trace!(peer, "Send to unknown peer dropped");
            return;
        };

        Self::send_packet(driver, connection, payload, &mut self.stats);
    }

    fn server_disconnect(&mut self, peer: PeerId) {
        let (Some(driver), Some(slots)) = (
            self.server_driver.as_mut(),
            self.server_connections.as_ref(),
        ) else {
            return;
        };

        let Some(connection) = slots.get(peer) else {
            trace!(peer, "Disconnect of unknown peer ignored");
            return;
        };

        match driver.disconnect(connection) {
            Ok(()) => debug!(peer, connection = %connection, "Peer disconnect requested"),
            Err(e) => debug!(peer, error = %e, "Peer disconnect failed"),
        }
    }

    fn server_client_address(&self, _peer: PeerId) -> String {
        RELAY_CLIENT_ADDRESS.to_string()
    }

    fn server_stop(&mut self) {
        self.server_connections = None;
        self.server_state = ServerState::Idle;
        if self.server_driver.take().is_some() {
            self.descriptor = None;
            info!("Server stopped");
        }
    }

    fn server_uri(&self) -> String {
        format!("{}://relay", RELAY_SCHEME)
    }

    fn max_packet_size(&self, _channel: ChannelId) -> usize {
        MAX_PACKET_SIZE
    }

    fn poll(&mut self) {
        self.poll_client();
        self.poll_server();
    }

    fn shutdown(&mut self) {
        self.client_disconnect();
        self.server_stop();
        self.descriptor = None;
        debug!("Transport shut down");
    }
}

impl<F: DriverFactory> fmt::Debug for RelayTransport<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RelayTransport")
            .field("descriptor", &self.descriptor)
            .field("client_state", &self.client_state)
            .field("client_connection", &self.client_connection)
            .field("server_state", &self.server_state)
            .field("connection_count", &self.connection_count())
            .field("stats", &self.stats)
            .finish()
    }
}
