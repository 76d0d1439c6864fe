//! Error handling module
//!
//! Defines the error types for the relay transport.

use thiserror::Error;

use crate::net::driver::ConnectionHandle;

/// Main error type for the relay transport
#[derive(Error, Debug)]
pub enum TransportError {
    /// Packet driver errors
    #[error("Driver error: {0}")]
    Driver(#[from] DriverError),

    /// Relay session errors
    #[error("Relay error: {0}")]
    Relay(#[from] RelayError),

    /// A client connection is already being established or is live
    #[error("Client already active")]
    ClientAlreadyActive,

    /// The server role is already listening
    #[error("Server already active")]
    ServerAlreadyActive,
}

/// Packet driver errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DriverError {
    #[error("Bind failed: {0}")]
    BindFailed(String),

    #[error("Listen failed: {0}")]
    ListenFailed(String),

    #[error("Unknown connection: {0}")]
    UnknownConnection(ConnectionHandle),

    #[error("Connection closed: {0}")]
    ConnectionClosed(ConnectionHandle),

    #[error("Packet too large: {size} bytes (max: {max})")]
    PacketTooLarge { size: usize, max: usize },

    #[error("Driver has been released")]
    Released,
}

/// Relay session errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RelayError {
    #[error("Relay data not set")]
    MissingRelayData,

    #[error("Invalid relay server address: {0}")]
    InvalidAddress(String),

    #[error("Unknown join code: {0}")]
    UnknownJoinCode(String),
}

/// Result type alias for transport operations
pub type Result<T> = std::result::Result<T, TransportError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = RelayError::MissingRelayData;
        assert_eq!(err.to_string(), "Relay data not set");

        let err = DriverError::PacketTooLarge {
            size: 2000,
            max: 1400,
        };
        assert_eq!(err.to_string(), "Packet too large: 2000 bytes (max: 1400)");

        let err = RelayError::InvalidAddress("not-an-ip".to_string());
        assert_eq!(
            err.to_string(),
            "Invalid relay server address: not-an-ip"
        );
    }

    #[test]
    fn test_error_conversion() {
        let err: TransportError = RelayError::MissingRelayData.into();
        assert!(matches!(
            err,
            TransportError::Relay(RelayError::MissingRelayData)
        ));
        assert_eq!(err.to_string(), "Relay error: Relay data not set");

        let err: TransportError = DriverError::Released.into();
        assert_eq!(err.to_string(), "Driver error: Driver has been released");
    }
}
