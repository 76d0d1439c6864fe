//! Relay Transport Library
//!
//! This library adapts a connection-oriented packet driver, routed through a
//! cloud relay, to the transport contract of a higher-level networking layer.
//!
//! ## Modules
//!
//! - `config` - Transport configuration management
//! - `error` - Error types and result definitions
//! - `net` - Packet drivers, connection slots, events and the transport adapter
//! - `relay` - Relay allocations and session descriptors

pub mod config;
pub mod error;
pub mod net;
pub mod relay;

// Re-export commonly used types
pub use config::TransportConfig;
pub use error::{Result, TransportError};
pub use net::events::TransportEvent;
pub use net::loopback::LoopbackRelay;
pub use net::transport::{RelayTransport, Transport};
pub use relay::RelaySessionDescriptor;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
