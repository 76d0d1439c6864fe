//! Networking module
//!
//! This module handles the relay-routed connection layer:
//! - Packet driver abstraction and the in-process loopback relay
//! - Server connection slots and peer IDs
//! - Transport events and listeners
//! - The relay transport adapter

pub mod driver;
pub mod events;
pub mod loopback;
pub mod slots;
pub mod transport;
