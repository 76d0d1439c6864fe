//! Relay session module
//!
//! Types describing a relay session:
//! - Allocations as handed out by the relay service (host and joining client)
//! - The session descriptor a driver needs to reach the relay server

pub mod allocation;
pub mod descriptor;

pub use allocation::{Allocation, JoinAllocation, RelayServer};
pub use descriptor::{RelaySessionDescriptor, RelaySessionDescriptorBuilder};
