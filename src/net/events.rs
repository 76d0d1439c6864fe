//! Transport events
//!
//! Notifications raised by a transport while it is polled. Listeners are
//! invoked synchronously, in registration order, as each event is popped
//! from the driver; nothing is queued between polls.

use bytes::Bytes;

use crate::net::slots::PeerId;

/// Channel identifier as used by the upstream networking layer
pub type ChannelId = u8;

/// The reliable, ordered channel; every inbound packet is reported on it
pub const RELIABLE_CHANNEL: ChannelId = 0;

/// Notification delivered to the upstream networking layer
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// The client connection has been established
    ClientConnected,
    /// A packet arrived on the client connection
    ClientDataReceived { payload: Bytes, channel: ChannelId },
    /// The client connection was closed by the remote end or the relay
    ClientDisconnected,
    /// A peer connected to the server
    ServerConnected { peer: PeerId, address: String },
    /// A packet arrived from a peer
    ServerDataReceived {
        peer: PeerId,
        payload: Bytes,
        channel: ChannelId,
    },
    /// A peer disconnected from the server
    ServerDisconnected { peer: PeerId },
}

/// Observer of transport events
pub trait TransportListener {
    fn on_event(&mut self, event: &TransportEvent);
}

impl<F> TransportListener for F
where
    F: FnMut(&TransportEvent),
{
    fn on_event(&mut self, event: &TransportEvent) {
        self(event)
    }
}

/// Registered listeners of a transport
#[derive(Default)]
pub struct EventDispatcher {
    listeners: Vec<Box<dyn TransportListener>>,
}

impl EventDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a listener
    pub fn subscribe(&mut self, listener: impl TransportListener + 'static) {
        self.listeners.push(Box::new(listener));
    }

    /// Deliver an event to every listener
    pub fn dispatch(&mut self, event: TransportEvent) {
        for listener in &mut self.listeners {
            listener.on_event(&event);
        }
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.len()
    }
}

impl std::fmt::Debug for EventDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventDispatcher")
            .field("listeners", &self.listeners.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;

    #[test]
    fn test_dispatch_in_registration_order() {
        let log = Rc::new(RefCell::new(Vec::new()));
        let mut dispatcher = EventDispatcher::new();

        let first = log.clone();
        dispatcher.subscribe(move |event: &TransportEvent| {
            first.borrow_mut().push(("first", event.clone()));
        });
        let second = log.clone();
        dispatcher.subscribe(move |event: &TransportEvent| {
            second.borrow_mut().push(("second", event.clone()));
        });

        dispatcher.dispatch(TransportEvent::ServerDisconnected { peer: 4 });

        let log = log.borrow();
        assert_eq!(log.len(), 2);
        assert_eq!(log[0].0, "first");
        assert_eq!(log[1].0, "second");
        assert_eq!(log[1].1, TransportEvent::ServerDisconnected { peer: 4 });
    }

    #[test]
    fn test_dispatch_without_listeners() {
        let mut dispatcher = EventDispatcher::new();
        dispatcher.dispatch(TransportEvent::ClientConnected);
        assert_eq!(dispatcher.listener_count(), 0);
    }
}
