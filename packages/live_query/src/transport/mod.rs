//! Transport bindings for the live query socket.
//!
//! A session only talks to the [`Transport`] trait. Opening and sending never
//! block: the binding owns whatever I/O task it needs and hands received
//! frames back through a queue that the session drains on each pump.

mod channel;
mod websocket;

pub use channel::{ChannelPeer, ChannelTransport, ChannelTransportFactory};
pub use websocket::{WebSocketTransport, WebSocketTransportFactory};

use crate::error::TransportError;

/// Connection state reported by a transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportState {
    Connecting,
    Open,
    Closing,
    Closed,
}

/// An item taken off a transport's inbound queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// A complete text frame from the server.
    Frame(String),
    /// A transport-level failure (connect refused, socket error).
    Error(String),
}

/// Bidirectional message channel to the live query server.
pub trait Transport: Send {
    /// Start connecting to `uri`. Returns once the attempt is underway; the
    /// outcome is observed through [`Transport::state`].
    fn open(&mut self, uri: &str) -> Result<(), TransportError>;

    /// Queue a text frame for sending.
    fn send(&mut self, frame: String) -> Result<(), TransportError>;

    fn close(&mut self);

    fn state(&self) -> TransportState;

    /// Take every queued inbound item, in receipt order.
    fn drain(&mut self) -> Vec<TransportEvent>;
}

/// Creates one transport per subscription.
pub trait TransportFactory: Send + Sync {
    fn create(&self, key: &str) -> Box<dyn Transport>;
}
