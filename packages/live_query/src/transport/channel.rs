//! In-process transport for hosts that own the socket themselves.
//!
//! The host (a browser shim, an embedding runtime, or a test) holds the
//! [`ChannelPeer`] half: it reports when the connection opens or drops, feeds
//! server frames in, and collects the frames the session sends out.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use tokio::sync::{mpsc, watch};

use super::{Transport, TransportEvent, TransportFactory, TransportState};
use crate::error::TransportError;

struct Shared {
    state: watch::Sender<TransportState>,
    /// Open immediately instead of waiting for [`ChannelPeer::accept`].
    auto_accept: AtomicBool,
    opens: AtomicUsize,
}

/// Session side of an in-process connection.
pub struct ChannelTransport {
    shared: Arc<Shared>,
    inbound: mpsc::UnboundedReceiver<TransportEvent>,
    outbound: mpsc::UnboundedSender<String>,
}

/// Host side of an in-process connection.
pub struct ChannelPeer {
    shared: Arc<Shared>,
    inbound: mpsc::UnboundedSender<TransportEvent>,
    outbound: mpsc::UnboundedReceiver<String>,
}

impl ChannelTransport {
    /// Create a connected pair. The transport stays `Connecting` after
    /// `open` until the peer calls [`ChannelPeer::accept`].
    pub fn pair() -> (ChannelTransport, ChannelPeer) {
        let (state, _) = watch::channel(TransportState::Closed);
        let shared = Arc::new(Shared {
            state,
            auto_accept: AtomicBool::new(false),
            opens: AtomicUsize::new(0),
        });
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();

        let transport = ChannelTransport {
            shared: shared.clone(),
            inbound: inbound_rx,
            outbound: outbound_tx,
        };
        let peer = ChannelPeer {
            shared,
            inbound: inbound_tx,
            outbound: outbound_rx,
        };
        (transport, peer)
    }

    /// Like [`ChannelTransport::pair`], but every `open` succeeds immediately.
    pub fn auto_accepting() -> (ChannelTransport, ChannelPeer) {
        let (transport, peer) = Self::pair();
        peer.shared.auto_accept.store(true, Ordering::SeqCst);
        (transport, peer)
    }
}

impl Transport for ChannelTransport {
    fn open(&mut self, _uri: &str) -> Result<(), TransportError> {
        if matches!(
            self.state(),
            TransportState::Connecting | TransportState::Open
        ) {
            return Ok(());
        }
        // Frames left over from a previous connection belong to it
        while self.inbound.try_recv().is_ok() {}

        self.shared.opens.fetch_add(1, Ordering::SeqCst);
        let next = if self.shared.auto_accept.load(Ordering::SeqCst) {
            TransportState::Open
        } else {
            TransportState::Connecting
        };
        self.shared.state.send_replace(next);
        Ok(())
    }

    fn send(&mut self, frame: String) -> Result<(), TransportError> {
        if self.state() != TransportState::Open {
            return Err(TransportError::NotOpen);
        }
        self.outbound
            .send(frame)
            .map_err(|_| TransportError::ChannelClosed)
    }

    fn close(&mut self) {
        self.shared.state.send_replace(TransportState::Closed);
    }

    fn state(&self) -> TransportState {
        *self.shared.state.borrow()
    }

    fn drain(&mut self) -> Vec<TransportEvent> {
        let mut events = Vec::new();
        while let Ok(event) = self.inbound.try_recv() {
            events.push(event);
        }
        events
    }
}

impl ChannelPeer {
    /// Report the connection as established.
    pub fn accept(&self) {
        self.shared.state.send_replace(TransportState::Open);
    }

    /// Deliver a server frame.
    pub fn push(&self, frame: impl Into<String>) {
        let _ = self.inbound.send(TransportEvent::Frame(frame.into()));
    }

    /// Drop the connection from the host side, as a network failure would.
    pub fn disconnect(&self, reason: impl Into<String>) {
        let _ = self.inbound.send(TransportEvent::Error(reason.into()));
        self.shared.state.send_replace(TransportState::Closed);
    }

    pub fn state(&self) -> TransportState {
        *self.shared.state.borrow()
    }

    /// How many times the session has opened this transport.
    pub fn open_count(&self) -> usize {
        self.shared.opens.load(Ordering::SeqCst)
    }

    /// Take every frame sent so far.
    pub fn take_sent(&mut self) -> Vec<String> {
        let mut frames = Vec::new();
        while let Ok(frame) = self.outbound.try_recv() {
            frames.push(frame);
        }
        frames
    }

    /// Wait for the next frame the session sends. `None` once the transport
    /// has been dropped.
    pub async fn next_sent(&mut self) -> Option<String> {
        self.outbound.recv().await
    }
}

/// Hands out auto-accepting [`ChannelTransport`]s and forwards each peer,
/// tagged with its subscription key, to the host.
pub struct ChannelTransportFactory {
    peers: mpsc::UnboundedSender<(String, ChannelPeer)>,
}

impl ChannelTransportFactory {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<(String, ChannelPeer)>) {
        let (peers, rx) = mpsc::unbounded_channel();
        (Self { peers }, rx)
    }
}

impl TransportFactory for ChannelTransportFactory {
    fn create(&self, key: &str) -> Box<dyn Transport> {
        let (transport, peer) = ChannelTransport::auto_accepting();
        let _ = self.peers.send((key.to_string(), peer));
        Box::new(transport)
    }
}
