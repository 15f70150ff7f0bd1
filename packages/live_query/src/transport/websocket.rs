//! Native WebSocket binding over `tokio-tungstenite`.
//!
//! Each `open` spawns a socket task with its own channels, so frames and
//! state from a previous connection can never leak into the next one.

use futures::{SinkExt, StreamExt};
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::{Transport, TransportEvent, TransportFactory, TransportState};
use crate::error::TransportError;

/// Handles for one spawned socket task.
struct Connection {
    state: watch::Receiver<TransportState>,
    inbound: mpsc::UnboundedReceiver<TransportEvent>,
    outbound: mpsc::UnboundedSender<String>,
    cancel: CancellationToken,
    closing: bool,
}

/// WebSocket transport driven by a background tokio task.
#[derive(Default)]
pub struct WebSocketTransport {
    connection: Option<Connection>,
}

impl WebSocketTransport {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Transport for WebSocketTransport {
    fn open(&mut self, uri: &str) -> Result<(), TransportError> {
        if matches!(
            self.state(),
            TransportState::Connecting | TransportState::Open
        ) {
            return Ok(());
        }

        let runtime =
            tokio::runtime::Handle::try_current().map_err(|_| TransportError::NoRuntime)?;

        if let Some(old) = self.connection.take() {
            old.cancel.cancel();
        }

        let (state_tx, state_rx) = watch::channel(TransportState::Connecting);
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();

        runtime.spawn(run_socket(
            uri.to_string(),
            outbound_rx,
            inbound_tx,
            state_tx,
            cancel.clone(),
        ));

        self.connection = Some(Connection {
            state: state_rx,
            inbound: inbound_rx,
            outbound: outbound_tx,
            cancel,
            closing: false,
        });
        Ok(())
    }

    fn send(&mut self, frame: String) -> Result<(), TransportError> {
        if self.state() != TransportState::Open {
            return Err(TransportError::NotOpen);
        }
        let conn = self.connection.as_ref().ok_or(TransportError::NotOpen)?;
        conn.outbound
            .send(frame)
            .map_err(|_| TransportError::ChannelClosed)
    }

    fn close(&mut self) {
        if let Some(conn) = self.connection.as_mut() {
            conn.cancel.cancel();
            conn.closing = true;
        }
    }

    fn state(&self) -> TransportState {
        match &self.connection {
            None => TransportState::Closed,
            Some(conn) => {
                let state = *conn.state.borrow();
                if conn.closing && state != TransportState::Closed {
                    TransportState::Closing
                } else {
                    state
                }
            }
        }
    }

    fn drain(&mut self) -> Vec<TransportEvent> {
        let mut events = Vec::new();
        if let Some(conn) = self.connection.as_mut() {
            while let Ok(event) = conn.inbound.try_recv() {
                events.push(event);
            }
        }
        events
    }
}

impl Drop for WebSocketTransport {
    fn drop(&mut self) {
        if let Some(conn) = &self.connection {
            conn.cancel.cancel();
        }
    }
}

/// Socket task: connect, then pump outbound frames and inbound messages until
/// the server closes, an I/O error occurs, or the transport is cancelled.
async fn run_socket(
    uri: String,
    mut outbound: mpsc::UnboundedReceiver<String>,
    inbound: mpsc::UnboundedSender<TransportEvent>,
    state: watch::Sender<TransportState>,
    cancel: CancellationToken,
) {
    let connected = tokio::select! {
        _ = cancel.cancelled() => {
            state.send_replace(TransportState::Closed);
            return;
        }
        result = tokio_tungstenite::connect_async(uri.as_str()) => result,
    };

    let ws_stream = match connected {
        Ok((stream, _)) => stream,
        Err(e) => {
            warn!(uri = %uri, error = %e, "live query socket connect failed");
            let error = TransportError::Connect(e.to_string());
            let _ = inbound.send(TransportEvent::Error(error.to_string()));
            state.send_replace(TransportState::Closed);
            return;
        }
    };

    debug!(uri = %uri, "live query socket open");
    state.send_replace(TransportState::Open);
    let (mut ws_write, mut ws_read) = ws_stream.split();

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                state.send_replace(TransportState::Closing);
                let _ = ws_write.send(Message::Close(None)).await;
                break;
            }

            Some(frame) = outbound.recv() => {
                if let Err(e) = ws_write.send(Message::Text(frame.into())).await {
                    let _ = inbound.send(TransportEvent::Error(format!("send failed: {e}")));
                    break;
                }
            }

            msg = ws_read.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        let _ = inbound.send(TransportEvent::Frame(text.as_str().to_owned()));
                    }
                    Some(Ok(Message::Binary(bytes))) => {
                        let event = match String::from_utf8(bytes.to_vec()) {
                            Ok(text) => TransportEvent::Frame(text),
                            Err(e) => {
                                warn!(uri = %uri, error = %e, "dropping non-UTF-8 binary frame");
                                let error = TransportError::InvalidUtf8(e.to_string());
                                TransportEvent::Error(error.to_string())
                            }
                        };
                        let _ = inbound.send(event);
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        debug!(uri = %uri, "live query socket closed by server");
                        break;
                    }
                    Some(Ok(_)) => {
                        // Ping/pong are answered by tungstenite itself
                    }
                    Some(Err(e)) => {
                        let _ = inbound.send(TransportEvent::Error(format!("receive failed: {e}")));
                        break;
                    }
                }
            }
        }
    }

    state.send_replace(TransportState::Closed);
}

/// Creates a [`WebSocketTransport`] per subscription.
#[derive(Debug, Clone, Copy, Default)]
pub struct WebSocketTransportFactory;

impl TransportFactory for WebSocketTransportFactory {
    fn create(&self, _key: &str) -> Box<dyn Transport> {
        Box::new(WebSocketTransport::new())
    }
}
