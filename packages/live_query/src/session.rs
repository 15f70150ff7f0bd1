//! One live query subscription and its socket handshake.
//!
//! A session is driven entirely by [`SubscriptionSession::pump`]: each call
//! drains whatever the transport has received, dispatches it to the handler
//! in receipt order, reacts to a dropped socket, and then sends at most one
//! handshake frame (connect, subscribe or unsubscribe).

use std::sync::Arc;

use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::codec::{Codec, JsonCodec};
use crate::config::{ClientConfig, ReconnectPolicy};
use crate::error::{LiveQueryError, Result};
use crate::handler::EventHandler;
use crate::protocol::{ClientRequest, ErrorEvent, InboundEvent, validate_server_uri};
use crate::transport::{Transport, TransportEvent, TransportState};

/// Lifecycle of a session. `Closed` and `Error` are terminal until
/// [`SubscriptionSession::renew_subscription`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    New,
    Opening,
    Open,
    Closing,
    Closed,
    Error,
}

impl ConnectionState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Closed | Self::Error)
    }
}

/// Which handshake frames have gone out on the current connection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HandshakeFlags {
    pub connect_sent: bool,
    pub subscribe_sent: bool,
    pub unsubscribe_sent: bool,
}

pub struct SubscriptionSession {
    key: String,
    request_id: u64,
    server_uri: String,
    connect_request: ClientRequest,
    /// Encoded on the first `subscribe()`.
    connect_frame: Option<String>,
    subscribe_request: ClientRequest,

    state: ConnectionState,
    flags: HandshakeFlags,
    connect_acked: bool,
    reconnect_forbidden: bool,
    paused: bool,

    reconnect: ReconnectPolicy,
    reconnect_attempt: u32,
    reconnect_at: Option<Instant>,

    transport: Box<dyn Transport>,
    codec: Arc<dyn Codec>,
    handler: Box<dyn EventHandler>,
}

impl SubscriptionSession {
    /// Create a session in state `New`. Nothing is opened until
    /// [`SubscriptionSession::subscribe`].
    pub fn new(
        key: impl Into<String>,
        request_id: u64,
        subscribe_request: ClientRequest,
        config: &ClientConfig,
        transport: Box<dyn Transport>,
        handler: Box<dyn EventHandler>,
    ) -> Self {
        Self {
            key: key.into(),
            request_id,
            server_uri: config.server_uri.clone(),
            connect_request: ClientRequest::Connect {
                application_id: config.application_id.clone(),
                session_token: config.session_token.clone(),
                installation_id: config.installation_id.clone(),
            },
            connect_frame: None,
            subscribe_request,
            state: ConnectionState::New,
            flags: HandshakeFlags::default(),
            connect_acked: false,
            reconnect_forbidden: false,
            paused: false,
            reconnect: config.reconnect.clone(),
            reconnect_attempt: 0,
            reconnect_at: None,
            transport,
            codec: Arc::new(JsonCodec),
            handler,
        }
    }

    pub fn with_codec(mut self, codec: Arc<dyn Codec>) -> Self {
        self.codec = codec;
        self
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn request_id(&self) -> u64 {
        self.request_id
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn flags(&self) -> HandshakeFlags {
        self.flags
    }

    pub fn connect_sent(&self) -> bool {
        self.flags.connect_sent
    }

    pub fn subscribe_sent(&self) -> bool {
        self.flags.subscribe_sent
    }

    pub fn unsubscribe_sent(&self) -> bool {
        self.flags.unsubscribe_sent
    }

    pub fn is_reconnect_forbidden(&self) -> bool {
        self.reconnect_forbidden
    }

    pub fn is_paused(&self) -> bool {
        self.paused
    }

    /// Host pause signal. A paused session never reconnects on its own.
    pub fn set_paused(&mut self, paused: bool) {
        self.paused = paused;
    }

    /// Start the subscription: validate the server URI, move to `Opening`
    /// and open the transport. The handshake itself happens on later pumps.
    pub fn subscribe(&mut self) -> Result<()> {
        match self.state {
            ConnectionState::New => {}
            ConnectionState::Opening | ConnectionState::Open | ConnectionState::Closing => {
                return Ok(());
            }
            ConnectionState::Closed | ConnectionState::Error => {
                return Err(LiveQueryError::SessionClosed(self.key.clone()));
            }
        }

        if let Err(e) = validate_server_uri(&self.server_uri) {
            warn!(key = %self.key, uri = %self.server_uri, "invalid live query server uri");
            self.state = ConnectionState::Error;
            self.handler.on_general_message(&format!(
                "Live query server uri is invalid: {:?}",
                self.server_uri
            ));
            return Err(e);
        }

        if self.connect_frame.is_none() {
            self.connect_frame = Some(self.codec.encode(&self.connect_request)?);
        }

        self.state = ConnectionState::Opening;
        let opened = match self.transport.state() {
            TransportState::Connecting | TransportState::Open => Ok(()),
            TransportState::Closing | TransportState::Closed => {
                self.transport.open(&self.server_uri)
            }
        };
        if let Err(e) = opened {
            warn!(key = %self.key, error = %e, "failed to open live query transport");
            self.state = ConnectionState::Error;
            self.handler
                .on_general_message(&format!("Failed to open connection: {e}"));
            return Err(e.into());
        }

        debug!(key = %self.key, request_id = self.request_id, "live query session opening");
        Ok(())
    }

    /// One host tick. Never blocks.
    pub fn pump(&mut self) {
        if matches!(
            self.state,
            ConnectionState::New | ConnectionState::Closed | ConnectionState::Error
        ) {
            return;
        }

        self.dispatch_inbound();
        if self.state.is_terminal() {
            return;
        }

        if self.transport.state() == TransportState::Closed {
            self.on_transport_closed();
            return;
        }

        // Nothing was subscribed, so there is nothing to tear down
        if self.state == ConnectionState::Closing && !self.flags.subscribe_sent {
            self.finish_close();
            return;
        }

        if self.transport.state() == TransportState::Open {
            self.send_handshake_step();
        }
    }

    /// Request teardown. Non-blocking: the unsubscribe frame goes out on the
    /// next pump.
    pub fn unsubscribe(&mut self) {
        match self.state {
            ConnectionState::New => self.state = ConnectionState::Closed,
            ConnectionState::Opening | ConnectionState::Open => {
                self.reconnect_at = None;
                self.state = ConnectionState::Closing;
            }
            _ => {}
        }
    }

    /// Close the current connection and start the subscription over from
    /// `New`, keeping the key and request id.
    pub fn renew_subscription(&mut self) -> Result<()> {
        if self.reconnect_forbidden {
            return Err(LiveQueryError::ReconnectForbidden(self.key.clone()));
        }
        self.reconnect_at = None;
        self.reconnect_attempt = 0;
        self.restart()
    }

    /// Drop the connection without waiting for the server.
    pub fn abandon(&mut self) {
        if self.state != ConnectionState::Closed {
            warn!(key = %self.key, state = ?self.state, "abandoning live query session");
        }
        self.finish_close();
    }

    fn restart(&mut self) -> Result<()> {
        self.transport.close();
        self.flags = HandshakeFlags::default();
        self.connect_acked = false;
        self.state = ConnectionState::New;
        self.subscribe()
    }

    fn finish_close(&mut self) {
        self.transport.close();
        self.reconnect_at = None;
        self.state = ConnectionState::Closed;
    }

    fn dispatch_inbound(&mut self) {
        for item in self.transport.drain() {
            // Anything after the close belongs to nobody
            if self.state.is_terminal() {
                break;
            }
            match item {
                TransportEvent::Error(message) => {
                    debug!(key = %self.key, error = %message, "live query transport error");
                    self.handler.on_general_message(&message);
                }
                TransportEvent::Frame(text) => {
                    let event = match self.codec.decode(&text) {
                        Ok(event) => event,
                        Err(e) => {
                            warn!(key = %self.key, error = %e, "undecodable live query frame");
                            InboundEvent::Error(ErrorEvent::handling_failed(e.to_string()))
                        }
                    };
                    debug!(key = %self.key, op = %event.kind(), "live query event");
                    self.handler.handle(&event);
                    self.apply(&event);
                }
            }
        }
    }

    fn apply(&mut self, event: &InboundEvent) {
        match event {
            InboundEvent::Connected { .. } => self.connect_acked = true,
            InboundEvent::Subscribed { .. } => {
                if self.state == ConnectionState::Opening {
                    info!(key = %self.key, request_id = self.request_id, "live query subscribed");
                    self.state = ConnectionState::Open;
                    self.reconnect_attempt = 0;
                }
            }
            InboundEvent::Unsubscribed { .. } => {
                info!(key = %self.key, request_id = self.request_id, "live query unsubscribed");
                self.finish_close();
            }
            InboundEvent::Error(e) if !e.reconnect => {
                warn!(key = %self.key, code = e.code, error = %e.error, "server forbade reconnect");
                self.reconnect_forbidden = true;
            }
            _ => {}
        }
    }

    fn on_transport_closed(&mut self) {
        match self.state {
            ConnectionState::Closing => {
                debug!(key = %self.key, "transport closed during teardown");
                self.finish_close();
                return;
            }
            ConnectionState::Opening | ConnectionState::Open => {}
            _ => return,
        }

        if self.paused || self.reconnect_forbidden || !self.reconnect.enabled {
            info!(
                key = %self.key,
                paused = self.paused,
                forbidden = self.reconnect_forbidden,
                "live query connection closed"
            );
            self.finish_close();
            self.handler.on_general_message("Connection closed.");
            return;
        }

        let now = Instant::now();
        let deadline = match self.reconnect_at {
            Some(at) => at,
            None => {
                let delay = self.reconnect.delay_for(self.reconnect_attempt);
                info!(
                    key = %self.key,
                    attempt = self.reconnect_attempt + 1,
                    delay_ms = delay.as_millis() as u64,
                    "live query reconnect scheduled"
                );
                self.handler
                    .on_general_message(&format!("Connection lost, reconnecting in {delay:?}."));
                self.state = ConnectionState::Opening;
                self.reconnect_at = Some(now + delay);
                now + delay
            }
        };
        if now < deadline {
            return;
        }

        self.reconnect_at = None;
        self.reconnect_attempt = self.reconnect_attempt.saturating_add(1);
        if let Err(e) = self.restart() {
            warn!(key = %self.key, error = %e, "live query reconnect failed");
        }
    }

    fn send_handshake_step(&mut self) {
        match self.state {
            ConnectionState::Opening if !self.flags.connect_sent => {
                let Some(frame) = self.connect_frame.clone() else {
                    return;
                };
                self.handler.on_general_message("Sending connection request.");
                if self.send_frame(frame) {
                    self.flags.connect_sent = true;
                }
            }
            ConnectionState::Opening if self.connect_acked && !self.flags.subscribe_sent => {
                self.handler
                    .on_general_message("Sending subscription request.");
                let request = self.subscribe_request.clone();
                if self.send_request(&request) {
                    self.flags.subscribe_sent = true;
                }
            }
            ConnectionState::Closing if !self.flags.unsubscribe_sent => {
                self.handler.on_general_message("Sending unsubscribe request.");
                let request = ClientRequest::Unsubscribe {
                    request_id: self.request_id,
                };
                if self.send_request(&request) {
                    self.flags.unsubscribe_sent = true;
                }
            }
            _ => {}
        }
    }

    fn send_request(&mut self, request: &ClientRequest) -> bool {
        match self.codec.encode(request) {
            Ok(frame) => self.send_frame(frame),
            Err(e) => {
                warn!(key = %self.key, error = %e, "failed to encode live query request");
                self.handler
                    .on_general_message(&format!("Failed to encode request: {e}"));
                false
            }
        }
    }

    fn send_frame(&mut self, frame: String) -> bool {
        debug!(key = %self.key, frame = %frame, "live query send");
        match self.transport.send(frame) {
            Ok(()) => true,
            Err(e) => {
                self.handler.on_general_message(&format!("Send failed: {e}"));
                false
            }
        }
    }
}

impl std::fmt::Debug for SubscriptionSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubscriptionSession")
            .field("key", &self.key)
            .field("request_id", &self.request_id)
            .field("state", &self.state)
            .field("flags", &self.flags)
            .field("paused", &self.paused)
            .finish_non_exhaustive()
    }
}
