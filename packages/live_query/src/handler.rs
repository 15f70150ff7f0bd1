//! Application callbacks for subscription events.

use std::marker::PhantomData;

use serde::de::DeserializeOwned;
use tokio::sync::mpsc;

use crate::protocol::{ErrorEvent, InboundEvent, ObjectEvent};

/// Receives decoded events for one subscription.
///
/// Override [`EventHandler::handle`] to dispatch on the event enum directly,
/// or the per-kind methods to react to individual kinds.
pub trait EventHandler: Send {
    fn handle(&mut self, event: &InboundEvent) {
        match event {
            InboundEvent::Connected { client_id } => self.on_connected(client_id.as_deref()),
            InboundEvent::Subscribed { request_id } => self.on_subscribed(*request_id),
            InboundEvent::Unsubscribed { request_id } => self.on_unsubscribed(*request_id),
            InboundEvent::Create(e) => self.on_create(e),
            InboundEvent::Update(e) => self.on_update(e),
            InboundEvent::Enter(e) => self.on_enter(e),
            InboundEvent::Leave(e) => self.on_leave(e),
            InboundEvent::Delete(e) => self.on_delete(e),
            InboundEvent::Error(e) => self.on_error(e),
        }
    }

    fn on_connected(&mut self, _client_id: Option<&str>) {}
    fn on_subscribed(&mut self, _request_id: Option<u64>) {}
    fn on_unsubscribed(&mut self, _request_id: Option<u64>) {}
    fn on_create(&mut self, _event: &ObjectEvent) {}
    fn on_update(&mut self, _event: &ObjectEvent) {}
    fn on_enter(&mut self, _event: &ObjectEvent) {}
    fn on_leave(&mut self, _event: &ObjectEvent) {}
    fn on_delete(&mut self, _event: &ObjectEvent) {}
    fn on_error(&mut self, _error: &ErrorEvent) {}

    /// Human-readable status text ("Sending subscription request.", transport
    /// failures, ...).
    fn on_general_message(&mut self, _message: &str) {}
}

/// Callbacks receiving objects already decoded into the application type `T`.
pub trait LiveQueryCallbacks<T>: Send {
    fn on_connected(&mut self) {}
    fn on_subscribed(&mut self, _request_id: Option<u64>) {}
    fn on_unsubscribed(&mut self, _request_id: Option<u64>) {}
    fn on_create(&mut self, _object: T, _request_id: Option<u64>) {}
    fn on_update(&mut self, _object: T, _request_id: Option<u64>) {}
    fn on_enter(&mut self, _object: T, _request_id: Option<u64>) {}
    fn on_leave(&mut self, _object: T, _request_id: Option<u64>) {}
    fn on_delete(&mut self, _object: T, _request_id: Option<u64>) {}
    fn on_error(&mut self, _error: &ErrorEvent) {}
    fn on_general_message(&mut self, _message: &str) {}
}

/// Adapts [`LiveQueryCallbacks<T>`] to [`EventHandler`], decoding each object
/// payload into `T`. A payload that does not decode is reported through
/// `on_error` instead.
pub struct TypedCallbacks<T, C> {
    callbacks: C,
    _object: PhantomData<fn() -> T>,
}

impl<T, C> TypedCallbacks<T, C> {
    pub fn new(callbacks: C) -> Self {
        Self {
            callbacks,
            _object: PhantomData,
        }
    }

    pub fn into_inner(self) -> C {
        self.callbacks
    }
}

impl<T, C> TypedCallbacks<T, C>
where
    T: DeserializeOwned,
    C: LiveQueryCallbacks<T>,
{
    fn decode(&mut self, event: &ObjectEvent) -> Option<T> {
        match serde_json::from_value(event.object.clone()) {
            Ok(object) => Some(object),
            Err(e) => {
                let mut error = ErrorEvent::handling_failed(e.to_string());
                error.request_id = event.request_id;
                self.callbacks.on_error(&error);
                None
            }
        }
    }
}

impl<T, C> EventHandler for TypedCallbacks<T, C>
where
    T: DeserializeOwned,
    C: LiveQueryCallbacks<T>,
{
    fn on_connected(&mut self, _client_id: Option<&str>) {
        self.callbacks.on_connected();
    }

    fn on_subscribed(&mut self, request_id: Option<u64>) {
        self.callbacks.on_subscribed(request_id);
    }

    fn on_unsubscribed(&mut self, request_id: Option<u64>) {
        self.callbacks.on_unsubscribed(request_id);
    }

    fn on_create(&mut self, event: &ObjectEvent) {
        if let Some(object) = self.decode(event) {
            self.callbacks.on_create(object, event.request_id);
        }
    }

    fn on_update(&mut self, event: &ObjectEvent) {
        if let Some(object) = self.decode(event) {
            self.callbacks.on_update(object, event.request_id);
        }
    }

    fn on_enter(&mut self, event: &ObjectEvent) {
        if let Some(object) = self.decode(event) {
            self.callbacks.on_enter(object, event.request_id);
        }
    }

    fn on_leave(&mut self, event: &ObjectEvent) {
        if let Some(object) = self.decode(event) {
            self.callbacks.on_leave(object, event.request_id);
        }
    }

    fn on_delete(&mut self, event: &ObjectEvent) {
        if let Some(object) = self.decode(event) {
            self.callbacks.on_delete(object, event.request_id);
        }
    }

    fn on_error(&mut self, error: &ErrorEvent) {
        self.callbacks.on_error(error);
    }

    fn on_general_message(&mut self, message: &str) {
        self.callbacks.on_general_message(message);
    }
}

/// Something a [`ChannelHandler`] forwards.
#[derive(Debug, Clone, PartialEq)]
pub enum HandlerEvent {
    Event(InboundEvent),
    Message(String),
}

/// Forwards every event and status message into an unbounded channel, so the
/// consumer runs outside the session lock.
pub struct ChannelHandler {
    tx: mpsc::UnboundedSender<HandlerEvent>,
}

impl ChannelHandler {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<HandlerEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl EventHandler for ChannelHandler {
    fn handle(&mut self, event: &InboundEvent) {
        let _ = self.tx.send(HandlerEvent::Event(event.clone()));
    }

    fn on_general_message(&mut self, message: &str) {
        let _ = self.tx.send(HandlerEvent::Message(message.to_string()));
    }
}
