//! Live query wire protocol.
//!
//! Every frame is a JSON object tagged by its `op` field. Client requests are
//! built here; server frames are decoded once at the boundary into
//! [`InboundEvent`] so downstream dispatch is an exhaustive `match`.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio_tungstenite::tungstenite::http::Uri;

use crate::error::{LiveQueryError, Result};

/// Error code reported when an inbound frame could not be handled.
pub const EVENT_HANDLING_FAILED: i64 = 103;

/// A query definition targeted by a subscription.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LiveQuery {
    pub class_name: String,
    #[serde(rename = "where", default)]
    pub constraints: Map<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fields: Option<Vec<String>>,
}

impl LiveQuery {
    pub fn new(class_name: impl Into<String>) -> Self {
        Self {
            class_name: class_name.into(),
            constraints: Map::new(),
            fields: None,
        }
    }

    /// Add a `where` constraint. `value` may be a literal (equality) or an
    /// operator object such as `{"$gt": 5}`.
    pub fn where_(mut self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.constraints.insert(field.into(), value.into());
        self
    }

    /// Restrict the fields delivered in change events.
    pub fn select<I, S>(mut self, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.fields = Some(fields.into_iter().map(Into::into).collect());
        self
    }
}

/// Requests sent from the client to the live query server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "lowercase", rename_all_fields = "camelCase")]
pub enum ClientRequest {
    Connect {
        application_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        session_token: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        installation_id: Option<String>,
    },
    Subscribe {
        request_id: u64,
        query: LiveQuery,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        session_token: Option<String>,
    },
    Unsubscribe {
        request_id: u64,
    },
}

/// Payload of a data change frame (`create`, `update`, `enter`, `leave`, `delete`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObjectEvent {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<u64>,
    #[serde(default)]
    pub object: Value,
    /// Object state before the change, when the server includes it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub original: Option<Value>,
}

/// Payload of an `error` frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorEvent {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<u64>,
    #[serde(default)]
    pub code: i64,
    #[serde(default)]
    pub error: String,
    /// `false` means the server forbids resubscribing.
    #[serde(default = "default_reconnect")]
    pub reconnect: bool,
}

fn default_reconnect() -> bool {
    true
}

impl ErrorEvent {
    /// Local error for a frame that could not be decoded or handled.
    pub fn handling_failed(message: impl Into<String>) -> Self {
        Self {
            request_id: None,
            code: EVENT_HANDLING_FAILED,
            error: message.into(),
            reconnect: true,
        }
    }
}

/// A decoded server frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "lowercase", rename_all_fields = "camelCase")]
pub enum InboundEvent {
    Connected {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        client_id: Option<String>,
    },
    Subscribed {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        request_id: Option<u64>,
    },
    Unsubscribed {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        request_id: Option<u64>,
    },
    Create(ObjectEvent),
    Update(ObjectEvent),
    Enter(ObjectEvent),
    Leave(ObjectEvent),
    Delete(ObjectEvent),
    Error(ErrorEvent),
}

/// The `op` of an [`InboundEvent`], without its payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Connected,
    Subscribed,
    Unsubscribed,
    Create,
    Update,
    Enter,
    Leave,
    Delete,
    Error,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Connected => "connected",
            Self::Subscribed => "subscribed",
            Self::Unsubscribed => "unsubscribed",
            Self::Create => "create",
            Self::Update => "update",
            Self::Enter => "enter",
            Self::Leave => "leave",
            Self::Delete => "delete",
            Self::Error => "error",
        }
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl InboundEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            Self::Connected { .. } => EventKind::Connected,
            Self::Subscribed { .. } => EventKind::Subscribed,
            Self::Unsubscribed { .. } => EventKind::Unsubscribed,
            Self::Create(_) => EventKind::Create,
            Self::Update(_) => EventKind::Update,
            Self::Enter(_) => EventKind::Enter,
            Self::Leave(_) => EventKind::Leave,
            Self::Delete(_) => EventKind::Delete,
            Self::Error(_) => EventKind::Error,
        }
    }

    /// The object payload of a data change event.
    pub fn object(&self) -> Option<&Value> {
        match self {
            Self::Create(e) | Self::Update(e) | Self::Enter(e) | Self::Leave(e) | Self::Delete(e) => {
                Some(&e.object)
            }
            _ => None,
        }
    }
}

/// Build the subscribe envelope for `query`.
pub fn subscribe_request(
    request_id: u64,
    query: &LiveQuery,
    session_token: Option<&str>,
) -> ClientRequest {
    ClientRequest::Subscribe {
        request_id,
        query: query.clone(),
        session_token: session_token.map(str::to_owned),
    }
}

/// Check that `uri` is a usable live query endpoint: non-empty, `ws` or `wss`,
/// with a host.
pub fn validate_server_uri(uri: &str) -> Result<()> {
    let invalid = || LiveQueryError::InvalidServerUri(uri.to_string());

    let trimmed = uri.trim();
    if trimmed.is_empty() {
        return Err(invalid());
    }
    let parsed: Uri = trimmed.parse().map_err(|_| invalid())?;
    match parsed.scheme_str() {
        Some("ws") | Some("wss") if parsed.host().is_some() => Ok(()),
        _ => Err(invalid()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn connect_request_omits_unset_credentials() {
        let msg = ClientRequest::Connect {
            application_id: "APP123".into(),
            session_token: None,
            installation_id: None,
        };
        assert_eq!(
            serde_json::to_string(&msg).unwrap(),
            r#"{"op":"connect","applicationId":"APP123"}"#
        );
    }

    #[test]
    fn connect_request_includes_credentials_when_set() {
        let msg = ClientRequest::Connect {
            application_id: "APP123".into(),
            session_token: Some("r:token".into()),
            installation_id: Some("install-1".into()),
        };
        let obj = serde_json::to_value(&msg).unwrap();
        assert_eq!(obj["sessionToken"], "r:token");
        assert_eq!(obj["installationId"], "install-1");
    }

    #[test]
    fn unsubscribe_request_shape() {
        let msg = ClientRequest::Unsubscribe { request_id: 7 };
        assert_eq!(
            serde_json::to_string(&msg).unwrap(),
            r#"{"op":"unsubscribe","requestId":7}"#
        );
    }

    #[test]
    fn subscribe_request_carries_query() {
        let query = LiveQuery::new("PlayerData")
            .where_("level", json!({"$gt": 3}))
            .select(["locX", "locY"]);
        let obj = serde_json::to_value(subscribe_request(7, &query, None)).unwrap();
        assert_eq!(
            obj,
            json!({
                "op": "subscribe",
                "requestId": 7,
                "query": {
                    "className": "PlayerData",
                    "where": {"level": {"$gt": 3}},
                    "fields": ["locX", "locY"],
                }
            })
        );
    }

    #[test]
    fn decodes_bare_connected() {
        let ev: InboundEvent = serde_json::from_str(r#"{"op":"connected"}"#).unwrap();
        assert_eq!(ev, InboundEvent::Connected { client_id: None });
        assert_eq!(ev.kind(), EventKind::Connected);
    }

    #[test]
    fn decodes_update_without_request_id() {
        let ev: InboundEvent =
            serde_json::from_str(r#"{"op":"update","object":{"locX":5}}"#).unwrap();
        assert_eq!(ev.kind(), EventKind::Update);
        assert_eq!(ev.object().unwrap()["locX"], 5);
    }

    #[test]
    fn decodes_error_frame() {
        let ev: InboundEvent = serde_json::from_str(
            r#"{"op":"error","requestId":7,"code":1,"error":"bad session","reconnect":false}"#,
        )
        .unwrap();
        match ev {
            InboundEvent::Error(err) => {
                assert_eq!(err.request_id, Some(7));
                assert_eq!(err.code, 1);
                assert_eq!(err.error, "bad session");
                assert!(!err.reconnect);
            }
            other => panic!("wrong variant: {other:?}"),
        }
    }

    #[test]
    fn error_frame_reconnect_defaults_to_true() {
        let ev: InboundEvent =
            serde_json::from_str(r#"{"op":"error","code":4,"error":"x"}"#).unwrap();
        assert!(matches!(ev, InboundEvent::Error(ErrorEvent { reconnect: true, .. })));
    }

    #[test]
    fn unknown_op_is_rejected() {
        assert!(serde_json::from_str::<InboundEvent>(r#"{"op":"teleport"}"#).is_err());
    }

    #[test]
    fn server_uri_validation() {
        assert!(validate_server_uri("wss://example.org/live").is_ok());
        assert!(validate_server_uri("ws://127.0.0.1:1337").is_ok());
        assert!(validate_server_uri("").is_err());
        assert!(validate_server_uri("   ").is_err());
        assert!(validate_server_uri("https://example.org").is_err());
        assert!(validate_server_uri("not a uri").is_err());
    }
}
