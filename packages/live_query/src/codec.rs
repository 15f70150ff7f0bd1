use crate::error::Result;
use crate::protocol::{ClientRequest, InboundEvent};

/// Serializes outbound requests and deserializes inbound frames.
pub trait Codec: Send + Sync {
    fn encode(&self, request: &ClientRequest) -> Result<String>;
    fn decode(&self, frame: &str) -> Result<InboundEvent>;
}

/// `serde_json` codec for the standard live query protocol.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonCodec;

impl Codec for JsonCodec {
    fn encode(&self, request: &ClientRequest) -> Result<String> {
        Ok(serde_json::to_string(request)?)
    }

    fn decode(&self, frame: &str) -> Result<InboundEvent> {
        Ok(serde_json::from_str(frame)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::LiveQueryError;

    #[test]
    fn decode_malformed_frame_is_codec_error() {
        let err = JsonCodec.decode("{not json").unwrap_err();
        assert!(matches!(err, LiveQueryError::Codec(_)));
    }

    #[test]
    fn encode_unsubscribe() {
        let text = JsonCodec
            .encode(&ClientRequest::Unsubscribe { request_id: 3 })
            .unwrap();
        assert_eq!(text, r#"{"op":"unsubscribe","requestId":3}"#);
    }
}
