use serde_json::Value;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CodecError {
    #[error("failed to encode: {0}")]
    Encode(String),
    #[error("failed to decode: {0}")]
    Decode(String),
}

/// Converts between the raw bytes stored on a topic and a structured value.
///
/// Codecs are supplied per topic by the host application and shared between the consume
/// and produce paths, so they must be cheap to call from many tasks at once.
pub trait MessageCodec: Send + Sync {
    fn encode(&self, value: &Value) -> Result<Vec<u8>, CodecError>;

    fn decode(&self, bytes: &[u8]) -> Result<Value, CodecError>;

    /// Wraps pre-encoded bytes for production. The default validates the bytes by
    /// decoding them and re-encodes the result, so malformed input never reaches the topic.
    fn wrap(&self, bytes: &[u8]) -> Result<Vec<u8>, CodecError> {
        let value = self.decode(bytes)?;
        self.encode(&value)
    }
}

/// Plain JSON codec for hosts that do not bring their own.
#[derive(Debug, Default, Clone, Copy)]
pub struct JsonCodec;

impl MessageCodec for JsonCodec {
    fn encode(&self, value: &Value) -> Result<Vec<u8>, CodecError> {
        serde_json::to_vec(value).map_err(|e| CodecError::Encode(e.to_string()))
    }

    fn decode(&self, bytes: &[u8]) -> Result<Value, CodecError> {
        serde_json::from_slice(bytes).map_err(|e| CodecError::Decode(e.to_string()))
    }
}
