//! Message codec seam and the default JSON envelope codec.
//!
//! Wire format of [`JsonCodec`]:
//!
//! ```text
//! {"type":"request","requestId":7,"verb":"GET","path":"/x","headers":{"Accept":["*/*"]},"body":"aGk="}
//! {"type":"response","requestId":7,"status":200,"message":"OK"}
//! ```
//!
//! `requestId`, `headers` and `body` are optional on requests; `body` is
//! standard base64.

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::errors::{DecodeError, EncodeError};
use crate::messages::{Headers, Message, Request, Response};

/// Encodes and decodes messages to and from opaque byte payloads.
pub trait MessageCodec: Send + Sync {
    /// Decode one inbound payload.
    fn decode(&self, payload: &[u8]) -> Result<Message, DecodeError>;

    /// Encode one outbound message.
    fn encode(&self, message: &Message) -> Result<Vec<u8>, EncodeError>;
}

/// JSON envelope codec with base64 bodies.
#[derive(Clone, Copy, Debug, Default)]
pub struct JsonCodec;

const REQUEST_KIND: &str = "request";
const RESPONSE_KIND: &str = "response";

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    request_id: Option<u64>,
    verb: String,
    path: String,
    #[serde(default, skip_serializing_if = "Headers::is_empty")]
    headers: Headers,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    body: Option<String>,
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireResponse {
    request_id: u64,
    status: u16,
    #[serde(default)]
    message: String,
    #[serde(default, skip_serializing_if = "Headers::is_empty")]
    headers: Headers,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    body: Option<String>,
}

#[derive(Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
enum Envelope {
    Request(WireRequest),
    Response(WireResponse),
}

fn decode_body(body: Option<String>) -> Result<Option<Vec<u8>>, DecodeError> {
    body.map(|b| BASE64.decode(b)).transpose().map_err(DecodeError::from)
}

fn encode_body(body: Option<&Vec<u8>>) -> Option<String> {
    body.map(|b| BASE64.encode(b))
}

impl MessageCodec for JsonCodec {
    fn decode(&self, payload: &[u8]) -> Result<Message, DecodeError> {
        let mut value: Value = serde_json::from_slice(payload)?;
        let kind = match value.get("type").and_then(Value::as_str) {
            Some(kind) => kind.to_owned(),
            None => return Err(<serde_json::Error as serde::de::Error>::missing_field("type").into()),
        };
        if let Some(object) = value.as_object_mut() {
            let _ = object.remove("type");
        }

        match kind.as_str() {
            REQUEST_KIND => {
                let wire: WireRequest = serde_json::from_value(value)?;
                Ok(Message::Request(Request {
                    id: wire.request_id,
                    verb: wire.verb,
                    path: wire.path,
                    headers: wire.headers,
                    body: decode_body(wire.body)?,
                }))
            }
            RESPONSE_KIND => {
                let wire: WireResponse = serde_json::from_value(value)?;
                Ok(Message::Response(Response {
                    request_id: wire.request_id,
                    status: wire.status,
                    message: wire.message,
                    headers: wire.headers,
                    body: decode_body(wire.body)?,
                }))
            }
            _ => Ok(Message::Unknown { kind }),
        }
    }

    fn encode(&self, message: &Message) -> Result<Vec<u8>, EncodeError> {
        let bytes = match message {
            Message::Request(req) => serde_json::to_vec(&Envelope::Request(WireRequest {
                request_id: req.id,
                verb: req.verb.clone(),
                path: req.path.clone(),
                headers: req.headers.clone(),
                body: encode_body(req.body.as_ref()),
            }))?,
            Message::Response(resp) => serde_json::to_vec(&Envelope::Response(WireResponse {
                request_id: resp.request_id,
                status: resp.status,
                message: resp.message.clone(),
                headers: resp.headers.clone(),
                body: encode_body(resp.body.as_ref()),
            }))?,
            Message::Unknown { kind } => serde_json::to_vec(&serde_json::json!({ "type": kind }))?,
        };
        Ok(bytes)
    }
}
