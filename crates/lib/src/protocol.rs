//! Wire envelope types and codec for the management interface.
//!
//! Both channels speak flat JSON objects carrying a `kind` discriminator.
//! Command-path messages also carry a `transaction` correlation id; event
//! messages never do. Request payload fields are merged at top level, success
//! replies nest theirs under `data`, error replies under `error`.

use crate::error::{ClientError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Envelope field naming the message kind.
const KIND_FIELD: &str = "kind";
/// Envelope field carrying the correlation id on command-path messages.
const TRANSACTION_FIELD: &str = "transaction";

/// A command-path request: `{ "kind": <method>, "transaction": <id>, ...payload }`.
#[derive(Debug, Clone)]
pub struct GatewayRequest {
    pub method: String,
    pub transaction: String,
    pub payload: Map<String, Value>,
}

impl GatewayRequest {
    pub fn new(
        method: impl Into<String>,
        transaction: impl Into<String>,
        payload: Map<String, Value>,
    ) -> Self {
        Self {
            method: method.into(),
            transaction: transaction.into(),
            payload,
        }
    }
}

/// Terminal outcome discriminator of a correlated reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseStatus {
    Success,
    /// Bare acknowledgement; the gateway answers session housekeeping
    /// requests (e.g. keepalive) with an ack instead of a data object.
    Ack,
    Error,
}

/// The gateway's error object, e.g. `{ "code": 498, "reason": "Invalid JSON" }`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorDescriptor {
    pub code: u64,
    pub reason: String,
}

/// A correlated reply on the command channel.
#[derive(Debug, Clone)]
pub struct GatewayResponse {
    pub transaction: String,
    pub status: ResponseStatus,
    /// Success payload (`data` object, or the flattened server-info fields).
    /// Empty for acks and errors.
    pub payload: Map<String, Value>,
    /// Present iff `status` is `Error`.
    pub error: Option<ErrorDescriptor>,
}

impl GatewayResponse {
    pub fn is_success(&self) -> bool {
        self.status == ResponseStatus::Success
    }

    /// The success/ack payload, or the gateway's error as `Rejected`.
    pub fn into_payload(self) -> Result<Map<String, Value>> {
        match self.status {
            ResponseStatus::Error => {
                Err(ClientError::Rejected(self.error.unwrap_or(ErrorDescriptor {
                    code: 0,
                    reason: "unspecified gateway error".to_string(),
                })))
            }
            _ => Ok(self.payload),
        }
    }
}

/// An uncorrelated notification from the broadcast channel.
#[derive(Debug, Clone)]
pub struct GatewayEvent {
    pub kind: String,
    pub session_id: Option<u64>,
    pub handle_id: Option<u64>,
    /// Remaining top-level envelope fields.
    pub payload: Map<String, Value>,
    pub received_at: DateTime<Utc>,
}

/// What one decoded frame turned out to be.
#[derive(Debug)]
pub enum Decoded {
    Response(GatewayResponse),
    Event(GatewayEvent),
}

/// Serialize a request as a flat envelope. Payload fields are merged at top
/// level; `kind` and `transaction` win on collision.
pub fn encode(request: &GatewayRequest) -> Result<Vec<u8>> {
    let mut envelope = request.payload.clone();
    envelope.insert(
        KIND_FIELD.to_string(),
        Value::String(request.method.clone()),
    );
    envelope.insert(
        TRANSACTION_FIELD.to_string(),
        Value::String(request.transaction.clone()),
    );
    serde_json::to_vec(&Value::Object(envelope)).map_err(|e| ClientError::Decode(e.to_string()))
}

/// Decode one frame from either channel.
///
/// A frame is a `Response` iff it carries a transaction id for which
/// `is_pending` returns true and a terminal status discriminator; everything
/// else is an `Event`. The caller decides whether a `Decode` failure is fatal
/// (command path) or skippable (event path).
pub fn decode(bytes: &[u8], is_pending: impl Fn(&str) -> bool) -> Result<Decoded> {
    let value: Value = serde_json::from_slice(bytes)
        .map_err(|e| ClientError::Decode(format!("invalid JSON: {e}")))?;
    let Value::Object(mut fields) = value else {
        return Err(ClientError::Decode("envelope is not a JSON object".to_string()));
    };
    let kind = match fields.remove(KIND_FIELD) {
        Some(Value::String(kind)) => kind,
        Some(_) => return Err(ClientError::Decode("kind discriminator is not a string".to_string())),
        None => return Err(ClientError::Decode("missing kind discriminator".to_string())),
    };

    if is_terminal(&kind) {
        let transaction = fields
            .get(TRANSACTION_FIELD)
            .and_then(Value::as_str)
            .map(str::to_string);
        if let Some(transaction) = transaction {
            if is_pending(&transaction) {
                fields.remove(TRANSACTION_FIELD);
                return decode_response(&kind, transaction, fields).map(Decoded::Response);
            }
        }
    }

    Ok(Decoded::Event(decode_event(kind, fields)))
}

/// Discriminators that end a command round trip.
fn is_terminal(kind: &str) -> bool {
    matches!(kind, "success" | "server_info" | "ack" | "error")
}

fn decode_response(
    kind: &str,
    transaction: String,
    mut fields: Map<String, Value>,
) -> Result<GatewayResponse> {
    match kind {
        "success" => {
            let payload = match fields.remove("data") {
                Some(Value::Object(data)) => data,
                Some(_) => {
                    return Err(ClientError::Protocol(
                        "success data is not an object".to_string(),
                    ))
                }
                None => Map::new(),
            };
            Ok(GatewayResponse {
                transaction,
                status: ResponseStatus::Success,
                payload,
                error: None,
            })
        }
        // The info reply has its own discriminator and keeps its fields flat.
        "server_info" => Ok(GatewayResponse {
            transaction,
            status: ResponseStatus::Success,
            payload: fields,
            error: None,
        }),
        "ack" => Ok(GatewayResponse {
            transaction,
            status: ResponseStatus::Ack,
            payload: Map::new(),
            error: None,
        }),
        "error" => {
            let descriptor = fields.remove("error").ok_or_else(|| {
                ClientError::Protocol("error response without a descriptor".to_string())
            })?;
            let descriptor: ErrorDescriptor = serde_json::from_value(descriptor)
                .map_err(|e| ClientError::Protocol(format!("malformed error descriptor: {e}")))?;
            Ok(GatewayResponse {
                transaction,
                status: ResponseStatus::Error,
                payload: Map::new(),
                error: Some(descriptor),
            })
        }
        other => Err(ClientError::Protocol(format!(
            "unexpected status discriminator: {other}"
        ))),
    }
}

fn decode_event(kind: String, mut fields: Map<String, Value>) -> GatewayEvent {
    let session_id = fields.remove("session_id").and_then(|v| v.as_u64());
    let handle_id = fields.remove("handle_id").and_then(|v| v.as_u64());
    GatewayEvent {
        kind,
        session_id,
        handle_id,
        payload: fields,
        received_at: Utc::now(),
    }
}
