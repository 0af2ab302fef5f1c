//! Wire shapes shared by the HTTP and WebSocket transports.
//!
//! Success envelope: `{ "result": { "type": "data", "data": ... } }` where
//! `type` defaults to `data` when absent (HTTP responses omit it).
//! Error envelope: `{ "error": { "code": ..., "message": ..., "data"? } }`.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::ErrorShape;
use crate::operation::OperationKind;

/// Discriminant of a success envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResultKind {
    #[default]
    Data,
    Started,
    Stopped,
}

/// The `result` half of a response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultEnvelope {
    #[serde(rename = "type", default, skip_serializing_if = "result_kind_is_data")]
    pub kind: ResultKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    /// Event id carried by subscription data, used for resumption.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
}

fn result_kind_is_data(kind: &ResultKind) -> bool {
    *kind == ResultKind::Data
}

impl ResultEnvelope {
    pub fn data(data: Value) -> Self {
        ResultEnvelope {
            kind: ResultKind::Data,
            data: Some(data),
            id: None,
        }
    }
}

/// One response body: either a success envelope or an error envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Response {
    Ok { result: ResultEnvelope },
    Err { error: ErrorShape },
}

/// Wire method of an outgoing message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestMethod {
    Query,
    Mutation,
    Subscription,
    #[serde(rename = "subscription.stop")]
    SubscriptionStop,
}

impl From<OperationKind> for RequestMethod {
    fn from(kind: OperationKind) -> Self {
        match kind {
            OperationKind::Query => RequestMethod::Query,
            OperationKind::Mutation => RequestMethod::Mutation,
            OperationKind::Subscription => RequestMethod::Subscription,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestParams {
    pub path: String,
    #[serde(default)]
    pub input: Value,
    #[serde(
        rename = "lastEventId",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub last_event_id: Option<String>,
}

/// One multiplexed outgoing message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestMessage {
    pub id: u64,
    pub method: RequestMethod,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<RequestParams>,
}

impl RequestMessage {
    pub fn stop(id: u64) -> Self {
        RequestMessage {
            id,
            method: RequestMethod::SubscriptionStop,
            params: None,
        }
    }

    pub fn is_subscription(&self) -> bool {
        self.method == RequestMethod::Subscription
    }
}

/// Response to one multiplexed request, matched strictly by id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseMessage {
    pub id: u64,
    #[serde(flatten)]
    pub response: Response,
}

/// A server-initiated request (no id to match against).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IncomingRequest {
    pub method: IncomingMethod,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum IncomingMethod {
    Reconnect,
}

/// Anything the server may push over the persistent connection.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum IncomingMessage {
    Request(IncomingRequest),
    Response(ResponseMessage),
}

/// One-time handshake sent right after the socket opens, before any request.
#[derive(Debug, Clone, Serialize)]
pub struct ConnectionParamsMessage {
    method: ConnectionParamsTag,
    pub data: Value,
}

#[derive(Debug, Clone, Copy, Serialize)]
enum ConnectionParamsTag {
    #[serde(rename = "connectionParams")]
    ConnectionParams,
}

impl ConnectionParamsMessage {
    pub fn new(data: Value) -> Self {
        ConnectionParamsMessage {
            method: ConnectionParamsTag::ConnectionParams,
            data,
        }
    }
}

/// Serializes a flush batch: a bare array when more than one message is
/// queued, the single object otherwise.
pub fn encode_outgoing(messages: &[RequestMessage]) -> Result<String, serde_json::Error> {
    if messages.len() == 1 {
        serde_json::to_string(&messages[0])
    } else {
        serde_json::to_string(messages)
    }
}

/// Parses one inbound text frame.
pub fn decode_incoming(text: &str) -> Result<IncomingMessage, serde_json::Error> {
    serde_json::from_str(text)
}
