//! Control-plane documents.
//!
//! Every control frame (join, registration, queries, debug) carries a JSON
//! object. [`ControlDoc`] is the dynamic view used by the dispatchers; the
//! typed structs below are the request bodies each frame type expects and are
//! decoded from a document with [`ControlDoc::decode`].

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

// ── Response codes ───────────────────────────────────────────────────────────

/// The `response` field of every reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ResponseCode {
    Ok,
    Duplicate,
    VersionMismatch,
    Invalid,
    NotPublished,
}

impl ResponseCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResponseCode::Ok => "OK",
            ResponseCode::Duplicate => "DUPLICATE",
            ResponseCode::VersionMismatch => "VERSION_MISMATCH",
            ResponseCode::Invalid => "INVALID",
            ResponseCode::NotPublished => "NOT_PUBLISHED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "OK" => Some(ResponseCode::Ok),
            "DUPLICATE" => Some(ResponseCode::Duplicate),
            "VERSION_MISMATCH" => Some(ResponseCode::VersionMismatch),
            "INVALID" => Some(ResponseCode::Invalid),
            "NOT_PUBLISHED" => Some(ResponseCode::NotPublished),
            _ => None,
        }
    }
}

impl std::fmt::Display for ResponseCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ── Errors ───────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum ControlError {
    #[error("malformed payload: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("payload is not a JSON object")]
    NotAnObject,

    #[error("missing field `{0}`")]
    Missing(String),

    #[error("field `{0}` has the wrong type")]
    WrongType(String),

    #[error("unknown response code `{0}`")]
    UnknownResponse(String),
}

// ── Document ─────────────────────────────────────────────────────────────────

/// A key/value document carried inside a control frame.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ControlDoc(Map<String, Value>);

impl ControlDoc {
    pub fn new() -> Self {
        Self(Map::new())
    }

    /// `{ "response": code }`
    pub fn response(code: ResponseCode) -> Self {
        let mut doc = Self::new();
        doc.set_str("response", code.as_str());
        doc
    }

    /// Parse a frame payload. Anything other than a JSON object is malformed.
    pub fn parse(bytes: &[u8]) -> Result<Self, ControlError> {
        match serde_json::from_slice::<Value>(bytes)? {
            Value::Object(map) => Ok(Self(map)),
            _ => Err(ControlError::NotAnObject),
        }
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        // A map of JSON values always serializes.
        serde_json::to_vec(&self.0).unwrap_or_default()
    }

    /// Build a document from any serializable struct.
    pub fn encode<T: Serialize>(value: &T) -> Result<Self, ControlError> {
        match serde_json::to_value(value)? {
            Value::Object(map) => Ok(Self(map)),
            _ => Err(ControlError::NotAnObject),
        }
    }

    /// Decode the document into a typed request body.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, ControlError> {
        Ok(serde_json::from_value(Value::Object(self.0.clone()))?)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    pub fn set_str(&mut self, key: &str, value: impl Into<String>) -> &mut Self {
        self.0.insert(key.to_string(), Value::String(value.into()));
        self
    }

    pub fn set_int(&mut self, key: &str, value: i64) -> &mut Self {
        self.0.insert(key.to_string(), Value::from(value));
        self
    }

    pub fn set_doc(&mut self, key: &str, value: ControlDoc) -> &mut Self {
        self.0.insert(key.to_string(), Value::Object(value.0));
        self
    }

    pub fn set_array(&mut self, key: &str, values: Vec<Value>) -> &mut Self {
        self.0.insert(key.to_string(), Value::Array(values));
        self
    }

    pub fn set_value(&mut self, key: &str, value: Value) -> &mut Self {
        self.0.insert(key.to_string(), value);
        self
    }

    fn field(&self, key: &str) -> Result<&Value, ControlError> {
        self.0
            .get(key)
            .ok_or_else(|| ControlError::Missing(key.to_string()))
    }

    pub fn get_str(&self, key: &str) -> Result<&str, ControlError> {
        self.field(key)?
            .as_str()
            .ok_or_else(|| ControlError::WrongType(key.to_string()))
    }

    pub fn get_int(&self, key: &str) -> Result<i64, ControlError> {
        self.field(key)?
            .as_i64()
            .ok_or_else(|| ControlError::WrongType(key.to_string()))
    }

    pub fn get_u32(&self, key: &str) -> Result<u32, ControlError> {
        let v = self.get_int(key)?;
        u32::try_from(v).map_err(|_| ControlError::WrongType(key.to_string()))
    }

    pub fn get_doc(&self, key: &str) -> Result<ControlDoc, ControlError> {
        match self.field(key)? {
            Value::Object(map) => Ok(ControlDoc(map.clone())),
            _ => Err(ControlError::WrongType(key.to_string())),
        }
    }

    pub fn get_array(&self, key: &str) -> Result<&Vec<Value>, ControlError> {
        self.field(key)?
            .as_array()
            .ok_or_else(|| ControlError::WrongType(key.to_string()))
    }

    /// The `response` field of a reply.
    pub fn response_code(&self) -> Result<ResponseCode, ControlError> {
        let raw = self.get_str("response")?;
        ResponseCode::parse(raw).ok_or_else(|| ControlError::UnknownResponse(raw.to_string()))
    }

    pub fn into_value(self) -> Value {
        Value::Object(self.0)
    }
}

// ── Typed request bodies ─────────────────────────────────────────────────────

/// INITIATION (runtime → master).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Initiation {
    pub name: String,
    pub listening_ip: String,
    pub listening_port: u16,
    pub api_version: String,
}

/// EVENT_REGISTER and EVENT_SUBSCRIBE (runtime → master).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TopicRequest {
    pub topic: String,
    pub type_id: u32,
}

/// EVENT_UNSUBSCRIBE (runtime → master). Also sent when the publisher
/// refused the peer handshake, so the broker forgets the subscriber.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Unsubscribe {
    pub topic: String,
}

/// EVENT_SUBSCRIBE (runtime → publishing runtime).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerSubscribe {
    pub topic: String,
    pub type_id: u32,
    pub name: String,
}

/// METHOD_PROVIDE (runtime → master).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MethodSpec {
    pub method: String,
    pub request_type_id: u32,
    pub response_type_id: u32,
}

/// METHOD_QUERY (runtime → master).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MethodQuery {
    pub method: String,
    pub request_type_id: u32,
    pub response_type_id: u32,
    #[serde(default)]
    pub name: String,
}

/// METHOD_CALL (runtime → providing runtime).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MethodCall {
    pub method: String,
    pub request_type_id: u32,
    pub response_type_id: u32,
    pub name: String,
    pub request_data: String,
}

/// Where a topic's publisher accepts peer subscriptions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublisherLocation {
    pub publisher_ip: String,
    pub publisher_port: u16,
    pub publisher_name: String,
}

/// Where a method's provider accepts peer calls.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderLocation {
    pub provider_ip: String,
    pub provider_port: u16,
    pub provider_name: String,
}

// ── Debug ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DebugKind {
    ListEvent,
    ListParticipant,
    ListMethod,
}

/// DEBUG (tool → master).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DebugQuery {
    pub debug_type: DebugKind,
}

/// One row of a `list_event` reply.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventListing {
    pub name: String,
    #[serde(rename = "type")]
    pub type_id: u32,
    pub publisher: String,
    #[serde(default)]
    pub subscribers: Vec<String>,
}

/// One row of a `list_participant` reply.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParticipantListing {
    pub name: String,
    pub ip: String,
    pub port: u16,
    pub listening_ip: String,
    pub listening_port: u16,
}

/// One row of a `list_method` reply.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MethodListing {
    pub name: String,
    pub request_type: u32,
    pub response_type: u32,
    pub provider: String,
}
