//! Wire envelopes exchanged with the SpotHoot server, plus the reply and
//! session types built from them. Client ↔ server JSON.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Client → server: one request envelope.
#[derive(Debug, Clone, Serialize)]
pub struct OutboundEnvelope<'a> {
    pub action: &'a str,
    pub request_id: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<&'a Value>,
}

impl<'a> OutboundEnvelope<'a> {
    pub fn new(action: &'a str, request_id: u64, data: Option<&'a Value>) -> Self {
        Self {
            action,
            request_id,
            data,
        }
    }
}

/// Server → client: either a reply (matching `request_id`) or a pushed event.
///
/// Replies usually leave `action` out, so it defaults to an empty string.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InboundEnvelope {
    #[serde(default)]
    pub action: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<u64>,
    #[serde(default)]
    pub data: Value,
}

impl InboundEnvelope {
    /// Parse one text frame. A frame that is not a JSON envelope is an error.
    pub fn from_text(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }

    /// A locally raised event carrying no payload (e.g. `service-ready`).
    pub fn local_event(action: &str) -> Self {
        Self {
            action: action.to_string(),
            request_id: None,
            data: Value::Null,
        }
    }
}

/// Reply payload after the second decode pass.
///
/// The server often sends `data` as a JSON-encoded string. If that string
/// parses, the structured value is kept; otherwise the raw string passes
/// through untouched.
#[derive(Debug, Clone, PartialEq)]
pub enum ReplyData {
    Parsed(Value),
    Raw(String),
}

impl ReplyData {
    pub fn from_value(data: Value) -> Self {
        match data {
            Value::String(s) => match serde_json::from_str::<Value>(&s) {
                Ok(parsed) => ReplyData::Parsed(parsed),
                Err(_) => ReplyData::Raw(s),
            },
            other => ReplyData::Parsed(other),
        }
    }

    /// `false`, `null`, `0` and `""` are falsy; anything else is truthy.
    pub fn is_truthy(&self) -> bool {
        match self {
            ReplyData::Raw(s) => !s.is_empty(),
            ReplyData::Parsed(Value::Null) => false,
            ReplyData::Parsed(Value::Bool(b)) => *b,
            ReplyData::Parsed(Value::Number(n)) => n.as_f64().map_or(false, |f| f != 0.0),
            ReplyData::Parsed(Value::String(s)) => !s.is_empty(),
            ReplyData::Parsed(_) => true,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            ReplyData::Raw(s) => Some(s),
            ReplyData::Parsed(Value::String(s)) => Some(s),
            ReplyData::Parsed(_) => None,
        }
    }

    pub fn into_value(self) -> Value {
        match self {
            ReplyData::Parsed(v) => v,
            ReplyData::Raw(s) => Value::String(s),
        }
    }

    /// Deserialize the reply into a caller-chosen type.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        match self {
            ReplyData::Parsed(v) => T::deserialize(v),
            ReplyData::Raw(s) => T::deserialize(Value::String(s.clone())),
        }
    }
}

/// In-memory record of the logged-in user. Empty when logged out.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionRecord(Map<String, Value>);

impl SessionRecord {
    pub fn empty() -> Self {
        Self::default()
    }

    /// Build a record from a login reply. Non-object replies give an empty record.
    pub fn from_reply(reply: ReplyData) -> Self {
        match reply.into_value() {
            Value::Object(map) => SessionRecord(map),
            _ => SessionRecord::default(),
        }
    }

    pub fn from_json(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn is_logged_in(&self) -> bool {
        self.0.contains_key("name")
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn id(&self) -> Option<&Value> {
        self.0.get("id")
    }

    pub fn name(&self) -> Option<&str> {
        self.0.get("name").and_then(Value::as_str)
    }

    pub fn as_map(&self) -> &Map<String, Value> {
        &self.0
    }
}

/// Payload of `login`.
#[derive(Debug, Clone, Serialize)]
pub struct LoginRequest<'a> {
    pub code: &'a str,
}

/// Payload of `setUser`.
#[derive(Debug, Clone, Serialize)]
pub struct SetUserRequest<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<&'a Value>,
}

/// Payload of `createQuiz`.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateQuizRequest<'a> {
    pub users: &'a [i64],
    pub playlist: &'a str,
    pub nbr_of_songs: u32,
}
