use serde::{
    Deserialize, Deserializer, Serialize, Serializer,
    ser::SerializeMap,
};
use serde_json::Value;

use crate::error::ErrorKind;

/// Request ids are scoped to the direction of the request.
pub type RequestId = u64;

/// Error payload of a response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RpcError {
    #[serde(rename = "type")]
    pub kind: ErrorKind,
    pub message: String,
    #[serde(
        rename = "guestType",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub guest_type: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    Request {
        id: RequestId,
        method: String,
        params: Value,
    },
    Response {
        id: RequestId,
        outcome: Result<Value, RpcError>,
    },
    Notification {
        method: String,
        params: Value,
    },
}

impl Message {
    pub fn request(id: RequestId, method: impl Into<String>, params: Value) -> Self {
        Self::Request {
            id,
            method: method.into(),
            params,
        }
    }

    pub fn notification(method: impl Into<String>, params: Value) -> Self {
        Self::Notification {
            method: method.into(),
            params,
        }
    }

    pub const fn response(id: RequestId, outcome: Result<Value, RpcError>) -> Self {
        Self::Response { id, outcome }
    }

    pub fn method(&self) -> Option<&str> {
        match self {
            Self::Request { method, .. } | Self::Notification { method, .. } => Some(method),
            Self::Response { .. } => None,
        }
    }

    pub fn is_notification_of(&self, name: &str) -> bool {
        matches!(self, Self::Notification { method, .. } if method == name)
    }
}

impl Serialize for Message {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(None)?;
        match self {
            Self::Request { id, method, params } => {
                map.serialize_entry("id", id)?;
                map.serialize_entry("method", method)?;
                map.serialize_entry("params", params)?;
            }
            Self::Response { id, outcome } => {
                map.serialize_entry("id", id)?;
                match outcome {
                    Ok(result) => map.serialize_entry("result", result)?,
                    Err(error) => map.serialize_entry("error", error)?,
                }
            }
            Self::Notification { method, params } => {
                map.serialize_entry("method", method)?;
                map.serialize_entry("params", params)?;
            }
        }
        map.end()
    }
}

/// Loose decoding target; shape is validated by [`WireMessage::classify`].
#[derive(Deserialize)]
pub(super) struct WireMessage {
    #[serde(default)]
    id: Option<RequestId>,
    #[serde(default)]
    method: Option<String>,
    #[serde(default, deserialize_with = "present")]
    params: Option<Value>,
    #[serde(default, deserialize_with = "present")]
    result: Option<Value>,
    #[serde(default)]
    error: Option<RpcError>,
}

/// Keeps an explicit `null` distinguishable from an absent field.
fn present<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<Value>, D::Error> {
    Value::deserialize(deserializer).map(Some)
}

impl WireMessage {
    pub(super) fn classify(self) -> Result<Message, &'static str> {
        match (self.id, self.method) {
            (Some(id), Some(method)) => {
                if self.result.is_some() || self.error.is_some() {
                    return Err("request carries a result or error");
                }
                Ok(Message::Request {
                    id,
                    method,
                    params: self.params.unwrap_or(Value::Null),
                })
            }
            (None, Some(method)) => {
                if self.result.is_some() || self.error.is_some() {
                    return Err("notification carries a result or error");
                }
                Ok(Message::Notification {
                    method,
                    params: self.params.unwrap_or(Value::Null),
                })
            }
            (Some(id), None) => match (self.result, self.error) {
                (Some(result), None) => Ok(Message::Response {
                    id,
                    outcome: Ok(result),
                }),
                (None, Some(error)) => Ok(Message::Response {
                    id,
                    outcome: Err(error),
                }),
                (Some(_), Some(_)) => Err("response carries both result and error"),
                (None, None) => Err("response carries neither result nor error"),
            },
            (None, None) => Err("message has neither id nor method"),
        }
    }
}
