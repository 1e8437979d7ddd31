//! JSON control-frame shapes: every `op` variant listed in spec §4.1,
//! plus the descriptor types (`Channel`, `Service`, `ClientChannel`) they
//! carry.
//!
//! Unknown fields inside a recognized `op` are preserved via a flattened
//! `extra` map so a server built against a newer protocol revision still
//! round-trips through an older client/server pair untouched. A
//! completely unrecognized `op` string decodes to [`ClientMessage::Unknown`]
//! / [`ServerMessage::Unknown`] rather than failing the parse — see design
//! note in spec §9.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::parameter::Parameter;

fn no_extra() -> Map<String, Value> {
    Map::new()
}

fn extra_is_empty(extra: &Map<String, Value>) -> bool {
    extra.is_empty()
}

/// Status severity, per spec §6. Serialized as the bare integer 0/1/2
/// (see the hand-rolled `Serialize`/`Deserialize` impls below).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum StatusLevel {
    Info = 0,
    Warning = 1,
    Error = 2,
}

/// A server-advertised channel descriptor.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Channel {
    pub id: u32,
    pub topic: String,
    pub encoding: String,
    pub schema_name: String,
    pub schema: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schema_encoding: Option<String>,
}

/// A channel descriptor before the registry has assigned it an id.
#[derive(Clone, Debug, PartialEq)]
pub struct NewChannel {
    pub topic: String,
    pub encoding: String,
    pub schema_name: String,
    pub schema: String,
    pub schema_encoding: Option<String>,
}

impl NewChannel {
    pub fn into_channel(self, id: u32) -> Channel {
        Channel {
            id,
            topic: self.topic,
            encoding: self.encoding,
            schema_name: self.schema_name,
            schema: self.schema,
            schema_encoding: self.schema_encoding,
        }
    }

    /// True when `other` could reuse `other`'s id: every descriptor field
    /// matches byte-for-byte (spec §3 channel reuse invariant).
    pub fn matches(&self, other: &Channel) -> bool {
        self.topic == other.topic
            && self.encoding == other.encoding
            && self.schema_name == other.schema_name
            && self.schema == other.schema
            && self.schema_encoding == other.schema_encoding
    }
}

/// A service's request or response descriptor (the modern, structured
/// form).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceMessageSchema {
    pub encoding: String,
    pub schema_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schema_encoding: Option<String>,
    pub schema: String,
}

/// A server-advertised service descriptor. Either the structured
/// `request`/`response` pair or the legacy flat `request_schema` /
/// `response_schema` strings are present, never both.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Service {
    pub id: u32,
    pub name: String,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request: Option<ServiceMessageSchema>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response: Option<ServiceMessageSchema>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_schema: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_schema: Option<String>,
}

/// A service descriptor before the registry has assigned it an id.
#[derive(Clone, Debug, PartialEq)]
pub struct NewService {
    pub name: String,
    pub kind: String,
    pub request: Option<ServiceMessageSchema>,
    pub response: Option<ServiceMessageSchema>,
    pub request_schema: Option<String>,
    pub response_schema: Option<String>,
}

impl NewService {
    pub fn into_service(self, id: u32) -> Service {
        Service {
            id,
            name: self.name,
            kind: self.kind,
            request: self.request,
            response: self.response,
            request_schema: self.request_schema,
            response_schema: self.response_schema,
        }
    }

    pub fn matches(&self, other: &Service) -> bool {
        self.name == other.name
            && self.kind == other.kind
            && self.request == other.request
            && self.response == other.response
            && self.request_schema == other.request_schema
            && self.response_schema == other.response_schema
    }
}

/// A client-advertised channel (gated by capability `clientPublish`).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientChannel {
    pub id: u32,
    pub topic: String,
    pub encoding: String,
    pub schema_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schema: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schema_encoding: Option<String>,
}

/// One entry of a `subscribe` request: the client's chosen subscription id
/// bound to a known channel id.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscriptionEntry {
    pub id: u32,
    pub channel_id: u32,
}

/// A single topic/service entry in a connection-graph delta: the entity's
/// name and the set of peer ids publishing/subscribing/providing it.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GraphEntry {
    pub name: String,
    pub ids: Vec<String>,
}

/// A delta to the connection graph: new/updated entries replace prior ones
/// by name; `removed_*` clears named entries entirely.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionGraphUpdate {
    #[serde(default)]
    pub published_topics: Vec<GraphEntry>,
    #[serde(default)]
    pub subscribed_topics: Vec<GraphEntry>,
    #[serde(default)]
    pub advertised_services: Vec<GraphEntry>,
    #[serde(default)]
    pub removed_topics: Vec<String>,
    #[serde(default)]
    pub removed_services: Vec<String>,
}

/// Server→client JSON control frames, tagged on `op`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "camelCase")]
pub enum ServerMessage {
    #[serde(rename_all = "camelCase")]
    ServerInfo {
        name: String,
        capabilities: Vec<String>,
        supported_encodings: Vec<String>,
        metadata: HashMap<String, String>,
        session_id: String,
        #[serde(flatten, default = "no_extra", skip_serializing_if = "extra_is_empty")]
        extra: Map<String, Value>,
    },
    #[serde(rename_all = "camelCase")]
    Status {
        level: StatusLevel,
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        id: Option<String>,
    },
    #[serde(rename_all = "camelCase")]
    RemoveStatus { status_ids: Vec<String> },
    #[serde(rename_all = "camelCase")]
    Advertise { channels: Vec<Channel> },
    #[serde(rename_all = "camelCase")]
    Unadvertise { channel_ids: Vec<u32> },
    #[serde(rename_all = "camelCase")]
    ParameterValues {
        parameters: Vec<Parameter>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        id: Option<String>,
    },
    #[serde(rename_all = "camelCase")]
    AdvertiseServices { services: Vec<Service> },
    #[serde(rename_all = "camelCase")]
    UnadvertiseServices { service_ids: Vec<u32> },
    #[serde(rename_all = "camelCase")]
    ConnectionGraphUpdate(ConnectionGraphUpdate),
    #[serde(rename_all = "camelCase")]
    ServiceCallFailure {
        service_id: u32,
        call_id: u32,
        message: String,
    },
}

/// The outcome of parsing a control frame: either a message in the known
/// closed set, or an `op` this codec version has never heard of. The
/// latter is logged and dropped by callers rather than treated as a parse
/// failure (spec §9 design note on unknown JSON fields/opcodes).
#[derive(Clone, Debug, PartialEq)]
pub enum Frame<M> {
    Known(M),
    UnknownOp { op: String, raw: Value },
}

/// Client→server JSON control frames, tagged on `op`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "camelCase")]
pub enum ClientMessage {
    #[serde(rename_all = "camelCase")]
    Subscribe {
        subscriptions: Vec<SubscriptionEntry>,
    },
    #[serde(rename_all = "camelCase")]
    Unsubscribe { subscription_ids: Vec<u32> },
    #[serde(rename_all = "camelCase")]
    Advertise { channels: Vec<ClientChannel> },
    #[serde(rename_all = "camelCase")]
    Unadvertise { channel_ids: Vec<u32> },
    #[serde(rename_all = "camelCase")]
    GetParameters {
        parameter_names: Vec<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        id: Option<String>,
    },
    #[serde(rename_all = "camelCase")]
    SetParameters {
        parameters: Vec<Parameter>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        id: Option<String>,
    },
    #[serde(rename_all = "camelCase")]
    SubscribeParameterUpdates { parameter_names: Vec<String> },
    #[serde(rename_all = "camelCase")]
    UnsubscribeParameterUpdates { parameter_names: Vec<String> },
    #[serde(rename_all = "camelCase")]
    SubscribeConnectionGraph,
    #[serde(rename_all = "camelCase")]
    UnsubscribeConnectionGraph,
    #[serde(rename_all = "camelCase")]
    FetchAsset { uri: String, request_id: u32 },
}

impl ServerMessage {
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }

    /// Parses a server control frame. An unrecognized `op` yields
    /// `Frame::UnknownOp` instead of an error (forward compat).
    pub fn from_json(text: &str) -> serde_json::Result<Frame<Self>> {
        let raw: Value = serde_json::from_str(text)?;
        match serde_json::from_value::<Self>(raw.clone()) {
            Ok(msg) => Ok(Frame::Known(msg)),
            Err(err) => {
                let op = raw
                    .get("op")
                    .and_then(Value::as_str)
                    .map(str::to_owned)
                    .ok_or(err)?;
                Ok(Frame::UnknownOp { op, raw })
            }
        }
    }
}

impl ClientMessage {
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }

    /// Parses a client control frame. An unrecognized `op` yields
    /// `Frame::UnknownOp` instead of an error (forward compat).
    pub fn from_json(text: &str) -> serde_json::Result<Frame<Self>> {
        let raw: Value = serde_json::from_str(text)?;
        match serde_json::from_value::<Self>(raw.clone()) {
            Ok(msg) => Ok(Frame::Known(msg)),
            Err(err) => {
                let op = raw
                    .get("op")
                    .and_then(Value::as_str)
                    .map(str::to_owned)
                    .ok_or(err)?;
                Ok(Frame::UnknownOp { op, raw })
            }
        }
    }
}

// serde_repr isn't pulled in as a dependency; StatusLevel needs a compact
// numeric wire form (0/1/2) so we implement it by hand instead of adding a
// crate just for three variants.
use serde::de::{self, Deserializer};
use serde::ser::Serializer;

impl Serialize for StatusLevel {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u8(*self as u8)
    }
}

impl<'de> Deserialize<'de> for StatusLevel {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = u8::deserialize(deserializer)?;
        match raw {
            0 => Ok(StatusLevel::Info),
            1 => Ok(StatusLevel::Warning),
            2 => Ok(StatusLevel::Error),
            other => Err(de::Error::custom(format!("invalid status level {other}"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn server_info_round_trips() {
        let msg = ServerMessage::ServerInfo {
            name: "foo".into(),
            capabilities: vec![],
            supported_encodings: vec!["json".into()],
            metadata: HashMap::new(),
            session_id: "abc".into(),
            extra: Map::new(),
        };
        let json = msg.to_json().unwrap();
        let back = ServerMessage::from_json(&json).unwrap();
        assert_eq!(back, Frame::Known(msg));
    }

    #[test]
    fn unknown_op_does_not_error() {
        let json = r#"{"op":"somethingNew","foo":1}"#;
        let frame = ServerMessage::from_json(json).unwrap();
        match frame {
            Frame::UnknownOp { op, .. } => assert_eq!(op, "somethingNew"),
            _ => panic!("expected UnknownOp"),
        }
    }

    #[test]
    fn status_level_is_numeric_on_wire() {
        let msg = ServerMessage::Status {
            level: StatusLevel::Error,
            message: "boom".into(),
            id: None,
        };
        let json = msg.to_json().unwrap();
        assert!(json.contains("\"level\":2"));
    }

    #[test]
    fn unsubscribe_op_name_is_unsubscribe_not_subscribe() {
        // Regression for the documentation bug noted in spec §9 (ii).
        let msg = ClientMessage::Unsubscribe {
            subscription_ids: vec![1],
        };
        let json = msg.to_json().unwrap();
        assert!(json.starts_with(r#"{"op":"unsubscribe""#));
    }

    #[test]
    fn channel_reuse_requires_byte_identical_descriptor() {
        let a = NewChannel {
            topic: "/t".into(),
            encoding: "json".into(),
            schema_name: "T".into(),
            schema: "{}".into(),
            schema_encoding: None,
        };
        let existing = a.clone().into_channel(1);
        assert!(a.matches(&existing));
        let mut b = a.clone();
        b.schema = "{\"x\":1}".into();
        assert!(!b.matches(&existing));
    }
}
