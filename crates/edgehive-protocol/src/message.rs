use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::SystemTime;

use crate::base64_bytes;

/// Well-known route operations.
pub mod operation {
    pub const CREATE: &str = "create";
    pub const INSERT: &str = "insert";
    pub const DELETE: &str = "delete";
    pub const QUERY: &str = "query";
    pub const UPDATE: &str = "update";
    pub const PATCH: &str = "patch";
    pub const UPLOAD: &str = "upload";
    pub const RESPONSE: &str = "response";
    pub const ERROR: &str = "error";
    pub const PUBLISH: &str = "publish";
    pub const SUBSCRIBE: &str = "subscribe";
    pub const UNSUBSCRIBE: &str = "unsubscribe";
    /// Module-topology exchange request.
    pub const MODULE: &str = "module";
}

/// Well-known route resources.
pub mod resource {
    pub const MODULE: &str = "module";
}

/// Envelope exchanged between modules, locally or over the wire.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub struct Message {
    pub header: MessageHeader,
    #[serde(rename = "route", default)]
    pub router: MessageRoute,
    #[serde(default)]
    pub content: Content,
}

#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub struct MessageHeader {
    #[serde(rename = "msg_id")]
    pub id: String,
    /// Id of the request this message answers; empty for requests.
    #[serde(rename = "parent_msg_id", default, skip_serializing_if = "String::is_empty")]
    pub parent_id: String,
    /// Creation time in milliseconds since the Unix epoch.
    #[serde(default)]
    pub timestamp: i64,
    #[serde(rename = "resourceversion", default, skip_serializing_if = "String::is_empty")]
    pub resource_version: String,
    /// Set by `send_sync`; the sender awaits a reply keyed by `id`.
    #[serde(default, skip_serializing_if = "is_false")]
    pub sync: bool,
    /// Context type that delivered the message (channel, tcp, unix, ...).
    #[serde(rename = "type", default, skip_serializing_if = "String::is_empty")]
    pub message_type: String,
}

#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub struct MessageRoute {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub source: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub destination: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub group: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub operation: String,
    /// Hierarchical slash path.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub resource: String,
}

/// Opaque message payload.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum Content {
    #[default]
    Empty,
    Json(serde_json::Value),
    Bytes(#[serde(with = "base64_bytes")] Vec<u8>),
}

fn is_false(b: &bool) -> bool {
    !*b
}

pub fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}

impl Message {
    /// A message with a fresh id and the current timestamp.
    pub fn new(parent_id: impl Into<String>) -> Self {
        let mut msg = Self::default();
        msg.header.id = uuid::Uuid::new_v4().to_string();
        msg.header.parent_id = parent_id.into();
        msg.header.timestamp = now_ms();
        msg
    }

    /// A message with an empty header, for callers that build it field by field.
    pub fn new_raw() -> Self {
        Self::default()
    }

    pub fn build_header(mut self, id: impl Into<String>, parent_id: impl Into<String>, timestamp: i64) -> Self {
        self.header.id = id.into();
        self.header.parent_id = parent_id.into();
        self.header.timestamp = timestamp;
        self
    }

    pub fn build_router(
        self,
        source: impl Into<String>,
        group: impl Into<String>,
        resource: impl Into<String>,
        operation: impl Into<String>,
    ) -> Self {
        self.set_route(source, group)
            .set_resource_operation(resource, operation)
    }

    pub fn set_route(mut self, source: impl Into<String>, group: impl Into<String>) -> Self {
        self.router.source = source.into();
        self.router.group = group.into();
        self
    }

    pub fn set_resource_operation(
        mut self,
        resource: impl Into<String>,
        operation: impl Into<String>,
    ) -> Self {
        self.router.resource = resource.into();
        self.router.operation = operation.into();
        self
    }

    pub fn set_destination(mut self, destination: impl Into<String>) -> Self {
        self.router.destination = destination.into();
        self
    }

    pub fn set_type(mut self, message_type: impl Into<String>) -> Self {
        self.header.message_type = message_type.into();
        self
    }

    pub fn set_resource_version(mut self, version: impl Into<String>) -> Self {
        self.header.resource_version = version.into();
        self
    }

    pub fn with_content(mut self, content: Content) -> Self {
        self.content = content;
        self
    }

    pub fn fill_json(self, value: serde_json::Value) -> Self {
        self.with_content(Content::Json(value))
    }

    pub fn fill_bytes(self, bytes: impl Into<Vec<u8>>) -> Self {
        self.with_content(Content::Bytes(bytes.into()))
    }

    /// Serialize `body` into the JSON content slot.
    pub fn fill_body<T: Serialize>(self, body: &T) -> Result<Self, serde_json::Error> {
        let value = serde_json::to_value(body)?;
        Ok(self.fill_json(value))
    }

    pub fn id(&self) -> &str {
        &self.header.id
    }

    pub fn parent_id(&self) -> &str {
        &self.header.parent_id
    }

    pub fn source(&self) -> &str {
        &self.router.source
    }

    pub fn destination(&self) -> &str {
        &self.router.destination
    }

    pub fn group(&self) -> &str {
        &self.router.group
    }

    pub fn resource(&self) -> &str {
        &self.router.resource
    }

    pub fn operation(&self) -> &str {
        &self.router.operation
    }

    pub fn is_sync(&self) -> bool {
        self.header.sync
    }

    /// True when this message answers another one.
    pub fn is_response(&self) -> bool {
        !self.header.parent_id.is_empty()
    }

    /// Raw bytes of the content; JSON content is encoded.
    pub fn content_data(&self) -> Result<Vec<u8>, serde_json::Error> {
        match &self.content {
            Content::Empty => Ok(Vec::new()),
            Content::Bytes(b) => Ok(b.clone()),
            Content::Json(v) => serde_json::to_vec(v),
        }
    }

    /// Decode the content as `T`. Byte content is parsed as JSON.
    pub fn decode_body<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        match &self.content {
            Content::Json(v) => T::deserialize(v),
            Content::Bytes(b) => serde_json::from_slice(b),
            Content::Empty => T::deserialize(serde_json::Value::Null),
        }
    }

    /// Copy of this message under a new id; parent, route and body are kept.
    pub fn clone_with_new_id(&self) -> Self {
        Self::new_raw()
            .build_header(
                uuid::Uuid::new_v4().to_string(),
                self.header.parent_id.clone(),
                self.header.timestamp,
            )
            .build_router(
                self.router.source.clone(),
                self.router.group.clone(),
                self.router.resource.clone(),
                self.router.operation.clone(),
            )
            .with_content(self.content.clone())
    }

    /// Response to this message: parent id is this id, route source and
    /// group are copied so the reply can find its way back.
    pub fn new_response(&self, content: Content) -> Self {
        Self::new(self.header.id.clone())
            .set_route(self.router.source.clone(), self.router.group.clone())
            .set_resource_operation(self.router.resource.clone(), operation::RESPONSE)
            .set_type(self.header.message_type.clone())
            .with_content(content)
    }

    /// Error reply carrying `reason` as its body.
    pub fn new_error(&self, reason: impl Into<String>) -> Self {
        Self::new(self.header.id.clone())
            .set_route(self.router.source.clone(), self.router.group.clone())
            .set_resource_operation(self.router.resource.clone(), operation::ERROR)
            .fill_json(serde_json::Value::String(reason.into()))
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "MessageID: {} ParentID: {} Group: {} Source: {} Destination: {} Resource: {} Operation: {}",
            self.header.id,
            self.header.parent_id,
            self.router.group,
            self.router.source,
            self.router.destination,
            self.router.resource,
            self.router.operation,
        )
    }
}
