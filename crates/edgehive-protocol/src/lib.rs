pub mod exchange;
pub mod http;
pub mod message;
pub mod paths;
pub mod tunnel;

pub use exchange::ModuleExchange;
pub use http::HttpResponse;
pub use message::{Content, Message, MessageHeader, MessageRoute, operation, resource};
pub use tunnel::{FrameError, RequestUrl, TunnelMessage, TunnelMessageType, VideoConnectRequest};

/// Name of a module registered on the bus.
pub type ModuleName = String;

/// Name of a module group.
pub type GroupName = String;

pub(crate) mod base64_bytes {
    use base64::{Engine, engine::general_purpose::STANDARD};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(d)?;
        STANDARD.decode(s).map_err(serde::de::Error::custom)
    }
}
