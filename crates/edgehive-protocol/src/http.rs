use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::base64_bytes;

/// HTTP-like reply envelope carried in bus message bodies.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
pub struct HttpResponse {
    pub status_code: u16,
    #[serde(default)]
    pub header: BTreeMap<String, Vec<String>>,
    #[serde(default, with = "base64_bytes")]
    pub body: Vec<u8>,
}

impl HttpResponse {
    pub fn new(status_code: u16, body: impl Into<Vec<u8>>) -> Self {
        Self {
            status_code,
            header: BTreeMap::new(),
            body: body.into(),
        }
    }

    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.header.entry(key.into()).or_default().push(value.into());
        self
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status_code)
    }

    pub fn body_str(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn envelope_fields() {
        let resp = HttpResponse::new(200, r#"{"code":200,"message":"OK"}"#)
            .with_header("Content-Type", "application/json");
        let v = serde_json::to_value(&resp).unwrap();
        assert_eq!(v["status_code"], 200);
        assert_eq!(v["header"]["Content-Type"][0], "application/json");
        let back: HttpResponse = serde_json::from_value(v).unwrap();
        assert!(back.is_success());
        assert_eq!(back.body_str(), r#"{"code":200,"message":"OK"}"#);
    }
}
