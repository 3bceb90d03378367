use bytes::{Buf, BufMut};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use thiserror::Error;

/// Size of the fixed tunnel frame header: connect id, type, data length.
pub const TUNNEL_HEADER_LEN: usize = 8 + 2 + 4;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum FrameError {
    #[error("tunnel frame too short: {0} bytes")]
    Truncated(usize),

    #[error("tunnel frame declares {declared} data bytes but carries {actual}")]
    LengthMismatch { declared: usize, actual: usize },

    #[error("unknown tunnel message type {0}")]
    UnknownType(u16),

    #[error("tunnel frame data of {0} bytes does not fit a u32 length")]
    TooLarge(usize),
}

/// Tunnel message types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum TunnelMessageType {
    Data = 1,
    CloseConnect = 2,
    VideoConnect = 3,
    AttachConnect = 4,
}

impl TryFrom<u16> for TunnelMessageType {
    type Error = FrameError;

    fn try_from(v: u16) -> Result<Self, Self::Error> {
        match v {
            1 => Ok(Self::Data),
            2 => Ok(Self::CloseConnect),
            3 => Ok(Self::VideoConnect),
            4 => Ok(Self::AttachConnect),
            other => Err(FrameError::UnknownType(other)),
        }
    }
}

impl fmt::Display for TunnelMessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Data => "DATA",
            Self::CloseConnect => "CLOSE_CONNECT",
            Self::VideoConnect => "VIDEO_CONNECT",
            Self::AttachConnect => "ATTACH_CONNECT",
        };
        f.write_str(name)
    }
}

/// One frame on the tunnel websocket.
///
/// Wire layout (big-endian):
///   [connect_id: u64][type: u16][data_length: u32][data: data_length bytes]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TunnelMessage {
    pub connect_id: u64,
    pub message_type: TunnelMessageType,
    pub data: Vec<u8>,
}

impl TunnelMessage {
    pub fn new(connect_id: u64, message_type: TunnelMessageType, data: impl Into<Vec<u8>>) -> Self {
        Self {
            connect_id,
            message_type,
            data: data.into(),
        }
    }

    pub fn data(connect_id: u64, data: impl Into<Vec<u8>>) -> Self {
        Self::new(connect_id, TunnelMessageType::Data, data)
    }

    pub fn close(connect_id: u64) -> Self {
        Self::new(connect_id, TunnelMessageType::CloseConnect, Vec::new())
    }

    pub fn encode(&self) -> Result<Vec<u8>, FrameError> {
        let len = data_len(self.data.len())?;
        let mut buf = Vec::with_capacity(TUNNEL_HEADER_LEN + self.data.len());
        buf.put_u64(self.connect_id);
        buf.put_u16(self.message_type as u16);
        buf.put_u32(len);
        buf.put_slice(&self.data);
        Ok(buf)
    }

    pub fn decode(frame: &[u8]) -> Result<Self, FrameError> {
        if frame.len() < TUNNEL_HEADER_LEN {
            return Err(FrameError::Truncated(frame.len()));
        }
        let mut buf = frame;
        let connect_id = buf.get_u64();
        let raw_type = buf.get_u16();
        let declared = buf.get_u32() as usize;
        if buf.remaining() != declared {
            return Err(FrameError::LengthMismatch {
                declared,
                actual: buf.remaining(),
            });
        }
        let message_type = TunnelMessageType::try_from(raw_type)?;
        Ok(Self {
            connect_id,
            message_type,
            data: buf.to_vec(),
        })
    }
}

fn data_len(len: usize) -> Result<u32, FrameError> {
    u32::try_from(len).map_err(|_| FrameError::TooLarge(len))
}

impl fmt::Display for TunnelMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "MessageType {} ConnectID {} data length {}",
            self.message_type,
            self.connect_id,
            self.data.len()
        )
    }
}

/// Requested URL carried in a connect payload.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
pub struct RequestUrl {
    pub path: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub raw_query: String,
}

/// JSON payload of a `VideoConnect` frame.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
pub struct VideoConnectRequest {
    pub url: RequestUrl,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub header: BTreeMap<String, Vec<String>>,
}

impl VideoConnectRequest {
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            url: RequestUrl {
                path: path.into(),
                raw_query: String::new(),
            },
            header: BTreeMap::new(),
        }
    }

    /// Last non-empty segment of the requested path: the endpoint name used
    /// to look up the upstream URL.
    pub fn endpoint_name(&self) -> Option<&str> {
        self.url
            .path
            .trim_end_matches('/')
            .rsplit('/')
            .next()
            .filter(|s| !s.is_empty())
    }

    pub fn to_frame(&self, connect_id: u64) -> Result<TunnelMessage, serde_json::Error> {
        let data = serde_json::to_vec(self)?;
        Ok(TunnelMessage::new(
            connect_id,
            TunnelMessageType::VideoConnect,
            data,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_layout_is_big_endian() {
        let msg = TunnelMessage::data(0x0102_0304_0506_0708, b"ab".to_vec());
        let frame = msg.encode().unwrap();
        assert_eq!(
            frame,
            vec![1, 2, 3, 4, 5, 6, 7, 8, 0, 1, 0, 0, 0, 2, b'a', b'b']
        );
        assert_eq!(TunnelMessage::decode(&frame).unwrap(), msg);
    }

    #[test]
    fn decode_rejects_short_and_mismatched_frames() {
        assert_eq!(
            TunnelMessage::decode(&[0; 5]),
            Err(FrameError::Truncated(5))
        );
        let mut frame = TunnelMessage::data(1, b"abc".to_vec()).encode().unwrap();
        frame.pop();
        assert_eq!(
            TunnelMessage::decode(&frame),
            Err(FrameError::LengthMismatch {
                declared: 3,
                actual: 2
            })
        );
    }

    #[test]
    fn decode_rejects_unknown_type() {
        let mut frame = TunnelMessage::close(9).encode().unwrap();
        frame[9] = 42;
        assert_eq!(
            TunnelMessage::decode(&frame),
            Err(FrameError::UnknownType(42))
        );
    }

    #[test]
    fn data_length_must_fit_header() {
        assert_eq!(data_len(u32::MAX as usize), Ok(u32::MAX));
        #[cfg(target_pointer_width = "64")]
        assert_eq!(
            data_len(u32::MAX as usize + 1),
            Err(FrameError::TooLarge(u32::MAX as usize + 1))
        );
    }

    #[test]
    fn endpoint_name_is_last_segment() {
        assert_eq!(
            VideoConnectRequest::new("/v1/video/ns/ep1").endpoint_name(),
            Some("ep1")
        );
        assert_eq!(
            VideoConnectRequest::new("/v1/video/ep2/").endpoint_name(),
            Some("ep2")
        );
        assert_eq!(VideoConnectRequest::new("/").endpoint_name(), None);
        assert_eq!(VideoConnectRequest::new("").endpoint_name(), None);
    }

    #[test]
    fn video_connect_payload_has_url_path() {
        let frame = VideoConnectRequest::new("/stream/ep1").to_frame(7).unwrap();
        assert_eq!(frame.message_type, TunnelMessageType::VideoConnect);
        let v: serde_json::Value = serde_json::from_slice(&frame.data).unwrap();
        assert_eq!(v["url"]["path"], "/stream/ep1");
    }
}
