use edgehive_protocol::FrameError;
use libedgehive::BusError;
use thiserror::Error;
use tokio_tungstenite::tungstenite;

pub type Result<T> = std::result::Result<T, StreamError>;

#[derive(Error, Debug)]
pub enum StreamError {
    #[error("endpoint {0} already exists")]
    AlreadyExists(String),

    #[error("invalid resource {0:?}, expected <endpoint>/<url>")]
    InvalidResource(String),

    #[error("action {operation} not found for resource {resource}")]
    UnknownAction { operation: String, resource: String },

    #[error("no upstream url stored for endpoint {0}")]
    UnknownEndpoint(String),

    #[error("invalid url {url}: {reason}")]
    InvalidUrl { url: String, reason: String },

    #[error("failed to open tunnel for {endpoint} after {attempts} attempts: {reason}")]
    DialFailed {
        endpoint: String,
        attempts: u32,
        reason: String,
    },

    #[error("timed out starting endpoint {0}")]
    StartTimeout(String),

    #[error("endpoint {0} was stopped while starting")]
    StartCancelled(String),

    #[error("tunnel session closed")]
    SessionClosed,

    #[error("tunnel session is already being served")]
    AlreadyServing,

    #[error("connection {0} is already being served")]
    ConnectionBusy(u64),

    #[error("store error: {0}")]
    Store(#[from] rusqlite::Error),

    #[error("store task failed: {0}")]
    StoreTask(String),

    #[error("frame error: {0}")]
    Frame(#[from] FrameError),

    #[error("websocket error: {0}")]
    WebSocket(Box<tungstenite::Error>),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Bus(#[from] BusError),
}

impl From<tungstenite::Error> for StreamError {
    fn from(e: tungstenite::Error) -> Self {
        Self::WebSocket(Box::new(e))
    }
}

impl StreamError {
    /// HTTP status reported to the requester.
    pub fn status_code(&self) -> u16 {
        match self {
            Self::InvalidResource(_) | Self::InvalidUrl { .. } => 400,
            Self::UnknownAction { .. } | Self::UnknownEndpoint(_) => 404,
            Self::StartTimeout(_) => 504,
            _ => 500,
        }
    }
}
