use async_trait::async_trait;
use edgehive_protocol::{TunnelMessage, TunnelMessageType, VideoConnectRequest};
use std::collections::VecDeque;
use std::fmt;
use std::sync::{Arc, Mutex as StdMutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{Mutex, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use url::Url;

use crate::error::{Result, StreamError};
use crate::session::TunnelWriter;

/// Frames held beyond the read channel before new ones are dropped.
const MAX_BACKLOG_FRAMES: usize = 4096;
const UPSTREAM_READ_CHUNK: usize = 32 * 1024;
const UPSTREAM_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// A logical connection carried inside a tunnel session.
#[async_trait]
pub trait EdgedConnection: fmt::Display + Send + Sync {
    fn connect_id(&self) -> u64;

    /// Hands over a frame addressed to this connection. Must not block: the
    /// session reader calls it for every data frame.
    fn cache_tunnel_message(&self, msg: TunnelMessage);

    /// Stops the connection; `serve` returns soon after.
    fn close_read_channel(&self);

    async fn serve(self: Arc<Self>, tunnel: TunnelWriter) -> Result<()>;
}

/// Relays one video request between the tunnel and the upstream source.
pub struct EdgedVideoConnection {
    connect_id: u64,
    resource_url: String,
    request: VideoConnectRequest,
    read_tx: mpsc::Sender<TunnelMessage>,
    read_rx: Mutex<Option<mpsc::Receiver<TunnelMessage>>>,
    backlog: StdMutex<VecDeque<TunnelMessage>>,
    stop: CancellationToken,
}

impl EdgedVideoConnection {
    pub fn new(
        connect_id: u64,
        resource_url: impl Into<String>,
        request: VideoConnectRequest,
        read_capacity: usize,
    ) -> Self {
        let (read_tx, read_rx) = mpsc::channel(read_capacity.max(1));
        Self {
            connect_id,
            resource_url: resource_url.into(),
            request,
            read_tx,
            read_rx: Mutex::new(Some(read_rx)),
            backlog: StdMutex::new(VecDeque::new()),
            stop: CancellationToken::new(),
        }
    }

    pub fn resource_url(&self) -> &str {
        &self.resource_url
    }

    pub fn request_url_path(&self) -> &str {
        &self.request.url.path
    }

    pub fn is_stopped(&self) -> bool {
        self.stop.is_cancelled()
    }

    fn backlog(&self) -> MutexGuard<'_, VecDeque<TunnelMessage>> {
        self.backlog.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Moves backlogged frames into the read channel as space frees up.
    /// Frames only enter the channel directly while the backlog is empty,
    /// which keeps them in arrival order.
    fn refill(&self) {
        let mut backlog = self.backlog();
        while let Some(msg) = backlog.pop_front() {
            match self.read_tx.try_send(msg) {
                Ok(()) => {}
                Err(TrySendError::Full(msg)) => {
                    backlog.push_front(msg);
                    break;
                }
                Err(TrySendError::Closed(_)) => {
                    backlog.clear();
                    break;
                }
            }
        }
    }
}

/// `host:port` of the upstream source. rtsp, http and https URLs without a
/// port use their well-known one.
pub fn upstream_addr(resource_url: &str) -> Result<String> {
    let invalid = |reason: &str| StreamError::InvalidUrl {
        url: resource_url.to_string(),
        reason: reason.to_string(),
    };
    let url = Url::parse(resource_url).map_err(|e| invalid(&e.to_string()))?;
    let host = url.host_str().ok_or_else(|| invalid("missing host"))?;
    let port = url
        .port()
        .or(match url.scheme() {
            "rtsp" => Some(554),
            "http" => Some(80),
            "https" => Some(443),
            _ => None,
        })
        .ok_or_else(|| invalid("no port and no default for scheme"))?;
    Ok(format!("{host}:{port}"))
}

impl fmt::Display for EdgedVideoConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "EdgedVideoConnection{{connect_id: {}, resource_url: {}, path: {}}}",
            self.connect_id, self.resource_url, self.request.url.path
        )
    }
}

#[async_trait]
impl EdgedConnection for EdgedVideoConnection {
    fn connect_id(&self) -> u64 {
        self.connect_id
    }

    fn cache_tunnel_message(&self, msg: TunnelMessage) {
        if self.is_stopped() {
            return;
        }
        let mut backlog = self.backlog();
        if backlog.is_empty() {
            match self.read_tx.try_send(msg) {
                Ok(()) => {}
                Err(TrySendError::Full(msg)) => backlog.push_back(msg),
                Err(TrySendError::Closed(_)) => {}
            }
        } else if backlog.len() >= MAX_BACKLOG_FRAMES {
            warn!(connect_id = self.connect_id, "read backlog full, dropping frame");
        } else {
            backlog.push_back(msg);
        }
    }

    fn close_read_channel(&self) {
        self.stop.cancel();
        self.backlog().clear();
    }

    async fn serve(self: Arc<Self>, tunnel: TunnelWriter) -> Result<()> {
        let mut rx = self
            .read_rx
            .lock()
            .await
            .take()
            .ok_or(StreamError::ConnectionBusy(self.connect_id))?;
        let addr = upstream_addr(&self.resource_url)?;

        let upstream = tokio::select! {
            _ = self.stop.cancelled() => return Ok(()),
            res = tokio::time::timeout(UPSTREAM_CONNECT_TIMEOUT, TcpStream::connect(&addr)) => {
                res.map_err(|_| std::io::Error::new(std::io::ErrorKind::TimedOut, format!("connect to {addr} timed out")))??
            }
        };
        info!(connect_id = self.connect_id, %addr, path = self.request_url_path(), "relaying video connection");
        let (mut up_r, mut up_w) = upstream.into_split();

        let to_upstream = async {
            while let Some(msg) = rx.recv().await {
                self.refill();
                match msg.message_type {
                    TunnelMessageType::Data => up_w.write_all(&msg.data).await?,
                    other => debug!(connect_id = self.connect_id, %other, "ignoring frame"),
                }
            }
            Ok::<(), StreamError>(())
        };

        let from_upstream = async {
            let mut buf = vec![0u8; UPSTREAM_READ_CHUNK];
            loop {
                let n = up_r.read(&mut buf).await?;
                if n == 0 {
                    debug!(connect_id = self.connect_id, "upstream closed");
                    break;
                }
                tunnel
                    .write_message(&TunnelMessage::data(self.connect_id, buf[..n].to_vec()))
                    .await?;
            }
            Ok::<(), StreamError>(())
        };

        let result = tokio::select! {
            _ = self.stop.cancelled() => Ok(()),
            res = to_upstream => res,
            res = from_upstream => res,
        };
        self.stop.cancel();
        result
    }
}
