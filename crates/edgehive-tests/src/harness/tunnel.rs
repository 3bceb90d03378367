use anyhow::{Context, Result, bail};
use edgehive_protocol::{TunnelMessage, VideoConnectRequest};
use edgehive_stream::DialerConfig;
use futures_util::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::WebSocketStream;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};

/// Query parameters a tunnel dial carried.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Dial {
    pub path: String,
    pub endpoint: String,
    pub url: String,
}

/// The cloud side of one accepted tunnel.
pub struct TunnelPeer {
    pub dial: Dial,
    ws: WebSocketStream<TcpStream>,
}

impl TunnelPeer {
    pub async fn send_frame(&mut self, msg: &TunnelMessage) -> Result<()> {
        self.ws.send(WsMessage::Binary(msg.encode()?)).await?;
        Ok(())
    }

    /// Asks the edge to open a video connection for `endpoint`.
    pub async fn video_connect(&mut self, connect_id: u64, endpoint: &str) -> Result<()> {
        let frame = VideoConnectRequest::new(format!("/video/{endpoint}")).to_frame(connect_id)?;
        self.send_frame(&frame).await
    }

    pub async fn send_data(&mut self, connect_id: u64, data: &[u8]) -> Result<()> {
        self.send_frame(&TunnelMessage::data(connect_id, data.to_vec())).await
    }

    /// Next tunnel frame from the edge. Control frames are skipped.
    pub async fn next_frame(&mut self, timeout: Duration) -> Result<TunnelMessage> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let next = tokio::time::timeout_at(deadline, self.ws.next())
                .await
                .context("timed out waiting for a tunnel frame")?;
            match next {
                Some(Ok(WsMessage::Binary(data))) => return Ok(TunnelMessage::decode(&data)?),
                Some(Ok(WsMessage::Close(_))) | None => bail!("tunnel closed"),
                Some(Ok(_)) => continue,
                Some(Err(e)) => return Err(e.into()),
            }
        }
    }

    /// Waits until the edge closes the tunnel.
    pub async fn wait_closed(&mut self, timeout: Duration) -> Result<()> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let next = tokio::time::timeout_at(deadline, self.ws.next())
                .await
                .context("tunnel still open")?;
            match next {
                Some(Ok(WsMessage::Close(_))) | Some(Err(_)) | None => return Ok(()),
                Some(Ok(_)) => continue,
            }
        }
    }

    pub async fn close(mut self) {
        self.ws.close(None).await.ok();
    }
}

/// Websocket server standing in for the cloud tunnel endpoint. Every
/// accepted tunnel is handed out through [`MockTunnelServer::next_peer`].
pub struct MockTunnelServer {
    pub addr: SocketAddr,
    peers: mpsc::UnboundedReceiver<TunnelPeer>,
    dials: Arc<AtomicUsize>,
    task: JoinHandle<()>,
}

impl MockTunnelServer {
    pub async fn spawn() -> Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let (tx, peers) = mpsc::unbounded_channel();
        let dials = Arc::new(AtomicUsize::new(0));

        let counter = dials.clone();
        let task = tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let tx = tx.clone();
                let counter = counter.clone();
                tokio::spawn(async move {
                    match accept_tunnel(stream).await {
                        Ok(peer) => {
                            counter.fetch_add(1, Ordering::SeqCst);
                            tracing::debug!(endpoint = %peer.dial.endpoint, "mock tunnel accepted");
                            tx.send(peer).ok();
                        }
                        Err(e) => tracing::debug!(err = %e, "mock tunnel handshake failed"),
                    }
                });
            }
        });

        Ok(Self {
            addr,
            peers,
            dials,
            task,
        })
    }

    /// Plain-websocket dialer settings pointing at this server.
    pub fn dialer_config(&self) -> DialerConfig {
        DialerConfig {
            server: self.addr.to_string(),
            scheme: "ws".to_string(),
            handshake_timeout_ms: 2000,
            retry_interval_ms: 50,
            ..Default::default()
        }
    }

    /// Completed tunnel handshakes so far.
    pub fn dial_count(&self) -> usize {
        self.dials.load(Ordering::SeqCst)
    }

    pub async fn next_peer(&mut self, timeout: Duration) -> Result<TunnelPeer> {
        tokio::time::timeout(timeout, self.peers.recv())
            .await
            .context("no tunnel dialed in time")?
            .context("mock tunnel server stopped")
    }

    /// Whether another tunnel arrives within `wait`.
    pub async fn has_more_peers(&mut self, wait: Duration) -> bool {
        matches!(tokio::time::timeout(wait, self.peers.recv()).await, Ok(Some(_)))
    }
}

impl Drop for MockTunnelServer {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn accept_tunnel(stream: TcpStream) -> Result<TunnelPeer> {
    let mut dial = None;
    let callback = |req: &Request, resp: Response| -> std::result::Result<Response, ErrorResponse> {
        let query = req.uri().query().unwrap_or_default();
        let mut endpoint = String::new();
        let mut url = String::new();
        for (key, value) in url::form_urlencoded::parse(query.as_bytes()) {
            match key.as_ref() {
                "ep" => endpoint = value.into_owned(),
                "url" => url = value.into_owned(),
                _ => {}
            }
        }
        dial = Some(Dial {
            path: req.uri().path().to_string(),
            endpoint,
            url,
        });
        Ok(resp)
    };
    let ws = tokio_tungstenite::accept_hdr_async(stream, callback).await?;
    let dial = dial.context("handshake callback did not run")?;
    Ok(TunnelPeer { dial, ws })
}
