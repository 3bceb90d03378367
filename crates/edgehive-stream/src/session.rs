use edgehive_protocol::{FrameError, TunnelMessage, TunnelMessageType, VideoConnectRequest};
use futures_util::{Sink, SinkExt, Stream, StreamExt};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinSet;
use tokio_tungstenite::WebSocketStream;
use tokio_tungstenite::tungstenite::{Error as WsError, Message as WsMessage};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::connection::{EdgedConnection, EdgedVideoConnection};
use crate::error::{Result, StreamError};
use crate::store::UrlStore;

type WsSink = Pin<Box<dyn Sink<WsMessage, Error = WsError> + Send>>;
type WsSource = Pin<Box<dyn Stream<Item = std::result::Result<WsMessage, WsError>> + Send>>;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub ping_interval_ms: u64,
    pub ping_timeout_ms: u64,
    pub read_channel_capacity: usize,
    /// How long closing waits for connection tasks before aborting them.
    pub drain_timeout_ms: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            ping_interval_ms: 5000,
            ping_timeout_ms: 1000,
            read_channel_capacity: 128,
            drain_timeout_ms: 5000,
        }
    }
}

/// Shared write half of a tunnel. Frames from all logical connections are
/// serialized through its lock.
#[derive(Clone)]
pub struct TunnelWriter {
    sink: Arc<Mutex<WsSink>>,
    closed: CancellationToken,
}

impl TunnelWriter {
    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    pub async fn write_message(&self, msg: &TunnelMessage) -> Result<()> {
        if self.is_closed() {
            return Err(StreamError::SessionClosed);
        }
        let frame = msg.encode()?;
        let mut sink = self.sink.lock().await;
        sink.send(WsMessage::Binary(frame)).await?;
        Ok(())
    }

    async fn ping(&self) -> Result<()> {
        let mut sink = self.sink.lock().await;
        sink.send(WsMessage::Ping(Vec::new())).await?;
        Ok(())
    }

    async fn close(&self) {
        let mut sink = self.sink.lock().await;
        if let Err(e) = sink.send(WsMessage::Close(None)).await {
            debug!(err = %e, "failed to send websocket close");
        }
        sink.close().await.ok();
    }
}

/// One websocket tunnel to the cloud, multiplexing many logical
/// connections by connect id.
pub struct TunnelSession {
    endpoint: String,
    writer: TunnelWriter,
    reader: Mutex<Option<WsSource>>,
    local_connections: RwLock<HashMap<u64, Arc<dyn EdgedConnection>>>,
    tasks: Mutex<JoinSet<()>>,
    store: UrlStore,
    config: SessionConfig,
    closed: CancellationToken,
    closing: AtomicBool,
}

fn same_connection(a: &Arc<dyn EdgedConnection>, b: &Arc<dyn EdgedConnection>) -> bool {
    Arc::as_ptr(a) as *const () == Arc::as_ptr(b) as *const ()
}

impl TunnelSession {
    pub fn new<S>(
        endpoint: impl Into<String>,
        ws: WebSocketStream<S>,
        store: UrlStore,
        config: SessionConfig,
    ) -> Arc<Self>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let (sink, source) = ws.split();
        let closed = CancellationToken::new();
        Arc::new(Self {
            endpoint: endpoint.into(),
            writer: TunnelWriter {
                sink: Arc::new(Mutex::new(Box::pin(sink))),
                closed: closed.clone(),
            },
            reader: Mutex::new(Some(Box::pin(source))),
            local_connections: RwLock::new(HashMap::new()),
            tasks: Mutex::new(JoinSet::new()),
            store,
            config,
            closed,
            closing: AtomicBool::new(false),
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub fn writer(&self) -> TunnelWriter {
        self.writer.clone()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    /// Resolves once the session has been closed.
    pub async fn closed(&self) {
        self.closed.cancelled().await
    }

    /// Runs the reader and keepalive loops until the tunnel ends, then
    /// closes the session and waits for its connections.
    pub async fn serve(self: Arc<Self>) -> Result<()> {
        let mut reader = self
            .reader
            .lock()
            .await
            .take()
            .ok_or(StreamError::AlreadyServing)?;
        info!(endpoint = %self.endpoint, "tunnel session started");

        let pinger = tokio::spawn(self.clone().ping_loop());
        let result = self.read_loop(&mut reader).await;
        if let Err(e) = &result {
            warn!(endpoint = %self.endpoint, err = %e, "tunnel session failed");
        }
        self.close().await;
        pinger.await.ok();
        self.drain_tasks().await;
        result
    }

    async fn read_loop(self: &Arc<Self>, reader: &mut WsSource) -> Result<()> {
        loop {
            let next = tokio::select! {
                _ = self.closed.cancelled() => return Ok(()),
                next = reader.next() => next,
            };
            let data = match next {
                None => return Ok(()),
                Some(Err(e)) => return Err(e.into()),
                Some(Ok(WsMessage::Binary(data))) => data,
                Some(Ok(WsMessage::Close(frame))) => {
                    debug!(endpoint = %self.endpoint, ?frame, "tunnel closed by peer");
                    return Ok(());
                }
                Some(Ok(_)) => continue,
            };

            let msg = match TunnelMessage::decode(&data) {
                Ok(msg) => msg,
                Err(FrameError::UnknownType(t)) => {
                    warn!(endpoint = %self.endpoint, message_type = t, "skipping tunnel frame of unknown type");
                    continue;
                }
                Err(e) => return Err(e.into()),
            };

            match msg.message_type {
                TunnelMessageType::CloseConnect => {
                    info!(endpoint = %self.endpoint, connect_id = msg.connect_id, "tunnel close requested by cloud");
                    return Ok(());
                }
                TunnelMessageType::Data => self.dispatch_to_local(msg).await,
                TunnelMessageType::VideoConnect => self.open_video_connection(msg).await,
                TunnelMessageType::AttachConnect => {
                    warn!(connect_id = msg.connect_id, "attach connections are not supported, ignoring");
                }
            }
        }
    }

    async fn dispatch_to_local(&self, msg: TunnelMessage) {
        let conn = self
            .local_connections
            .read()
            .await
            .get(&msg.connect_id)
            .cloned();
        match conn {
            Some(conn) => conn.cache_tunnel_message(msg),
            None => debug!(connect_id = msg.connect_id, "no local connection for data frame"),
        }
    }

    async fn open_video_connection(self: &Arc<Self>, msg: TunnelMessage) {
        match self.build_video_connection(&msg).await {
            Ok(conn) => self.attach_connection(Arc::new(conn)).await,
            Err(e) => warn!(connect_id = msg.connect_id, err = %e, "cannot open video connection"),
        }
    }

    async fn build_video_connection(&self, msg: &TunnelMessage) -> Result<EdgedVideoConnection> {
        let request: VideoConnectRequest = serde_json::from_slice(&msg.data)?;
        let endpoint = request
            .endpoint_name()
            .ok_or_else(|| StreamError::InvalidResource(request.url.path.clone()))?
            .to_string();
        let row = self
            .store
            .get(&endpoint)
            .await?
            .ok_or(StreamError::UnknownEndpoint(endpoint))?;
        Ok(EdgedVideoConnection::new(
            msg.connect_id,
            row.url,
            request,
            self.config.read_channel_capacity,
        ))
    }

    /// Registers `conn` under its connect id and serves it in the
    /// background. Frames for that id are routed to it from now on.
    pub async fn attach_connection(self: &Arc<Self>, conn: Arc<dyn EdgedConnection>) {
        if self.is_closed() {
            conn.close_read_channel();
            return;
        }
        let id = conn.connect_id();
        if let Some(old) = self.local_connections.write().await.insert(id, conn.clone()) {
            warn!(connect_id = id, "replacing connection with duplicate id");
            old.close_read_channel();
        }
        info!(connect_id = id, connection = %conn, "local connection opened");

        let session = self.clone();
        self.tasks.lock().await.spawn(async move {
            if let Err(e) = conn.clone().serve(session.writer.clone()).await {
                warn!(connect_id = id, err = %e, "local connection failed");
            }
            session.remove_local_connection(&conn).await;
            conn.close_read_channel();
            debug!(connect_id = id, "local connection closed");
        });
    }

    async fn remove_local_connection(&self, conn: &Arc<dyn EdgedConnection>) {
        let mut conns = self.local_connections.write().await;
        if conns
            .get(&conn.connect_id())
            .is_some_and(|current| same_connection(current, conn))
        {
            conns.remove(&conn.connect_id());
        }
    }

    pub async fn local_connection_count(&self) -> usize {
        self.local_connections.read().await.len()
    }

    pub async fn has_local_connection(&self, connect_id: u64) -> bool {
        self.local_connections.read().await.contains_key(&connect_id)
    }

    async fn ping_loop(self: Arc<Self>) {
        let interval = Duration::from_millis(self.config.ping_interval_ms);
        let timeout = Duration::from_millis(self.config.ping_timeout_ms);
        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
        loop {
            tokio::select! {
                _ = self.closed.cancelled() => break,
                _ = ticker.tick() => {}
            }
            match tokio::time::timeout(timeout, self.writer.ping()).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    warn!(endpoint = %self.endpoint, err = %e, "tunnel keepalive failed");
                    self.close().await;
                    break;
                }
                Err(_) => {
                    warn!(endpoint = %self.endpoint, "tunnel keepalive timed out");
                    self.close().await;
                    break;
                }
            }
        }
    }

    /// Closes the tunnel and every local connection. Only the first call
    /// does anything.
    pub async fn close(&self) {
        if self.closing.swap(true, Ordering::SeqCst) {
            return;
        }
        self.closed.cancel();
        let conns: Vec<_> = self
            .local_connections
            .write()
            .await
            .drain()
            .map(|(_, conn)| conn)
            .collect();
        for conn in conns {
            conn.close_read_channel();
        }
        let grace = Duration::from_millis(self.config.ping_timeout_ms.max(1));
        if tokio::time::timeout(grace, self.writer.close()).await.is_err() {
            debug!(endpoint = %self.endpoint, "websocket close did not finish in time");
        }
        info!(endpoint = %self.endpoint, "tunnel session closed");
    }

    async fn drain_tasks(&self) {
        let mut tasks = self.tasks.lock().await;
        let grace = Duration::from_millis(self.config.drain_timeout_ms);
        let drained = tokio::time::timeout(grace, async {
            while tasks.join_next().await.is_some() {}
        })
        .await;
        if drained.is_err() {
            warn!(endpoint = %self.endpoint, "connections did not stop in time, aborting");
            tasks.abort_all();
        }
    }
}
