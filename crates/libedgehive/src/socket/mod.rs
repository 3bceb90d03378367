//! Remote extension of the bus: modules on other processes or hosts are
//! reached over framed byte-stream connections. Peers swap their module
//! topology right after connecting.

mod connection;
mod store;
mod transport;

pub use connection::{Connection, RemoteBroker};
pub use store::PipeStore;
pub use transport::{BoxedReader, BoxedWriter, Listener, Transport, dial};

use dashmap::DashMap;
use edgehive_protocol::{Content, Message, ModuleExchange, operation, resource};
use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::codec::FramedRead;
use tokio_util::sync::CancellationToken;

use crate::channel::ChannelContext;
use crate::error::{BusError, Result};
use crate::tls::TlsSettings;
use connection::frame_codec;

/// Reply routes are pruned once the table grows past this size.
const REPLY_ROUTE_PRUNE_THRESHOLD: usize = 1024;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SocketConfig {
    /// Source name used for topology requests.
    pub node_name: String,
    pub max_frame_bytes: usize,
    pub reconnect_period_ms: u64,
    pub exchange_timeout_ms: u64,
    pub inbound_capacity: usize,
    pub tls: TlsSettings,
}

impl SocketConfig {
    pub fn reconnect_period(&self) -> Duration {
        Duration::from_millis(self.reconnect_period_ms)
    }

    pub fn exchange_timeout(&self) -> Duration {
        Duration::from_millis(self.exchange_timeout_ms)
    }
}

impl Default for SocketConfig {
    fn default() -> Self {
        Self {
            node_name: "edgehive".to_string(),
            max_frame_bytes: 16 * 1024 * 1024,
            reconnect_period_ms: 1000,
            exchange_timeout_ms: 5000,
            inbound_capacity: 1024,
            tls: TlsSettings::default(),
        }
    }
}

/// A remote bus to keep connected to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerConfig {
    pub name: String,
    pub transport: Transport,
}

/// Handle on a supervised peer connection.
pub struct PeerHandle {
    name: String,
    connected: watch::Receiver<bool>,
    task: JoinHandle<()>,
}

impl PeerHandle {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_connected(&self) -> bool {
        *self.connected.borrow()
    }

    /// Waits until the peer is connected and its topology registered.
    pub async fn wait_connected(&mut self, timeout: Duration) -> Result<()> {
        match tokio::time::timeout(timeout, self.connected.wait_for(|up| *up)).await {
            Ok(Ok(_)) => Ok(()),
            Ok(Err(_)) => Err(BusError::ConnectionClosed(self.name.clone())),
            Err(_) => Err(BusError::ConnectTimeout(self.name.clone())),
        }
    }

    pub async fn wait_disconnected(&mut self, timeout: Duration) -> Result<()> {
        match tokio::time::timeout(timeout, self.connected.wait_for(|up| !*up)).await {
            Ok(_) => Ok(()),
            Err(_) => Err(BusError::ConnectTimeout(self.name.clone())),
        }
    }

    pub fn abort(&self) {
        self.task.abort();
    }
}

struct ReplyRoute {
    conn: Arc<Connection>,
    created: Instant,
}

#[derive(Clone)]
pub struct SocketContext {
    inner: Arc<SocketInner>,
}

struct SocketInner {
    channels: Arc<ChannelContext>,
    broker: RemoteBroker,
    store: PipeStore,
    /// Sync requests delivered to local modules, by request id, so their
    /// replies can go back over the connection they came from.
    reply_routes: DashMap<String, ReplyRoute>,
    connections: DashMap<u64, Arc<Connection>>,
    config: SocketConfig,
    shutdown: CancellationToken,
}

impl SocketContext {
    pub fn new(channels: Arc<ChannelContext>, config: SocketConfig) -> Self {
        Self {
            inner: Arc::new(SocketInner {
                channels,
                broker: RemoteBroker::new(),
                store: PipeStore::new(),
                reply_routes: DashMap::new(),
                connections: DashMap::new(),
                config,
                shutdown: CancellationToken::new(),
            }),
        }
    }

    pub fn config(&self) -> &SocketConfig {
        &self.inner.config
    }

    pub fn store(&self) -> &PipeStore {
        &self.inner.store
    }

    /// Binds `transport` and serves peers until shutdown. Returns the bound
    /// address.
    pub async fn listen(&self, transport: &Transport) -> Result<String> {
        let listener = Listener::bind(transport, &self.inner.config.tls).await?;
        let addr = listener.local_addr();
        tracing::info!(transport = %transport, %addr, "listening for bus peers");
        tokio::spawn(self.inner.clone().accept_loop(listener));
        Ok(addr)
    }

    /// Keeps a connection to `peer` alive, redialing after every loss.
    pub fn connect(&self, peer: PeerConfig) -> PeerHandle {
        let (tx, rx) = watch::channel(false);
        let name = peer.name.clone();
        let task = tokio::spawn(self.inner.clone().supervise(peer, tx));
        PeerHandle {
            name,
            connected: rx,
            task,
        }
    }

    /// Dials once and swaps topology. The peer's modules are registered
    /// before this returns.
    pub async fn connect_once(&self, transport: &Transport) -> Result<Arc<Connection>> {
        self.inner.dial_and_exchange(transport).await
    }

    pub async fn has_module(&self, module: &str) -> bool {
        self.inner.store.contains(module).await
    }

    pub async fn send(&self, module: &str, msg: Message) -> Result<()> {
        let conn = self.connection_for(module).await?;
        let msg = msg.set_destination(module).set_type(conn.message_type());
        self.inner.broker.send(&conn, &msg).await
    }

    pub async fn send_sync(&self, module: &str, msg: Message, timeout: Duration) -> Result<Message> {
        let conn = self.connection_for(module).await?;
        let msg = msg.set_destination(module).set_type(conn.message_type());
        let timeout = self.inner.channels.config().timeout_or_default(timeout);
        self.inner.broker.send_sync(&conn, msg, timeout).await
    }

    /// Next message from the connection reaching `module` that no local
    /// module claimed.
    pub async fn receive(&self, module: &str) -> Result<Message> {
        let conn = self.connection_for(module).await?;
        self.inner.broker.receive(&conn).await
    }

    /// Sends a reply back to the peer whose sync request produced it. Gives
    /// the message back when no such request is known.
    pub async fn try_send_resp(&self, msg: Message) -> std::result::Result<(), Message> {
        self.inner.forward_reply(msg).await
    }

    /// Writes to each remote member from its own task, so a peer that
    /// stops reading cannot hold up the caller or the other members.
    pub async fn send_to_group(&self, group: &str, msg: Message) -> usize {
        let members = self.inner.store.group_members(group).await;
        for (module, conn) in &members {
            let msg = msg
                .clone()
                .set_destination(module.clone())
                .set_type(conn.message_type());
            let conn = conn.clone();
            let module = module.clone();
            let group = group.to_string();
            tokio::spawn(async move {
                if let Err(e) = conn.write_message(&msg).await {
                    tracing::warn!(module = %module, group = %group, err = %e, "failed to send group message to peer");
                }
            });
        }
        members.len()
    }

    pub async fn group_members(&self, group: &str) -> Vec<String> {
        self.inner
            .store
            .group_members(group)
            .await
            .into_iter()
            .map(|(name, _)| name)
            .collect()
    }

    /// Forgets a remote module. The connection stays up for the others.
    pub async fn cleanup(&self, module: &str) -> bool {
        self.inner.store.delete(module).await
    }

    pub fn reply_routes(&self) -> usize {
        self.inner.reply_routes.len()
    }

    pub fn connection_count(&self) -> usize {
        self.inner.connections.len()
    }

    pub async fn shutdown(&self) {
        self.inner.shutdown.cancel();
        let conns: Vec<_> = self
            .inner
            .connections
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        for conn in conns {
            conn.shutdown().await;
        }
    }

    async fn connection_for(&self, module: &str) -> Result<Arc<Connection>> {
        self.inner
            .store
            .get(module)
            .await
            .ok_or_else(|| BusError::UnknownModule(module.to_string()))
    }
}

impl SocketInner {
    async fn accept_loop(self: Arc<Self>, listener: Listener) {
        loop {
            let accepted = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                accepted = listener.accept() => accepted,
            };
            match accepted {
                Ok((reader, writer, peer)) => {
                    tracing::debug!(%peer, "bus peer connected");
                    let conn = self.register_connection(writer, peer, listener.message_type());
                    tokio::spawn(self.clone().read_loop(conn, reader));
                }
                Err(e) => tracing::warn!(err = %e, "failed to accept bus peer"),
            }
        }
    }

    async fn supervise(self: Arc<Self>, peer: PeerConfig, connected: watch::Sender<bool>) {
        let period = self.config.reconnect_period();
        loop {
            if self.shutdown.is_cancelled() {
                break;
            }
            match self.dial_and_exchange(&peer.transport).await {
                Ok(conn) => {
                    tracing::info!(peer = %peer.name, transport = %peer.transport, "connected to bus peer");
                    connected.send_replace(true);
                    tokio::select! {
                        _ = conn.closed() => {}
                        _ = self.shutdown.cancelled() => break,
                    }
                    connected.send_replace(false);
                    tracing::warn!(peer = %peer.name, "lost connection to bus peer");
                }
                Err(e) => tracing::debug!(peer = %peer.name, err = %e, "failed to reach bus peer"),
            }
            tokio::select! {
                _ = tokio::time::sleep(period) => {}
                _ = self.shutdown.cancelled() => break,
            }
        }
        connected.send_replace(false);
    }

    fn register_connection(&self, writer: BoxedWriter, peer: String, message_type: &'static str) -> Arc<Connection> {
        let conn = Connection::new(
            writer,
            peer,
            message_type,
            self.config.max_frame_bytes,
            self.config.inbound_capacity,
        );
        self.connections.insert(conn.id(), conn.clone());
        conn
    }

    async fn dial_and_exchange(self: &Arc<Self>, transport: &Transport) -> Result<Arc<Connection>> {
        let (reader, writer) = dial(transport, &self.config.tls).await?;
        let conn = self.register_connection(writer, transport.to_string(), transport.message_type());
        tokio::spawn(self.clone().read_loop(conn.clone(), reader));

        match self.exchange(&conn).await {
            Ok(()) => Ok(conn),
            Err(e) => {
                conn.shutdown().await;
                Err(e)
            }
        }
    }

    async fn exchange(&self, conn: &Arc<Connection>) -> Result<()> {
        let local = self.channels.local_exchange().await;
        let request = Message::new("")
            .build_router(
                self.config.node_name.clone(),
                "",
                resource::MODULE,
                operation::MODULE,
            )
            .set_type(conn.message_type())
            .fill_body(&local)?;
        let reply = self
            .broker
            .send_sync(conn, request, self.config.exchange_timeout())
            .await?;
        let remote: ModuleExchange = reply.decode_body()?;
        self.register_remote(&remote, conn).await;
        Ok(())
    }

    async fn register_remote(&self, exchange: &ModuleExchange, conn: &Arc<Connection>) {
        let mut registered = Vec::new();
        for module in &exchange.modules {
            if self.channels.has_module(module).await {
                tracing::debug!(module = %module, peer = conn.peer(), "local module shadows remote one");
                continue;
            }
            self.store.add(module, conn.clone()).await;
            registered.push(module.as_str());
        }
        for (group, members) in &exchange.groups {
            for module in members {
                if !self.channels.has_module(module).await {
                    self.store.add_group(module, group, conn.clone()).await;
                }
            }
        }
        tracing::info!(peer = conn.peer(), modules = ?registered, "registered remote modules");
    }

    async fn read_loop(self: Arc<Self>, conn: Arc<Connection>, reader: BoxedReader) {
        let mut frames = FramedRead::new(reader, frame_codec(self.config.max_frame_bytes));
        loop {
            let frame = tokio::select! {
                _ = conn.closed() => break,
                _ = self.shutdown.cancelled() => break,
                frame = frames.next() => frame,
            };
            match frame {
                Some(Ok(bytes)) => match serde_json::from_slice::<Message>(&bytes) {
                    Ok(msg) => self.dispatch(&conn, msg).await,
                    Err(e) => tracing::warn!(peer = conn.peer(), err = %e, "dropping undecodable message"),
                },
                Some(Err(e)) => {
                    tracing::warn!(peer = conn.peer(), err = %e, "read from bus peer failed");
                    break;
                }
                None => break,
            }
        }
        self.drop_connection(&conn).await;
    }

    /// Offers a message with a parent id to the local sync waiters and the
    /// reply routes. Gives it back when none of them claims it.
    async fn claim_reply(&self, msg: Message) -> std::result::Result<(), Message> {
        let Err(msg) = self.broker.complete(msg) else {
            return Ok(());
        };
        let Err(msg) = self.channels.try_send_resp(msg) else {
            return Ok(());
        };
        self.forward_reply(msg).await
    }

    async fn dispatch(&self, conn: &Arc<Connection>, msg: Message) {
        let msg = if msg.is_response() {
            match self.claim_reply(msg).await {
                Ok(()) => return,
                Err(msg) => msg,
            }
        } else {
            msg
        };
        if msg.is_response() && !self.channels.has_module(msg.destination()).await {
            self.channels.record_uninvited(&msg);
            return;
        }

        if msg.operation() == operation::MODULE && msg.resource() == resource::MODULE {
            self.answer_exchange(conn, msg).await;
            return;
        }

        let destination = msg.destination().to_string();
        match self.channels.mailbox(&destination).await {
            Some(mailbox) => {
                if msg.is_sync() {
                    self.record_reply_route(msg.id(), conn.clone());
                }
                match mailbox.try_send(msg) {
                    Ok(()) => {}
                    Err(TrySendError::Full(msg)) => {
                        tokio::spawn(async move {
                            if let Err(e) = mailbox.send(msg).await {
                                tracing::warn!(module = mailbox.module(), err = %e, "failed to deliver remote message");
                            }
                        });
                    }
                    Err(TrySendError::Closed(_)) => {
                        tracing::warn!(module = %destination, "mailbox closed, remote message dropped");
                    }
                }
            }
            None => conn.push_inbound(msg),
        }
    }

    async fn answer_exchange(&self, conn: &Arc<Connection>, request: Message) {
        match request.decode_body::<Option<ModuleExchange>>() {
            Ok(Some(remote)) => self.register_remote(&remote, conn).await,
            Ok(None) => {}
            Err(e) => tracing::warn!(peer = conn.peer(), err = %e, "bad topology in module request"),
        }
        let local = self.channels.local_exchange().await;
        let reply = match request
            .new_response(Content::Empty)
            .set_destination(request.source())
            .fill_body(&local)
        {
            Ok(reply) => reply,
            Err(e) => {
                tracing::warn!(err = %e, "failed to encode topology reply");
                return;
            }
        };
        if let Err(e) = self.broker.send(conn, &reply).await {
            tracing::warn!(peer = conn.peer(), err = %e, "failed to answer module request");
        }
    }

    fn record_reply_route(&self, id: &str, conn: Arc<Connection>) {
        if self.reply_routes.len() >= REPLY_ROUTE_PRUNE_THRESHOLD {
            let max_age = self.channels.config().default_timeout() * 2;
            self.reply_routes
                .retain(|_, route| route.created.elapsed() < max_age);
        }
        self.reply_routes.insert(
            id.to_string(),
            ReplyRoute {
                conn,
                created: Instant::now(),
            },
        );
    }

    /// Group requests fan out under one id, so a route serves every reply
    /// until it ages out or its connection drops.
    async fn forward_reply(&self, msg: Message) -> std::result::Result<(), Message> {
        let conn = self
            .reply_routes
            .get(msg.parent_id())
            .map(|route| route.conn.clone());
        let Some(conn) = conn else {
            return Err(msg);
        };
        let msg = msg.set_type(conn.message_type());
        if let Err(e) = self.broker.send(&conn, &msg).await {
            tracing::warn!(peer = conn.peer(), err = %e, "failed to send reply to peer");
        }
        Ok(())
    }

    async fn drop_connection(&self, conn: &Arc<Connection>) {
        self.connections.remove(&conn.id());
        self.reply_routes
            .retain(|_, route| route.conn.id() != conn.id());
        let removed = self.store.remove_connection(conn.id()).await;
        conn.shutdown().await;
        if !removed.is_empty() {
            tracing::info!(peer = conn.peer(), modules = ?removed, "removed modules of closed connection");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BusConfig;
    use bytes::Bytes;
    use futures_util::SinkExt;
    use tokio_util::codec::FramedWrite;

    async fn node(name: &str, modules: &[(&str, &str)]) -> (Arc<ChannelContext>, SocketContext) {
        let channels = Arc::new(ChannelContext::new(BusConfig::default()));
        for (module, group) in modules {
            channels.add_module(module).await;
            channels
                .add_module_group(module, group)
                .await
                .expect("group");
        }
        let sockets = SocketContext::new(
            channels.clone(),
            SocketConfig {
                node_name: name.to_string(),
                reconnect_period_ms: 50,
                ..Default::default()
            },
        );
        (channels, sockets)
    }

    fn tcp(address: String) -> Transport {
        Transport::Tcp { address }
    }

    #[tokio::test]
    async fn exchange_registers_both_sides() {
        let (_, server) = node("server", &[("twin", "bus")]).await;
        let (_, client) = node("client", &[("edged", "bus")]).await;
        let addr = server
            .listen(&tcp("127.0.0.1:0".into()))
            .await
            .expect("listen");
        client.connect_once(&tcp(addr)).await.expect("connect");

        assert!(client.has_module("twin").await);
        assert_eq!(client.group_members("bus").await, vec!["twin"]);
        assert!(server.has_module("edged").await);
    }

    #[tokio::test]
    async fn sync_request_reaches_remote_module_and_reply_returns() {
        let (server_channels, server) = node("server", &[("twin", "bus")]).await;
        let (_, client) = node("client", &[]).await;
        let addr = server
            .listen(&tcp("127.0.0.1:0".into()))
            .await
            .expect("listen");
        client.connect_once(&tcp(addr)).await.expect("connect");

        let responder_channels = server_channels.clone();
        let responder = server.clone();
        tokio::spawn(async move {
            let req = responder_channels.receive("twin").await.expect("request");
            let reply = req.new_response(Content::Json(serde_json::json!("done")));
            if let Err(reply) = responder_channels.try_send_resp(reply) {
                assert!(responder.try_send_resp(reply).await.is_ok());
            }
        });

        let req = Message::new("").build_router("client", "", "r", operation::QUERY);
        let reply = client
            .send_sync("twin", req.clone(), Duration::from_secs(2))
            .await
            .expect("reply");
        assert_eq!(reply.parent_id(), req.id());
        assert_eq!(reply.decode_body::<String>().expect("body"), "done");
    }

    #[tokio::test]
    async fn closing_connection_removes_remote_modules() {
        let (_, server) = node("server", &[("twin", "bus")]).await;
        let (_, client) = node("client", &[]).await;
        let addr = server
            .listen(&tcp("127.0.0.1:0".into()))
            .await
            .expect("listen");
        let conn = client.connect_once(&tcp(addr)).await.expect("connect");
        assert!(client.has_module("twin").await);

        server.shutdown().await;
        conn.closed().await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!client.has_module("twin").await);
        assert!(client.group_members("bus").await.is_empty());
    }

    #[tokio::test]
    async fn supervisor_redials_after_loss() {
        let (_, client) = node("client", &[]).await;
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("reserve port");
        let addr = listener.local_addr().expect("addr").to_string();
        drop(listener);

        let mut peer = client.connect(PeerConfig {
            name: "cloud".into(),
            transport: tcp(addr.clone()),
        });
        tokio::time::sleep(Duration::from_millis(120)).await;
        assert!(!peer.is_connected());

        let (_, server) = node("server", &[("twin", "bus")]).await;
        server.listen(&tcp(addr)).await.expect("listen");
        peer.wait_connected(Duration::from_secs(2))
            .await
            .expect("connected once the peer is up");
        assert!(client.has_module("twin").await);
        peer.abort();
    }

    #[tokio::test]
    async fn stalled_peer_does_not_hold_up_group_broadcast() {
        let (_, server) = node("server", &[]).await;
        let addr = server
            .listen(&tcp("127.0.0.1:0".into()))
            .await
            .expect("listen");

        // A raw peer that announces one group member and then never reads.
        let stream = tokio::net::TcpStream::connect(&addr).await.expect("connect");
        let (_unread, write_half) = stream.into_split();
        let mut frames = FramedWrite::new(write_half, frame_codec(1 << 20));
        let mut topology = ModuleExchange::default();
        topology.modules.push("sleepy".into());
        topology.groups.insert("g".into(), vec!["sleepy".into()]);
        let request = Message::new("")
            .build_router("stalled", "", resource::MODULE, operation::MODULE)
            .fill_body(&topology)
            .expect("body");
        frames
            .send(Bytes::from(serde_json::to_vec(&request).expect("json")))
            .await
            .expect("announce");

        let deadline = Instant::now() + Duration::from_secs(2);
        while server.group_members("g").await.is_empty() {
            assert!(Instant::now() < deadline, "topology never registered");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        // Far more than the socket buffers hold.
        let payload = vec![0u8; 1 << 20];
        for _ in 0..32 {
            let msg = Message::new("").fill_bytes(payload.clone());
            let addressed = tokio::time::timeout(Duration::from_secs(1), server.send_to_group("g", msg))
                .await
                .expect("broadcast returned while the peer is stalled");
            assert_eq!(addressed, 1);
        }
    }
}
