use edgehive_protocol::{Message, ModuleExchange};
use futures_util::future::BoxFuture;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};
use tracing::warn;

use crate::channel::{ChannelContext, Mailbox, ensure_id};
use crate::config::BusConfig;
use crate::error::{BusError, Result};
use crate::socket::{PeerConfig, PeerHandle, SocketConfig, SocketContext, Transport};

/// Module bus. Every operation goes to the local channel context when the
/// module has a mailbox here, otherwise to the peer connection that
/// announced it.
#[derive(Clone)]
pub struct Bus {
    inner: Arc<BusInner>,
}

struct BusInner {
    channels: Arc<ChannelContext>,
    sockets: SocketContext,
    done: CancellationToken,
}

impl Bus {
    pub fn new(config: BusConfig, socket: SocketConfig) -> Self {
        let channels = Arc::new(ChannelContext::new(config));
        let sockets = SocketContext::new(channels.clone(), socket);
        Self {
            inner: Arc::new(BusInner {
                channels,
                sockets,
                done: CancellationToken::new(),
            }),
        }
    }

    /// A bus with default settings and no peers.
    pub fn local() -> Self {
        Self::new(BusConfig::default(), SocketConfig::default())
    }

    pub fn channels(&self) -> &Arc<ChannelContext> {
        &self.inner.channels
    }

    pub fn sockets(&self) -> &SocketContext {
        &self.inner.sockets
    }

    /// Resolves once the bus is shutting down.
    pub fn done(&self) -> WaitForCancellationFuture<'_> {
        self.inner.done.cancelled()
    }

    pub fn done_token(&self) -> CancellationToken {
        self.inner.done.clone()
    }

    pub fn is_done(&self) -> bool {
        self.inner.done.is_cancelled()
    }

    /// Signals shutdown and closes every peer connection.
    pub async fn shutdown(&self) {
        self.inner.done.cancel();
        self.inner.sockets.shutdown().await;
    }

    pub async fn listen(&self, transport: &Transport) -> Result<String> {
        self.inner.sockets.listen(transport).await
    }

    pub fn connect_peer(&self, peer: PeerConfig) -> PeerHandle {
        self.inner.sockets.connect(peer)
    }

    pub async fn add_module(&self, name: &str) -> Arc<Mailbox> {
        self.inner.channels.add_module(name).await
    }

    pub async fn add_module_group(&self, name: &str, group: &str) -> Result<()> {
        self.inner.channels.add_module_group(name, group).await
    }

    pub async fn cleanup(&self, name: &str) {
        if !self.inner.channels.cleanup(name).await {
            self.inner.sockets.cleanup(name).await;
        }
    }

    pub async fn has_module(&self, name: &str) -> bool {
        self.inner.channels.has_module(name).await || self.inner.sockets.has_module(name).await
    }

    /// True when `name` is reached through a peer connection.
    pub async fn is_remote(&self, name: &str) -> bool {
        !self.inner.channels.has_module(name).await && self.inner.sockets.has_module(name).await
    }

    /// Local and remote members of `group`.
    pub async fn group_members(&self, group: &str) -> Vec<String> {
        let mut members = self.inner.channels.group_members(group).await;
        members.extend(self.inner.sockets.group_members(group).await);
        members.sort();
        members.dedup();
        members
    }

    pub async fn local_modules_exchange(&self) -> ModuleExchange {
        self.inner.channels.local_exchange().await
    }

    pub fn pending_anonymous(&self) -> usize {
        self.inner.channels.pending_anonymous()
    }

    pub fn uninvited_replies(&self) -> u64 {
        self.inner.channels.uninvited_replies()
    }

    /// Fire-and-forget. Failures are logged.
    pub async fn send(&self, name: &str, msg: Message) {
        if let Some(mailbox) = self.inner.channels.mailbox(name).await {
            if let Err(e) = mailbox.send(msg).await {
                warn!(module = name, error = %e, "failed to send message");
            }
        } else if self.inner.sockets.has_module(name).await {
            if let Err(e) = self.inner.sockets.send(name, msg).await {
                warn!(module = name, error = %e, "failed to send message to peer");
            }
        } else {
            warn!(module = name, "send to unknown module");
        }
    }

    pub async fn receive(&self, name: &str) -> Result<Message> {
        if let Some(mailbox) = self.inner.channels.mailbox(name).await {
            return mailbox.recv().await;
        }
        self.inner.sockets.receive(name).await
    }

    pub async fn send_sync(&self, name: &str, msg: Message, timeout: Duration) -> Result<Message> {
        if self.inner.channels.has_module(name).await {
            return self.inner.channels.send_sync(name, msg, timeout).await;
        }
        self.inner.sockets.send_sync(name, msg, timeout).await
    }

    /// Routes a reply to the local caller waiting on its parent id, or back
    /// to the peer that sent the request. Replies nobody waits for are
    /// counted and dropped.
    pub async fn send_resp(&self, msg: Message) {
        let Err(msg) = self.inner.channels.try_send_resp(msg) else {
            return;
        };
        if let Err(msg) = self.inner.sockets.try_send_resp(msg).await {
            self.inner.channels.record_uninvited(&msg);
        }
    }

    pub async fn send_to_group(&self, group: &str, msg: Message) {
        let local = self.inner.channels.send_to_group(group, msg.clone()).await;
        let remote = self.inner.sockets.send_to_group(group, msg).await;
        if local + remote == 0 {
            warn!(group, "send to group with no members");
        }
    }

    /// Sends to every local and remote member and waits until all of them
    /// replied or the timeout passes.
    pub async fn send_to_group_sync(&self, group: &str, mut msg: Message, timeout: Duration) -> Result<()> {
        let channels = &self.inner.channels;
        let deadline = Instant::now() + channels.config().timeout_or_default(timeout);
        ensure_id(&mut msg);
        msg.header.sync = true;

        let mut deliveries: Vec<BoxFuture<'static, Result<()>>> = Vec::new();
        for mailbox in channels.group_mailboxes(group).await {
            let msg = msg.clone();
            deliveries.push(Box::pin(async move { mailbox.send_until(msg, deadline).await }));
        }
        for module in self.inner.sockets.group_members(group).await {
            if channels.has_module(&module).await {
                continue;
            }
            let sockets = self.inner.sockets.clone();
            let msg = msg.clone();
            deliveries.push(Box::pin(async move {
                tokio::time::timeout_at(deadline, sockets.send(&module, msg))
                    .await
                    .map_err(|_| BusError::SendTimeout(module.clone()))?
            }));
        }
        channels
            .collect_group_replies(group, msg.id(), deliveries, deadline)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use edgehive_protocol::Content;

    #[tokio::test]
    async fn routes_to_local_mailbox() {
        let bus = Bus::local();
        bus.add_module("a").await;
        bus.send("a", Message::new("")).await;
        assert!(bus.receive("a").await.is_ok());
        assert!(!bus.is_remote("a").await);
    }

    #[tokio::test]
    async fn unknown_module_is_reported() {
        let bus = Bus::local();
        bus.send("ghost", Message::new("")).await;
        assert!(matches!(
            bus.receive("ghost").await,
            Err(BusError::UnknownModule(_))
        ));
        assert!(matches!(
            bus.send_sync("ghost", Message::new(""), Duration::from_millis(10))
                .await,
            Err(BusError::UnknownModule(_))
        ));
    }

    #[tokio::test]
    async fn uninvited_reply_is_counted_once() {
        let bus = Bus::local();
        bus.send_resp(Message::new("nobody-asked")).await;
        assert_eq!(bus.uninvited_replies(), 1);
    }

    #[tokio::test]
    async fn send_resp_completes_local_send_sync() {
        let bus = Bus::local();
        bus.add_module("echo").await;
        let responder = bus.clone();
        tokio::spawn(async move {
            while let Ok(req) = responder.receive("echo").await {
                responder
                    .send_resp(req.new_response(Content::Json(serde_json::json!(1))))
                    .await;
            }
        });
        let reply = bus
            .send_sync("echo", Message::new(""), Duration::from_secs(1))
            .await
            .expect("reply");
        assert!(reply.is_response());
        assert_eq!(bus.pending_anonymous(), 0);
    }

    #[tokio::test]
    async fn shutdown_fires_done() {
        let bus = Bus::local();
        assert!(!bus.is_done());
        bus.shutdown().await;
        bus.done().await;
        assert!(bus.is_done());
    }
}
