use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use edgehive_protocol::{Message, ModuleExchange};
use futures_util::future::BoxFuture;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{Mutex, RwLock, mpsc};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::BusConfig;
use crate::error::{BusError, Result};

/// Bounded per-module queue. Closing it wakes every blocked sender and
/// receiver; nothing is accepted afterwards.
pub struct Mailbox {
    module: String,
    tx: mpsc::Sender<Message>,
    rx: Mutex<mpsc::Receiver<Message>>,
    closed: CancellationToken,
}

impl Mailbox {
    fn new(module: &str, capacity: usize) -> Self {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        Self {
            module: module.to_string(),
            tx,
            rx: Mutex::new(rx),
            closed: CancellationToken::new(),
        }
    }

    pub fn module(&self) -> &str {
        &self.module
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    /// Messages currently queued.
    pub fn len(&self) -> usize {
        self.tx.max_capacity() - self.tx.capacity()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn closed_error(&self) -> BusError {
        BusError::MailboxClosed(self.module.clone())
    }

    /// Blocks while the mailbox is full.
    pub async fn send(&self, msg: Message) -> Result<()> {
        tokio::select! {
            biased;
            _ = self.closed.cancelled() => Err(self.closed_error()),
            res = self.tx.send(msg) => res.map_err(|_| self.closed_error()),
        }
    }

    pub async fn send_until(&self, msg: Message, deadline: Instant) -> Result<()> {
        tokio::select! {
            biased;
            _ = self.closed.cancelled() => Err(self.closed_error()),
            res = self.tx.send(msg) => res.map_err(|_| self.closed_error()),
            _ = tokio::time::sleep_until(deadline) => Err(BusError::SendTimeout(self.module.clone())),
        }
    }

    pub fn try_send(&self, msg: Message) -> std::result::Result<(), TrySendError<Message>> {
        if self.is_closed() {
            return Err(TrySendError::Closed(msg));
        }
        self.tx.try_send(msg)
    }

    pub async fn recv(&self) -> Result<Message> {
        let mut rx = tokio::select! {
            biased;
            _ = self.closed.cancelled() => return Err(self.closed_error()),
            guard = self.rx.lock() => guard,
        };
        tokio::select! {
            biased;
            msg = rx.recv() => msg.ok_or_else(|| self.closed_error()),
            _ = self.closed.cancelled() => Err(self.closed_error()),
        }
    }

    async fn close(&self) {
        self.closed.cancel();
        self.rx.lock().await.close();
    }
}

/// Registration for replies to one synchronous send, keyed by the request id.
/// Dropping it unregisters the id.
pub(crate) struct ReplyWaiter<'a> {
    waiters: &'a DashMap<String, mpsc::Sender<Message>>,
    id: String,
    tx: mpsc::Sender<Message>,
    rx: mpsc::Receiver<Message>,
}

impl ReplyWaiter<'_> {
    pub(crate) async fn recv_until(&mut self, deadline: Instant) -> Option<Message> {
        tokio::select! {
            msg = self.rx.recv() => msg,
            _ = tokio::time::sleep_until(deadline) => None,
        }
    }

    /// Unregister and return replies that were queued but not yet read.
    fn finish(mut self) -> Vec<Message> {
        self.unregister();
        self.rx.close();
        let mut rest = Vec::new();
        while let Ok(msg) = self.rx.try_recv() {
            rest.push(msg);
        }
        rest
    }

    fn unregister(&self) {
        self.waiters
            .remove_if(&self.id, |_, tx| tx.same_channel(&self.tx));
    }
}

impl Drop for ReplyWaiter<'_> {
    fn drop(&mut self) {
        self.unregister();
    }
}

/// In-process module bus: one mailbox per module, group membership and the
/// table of callers waiting on synchronous replies.
pub struct ChannelContext {
    config: BusConfig,
    channels: RwLock<HashMap<String, Arc<Mailbox>>>,
    groups: RwLock<HashMap<String, BTreeSet<String>>>,
    anonymous: DashMap<String, mpsc::Sender<Message>>,
    uninvited: AtomicU64,
}

impl ChannelContext {
    pub fn new(config: BusConfig) -> Self {
        Self {
            config,
            channels: RwLock::new(HashMap::new()),
            groups: RwLock::new(HashMap::new()),
            anonymous: DashMap::new(),
            uninvited: AtomicU64::new(0),
        }
    }

    pub fn config(&self) -> &BusConfig {
        &self.config
    }

    /// Registers `name`; registering an existing module returns its mailbox.
    pub async fn add_module(&self, name: &str) -> Arc<Mailbox> {
        let mut channels = self.channels.write().await;
        channels
            .entry(name.to_string())
            .or_insert_with(|| {
                debug!(module = name, "module added");
                Arc::new(Mailbox::new(name, self.config.mailbox_capacity))
            })
            .clone()
    }

    pub async fn add_module_group(&self, name: &str, group: &str) -> Result<()> {
        let channels = self.channels.read().await;
        if !channels.contains_key(name) {
            warn!(module = name, group, "cannot add unknown module to group");
            return Err(BusError::UnknownModule(name.to_string()));
        }
        self.groups
            .write()
            .await
            .entry(group.to_string())
            .or_default()
            .insert(name.to_string());
        Ok(())
    }

    /// Removes the module from the bus and every group, then closes its
    /// mailbox. Returns false if the module was not registered.
    pub async fn cleanup(&self, name: &str) -> bool {
        let mailbox = {
            let mut channels = self.channels.write().await;
            let mailbox = channels.remove(name);
            let mut groups = self.groups.write().await;
            for members in groups.values_mut() {
                members.remove(name);
            }
            groups.retain(|_, members| !members.is_empty());
            mailbox
        };
        match mailbox {
            Some(mailbox) => {
                mailbox.close().await;
                debug!(module = name, "module cleaned up");
                true
            }
            None => false,
        }
    }

    pub async fn mailbox(&self, name: &str) -> Option<Arc<Mailbox>> {
        self.channels.read().await.get(name).cloned()
    }

    pub async fn has_module(&self, name: &str) -> bool {
        self.channels.read().await.contains_key(name)
    }

    pub async fn modules(&self) -> Vec<String> {
        let mut names: Vec<_> = self.channels.read().await.keys().cloned().collect();
        names.sort();
        names
    }

    pub async fn group_members(&self, group: &str) -> Vec<String> {
        self.groups
            .read()
            .await
            .get(group)
            .map(|members| members.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub(crate) async fn group_mailboxes(&self, group: &str) -> Vec<Arc<Mailbox>> {
        let names = self.group_members(group).await;
        let channels = self.channels.read().await;
        names
            .iter()
            .filter_map(|name| channels.get(name).cloned())
            .collect()
    }

    /// Modules and groups of this bus, as announced to peers.
    pub async fn local_exchange(&self) -> ModuleExchange {
        let modules = self.modules().await;
        let groups = self
            .groups
            .read()
            .await
            .iter()
            .map(|(group, members)| (group.clone(), members.iter().cloned().collect()))
            .collect();
        ModuleExchange { modules, groups }
    }

    /// Delivers to `name`, blocking while its mailbox is full.
    pub async fn deliver(&self, name: &str, msg: Message) -> Result<()> {
        let mailbox = self
            .mailbox(name)
            .await
            .ok_or_else(|| BusError::UnknownModule(name.to_string()))?;
        mailbox.send(msg).await
    }

    /// Fire-and-forget send. Failures are logged.
    pub async fn send(&self, name: &str, msg: Message) {
        if let Err(e) = self.deliver(name, msg).await {
            warn!(module = name, error = %e, "failed to send message");
        }
    }

    pub async fn receive(&self, name: &str) -> Result<Message> {
        let mailbox = self
            .mailbox(name)
            .await
            .ok_or_else(|| BusError::UnknownModule(name.to_string()))?;
        mailbox.recv().await
    }

    pub async fn send_sync(&self, name: &str, mut msg: Message, timeout: Duration) -> Result<Message> {
        let deadline = Instant::now() + self.config.timeout_or_default(timeout);
        ensure_id(&mut msg);
        msg.header.sync = true;

        let mailbox = self
            .mailbox(name)
            .await
            .ok_or_else(|| BusError::UnknownModule(name.to_string()))?;
        let id = msg.header.id.clone();
        let mut waiter = self.register_waiter(&id, 1)?;
        mailbox.send_until(msg, deadline).await?;
        waiter
            .recv_until(deadline)
            .await
            .ok_or(BusError::RecvTimeout(id))
    }

    /// Hands a response to the caller waiting on its parent id. Gives the
    /// message back when nobody here is waiting for it.
    pub fn try_send_resp(&self, msg: Message) -> std::result::Result<(), Message> {
        let Some(tx) = self
            .anonymous
            .get(msg.parent_id())
            .map(|entry| entry.value().clone())
        else {
            return Err(msg);
        };
        match tx.try_send(msg) {
            Ok(()) => {}
            Err(TrySendError::Full(msg)) => {
                warn!(parent_id = msg.parent_id(), "waiter already has its reply, dropping response");
            }
            Err(TrySendError::Closed(msg)) => {
                self.record_uninvited(&msg);
            }
        }
        Ok(())
    }

    pub fn send_resp(&self, msg: Message) {
        if let Err(msg) = self.try_send_resp(msg) {
            self.record_uninvited(&msg);
        }
    }

    pub(crate) fn record_uninvited(&self, msg: &Message) {
        self.uninvited.fetch_add(1, Ordering::Relaxed);
        warn!(
            parent_id = msg.parent_id(),
            source = msg.source(),
            "no caller waiting for response, dropping"
        );
    }

    pub fn uninvited_replies(&self) -> u64 {
        self.uninvited.load(Ordering::Relaxed)
    }

    /// Number of synchronous calls currently waiting on a reply.
    pub fn pending_anonymous(&self) -> usize {
        self.anonymous.len()
    }

    /// Delivers a copy to every member without blocking the caller; members
    /// with a full mailbox are served from a background task. Returns the
    /// number of members addressed.
    pub async fn send_to_group(&self, group: &str, msg: Message) -> usize {
        let members = self.group_mailboxes(group).await;
        for mailbox in &members {
            match mailbox.try_send(msg.clone()) {
                Ok(()) => {}
                Err(TrySendError::Full(msg)) => {
                    let mailbox = mailbox.clone();
                    tokio::spawn(async move {
                        if let Err(e) = mailbox.send(msg).await {
                            warn!(module = mailbox.module(), error = %e, "failed to send group message");
                        }
                    });
                }
                Err(TrySendError::Closed(_)) => {
                    warn!(module = mailbox.module(), group, "mailbox closed, group message dropped");
                }
            }
        }
        members.len()
    }

    pub async fn send_to_group_sync(&self, group: &str, mut msg: Message, timeout: Duration) -> Result<()> {
        let deadline = Instant::now() + self.config.timeout_or_default(timeout);
        ensure_id(&mut msg);
        msg.header.sync = true;

        let deliveries = self
            .group_mailboxes(group)
            .await
            .into_iter()
            .map(|mailbox| {
                let msg = msg.clone();
                Box::pin(async move { mailbox.send_until(msg, deadline).await })
                    as BoxFuture<'static, Result<()>>
            })
            .collect();
        self.collect_group_replies(group, msg.id(), deliveries, deadline)
            .await
    }

    /// Runs every delivery concurrently and waits until each member has
    /// replied to `id` or the deadline passes.
    pub(crate) async fn collect_group_replies(
        &self,
        group: &str,
        id: &str,
        deliveries: Vec<BoxFuture<'static, Result<()>>>,
        deadline: Instant,
    ) -> Result<()> {
        let total = deliveries.len();
        if total == 0 {
            warn!(group, "no members in group");
            return Err(BusError::UnknownGroup(group.to_string()));
        }

        let mut waiter = self.register_waiter(id, total)?;
        let send_failures = Arc::new(AtomicUsize::new(0));
        for delivery in deliveries {
            let failures = send_failures.clone();
            tokio::spawn(async move {
                if let Err(e) = delivery.await {
                    debug!(error = %e, "group delivery failed");
                    failures.fetch_add(1, Ordering::Relaxed);
                }
            });
        }

        let mut received = 0;
        while received < total {
            match waiter.recv_until(deadline).await {
                Some(_) => received += 1,
                None => break,
            }
        }
        received += waiter.finish().len();

        if received < total {
            return Err(BusError::GroupTimeout {
                group: group.to_string(),
                missing: total - received,
                total,
                send_failures: send_failures.load(Ordering::Relaxed),
            });
        }
        Ok(())
    }

    pub(crate) fn register_waiter(&self, id: &str, capacity: usize) -> Result<ReplyWaiter<'_>> {
        match self.anonymous.entry(id.to_string()) {
            Entry::Occupied(_) => Err(BusError::DuplicateMessageId(id.to_string())),
            Entry::Vacant(slot) => {
                let (tx, rx) = mpsc::channel(capacity.max(1));
                slot.insert(tx.clone());
                Ok(ReplyWaiter {
                    waiters: &self.anonymous,
                    id: id.to_string(),
                    tx,
                    rx,
                })
            }
        }
    }
}

impl Default for ChannelContext {
    fn default() -> Self {
        Self::new(BusConfig::default())
    }
}

pub(crate) fn ensure_id(msg: &mut Message) {
    if msg.header.id.is_empty() {
        msg.header.id = uuid::Uuid::new_v4().to_string();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use edgehive_protocol::Content;

    fn ctx_with_capacity(capacity: usize) -> ChannelContext {
        ChannelContext::new(BusConfig {
            mailbox_capacity: capacity,
            ..Default::default()
        })
    }

    /// Replies to every request received on `name` until its mailbox closes.
    fn spawn_echo(ctx: Arc<ChannelContext>, name: &'static str) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            while let Ok(msg) = ctx.receive(name).await {
                ctx.send_resp(msg.new_response(Content::Json(serde_json::json!(name))));
            }
        })
    }

    #[tokio::test]
    async fn send_then_receive() {
        let ctx = ChannelContext::default();
        ctx.add_module("a").await;
        let msg = Message::new("").build_router("x", "", "r", "update");
        ctx.send("a", msg.clone()).await;
        let got = ctx.receive("a").await.expect("receive");
        assert_eq!(got.id(), msg.id());
    }

    #[tokio::test]
    async fn add_module_twice_keeps_mailbox() {
        let ctx = ChannelContext::default();
        let first = ctx.add_module("a").await;
        let second = ctx.add_module("a").await;
        assert!(Arc::ptr_eq(&first, &second));
    }

    #[tokio::test]
    async fn group_requires_known_module() {
        let ctx = ChannelContext::default();
        assert!(matches!(
            ctx.add_module_group("ghost", "g").await,
            Err(BusError::UnknownModule(_))
        ));
        ctx.add_module("a").await;
        ctx.add_module_group("a", "g").await.expect("add group");
        assert_eq!(ctx.group_members("g").await, vec!["a"]);
    }

    #[tokio::test]
    async fn send_sync_gets_reply_and_unregisters() {
        let ctx = Arc::new(ChannelContext::default());
        ctx.add_module("echo").await;
        let echo = spawn_echo(ctx.clone(), "echo");

        let req = Message::new("").build_router("caller", "", "r", "query");
        let resp = ctx
            .send_sync("echo", req.clone(), Duration::from_secs(1))
            .await
            .expect("reply");
        assert_eq!(resp.parent_id(), req.id());
        assert_eq!(ctx.pending_anonymous(), 0);

        ctx.cleanup("echo").await;
        echo.await.expect("echo task");
    }

    #[tokio::test]
    async fn send_sync_times_out_without_leaking() {
        let ctx = ChannelContext::default();
        ctx.add_module("silent").await;
        let err = ctx
            .send_sync("silent", Message::new(""), Duration::from_millis(50))
            .await
            .expect_err("must time out");
        assert!(matches!(err, BusError::RecvTimeout(_)));
        assert_eq!(ctx.pending_anonymous(), 0);
    }

    #[tokio::test]
    async fn send_sync_unknown_module() {
        let ctx = ChannelContext::default();
        let err = ctx
            .send_sync("nobody", Message::new(""), Duration::from_millis(50))
            .await
            .expect_err("unknown");
        assert!(matches!(err, BusError::UnknownModule(_)));
    }

    #[tokio::test]
    async fn duplicate_waiter_id_is_rejected() {
        let ctx = ChannelContext::default();
        let _first = ctx.register_waiter("m1", 1).expect("first");
        assert!(matches!(
            ctx.register_waiter("m1", 1),
            Err(BusError::DuplicateMessageId(_))
        ));
    }

    #[tokio::test]
    async fn response_without_waiter_is_counted() {
        let ctx = ChannelContext::default();
        let orphan = Message::new("no-such-request");
        ctx.send_resp(orphan);
        assert_eq!(ctx.uninvited_replies(), 1);
    }

    #[tokio::test]
    async fn second_reply_to_same_request_is_dropped() {
        let ctx = ChannelContext::default();
        let mut waiter = ctx.register_waiter("m1", 1).expect("waiter");
        assert!(ctx.try_send_resp(Message::new("m1")).is_ok());
        assert!(ctx.try_send_resp(Message::new("m1")).is_ok());
        let deadline = Instant::now() + Duration::from_millis(20);
        assert!(waiter.recv_until(deadline).await.is_some());
        assert!(waiter.recv_until(deadline).await.is_none());
    }

    #[tokio::test]
    async fn group_sync_reports_missing_member() {
        let ctx = Arc::new(ChannelContext::default());
        for name in ["a", "b", "c"] {
            ctx.add_module(name).await;
            ctx.add_module_group(name, "g").await.expect("group");
        }
        spawn_echo(ctx.clone(), "a");
        spawn_echo(ctx.clone(), "b");

        let err = ctx
            .send_to_group_sync("g", Message::new(""), Duration::from_millis(100))
            .await
            .expect_err("c never replies");
        match err {
            BusError::GroupTimeout { missing, total, .. } => {
                assert_eq!(missing, 1);
                assert_eq!(total, 3);
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(ctx.pending_anonymous(), 0);
    }

    #[tokio::test]
    async fn group_sync_succeeds_when_all_reply() {
        let ctx = Arc::new(ChannelContext::default());
        for name in ["a", "b"] {
            ctx.add_module(name).await;
            ctx.add_module_group(name, "g").await.expect("group");
        }
        spawn_echo(ctx.clone(), "a");
        spawn_echo(ctx.clone(), "b");
        ctx.send_to_group_sync("g", Message::new(""), Duration::from_secs(1))
            .await
            .expect("all members reply");
    }

    #[tokio::test]
    async fn group_sync_on_unknown_group() {
        let ctx = ChannelContext::default();
        assert!(matches!(
            ctx.send_to_group_sync("nope", Message::new(""), Duration::from_millis(10))
                .await,
            Err(BusError::UnknownGroup(_))
        ));
    }

    #[tokio::test]
    async fn send_to_group_reaches_every_member() {
        let ctx = ChannelContext::default();
        for name in ["a", "b"] {
            ctx.add_module(name).await;
            ctx.add_module_group(name, "g").await.expect("group");
        }
        let msg = Message::new("");
        assert_eq!(ctx.send_to_group("g", msg.clone()).await, 2);
        assert_eq!(ctx.receive("a").await.expect("a").id(), msg.id());
        assert_eq!(ctx.receive("b").await.expect("b").id(), msg.id());
    }

    #[tokio::test]
    async fn full_member_does_not_block_group_send() {
        let ctx = ctx_with_capacity(1);
        ctx.add_module("slow").await;
        ctx.add_module_group("slow", "g").await.expect("group");
        ctx.send_to_group("g", Message::new("")).await;
        let sent = tokio::time::timeout(
            Duration::from_millis(200),
            ctx.send_to_group("g", Message::new("")),
        )
        .await;
        assert!(sent.is_ok(), "send_to_group must not block on a full mailbox");
        ctx.receive("slow").await.expect("first");
        ctx.receive("slow").await.expect("second arrives from background send");
    }

    #[tokio::test]
    async fn cleanup_wakes_blocked_receiver() {
        let ctx = Arc::new(ChannelContext::default());
        ctx.add_module("a").await;
        let rx_ctx = ctx.clone();
        let receiver = tokio::spawn(async move { rx_ctx.receive("a").await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(ctx.cleanup("a").await);
        let res = receiver.await.expect("join");
        assert!(matches!(res, Err(BusError::MailboxClosed(_))));
        assert!(!ctx.cleanup("a").await);
    }

    #[tokio::test]
    async fn cleanup_wakes_blocked_sender() {
        let ctx = Arc::new(ctx_with_capacity(1));
        ctx.add_module("a").await;
        ctx.deliver("a", Message::new("")).await.expect("fill");
        let tx_ctx = ctx.clone();
        let sender = tokio::spawn(async move { tx_ctx.deliver("a", Message::new("")).await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        ctx.cleanup("a").await;
        let res = sender.await.expect("join");
        assert!(matches!(res, Err(BusError::MailboxClosed(_))));
    }

    #[tokio::test]
    async fn send_after_cleanup_is_harmless() {
        let ctx = ChannelContext::default();
        ctx.add_module("a").await;
        ctx.add_module_group("a", "g").await.expect("group");
        ctx.cleanup("a").await;
        ctx.send("a", Message::new("")).await;
        assert_eq!(ctx.send_to_group("g", Message::new("")).await, 0);
        assert!(ctx.group_members("g").await.is_empty());
        assert!(matches!(
            ctx.receive("a").await,
            Err(BusError::UnknownModule(_))
        ));
    }

    #[tokio::test]
    async fn exchange_lists_modules_and_groups() {
        let ctx = ChannelContext::default();
        ctx.add_module("b").await;
        ctx.add_module("a").await;
        ctx.add_module_group("a", "bus").await.expect("group");
        let ex = ctx.local_exchange().await;
        assert_eq!(ex.modules, vec!["a", "b"]);
        assert_eq!(ex.groups["bus"], vec!["a"]);
    }
}
