use bytes::Bytes;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use edgehive_protocol::Message;
use futures_util::SinkExt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{Mutex, mpsc, oneshot};
use tokio_util::codec::{FramedWrite, LengthDelimitedCodec};
use tokio_util::sync::CancellationToken;

use super::transport::BoxedWriter;
use crate::channel::ensure_id;
use crate::error::{BusError, Result};

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

pub(crate) fn frame_codec(max_frame_bytes: usize) -> LengthDelimitedCodec {
    LengthDelimitedCodec::builder()
        .max_frame_length(max_frame_bytes)
        .new_codec()
}

/// One peer connection. Each frame carries one JSON-encoded [`Message`];
/// writers are serialized through the framed sink's mutex.
pub struct Connection {
    id: u64,
    peer: String,
    message_type: &'static str,
    writer: Mutex<FramedWrite<BoxedWriter, LengthDelimitedCodec>>,
    inbound_tx: mpsc::Sender<Message>,
    inbound_rx: Mutex<mpsc::Receiver<Message>>,
    closed: CancellationToken,
}

impl Connection {
    pub(crate) fn new(
        writer: BoxedWriter,
        peer: String,
        message_type: &'static str,
        max_frame_bytes: usize,
        inbound_capacity: usize,
    ) -> Arc<Self> {
        let (inbound_tx, inbound_rx) = mpsc::channel(inbound_capacity.max(1));
        Arc::new(Self {
            id: NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed),
            peer,
            message_type,
            writer: Mutex::new(FramedWrite::new(writer, frame_codec(max_frame_bytes))),
            inbound_tx,
            inbound_rx: Mutex::new(inbound_rx),
            closed: CancellationToken::new(),
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn peer(&self) -> &str {
        &self.peer
    }

    pub fn message_type(&self) -> &'static str {
        self.message_type
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    pub async fn closed(&self) {
        self.closed.cancelled().await
    }

    fn closed_error(&self) -> BusError {
        BusError::ConnectionClosed(self.peer.clone())
    }

    pub async fn write_message(&self, msg: &Message) -> Result<()> {
        if self.is_closed() {
            return Err(self.closed_error());
        }
        let frame = Bytes::from(serde_json::to_vec(msg)?);
        let mut writer = self.writer.lock().await;
        writer.send(frame).await?;
        Ok(())
    }

    /// Queues a message no local module claimed, for `receive` on this
    /// connection.
    pub(crate) fn push_inbound(&self, msg: Message) {
        match self.inbound_tx.try_send(msg) {
            Ok(()) => {}
            Err(TrySendError::Full(msg)) => {
                tracing::warn!(peer = %self.peer, msg_id = msg.id(), "inbound queue full, dropping message");
            }
            Err(TrySendError::Closed(_)) => {}
        }
    }

    pub async fn recv_inbound(&self) -> Result<Message> {
        let mut rx = tokio::select! {
            biased;
            _ = self.closed.cancelled() => return Err(self.closed_error()),
            guard = self.inbound_rx.lock() => guard,
        };
        tokio::select! {
            biased;
            msg = rx.recv() => msg.ok_or_else(|| self.closed_error()),
            _ = self.closed.cancelled() => Err(self.closed_error()),
        }
    }

    /// Marks the connection closed and shuts down the write half.
    pub async fn shutdown(&self) {
        self.closed.cancel();
        let mut writer = self.writer.lock().await;
        if let Err(e) = SinkExt::<Bytes>::close(&mut *writer).await {
            tracing::debug!(peer = %self.peer, err = %e, "error closing connection");
        }
    }
}

/// Request/reply plumbing over peer connections: replies are matched to
/// outstanding synchronous sends by the request id.
#[derive(Default)]
pub struct RemoteBroker {
    pending: DashMap<String, oneshot::Sender<Message>>,
}

struct PendingGuard<'a> {
    pending: &'a DashMap<String, oneshot::Sender<Message>>,
    id: String,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.pending.remove(&self.id);
    }
}

impl RemoteBroker {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn send(&self, conn: &Connection, msg: &Message) -> Result<()> {
        conn.write_message(msg).await
    }

    pub async fn send_sync(&self, conn: &Connection, mut msg: Message, timeout: Duration) -> Result<Message> {
        ensure_id(&mut msg);
        msg.header.sync = true;
        let id = msg.header.id.clone();

        let (tx, rx) = oneshot::channel();
        match self.pending.entry(id.clone()) {
            Entry::Occupied(_) => return Err(BusError::DuplicateMessageId(id)),
            Entry::Vacant(slot) => {
                slot.insert(tx);
            }
        }
        let _guard = PendingGuard {
            pending: &self.pending,
            id: id.clone(),
        };

        conn.write_message(&msg).await?;
        tokio::select! {
            reply = rx => reply.map_err(|_| BusError::ConnectionClosed(conn.peer().to_string())),
            _ = conn.closed() => Err(BusError::ConnectionClosed(conn.peer().to_string())),
            _ = tokio::time::sleep(timeout) => Err(BusError::RecvTimeout(id)),
        }
    }

    pub async fn receive(&self, conn: &Connection) -> Result<Message> {
        conn.recv_inbound().await
    }

    /// Completes the synchronous send this reply answers. Gives the message
    /// back when no send is waiting on it.
    pub(crate) fn complete(&self, msg: Message) -> std::result::Result<(), Message> {
        match self.pending.remove(msg.parent_id()) {
            Some((_, tx)) => {
                if tx.send(msg).is_err() {
                    tracing::debug!("reply arrived after the caller gave up");
                }
                Ok(())
            }
            None => Err(msg),
        }
    }

    pub fn pending(&self) -> usize {
        self.pending.len()
    }
}
