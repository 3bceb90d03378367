//! Two-class delivery of device data: real-time items go to their sink as
//! soon as they arrive, batch items are buffered and flushed on a timer.

use async_trait::async_trait;
use dashmap::DashMap;
use edgehive_protocol::{Message, operation};
use edgehive_protocol::message::now_ms;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::bus::Bus;
use crate::error::{BusError, Result};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataItem {
    pub device: String,
    pub topic: String,
    pub payload: Vec<u8>,
    pub timestamp: i64,
}

impl DataItem {
    pub fn new(device: impl Into<String>, topic: impl Into<String>, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            device: device.into(),
            topic: topic.into(),
            payload: payload.into(),
            timestamp: now_ms(),
        }
    }

    pub fn key(&self) -> String {
        sink_key(&self.device, &self.topic)
    }
}

/// Sink registry key: `device:topic`.
pub fn sink_key(device: &str, topic: &str) -> String {
    format!("{device}:{topic}")
}

#[async_trait]
pub trait DataSink: Send + Sync {
    async fn publish(&self, item: DataItem) -> Result<()>;
}

/// Forwards items into an mpsc channel.
pub struct ChannelSink {
    tx: mpsc::Sender<DataItem>,
}

impl ChannelSink {
    pub fn new(tx: mpsc::Sender<DataItem>) -> Self {
        Self { tx }
    }
}

#[async_trait]
impl DataSink for ChannelSink {
    async fn publish(&self, item: DataItem) -> Result<()> {
        self.tx
            .send(item)
            .await
            .map_err(|_| BusError::MailboxClosed("channel sink".to_string()))
    }
}

/// Publishes items as bus messages to one module. The resource is the
/// item's `device:topic` key and the payload travels as bytes.
pub struct BusSink {
    bus: Bus,
    module: String,
    source: String,
}

impl BusSink {
    pub fn new(bus: Bus, module: impl Into<String>, source: impl Into<String>) -> Self {
        Self {
            bus,
            module: module.into(),
            source: source.into(),
        }
    }
}

#[async_trait]
impl DataSink for BusSink {
    async fn publish(&self, item: DataItem) -> Result<()> {
        let msg = Message::new("")
            .build_router(self.source.clone(), "", item.key(), operation::PUBLISH)
            .fill_bytes(item.payload);
        self.bus.send(&self.module, msg).await;
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PriorityConfig {
    pub queue_capacity: usize,
    pub flush_interval_ms: u64,
    /// Batch items held between flushes; the oldest is dropped past this.
    pub max_batch_buffer: usize,
}

impl Default for PriorityConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 1000,
            flush_interval_ms: 5000,
            max_batch_buffer: 10_000,
        }
    }
}

pub struct PriorityDispatcher {
    realtime: mpsc::Sender<DataItem>,
    batch: mpsc::Sender<DataItem>,
    sinks: Arc<DashMap<String, Arc<dyn DataSink>>>,
    shutdown: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl PriorityDispatcher {
    pub fn start(config: PriorityConfig) -> Self {
        let (realtime, realtime_rx) = mpsc::channel(config.queue_capacity.max(1));
        let (batch, batch_rx) = mpsc::channel(config.queue_capacity.max(1));
        let sinks: Arc<DashMap<String, Arc<dyn DataSink>>> = Arc::new(DashMap::new());
        let shutdown = CancellationToken::new();
        let worker = Worker {
            realtime: realtime_rx,
            batch: batch_rx,
            sinks: sinks.clone(),
            buffer: VecDeque::new(),
            max_buffer: config.max_batch_buffer.max(1),
            shutdown: shutdown.clone(),
        };
        let task = tokio::spawn(worker.run(Duration::from_millis(config.flush_interval_ms)));
        Self {
            realtime,
            batch,
            sinks,
            shutdown,
            task: Mutex::new(Some(task)),
        }
    }

    pub fn register_sink(&self, device: &str, topic: &str, sink: Arc<dyn DataSink>) {
        self.sinks.insert(sink_key(device, topic), sink);
    }

    pub fn remove_sink(&self, device: &str, topic: &str) -> bool {
        self.sinks.remove(&sink_key(device, topic)).is_some()
    }

    /// Waits while the real-time queue is full.
    pub async fn publish_realtime(&self, item: DataItem) -> Result<()> {
        self.realtime
            .send(item)
            .await
            .map_err(|_| BusError::MailboxClosed("realtime queue".to_string()))
    }

    pub fn try_publish_realtime(&self, item: DataItem) -> Result<()> {
        try_enqueue(&self.realtime, item, "realtime queue")
    }

    pub async fn publish_batch(&self, item: DataItem) -> Result<()> {
        self.batch
            .send(item)
            .await
            .map_err(|_| BusError::MailboxClosed("batch queue".to_string()))
    }

    pub fn try_publish_batch(&self, item: DataItem) -> Result<()> {
        try_enqueue(&self.batch, item, "batch queue")
    }

    /// Flushes buffered batch items and stops the worker.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        let task = self.task.lock().await.take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                warn!(error = %e, "priority dispatcher task failed");
            }
        }
    }
}

impl Drop for PriorityDispatcher {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

fn try_enqueue(tx: &mpsc::Sender<DataItem>, item: DataItem, queue: &str) -> Result<()> {
    match tx.try_send(item) {
        Ok(()) => Ok(()),
        Err(TrySendError::Full(item)) => {
            warn!(queue, key = %item.key(), "queue full, dropping item");
            Err(BusError::SendTimeout(queue.to_string()))
        }
        Err(TrySendError::Closed(_)) => Err(BusError::MailboxClosed(queue.to_string())),
    }
}

struct Worker {
    realtime: mpsc::Receiver<DataItem>,
    batch: mpsc::Receiver<DataItem>,
    sinks: Arc<DashMap<String, Arc<dyn DataSink>>>,
    buffer: VecDeque<DataItem>,
    max_buffer: usize,
    shutdown: CancellationToken,
}

impl Worker {
    async fn run(mut self, flush_interval: Duration) {
        let mut ticker = tokio::time::interval_at(Instant::now() + flush_interval, flush_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => break,
                Some(item) = self.realtime.recv() => self.deliver(item).await,
                Some(item) = self.batch.recv() => self.buffer_item(item),
                _ = ticker.tick() => self.flush().await,
            }
        }

        while let Ok(item) = self.realtime.try_recv() {
            self.deliver(item).await;
        }
        while let Ok(item) = self.batch.try_recv() {
            self.buffer_item(item);
        }
        self.flush().await;
    }

    fn buffer_item(&mut self, item: DataItem) {
        if self.buffer.len() >= self.max_buffer {
            if let Some(dropped) = self.buffer.pop_front() {
                warn!(key = %dropped.key(), "batch buffer full, dropping oldest item");
            }
        }
        self.buffer.push_back(item);
    }

    async fn flush(&mut self) {
        if self.buffer.is_empty() {
            return;
        }
        debug!(items = self.buffer.len(), "flushing batch items");
        while let Some(item) = self.buffer.pop_front() {
            self.deliver(item).await;
        }
    }

    async fn deliver(&self, item: DataItem) {
        let key = item.key();
        let sink = self.sinks.get(&key).map(|entry| entry.value().clone());
        match sink {
            Some(sink) => {
                if let Err(e) = sink.publish(item).await {
                    warn!(key = %key, error = %e, "sink rejected item");
                }
            }
            None => warn!(key = %key, "no sink registered, dropping item"),
        }
    }
}
