use anyhow::Result;
use async_trait::async_trait;
use libedgehive::{Bus, Module, PeerConfig, PeerHandle, Transport};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

/// Replies to every request with its own body, optionally after a delay.
pub struct Echo {
    name: String,
    groups: Vec<String>,
    delay: Duration,
    handled: AtomicUsize,
}

impl Echo {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            groups: Vec::new(),
            delay: Duration::ZERO,
            handled: AtomicUsize::new(0),
        }
    }

    pub fn in_group(mut self, group: &str) -> Self {
        self.groups.push(group.to_string());
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn handled(&self) -> usize {
        self.handled.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Module for Echo {
    fn name(&self) -> &str {
        &self.name
    }

    fn groups(&self) -> Vec<String> {
        self.groups.clone()
    }

    async fn start(self: Arc<Self>, bus: Bus) {
        loop {
            let received = tokio::select! {
                _ = bus.done() => break,
                msg = bus.receive(&self.name) => msg,
            };
            let Ok(msg) = received else { break };
            self.handled.fetch_add(1, Ordering::SeqCst);
            let bus = bus.clone();
            let delay = self.delay;
            tokio::spawn(async move {
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
                let reply = msg.new_response(msg.content.clone());
                bus.send_resp(reply).await;
            });
        }
    }
}

/// Takes messages off its mailbox and never answers.
pub struct Silent {
    name: String,
    received: AtomicUsize,
}

impl Silent {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            received: AtomicUsize::new(0),
        }
    }

    pub fn received(&self) -> usize {
        self.received.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Module for Silent {
    fn name(&self) -> &str {
        &self.name
    }

    async fn start(self: Arc<Self>, bus: Bus) {
        loop {
            tokio::select! {
                _ = bus.done() => break,
                msg = bus.receive(&self.name) => match msg {
                    Ok(_) => {
                        self.received.fetch_add(1, Ordering::SeqCst);
                    }
                    Err(_) => break,
                },
            }
        }
    }
}

/// Makes `server` listen on a loopback port and connects `client` to it.
/// Both sides' modules must already be registered: topology is swapped
/// when the link comes up.
pub async fn link(server: &Bus, client: &Bus) -> Result<PeerHandle> {
    let addr = server
        .listen(&Transport::Tcp {
            address: "127.0.0.1:0".to_string(),
        })
        .await?;
    let mut peer = client.connect_peer(PeerConfig {
        name: "server".to_string(),
        transport: Transport::Tcp { address: addr },
    });
    peer.wait_connected(Duration::from_secs(5)).await?;
    Ok(peer)
}
