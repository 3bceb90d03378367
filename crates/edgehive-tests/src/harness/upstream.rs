use anyhow::{Context, Result};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

/// A TCP video source. Each accepted connection is sent `greeting`, and
/// everything it receives is forwarded to the test.
pub struct UpstreamSource {
    pub addr: SocketAddr,
    received: mpsc::UnboundedReceiver<Vec<u8>>,
    accepted: mpsc::UnboundedReceiver<SocketAddr>,
    task: JoinHandle<()>,
}

impl UpstreamSource {
    pub async fn spawn(greeting: &[u8]) -> Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let (data_tx, received) = mpsc::unbounded_channel();
        let (accept_tx, accepted) = mpsc::unbounded_channel();
        let greeting = greeting.to_vec();

        let task = tokio::spawn(async move {
            while let Ok((mut stream, peer)) = listener.accept().await {
                accept_tx.send(peer).ok();
                let data_tx = data_tx.clone();
                let greeting = greeting.clone();
                tokio::spawn(async move {
                    if !greeting.is_empty() && stream.write_all(&greeting).await.is_err() {
                        return;
                    }
                    let mut buf = vec![0u8; 8192];
                    loop {
                        match stream.read(&mut buf).await {
                            Ok(0) | Err(_) => break,
                            Ok(n) => {
                                data_tx.send(buf[..n].to_vec()).ok();
                            }
                        }
                    }
                });
            }
        });

        Ok(Self {
            addr,
            received,
            accepted,
            task,
        })
    }

    /// `rtsp://` URL for this source.
    pub fn url(&self, path: &str) -> String {
        format!("rtsp://{}{path}", self.addr)
    }

    pub async fn wait_accepted(&mut self, timeout: Duration) -> Result<SocketAddr> {
        tokio::time::timeout(timeout, self.accepted.recv())
            .await
            .context("upstream saw no connection in time")?
            .context("upstream stopped")
    }

    /// Collects received bytes until `len` have arrived or `timeout` passes.
    pub async fn read_exact_len(&mut self, len: usize, timeout: Duration) -> Vec<u8> {
        let deadline = tokio::time::Instant::now() + timeout;
        let mut out = Vec::new();
        while out.len() < len {
            match tokio::time::timeout_at(deadline, self.received.recv()).await {
                Ok(Some(chunk)) => out.extend_from_slice(&chunk),
                _ => break,
            }
        }
        out
    }

    /// Bytes received so far without waiting.
    pub fn drain_received(&mut self) -> Vec<u8> {
        let mut out = Vec::new();
        while let Ok(chunk) = self.received.try_recv() {
            out.extend_from_slice(&chunk);
        }
        out
    }
}

impl Drop for UpstreamSource {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// A source that accepts one connection and never reads from it, so the
/// edge's writes back up. The connection is dropped on [`release`].
///
/// [`release`]: StalledSource::release
pub struct StalledSource {
    pub addr: SocketAddr,
    release: Option<oneshot::Sender<()>>,
    task: JoinHandle<()>,
}

impl StalledSource {
    pub async fn spawn() -> Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let (release, released) = oneshot::channel();
        let task = tokio::spawn(async move {
            let Ok((stream, _)) = listener.accept().await else {
                return;
            };
            released.await.ok();
            drop(stream);
        });
        Ok(Self {
            addr,
            release: Some(release),
            task,
        })
    }

    pub fn url(&self, path: &str) -> String {
        format!("rtsp://{}{path}", self.addr)
    }

    /// Closes the held connection.
    pub fn release(&mut self) {
        if let Some(tx) = self.release.take() {
            tx.send(()).ok();
        }
    }
}

impl Drop for StalledSource {
    fn drop(&mut self) {
        self.task.abort();
    }
}
