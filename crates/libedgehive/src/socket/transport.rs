use rustls::pki_types::ServerName;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::io;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::str::FromStr;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::{TcpListener, TcpStream, UnixListener, UnixStream};
use tokio_rustls::{TlsAcceptor, TlsConnector};

use crate::error::{BusError, Result};
use crate::tls::{self, TlsSettings};

pub type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;
pub type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

const TLS_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Sent by the dialer on a fresh QUIC stream; the acceptor only learns of
/// the stream once bytes arrive on it.
const QUIC_STREAM_PREAMBLE: &[u8; 4] = b"EHB1";

/// Byte-stream transport for a bus peer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Transport {
    Tcp {
        address: String,
    },
    Tls {
        address: String,
        /// Name checked against the server certificate; defaults to the host.
        #[serde(default)]
        server_name: Option<String>,
    },
    Unix {
        path: PathBuf,
    },
    /// One bidirectional QUIC stream per connection.
    Quic {
        address: String,
        #[serde(default)]
        server_name: Option<String>,
    },
}

impl Transport {
    /// Value stamped into `header.type` of messages sent over this transport.
    pub fn message_type(&self) -> &'static str {
        match self {
            Self::Tcp { .. } => "tcp",
            Self::Tls { .. } => "tls",
            Self::Unix { .. } => "unix",
            Self::Quic { .. } => "quic",
        }
    }
}

impl fmt::Display for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Tcp { address } => write!(f, "tcp://{address}"),
            Self::Tls { address, .. } => write!(f, "tls://{address}"),
            Self::Unix { path } => write!(f, "unix://{}", path.display()),
            Self::Quic { address, .. } => write!(f, "quic://{address}"),
        }
    }
}

/// Parses the `Display` form: `tcp://host:port`, `tls://host:port`,
/// `quic://host:port` or `unix:///path`.
impl FromStr for Transport {
    type Err = BusError;

    fn from_str(s: &str) -> Result<Self> {
        let (scheme, rest) = s
            .split_once("://")
            .ok_or_else(|| BusError::Config(format!("transport {s:?} has no scheme")))?;
        if rest.is_empty() {
            return Err(BusError::Config(format!("transport {s:?} has no address")));
        }
        match scheme {
            "tcp" => Ok(Self::Tcp {
                address: rest.to_string(),
            }),
            "tls" => Ok(Self::Tls {
                address: rest.to_string(),
                server_name: None,
            }),
            "unix" => Ok(Self::Unix {
                path: PathBuf::from(rest),
            }),
            "quic" => Ok(Self::Quic {
                address: rest.to_string(),
                server_name: None,
            }),
            other => Err(BusError::Config(format!("unknown transport scheme {other:?}"))),
        }
    }
}

fn host_of(address: &str) -> String {
    let host = address
        .rsplit_once(':')
        .map(|(host, _)| host)
        .unwrap_or(address);
    host.trim_start_matches('[').trim_end_matches(']').to_string()
}

pub async fn dial(transport: &Transport, tls_settings: &TlsSettings) -> Result<(BoxedReader, BoxedWriter)> {
    match transport {
        Transport::Tcp { address } => {
            let stream = TcpStream::connect(address).await?;
            stream.set_nodelay(true)?;
            let (r, w) = stream.into_split();
            Ok((Box::new(r), Box::new(w)))
        }
        Transport::Tls {
            address,
            server_name,
        } => {
            let config = tls::client_config(tls_settings)?;
            let host = server_name.clone().unwrap_or_else(|| host_of(address));
            let name = ServerName::try_from(host).map_err(|e| BusError::Tls(e.to_string()))?;
            let tcp = TcpStream::connect(address).await?;
            tcp.set_nodelay(true)?;
            let stream = tokio::time::timeout(
                TLS_HANDSHAKE_TIMEOUT,
                TlsConnector::from(config).connect(name, tcp),
            )
            .await
            .map_err(|_| BusError::ConnectTimeout(address.clone()))??;
            let (r, w) = tokio::io::split(stream);
            Ok((Box::new(r), Box::new(w)))
        }
        Transport::Unix { path } => {
            let stream = UnixStream::connect(path).await?;
            let (r, w) = stream.into_split();
            Ok((Box::new(r), Box::new(w)))
        }
        Transport::Quic {
            address,
            server_name,
        } => {
            let remote = resolve(address).await?;
            let local: SocketAddr = if remote.is_ipv6() {
                (Ipv6Addr::UNSPECIFIED, 0).into()
            } else {
                (Ipv4Addr::UNSPECIFIED, 0).into()
            };
            let mut endpoint = quinn::Endpoint::client(local)?;
            endpoint.set_default_client_config(tls::quic_client_config(tls_settings)?);
            let host = server_name.clone().unwrap_or_else(|| host_of(address));
            let connecting = endpoint
                .connect(remote, &host)
                .map_err(|e| BusError::Tls(e.to_string()))?;
            let conn = tokio::time::timeout(TLS_HANDSHAKE_TIMEOUT, connecting)
                .await
                .map_err(|_| BusError::ConnectTimeout(address.clone()))?
                .map_err(io::Error::other)?;
            let (mut send, recv) = conn.open_bi().await.map_err(io::Error::other)?;
            send.write_all(QUIC_STREAM_PREAMBLE)
                .await
                .map_err(io::Error::other)?;
            Ok((
                Box::new(QuicHalf::new(recv, &conn, Some(endpoint.clone()))),
                Box::new(QuicHalf::new(send, &conn, Some(endpoint))),
            ))
        }
    }
}

async fn resolve(address: &str) -> Result<SocketAddr> {
    tokio::net::lookup_host(address)
        .await?
        .next()
        .ok_or_else(|| BusError::Config(format!("{address} did not resolve")))
}

/// One half of a QUIC stream. Holds the connection, and on the dialing side
/// the client endpoint, for as long as the half is alive.
struct QuicHalf<T> {
    io: T,
    _conn: quinn::Connection,
    _endpoint: Option<quinn::Endpoint>,
}

impl<T> QuicHalf<T> {
    fn new(io: T, conn: &quinn::Connection, endpoint: Option<quinn::Endpoint>) -> Self {
        Self {
            io,
            _conn: conn.clone(),
            _endpoint: endpoint,
        }
    }
}

impl<T: AsyncRead + Unpin> AsyncRead for QuicHalf<T> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        AsyncRead::poll_read(Pin::new(&mut self.io), cx, buf)
    }
}

impl<T: AsyncWrite + Unpin> AsyncWrite for QuicHalf<T> {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        AsyncWrite::poll_write(Pin::new(&mut self.io), cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        AsyncWrite::poll_flush(Pin::new(&mut self.io), cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        AsyncWrite::poll_shutdown(Pin::new(&mut self.io), cx)
    }
}

/// Bound listener for any [`Transport`].
pub enum Listener {
    Tcp(TcpListener),
    Tls(TcpListener, TlsAcceptor),
    Unix(UnixListener, PathBuf),
    Quic(quinn::Endpoint),
}

impl Listener {
    pub async fn bind(transport: &Transport, tls_settings: &TlsSettings) -> Result<Self> {
        match transport {
            Transport::Tcp { address } => Ok(Self::Tcp(TcpListener::bind(address).await?)),
            Transport::Tls { address, .. } => {
                let acceptor = TlsAcceptor::from(tls::server_config(tls_settings)?);
                Ok(Self::Tls(TcpListener::bind(address).await?, acceptor))
            }
            Transport::Unix { path } => {
                prepare_socket_path(path)?;
                let listener = UnixListener::bind(path)?;
                Ok(Self::Unix(listener, path.clone()))
            }
            Transport::Quic { address, .. } => {
                let config = tls::quic_server_config(tls_settings)?;
                let endpoint = quinn::Endpoint::server(config, resolve(address).await?)?;
                Ok(Self::Quic(endpoint))
            }
        }
    }

    pub fn message_type(&self) -> &'static str {
        match self {
            Self::Tcp(_) => "tcp",
            Self::Tls(..) => "tls",
            Self::Unix(..) => "unix",
            Self::Quic(_) => "quic",
        }
    }

    /// Address peers dial; useful when bound to port 0.
    pub fn local_addr(&self) -> String {
        match self {
            Self::Tcp(l) | Self::Tls(l, _) => l
                .local_addr()
                .map(|a| a.to_string())
                .unwrap_or_default(),
            Self::Unix(_, path) => path.display().to_string(),
            Self::Quic(endpoint) => endpoint
                .local_addr()
                .map(|a| a.to_string())
                .unwrap_or_default(),
        }
    }

    pub async fn accept(&self) -> Result<(BoxedReader, BoxedWriter, String)> {
        match self {
            Self::Tcp(l) => {
                let (stream, peer) = l.accept().await?;
                stream.set_nodelay(true)?;
                let (r, w) = stream.into_split();
                Ok((Box::new(r), Box::new(w), peer.to_string()))
            }
            Self::Tls(l, acceptor) => {
                let (stream, peer) = l.accept().await?;
                stream.set_nodelay(true)?;
                let stream = tokio::time::timeout(TLS_HANDSHAKE_TIMEOUT, acceptor.accept(stream))
                    .await
                    .map_err(|_| BusError::ConnectTimeout(peer.to_string()))??;
                let (r, w) = tokio::io::split(stream);
                Ok((Box::new(r), Box::new(w), peer.to_string()))
            }
            Self::Unix(l, path) => {
                let (stream, _) = l.accept().await?;
                let (r, w) = stream.into_split();
                Ok((Box::new(r), Box::new(w), path.display().to_string()))
            }
            Self::Quic(endpoint) => {
                let incoming = endpoint
                    .accept()
                    .await
                    .ok_or_else(|| BusError::ConnectionClosed("quic endpoint closed".to_string()))?;
                let peer = incoming.remote_address().to_string();
                let (conn, send, recv) = tokio::time::timeout(TLS_HANDSHAKE_TIMEOUT, async {
                    let conn = incoming.await.map_err(io::Error::other)?;
                    let (send, mut recv) = conn.accept_bi().await.map_err(io::Error::other)?;
                    let mut preamble = [0u8; QUIC_STREAM_PREAMBLE.len()];
                    recv.read_exact(&mut preamble)
                        .await
                        .map_err(io::Error::other)?;
                    if &preamble != QUIC_STREAM_PREAMBLE {
                        return Err(io::Error::new(
                            io::ErrorKind::InvalidData,
                            "unexpected quic stream preamble",
                        ));
                    }
                    Ok::<_, io::Error>((conn, send, recv))
                })
                .await
                .map_err(|_| BusError::ConnectTimeout(peer.clone()))??;
                Ok((
                    Box::new(QuicHalf::new(recv, &conn, None)),
                    Box::new(QuicHalf::new(send, &conn, None)),
                    peer,
                ))
            }
        }
    }
}

impl Drop for Listener {
    fn drop(&mut self) {
        if let Self::Unix(_, path) = self {
            std::fs::remove_file(path).ok();
        }
    }
}

fn prepare_socket_path(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    // Remove stale socket
    if path.exists() {
        std::fs::remove_file(path)?;
    }
    Ok(())
}
