use libedgehive::tls::{self, TlsSettings};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio_tungstenite::{Connector, MaybeTlsStream, WebSocketStream, connect_async_tls_with_config};
use tracing::{debug, info, warn};
use url::Url;

use crate::error::{Result, StreamError};

pub type TunnelStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DialerConfig {
    /// Tunnel server `host:port`.
    pub server: String,
    pub scheme: String,
    pub path: String,
    pub tls: TlsSettings,
    pub handshake_timeout_ms: u64,
    pub max_retries: u32,
    pub retry_interval_ms: u64,
}

impl Default for DialerConfig {
    fn default() -> Self {
        Self {
            server: "127.0.0.1:10004".to_string(),
            scheme: "wss".to_string(),
            path: "/v1/edgehive/videoconnect".to_string(),
            tls: TlsSettings::default(),
            handshake_timeout_ms: 30_000,
            max_retries: 3,
            retry_interval_ms: 2000,
        }
    }
}

/// Opens tunnel websockets to the cloud, one per endpoint.
pub struct TunnelDialer {
    config: DialerConfig,
    connector: Option<Connector>,
}

impl TunnelDialer {
    /// Loads certificate material up front so a bad setup fails at startup.
    pub fn new(config: DialerConfig) -> Result<Self> {
        let connector = match config.scheme.as_str() {
            "wss" => Some(Connector::Rustls(tls::client_config(&config.tls)?)),
            "ws" => None,
            other => {
                return Err(StreamError::InvalidUrl {
                    url: format!("{other}://{}", config.server),
                    reason: "tunnel scheme must be ws or wss".to_string(),
                });
            }
        };
        Ok(Self { config, connector })
    }

    pub fn config(&self) -> &DialerConfig {
        &self.config
    }

    /// `{scheme}://{server}{path}?ep={endpoint}&url={url}`
    pub fn tunnel_url(&self, endpoint: &str, url: &str) -> Result<Url> {
        let base = format!("{}://{}{}", self.config.scheme, self.config.server, self.config.path);
        let mut tunnel = Url::parse(&base).map_err(|e| StreamError::InvalidUrl {
            url: base.clone(),
            reason: e.to_string(),
        })?;
        tunnel
            .query_pairs_mut()
            .append_pair("ep", endpoint)
            .append_pair("url", url);
        Ok(tunnel)
    }

    pub async fn dial_once(&self, endpoint: &str, url: &str) -> Result<TunnelStream> {
        let tunnel = self.tunnel_url(endpoint, url)?;
        debug!(endpoint, url = %tunnel, "dialing tunnel");
        let handshake = connect_async_tls_with_config(
            tunnel.as_str(),
            None,
            true,
            self.connector.clone(),
        );
        let (ws, _response) = tokio::time::timeout(
            Duration::from_millis(self.config.handshake_timeout_ms),
            handshake,
        )
        .await
        .map_err(|_| {
            std::io::Error::new(
                std::io::ErrorKind::TimedOut,
                format!("tunnel handshake with {} timed out", self.config.server),
            )
        })??;
        Ok(ws)
    }

    /// Dials up to `max_retries` times, pausing `retry_interval_ms` between
    /// failed attempts.
    pub async fn dial(&self, endpoint: &str, url: &str) -> Result<TunnelStream> {
        let attempts = self.config.max_retries.max(1);
        let mut last_error = String::new();
        for attempt in 1..=attempts {
            match self.dial_once(endpoint, url).await {
                Ok(ws) => {
                    info!(endpoint, attempt, "tunnel established");
                    return Ok(ws);
                }
                Err(e) => {
                    warn!(endpoint, attempt, err = %e, "tunnel dial failed");
                    last_error = e.to_string();
                }
            }
            if attempt < attempts {
                tokio::time::sleep(Duration::from_millis(self.config.retry_interval_ms)).await;
            }
        }
        Err(StreamError::DialFailed {
            endpoint: endpoint.to_string(),
            attempts,
            reason: last_error,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn plain(server: &str) -> TunnelDialer {
        TunnelDialer::new(DialerConfig {
            server: server.to_string(),
            scheme: "ws".to_string(),
            retry_interval_ms: 10,
            ..Default::default()
        })
        .unwrap()
    }

    #[test]
    fn tunnel_url_carries_endpoint_and_source() {
        let dialer = TunnelDialer::new(DialerConfig {
            server: "cloud.example.com:10004".into(),
            ..Default::default()
        })
        .unwrap();
        let url = dialer.tunnel_url("ep1", "rtsp://cam/live?x=1").unwrap();
        assert_eq!(url.scheme(), "wss");
        assert_eq!(url.path(), "/v1/edgehive/videoconnect");
        let pairs: Vec<_> = url.query_pairs().into_owned().collect();
        assert_eq!(
            pairs,
            vec![
                ("ep".to_string(), "ep1".to_string()),
                ("url".to_string(), "rtsp://cam/live?x=1".to_string()),
            ]
        );
    }

    #[test]
    fn unsupported_scheme_is_rejected() {
        let err = TunnelDialer::new(DialerConfig {
            scheme: "http".into(),
            ..Default::default()
        })
        .err()
        .unwrap();
        assert!(matches!(err, StreamError::InvalidUrl { .. }));
    }

    #[tokio::test]
    async fn dial_gives_up_after_retries() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        drop(listener);

        let err = plain(&addr).dial("ep1", "rtsp://cam").await.unwrap_err();
        match err {
            StreamError::DialFailed { attempts, .. } => assert_eq!(attempts, 3),
            other => panic!("unexpected error {other}"),
        }
    }
}
