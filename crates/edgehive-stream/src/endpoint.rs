//! Bus-driven lifecycle for stream tunnels: `start` dials and persists an
//! endpoint, `stop` forgets and closes it, and persisted endpoints are
//! re-dialed when the module starts.

use async_trait::async_trait;
use edgehive_protocol::{HttpResponse, Message, operation};
use libedgehive::{Bus, Module};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::dialer::{DialerConfig, TunnelDialer};
use crate::error::{Result, StreamError};
use crate::session::{SessionConfig, TunnelSession};
use crate::store::{EndpointUrl, UrlStore};

pub const MODULE_NAME: &str = "streamruleendpoint";
/// Only control messages from this source are handled.
pub const SOURCE_TYPE: &str = "streamrule_endpoint";

/// `Server` header on error replies.
pub const SERVER_HEADER: &str = "edgehive-node";

pub const OP_START: &str = "start";
pub const OP_STOP: &str = "stop";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EndpointConfig {
    pub enabled: bool,
    pub groups: Vec<String>,
    /// Group that start/stop replies are broadcast to.
    pub reply_group: String,
    /// Route group stamped on replies.
    pub route_group: String,
    pub start_timeout_ms: u64,
    pub dialer: DialerConfig,
    pub session: SessionConfig,
}

impl Default for EndpointConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            groups: vec!["bus".to_string()],
            reply_group: "hub".to_string(),
            route_group: "user".to_string(),
            start_timeout_ms: 30_000,
            dialer: DialerConfig::default(),
            session: SessionConfig::default(),
        }
    }
}

enum EndpointState {
    Starting,
    Running(Arc<TunnelSession>),
    Stopping,
}

impl EndpointState {
    fn label(&self) -> &'static str {
        match self {
            Self::Starting => "starting",
            Self::Running(_) => "running",
            Self::Stopping => "stopping",
        }
    }
}

pub struct StreamRuleEndpoint {
    config: EndpointConfig,
    dialer: TunnelDialer,
    store: UrlStore,
    endpoints: RwLock<HashMap<String, EndpointState>>,
}

impl StreamRuleEndpoint {
    pub fn new(config: EndpointConfig, store: UrlStore) -> Result<Self> {
        let dialer = TunnelDialer::new(config.dialer.clone())?;
        Ok(Self {
            config,
            dialer,
            store,
            endpoints: RwLock::new(HashMap::new()),
        })
    }

    pub fn store(&self) -> &UrlStore {
        &self.store
    }

    /// `starting`, `running` or `stopping`; `None` when absent.
    pub async fn state_of(&self, endpoint: &str) -> Option<&'static str> {
        self.endpoints.read().await.get(endpoint).map(EndpointState::label)
    }

    pub async fn session(&self, endpoint: &str) -> Option<Arc<TunnelSession>> {
        match self.endpoints.read().await.get(endpoint) {
            Some(EndpointState::Running(session)) => Some(session.clone()),
            _ => None,
        }
    }

    pub async fn running_endpoints(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .endpoints
            .read()
            .await
            .iter()
            .filter(|(_, state)| matches!(state, EndpointState::Running(_)))
            .map(|(name, _)| name.clone())
            .collect();
        names.sort();
        names
    }

    /// Handles one control message and broadcasts the reply to the reply
    /// group.
    /// Messages from other sources and malformed resources get no reply.
    pub async fn handle_message(self: &Arc<Self>, bus: &Bus, msg: Message) {
        if msg.source() != SOURCE_TYPE {
            debug!(source = msg.source(), id = msg.id(), "ignoring message from unexpected source");
            return;
        }
        let Some((endpoint, url)) = msg.resource().split_once('/') else {
            error!(resource = msg.resource(), "invalid resource format");
            return;
        };
        if endpoint.is_empty() {
            error!(resource = msg.resource(), "invalid resource format");
            return;
        }

        let result = match msg.operation() {
            OP_START => self.start_endpoint(endpoint, url).await,
            OP_STOP => self.stop_endpoint(endpoint).await,
            other => Err(StreamError::UnknownAction {
                operation: other.to_string(),
                resource: msg.resource().to_string(),
            }),
        };
        match &result {
            Ok(()) => info!(endpoint, op = msg.operation(), "stream rule applied"),
            Err(e) => warn!(endpoint, op = msg.operation(), err = %e, "stream rule failed"),
        }

        match self.reply_to(&msg, &result) {
            Ok(reply) => bus.send_to_group(&self.config.reply_group, reply).await,
            Err(e) => error!(id = msg.id(), err = %e, "failed to encode reply"),
        }
    }

    fn reply_to(&self, request: &Message, result: &Result<()>) -> Result<Message> {
        let response = match result {
            Ok(()) => HttpResponse::new(200, r#"{"code":200,"message":"OK"}"#)
                .with_header("Content-Type", "application/json"),
            Err(e) => HttpResponse::new(e.status_code(), e.to_string()).with_header("Server", SERVER_HEADER),
        };

        let reply = Message::new(request.id())
            .build_router(MODULE_NAME, self.config.route_group.clone(), "", operation::UPLOAD)
            .fill_body(&response)?;
        Ok(reply)
    }

    /// Dials the tunnel and persists the endpoint. Fails if the endpoint is
    /// already known in memory or on disk, or if the whole start takes
    /// longer than `start_timeout_ms`.
    pub async fn start_endpoint(self: &Arc<Self>, endpoint: &str, url: &str) -> Result<()> {
        if url.is_empty() {
            return Err(StreamError::InvalidResource(format!("{endpoint}/")));
        }
        {
            let mut endpoints = self.endpoints.write().await;
            if endpoints.contains_key(endpoint) {
                return Err(StreamError::AlreadyExists(endpoint.to_string()));
            }
            endpoints.insert(endpoint.to_string(), EndpointState::Starting);
        }

        match self.store.get(endpoint).await {
            Ok(None) => {}
            Ok(Some(_)) => {
                self.release(endpoint).await;
                return Err(StreamError::AlreadyExists(endpoint.to_string()));
            }
            Err(e) => {
                self.release(endpoint).await;
                return Err(e);
            }
        }

        let deadline = Duration::from_millis(self.config.start_timeout_ms);
        let ws = match tokio::time::timeout(deadline, self.dialer.dial(endpoint, url)).await {
            Ok(Ok(ws)) => ws,
            Ok(Err(e)) => {
                self.release(endpoint).await;
                return Err(e);
            }
            Err(_) => {
                self.release(endpoint).await;
                return Err(StreamError::StartTimeout(endpoint.to_string()));
            }
        };
        let session = TunnelSession::new(endpoint, ws, self.store.clone(), self.config.session.clone());

        if let Err(e) = self.store.insert(endpoint, url).await {
            self.release(endpoint).await;
            session.close().await;
            return Err(e);
        }

        // A stop that ran while dialing or inserting left the entry
        // Stopping; its delete may have come before our insert.
        let mut endpoints = self.endpoints.write().await;
        if !matches!(endpoints.get(endpoint), Some(EndpointState::Starting)) {
            endpoints.remove(endpoint);
            drop(endpoints);
            if let Err(e) = self.store.delete(endpoint).await {
                error!(endpoint, err = %e, "failed to delete row of cancelled endpoint");
            }
            session.close().await;
            return Err(StreamError::StartCancelled(endpoint.to_string()));
        }
        endpoints.insert(endpoint.to_string(), EndpointState::Running(session.clone()));
        drop(endpoints);

        self.run_session(endpoint.to_string(), session);
        Ok(())
    }

    /// Deletes the row first so a restart cannot resurrect the endpoint,
    /// then closes its session. Stopping an unknown endpoint succeeds.
    pub async fn stop_endpoint(&self, endpoint: &str) -> Result<()> {
        if !self.store.delete(endpoint).await? {
            debug!(endpoint, "no stored row to delete");
        }

        let session = {
            let mut endpoints = self.endpoints.write().await;
            match endpoints.get(endpoint) {
                Some(EndpointState::Running(session)) => {
                    let session = session.clone();
                    endpoints.insert(endpoint.to_string(), EndpointState::Stopping);
                    Some(session)
                }
                Some(EndpointState::Starting) => {
                    endpoints.insert(endpoint.to_string(), EndpointState::Stopping);
                    None
                }
                Some(EndpointState::Stopping) | None => None,
            }
        };

        if let Some(session) = session {
            session.close().await;
            let mut endpoints = self.endpoints.write().await;
            if matches!(endpoints.get(endpoint), Some(EndpointState::Stopping)) {
                endpoints.remove(endpoint);
            }
        }
        Ok(())
    }

    /// Re-dials every stored endpoint. A row whose dial fails is deleted.
    pub async fn resume(self: &Arc<Self>) {
        match self.store.is_empty().await {
            Ok(true) => return,
            Ok(false) => {}
            Err(e) => {
                error!(err = %e, "failed to read stored endpoints");
                return;
            }
        }
        let rows = match self.store.list().await {
            Ok(rows) => rows,
            Err(e) => {
                error!(err = %e, "failed to read stored endpoints");
                return;
            }
        };
        info!(count = rows.len(), "resuming stored stream endpoints");

        let mut tasks = JoinSet::new();
        for row in rows {
            {
                let mut endpoints = self.endpoints.write().await;
                if endpoints.contains_key(&row.endpoint) {
                    continue;
                }
                endpoints.insert(row.endpoint.clone(), EndpointState::Starting);
            }
            let this = self.clone();
            tasks.spawn(async move { this.resume_endpoint(row).await });
        }
        while tasks.join_next().await.is_some() {}
    }

    async fn resume_endpoint(self: Arc<Self>, row: EndpointUrl) {
        let deadline = Duration::from_millis(self.config.start_timeout_ms);
        let dialed = match tokio::time::timeout(deadline, self.dialer.dial(&row.endpoint, &row.url)).await {
            Ok(dialed) => dialed,
            Err(_) => Err(StreamError::StartTimeout(row.endpoint.clone())),
        };
        let ws = match dialed {
            Ok(ws) => ws,
            Err(e) => {
                warn!(endpoint = %row.endpoint, err = %e, "dropping stored endpoint that could not be resumed");
                self.release(&row.endpoint).await;
                if let Err(e) = self.store.delete(&row.endpoint).await {
                    error!(endpoint = %row.endpoint, err = %e, "failed to delete stored endpoint");
                }
                return;
            }
        };
        let session = TunnelSession::new(
            row.endpoint.clone(),
            ws,
            self.store.clone(),
            self.config.session.clone(),
        );

        let mut endpoints = self.endpoints.write().await;
        if !matches!(endpoints.get(&row.endpoint), Some(EndpointState::Starting)) {
            endpoints.remove(&row.endpoint);
            drop(endpoints);
            session.close().await;
            return;
        }
        endpoints.insert(row.endpoint.clone(), EndpointState::Running(session.clone()));
        drop(endpoints);
        info!(endpoint = %row.endpoint, "stream endpoint resumed");
        self.run_session(row.endpoint, session);
    }

    /// Serves the session in the background. When it ends on its own the
    /// endpoint becomes absent but its row stays for the next boot.
    fn run_session(self: &Arc<Self>, endpoint: String, session: Arc<TunnelSession>) {
        let this = self.clone();
        tokio::spawn(async move {
            if let Err(e) = session.clone().serve().await {
                warn!(endpoint = %endpoint, err = %e, "tunnel session ended with error");
            }
            let mut endpoints = this.endpoints.write().await;
            let current = matches!(
                endpoints.get(&endpoint),
                Some(EndpointState::Running(s)) if Arc::ptr_eq(s, &session)
            );
            if current {
                endpoints.remove(&endpoint);
                warn!(endpoint = %endpoint, "tunnel session lost, endpoint is down until restarted");
            }
        });
    }

    async fn release(&self, endpoint: &str) {
        self.endpoints.write().await.remove(endpoint);
    }

    /// Closes every live session. Stored rows are kept.
    pub async fn close_all(&self) {
        let sessions: Vec<_> = self
            .endpoints
            .write()
            .await
            .drain()
            .filter_map(|(_, state)| match state {
                EndpointState::Running(session) => Some(session),
                _ => None,
            })
            .collect();
        for session in sessions {
            session.close().await;
        }
    }
}

#[async_trait]
impl Module for StreamRuleEndpoint {
    fn name(&self) -> &str {
        MODULE_NAME
    }

    fn groups(&self) -> Vec<String> {
        self.config.groups.clone()
    }

    fn enabled(&self) -> bool {
        self.config.enabled
    }

    async fn start(self: Arc<Self>, bus: Bus) {
        let resumer = self.clone();
        tokio::spawn(async move { resumer.resume().await });

        loop {
            let received = tokio::select! {
                _ = bus.done() => break,
                msg = bus.receive(MODULE_NAME) => msg,
            };
            match received {
                Ok(msg) => {
                    let this = self.clone();
                    let bus = bus.clone();
                    tokio::spawn(async move { this.handle_message(&bus, msg).await });
                }
                Err(e) => {
                    debug!(err = %e, "stream rule endpoint mailbox closed");
                    break;
                }
            }
        }

        self.close_all().await;
        info!("stream rule endpoint stopped");
    }
}
