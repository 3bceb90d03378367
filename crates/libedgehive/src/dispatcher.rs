use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::bus::Bus;
use crate::error::Result;
use crate::socket::{PeerConfig, PeerHandle, Transport};

/// A unit of behaviour living on the bus. `start` owns the module's
/// receive loop and should return once `bus.done()` fires or its mailbox
/// closes.
#[async_trait]
pub trait Module: Send + Sync + 'static {
    fn name(&self) -> &str;

    fn groups(&self) -> Vec<String> {
        Vec::new()
    }

    fn enabled(&self) -> bool {
        true
    }

    async fn start(self: Arc<Self>, bus: Bus);
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModuleDescriptor {
    pub name: String,
    #[serde(default)]
    pub groups: Vec<String>,
    #[serde(default)]
    pub remote: bool,
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Peer that hosts a remote module.
    #[serde(default)]
    pub transport: Option<Transport>,
}

impl ModuleDescriptor {
    fn of(module: &dyn Module) -> Self {
        Self {
            name: module.name().to_string(),
            groups: module.groups(),
            remote: false,
            enabled: module.enabled(),
            transport: None,
        }
    }
}

/// Registers modules, starts them in registration order and tears them
/// down in reverse.
pub struct Dispatcher {
    bus: Bus,
    local: Vec<Arc<dyn Module>>,
    remote: Vec<ModuleDescriptor>,
    running: Vec<(String, JoinHandle<()>)>,
    peers: Vec<PeerHandle>,
    shutdown_grace: Duration,
}

impl Dispatcher {
    pub fn new(bus: Bus) -> Self {
        Self {
            bus,
            local: Vec::new(),
            remote: Vec::new(),
            running: Vec::new(),
            peers: Vec::new(),
            shutdown_grace: Duration::from_secs(5),
        }
    }

    pub fn with_shutdown_grace(mut self, grace: Duration) -> Self {
        self.shutdown_grace = grace;
        self
    }

    pub fn bus(&self) -> &Bus {
        &self.bus
    }

    fn is_registered(&self, name: &str) -> bool {
        self.local.iter().any(|m| m.name() == name) || self.remote.iter().any(|d| d.name == name)
    }

    /// Returns false if a module with the same name is already registered.
    pub fn register(&mut self, module: Arc<dyn Module>) -> bool {
        if self.is_registered(module.name()) {
            warn!(module = module.name(), "module already registered");
            return false;
        }
        self.local.push(module);
        true
    }

    pub fn register_remote(&mut self, mut descriptor: ModuleDescriptor) -> bool {
        if self.is_registered(&descriptor.name) {
            warn!(module = %descriptor.name, "module already registered");
            return false;
        }
        descriptor.remote = true;
        self.remote.push(descriptor);
        true
    }

    pub fn descriptors(&self) -> Vec<ModuleDescriptor> {
        self.local
            .iter()
            .map(|m| ModuleDescriptor::of(m.as_ref()))
            .chain(self.remote.iter().cloned())
            .collect()
    }

    /// Creates every enabled module's mailbox and groups, connects to the
    /// peers of remote modules, then spawns each local module.
    pub async fn start_all(&mut self) -> Result<()> {
        let enabled: Vec<_> = self
            .local
            .iter()
            .filter(|m| {
                if !m.enabled() {
                    info!(module = m.name(), "module disabled");
                }
                m.enabled()
            })
            .cloned()
            .collect();

        for module in &enabled {
            self.bus.add_module(module.name()).await;
            for group in module.groups() {
                self.bus.add_module_group(module.name(), &group).await?;
            }
        }

        let mut dialed: Vec<&Transport> = Vec::new();
        for descriptor in self.remote.iter().filter(|d| d.enabled) {
            let Some(transport) = &descriptor.transport else {
                continue;
            };
            if dialed.contains(&transport) {
                continue;
            }
            dialed.push(transport);
            self.peers.push(self.bus.connect_peer(PeerConfig {
                name: descriptor.name.clone(),
                transport: transport.clone(),
            }));
        }

        for module in enabled {
            let name = module.name().to_string();
            info!(module = %name, "starting module");
            let handle = tokio::spawn(module.start(self.bus.clone()));
            self.running.push((name, handle));
        }
        Ok(())
    }

    pub fn running(&self) -> Vec<&str> {
        self.running.iter().map(|(name, _)| name.as_str()).collect()
    }

    /// Fires the bus's done signal, cleans modules up in reverse start order
    /// and waits for their tasks.
    pub async fn shutdown(self) {
        self.bus.shutdown().await;
        for (name, _) in self.running.iter().rev() {
            self.bus.cleanup(name).await;
        }
        for peer in &self.peers {
            peer.abort();
        }
        for (name, mut handle) in self.running.into_iter().rev() {
            match tokio::time::timeout(self.shutdown_grace, &mut handle).await {
                Ok(Ok(())) => info!(module = %name, "module stopped"),
                Ok(Err(e)) => warn!(module = %name, error = %e, "module task failed"),
                Err(_) => {
                    warn!(module = %name, "module did not stop in time, aborting");
                    handle.abort();
                }
            }
        }
    }
}
