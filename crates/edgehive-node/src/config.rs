use anyhow::Context;
use edgehive_protocol::paths;
use edgehive_stream::EndpointConfig;
use libedgehive::{BusConfig, ModuleDescriptor, PeerConfig, SocketConfig, Transport};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

#[derive(Serialize, Deserialize, Debug, Clone, Default)]
#[serde(default)]
pub struct NodeConfig {
    pub state_dir: Option<PathBuf>,
    pub bus: BusConfig,
    pub socket: SocketConfig,
    /// Bus addresses accepting peer connections.
    pub listen: Vec<Transport>,
    pub peers: Vec<PeerConfig>,
    pub remote_modules: Vec<ModuleDescriptor>,
    pub stream: EndpointConfig,
}

impl NodeConfig {
    /// Reads `path` (or the default config file). A missing file yields the
    /// defaults; an unreadable or malformed one is an error.
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        let path = path.map(Path::to_path_buf).unwrap_or_else(paths::config_path);
        if !path.exists() {
            tracing::debug!(path = %path.display(), "no config file, using defaults");
            return Ok(Self::default());
        }
        let contents = std::fs::read_to_string(&path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        toml::from_str(&contents).with_context(|| format!("failed to parse {}", path.display()))
    }

    /// Applies `EDGEHIVE_*` overrides from `lookup`.
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(server) = lookup("EDGEHIVE_TUNNEL_SERVER") {
            self.stream.dialer.server = server;
        }
        if let Some(name) = lookup("EDGEHIVE_NODE_NAME") {
            self.socket.node_name = name;
        }
        if let Some(dir) = lookup("EDGEHIVE_STATE_DIR") {
            self.state_dir = Some(PathBuf::from(dir));
        }
        // Tunnel and bus links share one identity.
        for tls in [&mut self.stream.dialer.tls, &mut self.socket.tls] {
            if let Some(cert) = lookup("EDGEHIVE_TLS_CERT") {
                tls.cert_file = Some(PathBuf::from(cert));
            }
            if let Some(key) = lookup("EDGEHIVE_TLS_KEY") {
                tls.key_file = Some(PathBuf::from(key));
            }
            if let Some(ca) = lookup("EDGEHIVE_TLS_CA") {
                tls.ca_file = Some(PathBuf::from(ca));
            }
        }
        if let Some(flag) = lookup("EDGEHIVE_INSECURE_SKIP_VERIFY") {
            self.stream.dialer.tls.insecure_skip_verify =
                matches!(flag.to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on");
        }
    }

    pub fn state_dir(&self) -> PathBuf {
        self.state_dir.clone().unwrap_or_else(paths::default_state_dir)
    }
}
