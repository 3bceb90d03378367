mod config;

use anyhow::{Context, Result};
use clap::Parser;
use config::NodeConfig;
use edgehive_protocol::paths::database_path;
use edgehive_stream::{StreamRuleEndpoint, UrlStore};
use libedgehive::{Bus, Dispatcher, PeerConfig, PeerHandle, Transport};
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Parser, Debug)]
#[command(author, version, about = "edgehive edge node daemon")]
struct Args {
    /// Config file (default: ~/.config/edgehive/config.toml).
    #[arg(long)]
    config: Option<PathBuf>,

    /// State directory for the endpoint database.
    #[arg(long)]
    state_dir: Option<PathBuf>,

    /// Accept bus peers on this address, e.g. tcp://0.0.0.0:7000 (can be repeated).
    #[arg(long)]
    listen: Vec<Transport>,

    /// Peer bus to keep connected, as name=tcp://host:port (can be repeated).
    #[arg(long, value_parser = parse_peer)]
    peer: Vec<PeerConfig>,
}

fn parse_peer(s: &str) -> std::result::Result<PeerConfig, String> {
    let (name, transport) = s
        .split_once('=')
        .ok_or_else(|| format!("expected name=transport, got {s:?}"))?;
    let transport = transport.parse::<Transport>().map_err(|e| e.to_string())?;
    Ok(PeerConfig {
        name: name.to_string(),
        transport,
    })
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                "edgehive_node=info,libedgehive=info,edgehive_stream=info".into()
            }),
        )
        .init();

    let args = Args::parse();

    let mut config = NodeConfig::load(args.config.as_deref())?;
    config.apply_env(|key| std::env::var(key).ok());
    if let Some(dir) = args.state_dir {
        config.state_dir = Some(dir);
    }
    config.listen.extend(args.listen);
    config.peers.extend(args.peer);

    let state_dir = config.state_dir();
    std::fs::create_dir_all(&state_dir)
        .with_context(|| format!("failed to create {}", state_dir.display()))?;
    let store = UrlStore::open(&database_path(&state_dir)).context("failed to open endpoint store")?;

    let bus = Bus::new(config.bus.clone(), config.socket.clone());
    let mut dispatcher = Dispatcher::new(bus.clone());

    let endpoint = StreamRuleEndpoint::new(config.stream.clone(), store)
        .context("failed to set up stream rule endpoint")?;
    dispatcher.register(Arc::new(endpoint));
    for descriptor in config.remote_modules.iter().cloned() {
        dispatcher.register_remote(descriptor);
    }

    for transport in &config.listen {
        let addr = bus
            .listen(transport)
            .await
            .with_context(|| format!("failed to listen on {transport}"))?;
        tracing::info!(%addr, "bus listening");
    }
    let peers: Vec<PeerHandle> = config
        .peers
        .iter()
        .cloned()
        .map(|peer| bus.connect_peer(peer))
        .collect();

    dispatcher.start_all().await.context("failed to start modules")?;
    tracing::info!(
        node = %config.socket.node_name,
        state_dir = %state_dir.display(),
        modules = ?dispatcher.running(),
        "edgehive node started"
    );

    tokio::signal::ctrl_c()
        .await
        .context("failed to wait for SIGINT")?;
    tracing::info!("received SIGINT, shutting down");

    for peer in &peers {
        peer.abort();
    }
    dispatcher.shutdown().await;
    tracing::info!("edgehive-node shut down");
    Ok(())
}
