mod server;

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::info;

use bidcast_core::config::{Config, RoomsConfig};
use bidcast_core::logging;
use bidcast_core::replay::ReplayIndex;
use bidcast_core::rooms::RoomPool;
use bidcast_livestream::relay::{NullRelaySink, RelayRegistry};
use bidcast_livestream::{ServerContext, StreamRegistry};

use server::BidcastServer;

const REPLAY_CACHE_FILE: &str = "replay.json";

#[tokio::main]
async fn main() -> Result<()> {
    let mut args = std::env::args().skip(1);
    let config_path = args
        .next()
        .unwrap_or_else(|| "config/bidcast.json".to_string());
    let rooms_path = args
        .next()
        .unwrap_or_else(|| "config/rooms.json".to_string());

    let config = Config::load(Path::new(&config_path))
        .with_context(|| format!("loading server config {config_path}"))?;
    logging::init_logging(&config.logging)?;
    info!(%config_path, %rooms_path, "bidcast starting");

    let rooms_config = RoomsConfig::load(Path::new(&rooms_path))
        .with_context(|| format!("loading room pool config {rooms_path}"))?;

    let config = Arc::new(config);
    let rooms = Arc::new(RoomPool::new(&rooms_config));
    let replay = Arc::new(ReplayIndex::load(PathBuf::from(REPLAY_CACHE_FILE)));
    let relay = Arc::new(RelayRegistry::new(
        config.relay.clone(),
        Arc::new(NullRelaySink),
    ));
    let registry = StreamRegistry::new(config.clone(), rooms.clone(), relay.clone(), replay.clone());
    let ctx = ServerContext::new(config, rooms, replay, relay, registry);

    let cancel = CancellationToken::new();
    let shutdown = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("shutdown requested");
            shutdown.cancel();
        }
    });

    BidcastServer::new(ctx).run(cancel).await
}
