//! Shared server context: every long-lived component, built once at startup
//! and passed to the listeners and the control API. No module-level state.

use std::sync::Arc;

use bidcast_core::config::Config;
use bidcast_core::replay::ReplayIndex;
use bidcast_core::rooms::RoomPool;

use crate::registry::StreamRegistry;
use crate::relay::RelayRegistry;

#[derive(Clone)]
pub struct ServerContext {
    pub config: Arc<Config>,
    pub rooms: Arc<RoomPool>,
    pub replay: Arc<ReplayIndex>,
    pub relay: Arc<RelayRegistry>,
    pub registry: Arc<StreamRegistry>,
}

impl ServerContext {
    #[must_use]
    pub fn new(
        config: Arc<Config>,
        rooms: Arc<RoomPool>,
        replay: Arc<ReplayIndex>,
        relay: Arc<RelayRegistry>,
        registry: Arc<StreamRegistry>,
    ) -> Self {
        Self {
            config,
            rooms,
            replay,
            relay,
            registry,
        }
    }
}
