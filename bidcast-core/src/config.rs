use config::{Config as ConfigBuilder, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::error::Result;
use crate::rooms::{UserType, VideoType};

/// Top-level server configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub recorder: RecorderConfig,
    pub relay: RelayConfig,
    pub hooks: HooksConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    /// RTMP listen port; also the port baked into allocated push URLs.
    pub rtmp_port: u16,
    /// HTTP control API port.
    pub http_port: u16,
    /// When true, allocated push URLs omit the date segment.
    pub static_addr: bool,
    pub chunk_size: usize,
    /// Publisher inactivity timeout in seconds.
    pub read_timeout_secs: u64,
    /// Viewer inactivity timeout in seconds.
    pub write_timeout_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            rtmp_port: 1935,
            http_port: 8090,
            static_addr: false,
            chunk_size: 4096,
            read_timeout_secs: 10,
            write_timeout_secs: 10,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RecorderConfig {
    /// Recording is active only when this equals "enable".
    pub engine_enable: String,
    pub ffmpeg_path: String,
}

impl Default for RecorderConfig {
    fn default() -> Self {
        Self {
            engine_enable: "disable".to_string(),
            ffmpeg_path: "/usr/bin/ffmpeg".to_string(),
        }
    }
}

impl RecorderConfig {
    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.engine_enable.eq_ignore_ascii_case("enable")
    }
}

/// Upstream relay rules. A publisher URL whose app/stream part contains
/// `master_prefix` is pushed to `upstream`; a URL matching `sub_prefix` is
/// multiplexed into its master's relay instead of opening its own.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    pub static_push: Vec<StaticPushRule>,
    pub sub_static_push: Vec<SubStaticPushRule>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StaticPushRule {
    pub master_prefix: String,
    pub upstream: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubStaticPushRule {
    pub master_prefix: String,
    pub sub_prefix: String,
}

impl RelayConfig {
    #[must_use]
    pub fn static_push_enabled(&self) -> bool {
        !self.static_push.is_empty()
    }

    #[must_use]
    pub fn sub_static_push_enabled(&self) -> bool {
        !self.sub_static_push.is_empty()
    }
}

/// External commands executed with `-k <stream key>` on publish start and
/// on stream close.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct HooksConfig {
    pub exec_push: Vec<String>,
    pub exec_push_done: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    /// "json" or "pretty".
    pub format: String,
    pub file_path: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
            file_path: None,
        }
    }
}

impl Config {
    /// Load configuration from a JSON file, with `BIDCAST_*` environment
    /// variables taking precedence (e.g. `BIDCAST_SERVER__RTMP_PORT=1936`).
    pub fn load(path: &Path) -> Result<Self> {
        let settings = ConfigBuilder::builder()
            .add_source(File::from(path))
            .add_source(Environment::with_prefix("BIDCAST").separator("__"))
            .build()?;
        Ok(settings.try_deserialize()?)
    }
}

/// Static room-pool declarations, loaded once at startup.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RoomsConfig {
    pub rooms: Vec<RoomDecl>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoomDecl {
    #[serde(rename = "roomId")]
    pub room_id: String,
    pub endpoints: Vec<EndpointDecl>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EndpointDecl {
    pub push_id: i32,
    pub user_type: UserType,
    pub video_type: VideoType,
    /// Host prefix for allocated push URLs, e.g. `rtmp://10.0.0.5`.
    pub base_url: String,
    /// Filesystem root for recordings made from this endpoint.
    pub save_path: String,
    /// Recording file prefix.
    pub video_name: String,
    /// URL root under which recordings are exposed for replay.
    pub save_url: String,
    /// Webhook notified on project start/stop.
    pub request_url: String,
}

impl RoomsConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&data)?)
    }
}
