//! Upstream relay adapter.
//!
//! Publisher URLs are resolved against configured master prefixes to a list
//! of upstream push URLs; sub-streams are multiplexed into their master's
//! relay with a per-sub stream index. Relay objects are reference-counted
//! through the registry so concurrent streams sharing an upstream reuse one
//! connection. The upstream transport itself sits behind [`RelaySink`].

use dashmap::DashMap;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tracing::{debug, info, warn};

use bidcast_core::config::RelayConfig;

use crate::packet::Packet;

/// A packet addressed to an upstream, with the sub-stream index used for
/// multiplexed masters (0 for the master's own stream).
#[derive(Debug, Clone)]
pub struct RelayFrame {
    pub stream_index: u32,
    pub packet: Packet,
}

/// Upstream transport contract. Dialing and chunk encoding live outside this
/// crate; tests plug in a channel-backed sink.
pub trait RelaySink: Send + Sync {
    fn start(&self, upstream_url: &str) -> anyhow::Result<()>;
    fn stop(&self, upstream_url: &str);
    fn write_av_packet(&self, upstream_url: &str, frame: RelayFrame);
}

/// Sink used when no upstream transport is wired in; drops frames.
#[derive(Default)]
pub struct NullRelaySink;

impl RelaySink for NullRelaySink {
    fn start(&self, upstream_url: &str) -> anyhow::Result<()> {
        info!(upstream = %upstream_url, "relay started (null sink)");
        Ok(())
    }

    fn stop(&self, upstream_url: &str) {
        info!(upstream = %upstream_url, "relay stopped (null sink)");
    }

    fn write_av_packet(&self, _upstream_url: &str, _frame: RelayFrame) {}
}

/// One upstream push connection, shared by its master stream and any
/// sub-streams multiplexed into it.
pub struct RelayPush {
    pub upstream_url: String,
    sink: Arc<dyn RelaySink>,
    started: AtomicBool,
    sub_indexes: Mutex<HashMap<String, u32>>,
}

impl RelayPush {
    fn new(upstream_url: String, sink: Arc<dyn RelaySink>) -> Self {
        Self {
            upstream_url,
            sink,
            started: AtomicBool::new(false),
            sub_indexes: Mutex::new(HashMap::new()),
        }
    }

    pub fn start(&self) -> anyhow::Result<()> {
        if !self.started.swap(true, Ordering::SeqCst) {
            self.sink.start(&self.upstream_url)?;
        }
        Ok(())
    }

    pub fn stop(&self) {
        if self.started.swap(false, Ordering::SeqCst) {
            self.sink.stop(&self.upstream_url);
        }
    }

    pub fn write_av_packet(&self, frame: RelayFrame) {
        self.sink.write_av_packet(&self.upstream_url, frame);
    }

    /// Register a sub-stream and assign its multiplexing index (1-based,
    /// in registration order). Idempotent per URL.
    pub fn start_sub_url(&self, sub_url: &str) -> u32 {
        let mut subs = self.sub_indexes.lock().unwrap();
        if let Some(index) = subs.get(sub_url) {
            return *index;
        }
        let index = subs.len() as u32 + 1;
        subs.insert(sub_url.to_string(), index);
        debug!(sub = %sub_url, index, upstream = %self.upstream_url, "sub-stream registered");
        index
    }

    pub fn stop_sub_url(&self, sub_url: &str) {
        self.sub_indexes.lock().unwrap().remove(sub_url);
    }

    #[must_use]
    pub fn sub_index(&self, sub_url: &str) -> Option<u32> {
        self.sub_indexes.lock().unwrap().get(sub_url).copied()
    }
}

struct RelayEntry {
    refs: usize,
    object: Arc<RelayPush>,
}

/// Process-wide relay registry, owned by the server context.
pub struct RelayRegistry {
    config: RelayConfig,
    sink: Arc<dyn RelaySink>,
    objects: DashMap<String, RelayEntry>,
}

impl RelayRegistry {
    #[must_use]
    pub fn new(config: RelayConfig, sink: Arc<dyn RelaySink>) -> Self {
        Self {
            config,
            sink,
            objects: DashMap::new(),
        }
    }

    /// Get or create the relay object for an upstream, taking a reference.
    pub fn get_or_create(&self, upstream_url: &str) -> Arc<RelayPush> {
        let mut entry = self
            .objects
            .entry(upstream_url.to_string())
            .or_insert_with(|| RelayEntry {
                refs: 0,
                object: Arc::new(RelayPush::new(upstream_url.to_string(), self.sink.clone())),
            });
        entry.refs += 1;
        entry.object.clone()
    }

    #[must_use]
    pub fn get(&self, upstream_url: &str) -> Option<Arc<RelayPush>> {
        self.objects.get(upstream_url).map(|e| e.object.clone())
    }

    /// Drop one reference; the object is removed and stopped at zero.
    pub fn release(&self, upstream_url: &str) {
        let remove = {
            let Some(mut entry) = self.objects.get_mut(upstream_url) else {
                return;
            };
            entry.refs = entry.refs.saturating_sub(1);
            entry.refs == 0
        };
        if remove {
            if let Some((_, entry)) = self.objects.remove(upstream_url) {
                entry.object.stop();
            }
        }
    }

    /// Upstream URLs a publisher URL is statically pushed to.
    #[must_use]
    pub fn static_push_urls(&self, publish_url: &str) -> Vec<String> {
        if !self.config.static_push_enabled() {
            return Vec::new();
        }
        let Some(part) = app_stream_part(publish_url) else {
            return Vec::new();
        };
        self.config
            .static_push
            .iter()
            .filter(|rule| part.contains(rule.master_prefix.as_str()))
            .map(|rule| {
                let tail = part.split_once('/').map_or(part, |(_, tail)| tail);
                format!("{}/{}", rule.upstream, tail)
            })
            .collect()
    }

    /// The master upstream a sub-stream URL multiplexes into, if any.
    #[must_use]
    pub fn sub_master_upstream(&self, publish_url: &str) -> Option<String> {
        if !self.config.sub_static_push_enabled() {
            return None;
        }
        let part = app_stream_part(publish_url)?;
        let master_prefix = self
            .config
            .sub_static_push
            .iter()
            .find(|rule| part.contains(rule.sub_prefix.as_str()))
            .map(|rule| rule.master_prefix.clone())?;
        self.config
            .static_push
            .iter()
            .find(|rule| rule.master_prefix == master_prefix)
            .map(|rule| {
                let tail = master_prefix
                    .split_once('/')
                    .map_or(master_prefix.as_str(), |(_, tail)| tail);
                format!("{}/{}", rule.upstream, tail)
            })
    }

    /// Resolve a sub-stream to `(index, master relay)`. The master relay
    /// must already exist and the sub-stream must have been registered.
    #[must_use]
    pub fn sub_static_master(&self, publish_url: &str) -> Option<(u32, Arc<RelayPush>)> {
        let upstream = self.sub_master_upstream(publish_url)?;
        let object = self.get(&upstream)?;
        let index = object.sub_index(publish_url)?;
        Some((index, object))
    }

    /// Begin relaying a publisher: direct static push if configured, else
    /// sub-stream registration into the master. Returns true when a direct
    /// static push started.
    pub fn start_for(&self, publish_url: &str) -> bool {
        let upstreams = self.static_push_urls(publish_url);
        if !upstreams.is_empty() {
            let mut started = false;
            for upstream in &upstreams {
                let object = self.get_or_create(upstream);
                match object.start() {
                    Ok(()) => started = true,
                    Err(err) => warn!(%upstream, %err, "static push start failed"),
                }
            }
            return started;
        }

        if let Some(upstream) = self.sub_master_upstream(publish_url) {
            if let Some(master) = self.get(&upstream) {
                master.start_sub_url(publish_url);
            } else {
                debug!(%upstream, "sub-stream master relay not active yet");
            }
        }
        false
    }

    /// Forward one live packet along whatever relay mapping exists.
    pub fn forward(&self, publish_url: &str, packet: &Packet) {
        let upstreams = self.static_push_urls(publish_url);
        if !upstreams.is_empty() {
            for upstream in &upstreams {
                if let Some(object) = self.get(upstream) {
                    object.write_av_packet(RelayFrame {
                        stream_index: 0,
                        packet: packet.clone(),
                    });
                }
            }
            return;
        }
        if let Some((index, master)) = self.sub_static_master(publish_url) {
            master.write_av_packet(RelayFrame {
                stream_index: index,
                packet: packet.clone(),
            });
        }
    }

    /// Tear down relaying for a publisher.
    pub fn stop_for(&self, publish_url: &str) {
        let upstreams = self.static_push_urls(publish_url);
        if !upstreams.is_empty() {
            for upstream in &upstreams {
                if let Some(object) = self.get(upstream) {
                    object.stop();
                }
                self.release(upstream);
            }
            return;
        }
        if let Some((_, master)) = self.sub_static_master(publish_url) {
            master.stop_sub_url(publish_url);
        }
    }
}

/// The `app/stream` part of an RTMP URL (everything after `host[:port]/`).
fn app_stream_part(url: &str) -> Option<&str> {
    let rest = url.split_once("://").map_or(url, |(_, rest)| rest);
    rest.split_once('/').map(|(_, part)| part)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::test_support::*;
    use bidcast_core::config::{StaticPushRule, SubStaticPushRule};
    use std::sync::Mutex as StdMutex;

    #[derive(Default)]
    struct RecordingSink {
        started: StdMutex<Vec<String>>,
        stopped: StdMutex<Vec<String>>,
        frames: StdMutex<Vec<(String, u32)>>,
    }

    impl RelaySink for RecordingSink {
        fn start(&self, upstream_url: &str) -> anyhow::Result<()> {
            self.started.lock().unwrap().push(upstream_url.to_string());
            Ok(())
        }

        fn stop(&self, upstream_url: &str) {
            self.stopped.lock().unwrap().push(upstream_url.to_string());
        }

        fn write_av_packet(&self, upstream_url: &str, frame: RelayFrame) {
            self.frames
                .lock()
                .unwrap()
                .push((upstream_url.to_string(), frame.stream_index));
        }
    }

    fn relay_config() -> RelayConfig {
        RelayConfig {
            static_push: vec![StaticPushRule {
                master_prefix: "live/R1".to_string(),
                upstream: "rtmp://upstream/live".to_string(),
            }],
            sub_static_push: vec![SubStaticPushRule {
                master_prefix: "live/R1".to_string(),
                sub_prefix: "live/R2".to_string(),
            }],
        }
    }

    #[test]
    fn resolves_static_push_urls() {
        let registry = RelayRegistry::new(relay_config(), Arc::new(NullRelaySink));
        let urls = registry.static_push_urls("rtmp://h:1935/live/R1/20240101/12/Camera_1");
        assert_eq!(urls, vec!["rtmp://upstream/live/R1/20240101/12/Camera_1"]);

        assert!(registry
            .static_push_urls("rtmp://h:1935/live/R9/20240101/12/Camera_1")
            .is_empty());
    }

    #[test]
    fn resolves_sub_master_upstream() {
        let registry = RelayRegistry::new(relay_config(), Arc::new(NullRelaySink));
        let upstream = registry
            .sub_master_upstream("rtmp://h:1935/live/R2/20240101/12/Camera_1")
            .unwrap();
        assert_eq!(upstream, "rtmp://upstream/live/R1");
    }

    #[test]
    fn refcounted_lifetime() {
        let sink = Arc::new(RecordingSink::default());
        let registry = RelayRegistry::new(relay_config(), sink.clone());

        let a = registry.get_or_create("rtmp://upstream/live/x");
        let b = registry.get_or_create("rtmp://upstream/live/x");
        assert!(Arc::ptr_eq(&a, &b));
        a.start().unwrap();

        registry.release("rtmp://upstream/live/x");
        assert!(registry.get("rtmp://upstream/live/x").is_some());
        registry.release("rtmp://upstream/live/x");
        assert!(registry.get("rtmp://upstream/live/x").is_none());
        assert_eq!(sink.stopped.lock().unwrap().len(), 1);
    }

    #[test]
    fn start_is_idempotent() {
        let sink = Arc::new(RecordingSink::default());
        let registry = RelayRegistry::new(relay_config(), sink.clone());
        let object = registry.get_or_create("rtmp://upstream/live/y");
        object.start().unwrap();
        object.start().unwrap();
        assert_eq!(sink.started.lock().unwrap().len(), 1);
    }

    #[test]
    fn forwards_master_and_sub_frames() {
        let sink = Arc::new(RecordingSink::default());
        let registry = RelayRegistry::new(relay_config(), sink.clone());

        // The master stream's URL path is exactly the configured master
        // prefix, so its upstream key matches the sub-stream resolution.
        let master_url = "rtmp://h:1935/live/R1";
        let sub_url = "rtmp://h:1935/live/R2/12/Camera_1";

        assert!(registry.start_for(master_url));
        registry.start_for(sub_url);
        registry.forward(master_url, &key_frame(0));
        registry.forward(sub_url, &key_frame(10));

        let frames = sink.frames.lock().unwrap();
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0], ("rtmp://upstream/live/R1".to_string(), 0));
        assert_eq!(frames[1], ("rtmp://upstream/live/R1".to_string(), 1));
    }

    #[test]
    fn stop_for_releases_master() {
        let sink = Arc::new(RecordingSink::default());
        let registry = RelayRegistry::new(relay_config(), sink.clone());
        let master_url = "rtmp://h:1935/live/R1";

        registry.start_for(master_url);
        registry.stop_for(master_url);
        assert!(registry.get("rtmp://upstream/live/R1").is_none());
        assert_eq!(sink.stopped.lock().unwrap().len(), 1);
    }
}
