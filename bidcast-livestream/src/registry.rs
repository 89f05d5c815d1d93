//! Stream registry: keyed map of active streams, publisher admission and
//! takeover, the fan-out transfer loop, and the background sweepers.

use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use bidcast_core::config::Config;
use bidcast_core::replay::ReplayIndex;
use bidcast_core::rooms::{EndpointRef, RoomPool};

use crate::recorder::{self, RecordTarget};
use crate::relay::RelayRegistry;
use crate::session::{spawn_viewer, PublisherConn, ViewerConn};
use crate::stream::Stream;

const SWEEP_PERIOD: Duration = Duration::from_secs(5);
const MUTE_POLL_PERIOD: Duration = Duration::from_secs(1);

pub struct StreamRegistry {
    streams: DashMap<String, Arc<Stream>>,
    rooms: Arc<RoomPool>,
    relay: Arc<RelayRegistry>,
    replay: Arc<ReplayIndex>,
    config: Arc<Config>,
}

impl StreamRegistry {
    #[must_use]
    pub fn new(
        config: Arc<Config>,
        rooms: Arc<RoomPool>,
        relay: Arc<RelayRegistry>,
        replay: Arc<ReplayIndex>,
    ) -> Arc<Self> {
        Arc::new(Self {
            streams: DashMap::new(),
            rooms,
            relay,
            replay,
            config,
        })
    }

    #[must_use]
    pub fn rooms(&self) -> &Arc<RoomPool> {
        &self.rooms
    }

    #[must_use]
    pub fn stream_count(&self) -> usize {
        self.streams.len()
    }

    #[must_use]
    pub fn get(&self, key: &str) -> Option<Arc<Stream>> {
        self.streams.get(key).map(|e| e.clone())
    }

    /// Attach a publisher to its stream, taking over any existing publisher
    /// for the same key. Admission has already matched `endpoint`.
    pub fn handle_publisher(self: &Arc<Self>, reader: PublisherConn, endpoint: &EndpointRef) {
        let key = reader.info.key.clone();
        info!(%key, uid = %reader.info.uid, "publisher attached");

        let stream = self.new_stream(&key, &reader.url, endpoint);
        if let Some(existing) = self.get(&key) {
            // New publisher for a live key: stop the old transfer, then
            // migrate its viewers so they replay the fresh cache from a
            // re-based clock.
            info!(%key, "publisher takeover, migrating viewers");
            existing.stop_transfer();
            existing.copy_viewers_to(&stream);
        }
        self.streams.insert(key.clone(), stream.clone());

        if self.config.recorder.is_enabled() {
            stream.set_recorder(recorder::start(RecordTarget {
                source_url: reader.url.clone(),
                save_path: endpoint.endpoint.save_path.clone(),
                room_id: endpoint.room_id.clone(),
                project_id: endpoint.project_id,
                video_name: endpoint.endpoint.video_name.clone(),
                ffmpeg_path: self.config.recorder.ffmpeg_path.clone(),
            }));
        }

        stream.attach_reader(&reader);
        self.exec_hooks(&self.config.hooks.exec_push, &key);
        tokio::spawn(run_transfer(self.clone(), stream, reader));
    }

    /// Register a viewer, creating the stream entry if the publisher has not
    /// arrived yet. Spawns the viewer's send/check tasks and its mute poller.
    pub fn handle_viewer(&self, conn: ViewerConn, endpoint: &EndpointRef) {
        let key = conn.info.key.clone();
        info!(%key, uid = %conn.info.uid, "viewer attached");

        let stream = self
            .streams
            .entry(key.clone())
            .or_insert_with(|| self.new_stream(&key, &conn.url, endpoint))
            .clone();

        let viewer = Arc::new(spawn_viewer(conn));
        viewer.set_muted(endpoint.endpoint.limit_audio);
        self.spawn_mute_poller(&viewer, endpoint.project_id, endpoint.endpoint.push_id);
        stream.add_writer(viewer);
    }

    fn new_stream(&self, key: &str, url: &str, endpoint: &EndpointRef) -> Arc<Stream> {
        Arc::new(Stream::new(
            key.to_string(),
            url.to_string(),
            endpoint.room_id.clone(),
            endpoint.endpoint.push_id,
        ))
    }

    /// The mute flag lives in the control plane but is read per packet in
    /// the data plane; each viewer polls it coarsely and caches the value.
    fn spawn_mute_poller(
        &self,
        viewer: &Arc<crate::session::ViewerHandle>,
        project_id: i64,
        push_id: i32,
    ) {
        let rooms = self.rooms.clone();
        let viewer = viewer.clone();
        let done = viewer.done();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(MUTE_POLL_PERIOD);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Ok(limit) = rooms.limit_audio(project_id, push_id) {
                            viewer.set_muted(limit);
                        }
                    }
                    () = done.cancelled() => break,
                }
            }
        });
    }

    /// Force-close the streams bound to the given push URLs (project stop).
    pub fn close_streams_for_urls(&self, urls: &[String]) {
        let targets: Vec<Arc<Stream>> = self
            .streams
            .iter()
            .filter(|e| urls.contains(&e.value().url))
            .map(|e| e.value().clone())
            .collect();
        for stream in targets {
            info!(key = %stream.key, "force closing stream");
            stream.stop_transfer();
            stream.close_viewers("force closed");
        }
    }

    /// Transfer-loop teardown: relay, recorder, registry entry, hooks, and
    /// any viewers still attached.
    fn close_stream(&self, stream: &Arc<Stream>) {
        self.relay.stop_for(&stream.url);
        stream.stop_recorder();
        self.streams
            .remove_if(&stream.key, |_, v| Arc::ptr_eq(v, stream));
        self.exec_hooks(&self.config.hooks.exec_push_done, &stream.key);
        stream.close_viewers("closed");
        info!(key = %stream.key, "stream closed");
    }

    fn exec_hooks(&self, commands: &[String], key: &str) {
        for command in commands {
            let line = format!("{command} -k {key}");
            tokio::spawn(async move {
                debug!(%line, "running hook");
                match tokio::process::Command::new("/bin/sh")
                    .arg("-c")
                    .arg(&line)
                    .output()
                    .await
                {
                    Ok(output) if !output.status.success() => {
                        warn!(%line, status = ?output.status, "hook failed");
                    }
                    Ok(_) => {}
                    Err(err) => warn!(%line, %err, "hook did not run"),
                }
            });
        }
    }

    /// Spawn the liveness sweeper and the replay sweeper.
    pub fn spawn_sweepers(self: &Arc<Self>, cancel: &CancellationToken) {
        let registry = self.clone();
        let liveness_cancel = cancel.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(SWEEP_PERIOD);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => registry.sweep_liveness(),
                    () = liveness_cancel.cancelled() => break,
                }
            }
        });

        bidcast_core::replay::spawn_sweeper(self.replay.clone(), SWEEP_PERIOD, cancel.clone());
    }

    fn sweep_liveness(&self) {
        let snapshot: Vec<Arc<Stream>> = self.streams.iter().map(|e| e.value().clone()).collect();
        for stream in snapshot {
            if let Some(stats) = stream.reader_stats() {
                info!(
                    url = %stream.url,
                    viewers = stream.viewer_count(),
                    video_kbps = stats.video_kbps,
                    audio_kbps = stats.audio_kbps,
                    "publisher status"
                );
            }
            if stream.check_alive() == 0 {
                info!(key = %stream.key, "stream has no live endpoints, evicting");
                stream.stop_recorder();
                stream.stop_transfer();
                self.streams
                    .remove_if(&stream.key, |_, v| Arc::ptr_eq(v, &stream));
            }
        }
    }
}

/// The fan-out loop: one packet from the publisher, relayed upstream,
/// cached, then written to every viewer's bounded queue. A slow or broken
/// viewer is shed; the publisher is never blocked.
pub async fn run_transfer(
    registry: Arc<StreamRegistry>,
    stream: Arc<Stream>,
    mut reader: PublisherConn,
) {
    info!(key = %stream.key, "transfer started");
    registry.relay.start_for(&reader.url);

    loop {
        let packet = tokio::select! {
            result = reader.read_packet() => match result {
                Ok(packet) => packet,
                Err(err) => {
                    warn!(key = %stream.key, %err, "publisher read ended");
                    break;
                }
            },
            () = stream.stopped() => {
                info!(key = %stream.key, "transfer interrupted: stop old");
                break;
            }
        };

        registry.relay.forward(&reader.url, &packet);
        stream.broadcast(&packet);
    }

    stream.set_stopped();
    registry.close_stream(&stream);
}
