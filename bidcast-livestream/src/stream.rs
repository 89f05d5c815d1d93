//! Per-stream state: one exclusive publisher slot, a concurrent viewer map,
//! the late-join cache and the recorder handle. The transfer loop itself
//! lives in the registry, which owns stream lifecycle.

use dashmap::DashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::cache::StreamCache;
use crate::recorder::RecorderHandle;
use crate::session::{BandwidthSnapshot, BandwidthStats, Liveness, PublisherConn, ViewerHandle};

pub struct ViewerSlot {
    /// False until the cache prefix has been delivered.
    pub init: bool,
    pub viewer: Arc<ViewerHandle>,
}

pub struct Stream {
    /// Registry key: the URL path of the publish endpoint.
    pub key: String,
    /// Canonical push URL the endpoint was allocated under.
    pub url: String,
    pub room_id: String,
    pub push_id: i32,

    running: AtomicBool,
    stop: CancellationToken,
    reader_uid: Mutex<Option<String>>,
    reader_liveness: Mutex<Option<Arc<Liveness>>>,
    reader_stats: Mutex<Option<Arc<BandwidthStats>>>,
    pub(crate) viewers: DashMap<String, ViewerSlot>,
    pub(crate) cache: Mutex<StreamCache>,
    recorder: Mutex<Option<RecorderHandle>>,
}

impl Stream {
    #[must_use]
    pub fn new(key: String, url: String, room_id: String, push_id: i32) -> Self {
        Self {
            key,
            url,
            room_id,
            push_id,
            running: AtomicBool::new(false),
            stop: CancellationToken::new(),
            reader_uid: Mutex::new(None),
            reader_liveness: Mutex::new(None),
            reader_stats: Mutex::new(None),
            viewers: DashMap::new(),
            cache: Mutex::new(StreamCache::new()),
            recorder: Mutex::new(None),
        }
    }

    /// Bind the exclusive reader. The caller spawns the transfer loop.
    pub fn attach_reader(&self, reader: &PublisherConn) {
        *self.reader_uid.lock().unwrap() = Some(reader.info.uid.clone());
        *self.reader_liveness.lock().unwrap() = Some(reader.liveness());
        *self.reader_stats.lock().unwrap() = Some(reader.stats());
        self.running.store(true, Ordering::SeqCst);
    }

    #[must_use]
    pub fn reader_uid(&self) -> Option<String> {
        self.reader_uid.lock().unwrap().clone()
    }

    #[must_use]
    pub fn reader_stats(&self) -> Option<BandwidthSnapshot> {
        self.reader_stats
            .lock()
            .unwrap()
            .as_ref()
            .map(|s| s.snapshot())
    }

    #[must_use]
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub(crate) fn set_stopped(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    /// Unblock the transfer loop with a synthetic stop. Idempotent.
    pub fn stop_transfer(&self) {
        if self.is_running() {
            info!(key = %self.key, "stopping transfer: stop old");
        }
        self.stop.cancel();
    }

    /// Resolves once [`Self::stop_transfer`] has been called.
    pub async fn stopped(&self) {
        self.stop.cancelled().await;
    }

    pub fn add_writer(&self, viewer: Arc<ViewerHandle>) {
        let uid = viewer.info.uid.clone();
        self.viewers.insert(uid, ViewerSlot {
            init: false,
            viewer,
        });
        info!(key = %self.key, viewers = self.viewers.len(), "viewer registered");
    }

    /// Migrate every viewer to `dst` for a publisher takeover. Each viewer
    /// re-bases its timestamps and replays the new stream's cache.
    pub fn copy_viewers_to(&self, dst: &Stream) {
        let uids: Vec<String> = self.viewers.iter().map(|e| e.key().clone()).collect();
        for uid in uids {
            if let Some((_, slot)) = self.viewers.remove(&uid) {
                slot.viewer.recalc_base_timestamp();
                dst.add_writer(slot.viewer);
            }
        }
    }

    /// Count live endpoints, shedding dead ones: a timed-out reader stops
    /// the transfer, timed-out viewers are closed and removed.
    pub fn check_alive(&self) -> usize {
        let mut live = 0;

        if self.is_running() {
            let reader_alive = self
                .reader_liveness
                .lock()
                .unwrap()
                .as_ref()
                .is_some_and(|l| l.alive());
            if reader_alive {
                live += 1;
            } else {
                warn!(key = %self.key, "publisher read timeout");
                self.stop_transfer();
            }
        }

        let mut dead = Vec::new();
        for entry in self.viewers.iter() {
            if entry.value().viewer.alive() {
                live += 1;
            } else {
                dead.push(entry.key().clone());
            }
        }
        for uid in dead {
            if let Some((_, slot)) = self.viewers.remove(&uid) {
                warn!(key = %self.key, %uid, "viewer write timeout");
                slot.viewer.close("write timeout");
            }
        }

        live
    }

    /// Deliver one live packet to every viewer: late joiners get the cache
    /// prefix first, broken viewers are shed. Never blocks on a viewer.
    pub fn broadcast(&self, packet: &crate::packet::Packet) {
        self.cache.lock().unwrap().write(packet);
        if self.viewers.is_empty() {
            return;
        }

        let mut shed = Vec::new();
        for mut entry in self.viewers.iter_mut() {
            let uid = entry.key().clone();
            let slot = entry.value_mut();
            if slot.init {
                if slot.viewer.write(packet).is_err() {
                    shed.push(uid);
                }
                continue;
            }
            let delivered = {
                let cache = self.cache.lock().unwrap();
                let result = cache
                    .packets()
                    .try_for_each(|cached| slot.viewer.write(cached));
                result
            };
            match delivered {
                Ok(()) => slot.init = true,
                Err(_) => shed.push(uid),
            }
        }
        for uid in shed {
            if let Some((_, slot)) = self.viewers.remove(&uid) {
                warn!(key = %self.key, %uid, "viewer write failed, removed");
                slot.viewer.close("write failed");
            }
        }
    }

    pub fn close_viewers(&self, reason: &str) {
        let uids: Vec<String> = self.viewers.iter().map(|e| e.key().clone()).collect();
        for uid in uids {
            if let Some((_, slot)) = self.viewers.remove(&uid) {
                slot.viewer.close(reason);
            }
        }
    }

    #[must_use]
    pub fn viewer_count(&self) -> usize {
        self.viewers.len()
    }

    /// Install a recorder, stopping any previous one first.
    pub fn set_recorder(&self, handle: RecorderHandle) {
        if let Some(old) = self.recorder.lock().unwrap().replace(handle) {
            old.stop();
        }
    }

    pub fn stop_recorder(&self) {
        if let Some(handle) = self.recorder.lock().unwrap().take() {
            handle.stop();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::test_support::*;
    use crate::packet::Packet;
    use crate::session::viewer_test_support::collected_viewer;
    use std::time::Duration;

    fn test_stream() -> Stream {
        Stream::new(
            "live/R1/12/Camera_1".to_string(),
            "rtmp://h:1935/live/R1/12/Camera_1".to_string(),
            "R1".to_string(),
            1,
        )
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    #[tokio::test]
    async fn late_joiner_receives_cache_prefix_before_live_packets() {
        let stream = test_stream();
        stream.broadcast(&metadata(0));
        stream.broadcast(&audio_seq_header(1));
        stream.broadcast(&video_seq_header(2));
        stream.broadcast(&key_frame(10));

        let viewer = collected_viewer(Duration::from_secs(10));
        stream.add_writer(viewer.handle.clone());

        stream.broadcast(&inter_frame(20));
        settle().await;

        let received = viewer.received.lock().unwrap();
        assert_eq!(received.len(), 5);
        assert!(received[0].is_metadata());
        assert!(received[1].is_audio() && received[1].is_sequence_header());
        assert!(received[2].is_video() && received[2].is_sequence_header());
        assert!(received[3].is_key_frame());
        assert_eq!(received[4].timestamp, 20);
    }

    #[tokio::test]
    async fn established_viewer_receives_only_live_packets() {
        let stream = test_stream();
        stream.broadcast(&key_frame(0));

        let viewer = collected_viewer(Duration::from_secs(10));
        stream.add_writer(viewer.handle.clone());
        stream.broadcast(&inter_frame(10));
        stream.broadcast(&inter_frame(20));
        settle().await;

        // First delivery replayed the cache (keyframe + the live frame that
        // triggered it), the second was live-only.
        let received = viewer.received.lock().unwrap();
        let timestamps: Vec<u32> = received.iter().map(|p| p.timestamp).collect();
        assert_eq!(timestamps, vec![0, 10, 20]);
    }

    #[tokio::test]
    async fn muted_viewer_drops_audio_until_unmuted() {
        let stream = test_stream();
        stream.broadcast(&key_frame(0));

        let viewer = collected_viewer(Duration::from_secs(10));
        stream.add_writer(viewer.handle.clone());
        viewer.handle.set_muted(true);

        stream.broadcast(&audio_frame(5));
        stream.broadcast(&inter_frame(10));
        settle().await;
        {
            let received = viewer.received.lock().unwrap();
            assert!(received.iter().all(|p: &Packet| !p.is_audio()));
        }

        viewer.handle.set_muted(false);
        stream.broadcast(&audio_frame(15));
        settle().await;
        let received = viewer.received.lock().unwrap();
        assert!(received.iter().any(|p| p.is_audio()));
    }

    #[tokio::test]
    async fn takeover_migrates_viewers_and_replays_new_cache() {
        let old = test_stream();
        old.broadcast(&key_frame(1000));

        let viewer = collected_viewer(Duration::from_secs(10));
        old.add_writer(viewer.handle.clone());
        old.broadcast(&inter_frame(1010));
        settle().await;
        assert_eq!(viewer.received.lock().unwrap().len(), 2);

        let fresh = test_stream();
        fresh.broadcast(&video_seq_header(0));
        fresh.broadcast(&key_frame(1));
        old.copy_viewers_to(&fresh);
        assert_eq!(old.viewer_count(), 0);
        assert_eq!(fresh.viewer_count(), 1);

        fresh.broadcast(&inter_frame(2));
        settle().await;

        assert!(viewer.rebased.load(std::sync::atomic::Ordering::Relaxed));
        let received = viewer.received.lock().unwrap();
        // Old prefix + live, then the new stream's prefix + live.
        let timestamps: Vec<u32> = received.iter().map(|p| p.timestamp).collect();
        assert_eq!(timestamps, vec![1000, 1010, 0, 1, 2]);
    }

    #[tokio::test]
    async fn check_alive_counts_and_evicts() {
        let stream = test_stream();

        let live = collected_viewer(Duration::from_secs(10));
        let dead = collected_viewer(Duration::from_millis(0));
        stream.add_writer(live.handle.clone());
        stream.add_writer(dead.handle.clone());
        tokio::time::sleep(Duration::from_millis(10)).await;

        let count = stream.check_alive();
        assert_eq!(count, 1);
        assert_eq!(stream.viewer_count(), 1);
    }

    #[tokio::test]
    async fn closed_viewer_is_shed_on_broadcast() {
        let stream = test_stream();
        let viewer = collected_viewer(Duration::from_secs(10));
        stream.add_writer(viewer.handle.clone());

        viewer.handle.close("test");
        stream.broadcast(&key_frame(0));
        assert_eq!(stream.viewer_count(), 0);
    }
}
