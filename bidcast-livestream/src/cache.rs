//! Per-stream cache for late-joining viewers.
//!
//! Holds at most the latest metadata, the audio and video sequence headers,
//! and the current GOP. Replayed to a viewer before its first live packet so
//! decoding can start at the cached keyframe.

use crate::packet::{Packet, PacketHeader};

#[derive(Default)]
pub struct StreamCache {
    metadata: Option<Packet>,
    audio_seq: Option<Packet>,
    video_seq: Option<Packet>,
    gop: Vec<Packet>,
}

impl StreamCache {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn write(&mut self, packet: &Packet) {
        match &packet.header {
            PacketHeader::Metadata(_) => self.metadata = Some(packet.clone()),
            PacketHeader::Audio(h) => {
                if h.is_sequence_header {
                    self.audio_seq = Some(packet.clone());
                }
            }
            PacketHeader::Video(h) => {
                if h.is_sequence_header {
                    self.video_seq = Some(packet.clone());
                } else if h.is_key_frame {
                    self.gop.clear();
                    self.gop.push(packet.clone());
                } else if !self.gop.is_empty() {
                    self.gop.push(packet.clone());
                }
            }
        }
    }

    /// Replay order: metadata, audio sequence header, video sequence header,
    /// then the GOP. Optional elements are skipped when absent.
    pub fn packets(&self) -> impl Iterator<Item = &Packet> {
        self.metadata
            .iter()
            .chain(self.audio_seq.iter())
            .chain(self.video_seq.iter())
            .chain(self.gop.iter())
    }

    #[must_use]
    pub fn gop_len(&self) -> usize {
        self.gop.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::test_support::*;

    #[test]
    fn replay_prefix_order() {
        let mut cache = StreamCache::new();
        cache.write(&audio_seq_header(0));
        cache.write(&metadata(1));
        cache.write(&video_seq_header(2));
        cache.write(&key_frame(10));
        cache.write(&inter_frame(20));
        cache.write(&audio_frame(25));

        let replay: Vec<&Packet> = cache.packets().collect();
        assert_eq!(replay.len(), 5);
        assert!(replay[0].is_metadata());
        assert!(replay[1].is_audio() && replay[1].is_sequence_header());
        assert!(replay[2].is_video() && replay[2].is_sequence_header());
        assert!(replay[3].is_key_frame());
        assert!(!replay[4].is_key_frame() && replay[4].is_video());
    }

    #[test]
    fn keyframe_resets_gop() {
        let mut cache = StreamCache::new();
        cache.write(&key_frame(0));
        cache.write(&inter_frame(33));
        cache.write(&inter_frame(66));
        assert_eq!(cache.gop_len(), 3);

        cache.write(&key_frame(100));
        assert_eq!(cache.gop_len(), 1);
        let gop: Vec<&Packet> = cache.packets().collect();
        assert_eq!(gop[0].timestamp, 100);
    }

    #[test]
    fn inter_frames_before_first_keyframe_are_not_cached() {
        let mut cache = StreamCache::new();
        cache.write(&inter_frame(0));
        cache.write(&inter_frame(33));
        assert_eq!(cache.gop_len(), 0);
        assert_eq!(cache.packets().count(), 0);
    }

    #[test]
    fn plain_audio_is_not_cached() {
        let mut cache = StreamCache::new();
        cache.write(&audio_frame(0));
        assert_eq!(cache.packets().count(), 0);

        cache.write(&audio_seq_header(1));
        assert_eq!(cache.packets().count(), 1);
    }

    #[test]
    fn headers_are_replaced_not_accumulated() {
        let mut cache = StreamCache::new();
        cache.write(&video_seq_header(0));
        cache.write(&video_seq_header(50));
        let replay: Vec<&Packet> = cache.packets().collect();
        assert_eq!(replay.len(), 1);
        assert_eq!(replay[0].timestamp, 50);
    }
}
