//! Media packet model.
//!
//! Every chunk read from a publisher is classified as exactly one of audio,
//! video or metadata, and video/audio payloads get their FLV lead bytes
//! parsed up front so the cache and the drop policy never re-parse.

use bytes::Bytes;
use rml_rtmp::sessions::StreamMetadata;
use std::sync::Arc;

#[derive(Debug, Clone)]
pub struct Packet {
    pub stream_id: u32,
    /// Source-clock milliseconds.
    pub timestamp: u32,
    pub header: PacketHeader,
    pub data: Bytes,
}

#[derive(Debug, Clone)]
pub enum PacketHeader {
    Audio(AudioHeader),
    Video(VideoHeader),
    /// Metadata arrives pre-parsed from the chunk layer; the raw AMF body is
    /// not retained.
    Metadata(Arc<StreamMetadata>),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AudioHeader {
    pub is_sequence_header: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct VideoHeader {
    pub is_key_frame: bool,
    pub is_sequence_header: bool,
}

impl Packet {
    #[must_use]
    pub fn audio(stream_id: u32, timestamp: u32, data: Bytes) -> Self {
        let header = PacketHeader::Audio(demux_audio(&data));
        Self {
            stream_id,
            timestamp,
            header,
            data,
        }
    }

    #[must_use]
    pub fn video(stream_id: u32, timestamp: u32, data: Bytes) -> Self {
        let header = PacketHeader::Video(demux_video(&data));
        Self {
            stream_id,
            timestamp,
            header,
            data,
        }
    }

    #[must_use]
    pub fn metadata(stream_id: u32, timestamp: u32, metadata: Arc<StreamMetadata>) -> Self {
        Self {
            stream_id,
            timestamp,
            header: PacketHeader::Metadata(metadata),
            data: Bytes::new(),
        }
    }

    #[must_use]
    pub fn is_audio(&self) -> bool {
        matches!(self.header, PacketHeader::Audio(_))
    }

    #[must_use]
    pub fn is_video(&self) -> bool {
        matches!(self.header, PacketHeader::Video(_))
    }

    #[must_use]
    pub fn is_metadata(&self) -> bool {
        matches!(self.header, PacketHeader::Metadata(_))
    }

    #[must_use]
    pub fn is_key_frame(&self) -> bool {
        matches!(self.header, PacketHeader::Video(h) if h.is_key_frame)
    }

    #[must_use]
    pub fn is_sequence_header(&self) -> bool {
        match self.header {
            PacketHeader::Audio(h) => h.is_sequence_header,
            PacketHeader::Video(h) => h.is_sequence_header,
            PacketHeader::Metadata(_) => false,
        }
    }
}

/// FLV VIDEODATA lead bytes: frame-type nibble 1 means keyframe, and for
/// AVC/HEVC the following packet-type byte 0 means sequence header. The two
/// flags are independent.
#[must_use]
pub fn demux_video(data: &Bytes) -> VideoHeader {
    if data.len() < 2 {
        return VideoHeader::default();
    }
    VideoHeader {
        is_key_frame: data[0] >> 4 == 1,
        is_sequence_header: data[1] == 0,
    }
}

/// FLV AUDIODATA lead bytes: AAC (sound format 10) with packet-type byte 0
/// is the codec config.
#[must_use]
pub fn demux_audio(data: &Bytes) -> AudioHeader {
    if data.len() < 2 {
        return AudioHeader::default();
    }
    let is_sequence_header = data[0] >> 4 == 10 && data[1] == 0;
    AudioHeader { is_sequence_header }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;

    pub fn key_frame(ts: u32) -> Packet {
        Packet::video(1, ts, Bytes::from_static(&[0x17, 0x01, 0, 0, 0, 0xAA]))
    }

    pub fn inter_frame(ts: u32) -> Packet {
        Packet::video(1, ts, Bytes::from_static(&[0x27, 0x01, 0, 0, 0, 0xBB]))
    }

    pub fn video_seq_header(ts: u32) -> Packet {
        Packet::video(1, ts, Bytes::from_static(&[0x17, 0x00, 0, 0, 0, 0x01]))
    }

    pub fn audio_frame(ts: u32) -> Packet {
        Packet::audio(1, ts, Bytes::from_static(&[0xAF, 0x01, 0x21]))
    }

    pub fn audio_seq_header(ts: u32) -> Packet {
        Packet::audio(1, ts, Bytes::from_static(&[0xAF, 0x00, 0x12]))
    }

    pub fn metadata(ts: u32) -> Packet {
        Packet::metadata(1, ts, Arc::new(StreamMetadata::new()))
    }
}
