//! Bounded per-viewer packet queue with a lossy drop policy.
//!
//! A slow viewer must never block the publisher: when the queue approaches
//! capacity the enqueueing side sheds load itself, preserving audio
//! continuity, sequence headers and keyframes so the decoder can restart
//! cleanly after a burst of drops.

use std::collections::VecDeque;
use std::sync::Mutex;
use tokio::sync::Notify;
use tracing::debug;

use crate::packet::{Packet, PacketHeader};

pub const MAX_QUEUE: usize = 1024;
/// Queue length at which a push triggers the drop scan.
const DROP_THRESHOLD: usize = MAX_QUEUE - 24;
/// Upper bound on packets examined per drop scan.
const DROP_SCAN: usize = MAX_QUEUE - 84;
/// Above this length even audio is shed.
const AUDIO_PRESSURE: usize = MAX_QUEUE - 2;
/// Above this length an extra packet is shed after each kept video packet.
const VIDEO_PRESSURE: usize = MAX_QUEUE - 10;

#[derive(Debug, PartialEq, Eq)]
pub struct QueueClosed;

#[derive(Default)]
struct Inner {
    deque: VecDeque<Packet>,
    closed: bool,
    dropped: u64,
}

pub struct PacketQueue {
    inner: Mutex<Inner>,
    notify: Notify,
}

impl Default for PacketQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl PacketQueue {
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            notify: Notify::new(),
        }
    }

    /// Enqueue one packet, shedding load first if the queue is near full.
    /// Bounded work regardless of queue state.
    pub fn push(&self, packet: Packet) -> Result<(), QueueClosed> {
        {
            let mut inner = self.inner.lock().unwrap();
            if inner.closed {
                return Err(QueueClosed);
            }
            if inner.deque.len() >= DROP_THRESHOLD {
                Self::drop_packets(&mut inner);
            }
            inner.deque.push_back(packet);
        }
        self.notify.notify_one();
        Ok(())
    }

    /// Scan up to [`DROP_SCAN`] packets from the front, re-enqueueing the
    /// ones worth keeping:
    /// - audio survives unless the queue is still above [`AUDIO_PRESSURE`];
    /// - video survives only as a sequence header or keyframe, and above
    ///   [`VIDEO_PRESSURE`] one extra packet is shed;
    /// - metadata is shed.
    fn drop_packets(inner: &mut Inner) {
        debug!(len = inner.deque.len(), "viewer queue near capacity, shedding");
        for _ in 0..DROP_SCAN {
            let Some(packet) = inner.deque.pop_front() else {
                break;
            };
            match &packet.header {
                PacketHeader::Audio(_) => {
                    if inner.deque.len() > AUDIO_PRESSURE {
                        inner.dropped += 1;
                    } else {
                        inner.deque.push_back(packet);
                    }
                }
                PacketHeader::Video(h) => {
                    if h.is_sequence_header || h.is_key_frame {
                        inner.deque.push_back(packet);
                    } else {
                        inner.dropped += 1;
                    }
                    if inner.deque.len() > VIDEO_PRESSURE {
                        inner.deque.pop_front();
                        inner.dropped += 1;
                    }
                }
                PacketHeader::Metadata(_) => {
                    inner.dropped += 1;
                }
            }
        }
        debug!(len = inner.deque.len(), "drop scan finished");
    }

    /// Wait for the next packet; `None` once closed and drained.
    pub async fn pop(&self) -> Option<Packet> {
        loop {
            let notified = self.notify.notified();
            {
                let mut inner = self.inner.lock().unwrap();
                if let Some(packet) = inner.deque.pop_front() {
                    return Some(packet);
                }
                if inner.closed {
                    return None;
                }
            }
            notified.await;
        }
    }

    pub fn close(&self) {
        self.inner.lock().unwrap().closed = true;
        self.notify.notify_waiters();
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().deque.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[must_use]
    pub fn dropped(&self) -> u64 {
        self.inner.lock().unwrap().dropped
    }
}
