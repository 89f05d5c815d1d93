//! RTMP session adapter.
//!
//! Wraps the chunk-I/O library (handshake, chunk framing, publish/play
//! negotiation) behind packet-level reader/writer handles. Publishers and
//! viewers are separate types; nothing downstream ever asks a connection
//! what kind it is.

use anyhow::{anyhow, bail, Result};
use bytes::{Bytes, BytesMut};
use rml_rtmp::handshake::{Handshake, HandshakeProcessResult, PeerType};
use rml_rtmp::sessions::{
    ServerSession, ServerSessionConfig, ServerSessionEvent, ServerSessionResult,
};
use rml_rtmp::time::RtmpTimestamp;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::packet::{Packet, PacketHeader};
use crate::queue::PacketQueue;

const NEGOTIATE_TIMEOUT: Duration = Duration::from_secs(10);
const STATS_INTERVAL: Duration = Duration::from_secs(5);

/// Last-activity tracking with a fixed timeout, shared between a connection
/// task and the liveness sweeper.
pub struct Liveness {
    timeout: Duration,
    last: Mutex<Instant>,
}

impl Liveness {
    #[must_use]
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            last: Mutex::new(Instant::now()),
        }
    }

    pub fn touch(&self) {
        *self.last.lock().unwrap() = Instant::now();
    }

    #[must_use]
    pub fn alive(&self) -> bool {
        self.last.lock().unwrap().elapsed() <= self.timeout
    }
}

/// Per-direction byte counters with speeds recomputed every 5 s.
#[derive(Default)]
struct StatsInner {
    video_bytes: u64,
    audio_bytes: u64,
    last_video_bytes: u64,
    last_audio_bytes: u64,
    video_kbps: u64,
    audio_kbps: u64,
    last_tick: Option<Instant>,
}

#[derive(Default)]
pub struct BandwidthStats {
    inner: Mutex<StatsInner>,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct BandwidthSnapshot {
    pub video_bytes: u64,
    pub audio_bytes: u64,
    pub video_kbps: u64,
    pub audio_kbps: u64,
}

impl BandwidthStats {
    pub fn record(&self, len: usize, is_video: bool) {
        let mut inner = self.inner.lock().unwrap();
        if is_video {
            inner.video_bytes += len as u64;
        } else {
            inner.audio_bytes += len as u64;
        }
        let now = Instant::now();
        match inner.last_tick {
            None => inner.last_tick = Some(now),
            Some(tick) if now.duration_since(tick) >= STATS_INTERVAL => {
                let secs = now.duration_since(tick).as_secs().max(1);
                inner.video_kbps = (inner.video_bytes - inner.last_video_bytes) * 8 / secs / 1000;
                inner.audio_kbps = (inner.audio_bytes - inner.last_audio_bytes) * 8 / secs / 1000;
                inner.last_video_bytes = inner.video_bytes;
                inner.last_audio_bytes = inner.audio_bytes;
                inner.last_tick = Some(now);
            }
            Some(_) => {}
        }
    }

    #[must_use]
    pub fn snapshot(&self) -> BandwidthSnapshot {
        let inner = self.inner.lock().unwrap();
        BandwidthSnapshot {
            video_bytes: inner.video_bytes,
            audio_bytes: inner.audio_bytes,
            video_kbps: inner.video_kbps,
            audio_kbps: inner.audio_kbps,
        }
    }
}

/// Outbound timestamp re-basing across publisher takeovers. The base is
/// recomputed from the last timestamps this viewer actually saw, so the
/// delivered clock stays monotonically non-decreasing across the seam.
#[derive(Default)]
pub struct TimestampBaser {
    base: u32,
    last_video: u32,
    last_audio: u32,
}

impl TimestampBaser {
    #[must_use]
    pub fn base(&self) -> u32 {
        self.base
    }

    pub fn record(&mut self, out_timestamp: u32, packet: &Packet) {
        match packet.header {
            PacketHeader::Video(_) => self.last_video = out_timestamp,
            PacketHeader::Audio(_) => self.last_audio = out_timestamp,
            PacketHeader::Metadata(_) => {}
        }
    }

    pub fn recalc(&mut self) {
        self.base = self.last_video.max(self.last_audio);
    }
}

#[derive(Debug, Clone)]
pub struct StreamInfo {
    pub uid: String,
    pub app: String,
    pub stream_key: String,
    /// URL path (`<app>/<stream key>`) used as the stream registry key.
    pub key: String,
}

impl StreamInfo {
    pub(crate) fn new(app: String, stream_key: String) -> Self {
        let key = format!("{app}/{stream_key}");
        Self {
            uid: nanoid::nanoid!(),
            app,
            stream_key,
            key,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionKind {
    Publisher,
    Viewer,
}

/// A connection that completed handshake and negotiation and is waiting for
/// its publish/play request to be accepted or rejected.
pub struct NegotiatedSession {
    pub kind: SessionKind,
    pub info: StreamInfo,
    session: ServerSession,
    socket: TcpStream,
    request_id: u32,
    play_stream_id: u32,
    buf_size: usize,
}

/// Drive handshake and negotiation on a fresh TCP connection. `buf_size`
/// sizes the connection read buffer.
pub async fn accept(socket: TcpStream, buf_size: usize) -> Result<NegotiatedSession> {
    tokio::time::timeout(NEGOTIATE_TIMEOUT, negotiate(socket, buf_size))
        .await
        .map_err(|_| anyhow!("RTMP negotiation timed out"))?
}

async fn negotiate(mut socket: TcpStream, buf_size: usize) -> Result<NegotiatedSession> {
    let leftover = server_handshake(&mut socket).await?;

    let (mut session, initial) = ServerSession::new(ServerSessionConfig::new())?;

    let mut queue: VecDeque<ServerSessionResult> = initial.into();
    queue.extend(session.handle_input(&leftover)?);

    let mut buf = vec![0u8; buf_size.max(1024)];
    loop {
        while let Some(result) = queue.pop_front() {
            match result {
                ServerSessionResult::OutboundResponse(packet) => {
                    socket.write_all(&packet.bytes).await?;
                }
                ServerSessionResult::RaisedEvent(event) => match event {
                    ServerSessionEvent::ConnectionRequested {
                        request_id,
                        app_name,
                    } => {
                        debug!(app = %app_name, "rtmp app connect");
                        queue.extend(session.accept_request(request_id)?);
                    }
                    ServerSessionEvent::PublishStreamRequested {
                        request_id,
                        app_name,
                        stream_key,
                        mode: _,
                    } => {
                        return Ok(NegotiatedSession {
                            kind: SessionKind::Publisher,
                            info: StreamInfo::new(app_name, stream_key),
                            session,
                            socket,
                            request_id,
                            play_stream_id: 0,
                            buf_size: buf.len(),
                        });
                    }
                    ServerSessionEvent::PlayStreamRequested {
                        request_id,
                        app_name,
                        stream_key,
                        stream_id,
                        ..
                    } => {
                        return Ok(NegotiatedSession {
                            kind: SessionKind::Viewer,
                            info: StreamInfo::new(app_name, stream_key),
                            session,
                            socket,
                            request_id,
                            play_stream_id: stream_id,
                            buf_size: buf.len(),
                        });
                    }
                    other => debug!(event = ?other, "rtmp event during negotiation"),
                },
                ServerSessionResult::UnhandleableMessageReceived(_) => {}
            }
        }

        let n = socket.read(&mut buf).await?;
        if n == 0 {
            bail!("connection closed during negotiation");
        }
        queue.extend(session.handle_input(&buf[..n])?);
    }
}

async fn server_handshake(socket: &mut TcpStream) -> Result<Vec<u8>> {
    let mut handshake = Handshake::new(PeerType::Server);
    let p0_and_p1 = handshake
        .generate_outbound_p0_and_p1()
        .map_err(|e| anyhow!("handshake generation failed: {e:?}"))?;
    socket.write_all(&p0_and_p1).await?;

    let mut buf = [0u8; 4096];
    loop {
        let n = socket.read(&mut buf).await?;
        if n == 0 {
            bail!("connection closed during handshake");
        }
        match handshake
            .process_bytes(&buf[..n])
            .map_err(|e| anyhow!("handshake failed: {e:?}"))?
        {
            HandshakeProcessResult::InProgress { response_bytes } => {
                socket.write_all(&response_bytes).await?;
            }
            HandshakeProcessResult::Completed {
                response_bytes,
                remaining_bytes,
            } => {
                socket.write_all(&response_bytes).await?;
                return Ok(remaining_bytes);
            }
        }
    }
}

impl NegotiatedSession {
    /// Close the connection without accepting the pending request.
    pub async fn reject(mut self, reason: &str) {
        info!(key = %self.info.key, reason, "rejecting rtmp session");
        let _ = self.socket.shutdown().await;
    }

    /// Accept the pending publish request and hand back the packet reader.
    pub async fn into_publisher(
        mut self,
        canonical_url: String,
        read_timeout: Duration,
    ) -> Result<PublisherConn> {
        let results = self.session.accept_request(self.request_id)?;
        for result in results {
            if let ServerSessionResult::OutboundResponse(packet) = result {
                self.socket.write_all(&packet.bytes).await?;
            }
        }
        Ok(PublisherConn {
            info: self.info,
            url: canonical_url,
            socket: self.socket,
            session: self.session,
            media: VecDeque::new(),
            liveness: Arc::new(Liveness::new(read_timeout)),
            stats: Arc::new(BandwidthStats::default()),
            read_buf: vec![0u8; self.buf_size],
        })
    }

    /// Accept the pending play request and hand back the viewer connection.
    pub async fn into_viewer(
        mut self,
        canonical_url: String,
        write_timeout: Duration,
    ) -> Result<ViewerConn> {
        let results = self.session.accept_request(self.request_id)?;
        for result in results {
            if let ServerSessionResult::OutboundResponse(packet) = result {
                self.socket.write_all(&packet.bytes).await?;
            }
        }
        Ok(ViewerConn {
            info: self.info,
            url: canonical_url,
            socket: self.socket,
            session: self.session,
            play_stream_id: self.play_stream_id,
            liveness: Arc::new(Liveness::new(write_timeout)),
            stats: Arc::new(BandwidthStats::default()),
        })
    }
}

/// Exclusive packet source for a stream: the publisher side of a session.
pub struct PublisherConn {
    pub info: StreamInfo,
    /// Canonical push URL the endpoint was allocated under.
    pub url: String,
    socket: TcpStream,
    session: ServerSession,
    media: VecDeque<Packet>,
    liveness: Arc<Liveness>,
    stats: Arc<BandwidthStats>,
    read_buf: Vec<u8>,
}

impl PublisherConn {
    /// Read the next media packet, already demuxed. Control traffic is
    /// answered inline; a clean unpublish or socket close is an error that
    /// ends the transfer loop.
    pub async fn read_packet(&mut self) -> Result<Packet> {
        loop {
            if let Some(packet) = self.media.pop_front() {
                self.liveness.touch();
                self.stats.record(packet.data.len(), packet.is_video());
                return Ok(packet);
            }

            let n = self.socket.read(&mut self.read_buf).await?;
            if n == 0 {
                bail!("publisher connection closed");
            }
            let results = self.session.handle_input(&self.read_buf[..n])?;
            for result in results {
                match result {
                    ServerSessionResult::OutboundResponse(packet) => {
                        self.socket.write_all(&packet.bytes).await?;
                    }
                    ServerSessionResult::RaisedEvent(event) => match event {
                        ServerSessionEvent::AudioDataReceived {
                            data, timestamp, ..
                        } => self
                            .media
                            .push_back(Packet::audio(1, timestamp.value, data)),
                        ServerSessionEvent::VideoDataReceived {
                            data, timestamp, ..
                        } => self
                            .media
                            .push_back(Packet::video(1, timestamp.value, data)),
                        ServerSessionEvent::StreamMetadataChanged { metadata, .. } => self
                            .media
                            .push_back(Packet::metadata(1, 0, Arc::new(metadata))),
                        ServerSessionEvent::PublishStreamFinished { .. } => {
                            bail!("publisher finished the stream");
                        }
                        other => debug!(event = ?other, "rtmp event from publisher"),
                    },
                    ServerSessionResult::UnhandleableMessageReceived(_) => {}
                }
            }
        }
    }

    #[must_use]
    pub fn liveness(&self) -> Arc<Liveness> {
        self.liveness.clone()
    }

    #[must_use]
    pub fn stats(&self) -> Arc<BandwidthStats> {
        self.stats.clone()
    }
}

/// Control messages handled by the viewer task between packets.
pub enum ViewerCtrl {
    /// Re-base outbound timestamps; sent when the viewer migrates to a new
    /// publisher for the same key.
    RecalcBaseTimestamp,
    Close(String),
}

/// Viewer side of a session, before its tasks are spawned.
pub struct ViewerConn {
    pub info: StreamInfo,
    pub url: String,
    socket: TcpStream,
    session: ServerSession,
    play_stream_id: u32,
    liveness: Arc<Liveness>,
    stats: Arc<BandwidthStats>,
}

#[derive(Debug)]
pub struct ViewerGone;

/// Handle a stream keeps per registered viewer. Writes never block: the
/// queue sheds load instead.
pub struct ViewerHandle {
    pub info: StreamInfo,
    queue: Arc<PacketQueue>,
    ctrl: mpsc::UnboundedSender<ViewerCtrl>,
    muted: Arc<AtomicBool>,
    liveness: Arc<Liveness>,
    closed: Arc<AtomicBool>,
    done: CancellationToken,
    stats: Arc<BandwidthStats>,
}

impl ViewerHandle {
    pub fn write(&self, packet: &Packet) -> Result<(), ViewerGone> {
        if self.closed.load(Ordering::Relaxed) {
            return Err(ViewerGone);
        }
        if packet.is_audio() && self.muted.load(Ordering::Relaxed) {
            return Ok(());
        }
        self.queue.push(packet.clone()).map_err(|_| ViewerGone)
    }

    #[must_use]
    pub fn alive(&self) -> bool {
        !self.closed.load(Ordering::Relaxed) && self.liveness.alive()
    }

    pub fn set_muted(&self, muted: bool) {
        self.muted.store(muted, Ordering::Relaxed);
    }

    pub fn recalc_base_timestamp(&self) {
        let _ = self.ctrl.send(ViewerCtrl::RecalcBaseTimestamp);
    }

    pub fn close(&self, reason: &str) {
        self.closed.store(true, Ordering::Relaxed);
        let _ = self.ctrl.send(ViewerCtrl::Close(reason.to_string()));
        self.queue.close();
    }

    /// Cancelled when the viewer task exits; the mute poller watches this.
    #[must_use]
    pub fn done(&self) -> CancellationToken {
        self.done.clone()
    }

    #[must_use]
    pub fn stats(&self) -> BandwidthSnapshot {
        self.stats.snapshot()
    }

    #[must_use]
    pub fn queue_len(&self) -> usize {
        self.queue.len()
    }
}

/// Spawn the viewer's send task (drains the queue into the socket) and its
/// check task (drains inbound chunks to notice disconnects), returning the
/// handle the stream registers.
pub fn spawn_viewer(conn: ViewerConn) -> ViewerHandle {
    let queue = Arc::new(PacketQueue::new());
    let (ctrl_tx, ctrl_rx) = mpsc::unbounded_channel();
    let muted = Arc::new(AtomicBool::new(false));
    let closed = Arc::new(AtomicBool::new(false));
    let done = CancellationToken::new();

    let handle = ViewerHandle {
        info: conn.info.clone(),
        queue: queue.clone(),
        ctrl: ctrl_tx,
        muted,
        liveness: conn.liveness.clone(),
        closed: closed.clone(),
        done: done.clone(),
        stats: conn.stats.clone(),
    };

    tokio::spawn(run_viewer(conn, queue, ctrl_rx, closed, done));
    handle
}

async fn run_viewer(
    conn: ViewerConn,
    queue: Arc<PacketQueue>,
    mut ctrl: mpsc::UnboundedReceiver<ViewerCtrl>,
    closed: Arc<AtomicBool>,
    done: CancellationToken,
) {
    let ViewerConn {
        info,
        url: _,
        socket,
        mut session,
        play_stream_id,
        liveness,
        stats,
    } = conn;

    let (read_half, mut write_half) = socket.into_split();
    let (byte_tx, mut byte_rx) = mpsc::channel::<Bytes>(16);
    let check_task = tokio::spawn(read_daemon(read_half, byte_tx));

    let mut base = TimestampBaser::default();
    loop {
        tokio::select! {
            maybe_packet = queue.pop() => {
                let Some(packet) = maybe_packet else { break };
                if let Err(err) = write_media(
                    &mut session,
                    &mut write_half,
                    play_stream_id,
                    &mut base,
                    &packet,
                )
                .await
                {
                    warn!(uid = %info.uid, %err, "viewer write failed");
                    break;
                }
                liveness.touch();
                stats.record(packet.data.len(), packet.is_video());
            }
            maybe_ctrl = ctrl.recv() => {
                match maybe_ctrl {
                    Some(ViewerCtrl::RecalcBaseTimestamp) => base.recalc(),
                    Some(ViewerCtrl::Close(reason)) => {
                        info!(uid = %info.uid, reason, "viewer closed");
                        break;
                    }
                    None => break,
                }
            }
            maybe_bytes = byte_rx.recv() => {
                let Some(bytes) = maybe_bytes else {
                    debug!(uid = %info.uid, "viewer disconnected");
                    break;
                };
                match session.handle_input(&bytes) {
                    Ok(results) => {
                        let mut failed = false;
                        for result in results {
                            if let ServerSessionResult::OutboundResponse(packet) = result {
                                if write_half.write_all(&packet.bytes).await.is_err() {
                                    failed = true;
                                    break;
                                }
                            }
                        }
                        if failed {
                            break;
                        }
                    }
                    Err(err) => {
                        warn!(uid = %info.uid, err = ?err, "viewer sent invalid chunk data");
                        break;
                    }
                }
            }
        }
    }

    closed.store(true, Ordering::Relaxed);
    queue.close();
    done.cancel();
    check_task.abort();
    let _ = write_half.shutdown().await;
}

async fn write_media(
    session: &mut ServerSession,
    out: &mut OwnedWriteHalf,
    stream_id: u32,
    base: &mut TimestampBaser,
    packet: &Packet,
) -> Result<()> {
    let out_timestamp = packet.timestamp.wrapping_add(base.base());
    let timestamp = RtmpTimestamp {
        value: out_timestamp,
    };
    let chunk = match &packet.header {
        PacketHeader::Video(_) => session.send_video_data(
            stream_id,
            packet.data.clone(),
            timestamp,
            !packet.is_key_frame(),
        )?,
        PacketHeader::Audio(_) => session.send_audio_data(
            stream_id,
            packet.data.clone(),
            timestamp,
            packet.is_sequence_header(),
        )?,
        PacketHeader::Metadata(metadata) => session.send_metadata(stream_id, metadata)?,
    };
    base.record(out_timestamp, packet);
    out.write_all(&chunk.bytes).await?;
    Ok(())
}

async fn read_daemon(mut read_half: OwnedReadHalf, tx: mpsc::Sender<Bytes>) {
    let mut buf = BytesMut::with_capacity(4096);
    loop {
        match read_half.read_buf(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                let rest = buf.split_off(n);
                if tx.send(buf.freeze()).await.is_err() {
                    break;
                }
                buf = rest;
            }
        }
    }
}
