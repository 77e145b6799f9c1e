//! Video capture → encode → send pipeline
//!
//! One worker thread paced by the current quality tier's frame interval.
//! Each frame is kept for the local preview, resized and JPEG-compressed to
//! the tier parameters, prefixed with the video header and sent as a single
//! datagram. Frame and sequence ids wrap modulo 2^32.

use crate::client::media::{encode_jpeg, FrameSource, RawFrame};
use crate::protocol::headers::VideoHeader;
use crate::protocol::QualityTier;
use log::{debug, info, warn};
use parking_lot::Mutex;
use rand::Rng;
use std::io;
use std::net::{SocketAddr, UdpSocket};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Instant, SystemTime, UNIX_EPOCH};

struct Inner {
    running: AtomicBool,
    enabled: AtomicBool,
    tier: Mutex<QualityTier>,
    source: Mutex<Box<dyn FrameSource>>,
    preview: Mutex<Option<RawFrame>>,
    frames_sent: AtomicU64,
    bytes_sent: AtomicU64,
}

/// Running video sender. Shared by the session and the stats loop; `stop`
/// joins the worker thread.
pub struct VideoSender {
    inner: Arc<Inner>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl VideoSender {
    /// Spawn the capture loop. The send socket is transient and unrelated
    /// to the receive ports announced over REGISTER_UDP.
    ///
    /// `drop_probability` in `[0, 1]` silently discards that fraction of
    /// packets at the source, for exercising the adaptation loop.
    pub fn start(
        source: Box<dyn FrameSource>,
        relay_addr: SocketAddr,
        initial_tier: QualityTier,
        drop_probability: f64,
    ) -> io::Result<Self> {
        let socket = UdpSocket::bind(("0.0.0.0", 0))?;
        let inner = Arc::new(Inner {
            running: AtomicBool::new(true),
            enabled: AtomicBool::new(true),
            tier: Mutex::new(initial_tier),
            source: Mutex::new(source),
            preview: Mutex::new(None),
            frames_sent: AtomicU64::new(0),
            bytes_sent: AtomicU64::new(0),
        });
        let drop_probability = drop_probability.clamp(0.0, 1.0);

        let worker = inner.clone();
        let thread = std::thread::Builder::new()
            .name("video-send".into())
            .spawn(move || send_loop(worker, socket, relay_addr, drop_probability))?;
        info!(
            "video sender started at {} toward {}",
            initial_tier, relay_addr
        );
        Ok(Self {
            inner,
            thread: Mutex::new(Some(thread)),
        })
    }

    /// Camera-off senders capture nothing and pace on the tier interval.
    pub fn set_enabled(&self, enabled: bool) {
        self.inner.enabled.store(enabled, Ordering::Relaxed);
    }

    pub fn is_enabled(&self) -> bool {
        self.inner.enabled.load(Ordering::Relaxed)
    }

    pub fn set_quality(&self, tier: QualityTier) {
        let mut current = self.inner.tier.lock();
        if *current != tier {
            info!("video quality {} -> {}", *current, tier);
            *current = tier;
        }
    }

    pub fn quality(&self) -> QualityTier {
        *self.inner.tier.lock()
    }

    /// Swap the capture source at runtime (camera ↔ screen grab).
    pub fn set_source(&self, source: Box<dyn FrameSource>) {
        *self.inner.source.lock() = source;
    }

    /// Latest captured frame, pre-resize, for the local preview.
    pub fn latest_preview(&self) -> Option<RawFrame> {
        self.inner.preview.lock().clone()
    }

    pub fn frames_sent(&self) -> u64 {
        self.inner.frames_sent.load(Ordering::Relaxed)
    }

    pub fn bytes_sent(&self) -> u64 {
        self.inner.bytes_sent.load(Ordering::Relaxed)
    }

    pub fn stop(&self) {
        self.inner.running.store(false, Ordering::Relaxed);
        if let Some(thread) = self.thread.lock().take() {
            let _ = thread.join();
        }
    }
}

impl Drop for VideoSender {
    fn drop(&mut self) {
        self.stop();
    }
}

fn now_micros() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_micros() as u64)
        .unwrap_or(0)
}

fn send_loop(
    inner: Arc<Inner>,
    socket: UdpSocket,
    relay_addr: SocketAddr,
    drop_probability: f64,
) {
    let mut frame_id: u32 = 0;
    let mut sequence_num: u32 = 0;

    while inner.running.load(Ordering::Relaxed) {
        let tick = Instant::now();
        let tier = *inner.tier.lock();

        if inner.enabled.load(Ordering::Relaxed) {
            match capture_and_send(
                &inner,
                &socket,
                relay_addr,
                tier,
                frame_id,
                sequence_num,
                drop_probability,
            ) {
                Ok(()) => {
                    frame_id = frame_id.wrapping_add(1);
                    sequence_num = sequence_num.wrapping_add(1);
                }
                Err(e) => warn!("video frame dropped: {}", e),
            }
        }

        let interval = tier.frame_interval();
        let elapsed = tick.elapsed();
        if elapsed < interval {
            std::thread::sleep(interval - elapsed);
        }
    }
    debug!("video send loop exited");
}

fn capture_and_send(
    inner: &Inner,
    socket: &UdpSocket,
    relay_addr: SocketAddr,
    tier: QualityTier,
    frame_id: u32,
    sequence_num: u32,
    drop_probability: f64,
) -> Result<(), Box<dyn std::error::Error>> {
    let frame = inner.source.lock().next_frame()?;
    *inner.preview.lock() = Some(frame.clone());

    let params = tier.params();
    let payload = encode_jpeg(&frame, params.width, params.height, params.jpeg_quality)?;

    let header = VideoHeader {
        frame_id,
        timestamp_us: now_micros(),
        sequence_num,
        width: params.width,
        height: params.height,
        payload_size: payload.len() as i32,
    };
    let mut packet = Vec::with_capacity(24 + payload.len());
    packet.extend_from_slice(&header.pack());
    packet.extend_from_slice(&payload);

    // The loss hook drops after building the packet, so ids still advance
    // and the receiver observes a sequence gap.
    let simulate_drop = drop_probability > 0.0 && rand::thread_rng().gen::<f64>() < drop_probability;
    if !simulate_drop {
        socket.send_to(&packet, relay_addr)?;
    }

    inner.frames_sent.fetch_add(1, Ordering::Relaxed);
    inner
        .bytes_sent
        .fetch_add(packet.len() as u64, Ordering::Relaxed);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::media::TestPatternSource;
    use crate::protocol::headers::{classify, MediaKind, VideoHeader, VIDEO_HEADER_LEN};
    use std::time::Duration;

    #[test]
    fn sends_classifiable_datagrams_at_tier_resolution() {
        let receiver = UdpSocket::bind(("127.0.0.1", 0)).unwrap();
        receiver
            .set_read_timeout(Some(Duration::from_secs(3)))
            .unwrap();
        let relay_addr = receiver.local_addr().unwrap();

        let sender = VideoSender::start(
            Box::new(TestPatternSource::new(64, 48, 1)),
            relay_addr,
            QualityTier::P144,
            0.0,
        )
        .unwrap();

        let mut buf = [0u8; 65536];
        let (len, _) = receiver.recv_from(&mut buf).unwrap();
        sender.stop();

        let data = &buf[..len];
        assert_eq!(classify(data), Some(MediaKind::Video));
        let header = VideoHeader::unpack(data).unwrap();
        assert_eq!((header.width, header.height), (256, 144));
        assert_eq!(len - VIDEO_HEADER_LEN, header.payload_size as usize);
        assert!(sender.frames_sent() >= 1);
    }

    #[test]
    fn full_drop_rate_counts_frames_but_sends_nothing() {
        let receiver = UdpSocket::bind(("127.0.0.1", 0)).unwrap();
        receiver
            .set_read_timeout(Some(Duration::from_millis(600)))
            .unwrap();
        let relay_addr = receiver.local_addr().unwrap();

        let sender = VideoSender::start(
            Box::new(TestPatternSource::new(32, 24, 2)),
            relay_addr,
            QualityTier::P144,
            1.0,
        )
        .unwrap();

        let mut buf = [0u8; 65536];
        let received = receiver.recv_from(&mut buf).is_ok();
        sender.stop();

        assert!(!received);
        assert!(sender.frames_sent() >= 1);
        assert!(sender.bytes_sent() > 0);
    }

    #[test]
    fn disabled_sender_emits_nothing() {
        let receiver = UdpSocket::bind(("127.0.0.1", 0)).unwrap();
        receiver
            .set_read_timeout(Some(Duration::from_millis(500)))
            .unwrap();
        let relay_addr = receiver.local_addr().unwrap();

        let sender = VideoSender::start(
            Box::new(TestPatternSource::new(32, 24, 3)),
            relay_addr,
            QualityTier::P144,
            0.0,
        )
        .unwrap();
        sender.set_enabled(false);
        std::thread::sleep(Duration::from_millis(250));
        let before = sender.frames_sent();

        let mut buf = [0u8; 65536];
        let received = receiver.recv_from(&mut buf).is_ok();
        sender.stop();

        // A frame may have slipped out before the toggle; none after it
        let _ = received;
        assert_eq!(sender.frames_sent(), before);
    }
}
