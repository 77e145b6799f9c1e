//! Video receive → decode → latest-frame store pipeline
//!
//! Bound to an OS-assigned UDP port (announced via REGISTER_UDP). The loop
//! keeps per-sender sequence/arrival state for loss, jitter and FPS
//! accounting, decodes JPEG payloads and overwrites the latest frame per
//! source address. Playback is "display whatever is newest": nothing is
//! buffered and a failed decode leaves the store untouched.

use crate::client::media::{decode_jpeg, FrameSink, RawFrame};
use crate::protocol::headers::{VideoHeader, VIDEO_HEADER_LEN};
use crate::protocol::LOSS_GAP_CEILING;
use log::{debug, warn};
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::io;
use std::net::{SocketAddr, UdpSocket};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

/// Samples kept per sender for jitter and FPS windows.
const WINDOW: usize = 100;

/// Per-sender sequence and timing state.
#[derive(Default)]
pub(crate) struct StreamTracker {
    last_seq: Option<u32>,
    lost: u64,
    arrivals: VecDeque<Instant>,
    frame_times: VecDeque<Instant>,
}

impl StreamTracker {
    /// Account one received sequence number.
    ///
    /// Forward gaps below the noise ceiling count as loss; duplicates and
    /// reordered (backward) packets do not. Wraparound at 2^32 yields the
    /// true small gap, not its huge complement.
    pub(crate) fn record_sequence(&mut self, seq: u32) {
        if let Some(last) = self.last_seq {
            let expected = last.wrapping_add(1);
            let gap = seq.wrapping_sub(expected);
            if gap > 0 && gap < LOSS_GAP_CEILING {
                self.lost += gap as u64;
            }
        }
        self.last_seq = Some(seq);
    }

    pub(crate) fn record_arrival(&mut self, at: Instant) {
        if self.arrivals.len() == WINDOW {
            self.arrivals.pop_front();
        }
        self.arrivals.push_back(at);
    }

    pub(crate) fn record_frame(&mut self, at: Instant) {
        if self.frame_times.len() == WINDOW {
            self.frame_times.pop_front();
        }
        self.frame_times.push_back(at);
    }

    pub(crate) fn lost(&self) -> u64 {
        self.lost
    }

    /// Standard deviation of inter-arrival times, in milliseconds.
    pub(crate) fn jitter_ms(&self) -> f64 {
        if self.arrivals.len() < 2 {
            return 0.0;
        }
        let diffs: Vec<f64> = self
            .arrivals
            .iter()
            .zip(self.arrivals.iter().skip(1))
            .map(|(a, b)| b.duration_since(*a).as_secs_f64())
            .collect();
        let mean = diffs.iter().sum::<f64>() / diffs.len() as f64;
        let variance = diffs.iter().map(|d| (d - mean).powi(2)).sum::<f64>() / diffs.len() as f64;
        variance.sqrt() * 1000.0
    }

    /// Decoded-frame rate over the timestamp window.
    pub(crate) fn fps(&self) -> f64 {
        let (Some(first), Some(last)) = (self.frame_times.front(), self.frame_times.back()) else {
            return 0.0;
        };
        if self.frame_times.len() < 2 {
            return 0.0;
        }
        let span = last.duration_since(*first).as_secs_f64();
        if span <= 0.0 {
            return 0.0;
        }
        (self.frame_times.len() - 1) as f64 / span
    }
}

/// Aggregate receive-side metrics across all senders.
#[derive(Debug, Clone, Copy, Default)]
pub struct VideoReceiverStats {
    pub frames_received: u64,
    pub bytes_received: u64,
    pub frames_lost: u64,
    /// lost / (lost + received), clamped to 0-100
    pub loss_pct: f64,
    pub jitter_ms: f64,
    pub fps: f64,
}

struct Inner {
    running: AtomicBool,
    socket: UdpSocket,
    trackers: Mutex<HashMap<SocketAddr, StreamTracker>>,
    frames: Mutex<HashMap<SocketAddr, RawFrame>>,
    frames_received: AtomicU64,
    bytes_received: AtomicU64,
    sink: Option<Arc<dyn FrameSink>>,
}

/// Running video receiver. Shared by the session and the stats loop.
pub struct VideoReceiver {
    inner: Arc<Inner>,
    thread: Mutex<Option<JoinHandle<()>>>,
    port: u16,
}

impl VideoReceiver {
    /// Bind an OS-assigned port and start the receive loop.
    pub fn start(sink: Option<Arc<dyn FrameSink>>) -> io::Result<Self> {
        let socket = UdpSocket::bind(("0.0.0.0", 0))?;
        socket.set_read_timeout(Some(Duration::from_millis(100)))?;
        let port = socket.local_addr()?.port();

        let inner = Arc::new(Inner {
            running: AtomicBool::new(true),
            socket,
            trackers: Mutex::new(HashMap::new()),
            frames: Mutex::new(HashMap::new()),
            frames_received: AtomicU64::new(0),
            bytes_received: AtomicU64::new(0),
            sink,
        });

        let worker = inner.clone();
        let thread = std::thread::Builder::new()
            .name("video-recv".into())
            .spawn(move || receive_loop(worker))?;
        debug!("video receiver on port {}", port);
        Ok(Self {
            inner,
            thread: Mutex::new(Some(thread)),
            port,
        })
    }

    /// The OS-assigned port to announce in REGISTER_UDP.
    pub fn local_port(&self) -> u16 {
        self.port
    }

    /// Snapshot of the newest decoded frame per sender.
    pub fn latest_frames(&self) -> HashMap<SocketAddr, RawFrame> {
        self.inner.frames.lock().clone()
    }

    pub fn stats(&self) -> VideoReceiverStats {
        let trackers = self.inner.trackers.lock();
        let lost: u64 = trackers.values().map(|t| t.lost()).sum();
        let (jitter_sum, fps_sum, tracked) = trackers.values().fold(
            (0.0f64, 0.0f64, 0usize),
            |(j, f, n), t| (j + t.jitter_ms(), f + t.fps(), n + 1),
        );
        drop(trackers);

        let received = self.inner.frames_received.load(Ordering::Relaxed);
        let total = received + lost;
        let loss_pct = if total > 0 {
            (lost as f64 / total as f64 * 100.0).clamp(0.0, 100.0)
        } else {
            0.0
        };
        VideoReceiverStats {
            frames_received: received,
            bytes_received: self.inner.bytes_received.load(Ordering::Relaxed),
            frames_lost: lost,
            loss_pct,
            jitter_ms: if tracked > 0 {
                jitter_sum / tracked as f64
            } else {
                0.0
            },
            fps: fps_sum,
        }
    }

    pub fn stop(&self) {
        self.inner.running.store(false, Ordering::Relaxed);
        if let Some(thread) = self.thread.lock().take() {
            let _ = thread.join();
        }
    }
}

impl Drop for VideoReceiver {
    fn drop(&mut self) {
        self.stop();
    }
}

fn receive_loop(inner: Arc<Inner>) {
    let mut buf = vec![0u8; 65536];
    while inner.running.load(Ordering::Relaxed) {
        let (len, src) = match inner.socket.recv_from(&mut buf) {
            Ok(v) => v,
            // The short read timeout doubles as the cancellation check
            Err(e)
                if e.kind() == io::ErrorKind::WouldBlock
                    || e.kind() == io::ErrorKind::TimedOut =>
            {
                continue
            }
            Err(e) => {
                if inner.running.load(Ordering::Relaxed) {
                    warn!("video recv failed: {}", e);
                }
                break;
            }
        };
        process_packet(&inner, &buf[..len], src);
    }
    debug!("video receive loop exited");
}

fn process_packet(inner: &Inner, data: &[u8], src: SocketAddr) {
    let Some(header) = VideoHeader::unpack(data) else {
        return;
    };
    if header.payload_size < 0
        || data.len() - VIDEO_HEADER_LEN != header.payload_size as usize
    {
        debug!("video datagram from {} with bad payload size, dropped", src);
        return;
    }

    let now = Instant::now();
    {
        let mut trackers = inner.trackers.lock();
        let tracker = trackers.entry(src).or_default();
        tracker.record_sequence(header.sequence_num);
        tracker.record_arrival(now);
    }

    match decode_jpeg(&data[VIDEO_HEADER_LEN..]) {
        Ok(frame) => {
            if let Some(sink) = &inner.sink {
                sink.on_frame(src, &frame);
            }
            inner.frames.lock().insert(src, frame);
            inner.frames_received.fetch_add(1, Ordering::Relaxed);
            inner
                .bytes_received
                .fetch_add(data.len() as u64, Ordering::Relaxed);
            inner.trackers.lock().entry(src).or_default().record_frame(now);
        }
        Err(e) => debug!("undecodable frame from {}: {}", src, e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::media::{encode_jpeg, TestPatternSource, FrameSource};

    #[test]
    fn gap_counts_as_loss() {
        let mut tracker = StreamTracker::default();
        tracker.record_sequence(10);
        tracker.record_sequence(14); // 11, 12, 13 missing
        assert_eq!(tracker.lost(), 3);
    }

    #[test]
    fn duplicates_and_reorders_are_not_loss() {
        let mut tracker = StreamTracker::default();
        tracker.record_sequence(5);
        tracker.record_sequence(5); // duplicate
        assert_eq!(tracker.lost(), 0);
        tracker.record_sequence(3); // reorder, arrived late
        assert_eq!(tracker.lost(), 0);
    }

    #[test]
    fn loss_across_wraparound_sees_small_gap() {
        let mut tracker = StreamTracker::default();
        tracker.record_sequence(u32::MAX);
        tracker.record_sequence(1); // 0 missing: gap of exactly 1
        assert_eq!(tracker.lost(), 1);
    }

    #[test]
    fn huge_gaps_hit_the_noise_ceiling() {
        let mut tracker = StreamTracker::default();
        tracker.record_sequence(0);
        tracker.record_sequence(LOSS_GAP_CEILING + 5);
        assert_eq!(tracker.lost(), 0);
        // Just under the ceiling still counts
        let mut tracker = StreamTracker::default();
        tracker.record_sequence(0);
        tracker.record_sequence(LOSS_GAP_CEILING); // gap == ceiling - 1
        assert_eq!(tracker.lost(), (LOSS_GAP_CEILING - 1) as u64);
    }

    #[test]
    fn uniform_arrivals_have_zero_jitter() {
        let mut tracker = StreamTracker::default();
        let base = Instant::now();
        for i in 0..10 {
            tracker.record_arrival(base + Duration::from_millis(i * 20));
        }
        assert!(tracker.jitter_ms() < 1e-6);
    }

    #[test]
    fn alternating_arrivals_have_positive_jitter() {
        let mut tracker = StreamTracker::default();
        let base = Instant::now();
        let mut at = base;
        for i in 0..10 {
            at += Duration::from_millis(if i % 2 == 0 { 10 } else { 40 });
            tracker.record_arrival(at);
        }
        assert!(tracker.jitter_ms() > 5.0);
    }

    #[test]
    fn fps_over_frame_window() {
        let mut tracker = StreamTracker::default();
        let base = Instant::now();
        for i in 0..11 {
            tracker.record_frame(base + Duration::from_millis(i * 100));
        }
        // 10 intervals over one second
        assert!((tracker.fps() - 10.0).abs() < 0.01);
    }

    #[test]
    fn end_to_end_stores_latest_frame_per_sender() {
        let receiver = VideoReceiver::start(None).unwrap();
        let port = receiver.local_port();
        let sender = UdpSocket::bind(("127.0.0.1", 0)).unwrap();
        let target = SocketAddr::from(([127, 0, 0, 1], port));

        let mut source = TestPatternSource::new(32, 24, 1);
        let frame = source.next_frame().unwrap();
        let payload = encode_jpeg(&frame, 32, 24, 70).unwrap();
        let header = VideoHeader {
            frame_id: 0,
            timestamp_us: 1,
            sequence_num: 0,
            width: 32,
            height: 24,
            payload_size: payload.len() as i32,
        };
        let mut packet = header.pack().to_vec();
        packet.extend_from_slice(&payload);
        sender.send_to(&packet, target).unwrap();

        // Second packet with a sequence gap of 2
        let mut gapped = packet.clone();
        gapped[12..16].copy_from_slice(&3u32.to_be_bytes());
        sender.send_to(&gapped, target).unwrap();

        let deadline = Instant::now() + Duration::from_secs(3);
        while receiver.stats().frames_received < 2 && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(20));
        }
        let stats = receiver.stats();
        let frames = receiver.latest_frames();
        receiver.stop();

        assert_eq!(stats.frames_received, 2);
        assert_eq!(stats.frames_lost, 2);
        assert_eq!(frames.len(), 1);
        let stored = frames.values().next().unwrap();
        assert_eq!((stored.width, stored.height), (32, 24));
    }
}
