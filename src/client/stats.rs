//! Stats collection, heartbeat RTT and quality adaptation
//!
//! One worker ticking every second: sends a HEARTBEAT, samples the media
//! pipelines, pushes a bounded history per metric, re-evaluates the quality
//! tier from loss and RTT and reports telemetry to the server.

use super::audio_receiver::AudioReceiver;
use super::control::ControlChannel;
use super::events::{ClientEvent, EventBus};
use super::video_receiver::VideoReceiver;
use super::video_sender::VideoSender;
use crate::protocol::{ControlMessage, QualityTier};
use log::{debug, warn};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

/// Tick period of the collection loop.
pub const STATS_INTERVAL: Duration = Duration::from_secs(1);
/// Samples kept per metric (one minute at the tick rate).
const HISTORY_DEPTH: usize = 60;

/// One tick's worth of metrics.
#[derive(Debug, Clone, Copy)]
pub struct StatsSnapshot {
    pub loss_pct: f64,
    pub jitter_ms: f64,
    pub fps_sent: f64,
    pub fps_received: f64,
    pub bitrate_kbps: f64,
    pub rtt_ms: f64,
    pub audio_loss_pct: f64,
    pub tier: QualityTier,
}

/// Bounded per-metric history for graphing.
#[derive(Debug, Default, Clone)]
pub struct StatsHistory {
    pub rtt_ms: VecDeque<f64>,
    pub loss_pct: VecDeque<f64>,
    pub jitter_ms: VecDeque<f64>,
    pub fps_received: VecDeque<f64>,
    pub bitrate_kbps: VecDeque<f64>,
}

impl StatsHistory {
    fn push(&mut self, snapshot: &StatsSnapshot) {
        for (series, value) in [
            (&mut self.rtt_ms, snapshot.rtt_ms),
            (&mut self.loss_pct, snapshot.loss_pct),
            (&mut self.jitter_ms, snapshot.jitter_ms),
            (&mut self.fps_received, snapshot.fps_received),
            (&mut self.bitrate_kbps, snapshot.bitrate_kbps),
        ] {
            if series.len() == HISTORY_DEPTH {
                series.pop_front();
            }
            series.push_back(value);
        }
    }
}

struct Shared {
    running: AtomicBool,
    history: Mutex<StatsHistory>,
    latest: Mutex<Option<StatsSnapshot>>,
}

/// Running stats/adaptation worker.
pub struct StatsCollector {
    shared: Arc<Shared>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl StatsCollector {
    /// Spawn the 1 Hz loop. `rtt_ms` is fed by the session from
    /// HEARTBEAT_ACK echoes; `control` is None in tests without a server.
    pub fn start(
        video_sender: Arc<VideoSender>,
        video_receiver: Arc<VideoReceiver>,
        audio_receiver: Arc<AudioReceiver>,
        control: Option<Arc<ControlChannel>>,
        rtt_ms: Arc<Mutex<f64>>,
        bus: EventBus,
    ) -> std::io::Result<Self> {
        let shared = Arc::new(Shared {
            running: AtomicBool::new(true),
            history: Mutex::new(StatsHistory::default()),
            latest: Mutex::new(None),
        });

        let worker = shared.clone();
        let thread = std::thread::Builder::new()
            .name("stats".into())
            .spawn(move || {
                collection_loop(
                    worker,
                    video_sender,
                    video_receiver,
                    audio_receiver,
                    control,
                    rtt_ms,
                    bus,
                )
            })?;
        Ok(Self {
            shared,
            thread: Mutex::new(Some(thread)),
        })
    }

    pub fn latest(&self) -> Option<StatsSnapshot> {
        *self.shared.latest.lock()
    }

    pub fn history(&self) -> StatsHistory {
        self.shared.history.lock().clone()
    }

    pub fn stop(&self) {
        self.shared.running.store(false, Ordering::Relaxed);
        if let Some(thread) = self.thread.lock().take() {
            let _ = thread.join();
        }
    }
}

impl Drop for StatsCollector {
    fn drop(&mut self) {
        self.stop();
    }
}

fn epoch_seconds() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

#[allow(clippy::too_many_arguments)]
fn collection_loop(
    shared: Arc<Shared>,
    video_sender: Arc<VideoSender>,
    video_receiver: Arc<VideoReceiver>,
    audio_receiver: Arc<AudioReceiver>,
    control: Option<Arc<ControlChannel>>,
    rtt_ms: Arc<Mutex<f64>>,
    bus: EventBus,
) {
    let mut last_tick = Instant::now();
    let mut last_frames = video_sender.frames_sent();
    let mut last_bytes = video_sender.bytes_sent();

    while shared.running.load(Ordering::Relaxed) {
        std::thread::sleep(STATS_INTERVAL.saturating_sub(last_tick.elapsed()));
        if !shared.running.load(Ordering::Relaxed) {
            break;
        }
        let dt = last_tick.elapsed().as_secs_f64().max(1e-6);
        last_tick = Instant::now();

        // RTT probe; the ACK is handled by the session's dispatch loop
        if let Some(control) = &control {
            if let Err(e) = control.send(&ControlMessage::Heartbeat {
                timestamp: epoch_seconds(),
            }) {
                debug!("heartbeat not sent: {}", e);
            }
        }

        let frames = video_sender.frames_sent();
        let bytes = video_sender.bytes_sent();
        let fps_sent = (frames - last_frames) as f64 / dt;
        let bitrate_kbps = (bytes - last_bytes) as f64 * 8.0 / dt / 1000.0;
        last_frames = frames;
        last_bytes = bytes;

        let recv = video_receiver.stats();
        let audio = audio_receiver.stats();
        let rtt = *rtt_ms.lock();

        let snapshot = StatsSnapshot {
            loss_pct: recv.loss_pct,
            jitter_ms: recv.jitter_ms,
            fps_sent,
            fps_received: recv.fps,
            bitrate_kbps,
            rtt_ms: rtt,
            audio_loss_pct: audio.loss_pct,
            tier: video_sender.quality(),
        };

        // Pure function of loss and RTT, re-evaluated every tick
        let target = QualityTier::select(snapshot.loss_pct, snapshot.rtt_ms);
        if target != video_sender.quality() {
            video_sender.set_quality(target);
            bus.emit(ClientEvent::QualityChanged { tier: target });
        }

        shared.history.lock().push(&snapshot);
        *shared.latest.lock() = Some(StatsSnapshot {
            tier: video_sender.quality(),
            ..snapshot
        });
        bus.emit(ClientEvent::StatsUpdated(snapshot));

        if let Some(control) = &control {
            let telemetry = ControlMessage::VideoStats {
                loss: round2(snapshot.loss_pct),
                rtt: round2(snapshot.rtt_ms),
                fps_recv: round2(snapshot.fps_received),
                bitrate: round2(snapshot.bitrate_kbps),
            };
            if let Err(e) = control.send(&telemetry) {
                warn!("telemetry not sent: {}", e);
            }
        }
    }
    debug!("stats loop exited");
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::media::{NullAudioSink, TestPatternSource};

    #[test]
    fn history_is_bounded() {
        let mut history = StatsHistory::default();
        let snapshot = StatsSnapshot {
            loss_pct: 1.0,
            jitter_ms: 2.0,
            fps_sent: 3.0,
            fps_received: 4.0,
            bitrate_kbps: 5.0,
            rtt_ms: 6.0,
            audio_loss_pct: 0.0,
            tier: QualityTier::P480,
        };
        for _ in 0..(HISTORY_DEPTH + 10) {
            history.push(&snapshot);
        }
        assert_eq!(history.rtt_ms.len(), HISTORY_DEPTH);
        assert_eq!(history.bitrate_kbps.len(), HISTORY_DEPTH);
    }

    #[test]
    fn collector_produces_snapshots_without_a_server() {
        let sink_addr = std::net::UdpSocket::bind(("127.0.0.1", 0))
            .unwrap()
            .local_addr()
            .unwrap();
        let video_sender = Arc::new(
            VideoSender::start(
                Box::new(TestPatternSource::new(32, 24, 1)),
                sink_addr,
                QualityTier::P144,
                0.0,
            )
            .unwrap(),
        );
        let video_receiver = Arc::new(VideoReceiver::start(None).unwrap());
        let audio_receiver = Arc::new(AudioReceiver::start(Box::new(NullAudioSink)).unwrap());
        let (bus, events) = EventBus::new();

        let collector = StatsCollector::start(
            video_sender.clone(),
            video_receiver.clone(),
            audio_receiver.clone(),
            None,
            Arc::new(Mutex::new(0.0)),
            bus,
        )
        .unwrap();

        let deadline = Instant::now() + Duration::from_secs(5);
        let mut saw_snapshot = false;
        while Instant::now() < deadline {
            if let Ok(ClientEvent::StatsUpdated(snapshot)) =
                events.recv_timeout(Duration::from_millis(200))
            {
                // Clean link at zero RTT selects the top tier
                assert_eq!(snapshot.loss_pct, 0.0);
                saw_snapshot = true;
                break;
            }
        }
        collector.stop();
        video_sender.stop();
        video_receiver.stop();
        audio_receiver.stop();
        assert!(saw_snapshot, "no stats snapshot within the deadline");

        // With zero loss and low RTT the adaptive target is 480p
        assert_eq!(video_sender.quality(), QualityTier::P480);
    }
}
