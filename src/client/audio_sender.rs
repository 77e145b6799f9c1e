//! Audio capture → send pipeline
//!
//! Reads fixed-size PCM chunks from the audio source, prefixes the audio
//! header and sends each chunk as one datagram. A muted sender sleeps for
//! one chunk period and emits nothing.

use crate::client::media::AudioSource;
use crate::protocol::headers::AudioHeader;
use crate::protocol::{AUDIO_CHANNELS, AUDIO_CHUNK_SAMPLES, AUDIO_SAMPLE_RATE};
use log::{debug, info, warn};
use parking_lot::Mutex;
use std::io;
use std::net::{SocketAddr, UdpSocket};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Duration of one PCM chunk at the configured rate.
pub fn chunk_period() -> Duration {
    Duration::from_micros(AUDIO_CHUNK_SAMPLES as u64 * 1_000_000 / AUDIO_SAMPLE_RATE as u64)
}

struct Inner {
    running: AtomicBool,
    enabled: AtomicBool,
    source: Mutex<Box<dyn AudioSource>>,
    packets_sent: AtomicU64,
    bytes_sent: AtomicU64,
}

/// Running audio sender.
pub struct AudioSender {
    inner: Arc<Inner>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl AudioSender {
    pub fn start(source: Box<dyn AudioSource>, relay_addr: SocketAddr) -> io::Result<Self> {
        let socket = UdpSocket::bind(("0.0.0.0", 0))?;
        let inner = Arc::new(Inner {
            running: AtomicBool::new(true),
            enabled: AtomicBool::new(true),
            source: Mutex::new(source),
            packets_sent: AtomicU64::new(0),
            bytes_sent: AtomicU64::new(0),
        });

        let worker = inner.clone();
        let thread = std::thread::Builder::new()
            .name("audio-send".into())
            .spawn(move || send_loop(worker, socket, relay_addr))?;
        info!(
            "audio sender started: {} Hz, {} channel(s)",
            AUDIO_SAMPLE_RATE, AUDIO_CHANNELS
        );
        Ok(Self {
            inner,
            thread: Mutex::new(Some(thread)),
        })
    }

    /// Mute or unmute the microphone.
    pub fn set_enabled(&self, enabled: bool) {
        self.inner.enabled.store(enabled, Ordering::Relaxed);
    }

    pub fn is_enabled(&self) -> bool {
        self.inner.enabled.load(Ordering::Relaxed)
    }

    pub fn packets_sent(&self) -> u64 {
        self.inner.packets_sent.load(Ordering::Relaxed)
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

impl Drop for AudioSender {
    fn drop(&mut self) {
        self.stop();
    }
}

fn send_loop(inner: Arc<Inner>, socket: UdpSocket, relay_addr: SocketAddr) {
    let mut audio_id: u32 = 0;
    let mut samples = vec![0i16; AUDIO_CHUNK_SAMPLES * AUDIO_CHANNELS as usize];

    while inner.running.load(Ordering::Relaxed) {
        if !inner.enabled.load(Ordering::Relaxed) {
            std::thread::sleep(chunk_period());
            continue;
        }

        let read = match inner.source.lock().read_chunk(&mut samples) {
            Ok(n) => n,
            Err(e) => {
                warn!("audio capture failed: {}", e);
                std::thread::sleep(Duration::from_millis(100));
                continue;
            }
        };
        if read == 0 {
            continue;
        }

        // 16-bit signed little-endian on the wire
        let mut payload = Vec::with_capacity(read * 2);
        for sample in &samples[..read] {
            payload.extend_from_slice(&sample.to_le_bytes());
        }

        let timestamp_us = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_micros() as u64)
            .unwrap_or(0);
        let header = AudioHeader {
            audio_id,
            timestamp_us,
            sample_rate: AUDIO_SAMPLE_RATE,
            channels: AUDIO_CHANNELS,
            payload_size: payload.len() as i32,
        };
        let mut packet = Vec::with_capacity(19 + payload.len());
        packet.extend_from_slice(&header.pack());
        packet.extend_from_slice(&payload);

        if let Err(e) = socket.send_to(&packet, relay_addr) {
            debug!("audio send failed: {}", e);
        }
        audio_id = audio_id.wrapping_add(1);
        inner.packets_sent.fetch_add(1, Ordering::Relaxed);
        inner
            .bytes_sent
            .fetch_add(packet.len() as u64, Ordering::Relaxed);
    }
    debug!("audio send loop exited");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::media::SilenceSource;
    use crate::protocol::headers::{classify, MediaKind, AUDIO_HEADER_LEN};

    #[test]
    fn sends_classifiable_audio_datagrams() {
        let receiver = UdpSocket::bind(("127.0.0.1", 0)).unwrap();
        receiver
            .set_read_timeout(Some(Duration::from_secs(3)))
            .unwrap();
        let relay_addr = receiver.local_addr().unwrap();

        let sender = AudioSender::start(Box::new(SilenceSource), relay_addr).unwrap();

        let mut buf = [0u8; 65536];
        let (len, _) = receiver.recv_from(&mut buf).unwrap();
        sender.stop();

        let data = &buf[..len];
        assert_eq!(classify(data), Some(MediaKind::Audio));
        let header = AudioHeader::unpack(data).unwrap();
        assert_eq!(header.sample_rate, AUDIO_SAMPLE_RATE);
        assert_eq!(header.channels, AUDIO_CHANNELS);
        assert_eq!(len - AUDIO_HEADER_LEN, header.payload_size as usize);
        assert_eq!(
            header.payload_size as usize,
            AUDIO_CHUNK_SAMPLES * AUDIO_CHANNELS as usize * 2
        );
    }

    #[test]
    fn muted_sender_emits_nothing() {
        let receiver = UdpSocket::bind(("127.0.0.1", 0)).unwrap();
        receiver
            .set_read_timeout(Some(Duration::from_millis(300)))
            .unwrap();
        let relay_addr = receiver.local_addr().unwrap();

        let sender = AudioSender::start(Box::new(SilenceSource), relay_addr).unwrap();
        sender.set_enabled(false);
        std::thread::sleep(Duration::from_millis(80));
        let baseline = sender.packets_sent();

        std::thread::sleep(Duration::from_millis(200));
        assert_eq!(sender.packets_sent(), baseline);
        sender.stop();
    }
}
