//! Audio receive → playback pipeline
//!
//! Two workers: the receive loop parses headers, tracks per-sender loss and
//! feeds PCM into a bounded queue; the playback loop drains the queue into
//! the audio sink, writing one chunk of silence when the queue runs dry so
//! the sink never stalls. A full queue drops the incoming chunk.

use crate::client::media::AudioSink;
use crate::protocol::headers::{AudioHeader, AUDIO_HEADER_LEN};
use crate::protocol::{AUDIO_CHANNELS, AUDIO_CHUNK_SAMPLES, LOSS_GAP_CEILING};
use crossbeam::channel::{bounded, Receiver, RecvTimeoutError, Sender, TrySendError};
use log::{debug, warn};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::io;
use std::net::{SocketAddr, UdpSocket};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

/// Playback queue depth, in chunks.
const QUEUE_DEPTH: usize = 50;

#[derive(Default)]
struct SenderState {
    last_audio_id: Option<u32>,
}

struct Inner {
    running: AtomicBool,
    socket: UdpSocket,
    senders: Mutex<HashMap<SocketAddr, SenderState>>,
    packets_received: AtomicU64,
    bytes_received: AtomicU64,
    packets_lost: AtomicU64,
    queue_dropped: AtomicU64,
}

/// Aggregate audio receive metrics.
#[derive(Debug, Clone, Copy, Default)]
pub struct AudioReceiverStats {
    pub packets_received: u64,
    pub bytes_received: u64,
    pub packets_lost: u64,
    pub loss_pct: f64,
    /// Chunks discarded because the playback queue was full
    pub queue_dropped: u64,
}

/// Running audio receiver with its playback worker.
pub struct AudioReceiver {
    inner: Arc<Inner>,
    receive_thread: Mutex<Option<JoinHandle<()>>>,
    playback_thread: Mutex<Option<JoinHandle<()>>>,
    port: u16,
}

impl AudioReceiver {
    /// Bind an OS-assigned port and start the receive and playback loops.
    pub fn start(sink: Box<dyn AudioSink>) -> io::Result<Self> {
        let socket = UdpSocket::bind(("0.0.0.0", 0))?;
        socket.set_read_timeout(Some(Duration::from_millis(100)))?;
        let port = socket.local_addr()?.port();

        let inner = Arc::new(Inner {
            running: AtomicBool::new(true),
            socket,
            senders: Mutex::new(HashMap::new()),
            packets_received: AtomicU64::new(0),
            bytes_received: AtomicU64::new(0),
            packets_lost: AtomicU64::new(0),
            queue_dropped: AtomicU64::new(0),
        });
        let (queue_tx, queue_rx) = bounded::<Vec<i16>>(QUEUE_DEPTH);

        let recv_inner = inner.clone();
        let receive_thread = std::thread::Builder::new()
            .name("audio-recv".into())
            .spawn(move || receive_loop(recv_inner, queue_tx))?;

        let play_inner = inner.clone();
        let playback_thread = std::thread::Builder::new()
            .name("audio-play".into())
            .spawn(move || playback_loop(play_inner, queue_rx, sink))?;

        debug!("audio receiver on port {}", port);
        Ok(Self {
            inner,
            receive_thread: Mutex::new(Some(receive_thread)),
            playback_thread: Mutex::new(Some(playback_thread)),
            port,
        })
    }

    /// The OS-assigned port to announce in REGISTER_UDP.
    pub fn local_port(&self) -> u16 {
        self.port
    }

    pub fn stats(&self) -> AudioReceiverStats {
        let received = self.inner.packets_received.load(Ordering::Relaxed);
        let lost = self.inner.packets_lost.load(Ordering::Relaxed);
        let total = received + lost;
        AudioReceiverStats {
            packets_received: received,
            bytes_received: self.inner.bytes_received.load(Ordering::Relaxed),
            packets_lost: lost,
            loss_pct: if total > 0 {
                (lost as f64 / total as f64 * 100.0).clamp(0.0, 100.0)
            } else {
                0.0
            },
            queue_dropped: self.inner.queue_dropped.load(Ordering::Relaxed),
        }
    }

    pub fn stop(&self) {
        self.inner.running.store(false, Ordering::Relaxed);
        if let Some(thread) = self.receive_thread.lock().take() {
            let _ = thread.join();
        }
        if let Some(thread) = self.playback_thread.lock().take() {
            let _ = thread.join();
        }
    }
}

impl Drop for AudioReceiver {
    fn drop(&mut self) {
        self.stop();
    }
}

fn receive_loop(inner: Arc<Inner>, queue: Sender<Vec<i16>>) {
    let mut buf = vec![0u8; 65536];
    while inner.running.load(Ordering::Relaxed) {
        let (len, src) = match inner.socket.recv_from(&mut buf) {
            Ok(v) => v,
            Err(e)
                if e.kind() == io::ErrorKind::WouldBlock
                    || e.kind() == io::ErrorKind::TimedOut =>
            {
                continue
            }
            Err(e) => {
                if inner.running.load(Ordering::Relaxed) {
                    warn!("audio recv failed: {}", e);
                }
                break;
            }
        };
        process_packet(&inner, &buf[..len], src, &queue);
    }
    debug!("audio receive loop exited");
}

fn process_packet(inner: &Inner, data: &[u8], src: SocketAddr, queue: &Sender<Vec<i16>>) {
    let Some(header) = AudioHeader::unpack(data) else {
        return;
    };
    if header.payload_size < 0 || data.len() - AUDIO_HEADER_LEN != header.payload_size as usize {
        debug!("audio datagram from {} with bad payload size, dropped", src);
        return;
    }

    {
        let mut senders = inner.senders.lock();
        let state = senders.entry(src).or_default();
        if let Some(last) = state.last_audio_id {
            let expected = last.wrapping_add(1);
            let gap = header.audio_id.wrapping_sub(expected);
            if gap > 0 && gap < LOSS_GAP_CEILING {
                inner.packets_lost.fetch_add(gap as u64, Ordering::Relaxed);
            }
        }
        state.last_audio_id = Some(header.audio_id);
    }

    let payload = &data[AUDIO_HEADER_LEN..];
    let samples: Vec<i16> = payload
        .chunks_exact(2)
        .map(|pair| i16::from_le_bytes([pair[0], pair[1]]))
        .collect();

    match queue.try_send(samples) {
        Ok(()) => {
            inner.packets_received.fetch_add(1, Ordering::Relaxed);
            inner
                .bytes_received
                .fetch_add(data.len() as u64, Ordering::Relaxed);
        }
        Err(TrySendError::Full(_)) => {
            inner.packets_received.fetch_add(1, Ordering::Relaxed);
            inner.queue_dropped.fetch_add(1, Ordering::Relaxed);
        }
        Err(TrySendError::Disconnected(_)) => {}
    }
}

fn playback_loop(inner: Arc<Inner>, queue: Receiver<Vec<i16>>, mut sink: Box<dyn AudioSink>) {
    let silence = vec![0i16; AUDIO_CHUNK_SAMPLES * AUDIO_CHANNELS as usize];
    while inner.running.load(Ordering::Relaxed) {
        match queue.recv_timeout(Duration::from_millis(10)) {
            Ok(samples) => {
                if let Err(e) = sink.play(&samples) {
                    warn!("audio playback failed: {}", e);
                }
            }
            Err(RecvTimeoutError::Timeout) => {
                // Keep the device fed so it never underruns audibly
                if sink.play(&silence).is_err() {
                    break;
                }
            }
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }
    debug!("audio playback loop exited");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::media::MediaError;
    use crate::protocol::AUDIO_SAMPLE_RATE;
    use std::sync::mpsc;

    /// Sink that forwards played chunks to the test thread.
    struct ProbeSink(mpsc::Sender<Vec<i16>>);

    impl AudioSink for ProbeSink {
        fn play(&mut self, samples: &[i16]) -> Result<(), MediaError> {
            let _ = self.0.send(samples.to_vec());
            Ok(())
        }
    }

    fn audio_packet(audio_id: u32, samples: &[i16]) -> Vec<u8> {
        let mut payload = Vec::with_capacity(samples.len() * 2);
        for s in samples {
            payload.extend_from_slice(&s.to_le_bytes());
        }
        let header = AudioHeader {
            audio_id,
            timestamp_us: 0,
            sample_rate: AUDIO_SAMPLE_RATE,
            channels: AUDIO_CHANNELS,
            payload_size: payload.len() as i32,
        };
        let mut packet = header.pack().to_vec();
        packet.extend_from_slice(&payload);
        packet
    }

    #[test]
    fn received_pcm_reaches_the_sink() {
        let (probe_tx, probe_rx) = mpsc::channel();
        let receiver = AudioReceiver::start(Box::new(ProbeSink(probe_tx))).unwrap();
        let target = SocketAddr::from(([127, 0, 0, 1], receiver.local_port()));
        let sender = UdpSocket::bind(("127.0.0.1", 0)).unwrap();

        let samples: Vec<i16> = (0..256).map(|i| (i * 3 - 128) as i16).collect();
        sender.send_to(&audio_packet(0, &samples), target).unwrap();

        // Skip silence fills until our pattern comes through
        let deadline = std::time::Instant::now() + Duration::from_secs(3);
        let mut matched = false;
        while std::time::Instant::now() < deadline {
            match probe_rx.recv_timeout(Duration::from_millis(200)) {
                Ok(chunk) if chunk == samples => {
                    matched = true;
                    break;
                }
                Ok(_) => continue,
                Err(_) => break,
            }
        }
        receiver.stop();
        assert!(matched, "sent PCM never reached the sink");
    }

    #[test]
    fn audio_id_gaps_count_as_loss() {
        let receiver = AudioReceiver::start(Box::new(crate::client::media::NullAudioSink)).unwrap();
        let target = SocketAddr::from(([127, 0, 0, 1], receiver.local_port()));
        let sender = UdpSocket::bind(("127.0.0.1", 0)).unwrap();
        let samples = vec![0i16; 64];

        sender.send_to(&audio_packet(0, &samples), target).unwrap();
        sender.send_to(&audio_packet(4, &samples), target).unwrap(); // 1,2,3 missing

        let deadline = std::time::Instant::now() + Duration::from_secs(3);
        while receiver.stats().packets_received < 2 && std::time::Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(20));
        }
        let stats = receiver.stats();
        receiver.stop();

        assert_eq!(stats.packets_received, 2);
        assert_eq!(stats.packets_lost, 3);
    }
}
