//! Congestion-controlled bulk file transport
//!
//! Overlaid on the (already reliable) TCP control channel: a Reno-style
//! window caps the application-layer rate, produces observable cwnd/RTT
//! curves and drives application-level retransmission. Chunks travel as
//! base64 inside FILE_CHUNK frames; the receiver writes each chunk at
//! `chunk_id * BASE_CHUNK_SIZE` so duplicates overwrite in place, and
//! verifies an MD5 digest at the end.

use super::control::{ControlChannel, ControlError};
use super::events::{ClientEvent, EventBus};
use crate::protocol::{
    ControlMessage, BASE_CHUNK_SIZE, INITIAL_CWND, INITIAL_SSTHRESH, MAX_CWND,
};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use log::{debug, info, warn};
use md5::{Digest, Md5};
use parking_lot::Mutex;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::error::Error;
use std::fmt;
use std::fs::{self, File};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// RTO before the first RTT sample arrives.
const DEFAULT_RTO_S: f64 = 2.0;
/// RTO floor.
const MIN_RTO_S: f64 = 1.0;
/// Idle wait when the window is full.
const WINDOW_POLL: Duration = Duration::from_millis(10);
/// Progress events are emitted once per this many chunks.
const PROGRESS_STRIDE: u32 = 16;

/// File transfer failures.
#[derive(Debug)]
pub enum FileTransferError {
    /// Another transfer is already running
    AlreadyInProgress,
    /// The path has no usable file name
    InvalidPath(PathBuf),
    Io(io::Error),
    Control(ControlError),
}

impl fmt::Display for FileTransferError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FileTransferError::AlreadyInProgress => write!(f, "a transfer is already in progress"),
            FileTransferError::InvalidPath(p) => write!(f, "not a sendable file: {}", p.display()),
            FileTransferError::Io(e) => write!(f, "file error: {}", e),
            FileTransferError::Control(e) => write!(f, "control channel error: {}", e),
        }
    }
}

impl Error for FileTransferError {}

impl From<io::Error> for FileTransferError {
    fn from(e: io::Error) -> Self {
        FileTransferError::Io(e)
    }
}

impl From<ControlError> for FileTransferError {
    fn from(e: ControlError) -> Self {
        FileTransferError::Control(e)
    }
}

/// Reno window state with Jacobson/Karn timing. Pure bookkeeping; the
/// sender drives it from ACKs and timeouts.
#[derive(Debug, Clone)]
pub(crate) struct RenoWindow {
    cwnd: f64,
    ssthresh: f64,
    srtt: Option<f64>,
    rttvar: f64,
    rto: f64,
}

impl RenoWindow {
    pub(crate) fn new() -> Self {
        Self {
            cwnd: INITIAL_CWND,
            ssthresh: INITIAL_SSTHRESH,
            srtt: None,
            rttvar: 0.0,
            rto: DEFAULT_RTO_S,
        }
    }

    /// Window growth on a new (non-duplicate) ACK: exponential in slow
    /// start, `+1/cwnd` in congestion avoidance, capped at MAX_CWND.
    pub(crate) fn on_new_ack(&mut self) {
        if self.cwnd < self.ssthresh {
            self.cwnd = (self.cwnd + 1.0).min(MAX_CWND);
        } else {
            self.cwnd = (self.cwnd + 1.0 / self.cwnd).min(MAX_CWND);
        }
    }

    /// Fold one RTT sample (seconds) into SRTT/RTTVAR and refresh the RTO.
    pub(crate) fn on_rtt_sample(&mut self, sample: f64) {
        let srtt = match self.srtt {
            None => {
                self.rttvar = sample / 2.0;
                sample
            }
            Some(prev) => {
                self.rttvar = 0.75 * self.rttvar + 0.25 * (sample - prev).abs();
                0.875 * prev + 0.125 * sample
            }
        };
        self.srtt = Some(srtt);
        self.rto = (srtt + 4.0 * self.rttvar).max(MIN_RTO_S);
    }

    /// Multiplicative decrease on a retransmission timeout.
    pub(crate) fn on_timeout(&mut self) {
        self.ssthresh = (self.cwnd / 2.0).max(1.0);
        self.cwnd = INITIAL_CWND;
    }

    /// How many chunks may be in flight.
    pub(crate) fn window(&self) -> usize {
        self.cwnd.floor() as usize
    }

    pub(crate) fn cwnd(&self) -> f64 {
        self.cwnd
    }

    pub(crate) fn ssthresh(&self) -> f64 {
        self.ssthresh
    }

    pub(crate) fn rto(&self) -> f64 {
        self.rto
    }

    pub(crate) fn srtt(&self) -> Option<f64> {
        self.srtt
    }
}

struct TransferState {
    window: RenoWindow,
    unacked: BTreeSet<u32>,
    send_times: HashMap<u32, Instant>,
    /// Karn: chunks that were retransmitted never contribute RTT samples
    retransmitted: HashSet<u32>,
    last_ack_time: Instant,
    acked: u32,
    dup_acks: u64,
    cwnd_history: Vec<f64>,
    rtt_history_ms: Vec<f64>,
}

impl TransferState {
    fn fresh() -> Self {
        let window = RenoWindow::new();
        let cwnd_history = vec![window.cwnd()];
        Self {
            window,
            unacked: BTreeSet::new(),
            send_times: HashMap::new(),
            retransmitted: HashSet::new(),
            last_ack_time: Instant::now(),
            acked: 0,
            dup_acks: 0,
            cwnd_history,
            rtt_history_ms: Vec::new(),
        }
    }
}

/// Observability snapshot of the sender.
#[derive(Debug, Clone, Default)]
pub struct FileSenderStats {
    pub cwnd: f64,
    pub ssthresh: f64,
    pub rto_s: f64,
    pub srtt_s: Option<f64>,
    pub chunks_acked: u32,
    pub dup_acks: u64,
    pub cwnd_history: Vec<f64>,
    pub rtt_history_ms: Vec<f64>,
}

/// Sends files over the control channel under a Reno window.
pub struct FileSender {
    control: Arc<ControlChannel>,
    bus: EventBus,
    state: Mutex<TransferState>,
    in_progress: AtomicBool,
}

impl FileSender {
    pub fn new(control: Arc<ControlChannel>, bus: EventBus) -> Self {
        Self {
            control,
            bus,
            state: Mutex::new(TransferState::fresh()),
            in_progress: AtomicBool::new(false),
        }
    }

    /// Send one file to `target` ("Everyone" or a display name). Blocks
    /// until every chunk is acknowledged and FILE_END is out; run it on a
    /// dedicated thread.
    pub fn send_file(&self, path: &Path, target: &str) -> Result<(), FileTransferError> {
        if self.in_progress.swap(true, Ordering::SeqCst) {
            return Err(FileTransferError::AlreadyInProgress);
        }
        let result = self.send_file_inner(path, target);
        self.in_progress.store(false, Ordering::SeqCst);
        result
    }

    fn send_file_inner(&self, path: &Path, target: &str) -> Result<(), FileTransferError> {
        let filename = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .ok_or_else(|| FileTransferError::InvalidPath(path.to_path_buf()))?;
        let data = fs::read(path)?;
        let filesize = data.len() as u64;
        let total_chunks = ((data.len() + BASE_CHUNK_SIZE - 1) / BASE_CHUNK_SIZE) as u32;

        *self.state.lock() = TransferState::fresh();
        info!(
            "sending {:?} ({} bytes, {} chunks) to {:?}",
            filename, filesize, total_chunks, target
        );
        self.control.send(&ControlMessage::FileStart {
            filename: filename.clone(),
            filesize,
            chunk_size: BASE_CHUNK_SIZE as u32,
            target_name: target.to_string(),
        })?;

        let mut next_chunk: u32 = 0;
        while self.state.lock().acked < total_chunks {
            self.check_timeout(&data, target)?;

            let can_send = {
                let state = self.state.lock();
                next_chunk < total_chunks && state.unacked.len() < state.window.window()
            };
            if can_send {
                self.transmit_chunk(next_chunk, &data, target, false)?;
                next_chunk += 1;
                if next_chunk % PROGRESS_STRIDE == 0 {
                    self.emit_progress(&filename, filesize);
                }
            } else {
                std::thread::sleep(WINDOW_POLL);
            }
        }

        let checksum = md5_hex(&data);
        self.control.send(&ControlMessage::FileEnd {
            checksum,
            target_name: target.to_string(),
        })?;
        self.bus.emit(ClientEvent::FileProgress {
            filename: filename.clone(),
            bytes_done: filesize,
            total: filesize,
        });
        info!("file {:?} fully acknowledged and finished", filename);
        Ok(())
    }

    /// No ACK for a full RTO: halve ssthresh, collapse the window and
    /// retransmit the first unacknowledged chunk.
    fn check_timeout(&self, data: &[u8], target: &str) -> Result<(), FileTransferError> {
        let retransmit = {
            let mut state = self.state.lock();
            if state.unacked.is_empty()
                || state.last_ack_time.elapsed().as_secs_f64() <= state.window.rto()
            {
                None
            } else {
                let pre = state.window.cwnd();
                state.window.on_timeout();
                let cwnd = state.window.cwnd();
                state.cwnd_history.push(cwnd);
                state.last_ack_time = Instant::now();
                let first = state.unacked.iter().next().copied();
                warn!(
                    "transfer timeout: cwnd {:.2} -> {:.2}, ssthresh {:.2}, retransmitting {:?}",
                    pre,
                    cwnd,
                    state.window.ssthresh(),
                    first
                );
                first
            }
        };
        if let Some(chunk_id) = retransmit {
            self.transmit_chunk(chunk_id, data, target, true)?;
        }
        Ok(())
    }

    fn transmit_chunk(
        &self,
        chunk_id: u32,
        data: &[u8],
        target: &str,
        is_retransmit: bool,
    ) -> Result<(), FileTransferError> {
        let start = chunk_id as usize * BASE_CHUNK_SIZE;
        let end = (start + BASE_CHUNK_SIZE).min(data.len());
        let payload = BASE64.encode(&data[start..end]);

        {
            let mut state = self.state.lock();
            state.unacked.insert(chunk_id);
            state.send_times.insert(chunk_id, Instant::now());
            if is_retransmit {
                state.retransmitted.insert(chunk_id);
            }
        }
        self.control.send(&ControlMessage::FileChunk {
            chunk_id,
            data: payload,
            target_name: target.to_string(),
        })?;
        Ok(())
    }

    /// Fed by the session when a FILE_ACK comes back through the server.
    pub fn on_ack(&self, chunk_id: u32) {
        let mut state = self.state.lock();
        state.last_ack_time = Instant::now();

        if state.unacked.remove(&chunk_id) {
            state.acked += 1;
            let sent_at = state.send_times.remove(&chunk_id);
            if !state.retransmitted.contains(&chunk_id) {
                if let Some(sent_at) = sent_at {
                    let sample = sent_at.elapsed().as_secs_f64();
                    state.window.on_rtt_sample(sample);
                    state.rtt_history_ms.push(sample * 1000.0);
                }
            }
            state.window.on_new_ack();
        } else {
            // Duplicate ACKs are counted but otherwise ignored
            state.dup_acks += 1;
            debug!("duplicate ACK for chunk {}", chunk_id);
        }
        let cwnd = state.window.cwnd();
        state.cwnd_history.push(cwnd);
    }

    pub fn is_in_progress(&self) -> bool {
        self.in_progress.load(Ordering::SeqCst)
    }

    pub fn stats(&self) -> FileSenderStats {
        let state = self.state.lock();
        FileSenderStats {
            cwnd: state.window.cwnd(),
            ssthresh: state.window.ssthresh(),
            rto_s: state.window.rto(),
            srtt_s: state.window.srtt(),
            chunks_acked: state.acked,
            dup_acks: state.dup_acks,
            cwnd_history: state.cwnd_history.clone(),
            rtt_history_ms: state.rtt_history_ms.clone(),
        }
    }

    fn emit_progress(&self, filename: &str, filesize: u64) {
        let acked = self.state.lock().acked;
        let bytes_done = ((acked as u64) * BASE_CHUNK_SIZE as u64).min(filesize);
        self.bus.emit(ClientEvent::FileProgress {
            filename: filename.to_string(),
            bytes_done,
            total: filesize,
        });
    }
}

struct IncomingFile {
    filename: String,
    path: PathBuf,
    file: File,
    expected: u64,
    bytes_received: u64,
    chunks_written: u64,
}

/// Receives forwarded files, writing each chunk at its deterministic
/// offset and acknowledging it back through the server.
pub struct FileReceiver {
    control: Arc<ControlChannel>,
    bus: EventBus,
    downloads_dir: PathBuf,
    current: Mutex<Option<IncomingFile>>,
}

impl FileReceiver {
    pub fn new(control: Arc<ControlChannel>, bus: EventBus, downloads_dir: PathBuf) -> Self {
        Self {
            control,
            bus,
            downloads_dir,
            current: Mutex::new(None),
        }
    }

    pub fn on_start(&self, sender_name: &str, filename: &str, filesize: u64) {
        if let Err(e) = fs::create_dir_all(&self.downloads_dir) {
            warn!("cannot create {}: {}", self.downloads_dir.display(), e);
            self.bus
                .emit(ClientEvent::TransportError(format!("download dir: {}", e)));
            return;
        }
        // Keep only the file name; a path-traversing name must not escape
        // the downloads directory.
        let safe_name = Path::new(filename)
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "download.bin".to_string());
        let path = self.downloads_dir.join(&safe_name);

        match File::create(&path) {
            Ok(file) => {
                info!(
                    "receiving {:?} ({} bytes) from {:?} into {}",
                    safe_name,
                    filesize,
                    sender_name,
                    path.display()
                );
                *self.current.lock() = Some(IncomingFile {
                    filename: safe_name.clone(),
                    path,
                    file,
                    expected: filesize,
                    bytes_received: 0,
                    chunks_written: 0,
                });
                self.bus.emit(ClientEvent::FileIncoming {
                    sender: sender_name.to_string(),
                    filename: safe_name,
                    filesize,
                });
            }
            Err(e) => {
                warn!("cannot create {}: {}", path.display(), e);
                self.bus
                    .emit(ClientEvent::TransportError(format!("file create: {}", e)));
            }
        }
    }

    pub fn on_chunk(&self, chunk_id: u32, data_b64: &str) {
        let bytes = match BASE64.decode(data_b64) {
            Ok(b) => b,
            Err(e) => {
                warn!("chunk {} has undecodable payload: {}", chunk_id, e);
                return;
            }
        };

        let progress = {
            let mut current = self.current.lock();
            let Some(incoming) = current.as_mut() else {
                debug!("chunk {} with no transfer in progress", chunk_id);
                return;
            };
            if let Err(e) = write_chunk(&mut incoming.file, chunk_id, &bytes) {
                warn!("writing chunk {} failed: {}", chunk_id, e);
                return;
            }
            incoming.bytes_received =
                (incoming.bytes_received + bytes.len() as u64).min(incoming.expected);
            incoming.chunks_written += 1;
            (
                incoming.filename.clone(),
                incoming.bytes_received,
                incoming.expected,
                incoming.chunks_written,
            )
        };

        if let Err(e) = self.control.send(&ControlMessage::FileAck { chunk_id }) {
            warn!("failed to ACK chunk {}: {}", chunk_id, e);
        }
        let (filename, bytes_done, total, written) = progress;
        if written % PROGRESS_STRIDE as u64 == 0 {
            self.bus.emit(ClientEvent::FileProgress {
                filename,
                bytes_done,
                total,
            });
        }
    }

    pub fn on_end(&self, checksum: &str) {
        let Some(mut incoming) = self.current.lock().take() else {
            debug!("FILE_END with no transfer in progress");
            return;
        };
        if let Err(e) = incoming.file.flush() {
            warn!("flush of {:?} failed: {}", incoming.filename, e);
        }
        drop(incoming.file);

        let checksum_ok = match md5_hex_of_file(&incoming.path) {
            Ok(actual) => actual.eq_ignore_ascii_case(checksum),
            Err(e) => {
                warn!("cannot hash {}: {}", incoming.path.display(), e);
                false
            }
        };
        if checksum_ok {
            info!("file {:?} received and verified", incoming.filename);
        } else {
            // The file is retained for inspection either way
            warn!("checksum mismatch for {:?}, file kept", incoming.filename);
        }
        self.bus.emit(ClientEvent::FileComplete {
            filename: incoming.filename,
            checksum_ok,
        });
    }
}

/// Seek to the chunk's deterministic offset and write it, so duplicates
/// and retransmissions overwrite in place.
pub(crate) fn write_chunk(file: &mut File, chunk_id: u32, bytes: &[u8]) -> io::Result<()> {
    file.seek(SeekFrom::Start(chunk_id as u64 * BASE_CHUNK_SIZE as u64))?;
    file.write_all(bytes)
}

/// MD5 hex digest of an in-memory buffer.
pub(crate) fn md5_hex(data: &[u8]) -> String {
    let mut hasher = Md5::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

/// MD5 hex digest of a file, streamed in chunk-sized reads.
pub(crate) fn md5_hex_of_file(path: &Path) -> io::Result<String> {
    let mut file = File::open(path)?;
    let mut hasher = Md5::new();
    let mut buf = [0u8; BASE_CHUNK_SIZE];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}
