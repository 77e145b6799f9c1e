//! Client session state machine
//!
//! DISCONNECTED → CONNECTED → LOBBY_HOST | LOBBY_GUEST → IN_MEETING →
//! DISCONNECTED. On meeting entry the session spawns the media pipelines
//! and the stats loop, announces its UDP receive ports and its initial
//! camera state. All server messages funnel through [`ClientSession::run`]
//! (or the waits inside the join flow) and surface on the event bus.

use super::audio_receiver::AudioReceiver;
use super::audio_sender::AudioSender;
use super::control::{ControlChannel, ControlError};
use super::events::{ClientEvent, EventBus};
use super::file_transfer::{FileReceiver, FileSender};
use super::media::{AudioSink, AudioSource, FrameSink, FrameSource};
use super::stats::StatsCollector;
use super::video_receiver::VideoReceiver;
use super::video_sender::VideoSender;
use crate::config::ClientConfig;
use crate::protocol::{ControlMessage, QualityTier, TARGET_EVERYONE};
use crossbeam::channel::{Receiver, RecvTimeoutError};
use log::{debug, info, warn};
use parking_lot::Mutex;
use std::error::Error;
use std::fmt;
use std::io;
use std::net::{SocketAddr, ToSocketAddrs};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

/// How long to wait for JOIN_PENDING after REQUEST_JOIN.
const JOIN_PENDING_TIMEOUT: Duration = Duration::from_secs(5);
/// How long to wait for the host's verdict.
const JOIN_ACCEPTED_TIMEOUT: Duration = Duration::from_secs(30);
/// How long to wait for MEETING_CREATED.
const CREATE_TIMEOUT: Duration = Duration::from_secs(10);
/// Tier the video sender starts at before the first adaptation tick.
const INITIAL_TIER: QualityTier = QualityTier::P360;

/// Session lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Disconnected,
    Connected,
    LobbyHost,
    LobbyGuest,
    InMeeting,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SessionState::Disconnected => "disconnected",
            SessionState::Connected => "connected",
            SessionState::LobbyHost => "lobby (host)",
            SessionState::LobbyGuest => "lobby (guest)",
            SessionState::InMeeting => "in meeting",
        };
        f.write_str(s)
    }
}

/// Session operation failures.
#[derive(Debug)]
pub enum SessionError {
    Control(ControlError),
    Io(io::Error),
    /// The awaited server response never came
    Timeout(&'static str),
    /// The server or host refused the request
    Rejected(String),
    /// The operation is not valid in the current state
    InvalidState(&'static str),
}

impl fmt::Display for SessionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionError::Control(e) => write!(f, "control channel: {}", e),
            SessionError::Io(e) => write!(f, "i/o error: {}", e),
            SessionError::Timeout(what) => write!(f, "timed out waiting for {}", what),
            SessionError::Rejected(reason) => write!(f, "rejected: {}", reason),
            SessionError::InvalidState(what) => write!(f, "invalid state: {}", what),
        }
    }
}

impl Error for SessionError {}

impl From<ControlError> for SessionError {
    fn from(e: ControlError) -> Self {
        SessionError::Control(e)
    }
}

impl From<io::Error> for SessionError {
    fn from(e: io::Error) -> Self {
        SessionError::Io(e)
    }
}

/// The device seams supplied by the embedder.
pub struct MediaBindings {
    pub frame_source: Box<dyn FrameSource>,
    pub audio_source: Box<dyn AudioSource>,
    pub frame_sink: Option<Arc<dyn FrameSink>>,
    pub audio_sink: Box<dyn AudioSink>,
}

/// The running media pipelines of one meeting.
pub struct MediaStack {
    pub video_sender: Arc<VideoSender>,
    pub video_receiver: Arc<VideoReceiver>,
    pub audio_sender: Arc<AudioSender>,
    pub audio_receiver: Arc<AudioReceiver>,
    pub stats: StatsCollector,
}

impl MediaStack {
    fn stop_all(&self) {
        self.stats.stop();
        self.video_sender.stop();
        self.audio_sender.stop();
        self.video_receiver.stop();
        self.audio_receiver.stop();
    }
}

/// Cloneable handle for UI-thread actions while [`ClientSession::run`]
/// owns the dispatch loop.
#[derive(Clone)]
pub struct SessionHandle {
    control: Arc<ControlChannel>,
    file_sender: Arc<FileSender>,
    media: Arc<Mutex<Option<MediaStack>>>,
    bus: EventBus,
    name: String,
}

impl SessionHandle {
    /// Public chat, or private when `target` names a participant.
    pub fn send_chat(&self, message: &str, target: &str) -> Result<(), SessionError> {
        self.control.send(&ControlMessage::Chat {
            message: message.to_string(),
            target_name: target.to_string(),
        })?;
        Ok(())
    }

    pub fn send_chat_to_everyone(&self, message: &str) -> Result<(), SessionError> {
        self.send_chat(message, TARGET_EVERYONE)
    }

    /// Host only: admit a waiting client.
    pub fn allow_join(&self, client_name: &str) -> Result<(), SessionError> {
        self.control.send(&ControlMessage::AllowJoin {
            client_name: client_name.to_string(),
        })?;
        Ok(())
    }

    /// Host only: refuse a waiting client.
    pub fn deny_join(&self, client_name: &str) -> Result<(), SessionError> {
        self.control.send(&ControlMessage::DenyJoin {
            client_name: client_name.to_string(),
        })?;
        Ok(())
    }

    /// Toggle the camera; the meeting learns via CAMERA_STATUS.
    pub fn set_camera_enabled(&self, enabled: bool) -> Result<(), SessionError> {
        if let Some(stack) = self.media.lock().as_ref() {
            stack.video_sender.set_enabled(enabled);
        }
        self.control
            .send(&ControlMessage::CameraStatus { enabled })?;
        Ok(())
    }

    /// Mute or unmute the microphone (local only, no control message).
    pub fn set_mic_enabled(&self, enabled: bool) {
        if let Some(stack) = self.media.lock().as_ref() {
            stack.audio_sender.set_enabled(enabled);
        }
    }

    /// Start a file transfer on its own thread; failures come back on the
    /// event bus.
    pub fn send_file(&self, path: PathBuf, target: &str) {
        let sender = self.file_sender.clone();
        let bus = self.bus.clone();
        let target = target.to_string();
        let spawned = std::thread::Builder::new()
            .name("file-send".into())
            .spawn(move || {
                if let Err(e) = sender.send_file(&path, &target) {
                    warn!("file transfer failed: {}", e);
                    bus.emit(ClientEvent::TransportError(format!("file transfer: {}", e)));
                }
            });
        if let Err(e) = spawned {
            self.bus
                .emit(ClientEvent::TransportError(format!("file thread: {}", e)));
        }
    }

    pub fn file_sender(&self) -> &Arc<FileSender> {
        &self.file_sender
    }

    /// Leave the meeting and end the session. Closing the channel makes
    /// the dispatch loop tear everything down.
    pub fn leave(&self) {
        let _ = self.control.send(&ControlMessage::Leave);
        self.control.shutdown();
    }

    pub fn display_name(&self) -> &str {
        &self.name
    }
}

/// One client's connection, lobby flow and meeting lifetime.
pub struct ClientSession {
    config: ClientConfig,
    bus: EventBus,
    control: Option<Arc<ControlChannel>>,
    inbox: Option<Receiver<ControlMessage>>,
    state: SessionState,
    media: Arc<Mutex<Option<MediaStack>>>,
    bindings: Option<MediaBindings>,
    file_sender: Option<Arc<FileSender>>,
    file_receiver: Option<Arc<FileReceiver>>,
    rtt_ms: Arc<Mutex<f64>>,
    camera_enabled: bool,
    mic_enabled: bool,
    is_host: bool,
    /// Our own PARTICIPANT_JOINED echo has been seen; a second one with
    /// our name is a genuine name collision
    own_join_seen: bool,
}

impl ClientSession {
    /// Build a session; the returned receiver is the UI's event feed.
    pub fn new(
        config: ClientConfig,
        bindings: MediaBindings,
    ) -> (Self, Receiver<ClientEvent>) {
        let (bus, events) = EventBus::new();
        (
            Self {
                config,
                bus,
                control: None,
                inbox: None,
                state: SessionState::Disconnected,
                media: Arc::new(Mutex::new(None)),
                bindings: Some(bindings),
                file_sender: None,
                file_receiver: None,
                rtt_ms: Arc::new(Mutex::new(0.0)),
                camera_enabled: true,
                mic_enabled: true,
                is_host: false,
                own_join_seen: false,
            },
            events,
        )
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Dial the server's control plane.
    pub fn connect(&mut self) -> Result<(), SessionError> {
        if self.state != SessionState::Disconnected {
            return Err(SessionError::InvalidState("already connected"));
        }
        let (control, inbox) = ControlChannel::connect(&self.config.server, self.config.tcp_port)?;
        self.file_sender = Some(Arc::new(FileSender::new(control.clone(), self.bus.clone())));
        self.file_receiver = Some(Arc::new(FileReceiver::new(
            control.clone(),
            self.bus.clone(),
            self.config.downloads_dir.clone(),
        )));
        self.control = Some(control);
        self.inbox = Some(inbox);
        self.set_state(SessionState::Connected);
        Ok(())
    }

    /// Action handle for the UI thread; valid once connected.
    pub fn handle(&self) -> Result<SessionHandle, SessionError> {
        let control = self
            .control
            .clone()
            .ok_or(SessionError::InvalidState("not connected"))?;
        let file_sender = self
            .file_sender
            .clone()
            .ok_or(SessionError::InvalidState("not connected"))?;
        Ok(SessionHandle {
            control,
            file_sender,
            media: self.media.clone(),
            bus: self.bus.clone(),
            name: self.config.name.clone(),
        })
    }

    /// Create a meeting and enter it directly as host.
    pub fn create_meeting(&mut self) -> Result<String, SessionError> {
        if self.state != SessionState::Connected {
            return Err(SessionError::InvalidState("must be connected and unassigned"));
        }
        self.send(&ControlMessage::CreateMeeting {
            name: self.config.name.clone(),
        })?;
        let msg = self.wait_for(CREATE_TIMEOUT, "MEETING_CREATED", |m| {
            matches!(m, ControlMessage::MeetingCreated { .. })
        })?;
        let meeting_code = match msg {
            ControlMessage::MeetingCreated { meeting_code } => meeting_code,
            other => {
                warn!("unexpected {} while creating a meeting", other.kind());
                return Err(SessionError::Rejected(
                    "unexpected server response".to_string(),
                ));
            }
        };
        info!("meeting {} created, entering as host", meeting_code);
        self.is_host = true;
        self.set_state(SessionState::LobbyHost);
        self.bus.emit(ClientEvent::MeetingCreated {
            code: meeting_code.clone(),
        });

        // Hosts enter their own meeting without approval
        self.enter_meeting()?;
        Ok(meeting_code)
    }

    /// Request to join, wait in the lobby and enter on approval. A
    /// rejection or timeout ends the session.
    pub fn join_meeting(&mut self, code: &str) -> Result<(), SessionError> {
        if self.state != SessionState::Connected {
            return Err(SessionError::InvalidState("must be connected and unassigned"));
        }
        self.send(&ControlMessage::RequestJoin {
            meeting_code: code.to_string(),
            name: self.config.name.clone(),
        })?;

        let msg = self
            .wait_for(JOIN_PENDING_TIMEOUT, "JOIN_PENDING", |m| {
                matches!(
                    m,
                    ControlMessage::JoinPending { .. } | ControlMessage::JoinRejected { .. }
                )
            })
            .map_err(|e| {
                self.disconnect();
                e
            })?;
        if let ControlMessage::JoinRejected { reason } = msg {
            self.disconnect();
            return Err(SessionError::Rejected(reason));
        }
        info!("waiting for the host to admit us");
        self.set_state(SessionState::LobbyGuest);

        let msg = self
            .wait_for(JOIN_ACCEPTED_TIMEOUT, "JOIN_ACCEPTED", |m| {
                matches!(
                    m,
                    ControlMessage::JoinAccepted | ControlMessage::JoinRejected { .. }
                )
            })
            .map_err(|e| {
                self.disconnect();
                e
            })?;
        if let ControlMessage::JoinRejected { reason } = msg {
            self.disconnect();
            return Err(SessionError::Rejected(reason));
        }
        self.enter_meeting()
    }

    /// Dispatch incoming messages until the connection ends, then tear
    /// everything down. Run this on a dedicated (non-UI) thread.
    pub fn run(&mut self) {
        let Some(inbox) = self.inbox.clone() else {
            return;
        };
        while let Ok(msg) = inbox.recv() {
            self.dispatch(msg);
            if self.state == SessionState::Disconnected {
                return;
            }
        }
        info!("control connection ended");
        self.disconnect();
    }

    /// Explicitly leave and end the session.
    pub fn leave(&mut self) {
        if let Some(control) = &self.control {
            let _ = control.send(&ControlMessage::Leave);
        }
        self.disconnect();
    }

    /// Media pipelines of the current meeting, while one is active.
    pub fn media(&self) -> Arc<Mutex<Option<MediaStack>>> {
        self.media.clone()
    }

    fn send(&self, msg: &ControlMessage) -> Result<(), SessionError> {
        let control = self
            .control
            .as_ref()
            .ok_or(SessionError::InvalidState("not connected"))?;
        control.send(msg)?;
        Ok(())
    }

    /// Block until a message matches, dispatching everything else
    /// normally in the meantime.
    fn wait_for(
        &mut self,
        timeout: Duration,
        what: &'static str,
        matcher: impl Fn(&ControlMessage) -> bool,
    ) -> Result<ControlMessage, SessionError> {
        let inbox = self
            .inbox
            .clone()
            .ok_or(SessionError::InvalidState("not connected"))?;
        let deadline = Instant::now() + timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(SessionError::Timeout(what));
            }
            match inbox.recv_timeout(remaining) {
                Ok(msg) if matcher(&msg) => return Ok(msg),
                Ok(msg) => self.dispatch(msg),
                Err(RecvTimeoutError::Timeout) => return Err(SessionError::Timeout(what)),
                Err(RecvTimeoutError::Disconnected) => {
                    return Err(SessionError::Control(ControlError::Closed))
                }
            }
        }
    }

    /// Spawn media + stats, announce UDP ports and the camera flag.
    fn enter_meeting(&mut self) -> Result<(), SessionError> {
        let bindings = self
            .bindings
            .take()
            .ok_or(SessionError::InvalidState("media already consumed"))?;
        let control = self
            .control
            .clone()
            .ok_or(SessionError::InvalidState("not connected"))?;

        let relay_addr = resolve(&self.config.server, self.config.udp_port)?;
        let video_receiver = Arc::new(VideoReceiver::start(bindings.frame_sink)?);
        let audio_receiver = Arc::new(AudioReceiver::start(bindings.audio_sink)?);
        let video_sender = Arc::new(VideoSender::start(
            bindings.frame_source,
            relay_addr,
            INITIAL_TIER,
            self.config.drop_rate / 100.0,
        )?);
        video_sender.set_enabled(self.camera_enabled);
        let audio_sender = Arc::new(AudioSender::start(bindings.audio_source, relay_addr)?);
        audio_sender.set_enabled(self.mic_enabled);

        let stats = StatsCollector::start(
            video_sender.clone(),
            video_receiver.clone(),
            audio_receiver.clone(),
            Some(control.clone()),
            self.rtt_ms.clone(),
            self.bus.clone(),
        )?;

        let video_port = video_receiver.local_port();
        let audio_port = audio_receiver.local_port();
        *self.media.lock() = Some(MediaStack {
            video_sender,
            video_receiver,
            audio_sender,
            audio_receiver,
            stats,
        });

        // The relay can only reflect to us once it knows these ports
        control.send(&ControlMessage::RegisterUdp {
            video_port,
            audio_port,
        })?;
        control.send(&ControlMessage::CameraStatus {
            enabled: self.camera_enabled,
        })?;
        info!(
            "entered meeting: video port {}, audio port {}",
            video_port, audio_port
        );
        self.set_state(SessionState::InMeeting);
        Ok(())
    }

    fn dispatch(&mut self, msg: ControlMessage) {
        match msg {
            ControlMessage::NewJoinRequest { client_name } => {
                self.bus.emit(ClientEvent::JoinRequest { client_name });
            }
            ControlMessage::ParticipantJoined {
                participant_name,
                is_host,
            } => {
                if participant_name == self.config.name {
                    // Guests see their own admission broadcast exactly once;
                    // hosts never do. Anything beyond that is a collision.
                    if self.is_host || self.own_join_seen {
                        warn!("another participant is also named {:?}", participant_name);
                        self.bus.emit(ClientEvent::DuplicateName {
                            name: participant_name.clone(),
                        });
                    } else {
                        self.own_join_seen = true;
                    }
                }
                self.bus.emit(ClientEvent::ParticipantJoined {
                    name: participant_name,
                    is_host,
                });
            }
            ControlMessage::ParticipantLeft {
                participant_name,
                is_host,
            } => {
                self.bus.emit(ClientEvent::ParticipantLeft {
                    name: participant_name,
                    is_host,
                });
                if is_host {
                    info!("host left; the meeting is closed");
                    self.disconnect();
                }
            }
            ControlMessage::ChatBroadcast {
                sender_name,
                message,
                is_private,
            } => {
                // Our own private messages are echoed locally by the UI
                if is_private && sender_name == self.config.name {
                    return;
                }
                self.bus.emit(ClientEvent::Chat {
                    sender: sender_name,
                    message,
                    is_private,
                });
            }
            ControlMessage::CameraStatusBroadcast {
                participant_name,
                enabled,
            } => {
                self.bus.emit(ClientEvent::CameraStatus {
                    participant: participant_name,
                    enabled,
                });
            }
            ControlMessage::HeartbeatAck { timestamp } => {
                let rtt = ((epoch_seconds() - timestamp) * 1000.0).max(0.0);
                *self.rtt_ms.lock() = rtt;
            }
            ControlMessage::FileStartNotify {
                sender_name,
                filename,
                filesize,
                chunk_size: _,
            } => {
                if let Some(receiver) = &self.file_receiver {
                    receiver.on_start(&sender_name, &filename, filesize);
                }
            }
            ControlMessage::FileChunkForward { chunk_id, data } => {
                if let Some(receiver) = &self.file_receiver {
                    receiver.on_chunk(chunk_id, &data);
                }
            }
            ControlMessage::FileEndNotify {
                sender_name: _,
                checksum,
            } => {
                if let Some(receiver) = &self.file_receiver {
                    receiver.on_end(&checksum);
                }
            }
            ControlMessage::FileAck { chunk_id } => {
                if let Some(sender) = &self.file_sender {
                    sender.on_ack(chunk_id);
                }
            }
            ControlMessage::JoinRejected { reason } => {
                // Late rejection (e.g. the meeting closed while we waited)
                info!("join rejected: {}", reason);
                self.bus.emit(ClientEvent::TransportError(reason));
                if self.state != SessionState::InMeeting {
                    self.disconnect();
                }
            }
            other => {
                debug!("unhandled message {} in state {}", other.kind(), self.state);
            }
        }
    }

    fn disconnect(&mut self) {
        if let Some(stack) = self.media.lock().take() {
            stack.stop_all();
        }
        if let Some(control) = &self.control {
            control.shutdown();
        }
        self.set_state(SessionState::Disconnected);
    }

    fn set_state(&mut self, state: SessionState) {
        if self.state != state {
            info!("session state: {} -> {}", self.state, state);
            self.state = state;
            self.bus.emit(ClientEvent::StateChanged(state));
        }
    }
}

impl Drop for ClientSession {
    fn drop(&mut self) {
        if let Some(stack) = self.media.lock().take() {
            stack.stop_all();
        }
    }
}

fn resolve(host: &str, port: u16) -> Result<SocketAddr, SessionError> {
    (host, port)
        .to_socket_addrs()
        .map_err(SessionError::Io)?
        .next()
        .ok_or_else(|| {
            SessionError::Io(io::Error::new(
                io::ErrorKind::AddrNotAvailable,
                format!("{}:{} did not resolve", host, port),
            ))
        })
}

fn epoch_seconds() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}
