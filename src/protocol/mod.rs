//! Wire protocol for the control plane and the media relay
//!
//! The TCP control channel carries length-prefixed JSON messages
//! ([`ControlMessage`], framed by [`framing`]); the UDP media path carries
//! raw datagrams with the fixed headers in [`headers`].

pub mod framing;
pub mod headers;
pub mod quality;

pub use framing::{FrameDecoder, ProtocolError};
pub use headers::{AudioHeader, MediaKind, VideoHeader};
pub use quality::QualityTier;

use serde::{Deserialize, Serialize};

/// Default TCP control port.
pub const DEFAULT_TCP_PORT: u16 = 5000;
/// Default UDP media relay port.
pub const DEFAULT_UDP_PORT: u16 = 5001;

/// Chat / file target meaning "all participants".
pub const TARGET_EVERYONE: &str = "Everyone";

/// File transfer chunk size in bytes.
pub const BASE_CHUNK_SIZE: usize = 8192;
/// Congestion window at transfer start, in chunk units.
pub const INITIAL_CWND: f64 = 1.0;
/// Slow-start threshold at transfer start, in chunk units.
pub const INITIAL_SSTHRESH: f64 = 8.0;
/// Congestion window ceiling, in chunk units.
pub const MAX_CWND: f64 = 64.0;

/// Audio sample rate (Hz) carried in the audio header.
pub const AUDIO_SAMPLE_RATE: u16 = 44100;
/// Audio channel count.
pub const AUDIO_CHANNELS: u8 = 1;
/// Samples per audio chunk.
pub const AUDIO_CHUNK_SAMPLES: usize = 1024;

/// Sequence gaps at or above this are treated as noise, not loss.
pub const LOSS_GAP_CEILING: u32 = 1000;

/// Control-plane messages, exchanged as framed JSON with a `type` tag.
///
/// Variant names serialize as the on-wire message kinds
/// (`CreateMeeting` -> `"CREATE_MEETING"`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ControlMessage {
    /// Open a new meeting; the sender becomes host
    CreateMeeting { name: String },

    /// Meeting code assigned to the new host
    MeetingCreated { meeting_code: String },

    /// Ask to join an existing meeting
    RequestJoin { meeting_code: String, name: String },

    /// Join request is parked in the waiting room
    JoinPending { message: String },

    /// Host admitted the requester
    JoinAccepted,

    /// Join refused (unknown meeting or host denial)
    JoinRejected { reason: String },

    /// Host admits a waiting client by display name
    AllowJoin { client_name: String },

    /// Host refuses a waiting client by display name
    DenyJoin { client_name: String },

    /// Host notification of a new waiting client
    NewJoinRequest { client_name: String },

    /// Someone entered the meeting
    ParticipantJoined {
        participant_name: String,
        is_host: bool,
    },

    /// Someone left the meeting; `is_host` means the meeting is closed
    ParticipantLeft {
        participant_name: String,
        is_host: bool,
    },

    /// Chat to the whole meeting or a single participant
    Chat {
        message: String,
        target_name: String,
    },

    /// Chat delivered to recipients
    ChatBroadcast {
        sender_name: String,
        message: String,
        is_private: bool,
    },

    /// Sender toggled its camera
    CameraStatus { enabled: bool },

    /// Camera toggle delivered to the other participants
    CameraStatusBroadcast {
        participant_name: String,
        enabled: bool,
    },

    /// Begin a file transfer
    FileStart {
        filename: String,
        filesize: u64,
        chunk_size: u32,
        target_name: String,
    },

    /// One file chunk, base64 payload
    FileChunk {
        chunk_id: u32,
        data: String,
        target_name: String,
    },

    /// End of file, MD5 hex digest over the whole file
    FileEnd {
        checksum: String,
        target_name: String,
    },

    /// Receiver acknowledgment for one written chunk
    FileAck { chunk_id: u32 },

    /// Forwarded transfer announcement
    FileStartNotify {
        sender_name: String,
        filename: String,
        filesize: u64,
        chunk_size: u32,
    },

    /// Forwarded file chunk
    FileChunkForward { chunk_id: u32, data: String },

    /// Forwarded end-of-file
    FileEndNotify {
        sender_name: String,
        checksum: String,
    },

    /// Client telemetry; the server logs it and does not act
    VideoStats {
        loss: f64,
        rtt: f64,
        fps_recv: f64,
        bitrate: f64,
    },

    /// Client liveness probe, timestamp in float epoch seconds
    Heartbeat { timestamp: f64 },

    /// Heartbeat echo with the original timestamp
    HeartbeatAck { timestamp: f64 },

    /// Announce the client's UDP receive ports
    RegisterUdp { video_port: u16, audio_port: u16 },

    /// Leave the current meeting; the connection stays open
    Leave,
}

impl ControlMessage {
    /// On-wire message kind, for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            ControlMessage::CreateMeeting { .. } => "CREATE_MEETING",
            ControlMessage::MeetingCreated { .. } => "MEETING_CREATED",
            ControlMessage::RequestJoin { .. } => "REQUEST_JOIN",
            ControlMessage::JoinPending { .. } => "JOIN_PENDING",
            ControlMessage::JoinAccepted => "JOIN_ACCEPTED",
            ControlMessage::JoinRejected { .. } => "JOIN_REJECTED",
            ControlMessage::AllowJoin { .. } => "ALLOW_JOIN",
            ControlMessage::DenyJoin { .. } => "DENY_JOIN",
            ControlMessage::NewJoinRequest { .. } => "NEW_JOIN_REQUEST",
            ControlMessage::ParticipantJoined { .. } => "PARTICIPANT_JOINED",
            ControlMessage::ParticipantLeft { .. } => "PARTICIPANT_LEFT",
            ControlMessage::Chat { .. } => "CHAT",
            ControlMessage::ChatBroadcast { .. } => "CHAT_BROADCAST",
            ControlMessage::CameraStatus { .. } => "CAMERA_STATUS",
            ControlMessage::CameraStatusBroadcast { .. } => "CAMERA_STATUS_BROADCAST",
            ControlMessage::FileStart { .. } => "FILE_START",
            ControlMessage::FileChunk { .. } => "FILE_CHUNK",
            ControlMessage::FileEnd { .. } => "FILE_END",
            ControlMessage::FileAck { .. } => "FILE_ACK",
            ControlMessage::FileStartNotify { .. } => "FILE_START_NOTIFY",
            ControlMessage::FileChunkForward { .. } => "FILE_CHUNK_FORWARD",
            ControlMessage::FileEndNotify { .. } => "FILE_END_NOTIFY",
            ControlMessage::VideoStats { .. } => "VIDEO_STATS",
            ControlMessage::Heartbeat { .. } => "HEARTBEAT",
            ControlMessage::HeartbeatAck { .. } => "HEARTBEAT_ACK",
            ControlMessage::RegisterUdp { .. } => "REGISTER_UDP",
            ControlMessage::Leave => "LEAVE",
        }
    }
}
