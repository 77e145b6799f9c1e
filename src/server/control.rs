//! TCP control plane
//!
//! One task per connected client. The reader loop pulls length-prefixed JSON
//! frames and dispatches by message kind; outgoing frames go through a
//! per-client unbounded queue drained by a writer task, so a slow or dead
//! socket never blocks delivery to the others.

use super::registry::{ClientId, LeaveOutcome, MeetingRegistry, Outbox, Recipient};
use crate::protocol::framing::{self, MAX_FRAME_LEN};
use crate::protocol::{ControlMessage, TARGET_EVERYONE};
use bytes::Bytes;
use log::{debug, info, warn};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;

static NEXT_CLIENT_ID: AtomicU64 = AtomicU64::new(1);

/// Accept control connections forever, one handler task per client.
pub async fn run_control_plane(listener: TcpListener, registry: Arc<MeetingRegistry>) {
    loop {
        match listener.accept().await {
            Ok((stream, peer)) => {
                let id = ClientId(NEXT_CLIENT_ID.fetch_add(1, Ordering::Relaxed));
                info!("{} connected from {}", id, peer);
                let registry = registry.clone();
                tokio::spawn(async move {
                    handle_connection(id, stream, peer, registry).await;
                });
            }
            Err(e) => {
                warn!("accept failed: {}", e);
                tokio::time::sleep(std::time::Duration::from_millis(100)).await;
            }
        }
    }
}

async fn handle_connection(
    id: ClientId,
    stream: TcpStream,
    peer: SocketAddr,
    registry: Arc<MeetingRegistry>,
) {
    stream.set_nodelay(true).ok();
    let (reader, writer) = stream.into_split();
    let (outbox, outbox_rx) = mpsc::unbounded_channel::<Bytes>();
    registry.connect(id, peer.ip(), outbox.clone());

    tokio::spawn(write_loop(id, writer, outbox_rx));

    let conn = Connection {
        id,
        peer,
        registry: registry.clone(),
        outbox,
    };
    conn.read_loop(reader).await;

    // Socket loss counts as leaving; the record itself goes away too.
    let outcome = registry.disconnect(id);
    announce_departure(&outcome);
    info!("{} disconnected", id);
}

/// Drain the outbox onto the socket. Exits on write failure or when the
/// last sender (the registry record) is dropped.
async fn write_loop(
    id: ClientId,
    mut writer: OwnedWriteHalf,
    mut rx: mpsc::UnboundedReceiver<Bytes>,
) {
    while let Some(frame) = rx.recv().await {
        if let Err(e) = writer.write_all(&frame).await {
            debug!("{} write failed: {}", id, e);
            break;
        }
    }
    let _ = writer.shutdown().await;
}

struct Connection {
    id: ClientId,
    peer: SocketAddr,
    registry: Arc<MeetingRegistry>,
    outbox: Outbox,
}

impl Connection {
    async fn read_loop(&self, mut reader: OwnedReadHalf) {
        loop {
            let mut prefix = [0u8; 4];
            if reader.read_exact(&mut prefix).await.is_err() {
                break;
            }
            let len = u32::from_be_bytes(prefix) as usize;
            if len > MAX_FRAME_LEN {
                warn!("{} sent a {} byte frame, tearing down", self.id, len);
                break;
            }
            let mut body = vec![0u8; len];
            if reader.read_exact(&mut body).await.is_err() {
                break;
            }

            // Malformed JSON tears the connection down; a well-formed
            // message of an unknown kind is logged and skipped.
            let value: serde_json::Value = match serde_json::from_slice(&body) {
                Ok(v) => v,
                Err(e) => {
                    warn!("{} sent malformed JSON ({}), tearing down", self.id, e);
                    break;
                }
            };
            match serde_json::from_value::<ControlMessage>(value.clone()) {
                Ok(msg) => self.dispatch(msg),
                Err(_) => {
                    let kind = value
                        .get("type")
                        .and_then(|t| t.as_str())
                        .unwrap_or("<missing>");
                    warn!("{} sent unknown message kind {:?}, skipping", self.id, kind);
                }
            }
        }
    }

    fn dispatch(&self, msg: ControlMessage) {
        if !matches!(msg, ControlMessage::Heartbeat { .. } | ControlMessage::FileChunk { .. }) {
            debug!("{} -> {}", self.id, msg.kind());
        }
        match msg {
            ControlMessage::CreateMeeting { name } => self.on_create_meeting(&name),
            ControlMessage::RequestJoin { meeting_code, name } => {
                self.on_request_join(&meeting_code, &name)
            }
            ControlMessage::AllowJoin { client_name } => self.on_allow_join(&client_name),
            ControlMessage::DenyJoin { client_name } => self.on_deny_join(&client_name),
            ControlMessage::Chat {
                message,
                target_name,
            } => self.on_chat(message, &target_name),
            ControlMessage::CameraStatus { enabled } => self.on_camera_status(enabled),
            ControlMessage::FileStart {
                filename,
                filesize,
                chunk_size,
                target_name,
            } => self.on_file_start(filename, filesize, chunk_size, &target_name),
            ControlMessage::FileChunk {
                chunk_id,
                data,
                target_name,
            } => self.on_file_chunk(chunk_id, data, &target_name),
            ControlMessage::FileEnd {
                checksum,
                target_name,
            } => self.on_file_end(checksum, &target_name),
            ControlMessage::FileAck { chunk_id } => self.on_file_ack(chunk_id),
            ControlMessage::VideoStats {
                loss,
                rtt,
                fps_recv,
                bitrate,
            } => {
                let name = self
                    .registry
                    .info_of(self.id)
                    .map(|i| i.name)
                    .unwrap_or_default();
                info!(
                    "stats from {:?}: loss={:.1}% rtt={:.0}ms fps={:.1} bitrate={:.0}kbps",
                    name, loss, rtt, fps_recv, bitrate
                );
            }
            ControlMessage::Heartbeat { timestamp } => {
                self.send_self(&ControlMessage::HeartbeatAck { timestamp });
            }
            ControlMessage::RegisterUdp {
                video_port,
                audio_port,
            } => self.on_register_udp(video_port, audio_port),
            ControlMessage::Leave => {
                let outcome = self.registry.leave(self.id);
                announce_departure(&outcome);
            }
            // Server-to-client kinds arriving from a client are bogus
            other => {
                debug!("{} sent server-side kind {}, ignoring", self.id, other.kind());
            }
        }
    }

    fn on_create_meeting(&self, name: &str) {
        match self.registry.create_meeting(self.id, name) {
            Ok(code) => {
                info!("meeting {} created by {:?} ({})", code, name, self.peer);
                self.send_self(&ControlMessage::MeetingCreated { meeting_code: code });
            }
            Err(e) => warn!("{} CREATE_MEETING refused: {}", self.id, e),
        }
    }

    fn on_request_join(&self, code: &str, name: &str) {
        match self.registry.request_join(self.id, code, name) {
            Ok(()) => {
                info!("{:?} waiting to join meeting {}", name, code);
                if let Some(host) = self.registry.host_of(code) {
                    send_to(
                        &host,
                        &ControlMessage::NewJoinRequest {
                            client_name: name.to_string(),
                        },
                    );
                }
                self.send_self(&ControlMessage::JoinPending {
                    message: "Join request sent to host".to_string(),
                });
            }
            Err(e) => {
                info!("{} REQUEST_JOIN {} refused: {}", self.id, code, e);
                self.send_self(&ControlMessage::JoinRejected {
                    reason: e.to_string(),
                });
            }
        }
    }

    fn on_allow_join(&self, client_name: &str) {
        let admitted = match self.registry.allow_join(self.id, client_name) {
            Ok(r) => r,
            Err(e) => {
                warn!("{} ALLOW_JOIN {:?} refused: {}", self.id, client_name, e);
                return;
            }
        };
        send_to(&admitted, &ControlMessage::JoinAccepted);

        let Some(info) = self.registry.info_of(admitted.id) else {
            return;
        };
        let Some(code) = info.meeting else { return };
        let participants = self.registry.participants_of(&code);
        let duplicates = participants
            .iter()
            .filter(|p| p.name == admitted.name)
            .count();
        if duplicates > 1 {
            warn!(
                "meeting {} now has {} participants named {:?}; name-keyed targeting is ambiguous",
                code, duplicates, admitted.name
            );
        }
        info!("{:?} joined meeting {}", admitted.name, code);
        broadcast(
            &participants,
            &ControlMessage::ParticipantJoined {
                participant_name: admitted.name.clone(),
                is_host: false,
            },
        );
    }

    fn on_deny_join(&self, client_name: &str) {
        match self.registry.deny_join(self.id, client_name) {
            Ok(denied) => {
                info!("{:?} denied by host", denied.name);
                send_to(
                    &denied,
                    &ControlMessage::JoinRejected {
                        reason: "Host denied your request".to_string(),
                    },
                );
            }
            Err(e) => warn!("{} DENY_JOIN {:?} refused: {}", self.id, client_name, e),
        }
    }

    fn on_chat(&self, message: String, target_name: &str) {
        let Some((sender_name, _code, others)) = self.registry.broadcast_context(self.id) else {
            debug!("{} sent CHAT outside a meeting, ignoring", self.id);
            return;
        };
        if target_name == TARGET_EVERYONE {
            broadcast(
                &others,
                &ControlMessage::ChatBroadcast {
                    sender_name,
                    message,
                    is_private: false,
                },
            );
        } else if let Some(target) = others.iter().find(|r| r.name == target_name) {
            send_to(
                target,
                &ControlMessage::ChatBroadcast {
                    sender_name,
                    message,
                    is_private: true,
                },
            );
        } else {
            debug!(
                "{} private chat to unknown participant {:?}, dropped",
                self.id, target_name
            );
        }
    }

    fn on_camera_status(&self, enabled: bool) {
        if self.registry.set_camera(self.id, enabled).is_none() {
            debug!("{} CAMERA_STATUS outside a meeting, ignoring", self.id);
            return;
        }
        let Some((name, _code, others)) = self.registry.broadcast_context(self.id) else {
            return;
        };
        broadcast(
            &others,
            &ControlMessage::CameraStatusBroadcast {
                participant_name: name,
                enabled,
            },
        );
    }

    fn on_file_start(&self, filename: String, filesize: u64, chunk_size: u32, target: &str) {
        let Some((sender_name, code, others)) = self.registry.broadcast_context(self.id) else {
            debug!("{} FILE_START outside a meeting, ignoring", self.id);
            return;
        };
        info!(
            "{:?} sending {:?} ({} bytes) to {:?} in meeting {}",
            sender_name, filename, filesize, target, code
        );
        self.registry.set_file_sender(self.id, true);
        route(
            &others,
            target,
            &ControlMessage::FileStartNotify {
                sender_name,
                filename,
                filesize,
                chunk_size,
            },
        );
    }

    fn on_file_chunk(&self, chunk_id: u32, data: String, target: &str) {
        let Some((_, _, others)) = self.registry.broadcast_context(self.id) else {
            return;
        };
        route(
            &others,
            target,
            &ControlMessage::FileChunkForward { chunk_id, data },
        );
    }

    fn on_file_end(&self, checksum: String, target: &str) {
        let Some((sender_name, _, others)) = self.registry.broadcast_context(self.id) else {
            return;
        };
        route(
            &others,
            target,
            &ControlMessage::FileEndNotify {
                sender_name,
                checksum,
            },
        );
        self.registry.set_file_sender(self.id, false);
    }

    fn on_file_ack(&self, chunk_id: u32) {
        match self.registry.file_sender_for(self.id) {
            Some(sender) => send_to(&sender, &ControlMessage::FileAck { chunk_id }),
            None => debug!("{} FILE_ACK {} with no active transfer", self.id, chunk_id),
        }
    }

    fn on_register_udp(&self, video_port: u16, audio_port: u16) {
        match self.registry.register_udp(self.id, video_port, audio_port) {
            Ok(()) => info!(
                "{} registered UDP endpoints {}:{}/{}",
                self.id,
                self.peer.ip(),
                video_port,
                audio_port
            ),
            Err(e) => warn!("{} REGISTER_UDP refused: {}", self.id, e),
        }
    }

    fn send_self(&self, msg: &ControlMessage) {
        if let Ok(frame) = framing::encode_frame(msg) {
            let _ = self.outbox.send(Bytes::from(frame));
        }
    }
}

/// Queue one message for a single recipient. A closed outbox means the
/// recipient's connection task is already tearing down.
fn send_to(recipient: &Recipient, msg: &ControlMessage) {
    let frame = match framing::encode_frame(msg) {
        Ok(f) => Bytes::from(f),
        Err(e) => {
            warn!("failed to encode {}: {}", msg.kind(), e);
            return;
        }
    };
    if recipient.outbox.send(frame).is_err() {
        debug!("{} outbox closed, {} dropped", recipient.id, msg.kind());
    }
}

/// Serialize once, queue to every recipient. A failing recipient never
/// aborts delivery to the rest.
fn broadcast(recipients: &[Recipient], msg: &ControlMessage) {
    let frame = match framing::encode_frame(msg) {
        Ok(f) => Bytes::from(f),
        Err(e) => {
            warn!("failed to encode {}: {}", msg.kind(), e);
            return;
        }
    };
    for recipient in recipients {
        if recipient.outbox.send(frame.clone()).is_err() {
            debug!("{} outbox closed, {} dropped", recipient.id, msg.kind());
        }
    }
}

/// Deliver to everyone or to the named participant only.
fn route(others: &[Recipient], target: &str, msg: &ControlMessage) {
    if target == TARGET_EVERYONE {
        broadcast(others, msg);
    } else if let Some(recipient) = others.iter().find(|r| r.name == target) {
        send_to(recipient, msg);
    } else {
        debug!("no participant named {:?} for {}", target, msg.kind());
    }
}

/// Tell the affected parties that someone left. A departing host closes the
/// meeting: the remaining members see `is_host: true` and treat the meeting
/// as gone; waiting clients get a rejection.
fn announce_departure(outcome: &LeaveOutcome) {
    match outcome {
        LeaveOutcome::NotAssigned => {}
        LeaveOutcome::Departed {
            name,
            was_host,
            notify,
            dropped_waiting,
            ..
        } => {
            broadcast(
                notify,
                &ControlMessage::ParticipantLeft {
                    participant_name: name.clone(),
                    is_host: *was_host,
                },
            );
            for waiting in dropped_waiting {
                send_to(
                    waiting,
                    &ControlMessage::JoinRejected {
                        reason: "Meeting closed".to_string(),
                    },
                );
            }
        }
    }
}
