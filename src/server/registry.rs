//! Meeting registry
//!
//! The only non-trivial shared mutable state on the server. A single coarse
//! lock protects all meetings and client records; every operation completes
//! in bounded time and performs no I/O while holding it. The control handler
//! and the UDP relay get snapshots or outbox handles out of the lock and do
//! their socket work afterwards.

use bytes::Bytes;
use log::warn;
use parking_lot::Mutex;
use rand::Rng;
use std::collections::HashMap;
use std::error::Error;
use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::time::Instant;
use tokio::sync::mpsc::UnboundedSender;

/// Per-client outgoing frame queue, drained by the connection's writer task.
pub type Outbox = UnboundedSender<Bytes>;

/// Server-assigned identity of a control connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ClientId(pub u64);

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "client#{}", self.0)
    }
}

/// A participant's delivery handle, resolved under the registry lock.
#[derive(Debug, Clone)]
pub struct Recipient {
    pub id: ClientId,
    pub name: String,
    pub outbox: Outbox,
}

impl PartialEq for Recipient {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id && self.name == other.name
    }
}

/// Read-only view of a client record.
#[derive(Debug, Clone)]
pub struct ClientInfo {
    pub name: String,
    pub meeting: Option<String>,
    pub is_host: bool,
    pub waiting: bool,
    pub camera_enabled: bool,
}

/// A participant's registered UDP receive endpoints, for the relay.
#[derive(Debug, Clone)]
pub struct RelayEndpoint {
    pub id: ClientId,
    pub meeting: String,
    pub video: Option<SocketAddr>,
    pub audio: Option<SocketAddr>,
}

/// What happened when a client left, computed under the lock so the control
/// handler can notify the affected parties afterwards.
#[derive(Debug)]
pub enum LeaveOutcome {
    /// The client was not assigned to any meeting
    NotAssigned,
    Departed {
        meeting_code: String,
        name: String,
        was_host: bool,
        /// Remaining participants to notify
        notify: Vec<Recipient>,
        /// Waiting-room clients dropped because the meeting was destroyed
        dropped_waiting: Vec<Recipient>,
        meeting_destroyed: bool,
    },
}

/// Registry operation failures.
#[derive(Debug, PartialEq, Eq)]
pub enum RegistryError {
    MeetingNotFound(String),
    AlreadyInMeeting,
    NotInMeeting,
    NotHost,
    UnknownClient,
    NoSuchWaitingClient(String),
}

impl fmt::Display for RegistryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RegistryError::MeetingNotFound(code) => write!(f, "meeting {} not found", code),
            RegistryError::AlreadyInMeeting => write!(f, "client is already in a meeting"),
            RegistryError::NotInMeeting => write!(f, "client is not in a meeting"),
            RegistryError::NotHost => write!(f, "operation is restricted to the host"),
            RegistryError::UnknownClient => write!(f, "no record for this connection"),
            RegistryError::NoSuchWaitingClient(name) => {
                write!(f, "no waiting client named {:?}", name)
            }
        }
    }
}

impl Error for RegistryError {}

struct ClientRecord {
    name: String,
    peer_ip: IpAddr,
    outbox: Outbox,
    meeting: Option<String>,
    is_host: bool,
    waiting: bool,
    video_endpoint: Option<SocketAddr>,
    audio_endpoint: Option<SocketAddr>,
    camera_enabled: bool,
    connected_at: Instant,
}

impl ClientRecord {
    fn recipient(&self, id: ClientId) -> Recipient {
        Recipient {
            id,
            name: self.name.clone(),
            outbox: self.outbox.clone(),
        }
    }

    /// Reset to the unassigned state, keeping the connection itself.
    fn detach(&mut self) {
        self.meeting = None;
        self.is_host = false;
        self.waiting = false;
        self.video_endpoint = None;
        self.audio_endpoint = None;
        self.camera_enabled = false;
    }
}

struct Meeting {
    host: ClientId,
    /// Insertion-ordered for deterministic broadcast iteration
    participants: Vec<ClientId>,
    waiting: Vec<ClientId>,
    /// Client that opened the in-flight file transfer, for ACK routing
    active_file_sender: Option<ClientId>,
    created_at: Instant,
}

#[derive(Default)]
struct Inner {
    meetings: HashMap<String, Meeting>,
    clients: HashMap<ClientId, ClientRecord>,
}

/// All meeting and client state, behind one lock.
pub struct MeetingRegistry {
    inner: Mutex<Inner>,
}

impl MeetingRegistry {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
        }
    }

    /// Install a record for a freshly accepted connection.
    pub fn connect(&self, id: ClientId, peer_ip: IpAddr, outbox: Outbox) {
        let mut inner = self.inner.lock();
        inner.clients.insert(
            id,
            ClientRecord {
                name: String::new(),
                peer_ip,
                outbox,
                meeting: None,
                is_host: false,
                waiting: false,
                video_endpoint: None,
                audio_endpoint: None,
                camera_enabled: false,
                connected_at: Instant::now(),
            },
        );
    }

    /// Drop the record entirely (connection closed). Returns the leave
    /// outcome so the caller can notify the former meeting.
    pub fn disconnect(&self, id: ClientId) -> LeaveOutcome {
        let mut inner = self.inner.lock();
        let outcome = Self::leave_locked(&mut inner, id);
        if let Some(record) = inner.clients.remove(&id) {
            log::debug!("{} gone after {:?}", id, record.connected_at.elapsed());
        }
        outcome
    }

    /// Create a meeting with `id` as host and sole participant.
    pub fn create_meeting(&self, id: ClientId, name: &str) -> Result<String, RegistryError> {
        let mut inner = self.inner.lock();
        let record = inner.clients.get(&id).ok_or(RegistryError::UnknownClient)?;
        if record.meeting.is_some() {
            return Err(RegistryError::AlreadyInMeeting);
        }

        let code = loop {
            let candidate = format!("{:06}", rand::thread_rng().gen_range(0..1_000_000u32));
            if !inner.meetings.contains_key(&candidate) {
                break candidate;
            }
        };

        inner.meetings.insert(
            code.clone(),
            Meeting {
                host: id,
                participants: vec![id],
                waiting: Vec::new(),
                active_file_sender: None,
                created_at: Instant::now(),
            },
        );
        let record = inner
            .clients
            .get_mut(&id)
            .ok_or(RegistryError::UnknownClient)?;
        record.name = name.to_string();
        record.meeting = Some(code.clone());
        record.is_host = true;
        record.waiting = false;
        Ok(code)
    }

    /// Park `id` in the waiting room of `code`.
    pub fn request_join(
        &self,
        id: ClientId,
        code: &str,
        name: &str,
    ) -> Result<(), RegistryError> {
        let mut inner = self.inner.lock();
        if !inner.meetings.contains_key(code) {
            return Err(RegistryError::MeetingNotFound(code.to_string()));
        }
        let record = inner.clients.get_mut(&id).ok_or(RegistryError::UnknownClient)?;
        if record.meeting.is_some() {
            return Err(RegistryError::AlreadyInMeeting);
        }
        record.name = name.to_string();
        record.meeting = Some(code.to_string());
        record.is_host = false;
        record.waiting = true;

        let meeting = inner
            .meetings
            .get_mut(code)
            .ok_or_else(|| RegistryError::MeetingNotFound(code.to_string()))?;
        if !meeting.waiting.contains(&id) {
            meeting.waiting.push(id);
        }
        Ok(())
    }

    /// Host admits a waiting client by display name. Returns the admitted
    /// client's delivery handle.
    pub fn allow_join(
        &self,
        host_id: ClientId,
        client_name: &str,
    ) -> Result<Recipient, RegistryError> {
        let mut inner = self.inner.lock();
        let code = Self::hosted_meeting_locked(&inner, host_id)?;
        let admitted = Self::waiting_by_name_locked(&inner, &code, client_name)
            .ok_or_else(|| RegistryError::NoSuchWaitingClient(client_name.to_string()))?;

        let meeting = inner
            .meetings
            .get_mut(&code)
            .ok_or_else(|| RegistryError::MeetingNotFound(code.clone()))?;
        meeting.waiting.retain(|c| *c != admitted);
        if !meeting.participants.contains(&admitted) {
            meeting.participants.push(admitted);
        }
        let record = inner
            .clients
            .get_mut(&admitted)
            .ok_or(RegistryError::UnknownClient)?;
        record.waiting = false;
        Ok(record.recipient(admitted))
    }

    /// Host refuses a waiting client. The client stays connected but is
    /// detached from the meeting.
    pub fn deny_join(
        &self,
        host_id: ClientId,
        client_name: &str,
    ) -> Result<Recipient, RegistryError> {
        let mut inner = self.inner.lock();
        let code = Self::hosted_meeting_locked(&inner, host_id)?;
        let denied = Self::waiting_by_name_locked(&inner, &code, client_name)
            .ok_or_else(|| RegistryError::NoSuchWaitingClient(client_name.to_string()))?;

        let meeting = inner
            .meetings
            .get_mut(&code)
            .ok_or_else(|| RegistryError::MeetingNotFound(code.clone()))?;
        meeting.waiting.retain(|c| *c != denied);
        let record = inner
            .clients
            .get_mut(&denied)
            .ok_or(RegistryError::UnknownClient)?;
        let recipient = record.recipient(denied);
        record.detach();
        Ok(recipient)
    }

    /// Remove `id` from its meeting. The host leaving (or the participant
    /// set draining) destroys the meeting and detaches everyone in it.
    pub fn leave(&self, id: ClientId) -> LeaveOutcome {
        let mut inner = self.inner.lock();
        Self::leave_locked(&mut inner, id)
    }

    /// Bind the client's UDP receive endpoints using the control socket's
    /// peer IP. Repeating the same registration is a no-op.
    pub fn register_udp(
        &self,
        id: ClientId,
        video_port: u16,
        audio_port: u16,
    ) -> Result<(), RegistryError> {
        let mut inner = self.inner.lock();
        let record = inner.clients.get_mut(&id).ok_or(RegistryError::UnknownClient)?;
        record.video_endpoint = Some(SocketAddr::new(record.peer_ip, video_port));
        record.audio_endpoint = Some(SocketAddr::new(record.peer_ip, audio_port));
        Ok(())
    }

    /// Record the client's last-known camera flag. Returns the broadcast
    /// context (display name + meeting code) when the client is in a meeting.
    pub fn set_camera(&self, id: ClientId, enabled: bool) -> Option<(String, String)> {
        let mut inner = self.inner.lock();
        let record = inner.clients.get_mut(&id)?;
        record.camera_enabled = enabled;
        let code = record.meeting.clone()?;
        if record.waiting {
            return None;
        }
        Some((record.name.clone(), code))
    }

    /// Mark `id` as the meeting's in-flight transfer sender (or clear it).
    pub fn set_file_sender(&self, id: ClientId, active: bool) {
        let mut inner = self.inner.lock();
        let Some(code) = inner.clients.get(&id).and_then(|c| c.meeting.clone()) else {
            return;
        };
        if let Some(meeting) = inner.meetings.get_mut(&code) {
            meeting.active_file_sender = if active { Some(id) } else { None };
        }
    }

    /// Resolve the transfer sender to route a FILE_ACK from `acker` to.
    pub fn file_sender_for(&self, acker: ClientId) -> Option<Recipient> {
        let inner = self.inner.lock();
        let code = inner.clients.get(&acker)?.meeting.as_deref()?;
        let sender = inner.meetings.get(code)?.active_file_sender?;
        let record = inner.clients.get(&sender)?;
        Some(record.recipient(sender))
    }

    pub fn info_of(&self, id: ClientId) -> Option<ClientInfo> {
        let inner = self.inner.lock();
        inner.clients.get(&id).map(|c| ClientInfo {
            name: c.name.clone(),
            meeting: c.meeting.clone(),
            is_host: c.is_host,
            waiting: c.waiting,
            camera_enabled: c.camera_enabled,
        })
    }

    /// The host's delivery handle for a meeting code.
    pub fn host_of(&self, code: &str) -> Option<Recipient> {
        let inner = self.inner.lock();
        let meeting = inner.meetings.get(code)?;
        let record = inner.clients.get(&meeting.host)?;
        Some(record.recipient(meeting.host))
    }

    /// Participants of a meeting in insertion order.
    pub fn participants_of(&self, code: &str) -> Vec<Recipient> {
        let inner = self.inner.lock();
        let Some(meeting) = inner.meetings.get(code) else {
            return Vec::new();
        };
        meeting
            .participants
            .iter()
            .filter_map(|id| inner.clients.get(id).map(|c| c.recipient(*id)))
            .collect()
    }

    /// Waiting-room occupants of a meeting.
    pub fn waiting_of(&self, code: &str) -> Vec<Recipient> {
        let inner = self.inner.lock();
        let Some(meeting) = inner.meetings.get(code) else {
            return Vec::new();
        };
        meeting
            .waiting
            .iter()
            .filter_map(|id| inner.clients.get(id).map(|c| c.recipient(*id)))
            .collect()
    }

    /// The sender's meeting mates (participants except the sender itself),
    /// plus the sender's own name and meeting code.
    pub fn broadcast_context(&self, id: ClientId) -> Option<(String, String, Vec<Recipient>)> {
        let inner = self.inner.lock();
        let record = inner.clients.get(&id)?;
        if record.waiting {
            return None;
        }
        let code = record.meeting.clone()?;
        let meeting = inner.meetings.get(&code)?;
        let others = meeting
            .participants
            .iter()
            .filter(|p| **p != id)
            .filter_map(|p| inner.clients.get(p).map(|c| c.recipient(*p)))
            .collect();
        Some((record.name.clone(), code, others))
    }

    /// Registered endpoints of every participant, for the relay's fan-out.
    pub fn relay_snapshot(&self) -> Vec<RelayEndpoint> {
        let inner = self.inner.lock();
        inner
            .clients
            .iter()
            .filter(|(_, c)| !c.waiting)
            .filter_map(|(id, c)| {
                let meeting = c.meeting.clone()?;
                Some(RelayEndpoint {
                    id: *id,
                    meeting,
                    video: c.video_endpoint,
                    audio: c.audio_endpoint,
                })
            })
            .collect()
    }

    pub fn meeting_count(&self) -> usize {
        self.inner.lock().meetings.len()
    }

    fn hosted_meeting_locked(inner: &Inner, host_id: ClientId) -> Result<String, RegistryError> {
        let record = inner
            .clients
            .get(&host_id)
            .ok_or(RegistryError::UnknownClient)?;
        if !record.is_host {
            return Err(RegistryError::NotHost);
        }
        record.meeting.clone().ok_or(RegistryError::NotInMeeting)
    }

    fn waiting_by_name_locked(inner: &Inner, code: &str, name: &str) -> Option<ClientId> {
        let meeting = inner.meetings.get(code)?;
        meeting
            .waiting
            .iter()
            .copied()
            .find(|id| inner.clients.get(id).map(|c| c.name.as_str()) == Some(name))
    }

    fn leave_locked(inner: &mut Inner, id: ClientId) -> LeaveOutcome {
        let Some(record) = inner.clients.get_mut(&id) else {
            return LeaveOutcome::NotAssigned;
        };
        let Some(code) = record.meeting.clone() else {
            return LeaveOutcome::NotAssigned;
        };
        let name = record.name.clone();
        let was_waiting = record.waiting;
        record.detach();

        let Some(meeting) = inner.meetings.get_mut(&code) else {
            return LeaveOutcome::NotAssigned;
        };
        meeting.participants.retain(|c| *c != id);
        meeting.waiting.retain(|c| *c != id);
        if was_waiting {
            // A lobby departure never joined, so there is nothing to announce
            return LeaveOutcome::NotAssigned;
        }
        let was_host = meeting.host == id;
        let destroy = was_host || meeting.participants.is_empty();

        if destroy {
            let meeting = match inner.meetings.remove(&code) {
                Some(m) => m,
                None => return LeaveOutcome::NotAssigned,
            };
            let age = meeting.created_at.elapsed();
            let notify: Vec<Recipient> = meeting
                .participants
                .iter()
                .filter_map(|p| inner.clients.get(p).map(|c| c.recipient(*p)))
                .collect();
            let dropped_waiting: Vec<Recipient> = meeting
                .waiting
                .iter()
                .filter_map(|p| inner.clients.get(p).map(|c| c.recipient(*p)))
                .collect();
            // Cascade: everyone still attached to this meeting becomes unassigned
            for p in meeting.participants.iter().chain(meeting.waiting.iter()) {
                if let Some(c) = inner.clients.get_mut(p) {
                    c.detach();
                }
            }
            warn!(
                "meeting {} destroyed after {:?} ({} expelled, {} waiting dropped)",
                code,
                age,
                notify.len(),
                dropped_waiting.len()
            );
            LeaveOutcome::Departed {
                meeting_code: code,
                name,
                was_host,
                notify,
                dropped_waiting,
                meeting_destroyed: true,
            }
        } else {
            let notify = meeting
                .participants
                .iter()
                .filter_map(|p| inner.clients.get(p).map(|c| c.recipient(*p)))
                .collect();
            LeaveOutcome::Departed {
                meeting_code: code,
                name,
                was_host: false,
                notify,
                dropped_waiting: Vec::new(),
                meeting_destroyed: false,
            }
        }
    }
}

impl Default for MeetingRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;
    use tokio::sync::mpsc;

    fn registry_with_clients(n: u64) -> (MeetingRegistry, Vec<ClientId>) {
        let registry = MeetingRegistry::new();
        let mut ids = Vec::new();
        for i in 0..n {
            let id = ClientId(i);
            let (tx, _rx) = mpsc::unbounded_channel();
            // Leak the receiver side: tests only inspect registry state
            std::mem::forget(_rx);
            registry.connect(id, IpAddr::V4(Ipv4Addr::LOCALHOST), tx);
            ids.push(id);
        }
        (registry, ids)
    }

    #[test]
    fn create_meeting_makes_host_sole_participant() {
        let (registry, ids) = registry_with_clients(1);
        let code = registry.create_meeting(ids[0], "Ada").unwrap();
        assert_eq!(code.len(), 6);
        assert!(code.chars().all(|c| c.is_ascii_digit()));

        let participants = registry.participants_of(&code);
        assert_eq!(participants.len(), 1);
        assert_eq!(participants[0].name, "Ada");
        // The host is always in the participant set
        assert_eq!(registry.host_of(&code).unwrap().id, ids[0]);

        // A second meeting from the same socket is refused
        assert_eq!(
            registry.create_meeting(ids[0], "Ada"),
            Err(RegistryError::AlreadyInMeeting)
        );
    }

    #[test]
    fn join_flow_moves_waiting_to_participants() {
        let (registry, ids) = registry_with_clients(2);
        let code = registry.create_meeting(ids[0], "Ada").unwrap();

        registry.request_join(ids[1], &code, "Bo").unwrap();
        let info = registry.info_of(ids[1]).unwrap();
        assert!(info.waiting);
        assert_eq!(registry.waiting_of(&code).len(), 1);
        assert_eq!(registry.participants_of(&code).len(), 1);

        let admitted = registry.allow_join(ids[0], "Bo").unwrap();
        assert_eq!(admitted.name, "Bo");
        assert!(registry.waiting_of(&code).is_empty());
        assert_eq!(registry.participants_of(&code).len(), 2);
        assert!(!registry.info_of(ids[1]).unwrap().waiting);
    }

    #[test]
    fn join_unknown_meeting_is_rejected() {
        let (registry, ids) = registry_with_clients(1);
        assert_eq!(
            registry.request_join(ids[0], "000000", "Bo"),
            Err(RegistryError::MeetingNotFound("000000".to_string()))
        );
    }

    #[test]
    fn deny_detaches_but_keeps_connection() {
        let (registry, ids) = registry_with_clients(2);
        let code = registry.create_meeting(ids[0], "Ada").unwrap();
        registry.request_join(ids[1], &code, "Bo").unwrap();

        registry.deny_join(ids[0], "Bo").unwrap();
        assert!(registry.waiting_of(&code).is_empty());
        let info = registry.info_of(ids[1]).unwrap();
        assert!(info.meeting.is_none());
        assert!(!info.waiting);
    }

    #[test]
    fn allow_requires_host() {
        let (registry, ids) = registry_with_clients(3);
        let code = registry.create_meeting(ids[0], "Ada").unwrap();
        registry.request_join(ids[1], &code, "Bo").unwrap();
        registry.allow_join(ids[0], "Bo").unwrap();
        registry.request_join(ids[2], &code, "Cy").unwrap();

        assert_eq!(
            registry.allow_join(ids[1], "Cy"),
            Err(RegistryError::NotHost)
        );
    }

    #[test]
    fn host_leaving_destroys_meeting_and_detaches_everyone() {
        let (registry, ids) = registry_with_clients(3);
        let code = registry.create_meeting(ids[0], "Ada").unwrap();
        registry.request_join(ids[1], &code, "Bo").unwrap();
        registry.allow_join(ids[0], "Bo").unwrap();
        registry.request_join(ids[2], &code, "Cy").unwrap();

        match registry.leave(ids[0]) {
            LeaveOutcome::Departed {
                was_host,
                notify,
                dropped_waiting,
                meeting_destroyed,
                ..
            } => {
                assert!(was_host);
                assert!(meeting_destroyed);
                assert_eq!(notify.len(), 1);
                assert_eq!(notify[0].name, "Bo");
                assert_eq!(dropped_waiting.len(), 1);
                assert_eq!(dropped_waiting[0].name, "Cy");
            }
            other => panic!("unexpected outcome: {:?}", other),
        }
        assert_eq!(registry.meeting_count(), 0);
        // Expelled guests are unassigned, not removed
        assert!(registry.info_of(ids[1]).unwrap().meeting.is_none());
        assert!(registry.info_of(ids[2]).unwrap().meeting.is_none());
    }

    #[test]
    fn meeting_drains_to_empty_and_is_destroyed() {
        let (registry, ids) = registry_with_clients(2);
        let code = registry.create_meeting(ids[0], "Ada").unwrap();
        registry.request_join(ids[1], &code, "Bo").unwrap();
        registry.allow_join(ids[0], "Bo").unwrap();

        // Guest departure keeps the meeting alive
        match registry.leave(ids[1]) {
            LeaveOutcome::Departed {
                was_host,
                meeting_destroyed,
                notify,
                ..
            } => {
                assert!(!was_host);
                assert!(!meeting_destroyed);
                assert_eq!(notify.len(), 1);
            }
            other => panic!("unexpected outcome: {:?}", other),
        }
        assert_eq!(registry.meeting_count(), 1);

        // Host departure drains it
        registry.leave(ids[0]);
        assert_eq!(registry.meeting_count(), 0);
    }

    #[test]
    fn register_udp_uses_peer_ip_and_is_idempotent() {
        let (registry, ids) = registry_with_clients(1);
        let code = registry.create_meeting(ids[0], "Ada").unwrap();
        registry.register_udp(ids[0], 40000, 40001).unwrap();
        registry.register_udp(ids[0], 40000, 40001).unwrap();

        let snapshot = registry.relay_snapshot();
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].meeting, code);
        assert_eq!(
            snapshot[0].video,
            Some(SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 40000))
        );
        assert_eq!(
            snapshot[0].audio,
            Some(SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 40001))
        );
    }

    #[test]
    fn unregistered_endpoints_stay_null_in_snapshot() {
        let (registry, ids) = registry_with_clients(1);
        registry.create_meeting(ids[0], "Ada").unwrap();
        let snapshot = registry.relay_snapshot();
        assert_eq!(snapshot[0].video, None);
        assert_eq!(snapshot[0].audio, None);
    }

    #[test]
    fn waiting_clients_are_not_in_relay_snapshot() {
        let (registry, ids) = registry_with_clients(2);
        let code = registry.create_meeting(ids[0], "Ada").unwrap();
        registry.request_join(ids[1], &code, "Bo").unwrap();
        registry.register_udp(ids[1], 40100, 40101).unwrap();

        let snapshot = registry.relay_snapshot();
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].id, ids[0]);
    }

    #[test]
    fn file_ack_routes_to_active_sender() {
        let (registry, ids) = registry_with_clients(2);
        let code = registry.create_meeting(ids[0], "Ada").unwrap();
        registry.request_join(ids[1], &code, "Bo").unwrap();
        registry.allow_join(ids[0], "Bo").unwrap();

        registry.set_file_sender(ids[0], true);
        let sender = registry.file_sender_for(ids[1]).unwrap();
        assert_eq!(sender.id, ids[0]);

        registry.set_file_sender(ids[0], false);
        assert!(registry.file_sender_for(ids[1]).is_none());
    }

    #[test]
    fn broadcast_context_excludes_sender_and_waiting() {
        let (registry, ids) = registry_with_clients(3);
        let code = registry.create_meeting(ids[0], "Ada").unwrap();
        registry.request_join(ids[1], &code, "Bo").unwrap();
        registry.allow_join(ids[0], "Bo").unwrap();
        registry.request_join(ids[2], &code, "Cy").unwrap();

        let (name, meeting, others) = registry.broadcast_context(ids[0]).unwrap();
        assert_eq!(name, "Ada");
        assert_eq!(meeting, code);
        assert_eq!(others.len(), 1);
        assert_eq!(others[0].name, "Bo");

        // A waiting client has no broadcast context
        assert!(registry.broadcast_context(ids[2]).is_none());
    }
}
