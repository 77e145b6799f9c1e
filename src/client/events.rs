//! Typed event bus between the network workers and the UI thread
//!
//! Worker loops never touch UI state; every state transition and every
//! recoverable error becomes a variant here, consumed on the UI's own
//! thread. The channel is unbounded so emitting never blocks a network
//! loop.

use super::session::SessionState;
use super::stats::StatsSnapshot;
use crate::protocol::QualityTier;
use crossbeam::channel::{unbounded, Receiver, Sender};

/// Everything the UI can learn from the core.
#[derive(Debug, Clone)]
pub enum ClientEvent {
    /// Session state machine moved
    StateChanged(SessionState),
    /// Meeting created, code assigned (host side)
    MeetingCreated { code: String },
    /// Someone is waiting for host approval (host side)
    JoinRequest { client_name: String },
    ParticipantJoined { name: String, is_host: bool },
    ParticipantLeft { name: String, is_host: bool },
    Chat {
        sender: String,
        message: String,
        is_private: bool,
    },
    CameraStatus { participant: String, enabled: bool },
    /// Adaptive controller switched the send tier
    QualityChanged { tier: QualityTier },
    /// 1 Hz metrics snapshot
    StatsUpdated(StatsSnapshot),
    /// A remote participant started sending us a file
    FileIncoming {
        sender: String,
        filename: String,
        filesize: u64,
    },
    FileProgress {
        filename: String,
        bytes_done: u64,
        total: u64,
    },
    /// Transfer finished; `checksum_ok` is false on an MD5 mismatch
    /// (the file is retained either way)
    FileComplete {
        filename: String,
        checksum_ok: bool,
    },
    /// Another participant shares our display name; name-keyed targeting
    /// is ambiguous from here on
    DuplicateName { name: String },
    /// A recoverable transport fault, surfaced for the log/toast layer
    TransportError(String),
}

/// Cloneable sending side of the bus.
#[derive(Clone)]
pub struct EventBus {
    tx: Sender<ClientEvent>,
}

impl EventBus {
    pub fn new() -> (Self, Receiver<ClientEvent>) {
        let (tx, rx) = unbounded();
        (Self { tx }, rx)
    }

    /// Emit an event; a gone consumer is not an error for the workers.
    pub fn emit(&self, event: ClientEvent) {
        let _ = self.tx.send(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn events_arrive_in_order() {
        let (bus, rx) = EventBus::new();
        bus.emit(ClientEvent::MeetingCreated {
            code: "123456".to_string(),
        });
        bus.emit(ClientEvent::ParticipantJoined {
            name: "Bo".to_string(),
            is_host: false,
        });

        assert!(matches!(
            rx.try_recv().unwrap(),
            ClientEvent::MeetingCreated { .. }
        ));
        assert!(matches!(
            rx.try_recv().unwrap(),
            ClientEvent::ParticipantJoined { .. }
        ));
    }

    #[test]
    fn emit_without_consumer_does_not_panic() {
        let (bus, rx) = EventBus::new();
        drop(rx);
        bus.emit(ClientEvent::TransportError("socket closed".to_string()));
    }
}
