//! UDP media relay
//!
//! A single receive loop classifies each datagram by payload-length
//! validation and fans it out inline to the sender's meeting mates, video
//! datagrams to video endpoints and audio to audio endpoints. Datagrams are
//! never queued; a failed send drops the datagram for that recipient only.

use super::registry::{ClientId, MeetingRegistry, RelayEndpoint};
use crate::protocol::headers::{classify, MediaKind};
use log::{debug, warn};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::UdpSocket;

/// Source ports within this distance of a registered receive port are
/// assumed to belong to the same client when several clients share an IP.
const PORT_PROXIMITY: u16 = 10;

/// Receive and reflect datagrams forever.
pub async fn run_relay(socket: UdpSocket, registry: Arc<MeetingRegistry>) {
    let mut buf = vec![0u8; 65536];
    let mut relayed: u64 = 0;
    let mut dropped: u64 = 0;

    loop {
        let (len, src) = match socket.recv_from(&mut buf).await {
            Ok(v) => v,
            Err(e) => {
                warn!("relay recv failed: {}", e);
                continue;
            }
        };
        let data = &buf[..len];

        let Some(kind) = classify(data) else {
            dropped += 1;
            if dropped % 100 == 1 {
                debug!("dropped {} unclassifiable datagrams (last from {})", dropped, src);
            }
            continue;
        };

        let snapshot = registry.relay_snapshot();
        let sender = identify_sender(&snapshot, src);
        let targets = fan_out_targets(&snapshot, kind, sender, src);

        for addr in targets {
            if let Err(e) = socket.send_to(data, addr).await {
                debug!("relay send to {} failed: {}", addr, e);
            }
        }

        relayed += 1;
        if relayed % 500 == 0 {
            debug!("relayed {} datagrams, dropped {}", relayed, dropped);
        }
    }
}

/// Match the datagram source against registered endpoints.
///
/// Send sockets are ephemeral, so an exact port match is rare; the fallback
/// is the source IP, disambiguated by port proximity when several clients
/// share the IP. On a shared host identification can still fail; the caller
/// then falls back to a wider fan-out.
pub(crate) fn identify_sender(
    snapshot: &[RelayEndpoint],
    src: SocketAddr,
) -> Option<ClientId> {
    // Exact registered-endpoint match wins outright.
    for endpoint in snapshot {
        if endpoint.video == Some(src) || endpoint.audio == Some(src) {
            return Some(endpoint.id);
        }
    }

    let same_ip: Vec<&RelayEndpoint> = snapshot
        .iter()
        .filter(|e| {
            e.video.map(|a| a.ip()) == Some(src.ip()) || e.audio.map(|a| a.ip()) == Some(src.ip())
        })
        .collect();
    match same_ip.as_slice() {
        [] => None,
        [only] => Some(only.id),
        many => many
            .iter()
            .filter_map(|e| {
                [e.video, e.audio]
                    .into_iter()
                    .flatten()
                    .map(|a| a.port().abs_diff(src.port()))
                    .min()
                    .filter(|d| *d < PORT_PROXIMITY)
                    .map(|d| (d, e.id))
            })
            .min_by_key(|(d, _)| *d)
            .map(|(_, id)| id),
    }
}

/// Compute the destination endpoints for one datagram.
///
/// With an identified sender, the fan-out is the sender's meeting minus the
/// sender. Without one (ambiguous shared-IP source), fall back to every
/// meeting a same-IP client belongs to, excluding only an exact
/// source-address match. NULL (unregistered) endpoints are never targeted.
pub(crate) fn fan_out_targets(
    snapshot: &[RelayEndpoint],
    kind: MediaKind,
    sender: Option<ClientId>,
    src: SocketAddr,
) -> Vec<SocketAddr> {
    let endpoint_of = |e: &RelayEndpoint| match kind {
        MediaKind::Video => e.video,
        MediaKind::Audio => e.audio,
    };

    match sender {
        Some(sender_id) => {
            let Some(meeting) = snapshot
                .iter()
                .find(|e| e.id == sender_id)
                .map(|e| e.meeting.clone())
            else {
                return Vec::new();
            };
            snapshot
                .iter()
                .filter(|e| e.meeting == meeting && e.id != sender_id)
                .filter_map(endpoint_of)
                .collect()
        }
        None => {
            let candidate_meetings: Vec<&str> = snapshot
                .iter()
                .filter(|e| {
                    e.video.map(|a| a.ip()) == Some(src.ip())
                        || e.audio.map(|a| a.ip()) == Some(src.ip())
                })
                .map(|e| e.meeting.as_str())
                .collect();
            snapshot
                .iter()
                .filter(|e| candidate_meetings.contains(&e.meeting.as_str()))
                .filter_map(endpoint_of)
                .filter(|addr| *addr != src)
                .collect()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr};

    fn addr(ip: [u8; 4], port: u16) -> SocketAddr {
        SocketAddr::new(IpAddr::V4(Ipv4Addr::from(ip)), port)
    }

    fn endpoint(id: u64, meeting: &str, ip: [u8; 4], video: u16, audio: u16) -> RelayEndpoint {
        RelayEndpoint {
            id: ClientId(id),
            meeting: meeting.to_string(),
            video: Some(addr(ip, video)),
            audio: Some(addr(ip, audio)),
        }
    }

    #[test]
    fn identifies_by_unique_ip() {
        let snapshot = vec![
            endpoint(1, "111111", [10, 0, 0, 1], 40000, 40001),
            endpoint(2, "111111", [10, 0, 0, 2], 41000, 41001),
        ];
        // Ephemeral source port, nothing like the registered ones
        assert_eq!(
            identify_sender(&snapshot, addr([10, 0, 0, 1], 55123)),
            Some(ClientId(1))
        );
        assert_eq!(
            identify_sender(&snapshot, addr([10, 0, 0, 2], 50999)),
            Some(ClientId(2))
        );
    }

    #[test]
    fn exact_endpoint_match_wins() {
        let snapshot = vec![
            endpoint(1, "111111", [127, 0, 0, 1], 40000, 40001),
            endpoint(2, "111111", [127, 0, 0, 1], 41000, 41001),
        ];
        assert_eq!(
            identify_sender(&snapshot, addr([127, 0, 0, 1], 41000)),
            Some(ClientId(2))
        );
    }

    #[test]
    fn shared_ip_uses_port_proximity() {
        let snapshot = vec![
            endpoint(1, "111111", [127, 0, 0, 1], 40000, 40001),
            endpoint(2, "111111", [127, 0, 0, 1], 41000, 41001),
        ];
        assert_eq!(
            identify_sender(&snapshot, addr([127, 0, 0, 1], 40005)),
            Some(ClientId(1))
        );
        // Far from both clients' ports: ambiguous
        assert_eq!(identify_sender(&snapshot, addr([127, 0, 0, 1], 50000)), None);
    }

    #[test]
    fn unknown_ip_is_unidentified() {
        let snapshot = vec![endpoint(1, "111111", [10, 0, 0, 1], 40000, 40001)];
        assert_eq!(identify_sender(&snapshot, addr([192, 168, 1, 9], 5555)), None);
    }

    #[test]
    fn fan_out_excludes_sender_and_other_meetings() {
        let snapshot = vec![
            endpoint(1, "111111", [10, 0, 0, 1], 40000, 40001),
            endpoint(2, "111111", [10, 0, 0, 2], 41000, 41001),
            endpoint(3, "222222", [10, 0, 0, 3], 42000, 42001),
        ];
        let targets = fan_out_targets(
            &snapshot,
            MediaKind::Video,
            Some(ClientId(1)),
            addr([10, 0, 0, 1], 55123),
        );
        assert_eq!(targets, vec![addr([10, 0, 0, 2], 41000)]);
    }

    #[test]
    fn fan_out_uses_endpoint_kind() {
        let snapshot = vec![
            endpoint(1, "111111", [10, 0, 0, 1], 40000, 40001),
            endpoint(2, "111111", [10, 0, 0, 2], 41000, 41001),
        ];
        let targets = fan_out_targets(
            &snapshot,
            MediaKind::Audio,
            Some(ClientId(1)),
            addr([10, 0, 0, 1], 55123),
        );
        assert_eq!(targets, vec![addr([10, 0, 0, 2], 41001)]);
    }

    #[test]
    fn fan_out_skips_null_endpoints() {
        let snapshot = vec![
            endpoint(1, "111111", [10, 0, 0, 1], 40000, 40001),
            RelayEndpoint {
                id: ClientId(2),
                meeting: "111111".to_string(),
                video: None,
                audio: None,
            },
        ];
        let targets = fan_out_targets(
            &snapshot,
            MediaKind::Video,
            Some(ClientId(1)),
            addr([10, 0, 0, 1], 55123),
        );
        assert!(targets.is_empty());
    }

    #[test]
    fn ambiguous_sender_falls_back_to_candidate_meetings() {
        let snapshot = vec![
            endpoint(1, "111111", [127, 0, 0, 1], 40000, 40001),
            endpoint(2, "111111", [127, 0, 0, 1], 41000, 41001),
            endpoint(3, "222222", [10, 0, 0, 3], 42000, 42001),
        ];
        let targets = fan_out_targets(
            &snapshot,
            MediaKind::Video,
            None,
            addr([127, 0, 0, 1], 50000),
        );
        // Both loopback clients get the datagram, the unrelated meeting does not
        assert_eq!(
            targets,
            vec![addr([127, 0, 0, 1], 40000), addr([127, 0, 0, 1], 41000)]
        );
    }

    #[test]
    fn unregistered_source_reaches_no_one() {
        let snapshot = vec![endpoint(1, "111111", [10, 0, 0, 1], 40000, 40001)];
        let targets = fan_out_targets(
            &snapshot,
            MediaKind::Video,
            None,
            addr([192, 168, 1, 9], 5555),
        );
        assert!(targets.is_empty());
    }
}
