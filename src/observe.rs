use crate::geo::{LocationInfo, OperatorInfo};
use crate::model::{
    Observation, PeerState, RawPeer, SeenRecord, SwarmSnapshot, Timestamp, TorrentMeta,
    TorrentTarget, normalize_addr,
};
use std::net::IpAddr;

pub const ETA_INFINITE: &str = "infinite";

/// Client id bytes that are not valid UTF-8.
pub const CLIENT_UNDECODABLE: &str = "Unknown";
/// Client id that decoded to an empty string.
pub const CLIENT_EMPTY: &str = "unknown";

const SECS_PER_DAY: i64 = 24 * 60 * 60;

/// Enrichment results for one peer address.
#[derive(Debug, Clone)]
pub struct Enrichment {
    pub location: LocationInfo,
    pub operator: OperatorInfo,
}

pub fn derive_state(downloading_piece_index: i64, progress: f64) -> PeerState {
    match downloading_piece_index {
        -1 if progress >= 1.0 => PeerState::Completed,
        -1 => PeerState::Stopped,
        _ => PeerState::Downloading,
    }
}

/// Remaining time as `HH:MM:SS`, or `"infinite"` when nothing is flowing.
/// Durations of a day or more wrap around midnight.
pub fn estimate_eta(meta: &TorrentMeta, downloaded_pieces: i64, throughput: u64) -> String {
    if throughput == 0 {
        return ETA_INFINITE.to_string();
    }
    let remaining = meta.total_size as f64 - downloaded_pieces as f64 * meta.piece_size as f64;
    let secs = (remaining / throughput as f64).floor() as i64;
    let secs = secs.rem_euclid(SECS_PER_DAY);
    format!("{:02}:{:02}:{:02}", secs / 3600, secs % 3600 / 60, secs % 60)
}

pub fn decode_client(raw: &[u8]) -> String {
    match std::str::from_utf8(raw) {
        Err(_) => CLIENT_UNDECODABLE.to_string(),
        Ok("") => CLIENT_EMPTY.to_string(),
        Ok(s) => s.to_string(),
    }
}

/// True when the peer is this process's own public address.
pub fn is_self(addr: &str, own: IpAddr) -> bool {
    let addr = normalize_addr(addr);
    match addr.parse::<IpAddr>() {
        Ok(ip) => ip == own || ip.to_canonical() == own.to_canonical(),
        Err(_) => addr == own.to_string(),
    }
}

pub fn build_observation(
    target: &TorrentTarget,
    snapshot: &SwarmSnapshot,
    peer: &RawPeer,
    seen: Option<&SeenRecord>,
    enrichment: Enrichment,
    now: Timestamp,
) -> Observation {
    let ip = normalize_addr(&peer.address).to_string();
    let first_seen = seen.map_or(now, |s| s.first_seen);
    let location = enrichment.location.into_location();
    let meta = &snapshot.torrent;

    Observation {
        ip,
        port: peer.port,
        isp: enrichment.operator.isp(),
        client: decode_client(&peer.client),
        country_iso: location.iso_code,
        country: location.country,
        city: location.city,
        region: location.region,
        province: location.province,
        first_seen,
        last_seen: now,
        torrent: target.source.clone(),
        name: target.name.clone(),
        infohash: target.info_hash.clone(),
        total_size: meta.total_size,
        num_pieces: meta.num_pieces,
        piece_size: meta.piece_size,
        downloaded_pieces: peer.downloading_piece_index,
        download_speed: peer.download_speed,
        upload_speed: peer.upload_speed,
        num_seeds: snapshot.status.num_seeds,
        num_peers: snapshot.status.num_peers,
        estimated_time: estimate_eta(meta, peer.downloading_piece_index, peer.download_speed),
        state: derive_state(peer.downloading_piece_index, peer.progress),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geo::{AsnRecord, NOT_AVAILABLE};
    use crate::model::TorrentStatus;
    use chrono::{Duration, TimeZone, Utc};

    fn meta() -> TorrentMeta {
        TorrentMeta {
            total_size: 1000,
            num_pieces: 10,
            piece_size: 100,
        }
    }

    fn peer(address: &str) -> RawPeer {
        RawPeer {
            address: address.to_string(),
            port: 51413,
            client: b"Transmission 3.00".to_vec(),
            progress: 0.5,
            downloading_piece_index: 2,
            download_speed: 100,
            upload_speed: 7,
        }
    }

    #[test]
    fn state_follows_piece_index_and_progress() {
        assert_eq!(derive_state(-1, 1.0), PeerState::Completed);
        assert_eq!(derive_state(-1, 0.5), PeerState::Stopped);
        assert_eq!(derive_state(5, 0.5), PeerState::Downloading);
        assert_eq!(derive_state(5, 1.0), PeerState::Downloading);
    }

    #[test]
    fn eta_is_infinite_without_throughput() {
        assert_eq!(estimate_eta(&meta(), 2, 0), ETA_INFINITE);
    }

    #[test]
    fn eta_is_remaining_bytes_over_throughput() {
        assert_eq!(estimate_eta(&meta(), 2, 100), "00:00:08");
    }

    #[test]
    fn eta_wraps_past_a_day() {
        let big = TorrentMeta {
            total_size: 90_000,
            num_pieces: 1,
            piece_size: 1,
        };
        // 25h remaining shows as 01:00:00.
        assert_eq!(estimate_eta(&big, 0, 1), "01:00:00");
    }

    #[test]
    fn client_fallbacks_keep_their_distinct_literals() {
        assert_eq!(decode_client(&[0xff, 0xfe]), CLIENT_UNDECODABLE);
        assert_eq!(decode_client(b""), CLIENT_EMPTY);
        assert_eq!(decode_client(b"  "), "  ");
        assert_eq!(decode_client(b"Deluge 2.0.4"), "Deluge 2.0.4");
    }

    #[test]
    fn own_address_is_recognised_in_mapped_form() {
        let own: IpAddr = "203.0.113.5".parse().unwrap();
        assert!(is_self("::ffff:203.0.113.5", own));
        assert!(is_self("203.0.113.5", own));
        assert!(!is_self("198.51.100.1", own));
    }

    #[test]
    fn first_sighting_uses_now_for_both_timestamps() {
        let now = Utc.with_ymd_and_hms(2025, 10, 1, 12, 0, 0).unwrap();
        let target = TorrentTarget {
            info_hash: "aa".repeat(20),
            name: "ubuntu".into(),
            source: "ubuntu.torrent".into(),
        };
        let snapshot = SwarmSnapshot {
            status: TorrentStatus {
                num_seeds: 4,
                num_peers: 9,
                ..Default::default()
            },
            torrent: meta(),
            peers: Vec::new(),
        };
        let enrichment = Enrichment {
            location: LocationInfo::Unavailable,
            operator: OperatorInfo::Found(AsnRecord {
                number: Some(64500),
                organization: Some("Example Net".into()),
            }),
        };

        let obs = build_observation(
            &target,
            &snapshot,
            &peer("::ffff:203.0.113.5"),
            None,
            enrichment.clone(),
            now,
        );
        assert_eq!(obs.ip, "203.0.113.5");
        assert_eq!(obs.first_seen, now);
        assert_eq!(obs.last_seen, now);
        assert_eq!(obs.country, NOT_AVAILABLE);
        assert_eq!(obs.isp, "Example Net");
        assert_eq!(obs.state, PeerState::Downloading);
        assert_eq!(obs.estimated_time, "00:00:08");
        assert_eq!(obs.num_seeds, 4);
        assert_eq!(obs.torrent, "ubuntu.torrent");

        let earlier = now - Duration::hours(3);
        let seen = SeenRecord {
            first_seen: earlier,
            last_seen: earlier,
        };
        let obs = build_observation(
            &target,
            &snapshot,
            &peer("203.0.113.5"),
            Some(&seen),
            enrichment,
            now,
        );
        assert_eq!(obs.first_seen, earlier);
        assert_eq!(obs.last_seen, now);
    }
}
