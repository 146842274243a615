use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use std::fmt;

pub type Timestamp = DateTime<Utc>;

const IPV4_MAPPED_PREFIX: &str = "::ffff:";
const UTC_TEXT_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Strips the textual IPv4-mapped IPv6 prefix so `::ffff:203.0.113.5` and
/// `203.0.113.5` name the same peer.
pub fn normalize_addr(addr: &str) -> &str {
    let addr = addr.trim();
    match addr.get(..IPV4_MAPPED_PREFIX.len()) {
        Some(prefix) if prefix.eq_ignore_ascii_case(IPV4_MAPPED_PREFIX) => {
            &addr[IPV4_MAPPED_PREFIX.len()..]
        }
        _ => addr,
    }
}

pub fn format_utc(ts: &Timestamp) -> String {
    format!("{} UTC", ts.format(UTC_TEXT_FORMAT))
}

pub fn parse_utc(s: &str) -> Option<Timestamp> {
    let s = s.trim();
    let s = s.strip_suffix("UTC").unwrap_or(s).trim_end();
    NaiveDateTime::parse_from_str(s, UTC_TEXT_FORMAT)
        .ok()
        .map(|naive| naive.and_utc())
}

/// A torrent tracked for the whole run.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TorrentTarget {
    pub info_hash: String,
    pub name: String,
    /// File the torrent was loaded from.
    #[serde(default)]
    pub source: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TorrentStatus {
    pub num_seeds: u32,
    pub num_peers: u32,
    /// Local completion fraction, used by the auto-restart policy.
    #[serde(default)]
    pub progress: f64,
    #[serde(default)]
    pub download_rate: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TorrentMeta {
    pub total_size: u64,
    pub num_pieces: u32,
    pub piece_size: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawPeer {
    pub address: String,
    pub port: u16,
    /// Raw client identifier; not guaranteed to be valid UTF-8.
    #[serde(default, deserialize_with = "client_bytes")]
    pub client: Vec<u8>,
    #[serde(default)]
    pub progress: f64,
    /// -1 when the peer is not fetching any piece.
    #[serde(default = "no_piece")]
    pub downloading_piece_index: i64,
    #[serde(default)]
    pub download_speed: u64,
    #[serde(default)]
    pub upload_speed: u64,
}

fn no_piece() -> i64 {
    -1
}

fn client_bytes<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Text(String),
        Bytes(Vec<u8>),
    }

    Ok(match Option::<Raw>::deserialize(d)? {
        Some(Raw::Text(s)) => s.into_bytes(),
        Some(Raw::Bytes(b)) => b,
        None => Vec::new(),
    })
}

/// One poll of a torrent's swarm. Not retained across cycles.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SwarmSnapshot {
    pub status: TorrentStatus,
    pub torrent: TorrentMeta,
    #[serde(default)]
    pub peers: Vec<RawPeer>,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PeerKey {
    pub address: String,
    pub port: u16,
    pub info_hash: String,
}

impl PeerKey {
    pub fn new(address: &str, port: u16, info_hash: &str) -> Self {
        Self {
            address: normalize_addr(address).to_string(),
            port,
            info_hash: info_hash.to_ascii_lowercase(),
        }
    }
}

impl fmt::Display for PeerKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}|{}|{}", self.address, self.port, self.info_hash)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SeenRecord {
    pub first_seen: Timestamp,
    pub last_seen: Timestamp,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PeerState {
    Completed,
    Stopped,
    Downloading,
}

impl PeerState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Completed => "completed",
            Self::Stopped => "stopped",
            Self::Downloading => "downloading",
        }
    }
}

impl fmt::Display for PeerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The enriched, persisted record for one peer in one cycle.
///
/// Field order is the tabular column order; serde names match the
/// historical column headers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Observation {
    pub ip: String,
    pub port: u16,
    pub isp: String,
    pub client: String,
    #[serde(rename = "countryISO")]
    pub country_iso: String,
    pub country: String,
    pub city: String,
    pub region: String,
    pub province: String,
    #[serde(with = "utc_text")]
    pub first_seen: Timestamp,
    #[serde(with = "utc_text")]
    pub last_seen: Timestamp,
    pub torrent: String,
    pub name: String,
    pub infohash: String,
    pub total_size: u64,
    pub num_pieces: u32,
    pub piece_size: u64,
    pub downloaded_pieces: i64,
    pub download_speed: u64,
    pub upload_speed: u64,
    pub num_seeds: u32,
    pub num_peers: u32,
    pub estimated_time: String,
    pub state: PeerState,
}

impl Observation {
    pub fn key(&self) -> PeerKey {
        PeerKey::new(&self.ip, self.port, &self.infohash)
    }
}

mod utc_text {
    use super::{Timestamp, format_utc, parse_utc};
    use serde::{Deserialize, Deserializer, Serializer, de::Error};

    pub fn serialize<S: Serializer>(ts: &Timestamp, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&format_utc(ts))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Timestamp, D::Error> {
        let raw = String::deserialize(d)?;
        parse_utc(&raw).ok_or_else(|| D::Error::custom(format!("invalid timestamp: {raw}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn mapped_prefix_is_stripped() {
        assert_eq!(normalize_addr("::ffff:203.0.113.5"), "203.0.113.5");
        assert_eq!(normalize_addr("::FFFF:203.0.113.5"), "203.0.113.5");
        assert_eq!(normalize_addr("203.0.113.5"), "203.0.113.5");
        assert_eq!(normalize_addr("2001:db8::1"), "2001:db8::1");
    }

    #[test]
    fn both_address_forms_build_the_same_key() {
        let a = PeerKey::new("::ffff:203.0.113.5", 6881, "ABCDEF");
        let b = PeerKey::new("203.0.113.5", 6881, "abcdef");
        assert_eq!(a, b);
    }

    #[test]
    fn utc_text_round_trips_whole_seconds() {
        let ts = Utc.with_ymd_and_hms(2025, 9, 29, 13, 4, 5).unwrap();
        let text = format_utc(&ts);
        assert_eq!(text, "2025-09-29 13:04:05 UTC");
        assert_eq!(parse_utc(&text), Some(ts));
        assert_eq!(parse_utc("None"), None);
    }

    #[test]
    fn spool_peer_accepts_text_or_byte_clients() {
        let text: RawPeer =
            serde_json::from_str(r#"{"address":"1.2.3.4","port":1,"client":"qBittorrent 4.3.6"}"#)
                .unwrap();
        assert_eq!(text.client, b"qBittorrent 4.3.6");
        assert_eq!(text.downloading_piece_index, -1);

        let bytes: RawPeer =
            serde_json::from_str(r#"{"address":"1.2.3.4","port":1,"client":[255,254]}"#).unwrap();
        assert_eq!(bytes.client, vec![255, 254]);
    }
}
