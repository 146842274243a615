use crate::model::{Observation, PeerKey, Timestamp, TorrentTarget};
use bincode::Options;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

const PEER_RECORD_MAGIC: [u8; 4] = *b"PWP1";
const OBSERVATION_MAGIC: [u8; 4] = *b"PWO1";
const TARGET_RECORD_MAGIC: [u8; 4] = *b"PWT1";

const PEER_PREFIX: &[u8] = b"peer:";
const OBSERVATION_PREFIX: &[u8] = b"obs:";
const TARGET_PREFIX: &[u8] = b"target:";

fn bincode_opts() -> impl bincode::Options {
    // Varint encoding reduces disk usage for small integers.
    // Limit prevents accidental OOM / huge allocations on corrupted data.
    bincode::DefaultOptions::new()
        .with_varint_encoding()
        .with_limit(1024 * 1024)
}

fn encode<T: Serialize>(magic: [u8; 4], value: &T) -> anyhow::Result<Vec<u8>> {
    let payload = bincode_opts().serialize(value)?;
    let mut out = Vec::with_capacity(magic.len() + payload.len());
    out.extend_from_slice(&magic);
    out.extend_from_slice(&payload);
    Ok(out)
}

fn decode<T: DeserializeOwned>(magic: [u8; 4], bytes: &[u8]) -> anyhow::Result<T> {
    let Some(payload) = bytes.strip_prefix(&magic) else {
        anyhow::bail!("unexpected record magic");
    };
    Ok(bincode_opts().deserialize(payload)?)
}

/// Timing summary for one peer key, updated on every stored observation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PeerRecord {
    pub address: String,
    pub port: u16,
    pub info_hash: String,
    pub first_seen_unix_ms: i64,
    pub last_seen_unix_ms: i64,
    pub observations: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TargetRecord {
    pub info_hash: String,
    pub name: String,
    pub source: String,
    pub registered_unix_ms: i64,
}

fn key_for_peer(key: &PeerKey) -> Vec<u8> {
    let mut out = PEER_PREFIX.to_vec();
    out.extend_from_slice(key.to_string().as_bytes());
    out
}

fn key_for_target(info_hash: &str) -> Vec<u8> {
    let mut out = TARGET_PREFIX.to_vec();
    out.extend_from_slice(info_hash.as_bytes());
    out
}

fn from_unix_ms(ms: i64) -> Option<Timestamp> {
    DateTime::<Utc>::from_timestamp_millis(ms)
}

/// Appends the observation and folds it into the peer's timing summary.
/// An existing first-seen is kept even if the observation claims a later one.
pub fn record_observation(db: &sled::Db, obs: &Observation) -> anyhow::Result<PeerRecord> {
    let id = db.generate_id()?;
    let mut obs_key = OBSERVATION_PREFIX.to_vec();
    obs_key.extend_from_slice(&id.to_be_bytes());
    db.insert(obs_key, encode(OBSERVATION_MAGIC, obs)?)?;

    let key = key_for_peer(&obs.key());
    let first = obs.first_seen.timestamp_millis();
    let last = obs.last_seen.timestamp_millis();

    let record = match db.get(&key)? {
        Some(bytes) => {
            let mut record: PeerRecord = decode(PEER_RECORD_MAGIC, &bytes)?;
            record.first_seen_unix_ms = record.first_seen_unix_ms.min(first);
            record.last_seen_unix_ms = record.last_seen_unix_ms.max(last);
            record.observations += 1;
            record
        }
        None => PeerRecord {
            address: obs.ip.clone(),
            port: obs.port,
            info_hash: obs.infohash.clone(),
            first_seen_unix_ms: first,
            last_seen_unix_ms: last,
            observations: 1,
        },
    };

    db.insert(key, encode(PEER_RECORD_MAGIC, &record)?)?;
    Ok(record)
}

/// Every known peer key with its first-seen time. Undecodable entries are
/// skipped with a warning.
pub fn load_history(db: &sled::Db) -> anyhow::Result<Vec<(PeerKey, Timestamp)>> {
    let mut out = Vec::new();
    for item in db.scan_prefix(PEER_PREFIX) {
        let (k, v) = item?;
        let record: PeerRecord = match decode(PEER_RECORD_MAGIC, &v) {
            Ok(r) => r,
            Err(err) => {
                tracing::warn!(%err, key = %String::from_utf8_lossy(&k), "storage: skipping peer record");
                continue;
            }
        };
        let Some(first_seen) = from_unix_ms(record.first_seen_unix_ms) else {
            continue;
        };
        out.push((
            PeerKey::new(&record.address, record.port, &record.info_hash),
            first_seen,
        ));
    }
    Ok(out)
}

/// Registers a target once; returns false when it was already known.
pub fn register_target(db: &sled::Db, target: &TorrentTarget) -> anyhow::Result<bool> {
    let record = TargetRecord {
        info_hash: target.info_hash.clone(),
        name: target.name.clone(),
        source: target.source.clone(),
        registered_unix_ms: Utc::now().timestamp_millis(),
    };
    let res = db.compare_and_swap(
        key_for_target(&target.info_hash),
        None as Option<&[u8]>,
        Some(encode(TARGET_RECORD_MAGIC, &record)?),
    )?;
    Ok(res.is_ok())
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::model::PeerState;
    use chrono::{Duration, TimeZone};

    pub(crate) fn temp_db() -> sled::Db {
        sled::Config::new()
            .temporary(true)
            .open()
            .unwrap()
    }

    pub(crate) fn observation(ip: &str, first: Timestamp, last: Timestamp) -> Observation {
        Observation {
            ip: ip.to_string(),
            port: 6881,
            isp: "Example Net".into(),
            client: "Deluge 2.0.4".into(),
            country_iso: "ES".into(),
            country: "Spain".into(),
            city: "Madrid".into(),
            region: "Madrid".into(),
            province: "".into(),
            first_seen: first,
            last_seen: last,
            torrent: "ubuntu.torrent".into(),
            name: "ubuntu".into(),
            infohash: "00112233445566778899aabbccddeeff00112233".into(),
            total_size: 1000,
            num_pieces: 10,
            piece_size: 100,
            downloaded_pieces: -1,
            download_speed: 0,
            upload_speed: 0,
            num_seeds: 1,
            num_peers: 2,
            estimated_time: "infinite".into(),
            state: PeerState::Stopped,
        }
    }

    pub(crate) fn list_observations(db: &sled::Db) -> Vec<Observation> {
        db.scan_prefix(OBSERVATION_PREFIX)
            .map(|item| decode(OBSERVATION_MAGIC, &item.unwrap().1).unwrap())
            .collect()
    }

    fn get_target(db: &sled::Db, info_hash: &str) -> Option<TargetRecord> {
        db.get(key_for_target(info_hash))
            .unwrap()
            .map(|bytes| decode(TARGET_RECORD_MAGIC, &bytes).unwrap())
    }

    fn t0() -> Timestamp {
        Utc.with_ymd_and_hms(2025, 10, 1, 8, 0, 0).unwrap()
    }

    #[test]
    fn history_keeps_first_seen_across_observations() {
        let db = temp_db();
        record_observation(&db, &observation("198.51.100.7", t0(), t0())).unwrap();
        let later = t0() + Duration::minutes(5);
        let rec = record_observation(&db, &observation("198.51.100.7", later, later)).unwrap();
        assert_eq!(rec.first_seen_unix_ms, t0().timestamp_millis());
        assert_eq!(rec.last_seen_unix_ms, later.timestamp_millis());
        assert_eq!(rec.observations, 2);

        let history = load_history(&db).unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(
            history[0].0,
            PeerKey::new("198.51.100.7", 6881, "00112233445566778899aabbccddeeff00112233")
        );
        assert_eq!(history[0].1, t0());

        assert_eq!(list_observations(&db).len(), 2);
    }

    #[test]
    fn targets_register_once() {
        let db = temp_db();
        let target = TorrentTarget {
            info_hash: "aa".repeat(20),
            name: "ubuntu".into(),
            source: "ubuntu.torrent".into(),
        };
        assert!(register_target(&db, &target).unwrap());
        assert!(!register_target(&db, &target).unwrap());
        assert_eq!(get_target(&db, &target.info_hash).unwrap().name, "ubuntu");
    }
}
