use crate::model::{PeerKey, SeenRecord, Timestamp};
use std::collections::HashMap;

/// First-seen / last-seen timing per peer key, for the lifetime of the process.
#[derive(Debug, Default)]
pub struct SeenRegistry {
    records: HashMap<PeerKey, SeenRecord>,
}

impl SeenRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Loads persisted history. When a key appears more than once the
    /// earliest first-seen wins. Keys already in the registry keep their
    /// record untouched.
    pub fn seed<I>(&mut self, history: I)
    where
        I: IntoIterator<Item = (PeerKey, Timestamp)>,
    {
        let mut earliest: HashMap<PeerKey, Timestamp> = HashMap::new();
        for (key, first_seen) in history {
            earliest
                .entry(key)
                .and_modify(|t| *t = (*t).min(first_seen))
                .or_insert(first_seen);
        }
        for (key, first_seen) in earliest {
            self.records.entry(key).or_insert(SeenRecord {
                first_seen,
                last_seen: first_seen,
            });
        }
    }

    pub fn lookup(&self, key: &PeerKey) -> Option<&SeenRecord> {
        self.records.get(key)
    }

    /// Records an observation at `now`. `first_seen` is never moved once set;
    /// `last_seen` never drops below it.
    pub fn touch(&mut self, key: PeerKey, now: Timestamp) -> SeenRecord {
        let record = self
            .records
            .entry(key)
            .and_modify(|r| r.last_seen = now.max(r.first_seen))
            .or_insert(SeenRecord {
                first_seen: now,
                last_seen: now,
            });
        *record
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }
}
