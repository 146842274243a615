use crate::model::{Observation, format_utc};
use anyhow::Context;
use std::collections::HashSet;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::str::FromStr;

/// Legacy marker for an entry whose first-seen was never filled in.
pub const MISSING_SENTINEL: &str = "None";

/// "Alert already sent for this peer's first appearance."
///
/// On disk: `address,port,client,info_hash,first_seen`, one per line. The
/// client is the only free-text field, so parsing anchors the two leading and
/// two trailing fields and gives the client whatever remains. Backslash, CR
/// and LF in the client are escaped to keep each entry on one line.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct NotificationEntry {
    pub address: String,
    pub port: u16,
    pub client: String,
    pub info_hash: String,
    pub first_seen: String,
}

impl NotificationEntry {
    pub fn is_malformed(&self) -> bool {
        self.first_seen == MISSING_SENTINEL
    }

    pub fn to_line(&self) -> String {
        format!(
            "{},{},{},{},{}",
            self.address,
            self.port,
            escape_client(&self.client),
            self.info_hash,
            self.first_seen
        )
    }

    pub fn parse_line(line: &str) -> Option<Self> {
        let line = line.trim_end_matches(['\r', '\n']);
        let (address, rest) = line.split_once(',')?;
        let (port, rest) = rest.split_once(',')?;
        let (rest, first_seen) = rest.rsplit_once(',')?;
        let (client, info_hash) = rest.rsplit_once(',')?;
        Some(Self {
            address: address.to_string(),
            port: port.trim().parse().ok()?,
            client: unescape_client(client),
            info_hash: info_hash.to_string(),
            first_seen: first_seen.to_string(),
        })
    }
}

fn escape_client(client: &str) -> String {
    let mut out = String::with_capacity(client.len());
    for c in client.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            c => out.push(c),
        }
    }
    out
}

fn unescape_client(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut chars = raw.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('n') => out.push('\n'),
            Some('r') => out.push('\r'),
            Some(other) => out.push(other),
            None => out.push('\\'),
        }
    }
    out
}

impl From<&Observation> for NotificationEntry {
    fn from(obs: &Observation) -> Self {
        Self {
            address: obs.ip.clone(),
            port: obs.port,
            client: obs.client.clone(),
            info_hash: obs.infohash.clone(),
            first_seen: format_utc(&obs.first_seen),
        }
    }
}

/// Which malformed entries the startup pass repairs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RepairMode {
    /// Only the last malformed entry in the log; earlier ones stay active.
    #[default]
    Last,
    All,
}

impl FromStr for RepairMode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "last" => Ok(Self::Last),
            "all" => Ok(Self::All),
            other => anyhow::bail!("unknown ledger repair mode: {other}"),
        }
    }
}

/// Distinct malformed entries to repair, ordered by their last occurrence.
fn select_repairs(entries: &[NotificationEntry], mode: RepairMode) -> Vec<NotificationEntry> {
    let mut picked: Vec<NotificationEntry> = Vec::new();
    for entry in entries.iter().rev().filter(|e| e.is_malformed()) {
        if !picked.contains(entry) {
            picked.push(entry.clone());
        }
        if mode == RepairMode::Last {
            break;
        }
    }
    picked.reverse();
    picked
}

/// Append-only log of delivered alerts with an in-memory index rebuilt at open.
pub struct NotificationLedger {
    path: PathBuf,
    file: File,
    active: HashSet<NotificationEntry>,
}

impl NotificationLedger {
    pub fn open(path: impl AsRef<Path>, mode: RepairMode) -> anyhow::Result<Self> {
        let path = path.as_ref().to_path_buf();

        let text = match std::fs::read_to_string(&path) {
            Ok(text) => text,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                tracing::info!(path = %path.display(), "ledger: no existing log, starting empty");
                String::new()
            }
            Err(err) => {
                return Err(err).with_context(|| format!("read ledger {}", path.display()));
            }
        };

        let mut entries = Vec::new();
        for line in text.lines().filter(|l| !l.trim().is_empty()) {
            match NotificationEntry::parse_line(line) {
                Some(entry) => entries.push(entry),
                None => tracing::warn!(line, "ledger: skipping unparsable line"),
            }
        }

        let repair = select_repairs(&entries, mode);
        let active: HashSet<NotificationEntry> = entries
            .iter()
            .filter(|e| !repair.contains(e))
            .cloned()
            .collect();

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("open ledger {}", path.display()))?;

        // Already at the tail when a previous open re-appended them.
        if !repair.is_empty() && !entries.ends_with(&repair) {
            for entry in &repair {
                let line = entry.to_line();
                writeln!(file, "{line}").context("append repaired ledger entry")?;
                tracing::info!(entry = %line, "ledger: re-appended malformed entry");
            }
            file.sync_data().context("sync ledger")?;
        }

        tracing::info!(path = %path.display(), active = active.len(), repaired = repair.len(), "ledger: loaded");

        Ok(Self { path, file, active })
    }

    /// Checks the in-memory index, then the log itself.
    pub fn has(&self, entry: &NotificationEntry) -> bool {
        if self.active.contains(entry) {
            return true;
        }
        let line = entry.to_line();
        match std::fs::read_to_string(&self.path) {
            Ok(text) => text.lines().any(|l| l.trim_end_matches('\r') == line),
            Err(err) => {
                tracing::warn!(%err, path = %self.path.display(), "ledger: re-read failed, using in-memory index");
                false
            }
        }
    }

    pub fn record(&mut self, entry: NotificationEntry) -> anyhow::Result<()> {
        let line = format!("{}\n", entry.to_line());
        self.file
            .write_all(line.as_bytes())
            .context("append ledger entry")?;
        self.file.sync_data().context("sync ledger")?;
        self.active.insert(entry);
        Ok(())
    }

    pub fn flush(&mut self) -> anyhow::Result<()> {
        self.file.flush().context("flush ledger")?;
        self.file.sync_all().context("sync ledger")
    }

    pub fn len(&self) -> usize {
        self.active.len()
    }
}
