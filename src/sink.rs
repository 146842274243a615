use crate::model::Observation;
use crate::storage;
use anyhow::Context;
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};

/// Destination for observation records. Append semantics.
pub trait Sink: Send {
    fn name(&self) -> &'static str;
    fn write(&mut self, obs: &Observation) -> anyhow::Result<()>;
    fn flush(&mut self) -> anyhow::Result<()>;
}

/// Tabular output. The header row is written only when the file is created.
pub struct CsvSink {
    path: PathBuf,
    writer: csv::Writer<File>,
}

impl CsvSink {
    pub fn open(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref().to_path_buf();
        let is_new = std::fs::metadata(&path).map(|m| m.len() == 0).unwrap_or(true);
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("output path {} cannot be written to", path.display()))?;
        let writer = csv::WriterBuilder::new()
            .has_headers(is_new)
            .from_writer(file);
        Ok(Self { path, writer })
    }
}

impl Sink for CsvSink {
    fn name(&self) -> &'static str {
        "csv"
    }

    fn write(&mut self, obs: &Observation) -> anyhow::Result<()> {
        self.writer
            .serialize(obs)
            .with_context(|| format!("write row to {}", self.path.display()))?;
        self.writer.flush().context("flush csv")?;
        Ok(())
    }

    fn flush(&mut self) -> anyhow::Result<()> {
        self.writer.flush().context("flush csv")
    }
}

/// Embedded store; also the source of first-seen history at startup.
pub struct StoreSink {
    db: sled::Db,
}

impl StoreSink {
    pub fn new(db: sled::Db) -> Self {
        Self { db }
    }
}

impl Sink for StoreSink {
    fn name(&self) -> &'static str {
        "store"
    }

    fn write(&mut self, obs: &Observation) -> anyhow::Result<()> {
        storage::record_observation(&self.db, obs)?;
        Ok(())
    }

    fn flush(&mut self) -> anyhow::Result<()> {
        self.db.flush().context("flush sled")?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::tests::{list_observations, observation, temp_db};
    use chrono::{TimeZone, Utc};
    use std::time::{SystemTime, UNIX_EPOCH};

    fn temp_csv_path() -> PathBuf {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_nanos();
        std::env::temp_dir().join(format!(
            "peerwatch-sink-test-{}-{}.csv",
            std::process::id(),
            nanos
        ))
    }

    #[test]
    fn csv_header_is_written_once() {
        let path = temp_csv_path();
        let ts = Utc.with_ymd_and_hms(2025, 10, 1, 8, 0, 0).unwrap();

        let mut sink = CsvSink::open(&path).unwrap();
        sink.write(&observation("198.51.100.7", ts, ts)).unwrap();
        drop(sink);

        let mut sink = CsvSink::open(&path).unwrap();
        sink.write(&observation("198.51.100.8", ts, ts)).unwrap();
        sink.flush().unwrap();

        let text = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 3);
        assert!(lines[0].starts_with("ip,port,isp,client,countryISO,country,city,region,province,first_seen"));
        assert!(lines[0].ends_with("estimated_time,state"));
        assert!(lines[1].contains("2025-10-01 08:00:00 UTC"));
        assert!(lines[2].starts_with("198.51.100.8,6881,"));
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn store_sink_appends_observations() {
        let db = temp_db();
        let ts = Utc.with_ymd_and_hms(2025, 10, 1, 8, 0, 0).unwrap();
        let mut sink = StoreSink::new(db.clone());
        sink.write(&observation("198.51.100.7", ts, ts)).unwrap();
        sink.write(&observation("198.51.100.7", ts, ts)).unwrap();
        sink.flush().unwrap();
        assert_eq!(list_observations(&db).len(), 2);
    }
}
