use crate::model::{TorrentStatus, TorrentTarget};
use crate::session::SwarmSession;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct RestartPolicy {
    /// Local progress fraction at which the download is thrown away.
    pub threshold: f64,
    /// Bytes/s above which the torrent counts as actively downloading.
    pub min_speed: u64,
    pub downloads_dir: PathBuf,
    /// Wait between pause and wipe, and between wipe and resume.
    pub settle: Duration,
}

/// Keeps torrents downloading forever so their swarms stay observable: once
/// local progress passes the threshold the payload is wiped and the torrent
/// restarted from zero.
pub struct AutoRestart {
    policy: RestartPolicy,
    last_download_size: u64,
    restarts: u64,
}

impl AutoRestart {
    pub fn new(policy: RestartPolicy) -> Self {
        Self {
            policy,
            last_download_size: 0,
            restarts: 0,
        }
    }

    pub fn restarts(&self) -> u64 {
        self.restarts
    }

    fn should_restart(&self, status: &TorrentStatus, current_size: u64) -> bool {
        let active =
            status.download_rate > self.policy.min_speed || current_size > self.last_download_size;
        status.progress >= self.policy.threshold && active
    }

    /// Returns true when the torrent was restarted.
    pub async fn check(
        &mut self,
        session: &dyn SwarmSession,
        target: &TorrentTarget,
        status: &TorrentStatus,
    ) -> bool {
        let current_size = downloads_size(&self.policy.downloads_dir).await;
        let restart = self.should_restart(status, current_size);
        self.last_download_size = current_size;
        if !restart {
            return false;
        }

        self.restarts += 1;
        tracing::info!(
            name = %target.name,
            progress = status.progress,
            restart = self.restarts,
            "restart: threshold reached, restarting download"
        );

        if let Err(err) = session.pause(target).await {
            tracing::warn!(%err, info_hash = %target.info_hash, "restart: pause failed");
        }
        tokio::time::sleep(self.policy.settle).await;

        match clear_downloads(&self.policy.downloads_dir).await {
            Ok(()) => {
                tracing::info!(dir = %self.policy.downloads_dir.display(), "restart: downloads cleared");
                self.last_download_size = 0;
                tokio::time::sleep(self.policy.settle).await;
            }
            Err(err) => tracing::warn!(%err, "restart: clearing downloads failed, resuming anyway"),
        }

        if let Err(err) = session.resume(target).await {
            tracing::warn!(%err, info_hash = %target.info_hash, "restart: resume failed");
        }
        true
    }
}

async fn downloads_size(dir: &Path) -> u64 {
    let dir = dir.to_path_buf();
    tokio::task::spawn_blocking(move || dir_size(&dir))
        .await
        .unwrap_or(0)
}

async fn clear_downloads(dir: &Path) -> anyhow::Result<()> {
    let dir = dir.to_path_buf();
    tokio::task::spawn_blocking(move || clear_dir(&dir)).await??;
    Ok(())
}

fn dir_size(dir: &Path) -> u64 {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return 0;
    };
    entries
        .flatten()
        .map(|entry| match entry.file_type() {
            Ok(t) if t.is_dir() => dir_size(&entry.path()),
            Ok(_) => entry.metadata().map(|m| m.len()).unwrap_or(0),
            Err(_) => 0,
        })
        .sum()
}

fn clear_dir(dir: &Path) -> std::io::Result<()> {
    if !dir.exists() {
        return Ok(());
    }
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        if entry.file_type()?.is_dir() {
            std::fs::remove_dir_all(entry.path())?;
        } else {
            std::fs::remove_file(entry.path())?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::SwarmSnapshot;
    use async_trait::async_trait;
    use std::sync::Mutex;
    use std::time::{SystemTime, UNIX_EPOCH};

    #[derive(Default)]
    struct RecordingSession {
        calls: Mutex<Vec<&'static str>>,
    }

    #[async_trait]
    impl SwarmSession for RecordingSession {
        async fn list_targets(&self) -> anyhow::Result<Vec<TorrentTarget>> {
            Ok(Vec::new())
        }
        async fn snapshot(&self, _: &TorrentTarget) -> anyhow::Result<SwarmSnapshot> {
            anyhow::bail!("unused")
        }
        async fn pause(&self, _: &TorrentTarget) -> anyhow::Result<()> {
            self.calls.lock().unwrap().push("pause");
            Ok(())
        }
        async fn resume(&self, _: &TorrentTarget) -> anyhow::Result<()> {
            self.calls.lock().unwrap().push("resume");
            Ok(())
        }
    }

    fn temp_downloads_dir() -> PathBuf {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_nanos();
        let dir = std::env::temp_dir().join(format!(
            "peerwatch-restart-test-{}-{}",
            std::process::id(),
            nanos
        ));
        std::fs::create_dir_all(dir.join("ubuntu")).unwrap();
        std::fs::write(dir.join("ubuntu").join("part.iso"), vec![0u8; 64]).unwrap();
        std::fs::write(dir.join("loose.bin"), vec![0u8; 16]).unwrap();
        dir
    }

    fn target() -> TorrentTarget {
        TorrentTarget {
            info_hash: "aa".repeat(20),
            name: "ubuntu".into(),
            source: "ubuntu.torrent".into(),
        }
    }

    fn policy(dir: &Path) -> RestartPolicy {
        RestartPolicy {
            threshold: 0.9,
            min_speed: 1000,
            downloads_dir: dir.to_path_buf(),
            settle: Duration::ZERO,
        }
    }

    #[tokio::test]
    async fn restarts_past_threshold_and_wipes_downloads() {
        let dir = temp_downloads_dir();
        assert_eq!(dir_size(&dir), 80);

        let session = RecordingSession::default();
        let mut restart = AutoRestart::new(policy(&dir));
        let status = TorrentStatus {
            progress: 0.95,
            download_rate: 5000,
            ..Default::default()
        };
        assert!(restart.check(&session, &target(), &status).await);
        assert_eq!(*session.calls.lock().unwrap(), vec!["pause", "resume"]);
        assert_eq!(dir_size(&dir), 0);
        assert!(dir.exists());
        assert_eq!(restart.restarts(), 1);
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[tokio::test]
    async fn below_threshold_or_idle_is_left_alone() {
        let dir = temp_downloads_dir();
        let session = RecordingSession::default();
        let mut restart = AutoRestart::new(policy(&dir));

        let early = TorrentStatus {
            progress: 0.5,
            download_rate: 5000,
            ..Default::default()
        };
        assert!(!restart.check(&session, &target(), &early).await);

        // Directory did not grow since the last check and the rate is low.
        let idle = TorrentStatus {
            progress: 0.95,
            download_rate: 10,
            ..Default::default()
        };
        assert!(!restart.check(&session, &target(), &idle).await);
        assert!(session.calls.lock().unwrap().is_empty());
        let _ = std::fs::remove_dir_all(&dir);
    }
}
