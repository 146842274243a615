use crate::error::CycleError;
use crate::geo::GeoEnricher;
use crate::ledger::{NotificationEntry, NotificationLedger};
use crate::model::{
    Observation, PeerKey, PeerState, RawPeer, SwarmSnapshot, Timestamp, TorrentTarget,
    normalize_addr,
};
use crate::notify::{Notifier, format_alert};
use crate::observe::{Enrichment, build_observation, is_self};
use crate::restart::AutoRestart;
use crate::seen::SeenRegistry;
use crate::session::SwarmSession;
use crate::sink::Sink;
use chrono::{SubsecRound, Utc};
use std::net::IpAddr;
use std::time::Duration;
use tokio::sync::watch;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Idle,
    ReadingSnapshot,
    PerPeerProcessing,
    SinkWrite,
    NotifyDecision,
    Sleeping,
    ShuttingDown,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CycleStats {
    pub torrents: usize,
    pub unavailable: usize,
    pub peers: usize,
    pub written: usize,
    pub notified: usize,
}

/// The polling loop. Owns the seen registry and the notification ledger;
/// collaborators are handed in and only borrowed per call.
pub struct Monitor {
    session: Box<dyn SwarmSession>,
    geo: GeoEnricher,
    notifier: Box<dyn Notifier>,
    sinks: Vec<Box<dyn Sink>>,
    seen: SeenRegistry,
    ledger: NotificationLedger,
    targets: Vec<TorrentTarget>,
    own_addr: IpAddr,
    country: Option<String>,
    interval: Duration,
    restart: Option<AutoRestart>,
    phase: Phase,
}

impl Monitor {
    pub fn new(
        session: Box<dyn SwarmSession>,
        geo: GeoEnricher,
        notifier: Box<dyn Notifier>,
        ledger: NotificationLedger,
        targets: Vec<TorrentTarget>,
        own_addr: IpAddr,
    ) -> Self {
        Self {
            session,
            geo,
            notifier,
            sinks: Vec::new(),
            seen: SeenRegistry::new(),
            ledger,
            targets,
            own_addr,
            country: None,
            interval: Duration::from_secs(30),
            restart: None,
            phase: Phase::Idle,
        }
    }

    pub fn with_sink(mut self, sink: Box<dyn Sink>) -> Self {
        self.sinks.push(sink);
        self
    }

    pub fn with_history<I>(mut self, history: I) -> Self
    where
        I: IntoIterator<Item = (PeerKey, Timestamp)>,
    {
        self.seen.seed(history);
        self
    }

    pub fn with_country_filter(mut self, country: Option<String>) -> Self {
        self.country = country;
        self
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn with_auto_restart(mut self, restart: AutoRestart) -> Self {
        self.restart = Some(restart);
        self
    }

    #[cfg(test)]
    fn seen(&self) -> &SeenRegistry {
        &self.seen
    }

    fn enter(&mut self, next: Phase) {
        if self.phase != next {
            tracing::trace!(from = ?self.phase, to = ?next, "monitor: phase");
            self.phase = next;
        }
    }

    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) -> anyhow::Result<()> {
        tracing::info!(
            torrents = self.targets.len(),
            interval_secs = self.interval.as_secs(),
            "monitor: starting"
        );

        loop {
            if *shutdown.borrow() {
                break;
            }

            let stats = self.run_cycle(Utc::now().trunc_subsecs(0)).await;
            tracing::debug!(
                torrents = stats.torrents,
                unavailable = stats.unavailable,
                peers = stats.peers,
                written = stats.written,
                notified = stats.notified,
                "monitor: cycle done"
            );

            self.enter(Phase::Sleeping);
            tokio::select! {
                _ = tokio::time::sleep(self.interval) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        self.shutdown()
    }

    /// One pass over every target. Nothing in here aborts the pass.
    pub async fn run_cycle(&mut self, now: Timestamp) -> CycleStats {
        let mut stats = CycleStats::default();
        let targets = self.targets.clone();

        for target in &targets {
            self.enter(Phase::ReadingSnapshot);
            let snapshot = match self.session.snapshot(target).await {
                Ok(s) => s,
                Err(source) => {
                    stats.unavailable += 1;
                    report(CycleError::SnapshotUnavailable {
                        info_hash: target.info_hash.clone(),
                        source,
                    });
                    continue;
                }
            };
            stats.torrents += 1;

            tracing::debug!(
                name = %target.name,
                progress = %format!("{:.2}%", snapshot.status.progress * 100.0),
                peers = snapshot.peers.len(),
                "monitor: processing torrent"
            );

            for peer in &snapshot.peers {
                self.process_peer(target, &snapshot, peer, now, &mut stats)
                    .await;
            }

            if let Some(restart) = self.restart.as_mut() {
                restart
                    .check(self.session.as_ref(), target, &snapshot.status)
                    .await;
            }
        }

        stats
    }

    async fn process_peer(
        &mut self,
        target: &TorrentTarget,
        snapshot: &SwarmSnapshot,
        peer: &RawPeer,
        now: Timestamp,
        stats: &mut CycleStats,
    ) {
        self.enter(Phase::PerPeerProcessing);
        let addr = normalize_addr(&peer.address);
        if is_self(addr, self.own_addr) {
            return;
        }
        stats.peers += 1;

        let key = PeerKey::new(addr, peer.port, &target.info_hash);
        let enrichment = Enrichment {
            location: self.geo.locate(addr),
            operator: self.geo.operator(addr),
        };
        let obs = build_observation(
            target,
            snapshot,
            peer,
            self.seen.lookup(&key),
            enrichment,
            now,
        );
        self.seen.touch(key, now);

        let matched = self.country.as_deref().map(|c| country_matches(&obs, c));

        if matched != Some(false) {
            self.enter(Phase::SinkWrite);
            let mut ok = true;
            for sink in &mut self.sinks {
                if let Err(source) = sink.write(&obs) {
                    ok = false;
                    report(CycleError::SinkWriteFailed {
                        sink: sink.name(),
                        peer: obs.key().to_string(),
                        source,
                    });
                }
            }
            if ok {
                stats.written += 1;
            }
            log_observation(&obs);
        }

        if matched == Some(true) {
            self.enter(Phase::NotifyDecision);
            match self.notify(&obs).await {
                Ok(true) => stats.notified += 1,
                Ok(false) => {}
                Err(err) => report(err),
            }
        }
    }

    /// Sends the alert unless the ledger already holds it. The ledger is only
    /// updated after a successful send.
    async fn notify(&mut self, obs: &Observation) -> Result<bool, CycleError> {
        let entry = NotificationEntry::from(obs);
        if self.ledger.has(&entry) {
            return Ok(false);
        }

        self.notifier
            .send(&format_alert(obs))
            .await
            .map_err(|source| CycleError::NotifierFailed {
                peer: obs.key().to_string(),
                source,
            })?;

        if let Err(err) = self.ledger.record(entry) {
            tracing::error!(err = %format!("{err:#}"), peer = %obs.key(), "ledger: append failed after alert was sent");
        }
        Ok(true)
    }

    fn shutdown(mut self) -> anyhow::Result<()> {
        self.enter(Phase::ShuttingDown);
        tracing::info!("monitor: cleaning up");
        for sink in &mut self.sinks {
            if let Err(err) = sink.flush() {
                tracing::warn!(sink = sink.name(), err = %format!("{err:#}"), "monitor: sink flush failed");
            }
        }
        self.ledger.flush()?;
        if let Some(restart) = &self.restart {
            tracing::info!(restarts = restart.restarts(), "monitor: auto-restart summary");
        }
        tracing::info!(peers_seen = self.seen.len(), notified = self.ledger.len(), "monitor: stopped");
        Ok(())
    }
}

fn country_matches(obs: &Observation, filter: &str) -> bool {
    let filter = filter.trim();
    obs.country.eq_ignore_ascii_case(filter) || obs.country_iso.eq_ignore_ascii_case(filter)
}

fn report(err: CycleError) {
    let err = anyhow::Error::new(err);
    tracing::warn!("monitor: {err:#}");
}

fn log_observation(obs: &Observation) {
    match obs.state {
        PeerState::Completed => tracing::info!(
            ip = %obs.ip,
            torrent = %obs.name,
            province = %obs.province,
            "monitor: peer completed torrent"
        ),
        state => tracing::info!(
            ip = %obs.ip,
            torrent = %obs.name,
            province = %obs.province,
            %state,
            piece = obs.downloaded_pieces,
            pieces = obs.num_pieces,
            download_speed = obs.download_speed,
            eta = %obs.estimated_time,
            "monitor: new data for peer"
        ),
    }
}
