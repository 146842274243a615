mod config;
mod error;
mod geo;
mod ledger;
mod model;
mod monitor;
mod notify;
mod observe;
mod public_ip;
mod restart;
mod seen;
mod session;
mod sink;
mod storage;

use crate::error::StartupError;
use crate::geo::{GeoEnricher, MaxMindAsn, MaxMindCity};
use crate::ledger::NotificationLedger;
use crate::monitor::Monitor;
use crate::notify::{LogNotifier, Notifier, TelegramNotifier};
use crate::public_ip::{HttpAddressResolver, PublicAddressResolver};
use crate::restart::{AutoRestart, RestartPolicy};
use crate::session::{SpoolSession, SwarmSession};
use crate::sink::{CsvSink, StoreSink};
use anyhow::Context;
use std::time::Duration;
use tokio::sync::watch;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = config::Config::load()?;

    let default_filter = if config.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_filter.into()),
        )
        .init();

    std::fs::create_dir_all(&config.data_dir).context("create data dir")?;

    if !config.spool_dir.is_dir() {
        return Err(StartupError::MissingTargetDir(config.spool_dir.clone()).into());
    }
    let session = SpoolSession::new(&config.spool_dir);
    let targets = session
        .list_targets()
        .await
        .map_err(|err| {
            tracing::error!(err = %format!("{err:#}"), "session: cannot list targets");
            StartupError::MissingTargetDir(config.spool_dir.clone())
        })?;
    if targets.is_empty() {
        return Err(StartupError::NoTargets(config.spool_dir.clone()).into());
    }
    tracing::info!(torrents = targets.len(), "starting to track torrents");

    let geo = GeoEnricher::new(
        Box::new(MaxMindCity::open(&config.city_db)?),
        Box::new(MaxMindAsn::open(&config.asn_db)?),
    );

    let resolver = HttpAddressResolver::new(&config.public_ip_url, config.http_timeout)?;
    let own_addr = resolver.my_address().await?;
    tracing::info!(%own_addr, "working with public address; it will not be recorded");

    let ledger = NotificationLedger::open(config.ledger_path(), config.ledger_repair)?;

    let notifier: Box<dyn Notifier> = match (&config.telegram_token, &config.telegram_chat) {
        (Some(token), Some(chat)) => {
            Box::new(TelegramNotifier::new(token, chat, config.http_timeout)?)
        }
        _ => {
            tracing::info!("telegram not configured; alerts will only be logged");
            Box::new(LogNotifier)
        }
    };

    let mut monitor = Monitor::new(
        Box::new(session),
        geo,
        notifier,
        ledger,
        targets.clone(),
        own_addr,
    )
    .with_country_filter(config.country.clone())
    .with_interval(config.interval);

    if let Some(csv_path) = config.csv_path() {
        let db = sled::open(config.data_dir.join("sled")).context("open sled db")?;
        for target in &targets {
            match storage::register_target(&db, target) {
                Ok(true) => tracing::info!(info_hash = %target.info_hash, name = %target.name, "registered target"),
                Ok(false) => {}
                Err(err) => tracing::warn!(%err, info_hash = %target.info_hash, "failed to register target"),
            }
        }

        let history = storage::load_history(&db).context("load peer history")?;
        tracing::info!(peers = history.len(), "seeded first-seen history from store");

        monitor = monitor
            .with_history(history)
            .with_sink(Box::new(CsvSink::open(&csv_path)?))
            .with_sink(Box::new(StoreSink::new(db)));
    }

    if config.autorestart {
        monitor = monitor.with_auto_restart(AutoRestart::new(RestartPolicy {
            threshold: config.autorestart_threshold,
            min_speed: config.autorestart_min_speed,
            downloads_dir: config.downloads_dir.clone(),
            settle: Duration::from_secs(2),
        }));
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let duration = config.duration;
    tokio::spawn(async move {
        wait_for_shutdown(duration).await;
        let _ = shutdown_tx.send(true);
    });

    monitor.run(shutdown_rx).await
}

async fn wait_for_shutdown(duration: Option<Duration>) {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            tracing::warn!(%err, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };
    let deadline = async {
        match duration {
            Some(d) => tokio::time::sleep(d).await,
            None => std::future::pending::<()>().await,
        }
    };

    tokio::select! {
        _ = ctrl_c => tracing::info!("shutdown requested"),
        _ = deadline => tracing::info!("run duration reached, stopping"),
    }
}
