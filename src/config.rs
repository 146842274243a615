use crate::ledger::RepairMode;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Clone, Debug)]
pub struct Config {
    pub data_dir: PathBuf,
    pub spool_dir: PathBuf,
    /// Enables the CSV and store sinks, and history seeding.
    pub output: Option<PathBuf>,

    // Enrichment
    pub city_db: PathBuf,
    pub asn_db: PathBuf,

    // Polling
    pub country: Option<String>,
    pub interval: Duration,
    pub duration: Option<Duration>,

    // Collaborators
    pub public_ip_url: String,
    pub http_timeout: Duration,
    pub telegram_token: Option<String>,
    pub telegram_chat: Option<String>,

    // Ledger
    pub ledger_repair: RepairMode,

    // Auto-restart
    pub autorestart: bool,
    pub autorestart_threshold: f64,
    pub autorestart_min_speed: u64,
    pub downloads_dir: PathBuf,

    pub verbose: bool,
}

impl Config {
    pub fn load() -> anyhow::Result<Self> {
        // If a .env file exists, load it. If not, keep going.
        // Precedence: process env > .env > code defaults.
        let _ = dotenvy::dotenv();
        Self::from_env()
    }

    fn from_env() -> anyhow::Result<Self> {
        let data_dir = env_pathbuf("PEERWATCH_DATA_DIR", "data");
        let spool_dir = env_pathbuf("PEERWATCH_SPOOL_DIR", "spool");
        let output = env_opt_string("PEERWATCH_OUTPUT").map(PathBuf::from);

        let city_db = env_pathbuf("PEERWATCH_CITY_DB", "dbs/GeoLite2-City.mmdb");
        let asn_db = env_pathbuf("PEERWATCH_ASN_DB", "dbs/GeoLite2-ASN.mmdb");

        let country = env_opt_string("PEERWATCH_COUNTRY");
        let interval = Duration::from_secs(env_u64("PEERWATCH_INTERVAL_SECS", 30));
        let duration = match env_u64("PEERWATCH_DURATION_SECS", 0) {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        };

        let public_ip_url = env_string("PEERWATCH_PUBLIC_IP_URL", "http://ifconfig.me");
        let http_timeout = Duration::from_secs(env_u64("PEERWATCH_HTTP_TIMEOUT_SECS", 10).max(1));
        let telegram_token = env_opt_string("PEERWATCH_TELEGRAM_TOKEN");
        let telegram_chat = env_opt_string("PEERWATCH_TELEGRAM_CHAT");

        let ledger_repair = match env_opt_string("PEERWATCH_LEDGER_REPAIR") {
            Some(v) => v
                .parse()
                .map_err(|e| anyhow::anyhow!("parse PEERWATCH_LEDGER_REPAIR: {e}"))?,
            None => RepairMode::default(),
        };

        let autorestart = env_enabled("PEERWATCH_AUTORESTART", false);
        let autorestart_threshold = env_f64("PEERWATCH_AUTORESTART_THRESHOLD", 0.90);
        let autorestart_min_speed = env_u64("PEERWATCH_AUTORESTART_MIN_SPEED", 1000);
        let downloads_dir = env_pathbuf("PEERWATCH_DOWNLOADS_DIR", "Downloads");

        let verbose = env_enabled("PEERWATCH_VERBOSE", false);

        Ok(Self {
            data_dir,
            spool_dir,
            output,

            city_db,
            asn_db,

            country,
            interval,
            duration,

            public_ip_url,
            http_timeout,
            telegram_token,
            telegram_chat,

            ledger_repair,

            autorestart,
            autorestart_threshold,
            autorestart_min_speed,
            downloads_dir,

            verbose,
        })
    }

    pub fn ledger_path(&self) -> PathBuf {
        self.data_dir.join("notified_peers.txt")
    }

    pub fn csv_path(&self) -> Option<PathBuf> {
        self.output.as_ref().map(|o| {
            let mut s = o.clone().into_os_string();
            s.push(".csv");
            PathBuf::from(s)
        })
    }
}

fn env_opt_string(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

fn env_string(name: &str, default: &str) -> String {
    env_opt_string(name).unwrap_or_else(|| default.to_string())
}

fn env_pathbuf(name: &str, default: &str) -> PathBuf {
    PathBuf::from(env_string(name, default))
}

fn env_u64(name: &str, default: u64) -> u64 {
    std::env::var(name)
        .ok()
        .and_then(|v| v.trim().parse::<u64>().ok())
        .unwrap_or(default)
}

fn env_f64(name: &str, default: f64) -> f64 {
    std::env::var(name)
        .ok()
        .and_then(|v| v.trim().parse::<f64>().ok())
        .filter(|v| v.is_finite())
        .unwrap_or(default)
}

fn env_enabled(name: &str, default: bool) -> bool {
    match env_opt_string(name) {
        None => default,
        Some(v) => {
            let v = v.to_ascii_lowercase();
            if matches!(v.as_str(), "0" | "false" | "off" | "no") {
                return false;
            }
            if matches!(v.as_str(), "1" | "true" | "on" | "yes") {
                return true;
            }
            default
        }
    }
}
