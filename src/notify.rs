use crate::model::{Observation, format_utc};
use anyhow::Context;
use async_trait::async_trait;
use reqwest::Client;
use std::time::Duration;

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn send(&self, message: &str) -> anyhow::Result<()>;
}

/// HTML alert body for a peer matching the country filter.
pub fn format_alert(obs: &Observation) -> String {
    let mut msg = format!(
        "✔️ A connected peer has been detected from <code>{}</code>:\n",
        escape_html(&obs.country)
    );
    let rows = [
        ("IP", obs.ip.clone()),
        ("Port", obs.port.to_string()),
        ("ISP", obs.isp.clone()),
        ("City", obs.city.clone()),
        ("Region", obs.province.clone()),
        ("Client", obs.client.clone()),
        ("Torrent", obs.name.clone()),
        ("Infohash", obs.infohash.clone()),
        ("First seen", format_utc(&obs.first_seen)),
    ];
    for (label, value) in rows {
        msg.push_str(&format!("{label}: <code>{}</code>\n", escape_html(&value)));
    }
    msg.push_str("🔚\n");
    msg
}

fn escape_html(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
}

/// Telegram Bot API `sendMessage`.
pub struct TelegramNotifier {
    client: Client,
    endpoint: String,
    chat_id: String,
}

impl TelegramNotifier {
    pub fn new(token: &str, chat_id: &str, timeout: Duration) -> anyhow::Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .context("build telegram http client")?;
        Ok(Self {
            client,
            endpoint: format!("https://api.telegram.org/bot{token}/sendMessage"),
            chat_id: chat_id.to_string(),
        })
    }
}

#[async_trait]
impl Notifier for TelegramNotifier {
    async fn send(&self, message: &str) -> anyhow::Result<()> {
        let body = serde_json::json!({
            "chat_id": self.chat_id,
            "text": message,
            "parse_mode": "HTML",
        });
        let resp = self
            .client
            .post(&self.endpoint)
            .json(&body)
            .send()
            .await
            .context("telegram request")?;
        let status = resp.status();
        if !status.is_success() {
            let detail = resp.text().await.unwrap_or_default();
            anyhow::bail!("telegram returned {status}: {detail}");
        }
        tracing::info!("notify: sent via telegram");
        Ok(())
    }
}

/// Writes alerts to the log instead of delivering them.
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn send(&self, message: &str) -> anyhow::Result<()> {
        tracing::info!(body = message, "notify: alert (log only)");
        Ok(())
    }
}
