use crate::error::StartupError;
use async_trait::async_trait;
use reqwest::Client;
use std::net::IpAddr;
use std::time::Duration;

#[async_trait]
pub trait PublicAddressResolver: Send + Sync {
    async fn my_address(&self) -> Result<IpAddr, StartupError>;
}

/// Asks a "what is my ip" endpoint that answers with the bare address.
pub struct HttpAddressResolver {
    client: Client,
    url: String,
}

impl HttpAddressResolver {
    pub fn new(url: &str, timeout: Duration) -> Result<Self, StartupError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| StartupError::PublicAddress(e.to_string()))?;
        Ok(Self {
            client,
            url: url.to_string(),
        })
    }
}

pub fn parse_address_body(body: &str) -> Result<IpAddr, StartupError> {
    let text = crate::model::normalize_addr(body);
    text.parse()
        .map_err(|_| StartupError::PublicAddress(format!("unexpected response body {text:?}")))
}

#[async_trait]
impl PublicAddressResolver for HttpAddressResolver {
    async fn my_address(&self) -> Result<IpAddr, StartupError> {
        let resp = self
            .client
            .get(&self.url)
            // ifconfig.me answers browser-like agents with HTML.
            .header(reqwest::header::USER_AGENT, "curl/8")
            .send()
            .await
            .map_err(|e| StartupError::PublicAddress(e.to_string()))?;
        let status = resp.status();
        if !status.is_success() {
            return Err(StartupError::PublicAddress(format!("status code {status}")));
        }
        let body = resp
            .text()
            .await
            .map_err(|e| StartupError::PublicAddress(e.to_string()))?;
        parse_address_body(&body)
    }
}
