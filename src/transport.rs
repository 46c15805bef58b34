//! The 1:1 message transport seam.
//!
//! The scheduler only depends on [`MessageTransport`]; production wires in
//! [`HttpTransport`], tests substitute a recording fake.

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use reqwest::{Client, StatusCode, Url};
use serde::Deserialize;
use serde_json::{json, Value};
use std::fmt;
use tracing::warn;

use crate::config::Config;

#[async_trait]
pub trait MessageTransport: Send + Sync {
    /// Deliver one rendered message from `sender_id` to `recipient_id`.
    /// Returns the id of the stored message on success.
    async fn send_message(&self, content: &str, recipient_id: i64, sender_id: i64) -> Result<i64>;
}

/// HTTP client for the host application's messaging service.
#[derive(Clone)]
pub struct HttpTransport {
    http: Client,
    base_url: Url,
    token: String,
}

impl fmt::Debug for HttpTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpTransport")
            .field("base_url", &self.base_url)
            .finish_non_exhaustive()
    }
}

#[derive(Deserialize)]
struct SendMessageResponse {
    id: i64,
}

impl HttpTransport {
    pub fn new(base_url: &str, token: String) -> Result<Self> {
        let base_url = Url::parse(base_url).context("invalid messaging base URL")?;
        let http = Client::builder()
            .user_agent("bulk-courier/0.1")
            .no_proxy()
            .build()
            .context("failed to build HTTP client")?;
        Ok(Self {
            http,
            base_url,
            token,
        })
    }

    pub fn from_config(cfg: &Config) -> Result<Self> {
        Self::new(&cfg.messaging.base_url, cfg.messaging.token.clone())
    }

    pub fn build_request(&self, body: &Value) -> Result<reqwest::Request> {
        let endpoint = self
            .base_url
            .join("messages")
            .context("invalid messaging base URL")?;
        self.http
            .post(endpoint)
            .header("Authorization", format!("Bearer {}", self.token))
            .header("Content-Type", "application/json")
            .json(body)
            .build()
            .context("failed to build messaging request")
    }
}

#[async_trait]
impl MessageTransport for HttpTransport {
    async fn send_message(&self, content: &str, recipient_id: i64, sender_id: i64) -> Result<i64> {
        let body = json!({
            "content": content,
            "recipientId": recipient_id,
            "senderId": sender_id,
        });
        let request = self.build_request(&body)?;
        let res = self
            .http
            .execute(request)
            .await
            .context("failed to reach messaging service")?;

        if res.status() == StatusCode::TOO_MANY_REQUESTS {
            let body = res.text().await.unwrap_or_default();
            warn!("rate limited by messaging service: {}", body);
            return Err(anyhow!("received 429 from messaging service: {}", body));
        }
        if !res.status().is_success() {
            let status = res.status();
            let body = res.text().await.unwrap_or_default();
            return Err(anyhow!("messaging service error {}: {}", status, body));
        }

        let payload: SendMessageResponse = res
            .json()
            .await
            .context("invalid messaging service response JSON")?;
        Ok(payload.id)
    }
}
