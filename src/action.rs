use std::time::Duration;

use async_trait::async_trait;
use url::Url;

use crate::config::GatewayConfig;
use crate::error::{AttemptError, StreamError};
use crate::guard::{self, UrlGuard};
use crate::types::{EventRecord, StreamSpec};

/// Transport timeout for one delivery attempt. Keeps a hung peer from
/// holding up shutdown indefinitely.
const HTTP_TIMEOUT: Duration = Duration::from_secs(30);

/// One kind of delivery destination.
///
/// The dispatcher only knows this seam: serialize a batch once, then send
/// the bytes per attempt. Additional action kinds (message queues, etc.)
/// implement this without touching the processor or the retry machinery.
#[async_trait]
pub trait Action: Send + Sync {
    /// Wire encoding of a batch.
    fn serialize(&self, batch: &[EventRecord]) -> Result<Vec<u8>, AttemptError>;

    /// Deliver one serialized batch. Called once per attempt.
    async fn send(&self, body: &[u8]) -> Result<(), AttemptError>;
}

/// Webhook delivery: `POST` the batch as a JSON array.
pub struct WebhookAction {
    url: Url,
    guard: UrlGuard,
    client: reqwest::Client,
}

impl WebhookAction {
    /// Build the action from a validated spec. The HTTP client and its
    /// connection pool are shared across all attempts of the stream.
    pub fn from_spec(spec: &StreamSpec, config: &GatewayConfig) -> Result<Self, StreamError> {
        let webhook = spec.webhook.as_ref().ok_or(StreamError::MissingWebhookUrl)?;
        let url = guard::parse_webhook_url(&webhook.url)?;
        let client = reqwest::Client::builder()
            .timeout(HTTP_TIMEOUT)
            .build()
            .map_err(|err| StreamError::HttpClient(err.to_string()))?;
        Ok(Self {
            url,
            guard: UrlGuard::new(config.allow_private_ips),
            client,
        })
    }

    pub fn url(&self) -> &Url {
        &self.url
    }
}

#[async_trait]
impl Action for WebhookAction {
    fn serialize(&self, batch: &[EventRecord]) -> Result<Vec<u8>, AttemptError> {
        serde_json::to_vec(batch).map_err(|err| AttemptError::Serialize(err.to_string()))
    }

    async fn send(&self, body: &[u8]) -> Result<(), AttemptError> {
        // The guard re-runs per attempt: DNS answers change.
        self.guard.check(&self.url).await?;

        let response = self
            .client
            .post(self.url.as_str())
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .body(body.to_vec())
            .send()
            .await;

        match response {
            Ok(resp) => {
                let status = resp.status();
                // Read and discard the body so the connection can be reused.
                let _ = resp.bytes().await;
                if status.is_success() {
                    Ok(())
                } else {
                    Err(AttemptError::Status(status.as_u16()))
                }
            }
            Err(err) => Err(AttemptError::Transport(err.to_string())),
        }
    }
}
