use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::StreamError;
use crate::guard;

/// Hard ceiling applied to `batch_size` during validation.
pub const MAX_BATCH_SIZE: u64 = 1000;

const DEFAULT_INITIAL_RETRY_DELAY_MS: u64 = 1000;
const DEFAULT_BACKOFF_FACTOR: f64 = 2.0;
const DEFAULT_BLOCKED_RETRY_DELAY_SEC: u64 = 30;

/// Unique identifier for a delivery stream.
///
/// This is a strongly-typed wrapper to avoid accidental mixing
/// of stream IDs with other string identifiers.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StreamId(pub String);

/// Identifier of the upstream subscription a record originated from.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SubscriptionId(pub String);

/// Policy applied when a batch exhausts its retry budget.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorHandling {
    /// Never drop events. The dispatcher retries indefinitely, halting the
    /// stream until the peer recovers.
    #[default]
    Block,

    /// Bounded retry. The batch is dropped on exhaustion and completion
    /// hooks still fire, so the upstream watermark advances past the lost
    /// events.
    Skip,
}

/// Webhook variant of the action definition.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WebhookActionSpec {
    /// Absolute http/https URL the batches are POSTed to.
    pub url: String,
}

/// Definition of one delivery stream.
///
/// A `StreamSpec` describes *where* and *how* batches of events should be
/// delivered. It is immutable after validation; validation also fills in
/// defaults and clamps `batch_size` to [`MAX_BATCH_SIZE`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamSpec {
    /// Registry-assigned identifier.
    #[serde(default)]
    pub id: StreamId,

    /// Action type. Only `webhook` is recognized; matched case-insensitively
    /// and stored lowercase after validation.
    #[serde(rename = "type", default)]
    pub kind: String,

    /// Webhook definition; required when `kind` is `webhook`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub webhook: Option<WebhookActionSpec>,

    /// Maximum events per delivered batch. 0 means 1.
    #[serde(default)]
    pub batch_size: u64,

    /// Maximum age of a non-empty batch before it is flushed. 0 means
    /// "flush as soon as the processor is idle".
    #[serde(default)]
    pub batch_timeout_ms: u64,

    /// What to do when the retry budget for a batch is spent.
    #[serde(default)]
    pub error_handling: ErrorHandling,

    /// Wall-clock budget for retrying one batch before the policy decides.
    #[serde(default)]
    pub retry_timeout_sec: u64,

    /// Sleep between delivery cycles once `block` handling has exhausted a
    /// retry budget. 0 means 30.
    #[serde(default)]
    pub blocked_retry_delay_sec: u64,

    /// First retry delay. 0 means 1000.
    #[serde(default)]
    pub initial_retry_delay_ms: u64,

    /// Multiplier applied to the retry delay after each failed attempt.
    /// 0 means 2.0.
    #[serde(default)]
    pub backoff_factor: f64,
}

impl StreamSpec {
    /// Create a webhook stream spec with default batching and retry settings.
    pub fn webhook(url: impl Into<String>) -> Self {
        Self {
            kind: "webhook".to_string(),
            webhook: Some(WebhookActionSpec { url: url.into() }),
            ..Self::default()
        }
    }

    /// Set the maximum number of events per batch.
    pub fn with_batch_size(mut self, batch_size: u64) -> Self {
        self.batch_size = batch_size;
        self
    }

    /// Set the maximum age of a partial batch before it is flushed.
    pub fn with_batch_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.batch_timeout_ms = timeout_ms;
        self
    }

    /// Choose the error handling policy.
    pub fn with_error_handling(mut self, error_handling: ErrorHandling) -> Self {
        self.error_handling = error_handling;
        self
    }

    /// Set the wall-clock retry budget per batch.
    pub fn with_retry_timeout_sec(mut self, retry_timeout_sec: u64) -> Self {
        self.retry_timeout_sec = retry_timeout_sec;
        self
    }

    /// Set the sleep between blocked delivery cycles.
    pub fn with_blocked_retry_delay_sec(mut self, delay_sec: u64) -> Self {
        self.blocked_retry_delay_sec = delay_sec;
        self
    }

    /// Override the exponential backoff parameters.
    pub fn with_retry_policy(mut self, initial_delay_ms: u64, backoff_factor: f64) -> Self {
        self.initial_retry_delay_ms = initial_delay_ms;
        self.backoff_factor = backoff_factor;
        self
    }

    /// Validate the spec and normalize it into its canonical runtime form.
    ///
    /// Checks the action definition and webhook URL, lowercases the action
    /// type, fills defaults, and clamps `batch_size`.
    pub fn validate(mut self) -> Result<Self, StreamError> {
        if self.kind.is_empty() && self.webhook.is_none() {
            return Err(StreamError::NoActionSpecified);
        }
        let kind = self.kind.to_lowercase();
        if kind != "webhook" {
            return Err(StreamError::UnknownActionType(self.kind));
        }
        self.kind = kind;

        let webhook = self.webhook.as_ref().ok_or(StreamError::MissingWebhookUrl)?;
        guard::parse_webhook_url(&webhook.url)?;

        if self.batch_size == 0 {
            self.batch_size = 1;
        }
        self.batch_size = self.batch_size.min(MAX_BATCH_SIZE);
        if self.initial_retry_delay_ms == 0 {
            self.initial_retry_delay_ms = DEFAULT_INITIAL_RETRY_DELAY_MS;
        }
        if self.backoff_factor <= 0.0 {
            self.backoff_factor = DEFAULT_BACKOFF_FACTOR;
        }
        if self.blocked_retry_delay_sec == 0 {
            self.blocked_retry_delay_sec = DEFAULT_BLOCKED_RETRY_DELAY_SEC;
        }
        Ok(self)
    }

    pub(crate) fn batch_timeout(&self) -> Duration {
        Duration::from_millis(self.batch_timeout_ms)
    }

    pub(crate) fn initial_retry_delay(&self) -> Duration {
        Duration::from_millis(self.initial_retry_delay_ms)
    }

    pub(crate) fn retry_budget(&self) -> Duration {
        Duration::from_secs(self.retry_timeout_sec)
    }

    pub(crate) fn blocked_retry_delay(&self) -> Duration {
        Duration::from_secs(self.blocked_retry_delay_sec)
    }
}

/// Callback fired exactly once per record, after the containing batch is
/// acknowledged by the webhook or definitively skipped.
///
/// Installed by the upstream feeder; this is how delivery progress reaches
/// the feeder's watermark. The hook closes over feeder state only; records
/// carry no back-pointer to their stream.
#[derive(Clone)]
pub struct CompletionHook(Arc<dyn Fn(&EventRecord) + Send + Sync>);

impl CompletionHook {
    pub fn new(hook: impl Fn(&EventRecord) + Send + Sync + 'static) -> Self {
        Self(Arc::new(hook))
    }

    pub fn call(&self, record: &EventRecord) {
        (self.0)(record)
    }
}

impl fmt::Debug for CompletionHook {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("CompletionHook")
    }
}

/// One decoded log entry, bound to the subscription that produced it.
///
/// The serialized form is the webhook wire format: a JSON object with
/// `subId`, `address`, `blockNumber`, `transactionHash`, `logIndex` and the
/// decoded `data` fields.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventRecord {
    /// Originating subscription.
    pub sub_id: SubscriptionId,

    /// Contract address that emitted the log.
    #[serde(default)]
    pub address: String,

    /// Block number, as a decimal string.
    #[serde(default)]
    pub block_number: String,

    /// Transaction hash.
    #[serde(default)]
    pub transaction_hash: String,

    /// Log index within the block, as a decimal string.
    #[serde(default)]
    pub log_index: String,

    /// Decoded event fields, name to stringified value.
    #[serde(default)]
    pub data: BTreeMap<String, String>,

    /// Completion hook installed by the feeder. Not part of the wire format.
    #[serde(skip)]
    pub completion: Option<CompletionHook>,
}

impl EventRecord {
    /// Create a record for the given subscription.
    pub fn new(sub_id: impl Into<String>) -> Self {
        Self {
            sub_id: SubscriptionId(sub_id.into()),
            ..Self::default()
        }
    }

    /// Set the positional identifiers of the originating log entry.
    pub fn with_position(
        mut self,
        block_number: impl Into<String>,
        transaction_hash: impl Into<String>,
        log_index: impl Into<String>,
    ) -> Self {
        self.block_number = block_number.into();
        self.transaction_hash = transaction_hash.into();
        self.log_index = log_index.into();
        self
    }

    /// Set the emitting contract address.
    pub fn with_address(mut self, address: impl Into<String>) -> Self {
        self.address = address.into();
        self
    }

    /// Add one decoded field.
    pub fn with_field(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.data.insert(name.into(), value.into());
        self
    }

    /// Install the completion hook.
    pub fn with_completion(mut self, hook: CompletionHook) -> Self {
        self.completion = Some(hook);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validate_rejects_empty_spec() {
        let err = StreamSpec::default().validate().unwrap_err();
        assert_eq!(err, StreamError::NoActionSpecified);
        assert_eq!(err.to_string(), "no action specified");
    }

    #[test]
    fn validate_rejects_unknown_type() {
        let spec = StreamSpec {
            kind: "random".to_string(),
            ..StreamSpec::default()
        };
        let err = spec.validate().unwrap_err();
        assert_eq!(err, StreamError::UnknownActionType("random".to_string()));
        assert_eq!(err.to_string(), "unknown action type 'random'");
    }

    #[test]
    fn validate_rejects_missing_webhook() {
        let spec = StreamSpec {
            kind: "webhook".to_string(),
            ..StreamSpec::default()
        };
        let err = spec.validate().unwrap_err();
        assert_eq!(err, StreamError::MissingWebhookUrl);
        assert_eq!(
            err.to_string(),
            "must specify webhook.url for action type 'webhook'"
        );
    }

    #[test]
    fn validate_rejects_bad_url() {
        let err = StreamSpec::webhook(":badurl").validate().unwrap_err();
        assert_eq!(err, StreamError::InvalidUrl);
        assert_eq!(err.to_string(), "invalid URL in webhook action");
    }

    #[test]
    fn validate_accepts_uppercase_type() {
        let mut spec = StreamSpec::webhook("http://example.com/hook");
        spec.kind = "WEBHOOK".to_string();
        let spec = spec.validate().unwrap();
        assert_eq!(spec.kind, "webhook");
    }

    #[test]
    fn validate_fills_defaults() {
        let spec = StreamSpec::webhook("http://example.com/hook")
            .validate()
            .unwrap();
        assert_eq!(spec.batch_size, 1);
        assert_eq!(spec.batch_timeout_ms, 0);
        assert_eq!(spec.error_handling, ErrorHandling::Block);
        assert_eq!(spec.initial_retry_delay_ms, 1000);
        assert_eq!(spec.backoff_factor, 2.0);
        assert_eq!(spec.blocked_retry_delay_sec, 30);
    }

    #[test]
    fn validate_clamps_batch_size() {
        let spec = StreamSpec::webhook("http://example.com/hook")
            .with_batch_size(10_000_000)
            .validate()
            .unwrap();
        assert_eq!(spec.batch_size, MAX_BATCH_SIZE);
    }

    #[test]
    fn record_wire_format_uses_camel_case() {
        let record = EventRecord::new("sub1")
            .with_address("0x167f57a13a9c35ff92f0649d2be0e52b4f8ac3ca")
            .with_position("150665", "0xf00d", "12")
            .with_field("i", "42");
        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["subId"], "sub1");
        assert_eq!(json["blockNumber"], "150665");
        assert_eq!(json["transactionHash"], "0xf00d");
        assert_eq!(json["logIndex"], "12");
        assert_eq!(json["data"]["i"], "42");
        assert!(json.get("completion").is_none());
    }

    #[test]
    fn spec_round_trips_through_json() {
        let raw = r#"{
            "type": "webhook",
            "webhook": {"url": "http://example.com/hook"},
            "batchSize": 50,
            "batchTimeoutMs": 250,
            "errorHandling": "skip"
        }"#;
        let spec: StreamSpec = serde_json::from_str(raw).unwrap();
        assert_eq!(spec.batch_size, 50);
        assert_eq!(spec.batch_timeout_ms, 250);
        assert_eq!(spec.error_handling, ErrorHandling::Skip);
        let spec = spec.validate().unwrap();
        let json = serde_json::to_value(&spec).unwrap();
        assert_eq!(json["type"], "webhook");
        assert_eq!(json["errorHandling"], "skip");
    }
}
