use std::fmt;
use std::net::IpAddr;

use crate::types::StreamId;

/// Errors surfaced to the creator of a stream, before any delivery begins.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamError {
    /// Spec carried no action definition at all.
    NoActionSpecified,

    /// Action type is not one the engine recognizes.
    UnknownActionType(String),

    /// Action type was `webhook` but no webhook object was given.
    MissingWebhookUrl,

    /// Webhook URL failed to parse, had a non-HTTP scheme, or an empty host.
    InvalidUrl,

    /// Underlying HTTP client could not be constructed.
    HttpClient(String),

    /// Registry lookup failed.
    StreamNotFound(StreamId),

    /// Stream (or registry) has been stopped.
    Shutdown,

    /// Persistence through the KV collaborator failed.
    Store(StoreError),
}

impl fmt::Display for StreamError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StreamError::NoActionSpecified =>
                write!(f, "no action specified"),
            StreamError::UnknownActionType(kind) =>
                write!(f, "unknown action type '{}'", kind),
            StreamError::MissingWebhookUrl =>
                write!(f, "must specify webhook.url for action type 'webhook'"),
            StreamError::InvalidUrl =>
                write!(f, "invalid URL in webhook action"),
            StreamError::HttpClient(msg) =>
                write!(f, "failed to build HTTP client: {}", msg),
            StreamError::StreamNotFound(id) =>
                write!(f, "stream not found: {}", id.0),
            StreamError::Shutdown =>
                write!(f, "stream is shut down"),
            StreamError::Store(err) =>
                write!(f, "store error: {}", err),
        }
    }
}

impl std::error::Error for StreamError {}

impl From<StoreError> for StreamError {
    fn from(err: StoreError) -> Self {
        StreamError::Store(err)
    }
}

/// Pre-dispatch URL safety rejections.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GuardError {
    /// Host did not resolve to any address.
    Unresolvable(String),

    /// Host resolved to an address the guard refuses to contact.
    BlockedAddress(IpAddr),
}

impl fmt::Display for GuardError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GuardError::Unresolvable(host) =>
                write!(f, "DNS resolution failed for '{}'", host),
            GuardError::BlockedAddress(ip) =>
                write!(f, "webhook address {} is blocked", ip),
        }
    }
}

impl std::error::Error for GuardError {}

/// A single failed delivery attempt. Feeds the retry policy; never
/// surfaced directly to the stream creator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttemptError {
    /// URL guard refused the attempt.
    Guard(GuardError),

    /// Connect/timeout/transport-level failure.
    Transport(String),

    /// Peer answered with a non-2xx status.
    Status(u16),

    /// Batch could not be serialized for the wire.
    Serialize(String),
}

impl fmt::Display for AttemptError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AttemptError::Guard(err) =>
                write!(f, "{}", err),
            AttemptError::Transport(msg) =>
                write!(f, "transport failure: {}", msg),
            AttemptError::Status(code) =>
                write!(f, "webhook returned status {}", code),
            AttemptError::Serialize(msg) =>
                write!(f, "failed to serialize batch: {}", msg),
        }
    }
}

impl std::error::Error for AttemptError {}

impl From<GuardError> for AttemptError {
    fn from(err: GuardError) -> Self {
        AttemptError::Guard(err)
    }
}

/// Failures from the key-value collaborator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// Backend rejected or failed the operation.
    Backend(String),

    /// Stored bytes did not decode as the expected record.
    Codec(String),
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StoreError::Backend(msg) => write!(f, "backend failure: {}", msg),
            StoreError::Codec(msg) => write!(f, "codec failure: {}", msg),
        }
    }
}

impl std::error::Error for StoreError {}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        StoreError::Codec(err.to_string())
    }
}
