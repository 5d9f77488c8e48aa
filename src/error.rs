//! Error taxonomy for the resilient AMQP client.
//!
//! Distinct kinds, not string prefixes, so callers can `match` on recovery
//! policy instead of parsing messages.

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// Publish attempted while the connection is absent or mid-handshake.
    #[error("not ready for publish: connection absent or mid-handshake")]
    NotReady,

    /// `confirm=true` was requested but the broker lacks publisher confirms.
    #[error("broker does not support publisher confirms")]
    ConfirmsUnsupported,

    /// `basic.nack` was received for a confirmed publish.
    #[error("broker nacked the publish")]
    BrokerNack,

    /// Channel forcibly closed by the broker.
    #[error("channel closed: code={code} text={text}")]
    ChannelClosed { code: u16, text: String },

    /// The underlying connection was lost.
    #[error("connection lost")]
    ConnectionDone,

    /// Local cancellation signal for a consume loop (never user-visible).
    #[error("consumer queue unconsumed (local cancel)")]
    QueueUnconsumed,

    /// Decode/encode failed for a content-type.
    #[error("serialization error: {0}")]
    SerializationError(String),

    /// Content-type not present in the serialization registry.
    #[error("unknown content type: {0}")]
    UnknownContentType(String),

    /// Broker rejected a declare/bind during schema replay.
    #[error("schema declaration error: {0}")]
    SchemaDeclarationError(String),

    /// Authentication failure during connect — terminal, never retried.
    #[error("authentication failed: {0}")]
    AuthenticationFailed(String),

    /// Any other underlying transport error.
    #[error("amqp transport error: {0}")]
    Amqp(#[from] lapin::Error),
}

impl Error {
    /// Whether a `ReconnectingFactory` should keep retrying after this error,
    /// per spec.md §4.4's retryable error set. `AuthenticationFailed` is the
    /// one terminal case; everything reachable from a dropped/refused
    /// connection is retried.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, Error::AuthenticationFailed(_))
    }
}
