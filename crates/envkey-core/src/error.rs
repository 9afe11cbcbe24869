//! Error types for the fetch pipeline.

use thiserror::Error;

/// Result type alias using the core Error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced by the fetch pipeline.
///
/// Crypto and trust failures inside the parser all collapse to
/// [`Error::EnvkeyInvalid`] before they become externally visible; the
/// fine-grained cause is logged, never returned.
#[derive(Error, Debug)]
pub enum Error {
    /// Malformed credential, auth rejection from the server, or failed
    /// decryption/verification. Terminal for the call.
    #[error("ENVKEY invalid")]
    EnvkeyInvalid,

    /// No ENVKEY was supplied to the loader.
    #[error("missing ENVKEY")]
    EnvkeyMissing,

    /// The server or socket endpoint rejected the connection for rate
    /// limiting (HTTP 429 / close code 4002).
    #[error("request limit exceeded")]
    Throttled,

    /// HTTP 426: the organization requires a newer client.
    #[error("organization requires a newer version of envkey-source client")]
    UpgradeRequired,

    /// Network-level failure after all endpoints and retries, including the
    /// cache fallback when one was attempted.
    #[error("could not load from server: {0}")]
    Network(String),

    /// No cached blob was available for offline fallback.
    #[error("cache read error: {0}")]
    CacheMiss(String),

    /// File I/O failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization/deserialization failure.
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

impl From<reqwest::Error> for Error {
    fn from(e: reqwest::Error) -> Self {
        Error::Network(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_envkey_invalid_message() {
        assert_eq!(Error::EnvkeyInvalid.to_string(), "ENVKEY invalid");
    }

    #[test]
    fn test_throttled_message() {
        assert_eq!(Error::Throttled.to_string(), "request limit exceeded");
    }

    #[test]
    fn test_network_wraps_detail() {
        let err = Error::Network("connection refused".into());
        assert!(err.to_string().contains("could not load from server"));
        assert!(err.to_string().contains("connection refused"));
    }

    #[test]
    fn test_from_serde_json() {
        let json_err = serde_json::from_str::<u32>("{").unwrap_err();
        let err: Error = json_err.into();
        assert!(matches!(err, Error::Serialization(_)));
    }

    #[test]
    fn test_error_is_send_sync() {
        fn assert_send<T: Send>() {}
        fn assert_sync<T: Sync>() {}

        assert_send::<Error>();
        assert_sync::<Error>();
    }
}
