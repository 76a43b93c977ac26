use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("etcd error: {0}")]
    Etcd(#[from] etcd_client::Error),

    #[error("HTTP client error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Connection error: {0}")]
    Connection(String),

    #[error("{operation} timed out after {timeout:?}")]
    Timeout {
        operation: &'static str,
        timeout: Duration,
    },

    #[error("Lease {0} expired or not found")]
    LeaseExpired(i64),
}

/// Failure of a single outbound liveness call.
///
/// These never affect membership; they are reported to the caller and metrics.
#[derive(Error, Debug)]
pub enum PingError {
    #[error("request to {address} timed out")]
    Timeout { address: String },

    #[error("request to {address} failed: {source}")]
    Transport {
        address: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("unexpected status code {status} from {address}")]
    Status { address: String, status: u16 },
}

impl PingError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }
}
