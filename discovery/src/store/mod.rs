//! Adapter over the coordination store.
//!
//! Everything the registrar and synchronizer need from etcd goes through
//! [`CoordinationStore`], so the protocol can run against a live cluster
//! ([`EtcdStore`]) or fully in-process ([`MemoryStore`]).

mod etcd;
#[cfg(test)]
pub(crate) mod faulty;
mod memory;

pub use etcd::EtcdStore;
pub use memory::MemoryStore;

use async_trait::async_trait;
use futures_util::stream::BoxStream;
use std::fmt;
use std::time::Duration;

use crate::Error;

/// Opaque lease identifier issued by the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LeaseId(pub i64);

impl fmt::Display for LeaseId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:x}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyValue {
    pub key: String,
    pub value: String,
}

/// Result of a strongly-consistent range read.
#[derive(Debug, Clone)]
pub struct RangeSnapshot {
    pub entries: Vec<KeyValue>,
    /// Store revision the read was served at.
    pub revision: i64,
}

/// A single change observed on a watched prefix.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatchEvent {
    Put {
        key: String,
        value: String,
        revision: i64,
    },
    Delete {
        key: String,
        revision: i64,
    },
}

impl WatchEvent {
    pub fn key(&self) -> &str {
        match self {
            Self::Put { key, .. } | Self::Delete { key, .. } => key,
        }
    }

    pub fn revision(&self) -> i64 {
        match self {
            Self::Put { revision, .. } | Self::Delete { revision, .. } => *revision,
        }
    }
}

/// Change stream. Ends (`None`) when the underlying watch is closed; an `Err`
/// item is always the last one.
pub type EventStream = BoxStream<'static, Result<WatchEvent, Error>>;

#[async_trait]
pub trait CoordinationStore: Send + Sync {
    /// Linearizable read of every key under `prefix`.
    async fn get_prefix(&self, prefix: &str) -> Result<RangeSnapshot, Error>;

    /// Watch every key under `prefix`, starting at `from_revision` inclusive.
    async fn watch_prefix(&self, prefix: &str, from_revision: i64) -> Result<EventStream, Error>;

    async fn grant_lease(&self, ttl: Duration) -> Result<LeaseId, Error>;

    async fn put(&self, key: &str, value: &str, lease: Option<LeaseId>) -> Result<(), Error>;

    /// Renew `lease` once, resetting it to its full TTL.
    ///
    /// Fails with [`Error::LeaseExpired`] when the store no longer knows the
    /// lease.
    async fn keep_alive_once(&self, lease: LeaseId) -> Result<(), Error>;

    /// Revoke `lease`, deleting every key attached to it.
    ///
    /// Revoking a lease that already expired is not an error.
    async fn revoke(&self, lease: LeaseId) -> Result<(), Error>;
}
