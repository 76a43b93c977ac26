//! etcd-backed service discovery with client-side load balancing.
//!
//! This crate provides:
//! - Lease-bound backend registration with periodic renewal
//! - A client-local membership table kept current from the etcd change stream
//! - Uniform random backend selection
//! - The `GET /ping` liveness endpoint backends serve
//!
//! # Example
//!
//! ```rust,ignore
//! use ping_discovery::{
//!     store::EtcdStore, BackendRegistrar, DiscoveryClient, RegistrarConfig, StoreConfig,
//!     SyncConfig,
//! };
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let store = Arc::new(EtcdStore::connect(&StoreConfig::new(vec![
//!         "http://localhost:2379".into(),
//!     ])).await?);
//!
//!     // Backend side: register and keep the lease alive
//!     let registrar = BackendRegistrar::start(
//!         store.clone(),
//!         &RegistrarConfig::new("pingservice", "http://10.0.0.5:8200"),
//!     )
//!     .await?;
//!
//!     // Client side: follow membership and pick a backend per request
//!     let client = DiscoveryClient::start(store, &SyncConfig::new("pingservice")).await?;
//!     if let Some(backend) = client.pick() {
//!         backend.ping().await?;
//!     }
//!
//!     // Revoke the lease so clients drop this backend immediately
//!     registrar.shutdown(Duration::from_secs(5)).await?;
//!     Ok(())
//! }
//! ```
//!
//! # Failure Detection
//!
//! - **Graceful shutdown**: the lease is revoked, clients see the DELETE at once
//! - **Crash/kill -9**: renewals stop and the key expires within the lease TTL
//!
//! Between a crash and the lease expiring, clients may still pick the dead
//! backend and see request failures.

mod backend;
mod client;
mod config;
mod error;
pub mod liveness;
mod membership;
pub mod metrics;
mod record;
mod registrar;
mod selector;
pub mod store;
mod synchronizer;

pub use backend::{http_client, BackendHandle};
pub use client::DiscoveryClient;
pub use config::{
    RegistrarConfig, StoreConfig, SyncConfig, DEFAULT_DIAL_TIMEOUT, DEFAULT_KEY_PREFIX,
    DEFAULT_LEASE_TTL, DEFAULT_PING_TIMEOUT, DEFAULT_RENEW_INTERVAL, DEFAULT_STORE_REQUEST_TIMEOUT,
};
pub use error::{Error, PingError};
pub use membership::{MembershipEvent, MembershipTable};
pub use record::{BackendRecord, KeyLayout};
pub use registrar::{BackendRegistrar, Lease};
pub use selector::BackendSelector;
pub use synchronizer::{MembershipSynchronizer, Snapshot, SyncExit};
