use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use super::{CoordinationStore, EventStream, LeaseId, MemoryStore, RangeSnapshot};
use crate::Error;

/// [`MemoryStore`] wrapper that injects failures on demand and counts range
/// reads.
#[derive(Default)]
pub struct FaultyStore {
    pub inner: MemoryStore,
    range_reads: AtomicUsize,
    fail_watch: AtomicBool,
    fail_put: AtomicBool,
    hang_revoke: AtomicBool,
    keep_alive_failures: AtomicUsize,
}

impl FaultyStore {
    pub fn new(inner: MemoryStore) -> Self {
        Self {
            inner,
            ..Self::default()
        }
    }

    pub fn range_reads(&self) -> usize {
        self.range_reads.load(Ordering::SeqCst)
    }

    pub fn fail_watch(&self, fail: bool) {
        self.fail_watch.store(fail, Ordering::SeqCst);
    }

    pub fn fail_put(&self, fail: bool) {
        self.fail_put.store(fail, Ordering::SeqCst);
    }

    pub fn hang_revoke(&self, hang: bool) {
        self.hang_revoke.store(hang, Ordering::SeqCst);
    }

    /// Fail the next `n` keep-alive calls.
    pub fn fail_keep_alives(&self, n: usize) {
        self.keep_alive_failures.store(n, Ordering::SeqCst);
    }
}

#[async_trait]
impl CoordinationStore for FaultyStore {
    async fn get_prefix(&self, prefix: &str) -> Result<RangeSnapshot, Error> {
        self.range_reads.fetch_add(1, Ordering::SeqCst);
        self.inner.get_prefix(prefix).await
    }

    async fn watch_prefix(&self, prefix: &str, from_revision: i64) -> Result<EventStream, Error> {
        if self.fail_watch.load(Ordering::SeqCst) {
            return Err(Error::Connection("watch refused".into()));
        }
        self.inner.watch_prefix(prefix, from_revision).await
    }

    async fn grant_lease(&self, ttl: Duration) -> Result<LeaseId, Error> {
        self.inner.grant_lease(ttl).await
    }

    async fn put(&self, key: &str, value: &str, lease: Option<LeaseId>) -> Result<(), Error> {
        if self.fail_put.load(Ordering::SeqCst) {
            return Err(Error::Connection("put refused".into()));
        }
        self.inner.put(key, value, lease).await
    }

    async fn keep_alive_once(&self, lease: LeaseId) -> Result<(), Error> {
        let failed = self
            .keep_alive_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failed {
            return Err(Error::Connection("keep-alive refused".into()));
        }
        self.inner.keep_alive_once(lease).await
    }

    async fn revoke(&self, lease: LeaseId) -> Result<(), Error> {
        if self.hang_revoke.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        self.inner.revoke(lease).await
    }
}
