use rand::Rng;
use std::sync::Arc;

use crate::{BackendHandle, MembershipTable};

/// Uniform random choice over the current membership.
///
/// Every listed backend is treated as equally live: TTL expiry is what
/// removes dead ones, so there is no weighting or health tracking here.
#[derive(Debug, Clone)]
pub struct BackendSelector {
    table: Arc<MembershipTable>,
}

impl BackendSelector {
    pub fn new(table: Arc<MembershipTable>) -> Self {
        Self { table }
    }

    /// Pick one backend, or `None` when the table is empty.
    pub fn pick(&self) -> Option<Arc<BackendHandle>> {
        self.pick_with(&mut rand::thread_rng())
    }

    pub fn pick_with<R: Rng + ?Sized>(&self, rng: &mut R) -> Option<Arc<BackendHandle>> {
        // Size, draw and lookup all happen under one read guard.
        let backends = self.table.read();
        let count = backends.len();
        if count == 0 {
            return None;
        }
        let index = rng.gen_range(0..count);
        backends.values().nth(index).cloned()
    }
}
