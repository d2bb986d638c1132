//! Per-key single-flight guard.
//!
//! Concurrent requests for the same cold key await one shared computation
//! instead of each compiling the same source. The pending map is keyed
//! exactly like the module cache.

use std::future::Future;
use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::sync::OnceCell;
use tracing::trace;

use crate::{Payload, Result};

type Flight = Arc<OnceCell<Result<Payload>>>;

/// Map of in-flight computations.
#[derive(Debug, Default)]
pub struct SingleFlight {
    pending: DashMap<String, Flight>,
}

impl SingleFlight {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `compute` for `key`, or join the computation already running
    /// for it. Every caller receives the same result, errors included.
    ///
    /// The flight is forgotten once it settles, so a failure is never
    /// replayed to later requests. If the leading caller is dropped before
    /// it finishes, a waiting caller runs its own `compute` instead.
    pub async fn run<F, Fut>(&self, key: &str, compute: F) -> Result<Payload>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Payload>>,
    {
        let (flight, leader) = match self.pending.entry(key.to_string()) {
            Entry::Occupied(entry) => (Arc::clone(entry.get()), false),
            Entry::Vacant(entry) => {
                let flight: Flight = Arc::new(OnceCell::new());
                entry.insert(Arc::clone(&flight));
                (flight, true)
            }
        };

        if !leader {
            trace!(key, "joined in-flight computation");
        }

        let landing = Landing {
            pending: &self.pending,
            key,
            flight,
            leader,
        };
        landing.flight.get_or_init(compute).await.clone()
    }

    /// Number of computations currently in flight.
    pub fn in_flight(&self) -> usize {
        self.pending.len()
    }
}

/// Removes the flight from the pending map when its caller is done.
struct Landing<'a> {
    pending: &'a DashMap<String, Flight>,
    key: &'a str,
    flight: Flight,
    leader: bool,
}

impl Drop for Landing<'_> {
    fn drop(&mut self) {
        if self.leader || self.flight.initialized() {
            self.pending
                .remove_if(self.key, |_, flight| Arc::ptr_eq(flight, &self.flight));
        }
    }
}
