//! Pull service seam
//!
//! Pulled atoms (gauges sampled at alarm ticks) come from host-registered
//! pullers. Pull results are cached briefly so several producers sampling
//! the same atom in one tick share a pull; the cache clears as event time
//! advances.

use std::collections::HashMap;

use tally_event::Event;

use crate::limits::{NS_PER_SEC, PULLER_CACHE_CLEAR_INTERVAL_SEC};

/// A host-registered producer of pulled atoms
pub trait AtomPuller: Send {
    /// Pull the current values of `atom_id`; `None` on failure
    fn pull(&self, atom_id: i32) -> Option<Vec<Event>>;
}

struct CachedPull {
    pulled_at_ns: i64,
    events: Vec<Event>,
}

/// Registry and cache over the host's pullers
#[derive(Default)]
pub struct PullerManager {
    pullers: HashMap<i32, Box<dyn AtomPuller>>,
    cache: HashMap<i32, CachedPull>,
}

impl std::fmt::Debug for PullerManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PullerManager")
            .field("pullers", &self.pullers.len())
            .field("cached", &self.cache.len())
            .finish()
    }
}

impl PullerManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_puller(&mut self, atom_id: i32, puller: Box<dyn AtomPuller>) {
        self.pullers.insert(atom_id, puller);
    }

    /// Pull `atom_id`, serving from cache when fresh
    pub fn pull(&mut self, atom_id: i32, now_ns: i64) -> Option<Vec<Event>> {
        let ttl_ns = PULLER_CACHE_CLEAR_INTERVAL_SEC * NS_PER_SEC;
        if let Some(cached) = self.cache.get(&atom_id)
            && now_ns - cached.pulled_at_ns < ttl_ns
        {
            return Some(cached.events.clone());
        }
        let puller = self.pullers.get(&atom_id)?;
        match puller.pull(atom_id) {
            Some(events) => {
                self.cache.insert(
                    atom_id,
                    CachedPull {
                        pulled_at_ns: now_ns,
                        events: events.clone(),
                    },
                );
                Some(events)
            }
            None => {
                tracing::warn!(atom_id, "pull failed");
                None
            }
        }
    }

    /// Drop cache entries older than the clear interval
    pub fn clear_cache_if_expired(&mut self, now_ns: i64) {
        let ttl_ns = PULLER_CACHE_CLEAR_INTERVAL_SEC * NS_PER_SEC;
        self.cache.retain(|_, cached| now_ns - cached.pulled_at_ns < ttl_ns);
    }

    pub fn force_clear_cache(&mut self) {
        self.cache.clear();
    }
}
